//! Postgres store backend.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{Store, transient_outcome};
use crate::types::{
    AccountId, AttemptId, AttemptSeed, AttemptState, CancelOutcome, Credentials, LeaseToken,
    MediaRef, OwnerId, Platform, PlatformAttempt, PostId, PostState, REASON_CANCELLED,
    REASON_LEASE_EXPIRED, RetryOutcome, ScheduledPost, SocialAccount, to_chrono,
};

const POST_COLUMNS: &str = "id, owner_id, title, base_content, media_refs, platforms, variants, \
     scheduled_at, timezone, state, created_at, updated_at";

const ATTEMPT_COLUMNS: &str = "id, post_id, platform, account_id, content, media_refs, state, \
     attempts_used, max_attempts, next_eligible_at, platform_post_id, platform_url, last_error, \
     lease_token, created_at, updated_at";

const ACCOUNT_COLUMNS: &str =
    "id, owner_id, platform, handle, access_token, refresh_token, token_expires_at, active";

/// Predicate selecting attempts a worker may claim at `$now`.
const CLAIMABLE: &str = "(state = 'pending' \
     OR (state = 'failed_retryable' AND attempts_used < max_attempts \
         AND (next_eligible_at IS NULL OR next_eligible_at <= $1)))";

#[derive(Debug, sqlx::FromRow)]
struct PostRow {
    id: Uuid,
    owner_id: Uuid,
    title: String,
    base_content: String,
    media_refs: Json<Vec<String>>,
    platforms: Json<Vec<String>>,
    variants: Json<BTreeMap<String, String>>,
    scheduled_at: DateTime<Utc>,
    timezone: String,
    state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PostRow> for ScheduledPost {
    type Error = StoreError;

    fn try_from(row: PostRow) -> Result<Self, Self::Error> {
        let platforms = row
            .platforms
            .0
            .iter()
            .map(|p| parse_platform(p))
            .collect::<Result<BTreeSet<_>, _>>()?;
        let variants = row
            .variants
            .0
            .into_iter()
            .map(|(p, content)| Ok((parse_platform(&p)?, content)))
            .collect::<Result<BTreeMap<_, _>, StoreError>>()?;

        Ok(ScheduledPost {
            id: PostId(row.id),
            owner_id: OwnerId(row.owner_id),
            title: row.title,
            base_content: row.base_content,
            media_refs: row.media_refs.0.into_iter().map(MediaRef).collect(),
            platforms,
            variants,
            scheduled_at: row.scheduled_at,
            timezone: row.timezone,
            state: row.state.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AttemptRow {
    id: Uuid,
    post_id: Uuid,
    platform: String,
    account_id: Option<Uuid>,
    content: String,
    media_refs: Json<Vec<String>>,
    state: String,
    attempts_used: i32,
    max_attempts: i32,
    next_eligible_at: Option<DateTime<Utc>>,
    platform_post_id: Option<String>,
    platform_url: Option<String>,
    last_error: Option<String>,
    lease_token: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AttemptRow> for PlatformAttempt {
    type Error = StoreError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        Ok(PlatformAttempt {
            id: AttemptId(row.id),
            post_id: PostId(row.post_id),
            platform: parse_platform(&row.platform)?,
            account_id: row.account_id.map(AccountId),
            content: row.content,
            media_refs: row.media_refs.0.into_iter().map(MediaRef).collect(),
            state: row.state.parse()?,
            attempts_used: counter(row.attempts_used)?,
            max_attempts: counter(row.max_attempts)?,
            next_eligible_at: row.next_eligible_at,
            platform_post_id: row.platform_post_id,
            platform_url: row.platform_url,
            last_error: row.last_error,
            lease_token: row.lease_token.map(LeaseToken),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    owner_id: Uuid,
    platform: String,
    handle: String,
    access_token: String,
    refresh_token: Option<String>,
    token_expires_at: DateTime<Utc>,
    active: bool,
}

impl TryFrom<AccountRow> for SocialAccount {
    type Error = StoreError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(SocialAccount {
            id: AccountId(row.id),
            owner_id: OwnerId(row.owner_id),
            platform: parse_platform(&row.platform)?,
            handle: row.handle,
            access_token: row.access_token,
            refresh_token: row.refresh_token,
            token_expires_at: row.token_expires_at,
            active: row.active,
        })
    }
}

fn parse_platform(tag: &str) -> Result<Platform, StoreError> {
    tag.parse()
        .map_err(|e| StoreError::Corrupt(format!("{}", e)))
}

fn counter(value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative counter: {}", value)))
}

fn attempts_from(rows: Vec<AttemptRow>) -> Result<Vec<PlatformAttempt>, StoreError> {
    rows.into_iter().map(PlatformAttempt::try_from).collect()
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Store backend over a Postgres pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!(max_connections, "connected to postgres");
        Ok(Self { pool })
    }

    /// Apply the embedded migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_attempt(
        tx: &mut Transaction<'_, Postgres>,
        id: AttemptId,
    ) -> Result<PlatformAttempt, StoreError> {
        let row: Option<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {} FROM platform_attempts WHERE id = $1 FOR UPDATE",
            ATTEMPT_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&mut **tx)
        .await?;
        row.ok_or(StoreError::AttemptNotFound(id))?.try_into()
    }

    /// Lock an attempt the caller must own and check the move to `next`.
    async fn lock_leased(
        tx: &mut Transaction<'_, Postgres>,
        id: AttemptId,
        lease: LeaseToken,
        next: AttemptState,
    ) -> Result<PlatformAttempt, StoreError> {
        let attempt = Self::lock_attempt(tx, id).await?;
        attempt.state.check_transition(next)?;
        if attempt.state != AttemptState::InFlight {
            return Err(StoreError::IllegalTransition {
                entity: "attempt",
                from: attempt.state.as_str(),
                to: next.as_str(),
            });
        }
        if attempt.lease_token != Some(lease) {
            return Err(StoreError::LeaseMismatch(id));
        }
        Ok(attempt)
    }

    async fn abandon_waiting(
        tx: &mut Transaction<'_, Postgres>,
        post_id: PostId,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE platform_attempts
            SET state = 'abandoned',
                next_eligible_at = NULL,
                last_error = $3,
                updated_at = $2
            WHERE post_id = $1
              AND state IN ('pending', 'failed_retryable')
            "#,
        )
        .bind(post_id.0)
        .bind(now)
        .bind(REASON_CANCELLED)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_post(&self, post: &ScheduledPost) -> Result<(), StoreError> {
        let platforms: Vec<&str> = post.platforms.iter().map(|p| p.as_str()).collect();
        let variants: BTreeMap<&str, &str> = post
            .variants
            .iter()
            .map(|(p, content)| (p.as_str(), content.as_str()))
            .collect();
        let media: Vec<&str> = post.media_refs.iter().map(MediaRef::as_str).collect();

        sqlx::query(
            r#"
            INSERT INTO scheduled_posts
                (id, owner_id, title, base_content, media_refs, platforms, variants,
                 scheduled_at, timezone, state, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(post.id.0)
        .bind(post.owner_id.0)
        .bind(&post.title)
        .bind(&post.base_content)
        .bind(Json(media))
        .bind(Json(platforms))
        .bind(Json(variants))
        .bind(post.scheduled_at)
        .bind(&post.timezone)
        .bind(post.state.as_str())
        .bind(post.created_at)
        .bind(post.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_post(&self, id: PostId) -> Result<ScheduledPost, StoreError> {
        let row: Option<PostRow> = sqlx::query_as(&format!(
            "SELECT {} FROM scheduled_posts WHERE id = $1",
            POST_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(StoreError::PostNotFound(id))?.try_into()
    }

    async fn due_posts(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
        max: usize,
    ) -> Result<Vec<ScheduledPost>, StoreError> {
        let rows: Vec<PostRow> = sqlx::query_as(&format!(
            "SELECT {} FROM scheduled_posts \
             WHERE state = 'scheduled' AND scheduled_at <= $1 AND scheduled_at >= $2 \
             ORDER BY scheduled_at ASC, created_at ASC \
             LIMIT $3",
            POST_COLUMNS
        ))
        .bind(now)
        .bind(now - to_chrono(grace))
        .bind(limit(max))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ScheduledPost::try_from).collect()
    }

    async fn overdue_posts(
        &self,
        cutoff: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<ScheduledPost>, StoreError> {
        let rows: Vec<PostRow> = sqlx::query_as(&format!(
            "SELECT {} FROM scheduled_posts \
             WHERE state = 'scheduled' AND scheduled_at < $1 \
             ORDER BY scheduled_at ASC \
             LIMIT $2",
            POST_COLUMNS
        ))
        .bind(cutoff)
        .bind(limit(max))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ScheduledPost::try_from).collect()
    }

    async fn transition_post(
        &self,
        id: PostId,
        from: PostState,
        to: PostState,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        from.check_transition(to)?;
        let result = sqlx::query(
            "UPDATE scheduled_posts SET state = $3, updated_at = $4 WHERE id = $1 AND state = $2",
        )
        .bind(id.0)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a lost race from a missing post.
            self.get_post(id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn cancel_post(
        &self,
        id: PostId,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let state: Option<String> =
            sqlx::query_scalar("SELECT state FROM scheduled_posts WHERE id = $1 FOR UPDATE")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await?;
        let previous: PostState = state.ok_or(StoreError::PostNotFound(id))?.parse()?;

        match previous {
            PostState::Cancelled => return Ok(CancelOutcome::AlreadyCancelled),
            state if state.is_terminal() => return Ok(CancelOutcome::NotCancellable(state)),
            _ => {}
        }

        sqlx::query("UPDATE scheduled_posts SET state = 'cancelled', updated_at = $2 WHERE id = $1")
            .bind(id.0)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        let abandoned = Self::abandon_waiting(&mut tx, id, now).await?;
        tx.commit().await?;

        Ok(CancelOutcome::Cancelled {
            previous,
            abandoned,
        })
    }

    async fn purge_post(&self, id: PostId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM scheduled_posts WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::PostNotFound(id));
        }
        Ok(())
    }

    async fn materialize(
        &self,
        post_id: PostId,
        seeds: &[AttemptSeed],
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<PlatformAttempt>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row: Option<PostRow> = sqlx::query_as(&format!(
            "SELECT {} FROM scheduled_posts WHERE id = $1 FOR UPDATE",
            POST_COLUMNS
        ))
        .bind(post_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let post: ScheduledPost = row.ok_or(StoreError::PostNotFound(post_id))?.try_into()?;
        if post.state != PostState::Scheduled {
            return Err(StoreError::AlreadyDispatched(post_id));
        }

        let budget = i32::try_from(max_attempts)
            .map_err(|_| StoreError::Corrupt(format!("max_attempts too large: {}", max_attempts)))?;
        for seed in seeds {
            let attempt = PlatformAttempt::from_seed(&post, seed, max_attempts, now);
            let media: Vec<&str> = attempt.media_refs.iter().map(MediaRef::as_str).collect();
            let inserted = sqlx::query(
                r#"
                INSERT INTO platform_attempts
                    (id, post_id, platform, account_id, content, media_refs, state,
                     attempts_used, max_attempts, last_error, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, $9, $10, $10)
                ON CONFLICT (post_id, platform) DO NOTHING
                "#,
            )
            .bind(attempt.id.0)
            .bind(post_id.0)
            .bind(attempt.platform.as_str())
            .bind(attempt.account_id.map(|a| a.0))
            .bind(&attempt.content)
            .bind(Json(media))
            .bind(attempt.state.as_str())
            .bind(budget)
            .bind(&attempt.last_error)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            if inserted.rows_affected() == 0 {
                debug!(post_id = %post_id, platform = %seed.platform, "attempt already exists");
            }
        }

        sqlx::query(
            "UPDATE scheduled_posts SET state = 'dispatching', updated_at = $2 WHERE id = $1",
        )
        .bind(post_id.0)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let rows: Vec<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {} FROM platform_attempts WHERE post_id = $1 ORDER BY created_at, platform",
            ATTEMPT_COLUMNS
        ))
        .bind(post_id.0)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        attempts_from(rows)
    }

    async fn get_attempt(&self, id: AttemptId) -> Result<PlatformAttempt, StoreError> {
        let row: Option<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {} FROM platform_attempts WHERE id = $1",
            ATTEMPT_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(StoreError::AttemptNotFound(id))?.try_into()
    }

    async fn claim(
        &self,
        id: AttemptId,
        lease: LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<Option<PlatformAttempt>, StoreError> {
        let row: Option<AttemptRow> = sqlx::query_as(&format!(
            "UPDATE platform_attempts \
             SET state = 'in_flight', lease_token = $3, next_eligible_at = NULL, updated_at = $1 \
             WHERE id = $2 AND {} \
             RETURNING {}",
            CLAIMABLE, ATTEMPT_COLUMNS
        ))
        .bind(now)
        .bind(id.0)
        .bind(lease.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row.try_into()?)),
            None => {
                self.get_attempt(id).await?;
                Ok(None)
            }
        }
    }

    async fn claim_ready(
        &self,
        max: usize,
        lease: LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<Vec<AttemptId>, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(&format!(
            r#"
            WITH claimed AS (
                SELECT id
                FROM platform_attempts
                WHERE {}
                ORDER BY COALESCE(next_eligible_at, created_at) ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE platform_attempts a
            SET state = 'in_flight',
                lease_token = $3,
                next_eligible_at = NULL,
                updated_at = $1
            FROM claimed
            WHERE a.id = claimed.id
            RETURNING a.id
            "#,
            CLAIMABLE
        ))
        .bind(now)
        .bind(limit(max))
        .bind(lease.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(AttemptId).collect())
    }

    async fn waiting_attempts(
        &self,
        after: Option<AttemptId>,
        max: usize,
    ) -> Result<Vec<PlatformAttempt>, StoreError> {
        let rows: Vec<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {} FROM platform_attempts \
             WHERE (state = 'pending' \
                    OR (state = 'failed_retryable' AND attempts_used < max_attempts)) \
               AND ($1::uuid IS NULL OR id > $1) \
             ORDER BY id ASC \
             LIMIT $2",
            ATTEMPT_COLUMNS
        ))
        .bind(after.map(|a| a.0))
        .bind(limit(max))
        .fetch_all(&self.pool)
        .await?;
        attempts_from(rows)
    }

    async fn record_success(
        &self,
        id: AttemptId,
        lease: LeaseToken,
        platform_post_id: &str,
        url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<PlatformAttempt, StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::lock_leased(&mut tx, id, lease, AttemptState::Succeeded).await?;
        let row: AttemptRow = sqlx::query_as(&format!(
            "UPDATE platform_attempts \
             SET state = 'succeeded', attempts_used = LEAST(attempts_used + 1, max_attempts), \
                 platform_post_id = $2, platform_url = $3, last_error = NULL, \
                 lease_token = NULL, updated_at = $4 \
             WHERE id = $1 \
             RETURNING {}",
            ATTEMPT_COLUMNS
        ))
        .bind(id.0)
        .bind(platform_post_id)
        .bind(url)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        row.try_into()
    }

    async fn record_transient_failure(
        &self,
        id: AttemptId,
        lease: LeaseToken,
        reason: &str,
        backoff: Duration,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let attempt = Self::lock_leased(&mut tx, id, lease, AttemptState::FailedRetryable).await?;
        let outcome = transient_outcome(&attempt, backoff, now);
        sqlx::query(
            r#"
            UPDATE platform_attempts
            SET state = $2,
                attempts_used = $3,
                next_eligible_at = $4,
                last_error = $5,
                lease_token = NULL,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(outcome.state.as_str())
        .bind(outcome.attempts_used as i32)
        .bind(outcome.next_eligible_at)
        .bind(reason)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn record_permanent_failure(
        &self,
        id: AttemptId,
        lease: LeaseToken,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<PlatformAttempt, StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::lock_leased(&mut tx, id, lease, AttemptState::FailedPermanent).await?;
        let row: AttemptRow = sqlx::query_as(&format!(
            "UPDATE platform_attempts \
             SET state = 'failed_permanent', attempts_used = LEAST(attempts_used + 1, max_attempts), \
                 last_error = $2, lease_token = NULL, updated_at = $3 \
             WHERE id = $1 \
             RETURNING {}",
            ATTEMPT_COLUMNS
        ))
        .bind(id.0)
        .bind(reason)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        row.try_into()
    }

    async fn attempts_for(&self, post_id: PostId) -> Result<Vec<PlatformAttempt>, StoreError> {
        let rows: Vec<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {} FROM platform_attempts WHERE post_id = $1 ORDER BY created_at, platform",
            ATTEMPT_COLUMNS
        ))
        .bind(post_id.0)
        .fetch_all(&self.pool)
        .await?;
        attempts_from(rows)
    }

    async fn cancel_pending_for(
        &self,
        post_id: PostId,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let abandoned = Self::abandon_waiting(&mut tx, post_id, now).await?;
        tx.commit().await?;
        Ok(abandoned)
    }

    async fn reap_expired(
        &self,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<PlatformAttempt>, StoreError> {
        let rows: Vec<AttemptRow> = sqlx::query_as(&format!(
            r#"
            WITH stale AS (
                SELECT id AS stale_id
                FROM platform_attempts
                WHERE state = 'in_flight' AND updated_at < $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE platform_attempts a
            SET attempts_used = LEAST(a.attempts_used + 1, a.max_attempts),
                state = CASE WHEN a.attempts_used + 1 < a.max_attempts
                             THEN 'failed_retryable' ELSE 'abandoned' END,
                next_eligible_at = CASE WHEN a.attempts_used + 1 < a.max_attempts
                                        THEN $2::timestamptz ELSE NULL END,
                last_error = $3,
                lease_token = NULL,
                updated_at = $2
            FROM stale
            WHERE a.id = stale.stale_id
            RETURNING {}
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(now - to_chrono(lease_timeout))
        .bind(now)
        .bind(REASON_LEASE_EXPIRED)
        .fetch_all(&self.pool)
        .await?;
        attempts_from(rows)
    }

    async fn get_account(&self, id: AccountId) -> Result<SocialAccount, StoreError> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM social_accounts WHERE id = $1 AND active",
            ACCOUNT_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| StoreError::AccountNotFound(id.to_string()))?
            .try_into()
    }

    async fn active_account(
        &self,
        owner_id: OwnerId,
        platform: Platform,
    ) -> Result<Option<SocialAccount>, StoreError> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM social_accounts WHERE owner_id = $1 AND platform = $2 AND active",
            ACCOUNT_COLUMNS
        ))
        .bind(owner_id.0)
        .bind(platform.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(SocialAccount::try_from).transpose()
    }

    async fn update_credentials(
        &self,
        id: AccountId,
        credentials: &Credentials,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE social_accounts
            SET access_token = $2, refresh_token = $3, token_expires_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(&credentials.access_token)
        .bind(&credentials.refresh_token)
        .bind(credentials.expires_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AccountNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn upsert_account(&self, account: &SocialAccount) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO social_accounts
                (id, owner_id, platform, handle, access_token, refresh_token, token_expires_at, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                owner_id = EXCLUDED.owner_id,
                platform = EXCLUDED.platform,
                handle = EXCLUDED.handle,
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                token_expires_at = EXCLUDED.token_expires_at,
                active = EXCLUDED.active
            "#,
        )
        .bind(account.id.0)
        .bind(account.owner_id.0)
        .bind(account.platform.as_str())
        .bind(&account.handle)
        .bind(&account.access_token)
        .bind(&account.refresh_token)
        .bind(account.token_expires_at)
        .bind(account.active)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::DuplicateActiveAccount {
                    owner_id: account.owner_id,
                    platform: account.platform,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}
