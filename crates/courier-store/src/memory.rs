//! In-memory store backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::{Store, transient_outcome};
use crate::types::{
    AccountId, AttemptId, AttemptSeed, AttemptState, CancelOutcome, Credentials, LeaseToken,
    OwnerId, Platform, PlatformAttempt, PostId, PostState, REASON_CANCELLED,
    REASON_LEASE_EXPIRED, RetryOutcome, ScheduledPost, SocialAccount, to_chrono,
};

#[derive(Default)]
struct Tables {
    posts: HashMap<PostId, ScheduledPost>,
    attempts: HashMap<AttemptId, PlatformAttempt>,
    /// Attempt ids per post, in materialization order.
    by_post: HashMap<PostId, Vec<AttemptId>>,
    accounts: HashMap<AccountId, SocialAccount>,
}

impl Tables {
    fn attempt_mut(&mut self, id: AttemptId) -> Result<&mut PlatformAttempt, StoreError> {
        self.attempts
            .get_mut(&id)
            .ok_or(StoreError::AttemptNotFound(id))
    }

    /// Fetch an attempt the caller must currently own.
    fn leased_mut(
        &mut self,
        id: AttemptId,
        lease: LeaseToken,
        next: AttemptState,
    ) -> Result<&mut PlatformAttempt, StoreError> {
        let attempt = self.attempt_mut(id)?;
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

    fn abandon_waiting(&mut self, post_id: PostId, now: DateTime<Utc>) -> usize {
        let ids = self.by_post.get(&post_id).cloned().unwrap_or_default();
        let mut abandoned = 0;
        for id in ids {
            let Some(attempt) = self.attempts.get_mut(&id) else {
                continue;
            };
            if matches!(
                attempt.state,
                AttemptState::Pending | AttemptState::FailedRetryable
            ) {
                attempt.state = AttemptState::Abandoned;
                attempt.next_eligible_at = None;
                attempt.last_error = Some(REASON_CANCELLED.to_string());
                attempt.updated_at = now;
                abandoned += 1;
            }
        }
        abandoned
    }

    fn try_claim(
        &mut self,
        id: AttemptId,
        lease: LeaseToken,
        now: DateTime<Utc>,
    ) -> Option<PlatformAttempt> {
        let attempt = self.attempts.get_mut(&id)?;
        if !attempt.is_claimable(now) {
            return None;
        }
        attempt.state = AttemptState::InFlight;
        attempt.lease_token = Some(lease);
        attempt.next_eligible_at = None;
        attempt.updated_at = now;
        Some(attempt.clone())
    }
}

/// Store backend holding everything in process memory.
///
/// A single `RwLock` over all tables makes every operation atomic, which is
/// what the Postgres backend achieves with transactions and row locks.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_post(&self, post: &ScheduledPost) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.posts.insert(post.id, post.clone());
        Ok(())
    }

    async fn get_post(&self, id: PostId) -> Result<ScheduledPost, StoreError> {
        let tables = self.tables.read().await;
        tables
            .posts
            .get(&id)
            .cloned()
            .ok_or(StoreError::PostNotFound(id))
    }

    async fn due_posts(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
        limit: usize,
    ) -> Result<Vec<ScheduledPost>, StoreError> {
        let tables = self.tables.read().await;
        let mut due: Vec<_> = tables
            .posts
            .values()
            .filter(|p| p.is_due(now, grace))
            .cloned()
            .collect();
        due.sort_by_key(|p| (p.scheduled_at, p.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn overdue_posts(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledPost>, StoreError> {
        let tables = self.tables.read().await;
        let mut overdue: Vec<_> = tables
            .posts
            .values()
            .filter(|p| p.state == PostState::Scheduled && p.scheduled_at < cutoff)
            .cloned()
            .collect();
        overdue.sort_by_key(|p| p.scheduled_at);
        overdue.truncate(limit);
        Ok(overdue)
    }

    async fn transition_post(
        &self,
        id: PostId,
        from: PostState,
        to: PostState,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        from.check_transition(to)?;
        let mut tables = self.tables.write().await;
        let post = tables
            .posts
            .get_mut(&id)
            .ok_or(StoreError::PostNotFound(id))?;
        if post.state != from {
            return Ok(false);
        }
        post.state = to;
        post.updated_at = now;
        Ok(true)
    }

    async fn cancel_post(
        &self,
        id: PostId,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, StoreError> {
        let mut tables = self.tables.write().await;
        let post = tables
            .posts
            .get_mut(&id)
            .ok_or(StoreError::PostNotFound(id))?;

        let previous = post.state;
        match previous {
            PostState::Cancelled => return Ok(CancelOutcome::AlreadyCancelled),
            state if state.is_terminal() => return Ok(CancelOutcome::NotCancellable(state)),
            _ => {}
        }
        post.state = PostState::Cancelled;
        post.updated_at = now;

        let abandoned = tables.abandon_waiting(id, now);
        Ok(CancelOutcome::Cancelled {
            previous,
            abandoned,
        })
    }

    async fn purge_post(&self, id: PostId) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables
            .posts
            .remove(&id)
            .ok_or(StoreError::PostNotFound(id))?;
        for attempt_id in tables.by_post.remove(&id).unwrap_or_default() {
            tables.attempts.remove(&attempt_id);
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
        let mut tables = self.tables.write().await;
        let post = tables
            .posts
            .get(&post_id)
            .cloned()
            .ok_or(StoreError::PostNotFound(post_id))?;
        if post.state != PostState::Scheduled {
            return Err(StoreError::AlreadyDispatched(post_id));
        }

        let existing: Vec<Platform> = tables
            .by_post
            .get(&post_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.attempts.get(id).map(|a| a.platform))
            .collect();

        for seed in seeds {
            if existing.contains(&seed.platform) {
                continue;
            }
            let attempt = PlatformAttempt::from_seed(&post, seed, max_attempts, now);
            tables
                .by_post
                .entry(post_id)
                .or_default()
                .push(attempt.id);
            tables.attempts.insert(attempt.id, attempt);
        }

        if let Some(post) = tables.posts.get_mut(&post_id) {
            post.state = PostState::Dispatching;
            post.updated_at = now;
        }

        Ok(tables
            .by_post
            .get(&post_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.attempts.get(id).cloned())
            .collect())
    }

    async fn get_attempt(&self, id: AttemptId) -> Result<PlatformAttempt, StoreError> {
        let tables = self.tables.read().await;
        tables
            .attempts
            .get(&id)
            .cloned()
            .ok_or(StoreError::AttemptNotFound(id))
    }

    async fn claim(
        &self,
        id: AttemptId,
        lease: LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<Option<PlatformAttempt>, StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.attempts.contains_key(&id) {
            return Err(StoreError::AttemptNotFound(id));
        }
        Ok(tables.try_claim(id, lease, now))
    }

    async fn claim_ready(
        &self,
        limit: usize,
        lease: LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<Vec<AttemptId>, StoreError> {
        let mut tables = self.tables.write().await;
        let mut ready: Vec<_> = tables
            .attempts
            .values()
            .filter(|a| a.is_claimable(now))
            .map(|a| (a.next_eligible_at.unwrap_or(a.created_at), a.id))
            .collect();
        ready.sort();
        ready.truncate(limit);

        Ok(ready
            .into_iter()
            .filter_map(|(_, id)| tables.try_claim(id, lease, now).map(|a| a.id))
            .collect())
    }

    async fn waiting_attempts(
        &self,
        after: Option<AttemptId>,
        limit: usize,
    ) -> Result<Vec<PlatformAttempt>, StoreError> {
        let tables = self.tables.read().await;
        let mut waiting: Vec<PlatformAttempt> = tables
            .attempts
            .values()
            .filter(|a| after.is_none_or(|after| a.id > after))
            .filter(|a| match a.state {
                AttemptState::Pending => true,
                AttemptState::FailedRetryable => a.attempts_used < a.max_attempts,
                _ => false,
            })
            .cloned()
            .collect();
        waiting.sort_by_key(|a| a.id);
        waiting.truncate(limit);
        Ok(waiting)
    }

    async fn record_success(
        &self,
        id: AttemptId,
        lease: LeaseToken,
        platform_post_id: &str,
        url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<PlatformAttempt, StoreError> {
        let mut tables = self.tables.write().await;
        let attempt = tables.leased_mut(id, lease, AttemptState::Succeeded)?;
        attempt.state = AttemptState::Succeeded;
        attempt.attempts_used = (attempt.attempts_used + 1).min(attempt.max_attempts);
        attempt.platform_post_id = Some(platform_post_id.to_string());
        attempt.platform_url = url.map(str::to_string);
        attempt.last_error = None;
        attempt.lease_token = None;
        attempt.updated_at = now;
        Ok(attempt.clone())
    }

    async fn record_transient_failure(
        &self,
        id: AttemptId,
        lease: LeaseToken,
        reason: &str,
        backoff: Duration,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome, StoreError> {
        let mut tables = self.tables.write().await;
        let attempt = tables.leased_mut(id, lease, AttemptState::FailedRetryable)?;
        let outcome = transient_outcome(attempt, backoff, now);
        attempt.state = outcome.state;
        attempt.attempts_used = outcome.attempts_used;
        attempt.next_eligible_at = outcome.next_eligible_at;
        attempt.last_error = Some(reason.to_string());
        attempt.lease_token = None;
        attempt.updated_at = now;
        Ok(outcome)
    }

    async fn record_permanent_failure(
        &self,
        id: AttemptId,
        lease: LeaseToken,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<PlatformAttempt, StoreError> {
        let mut tables = self.tables.write().await;
        let attempt = tables.leased_mut(id, lease, AttemptState::FailedPermanent)?;
        attempt.state = AttemptState::FailedPermanent;
        attempt.attempts_used = (attempt.attempts_used + 1).min(attempt.max_attempts);
        attempt.last_error = Some(reason.to_string());
        attempt.lease_token = None;
        attempt.updated_at = now;
        Ok(attempt.clone())
    }

    async fn attempts_for(&self, post_id: PostId) -> Result<Vec<PlatformAttempt>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_post
            .get(&post_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.attempts.get(id).cloned())
            .collect())
    }

    async fn cancel_pending_for(
        &self,
        post_id: PostId,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut tables = self.tables.write().await;
        Ok(tables.abandon_waiting(post_id, now))
    }

    async fn reap_expired(
        &self,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<PlatformAttempt>, StoreError> {
        let cutoff = now - to_chrono(lease_timeout);
        let mut tables = self.tables.write().await;
        let mut reaped = Vec::new();
        for attempt in tables.attempts.values_mut() {
            if attempt.state != AttemptState::InFlight || attempt.updated_at >= cutoff {
                continue;
            }
            let outcome = transient_outcome(attempt, Duration::ZERO, now);
            attempt.state = outcome.state;
            attempt.attempts_used = outcome.attempts_used;
            attempt.next_eligible_at = outcome.next_eligible_at;
            attempt.last_error = Some(REASON_LEASE_EXPIRED.to_string());
            attempt.lease_token = None;
            attempt.updated_at = now;
            reaped.push(attempt.clone());
        }
        Ok(reaped)
    }

    async fn get_account(&self, id: AccountId) -> Result<SocialAccount, StoreError> {
        let tables = self.tables.read().await;
        tables
            .accounts
            .get(&id)
            .filter(|a| a.active)
            .cloned()
            .ok_or_else(|| StoreError::AccountNotFound(id.to_string()))
    }

    async fn active_account(
        &self,
        owner_id: OwnerId,
        platform: Platform,
    ) -> Result<Option<SocialAccount>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .accounts
            .values()
            .find(|a| a.active && a.owner_id == owner_id && a.platform == platform)
            .cloned())
    }

    async fn update_credentials(
        &self,
        id: AccountId,
        credentials: &Credentials,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let account = tables
            .accounts
            .get_mut(&id)
            .ok_or_else(|| StoreError::AccountNotFound(id.to_string()))?;
        account.access_token = credentials.access_token.clone();
        account.refresh_token = credentials.refresh_token.clone();
        account.token_expires_at = credentials.expires_at;
        Ok(())
    }

    async fn upsert_account(&self, account: &SocialAccount) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if account.active {
            let clash = tables.accounts.values().any(|a| {
                a.id != account.id
                    && a.active
                    && a.owner_id == account.owner_id
                    && a.platform == account.platform
            });
            if clash {
                return Err(StoreError::DuplicateActiveAccount {
                    owner_id: account.owner_id,
                    platform: account.platform,
                });
            }
        }
        tables.accounts.insert(account.id, account.clone());
        Ok(())
    }
}
