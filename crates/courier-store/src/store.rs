//! The storage contract shared by the in-memory and Postgres backends.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::{
    AccountId, AttemptId, AttemptSeed, CancelOutcome, Credentials, LeaseToken, OwnerId,
    Platform, PlatformAttempt, PostId, PostState, RetryOutcome, ScheduledPost, SocialAccount,
};

/// Durable state for posts, their platform attempts, and the accounts they
/// publish through.
///
/// Every attempt mutation is checked against the attempt transition table and
/// rejected with [`StoreError::IllegalTransition`] when it does not apply.
/// Outcome writes additionally require the lease stamped by the claim.
#[async_trait]
pub trait Store: Send + Sync {
    // === Posts ===

    async fn insert_post(&self, post: &ScheduledPost) -> Result<(), StoreError>;

    async fn get_post(&self, id: PostId) -> Result<ScheduledPost, StoreError>;

    /// Scheduled posts with `now - grace <= scheduled_at <= now`, oldest first.
    async fn due_posts(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
        limit: usize,
    ) -> Result<Vec<ScheduledPost>, StoreError>;

    /// Scheduled posts whose `scheduled_at` predates `cutoff`.
    async fn overdue_posts(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledPost>, StoreError>;

    /// Compare-and-set the post state. Returns `false` if the post was not in
    /// `from`.
    async fn transition_post(
        &self,
        id: PostId,
        from: PostState,
        to: PostState,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Cancel the post and abandon its pending and retryable attempts in one
    /// atomic unit. In-flight attempts are left to their workers.
    async fn cancel_post(&self, id: PostId, now: DateTime<Utc>)
    -> Result<CancelOutcome, StoreError>;

    /// Delete a post and its attempts.
    async fn purge_post(&self, id: PostId) -> Result<(), StoreError>;

    // === Attempts ===

    /// Insert one attempt per seed and move the post to `dispatching`.
    ///
    /// Existing `(post_id, platform)` rows are left untouched. Fails with
    /// [`StoreError::AlreadyDispatched`] unless the post is `scheduled`.
    async fn materialize(
        &self,
        post_id: PostId,
        seeds: &[AttemptSeed],
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<PlatformAttempt>, StoreError>;

    async fn get_attempt(&self, id: AttemptId) -> Result<PlatformAttempt, StoreError>;

    /// Claim a single attempt for `lease`. Returns `None` if it is not
    /// claimable right now.
    async fn claim(
        &self,
        id: AttemptId,
        lease: LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<Option<PlatformAttempt>, StoreError>;

    /// Claim up to `limit` pending or due retryable attempts for `lease`.
    async fn claim_ready(
        &self,
        limit: usize,
        lease: LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<Vec<AttemptId>, StoreError>;

    /// Pending attempts and retryable attempts with budget left, ordered by
    /// id and starting after `after`. Nothing is claimed.
    async fn waiting_attempts(
        &self,
        after: Option<AttemptId>,
        limit: usize,
    ) -> Result<Vec<PlatformAttempt>, StoreError>;

    async fn record_success(
        &self,
        id: AttemptId,
        lease: LeaseToken,
        platform_post_id: &str,
        url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<PlatformAttempt, StoreError>;

    /// Count a transient failure. Retries while budget remains, otherwise
    /// abandons the attempt.
    async fn record_transient_failure(
        &self,
        id: AttemptId,
        lease: LeaseToken,
        reason: &str,
        backoff: Duration,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome, StoreError>;

    async fn record_permanent_failure(
        &self,
        id: AttemptId,
        lease: LeaseToken,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<PlatformAttempt, StoreError>;

    async fn attempts_for(&self, post_id: PostId) -> Result<Vec<PlatformAttempt>, StoreError>;

    /// Abandon the post's pending and retryable attempts.
    async fn cancel_pending_for(
        &self,
        post_id: PostId,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Release in-flight attempts not touched since `now - lease_timeout`.
    ///
    /// Each counts as a transient failure with reason `lease_expired`; those
    /// at budget are abandoned. Returns the updated rows.
    async fn reap_expired(
        &self,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<PlatformAttempt>, StoreError>;

    // === Accounts ===

    async fn get_account(&self, id: AccountId) -> Result<SocialAccount, StoreError>;

    async fn active_account(
        &self,
        owner_id: OwnerId,
        platform: Platform,
    ) -> Result<Option<SocialAccount>, StoreError>;

    /// Overwrite the token tuple of an account.
    async fn update_credentials(
        &self,
        id: AccountId,
        credentials: &Credentials,
    ) -> Result<(), StoreError>;

    async fn upsert_account(&self, account: &SocialAccount) -> Result<(), StoreError>;
}

/// Outcome of counting one transient failure against `attempt`.
pub(crate) fn transient_outcome(
    attempt: &PlatformAttempt,
    backoff: Duration,
    now: DateTime<Utc>,
) -> RetryOutcome {
    use crate::types::{AttemptState, to_chrono};

    let attempts_used = (attempt.attempts_used + 1).min(attempt.max_attempts);
    if attempts_used < attempt.max_attempts {
        RetryOutcome {
            state: AttemptState::FailedRetryable,
            attempts_used,
            retries_left: attempt.max_attempts - attempts_used,
            next_eligible_at: Some(now + to_chrono(backoff)),
        }
    } else {
        RetryOutcome {
            state: AttemptState::Abandoned,
            attempts_used,
            retries_left: 0,
            next_eligible_at: None,
        }
    }
}
