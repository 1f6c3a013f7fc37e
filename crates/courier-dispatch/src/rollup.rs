//! Per-post coordination of attempt outcomes, roll-up and events.
//!
//! Everything that changes a post or one of its attempts and then announces
//! it goes through [`RollupCoordinator`] under that post's lock. This keeps
//! the event order per post intact: `dispatching` first, attempt events next,
//! exactly one terminal event last.

use std::sync::Arc;
use std::time::Duration;

use courier_platforms::PublishReceipt;
use courier_store::{
    AttemptSeed, AttemptState, CancelOutcome, LeaseToken, PlatformAttempt, PostId, PostState,
    ScheduledPost, Store,
};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::DispatchError;
use crate::events::{EventHub, EventKind, LifecycleEvent};
use crate::retry::RetryQueue;

/// How a publish try ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded(PublishReceipt),
    /// Retry after `backoff` if budget remains.
    Transient { reason: String, backoff: Duration },
    Permanent { reason: String },
}

/// Terminal post state implied by the attempt states, or `None` while any
/// attempt is still live.
///
/// - every attempt succeeded: `posted`
/// - none succeeded: `failed`
/// - otherwise: `partially_failed`
pub fn roll_up(states: &[AttemptState]) -> Option<PostState> {
    if states.is_empty() || !states.iter().all(|s| s.is_terminal()) {
        return None;
    }
    let succeeded = states
        .iter()
        .filter(|s| **s == AttemptState::Succeeded)
        .count();
    Some(if succeeded == states.len() {
        PostState::Posted
    } else if succeeded == 0 {
        PostState::Failed
    } else {
        PostState::PartiallyFailed
    })
}

pub struct RollupCoordinator {
    store: Arc<dyn Store>,
    events: Arc<EventHub>,
    retries: Arc<RetryQueue>,
    clock: Arc<dyn Clock>,
    locks: DashMap<PostId, Arc<Mutex<()>>>,
}

impl RollupCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<EventHub>,
        retries: Arc<RetryQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            events,
            retries,
            clock,
            locks: DashMap::new(),
        }
    }

    /// Materialize a due post's attempts and announce the dispatch.
    ///
    /// Attempts seeded without an account are already failed; their events
    /// follow `dispatching` and the post may terminate right here.
    #[tracing::instrument(skip_all, fields(post_id = %post.id))]
    pub async fn dispatch(
        &self,
        post: &ScheduledPost,
        seeds: &[AttemptSeed],
        max_attempts: u32,
    ) -> Result<Vec<PlatformAttempt>, DispatchError> {
        let lock = self.lock_for(post.id);
        let result = {
            let _guard = lock.lock().await;
            self.dispatch_locked(post, seeds, max_attempts).await
        };
        self.release(post.id, lock);
        result
    }

    async fn dispatch_locked(
        &self,
        post: &ScheduledPost,
        seeds: &[AttemptSeed],
        max_attempts: u32,
    ) -> Result<Vec<PlatformAttempt>, DispatchError> {
        let now = self.clock.now();
        let attempts = self
            .store
            .materialize(post.id, seeds, max_attempts, now)
            .await?;

        let platforms: Vec<&str> = attempts.iter().map(|a| a.platform.as_str()).collect();
        self.events.publish(LifecycleEvent::post(
            EventKind::Dispatching,
            post.owner_id,
            post.id,
            json!({ "platforms": platforms }),
            now,
        ));
        info!(attempts = attempts.len(), "post dispatching");

        for attempt in attempts
            .iter()
            .filter(|a| a.state == AttemptState::FailedPermanent)
        {
            self.events.publish(LifecycleEvent::attempt(
                EventKind::AttemptFailed,
                post.owner_id,
                post.id,
                attempt.platform,
                json!({
                    "attempt_id": attempt.id,
                    "reason": attempt.last_error,
                    "permanent": true,
                }),
                now,
            ));
        }

        self.roll_up_locked(post).await?;
        Ok(attempts)
    }

    /// Record a worker's outcome for a claimed attempt, announce it, and
    /// terminate the post if this was its last live attempt.
    #[tracing::instrument(skip_all, fields(attempt_id = %attempt.id, platform = %attempt.platform))]
    pub async fn complete(
        &self,
        attempt: &PlatformAttempt,
        lease: LeaseToken,
        outcome: Outcome,
    ) -> Result<PlatformAttempt, DispatchError> {
        let lock = self.lock_for(attempt.post_id);
        let result = {
            let _guard = lock.lock().await;
            self.complete_locked(attempt, lease, outcome).await
        };
        self.release(attempt.post_id, lock);
        result
    }

    async fn complete_locked(
        &self,
        attempt: &PlatformAttempt,
        lease: LeaseToken,
        outcome: Outcome,
    ) -> Result<PlatformAttempt, DispatchError> {
        let now = self.clock.now();
        let post = self.store.get_post(attempt.post_id).await?;

        let (kind, payload, updated) = match outcome {
            Outcome::Succeeded(receipt) => {
                let updated = self
                    .store
                    .record_success(
                        attempt.id,
                        lease,
                        &receipt.platform_post_id,
                        receipt.url.as_deref(),
                        now,
                    )
                    .await?;
                info!(platform_post_id = %receipt.platform_post_id, "attempt succeeded");
                let payload = json!({
                    "attempt_id": attempt.id,
                    "platform_post_id": receipt.platform_post_id,
                    "url": receipt.url,
                });
                (EventKind::AttemptSucceeded, payload, updated)
            }
            Outcome::Transient { reason, backoff } => {
                let retry = self
                    .store
                    .record_transient_failure(attempt.id, lease, &reason, backoff, now)
                    .await?;
                let updated = self.store.get_attempt(attempt.id).await?;
                if retry.exhausted() {
                    warn!(%reason, attempts_used = retry.attempts_used, "attempt exhausted");
                    let payload = json!({
                        "attempt_id": attempt.id,
                        "reason": reason,
                        "attempts_used": retry.attempts_used,
                    });
                    (EventKind::AttemptExhausted, payload, updated)
                } else {
                    warn!(
                        %reason,
                        retries_left = retry.retries_left,
                        backoff_secs = backoff.as_secs(),
                        "attempt failed, will retry"
                    );
                    let payload = json!({
                        "attempt_id": attempt.id,
                        "reason": reason,
                        "retries_left": retry.retries_left,
                        "next_eligible_at": retry.next_eligible_at,
                    });
                    (EventKind::AttemptFailed, payload, updated)
                }
            }
            Outcome::Permanent { reason } => {
                let updated = self
                    .store
                    .record_permanent_failure(attempt.id, lease, &reason, now)
                    .await?;
                warn!(%reason, "attempt failed permanently");
                let payload = json!({
                    "attempt_id": attempt.id,
                    "reason": reason,
                    "permanent": true,
                });
                (EventKind::AttemptFailed, payload, updated)
            }
        };

        if post.state != PostState::Dispatching {
            // Cancelled while the publish was in flight. The outcome stays
            // on record but the post's feed already ended.
            if updated.state == AttemptState::FailedRetryable {
                self.store.cancel_pending_for(post.id, now).await?;
            }
            debug!(post_state = %post.state, "suppressing attempt event for finished post");
            return Ok(updated);
        }

        self.events.publish(LifecycleEvent::attempt(
            kind,
            post.owner_id,
            post.id,
            attempt.platform,
            payload,
            now,
        ));
        if updated.state == AttemptState::FailedRetryable {
            if let Some(at) = updated.next_eligible_at {
                self.retries.schedule(at, updated.id).await;
            }
        }

        self.roll_up_locked(&post).await?;
        Ok(updated)
    }

    /// Announce attempts released by the lease reaper and queue their retries.
    pub async fn reaped(&self, attempt: &PlatformAttempt) -> Result<(), DispatchError> {
        let lock = self.lock_for(attempt.post_id);
        let result = {
            let _guard = lock.lock().await;
            self.reaped_locked(attempt).await
        };
        self.release(attempt.post_id, lock);
        result
    }

    async fn reaped_locked(&self, attempt: &PlatformAttempt) -> Result<(), DispatchError> {
        let now = self.clock.now();
        let post = self.store.get_post(attempt.post_id).await?;
        if post.state != PostState::Dispatching {
            if attempt.state == AttemptState::FailedRetryable {
                self.store.cancel_pending_for(post.id, now).await?;
            }
            return Ok(());
        }

        let (kind, payload) = match attempt.state {
            AttemptState::FailedRetryable => {
                if let Some(at) = attempt.next_eligible_at {
                    self.retries.schedule(at, attempt.id).await;
                }
                let payload = json!({
                    "attempt_id": attempt.id,
                    "reason": attempt.last_error,
                    "retries_left": attempt.retries_left(),
                    "next_eligible_at": attempt.next_eligible_at,
                });
                (EventKind::AttemptFailed, payload)
            }
            AttemptState::Abandoned => {
                let payload = json!({
                    "attempt_id": attempt.id,
                    "reason": attempt.last_error,
                    "attempts_used": attempt.attempts_used,
                });
                (EventKind::AttemptExhausted, payload)
            }
            other => {
                return Err(DispatchError::InvariantViolation(format!(
                    "reaper returned attempt {} in state {}",
                    attempt.id, other
                )));
            }
        };

        self.events.publish(LifecycleEvent::attempt(
            kind,
            post.owner_id,
            post.id,
            attempt.platform,
            payload,
            now,
        ));
        self.roll_up_locked(&post).await
    }

    /// Cancel a post and announce it once.
    pub async fn cancel(&self, post_id: PostId) -> Result<CancelOutcome, DispatchError> {
        let lock = self.lock_for(post_id);
        let result = {
            let _guard = lock.lock().await;
            self.cancel_locked(post_id).await
        };
        self.release(post_id, lock);
        result
    }

    async fn cancel_locked(&self, post_id: PostId) -> Result<CancelOutcome, DispatchError> {
        let now = self.clock.now();
        let outcome = self.store.cancel_post(post_id, now).await?;
        if let CancelOutcome::Cancelled {
            previous,
            abandoned,
        } = outcome
        {
            let post = self.store.get_post(post_id).await?;
            info!(post_id = %post_id, %previous, abandoned, "post cancelled");
            self.events.publish(LifecycleEvent::post(
                EventKind::PostCancelled,
                post.owner_id,
                post_id,
                json!({ "previous": previous.as_str(), "abandoned": abandoned }),
                now,
            ));
        }
        Ok(outcome)
    }

    async fn roll_up_locked(&self, post: &ScheduledPost) -> Result<(), DispatchError> {
        let attempts = self.store.attempts_for(post.id).await?;
        let states: Vec<AttemptState> = attempts.iter().map(|a| a.state).collect();
        let Some(terminal) = roll_up(&states) else {
            return Ok(());
        };

        let now = self.clock.now();
        if !self
            .store
            .transition_post(post.id, PostState::Dispatching, terminal, now)
            .await?
        {
            debug!(post_id = %post.id, "post already left dispatching");
            return Ok(());
        }

        let succeeded: Vec<&str> = attempts
            .iter()
            .filter(|a| a.state == AttemptState::Succeeded)
            .map(|a| a.platform.as_str())
            .collect();
        let failed: Vec<&str> = attempts
            .iter()
            .filter(|a| a.state != AttemptState::Succeeded)
            .map(|a| a.platform.as_str())
            .collect();

        info!(post_id = %post.id, state = %terminal, "post finished");
        if let Some(kind) = EventKind::for_post_state(terminal) {
            self.events.publish(LifecycleEvent::post(
                kind,
                post.owner_id,
                post.id,
                json!({ "succeeded": succeeded, "failed": failed }),
                now,
            ));
        }
        Ok(())
    }

    fn lock_for(&self, post_id: PostId) -> Arc<Mutex<()>> {
        self.locks
            .entry(post_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release(&self, post_id: PostId, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks
            .remove_if(&post_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // === Unit Tests ===

    #[test]
    fn test_roll_up_all_succeeded() {
        let states = [AttemptState::Succeeded, AttemptState::Succeeded];
        assert_eq!(roll_up(&states), Some(PostState::Posted));
    }

    #[test]
    fn test_roll_up_mixed() {
        let states = [AttemptState::Succeeded, AttemptState::Abandoned];
        assert_eq!(roll_up(&states), Some(PostState::PartiallyFailed));
    }

    #[test]
    fn test_roll_up_none_succeeded() {
        let states = [AttemptState::FailedPermanent, AttemptState::Abandoned];
        assert_eq!(roll_up(&states), Some(PostState::Failed));
    }

    #[test]
    fn test_roll_up_waits_for_live_attempts() {
        let states = [AttemptState::Succeeded, AttemptState::FailedRetryable];
        assert_eq!(roll_up(&states), None);
        assert_eq!(roll_up(&[AttemptState::InFlight]), None);
        assert_eq!(roll_up(&[]), None);
    }

    // === Property-Based Tests ===

    fn attempt_state() -> impl Strategy<Value = AttemptState> {
        prop_oneof![
            Just(AttemptState::Pending),
            Just(AttemptState::InFlight),
            Just(AttemptState::Succeeded),
            Just(AttemptState::FailedRetryable),
            Just(AttemptState::FailedPermanent),
            Just(AttemptState::Abandoned),
        ]
    }

    proptest! {
        #[test]
        fn prop_roll_up_matches_counts(states in prop::collection::vec(attempt_state(), 1..8)) {
            let all_terminal = states.iter().all(|s| s.is_terminal());
            let succeeded = states.iter().filter(|s| **s == AttemptState::Succeeded).count();

            match roll_up(&states) {
                None => prop_assert!(!all_terminal),
                Some(PostState::Posted) => {
                    prop_assert!(all_terminal);
                    prop_assert_eq!(succeeded, states.len());
                }
                Some(PostState::Failed) => {
                    prop_assert!(all_terminal);
                    prop_assert_eq!(succeeded, 0);
                }
                Some(PostState::PartiallyFailed) => {
                    prop_assert!(all_terminal);
                    prop_assert!(succeeded > 0 && succeeded < states.len());
                }
                Some(other) => prop_assert!(false, "unexpected roll-up {:?}", other),
            }
        }

        #[test]
        fn prop_roll_up_ignores_order(mut states in prop::collection::vec(attempt_state(), 1..8)) {
            let forward = roll_up(&states);
            states.reverse();
            prop_assert_eq!(forward, roll_up(&states));
        }
    }
}
