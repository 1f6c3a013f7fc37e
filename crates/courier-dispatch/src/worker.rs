//! Publish workers.

use std::sync::Arc;

use courier_platforms::{AdapterRegistry, PublishContext, PublishError};
use courier_store::{LeaseToken, PlatformAttempt, REASON_NO_ACCOUNT, Store, StoreError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::credentials::CredentialStore;
use crate::delay::Backoff;
use crate::error::{CredentialError, DispatchError};
use crate::queue::{DispatchQueue, Ticket};
use crate::rollup::{Outcome, RollupCoordinator};

/// Reason recorded when an adapter call outlives `publish_timeout`.
pub const REASON_ADAPTER_TIMEOUT: &str = "adapter_timeout";

/// Reason recorded when an attempt's account is connected to another platform.
pub const REASON_ACCOUNT_PLATFORM_MISMATCH: &str = "account_platform_mismatch";

/// Shared handles a worker needs. Cheap to clone.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn Store>,
    pub registry: Arc<AdapterRegistry>,
    pub credentials: Arc<CredentialStore>,
    pub rollup: Arc<RollupCoordinator>,
    pub queue: Arc<DispatchQueue>,
    pub clock: Arc<dyn Clock>,
    pub backoff: Backoff,
    pub config: DispatchConfig,
    /// Flipped when in-flight publishes must be abandoned.
    pub abort: watch::Receiver<bool>,
}

/// A single publish worker.
pub struct Worker {
    id: usize,
    ctx: WorkerContext,
}

impl Worker {
    pub fn new(id: usize, ctx: WorkerContext) -> Self {
        Self { id, ctx }
    }

    /// Take tickets until shutdown. Finishes the current attempt first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), DispatchError> {
        info!(worker_id = self.id, "publish worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let ticket = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                ticket = self.ctx.queue.take(self.ctx.config.take_timeout) => ticket,
            };
            let Some(ticket) = ticket else {
                continue;
            };

            match self.process(ticket).await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!(
                        worker_id = self.id,
                        fatal = true,
                        error = %e,
                        "worker hit an invariant violation"
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        worker_id = self.id,
                        attempt_id = %ticket.attempt_id(),
                        error = %e,
                        "failed to process ticket"
                    );
                }
            }
        }

        info!(worker_id = self.id, "publish worker stopped");
        Ok(())
    }

    /// Take one ticket, waiting up to `take_timeout`, and process it.
    pub async fn process_next(&self) -> Result<Option<PlatformAttempt>, DispatchError> {
        match self.ctx.queue.take(self.ctx.config.take_timeout).await {
            Some(ticket) => self.process(ticket).await,
            None => Ok(None),
        }
    }

    /// Claim, publish and record one attempt. Returns the recorded attempt,
    /// or `None` when the ticket was stale.
    #[tracing::instrument(skip(self), fields(worker_id = self.id, attempt_id = %ticket.attempt_id()))]
    pub async fn process(&self, ticket: Ticket) -> Result<Option<PlatformAttempt>, DispatchError> {
        let Some((attempt, lease)) = self.claim(ticket).await? else {
            return Ok(None);
        };

        match self.ctx.store.get_post(attempt.post_id).await {
            Ok(_) => {}
            Err(StoreError::PostNotFound(_)) => {
                return Err(DispatchError::InvariantViolation(format!(
                    "attempt {} references missing post {}",
                    attempt.id, attempt.post_id
                )));
            }
            Err(e) => return Err(e.into()),
        }

        let outcome = self.execute(&attempt).await;
        match self.ctx.rollup.complete(&attempt, lease, outcome).await {
            Ok(recorded) => Ok(Some(recorded)),
            Err(DispatchError::Store(e)) if e.is_conflict() => {
                // Reaped while we were publishing.
                warn!(error = %e, "lost the lease before recording the outcome");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn claim(
        &self,
        ticket: Ticket,
    ) -> Result<Option<(PlatformAttempt, LeaseToken)>, DispatchError> {
        let lease = LeaseToken::new();
        match self
            .ctx
            .store
            .claim(ticket.attempt_id(), lease, self.ctx.clock.now())
            .await
        {
            Ok(Some(attempt)) => Ok(Some((attempt, lease))),
            Ok(None) => {
                debug!("attempt no longer claimable");
                Ok(None)
            }
            Err(StoreError::AttemptNotFound(_)) => {
                debug!("attempt purged");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run the adapter pipeline and classify the result.
    async fn execute(&self, attempt: &PlatformAttempt) -> Outcome {
        let adapter = match self.ctx.registry.get(attempt.platform) {
            Ok(adapter) => adapter,
            Err(e) => {
                return Outcome::Permanent {
                    reason: e.reason().to_string(),
                };
            }
        };

        let Some(account_id) = attempt.account_id else {
            return Outcome::Permanent {
                reason: REASON_NO_ACCOUNT.to_string(),
            };
        };

        let credentials = match self
            .ctx
            .credentials
            .refresh_if_needed(
                account_id,
                attempt.platform,
                adapter.as_ref(),
                self.ctx.config.credential_skew,
            )
            .await
        {
            Ok(credentials) => credentials,
            Err(CredentialError::Store(e)) => {
                return self.transient(attempt, format!("store: {}", e), None);
            }
            Err(CredentialError::NoSuchAccount(_)) => {
                return Outcome::Permanent {
                    reason: REASON_NO_ACCOUNT.to_string(),
                };
            }
            Err(CredentialError::PlatformMismatch { account_id, expected }) => {
                warn!(%account_id, %expected, "account belongs to another platform");
                return Outcome::Permanent {
                    reason: REASON_ACCOUNT_PLATFORM_MISMATCH.to_string(),
                };
            }
            Err(e) => {
                return Outcome::Permanent {
                    reason: format!("credential_refresh_failed: {}", e),
                };
            }
        };

        let optimized = adapter.optimize(&attempt.content, &attempt.media_refs);
        for warning in &optimized.warnings {
            warn!(%warning, "optimizer warning");
        }
        let rendered = optimized.render(&attempt.media_refs);
        if let Err(violation) = adapter.validate(&rendered) {
            return Outcome::Permanent {
                reason: violation.reason().to_string(),
            };
        }

        let ctx = PublishContext::new(attempt.id, self.ctx.abort.clone());
        let published = tokio::time::timeout(
            self.ctx.config.publish_timeout,
            adapter.publish(&rendered, &credentials, &ctx),
        )
        .await;

        match published {
            Ok(Ok(receipt)) => Outcome::Succeeded(receipt),
            Ok(Err(PublishError::Transient {
                reason,
                retry_after,
            })) => self.transient(attempt, reason, retry_after),
            Ok(Err(PublishError::Permanent { reason })) => Outcome::Permanent { reason },
            Err(_) => self.transient(attempt, REASON_ADAPTER_TIMEOUT.to_string(), None),
        }
    }

    fn transient(
        &self,
        attempt: &PlatformAttempt,
        reason: String,
        retry_after: Option<std::time::Duration>,
    ) -> Outcome {
        Outcome::Transient {
            reason,
            backoff: self
                .ctx
                .backoff
                .delay_honoring(attempt.attempts_used + 1, retry_after),
        }
    }
}
