//! Finds due posts and hands their attempts to the workers.

use std::sync::Arc;

use courier_store::{AttemptSeed, AttemptState, ScheduledPost, Store, StoreError, to_chrono};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::credentials::CredentialStore;
use crate::error::{CredentialError, DispatchError};
use crate::queue::{DispatchQueue, Ticket};
use crate::rollup::RollupCoordinator;

/// What one scheduler pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Posts moved to `dispatching`.
    pub dispatched: usize,
    /// Tickets handed to the workers.
    pub enqueued: usize,
    /// Posts that missed the catch-up window.
    pub overdue: usize,
}

/// Periodic dispatcher of due posts.
pub struct Scheduler {
    store: Arc<dyn Store>,
    credentials: Arc<CredentialStore>,
    rollup: Arc<RollupCoordinator>,
    queue: Arc<DispatchQueue>,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        credentials: Arc<CredentialStore>,
        rollup: Arc<RollupCoordinator>,
        queue: Arc<DispatchQueue>,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            credentials,
            rollup,
            queue,
            clock,
            config,
        }
    }

    /// One pass: report overdue posts, then dispatch due posts oldest first.
    pub async fn tick(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<TickReport, DispatchError> {
        let now = self.clock.now();
        let mut report = TickReport::default();

        let cutoff = now - to_chrono(self.config.catch_up_grace);
        let overdue = self
            .store
            .overdue_posts(cutoff, self.config.scheduler_batch)
            .await?;
        for post in &overdue {
            warn!(
                post_id = %post.id,
                scheduled_at = %post.scheduled_at,
                "post missed its catch-up window, leaving for operator"
            );
        }
        report.overdue = overdue.len();

        let due = self
            .store
            .due_posts(now, self.config.catch_up_grace, self.config.scheduler_batch)
            .await?;
        if !due.is_empty() {
            debug!(count = due.len(), "due posts");
        }

        for post in due {
            if *shutdown.borrow() {
                info!("shutdown requested, not dispatching more posts");
                break;
            }

            let Some(tickets) = self.dispatch_post(&post).await? else {
                continue;
            };
            report.dispatched += 1;

            for ticket in tickets {
                self.queue.push(ticket, shutdown).await?;
                report.enqueued += 1;
            }
        }

        Ok(report)
    }

    /// Materialize one post. `None` when the post was skipped.
    async fn dispatch_post(
        &self,
        post: &ScheduledPost,
    ) -> Result<Option<Vec<Ticket>>, DispatchError> {
        let mut seeds = Vec::with_capacity(post.platforms.len());
        for &platform in &post.platforms {
            let account_id = match self.credentials.resolve(post.owner_id, platform).await {
                Ok(id) => Some(id),
                Err(CredentialError::NoActiveAccount { .. }) => {
                    warn!(post_id = %post.id, %platform, "no active account at dispatch time");
                    None
                }
                Err(e) => {
                    error!(post_id = %post.id, %platform, error = %e, "account lookup failed");
                    return Ok(None);
                }
            };
            seeds.push(AttemptSeed {
                platform,
                account_id,
                content: post.content_for(platform).to_string(),
            });
        }

        let attempts = match self
            .rollup
            .dispatch(post, &seeds, self.config.max_attempts)
            .await
        {
            Ok(attempts) => attempts,
            Err(DispatchError::Store(StoreError::AlreadyDispatched(_))) => {
                debug!(post_id = %post.id, "post already dispatched elsewhere");
                return Ok(None);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                error!(post_id = %post.id, error = %e, "failed to dispatch post");
                return Ok(None);
            }
        };

        Ok(Some(
            attempts
                .iter()
                .filter(|a| a.state == AttemptState::Pending)
                .map(|a| Ticket(a.id))
                .collect(),
        ))
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), DispatchError> {
        info!(
            tick_secs = self.config.scheduler_tick.as_secs(),
            "scheduler starting"
        );

        loop {
            if *shutdown.borrow() {
                info!("scheduler shutting down");
                break;
            }

            match self.tick(&mut shutdown).await {
                Ok(report) if report.dispatched > 0 => {
                    info!(
                        dispatched = report.dispatched,
                        enqueued = report.enqueued,
                        "scheduler tick"
                    );
                }
                Ok(_) | Err(DispatchError::QueueClosed) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => error!(error = %e, "scheduler tick failed"),
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler received shutdown signal");
                    }
                }
                _ = sleep(self.config.scheduler_tick) => {}
            }
        }

        info!("scheduler shut down gracefully");
        Ok(())
    }
}
