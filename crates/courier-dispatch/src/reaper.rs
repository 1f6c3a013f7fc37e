//! Releases attempts whose worker went silent.

use std::sync::Arc;
use std::time::Duration;

use courier_store::Store;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::error::DispatchError;
use crate::rollup::RollupCoordinator;

pub struct Reaper {
    store: Arc<dyn Store>,
    rollup: Arc<RollupCoordinator>,
    clock: Arc<dyn Clock>,
    lease_timeout: Duration,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn Store>,
        rollup: Arc<RollupCoordinator>,
        clock: Arc<dyn Clock>,
        lease_timeout: Duration,
    ) -> Self {
        Self {
            store,
            rollup,
            clock,
            lease_timeout,
        }
    }

    /// Reap once. Returns how many attempts were released.
    pub async fn sweep(&self) -> Result<usize, DispatchError> {
        let reaped = self
            .store
            .reap_expired(self.lease_timeout, self.clock.now())
            .await?;
        for attempt in &reaped {
            warn!(
                attempt_id = %attempt.id,
                platform = %attempt.platform,
                state = %attempt.state,
                "reaped expired lease"
            );
            self.rollup.reaped(attempt).await?;
        }
        Ok(reaped.len())
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), DispatchError> {
        let interval = (self.lease_timeout / 2).max(Duration::from_secs(1));
        info!(interval_secs = interval.as_secs(), "lease reaper started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.sweep().await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => error!(error = %e, "lease sweep failed"),
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = sleep(interval) => {}
            }
        }

        info!("lease reaper stopped");
        Ok(())
    }
}
