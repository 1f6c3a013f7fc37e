//! Delayed re-enqueueing of retryable attempts.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_store::AttemptId;
use tokio::sync::{Mutex, watch};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::DispatchError;
use crate::queue::{DispatchQueue, Ticket};

/// Retryable attempts ordered by when they become eligible.
#[derive(Default)]
pub struct RetryQueue {
    entries: Mutex<BTreeSet<(DateTime<Utc>, AttemptId)>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn schedule(&self, eligible_at: DateTime<Utc>, attempt_id: AttemptId) {
        self.entries.lock().await.insert((eligible_at, attempt_id));
    }

    /// Remove and return every entry eligible at `now`, earliest first.
    pub async fn pop_due(&self, now: DateTime<Utc>) -> Vec<AttemptId> {
        let mut entries = self.entries.lock().await;
        let mut due = Vec::new();
        while let Some(&(at, id)) = entries.first() {
            if at > now {
                break;
            }
            entries.pop_first();
            due.push(id);
        }
        due
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Earliest scheduled time, if any.
    pub async fn next_due(&self) -> Option<DateTime<Utc>> {
        self.entries.lock().await.first().map(|(at, _)| *at)
    }
}

/// Moves due retries into the dispatch queue.
pub struct RetryPromoter {
    retries: Arc<RetryQueue>,
    queue: Arc<DispatchQueue>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl RetryPromoter {
    pub fn new(
        retries: Arc<RetryQueue>,
        queue: Arc<DispatchQueue>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            retries,
            queue,
            clock,
            interval,
        }
    }

    /// Promote everything due now. Returns how many tickets were enqueued.
    pub async fn promote(&self, shutdown: &mut watch::Receiver<bool>) -> Result<usize, DispatchError> {
        let due = self.retries.pop_due(self.clock.now()).await;
        let mut promoted = 0;
        for (i, attempt_id) in due.iter().enumerate() {
            if let Err(e) = self.queue.push(Ticket(*attempt_id), shutdown).await {
                // Put back what we could not hand off; the startup sweep
                // covers it if the process is going away.
                let now = self.clock.now();
                for id in &due[i..] {
                    self.retries.schedule(now, *id).await;
                }
                return Err(e);
            }
            promoted += 1;
        }
        if promoted > 0 {
            debug!(promoted, "promoted retries");
        }
        Ok(promoted)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), DispatchError> {
        info!(interval_secs = self.interval.as_secs(), "retry promoter started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.promote(&mut shutdown).await {
                Ok(_) | Err(DispatchError::QueueClosed) => {}
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = sleep(self.interval) => {}
            }
        }

        info!("retry promoter stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_pop_due_respects_order_and_time() {
        let retries = RetryQueue::new();
        let early = AttemptId::new();
        let late = AttemptId::new();
        retries.schedule(base() + chrono::Duration::seconds(120), late).await;
        retries.schedule(base() + chrono::Duration::seconds(60), early).await;

        assert!(retries.pop_due(base()).await.is_empty());
        assert_eq!(
            retries.next_due().await,
            Some(base() + chrono::Duration::seconds(60))
        );

        let due = retries.pop_due(base() + chrono::Duration::seconds(90)).await;
        assert_eq!(due, vec![early]);

        let due = retries.pop_due(base() + chrono::Duration::seconds(600)).await;
        assert_eq!(due, vec![late]);
        assert!(retries.is_empty().await);
    }

    #[tokio::test]
    async fn test_promoter_moves_due_entries() {
        let clock = Arc::new(ManualClock::new(base()));
        let retries = Arc::new(RetryQueue::new());
        let queue = Arc::new(DispatchQueue::new(8));
        let promoter = RetryPromoter::new(
            retries.clone(),
            queue.clone(),
            clock.clone(),
            Duration::from_secs(60),
        );
        let (_tx, mut shutdown) = watch::channel(false);

        let id = AttemptId::new();
        retries.schedule(base() + chrono::Duration::seconds(30), id).await;
        assert_eq!(promoter.promote(&mut shutdown).await.unwrap(), 0);

        clock.advance(Duration::from_secs(30));
        assert_eq!(promoter.promote(&mut shutdown).await.unwrap(), 1);
        assert_eq!(
            queue.take(Duration::from_millis(10)).await,
            Some(Ticket(id))
        );
        assert_eq!(retries.len().await, 0);
    }
}
