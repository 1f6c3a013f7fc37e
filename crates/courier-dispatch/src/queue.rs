//! Bounded hand-off between the scheduler and the publish workers.

use std::time::Duration;

use courier_store::AttemptId;
use tokio::sync::{Mutex, mpsc, watch};

use crate::error::DispatchError;

/// Work item for a publish worker: an attempt it should try to claim.
///
/// Tickets carry no ownership. The lease starts when a worker claims the
/// attempt, so a ticket may wait in the queue for any length of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(pub AttemptId);

impl Ticket {
    pub fn attempt_id(&self) -> AttemptId {
        self.0
    }
}

/// Bounded FIFO of tickets shared by all workers.
///
/// Producers block while the queue is full; consumers wait at most a given
/// timeout so they can notice shutdown.
pub struct DispatchQueue {
    tx: mpsc::Sender<Ticket>,
    rx: Mutex<mpsc::Receiver<Ticket>>,
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Enqueue, waiting for room. Gives up once `shutdown` fires.
    pub async fn push(
        &self,
        ticket: Ticket,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), DispatchError> {
        if *shutdown.borrow() {
            return Err(DispatchError::QueueClosed);
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => Err(DispatchError::QueueClosed),
            sent = self.tx.send(ticket) => sent.map_err(|_| DispatchError::QueueClosed),
        }
    }

    /// Enqueue without waiting. Returns `false` when full.
    pub fn try_push(&self, ticket: Ticket) -> bool {
        self.tx.try_send(ticket).is_ok()
    }

    /// Next ticket, or `None` after `timeout`.
    pub async fn take(&self, timeout: Duration) -> Option<Ticket> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Tickets currently buffered.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
