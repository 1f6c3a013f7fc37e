//! Wiring and lifecycle of the background tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ::backoff::ExponentialBackoff;
use ::backoff::backoff::Backoff as _;
use courier_platforms::AdapterRegistry;
use courier_store::{PlatformAttempt, Store};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::DispatchConfig;
use crate::credentials::CredentialStore;
use crate::delay::Backoff;
use crate::error::DispatchError;
use crate::events::EventHub;
use crate::queue::{DispatchQueue, Ticket};
use crate::reaper::Reaper;
use crate::retry::{RetryPromoter, RetryQueue};
use crate::rollup::RollupCoordinator;
use crate::scheduler::{Scheduler, TickReport};
use crate::service::Courier;
use crate::worker::{Worker, WorkerContext};

/// How long stragglers get after the abort signal before being cancelled.
const ABORT_GRACE: Duration = Duration::from_secs(5);

/// Owns the shared components of the dispatch core.
pub struct Dispatcher {
    config: DispatchConfig,
    store: Arc<dyn Store>,
    registry: Arc<AdapterRegistry>,
    clock: Arc<dyn Clock>,
    events: Arc<EventHub>,
    credentials: Arc<CredentialStore>,
    retries: Arc<RetryQueue>,
    rollup: Arc<RollupCoordinator>,
    queue: Arc<DispatchQueue>,
    shutdown_tx: watch::Sender<bool>,
    abort_tx: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        store: Arc<dyn Store>,
        registry: AdapterRegistry,
    ) -> Result<Self, DispatchError> {
        Self::with_clock(config, store, registry, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: DispatchConfig,
        store: Arc<dyn Store>,
        registry: AdapterRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DispatchError> {
        config.validate()?;

        let events = Arc::new(EventHub::new(config.subscriber_buffer));
        let retries = Arc::new(RetryQueue::new());
        let credentials = Arc::new(CredentialStore::new(store.clone(), clock.clone()));
        let rollup = Arc::new(RollupCoordinator::new(
            store.clone(),
            events.clone(),
            retries.clone(),
            clock.clone(),
        ));
        let queue = Arc::new(DispatchQueue::new(config.dispatch_queue_capacity));
        let (shutdown_tx, _) = watch::channel(false);
        let (abort_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            registry: Arc::new(registry),
            clock,
            events,
            credentials,
            retries,
            rollup,
            queue,
            shutdown_tx,
            abort_tx,
        })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn retries(&self) -> &Arc<RetryQueue> {
        &self.retries
    }

    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }

    /// The caller-facing service.
    pub fn courier(&self) -> Courier {
        Courier::new(
            self.store.clone(),
            self.registry.clone(),
            self.credentials.clone(),
            self.rollup.clone(),
            self.events.clone(),
            self.clock.clone(),
        )
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.store.clone(),
            self.credentials.clone(),
            self.rollup.clone(),
            self.queue.clone(),
            self.clock.clone(),
            self.config.clone(),
        )
    }

    pub fn worker(&self, id: usize) -> Worker {
        Worker::new(
            id,
            WorkerContext {
                store: self.store.clone(),
                registry: self.registry.clone(),
                credentials: self.credentials.clone(),
                rollup: self.rollup.clone(),
                queue: self.queue.clone(),
                clock: self.clock.clone(),
                backoff: Backoff::new(self.config.backoff_base, self.config.backoff_ceiling),
                config: self.config.clone(),
                abort: self.abort_tx.subscribe(),
            },
        )
    }

    pub fn promoter(&self) -> RetryPromoter {
        RetryPromoter::new(
            self.retries.clone(),
            self.queue.clone(),
            self.clock.clone(),
            self.config.retry_tick,
        )
    }

    pub fn reaper(&self) -> Reaper {
        Reaper::new(
            self.store.clone(),
            self.rollup.clone(),
            self.clock.clone(),
            self.config.lease_timeout,
        )
    }

    // === Single steps, for driving the core by hand ===

    pub async fn tick(&self) -> Result<TickReport, DispatchError> {
        let mut shutdown = self.shutdown_tx.subscribe();
        self.scheduler().tick(&mut shutdown).await
    }

    pub async fn promote(&self) -> Result<usize, DispatchError> {
        let mut shutdown = self.shutdown_tx.subscribe();
        self.promoter().promote(&mut shutdown).await
    }

    pub async fn reap(&self) -> Result<usize, DispatchError> {
        self.reaper().sweep().await
    }

    pub async fn process_next(&self) -> Result<Option<PlatformAttempt>, DispatchError> {
        self.worker(0).process_next().await
    }

    /// Requeue the work a previous run left behind: waiting attempts that
    /// are ready go to the workers, retries not yet due go back to the retry
    /// queue. Nothing is claimed here, so the lease clock only starts once a
    /// worker picks the ticket up. Returns how many attempts were recovered.
    pub async fn recover(&self) -> Result<usize, DispatchError> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let batch = self.config.scheduler_batch;
        let mut after = None;
        let mut queued = 0;
        let mut deferred = 0;

        loop {
            let waiting = self.store.waiting_attempts(after, batch).await?;
            let Some(last) = waiting.last() else {
                break;
            };
            after = Some(last.id);
            let fetched = waiting.len();

            let now = self.clock.now();
            for attempt in waiting {
                match attempt.next_eligible_at {
                    Some(at) if !attempt.is_claimable(now) => {
                        self.retries.schedule(at, attempt.id).await;
                        deferred += 1;
                    }
                    _ => {
                        self.queue.push(Ticket(attempt.id), &mut shutdown).await?;
                        queued += 1;
                    }
                }
            }
            if fetched < batch {
                break;
            }
        }

        if queued + deferred > 0 {
            info!(queued, deferred, "recovered attempts from previous run");
        }
        Ok(queued + deferred)
    }

    /// Spawn the scheduler, promoter, reaper and workers under supervision.
    pub fn start(self: &Arc<Self>) -> RunningDispatcher {
        let mut tasks = JoinSet::new();
        let shutdown = self.shutdown_tx.subscribe();

        for id in 0..self.config.worker_count {
            let worker = Arc::new(self.worker(id));
            let rx = shutdown.clone();
            tasks.spawn(supervise(format!("worker-{}", id), shutdown.clone(), move || {
                let worker = worker.clone();
                let rx = rx.clone();
                async move { worker.run(rx).await }
            }));
        }

        let scheduler = Arc::new(self.scheduler());
        let rx = shutdown.clone();
        tasks.spawn(supervise("scheduler".to_string(), shutdown.clone(), move || {
            let scheduler = scheduler.clone();
            let rx = rx.clone();
            async move { scheduler.run(rx).await }
        }));

        let promoter = Arc::new(self.promoter());
        let rx = shutdown.clone();
        tasks.spawn(supervise("retry-promoter".to_string(), shutdown.clone(), move || {
            let promoter = promoter.clone();
            let rx = rx.clone();
            async move { promoter.run(rx).await }
        }));

        let reaper = Arc::new(self.reaper());
        let rx = shutdown.clone();
        tasks.spawn(supervise("lease-reaper".to_string(), shutdown, move || {
            let reaper = reaper.clone();
            let rx = rx.clone();
            async move { reaper.run(rx).await }
        }));

        // Workers are already draining the queue, so a large backlog cannot
        // stall the sweep.
        let dispatcher = self.clone();
        tasks.spawn(async move {
            match dispatcher.recover().await {
                Ok(_) | Err(DispatchError::QueueClosed) => {}
                Err(e) => error!(error = %e, "startup recovery failed"),
            }
        });

        info!(workers = self.config.worker_count, "dispatcher started");
        RunningDispatcher {
            dispatcher: self.clone(),
            tasks,
        }
    }
}

/// Handle to a started dispatcher.
pub struct RunningDispatcher {
    dispatcher: Arc<Dispatcher>,
    tasks: JoinSet<()>,
}

impl RunningDispatcher {
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Stop taking work and let in-flight publishes finish. Publishes still
    /// running after `publish_timeout` are told to abort.
    pub async fn shutdown(mut self) {
        info!("dispatcher shutting down");
        self.dispatcher.shutdown_tx.send_replace(true);

        let grace = self.dispatcher.config.publish_timeout;
        if drain(&mut self.tasks, grace).await {
            info!("dispatcher stopped gracefully");
            return;
        }

        warn!(
            remaining = self.tasks.len(),
            "tasks still running after grace period, aborting publishes"
        );
        self.dispatcher.abort_tx.send_replace(true);
        if drain(&mut self.tasks, ABORT_GRACE).await {
            info!("dispatcher stopped after abort");
            return;
        }

        error!(remaining = self.tasks.len(), "cancelling unresponsive tasks");
        self.tasks.shutdown().await;
    }
}

/// Wait for every task to finish. Returns `false` on timeout.
async fn drain(tasks: &mut JoinSet<()>, limit: Duration) -> bool {
    tokio::time::timeout(limit, async {
        while tasks.join_next().await.is_some() {}
    })
    .await
    .is_ok()
}

/// Cancels the wrapped task when dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run `task` until it returns cleanly, restarting it with exponential
/// backoff when it fails or panics.
async fn supervise<F, Fut>(name: String, mut shutdown: watch::Receiver<bool>, task: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
{
    let mut backoff = ExponentialBackoff {
        initial_interval: Duration::from_secs(1),
        max_interval: Duration::from_secs(60),
        max_elapsed_time: None,
        ..Default::default()
    };

    loop {
        let started = Instant::now();
        let handle = tokio::spawn(task());
        let _guard = AbortOnDrop(handle.abort_handle());

        match handle.await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => error!(
                task = %name,
                fatal = e.is_fatal(),
                error = %e,
                "task failed, restarting"
            ),
            Err(e) if e.is_panic() => error!(task = %name, "task panicked, restarting"),
            Err(_) => return,
        }

        if *shutdown.borrow() {
            return;
        }
        if started.elapsed() > backoff.max_interval {
            backoff.reset();
        }
        let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(60));

        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = sleep(wait) => {}
        }
    }
}
