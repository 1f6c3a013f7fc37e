//! Dispatch core for Courier.
//!
//! Turns scheduled posts into platform publishes:
//! - the [`Scheduler`] materializes one attempt per target platform when a
//!   post falls due and queues them for the workers
//! - [`Worker`]s claim attempts, refresh credentials, render and publish
//!   through the platform adapters, and record the outcome
//! - transient failures are retried with jittered exponential backoff until
//!   the attempt budget runs out
//! - the [`RollupCoordinator`] terminates a post once all of its attempts are
//!   terminal and announces every step on the owner's event feed

mod clock;
mod config;
mod credentials;
mod delay;
mod error;
mod events;
mod queue;
mod reaper;
mod retry;
mod rollup;
mod runtime;
mod scheduler;
mod service;
mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::DispatchConfig;
pub use credentials::CredentialStore;
pub use delay::Backoff;
pub use error::{CredentialError, DispatchError, SubmitError};
pub use events::{Delivery, EventHub, EventKind, LifecycleEvent, Subscription};
pub use queue::{DispatchQueue, Ticket};
pub use reaper::Reaper;
pub use retry::{RetryPromoter, RetryQueue};
pub use rollup::{Outcome, RollupCoordinator, roll_up};
pub use runtime::{Dispatcher, RunningDispatcher};
pub use scheduler::{Scheduler, TickReport};
pub use service::{Courier, NewPost, PostWithAttempts};
pub use worker::{
    REASON_ACCOUNT_PLATFORM_MISMATCH, REASON_ADAPTER_TIMEOUT, Worker, WorkerContext,
};
