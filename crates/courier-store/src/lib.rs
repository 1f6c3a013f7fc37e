//! Durable state for the Courier dispatch core.
//!
//! This crate provides:
//! - Typed posts, platform attempts and social accounts
//! - The attempt state machine and its allowed-transition table
//! - The [`Store`] contract with in-memory and Postgres backends
//! - Lease-guarded claims so an attempt is in flight for at most one worker

mod error;
mod memory;
mod postgres;
mod store;
mod types;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::Store;
pub use types::{
    AccountId, AttemptId, AttemptSeed, AttemptState, CancelOutcome, Credentials,
    DEFAULT_MAX_ATTEMPTS, LeaseToken, MediaRef, OwnerId, Platform, PlatformAttempt, PostId,
    PostState, REASON_CANCELLED, REASON_LEASE_EXPIRED, REASON_NO_ACCOUNT, RetryOutcome,
    ScheduledPost, SocialAccount, UnknownPlatform, to_chrono,
};
