//! Error types for the dispatch core.

use courier_store::{AccountId, OwnerId, Platform, PostState, StoreError};
use thiserror::Error;

/// Errors raised by the background tasks.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The core found state that cannot happen. The task exits and is restarted.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The dispatch queue is closed or shutting down.
    #[error("dispatch queue closed")]
    QueueClosed,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DispatchError {
    /// Whether the offending task must exit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DispatchError::InvariantViolation(_))
    }
}

/// Errors from credential lookup and rotation.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Account missing or inactive.
    #[error("no such account: {0}")]
    NoSuchAccount(AccountId),

    /// The owner has no active account on the platform.
    #[error("owner {owner_id} has no active {platform} account")]
    NoActiveAccount { owner_id: OwnerId, platform: Platform },

    /// The account belongs to another platform.
    #[error("account {account_id} is not a {expected} account")]
    PlatformMismatch {
        account_id: AccountId,
        expected: Platform,
    },

    /// Token rotation failed; not retried at the attempt level.
    #[error("credential refresh failed for {account_id}: {reason}")]
    RefreshFailed { account_id: AccountId, reason: String },

    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors reported synchronously to callers of the service operations.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Caller contract violated.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// `scheduled_at` is not in the future.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Unrecognised platform tag.
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),

    /// The owner has no active account on a target platform.
    #[error("no active account for {0}")]
    NoActiveAccount(Platform),

    /// Pre-validation rejected the content for a platform.
    #[error("validation rejected for {0}: {1}")]
    ValidationRejected(Platform, String),

    /// Post missing or owned by someone else.
    #[error("post not found")]
    NotFound,

    /// The post already reached a terminal state.
    #[error("post is {0} and cannot be cancelled")]
    NotCancellable(PostState),

    /// Purge requested on a post that is still live.
    #[error("post is {0} and cannot be purged")]
    NotTerminal(PostState),

    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Dispatch error.
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}
