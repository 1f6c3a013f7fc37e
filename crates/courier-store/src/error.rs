//! Error types for the store.

use thiserror::Error;

use crate::types::{AttemptId, OwnerId, Platform, PostId};

/// Errors that can occur when reading or writing posts, attempts and accounts.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Post not found.
    #[error("post not found: {0}")]
    PostNotFound(PostId),

    /// Attempt not found.
    #[error("attempt not found: {0}")]
    AttemptNotFound(AttemptId),

    /// Account missing or inactive.
    #[error("no such account: {0}")]
    AccountNotFound(String),

    /// Materialize was called on a post that already left `scheduled`.
    #[error("post {0} already dispatched")]
    AlreadyDispatched(PostId),

    /// A transition missing from the allowed-transition table.
    #[error("illegal {entity} transition: {from} -> {to}")]
    IllegalTransition {
        entity: &'static str,
        from: &'static str,
        to: &'static str,
    },

    /// The caller no longer holds the attempt's lease.
    #[error("lease mismatch on attempt {0}")]
    LeaseMismatch(AttemptId),

    /// A second active account for the same owner and platform.
    #[error("owner {owner_id} already has an active {platform} account")]
    DuplicateActiveAccount { owner_id: OwnerId, platform: Platform },

    /// A row could not be decoded into a domain value.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Errors caused by a racing writer rather than a broken store.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::AlreadyDispatched(_)
                | StoreError::IllegalTransition { .. }
                | StoreError::LeaseMismatch(_)
        )
    }
}
