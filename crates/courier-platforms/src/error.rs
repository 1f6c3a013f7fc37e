//! Error types for platform adapters.

use std::time::Duration;

use courier_store::Platform;
use thiserror::Error;

/// A hard platform constraint the rendered post breaks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    /// Content longer than the platform allows.
    #[error("content_too_long: {len} chars exceeds {max}")]
    ContentTooLong { len: usize, max: usize },

    /// More media than the platform accepts.
    #[error("too_many_media: {count} items exceeds {max}")]
    TooManyMedia { count: usize, max: usize },

    /// The platform only publishes posts with media.
    #[error("media_required")]
    MediaRequired,

    /// More hashtags than the platform accepts.
    #[error("too_many_hashtags: {count} exceeds {max}")]
    TooManyHashtags { count: usize, max: usize },
}

impl PolicyViolation {
    /// Stable reason tag recorded on the attempt.
    pub fn reason(&self) -> &'static str {
        match self {
            PolicyViolation::ContentTooLong { .. } => "content_too_long",
            PolicyViolation::TooManyMedia { .. } => "too_many_media",
            PolicyViolation::MediaRequired => "media_required",
            PolicyViolation::TooManyHashtags { .. } => "too_many_hashtags",
        }
    }
}

/// Failure of a publish call, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// Worth retrying later (rate limits, upstream outages, network errors).
    #[error("transient: {reason}")]
    Transient {
        reason: String,
        /// Server-provided delay before the next try, if any.
        retry_after: Option<Duration>,
    },

    /// Retrying cannot help (rejected content, revoked access).
    #[error("permanent: {reason}")]
    Permanent { reason: String },
}

impl PublishError {
    pub fn transient(reason: impl Into<String>) -> Self {
        PublishError::Transient {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        PublishError::Permanent {
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, PublishError::Transient { .. })
    }

    pub fn reason(&self) -> &str {
        match self {
            PublishError::Transient { reason, .. } | PublishError::Permanent { reason } => reason,
        }
    }
}

/// Failure to rotate an OAuth token.
#[derive(Debug, Error)]
pub enum RefreshError {
    /// The account has no refresh token.
    #[error("no refresh token")]
    MissingRefreshToken,

    /// The token endpoint rejected the refresh.
    #[error("refresh rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid response from the token endpoint.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Errors from the adapter registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// No adapter is registered for the platform.
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(Platform),
}

impl AdapterError {
    /// Reason tag recorded on the attempt.
    pub fn reason(&self) -> &'static str {
        match self {
            AdapterError::UnsupportedPlatform(_) => "unsupported_platform",
        }
    }
}
