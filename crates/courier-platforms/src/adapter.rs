//! The platform adapter contract.

use async_trait::async_trait;
use courier_store::{AttemptId, Credentials, MediaRef, Platform};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{PolicyViolation, PublishError, RefreshError};
use crate::rules::PlatformRules;

/// Post content as it will be sent to a platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rendered {
    pub content: String,
    pub media_refs: Vec<MediaRef>,
    pub hashtags: Vec<String>,
}

/// Result of tuning content for a platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Optimized {
    pub content: String,
    pub hashtags: Vec<String>,
    pub warnings: Vec<String>,
    /// Whether the rendering passes validation.
    pub valid: bool,
}

impl Optimized {
    pub fn render(self, media_refs: &[MediaRef]) -> Rendered {
        Rendered {
            content: self.content,
            media_refs: media_refs.to_vec(),
            hashtags: self.hashtags,
        }
    }
}

/// A successful publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub platform_post_id: String,
    pub url: Option<String>,
}

/// Per-call context handed to [`PlatformAdapter::publish`].
#[derive(Debug, Clone)]
pub struct PublishContext {
    pub attempt_id: AttemptId,
    /// Stable across every retry of one attempt. Adapters that support it
    /// forward this so the platform can drop a resubmission whose earlier
    /// try landed but was counted as failed.
    pub idempotency_key: String,
    abort: watch::Receiver<bool>,
}

impl PublishContext {
    pub fn new(attempt_id: AttemptId, abort: watch::Receiver<bool>) -> Self {
        Self {
            attempt_id,
            idempotency_key: attempt_id.to_string(),
            abort,
        }
    }

    /// A context that is never aborted.
    pub fn detached(attempt_id: AttemptId) -> Self {
        let (_tx, rx) = watch::channel(false);
        Self::new(attempt_id, rx)
    }

    pub fn is_aborted(&self) -> bool {
        *self.abort.borrow()
    }

    /// Resolves once the call should be abandoned.
    pub async fn aborted(&self) {
        let mut abort = self.abort.clone();
        loop {
            if *abort.borrow_and_update() {
                return;
            }
            if abort.changed().await.is_err() {
                // Sender gone: nobody can abort any more.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Everything the dispatch core needs from a platform.
///
/// `optimize` and `validate` default to the platform's rule book; only
/// `publish` and `refresh` talk to the outside world.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    fn rules(&self) -> &PlatformRules {
        PlatformRules::for_platform(self.platform())
    }

    /// Tune `base` for this platform. Purely computational.
    fn optimize(&self, base: &str, media: &[MediaRef]) -> Optimized {
        self.rules().optimize(base, media)
    }

    /// Check the platform's hard constraints.
    fn validate(&self, rendered: &Rendered) -> Result<(), PolicyViolation> {
        self.rules().validate(rendered)
    }

    /// Publish to the platform. Must return promptly once `ctx` is aborted.
    async fn publish(
        &self,
        rendered: &Rendered,
        credentials: &Credentials,
        ctx: &PublishContext,
    ) -> Result<PublishReceipt, PublishError>;

    /// Rotate an OAuth token pair.
    async fn refresh(&self, refresh_token: &str) -> Result<Credentials, RefreshError>;
}
