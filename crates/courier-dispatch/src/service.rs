//! Caller-facing operations: submit, cancel, inspect and subscribe.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use courier_platforms::AdapterRegistry;
use courier_store::{
    CancelOutcome, MediaRef, OwnerId, Platform, PlatformAttempt, PostId, ScheduledPost, Store,
    StoreError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::clock::Clock;
use crate::credentials::CredentialStore;
use crate::error::{CredentialError, SubmitError};
use crate::events::{EventHub, EventKind, LifecycleEvent, Subscription};
use crate::rollup::RollupCoordinator;

/// A post submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPost {
    pub owner_id: OwnerId,
    pub title: String,
    pub base_content: String,
    #[serde(default)]
    pub media_refs: Vec<MediaRef>,
    /// Platform tags, e.g. `"twitter"`.
    pub platforms: Vec<String>,
    /// Pre-rendered content keyed by platform tag.
    #[serde(default)]
    pub variants: BTreeMap<String, String>,
    pub scheduled_at: DateTime<Utc>,
    /// IANA zone name, defaults to `UTC`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Reject up front if any platform's validation would fail.
    #[serde(default)]
    pub pre_validate: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// A post and its platform attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostWithAttempts {
    pub post: ScheduledPost,
    pub attempts: Vec<PlatformAttempt>,
}

/// The service surface of the dispatch core.
#[derive(Clone)]
pub struct Courier {
    store: Arc<dyn Store>,
    registry: Arc<AdapterRegistry>,
    credentials: Arc<CredentialStore>,
    rollup: Arc<RollupCoordinator>,
    events: Arc<EventHub>,
    clock: Arc<dyn Clock>,
}

impl Courier {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<AdapterRegistry>,
        credentials: Arc<CredentialStore>,
        rollup: Arc<RollupCoordinator>,
        events: Arc<EventHub>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            credentials,
            rollup,
            events,
            clock,
        }
    }

    /// Validate and persist a new post in the `scheduled` state.
    #[tracing::instrument(skip(self, request), fields(owner_id = %request.owner_id))]
    pub async fn submit_post(&self, request: NewPost) -> Result<PostId, SubmitError> {
        let now = self.clock.now();

        if request.base_content.trim().is_empty() {
            return Err(SubmitError::InvalidInput(
                "base_content must not be empty".to_string(),
            ));
        }
        if request.platforms.is_empty() {
            return Err(SubmitError::InvalidInput(
                "at least one platform is required".to_string(),
            ));
        }
        if request.scheduled_at <= now {
            return Err(SubmitError::InvalidSchedule(format!(
                "scheduled_at {} is not in the future",
                request.scheduled_at
            )));
        }
        if request.timezone.parse::<Tz>().is_err() {
            return Err(SubmitError::InvalidInput(format!(
                "unknown timezone: {}",
                request.timezone
            )));
        }

        let platforms = request
            .platforms
            .iter()
            .map(|tag| parse_platform(tag))
            .collect::<Result<BTreeSet<_>, _>>()?;

        let mut variants = BTreeMap::new();
        for (tag, content) in request.variants {
            let platform = parse_platform(&tag)?;
            if !platforms.contains(&platform) {
                return Err(SubmitError::InvalidInput(format!(
                    "variant for {} which is not a target platform",
                    platform
                )));
            }
            variants.insert(platform, content);
        }

        for &platform in &platforms {
            match self.credentials.resolve(request.owner_id, platform).await {
                Ok(_) => {}
                Err(CredentialError::NoActiveAccount { .. }) => {
                    return Err(SubmitError::NoActiveAccount(platform));
                }
                Err(CredentialError::Store(e)) => return Err(e.into()),
                Err(e) => return Err(SubmitError::InvalidInput(e.to_string())),
            }
        }

        let post = ScheduledPost::new(
            request.owner_id,
            request.title,
            request.base_content,
            request.media_refs,
            platforms,
            variants,
            request.scheduled_at,
            request.timezone,
            now,
        );

        if request.pre_validate {
            self.pre_validate(&post)?;
        }

        self.store.insert_post(&post).await?;
        info!(post_id = %post.id, scheduled_at = %post.scheduled_at, "post scheduled");

        let platform_tags: Vec<&str> = post.platforms.iter().map(|p| p.as_str()).collect();
        self.events.publish(LifecycleEvent::post(
            EventKind::Scheduled,
            post.owner_id,
            post.id,
            json!({ "scheduled_at": post.scheduled_at, "platforms": platform_tags }),
            now,
        ));
        Ok(post.id)
    }

    fn pre_validate(&self, post: &ScheduledPost) -> Result<(), SubmitError> {
        for &platform in &post.platforms {
            let adapter = self
                .registry
                .get(platform)
                .map_err(|e| SubmitError::ValidationRejected(platform, e.reason().to_string()))?;
            let rendered = adapter
                .optimize(post.content_for(platform), &post.media_refs)
                .render(&post.media_refs);
            adapter.validate(&rendered).map_err(|violation| {
                SubmitError::ValidationRejected(platform, violation.reason().to_string())
            })?;
        }
        Ok(())
    }

    /// Cancel a post. Cancelling twice is not an error.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_post(&self, owner_id: OwnerId, post_id: PostId) -> Result<(), SubmitError> {
        self.owned_post(owner_id, post_id).await?;
        match self.rollup.cancel(post_id).await? {
            CancelOutcome::Cancelled { .. } | CancelOutcome::AlreadyCancelled => Ok(()),
            CancelOutcome::NotCancellable(state) => Err(SubmitError::NotCancellable(state)),
        }
    }

    pub async fn get_post(
        &self,
        owner_id: OwnerId,
        post_id: PostId,
    ) -> Result<PostWithAttempts, SubmitError> {
        let post = self.owned_post(owner_id, post_id).await?;
        let attempts = self.store.attempts_for(post_id).await?;
        Ok(PostWithAttempts { post, attempts })
    }

    /// Delete a finished post and its attempts.
    pub async fn purge_post(&self, owner_id: OwnerId, post_id: PostId) -> Result<(), SubmitError> {
        let post = self.owned_post(owner_id, post_id).await?;
        if !post.state.is_terminal() {
            return Err(SubmitError::NotTerminal(post.state));
        }
        self.store.purge_post(post_id).await?;
        info!(post_id = %post_id, "post purged");
        Ok(())
    }

    pub fn subscribe(&self, owner_id: OwnerId) -> Subscription {
        self.events.subscribe(owner_id)
    }

    async fn owned_post(
        &self,
        owner_id: OwnerId,
        post_id: PostId,
    ) -> Result<ScheduledPost, SubmitError> {
        match self.store.get_post(post_id).await {
            Ok(post) if post.owner_id == owner_id => Ok(post),
            Ok(_) | Err(StoreError::PostNotFound(_)) => Err(SubmitError::NotFound),
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_platform(tag: &str) -> Result<Platform, SubmitError> {
    tag.parse()
        .map_err(|_| SubmitError::UnknownPlatform(tag.to_string()))
}
