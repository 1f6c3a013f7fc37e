//! Store types.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::StoreError;

/// Reason recorded on an attempt whose platform has no active account.
pub const REASON_NO_ACCOUNT: &str = "no_account";

/// Reason recorded by the reaper on attempts whose lease ran out.
pub const REASON_LEASE_EXPIRED: &str = "lease_expired";

/// Reason recorded on attempts abandoned by a cancellation.
pub const REASON_CANCELLED: &str = "cancelled";

/// Default retry budget for a platform attempt.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

macro_rules! define_id {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(
                Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
                sqlx::Type,
            )]
            #[serde(transparent)]
            #[sqlx(transparent)]
            pub struct $name(pub Uuid);

            impl $name {
                /// Generate a fresh random id.
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                /// The underlying UUID.
                pub fn as_uuid(&self) -> Uuid {
                    self.0
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    self.0.fmt(f)
                }
            }

            impl FromStr for $name {
                type Err = uuid::Error;

                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    Uuid::parse_str(s).map(Self)
                }
            }

            impl From<Uuid> for $name {
                fn from(id: Uuid) -> Self {
                    Self(id)
                }
            }
        )*
    };
}

define_id! {
    /// Identifier of a scheduled post.
    PostId;
    /// Identifier of a platform attempt.
    AttemptId;
    /// Identifier of a connected social account.
    AccountId;
    /// Identifier of the user owning posts and accounts.
    OwnerId;
    /// Token stamped on an attempt by the worker that claimed it.
    LeaseToken;
}

/// A target social platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitter,
    Instagram,
    Linkedin,
    Facebook,
}

impl Platform {
    /// Every supported platform.
    pub const ALL: [Platform; 4] = [
        Platform::Twitter,
        Platform::Instagram,
        Platform::Linkedin,
        Platform::Facebook,
    ];

    /// The wire tag for this platform.
    pub const fn as_str(self) -> &'static str {
        match self {
            Platform::Twitter => "twitter",
            Platform::Instagram => "instagram",
            Platform::Linkedin => "linkedin",
            Platform::Facebook => "facebook",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unrecognised platform tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown platform: {0}")]
pub struct UnknownPlatform(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "twitter" | "x" => Ok(Platform::Twitter),
            "instagram" => Ok(Platform::Instagram),
            "linkedin" => Ok(Platform::Linkedin),
            "facebook" => Ok(Platform::Facebook),
            _ => Err(UnknownPlatform(s.to_string())),
        }
    }
}

/// Opaque handle to an uploaded media item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaRef(pub String);

impl MediaRef {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a scheduled post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostState {
    Scheduled,
    Dispatching,
    Posted,
    PartiallyFailed,
    Failed,
    Cancelled,
}

/// Allowed post transitions. Terminal states have no outgoing edges.
const POST_TRANSITIONS: &[(PostState, PostState)] = &[
    (PostState::Scheduled, PostState::Dispatching),
    (PostState::Scheduled, PostState::Cancelled),
    (PostState::Dispatching, PostState::Posted),
    (PostState::Dispatching, PostState::PartiallyFailed),
    (PostState::Dispatching, PostState::Failed),
    (PostState::Dispatching, PostState::Cancelled),
];

impl PostState {
    pub const fn as_str(self) -> &'static str {
        match self {
            PostState::Scheduled => "scheduled",
            PostState::Dispatching => "dispatching",
            PostState::Posted => "posted",
            PostState::PartiallyFailed => "partially_failed",
            PostState::Failed => "failed",
            PostState::Cancelled => "cancelled",
        }
    }

    /// Whether the post has reached a final state.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            PostState::Posted | PostState::PartiallyFailed | PostState::Failed | PostState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: PostState) -> bool {
        POST_TRANSITIONS.contains(&(self, next))
    }

    /// Reject transitions missing from the table.
    pub fn check_transition(self, next: PostState) -> Result<(), StoreError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(StoreError::IllegalTransition {
                entity: "post",
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

impl fmt::Display for PostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(PostState::Scheduled),
            "dispatching" => Ok(PostState::Dispatching),
            "posted" => Ok(PostState::Posted),
            "partially_failed" => Ok(PostState::PartiallyFailed),
            "failed" => Ok(PostState::Failed),
            "cancelled" => Ok(PostState::Cancelled),
            other => Err(StoreError::Corrupt(format!("unknown post state: {}", other))),
        }
    }
}

/// State of a single platform attempt.
///
/// The machine has one cycle: `failed_retryable -> in_flight -> failed_retryable`
/// (optionally through `pending`), bounded by the attempt's retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Pending,
    InFlight,
    Succeeded,
    FailedRetryable,
    FailedPermanent,
    Abandoned,
}

/// Allowed attempt transitions.
const ATTEMPT_TRANSITIONS: &[(AttemptState, AttemptState)] = &[
    (AttemptState::Pending, AttemptState::InFlight),
    (AttemptState::Pending, AttemptState::Abandoned),
    (AttemptState::InFlight, AttemptState::Succeeded),
    (AttemptState::InFlight, AttemptState::FailedRetryable),
    (AttemptState::InFlight, AttemptState::FailedPermanent),
    (AttemptState::InFlight, AttemptState::Abandoned),
    (AttemptState::FailedRetryable, AttemptState::Pending),
    (AttemptState::FailedRetryable, AttemptState::InFlight),
    (AttemptState::FailedRetryable, AttemptState::Abandoned),
];

impl AttemptState {
    pub const fn as_str(self) -> &'static str {
        match self {
            AttemptState::Pending => "pending",
            AttemptState::InFlight => "in_flight",
            AttemptState::Succeeded => "succeeded",
            AttemptState::FailedRetryable => "failed_retryable",
            AttemptState::FailedPermanent => "failed_permanent",
            AttemptState::Abandoned => "abandoned",
        }
    }

    /// Whether no further transitions are possible.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            AttemptState::Succeeded | AttemptState::FailedPermanent | AttemptState::Abandoned
        )
    }

    pub fn can_transition_to(self, next: AttemptState) -> bool {
        ATTEMPT_TRANSITIONS.contains(&(self, next))
    }

    /// Reject transitions missing from the table.
    pub fn check_transition(self, next: AttemptState) -> Result<(), StoreError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(StoreError::IllegalTransition {
                entity: "attempt",
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AttemptState::Pending),
            "in_flight" => Ok(AttemptState::InFlight),
            "succeeded" => Ok(AttemptState::Succeeded),
            "failed_retryable" => Ok(AttemptState::FailedRetryable),
            "failed_permanent" => Ok(AttemptState::FailedPermanent),
            "abandoned" => Ok(AttemptState::Abandoned),
            other => Err(StoreError::Corrupt(format!(
                "unknown attempt state: {}",
                other
            ))),
        }
    }
}

/// A user-authored post scheduled for one or more platforms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledPost {
    pub id: PostId,
    pub owner_id: OwnerId,
    pub title: String,
    pub base_content: String,
    pub media_refs: Vec<MediaRef>,
    pub platforms: BTreeSet<Platform>,
    /// Pre-rendered content per platform. Missing platforms use `base_content`.
    pub variants: BTreeMap<Platform, String>,
    pub scheduled_at: DateTime<Utc>,
    /// IANA zone name the author scheduled in. Informational only.
    pub timezone: String,
    pub state: PostState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledPost {
    /// Create a post in the `scheduled` state.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        owner_id: OwnerId,
        title: String,
        base_content: String,
        media_refs: Vec<MediaRef>,
        platforms: BTreeSet<Platform>,
        variants: BTreeMap<Platform, String>,
        scheduled_at: DateTime<Utc>,
        timezone: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PostId::new(),
            owner_id,
            title,
            base_content,
            media_refs,
            platforms,
            variants,
            scheduled_at,
            timezone,
            state: PostState::Scheduled,
            created_at: now,
            updated_at: now,
        }
    }

    /// Content to publish on `platform`.
    pub fn content_for(&self, platform: Platform) -> &str {
        self.variants
            .get(&platform)
            .map(String::as_str)
            .unwrap_or(&self.base_content)
    }

    /// Due within the catch-up window `[now - grace, now]`.
    pub fn is_due(&self, now: DateTime<Utc>, grace: std::time::Duration) -> bool {
        self.state == PostState::Scheduled
            && self.scheduled_at <= now
            && self.scheduled_at >= now - to_chrono(grace)
    }

    /// Missed the catch-up window entirely.
    pub fn is_overdue(&self, now: DateTime<Utc>, grace: std::time::Duration) -> bool {
        self.state == PostState::Scheduled && self.scheduled_at < now - to_chrono(grace)
    }
}

/// One publish try against one platform for one post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformAttempt {
    pub id: AttemptId,
    pub post_id: PostId,
    pub platform: Platform,
    /// `None` when the owner had no active account at dispatch time.
    pub account_id: Option<AccountId>,
    /// Content frozen at dispatch time.
    pub content: String,
    pub media_refs: Vec<MediaRef>,
    pub state: AttemptState,
    pub attempts_used: u32,
    pub max_attempts: u32,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub platform_post_id: Option<String>,
    pub platform_url: Option<String>,
    pub last_error: Option<String>,
    pub lease_token: Option<LeaseToken>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlatformAttempt {
    /// Build the attempt row for a seed. Seeds without an account start out
    /// permanently failed.
    pub fn from_seed(
        post: &ScheduledPost,
        seed: &AttemptSeed,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let (state, last_error) = match seed.account_id {
            Some(_) => (AttemptState::Pending, None),
            None => (
                AttemptState::FailedPermanent,
                Some(REASON_NO_ACCOUNT.to_string()),
            ),
        };

        Self {
            id: AttemptId::new(),
            post_id: post.id,
            platform: seed.platform,
            account_id: seed.account_id,
            content: seed.content.clone(),
            media_refs: post.media_refs.clone(),
            state,
            attempts_used: 0,
            max_attempts,
            next_eligible_at: None,
            platform_post_id: None,
            platform_url: None,
            last_error,
            lease_token: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn retries_left(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts_used)
    }

    /// Whether a claim at `now` would succeed.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            AttemptState::Pending => true,
            AttemptState::FailedRetryable => {
                self.attempts_used < self.max_attempts
                    && self.next_eligible_at.is_none_or(|at| at <= now)
            }
            _ => false,
        }
    }
}

/// Per-platform input to `materialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptSeed {
    pub platform: Platform,
    pub account_id: Option<AccountId>,
    pub content: String,
}

/// Result of recording a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOutcome {
    pub state: AttemptState,
    pub attempts_used: u32,
    pub retries_left: u32,
    /// Set when the attempt will be retried.
    pub next_eligible_at: Option<DateTime<Utc>>,
}

impl RetryOutcome {
    pub fn exhausted(&self) -> bool {
        self.state == AttemptState::Abandoned
    }
}

/// Result of an atomic post cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The post moved to `cancelled`; `abandoned` attempts were flipped.
    Cancelled { previous: PostState, abandoned: usize },
    /// The post was cancelled earlier.
    AlreadyCancelled,
    /// The post already reached another terminal state.
    NotCancellable(PostState),
}

/// A connected account on one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialAccount {
    pub id: AccountId,
    pub owner_id: OwnerId,
    pub platform: Platform,
    pub handle: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_expires_at: DateTime<Utc>,
    pub active: bool,
}

impl SocialAccount {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: self.token_expires_at,
        }
    }
}

/// Access/refresh token tuple for an account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Credentials {
    /// True when the token expires in less than `skew` from `now`.
    pub fn expires_within(&self, now: DateTime<Utc>, skew: std::time::Duration) -> bool {
        self.expires_at - now < to_chrono(skew)
    }
}

// Tokens stay out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Convert a std duration to chrono, saturating at 100 years.
pub fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
