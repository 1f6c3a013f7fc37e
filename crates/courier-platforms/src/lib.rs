//! Platform adapters for Courier.
//!
//! Each supported platform is reached through a [`PlatformAdapter`] with four
//! capabilities: optimize, validate, publish and refresh. Adapters are looked
//! up by platform tag in an [`AdapterRegistry`]. Content limits live in the
//! per-platform [`PlatformRules`] table.

mod adapter;
mod error;
mod http;
mod registry;
mod rules;

pub use adapter::{Optimized, PlatformAdapter, PublishContext, PublishReceipt, Rendered};
pub use error::{AdapterError, PolicyViolation, PublishError, RefreshError};
pub use http::{HttpAdapterConfig, HttpPlatformAdapter};
pub use registry::AdapterRegistry;
pub use rules::{PlatformRules, extract_hashtags, normalize_whitespace};
