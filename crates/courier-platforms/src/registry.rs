//! Platform tag to adapter lookup.

use std::collections::HashMap;
use std::sync::Arc;

use courier_store::Platform;
use tracing::info;

use crate::adapter::PlatformAdapter;
use crate::error::AdapterError;
use crate::http::{HttpAdapterConfig, HttpPlatformAdapter};

/// Registered adapters, one per platform.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Platform, Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTTP adapters for every platform, configured from the environment.
    pub fn from_env() -> Result<Self, reqwest::Error> {
        let mut registry = Self::new();
        for platform in Platform::ALL {
            let adapter = HttpPlatformAdapter::new(HttpAdapterConfig::from_env(platform))?;
            info!(platform = %platform, api_base = %adapter.config().api_base, "registered adapter");
            registry.register(Arc::new(adapter));
        }
        Ok(registry)
    }

    /// Register `adapter` under its platform, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) -> &mut Self {
        self.adapters.insert(adapter.platform(), adapter);
        self
    }

    pub fn with(mut self, adapter: Arc<dyn PlatformAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, platform: Platform) -> Result<Arc<dyn PlatformAdapter>, AdapterError> {
        self.adapters
            .get(&platform)
            .cloned()
            .ok_or(AdapterError::UnsupportedPlatform(platform))
    }

    pub fn platforms(&self) -> impl Iterator<Item = Platform> + '_ {
        self.adapters.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{PublishContext, PublishReceipt, Rendered};
    use crate::error::{PublishError, RefreshError};
    use async_trait::async_trait;
    use courier_store::Credentials;

    struct Noop(Platform);

    #[async_trait]
    impl PlatformAdapter for Noop {
        fn platform(&self) -> Platform {
            self.0
        }

        async fn publish(
            &self,
            _rendered: &Rendered,
            _credentials: &Credentials,
            _ctx: &PublishContext,
        ) -> Result<PublishReceipt, PublishError> {
            Err(PublishError::permanent("noop"))
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<Credentials, RefreshError> {
            Err(RefreshError::MissingRefreshToken)
        }
    }

    #[test]
    fn test_lookup() {
        let registry = AdapterRegistry::new().with(Arc::new(Noop(Platform::Twitter)));

        assert_eq!(registry.get(Platform::Twitter).unwrap().platform(), Platform::Twitter);
        let err = registry.get(Platform::Instagram).err().unwrap();
        assert_eq!(err, AdapterError::UnsupportedPlatform(Platform::Instagram));
        assert_eq!(err.reason(), "unsupported_platform");
    }

    #[test]
    fn test_default_rules_follow_platform() {
        let adapter = Noop(Platform::Instagram);
        let optimized = adapter.optimize("hello  world", &[]);
        assert_eq!(optimized.content, "hello world");
        assert!(!optimized.valid);
    }

    #[test]
    fn test_from_env_registers_all_platforms() {
        let registry = AdapterRegistry::from_env().unwrap();
        let mut platforms: Vec<_> = registry.platforms().collect();
        platforms.sort();
        assert_eq!(platforms, Platform::ALL.to_vec());
    }
}
