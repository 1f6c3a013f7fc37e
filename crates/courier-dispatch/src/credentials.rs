//! Account lookup and single-flight token rotation.

use std::sync::Arc;
use std::time::Duration;

use courier_platforms::PlatformAdapter;
use courier_store::{AccountId, Credentials, OwnerId, Platform, Store, StoreError};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::CredentialError;

/// Reads account credentials and rotates expiring tokens.
///
/// Rotation for a given account is serialised: concurrent callers wait for
/// the first refresh and then observe its result instead of refreshing again.
pub struct CredentialStore {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    refresh_locks: DashMap<AccountId, Arc<Mutex<()>>>,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            refresh_locks: DashMap::new(),
        }
    }

    /// Current token tuple of an active account.
    pub async fn get(&self, account_id: AccountId) -> Result<Credentials, CredentialError> {
        match self.store.get_account(account_id).await {
            Ok(account) => Ok(account.credentials()),
            Err(StoreError::AccountNotFound(_)) => Err(CredentialError::NoSuchAccount(account_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// The owner's active account on `platform`.
    pub async fn resolve(
        &self,
        owner_id: OwnerId,
        platform: Platform,
    ) -> Result<AccountId, CredentialError> {
        self.store
            .active_account(owner_id, platform)
            .await?
            .map(|account| account.id)
            .ok_or(CredentialError::NoActiveAccount { owner_id, platform })
    }

    /// Return credentials valid for at least `skew`, refreshing through
    /// `adapter` when needed.
    #[tracing::instrument(skip(self, adapter), fields(account_id = %account_id))]
    pub async fn refresh_if_needed(
        &self,
        account_id: AccountId,
        platform: Platform,
        adapter: &dyn PlatformAdapter,
        skew: Duration,
    ) -> Result<Credentials, CredentialError> {
        let current = self.load(account_id, platform).await?;
        if !current.expires_within(self.clock.now(), skew) {
            return Ok(current);
        }

        let lock = self
            .refresh_locks
            .entry(account_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.refresh_locked(account_id, platform, adapter, skew)
                .await
        };
        drop(lock);
        self.refresh_locks
            .remove_if(&account_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn refresh_locked(
        &self,
        account_id: AccountId,
        platform: Platform,
        adapter: &dyn PlatformAdapter,
        skew: Duration,
    ) -> Result<Credentials, CredentialError> {
        // Someone else may have rotated while we waited for the lock.
        let current = self.load(account_id, platform).await?;
        if !current.expires_within(self.clock.now(), skew) {
            debug!("credentials already rotated");
            return Ok(current);
        }

        let Some(refresh_token) = current.refresh_token.as_deref() else {
            warn!("token expiring and no refresh token on file");
            return Err(CredentialError::RefreshFailed {
                account_id,
                reason: "missing_refresh_token".to_string(),
            });
        };

        let rotated = adapter.refresh(refresh_token).await.map_err(|e| {
            warn!(error = %e, "token refresh failed");
            CredentialError::RefreshFailed {
                account_id,
                reason: e.to_string(),
            }
        })?;

        self.store.update_credentials(account_id, &rotated).await?;
        info!(expires_at = %rotated.expires_at, "credentials rotated");
        Ok(rotated)
    }

    async fn load(
        &self,
        account_id: AccountId,
        platform: Platform,
    ) -> Result<Credentials, CredentialError> {
        let account = match self.store.get_account(account_id).await {
            Ok(account) => account,
            Err(StoreError::AccountNotFound(_)) => {
                return Err(CredentialError::NoSuchAccount(account_id));
            }
            Err(e) => return Err(e.into()),
        };
        if account.platform != platform {
            return Err(CredentialError::PlatformMismatch {
                account_id,
                expected: platform,
            });
        }
        Ok(account.credentials())
    }
}
