//! Application state management.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use super::adapter::{DEFAULT_RETRY_DELAY, DualSourceAdapter};
use super::cache::QueryCache;
use super::config::SyncConfig;
use super::mutation::MutationCoordinator;
use super::service::ProfileService;
use crate::domain::{AppError, IdentityResolver, NotificationSink, RecordSource};
use crate::infra::{LedgerSource, ServiceSource, TracingNotificationSink, WalletSession};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub profiles: Arc<ProfileService>,
    pub cache: QueryCache,
    pub coordinator: MutationCoordinator,
    pub service_source: Arc<dyn RecordSource>,
    pub ledger_source: Arc<dyn RecordSource>,
    pub identity: Arc<dyn IdentityResolver>,
    pub notifications: Arc<dyn NotificationSink>,
}

impl AppState {
    /// Wire the cache, coordinator and profile service over two backends
    #[must_use]
    pub fn new(
        service_source: Arc<dyn RecordSource>,
        ledger_source: Arc<dyn RecordSource>,
        identity: Arc<dyn IdentityResolver>,
        notifications: Arc<dyn NotificationSink>,
        config: &SyncConfig,
    ) -> Self {
        let adapter = Arc::new(
            DualSourceAdapter::new(Arc::clone(&service_source), Arc::clone(&ledger_source))
                .with_retry(config.read_retries, DEFAULT_RETRY_DELAY),
        );
        let cache = QueryCache::with_gc_window(
            Arc::clone(&adapter),
            config.stale_policy,
            config.cache_gc_window,
            Arc::clone(&notifications),
        );
        let coordinator = MutationCoordinator::new(
            Arc::clone(&adapter),
            cache.clone(),
            Arc::clone(&identity),
            Arc::clone(&notifications),
        )
        .with_confirmation_timeout(config.confirmation_timeout);
        let profiles = Arc::new(
            ProfileService::new(
                adapter,
                cache.clone(),
                coordinator.clone(),
                Arc::clone(&identity),
            )
            .with_ledger_expectations(config.expected_chain_id, config.contract_deployed()),
        );

        Self {
            profiles,
            cache,
            coordinator,
            service_source,
            ledger_source,
            identity,
            notifications,
        }
    }

    /// Build the HTTP backends described by `config`
    pub fn from_config(config: &SyncConfig, session: Arc<WalletSession>) -> Result<Self, AppError> {
        let service = ServiceSource::new(&config.service_api_url, config.request_timeout)?;
        let ledger = LedgerSource::new(
            &config.ledger_rpc_url,
            config
                .ledger_api_key
                .as_ref()
                .map(|key| SecretString::from(key.expose_secret().to_string())),
            config.contract_address.clone(),
            config.ledger_client_config(),
        )?;
        info!(
            service = %config.service_api_url,
            ledger = %config.ledger_rpc_url,
            contract_deployed = config.contract_deployed(),
            "Backends configured"
        );

        Ok(Self::new(
            Arc::new(service),
            Arc::new(ledger),
            session,
            Arc::new(TracingNotificationSink),
            config,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ReadOptions, SourceKind};
    use crate::test_utils::{MockSource, RecordingSink};

    #[tokio::test]
    async fn test_state_shares_one_cache() {
        let state = AppState::new(
            Arc::new(MockSource::service()),
            Arc::new(MockSource::ledger()),
            Arc::new(WalletSession::new()),
            Arc::new(RecordingSink::new()),
            &SyncConfig::default(),
        );

        state
            .profiles
            .total_users(SourceKind::Ledger, ReadOptions::fresh())
            .await
            .unwrap();
        assert_eq!(state.cache.len(), 1);
        assert_eq!(state.profiles.cache().len(), 1);
    }

    #[test]
    fn test_from_config_builds_http_backends() {
        let session = Arc::new(WalletSession::new());
        let state = AppState::from_config(&SyncConfig::default(), session).unwrap();
        assert_eq!(state.service_source.kind(), SourceKind::Service);
        assert_eq!(state.ledger_source.kind(), SourceKind::Ledger);
    }
}
