//! Profile service: the read and write surface callers use.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use super::adapter::DualSourceAdapter;
use super::cache::{QueryCache, QueryObserver};
use super::mutation::{MutationCoordinator, MutationHandle};
use crate::domain::{
    Address, AppError, HealthResponse, HealthStatus, IdentityResolver, LedgerStatus,
    MutationParams, QueryKey, ReadOptions, RegisterParams, SearchFilter, SourceKind, User,
};

/// Cached reads plus coordinated writes over both backends
pub struct ProfileService {
    adapter: Arc<DualSourceAdapter>,
    cache: QueryCache,
    coordinator: MutationCoordinator,
    identity: Arc<dyn IdentityResolver>,
    expected_chain_id: u64,
    contract_deployed: bool,
}

impl ProfileService {
    #[must_use]
    pub fn new(
        adapter: Arc<DualSourceAdapter>,
        cache: QueryCache,
        coordinator: MutationCoordinator,
        identity: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self {
            adapter,
            cache,
            coordinator,
            identity,
            expected_chain_id: super::config::DEFAULT_EXPECTED_CHAIN_ID,
            contract_deployed: true,
        }
    }

    /// What the ledger must look like before writes are enabled
    #[must_use]
    pub fn with_ledger_expectations(mut self, expected_chain_id: u64, contract_deployed: bool) -> Self {
        self.expected_chain_id = expected_chain_id;
        self.contract_deployed = contract_deployed;
        self
    }

    #[must_use]
    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    #[must_use]
    pub fn coordinator(&self) -> &MutationCoordinator {
        &self.coordinator
    }

    /// Record of the connected caller. Fails fast without a session.
    #[instrument(skip(self))]
    pub async fn current_user(
        &self,
        source: SourceKind,
        options: ReadOptions,
    ) -> Result<Option<User>, AppError> {
        let key = self.identity.current_identity().require()?;
        self.user_by_address(source, &key, options).await
    }

    /// Whether the connected caller has a record on `source`
    pub async fn is_registered(&self, source: SourceKind) -> Result<bool, AppError> {
        Ok(self
            .current_user(source, ReadOptions::stale_tolerant())
            .await?
            .is_some())
    }

    #[instrument(skip(self), fields(address = %address))]
    pub async fn user_by_address(
        &self,
        source: SourceKind,
        address: &Address,
        options: ReadOptions,
    ) -> Result<Option<User>, AppError> {
        self.cache
            .read(&QueryKey::user(source, address.clone()), options)
            .await?
            .into_user()
    }

    #[instrument(skip(self))]
    pub async fn search_users(
        &self,
        source: SourceKind,
        filter: &SearchFilter,
        options: ReadOptions,
    ) -> Result<Vec<User>, AppError> {
        let users = self
            .cache
            .read(&QueryKey::search(source, filter), options)
            .await?
            .into_users()?;
        debug!(count = users.len(), "Search resolved");
        Ok(users)
    }

    #[instrument(skip(self))]
    pub async fn list_users(
        &self,
        source: SourceKind,
        offset: u64,
        limit: u64,
        options: ReadOptions,
    ) -> Result<Vec<User>, AppError> {
        self.cache
            .read(&QueryKey::page(source, offset, limit), options)
            .await?
            .into_users()
    }

    #[instrument(skip(self))]
    pub async fn total_users(&self, source: SourceKind, options: ReadOptions) -> Result<u64, AppError> {
        self.cache
            .read(&QueryKey::total(source), options)
            .await?
            .into_count()
    }

    /// Observe the connected caller's record so mutations refresh it eagerly.
    pub fn observe_current_user(&self, source: SourceKind) -> Result<QueryObserver, AppError> {
        let key = self.identity.current_identity().require()?;
        Ok(self.cache.observe(QueryKey::user(source, key)))
    }

    pub fn register(
        &self,
        source: SourceKind,
        params: RegisterParams,
    ) -> Result<MutationHandle, AppError> {
        self.coordinator
            .start(source, MutationParams::Register(params))
    }

    pub fn confirm_mentorship(
        &self,
        source: SourceKind,
        mentee: Address,
    ) -> Result<MutationHandle, AppError> {
        self.coordinator
            .start(source, MutationParams::ConfirmMentorship { mentee })
    }

    /// Session and backend readiness
    #[instrument(skip(self))]
    pub async fn status(&self) -> HealthResponse {
        let service = self.adapter.source(SourceKind::Service);
        let ledger = self.adapter.source(SourceKind::Ledger);

        let (service_health, ledger_health, chain_id) = tokio::join!(
            service.health_check(),
            ledger.health_check(),
            ledger.chain_id()
        );

        let service_status = match service_health {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => {
                warn!(error = %e, "Service backend unhealthy");
                HealthStatus::Unhealthy
            }
        };

        let chain_id = match chain_id {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "Could not read ledger chain id");
                None
            }
        };

        let ledger_status = LedgerStatus {
            reachable: ledger_health.is_ok(),
            chain_id,
            expected_chain_id: self.expected_chain_id,
            contract_deployed: self.contract_deployed,
        };

        HealthResponse::new(
            self.identity.current_identity().require().is_ok(),
            service_status,
            ledger_status,
        )
    }
}
