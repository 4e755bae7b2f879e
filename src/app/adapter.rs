//! Dual-source adapter: one read/write capability set over both backends.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{instrument, warn};

use crate::domain::{
    Address, AppError, ConfirmationStatus, MutationParams, QueryKey, QueryKind, QueryValue,
    RecordSource, SearchFilter, SourceKind, SubmissionHandle, User, WriteReceipt,
};

/// Automatic retries for reads that fail at the transport level
pub const DEFAULT_READ_RETRIES: u32 = 1;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Routes each call to the backend named by its [`SourceKind`].
///
/// Reads are retried on transport failures (`read_retries` extra attempts);
/// writes are never retried.
pub struct DualSourceAdapter {
    service: Arc<dyn RecordSource>,
    ledger: Arc<dyn RecordSource>,
    read_retries: u32,
    retry_delay: Duration,
}

impl DualSourceAdapter {
    #[must_use]
    pub fn new(service: Arc<dyn RecordSource>, ledger: Arc<dyn RecordSource>) -> Self {
        Self {
            service,
            ledger,
            read_retries: DEFAULT_READ_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    #[must_use]
    pub fn with_retry(mut self, read_retries: u32, retry_delay: Duration) -> Self {
        self.read_retries = read_retries;
        self.retry_delay = retry_delay;
        self
    }

    #[must_use]
    pub fn source(&self, kind: SourceKind) -> &Arc<dyn RecordSource> {
        match kind {
            SourceKind::Service => &self.service,
            SourceKind::Ledger => &self.ledger,
        }
    }

    /// Run a read, retrying transport failures up to `read_retries` times.
    async fn with_read_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut last_error = None;
        for attempt in 0..=self.read_retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    warn!(attempt = attempt, error = %e, operation = %operation, "Read failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            AppError::NotSupported(format!("{operation} attempted zero times"))
        }))
    }

    #[instrument(skip(self), fields(address = %key))]
    pub async fn fetch_by_key(
        &self,
        source: SourceKind,
        key: &Address,
    ) -> Result<Option<User>, AppError> {
        let backend = self.source(source);
        self.with_read_retry("fetch_by_key", || backend.fetch_by_key(key))
            .await
    }

    #[instrument(skip(self))]
    pub async fn search(
        &self,
        source: SourceKind,
        filter: &SearchFilter,
    ) -> Result<Vec<User>, AppError> {
        let backend = self.source(source);
        self.with_read_retry("search", || backend.search(filter)).await
    }

    #[instrument(skip(self))]
    pub async fn list_users(
        &self,
        source: SourceKind,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<User>, AppError> {
        let backend = self.source(source);
        self.with_read_retry("list_users", || backend.list_users(offset, limit))
            .await
    }

    #[instrument(skip(self))]
    pub async fn total_users(&self, source: SourceKind) -> Result<u64, AppError> {
        let backend = self.source(source);
        self.with_read_retry("total_users", || backend.total_users())
            .await
    }

    /// Execute the read a cache key describes.
    pub async fn fetch(&self, key: &QueryKey) -> Result<QueryValue, AppError> {
        match &key.query {
            QueryKind::UserByKey(address) => self
                .fetch_by_key(key.source, address)
                .await
                .map(QueryValue::User),
            QueryKind::Search(filter) => self.search(key.source, filter).await.map(QueryValue::Users),
            QueryKind::UserPage { offset, limit } => self
                .list_users(key.source, *offset, *limit)
                .await
                .map(QueryValue::Users),
            QueryKind::TotalUsers => self.total_users(key.source).await.map(QueryValue::Count),
        }
    }

    /// Submit a write. Never retried.
    #[instrument(skip(self, params), fields(kind = %params.kind()))]
    pub async fn submit_write(
        &self,
        source: SourceKind,
        initiator: &Address,
        params: &MutationParams,
    ) -> Result<WriteReceipt, AppError> {
        self.source(source).submit_write(initiator, params).await
    }

    pub async fn poll_confirmation(
        &self,
        source: SourceKind,
        handle: &SubmissionHandle,
    ) -> Result<ConfirmationStatus, AppError> {
        self.source(source).poll_confirmation(handle).await
    }

    pub async fn await_confirmation(
        &self,
        source: SourceKind,
        handle: &SubmissionHandle,
        timeout: Duration,
    ) -> Result<ConfirmationStatus, AppError> {
        self.source(source)
            .await_confirmation(handle, timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BackendError, Role};
    use crate::test_utils::MockSource;
    use std::str::FromStr;

    fn addr() -> Address {
        Address::from_str("0x1111111111111111111111111111111111111111").unwrap()
    }

    fn adapter(service: Arc<MockSource>, ledger: Arc<MockSource>) -> DualSourceAdapter {
        DualSourceAdapter::new(service as _, ledger as _).with_retry(1, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_routes_by_source_kind() {
        let service = Arc::new(MockSource::service());
        let ledger = Arc::new(MockSource::ledger());
        ledger.insert_user(User::new("l1", addr(), Role::Mentor, "On chain"));

        let adapter = adapter(Arc::clone(&service), Arc::clone(&ledger));

        assert!(adapter
            .fetch_by_key(SourceKind::Service, &addr())
            .await
            .unwrap()
            .is_none());
        let user = adapter
            .fetch_by_key(SourceKind::Ledger, &addr())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.name, "On chain");
        assert_eq!(service.fetch_calls(), 1);
        assert_eq!(ledger.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_read_retried_once_on_transport_failure() {
        let service = Arc::new(MockSource::service());
        service.fail_next_reads(1, BackendError::Unreachable("blip".to_string()));
        let adapter = adapter(Arc::clone(&service), Arc::new(MockSource::ledger()));

        let result = adapter.fetch_by_key(SourceKind::Service, &addr()).await;
        assert!(result.is_ok());
        assert_eq!(service.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn test_read_gives_up_after_retry_budget() {
        let service = Arc::new(MockSource::service());
        service.fail_next_reads(5, BackendError::Unreachable("down".to_string()));
        let adapter = adapter(Arc::clone(&service), Arc::new(MockSource::ledger()));

        let result = adapter.fetch_by_key(SourceKind::Service, &addr()).await;
        assert!(matches!(
            result,
            Err(AppError::Backend(BackendError::Unreachable(_)))
        ));
        assert_eq!(service.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let service = Arc::new(MockSource::service());
        service.fail_next_reads(
            1,
            BackendError::Rejected {
                status: 422,
                message: "bad".to_string(),
            },
        );
        let adapter = adapter(Arc::clone(&service), Arc::new(MockSource::ledger()));

        let result = adapter.search(SourceKind::Service, &SearchFilter::default()).await;
        assert!(matches!(
            result,
            Err(AppError::Backend(BackendError::Rejected { .. }))
        ));
        assert_eq!(service.search_calls(), 1);
    }

    #[tokio::test]
    async fn test_sub_second_confirmation_timeout_honoured() {
        let ledger = Arc::new(MockSource::ledger());
        ledger.script_confirmation(u32::MAX, ConfirmationStatus::Confirmed);
        let adapter = adapter(Arc::new(MockSource::service()), Arc::clone(&ledger));
        let handle = SubmissionHandle("0xslow".to_string());

        let started = tokio::time::Instant::now();
        let status = adapter
            .await_confirmation(SourceKind::Ledger, &handle, Duration::from_millis(40))
            .await
            .unwrap();

        assert_eq!(status, ConfirmationStatus::Pending);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(ledger.poll_calls() > 1);
    }

    #[tokio::test]
    async fn test_writes_are_never_retried() {
        let service = Arc::new(MockSource::service());
        service.fail_next_writes(1, BackendError::Unreachable("down".to_string()));
        let adapter = adapter(Arc::clone(&service), Arc::new(MockSource::ledger()));

        let params = MutationParams::Register(crate::domain::RegisterParams::new(
            "Ada",
            Role::Mentor,
        ));
        let result = adapter
            .submit_write(SourceKind::Service, &addr(), &params)
            .await;
        assert!(result.is_err());
        assert_eq!(service.submit_calls(), 1);
    }

    #[tokio::test]
    async fn test_fetch_dispatches_query_kinds() {
        let ledger = Arc::new(MockSource::ledger());
        ledger.insert_user(User::new("l1", addr(), Role::Mentor, "Ada"));
        let adapter = adapter(Arc::new(MockSource::service()), Arc::clone(&ledger));

        let total = adapter
            .fetch(&QueryKey::total(SourceKind::Ledger))
            .await
            .unwrap();
        assert_eq!(total, QueryValue::Count(1));

        let page = adapter
            .fetch(&QueryKey::page(SourceKind::Ledger, 0, 10))
            .await
            .unwrap()
            .into_users()
            .unwrap();
        assert_eq!(page.len(), 1);
    }
}
