//! Mock implementations for testing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::domain::{
    Address, AppError, BackendError, ConfirmationStatus, MutationParams, NotificationLevel,
    NotificationSink, RecordSource, SearchFilter, SourceKind, SubmissionHandle, User, WriteReceipt,
};

/// Chain id the mock ledger reports unless told otherwise
pub const MOCK_CHAIN_ID: u64 = 1043;

/// Configuration for mock behavior
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub should_fail: bool,
    pub error_message: Option<String>,
}

impl MockConfig {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            should_fail: true,
            error_message: Some(message.into()),
        }
    }
}

/// In-memory backend that behaves like either the service or the ledger.
///
/// Service mode settles writes immediately; ledger mode hands back a
/// submission handle whose confirmation is scripted with
/// [`MockSource::script_confirmation`].
pub struct MockSource {
    kind: SourceKind,
    users: Arc<Mutex<Vec<User>>>,
    config: MockConfig,
    is_healthy: AtomicBool,
    delay: Mutex<Option<Duration>>,
    search_delay: Mutex<Option<Duration>>,
    read_failures: Mutex<Option<(u32, BackendError)>>,
    write_failures: Mutex<Option<(u32, BackendError)>>,
    pending_polls: AtomicU32,
    final_confirmation: Mutex<ConfirmationStatus>,
    chain_id: AtomicU64,
    next_id: AtomicU64,
    fetch_calls: AtomicUsize,
    search_calls: AtomicUsize,
    list_calls: AtomicUsize,
    submit_calls: AtomicUsize,
    poll_calls: AtomicUsize,
}

impl MockSource {
    #[must_use]
    pub fn new(kind: SourceKind) -> Self {
        Self::with_config(kind, MockConfig::success())
    }

    #[must_use]
    pub fn service() -> Self {
        Self::new(SourceKind::Service)
    }

    #[must_use]
    pub fn ledger() -> Self {
        Self::new(SourceKind::Ledger)
    }

    #[must_use]
    pub fn with_config(kind: SourceKind, config: MockConfig) -> Self {
        Self {
            kind,
            users: Arc::new(Mutex::new(Vec::new())),
            config,
            is_healthy: AtomicBool::new(true),
            delay: Mutex::new(None),
            search_delay: Mutex::new(None),
            read_failures: Mutex::new(None),
            write_failures: Mutex::new(None),
            pending_polls: AtomicU32::new(0),
            final_confirmation: Mutex::new(ConfirmationStatus::Confirmed),
            chain_id: AtomicU64::new(MOCK_CHAIN_ID),
            next_id: AtomicU64::new(1),
            fetch_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            submit_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn failing(kind: SourceKind, message: impl Into<String>) -> Self {
        Self::with_config(kind, MockConfig::failure(message))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn set_chain_id(&self, chain_id: u64) {
        self.chain_id.store(chain_id, Ordering::Relaxed);
    }

    /// Delay every call by `delay`
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Delay searches only, overriding [`MockSource::set_delay`] for them
    pub fn set_search_delay(&self, delay: Duration) {
        *self.search_delay.lock().unwrap() = Some(delay);
    }

    /// Fail the next `count` reads with `error`
    pub fn fail_next_reads(&self, count: u32, error: BackendError) {
        *self.read_failures.lock().unwrap() = Some((count, error));
    }

    /// Fail the next `count` writes with `error`
    pub fn fail_next_writes(&self, count: u32, error: BackendError) {
        *self.write_failures.lock().unwrap() = Some((count, error));
    }

    /// Report `pending` unconfirmed polls, then `outcome` from then on
    pub fn script_confirmation(&self, pending: u32, outcome: ConfirmationStatus) {
        self.pending_polls.store(pending, Ordering::SeqCst);
        *self.final_confirmation.lock().unwrap() = outcome;
    }

    /// Insert or replace the record for the user's address
    pub fn insert_user(&self, user: User) {
        let mut users = self.users.lock().unwrap();
        match users
            .iter_mut()
            .find(|u| u.wallet_address == user.wallet_address)
        {
            Some(existing) => *existing = user,
            None => users.push(user),
        }
    }

    pub fn get_all_users(&self) -> Vec<User> {
        self.users.lock().unwrap().clone()
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            let msg = self
                .config
                .error_message
                .clone()
                .unwrap_or_else(|| "Mock error".to_string());
            return Err(AppError::Backend(BackendError::Unreachable(msg)));
        }
        Ok(())
    }

    fn take_failure(slot: &Mutex<Option<(u32, BackendError)>>) -> Result<(), AppError> {
        let mut slot = slot.lock().unwrap();
        if let Some((remaining, error)) = slot.as_mut() {
            let error = error.clone();
            *remaining -= 1;
            if *remaining == 0 {
                *slot = None;
            }
            return Err(AppError::Backend(error));
        }
        Ok(())
    }

    fn check_read(&self) -> Result<(), AppError> {
        self.check_should_fail()?;
        Self::take_failure(&self.read_failures)
    }

    fn check_write(&self) -> Result<(), AppError> {
        self.check_should_fail()?;
        Self::take_failure(&self.write_failures)
    }

    fn require_ledger(&self, operation: &str) -> Result<(), AppError> {
        if self.kind != SourceKind::Ledger {
            return Err(AppError::NotSupported(format!(
                "{operation} not implemented for {} backend",
                self.kind
            )));
        }
        Ok(())
    }

    fn handle(&self) -> SubmissionHandle {
        SubmissionHandle(format!(
            "0x{:064x}",
            self.next_id.fetch_add(1, Ordering::SeqCst)
        ))
    }
}

#[async_trait]
impl RecordSource for MockSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Backend(BackendError::Unreachable(
                "Unhealthy".to_string(),
            )));
        }
        self.check_should_fail()
    }

    async fn fetch_by_key(&self, key: &Address) -> Result<Option<User>, AppError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.check_read()?;
        let users = self.users.lock().unwrap();
        Ok(users.iter().find(|u| &u.wallet_address == key).cloned())
    }

    /// Answers from the records as they were when the request arrived
    async fn search(&self, filter: &SearchFilter) -> Result<Vec<User>, AppError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let users = self.users.lock().unwrap().clone();
        let delay = *self.search_delay.lock().unwrap();
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => self.pause().await,
        }
        self.check_read()?;
        Ok(filter.apply(users))
    }

    async fn submit_write(
        &self,
        initiator: &Address,
        params: &MutationParams,
    ) -> Result<WriteReceipt, AppError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.check_write()?;

        match params {
            MutationParams::Register(register) => {
                let mut users = self.users.lock().unwrap();
                if users.iter().any(|u| &u.wallet_address == initiator) {
                    return Err(AppError::Backend(BackendError::Rejected {
                        status: 400,
                        message: "User with this wallet address already exists".to_string(),
                    }));
                }
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let mut user = User::new(
                    id.to_string(),
                    initiator.clone(),
                    register.role,
                    &register.name,
                );
                user.email = register.email.clone();
                users.push(user.clone());
                drop(users);

                match self.kind {
                    SourceKind::Service => Ok(WriteReceipt::Settled(Some(user))),
                    SourceKind::Ledger => Ok(WriteReceipt::Pending(self.handle())),
                }
            }
            MutationParams::ConfirmMentorship { .. } => {
                self.require_ledger("confirm_mentorship")?;
                let mut users = self.users.lock().unwrap();
                if let Some(mentor) = users.iter_mut().find(|u| &u.wallet_address == initiator) {
                    mentor.reputation += 1;
                }
                drop(users);
                Ok(WriteReceipt::Pending(self.handle()))
            }
        }
    }

    async fn poll_confirmation(
        &self,
        handle: &SubmissionHandle,
    ) -> Result<ConfirmationStatus, AppError> {
        self.require_ledger("poll_confirmation")?;
        let _ = handle;
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        self.check_should_fail()?;
        let pending = self
            .pending_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if pending {
            return Ok(ConfirmationStatus::Pending);
        }
        Ok(self.final_confirmation.lock().unwrap().clone())
    }

    async fn await_confirmation(
        &self,
        handle: &SubmissionHandle,
        timeout: Duration,
    ) -> Result<ConfirmationStatus, AppError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.poll_confirmation(handle).await?;
            if status != ConfirmationStatus::Pending || tokio::time::Instant::now() >= deadline {
                return Ok(status);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn list_users(&self, offset: u64, limit: u64) -> Result<Vec<User>, AppError> {
        self.require_ledger("list_users")?;
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.check_read()?;
        let users = self.users.lock().unwrap();
        Ok(users
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn total_users(&self) -> Result<u64, AppError> {
        self.require_ledger("total_users")?;
        self.pause().await;
        self.check_read()?;
        Ok(self.users.lock().unwrap().len() as u64)
    }

    async fn chain_id(&self) -> Result<u64, AppError> {
        self.require_ledger("chain_id")?;
        self.check_should_fail()?;
        Ok(self.chain_id.load(Ordering::Relaxed))
    }
}

/// Notification sink that remembers everything it was told
#[derive(Debug, Default)]
pub struct RecordingSink {
    entries: Mutex<Vec<(NotificationLevel, String)>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(NotificationLevel, String)> {
        self.entries.lock().unwrap().clone()
    }

    pub fn levels(&self) -> Vec<NotificationLevel> {
        self.entries().into_iter().map(|(level, _)| level).collect()
    }

    fn messages_at(&self, wanted: NotificationLevel) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(level, _)| *level == wanted)
            .map(|(_, message)| message)
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.messages_at(NotificationLevel::Error)
    }

    pub fn successes(&self) -> Vec<String> {
        self.messages_at(NotificationLevel::Success)
    }

    pub fn infos(&self) -> Vec<String> {
        self.messages_at(NotificationLevel::Info)
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, level: NotificationLevel, message: &str) {
        self.entries
            .lock()
            .unwrap()
            .push((level, message.to_string()));
    }
}

/// Build a user with a deterministic address derived from `n`
#[must_use]
pub fn sample_user(n: u8, role: crate::domain::Role, name: &str) -> User {
    let address: Address = format!("0x{}", format!("{n:02x}").repeat(20))
        .parse()
        .unwrap();
    User::new(n.to_string(), address, role, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RegisterParams, Role};

    #[tokio::test]
    async fn test_scripted_confirmation() {
        let ledger = MockSource::ledger();
        ledger.script_confirmation(1, ConfirmationStatus::Confirmed);
        let handle = SubmissionHandle("0x1".to_string());

        assert_eq!(
            ledger.poll_confirmation(&handle).await.unwrap(),
            ConfirmationStatus::Pending
        );
        assert_eq!(
            ledger.poll_confirmation(&handle).await.unwrap(),
            ConfirmationStatus::Confirmed
        );
        assert_eq!(ledger.poll_calls(), 2);
    }

    #[tokio::test]
    async fn test_service_mode_settles_and_rejects_duplicates() {
        let service = MockSource::service();
        let me = sample_user(1, Role::Mentor, "Ada").wallet_address;
        let params = MutationParams::Register(RegisterParams::new("Ada", Role::Mentor));

        let receipt = service.submit_write(&me, &params).await.unwrap();
        assert!(matches!(receipt, WriteReceipt::Settled(Some(_))));

        let again = service.submit_write(&me, &params).await;
        assert!(matches!(
            again,
            Err(AppError::Backend(BackendError::Rejected { status: 400, .. }))
        ));
    }

    #[tokio::test]
    async fn test_failing_mock() {
        let source = MockSource::failing(SourceKind::Service, "boom");
        assert!(source.health_check().await.is_err());
        assert!(source.search(&SearchFilter::default()).await.is_err());
    }
}
