//! Mutation coordinator.
//!
//! Drives each write intent `IDLE -> SUBMITTING -> [AWAITING_CONFIRMATION] ->
//! SUCCEEDED | FAILED` on its own task. Cache invalidation and the terminal
//! notification hang off the transition into a terminal state, so they run
//! exactly once per mutation and before the caller observes completion.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::adapter::DualSourceAdapter;
use super::cache::{KeyPattern, QueryCache};
use crate::domain::{
    Address, AppError, BackendError, ConfirmationStatus, IdentityResolver, MutationKind,
    MutationParams, MutationRecord, MutationStatus, NotificationLevel, NotificationSink, QueryKey,
    QueryValue, SourceKind, SubmissionHandle, User, WriteReceipt,
};

/// Default deadline for ledger confirmation
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(60);

type ActiveMutations = DashMap<(Address, MutationKind), Uuid>;

/// Starts mutations and owns their side effects
#[derive(Clone)]
pub struct MutationCoordinator {
    adapter: Arc<DualSourceAdapter>,
    cache: QueryCache,
    identity: Arc<dyn IdentityResolver>,
    notifications: Arc<dyn NotificationSink>,
    confirmation_timeout: Duration,
    active: Arc<ActiveMutations>,
}

impl MutationCoordinator {
    #[must_use]
    pub fn new(
        adapter: Arc<DualSourceAdapter>,
        cache: QueryCache,
        identity: Arc<dyn IdentityResolver>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            adapter,
            cache,
            identity,
            notifications,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            active: Arc::new(DashMap::new()),
        }
    }

    #[must_use]
    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    /// Whether a mutation of `kind` is running for `initiator`
    #[must_use]
    pub fn is_active(&self, initiator: &Address, kind: MutationKind) -> bool {
        self.active.contains_key(&(initiator.clone(), kind))
    }

    /// Begin a mutation against `source`.
    ///
    /// Missing identity, invalid parameters and a missing Tokio runtime produce
    /// a handle that is already `FAILED`; no backend call is made. The only `Err` is
    /// [`AppError::MutationInProgress`], returned when the caller already has a
    /// mutation of the same kind running.
    #[instrument(skip(self, params), fields(kind = %params.kind()))]
    pub fn start(
        &self,
        source: SourceKind,
        params: MutationParams,
    ) -> Result<MutationHandle, AppError> {
        let identity = self.identity.current_identity();
        let params = params.trimmed();
        let mut record = MutationRecord::new(source, identity.key.clone(), params.clone());

        let initiator = match identity.require() {
            Ok(key) => key,
            Err(e) => return Ok(self.reject(record, e)),
        };
        if let Err(e) = params.validate_for(&initiator) {
            return Ok(self.reject(record, e.into()));
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return Ok(self.reject(record, AppError::RuntimeUnavailable));
        };

        let slot = match self.active.entry((initiator.clone(), record.kind)) {
            Entry::Occupied(_) => {
                warn!(initiator = %initiator, "Mutation already in progress");
                return Err(AppError::MutationInProgress {
                    kind: record.kind,
                    initiator,
                });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record.id);
                ActiveSlot {
                    active: Arc::clone(&self.active),
                    key: (initiator.clone(), record.kind),
                }
            }
        };

        record.enter(MutationStatus::Submitting);
        info!(id = %record.id, initiator = %initiator, source = %source, "Mutation submitted");
        self.notifications
            .notify(NotificationLevel::Info, submitted_message(record.kind));

        let (updates, receiver) = watch::channel(record.clone());
        let run = MutationRun {
            coordinator: self.clone(),
            record,
            initiator,
            updates,
            slot: Some(slot),
        };
        runtime.spawn(run.drive());

        Ok(MutationHandle { updates: receiver })
    }

    /// Fail before any I/O and hand back a settled handle
    fn reject(&self, mut record: MutationRecord, error: AppError) -> MutationHandle {
        warn!(id = %record.id, error = %error, "Mutation rejected locally");
        let message = match &error {
            AppError::IdentityRequired => "Please connect your wallet first".to_string(),
            other => other.to_string(),
        };
        record.error = Some(error);
        record.enter(MutationStatus::Failed);
        self.notifications.notify(NotificationLevel::Error, &message);

        let (_, updates) = watch::channel(record);
        MutationHandle { updates }
    }
}

/// Releases the per-caller mutation slot when dropped
struct ActiveSlot {
    active: Arc<ActiveMutations>,
    key: (Address, MutationKind),
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.active.remove(&self.key);
    }
}

/// One mutation in flight
struct MutationRun {
    coordinator: MutationCoordinator,
    record: MutationRecord,
    initiator: Address,
    updates: watch::Sender<MutationRecord>,
    slot: Option<ActiveSlot>,
}

impl MutationRun {
    async fn drive(mut self) {
        let source = self.record.source;
        let receipt = self
            .coordinator
            .adapter
            .submit_write(source, &self.initiator, &self.record.params)
            .await;

        let outcome = match receipt {
            Ok(WriteReceipt::Settled(user)) => Ok(user),
            Ok(WriteReceipt::Pending(handle)) => self.await_confirmation(handle).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(user) => self.succeed(user),
            Err(e) => self.fail(e),
        }
    }

    async fn await_confirmation(&mut self, handle: SubmissionHandle) -> Result<Option<User>, AppError> {
        self.record.result_handle = Some(handle.clone());
        self.transition(MutationStatus::AwaitingConfirmation);
        self.publish();

        let status = self
            .coordinator
            .adapter
            .await_confirmation(
                self.record.source,
                &handle,
                self.coordinator.confirmation_timeout,
            )
            .await?;

        match status {
            ConfirmationStatus::Confirmed => Ok(None),
            ConfirmationStatus::Failed(reason) => {
                Err(AppError::Backend(BackendError::TransactionFailed(reason)))
            }
            ConfirmationStatus::Pending => Err(AppError::Backend(BackendError::Timeout(format!(
                "transaction {handle} not confirmed"
            )))),
        }
    }

    fn transition(&mut self, next: MutationStatus) -> bool {
        if !self.record.status.can_transition_to(next) {
            error!(
                id = %self.record.id,
                from = %self.record.status,
                to = %next,
                "Illegal mutation transition"
            );
            return false;
        }
        self.record.enter(next);
        true
    }

    fn publish(&self) {
        self.updates.send_replace(self.record.clone());
    }

    fn succeed(mut self, user: Option<User>) {
        self.record.result = user;
        if !self.transition(MutationStatus::Succeeded) {
            return;
        }
        info!(id = %self.record.id, kind = %self.record.kind, "Mutation succeeded");

        let source = self.record.source;
        let cache = &self.coordinator.cache;
        if let (MutationParams::Register(_), Some(user)) = (&self.record.params, &self.record.result) {
            cache.write(
                QueryKey::user(source, self.initiator.clone()),
                QueryValue::User(Some(user.clone())),
            );
        }
        for pattern in dependents(source, &self.initiator, &self.record.params) {
            cache.invalidate(&pattern);
        }

        self.slot.take();
        self.coordinator
            .notifications
            .notify(NotificationLevel::Success, success_message(self.record.kind));
        self.publish();
    }

    fn fail(mut self, error: AppError) {
        error!(id = %self.record.id, kind = %self.record.kind, error = %error, "Mutation failed");
        let message = format!("{}: {}", failure_prefix(self.record.kind), error);
        self.record.error = Some(error);
        if !self.transition(MutationStatus::Failed) {
            return;
        }

        self.slot.take();
        self.coordinator
            .notifications
            .notify(NotificationLevel::Error, &message);
        self.publish();
    }
}

/// Cache entries a successful mutation makes stale, scoped to the mutated source
fn dependents(source: SourceKind, initiator: &Address, params: &MutationParams) -> Vec<KeyPattern> {
    match params {
        MutationParams::Register(_) => vec![
            KeyPattern::User {
                source,
                address: initiator.clone(),
            },
            KeyPattern::Listings(source),
            KeyPattern::TotalUsers(source),
        ],
        MutationParams::ConfirmMentorship { mentee } => vec![
            KeyPattern::User {
                source,
                address: initiator.clone(),
            },
            KeyPattern::User {
                source,
                address: mentee.clone(),
            },
            KeyPattern::ListingsMentioning {
                source,
                addresses: vec![initiator.clone(), mentee.clone()],
            },
        ],
    }
}

fn submitted_message(kind: MutationKind) -> &'static str {
    match kind {
        MutationKind::Register => "Registration submitted",
        MutationKind::ConfirmMentorship => "Mentorship confirmation submitted",
    }
}

fn success_message(kind: MutationKind) -> &'static str {
    match kind {
        MutationKind::Register => "Registration successful!",
        MutationKind::ConfirmMentorship => "Mentorship confirmed! Reputation updated.",
    }
}

fn failure_prefix(kind: MutationKind) -> &'static str {
    match kind {
        MutationKind::Register => "Registration failed",
        MutationKind::ConfirmMentorship => "Mentorship confirmation failed",
    }
}

/// Caller's view of a running mutation
#[derive(Clone)]
pub struct MutationHandle {
    updates: watch::Receiver<MutationRecord>,
}

impl MutationHandle {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.updates.borrow().id
    }

    #[must_use]
    pub fn record(&self) -> MutationRecord {
        self.updates.borrow().clone()
    }

    #[must_use]
    pub fn status(&self) -> MutationStatus {
        self.updates.borrow().status
    }

    /// Resolve once the mutation reaches `SUCCEEDED` or `FAILED`.
    pub async fn wait(&self) -> MutationRecord {
        let mut updates = self.updates.clone();
        if let Ok(record) = updates.wait_for(|r| r.status.is_terminal()).await {
            return (*record).clone();
        }
        let record = updates.borrow().clone();
        record
    }

    /// Next published state, or `None` once no further changes can happen
    pub async fn changed(&mut self) -> Option<MutationRecord> {
        self.updates.changed().await.ok()?;
        Some(self.updates.borrow_and_update().clone())
    }
}

impl std::fmt::Debug for MutationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let record = self.updates.borrow();
        f.debug_struct("MutationHandle")
            .field("id", &record.id)
            .field("kind", &record.kind)
            .field("status", &record.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ReadOptions, RegisterParams, Role, SearchFilter, StalePolicy};
    use crate::infra::WalletSession;
    use crate::test_utils::{MockSource, RecordingSink};
    use std::str::FromStr;

    fn addr(n: u8) -> Address {
        Address::from_str(&format!("0x{}", format!("{n:02x}").repeat(20))).unwrap()
    }

    struct Harness {
        service: Arc<MockSource>,
        ledger: Arc<MockSource>,
        session: Arc<WalletSession>,
        sink: Arc<RecordingSink>,
        cache: QueryCache,
        coordinator: MutationCoordinator,
    }

    fn harness() -> Harness {
        let service = Arc::new(MockSource::service());
        let ledger = Arc::new(MockSource::ledger());
        let session = Arc::new(WalletSession::connected(addr(1)));
        let sink = Arc::new(RecordingSink::new());
        let adapter = Arc::new(
            DualSourceAdapter::new(Arc::clone(&service) as _, Arc::clone(&ledger) as _)
                .with_retry(1, Duration::from_millis(1)),
        );
        let cache = QueryCache::new(
            Arc::clone(&adapter),
            StalePolicy::default(),
            Arc::clone(&sink) as _,
        );
        let coordinator = MutationCoordinator::new(
            adapter,
            cache.clone(),
            Arc::clone(&session) as _,
            Arc::clone(&sink) as _,
        )
        .with_confirmation_timeout(Duration::from_secs(2));
        Harness {
            service,
            ledger,
            session,
            sink,
            cache,
            coordinator,
        }
    }

    fn register(name: &str) -> MutationParams {
        MutationParams::Register(RegisterParams::new(name, Role::Mentor))
    }

    #[test]
    fn test_start_outside_runtime_fails_locally() {
        let h = harness();

        let handle = h.coordinator.start(SourceKind::Service, register("Ada")).unwrap();
        let record = handle.record();

        assert_eq!(record.status, MutationStatus::Failed);
        assert_eq!(record.error, Some(AppError::RuntimeUnavailable));
        assert_eq!(h.service.submit_calls(), 0);
        assert!(!h.coordinator.is_active(&addr(1), MutationKind::Register));
        assert_eq!(h.sink.errors().len(), 1);
        assert!(h.sink.infos().is_empty());
    }

    #[tokio::test]
    async fn test_service_register_settles_without_confirmation() {
        let h = harness();
        let key = QueryKey::user(SourceKind::Service, addr(1));
        h.cache.read(&key, ReadOptions::fresh()).await.unwrap();

        let handle = h
            .coordinator
            .start(SourceKind::Service, register("Ada"))
            .unwrap();
        let record = handle.wait().await;

        assert_eq!(record.status, MutationStatus::Succeeded);
        assert_eq!(
            record.history,
            vec![
                MutationStatus::Idle,
                MutationStatus::Submitting,
                MutationStatus::Succeeded
            ]
        );
        assert!(record.result_handle.is_none());
        assert_eq!(record.result.as_ref().unwrap().name, "Ada");

        let snapshot = h.cache.snapshot(&key).unwrap();
        assert_eq!(snapshot.invalidation_count, 1);
        assert!(snapshot.is_stale);
        assert!(snapshot.value.unwrap().mentions(&addr(1)));

        assert_eq!(
            h.sink.levels(),
            vec![NotificationLevel::Info, NotificationLevel::Success]
        );
        assert!(!h.coordinator.is_active(&addr(1), MutationKind::Register));
    }

    #[tokio::test]
    async fn test_ledger_register_waits_for_confirmation() {
        let h = harness();
        h.ledger
            .script_confirmation(2, ConfirmationStatus::Confirmed);

        let handle = h
            .coordinator
            .start(SourceKind::Ledger, register("Ada"))
            .unwrap();
        let record = handle.wait().await;

        assert_eq!(record.status, MutationStatus::Succeeded);
        assert_eq!(
            record.history,
            vec![
                MutationStatus::Idle,
                MutationStatus::Submitting,
                MutationStatus::AwaitingConfirmation,
                MutationStatus::Succeeded
            ]
        );
        assert!(record.result_handle.is_some());
        assert_eq!(h.ledger.submit_calls(), 1);
        assert_eq!(h.ledger.poll_calls(), 3);
        assert_eq!(h.service.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_reverted_transaction_fails_without_invalidation() {
        let h = harness();
        let key = QueryKey::user(SourceKind::Ledger, addr(1));
        h.cache.read(&key, ReadOptions::fresh()).await.unwrap();
        h.ledger
            .script_confirmation(0, ConfirmationStatus::Failed("User already registered".into()));

        let record = h
            .coordinator
            .start(SourceKind::Ledger, register("Ada"))
            .unwrap()
            .wait()
            .await;

        assert_eq!(record.status, MutationStatus::Failed);
        assert!(matches!(
            record.error,
            Some(AppError::Backend(BackendError::TransactionFailed(_)))
        ));
        assert_eq!(h.cache.snapshot(&key).unwrap().invalidation_count, 0);
        assert_eq!(h.sink.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_confirm_mentorship_invalidates_both_parties_once() {
        let h = harness();
        let mentor_key = QueryKey::user(SourceKind::Ledger, addr(1));
        let mentee_key = QueryKey::user(SourceKind::Ledger, addr(2));
        let unrelated_search = QueryKey::search(SourceKind::Ledger, &SearchFilter::default());
        for key in [&mentor_key, &mentee_key, &unrelated_search] {
            h.cache.read(key, ReadOptions::fresh()).await.unwrap();
        }

        let record = h
            .coordinator
            .start(
                SourceKind::Ledger,
                MutationParams::ConfirmMentorship { mentee: addr(2) },
            )
            .unwrap()
            .wait()
            .await;

        assert_eq!(record.status, MutationStatus::Succeeded);
        assert_eq!(h.cache.snapshot(&mentor_key).unwrap().invalidation_count, 1);
        assert_eq!(h.cache.snapshot(&mentee_key).unwrap().invalidation_count, 1);
        assert_eq!(
            h.cache.snapshot(&unrelated_search).unwrap().invalidation_count,
            0
        );
        assert_eq!(h.sink.successes().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_caller_fails_locally() {
        let h = harness();
        h.session.disconnect();

        let handle = h
            .coordinator
            .start(SourceKind::Service, register("Ada"))
            .unwrap();
        let record = handle.wait().await;

        assert_eq!(record.status, MutationStatus::Failed);
        assert_eq!(record.error, Some(AppError::IdentityRequired));
        assert_eq!(
            record.history,
            vec![MutationStatus::Idle, MutationStatus::Failed]
        );
        assert_eq!(h.service.submit_calls(), 0);
        assert_eq!(h.sink.errors(), vec!["Please connect your wallet first".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_params_fail_locally() {
        let h = harness();

        let record = h
            .coordinator
            .start(SourceKind::Service, register("   "))
            .unwrap()
            .wait()
            .await;
        assert!(matches!(record.error, Some(AppError::Validation(_))));

        let own = h
            .coordinator
            .start(
                SourceKind::Ledger,
                MutationParams::ConfirmMentorship { mentee: addr(1) },
            )
            .unwrap()
            .record();
        assert_eq!(own.status, MutationStatus::Failed);
        assert!(own.error.unwrap().is_local());

        assert_eq!(h.service.submit_calls(), 0);
        assert_eq!(h.ledger.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_second_mutation_of_same_kind_is_refused() {
        let h = harness();
        h.ledger
            .script_confirmation(5, ConfirmationStatus::Confirmed);

        let first = h
            .coordinator
            .start(SourceKind::Ledger, register("Ada"))
            .unwrap();
        let second = h.coordinator.start(SourceKind::Ledger, register("Ada"));
        assert!(matches!(
            second,
            Err(AppError::MutationInProgress {
                kind: MutationKind::Register,
                ..
            })
        ));

        // A different kind is independent
        let other = h.coordinator.start(
            SourceKind::Ledger,
            MutationParams::ConfirmMentorship { mentee: addr(2) },
        );
        assert!(other.is_ok());

        assert_eq!(first.wait().await.status, MutationStatus::Succeeded);
        let third = h
            .coordinator
            .start(SourceKind::Service, register("Ada"))
            .unwrap();
        assert_eq!(third.wait().await.status, MutationStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_backend_rejection_reported_once() {
        let h = harness();
        h.service.fail_next_writes(
            1,
            BackendError::Rejected {
                status: 400,
                message: "User with this wallet address already exists".to_string(),
            },
        );

        let record = h
            .coordinator
            .start(SourceKind::Service, register("Ada"))
            .unwrap()
            .wait()
            .await;

        assert_eq!(record.status, MutationStatus::Failed);
        let errors = h.sink.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Registration failed"));
        assert!(errors[0].contains("already exists"));
    }

    #[tokio::test]
    async fn test_handle_reports_each_transition() {
        let h = harness();
        h.ledger
            .script_confirmation(3, ConfirmationStatus::Confirmed);

        let mut handle = h
            .coordinator
            .start(SourceKind::Ledger, register("Ada"))
            .unwrap();
        assert_eq!(handle.status(), MutationStatus::Submitting);

        let mut seen = Vec::new();
        while let Some(record) = handle.changed().await {
            seen.push(record.status);
            if record.status.is_terminal() {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![MutationStatus::AwaitingConfirmation, MutationStatus::Succeeded]
        );
    }
}
