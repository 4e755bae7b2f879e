//! Query cache keyed by `(source, query, parameters)`.
//!
//! Every key has at most one outstanding backend request. Concurrent readers of
//! the same key join that request instead of issuing their own. Fetches run on a
//! spawned task, so a reader that gives up waiting does not cancel the fetch
//! for everyone else.
//!
//! Responses are ordered by a per-cache ticket taken when the request is
//! issued. A response is stored only if no newer value has been stored for the
//! key in the meantime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::adapter::DualSourceAdapter;
use crate::domain::{
    Address, AppError, BackendError, NotificationLevel, NotificationSink, QueryKey, QueryKind,
    QueryValue, ReadOptions, SourceKind, StalePolicy,
};

/// How long an unobserved, idle entry is kept after its last use
pub const DEFAULT_GC_WINDOW: Duration = Duration::from_secs(300);

/// Result of one fetch, shared by everyone waiting on it
type FetchOutcome = Option<Result<QueryValue, AppError>>;

/// Selects which entries an invalidation touches
#[derive(Debug, Clone, PartialEq)]
pub enum KeyPattern {
    Exact(QueryKey),
    /// The identity-keyed entry for one address
    User { source: SourceKind, address: Address },
    /// Every search and page entry on a source
    Listings(SourceKind),
    /// Search and page entries whose cached value includes any of `addresses`,
    /// or whose fetch is still in flight
    ListingsMentioning {
        source: SourceKind,
        addresses: Vec<Address>,
    },
    TotalUsers(SourceKind),
    /// Everything cached for a source
    Source(SourceKind),
}

impl KeyPattern {
    pub fn matches(&self, key: &QueryKey, value: Option<&QueryValue>) -> bool {
        match self {
            Self::Exact(exact) => exact == key,
            Self::User { source, address } => {
                key.source == *source
                    && matches!(&key.query, QueryKind::UserByKey(a) if a == address)
            }
            Self::Listings(source) => key.source == *source && is_listing(&key.query),
            Self::ListingsMentioning { source, addresses } => {
                key.source == *source
                    && is_listing(&key.query)
                    && value.is_some_and(|v| addresses.iter().any(|a| v.mentions(a)))
            }
            Self::TotalUsers(source) => {
                key.source == *source && key.query == QueryKind::TotalUsers
            }
            Self::Source(source) => key.source == *source,
        }
    }

    /// Whether a request for `key` whose result is not known yet could match.
    fn may_match_pending(&self, key: &QueryKey) -> bool {
        match self {
            Self::ListingsMentioning { source, .. } => {
                key.source == *source && is_listing(&key.query)
            }
            other => other.matches(key, None),
        }
    }
}

fn is_listing(query: &QueryKind) -> bool {
    matches!(query, QueryKind::Search(_) | QueryKind::UserPage { .. })
}

/// Point-in-time view of one entry
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
    pub value: Option<QueryValue>,
    pub fetched_at: Option<Instant>,
    pub is_stale: bool,
    pub in_flight: bool,
    pub observers: usize,
    /// Number of invalidations that matched this entry
    pub invalidation_count: u64,
}

struct InFlight {
    ticket: u64,
    done: watch::Receiver<FetchOutcome>,
}

struct CacheEntry {
    value: Option<QueryValue>,
    fetched_at: Option<Instant>,
    /// Ticket of the request (or write) that produced `value`
    version: u64,
    /// Set by invalidation; cleared by the first value produced after it
    stale_mark: Option<u64>,
    in_flight: Option<InFlight>,
    observers: usize,
    invalidation_count: u64,
    /// Last read, write, store or end of observation
    last_used: Instant,
    updates: watch::Sender<Option<QueryValue>>,
}

impl CacheEntry {
    fn new() -> Self {
        let (updates, _) = watch::channel(None);
        Self {
            value: None,
            fetched_at: None,
            version: 0,
            stale_mark: None,
            in_flight: None,
            observers: 0,
            invalidation_count: 0,
            last_used: Instant::now(),
            updates,
        }
    }

    fn is_fresh(&self, now: Instant, window: Duration) -> bool {
        self.value.is_some()
            && self.stale_mark.is_none()
            && self
                .fetched_at
                .is_some_and(|at| now.saturating_duration_since(at) < window)
    }

    /// Store `value` unless something newer is already cached.
    fn store(&mut self, value: QueryValue, ticket: u64, at: Instant) -> bool {
        if ticket < self.version {
            return false;
        }
        self.version = ticket;
        self.fetched_at = Some(at);
        self.last_used = self.last_used.max(at);
        if self.stale_mark.is_some_and(|mark| mark < ticket) {
            self.stale_mark = None;
        }
        self.value = Some(value.clone());
        self.updates.send_replace(Some(value));
        true
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<QueryKey, CacheEntry>,
    next_ticket: u64,
}

impl CacheState {
    /// Drop entries nobody observes or is fetching that have sat unused for
    /// `window`. `keep` survives regardless.
    fn collect_garbage(&mut self, now: Instant, window: Duration, keep: Option<&QueryKey>) {
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            keep == Some(key)
                || entry.observers > 0
                || entry.in_flight.is_some()
                || now.saturating_duration_since(entry.last_used) < window
        });
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted = evicted, remaining = self.entries.len(), "Evicted idle cache entries");
        }
    }

    fn issue_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }
}

struct CacheInner {
    adapter: Arc<DualSourceAdapter>,
    policy: StalePolicy,
    gc_window: Duration,
    notifications: Arc<dyn NotificationSink>,
    state: Mutex<CacheState>,
}

impl CacheInner {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the key's in-flight request, or start one.
    fn ensure_fetch(
        self: &Arc<Self>,
        state: &mut CacheState,
        key: &QueryKey,
    ) -> watch::Receiver<FetchOutcome> {
        if let Some(in_flight) = state.entries.get(key).and_then(|e| e.in_flight.as_ref()) {
            debug!(key = %key, "Joining in-flight request");
            return in_flight.done.clone();
        }

        let (done_tx, done_rx) = watch::channel(None);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %key, "No async runtime available, fetch skipped");
            return done_rx;
        };

        let ticket = state.issue_ticket();
        let entry = state
            .entries
            .entry(key.clone())
            .or_insert_with(CacheEntry::new);
        entry.in_flight = Some(InFlight {
            ticket,
            done: done_rx.clone(),
        });

        debug!(key = %key, ticket = ticket, "Issuing fetch");
        let inner = Arc::clone(self);
        let key = key.clone();
        runtime.spawn(async move { inner.run_fetch(key, ticket, done_tx).await });
        done_rx
    }

    async fn run_fetch(
        self: Arc<Self>,
        key: QueryKey,
        mut ticket: u64,
        done: watch::Sender<FetchOutcome>,
    ) {
        loop {
            let issued_at = Instant::now();
            let result = self.adapter.fetch(&key).await;

            let refetch = {
                let mut guard = self.lock();
                let state = &mut *guard;
                match state.entries.get_mut(&key) {
                    Some(entry) => {
                        if let Ok(value) = &result
                            && !entry.store(value.clone(), ticket, issued_at)
                        {
                            debug!(key = %key, ticket = ticket, "Discarding response older than cached value");
                        }

                        let invalidated_meanwhile = result.is_ok()
                            && entry.stale_mark.is_some_and(|mark| mark > ticket);
                        if invalidated_meanwhile {
                            state.next_ticket += 1;
                            ticket = state.next_ticket;
                            if let Some(in_flight) = entry.in_flight.as_mut() {
                                in_flight.ticket = ticket;
                            }
                        } else if entry.in_flight.as_ref().is_some_and(|f| f.ticket == ticket) {
                            entry.in_flight = None;
                        }
                        invalidated_meanwhile
                    }
                    None => false,
                }
            };

            if refetch {
                debug!(key = %key, "Entry invalidated while fetching, refetching");
                continue;
            }

            if let Err(e) = &result {
                warn!(key = %key, error = %e, "Fetch failed");
                self.notifications.notify(
                    NotificationLevel::Error,
                    &format!("Failed to load {}: {}", key.query.name(), e),
                );
            }
            done.send_replace(Some(result));
            return;
        }
    }
}

/// Shared, cloneable handle to the cache
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl QueryCache {
    #[must_use]
    pub fn new(
        adapter: Arc<DualSourceAdapter>,
        policy: StalePolicy,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        Self::with_gc_window(adapter, policy, DEFAULT_GC_WINDOW, notifications)
    }

    /// Cache that evicts unobserved, idle entries once they go unused for
    /// `gc_window`.
    #[must_use]
    pub fn with_gc_window(
        adapter: Arc<DualSourceAdapter>,
        policy: StalePolicy,
        gc_window: Duration,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                adapter,
                policy,
                gc_window,
                notifications,
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    #[must_use]
    pub fn policy(&self) -> StalePolicy {
        self.inner.policy
    }

    /// Read `key`, serving a fresh entry without I/O.
    ///
    /// A stale or missing entry triggers one deduplicated fetch. Stale-tolerant
    /// readers get the stale value right away while the fetch runs in the
    /// background; everyone else waits for it.
    pub async fn read(&self, key: &QueryKey, options: ReadOptions) -> Result<QueryValue, AppError> {
        let now = Instant::now();
        let window = self.inner.policy.stale_after(&key.query);

        let done = {
            let mut state = self.inner.lock();
            state.collect_garbage(now, self.inner.gc_window, Some(key));
            let entry = state
                .entries
                .entry(key.clone())
                .or_insert_with(CacheEntry::new);
            entry.last_used = now;
            if entry.is_fresh(now, window)
                && let Some(value) = entry.value.clone()
            {
                debug!(key = %key, "Cache hit");
                return Ok(value);
            }

            let stale = entry.value.clone().filter(|_| options.stale_tolerant);
            let done = self.inner.ensure_fetch(&mut state, key);
            if let Some(value) = stale {
                debug!(key = %key, "Serving stale value, refreshing in background");
                return Ok(value);
            }
            done
        };

        await_outcome(done).await
    }

    /// Mark matching entries stale. Entries with live observers are refetched
    /// right away, reusing any request already in flight.
    pub fn invalidate(&self, pattern: &KeyPattern) -> usize {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        state.collect_garbage(Instant::now(), self.inner.gc_window, None);

        let mut matched = 0;
        let mut refetch = Vec::new();
        for (key, entry) in state.entries.iter_mut() {
            let pending_match = entry.in_flight.is_some() && pattern.may_match_pending(key);
            if !pending_match && !pattern.matches(key, entry.value.as_ref()) {
                continue;
            }
            matched += 1;
            entry.invalidation_count += 1;
            if entry.stale_mark.is_none() {
                state.next_ticket += 1;
                entry.stale_mark = Some(state.next_ticket);
            }
            if entry.observers > 0 && entry.in_flight.is_none() {
                refetch.push(key.clone());
            }
        }

        for key in &refetch {
            self.inner.ensure_fetch(state, key);
        }

        debug!(pattern = ?pattern, matched = matched, refetching = refetch.len(), "Invalidated");
        matched
    }

    /// Seed `key` with a known value without a round trip.
    pub fn write(&self, key: QueryKey, value: QueryValue) {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let ticket = state.issue_ticket();
        debug!(key = %key, ticket = ticket, "Seeding cache entry");
        state
            .entries
            .entry(key)
            .or_insert_with(CacheEntry::new)
            .store(value, ticket, Instant::now());
    }

    /// Start observing `key`. While the returned guard lives, invalidating the
    /// key refetches it immediately and pushes the result to the observer.
    pub fn observe(&self, key: QueryKey) -> QueryObserver {
        let window = self.inner.policy.stale_after(&key.query);
        let mut state = self.inner.lock();
        let entry = state
            .entries
            .entry(key.clone())
            .or_insert_with(CacheEntry::new);
        entry.observers += 1;
        let updates = entry.updates.subscribe();
        if !entry.is_fresh(Instant::now(), window) {
            self.inner.ensure_fetch(&mut state, &key);
        }
        QueryObserver {
            inner: Arc::clone(&self.inner),
            key,
            updates,
        }
    }

    #[must_use]
    pub fn snapshot(&self, key: &QueryKey) -> Option<EntrySnapshot> {
        let window = self.inner.policy.stale_after(&key.query);
        let state = self.inner.lock();
        state.entries.get(key).map(|entry| EntrySnapshot {
            value: entry.value.clone(),
            fetched_at: entry.fetched_at,
            is_stale: !entry.is_fresh(Instant::now(), window),
            in_flight: entry.in_flight.is_some(),
            observers: entry.observers,
            invalidation_count: entry.invalidation_count,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn await_outcome(mut done: watch::Receiver<FetchOutcome>) -> Result<QueryValue, AppError> {
    let settled = done
        .wait_for(Option::is_some)
        .await
        .map(|outcome| (*outcome).clone())
        .ok()
        .flatten();
    settled
        .or_else(|| done.borrow().clone())
        .unwrap_or_else(|| {
            Err(AppError::Backend(BackendError::Unreachable(
                "fetch ended without a result".to_string(),
            )))
        })
}

/// Live interest in one key. Dropping it ends the observation.
pub struct QueryObserver {
    inner: Arc<CacheInner>,
    key: QueryKey,
    updates: watch::Receiver<Option<QueryValue>>,
}

impl QueryObserver {
    #[must_use]
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    #[must_use]
    pub fn current(&self) -> Option<QueryValue> {
        self.updates.borrow().clone()
    }

    /// Wait for the next value stored under the key
    pub async fn changed(&mut self) -> Option<QueryValue> {
        self.updates.changed().await.ok()?;
        self.updates.borrow_and_update().clone()
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        if let Some(entry) = state.entries.get_mut(&self.key) {
            entry.observers = entry.observers.saturating_sub(1);
            entry.last_used = Instant::now();
        }
    }
}
