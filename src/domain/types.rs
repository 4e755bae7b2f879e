//! Domain types with validation support.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::error::{AppError, ValidationError};

/// Default page size for searches, matching the service's own default
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

// ============================================================================
// IDENTITY
// ============================================================================

/// Wallet address identifying a participant on both backends.
///
/// Stored lowercase so lookups and cache keys are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// The all-zero address, used by the ledger for "no contract"
    #[must_use]
    pub fn zero() -> Self {
        Self(format!("0x{}", "0".repeat(40)))
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0[2..].bytes().all(|b| b == b'0')
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `0x1234…abcd` form for log lines and notifications
    #[must_use]
    pub fn short(&self) -> String {
        format!("{}…{}", &self.0[..6], &self.0[self.0.len() - 4..])
    }
}

impl std::str::FromStr for Address {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let hex = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| ValidationError::InvalidAddress(s.to_string()))?;
        if hex.len() != 40 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ValidationError::InvalidAddress(s.to_string()));
        }
        Ok(Self(format!("0x{}", hex.to_ascii_lowercase())))
    }
}

impl TryFrom<String> for Address {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Snapshot of the external wallet session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub key: Option<Address>,
    pub connected: bool,
}

impl Identity {
    #[must_use]
    pub fn connected(key: Address) -> Self {
        Self {
            key: Some(key),
            connected: true,
        }
    }

    #[must_use]
    pub fn disconnected() -> Self {
        Self::default()
    }

    /// The caller's key, or `IdentityRequired` when there is no usable session.
    pub fn require(&self) -> Result<Address, AppError> {
        match (&self.key, self.connected) {
            (Some(key), true) => Ok(key.clone()),
            _ => Err(AppError::IdentityRequired),
        }
    }
}

// ============================================================================
// USER RECORD
// ============================================================================

/// Participant role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Mentor,
    Mentee,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mentor => "MENTOR",
            Self::Mentee => "MENTEE",
            Self::Admin => "ADMIN",
        }
    }

    /// Numeric encoding used by the registry contract
    pub fn ledger_code(&self) -> u8 {
        match self {
            Self::Mentor => 0,
            Self::Mentee => 1,
            Self::Admin => 2,
        }
    }

    pub fn from_ledger_code(code: u8) -> Result<Self, ValidationError> {
        match code {
            0 => Ok(Self::Mentor),
            1 => Ok(Self::Mentee),
            2 => Ok(Self::Admin),
            other => Err(ValidationError::InvalidRole(other.to_string())),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MENTOR" => Ok(Self::Mentor),
            "MENTEE" => Ok(Self::Mentee),
            "ADMIN" => Ok(Self::Admin),
            _ => Err(ValidationError::InvalidRole(s.to_string())),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Opaque record identifier assigned by the backend that created it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One participant, as seen by either backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: UserId,
    pub wallet_address: Address,
    pub role: Role,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub skills: BTreeSet<String>,
    #[serde(default)]
    pub experience: Option<String>,
    #[serde(default)]
    pub hourly_rate: Option<f64>,
    #[serde(default)]
    pub reputation: u64,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl User {
    /// Minimal record as produced by a fresh registration
    #[must_use]
    pub fn new(id: impl Into<String>, wallet_address: Address, role: Role, name: &str) -> Self {
        Self {
            id: UserId(id.into()),
            wallet_address,
            role,
            name: name.to_string(),
            email: None,
            bio: None,
            skills: BTreeSet::new(),
            experience: None,
            hourly_rate: None,
            reputation: 0,
            is_verified: false,
            is_active: true,
            created_at: None,
        }
    }

    #[must_use]
    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills = skills.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_bio(mut self, bio: &str) -> Self {
        self.bio = Some(bio.to_string());
        self
    }
}

// ============================================================================
// SEARCH
// ============================================================================

/// Search criteria. Unset criteria match everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchFilter {
    pub role: Option<Role>,
    /// Exact (case-insensitive) membership test against `skills`
    pub skills_contains: Option<String>,
    /// Case-insensitive substring over name, bio and skills
    pub text: Option<String>,
    pub limit: usize,
}

impl Default for SearchFilter {
    fn default() -> Self {
        Self {
            role: None,
            skills_contains: None,
            text: None,
            limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

impl SearchFilter {
    #[must_use]
    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    #[must_use]
    pub fn skill(mut self, skill: &str) -> Self {
        self.skills_contains = Some(skill.to_string());
        self
    }

    #[must_use]
    pub fn text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Canonical form used in cache keys: trimmed, lowercased, blanks dropped.
    #[must_use]
    pub fn normalized(&self) -> Self {
        let clean = |value: &Option<String>| {
            value
                .as_deref()
                .map(|v| v.trim().to_lowercase())
                .filter(|v| !v.is_empty())
        };
        Self {
            role: self.role,
            skills_contains: clean(&self.skills_contains),
            text: clean(&self.text),
            limit: self.limit,
        }
    }

    pub fn matches(&self, user: &User) -> bool {
        if let Some(role) = self.role
            && user.role != role
        {
            return false;
        }

        if let Some(skill) = non_blank(&self.skills_contains) {
            let wanted = skill.to_lowercase();
            if !user.skills.iter().any(|s| s.to_lowercase() == wanted) {
                return false;
            }
        }

        if let Some(text) = non_blank(&self.text) {
            let needle = text.to_lowercase();
            let in_name = user.name.to_lowercase().contains(&needle);
            let in_bio = user
                .bio
                .as_deref()
                .is_some_and(|b| b.to_lowercase().contains(&needle));
            let in_skills = user
                .skills
                .iter()
                .any(|s| s.to_lowercase().contains(&needle));
            if !(in_name || in_bio || in_skills) {
                return false;
            }
        }

        true
    }

    /// Filter and cap a candidate list.
    pub fn apply<I>(&self, users: I) -> Vec<User>
    where
        I: IntoIterator<Item = User>,
    {
        users
            .into_iter()
            .filter(|u| self.matches(u))
            .take(self.limit)
            .collect()
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

// ============================================================================
// QUERY CACHE KEYS
// ============================================================================

/// Which backend a query or write goes to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Service,
    Ledger,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Ledger => "ledger",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKind {
    UserByKey(Address),
    Search(SearchFilter),
    UserPage { offset: u64, limit: u64 },
    TotalUsers,
}

impl QueryKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserByKey(_) => "fetch_by_key",
            Self::Search(_) => "search",
            Self::UserPage { .. } => "user_page",
            Self::TotalUsers => "total_users",
        }
    }
}

/// Cache key: `(source, query, parameters)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub source: SourceKind,
    pub query: QueryKind,
}

impl QueryKey {
    #[must_use]
    pub fn user(source: SourceKind, address: Address) -> Self {
        Self {
            source,
            query: QueryKind::UserByKey(address),
        }
    }

    #[must_use]
    pub fn search(source: SourceKind, filter: &SearchFilter) -> Self {
        Self {
            source,
            query: QueryKind::Search(filter.normalized()),
        }
    }

    #[must_use]
    pub fn page(source: SourceKind, offset: u64, limit: u64) -> Self {
        Self {
            source,
            query: QueryKind::UserPage { offset, limit },
        }
    }

    #[must_use]
    pub fn total(source: SourceKind) -> Self {
        Self {
            source,
            query: QueryKind::TotalUsers,
        }
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.query {
            QueryKind::UserByKey(address) => write!(f, "{}/fetch_by_key/{}", self.source, address),
            QueryKind::Search(filter) => write!(f, "{}/search/{:?}", self.source, filter),
            QueryKind::UserPage { offset, limit } => {
                write!(f, "{}/user_page/{}+{}", self.source, offset, limit)
            }
            QueryKind::TotalUsers => write!(f, "{}/total_users", self.source),
        }
    }
}

/// Cached result of a query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    /// `None` is a confirmed "not found"
    User(Option<User>),
    Users(Vec<User>),
    Count(u64),
}

impl QueryValue {
    /// Whether this value includes a record for `address`.
    pub fn mentions(&self, address: &Address) -> bool {
        match self {
            Self::User(user) => user.as_ref().is_some_and(|u| &u.wallet_address == address),
            Self::Users(users) => users.iter().any(|u| &u.wallet_address == address),
            Self::Count(_) => false,
        }
    }

    pub fn into_user(self) -> Result<Option<User>, AppError> {
        match self {
            Self::User(user) => Ok(user),
            other => Err(unexpected_shape("user", &other)),
        }
    }

    pub fn into_users(self) -> Result<Vec<User>, AppError> {
        match self {
            Self::Users(users) => Ok(users),
            other => Err(unexpected_shape("user list", &other)),
        }
    }

    pub fn into_count(self) -> Result<u64, AppError> {
        match self {
            Self::Count(count) => Ok(count),
            other => Err(unexpected_shape("count", &other)),
        }
    }
}

fn unexpected_shape(expected: &str, got: &QueryValue) -> AppError {
    AppError::Backend(super::error::BackendError::Parse(format!(
        "expected {expected}, cached value was {got:?}"
    )))
}

/// Read urgency
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Serve a stale value immediately and refresh in the background
    pub stale_tolerant: bool,
}

impl ReadOptions {
    #[must_use]
    pub fn fresh() -> Self {
        Self {
            stale_tolerant: false,
        }
    }

    #[must_use]
    pub fn stale_tolerant() -> Self {
        Self {
            stale_tolerant: true,
        }
    }
}

// ============================================================================
// MUTATIONS
// ============================================================================

/// Write operations the coordinator knows how to drive
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationKind {
    Register,
    ConfirmMentorship,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "REGISTER",
            Self::ConfirmMentorship => "CONFIRM_MENTORSHIP",
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of one write intent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationStatus {
    #[default]
    Idle,
    Submitting,
    AwaitingConfirmation,
    Succeeded,
    Failed,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Submitting => "SUBMITTING",
            Self::AwaitingConfirmation => "AWAITING_CONFIRMATION",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Legal edges of the lifecycle. Terminal states have no way out.
    #[must_use]
    pub fn can_transition_to(&self, next: MutationStatus) -> bool {
        use MutationStatus::*;
        matches!(
            (self, next),
            (Idle, Submitting)
                | (Idle, Failed)
                | (Submitting, AwaitingConfirmation)
                | (Submitting, Succeeded)
                | (Submitting, Failed)
                | (AwaitingConfirmation, Succeeded)
                | (AwaitingConfirmation, Failed)
        )
    }
}

impl std::fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RegisterParams {
    #[validate(
        length(min = 1, max = 100, message = "Name must be between 1 and 100 characters"),
        custom(function = "validate_not_blank")
    )]
    pub name: String,
    pub role: Role,
    #[validate(email(message = "Email must be a valid address"))]
    pub email: Option<String>,
}

impl RegisterParams {
    #[must_use]
    pub fn new(name: &str, role: Role) -> Self {
        Self {
            name: name.to_string(),
            role,
            email: None,
        }
    }

    #[must_use]
    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }
}

fn validate_not_blank(value: &str) -> Result<(), validator::ValidationError> {
    if value.trim().is_empty() {
        let mut err = validator::ValidationError::new("blank");
        err.message = Some("Name is required".into());
        return Err(err);
    }
    Ok(())
}

/// Operation-specific payload of a mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationParams {
    Register(RegisterParams),
    ConfirmMentorship { mentee: Address },
}

impl MutationParams {
    pub fn kind(&self) -> MutationKind {
        match self {
            Self::Register(_) => MutationKind::Register,
            Self::ConfirmMentorship { .. } => MutationKind::ConfirmMentorship,
        }
    }

    /// Required-field checks, run before any backend call.
    pub fn validate_for(&self, initiator: &Address) -> Result<(), ValidationError> {
        match self {
            Self::Register(params) => params
                .validate()
                .map_err(|e| ValidationError::Multiple(e.to_string())),
            Self::ConfirmMentorship { mentee } if mentee == initiator => {
                Err(ValidationError::InvalidField {
                    field: "mentee".to_string(),
                    message: "A mentor cannot confirm a mentorship with themself".to_string(),
                })
            }
            Self::ConfirmMentorship { mentee } if mentee.is_zero() => {
                Err(ValidationError::InvalidField {
                    field: "mentee".to_string(),
                    message: "Mentee address is required".to_string(),
                })
            }
            Self::ConfirmMentorship { .. } => Ok(()),
        }
    }

    /// Same payload with surrounding whitespace stripped from free text
    #[must_use]
    pub fn trimmed(&self) -> Self {
        match self {
            Self::Register(params) => Self::Register(RegisterParams {
                name: params.name.trim().to_string(),
                role: params.role,
                email: params
                    .email
                    .as_deref()
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .map(str::to_string),
            }),
            other => other.clone(),
        }
    }
}

/// Reference to an accepted ledger submission (transaction hash)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionHandle(pub String);

impl std::fmt::Display for SubmissionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a backend returns once it accepts a write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteReceipt {
    /// Service writes resolve immediately, optionally with the stored record
    Settled(Option<User>),
    /// Ledger writes must be confirmed through the handle
    Pending(SubmissionHandle),
}

/// Result of one confirmation poll. `Pending` is the "unconfirmed" state, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationStatus {
    Pending,
    Confirmed,
    Failed(String),
}

/// One write intent and everything known about its progress
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRecord {
    pub id: Uuid,
    pub kind: MutationKind,
    pub source: SourceKind,
    pub status: MutationStatus,
    pub initiator: Option<Address>,
    pub params: MutationParams,
    pub result_handle: Option<SubmissionHandle>,
    pub result: Option<User>,
    pub error: Option<AppError>,
    /// Every status entered, in order, starting with `Idle`
    pub history: Vec<MutationStatus>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl MutationRecord {
    #[must_use]
    pub fn new(source: SourceKind, initiator: Option<Address>, params: MutationParams) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: params.kind(),
            source,
            status: MutationStatus::Idle,
            initiator,
            params,
            result_handle: None,
            result: None,
            error: None,
            history: vec![MutationStatus::Idle],
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Move to `next`, recording it in the history.
    pub fn enter(&mut self, next: MutationStatus) {
        self.status = next;
        self.history.push(next);
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }
}

// ============================================================================
// NOTIFICATIONS & STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Error,
}

/// Health status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Ledger-side readiness, mirroring what a wallet UI checks before enabling writes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerStatus {
    pub reachable: bool,
    pub chain_id: Option<u64>,
    pub expected_chain_id: u64,
    pub contract_deployed: bool,
}

impl LedgerStatus {
    pub fn on_expected_chain(&self) -> bool {
        self.chain_id == Some(self.expected_chain_id)
    }

    pub fn health(&self) -> HealthStatus {
        match (self.reachable, self.on_expected_chain() && self.contract_deployed) {
            (true, true) => HealthStatus::Healthy,
            (true, false) => HealthStatus::Degraded,
            (false, _) => HealthStatus::Unhealthy,
        }
    }
}

/// Combined readiness of the session and both backends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub wallet_connected: bool,
    pub service: HealthStatus,
    pub ledger: LedgerStatus,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

impl HealthResponse {
    #[must_use]
    pub fn new(wallet_connected: bool, service: HealthStatus, ledger: LedgerStatus) -> Self {
        let status = match (service, ledger.health()) {
            (HealthStatus::Healthy, HealthStatus::Healthy) => HealthStatus::Healthy,
            (HealthStatus::Unhealthy, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            _ => HealthStatus::Degraded,
        };
        Self {
            status,
            wallet_connected,
            service,
            ledger,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Ready for ledger writes: wallet, chain and contract all in place
    pub fn ready_for_ledger_writes(&self) -> bool {
        self.wallet_connected && self.ledger.health() == HealthStatus::Healthy
    }
}

/// Freshness windows per query family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalePolicy {
    pub user: Duration,
    pub search: Duration,
}

impl Default for StalePolicy {
    fn default() -> Self {
        Self {
            user: Duration::from_secs(30),
            search: Duration::from_secs(5 * 60),
        }
    }
}

impl StalePolicy {
    pub fn stale_after(&self, query: &QueryKind) -> Duration {
        match query {
            QueryKind::UserByKey(_) => self.user,
            QueryKind::Search(_) | QueryKind::UserPage { .. } | QueryKind::TotalUsers => {
                self.search
            }
        }
    }
}
