//! Ledger backend reached through a JSON-RPC gateway.
//!
//! Reads go through `contract_call`, state changes through `contract_send`
//! (which returns a transaction hash), and finality is observed by polling
//! `getTransactionReceipt` until it reports a status.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, info, instrument, warn};

use crate::domain::{
    Address, AppError, BackendError, ConfirmationStatus, MutationParams, RecordSource, Role,
    SearchFilter, SourceKind, SubmissionHandle, User, UserId, WriteReceipt,
};

/// Default gateway URL
pub const DEFAULT_LEDGER_URL: &str = "http://localhost:8545";

/// Page size used when scanning the registry for a search
const SEARCH_PAGE_SIZE: u64 = 50;

/// Configuration for the ledger client
#[derive(Debug, Clone)]
pub struct LedgerClientConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LedgerClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Abstract JSON-RPC transport to enable testing
#[async_trait]
pub trait LedgerRpcProvider: Send + Sync {
    /// Send a JSON-RPC request and return its `result`
    async fn send_request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError>;
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<T: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: String,
    params: T,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Reverts and invalid-input codes surface as backend rejections
const REJECTION_CODES: [i64; 2] = [-32000, 3];

/// HTTP-based JSON-RPC provider
pub struct HttpLedgerRpcProvider {
    http_client: Client,
    rpc_url: String,
    api_key: Option<SecretString>,
}

impl HttpLedgerRpcProvider {
    pub fn new(
        rpc_url: &str,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Backend(BackendError::Unreachable(e.to_string())))?;

        Ok(Self {
            http_client,
            rpc_url: rpc_url.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl LedgerRpcProvider for HttpLedgerRpcProvider {
    async fn send_request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method: method.to_string(),
            params,
        };

        let mut builder = self.http_client.post(&self.rpc_url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Backend(BackendError::Timeout(e.to_string()))
            } else {
                AppError::Backend(BackendError::Unreachable(e.to_string()))
            }
        })?;

        if response.status().is_server_error() {
            return Err(AppError::Backend(BackendError::Unreachable(format!(
                "gateway returned {}",
                response.status()
            ))));
        }

        let rpc_response: JsonRpcResponse<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| AppError::Backend(BackendError::Parse(e.to_string())))?;

        if let Some(error) = rpc_response.error {
            if REJECTION_CODES.contains(&error.code) {
                return Err(AppError::Backend(BackendError::Rejected {
                    status: 400,
                    message: error.message,
                }));
            }
            return Err(AppError::Backend(BackendError::Unreachable(format!(
                "{}: {}",
                error.code, error.message
            ))));
        }

        // `null` is a legitimate result (e.g. a receipt that does not exist yet)
        Ok(rpc_response.result.unwrap_or(serde_json::Value::Null))
    }
}

/// Unsigned integer that may be encoded as a number, decimal string or hex string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FlexU64(u64);

impl<'de> Deserialize<'de> for FlexU64 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        parse_flex_u64(&value)
            .map(FlexU64)
            .ok_or_else(|| serde::de::Error::custom(format!("not an unsigned integer: {value}")))
    }
}

fn parse_flex_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        },
        _ => None,
    }
}

/// User struct as returned by the registry contract
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerUser {
    #[serde(alias = "userAddress")]
    wallet_address: Address,
    name: String,
    role: FlexU64,
    reputation: FlexU64,
    registered: bool,
    #[serde(default)]
    is_verified: bool,
    #[serde(default)]
    skills: Vec<String>,
    #[serde(default)]
    bio: Option<String>,
}

impl LedgerUser {
    /// `None` for the zeroed struct the contract returns for unknown addresses
    fn into_domain(self) -> Result<Option<User>, AppError> {
        if !self.registered {
            return Ok(None);
        }
        let code = u8::try_from(self.role.0)
            .map_err(|_| AppError::Backend(BackendError::Parse(format!("role {}", self.role.0))))?;
        let role = Role::from_ledger_code(code)
            .map_err(|e| AppError::Backend(BackendError::Parse(e.to_string())))?;
        Ok(Some(User {
            id: UserId(self.wallet_address.to_string()),
            wallet_address: self.wallet_address,
            role,
            name: self.name,
            email: None,
            bio: self.bio.filter(|b| !b.is_empty()),
            skills: self.skills.into_iter().collect(),
            experience: None,
            hourly_rate: None,
            reputation: self.reputation.0,
            is_verified: self.is_verified,
            is_active: true,
            created_at: None,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct TransactionReceipt {
    status: serde_json::Value,
    #[serde(default, rename = "revertReason")]
    revert_reason: Option<String>,
}

/// Registry contract on the ledger
pub struct LedgerSource {
    provider: Box<dyn LedgerRpcProvider>,
    contract: Address,
    config: LedgerClientConfig,
}

impl LedgerSource {
    pub fn new(
        rpc_url: &str,
        api_key: Option<SecretString>,
        contract: Address,
        config: LedgerClientConfig,
    ) -> Result<Self, AppError> {
        let provider = HttpLedgerRpcProvider::new(rpc_url, api_key, config.timeout)?;
        info!(rpc_url = %rpc_url, contract = %contract, "Created ledger backend client");
        Ok(Self::with_provider(Box::new(provider), contract, config))
    }

    /// Create a source over a specific provider (useful for testing)
    pub fn with_provider(
        provider: Box<dyn LedgerRpcProvider>,
        contract: Address,
        config: LedgerClientConfig,
    ) -> Self {
        Self {
            provider,
            contract,
            config,
        }
    }

    #[must_use]
    pub fn contract(&self) -> &Address {
        &self.contract
    }

    #[must_use]
    pub fn contract_deployed(&self) -> bool {
        !self.contract.is_zero()
    }

    async fn rpc_call<R: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<R, AppError> {
        let result = self.provider.send_request(method, params).await?;
        serde_json::from_value(result).map_err(|e| {
            AppError::Backend(BackendError::Parse(format!(
                "{} result: {}",
                method, e
            )))
        })
    }

    /// Read-only contract call
    async fn call<R: DeserializeOwned>(
        &self,
        function: &str,
        args: serde_json::Value,
    ) -> Result<R, AppError> {
        let params = serde_json::json!({
            "contract": self.contract,
            "function": function,
            "args": args,
        });
        self.rpc_call("contract_call", params).await
    }

    /// State-changing contract call; returns the transaction hash
    async fn send(
        &self,
        from: &Address,
        function: &str,
        args: serde_json::Value,
    ) -> Result<SubmissionHandle, AppError> {
        let params = serde_json::json!({
            "contract": self.contract,
            "from": from,
            "function": function,
            "args": args,
        });
        let hash: String = self.rpc_call("contract_send", params).await?;
        Ok(SubmissionHandle(hash))
    }

    /// One `getUsers` page: raw slot count plus the registered users in it
    async fn page(&self, offset: u64, limit: u64) -> Result<(u64, Vec<User>), AppError> {
        let raw: Vec<LedgerUser> = self
            .call("getUsers", serde_json::json!([offset, limit]))
            .await?;
        let scanned = raw.len() as u64;
        let mut users = Vec::with_capacity(raw.len());
        for user in raw {
            if let Some(user) = user.into_domain()? {
                users.push(user);
            }
        }
        Ok((scanned, users))
    }

    fn require_contract(&self) -> Result<(), AppError> {
        if self.contract_deployed() {
            Ok(())
        } else {
            Err(AppError::Config(crate::domain::ConfigError::Missing(
                "CONTRACT_ADDRESS (registry contract not deployed)".to_string(),
            )))
        }
    }
}

#[async_trait]
impl RecordSource for LedgerSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Ledger
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        self.chain_id().await.map(|_| ())
    }

    #[instrument(skip(self), fields(address = %key))]
    async fn fetch_by_key(&self, key: &Address) -> Result<Option<User>, AppError> {
        self.require_contract()?;
        let user: Option<LedgerUser> = self.call("getUser", serde_json::json!([key])).await?;
        match user {
            Some(user) => user.into_domain(),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn search(&self, filter: &SearchFilter) -> Result<Vec<User>, AppError> {
        // No server-side search: scan the registry page by page
        let total = self.total_users().await?;
        let mut matches = Vec::new();
        let mut offset = 0;
        while offset < total && matches.len() < filter.limit {
            let (scanned, page) = self.page(offset, SEARCH_PAGE_SIZE).await?;
            if scanned == 0 {
                break;
            }
            offset += scanned;
            matches.extend(page.into_iter().filter(|u| filter.matches(u)));
        }
        matches.truncate(filter.limit);
        debug!(count = matches.len(), scanned = offset, "Ledger search complete");
        Ok(matches)
    }

    #[instrument(skip(self, params), fields(initiator = %initiator, kind = %params.kind()))]
    async fn submit_write(
        &self,
        initiator: &Address,
        params: &MutationParams,
    ) -> Result<WriteReceipt, AppError> {
        self.require_contract()?;
        let handle = match params {
            MutationParams::Register(register) => {
                self.send(
                    initiator,
                    "register",
                    serde_json::json!([register.name, register.role.ledger_code()]),
                )
                .await?
            }
            MutationParams::ConfirmMentorship { mentee } => {
                self.send(initiator, "confirmMentorship", serde_json::json!([mentee]))
                    .await?
            }
        };
        info!(tx = %handle, "Ledger transaction submitted");
        Ok(WriteReceipt::Pending(handle))
    }

    #[instrument(skip(self))]
    async fn poll_confirmation(
        &self,
        handle: &SubmissionHandle,
    ) -> Result<ConfirmationStatus, AppError> {
        let receipt: Option<TransactionReceipt> = self
            .rpc_call("getTransactionReceipt", serde_json::json!([handle.0]))
            .await?;

        let Some(receipt) = receipt else {
            return Ok(ConfirmationStatus::Pending);
        };
        match parse_flex_u64(&receipt.status) {
            Some(1) => Ok(ConfirmationStatus::Confirmed),
            Some(_) => Ok(ConfirmationStatus::Failed(
                receipt
                    .revert_reason
                    .unwrap_or_else(|| "transaction reverted".to_string()),
            )),
            None => Ok(ConfirmationStatus::Pending),
        }
    }

    #[instrument(skip(self))]
    async fn await_confirmation(
        &self,
        handle: &SubmissionHandle,
        timeout: Duration,
    ) -> Result<ConfirmationStatus, AppError> {
        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            match self.poll_confirmation(handle).await {
                Ok(ConfirmationStatus::Pending) => {
                    debug!(tx = %handle, "Transaction not yet confirmed");
                }
                Ok(terminal) => {
                    info!(tx = %handle, status = ?terminal, "Transaction finalized");
                    return Ok(terminal);
                }
                Err(e) => {
                    warn!(tx = %handle, error = ?e, "Error checking transaction status");
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        Err(AppError::Backend(BackendError::Timeout(format!(
            "Transaction {} not confirmed within {}ms",
            handle,
            timeout.as_millis()
        ))))
    }

    #[instrument(skip(self))]
    async fn list_users(&self, offset: u64, limit: u64) -> Result<Vec<User>, AppError> {
        self.require_contract()?;
        let (_, users) = self.page(offset, limit).await?;
        Ok(users)
    }

    #[instrument(skip(self))]
    async fn total_users(&self) -> Result<u64, AppError> {
        self.require_contract()?;
        let total: FlexU64 = self.call("totalUsers", serde_json::json!([])).await?;
        Ok(total.0)
    }

    #[instrument(skip(self))]
    async fn chain_id(&self) -> Result<u64, AppError> {
        let id: FlexU64 = self.rpc_call("chainId", serde_json::json!([])).await?;
        Ok(id.0)
    }
}
