//! Runtime configuration.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use super::cache::DEFAULT_GC_WINDOW;
use crate::domain::{Address, ConfigError, StalePolicy};
use crate::infra::LedgerClientConfig;
use crate::infra::ledger::DEFAULT_LEDGER_URL;
use crate::infra::service::DEFAULT_SERVICE_URL;

/// Chain id of the network the registry contract is deployed on
pub const DEFAULT_EXPECTED_CHAIN_ID: u64 = 1043;

/// Everything needed to wire the synchronization layer
#[derive(Debug)]
pub struct SyncConfig {
    pub service_api_url: String,
    pub ledger_rpc_url: String,
    pub ledger_api_key: Option<SecretString>,
    /// Zero address means the contract is not deployed
    pub contract_address: Address,
    pub expected_chain_id: u64,
    /// Address of the connected wallet, if any
    pub wallet_address: Option<Address>,
    pub stale_policy: StalePolicy,
    /// Idle time after which an unobserved cache entry is dropped
    pub cache_gc_window: Duration,
    pub read_retries: u32,
    pub request_timeout: Duration,
    pub confirmation_poll_interval: Duration,
    pub confirmation_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            service_api_url: DEFAULT_SERVICE_URL.to_string(),
            ledger_rpc_url: DEFAULT_LEDGER_URL.to_string(),
            ledger_api_key: None,
            contract_address: Address::zero(),
            expected_chain_id: DEFAULT_EXPECTED_CHAIN_ID,
            wallet_address: None,
            stale_policy: StalePolicy::default(),
            cache_gc_window: DEFAULT_GC_WINDOW,
            read_retries: 1,
            request_timeout: Duration::from_secs(30),
            confirmation_poll_interval: Duration::from_millis(500),
            confirmation_timeout: Duration::from_secs(60),
        }
    }
}

impl SyncConfig {
    /// Load from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load from an arbitrary variable lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let contract_address = match get("CONTRACT_ADDRESS") {
            Some(raw) => parse_address("CONTRACT_ADDRESS", &raw)?,
            None => defaults.contract_address,
        };
        let wallet_address = get("WALLET_ADDRESS")
            .map(|raw| parse_address("WALLET_ADDRESS", &raw))
            .transpose()?;

        let user_stale_secs = parse_or(&get, "USER_STALE_SECS", defaults.stale_policy.user.as_secs())?;
        let search_stale_secs =
            parse_or(&get, "SEARCH_STALE_SECS", defaults.stale_policy.search.as_secs())?;

        Ok(Self {
            service_api_url: get("SERVICE_API_URL").unwrap_or(defaults.service_api_url),
            ledger_rpc_url: get("LEDGER_RPC_URL").unwrap_or(defaults.ledger_rpc_url),
            ledger_api_key: get("LEDGER_API_KEY").map(SecretString::from),
            contract_address,
            expected_chain_id: parse_or(&get, "EXPECTED_CHAIN_ID", defaults.expected_chain_id)?,
            wallet_address,
            stale_policy: StalePolicy {
                user: Duration::from_secs(user_stale_secs),
                search: Duration::from_secs(search_stale_secs),
            },
            cache_gc_window: Duration::from_secs(parse_or(
                &get,
                "CACHE_GC_SECS",
                defaults.cache_gc_window.as_secs(),
            )?),
            read_retries: parse_or(&get, "READ_RETRIES", defaults.read_retries)?,
            request_timeout: Duration::from_secs(parse_or(
                &get,
                "REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            confirmation_poll_interval: Duration::from_millis(parse_or(
                &get,
                "CONFIRMATION_POLL_MS",
                defaults.confirmation_poll_interval.as_millis() as u64,
            )?),
            confirmation_timeout: Duration::from_secs(parse_or(
                &get,
                "CONFIRMATION_TIMEOUT_SECS",
                defaults.confirmation_timeout.as_secs(),
            )?),
        })
    }

    #[must_use]
    pub fn contract_deployed(&self) -> bool {
        !self.contract_address.is_zero()
    }

    #[must_use]
    pub fn ledger_client_config(&self) -> LedgerClientConfig {
        LedgerClientConfig {
            timeout: self.request_timeout,
            poll_interval: self.confirmation_poll_interval,
        }
    }
}

fn parse_or<T, G>(get: &G, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

fn parse_address(name: &str, raw: &str) -> Result<Address, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.service_api_url, "http://localhost:8000");
        assert_eq!(config.ledger_rpc_url, "http://localhost:8545");
        assert_eq!(config.expected_chain_id, 1043);
        assert_eq!(config.read_retries, 1);
        assert_eq!(config.stale_policy, StalePolicy::default());
        assert!(!config.contract_deployed());
        assert!(config.wallet_address.is_none());
        assert!(config.ledger_api_key.is_none());
    }

    #[test]
    fn test_values_are_read() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("SERVICE_API_URL", "https://api.example.org"),
            ("CONTRACT_ADDRESS", "0xABCDEF0123456789ABCDEF0123456789ABCDEF01"),
            ("WALLET_ADDRESS", "0x1111111111111111111111111111111111111111"),
            ("LEDGER_API_KEY", "secret-token"),
            ("SEARCH_STALE_SECS", "10"),
            ("CONFIRMATION_POLL_MS", "50"),
            ("CACHE_GC_SECS", "120"),
        ]))
        .unwrap();

        assert_eq!(config.service_api_url, "https://api.example.org");
        assert!(config.contract_deployed());
        assert!(config.wallet_address.is_some());
        assert_eq!(
            config.ledger_api_key.as_ref().unwrap().expose_secret(),
            "secret-token"
        );
        assert_eq!(config.stale_policy.search, Duration::from_secs(10));
        assert_eq!(config.cache_gc_window, Duration::from_secs(120));
        assert_eq!(
            config.ledger_client_config().poll_interval,
            Duration::from_millis(50)
        );
    }

    #[test]
    fn test_blank_values_fall_back_to_defaults() {
        let config = SyncConfig::from_lookup(lookup(&[("LEDGER_RPC_URL", "   ")])).unwrap();
        assert_eq!(config.ledger_rpc_url, DEFAULT_LEDGER_URL);
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        let err = SyncConfig::from_lookup(lookup(&[("READ_RETRIES", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                name: "READ_RETRIES".to_string(),
                value: "lots".to_string(),
            }
        );
    }

    #[test]
    fn test_invalid_address_is_rejected() {
        let err = SyncConfig::from_lookup(lookup(&[("CONTRACT_ADDRESS", "0x12")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
