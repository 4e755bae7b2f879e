//! Request/response service backend.
//!
//! Talks to the profile API over HTTP/JSON:
//! - `POST /api/users/register`
//! - `GET  /api/users/{wallet_address}`
//! - `GET  /api/users/search?role=&skills=&limit=`
//! - `GET  /health`

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use crate::domain::{
    Address, AppError, BackendError, MutationParams, RecordSource, Role, SearchFilter,
    SourceKind, User, UserId, WriteReceipt,
};

/// Default service base URL
pub const DEFAULT_SERVICE_URL: &str = "http://localhost:8000";

/// Upper bound on rows requested while widening a free-text search
const MAX_SEARCH_ROWS: usize = 1000;

/// Registration payload accepted by the service
#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    name: &'a str,
    role: Role,
    wallet_address: &'a Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
}

/// User as serialized by the service
#[derive(Debug, Deserialize)]
struct ServiceUser {
    id: serde_json::Value,
    wallet_address: Address,
    name: String,
    #[serde(default)]
    email: Option<String>,
    role: Role,
    #[serde(default)]
    reputation: Option<u64>,
    #[serde(default)]
    bio: Option<String>,
    #[serde(default)]
    skills: Option<Vec<String>>,
    #[serde(default)]
    experience: Option<String>,
    /// Decimal column: arrives as a JSON string or number
    #[serde(default)]
    hourly_rate: Option<serde_json::Value>,
    #[serde(default)]
    is_verified: bool,
    #[serde(default = "default_active")]
    is_active: bool,
    #[serde(default)]
    created_at: Option<String>,
}

fn default_active() -> bool {
    true
}

impl ServiceUser {
    fn into_domain(self) -> User {
        let id = match self.id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        let hourly_rate = match self.hourly_rate {
            Some(serde_json::Value::Number(n)) => n.as_f64(),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => None,
        };
        User {
            id: UserId(id),
            wallet_address: self.wallet_address,
            role: self.role,
            name: self.name,
            email: self.email,
            bio: self.bio,
            skills: self
                .skills
                .unwrap_or_default()
                .into_iter()
                .collect::<BTreeSet<_>>(),
            experience: self.experience,
            hourly_rate,
            reputation: self.reputation.unwrap_or(0),
            is_verified: self.is_verified,
            is_active: self.is_active,
            created_at: self.created_at.as_deref().and_then(parse_timestamp),
        }
    }
}

/// The service emits RFC 3339 or naive timestamps depending on the database
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    status: String,
}

/// Profile service reached over HTTP
#[derive(Debug, Clone)]
pub struct ServiceSource {
    http_client: Client,
    base_url: String,
}

impl ServiceSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Backend(BackendError::Unreachable(e.to_string())))?;

        info!(base_url = %base_url, "Created service backend client");
        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and return the response if its status is a success.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, AppError> {
        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|e| match e.detail {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .unwrap_or(body);

        if status.is_server_error() {
            error!(status = %status, message = %message, "Service returned server error");
            return Err(AppError::Backend(BackendError::Unreachable(format!(
                "{}: {}",
                status.as_u16(),
                message
            ))));
        }

        debug!(status = %status, message = %message, "Service rejected request");
        Err(AppError::Backend(BackendError::Rejected {
            status: status.as_u16(),
            message,
        }))
    }

    async fn parse<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, AppError> {
        response.json::<T>().await.map_err(|e| {
            error!(error = %e, "Failed to parse service response");
            AppError::Backend(BackendError::Parse(e.to_string()))
        })
    }
}

fn map_transport_error(e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::Backend(BackendError::Timeout(e.to_string()))
    } else {
        AppError::Backend(BackendError::Unreachable(e.to_string()))
    }
}

#[async_trait]
impl RecordSource for ServiceSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Service
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let response = self.send(self.http_client.get(self.url("/health"))).await?;
        let body: HealthBody = Self::parse(response).await?;
        if body.status != "ok" {
            return Err(AppError::Backend(BackendError::Unreachable(format!(
                "service reports status '{}'",
                body.status
            ))));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(address = %key))]
    async fn fetch_by_key(&self, key: &Address) -> Result<Option<User>, AppError> {
        let request = self
            .http_client
            .get(self.url(&format!("/api/users/{}", key)));
        match self.send(request).await {
            Ok(response) => {
                let user: ServiceUser = Self::parse(response).await?;
                Ok(Some(user.into_domain()))
            }
            Err(AppError::Backend(BackendError::Rejected { status, .. }))
                if status == StatusCode::NOT_FOUND.as_u16() =>
            {
                debug!("User not registered with service");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn search(&self, filter: &SearchFilter) -> Result<Vec<User>, AppError> {
        let mut base: Vec<(&str, String)> = Vec::new();
        if let Some(role) = filter.role {
            base.push(("role", role.as_str().to_string()));
        }
        if let Some(skill) = filter
            .skills_contains
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            base.push(("skills", skill.to_string()));
        }

        // The service caps rows before we can apply the text filter, so widen
        // the request until enough rows match or the service runs dry.
        let filters_locally = filter.normalized().text.is_some();
        let mut requested = filter.limit.max(1);
        loop {
            let mut query = base.clone();
            query.push(("limit", requested.to_string()));
            let request = self
                .http_client
                .get(self.url("/api/users/search"))
                .query(&query);
            let response = self.send(request).await?;
            let users: Vec<ServiceUser> = Self::parse(response).await?;
            let returned = users.len();

            let matches = filter.apply(users.into_iter().map(ServiceUser::into_domain));
            let exhausted = returned < requested || requested >= MAX_SEARCH_ROWS;
            if !filters_locally || matches.len() >= filter.limit || exhausted {
                debug!(requested, returned, matched = matches.len(), "Service search complete");
                return Ok(matches);
            }
            requested = (requested * 2).min(MAX_SEARCH_ROWS);
        }
    }

    #[instrument(skip(self, params), fields(initiator = %initiator, kind = %params.kind()))]
    async fn submit_write(
        &self,
        initiator: &Address,
        params: &MutationParams,
    ) -> Result<WriteReceipt, AppError> {
        match params {
            MutationParams::Register(register) => {
                let payload = RegisterRequest {
                    name: &register.name,
                    role: register.role,
                    wallet_address: initiator,
                    email: register.email.as_deref(),
                };
                let request = self
                    .http_client
                    .post(self.url("/api/users/register"))
                    .json(&payload);
                let response = self.send(request).await?;
                let user: ServiceUser = Self::parse(response).await?;
                info!(id = %user.id, "Registered with service");
                Ok(WriteReceipt::Settled(Some(user.into_domain())))
            }
            MutationParams::ConfirmMentorship { .. } => Err(AppError::NotSupported(
                "mentorship confirmation is only recorded on the ledger".to_string(),
            )),
        }
    }
}
