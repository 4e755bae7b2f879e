//! Command-line entry point.
//!
//! ```text
//! mentor-sync status
//! mentor-sync whoami [--ledger]
//! mentor-sync search [--ledger] [--role ROLE] [--skill SKILL] [--text TEXT] [--limit N]
//! mentor-sync users [OFFSET] [LIMIT]
//! mentor-sync register NAME ROLE [EMAIL] [--ledger]
//! mentor-sync confirm MENTEE_ADDRESS
//! ```

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use dotenvy::dotenv;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use mentor_sync::app::{AppState, MutationHandle, SyncConfig};
use mentor_sync::domain::{
    Address, MutationStatus, ReadOptions, RegisterParams, Role, SearchFilter, SourceKind,
};
use mentor_sync::infra::WalletSession;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mentor_sync=debug"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Positional arguments with `--flag [value]` options pulled out
struct Args {
    positional: Vec<String>,
    options: Vec<(String, Option<String>)>,
}

impl Args {
    fn parse(raw: impl Iterator<Item = String>) -> Self {
        let mut positional = Vec::new();
        let mut options = Vec::new();
        let mut raw = raw.peekable();
        while let Some(arg) = raw.next() {
            match arg.strip_prefix("--") {
                Some(name) => {
                    let value = raw.next_if(|next| !next.starts_with("--"));
                    options.push((name.to_string(), value));
                }
                None => positional.push(arg),
            }
        }
        Self {
            positional,
            options,
        }
    }

    fn flag(&self, name: &str) -> bool {
        self.options.iter().any(|(n, _)| n == name)
    }

    fn value(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }

    fn source(&self) -> SourceKind {
        if self.flag("ledger") {
            SourceKind::Ledger
        } else {
            SourceKind::Service
        }
    }

    fn arg(&self, index: usize, name: &str) -> Result<&str> {
        self.positional
            .get(index)
            .map(String::as_str)
            .with_context(|| format!("missing argument: {name}"))
    }
}

async fn finish(handle: MutationHandle) -> Result<()> {
    let record = handle.wait().await;
    println!("{}", serde_json::to_string_pretty(&record.history)?);
    match record.status {
        MutationStatus::Succeeded => Ok(()),
        _ => match record.error {
            Some(e) => Err(e.into()),
            None => bail!("mutation ended in {}", record.status),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let config = SyncConfig::from_env()?;
    let session = Arc::new(WalletSession::new());
    if let Some(address) = config.wallet_address.clone() {
        session.connect(address);
    }
    let state = AppState::from_config(&config, session)?;
    let profiles = &state.profiles;

    let mut raw = env::args().skip(1);
    let command = raw.next().unwrap_or_else(|| "status".to_string());
    let args = Args::parse(raw);
    info!(command = %command, "mentor-sync v{}", env!("CARGO_PKG_VERSION"));

    match command.as_str() {
        "status" => {
            let status = profiles.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        "whoami" => {
            let user = profiles
                .current_user(args.source(), ReadOptions::fresh())
                .await?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        "search" => {
            let mut filter = SearchFilter::default();
            if let Some(role) = args.value("role") {
                filter = filter.role(role.parse::<Role>()?);
            }
            if let Some(skill) = args.value("skill") {
                filter = filter.skill(skill);
            }
            if let Some(text) = args.value("text") {
                filter = filter.text(text);
            }
            if let Some(limit) = args.value("limit") {
                filter = filter.limit(limit.parse().context("--limit must be a number")?);
            }
            let users = profiles
                .search_users(args.source(), &filter, ReadOptions::fresh())
                .await?;
            println!("{}", serde_json::to_string_pretty(&users)?);
        }
        "users" => {
            let offset = args.positional.first().map_or(Ok(0), |v| v.parse())?;
            let limit = args.positional.get(1).map_or(Ok(10), |v| v.parse())?;
            let total = profiles
                .total_users(SourceKind::Ledger, ReadOptions::fresh())
                .await?;
            let users = profiles
                .list_users(SourceKind::Ledger, offset, limit, ReadOptions::fresh())
                .await?;
            println!("total: {total}");
            println!("{}", serde_json::to_string_pretty(&users)?);
        }
        "register" => {
            let name = args.arg(0, "NAME")?;
            let role: Role = args.arg(1, "ROLE")?.parse()?;
            let mut params = RegisterParams::new(name, role);
            if let Some(email) = args.positional.get(2) {
                params = params.with_email(email);
            }
            finish(profiles.register(args.source(), params)?).await?;
        }
        "confirm" => {
            let mentee: Address = args.arg(0, "MENTEE_ADDRESS")?.parse()?;
            finish(profiles.confirm_mentorship(SourceKind::Ledger, mentee)?).await?;
        }
        other => bail!("unknown command: {other}"),
    }

    Ok(())
}
