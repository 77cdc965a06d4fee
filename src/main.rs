//! Leasegate admin CLI.
//!
//! Operates directly on the shared store: governance mode, leases,
//! elevations, capability tokens and purge. Results are printed as JSON on
//! stdout; diagnostics go to stderr.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{debug, info};

use leasegate::audit::{AuditEventType, AuditSink, JsonlAuditSink};
use leasegate::config::{LeasegateConfig, StoreBackend};
use leasegate::governance::GovernanceState;
use leasegate::lease::{LeaseManager, LeaseTerms};
use leasegate::policy::GovernanceMode;
use leasegate::registry::ToolRegistry;
use leasegate::store::{GuardedStore, MemoryStore, SqliteStore, Store};
use leasegate::token::{CapabilityTokenService, TokenPayload};

/// Leasegate: lease, approval and capability-token administration.
#[derive(Parser)]
#[command(name = "leasegate", version, about)]
struct Cli {
    /// Refuse development defaults such as the built-in signing secret.
    #[arg(long, global = true)]
    production: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read or change the system-wide governance mode.
    Mode {
        #[command(subcommand)]
        action: ModeAction,
    },
    /// Grant, inspect or revoke leases.
    Lease {
        #[command(subcommand)]
        action: LeaseAction,
    },
    /// Issue or verify capability tokens.
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Manage scoped elevations.
    Elevations {
        #[command(subcommand)]
        action: ElevationAction,
    },
    /// Remove expired entries from the store.
    Purge,
    /// Query the tool registry.
    Tools {
        #[command(subcommand)]
        action: ToolsAction,
    },
}

#[derive(Subcommand)]
enum ModeAction {
    /// Print the current mode.
    Get,
    /// Set the mode (read_only, permission, bypass).
    Set { mode: GovernanceMode },
}

#[derive(Subcommand)]
enum LeaseAction {
    /// Grant or replace a lease.
    Grant {
        client: String,
        tool: String,
        /// Lifetime in seconds.
        #[arg(long)]
        ttl: u64,
        /// Call budget.
        #[arg(long)]
        calls: u32,
    },
    /// Print a lease, or null if there is none.
    Show { client: String, tool: String },
    /// Revoke a lease. Revoking a missing lease is not an error.
    Revoke { client: String, tool: String },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Issue a token bound to a client and tool.
    Issue {
        client: String,
        tool: String,
        /// Lifetime in seconds.
        #[arg(long)]
        ttl: u64,
        /// Bind the token to one call context.
        #[arg(long)]
        context: Option<String>,
    },
    /// Verify a token against a client and tool.
    Verify {
        token: String,
        #[arg(long)]
        client: String,
        #[arg(long)]
        tool: String,
        #[arg(long)]
        context: Option<String>,
    },
}

#[derive(Subcommand)]
enum ElevationAction {
    /// Revoke every elevation.
    RevokeAll,
}

#[derive(Subcommand)]
enum ToolsAction {
    /// List tools whose name or description contains the query.
    Search {
        #[arg(default_value = "")]
        query: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = LeasegateConfig::load().context("failed to load configuration")?;
    let _logging =
        leasegate::logging::init(&config.logging).context("failed to initialise logging")?;
    config
        .validate(cli.production)
        .context("invalid configuration")?;

    if let Command::Tools { action } = &cli.command {
        return handle_tools(&config, action);
    }

    let store = open_store(&config).await?;
    let audit: Arc<dyn AuditSink> = Arc::new(
        JsonlAuditSink::open(&config.audit.log_path)
            .with_context(|| format!("failed to open audit log {}", config.audit.log_path))?,
    );
    let governance = GovernanceState::new(
        Arc::clone(&store),
        Arc::clone(&audit),
        config.default_mode()?,
        Duration::ZERO,
    );
    let leases = LeaseManager::new(Arc::clone(&store), config.leases.bootstrap_tools.clone())
        .with_audit(Arc::clone(&audit));

    match cli.command {
        Command::Mode { action } => handle_mode(&governance, action).await,
        Command::Lease { action } => {
            handle_lease(&config, &governance, &leases, audit.as_ref(), action).await
        }
        Command::Token { action } => handle_token(&config, action),
        Command::Elevations {
            action: ElevationAction::RevokeAll,
        } => {
            let revoked = governance.revoke_all_elevations().await?;
            print_json(&json!({ "revoked": revoked }))
        }
        Command::Purge => {
            let purged = leases.purge_expired().await?;
            info!(purged, "expired entries purged");
            print_json(&json!({ "purged": purged }))
        }
        Command::Tools { .. } => Ok(ExitCode::SUCCESS),
    }
}

/// Open the configured backend behind the timeout/retry guard.
async fn open_store(config: &LeasegateConfig) -> Result<Arc<dyn Store>> {
    let policy = config.retry_policy();
    let store: Arc<dyn Store> = match config.store.backend {
        StoreBackend::Sqlite => {
            let path = Path::new(&config.store.sqlite_path);
            debug!(path = %path.display(), "opening sqlite store");
            let sqlite = SqliteStore::connect(path)
                .await
                .with_context(|| format!("failed to open store {}", path.display()))?;
            Arc::new(GuardedStore::new(sqlite, policy))
        }
        StoreBackend::Memory => Arc::new(GuardedStore::new(MemoryStore::new(), policy)),
    };
    Ok(store)
}

async fn handle_mode(governance: &GovernanceState, action: ModeAction) -> Result<ExitCode> {
    match action {
        ModeAction::Get => {
            let mode = governance.get_mode().await?;
            print_json(&json!({ "mode": mode }))
        }
        ModeAction::Set { mode } => {
            governance.set_mode(mode).await?;
            print_json(&json!({ "mode": mode }))
        }
    }
}

async fn handle_lease(
    config: &LeasegateConfig,
    governance: &GovernanceState,
    leases: &LeaseManager,
    audit: &dyn AuditSink,
    action: LeaseAction,
) -> Result<ExitCode> {
    match action {
        LeaseAction::Grant {
            client,
            tool,
            ttl,
            calls,
        } => {
            let ttl = Duration::from_secs(ttl);
            let mode = governance.get_mode().await?;
            let signer = signer(config)?;
            let token = signer.issue(&TokenPayload::new(&client, &tool, None, ttl))?;
            let lease = leases
                .grant(LeaseTerms::new(client, tool, ttl, calls, mode).with_token(token))
                .await?;
            audit.log(
                AuditEventType::LeaseGranted,
                json!({
                    "client_id": lease.client_id,
                    "tool_id": lease.tool_id,
                    "mode": mode,
                    "lease_granted": true,
                    "calls_remaining": lease.calls_remaining,
                    "source": "cli",
                }),
            );
            print_json(&serde_json::to_value(&lease)?)
        }
        LeaseAction::Show { client, tool } => {
            let lease = leases.get(&client, &tool).await?;
            print_json(&serde_json::to_value(&lease)?)
        }
        LeaseAction::Revoke { client, tool } => {
            leases.revoke(&client, &tool).await?;
            print_json(&json!({ "revoked": true }))
        }
    }
}

fn handle_token(config: &LeasegateConfig, action: TokenAction) -> Result<ExitCode> {
    let signer = signer(config)?;
    match action {
        TokenAction::Issue {
            client,
            tool,
            ttl,
            context,
        } => {
            let payload = TokenPayload::new(client, tool, context, Duration::from_secs(ttl));
            let token = signer.issue(&payload)?;
            print_json(&json!({ "token": token, "expires_at": payload.expires_at }))
        }
        TokenAction::Verify {
            token,
            client,
            tool,
            context,
        } => match signer.verify_bound(&token, &client, &tool, context.as_deref()) {
            Ok(payload) => print_json(&json!({ "valid": true, "payload": payload })),
            Err(e) => {
                print_json(&json!({ "valid": false, "category": e.access_error().category() }))?;
                Ok(ExitCode::FAILURE)
            }
        },
    }
}

fn handle_tools(config: &LeasegateConfig, action: &ToolsAction) -> Result<ExitCode> {
    let registry = match &config.registry.path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read registry {path}"))?;
            ToolRegistry::from_toml(&raw).with_context(|| format!("invalid registry {path}"))?
        }
        None => ToolRegistry::new(),
    };
    match action {
        ToolsAction::Search { query } => print_json(&serde_json::to_value(registry.search(query))?),
    }
}

fn signer(config: &LeasegateConfig) -> Result<CapabilityTokenService> {
    CapabilityTokenService::new(config.tokens.hmac_secret.as_bytes())
        .context("invalid signing secret")
}

fn print_json(value: &serde_json::Value) -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(ExitCode::SUCCESS)
}
