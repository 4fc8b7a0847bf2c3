//! Tandem node binary.
//!
//! Serves the rate-limited HTTP API. Configuration is loaded from environment
//! variables, a TOML file, and CLI arguments, in increasing precedence.
//!
//! # Usage
//!
//! ```bash
//! # Start with a TOML config
//! tandem-node --config /etc/tandem/node.toml
//!
//! # Override a scope from the command line
//! tandem-node --policy chat-send=20/1 --failure-policy open
//!
//! # Share buckets across nodes through Redis
//! tandem-node --store redis --redis-url redis://cache:6379/0
//!
//! # Environment variables
//! export TANDEM_HTTP_ADDR=0.0.0.0:8080
//! tandem-node
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tandem::LimiterRegistry;
use tandem::NodeConfig;
use tandem::ScopePolicy;
use tandem::StoreBackend;
use tandem::build_router;
use tandem::build_store;
use tandem::load_config;
use tandem_ratelimit::FailurePolicy;
use tandem_time::SystemTimeProvider;
use tandem_time::TimeProvider;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tandem-node", version, about = "Tandem rate-limited API node")]
struct Args {
    /// Path to TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address for the HTTP API.
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Namespace prepended to every bucket key.
    #[arg(long)]
    key_prefix: Option<String>,

    /// Behavior when the bucket store fails: "closed" or "open".
    #[arg(long)]
    failure_policy: Option<FailurePolicy>,

    /// Bound on one bucket store call, in milliseconds.
    #[arg(long)]
    store_timeout_ms: Option<u64>,

    /// Identify anonymous callers by the first x-forwarded-for hop.
    #[arg(long)]
    trust_forwarded_for: Option<bool>,

    /// Bucket state backend: "local", "kv" or "redis".
    #[arg(long)]
    store: Option<StoreBackend>,

    /// Redis server for the "redis" backend.
    #[arg(long)]
    redis_url: Option<String>,

    /// Scope policy override as scope=capacity/refill_rate. Repeatable.
    #[arg(long = "policy", value_parser = parse_policy_arg)]
    policies: Vec<(String, ScopePolicy)>,
}

fn parse_policy_arg(value: &str) -> Result<(String, ScopePolicy), String> {
    let (scope, policy) = value.split_once('=').ok_or_else(|| format!("'{value}' must be scope=capacity/refill_rate"))?;
    let policy = policy.parse::<ScopePolicy>().map_err(|e| e.to_string())?;
    Ok((scope.trim().to_string(), policy))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

/// Overrides contributed by the command line. Unset flags stay unset.
fn build_cli_config(args: &Args) -> NodeConfig {
    NodeConfig {
        http_addr: args.http_addr,
        key_prefix: args.key_prefix.clone(),
        failure_policy: args.failure_policy,
        store_timeout_ms: args.store_timeout_ms,
        trust_forwarded_for: args.trust_forwarded_for,
        store: args.store,
        redis_url: args.redis_url.clone(),
        policies: args.policies.iter().cloned().collect(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", err);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => error!("failed to install SIGTERM handler: {}", err),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = load_config(args.config.as_deref(), build_cli_config(&args)).context("failed to load configuration")?;

    let time: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let store = build_store(&config, time.clone()).context("failed to open bucket store")?;
    let registry = Arc::new(LimiterRegistry::new(&config, store, time).context("failed to build rate limiters")?);
    let router = build_router(registry.clone(), config.trust_forwarded_for()).context("failed to build router")?;

    let http_addr = config.http_addr();
    let listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {http_addr}"))?;
    info!(
        http_addr = %http_addr,
        store = %config.store_backend(),
        failure_policy = %config.failure_policy(),
        scopes = ?registry.scopes().collect::<Vec<_>>(),
        "tandem node listening"
    );

    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("tandem node stopped");
    Ok(())
}
