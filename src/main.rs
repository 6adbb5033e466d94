//! Product Registry Daemon
//!
//! Serves the registry HTTP API in front of a ledger node.
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults (ledger at http://localhost:8545)
//! product-registry
//!
//! # Start with custom config
//! product-registry --config /path/to/config.toml
//!
//! # Point at a ledger node and subscribe to its role notifications
//! product-registry --ledger-url http://ledger:8545 --ledger-events-url ws://ledger:8546
//!
//! # Local development against an in-process ledger
//! product-registry --dev-ledger --dev-owner 0xabc
//! ```

use anyhow::Context;
use clap::Parser;
use product_registry::events::spawn_audit_listener;
use product_registry::gate::spawn_role_listener;
use product_registry::ledger::EventStreamConfig;
use product_registry::{
    Address, AuthorizationGate, Config, EventBus, HttpServer, Ledger, MemoryLedger, MetadataCache,
    Registry, RpcLedger, RpcLedgerConfig,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "product-registry")]
#[command(about = "Product authenticity registry backed by a shared ledger")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long)]
    http_port: Option<u16>,

    /// Ledger JSON-RPC endpoint
    #[arg(long, env = "LEDGER_RPC_URL")]
    ledger_url: Option<String>,

    /// Ledger WebSocket endpoint for role notifications
    #[arg(long, env = "LEDGER_EVENTS_URL")]
    ledger_events_url: Option<String>,

    /// Use an in-process ledger (state is lost on exit)
    #[arg(long)]
    dev_ledger: bool,

    /// Owner address of the in-process ledger
    #[arg(long)]
    dev_owner: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("product_registry=info".parse()?),
        )
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)
            .with_context(|| format!("loading config {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(url) = args.ledger_url {
        config.ledger_rpc_url = url;
    }
    if let Some(url) = args.ledger_events_url {
        config.ledger_events_url = Some(url);
    }
    if args.dev_ledger {
        config.dev_ledger = true;
    }
    if let Some(owner) = args.dev_owner {
        config.dev_owner = owner;
    }

    info!(
        storage_dir = %config.storage_dir.display(),
        http_port = config.http_port,
        dev_ledger = config.dev_ledger,
        "Starting product-registry"
    );

    // Ensure storage directory exists
    tokio::fs::create_dir_all(&config.storage_dir).await?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Connect ledger
    let mut background = Vec::new();
    let ledger: Arc<dyn Ledger> = if config.dev_ledger {
        let owner: Address = config
            .dev_owner
            .parse()
            .context("invalid dev ledger owner address")?;
        warn!(owner = %owner, "Using in-process ledger, state will not persist");
        Arc::new(MemoryLedger::new(owner))
    } else {
        let rpc = RpcLedger::new(RpcLedgerConfig {
            url: config.ledger_rpc_url.clone(),
            request_timeout: config.ledger_timeout(),
        })?;
        info!(url = %config.ledger_rpc_url, "Ledger RPC client ready");

        match &config.ledger_events_url {
            Some(url) => {
                background.push(rpc.spawn_event_stream(
                    EventStreamConfig {
                        url: url.clone(),
                        reconnect_delay: config.events_reconnect_delay(),
                    },
                    shutdown_tx.subscribe(),
                ));
                info!(url = %url, "Subscribed to ledger role notifications");
            }
            None => {
                warn!("No ledger events URL set, role mirror only tracks local assignments");
            }
        }
        Arc::new(rpc)
    };

    // Open metadata cache
    let cache = Arc::new(MetadataCache::open(config.cache_db_path())?);
    info!(
        path = ?cache.path(),
        entries = cache.len(),
        "Metadata cache opened"
    );

    // Authorization gate
    let gate = Arc::new(AuthorizationGate::new(
        Arc::clone(&ledger),
        config.ledger_timeout(),
    ));
    let owner = gate
        .bootstrap()
        .await
        .context("reading ledger owner (is the ledger reachable?)")?;
    info!(owner = %owner, "Ledger owner is Admin");
    background.push(spawn_role_listener(
        Arc::clone(&gate),
        ledger.subscribe_roles(),
    ));

    // Event bus
    let events = Arc::new(EventBus::new());
    background.push(spawn_audit_listener(Arc::clone(&events)));

    let registry = Arc::new(Registry::new(
        ledger,
        cache,
        gate,
        events,
        config.ledger_timeout(),
    ));

    // Start HTTP server
    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let http_server = Arc::new(HttpServer::new(Arc::clone(&registry), http_addr));
    info!("HTTP API available at http://{}", http_addr);

    info!("Press Ctrl+C to stop.");

    let server_shutdown = shutdown_tx.subscribe();
    let server = tokio::spawn(async move {
        if let Err(e) = http_server.run(server_shutdown).await {
            error!(error = %e, "HTTP server error");
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");
    let _ = shutdown_tx.send(());
    let _ = server.await;

    for handle in background {
        handle.abort();
    }

    if let Err(e) = registry.shutdown() {
        error!(error = %e, "Failed to flush metadata cache");
    }
    info!(entries = registry.cache().len(), "Final cache size");

    Ok(())
}
