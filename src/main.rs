use anyhow::{Context as _, Result};
use clap::Parser;
use pylon::beacon::BeaconServer;
use pylon::claude_manager::{ClaudeManager, ProcessRunnerFactory};
use pylon::config::PylonConfig;
use pylon::logging::setup_logging;
use pylon::mcp_bridge::PylonMcpServer;
use pylon::message_store::MessageStore;
use pylon::persistence::{Persistence, SqlitePersistence};
use pylon::router::PylonRouter;
use pylon::share::ShareStore;
use pylon::workspace_store::WorkspaceStore;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "pylon", about = "Pylon — Estelle fabric orchestrator node", version)]
struct Args {
    /// This Pylon's identity within the fabric (7 bits, 1..=127).
    #[arg(long, env = "PYLON_ID")]
    pylon_id: u32,

    /// Data directory for the SQLite database, config.toml, and deploy scripts/logs.
    #[arg(long, env = "PYLON_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Beacon loopback TCP port (spec.md §4.5).
    #[arg(long, env = "PYLON_BEACON_PORT")]
    beacon_port: Option<u16>,

    /// Pylon-MCP loopback TCP port (spec.md §4.6).
    #[arg(long, env = "PYLON_MCP_PORT")]
    mcp_port: Option<u16>,

    /// Relay WebSocket URL.
    #[arg(long, env = "PYLON_RELAY_URL")]
    relay_url: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "PYLON_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "PYLON_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,

    /// Request/reply timeout, in seconds, for cross-fabric pending requests.
    #[arg(long, env = "PYLON_REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _log_guard = setup_logging(&log_level, args.log_file.as_deref());

    info!(version = env!("CARGO_PKG_VERSION"), "pylon starting");

    let config = Arc::new(PylonConfig::new(
        args.pylon_id,
        args.data_dir,
        args.beacon_port,
        args.mcp_port,
        args.relay_url,
        args.log,
        args.request_timeout_secs,
    ));
    info!(
        pylon_id = config.pylon_id,
        data_dir = %config.data_dir.display(),
        beacon_port = config.beacon_port,
        mcp_port = config.mcp_port,
        environment = config.environment.as_str(),
        "config loaded"
    );

    let persistence: Arc<dyn Persistence> = Arc::new(
        SqlitePersistence::open(&config.data_dir)
            .await
            .context("failed to open sqlite persistence")?,
    );

    let workspace_store = Arc::new(
        WorkspaceStore::new_from_persistence(config.pylon_id, persistence.clone())
            .await
            .context("failed to restore workspace snapshot")?,
    );
    let message_store = Arc::new(MessageStore::new(persistence.clone()));
    let share_store = Arc::new(ShareStore::new());

    // Beacon server started before ClaudeManager so the on_tool_start/
    // on_tool_end callbacks below have a live table to register into
    // (spec.md §9: cyclic references resolved via callbacks at construction).
    let beacon = BeaconServer::new(config.mcp_port);
    beacon.listen(config.beacon_port).await.context("failed to start beacon server")?;

    let beacon_for_start = beacon.clone();
    let on_tool_start: Arc<dyn Fn(String, pylon::identity::ConversationId, serde_json::Value) + Send + Sync> =
        Arc::new(move |tool_use_id, cid, raw| {
            let beacon = beacon_for_start.clone();
            tokio::spawn(async move {
                beacon.register_tool(tool_use_id, cid, raw).await;
            });
        });
    let beacon_for_end = beacon.clone();
    let on_tool_end: Arc<dyn Fn(String) + Send + Sync> = Arc::new(move |tool_use_id| {
        let beacon = beacon_for_end.clone();
        tokio::spawn(async move {
            beacon.unregister(&tool_use_id).await;
        });
    });

    let claude_manager = Arc::new(ClaudeManager::new(
        workspace_store.clone(),
        message_store.clone(),
        Arc::new(ProcessRunnerFactory),
        on_tool_start,
        on_tool_end,
    ));

    let (router, outbound_rx) = PylonRouter::new(
        config.clone(),
        workspace_store.clone(),
        message_store.clone(),
        claude_manager.clone(),
        share_store.clone(),
    );

    // Reset conversations left mid-turn by a previous crash before anything
    // else can observe them (spec.md §4.4 startup sequence).
    router.recover_on_startup();

    router.spawn_relay(outbound_rx);

    let mcp_server = PylonMcpServer::new(
        config.clone(),
        workspace_store.clone(),
        message_store.clone(),
        claude_manager.clone(),
        share_store.clone(),
        beacon.clone(),
    );
    mcp_server.listen(config.mcp_port).await.context("failed to start pylon-mcp server")?;

    info!("pylon ready");

    shutdown_signal().await;
    info!("pylon shutting down");

    router.shutdown().await;
    beacon.close().await;
    mcp_server.close().await;

    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(err = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
