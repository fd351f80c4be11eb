//! CLI command definitions for avai-dispatch.
//!
//! Long-running commands (`monitor`, `bridge`) own a shutdown broadcast
//! that fires on Ctrl-C or SIGTERM. The remaining commands are one-shot
//! operator tools against the same Redis keys.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bridge::{
    bridge_client_id, queue_canister_request, run_bridge, CanisterRequestProcessor,
    ResponseBridge, WebSocketForwarder,
};
use crate::canister::{
    CanisterManager, CanisterRequest, CanisterRequestKind, DfxCanisterManager,
};
use crate::config::DispatchConfig;
use crate::metrics;
use crate::status::StatusReporter;
use crate::store::{keys, RedisStore, Store};
use crate::supervisor::{
    CommandLauncher, PromptQueue, PromptQueueEntry, Supervisor, TriggerAction, TriggerWatcher,
};

/// Queue-driven worker supervisor and result bridge for AVAI.
#[derive(Parser)]
#[command(name = "avai-dispatch")]
#[command(about = "Supervise the AVAI queue worker and bridge its results")]
#[command(version)]
#[command(
    long_about = "avai-dispatch keeps one worker process running while prompts are queued in Redis,\nand forwards worker results to the WebSocket hub.\n\nExample usage:\n  avai-dispatch monitor --check-interval 10\n  avai-dispatch bridge --websocket-url ws://localhost:8080/ws"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis URL; overrides REDIS_URL, REDIS_HOST and REDIS_PORT.
    #[arg(long, global = true)]
    pub redis_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Watch the prompt queue and supervise the worker process.
    Monitor(MonitorArgs),

    /// Forward worker results to the WebSocket hub and serve canister requests.
    Bridge(BridgeArgs),

    /// Show worker status, queue depth and service health.
    Status(StatusArgs),

    /// Send a one-shot command to the running monitor.
    Trigger(TriggerArgs),

    /// Add a prompt to the queue.
    Enqueue(EnqueueArgs),

    /// Queue or run a canister operation.
    Canister(CanisterArgs),
}

/// Arguments for `avai-dispatch monitor`.
#[derive(Parser, Debug)]
pub struct MonitorArgs {
    /// Seconds between queue checks (overrides CHECK_INTERVAL).
    #[arg(long)]
    pub check_interval: Option<u64>,

    /// Worker wall-clock limit in seconds (overrides PROCESSING_TIMEOUT).
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Working directory of the worker (overrides WORKER_DIR).
    #[arg(long)]
    pub worker_dir: Option<PathBuf>,

    /// Address for the /metrics and /health endpoint (overrides METRICS_ADDR).
    #[arg(long)]
    pub metrics_addr: Option<String>,
}

/// Arguments for `avai-dispatch bridge`.
#[derive(Parser, Debug)]
pub struct BridgeArgs {
    /// WebSocket hub endpoint (overrides WEBSOCKET_URL).
    #[arg(long)]
    pub websocket_url: Option<String>,

    /// Only forward results; do not poll canister requests.
    #[arg(long)]
    pub no_canister: bool,

    /// Path of the dfx executable (overrides DFX_PATH).
    #[arg(long)]
    pub dfx_path: Option<String>,

    /// Address for the /metrics and /health endpoint (overrides METRICS_ADDR).
    #[arg(long)]
    pub metrics_addr: Option<String>,
}

/// Arguments for `avai-dispatch status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Trigger actions accepted on the command line.
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerArg {
    Start,
    Stop,
    Restart,
}

impl From<TriggerArg> for TriggerAction {
    fn from(arg: TriggerArg) -> Self {
        match arg {
            TriggerArg::Start => TriggerAction::StartWorker,
            TriggerArg::Stop => TriggerAction::StopWorker,
            TriggerArg::Restart => TriggerAction::RestartWorker,
        }
    }
}

/// Arguments for `avai-dispatch trigger`.
#[derive(Parser, Debug)]
pub struct TriggerArgs {
    /// Action to request.
    #[arg(value_enum)]
    pub action: TriggerArg,

    /// Source recorded with the trigger.
    #[arg(long, default_value = "cli")]
    pub source: String,
}

/// Arguments for `avai-dispatch enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Prompt payload. Parsed as JSON when possible, otherwise sent as a string.
    pub payload: String,

    /// Queue priority; higher is served first.
    #[arg(short, long, default_value = "0")]
    pub priority: f64,
}

/// Arguments for `avai-dispatch canister`.
#[derive(Parser, Debug)]
pub struct CanisterArgs {
    /// Canister operation.
    #[command(subcommand)]
    pub command: CanisterSubcommand,

    /// Run the operation now instead of queueing it for the bridge.
    #[arg(long, global = true)]
    pub direct: bool,
}

/// Canister operations.
#[derive(clap::Subcommand, Debug)]
pub enum CanisterSubcommand {
    /// Deploy a canister.
    Deploy {
        /// Canister name.
        name: String,

        /// Target network.
        #[arg(long)]
        network: Option<String>,
    },

    /// Call a canister method.
    Query {
        /// Canister name.
        name: String,

        /// Method to call.
        method: String,

        /// Positional arguments for the call.
        args: Vec<String>,

        /// Target network.
        #[arg(long)]
        network: Option<String>,
    },
}

impl CanisterSubcommand {
    fn kind(&self) -> CanisterRequestKind {
        match self {
            CanisterSubcommand::Deploy { .. } => CanisterRequestKind::Deploy,
            CanisterSubcommand::Query { .. } => CanisterRequestKind::Query,
        }
    }

    /// Builds the `data` object carried by a queued request.
    fn request_data(&self) -> Value {
        match self {
            CanisterSubcommand::Deploy { name, network } => json!({
                "canister_name": name,
                "network": network,
            }),
            CanisterSubcommand::Query {
                name,
                method,
                args,
                network,
            } => json!({
                "canister_name": name,
                "method": method,
                "args": args,
                "network": network,
            }),
        }
    }

    fn into_request(self, request_id: String) -> CanisterRequest {
        let kind = self.kind();
        match self {
            CanisterSubcommand::Deploy { name, network } => CanisterRequest {
                request_id,
                kind,
                canister_name: name,
                network,
                method: None,
                args: Vec::new(),
            },
            CanisterSubcommand::Query {
                name,
                method,
                args,
                network,
            } => CanisterRequest {
                request_id,
                kind,
                canister_name: name,
                network,
                method: Some(method),
                args,
            },
        }
    }
}

/// Parse CLI arguments and return the Cli struct.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse arguments and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_with_cli(cli).await
}

/// Run the selected command with pre-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = DispatchConfig::from_env().context("Invalid configuration")?;
    if let Some(url) = cli.redis_url {
        config = config.with_redis_url(url);
    }

    match cli.command {
        Commands::Monitor(args) => run_monitor_command(config, args).await,
        Commands::Bridge(args) => run_bridge_command(config, args).await,
        Commands::Status(args) => run_status_command(config, args).await,
        Commands::Trigger(args) => run_trigger_command(config, args).await,
        Commands::Enqueue(args) => run_enqueue_command(config, args).await,
        Commands::Canister(args) => run_canister_command(config, args).await,
    }
}

async fn run_monitor_command(mut config: DispatchConfig, args: MonitorArgs) -> anyhow::Result<()> {
    if let Some(secs) = args.check_interval {
        config = config.with_poll_interval(Duration::from_secs(secs));
    }
    if let Some(secs) = args.timeout {
        config = config.with_worker_timeout(Duration::from_secs(secs));
    }
    if let Some(dir) = args.worker_dir {
        config = config.with_worker_dir(dir);
    }
    if let Some(addr) = args.metrics_addr {
        config = config.with_metrics_addr(addr);
    }
    config.validate()?;

    let store = Arc::new(connect_store(&config).await?);
    let launcher = Arc::new(CommandLauncher::new(config.worker_command()));
    info!(
        worker = %launcher.command().display(),
        redis = %config.redis_url(),
        "Starting queue monitor"
    );

    let shutdown_tx = install_shutdown_handler();
    start_metrics(&config, &shutdown_tx)?;

    let mut supervisor = Supervisor::new(config, store, launcher, shutdown_tx.subscribe());
    supervisor.monitor_loop().await;
    Ok(())
}

async fn run_bridge_command(mut config: DispatchConfig, args: BridgeArgs) -> anyhow::Result<()> {
    if let Some(url) = args.websocket_url {
        config = config.with_websocket_url(url);
    }
    if let Some(path) = args.dfx_path {
        config = config.with_dfx_path(path);
    }
    if let Some(addr) = args.metrics_addr {
        config = config.with_metrics_addr(addr);
    }
    config.validate()?;

    // The blocking pop holds its connection, so each loop gets its own
    let response_store = Arc::new(connect_store(&config).await?);
    let canister_store = if args.no_canister {
        None
    } else {
        Some(Arc::new(connect_store(&config).await?))
    };

    let shutdown_tx = install_shutdown_handler();
    start_metrics(&config, &shutdown_tx)?;

    let client_id = bridge_client_id();
    info!(
        client_id = %client_id,
        websocket_url = %config.websocket_url,
        canister = !args.no_canister,
        "Starting result bridge"
    );

    let forwarder = Arc::new(WebSocketForwarder::new(
        &config.websocket_url,
        &client_id,
        config.connect_timeout,
    ));
    let response_bridge = ResponseBridge::new(
        &config,
        response_store,
        forwarder,
        client_id,
        shutdown_tx.subscribe(),
    );

    let processor = canister_store.map(|store| {
        let manager = Arc::new(DfxCanisterManager::new(
            &config.dfx_path,
            &config.dfx_network,
            config.dfx_timeout,
        ));
        CanisterRequestProcessor::new(&config, store, manager, shutdown_tx.subscribe())
    });

    run_bridge(response_bridge, processor, shutdown_tx).await?;
    info!("Result bridge stopped");
    Ok(())
}

async fn run_status_command(config: DispatchConfig, args: StatusArgs) -> anyhow::Result<()> {
    let store: Arc<dyn Store> = Arc::new(connect_store(&config).await?);
    let reporter = StatusReporter::new(store.clone(), config.status_ttl);

    let worker = reporter.read_status(keys::WORKER_STATUS).await?;
    let monitor_health = reporter.read_status(keys::AUTOMATION_HEALTH).await?;
    let bridge_health = reporter.read_status(keys::BRIDGE_HEALTH).await?;
    let depth = PromptQueue::new(store.clone()).check_queue_depth().await?;
    let pending_results = store.llen(keys::RESPONSES).await?;

    if args.json {
        let output = json!({
            "worker": worker,
            "queue": depth,
            "pending_results": pending_results,
            "health": {
                "queue_monitor": monitor_health,
                "response_bridge": bridge_health,
            },
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    match &worker {
        Some(record) => {
            println!("Worker:          {} (since {})", record.status, record.timestamp.to_rfc3339());
            for (key, value) in &record.metadata {
                println!("  {key}: {value}");
            }
        }
        None => println!("Worker:          unknown (no status published)"),
    }
    println!("Queue pending:   {}", depth.pending);
    println!("Queue in flight: {}", depth.processing);
    println!("Results waiting: {}", pending_results);
    println!(
        "Queue monitor:   {}",
        monitor_health.as_ref().map_or("down", |r| r.status.as_str())
    );
    println!(
        "Response bridge: {}",
        bridge_health.as_ref().map_or("down", |r| r.status.as_str())
    );
    Ok(())
}

async fn run_trigger_command(config: DispatchConfig, args: TriggerArgs) -> anyhow::Result<()> {
    let store = Arc::new(connect_store(&config).await?);
    let action = TriggerAction::from(args.action);

    TriggerWatcher::new(store, config.trigger_max_age)
        .set_trigger(action, &args.source)
        .await?;

    println!("Trigger {} set", action);
    Ok(())
}

async fn run_enqueue_command(config: DispatchConfig, args: EnqueueArgs) -> anyhow::Result<()> {
    let store = Arc::new(connect_store(&config).await?);
    let payload = parse_payload(&args.payload);
    let entry = PromptQueueEntry::new(payload, args.priority);

    PromptQueue::new(store).enqueue(&entry).await?;
    println!("{}", entry.id);
    Ok(())
}

async fn run_canister_command(config: DispatchConfig, args: CanisterArgs) -> anyhow::Result<()> {
    if args.direct {
        let manager = DfxCanisterManager::new(
            &config.dfx_path,
            &config.dfx_network,
            config.dfx_timeout,
        );
        let request = args
            .command
            .into_request(format!("cli_{}", Uuid::new_v4()));
        let result = manager.execute(&request).await;

        println!("{}", serde_json::to_string_pretty(&result)?);
        if !result.success {
            anyhow::bail!(
                "canister {} failed: {}",
                request.kind.as_str(),
                result.error.unwrap_or_default()
            );
        }
        return Ok(());
    }

    let store = connect_store(&config).await?;
    let request_id =
        queue_canister_request(&store, args.command.kind(), args.command.request_data()).await?;
    println!("{request_id}");
    Ok(())
}

/// Connects to Redis and verifies the connection with a ping.
async fn connect_store(config: &DispatchConfig) -> anyhow::Result<RedisStore> {
    let url = config.redis_url();
    let store = RedisStore::connect(&url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {url}"))?;
    store
        .ping()
        .await
        .with_context(|| format!("Redis at {url} did not answer PING"))?;
    Ok(store)
}

/// Creates the shutdown broadcast and fires it on Ctrl-C or SIGTERM.
fn install_shutdown_handler() -> broadcast::Sender<()> {
    let (shutdown_tx, _) = broadcast::channel(4);
    let tx = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = tx.send(());
    });
    shutdown_tx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler, listening for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Registers metrics and starts the HTTP endpoint when an address is set.
fn start_metrics(config: &DispatchConfig, shutdown_tx: &broadcast::Sender<()>) -> anyhow::Result<()> {
    metrics::init_metrics().context("Failed to register metrics")?;

    if let Some(addr) = config.metrics_addr.clone() {
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = metrics::server::serve(&addr, shutdown_rx).await {
                error!(addr = %addr, error = %e, "Metrics endpoint failed");
            }
        });
    }
    Ok(())
}

fn parse_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_monitor_command_defaults() {
        let cli = Cli::try_parse_from(["avai-dispatch", "monitor"]).expect("should parse");

        assert_eq!(cli.log_level, "info");
        assert!(cli.redis_url.is_none());
        match cli.command {
            Commands::Monitor(args) => {
                assert!(args.check_interval.is_none());
                assert!(args.timeout.is_none());
                assert!(args.metrics_addr.is_none());
            }
            _ => panic!("Expected Monitor command"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "avai-dispatch",
            "bridge",
            "--no-canister",
            "--redis-url",
            "redis://cache:6380",
            "-l",
            "debug",
        ])
        .expect("should parse");

        assert_eq!(cli.log_level, "debug");
        assert_eq!(cli.redis_url.as_deref(), Some("redis://cache:6380"));
        match cli.command {
            Commands::Bridge(args) => assert!(args.no_canister),
            _ => panic!("Expected Bridge command"),
        }
    }

    #[test]
    fn test_trigger_command() {
        let cli = Cli::try_parse_from(["avai-dispatch", "trigger", "restart", "--source", "ops"])
            .expect("should parse");

        match cli.command {
            Commands::Trigger(args) => {
                assert_eq!(TriggerAction::from(args.action), TriggerAction::RestartWorker);
                assert_eq!(args.source, "ops");
            }
            _ => panic!("Expected Trigger command"),
        }

        assert!(Cli::try_parse_from(["avai-dispatch", "trigger", "pause"]).is_err());
    }

    #[test]
    fn test_enqueue_command() {
        let cli = Cli::try_parse_from(["avai-dispatch", "enqueue", r#"{"prompt":"hi"}"#, "-p", "2.5"])
            .expect("should parse");

        match cli.command {
            Commands::Enqueue(args) => {
                assert_eq!(args.priority, 2.5);
                assert_eq!(parse_payload(&args.payload), json!({"prompt": "hi"}));
            }
            _ => panic!("Expected Enqueue command"),
        }
    }

    #[test]
    fn test_parse_payload_falls_back_to_string() {
        assert_eq!(parse_payload("hello world"), json!("hello world"));
        assert_eq!(parse_payload("42"), json!(42));
    }

    #[test]
    fn test_canister_query_command() {
        let cli = Cli::try_parse_from([
            "avai-dispatch",
            "canister",
            "query",
            "avai_main",
            "greet",
            "(\"bob\")",
            "--network",
            "ic",
            "--direct",
        ])
        .expect("should parse");

        let Commands::Canister(args) = cli.command else {
            panic!("Expected Canister command");
        };
        assert!(args.direct);
        assert_eq!(args.command.kind(), CanisterRequestKind::Query);

        let data = args.command.request_data();
        assert_eq!(data["canister_name"], "avai_main");
        assert_eq!(data["args"], json!(["(\"bob\")"]));

        let request = args.command.into_request("r1".to_string());
        assert_eq!(request.method.as_deref(), Some("greet"));
        assert_eq!(request.network.as_deref(), Some("ic"));
    }

    #[test]
    fn test_canister_request_data_round_trips_through_parser() {
        let command = CanisterSubcommand::Deploy {
            name: "avai_main".to_string(),
            network: None,
        };
        let entry = json!({"request_id": "canister_req_1", "data": command.request_data()});
        let request = CanisterRequest::parse(CanisterRequestKind::Deploy, &entry.to_string()).unwrap();

        assert_eq!(request.canister_name, "avai_main");
        assert!(request.network.is_none());
    }
}
