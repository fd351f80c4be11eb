//! Runtime configuration for the supervisor and the bridge.
//!
//! Values come from built-in defaults, then environment variables, then CLI
//! flags (applied by the caller through the `with_*` builders).

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::supervisor::backoff::RetryPolicy;
use crate::supervisor::process::WorkerCommand;

/// Default WebSocket endpoint for forwarded results.
pub const DEFAULT_WEBSOCKET_URL: &str = "ws://websocket-server:8080/ws";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration shared by every avai-dispatch component.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    // Redis settings
    /// Explicit Redis URL; takes precedence over host/port when set.
    pub redis_url: Option<String>,
    /// Redis host.
    pub redis_host: String,
    /// Redis port.
    pub redis_port: u16,

    // Supervisor settings
    /// Interval between queue/trigger polls.
    pub poll_interval: Duration,
    /// Hard wall-clock limit for one worker run.
    pub worker_timeout: Duration,
    /// Time between SIGTERM and SIGKILL when stopping a worker.
    pub grace_period: Duration,
    /// Minimum time between two worker spawns.
    pub min_spawn_interval: Duration,
    /// Pause between stopping and respawning on RESTART_WORKER.
    pub restart_delay: Duration,
    /// Triggers older than this are discarded.
    pub trigger_max_age: Duration,
    /// TTL of the worker status key.
    pub status_ttl: Duration,
    /// Interval between health heartbeats.
    pub health_interval: Duration,
    /// Program used to start the worker.
    pub worker_program: String,
    /// Arguments passed to the worker program.
    pub worker_args: Vec<String>,
    /// Working directory of the worker.
    pub worker_dir: Option<PathBuf>,
    /// Maximum bytes of worker stdout/stderr kept for diagnostics.
    pub output_limit: usize,
    /// Backoff applied by the monitor after failures.
    pub monitor_retry: RetryPolicy,

    // Bridge settings
    /// WebSocket endpoint receiving forwarded results.
    pub websocket_url: String,
    /// Bounded wait of the blocking pop on the results list.
    pub pop_timeout: Duration,
    /// Timeout for opening a WebSocket connection.
    pub connect_timeout: Duration,
    /// Sleep between canister request polls when both lists are empty.
    pub canister_poll_interval: Duration,
    /// Backoff applied by the bridge loops on Redis errors.
    pub bridge_retry: RetryPolicy,
    /// Path of the canister management CLI.
    pub dfx_path: String,
    /// Default network for canister operations.
    pub dfx_network: String,
    /// Timeout for a single canister CLI invocation.
    pub dfx_timeout: Duration,

    /// Optional address for the metrics/health HTTP endpoint.
    pub metrics_addr: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            redis_host: "localhost".to_string(),
            redis_port: 6379,

            poll_interval: Duration::from_secs(10),
            worker_timeout: Duration::from_secs(300),
            grace_period: Duration::from_secs(10),
            min_spawn_interval: Duration::from_secs(5),
            restart_delay: Duration::from_secs(2),
            trigger_max_age: Duration::from_secs(300),
            status_ttl: Duration::from_secs(300),
            health_interval: Duration::from_secs(60),
            worker_program: "python3".to_string(),
            worker_args: vec!["main_enhanced.py".to_string(), "--queue-only".to_string()],
            worker_dir: None,
            output_limit: 4096,
            monitor_retry: RetryPolicy::new(
                Duration::from_secs(10),
                Duration::from_secs(300),
                5,
            ),

            websocket_url: DEFAULT_WEBSOCKET_URL.to_string(),
            pop_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            canister_poll_interval: Duration::from_secs(1),
            bridge_retry: RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 5),
            dfx_path: "dfx".to_string(),
            dfx_network: "local".to_string(),
            dfx_timeout: Duration::from_secs(120),

            metrics_addr: None,
        }
    }
}

impl DispatchConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`: Full Redis URL, overrides host/port
    /// - `REDIS_HOST`: Redis host (default: localhost)
    /// - `REDIS_PORT`: Redis port (default: 6379)
    /// - `CHECK_INTERVAL`: Monitor poll interval in seconds (default: 10)
    /// - `PROCESSING_TIMEOUT`: Worker timeout in seconds (default: 300)
    /// - `WORKER_GRACE_PERIOD`: Seconds between terminate and kill (default: 10)
    /// - `MIN_SPAWN_INTERVAL`: Minimum seconds between spawns (default: 5)
    /// - `WORKER_COMMAND`: Worker program (default: python3)
    /// - `WORKER_ARGS`: Whitespace separated worker arguments
    /// - `WORKER_DIR`: Worker working directory
    /// - `WORKER_STATUS_TTL`: Status key TTL in seconds (default: 300)
    /// - `WEBSOCKET_URL`: Bridge endpoint (default: ws://websocket-server:8080/ws)
    /// - `DFX_PATH`: Canister CLI (default: dfx)
    /// - `DFX_NETWORK`: Default canister network (default: local)
    /// - `METRICS_ADDR`: Address for the metrics endpoint
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("REDIS_URL") {
            if !val.trim().is_empty() {
                config.redis_url = Some(val);
            }
        }

        if let Ok(val) = std::env::var("REDIS_HOST") {
            config.redis_host = val;
        }

        if let Ok(val) = std::env::var("REDIS_PORT") {
            config.redis_port = parse_env_value(&val, "REDIS_PORT")?;
        }

        if let Ok(val) = std::env::var("CHECK_INTERVAL") {
            let secs: u64 = parse_env_value(&val, "CHECK_INTERVAL")?;
            config.poll_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("PROCESSING_TIMEOUT") {
            let secs: u64 = parse_env_value(&val, "PROCESSING_TIMEOUT")?;
            config.worker_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("WORKER_GRACE_PERIOD") {
            let secs: u64 = parse_env_value(&val, "WORKER_GRACE_PERIOD")?;
            config.grace_period = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("MIN_SPAWN_INTERVAL") {
            let secs: u64 = parse_env_value(&val, "MIN_SPAWN_INTERVAL")?;
            config.min_spawn_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("WORKER_COMMAND") {
            config.worker_program = val;
        }

        if let Ok(val) = std::env::var("WORKER_ARGS") {
            config.worker_args = split_args(&val);
        }

        if let Ok(val) = std::env::var("WORKER_DIR") {
            config.worker_dir = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("WORKER_STATUS_TTL") {
            let secs: u64 = parse_env_value(&val, "WORKER_STATUS_TTL")?;
            config.status_ttl = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("WEBSOCKET_URL") {
            config.websocket_url = val;
        }

        if let Ok(val) = std::env::var("DFX_PATH") {
            config.dfx_path = val;
        }

        if let Ok(val) = std::env::var("DFX_NETWORK") {
            if !val.trim().is_empty() {
                config.dfx_network = val;
            }
        }

        if let Ok(val) = std::env::var("METRICS_ADDR") {
            if !val.trim().is_empty() {
                config.metrics_addr = Some(val);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_none() && self.redis_host.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_host cannot be empty".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.worker_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "worker_timeout must be greater than 0".to_string(),
            ));
        }

        if self.worker_program.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "worker_program cannot be empty".to_string(),
            ));
        }

        if self.status_ttl.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "status_ttl must be at least one second".to_string(),
            ));
        }

        if !(self.websocket_url.starts_with("ws://") || self.websocket_url.starts_with("wss://")) {
            return Err(ConfigError::ValidationFailed(format!(
                "websocket_url must start with ws:// or wss://, got '{}'",
                self.websocket_url
            )));
        }

        if self.pop_timeout.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "pop_timeout must be at least one second".to_string(),
            ));
        }

        Ok(())
    }

    /// Returns the Redis connection URL.
    pub fn redis_url(&self) -> String {
        match &self.redis_url {
            Some(url) => url.clone(),
            None => format!("redis://{}:{}", self.redis_host, self.redis_port),
        }
    }

    /// Returns the worker command described by this configuration.
    pub fn worker_command(&self) -> WorkerCommand {
        let mut command = WorkerCommand::new(&self.worker_program)
            .with_args(self.worker_args.iter().cloned())
            .with_output_limit(self.output_limit);
        if let Some(dir) = &self.worker_dir {
            command = command.with_working_dir(dir);
        }
        command
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Builder method to set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder method to set the worker timeout.
    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    /// Builder method to set the grace period.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Builder method to set the minimum spawn interval.
    pub fn with_min_spawn_interval(mut self, interval: Duration) -> Self {
        self.min_spawn_interval = interval;
        self
    }

    /// Builder method to set the worker program and arguments.
    pub fn with_worker(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.worker_program = program.into();
        self.worker_args = args;
        self
    }

    /// Builder method to set the worker directory.
    pub fn with_worker_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.worker_dir = Some(dir.into());
        self
    }

    /// Builder method to set the WebSocket URL.
    pub fn with_websocket_url(mut self, url: impl Into<String>) -> Self {
        self.websocket_url = url.into();
        self
    }

    /// Builder method to set the canister CLI path.
    pub fn with_dfx_path(mut self, path: impl Into<String>) -> Self {
        self.dfx_path = path.into();
        self
    }

    /// Builder method to set the metrics address.
    pub fn with_metrics_addr(mut self, addr: impl Into<String>) -> Self {
        self.metrics_addr = Some(addr.into());
        self
    }
}

/// Splits a whitespace separated argument string.
pub fn split_args(value: &str) -> Vec<String> {
    value.split_whitespace().map(String::from).collect()
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
