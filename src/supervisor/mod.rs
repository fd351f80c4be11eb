//! Queue-driven worker supervision.
//!
//! This module keeps exactly one worker process running while there is work
//! in the prompt queue:
//!
//! - **PromptQueue**: read-only view of queue depth
//! - **TriggerWatcher**: one-shot START/STOP/RESTART requests from operators
//! - **ManagedProcess**: platform-neutral handle to the worker subprocess
//! - **Supervisor**: the monitor loop tying them together
//! - **RetryPolicy**: exponential backoff shared with the bridge
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────┐     ┌──────────────────┐
//!   │   Producer   │     │ Operator / tools │
//!   └──────┬───────┘     └────────┬─────────┘
//!          │ ZADD                 │ SET trigger
//!   ┌──────▼──────────────────────▼─────────┐
//!   │                 Redis                 │
//!   └──────┬──────────────────────▲─────────┘
//!          │ ZCARD / GETDEL       │ SET status EX
//!   ┌──────▼──────────────────────┴─────────┐
//!   │              Supervisor               │
//!   └──────┬────────────────────────────────┘
//!          │ spawn / SIGTERM / SIGKILL
//!   ┌──────▼───────┐
//!   │    Worker    │  drains the queue and exits
//!   └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use avai_dispatch::config::DispatchConfig;
//! use avai_dispatch::store::RedisStore;
//! use avai_dispatch::supervisor::{CommandLauncher, Supervisor};
//!
//! let config = DispatchConfig::from_env()?;
//! let store = Arc::new(RedisStore::connect(&config.redis_url()).await?);
//! let launcher = Arc::new(CommandLauncher::new(config.worker_command()));
//! let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
//!
//! let mut supervisor = Supervisor::new(config, store, launcher, shutdown_rx);
//! supervisor.monitor_loop().await;
//! ```

pub mod backoff;
pub mod monitor;
pub mod process;
pub mod queue;
pub mod trigger;

pub use backoff::RetryPolicy;
pub use monitor::{CycleResult, Supervisor, WorkerOutcome};
pub use process::{
    stop_gracefully, CapturedOutput, ChildProcess, CommandLauncher, ManagedProcess,
    ProcessLauncher, Termination, WorkerCommand,
};
pub use queue::{PromptQueue, PromptQueueEntry, QueueDepth};
pub use trigger::{parse_trigger, AutomationTrigger, TriggerAction, TriggerError, TriggerWatcher};
