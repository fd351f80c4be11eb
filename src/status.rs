//! Worker status and health reporting.
//!
//! Status records are written as JSON string values with a TTL so that a
//! crashed supervisor's last state disappears on its own. Publishing is
//! best-effort: a failed write is logged and never interrupts the caller.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::{keys, Store};

/// TTL of health heartbeat keys.
pub const HEALTH_TTL: Duration = Duration::from_secs(120);

/// Lifecycle state of the worker as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Supervisor is up and no worker is running.
    Ready,
    /// A worker is being launched.
    Starting,
    /// A worker process is live.
    Running,
    /// The last worker exited with status 0.
    Completed,
    /// The last worker exited with a non-zero status.
    Failed,
    /// The last worker exceeded its wall-clock limit and was terminated.
    Timeout,
    /// The worker could not be launched.
    Error,
    /// The worker was stopped by a trigger or by supervisor shutdown.
    Stopped,
}

impl WorkerState {
    /// Returns the wire name of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Ready => "ready",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Completed => "completed",
            WorkerState::Failed => "failed",
            WorkerState::Timeout => "timeout",
            WorkerState::Error => "error",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WorkerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ready" => Ok(WorkerState::Ready),
            "starting" => Ok(WorkerState::Starting),
            "running" => Ok(WorkerState::Running),
            "completed" => Ok(WorkerState::Completed),
            "failed" => Ok(WorkerState::Failed),
            "timeout" => Ok(WorkerState::Timeout),
            "error" => Ok(WorkerState::Error),
            "stopped" => Ok(WorkerState::Stopped),
            other => Err(format!("unknown worker state: {}", other)),
        }
    }
}

/// A status record as stored in Redis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Free-form status name (a `WorkerState` for the worker key).
    pub status: String,
    /// When the record was written.
    pub timestamp: DateTime<Utc>,
    /// Pid of the process that wrote the record.
    pub pid: u32,
    /// Additional state-specific fields.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl StatusRecord {
    /// Creates a record stamped with the current time and process id.
    pub fn new(status: impl Into<String>, metadata: Map<String, Value>) -> Self {
        Self {
            status: status.into(),
            timestamp: Utc::now(),
            pid: std::process::id(),
            metadata,
        }
    }

    /// Parses the status as a worker state, if it is one.
    pub fn worker_state(&self) -> Option<WorkerState> {
        self.status.parse().ok()
    }
}

/// Builds a metadata map from key/value pairs.
///
/// ```ignore
/// let meta = metadata([("exit_code", json!(1))]);
/// ```
pub fn metadata<I, K>(pairs: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Publishes status and health records.
#[derive(Clone)]
pub struct StatusReporter {
    store: Arc<dyn Store>,
    status_ttl: Duration,
}

impl StatusReporter {
    /// Creates a reporter writing worker status with the given TTL.
    pub fn new(store: Arc<dyn Store>, status_ttl: Duration) -> Self {
        Self { store, status_ttl }
    }

    /// Overwrites `key` with a status record. Never fails; errors are logged.
    pub async fn publish_status(
        &self,
        key: &str,
        status: &str,
        metadata: Map<String, Value>,
        ttl: Duration,
    ) {
        let record = StatusRecord::new(status, metadata);
        let json = match serde_json::to_string(&record) {
            Ok(json) => json,
            Err(e) => {
                warn!(key = key, error = %e, "Failed to serialize status record");
                return;
            }
        };

        match self.store.set_ex(key, &json, ttl).await {
            Ok(()) => debug!(key = key, status = status, "Published status"),
            Err(e) => warn!(key = key, status = status, error = %e, "Failed to publish status"),
        }
    }

    /// Publishes the worker state to `avai:worker:status`.
    pub async fn publish_worker(&self, state: WorkerState, metadata: Map<String, Value>) {
        self.publish_status(keys::WORKER_STATUS, state.as_str(), metadata, self.status_ttl)
            .await;
    }

    /// Publishes a `healthy` heartbeat for a service.
    pub async fn publish_health(&self, key: &str, service: &str, mut extra: Map<String, Value>) {
        extra.insert("service".to_string(), Value::String(service.to_string()));
        self.publish_status(key, "healthy", extra, HEALTH_TTL).await;
    }

    /// Reads a status record. Missing keys and unparseable values yield `None`.
    pub async fn read_status(&self, key: &str) -> Result<Option<StatusRecord>, StoreError> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(key = key, error = %e, "Ignoring malformed status record");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn reporter() -> (Arc<MemoryStore>, StatusReporter) {
        let store = Arc::new(MemoryStore::new());
        let reporter = StatusReporter::new(store.clone(), Duration::from_secs(300));
        (store, reporter)
    }

    #[test]
    fn test_worker_state_roundtrip_names() {
        for state in [
            WorkerState::Ready,
            WorkerState::Starting,
            WorkerState::Running,
            WorkerState::Completed,
            WorkerState::Failed,
            WorkerState::Timeout,
            WorkerState::Error,
            WorkerState::Stopped,
        ] {
            assert_eq!(state.as_str().parse::<WorkerState>().unwrap(), state);
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
        assert!("bogus".parse::<WorkerState>().is_err());
    }

    #[tokio::test]
    async fn test_publish_worker_sets_ttl_and_fields() {
        let (store, reporter) = reporter();

        reporter
            .publish_worker(WorkerState::Failed, metadata([("exit_code", json!(2))]))
            .await;

        let ttl = store.ttl(keys::WORKER_STATUS).unwrap();
        assert!(ttl > Duration::from_secs(290));

        let record = reporter.read_status(keys::WORKER_STATUS).await.unwrap().unwrap();
        assert_eq!(record.worker_state(), Some(WorkerState::Failed));
        assert_eq!(record.pid, std::process::id());
        assert_eq!(record.metadata["exit_code"], json!(2));
    }

    #[tokio::test]
    async fn test_publish_is_idempotent_overwrite() {
        let (_store, reporter) = reporter();

        reporter.publish_worker(WorkerState::Starting, Map::new()).await;
        reporter.publish_worker(WorkerState::Running, Map::new()).await;
        reporter.publish_worker(WorkerState::Running, Map::new()).await;

        let record = reporter.read_status(keys::WORKER_STATUS).await.unwrap().unwrap();
        assert_eq!(record.status, "running");
    }

    #[tokio::test]
    async fn test_publish_swallows_store_errors() {
        let (store, reporter) = reporter();
        store.set_available(false);

        reporter.publish_worker(WorkerState::Ready, Map::new()).await;

        store.set_available(true);
        assert!(reporter.read_status(keys::WORKER_STATUS).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_health() {
        let (store, reporter) = reporter();

        reporter
            .publish_health(keys::AUTOMATION_HEALTH, "queue_monitor", Map::new())
            .await;

        assert!(store.ttl(keys::AUTOMATION_HEALTH).unwrap() <= HEALTH_TTL);
        let record = reporter
            .read_status(keys::AUTOMATION_HEALTH)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, "healthy");
        assert_eq!(record.metadata["service"], json!("queue_monitor"));
    }

    #[tokio::test]
    async fn test_read_status_ignores_garbage() {
        let (store, reporter) = reporter();
        store.set(keys::WORKER_STATUS, "not json");
        assert!(reporter.read_status(keys::WORKER_STATUS).await.unwrap().is_none());
    }
}
