//! Automation triggers.
//!
//! External tools request worker actions by writing a JSON document to
//! `avai:automation:trigger`:
//!
//! ```json
//! {"action": "START_WORKER", "timestamp": "2024-05-01T12:00:00Z", "source": "dashboard"}
//! ```
//!
//! A trigger is consumed exactly once with `GETDEL`. Malformed, unknown or
//! stale triggers are consumed and dropped so they cannot wedge the key.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store::{keys, Store};

/// Number of consumed triggers kept in the automation log.
pub const TRIGGER_LOG_LIMIT: usize = 100;

/// Actions an automation trigger can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerAction {
    /// Start a worker even if the queue is empty.
    StartWorker,
    /// Stop the running worker and do not respawn this cycle.
    StopWorker,
    /// Stop the running worker, pause briefly, then start a new one.
    RestartWorker,
}

impl TriggerAction {
    /// Returns the wire name of this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerAction::StartWorker => "START_WORKER",
            TriggerAction::StopWorker => "STOP_WORKER",
            TriggerAction::RestartWorker => "RESTART_WORKER",
        }
    }
}

impl fmt::Display for TriggerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TriggerAction {
    type Err = TriggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "START_WORKER" => Ok(TriggerAction::StartWorker),
            "STOP_WORKER" => Ok(TriggerAction::StopWorker),
            "RESTART_WORKER" => Ok(TriggerAction::RestartWorker),
            _ => Err(TriggerError::UnknownAction(s.to_string())),
        }
    }
}

/// Reasons a trigger value is rejected.
#[derive(Debug, Error, PartialEq)]
pub enum TriggerError {
    #[error("Trigger is not valid JSON: {0}")]
    Malformed(String),

    #[error("Unknown trigger action '{0}'")]
    UnknownAction(String),

    #[error("Unparseable trigger timestamp '{0}'")]
    BadTimestamp(String),

    #[error("Trigger is stale ({age_secs}s old)")]
    Stale { age_secs: i64 },
}

/// A trigger document as written by producers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationTrigger {
    /// Requested action, matched case-insensitively.
    #[serde(default)]
    pub action: String,
    /// ISO-8601 string or epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    /// Free-form producer name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl AutomationTrigger {
    /// Creates a trigger stamped with the current time.
    pub fn new(action: TriggerAction, source: impl Into<String>) -> Self {
        Self {
            action: action.as_str().to_string(),
            timestamp: Some(Value::String(Utc::now().to_rfc3339())),
            source: Some(source.into()),
        }
    }
}

/// Parses a trigger timestamp.
///
/// Accepts RFC 3339, naive ISO-8601 (treated as UTC) and epoch seconds.
fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, TriggerError> {
    match value {
        Value::String(s) => {
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Ok(ts.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|naive| Utc.from_utc_datetime(&naive))
                .map_err(|_| TriggerError::BadTimestamp(s.clone()))
        }
        Value::Number(n) => n
            .as_f64()
            .and_then(|secs| DateTime::from_timestamp_millis((secs * 1000.0) as i64))
            .ok_or_else(|| TriggerError::BadTimestamp(n.to_string())),
        other => Err(TriggerError::BadTimestamp(other.to_string())),
    }
}

/// Validates a raw trigger value.
///
/// A missing timestamp is accepted; a timestamp further than `max_age` in the
/// past is not.
pub fn parse_trigger(
    raw: &str,
    now: DateTime<Utc>,
    max_age: Duration,
) -> Result<(TriggerAction, AutomationTrigger), TriggerError> {
    let trigger: AutomationTrigger =
        serde_json::from_str(raw).map_err(|e| TriggerError::Malformed(e.to_string()))?;

    let action: TriggerAction = trigger.action.parse()?;

    if let Some(ts) = trigger.timestamp.as_ref().filter(|v| !v.is_null()) {
        let issued = parse_timestamp(ts)?;
        let age = now.signed_duration_since(issued);
        if age.num_milliseconds() > max_age.as_millis() as i64 {
            return Err(TriggerError::Stale {
                age_secs: age.num_seconds(),
            });
        }
    }

    Ok((action, trigger))
}

/// Consumes triggers from the store.
#[derive(Clone)]
pub struct TriggerWatcher {
    store: Arc<dyn Store>,
    max_age: Duration,
}

impl TriggerWatcher {
    /// Creates a watcher that discards triggers older than `max_age`.
    pub fn new(store: Arc<dyn Store>, max_age: Duration) -> Self {
        Self { store, max_age }
    }

    /// Consumes the pending trigger, if any.
    ///
    /// The key is read and deleted atomically. Store errors are logged and
    /// leave the key in place; rejected values are logged and dropped.
    pub async fn check_trigger(&self) -> Option<TriggerAction> {
        let raw = match self.store.get_del(keys::AUTOMATION_TRIGGER).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Failed to read automation trigger");
                return None;
            }
        };

        match parse_trigger(&raw, Utc::now(), self.max_age) {
            Ok((action, trigger)) => {
                info!(
                    action = %action,
                    source = trigger.source.as_deref().unwrap_or("unknown"),
                    "Consumed automation trigger"
                );
                self.log_trigger(action, &trigger).await;
                Some(action)
            }
            Err(e) => {
                warn!(error = %e, raw = %raw, "Discarding automation trigger");
                None
            }
        }
    }

    /// Writes a trigger, replacing any pending one.
    pub async fn set_trigger(
        &self,
        action: TriggerAction,
        source: &str,
    ) -> Result<(), StoreError> {
        let trigger = AutomationTrigger::new(action, source);
        let json = serde_json::to_string(&trigger)?;
        self.store
            .set_ex(keys::AUTOMATION_TRIGGER, &json, self.max_age)
            .await
    }

    async fn log_trigger(&self, action: TriggerAction, trigger: &AutomationTrigger) {
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "action": action.as_str(),
            "source": trigger.source.as_deref().unwrap_or("unknown"),
            "original_timestamp": trigger.timestamp,
        });

        if let Err(e) = self
            .store
            .lpush_capped(keys::AUTOMATION_LOG, &entry.to_string(), TRIGGER_LOG_LIMIT)
            .await
        {
            debug!(error = %e, "Failed to append automation log entry");
        }
    }
}
