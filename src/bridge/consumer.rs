//! Consumes worker results from Redis and forwards them to the hub.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::forwarder::{Forwarder, OutboundEnvelope};
use crate::config::DispatchConfig;
use crate::error::BridgeError;
use crate::metrics::MetricsCollector;
use crate::status::StatusReporter;
use crate::store::{keys, Store};
use crate::supervisor::RetryPolicy;

/// Outcome of handling one popped entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    Forwarded,
    Failed,
    Malformed,
}

impl EntryOutcome {
    fn label(&self) -> &'static str {
        match self {
            EntryOutcome::Forwarded => "forwarded",
            EntryOutcome::Failed => "failed",
            EntryOutcome::Malformed => "malformed",
        }
    }
}

/// Moves results from `avai:queue:responses` to the WebSocket hub.
///
/// Delivery is at-most-once: an entry is removed by the pop before the
/// forward is attempted and is not requeued when forwarding fails.
pub struct ResponseBridge {
    store: Arc<dyn Store>,
    forwarder: Arc<dyn Forwarder>,
    reporter: StatusReporter,
    metrics: MetricsCollector,
    client_id: String,
    websocket_url: String,
    pop_timeout: Duration,
    retry: RetryPolicy,
    health_interval: Duration,
    last_health: Option<Instant>,
    forwarded: u64,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ResponseBridge {
    /// Creates a bridge.
    ///
    /// `store` should own a dedicated connection, since the blocking pop
    /// holds it for up to `pop_timeout`.
    pub fn new(
        config: &DispatchConfig,
        store: Arc<dyn Store>,
        forwarder: Arc<dyn Forwarder>,
        client_id: impl Into<String>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            reporter: StatusReporter::new(store.clone(), config.status_ttl),
            store,
            forwarder,
            metrics: MetricsCollector::new(),
            client_id: client_id.into(),
            websocket_url: config.websocket_url.clone(),
            pop_timeout: config.pop_timeout,
            retry: config.bridge_retry,
            health_interval: config.health_interval,
            last_health: None,
            forwarded: 0,
            shutdown_rx,
        }
    }

    /// Number of results forwarded so far.
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    /// Handles one raw entry popped from the results list.
    pub async fn handle_entry(&mut self, raw: &str) -> EntryOutcome {
        let result: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, entry = %truncate(raw, 200), "Discarding malformed result");
                self.metrics.record_bridge_message(EntryOutcome::Malformed.label());
                return EntryOutcome::Malformed;
            }
        };

        let envelope = OutboundEnvelope::from_result(result);
        let outcome = match self.forwarder.forward(&envelope).await {
            Ok(()) => {
                self.forwarded += 1;
                debug!(client_id = %envelope.client_id, "Forwarded result");
                EntryOutcome::Forwarded
            }
            Err(e) => {
                warn!(client_id = %envelope.client_id, error = %e, "Failed to forward result, dropping");
                EntryOutcome::Failed
            }
        };

        self.metrics.record_bridge_message(outcome.label());
        outcome
    }

    /// Runs until shutdown or until Redis stays unreachable for
    /// `bridge_retry.max_consecutive_failures` attempts in a row.
    pub async fn consume_loop(&mut self) -> Result<(), BridgeError> {
        info!(
            client_id = %self.client_id,
            websocket_url = %self.websocket_url,
            "Response bridge started"
        );

        let mut failures = 0u32;
        loop {
            self.heartbeat().await;

            let popped = tokio::select! {
                popped = self.store.brpop(keys::RESPONSES, self.pop_timeout) => popped,
                _ = self.shutdown_rx.recv() => break,
            };

            match popped {
                Ok(Some(raw)) => {
                    failures = 0;
                    self.handle_entry(&raw).await;
                }
                Ok(None) => failures = 0,
                Err(e) => {
                    failures += 1;
                    self.metrics.record_store_error("bridge");
                    if self.retry.is_exhausted(failures) {
                        error!(attempts = failures, error = %e, "Redis unreachable, stopping response bridge");
                        return Err(BridgeError::StoreExhausted {
                            attempts: failures,
                            source: e,
                        });
                    }

                    let delay = self.retry.delay_for(failures);
                    warn!(
                        attempt = failures,
                        delay_secs = delay.as_secs_f64(),
                        error = %e,
                        "Failed to pop result, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown_rx.recv() => break,
                    }
                }
            }
        }

        info!(forwarded = self.forwarded, "Response bridge stopped");
        Ok(())
    }

    async fn heartbeat(&mut self) {
        let due = self
            .last_health
            .map_or(true, |last| last.elapsed() >= self.health_interval);
        if !due {
            return;
        }
        self.last_health = Some(Instant::now());

        let mut extra = Map::new();
        extra.insert("client_id".to_string(), json!(self.client_id));
        extra.insert("websocket_url".to_string(), json!(self.websocket_url));
        extra.insert("forwarded".to_string(), json!(self.forwarded));
        self.reporter
            .publish_health(keys::BRIDGE_HEALTH, "response_bridge", extra)
            .await;
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingForwarder {
        sent: Mutex<Vec<OutboundEnvelope>>,
        fail: bool,
    }

    #[async_trait]
    impl Forwarder for RecordingForwarder {
        async fn forward(&self, envelope: &OutboundEnvelope) -> Result<(), BridgeError> {
            if self.fail {
                return Err(BridgeError::SendFailed("hub down".to_string()));
            }
            self.sent.lock().unwrap().push(envelope.clone());
            Ok(())
        }
    }

    fn test_config() -> DispatchConfig {
        let mut config = DispatchConfig::default();
        config.pop_timeout = Duration::from_millis(50);
        config.bridge_retry = RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(20), 3);
        config
    }

    fn bridge(
        store: Arc<MemoryStore>,
        forwarder: Arc<RecordingForwarder>,
    ) -> (ResponseBridge, broadcast::Sender<()>) {
        let (tx, rx) = broadcast::channel(1);
        let bridge = ResponseBridge::new(&test_config(), store, forwarder, "response_bridge_1", rx);
        (bridge, tx)
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("ab", 3), "ab");
        assert_eq!(truncate("héllo", 2), "hé");
    }

    #[tokio::test]
    async fn test_handle_entry_outcomes() {
        let store = Arc::new(MemoryStore::new());
        let forwarder = Arc::new(RecordingForwarder::default());
        let (mut bridge, _tx) = bridge(store, forwarder.clone());

        assert_eq!(
            bridge.handle_entry(r#"{"payload":"ok","client_id":"c"}"#).await,
            EntryOutcome::Forwarded
        );
        assert_eq!(bridge.handle_entry("not json {").await, EntryOutcome::Malformed);
        assert_eq!(bridge.forwarded(), 1);
        assert_eq!(forwarder.sent.lock().unwrap()[0].payload, json!("ok"));
    }

    #[tokio::test]
    async fn test_forward_failure_drops_entry() {
        let store = Arc::new(MemoryStore::new());
        let forwarder = Arc::new(RecordingForwarder {
            fail: true,
            ..Default::default()
        });
        let (mut bridge, _tx) = bridge(store.clone(), forwarder);

        assert_eq!(bridge.handle_entry(r#"{"payload":1}"#).await, EntryOutcome::Failed);
        assert_eq!(bridge.forwarded(), 0);
        assert!(store.list(keys::RESPONSES).is_empty());
    }

    #[tokio::test]
    async fn test_consume_loop_forwards_in_order_and_stops() {
        let store = Arc::new(MemoryStore::new());
        let forwarder = Arc::new(RecordingForwarder::default());
        let (mut bridge, tx) = bridge(store.clone(), forwarder.clone());

        // LPUSH + BRPOP is FIFO
        for i in 0..3 {
            store
                .lpush(keys::RESPONSES, &json!({"payload": i}).to_string())
                .await
                .unwrap();
        }
        store.lpush(keys::RESPONSES, "garbage").await.unwrap();

        let handle = tokio::spawn(async move {
            let result = bridge.consume_loop().await;
            (bridge, result)
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(()).unwrap();
        let (bridge, result) = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(result.is_ok());
        assert_eq!(bridge.forwarded(), 3);
        let payloads: Vec<Value> = forwarder
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.payload.clone())
            .collect();
        assert_eq!(payloads, vec![json!(0), json!(1), json!(2)]);
        assert!(store.list(keys::RESPONSES).is_empty());
        assert!(store.exists(keys::BRIDGE_HEALTH));
    }

    #[tokio::test]
    async fn test_consume_loop_gives_up_when_store_down() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let forwarder = Arc::new(RecordingForwarder::default());
        let (mut bridge, _tx) = bridge(store, forwarder);

        let result = tokio::time::timeout(Duration::from_secs(2), bridge.consume_loop())
            .await
            .unwrap();

        match result {
            Err(BridgeError::StoreExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected StoreExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_consume_loop_recovers_after_transient_errors() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let forwarder = Arc::new(RecordingForwarder::default());
        let mut config = test_config();
        config.bridge_retry = RetryPolicy::new(Duration::from_millis(20), Duration::from_millis(200), 3);
        let (tx, rx) = broadcast::channel(1);
        let mut bridge = ResponseBridge::new(&config, store.clone(), forwarder.clone(), "b", rx);

        let handle = tokio::spawn(async move { bridge.consume_loop().await });

        // First retry happens 40ms after the first failure
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.set_available(true);
        store.lpush(keys::RESPONSES, r#"{"payload":"late"}"#).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(result.is_ok());
        assert_eq!(forwarder.sent.lock().unwrap().len(), 1);
    }
}
