//! Canister request loop and its producer helper.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::canister::{CanisterManager, CanisterRequest, CanisterRequestKind, CanisterResult};
use crate::config::DispatchConfig;
use crate::error::{BridgeError, StoreError};
use crate::metrics::MetricsCollector;
use crate::store::{keys, Store};
use crate::supervisor::RetryPolicy;

/// Source tag on every published canister result.
pub const RESULT_SOURCE: &str = "canister_bridge";

/// Request lists in the order they are polled each iteration.
const POLL_ORDER: [CanisterRequestKind; 2] =
    [CanisterRequestKind::Deploy, CanisterRequestKind::Query];

/// Queues a canister request for the bridge and returns its request id.
///
/// `data` carries the request fields (`canister_name`, `method`, `args`,
/// `network`) and is nested under `data` in the queued entry.
pub async fn queue_canister_request(
    store: &dyn Store,
    kind: CanisterRequestKind,
    data: Value,
) -> Result<String, StoreError> {
    let now = Utc::now();
    let request_id = format!(
        "canister_req_{}_{}",
        now.timestamp_millis(),
        Uuid::new_v4().simple()
    );
    let entry = json!({
        "request_id": request_id,
        "type": kind.as_str(),
        "data": data,
        "timestamp": now.to_rfc3339(),
    });

    store
        .lpush(kind.queue_key(), &serde_json::to_string(&entry)?)
        .await?;
    info!(request_id = %request_id, kind = kind.as_str(), "Queued canister request");
    Ok(request_id)
}

/// Builds a failed result for a request that did not validate but still
/// carries a usable `request_id`.
fn rejected_result(raw: &str, error: &str) -> Option<(String, CanisterResult)> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let lookup = |name: &str| {
        value
            .get(name)
            .or_else(|| value.get("data").and_then(|d| d.get(name)))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let request_id = lookup("request_id")?;
    let result = CanisterResult {
        success: false,
        canister_name: lookup("canister_name"),
        method: lookup("method"),
        error: Some(error.to_string()),
        ..Default::default()
    };
    Some((request_id, result))
}

/// Polls the canister request lists and publishes results.
pub struct CanisterRequestProcessor {
    store: Arc<dyn Store>,
    manager: Arc<dyn CanisterManager>,
    metrics: MetricsCollector,
    poll_interval: Duration,
    retry: RetryPolicy,
    processed: u64,
    shutdown_rx: broadcast::Receiver<()>,
}

impl CanisterRequestProcessor {
    /// Creates a processor reading from `store`.
    pub fn new(
        config: &DispatchConfig,
        store: Arc<dyn Store>,
        manager: Arc<dyn CanisterManager>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            store,
            manager,
            metrics: MetricsCollector::new(),
            poll_interval: config.canister_poll_interval,
            retry: config.bridge_retry,
            processed: 0,
            shutdown_rx,
        }
    }

    /// Number of requests executed so far.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Pops at most one request from each list. Returns how many were taken.
    pub async fn poll_once(&mut self) -> Result<usize, StoreError> {
        let mut taken = 0;
        for kind in POLL_ORDER {
            if let Some(raw) = self.store.rpop(kind.queue_key()).await? {
                taken += 1;
                self.handle_request(kind, &raw).await?;
            }
        }
        Ok(taken)
    }

    async fn handle_request(&mut self, kind: CanisterRequestKind, raw: &str) -> Result<(), StoreError> {
        let request = match CanisterRequest::parse(kind, raw) {
            Ok(request) => request,
            Err(e) => {
                self.metrics.record_canister_request(kind.as_str(), false);
                let error = e.to_string();
                return match rejected_result(raw, &error) {
                    Some((request_id, result)) => {
                        warn!(
                            request_id = %request_id,
                            kind = kind.as_str(),
                            error = %error,
                            "Rejected invalid canister request"
                        );
                        self.publish_result(&request_id, &result).await
                    }
                    None => {
                        warn!(
                            kind = kind.as_str(),
                            error = %error,
                            "Dropping canister request without request_id"
                        );
                        Ok(())
                    }
                };
            }
        };

        debug!(request_id = %request.request_id, kind = kind.as_str(), "Processing canister request");
        let result = self.manager.execute(&request).await;
        self.processed += 1;
        self.metrics.record_canister_request(kind.as_str(), result.success);

        self.publish_result(&request.request_id, &result).await
    }

    async fn publish_result(&self, request_id: &str, result: &CanisterResult) -> Result<(), StoreError> {
        let entry = json!({
            "request_id": request_id,
            "result": result.to_value(),
            "timestamp": Utc::now().to_rfc3339(),
            "source": RESULT_SOURCE,
        });
        self.store
            .lpush(keys::CANISTER_RESULTS, &serde_json::to_string(&entry)?)
            .await
    }

    /// Runs until shutdown or until Redis stays unreachable for
    /// `bridge_retry.max_consecutive_failures` attempts in a row.
    pub async fn process_canister_requests(&mut self) -> Result<(), BridgeError> {
        info!(poll_interval_ms = self.poll_interval.as_millis() as u64, "Canister request loop started");

        let mut failures = 0u32;
        loop {
            let delay = match self.poll_once().await {
                Ok(0) => {
                    failures = 0;
                    self.poll_interval
                }
                Ok(_) => {
                    failures = 0;
                    Duration::ZERO
                }
                Err(e) => {
                    failures += 1;
                    self.metrics.record_store_error("canister_bridge");
                    if self.retry.is_exhausted(failures) {
                        error!(attempts = failures, error = %e, "Redis unreachable, stopping canister loop");
                        return Err(BridgeError::StoreExhausted {
                            attempts: failures,
                            source: e,
                        });
                    }
                    let delay = self.retry.delay_for(failures);
                    warn!(attempt = failures, error = %e, "Canister request poll failed, backing off");
                    delay
                }
            };

            match self.shutdown_rx.try_recv() {
                Err(broadcast::error::TryRecvError::Empty) => {}
                _ => break,
            }
            if delay.is_zero() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown_rx.recv() => break,
            }
        }

        info!(processed = self.processed, "Canister request loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockManager {
        calls: Mutex<Vec<(CanisterRequestKind, String)>>,
    }

    #[async_trait]
    impl CanisterManager for MockManager {
        async fn deploy(&self, request: &CanisterRequest) -> CanisterResult {
            self.calls
                .lock()
                .unwrap()
                .push((request.kind, request.canister_name.clone()));
            CanisterResult::succeeded(request, "local", "Deployed".to_string())
        }

        async fn query(&self, request: &CanisterRequest) -> CanisterResult {
            self.calls
                .lock()
                .unwrap()
                .push((request.kind, request.canister_name.clone()));
            CanisterResult::failed(request, "no such method")
        }
    }

    fn processor(store: Arc<MemoryStore>, manager: Arc<MockManager>) -> (CanisterRequestProcessor, broadcast::Sender<()>) {
        let mut config = DispatchConfig::default();
        config.canister_poll_interval = Duration::from_millis(20);
        config.bridge_retry = RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(20), 3);
        let (tx, rx) = broadcast::channel(1);
        (CanisterRequestProcessor::new(&config, store, manager, rx), tx)
    }

    fn results(store: &MemoryStore) -> Vec<Value> {
        store
            .list(keys::CANISTER_RESULTS)
            .iter()
            .map(|raw| serde_json::from_str(raw).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_queue_canister_request_shape() {
        let store = MemoryStore::new();
        let id = queue_canister_request(
            &store,
            CanisterRequestKind::Query,
            json!({"canister_name": "avai_main", "method": "status"}),
        )
        .await
        .unwrap();

        assert!(id.starts_with("canister_req_"));
        let queued = store.list(keys::CANISTER_QUERY_QUEUE);
        assert_eq!(queued.len(), 1);

        let entry: Value = serde_json::from_str(&queued[0]).unwrap();
        assert_eq!(entry["request_id"], id.as_str());
        assert_eq!(entry["type"], "query");
        assert_eq!(entry["data"]["method"], "status");

        // The processor accepts what the helper produces
        let parsed = CanisterRequest::parse(CanisterRequestKind::Query, &queued[0]).unwrap();
        assert_eq!(parsed.canister_name, "avai_main");
    }

    #[tokio::test]
    async fn test_queued_request_ids_are_unique() {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for _ in 0..2 {
            let id = queue_canister_request(
                &store,
                CanisterRequestKind::Deploy,
                json!({"canister_name": "avai"}),
            )
            .await
            .unwrap();
            assert!(id.starts_with("canister_req_"));
            ids.push(id);
        }
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn test_poll_once_processes_deploy_then_query() {
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(MockManager::default());
        let (mut processor, _tx) = processor(store.clone(), manager.clone());

        store
            .lpush(
                keys::CANISTER_QUERY_QUEUE,
                r#"{"request_id":"q1","canister_name":"b","method":"get"}"#,
            )
            .await
            .unwrap();
        store
            .lpush(keys::CANISTER_DEPLOY_QUEUE, r#"{"request_id":"d1","canister_name":"a"}"#)
            .await
            .unwrap();

        assert_eq!(processor.poll_once().await.unwrap(), 2);
        assert_eq!(
            *manager.calls.lock().unwrap(),
            vec![
                (CanisterRequestKind::Deploy, "a".to_string()),
                (CanisterRequestKind::Query, "b".to_string()),
            ]
        );

        // LPUSH puts the newest result at the head
        let published = results(&store);
        assert_eq!(published.len(), 2);
        assert_eq!(published[1]["request_id"], "d1");
        assert_eq!(published[1]["result"]["success"], true);
        assert_eq!(published[1]["source"], "canister_bridge");
        assert_eq!(published[0]["request_id"], "q1");
        assert_eq!(published[0]["result"]["error"], "no such method");
    }

    #[tokio::test]
    async fn test_invalid_request_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(MockManager::default());
        let (mut processor, _tx) = processor(store.clone(), manager.clone());

        store
            .lpush(keys::CANISTER_DEPLOY_QUEUE, r#"{"canister_name":"a"}"#)
            .await
            .unwrap();
        store.lpush(keys::CANISTER_QUERY_QUEUE, "{{{").await.unwrap();

        assert_eq!(processor.poll_once().await.unwrap(), 2);
        assert!(manager.calls.lock().unwrap().is_empty());
        assert!(results(&store).is_empty());
        assert!(store.list(keys::CANISTER_DEPLOY_QUEUE).is_empty());
        assert_eq!(processor.processed(), 0);
    }

    #[tokio::test]
    async fn test_invalid_request_with_id_gets_failed_result() {
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(MockManager::default());
        let (mut processor, _tx) = processor(store.clone(), manager.clone());

        // Query without a method
        store
            .lpush(keys::CANISTER_QUERY_QUEUE, r#"{"request_id":"X","canister_name":"avai"}"#)
            .await
            .unwrap();
        store
            .lpush(
                keys::CANISTER_DEPLOY_QUEUE,
                r#"{"request_id":"Y","type":"deploy","data":{}}"#,
            )
            .await
            .unwrap();

        assert_eq!(processor.poll_once().await.unwrap(), 2);
        assert!(manager.calls.lock().unwrap().is_empty());
        assert_eq!(processor.processed(), 0);

        let published = results(&store);
        assert_eq!(published.len(), 2);
        assert_eq!(published[1]["request_id"], "Y");
        assert_eq!(published[1]["result"]["success"], false);
        assert!(published[1]["result"]["error"].is_string());

        assert_eq!(published[0]["request_id"], "X");
        assert_eq!(published[0]["source"], "canister_bridge");
        assert_eq!(published[0]["result"]["success"], false);
        assert_eq!(published[0]["result"]["canister_name"], "avai");
        assert!(published[0]["result"]["error"].is_string());
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(MockManager::default());
        let (mut processor, tx) = processor(store.clone(), manager);

        let handle = tokio::spawn(async move {
            let result = processor.process_canister_requests().await;
            (processor, result)
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        queue_canister_request(store.as_ref(), CanisterRequestKind::Deploy, json!({"canister_name": "late"}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(()).unwrap();

        let (processor, result) = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(processor.processed(), 1);
        assert_eq!(results(&store).len(), 1);
    }

    #[tokio::test]
    async fn test_loop_gives_up_when_store_down() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let manager = Arc::new(MockManager::default());
        let (mut processor, _tx) = processor(store, manager);

        let result = tokio::time::timeout(Duration::from_secs(2), processor.process_canister_requests())
            .await
            .unwrap();
        assert!(matches!(result, Err(BridgeError::StoreExhausted { attempts: 3, .. })));
    }
}
