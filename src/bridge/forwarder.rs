//! Outbound result envelopes and the WebSocket forwarder.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::error::BridgeError;

/// Message type sent to the WebSocket hub.
pub const ENVELOPE_TYPE: &str = "ai_response";

/// Source tag carried by every envelope.
pub const ENVELOPE_SOURCE: &str = "response_bridge";

/// Builds the client id the bridge identifies itself with.
pub fn bridge_client_id() -> String {
    format!("response_bridge_{}", Utc::now().timestamp())
}

/// The frame sent to the WebSocket hub for one result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: Value,
    pub timestamp: Value,
    pub source: String,
    /// The originating client, taken from the result. Null when absent.
    pub client_id: Value,
}

impl OutboundEnvelope {
    /// Wraps a worker result.
    ///
    /// `payload` is the result's `payload` field when present, otherwise the
    /// whole result. `timestamp` is the result's own timestamp, or now in
    /// epoch seconds.
    pub fn from_result(result: Value) -> Self {
        let field = |name: &str| result.get(name).filter(|v| !v.is_null()).cloned();

        let timestamp = field("timestamp")
            .unwrap_or_else(|| json!(Utc::now().timestamp_millis() as f64 / 1000.0));
        let client_id = field("client_id").unwrap_or(Value::Null);
        let payload = field("payload").unwrap_or_else(|| result.clone());

        Self {
            message_type: ENVELOPE_TYPE.to_string(),
            payload,
            timestamp,
            source: ENVELOPE_SOURCE.to_string(),
            client_id,
        }
    }
}

/// Delivers envelopes to a downstream hub.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Sends one envelope. Delivery is attempted once.
    async fn forward(&self, envelope: &OutboundEnvelope) -> Result<(), BridgeError>;
}

/// Forwards each envelope over its own short-lived WebSocket connection.
#[derive(Debug, Clone)]
pub struct WebSocketForwarder {
    endpoint: String,
    connect_timeout: Duration,
}

impl WebSocketForwarder {
    /// Creates a forwarder for `base_url`, registering as a logger client.
    pub fn new(base_url: &str, client_id: &str, connect_timeout: Duration) -> Self {
        let separator = if base_url.contains('?') { '&' } else { '?' };
        Self {
            endpoint: format!("{base_url}{separator}type=logger&client_id={client_id}"),
            connect_timeout,
        }
    }

    /// The full URL connections are opened against.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Forwarder for WebSocketForwarder {
    async fn forward(&self, envelope: &OutboundEnvelope) -> Result<(), BridgeError> {
        let text = serde_json::to_string(envelope)?;

        let (mut ws, _) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(self.endpoint.as_str()),
        )
        .await
        .map_err(|_| BridgeError::ConnectTimeout {
            url: self.endpoint.clone(),
            timeout: self.connect_timeout,
        })?
        .map_err(|e| BridgeError::ConnectFailed {
            url: self.endpoint.clone(),
            reason: e.to_string(),
        })?;

        ws.send(Message::Text(text.into()))
            .await
            .map_err(|e| BridgeError::SendFailed(e.to_string()))?;

        // The frame is already written; a failed close handshake is not a delivery failure
        if let Err(e) = ws.close(None).await {
            debug!(error = %e, "WebSocket close failed");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    /// Accepts WebSocket connections and reports every text frame and the
    /// request path each connection used.
    async fn spawn_hub() -> (String, mpsc::UnboundedReceiver<(String, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let path = std::sync::Arc::new(std::sync::Mutex::new(String::new()));
                    let seen = path.clone();
                    let callback =
                        move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                            *seen.lock().unwrap() = req.uri().to_string();
                            Ok(resp)
                        };
                    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                    else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        if let Message::Text(text) = msg {
                            let uri = path.lock().unwrap().clone();
                            let _ = tx.send((uri, text.as_str().to_string()));
                        }
                    }
                });
            }
        });

        (format!("ws://{addr}/ws"), rx)
    }

    #[test]
    fn test_envelope_uses_payload_field() {
        let result = json!({
            "payload": {"text": "hello"},
            "timestamp": 1714560000.5,
            "client_id": "web_42"
        });
        let envelope = OutboundEnvelope::from_result(result);

        assert_eq!(envelope.message_type, "ai_response");
        assert_eq!(envelope.source, "response_bridge");
        assert_eq!(envelope.payload, json!({"text": "hello"}));
        assert_eq!(envelope.timestamp, json!(1714560000.5));
        assert_eq!(envelope.client_id, json!("web_42"));
    }

    #[test]
    fn test_envelope_falls_back_to_whole_result() {
        let result = json!({"response": "hi"});
        let envelope = OutboundEnvelope::from_result(result.clone());

        assert_eq!(envelope.payload, result);
        assert!(envelope.client_id.is_null());
        assert!(envelope.timestamp.as_f64().unwrap() > 0.0);

        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["type"], "ai_response");
    }

    #[test]
    fn test_endpoint_query() {
        let forwarder = WebSocketForwarder::new("ws://hub:8080/ws", "response_bridge_1", Duration::from_secs(10));
        assert_eq!(
            forwarder.endpoint(),
            "ws://hub:8080/ws?type=logger&client_id=response_bridge_1"
        );

        let forwarder = WebSocketForwarder::new("ws://hub/ws?token=x", "b", Duration::from_secs(1));
        assert_eq!(forwarder.endpoint(), "ws://hub/ws?token=x&type=logger&client_id=b");
    }

    #[test]
    fn test_bridge_client_id_format() {
        let id = bridge_client_id();
        let secs = id.strip_prefix("response_bridge_").unwrap();
        assert!(secs.parse::<i64>().is_ok());
    }

    #[tokio::test]
    async fn test_forward_sends_one_frame() {
        let (url, mut rx) = spawn_hub().await;
        let forwarder = WebSocketForwarder::new(&url, "response_bridge_7", Duration::from_secs(5));

        let envelope = OutboundEnvelope::from_result(json!({"payload": "done", "client_id": "c1"}));
        forwarder.forward(&envelope).await.unwrap();

        let (uri, text) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(uri.contains("type=logger"));
        assert!(uri.contains("client_id=response_bridge_7"));

        let received: OutboundEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(received, envelope);
    }

    #[tokio::test]
    async fn test_forward_connect_failure() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let forwarder = WebSocketForwarder::new(&format!("ws://{addr}/ws"), "b", Duration::from_secs(2));
        let envelope = OutboundEnvelope::from_result(json!({"payload": 1}));
        let err = forwarder.forward(&envelope).await.unwrap_err();

        assert!(matches!(
            err,
            BridgeError::ConnectFailed { .. } | BridgeError::ConnectTimeout { .. }
        ));
    }
}
