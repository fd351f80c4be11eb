//! Redis to WebSocket result bridge.
//!
//! Two independent loops run side by side:
//!
//! - **ResponseBridge**: blocks on `avai:queue:responses` and forwards each
//!   result to the WebSocket hub as an `ai_response` envelope
//! - **CanisterRequestProcessor**: polls the canister request lists, runs
//!   the operation and pushes the outcome onto `avai:canister:results`
//!
//! Each loop owns its own store connection and shares no in-process state
//! with the other.

pub mod canister;
pub mod consumer;
pub mod forwarder;

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info};

pub use canister::{queue_canister_request, CanisterRequestProcessor};
pub use consumer::{EntryOutcome, ResponseBridge};
pub use forwarder::{bridge_client_id, Forwarder, OutboundEnvelope, WebSocketForwarder};

use crate::error::BridgeError;

/// Runs the bridge loops until shutdown.
///
/// When one loop fails the other is told to stop, and the first error is
/// returned once both have finished.
pub async fn run_bridge(
    response_bridge: ResponseBridge,
    canister_processor: Option<CanisterRequestProcessor>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), BridgeError> {
    let mut tasks = JoinSet::new();

    let mut response_bridge = response_bridge;
    tasks.spawn(async move { ("response_bridge", response_bridge.consume_loop().await) });

    if let Some(mut processor) = canister_processor {
        tasks.spawn(async move { ("canister_bridge", processor.process_canister_requests().await) });
    } else {
        info!("Canister request loop disabled");
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let failure = match joined {
            Ok((_, Ok(()))) => None,
            Ok((name, Err(e))) => {
                error!(task = name, error = %e, "Bridge loop failed");
                Some(e)
            }
            Err(e) => Some(BridgeError::TaskFailed(e.to_string())),
        };

        if let Some(err) = failure {
            let _ = shutdown_tx.send(());
            first_error.get_or_insert(err);
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
