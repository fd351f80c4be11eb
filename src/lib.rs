//! avai-dispatch: queue-driven worker supervision and result bridging for AVAI.
//!
//! The supervisor keeps a single worker process alive while prompts wait in
//! Redis, and the bridge forwards the worker's results to the WebSocket hub.

pub mod bridge;
pub mod canister;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod status;
pub mod store;
pub mod supervisor;

pub use error::{BridgeError, CanisterError, ProcessError, StoreError};
