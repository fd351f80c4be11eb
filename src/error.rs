//! Error types for avai-dispatch operations.
//!
//! Defines error types for the major subsystems:
//! - Redis store access
//! - Worker process management
//! - Result bridge forwarding
//! - Canister CLI invocation

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to the key/value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Key '{0}' holds a value of the wrong type")]
    WrongType(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur while managing a worker subprocess.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal process {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },

    #[error("Process has no pid (already reaped)")]
    NoPid,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur in the result bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("WebSocket connection to {url} failed: {reason}")]
    ConnectFailed { url: String, reason: String },

    #[error("WebSocket connection to {url} timed out after {timeout:?}")]
    ConnectTimeout { url: String, timeout: Duration },

    #[error("WebSocket send failed: {0}")]
    SendFailed(String),

    #[error("Store unreachable after {attempts} consecutive failures: {source}")]
    StoreExhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("Bridge task failed: {0}")]
    TaskFailed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while invoking the canister CLI.
#[derive(Debug, Error)]
pub enum CanisterError {
    #[error("Invalid canister request: {0}")]
    InvalidRequest(String),

    #[error("Canister command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Canister command exited with {exit_code:?}: {stderr}")]
    CommandFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to run canister command: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let err = StoreError::WrongType("avai:prompt_queue".to_string());
        assert!(err.to_string().contains("avai:prompt_queue"));
    }

    #[test]
    fn test_bridge_error_display() {
        let err = BridgeError::ConnectTimeout {
            url: "ws://localhost:8080/ws".to_string(),
            timeout: Duration::from_secs(10),
        };
        assert!(err.to_string().contains("ws://localhost:8080/ws"));
        assert!(err.to_string().contains("10"));

        let err = BridgeError::StoreExhausted {
            attempts: 5,
            source: StoreError::Unavailable("down".to_string()),
        };
        assert!(err.to_string().contains("5 consecutive"));
    }

    #[test]
    fn test_process_error_display() {
        let err = ProcessError::SpawnFailed {
            program: "python3".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert!(err.to_string().contains("python3"));
    }
}
