//! Key/value store access shared by the supervisor and the bridge.
//!
//! All coordination between the producer, the supervisor, the worker and the
//! bridge happens through Redis keys, lists and sorted sets. This module
//! provides:
//!
//! - **Store**: the narrow set of Redis operations the system relies on
//! - **RedisStore**: the production implementation over a `ConnectionManager`
//! - **MemoryStore**: an in-process implementation with the same semantics
//!
//! # Connections
//!
//! `BRPOP` holds its connection until it returns, so every loop that blocks
//! on a list owns its own `RedisStore` instead of sharing one.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Redis key names. These are shared with external producers and consumers
/// and must not change.
pub mod keys {
    /// Sorted set of pending prompts (JSON member, priority score).
    pub const PROMPT_QUEUE: &str = "avai:prompt_queue";
    /// Glob for in-flight prompt markers written by the worker.
    pub const PROCESSING_MARKERS: &str = "avai:processing_prompts:*";
    /// One-shot automation trigger (JSON string).
    pub const AUTOMATION_TRIGGER: &str = "avai:automation:trigger";
    /// Recently consumed triggers, newest first.
    pub const AUTOMATION_LOG: &str = "avai:automation:log";
    /// Supervisor heartbeat.
    pub const AUTOMATION_HEALTH: &str = "avai:automation:health";
    /// Worker state reported by the supervisor.
    pub const WORKER_STATUS: &str = "avai:worker:status";
    /// Results awaiting WebSocket forwarding.
    pub const RESPONSES: &str = "avai:queue:responses";
    /// Bridge heartbeat.
    pub const BRIDGE_HEALTH: &str = "avai:bridge:health";
    /// Pending canister deploy requests.
    pub const CANISTER_DEPLOY_QUEUE: &str = "avai:canister:deploy_queue";
    /// Pending canister query requests.
    pub const CANISTER_QUERY_QUEUE: &str = "avai:canister:query_queue";
    /// Canister operation results keyed by request id.
    pub const CANISTER_RESULTS: &str = "avai:canister:results";
}

/// The Redis operations used by avai-dispatch.
///
/// Every method is a single round-trip (or a single MULTI block), so callers
/// can treat each call as atomic.
#[async_trait]
pub trait Store: Send + Sync {
    /// Checks connectivity.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Returns the cardinality of a sorted set (0 if missing).
    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    /// Adds a member to a sorted set.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Counts keys matching a glob pattern using incremental SCAN.
    async fn count_matching(&self, pattern: &str) -> Result<u64, StoreError>;

    /// Reads a string value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Reads and deletes a string value in one atomic step.
    async fn get_del(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes a string value that expires after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Pushes onto the head of a list.
    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Pushes onto the head of a list and trims it to `max_len` entries.
    async fn lpush_capped(&self, key: &str, value: &str, max_len: usize)
        -> Result<(), StoreError>;

    /// Pops from the tail of a list without blocking.
    async fn rpop(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Pops from the tail of a list, waiting at most `timeout`.
    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError>;

    /// Returns the length of a list (0 if missing).
    async fn llen(&self, key: &str) -> Result<u64, StoreError>;
}
