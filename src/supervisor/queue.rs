//! Prompt queue inspection.
//!
//! The supervisor never dequeues prompts itself; the worker does. It only
//! needs to know whether there is work, which it learns from two sources:
//!
//! - `avai:prompt_queue`: a sorted set of pending prompts scored by priority
//! - `avai:processing_prompts:*`: marker keys the worker writes while a prompt
//!   is in flight
//!
//! Counting markers uses incremental SCAN so large keyspaces never block
//! Redis.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{keys, Store};

/// Snapshot of the prompt queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// Prompts waiting in the sorted set.
    pub pending: u64,
    /// Prompts currently marked as being processed.
    pub processing: u64,
}

impl QueueDepth {
    /// Returns pending plus in-flight prompts.
    pub fn total(&self) -> u64 {
        self.pending + self.processing
    }

    /// Returns true if a worker should be started.
    ///
    /// In-flight markers alone do not count: they belong to a worker that is
    /// already running or to one that died, and in both cases starting another
    /// worker would not drain anything.
    pub fn has_work(&self) -> bool {
        self.pending > 0
    }
}

/// A prompt waiting for the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptQueueEntry {
    /// Unique prompt identifier.
    pub id: Uuid,
    /// Opaque prompt payload consumed by the worker.
    pub payload: Value,
    /// Sorted set score. Higher values are served first by the worker.
    pub priority: f64,
    /// When the prompt was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

impl PromptQueueEntry {
    /// Creates an entry with a fresh id.
    pub fn new(payload: Value, priority: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            priority,
            enqueued_at: Utc::now(),
        }
    }
}

/// Read access to the prompt queue.
#[derive(Clone)]
pub struct PromptQueue {
    store: Arc<dyn Store>,
}

impl PromptQueue {
    /// Creates a queue view over the given store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Returns the number of pending and in-flight prompts.
    ///
    /// Has no side effects on the queue.
    pub async fn check_queue_depth(&self) -> Result<QueueDepth, StoreError> {
        let pending = self.store.zcard(keys::PROMPT_QUEUE).await?;
        let processing = self.store.count_matching(keys::PROCESSING_MARKERS).await?;
        Ok(QueueDepth {
            pending,
            processing,
        })
    }

    /// Adds a prompt to the queue.
    ///
    /// Producers normally do this themselves; this exists for operators and
    /// tests.
    pub async fn enqueue(&self, entry: &PromptQueueEntry) -> Result<(), StoreError> {
        let member = serde_json::to_string(entry)?;
        self.store
            .zadd(keys::PROMPT_QUEUE, &member, entry.priority)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_empty_queue() {
        let queue = PromptQueue::new(Arc::new(MemoryStore::new()));
        let depth = queue.check_queue_depth().await.unwrap();
        assert_eq!(depth, QueueDepth::default());
        assert!(!depth.has_work());
    }

    #[tokio::test]
    async fn test_enqueue_increments_pending() {
        let queue = PromptQueue::new(Arc::new(MemoryStore::new()));
        queue
            .enqueue(&PromptQueueEntry::new(json!({"prompt": "audit"}), 1.0))
            .await
            .unwrap();
        queue
            .enqueue(&PromptQueueEntry::new(json!({"prompt": "deploy"}), 5.0))
            .await
            .unwrap();

        let depth = queue.check_queue_depth().await.unwrap();
        assert_eq!(depth.pending, 2);
        assert!(depth.has_work());
    }

    #[tokio::test]
    async fn test_processing_markers_counted_but_not_work() {
        let store = Arc::new(MemoryStore::new());
        store.set("avai:processing_prompts:abc", "1");
        store.set("avai:processing_prompts:def", "1");

        let queue = PromptQueue::new(store);
        let depth = queue.check_queue_depth().await.unwrap();
        assert_eq!(depth.processing, 2);
        assert_eq!(depth.total(), 2);
        assert!(!depth.has_work());
    }

    #[tokio::test]
    async fn test_check_depth_has_no_side_effects() {
        let store = Arc::new(MemoryStore::new());
        let queue = PromptQueue::new(store.clone());
        queue
            .enqueue(&PromptQueueEntry::new(json!("p"), 1.0))
            .await
            .unwrap();

        for _ in 0..3 {
            assert_eq!(queue.check_queue_depth().await.unwrap().pending, 1);
        }
    }

    #[tokio::test]
    async fn test_store_error_propagates() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let queue = PromptQueue::new(store);
        assert!(queue.check_queue_depth().await.is_err());
    }
}
