//! In-process store with Redis-like semantics.
//!
//! Strings honour TTLs, lists pop from the tail, sorted sets count members,
//! and `brpop` wakes as soon as another task pushes. The store can be marked
//! unavailable to simulate a Redis outage.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::Store;
use crate::error::StoreError;

#[derive(Debug, Clone)]
enum Value {
    Str {
        value: String,
        expires_at: Option<Instant>,
    },
    List(VecDeque<String>),
    SortedSet(Vec<(String, f64)>),
}

/// In-memory `Store` implementation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Value>>,
    pushed: Notify,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Returns the remaining TTL of a string key, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let data = self.data.lock().expect("store lock poisoned");
        match data.get(key) {
            Some(Value::Str {
                expires_at: Some(at),
                ..
            }) => Some(at.saturating_duration_since(Instant::now())),
            _ => None,
        }
    }

    /// Returns a copy of a list, head first.
    pub fn list(&self, key: &str) -> Vec<String> {
        let data = self.data.lock().expect("store lock poisoned");
        match data.get(key) {
            Some(Value::List(items)) => items.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Writes a string without expiry.
    pub fn set(&self, key: &str, value: &str) {
        let mut data = self.data.lock().expect("store lock poisoned");
        data.insert(
            key.to_string(),
            Value::Str {
                value: value.to_string(),
                expires_at: None,
            },
        );
    }

    /// Removes a key of any type.
    pub fn del(&self, key: &str) {
        let mut data = self.data.lock().expect("store lock poisoned");
        data.remove(key);
    }

    /// Returns whether a key exists (expired strings count as missing).
    pub fn exists(&self, key: &str) -> bool {
        let mut data = self.data.lock().expect("store lock poisoned");
        purge_expired(&mut data, key);
        data.contains_key(key)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    fn try_pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut data = self.data.lock().expect("store lock poisoned");
        let popped = match data.get_mut(key) {
            Some(Value::List(items)) => items.pop_back(),
            Some(_) => return Err(StoreError::WrongType(key.to_string())),
            None => None,
        };
        if matches!(data.get(key), Some(Value::List(items)) if items.is_empty()) {
            data.remove(key);
        }
        Ok(popped)
    }
}

fn purge_expired(data: &mut HashMap<String, Value>, key: &str) {
    let expired = matches!(
        data.get(key),
        Some(Value::Str { expires_at: Some(at), .. }) if *at <= Instant::now()
    );
    if expired {
        data.remove(key);
    }
}

/// Matches a Redis glob supporting `*` only, which is all the key patterns
/// in this crate use.
fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let mut rest = key;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let data = self.data.lock().expect("store lock poisoned");
        match data.get(key) {
            Some(Value::SortedSet(members)) => Ok(members.len() as u64),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(0),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.check_available()?;
        let mut data = self.data.lock().expect("store lock poisoned");
        let entry = data
            .entry(key.to_string())
            .or_insert_with(|| Value::SortedSet(Vec::new()));
        match entry {
            Value::SortedSet(members) => {
                match members.iter_mut().find(|(m, _)| m == member) {
                    Some(existing) => existing.1 = score,
                    None => members.push((member.to_string(), score)),
                }
                Ok(())
            }
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn count_matching(&self, pattern: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let data = self.data.lock().expect("store lock poisoned");
        let count = data
            .iter()
            .filter(|(key, value)| {
                let live = !matches!(
                    value,
                    Value::Str { expires_at: Some(at), .. } if *at <= now
                );
                live && glob_match(pattern, key)
            })
            .count();
        Ok(count as u64)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let mut data = self.data.lock().expect("store lock poisoned");
        purge_expired(&mut data, key);
        match data.get(key) {
            Some(Value::Str { value, .. }) => Ok(Some(value.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let mut data = self.data.lock().expect("store lock poisoned");
        purge_expired(&mut data, key);
        match data.get(key) {
            Some(Value::Str { .. }) => match data.remove(key) {
                Some(Value::Str { value, .. }) => Ok(Some(value)),
                _ => Ok(None),
            },
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check_available()?;
        let mut data = self.data.lock().expect("store lock poisoned");
        data.insert(
            key.to_string(),
            Value::Str {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lpush_capped(key, value, usize::MAX).await
    }

    async fn lpush_capped(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        {
            let mut data = self.data.lock().expect("store lock poisoned");
            let entry = data
                .entry(key.to_string())
                .or_insert_with(|| Value::List(VecDeque::new()));
            match entry {
                Value::List(items) => {
                    items.push_front(value.to_string());
                    items.truncate(max_len);
                }
                _ => return Err(StoreError::WrongType(key.to_string())),
            }
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        self.try_pop(key)
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.check_available()?;

            // Register interest before checking so a concurrent push is not missed
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_pop(key)? {
                return Ok(Some(value));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let data = self.data.lock().expect("store lock poisoned");
        match data.get(key) {
            Some(Value::List(items)) => Ok(items.len() as u64),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(0),
        }
    }
}
