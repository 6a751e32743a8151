//! # Key/value store port.
//!
//! The engines never talk to a concrete Redis client; they consume the
//! [`KvStore`] trait, which covers exactly the wire commands the core needs:
//!
//! ```text
//!   SET <key> <value> EX <ttl> NX     -> set_nx_ex      (token acquire)
//!   EVAL get==ARGV[1] and del         -> compare_and_delete (token release)
//!   SET <key> <value> EX <ttl>        -> set_ex         (status put)
//!   GET <key>                         -> get            (status get)
//!   BLPOP <key> <timeout>             -> blpop          (task pop)
//!   RPUSH <key> <value>               -> rpush          (task push)
//!   LLEN <key>                        -> llen           (depth query)
//! ```
//!
//! Every operation is scoped to a single borrowed connection in a pooled
//! implementation. [`MemoryKv`] is a complete in-process backend with real
//! TTL expiry and blocking-pop semantics, used by the test suite and by
//! single-process deployments that do not need cross-node coordination.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::KvError;

/// Named key/value instances the engines resolve configuration against.
pub type KvInstances = HashMap<String, std::sync::Arc<dyn KvStore>>;

/// # Port over the shared key/value store.
///
/// Implementations must make `set_nx_ex` and `compare_and_delete` atomic with
/// respect to concurrent callers; the token protocol depends on it.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// `SET key value EX ttl NX`. Returns `Ok(true)` when the key was set,
    /// `Ok(false)` when it already existed.
    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, KvError>;

    /// `SET key value EX ttl`, unconditional.
    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), KvError>;

    /// `GET key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Atomic compare-and-delete: removes the key only when its current value
    /// equals `expect`. Returns `Ok(true)` when a deletion happened.
    async fn compare_and_delete(&self, key: &str, expect: &[u8]) -> Result<bool, KvError>;

    /// `BLPOP key timeout`. Returns `Ok(None)` on timeout.
    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, KvError>;

    /// `RPUSH key value`.
    async fn rpush(&self, key: &str, value: &[u8]) -> Result<(), KvError>;

    /// `LLEN key`.
    async fn llen(&self, key: &str) -> Result<usize, KvError>;

    /// Liveness probe for the backend.
    async fn ping(&self) -> Result<(), KvError>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }
}

/// In-process [`KvStore`] backend with TTL expiry and blocking pops.
#[derive(Default)]
pub struct MemoryKv {
    strings: Mutex<HashMap<String, Entry>>,
    lists: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    pushed: Notify,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_lpop(&self, key: &str) -> Option<Vec<u8>> {
        let mut lists = self.lists.lock().expect("kv poisoned");
        lists.get_mut(key).and_then(|q| q.pop_front())
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, KvError> {
        let mut strings = self.strings.lock().expect("kv poisoned");
        if strings.get(key).is_some_and(|e| !e.expired()) {
            return Ok(false);
        }
        strings.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), KvError> {
        let mut strings = self.strings.lock().expect("kv poisoned");
        strings.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let strings = self.strings.lock().expect("kv poisoned");
        Ok(strings
            .get(key)
            .filter(|e| !e.expired())
            .map(|e| e.value.clone()))
    }

    async fn compare_and_delete(&self, key: &str, expect: &[u8]) -> Result<bool, KvError> {
        let mut strings = self.strings.lock().expect("kv poisoned");
        let matches = strings
            .get(key)
            .is_some_and(|e| !e.expired() && e.value == expect);
        if matches {
            strings.remove(key);
        }
        Ok(matches)
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, KvError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register for wakeups before checking, so a concurrent push
            // between the check and the await is not lost.
            let pushed = self.pushed.notified();
            if let Some(value) = self.try_lpop(key) {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, pushed).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn rpush(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        {
            let mut lists = self.lists.lock().expect("kv poisoned");
            lists.entry(key.to_string()).or_default().push_back(value.to_vec());
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<usize, KvError> {
        let lists = self.lists.lock().expect("kv poisoned");
        Ok(lists.get(key).map_or(0, |q| q.len()))
    }

    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }
}
