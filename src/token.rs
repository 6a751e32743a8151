//! # Distributed token (lease) service.
//!
//! A token is a short-lived lease recorded in the key/value store under
//! `<prefix>token:<key>`. Acquisition is `SET ... EX ttl NX`, so exactly one
//! node in the cluster holds a given token at a time. Release is an atomic
//! compare-and-delete keyed on the lease witness: a slow holder whose lease
//! already expired and was reacquired by a peer must not erase the new
//! holder's token, which a plain DEL would do.
//!
//! The same service persists schedule status blobs under `<prefix>info:<key>`.

use std::sync::Arc;
use std::time::Duration;

use crate::clock;
use crate::error::KvError;
use crate::kv::KvStore;

/// TTL floor applied when a caller passes zero (run-once schedules).
pub const MIN_TOKEN_TTL_SECS: i64 = 10;

/// Witness value proving ownership of an acquired token.
///
/// Formatted as `<unixNanos>:<randInt>`; only the holder knows it, and the
/// CAS release deletes the token only while it still carries this value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease(String);

impl Lease {
    fn generate() -> Self {
        Lease(format!("{}:{}", clock::unix_nanos(), rand::random::<u64>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Thin token protocol over a [`KvStore`].
pub struct TokenService {
    kv: Arc<dyn KvStore>,
    prefix: String,
}

impl TokenService {
    /// `prefix` is prepended to every key, e.g. `VASC:<project>:SCHEDULE:`.
    pub fn new(kv: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
        }
    }

    /// Attempts to acquire the token for `key` with the given TTL.
    ///
    /// Returns `Ok(None)` when a peer already holds it; that is not an error.
    /// Fails only on transport problems.
    pub async fn acquire(&self, key: &str, ttl_secs: i64) -> Result<Option<Lease>, KvError> {
        let lease = Lease::generate();
        let set = self
            .kv
            .set_nx_ex(
                &self.token_key(key),
                lease.as_str().as_bytes(),
                effective_ttl(ttl_secs),
            )
            .await?;
        Ok(set.then_some(lease))
    }

    /// Releases the token if it is still owned by `lease`.
    ///
    /// Silent on mismatch: the lease expired and a competitor reacquired it.
    pub async fn release(&self, key: &str, lease: &Lease) -> Result<(), KvError> {
        let _ = self
            .kv
            .compare_and_delete(&self.token_key(key), lease.as_str().as_bytes())
            .await?;
        Ok(())
    }

    /// Stores a status blob under `<prefix>info:<key>` with the given TTL.
    pub async fn put_status(&self, key: &str, json: &str, ttl_secs: i64) -> Result<(), KvError> {
        self.kv
            .set_ex(&self.info_key(key), json.as_bytes(), effective_ttl(ttl_secs))
            .await
    }

    /// Reads the status blob for `key`, if present and unexpired.
    pub async fn get_status(&self, key: &str) -> Result<Option<String>, KvError> {
        let raw = self.kv.get(&self.info_key(key)).await?;
        Ok(raw.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    fn token_key(&self, key: &str) -> String {
        format!("{}token:{}", self.prefix, key)
    }

    fn info_key(&self, key: &str) -> String {
        format!("{}info:{}", self.prefix, key)
    }
}

fn effective_ttl(ttl_secs: i64) -> Duration {
    if ttl_secs <= 0 {
        Duration::from_secs(MIN_TOKEN_TTL_SECS as u64)
    } else {
        Duration::from_secs(ttl_secs as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn service() -> Arc<TokenService> {
        Arc::new(TokenService::new(
            Arc::new(MemoryKv::new()),
            "VASC:test:SCHEDULE:",
        ))
    }

    #[tokio::test]
    async fn concurrent_acquire_yields_single_holder() {
        let svc = service();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let svc = svc.clone();
            handles.push(tokio::spawn(
                async move { svc.acquire("mutex", 30).await },
            ));
        }
        let mut held = 0;
        for h in handles {
            if h.await.unwrap().unwrap().is_some() {
                held += 1;
            }
        }
        assert_eq!(held, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_release_leaves_new_holder_untouched() {
        let svc = service();
        let stale = svc.acquire("k", 1).await.unwrap().expect("first acquire");
        tokio::time::advance(Duration::from_secs(2)).await;

        let fresh = svc.acquire("k", 30).await.unwrap().expect("reacquire after expiry");
        // Stale release succeeds without affecting the fresh lease.
        svc.release("k", &stale).await.unwrap();
        assert!(svc.acquire("k", 30).await.unwrap().is_none());

        svc.release("k", &fresh).await.unwrap();
        assert!(svc.acquire("k", 30).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ttl_gets_ten_second_floor() {
        let svc = service();
        assert!(svc.acquire("once", 0).await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(svc.acquire("once", 0).await.unwrap().is_none());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(svc.acquire("once", 0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn status_round_trip() {
        let svc = service();
        svc.put_status("poll", r#"{"schedule_key":"poll"}"#, 60)
            .await
            .unwrap();
        let got = svc.get_status("poll").await.unwrap().unwrap();
        assert!(got.contains("poll"));
        assert_eq!(svc.get_status("missing").await.unwrap(), None);
    }
}
