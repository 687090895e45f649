//! Auth oracle: resolves funk keys against the store, with a short-TTL
//! cache keeping repeat AUTHs off blocking I/O, and a bounded worker pool
//! for the best-effort bookkeeping calls.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use funk_protocol::types::ChannelId;

use crate::store::{fingerprint, ConnectionAction, Store, StoreError, StoreUserId, VerifiedUser};

/// Concurrent best-effort store jobs; excess jobs are dropped with a log
/// line rather than queued behind the relay.
const WORKER_PERMITS: usize = 4;

struct CacheEntry {
    user: VerifiedUser,
    inserted: Instant,
}

pub struct AuthOracle {
    store: Arc<dyn Store>,
    cache: DashMap<String, CacheEntry>,
    cache_ttl: Duration,
    workers: Arc<Semaphore>,
}

impl AuthOracle {
    pub fn new(store: Arc<dyn Store>, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            cache_ttl,
            workers: Arc::new(Semaphore::new(WORKER_PERMITS)),
        }
    }

    /// Resolve a funk key. Cache hits are served without touching the
    /// store; misses go through `spawn_blocking`.
    pub async fn verify(&self, funk_key: &str) -> Result<Option<VerifiedUser>, StoreError> {
        let key_fp = fingerprint(funk_key);

        if let Some(entry) = self.cache.get(&key_fp) {
            if entry.inserted.elapsed() < self.cache_ttl {
                debug!(key = %key_fp, "auth cache hit");
                return Ok(Some(entry.user.clone()));
            }
        }
        self.cache.remove(&key_fp);

        let store = self.store.clone();
        let owned_key = Zeroizing::new(funk_key.to_owned());
        let result = tokio::task::spawn_blocking(move || store.verify(&owned_key))
            .await
            .map_err(|_| StoreError::Worker)??;

        if let Some(user) = &result {
            self.cache.insert(
                key_fp,
                CacheEntry {
                    user: user.clone(),
                    inserted: Instant::now(),
                },
            );
        }
        Ok(result)
    }

    /// Record a successful channel authentication. Best-effort: never
    /// blocks the caller, drops the job when the pool is saturated.
    pub fn record_connect(&self, user_id: StoreUserId, channel: ChannelId, ip: IpAddr) {
        let Ok(permit) = self.workers.clone().try_acquire_owned() else {
            warn!("store worker pool saturated, dropping connection log");
            return;
        };
        let store = self.store.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let result = tokio::task::spawn_blocking(move || {
                store.log_connection(user_id, channel, ConnectionAction::Connect, ip)?;
                store.touch_last_seen(user_id)
            })
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("connection log failed: {}", e),
                Err(e) => warn!("store worker panicked: {}", e),
            }
        });
    }

    /// Record a reaped peer's departure. Best-effort like
    /// [`Self::record_connect`].
    pub fn record_disconnect(&self, user_id: StoreUserId, channel: ChannelId, ip: IpAddr) {
        let Ok(permit) = self.workers.clone().try_acquire_owned() else {
            warn!("store worker pool saturated, dropping disconnect log");
            return;
        };
        let store = self.store.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let result = tokio::task::spawn_blocking(move || {
                store.log_connection(user_id, channel, ConnectionAction::Disconnect, ip)
            })
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("disconnect log failed: {}", e),
                Err(e) => warn!("store worker panicked: {}", e),
            }
        });
    }

    /// Flush accumulated traffic counters. Best-effort like
    /// [`Self::record_connect`].
    pub fn record_traffic(&self, bytes_in: u64, bytes_out: u64) {
        let Ok(permit) = self.workers.clone().try_acquire_owned() else {
            warn!("store worker pool saturated, dropping traffic sample");
            return;
        };
        let store = self.store.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let result =
                tokio::task::spawn_blocking(move || store.record_traffic(bytes_in, bytes_out))
                    .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("traffic record failed: {}", e),
                Err(e) => warn!("store worker panicked: {}", e),
            }
        });
    }

    /// Synchronous flush for shutdown, when the runtime is about to stop.
    pub fn flush_traffic_blocking(&self, bytes_in: u64, bytes_out: u64) {
        if bytes_in == 0 && bytes_out == 0 {
            return;
        }
        if let Err(e) = self.store.record_traffic(bytes_in, bytes_out) {
            warn!("final traffic flush failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::MemoryStore;

    fn oracle_with_user() -> AuthOracle {
        let store = MemoryStore::new().with_user("funk-key-0001", 7, "dispatch", &[41, 52], true);
        AuthOracle::new(Arc::new(store), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn verify_resolves_known_key() {
        let oracle = oracle_with_user();
        let user = oracle.verify("funk-key-0001").await.unwrap().unwrap();
        assert_eq!(user.id, 7);
        assert_eq!(user.username, "dispatch");
        assert!(user.allowed_channels.contains(&52));
    }

    #[tokio::test]
    async fn verify_rejects_unknown_key() {
        let oracle = oracle_with_user();
        assert!(oracle.verify("wrong-key-0000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cache_hit_skips_the_store() {
        use std::sync::atomic::Ordering;

        let store = Arc::new(MemoryStore::new().with_user(
            "funk-key-0001",
            7,
            "dispatch",
            &[52],
            true,
        ));
        let oracle = AuthOracle::new(store.clone(), Duration::from_secs(60));

        assert!(oracle.verify("funk-key-0001").await.unwrap().is_some());
        assert!(oracle.verify("funk-key-0001").await.unwrap().is_some());
        assert_eq!(store.verify_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn store_error_propagates_on_miss() {
        let mut store = MemoryStore::new();
        store.fail_verify = true;
        let oracle = AuthOracle::new(Arc::new(store), Duration::from_secs(5));
        assert!(oracle.verify("any-key").await.is_err());
    }

    #[tokio::test]
    async fn record_connect_reaches_store() {
        let store = Arc::new(MemoryStore::new().with_user(
            "funk-key-0001",
            7,
            "dispatch",
            &[52],
            true,
        ));
        let oracle = AuthOracle::new(store.clone(), Duration::from_secs(5));

        oracle.record_connect(7, 52, "10.0.0.1".parse().unwrap());

        // The job runs on a background task; poll briefly.
        for _ in 0..50 {
            if !store.connections.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.connections.lock().len(), 1);
    }
}
