//! Sharded map of uploaded keys to the second they were last uploaded.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

pub const SHARD_COUNT: usize = 1024;

/// Longest pause between two expiry passes.
const MAX_EXPIRE_INTERVAL: Duration = Duration::from_secs(60);

/// 32-bit FNV-1.
fn fnv32(key: &str) -> u32 {
    const PRIME: u32 = 16777619;
    key.bytes()
        .fold(2166136261, |hash, b| hash.wrapping_mul(PRIME) ^ u32::from(b))
}

#[derive(Debug)]
pub struct CMap {
    shards: Box<[RwLock<HashMap<String, i64>>]>,
}

impl Default for CMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CMap {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Default::default()).collect(),
        }
    }

    fn shard(&self, key: &str) -> &RwLock<HashMap<String, i64>> {
        &self.shards[fnv32(key) as usize % SHARD_COUNT]
    }

    pub fn contains(&self, key: &str) -> bool {
        self.shard(key).read().contains_key(key)
    }

    pub fn insert(&self, key: String, value: i64) {
        self.shard(&key).write().insert(key, value);
    }

    /// Insert every key of `keys` with `value`.
    pub fn merge(&self, keys: HashSet<String>, value: i64) {
        for key in keys {
            self.insert(key, value);
        }
    }

    pub fn count(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            *shard.write() = HashMap::new();
        }
    }

    /// Remove entries older than `deadline`, returning how many went.
    pub fn expire(&self, deadline: i64) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                let mut shard = shard.write();
                let before = shard.len();
                shard.retain(|_, v| *v >= deadline);
                before - shard.len()
            })
            .sum()
    }

    /// Expire entries older than `ttl` until `shutdown` is cancelled, adding
    /// the number removed to `expired`.
    pub async fn expire_worker(
        &self,
        ttl: Duration,
        expired: &AtomicU64,
        shutdown: CancellationToken,
    ) {
        let period = ttl.min(MAX_EXPIRE_INTERVAL).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let deadline = chrono::Utc::now().timestamp() - ttl.as_secs() as i64;
            for shard in self.shards.iter() {
                if shutdown.is_cancelled() {
                    return;
                }
                let removed = {
                    let mut shard = shard.write();
                    let before = shard.len();
                    shard.retain(|_, v| *v >= deadline);
                    before - shard.len()
                };
                expired.fetch_add(removed as u64, Ordering::Relaxed);
                tokio::task::yield_now().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv() {
        assert_eq!(fnv32(""), 2166136261);
        assert_eq!(fnv32("a"), 0x050c5d7e);
    }

    #[test]
    fn operations() {
        let m = CMap::new();
        m.insert("18049:a.b".to_string(), 100);
        assert!(m.contains("18049:a.b"));
        assert!(!m.contains("18050:a.b"));

        m.merge(
            ["1:x".to_string(), "1:y".to_string()].into_iter().collect(),
            200,
        );
        assert_eq!(m.count(), 3);

        assert_eq!(m.expire(150), 1);
        assert!(!m.contains("18049:a.b"));
        assert_eq!(m.count(), 2);

        m.clear();
        assert_eq!(m.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_expires_old_entries() {
        let m = std::sync::Arc::new(CMap::new());
        let now = chrono::Utc::now().timestamp();
        m.insert("old".to_string(), now - 100);
        m.insert("new".to_string(), now + 1000);

        let expired = std::sync::Arc::new(AtomicU64::new(0));
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn({
            let m = std::sync::Arc::clone(&m);
            let expired = std::sync::Arc::clone(&expired);
            let shutdown = shutdown.clone();
            async move {
                m.expire_worker(Duration::from_secs(10), &expired, shutdown)
                    .await
            }
        });

        tokio::time::sleep(Duration::from_secs(11)).await;
        while expired.load(Ordering::Relaxed) == 0 {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();
        worker.await.unwrap();

        assert!(!m.contains("old"));
        assert!(m.contains("new"));
        assert_eq!(expired.load(Ordering::Relaxed), 1);
    }
}
