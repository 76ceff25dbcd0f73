use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

/**
    A cached segment response: the bytes plus the content type they were
    served with.
*/
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub body: Bytes,
    pub content_type: String,
}

/**
    URL-keyed response cache capability.

    The deployed store is shared between edge instances and may be raced;
    that is safe because writes are idempotent: within the TTL window the
    same URL always maps to the same bytes. Injectable so the routing layer
    is testable without a real edge runtime.
*/
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<CachedResponse>;
    async fn put(&self, key: &str, value: CachedResponse, ttl: Duration);
}

struct Entry {
    response: CachedResponse,
    expires_at: Instant,
}

/**
    In-memory cache store with lazy expiry: entries die on read once past
    their TTL, plus an opportunistic sweep on writes so dead segments don't
    pile up between reads.
*/
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Option<CachedResponse> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.response.clone());
                }
                Some(_) => {} // expired, drop below
                None => return None,
            }
        }
        self.entries.write().await.remove(key);
        None
    }

    async fn put(&self, key: &str, value: CachedResponse, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(
            key.to_string(),
            Entry {
                response: value,
                expires_at: now + ttl,
            },
        );
    }
}
