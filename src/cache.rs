use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Short-lived keyed cache of response bodies. Keys are the exact request
/// URL (path and query); entries carry their own expiry. Implementations
/// swallow backend failures: a failed read is a miss, a failed write is
/// dropped with a log line.
#[async_trait::async_trait]
pub trait CacheService: Send + Sync {
    async fn get(&self, url: &str) -> Option<Vec<u8>>;
    async fn set(&self, url: &str, body: Vec<u8>, ttl: Duration);
    async fn delete(&self, url: &str);
}

/// In-process cache for single-node deployments and tests.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Vec<u8>, Instant)>> {
        self.entries.lock().expect("cache lock poisoned")
    }
}

#[async_trait::async_trait]
impl CacheService for MemoryCache {
    async fn get(&self, url: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries();
        match entries.get(url) {
            Some((body, expires_at)) if *expires_at > Instant::now() => Some(body.clone()),
            Some(_) => {
                entries.remove(url);
                None
            }
            None => None,
        }
    }

    async fn set(&self, url: &str, body: Vec<u8>, ttl: Duration) {
        self.entries()
            .insert(url.to_string(), (body, Instant::now() + ttl));
    }

    async fn delete(&self, url: &str) {
        self.entries().remove(url);
    }
}
