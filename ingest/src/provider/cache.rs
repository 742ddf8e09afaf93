use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use log::trace;
use lru::LruCache;

use crate::provider::OneShotOutput;

struct CachedResponse {
    output: OneShotOutput,
    stored_at: Instant,
}

// TTL'd LRU cache for one-shot provider responses, keyed by the
// operation's content cache key
pub struct ResponseCache {
    entries: LruCache<String, CachedResponse>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: LruCache::new(
                NonZeroUsize::new(capacity).expect("Non zero capacity for response cache"),
            ),
            ttl,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<OneShotOutput> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.stored_at.elapsed() > self.ttl,
            None => return None,
        };

        if expired {
            trace!("cache entry for {} expired", key);
            self.entries.pop(key);
            return None;
        }

        self.entries.get(key).map(|entry| entry.output.clone())
    }

    pub fn insert(&mut self, key: String, output: OneShotOutput) {
        self.entries.put(
            key,
            CachedResponse {
                output,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn purge_expired(&mut self) {
        let ttl = self.ttl;
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.stored_at.elapsed() > ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.entries.pop(&key);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
