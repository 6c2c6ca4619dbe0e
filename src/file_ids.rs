//! note-ID → remote-file-ID cache.
//!
//! Lookups that miss fall through to a caller-supplied fetch (a listing via
//! the operations queue) under a single-flight lock, so a burst of misses
//! for the same note costs one network call. Failed lookups are remembered
//! briefly so a missing remote file does not turn every sync phase into a
//! listing storm.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::Result;

pub struct FileIdCache {
    map: Mutex<HashMap<String, String>>,
    /// note ID → when the negative result expires.
    negative: Mutex<HashMap<String, Instant>>,
    negative_ttl: Duration,
    /// Serializes concurrent miss refreshes.
    refresh: tokio::sync::Mutex<()>,
}

impl FileIdCache {
    pub fn new(negative_ttl: Duration) -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            negative: Mutex::new(HashMap::new()),
            negative_ttl,
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    /// Cache-only lookup.
    pub fn get(&self, note_id: &str) -> Option<String> {
        self.map.lock().get(note_id).cloned()
    }

    pub fn insert(&self, note_id: &str, file_id: &str) {
        self.map.lock().insert(note_id.to_string(), file_id.to_string());
        self.negative.lock().remove(note_id);
    }

    /// Drop any knowledge of `note_id`. Called on Create/Delete.
    pub fn invalidate(&self, note_id: &str) {
        self.map.lock().remove(note_id);
        self.negative.lock().remove(note_id);
    }

    /// Resolve through the cache, calling `fetch` at most once per miss
    /// across concurrent callers. `fetch` returning `Ok(None)` is cached
    /// negatively for the configured TTL.
    pub async fn resolve_with<F, Fut>(&self, note_id: &str, fetch: F) -> Result<Option<String>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<String>>>,
    {
        if let Some(id) = self.get(note_id) {
            return Ok(Some(id));
        }
        if self.negative_fresh(note_id) {
            return Ok(None);
        }

        let _guard = self.refresh.lock().await;
        // A concurrent resolver may have filled the cache while we waited
        if let Some(id) = self.get(note_id) {
            return Ok(Some(id));
        }
        if self.negative_fresh(note_id) {
            return Ok(None);
        }

        match fetch().await? {
            Some(file_id) => {
                self.insert(note_id, &file_id);
                Ok(Some(file_id))
            }
            None => {
                self.negative
                    .lock()
                    .insert(note_id.to_string(), Instant::now() + self.negative_ttl);
                Ok(None)
            }
        }
    }

    /// Replace the whole map from a walk of the notes folder.
    pub fn rebuild(&self, entries: impl IntoIterator<Item = (String, String)>) {
        let mut map = self.map.lock();
        map.clear();
        map.extend(entries);
        self.negative.lock().clear();
    }

    fn negative_fresh(&self, note_id: &str) -> bool {
        let mut negative = self.negative.lock();
        match negative.get(note_id) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                negative.remove(note_id);
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn cache() -> FileIdCache {
        FileIdCache::new(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn resolve_hits_cache_without_fetch() {
        let cache = cache();
        cache.insert("n1", "file-1");

        let id = cache
            .resolve_with("n1", || async { panic!("fetch must not run") })
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("file-1"));
    }

    #[tokio::test]
    async fn miss_fetches_once_and_caches() {
        let cache = Arc::new(cache());
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = Arc::clone(&calls);
        let id = cache
            .resolve_with("n1", move || async move {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(Some("file-1".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("file-1"));

        // Second resolve is a pure cache hit
        let id = cache
            .resolve_with("n1", || async { panic!("cached") })
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("file-1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn negative_result_is_remembered() {
        let cache = cache();
        let id = cache
            .resolve_with("ghost", || async { Ok(None) })
            .await
            .unwrap();
        assert_eq!(id, None);

        // Within the TTL the fetch is skipped
        let id = cache
            .resolve_with("ghost", || async { panic!("negative cached") })
            .await
            .unwrap();
        assert_eq!(id, None);
    }

    #[tokio::test]
    async fn negative_expires() {
        let cache = FileIdCache::new(Duration::from_millis(0));
        cache
            .resolve_with("n1", || async { Ok(None) })
            .await
            .unwrap();

        let id = cache
            .resolve_with("n1", || async { Ok(Some("file-9".to_string())) })
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("file-9"));
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let cache = cache();
        cache.insert("n1", "file-1");
        cache.invalidate("n1");

        let id = cache
            .resolve_with("n1", || async { Ok(Some("file-2".to_string())) })
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("file-2"));
    }

    #[tokio::test]
    async fn rebuild_replaces_map() {
        let cache = cache();
        cache.insert("old", "file-old");
        cache.rebuild([("a".to_string(), "f-a".to_string())]);

        assert_eq!(cache.get("old"), None);
        assert_eq!(cache.get("a").as_deref(), Some("f-a"));
    }
}
