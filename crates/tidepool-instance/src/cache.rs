//! Content-addressed cache of pushed images
//!
//! Maps a build-context hash to the image reference it was pushed under.
//! Entries are write-once and never evicted; a testbed shares one cache
//! across all its instances.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

/// Concurrency-safe hash -> image reference map
#[derive(Debug, Default)]
pub struct BuildCache {
    images: DashMap<String, String>,
}

impl BuildCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Image previously pushed for `hash`
    pub fn get(&self, hash: &str) -> Option<String> {
        self.images.get(hash).map(|entry| entry.value().clone())
    }

    /// Record `image` for `hash` unless an entry exists
    ///
    /// Returns the image now associated with the hash; when another caller
    /// won the race this is their image, not `image`.
    pub fn insert(&self, hash: &str, image: &str) -> String {
        match self.images.entry(hash.to_string()) {
            Entry::Occupied(existing) => {
                debug!(hash = %hash, image = %existing.get(), "Build cache entry already present");
                existing.get().clone()
            }
            Entry::Vacant(slot) => {
                debug!(hash = %hash, image = %image, "Recorded build cache entry");
                slot.insert(image.to_string()).value().clone()
            }
        }
    }

    /// Number of cached images
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// True when nothing has been cached
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_write_once() {
        let cache = BuildCache::new();
        assert_eq!(cache.insert("abc", "ttl.sh/one:24h"), "ttl.sh/one:24h");
        assert_eq!(cache.insert("abc", "ttl.sh/two:24h"), "ttl.sh/one:24h");
        assert_eq!(cache.get("abc").as_deref(), Some("ttl.sh/one:24h"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_miss() {
        let cache = BuildCache::new();
        assert!(cache.get("missing").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_inserts_agree() {
        let cache = std::sync::Arc::new(BuildCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.insert("same", &format!("image-{}", i)))
            })
            .collect();
        let winners: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(winners.iter().all(|w| w == &winners[0]));
        assert_eq!(cache.len(), 1);
    }
}
