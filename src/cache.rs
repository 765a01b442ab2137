//! Byte-bounded LRU of encoded node blobs, keyed by content hash. Shared
//! by every disk layer for the lifetime of the process.

use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use primitive_types::H256;

pub(crate) struct CleanCache {
    cap: usize,
    inner: Mutex<CleanInner>,
}

struct CleanInner {
    size: usize,
    entries: LruCache<H256, Arc<Vec<u8>>>,
}

impl CleanCache {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            inner: Mutex::new(CleanInner {
                size: 0,
                entries: LruCache::unbounded(),
            }),
        }
    }

    pub fn get(&self, hash: &H256) -> Option<Arc<Vec<u8>>> {
        self.inner.lock().entries.get(hash).cloned()
    }

    pub fn insert(&self, hash: H256, blob: &[u8]) {
        if blob.is_empty() || blob.len() > self.cap {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.push(hash, Arc::new(blob.to_vec())) {
            // push returns the evicted or replaced entry
            inner.size -= old.1.len();
        }
        inner.size += blob.len();
        while inner.size > self.cap {
            match inner.entries.pop_lru() {
                Some((_, old)) => inner.size -= old.len(),
                None => break,
            }
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().size
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bounded_by_bytes() {
        let cache = CleanCache::new(100);
        for i in 0..10u8 {
            cache.insert(H256::repeat_byte(i), &[i; 30]);
        }
        assert!(cache.size() <= 100);
        // newest entries survive, the oldest were evicted
        assert!(cache.get(&H256::repeat_byte(9)).is_some());
        assert!(cache.get(&H256::repeat_byte(0)).is_none());
        // oversized blobs are not admitted
        cache.insert(H256::repeat_byte(0xff), &[0; 101]);
        assert!(cache.get(&H256::repeat_byte(0xff)).is_none());
    }

    #[test]
    fn replacement_keeps_accounting() {
        let cache = CleanCache::new(100);
        cache.insert(H256::repeat_byte(1), &[0; 40]);
        cache.insert(H256::repeat_byte(1), &[0; 60]);
        assert_eq!(cache.size(), 60);
    }
}
