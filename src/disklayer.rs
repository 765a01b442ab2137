//! The bottom-most snapshot layer: key-value store, clean node cache and
//! the dirty aggregation cache, plus the read-only historical variant.

use std::sync::Arc;

use parking_lot::RwLock;
use primitive_types::H256;

use crate::cache::CleanCache;
use crate::difflayer::DiffLayer;
use crate::diskcache::DiskCache;
use crate::errors::Error;
use crate::history::{store_reverse_diff, store_state_history, ReverseDiff};
use crate::kv::{read_trie_node, write_reverse_diff_head, KeyValueStore};
use crate::layer::{CommitContext, Layer};
use crate::nodeset::MemoryNode;

/// Low-level persistent snapshot. The stale flag and the dirty cache share
/// one lock: the cache is only ever mutated by the commit/revert/flush path
/// that also flips the flag, and readers check the flag under the same read
/// guard they use to inspect the cache.
pub(crate) struct DiskLayer {
    root: H256,
    id: u64,
    db: Arc<dyn KeyValueStore>,
    clean: Option<Arc<CleanCache>>,
    inner: RwLock<DiskInner>,
}

struct DiskInner {
    stale: bool,
    dirty: DiskCache,
}

impl DiskLayer {
    pub fn new(
        root: H256,
        id: u64,
        db: Arc<dyn KeyValueStore>,
        clean: Option<Arc<CleanCache>>,
        dirty: DiskCache,
    ) -> Self {
        Self {
            root,
            id,
            db,
            clean,
            inner: RwLock::new(DiskInner {
                stale: false,
                dirty,
            }),
        }
    }

    pub fn root(&self) -> H256 {
        self.root
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stale(&self) -> bool {
        self.inner.read().stale
    }

    pub fn mark_stale(&self) {
        let mut inner = self.inner.write();
        // two children committed into the same base
        assert!(!inner.stale, "disk layer is stale");
        inner.stale = true;
    }

    /// Approximate size of the buffered dirty nodes; zero once superseded.
    pub fn size(&self) -> usize {
        let inner = self.inner.read();
        if inner.stale {
            0
        } else {
            inner.dirty.size()
        }
    }

    /// Node lookup: dirty cache, then clean cache, then the store itself.
    pub fn node(
        &self,
        owner: &H256,
        path: &[u8],
        hash: H256,
        _depth: usize,
    ) -> Result<Option<MemoryNode>, Error> {
        let inner = self.inner.read();
        if inner.stale {
            return Err(Error::Stale);
        }
        match inner.dirty.node(owner, path, hash)? {
            Some(n) if n.is_deleted() => return Ok(None),
            Some(n) => return Ok(Some(n.clone())),
            None => {}
        }
        if let Some(clean) = &self.clean {
            if let Some(blob) = clean.get(&hash) {
                return Ok(Some(MemoryNode::with_hash(hash, blob)));
            }
        }
        let Some((blob, got)) = read_trie_node(&*self.db, owner, path)? else {
            return Ok(None);
        };
        if got != hash {
            return Err(Error::UnexpectedNode {
                want: hash,
                has: got,
                owner: *owner,
                path: path.to_vec(),
            });
        }
        if let Some(clean) = &self.clean {
            clean.insert(hash, &blob);
        }
        Ok(Some(MemoryNode::with_hash(hash, Arc::new(blob))))
    }

    /// Merges the given bottom-most diff layer in and returns the successor
    /// disk layer. The current layer goes stale first; the undo records are
    /// made durable before any state can advance, so a crash in between
    /// leaves a truncatable freezer tail, never a lost undo.
    pub fn commit(
        &self,
        bottom: &DiffLayer,
        force: bool,
        ctx: &CommitContext<'_>,
    ) -> Result<Arc<Layer>, Error> {
        let mut inner = self.inner.write();
        assert!(!inner.stale, "disk layer is stale");
        inner.stale = true;

        if let Some(freezer) = ctx.freezer {
            store_reverse_diff(freezer, bottom, ctx.retention)?;
        }
        if let Some(freezer) = ctx.state_freezer {
            store_state_history(freezer, bottom)?;
        }
        let dirty = std::mem::take(&mut inner.dirty).commit(bottom.nodes());
        drop(inner);

        log::debug!(
            "committed diff layer onto disk: id {} root {}",
            bottom.id(),
            hex::encode(bottom.root())
        );
        let ndl = DiskLayer::new(
            bottom.root(),
            bottom.id(),
            self.db.clone(),
            self.clean.clone(),
            dirty,
        );
        ndl.flush(force)?;
        Ok(Arc::new(Layer::Disk(ndl)))
    }

    /// Rolls the layer back across one reverse diff and returns the
    /// predecessor disk layer. With nothing buffered the undo is applied to
    /// the store directly; otherwise it is absorbed by the dirty cache.
    pub fn revert(&self, diff: &ReverseDiff, id: u64) -> Result<Arc<Layer>, Error> {
        if diff.root != self.root || id != self.id {
            return Err(Error::UnmatchedReverseDiff);
        }
        if self.id == 0 {
            return Err(Error::Unrecoverable);
        }
        let mut inner = self.inner.write();
        assert!(!inner.stale, "disk layer is stale");
        inner.stale = true;

        if inner.dirty.is_empty() {
            let mut batch = self.db.batch();
            diff.apply(&mut *batch);
            write_reverse_diff_head(&mut *batch, self.id - 1);
            batch.write()?;
        } else {
            inner.dirty.revert(diff)?;
        }
        let dirty = std::mem::take(&mut inner.dirty);
        drop(inner);

        log::debug!(
            "reverted disk layer: id {} -> {} root {}",
            self.id,
            self.id - 1,
            hex::encode(diff.parent)
        );
        Ok(Arc::new(Layer::Disk(DiskLayer::new(
            diff.parent,
            self.id - 1,
            self.db.clone(),
            self.clean.clone(),
            dirty,
        ))))
    }

    /// Flushes the dirty cache if its threshold is crossed, or always when
    /// forced.
    pub fn flush(&self, force: bool) -> Result<(), Error> {
        let mut inner = self.inner.write();
        if inner.stale {
            return Err(Error::Stale);
        }
        let DiskInner { ref mut dirty, .. } = *inner;
        dirty.may_flush(&*self.db, self.clean.as_deref(), self.id, force)
    }

    /// Re-bounds the dirty cache, flushing if the buffered content already
    /// exceeds the new threshold.
    pub fn set_cache_size(&self, limit: usize) -> Result<(), Error> {
        let mut inner = self.inner.write();
        if inner.stale {
            return Err(Error::Stale);
        }
        let DiskInner { ref mut dirty, .. } = *inner;
        dirty.set_size(limit, &*self.db, self.clean.as_deref(), self.id)
    }

    /// A copy of the buffered dirty nodes, the seed of historical overlays.
    pub fn dirty_copy(&self) -> Result<DiskCache, Error> {
        let inner = self.inner.read();
        if inner.stale {
            return Err(Error::Stale);
        }
        Ok(inner.dirty.clone())
    }
}

/// A pinned, read-only view of a historical disk state: the live store
/// overlaid with the node values reconstructed from reverse diffs. Never
/// writes through; committing onto it only grows the in-memory overlay.
pub(crate) struct DiskLayerSnapshot {
    root: H256,
    id: u64,
    db: Arc<dyn KeyValueStore>,
    clean: Option<Arc<CleanCache>>,
    inner: RwLock<DiskInner>,
}

impl DiskLayerSnapshot {
    pub fn new(
        root: H256,
        id: u64,
        db: Arc<dyn KeyValueStore>,
        clean: Option<Arc<CleanCache>>,
        overlay: DiskCache,
    ) -> Self {
        Self {
            root,
            id,
            db,
            clean,
            inner: RwLock::new(DiskInner {
                stale: false,
                dirty: overlay,
            }),
        }
    }

    pub fn root(&self) -> H256 {
        self.root
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stale(&self) -> bool {
        self.inner.read().stale
    }

    pub fn mark_stale(&self) {
        let mut inner = self.inner.write();
        assert!(!inner.stale, "disk layer snapshot is stale");
        inner.stale = true;
    }

    pub fn node(
        &self,
        owner: &H256,
        path: &[u8],
        hash: H256,
        _depth: usize,
    ) -> Result<Option<MemoryNode>, Error> {
        let inner = self.inner.read();
        if inner.stale {
            return Err(Error::Stale);
        }
        match inner.dirty.node(owner, path, hash)? {
            Some(n) if n.is_deleted() => return Ok(None),
            Some(n) => return Ok(Some(n.clone())),
            None => {}
        }
        // the clean cache is content addressed, historical hits stay valid
        if let Some(clean) = &self.clean {
            if let Some(blob) = clean.get(&hash) {
                return Ok(Some(MemoryNode::with_hash(hash, blob)));
            }
        }
        let Some((blob, got)) = read_trie_node(&*self.db, owner, path)? else {
            return Ok(None);
        };
        if got != hash {
            return Err(Error::UnexpectedNode {
                want: hash,
                has: got,
                owner: *owner,
                path: path.to_vec(),
            });
        }
        Ok(Some(MemoryNode::with_hash(hash, Arc::new(blob))))
    }

    /// In-memory-only merge of a bottom diff layer.
    pub fn commit(&self, bottom: &DiffLayer) -> Result<Arc<Layer>, Error> {
        let mut inner = self.inner.write();
        assert!(!inner.stale, "disk layer snapshot is stale");
        inner.stale = true;
        let overlay = std::mem::take(&mut inner.dirty).commit(bottom.nodes());
        drop(inner);
        Ok(Arc::new(Layer::DiskSnap(DiskLayerSnapshot::new(
            bottom.root(),
            bottom.id(),
            self.db.clone(),
            self.clean.clone(),
            overlay,
        ))))
    }
}
