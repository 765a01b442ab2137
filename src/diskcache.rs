//! Write-back cache above the key-value store. Mutations of flattened diff
//! layers aggregate here until the configured threshold forces one atomic
//! batch write.

use std::collections::HashMap;
use std::sync::Arc;

use primitive_types::H256;

use crate::cache::CleanCache;
use crate::errors::Error;
use crate::history::ReverseDiff;
use crate::keccak;
use crate::kv::{trie_node_key, write_reverse_diff_head, KeyValueStore};
use crate::nodeset::{MemoryNode, NodeWithPrev};

#[derive(Clone)]
pub(crate) struct DiskCache {
    /// Number of diff layers aggregated since the last flush.
    layers: u64,
    /// Flush threshold in bytes; may be exceeded momentarily.
    limit: usize,
    /// Approximate byte size of the buffered nodes.
    size: usize,
    nodes: HashMap<H256, HashMap<Vec<u8>, MemoryNode>>,
}

impl Default for DiskCache {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DiskCache {
    pub fn new(limit: usize) -> Self {
        Self {
            layers: 0,
            limit,
            size: 0,
            nodes: HashMap::new(),
        }
    }

    /// Buffered-node lookup. A tombstone is a definite hit and bypasses the
    /// hash check; a live entry whose hash does not match the request is a
    /// corruption the caller must not see through.
    pub fn node(
        &self,
        owner: &H256,
        path: &[u8],
        hash: H256,
    ) -> Result<Option<&MemoryNode>, Error> {
        let Some(n) = self.nodes.get(owner).and_then(|subset| subset.get(path)) else {
            return Ok(None);
        };
        if !n.is_deleted() && n.hash() != hash {
            return Err(Error::UnexpectedNode {
                want: hash,
                has: n.hash(),
                owner: *owner,
                path: path.to_vec(),
            });
        }
        Ok(Some(n))
    }

    /// Folds one flattened diff layer in. Tombstones overwrite prior
    /// entries so a later flush deletes the key.
    pub fn commit(mut self, nodes: &HashMap<H256, HashMap<Vec<u8>, NodeWithPrev>>) -> Self {
        for (owner, subset) in nodes {
            let current = self.nodes.entry(*owner).or_default();
            for (path, n) in subset {
                if let Some(old) = current.insert(path.clone(), n.node.clone()) {
                    self.size -= old.size() as usize + path.len();
                }
                self.size += n.node.size() as usize + path.len();
            }
        }
        self.layers += 1;
        self
    }

    /// Applies a reverse diff to the buffered nodes in place. Every touched
    /// path must still be buffered; if the revert drains the last aggregated
    /// layer the cache empties out entirely.
    pub fn revert(&mut self, diff: &ReverseDiff) -> Result<(), Error> {
        if self.layers == 0 {
            return Err(Error::Unrecoverable);
        }
        self.layers -= 1;
        if self.layers == 0 {
            self.reset();
            return Ok(());
        }
        for state in &diff.states {
            let subset = self
                .nodes
                .get_mut(&state.owner)
                .ok_or(Error::UnmatchedReverseDiff)?;
            for (path, prev) in &state.nodes {
                let n = subset.get_mut(path).ok_or(Error::UnmatchedReverseDiff)?;
                self.size -= n.size() as usize;
                *n = if prev.is_empty() {
                    MemoryNode::deleted()
                } else {
                    MemoryNode::with_hash(keccak(prev), Arc::new(prev.clone()))
                };
                self.size += n.size() as usize;
            }
        }
        Ok(())
    }

    /// Writes all buffered nodes and the persistent diff id marker as one
    /// batch once the size cap is crossed, or unconditionally when forced.
    pub fn may_flush(
        &mut self,
        db: &dyn KeyValueStore,
        clean: Option<&CleanCache>,
        id: u64,
        force: bool,
    ) -> Result<(), Error> {
        if self.size <= self.limit && !force {
            return Ok(());
        }
        let (nodes, size) = (self.node_count(), self.size);
        let mut batch = db.batch();
        for (owner, subset) in &self.nodes {
            for (path, n) in subset {
                let key = trie_node_key(owner, path);
                if n.is_deleted() {
                    batch.delete(&key);
                } else {
                    batch.put(&key, n.blob());
                    if let Some(clean) = clean {
                        clean.insert(n.hash(), n.blob());
                    }
                }
            }
        }
        write_reverse_diff_head(&mut *batch, id);
        batch.write()?;
        self.reset();
        log::debug!("flushed disk cache: id {id} nodes {nodes} size {size}");
        Ok(())
    }

    /// Adjusts the flush threshold, flushing right away if the buffered
    /// content already exceeds it.
    pub fn set_size(
        &mut self,
        limit: usize,
        db: &dyn KeyValueStore,
        clean: Option<&CleanCache>,
        id: u64,
    ) -> Result<(), Error> {
        self.limit = limit;
        self.may_flush(db, clean, id, false)
    }

    pub fn is_empty(&self) -> bool {
        self.layers == 0
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn node_count(&self) -> usize {
        self.nodes.values().map(HashMap::len).sum()
    }

    fn reset(&mut self) {
        self.layers = 0;
        self.size = 0;
        self.nodes.clear();
    }

    /// Applies a reverse diff unconditionally, inserting entries for paths
    /// the cache never held. Used to assemble historical overlays, where
    /// the base state below is the live key-value store.
    pub fn rollback(&mut self, diff: &ReverseDiff) {
        for state in &diff.states {
            let subset = self.nodes.entry(state.owner).or_default();
            for (path, prev) in &state.nodes {
                let n = if prev.is_empty() {
                    MemoryNode::deleted()
                } else {
                    MemoryNode::with_hash(keccak(prev), Arc::new(prev.clone()))
                };
                let added = n.size() as usize + path.len();
                if let Some(old) = subset.insert(path.clone(), n) {
                    self.size -= old.size() as usize + path.len();
                }
                self.size += added;
            }
        }
    }
}
