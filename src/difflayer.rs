//! In-memory overlay holding one block's node mutations over a parent
//! snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use primitive_types::H256;

use crate::errors::Error;
use crate::layer::Layer;
use crate::nodeset::{MemoryNode, NodeWithPrev};

/// A diff layer acts as a journal of recent modifications that have not yet
/// graduated into the semi-immutable disk layer. Everything but the parent
/// link and the stale flag is immutable after construction.
pub(crate) struct DiffLayer {
    root: H256,
    id: u64,
    nodes: HashMap<H256, HashMap<Vec<u8>, NodeWithPrev>>,
    /// Approximate memory footprint of the held nodes.
    memory: u64,
    pub(crate) inner: RwLock<DiffInner>,
}

pub(crate) struct DiffInner {
    /// Never absent; rebound to the replacement disk layer during a cap.
    pub parent: Arc<Layer>,
    pub stale: bool,
}

impl DiffLayer {
    pub fn new(
        parent: Arc<Layer>,
        root: H256,
        id: u64,
        nodes: HashMap<H256, HashMap<Vec<u8>, NodeWithPrev>>,
    ) -> Self {
        let mut memory = 0u64;
        let mut count = 0usize;
        for subset in nodes.values() {
            for (path, n) in subset {
                memory += n.memory_size(path.len()) as u64;
                count += 1;
            }
        }
        log::debug!("created diff layer: id {id} nodes {count} size {memory}");
        Self {
            root,
            id,
            nodes,
            memory,
            inner: RwLock::new(DiffInner {
                parent,
                stale: false,
            }),
        }
    }

    pub fn root(&self) -> H256 {
        self.root
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn memory(&self) -> u64 {
        self.memory
    }

    pub fn nodes(&self) -> &HashMap<H256, HashMap<Vec<u8>, NodeWithPrev>> {
        &self.nodes
    }

    pub fn parent(&self) -> Arc<Layer> {
        self.inner.read().parent.clone()
    }

    pub fn stale(&self) -> bool {
        self.inner.read().stale
    }

    /// Flags the layer as flattened across. Doing so twice means two
    /// children were committed onto the same layer, which the single-writer
    /// protocol rules out.
    pub fn mark_stale(&self) {
        let mut inner = self.inner.write();
        assert!(!inner.stale, "diff layer is stale");
        inner.stale = true;
    }

    /// Node lookup. The read lock pins the parent link for the whole
    /// traversal, so a concurrent re-parenting cannot tear the chain out
    /// from under the reader.
    pub fn node(
        &self,
        owner: &H256,
        path: &[u8],
        hash: H256,
        depth: usize,
    ) -> Result<Option<MemoryNode>, Error> {
        let inner = self.inner.read();
        if inner.stale {
            return Err(Error::Stale);
        }
        if let Some(n) = self.nodes.get(owner).and_then(|subset| subset.get(path)) {
            if n.node.is_deleted() {
                return Ok(None);
            }
            if n.node.hash() != hash {
                return Err(Error::UnexpectedNode {
                    want: hash,
                    has: n.node.hash(),
                    owner: *owner,
                    path: path.to_vec(),
                });
            }
            log::trace!("diff layer hit: id {} depth {depth}", self.id);
            return Ok(Some(n.node.clone()));
        }
        inner.parent.node(owner, path, hash, depth + 1)
    }
}
