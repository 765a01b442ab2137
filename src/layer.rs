//! The snapshot capability surface shared by all layer kinds, and the
//! flatten path that turns bottom-most diff layers into disk layers.

use std::collections::HashMap;
use std::sync::Arc;

use primitive_types::H256;

use crate::difflayer::DiffLayer;
use crate::disklayer::{DiskLayer, DiskLayerSnapshot};
use crate::errors::Error;
use crate::freezer::Freezer;
use crate::nodeset::{MemoryNode, NodeWithPrev};

/// One state view. Dispatch over the concrete kind is confined to the cap
/// path ([`persist`]/[`diff_to_disk`]) and the accessors below.
pub(crate) enum Layer {
    Diff(DiffLayer),
    Disk(DiskLayer),
    DiskSnap(DiskLayerSnapshot),
}

impl Layer {
    /// Root hash of the state this layer represents.
    pub fn root(&self) -> H256 {
        match self {
            Layer::Diff(l) => l.root(),
            Layer::Disk(l) => l.root(),
            Layer::DiskSnap(l) => l.root(),
        }
    }

    /// Id of the associated reverse diff.
    pub fn id(&self) -> u64 {
        match self {
            Layer::Diff(l) => l.id(),
            Layer::Disk(l) => l.id(),
            Layer::DiskSnap(l) => l.id(),
        }
    }

    /// The layer below, absent for the bottom-most kinds.
    pub fn parent(&self) -> Option<Arc<Layer>> {
        match self {
            Layer::Diff(l) => Some(l.parent()),
            Layer::Disk(_) | Layer::DiskSnap(_) => None,
        }
    }

    pub fn stale(&self) -> bool {
        match self {
            Layer::Diff(l) => l.stale(),
            Layer::Disk(l) => l.stale(),
            Layer::DiskSnap(l) => l.stale(),
        }
    }

    pub fn mark_stale(&self) {
        match self {
            Layer::Diff(l) => l.mark_stale(),
            Layer::Disk(l) => l.mark_stale(),
            Layer::DiskSnap(l) => l.mark_stale(),
        }
    }

    pub fn node(
        &self,
        owner: &H256,
        path: &[u8],
        hash: H256,
        depth: usize,
    ) -> Result<Option<MemoryNode>, Error> {
        match self {
            Layer::Diff(l) => l.node(owner, path, hash, depth),
            Layer::Disk(l) => l.node(owner, path, hash, depth),
            Layer::DiskSnap(l) => l.node(owner, path, hash, depth),
        }
    }

    /// Stacks a new diff layer with the given mutations on top of this one.
    pub fn update(
        self: &Arc<Self>,
        root: H256,
        id: u64,
        nodes: HashMap<H256, HashMap<Vec<u8>, NodeWithPrev>>,
    ) -> Arc<Layer> {
        Arc::new(Layer::Diff(DiffLayer::new(self.clone(), root, id, nodes)))
    }
}

/// Everything the flatten path needs besides the layers themselves.
pub(crate) struct CommitContext<'a> {
    pub freezer: Option<&'a dyn Freezer>,
    pub state_freezer: Option<&'a dyn Freezer>,
    pub retention: u64,
}

/// Flattens the given diff layer and every diff below it into the disk
/// layer, bottom first, and returns the replacement disk layer. Each
/// re-parenting happens under the child's write lock so no reader can
/// straddle the swap; each flattened diff goes stale only once its state
/// is carried by the new disk layer.
pub(crate) fn persist(
    layer: &Arc<Layer>,
    force: bool,
    ctx: &CommitContext<'_>,
) -> Result<Arc<Layer>, Error> {
    let Layer::Diff(diff) = &**layer else {
        unreachable!("persisting a non-diff layer")
    };
    {
        let mut inner = diff.inner.write();
        if matches!(&*inner.parent, Layer::Diff(_)) {
            let parent = inner.parent.clone();
            let base = persist(&parent, force, ctx)?;
            inner.parent = base;
        }
    }
    diff_to_disk(layer, force, ctx)
}

/// Merges a bottom-most diff layer into the persistent layer underneath it.
fn diff_to_disk(
    layer: &Arc<Layer>,
    force: bool,
    ctx: &CommitContext<'_>,
) -> Result<Arc<Layer>, Error> {
    let Layer::Diff(bottom) = &**layer else {
        unreachable!("flattening a non-diff layer")
    };
    let parent = bottom.parent();
    let base = match &*parent {
        Layer::Disk(dl) => dl.commit(bottom, force, ctx)?,
        Layer::DiskSnap(ds) => ds.commit(bottom)?,
        Layer::Diff(_) => unreachable!("bottom diff layer still parented to a diff"),
    };
    bottom.mark_stale();
    Ok(base)
}

/// Read-only projection of a snapshot layer.
pub struct Reader {
    layer: Arc<Layer>,
}

impl Reader {
    pub(crate) fn new(layer: Arc<Layer>) -> Self {
        Self { layer }
    }

    /// Root hash of the state this reader is pinned to.
    pub fn root(&self) -> H256 {
        self.layer.root()
    }

    /// Retrieves a trie node by owner, path and expected content hash. A
    /// missing node is `None`, not an error.
    pub fn node(
        &self,
        owner: H256,
        path: &[u8],
        hash: H256,
    ) -> Result<Option<MemoryNode>, Error> {
        self.layer.node(&owner, path, hash, 0)
    }

    /// Like [`Reader::node`], but yields just the encoded blob.
    pub fn node_blob(&self, owner: H256, path: &[u8], hash: H256) -> Result<Option<Vec<u8>>, Error> {
        Ok(self
            .layer
            .node(&owner, path, hash, 0)?
            .map(|n| n.blob().to_vec()))
    }
}
