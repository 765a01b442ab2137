//! Root-indexed group of snapshot layers linked into a tree, and the cap
//! operation that keeps its depth bounded.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use primitive_types::H256;

use crate::convert_empty;
use crate::errors::Error;
use crate::layer::{persist, CommitContext, Layer};
use crate::nodeset::NodeWithPrev;

/// Thread-safe layer index. Exactly one bottom layer is present at all
/// times; diff layers may form branches, not just a chain.
pub(crate) struct LayerTree {
    layers: RwLock<HashMap<H256, Arc<Layer>>>,
}

impl LayerTree {
    /// Builds the tree from a head layer by linking in all its ancestors.
    pub fn new(head: Arc<Layer>) -> Self {
        let mut layers = HashMap::new();
        let mut current = Some(head);
        while let Some(layer) = current {
            current = layer.parent();
            layers.insert(layer.root(), layer);
        }
        Self {
            layers: RwLock::new(layers),
        }
    }

    /// Replaces the whole tree with a single bottom layer.
    pub fn init(&self, bottom: Arc<Layer>) {
        let mut layers = self.layers.write();
        layers.clear();
        layers.insert(bottom.root(), bottom);
    }

    pub fn get(&self, root: H256) -> Option<Arc<Layer>> {
        self.layers.read().get(&convert_empty(root)).cloned()
    }

    pub fn len(&self) -> usize {
        self.layers.read().len()
    }

    pub fn for_each(&self, mut callback: impl FnMut(&H256, &Arc<Layer>) -> bool) {
        for (root, layer) in self.layers.read().iter() {
            if !callback(root, layer) {
                return;
            }
        }
    }

    /// The unique layer without a parent.
    pub fn bottom(&self) -> Arc<Layer> {
        let layers = self.layers.read();
        let mut current = layers
            .values()
            .next()
            .expect("layer tree is never empty")
            .clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// Links a new diff layer onto an existing parent. Self-loops (empty
    /// blocks re-announcing their parent root) are the caller's bug.
    pub fn add(
        &self,
        root: H256,
        parent_root: H256,
        nodes: HashMap<H256, HashMap<Vec<u8>, NodeWithPrev>>,
    ) -> Result<(), Error> {
        let root = convert_empty(root);
        let parent_root = convert_empty(parent_root);
        if root == parent_root {
            return Err(Error::Cycle);
        }
        let parent = self
            .get(parent_root)
            .ok_or(Error::ParentMissing(parent_root))?;
        let layer = parent.update(root, parent.id() + 1, nodes);
        self.layers.write().insert(root, layer);
        Ok(())
    }

    /// Flattens diff layers beyond the permitted depth below the given head
    /// into the disk layer. `layers == 0` merges everything down and leaves
    /// a lone disk layer behind.
    pub fn cap(&self, root: H256, layers: usize, ctx: &CommitContext<'_>) -> Result<(), Error> {
        let root = convert_empty(root);
        let snap = self.get(root).ok_or(Error::LayerMissing(root))?;
        if !matches!(&*snap, Layer::Diff(_)) {
            // the disk layer itself, nothing above it to flatten
            return Ok(());
        }
        let mut map = self.layers.write();

        // full commit: flatten the entire chain and restart the tree from
        // the flat base
        if layers == 0 {
            let base = persist(&snap, true, ctx)?;
            map.clear();
            map.insert(base.root(), base);
            return Ok(());
        }
        // dive down the chain, keeping the permitted number of diffs
        let mut diff = snap;
        for _ in 0..layers - 1 {
            let parent = diff.parent().expect("diff layers always have parents");
            match &*parent {
                Layer::Diff(_) => diff = parent,
                // chain too shallow, nothing to do
                _ => return Ok(()),
            }
        }
        let parent = diff.parent().expect("diff layers always have parents");
        match &*parent {
            Layer::Disk(_) | Layer::DiskSnap(_) => return Ok(()),
            Layer::Diff(_) => {
                // hold the write lock of the lowest kept diff so no reader
                // traverses into the chain being flattened
                let Layer::Diff(kept) = &*diff else {
                    unreachable!("walk stays on diff layers")
                };
                let mut inner = kept.inner.write();
                let base = persist(&parent, false, ctx)?;
                map.insert(base.root(), base.clone());
                inner.parent = base;
            }
        }
        // sweep out layers that went stale, along with every descendant
        // still pointing at them
        let mut children: HashMap<H256, Vec<H256>> = HashMap::new();
        for (root, layer) in map.iter() {
            if let Layer::Diff(diff) = &**layer {
                children.entry(diff.parent().root()).or_default().push(*root);
            }
        }
        fn remove(
            root: H256,
            map: &mut HashMap<H256, Arc<Layer>>,
            children: &mut HashMap<H256, Vec<H256>>,
        ) {
            map.remove(&root);
            if let Some(descendants) = children.remove(&root) {
                for child in descendants {
                    remove(child, map, children);
                }
            }
        }
        let stale: Vec<H256> = map
            .iter()
            .filter(|(_, layer)| layer.stale())
            .map(|(root, _)| *root)
            .collect();
        for root in stale {
            remove(root, &mut map, &mut children);
        }
        Ok(())
    }
}
