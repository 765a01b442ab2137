//! Dirty-node collection for one trie commit, and the tip-node walk that
//! recovers previous leaf values out of a dirty set.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use primitive_types::H256;
use rlp::Rlp;

use crate::errors::Error;
use crate::keccak;

/// A cached trie node: content hash, accounted byte size and the encoded
/// blob. A zero hash marks a deletion tombstone carrying no payload.
#[derive(Clone, Debug)]
pub struct MemoryNode {
    hash: H256,
    size: u16,
    blob: Option<Arc<Vec<u8>>>,
}

impl MemoryNode {
    /// Wraps an encoded blob, deriving the content hash from it.
    pub fn from_blob(blob: Vec<u8>) -> Self {
        Self {
            hash: keccak(&blob),
            size: blob.len() as u16,
            blob: Some(Arc::new(blob)),
        }
    }

    /// Wraps an already-hashed blob. The caller vouches for the hash.
    pub(crate) fn with_hash(hash: H256, blob: Arc<Vec<u8>>) -> Self {
        Self {
            hash,
            size: blob.len() as u16,
            blob: Some(blob),
        }
    }

    /// A deletion tombstone.
    pub fn deleted() -> Self {
        Self {
            hash: H256::zero(),
            size: 0,
            blob: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.hash.is_zero()
    }

    pub fn hash(&self) -> H256 {
        self.hash
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    /// The encoded blob; empty for tombstones.
    pub fn blob(&self) -> &[u8] {
        self.blob.as_deref().map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn memory_size(&self, path_len: usize) -> usize {
        self.size as usize + std::mem::size_of::<Self>() + path_len
    }
}

/// A dirty node together with the encoded value it replaced. An empty `prev`
/// means the node did not exist before this mutation.
#[derive(Clone, Debug)]
pub struct NodeWithPrev {
    pub node: MemoryNode,
    pub prev: Vec<u8>,
}

impl NodeWithPrev {
    pub(crate) fn memory_size(&self, path_len: usize) -> usize {
        self.node.memory_size(path_len) + self.prev.len()
    }
}

/// All dirty nodes collected while committing a single trie, keyed by path.
/// The owner is zero for the account trie, the account hash for a storage
/// trie. Not thread-safe; writing the same path twice is the committer's
/// bug and must be coalesced by the caller.
pub struct NodeSet {
    owner: H256,
    nodes: HashMap<Vec<u8>, NodeWithPrev>,
}

impl NodeSet {
    pub fn new(owner: H256) -> Self {
        Self {
            owner,
            nodes: HashMap::new(),
        }
    }

    pub fn owner(&self) -> H256 {
        self.owner
    }

    /// Records an inserted or updated node along with its previous value.
    pub fn mark_updated(&mut self, path: &[u8], node: MemoryNode, prev: Vec<u8>) {
        self.nodes.insert(path.to_vec(), NodeWithPrev { node, prev });
    }

    /// Records a deleted node along with its previous value.
    pub fn mark_deleted(&mut self, path: &[u8], prev: Vec<u8>) {
        self.nodes.insert(
            path.to_vec(),
            NodeWithPrev {
                node: MemoryNode::deleted(),
                prev,
            },
        );
    }

    pub fn contains(&self, path: &[u8]) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates the dirty nodes in lexicographic path order (top to bottom,
    /// left to right), or reversed.
    pub fn for_each_with_order(
        &self,
        top_to_bottom: bool,
        mut callback: impl FnMut(&[u8], &NodeWithPrev),
    ) {
        let mut paths: Vec<&Vec<u8>> = self.nodes.keys().collect();
        paths.sort();
        if !top_to_bottom {
            paths.reverse();
        }
        for path in paths {
            callback(path, &self.nodes[path]);
        }
    }

    /// A readable dump of the set, for diagnostics.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "nodeset owner: {}", hex::encode(self.owner));
        self.for_each_with_order(true, |path, n| {
            let _ = if n.node.is_deleted() {
                writeln!(out, "  [-]: {} -> {}", hex::encode(path), hex::encode(&n.prev))
            } else if !n.prev.is_empty() {
                writeln!(
                    out,
                    "  [*]: {} -> {} prev: {}",
                    hex::encode(path),
                    hex::encode(n.node.hash()),
                    hex::encode(&n.prev)
                )
            } else {
                writeln!(out, "  [+]: {} -> {}", hex::encode(path), hex::encode(n.node.hash()))
            };
        });
        out
    }
}

/// Per-block merge of the dirty sets of several tries, keyed by owner.
#[derive(Default)]
pub struct MergedNodeSet {
    sets: HashMap<H256, NodeSet>,
}

impl MergedNodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs a merged set holding a single trie's nodes.
    pub fn from_set(set: NodeSet) -> Self {
        let mut merged = Self::new();
        merged.merge(set).expect("first merge cannot collide");
        merged
    }

    /// Folds one trie's dirty nodes in. Merging a second set for the same
    /// owner is rejected.
    pub fn merge(&mut self, other: NodeSet) -> Result<(), Error> {
        if self.sets.contains_key(&other.owner) {
            return Err(Error::DuplicateSet(other.owner));
        }
        self.sets.insert(other.owner, other);
        Ok(())
    }

    /// Converts the set into the two-dimensional owner -> path -> node map
    /// consumed by the layer tree.
    pub(crate) fn flatten(self) -> HashMap<H256, HashMap<Vec<u8>, NodeWithPrev>> {
        self.sets
            .into_iter()
            .map(|(owner, set)| (owner, set.nodes))
            .collect()
    }
}

/// Iterates the tip nodes of a dirty set in lexicographic path order. A tip
/// is a node whose path is not a strict prefix of any other path in the set;
/// in a sorted listing that means it does not prefix its immediate
/// successor.
pub(crate) fn for_each_tip_node<'a>(
    nodes: &'a HashMap<Vec<u8>, NodeWithPrev>,
    mut callback: impl FnMut(&'a [u8], &'a NodeWithPrev) -> Result<(), Error>,
) -> Result<(), Error> {
    let mut paths: Vec<&[u8]> = nodes.keys().map(Vec::as_slice).collect();
    paths.sort();
    for (i, path) in paths.iter().copied().enumerate() {
        if let Some(next) = paths.get(i + 1) {
            if next.starts_with(path) {
                continue;
            }
        }
        callback(path, &nodes[path])?;
    }
    Ok(())
}

/// Resolves every previous leaf value reachable from the tip nodes of a
/// dirty set. The callback receives the full leaf key and the leaf value.
pub(crate) fn resolve_prev_leaves(
    nodes: &HashMap<Vec<u8>, NodeWithPrev>,
    mut callback: impl FnMut(Vec<u8>, Vec<u8>),
) -> Result<(), Error> {
    for_each_tip_node(nodes, |path, tip| {
        if tip.prev.is_empty() {
            return Ok(());
        }
        resolve(path, &Rlp::new(&tip.prev), &mut callback)
    })
}

/// Walks one encoded node, descending into embedded children. Children
/// referenced by hash live in their own database entries and are skipped;
/// only the locally embedded subtree can carry leaves of this tip.
fn resolve(
    prefix: &[u8],
    item: &Rlp<'_>,
    callback: &mut impl FnMut(Vec<u8>, Vec<u8>),
) -> Result<(), Error> {
    match item.item_count()? {
        2 => {
            let key = compact_to_hex(item.at(0)?.data()?);
            if !has_term(&key) {
                return Err(Error::Corrupted("tip node is not a leaf".into()));
            }
            let mut path = prefix.to_vec();
            path.extend_from_slice(&key);
            callback(hex_to_keybytes(&path)?, item.at(1)?.data()?.to_vec());
            Ok(())
        }
        17 => {
            for i in 0..16 {
                let child = item.at(i)?;
                if child.is_list() {
                    let mut path = prefix.to_vec();
                    path.push(i as u8);
                    resolve(&path, &child, callback)?;
                }
            }
            Ok(())
        }
        n => Err(Error::Corrupted(format!("node with {n} items"))),
    }
}

// Hex-prefix path helpers. A trie path is a sequence of nibbles; leaf paths
// end in the terminator nibble 16. The compact form packs two nibbles per
// byte behind a flag nibble carrying the terminator and odd-length bits.

const TERMINATOR: u8 = 16;

fn has_term(hex: &[u8]) -> bool {
    hex.last() == Some(&TERMINATOR)
}

fn keybytes_to_hex(key: &[u8]) -> Vec<u8> {
    let mut nibbles = Vec::with_capacity(key.len() * 2 + 1);
    for b in key {
        nibbles.push(b >> 4);
        nibbles.push(b & 0x0f);
    }
    nibbles.push(TERMINATOR);
    nibbles
}

fn compact_to_hex(compact: &[u8]) -> Vec<u8> {
    if compact.is_empty() {
        return Vec::new();
    }
    let mut base = keybytes_to_hex(compact);
    // flag nibble < 2 means no terminator
    if base[0] < 2 {
        base.pop();
    }
    // odd-length paths keep the second nibble of the flag byte
    let chop = 2 - (base[0] & 1) as usize;
    base.drain(..chop);
    base
}

fn hex_to_keybytes(hex: &[u8]) -> Result<Vec<u8>, Error> {
    let hex = if has_term(hex) {
        &hex[..hex.len() - 1]
    } else {
        hex
    };
    if hex.len() % 2 != 0 {
        return Err(Error::Corrupted("odd length leaf key".into()));
    }
    Ok(hex
        .chunks(2)
        .map(|pair| (pair[0] << 4) | pair[1])
        .collect())
}
