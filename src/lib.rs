//! # loam: a versioned, layered trie-node store for blockchain state.
//!
//! Loam keeps the node graph of a Merkle trie across many recent block
//! states. Each block contributes one in-memory diff layer holding that
//! block's node mutations over its parent state; old diff layers are
//! periodically flattened ("capped") into a single persistent disk layer
//! backed by a key-value store. The disk layer aggregates flattened nodes in
//! a dirty cache and flushes them in one atomic batch once a size threshold
//! is crossed, so the key-value store only ever sees whole-batch state
//! transitions.
//!
//! Every flatten appends a reverse diff — the previous value of each mutated
//! node — to an append-only freezer. The persistent state can therefore be
//! rolled back block by block to any state still inside the retention
//! window, and read-only snapshots of such historical states can be pinned
//! without disturbing the live tree. The in-memory layer tree itself
//! survives restarts through a journal blob written at shutdown.
//!
//! The store is a library, not a database server: the key-value store and
//! the freezers are supplied by the embedder through the [`kv::KeyValueStore`]
//! and [`freezer::Freezer`] traits (in-memory reference implementations are
//! included), node blobs are opaque byte strings addressed by their
//! Keccak-256 content hash, and a single logical writer is assumed while
//! concurrent readers stay safe through per-layer staleness tracking.

use primitive_types::H256;
use sha3::{Digest, Keccak256};

pub(crate) mod cache;
pub(crate) mod codec;
pub mod db;
pub(crate) mod difflayer;
pub(crate) mod diskcache;
pub(crate) mod disklayer;
pub mod errors;
pub mod freezer;
pub(crate) mod history;
pub(crate) mod journal;
pub mod kv;
pub(crate) mod layer;
pub mod nodeset;
pub(crate) mod tree;

pub use db::{Config, Database};
pub use errors::Error;
pub use freezer::{Freezer, MemoryFreezer};
pub use history::{load_state_history, AccountHistory};
pub use kv::{Batch, KeyValueStore, MemoryDatabase};
pub use layer::Reader;
pub use nodeset::{MemoryNode, MergedNodeSet, NodeSet, NodeWithPrev};
pub use primitive_types::H256 as Hash;

/// Root hash of an empty trie, `keccak256(rlp(""))`. The all-zero hash is
/// normalized to this value at every tree boundary.
pub const EMPTY_ROOT: H256 = H256([
    0x56, 0xe8, 0x1f, 0x17, 0x1b, 0xcc, 0x55, 0xa6, 0xff, 0x83, 0x45, 0xe6, 0x92, 0xc0, 0xf8,
    0x6e, 0x5b, 0x48, 0xe0, 0x1b, 0x99, 0x6c, 0xad, 0xc0, 0x01, 0x62, 0x2f, 0xb5, 0xe3, 0x63,
    0xb4, 0x21,
]);

/// Keccak-256 content hash of a node blob.
pub fn keccak(data: &[u8]) -> H256 {
    H256::from_slice(&Keccak256::digest(data))
}

/// Replaces the all-zero hash with [`EMPTY_ROOT`].
pub(crate) fn convert_empty(hash: H256) -> H256 {
    if hash.is_zero() {
        EMPTY_ROOT
    } else {
        hash
    }
}
