use primitive_types::H256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The layer was flattened into a descendant or reverted away. Callers
    /// must resolve a fresh layer from the current tree and retry.
    #[error("snapshot stale")]
    Stale,

    /// The blob resolved for a node does not hash to the requested value.
    /// Fatal for the read; the store holds data the caller's view never
    /// produced.
    #[error("unexpected node {}!={} (owner {} path {})",
        hex::encode(.want), hex::encode(.has), hex::encode(.owner), hex::encode(.path))]
    UnexpectedNode {
        want: H256,
        has: H256,
        owner: H256,
        path: Vec<u8>,
    },

    /// The reverse diff does not line up with the disk layer being reverted.
    #[error("unmatched reverse diff")]
    UnmatchedReverseDiff,

    /// No contiguous reverse-diff chain leads to the requested state.
    #[error("state is unrecoverable")]
    Unrecoverable,

    /// The parent snapshot of a new layer is not present in the tree.
    #[error("parent snapshot missing {}", hex::encode(.0))]
    ParentMissing(H256),

    /// A layer may not be its own parent.
    #[error("snapshot cycle")]
    Cycle,

    /// The snapshot to operate on is not present in the tree.
    #[error("snapshot missing {}", hex::encode(.0))]
    LayerMissing(H256),

    /// Reset was pointed at a state other than the persisted one.
    #[error("state is mismatched, local {} target {}", hex::encode(.local), hex::encode(.target))]
    StateMismatch { local: H256, target: H256 },

    /// The database was opened read-only or has been closed.
    #[error("read only")]
    ReadOnly,

    /// A set of dirty nodes for this trie was already merged.
    #[error("duplicate trie for owner {}", hex::encode(.0))]
    DuplicateSet(H256),

    #[error("bincode error")]
    Codec(#[from] bincode::Error),

    #[error("rlp error")]
    Rlp(#[from] rlp::DecoderError),

    /// A stored blob (journal, reverse diff, history) failed validation.
    #[error("corrupted data: {0}")]
    Corrupted(String),

    /// Backend key-value store or freezer failure.
    #[error("database error: {0}")]
    Database(String),
}
