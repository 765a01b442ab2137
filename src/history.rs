//! Per-block history records: reverse diffs that roll the disk layer
//! backward, and previous-leaf state history for higher-level consumers.
//! Both are appended to freezers keyed by the diff id.

use std::collections::HashMap;

use primitive_types::H256;

use crate::codec::{put_bytes, put_hash, put_u64, Cursor};
use crate::difflayer::DiffLayer;
use crate::errors::Error;
use crate::freezer::{
    Freezer, REVERSE_DIFF_HASH_TABLE, REVERSE_DIFF_TABLE, STATE_ACCOUNT_DATA_TABLE,
    STATE_ACCOUNT_INDEX_TABLE, STATE_STORAGE_DATA_TABLE, STATE_STORAGE_INDEX_TABLE,
};
use crate::kv::{trie_node_key, Batch};
use crate::nodeset::resolve_prev_leaves;

const REVERSE_DIFF_VERSION: u64 = 0;

/// Reverse changes of a single trie: the value every mutated path held
/// before the block executed. An empty previous value marks a path that did
/// not exist.
pub(crate) struct StateDiff {
    pub owner: H256,
    pub nodes: Vec<(Vec<u8>, Vec<u8>)>,
}

/// The record undoing one block's node mutations on the disk layer.
pub(crate) struct ReverseDiff {
    pub version: u64,
    pub parent: H256,
    pub root: H256,
    pub states: Vec<StateDiff>,
}

impl ReverseDiff {
    /// Captures the previous values of a bottom-most diff layer. Owners and
    /// paths are sorted so the encoding is deterministic.
    pub fn from_layer(bottom: &DiffLayer) -> Self {
        let mut states: Vec<StateDiff> = bottom
            .nodes()
            .iter()
            .map(|(owner, subset)| {
                let mut nodes: Vec<(Vec<u8>, Vec<u8>)> = subset
                    .iter()
                    .map(|(path, n)| (path.clone(), n.prev.clone()))
                    .collect();
                nodes.sort();
                StateDiff {
                    owner: *owner,
                    nodes,
                }
            })
            .collect();
        states.sort_by_key(|state| state.owner);
        Self {
            version: REVERSE_DIFF_VERSION,
            parent: bottom.parent().root(),
            root: bottom.root(),
            states,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        put_hash(&mut out, &self.parent);
        put_hash(&mut out, &self.root);
        put_u64(&mut out, self.states.len() as u64);
        for state in &self.states {
            put_hash(&mut out, &state.owner);
            put_u64(&mut out, state.nodes.len() as u64);
            for (path, prev) in &state.nodes {
                put_bytes(&mut out, path);
                put_bytes(&mut out, prev);
            }
        }
        out
    }

    pub fn decode(blob: &[u8]) -> Result<Self, Error> {
        if blob.len() < 8 {
            return Err(Error::Corrupted("reverse diff too short".into()));
        }
        let version = u64::from_le_bytes(blob[..8].try_into().expect("length checked"));
        if version != REVERSE_DIFF_VERSION {
            return Err(Error::Corrupted(format!(
                "unknown reverse diff version {version}"
            )));
        }
        let mut cur = Cursor::new(&blob[8..]);
        let parent = cur.hash()?;
        let root = cur.hash()?;
        let mut states = Vec::new();
        for _ in 0..cur.u64()? {
            let owner = cur.hash()?;
            let mut nodes = Vec::new();
            for _ in 0..cur.u64()? {
                let path = cur.bytes()?;
                let prev = cur.bytes()?;
                nodes.push((path, prev));
            }
            states.push(StateDiff { owner, nodes });
        }
        if !cur.is_empty() {
            return Err(Error::Corrupted("trailing reverse diff bytes".into()));
        }
        Ok(Self {
            version,
            parent,
            root,
            states,
        })
    }

    /// Stages the undo into a key-value batch: previous values are written
    /// back, previously non-existent paths are deleted.
    pub fn apply(&self, batch: &mut dyn Batch) {
        for state in &self.states {
            for (path, prev) in &state.nodes {
                let key = trie_node_key(&state.owner, path);
                if prev.is_empty() {
                    batch.delete(&key);
                } else {
                    batch.put(&key, prev);
                }
            }
        }
    }
}

/// Appends the reverse diff of a flattened layer and enforces the retention
/// window by truncating records that aged out of it.
pub(crate) fn store_reverse_diff(
    freezer: &dyn Freezer,
    bottom: &DiffLayer,
    retention: u64,
) -> Result<(), Error> {
    let id = bottom.id();
    let diff = ReverseDiff::from_layer(bottom);
    freezer.append(
        id,
        &[
            (REVERSE_DIFF_TABLE, diff.encode()),
            (REVERSE_DIFF_HASH_TABLE, diff.root.as_bytes().to_vec()),
        ],
    )?;
    if retention > 0 && id > retention {
        freezer.truncate_tail(id - retention + 1)?;
    }
    log::trace!("stored reverse diff: id {id} states {}", diff.states.len());
    Ok(())
}

/// Loads and validates the reverse diff with the given id.
pub(crate) fn load_reverse_diff(freezer: &dyn Freezer, id: u64) -> Result<ReverseDiff, Error> {
    let blob = freezer
        .ancient(REVERSE_DIFF_TABLE, id)?
        .ok_or(Error::Unrecoverable)?;
    let diff = ReverseDiff::decode(&blob)?;
    match freezer.ancient(REVERSE_DIFF_HASH_TABLE, id)? {
        Some(raw) if raw == diff.root.as_bytes() => Ok(diff),
        _ => Err(Error::Corrupted("reverse diff root mismatch".into())),
    }
}

/// One account's slice of a state history record: the previous account
/// value and the previous values of its mutated storage slots.
pub struct AccountHistory {
    pub hash: H256,
    pub prev: Vec<u8>,
    pub slots: Vec<(H256, Vec<u8>)>,
}

/// hash:32 | offset:4 | length:4 | slotOffset:4 | slotNumber:4
const ACCOUNT_INDEX_SIZE: usize = 48;
/// hash:32 | offset:4 | length:4
const STORAGE_INDEX_SIZE: usize = 40;

/// Derives the previous leaf values of a flattened layer and appends them
/// as the four parallel state history blobs. Only externally visible state
/// is recorded; interior nodes are reconstructible from it.
pub(crate) fn store_state_history(freezer: &dyn Freezer, bottom: &DiffLayer) -> Result<(), Error> {
    let mut leaves: HashMap<H256, Vec<(Vec<u8>, Vec<u8>)>> = HashMap::new();
    for (owner, subset) in bottom.nodes() {
        let mut list = Vec::new();
        resolve_prev_leaves(subset, |key, prev| list.push((key, prev)))?;
        list.sort();
        leaves.insert(*owner, list);
    }
    // the account-trie group drives the record; each account's hash keys
    // its storage-leaf group
    let accounts = leaves.remove(&H256::zero()).unwrap_or_default();

    let mut account_index = Vec::with_capacity(accounts.len() * ACCOUNT_INDEX_SIZE);
    let mut account_data = Vec::new();
    let mut storage_index = Vec::new();
    let mut storage_data = Vec::new();
    for (key, prev) in &accounts {
        if key.len() != 32 {
            return Err(Error::Corrupted("account leaf key is not a hash".into()));
        }
        let hash = H256::from_slice(key);
        let slots = leaves.remove(&hash).unwrap_or_default();
        let slot_offset = (storage_index.len() / STORAGE_INDEX_SIZE) as u32;
        for (slot_key, slot_prev) in &slots {
            if slot_key.len() != 32 {
                return Err(Error::Corrupted("storage leaf key is not a hash".into()));
            }
            storage_index.extend_from_slice(slot_key);
            storage_index.extend_from_slice(&(storage_data.len() as u32).to_be_bytes());
            storage_index.extend_from_slice(&(slot_prev.len() as u32).to_be_bytes());
            storage_data.extend_from_slice(slot_prev);
        }
        account_index.extend_from_slice(hash.as_bytes());
        account_index.extend_from_slice(&(account_data.len() as u32).to_be_bytes());
        account_index.extend_from_slice(&(prev.len() as u32).to_be_bytes());
        account_index.extend_from_slice(&slot_offset.to_be_bytes());
        account_index.extend_from_slice(&(slots.len() as u32).to_be_bytes());
        account_data.extend_from_slice(prev);
    }
    freezer.append(
        bottom.id(),
        &[
            (STATE_ACCOUNT_INDEX_TABLE, account_index),
            (STATE_STORAGE_INDEX_TABLE, storage_index),
            (STATE_ACCOUNT_DATA_TABLE, account_data),
            (STATE_STORAGE_DATA_TABLE, storage_data),
        ],
    )?;
    log::trace!(
        "stored state history: id {} accounts {}",
        bottom.id(),
        accounts.len()
    );
    Ok(())
}

/// Decodes the state history record with the given id. An absent record is
/// reported as `None`; the two freezers are not written atomically with
/// respect to each other, so a missing counterpart is recoverable.
pub fn load_state_history(
    freezer: &dyn Freezer,
    id: u64,
) -> Result<Option<Vec<AccountHistory>>, Error> {
    let Some(account_index) = freezer.ancient(STATE_ACCOUNT_INDEX_TABLE, id)? else {
        return Ok(None);
    };
    let storage_index = freezer
        .ancient(STATE_STORAGE_INDEX_TABLE, id)?
        .unwrap_or_default();
    let account_data = freezer
        .ancient(STATE_ACCOUNT_DATA_TABLE, id)?
        .unwrap_or_default();
    let storage_data = freezer
        .ancient(STATE_STORAGE_DATA_TABLE, id)?
        .unwrap_or_default();
    if account_index.len() % ACCOUNT_INDEX_SIZE != 0 || storage_index.len() % STORAGE_INDEX_SIZE != 0
    {
        return Err(Error::Corrupted("ragged state history index".into()));
    }
    let slice = |data: &[u8], offset: u32, len: u32| -> Result<Vec<u8>, Error> {
        data.get(offset as usize..(offset + len) as usize)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::Corrupted("state history data overrun".into()))
    };
    let mut accounts = Vec::new();
    for entry in account_index.chunks(ACCOUNT_INDEX_SIZE) {
        let hash = H256::from_slice(&entry[..32]);
        let offset = u32::from_be_bytes(entry[32..36].try_into().expect("fixed layout"));
        let length = u32::from_be_bytes(entry[36..40].try_into().expect("fixed layout"));
        let slot_offset = u32::from_be_bytes(entry[40..44].try_into().expect("fixed layout"));
        let slot_number = u32::from_be_bytes(entry[44..48].try_into().expect("fixed layout"));
        let mut slots = Vec::new();
        for i in slot_offset..slot_offset + slot_number {
            let at = i as usize * STORAGE_INDEX_SIZE;
            let slot = storage_index
                .get(at..at + STORAGE_INDEX_SIZE)
                .ok_or_else(|| Error::Corrupted("state history slot overrun".into()))?;
            let slot_hash = H256::from_slice(&slot[..32]);
            let data_offset = u32::from_be_bytes(slot[32..36].try_into().expect("fixed layout"));
            let data_len = u32::from_be_bytes(slot[36..40].try_into().expect("fixed layout"));
            slots.push((slot_hash, slice(&storage_data, data_offset, data_len)?));
        }
        accounts.push(AccountHistory {
            hash,
            prev: slice(&account_data, offset, length)?,
            slots,
        });
    }
    Ok(Some(accounts))
}
