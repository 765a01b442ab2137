//! Key-value store abstraction and the key schema used on top of it.

use std::collections::HashMap;

use parking_lot::RwLock;
use primitive_types::H256;

use crate::errors::Error;
use crate::{keccak, EMPTY_ROOT};

/// Key prefix of an account-trie node, followed by the node path.
const ACCOUNT_TRIE_NODE_PREFIX: u8 = b'A';
/// Key prefix of a storage-trie node, followed by the owner hash and path.
const STORAGE_TRIE_NODE_PREFIX: u8 = b'O';
/// Tracks the id of the newest reverse diff whose state has been fully
/// written into the key-value store.
const REVERSE_DIFF_HEAD_KEY: &[u8] = b"ReverseDiffHead";
/// Holds the serialized in-memory layer tree between runs.
const TRIE_JOURNAL_KEY: &[u8] = b"TrieJournal";

/// The backing store. Point reads plus atomic batches; the implementation
/// is responsible for batch atomicity across crashes.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;

    fn batch(&self) -> Box<dyn Batch + '_>;
}

/// A buffered set of mutations applied as one atomic unit by `write`.
pub trait Batch {
    fn put(&mut self, key: &[u8], value: &[u8]);

    fn delete(&mut self, key: &[u8]);

    fn write(&mut self) -> Result<(), Error>;

    fn reset(&mut self);
}

/// In-memory reference store, also the test backend.
#[derive(Default)]
pub struct MemoryDatabase {
    map: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl KeyValueStore for MemoryDatabase {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.map.read().get(key).cloned())
    }

    fn batch(&self) -> Box<dyn Batch + '_> {
        Box::new(MemoryBatch {
            db: self,
            ops: Vec::new(),
        })
    }
}

enum Op {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

struct MemoryBatch<'a> {
    db: &'a MemoryDatabase,
    ops: Vec<Op>,
}

impl Batch for MemoryBatch<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.ops.push(Op::Put(key.to_vec(), value.to_vec()));
    }

    fn delete(&mut self, key: &[u8]) {
        self.ops.push(Op::Delete(key.to_vec()));
    }

    fn write(&mut self) -> Result<(), Error> {
        // single lock acquisition makes the batch atomic towards readers
        let mut map = self.db.map.write();
        for op in self.ops.drain(..) {
            match op {
                Op::Put(key, value) => {
                    map.insert(key, value);
                }
                Op::Delete(key) => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.ops.clear();
    }
}

/// Storage key of a trie node. The zero owner addresses the account trie.
pub(crate) fn trie_node_key(owner: &H256, path: &[u8]) -> Vec<u8> {
    let mut key;
    if owner.is_zero() {
        key = Vec::with_capacity(1 + path.len());
        key.push(ACCOUNT_TRIE_NODE_PREFIX);
    } else {
        key = Vec::with_capacity(33 + path.len());
        key.push(STORAGE_TRIE_NODE_PREFIX);
        key.extend_from_slice(owner.as_bytes());
    }
    key.extend_from_slice(path);
    key
}

/// Reads a trie node blob along with its content hash.
pub(crate) fn read_trie_node(
    db: &dyn KeyValueStore,
    owner: &H256,
    path: &[u8],
) -> Result<Option<(Vec<u8>, H256)>, Error> {
    match db.get(&trie_node_key(owner, path))? {
        Some(blob) => {
            let hash = keccak(&blob);
            Ok(Some((blob, hash)))
        }
        None => Ok(None),
    }
}

/// The root hash of the persisted account trie, [`EMPTY_ROOT`] when none is
/// stored.
pub(crate) fn read_account_trie_root(db: &dyn KeyValueStore) -> Result<H256, Error> {
    Ok(read_trie_node(db, &H256::zero(), &[])?
        .map(|(_, hash)| hash)
        .unwrap_or(EMPTY_ROOT))
}

pub(crate) fn read_reverse_diff_head(db: &dyn KeyValueStore) -> Result<u64, Error> {
    match db.get(REVERSE_DIFF_HEAD_KEY)? {
        Some(raw) if raw.len() == 8 => {
            Ok(u64::from_be_bytes(raw.try_into().expect("length checked")))
        }
        Some(_) => Err(Error::Corrupted("malformed reverse diff head".into())),
        None => Ok(0),
    }
}

pub(crate) fn write_reverse_diff_head(batch: &mut dyn Batch, id: u64) {
    batch.put(REVERSE_DIFF_HEAD_KEY, &id.to_be_bytes());
}

pub(crate) fn read_trie_journal(db: &dyn KeyValueStore) -> Result<Option<Vec<u8>>, Error> {
    db.get(TRIE_JOURNAL_KEY)
}

pub(crate) fn write_trie_journal(batch: &mut dyn Batch, journal: &[u8]) {
    batch.put(TRIE_JOURNAL_KEY, journal);
}

pub(crate) fn delete_trie_journal(batch: &mut dyn Batch) {
    batch.delete(TRIE_JOURNAL_KEY);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn batch_is_buffered_until_write() {
        let db = MemoryDatabase::new();
        let mut batch = db.batch();
        batch.put(b"k1", b"v1");
        batch.put(b"k2", b"v2");
        assert_eq!(db.get(b"k1").unwrap(), None);
        batch.write().unwrap();
        assert_eq!(db.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(db.get(b"k2").unwrap(), Some(b"v2".to_vec()));

        let mut batch = db.batch();
        batch.delete(b"k1");
        batch.reset();
        batch.write().unwrap();
        assert_eq!(db.get(b"k1").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn node_keys_separate_tries() {
        let owner = H256::repeat_byte(3);
        let account = trie_node_key(&H256::zero(), b"\x01\x02");
        let storage = trie_node_key(&owner, b"\x01\x02");
        assert_ne!(account, storage);
        assert!(account.starts_with(b"A"));
        assert!(storage.starts_with(b"O"));
    }

    #[test]
    fn persisted_root_and_marker() {
        let db = MemoryDatabase::new();
        assert_eq!(read_account_trie_root(&db).unwrap(), EMPTY_ROOT);
        assert_eq!(read_reverse_diff_head(&db).unwrap(), 0);

        let blob = b"root node".to_vec();
        let mut batch = db.batch();
        batch.put(&trie_node_key(&H256::zero(), &[]), &blob);
        write_reverse_diff_head(&mut *batch, 7);
        batch.write().unwrap();

        assert_eq!(read_account_trie_root(&db).unwrap(), keccak(&blob));
        assert_eq!(read_reverse_diff_head(&db).unwrap(), 7);
        let (read, hash) = read_trie_node(&db, &H256::zero(), &[]).unwrap().unwrap();
        assert_eq!(read, blob);
        assert_eq!(hash, keccak(&blob));
    }
}
