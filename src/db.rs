//! Top-level coordinator: the update/commit/cap write path, rollback and
//! recovery over reverse diffs, journaling, and historical snapshots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use primitive_types::H256;
use typed_builder::TypedBuilder;

use crate::cache::CleanCache;
use crate::convert_empty;
use crate::diskcache::DiskCache;
use crate::disklayer::{DiskLayer, DiskLayerSnapshot};
use crate::errors::Error;
use crate::freezer::Freezer;
use crate::history::load_reverse_diff;
use crate::journal::{Journal, JournalLayer};
use crate::kv::{
    delete_trie_journal, read_account_trie_root, read_reverse_diff_head, read_trie_journal,
    write_reverse_diff_head, write_trie_journal, KeyValueStore,
};
use crate::layer::{CommitContext, Layer, Reader};
use crate::nodeset::MergedNodeSet;
use crate::tree::LayerTree;

/// Maximum number of diff layers kept in memory; anything deeper is
/// flattened into the disk layer on the next update.
pub const MAX_DIFF_LAYERS: usize = 128;

const DEFAULT_DIRTY_CACHE: usize = 16 * 1024 * 1024;
const DEFAULT_RETENTION: u64 = 90_000;

#[derive(Clone, TypedBuilder)]
pub struct Config {
    /// Byte budget of the shared clean node cache; 0 disables it.
    #[builder(default = 0)]
    pub clean_cache_bytes: usize,

    /// Flush threshold of the dirty aggregation cache.
    #[builder(default = DEFAULT_DIRTY_CACHE)]
    pub dirty_cache_bytes: usize,

    /// Number of most recent reverse diffs retained; older records are
    /// truncated from the freezer tail.
    #[builder(default = DEFAULT_RETENTION)]
    pub retention: u64,

    /// Rejects every mutating operation.
    #[builder(default = false)]
    pub read_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// The layered trie-node store. One logical writer, any number of
/// concurrent readers.
pub struct Database {
    config: Config,
    diskdb: Arc<dyn KeyValueStore>,
    freezer: Option<Arc<dyn Freezer>>,
    state_freezer: Option<Arc<dyn Freezer>>,
    clean: Option<Arc<CleanCache>>,
    tree: LayerTree,
    /// Serializes all mutating operations; readers never take it.
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Database {
    /// Opens the store over the given key-value store and optional history
    /// freezers. Reverse diffs newer than the persisted state marker are
    /// remnants of an interrupted shutdown and are dropped; a journal is
    /// replayed when it matches the persisted state and discarded otherwise.
    pub fn open(
        diskdb: Arc<dyn KeyValueStore>,
        freezer: Option<Arc<dyn Freezer>>,
        state_freezer: Option<Arc<dyn Freezer>>,
        config: Config,
    ) -> Result<Self, Error> {
        let clean = (config.clean_cache_bytes > 0)
            .then(|| Arc::new(CleanCache::new(config.clean_cache_bytes)));
        let persistent_id = read_reverse_diff_head(&*diskdb)?;
        if !config.read_only {
            for f in [freezer.as_ref(), state_freezer.as_ref()].into_iter().flatten() {
                if f.head() > persistent_id {
                    log::warn!(
                        "truncating dangling history: head {} persisted {persistent_id}",
                        f.head()
                    );
                    f.truncate_head(persistent_id)?;
                }
            }
        }
        let head = load_layers(&diskdb, clean.clone(), &config, persistent_id)?;
        if !config.read_only && read_trie_journal(&*diskdb)?.is_some() {
            // the journal is one-shot; a crash from here on starts fresh
            let mut batch = diskdb.batch();
            delete_trie_journal(&mut *batch);
            batch.write()?;
        }
        let tree = LayerTree::new(head);
        log::info!(
            "opened triedb: root {} id {persistent_id} layers {}",
            hex::encode(tree.bottom().root()),
            tree.len(),
        );
        Ok(Self {
            config,
            diskdb,
            freezer,
            state_freezer,
            clean,
            tree,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    fn ctx(&self) -> CommitContext<'_> {
        CommitContext {
            freezer: self.freezer.as_deref(),
            state_freezer: self.state_freezer.as_deref(),
            retention: self.config.retention,
        }
    }

    fn ensure_writable(&self) -> Result<(), Error> {
        if self.config.read_only || self.closed.load(Ordering::Acquire) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Links the merged dirty nodes of one block as a new diff layer on top
    /// of its parent state, then caps the chain at [`MAX_DIFF_LAYERS`].
    pub fn update(&self, root: H256, parent: H256, nodes: MergedNodeSet) -> Result<(), Error> {
        let _guard = self.write_lock.lock();
        self.ensure_writable()?;
        self.tree.add(root, parent, nodes.flatten())?;
        self.tree.cap(root, MAX_DIFF_LAYERS, &self.ctx())
    }

    /// Flattens everything below the given root into the disk layer and
    /// flushes it. Exactly one layer is left afterwards.
    pub fn commit(&self, root: H256, report: bool) -> Result<(), Error> {
        let _guard = self.write_lock.lock();
        self.ensure_writable()?;
        self.tree.cap(root, 0, &self.ctx())?;
        if report {
            log::info!("committed triedb: root {}", hex::encode(convert_empty(root)));
        } else {
            log::debug!("committed triedb: root {}", hex::encode(convert_empty(root)));
        }
        Ok(())
    }

    /// Flattens diff layers beyond `layers` below the given root into the
    /// disk layer.
    pub fn cap(&self, root: H256, layers: usize) -> Result<(), Error> {
        let _guard = self.write_lock.lock();
        self.ensure_writable()?;
        self.tree.cap(root, layers, &self.ctx())
    }

    /// Rolls the disk layer back, one reverse diff at a time, until its
    /// state equals `root`. All in-memory diff layers are discarded on
    /// success. States without a contiguous reverse-diff path are rejected
    /// untouched.
    pub fn recover(&self, root: H256) -> Result<(), Error> {
        let _guard = self.write_lock.lock();
        self.ensure_writable()?;
        let root = convert_empty(root);
        if !self.recoverable(root) {
            return Err(Error::Unrecoverable);
        }
        let freezer = self.freezer.as_ref().ok_or(Error::Unrecoverable)?;
        let mut layer = self.tree.bottom();
        while layer.root() != root {
            let next = {
                let Layer::Disk(disk) = &*layer else {
                    unreachable!("tree bottom is always the disk layer")
                };
                let diff = load_reverse_diff(&**freezer, disk.id())?;
                disk.revert(&diff, disk.id())?
            };
            layer = next;
        }
        // the replayed ids are gone; future commits re-append at them
        freezer.truncate_head(layer.id())?;
        if let Some(f) = &self.state_freezer {
            f.truncate_head(layer.id())?;
        }
        self.tree.init(layer);
        log::info!("recovered triedb: root {}", hex::encode(root));
        Ok(())
    }

    /// Whether a contiguous reverse-diff chain leads from the current disk
    /// layer back to a state with the given root.
    pub fn recoverable(&self, root: H256) -> bool {
        let root = convert_empty(root);
        let Some(freezer) = &self.freezer else {
            return false;
        };
        let bottom = self.tree.bottom();
        let (mut id, mut current) = (bottom.id(), bottom.root());
        if current == root {
            // already live, nothing to roll back
            return false;
        }
        while id > 0 {
            let Ok(diff) = load_reverse_diff(&**freezer, id) else {
                return false;
            };
            if diff.root != current {
                return false;
            }
            current = diff.parent;
            id -= 1;
            if current == root {
                return true;
            }
        }
        false
    }

    /// Catastrophic reset: wipes every reverse diff, state history record
    /// and journal, and re-roots the tree at the state currently persisted
    /// in the key-value store. `root` must name exactly that state.
    pub fn reset(&self, root: H256) -> Result<(), Error> {
        let _guard = self.write_lock.lock();
        self.ensure_writable()?;
        let root = convert_empty(root);
        let persisted = read_account_trie_root(&*self.diskdb)?;
        if root != persisted {
            return Err(Error::StateMismatch {
                local: persisted,
                target: root,
            });
        }
        for f in [self.freezer.as_ref(), self.state_freezer.as_ref()]
            .into_iter()
            .flatten()
        {
            f.truncate_head(0)?;
        }
        let mut batch = self.diskdb.batch();
        delete_trie_journal(&mut *batch);
        write_reverse_diff_head(&mut *batch, 0);
        batch.write()?;
        // orphaned layers must not keep serving states that no longer exist
        self.tree.for_each(|_, layer| {
            layer.mark_stale();
            true
        });
        self.tree.init(Arc::new(Layer::Disk(DiskLayer::new(
            root,
            0,
            self.diskdb.clone(),
            self.clean.clone(),
            DiskCache::new(self.config.dirty_cache_bytes),
        ))));
        log::info!("reset triedb: root {}", hex::encode(root));
        Ok(())
    }

    /// Persists the diff chain above the disk layer, starting at `root`,
    /// into the key-value store so the in-memory tree survives a restart.
    /// The disk layer's buffered nodes are flushed first so the journal
    /// anchors on durable state.
    pub fn journal(&self, root: H256) -> Result<(), Error> {
        let _guard = self.write_lock.lock();
        self.ensure_writable()?;
        let root = convert_empty(root);
        let head = self.tree.get(root).ok_or(Error::LayerMissing(root))?;
        let bottom = self.tree.bottom();
        let Layer::Disk(disk) = &*bottom else {
            unreachable!("tree bottom is always the disk layer")
        };
        disk.flush(true)?;

        let mut journal = Journal {
            disk_root: disk.root(),
            disk_id: disk.id(),
            layers: Vec::new(),
        };
        let mut current = head;
        loop {
            let next = match &*current {
                Layer::Diff(diff) => {
                    journal.layers.push(JournalLayer {
                        root: diff.root(),
                        id: diff.id(),
                        nodes: diff.nodes().clone(),
                    });
                    diff.parent()
                }
                _ => break,
            };
            current = next;
        }
        let layers = journal.layers.len();
        let mut batch = self.diskdb.batch();
        write_trie_journal(&mut *batch, &journal.encode());
        batch.write()?;
        log::info!("journaled triedb: root {} layers {layers}", hex::encode(root));
        Ok(())
    }

    /// Shuts the store down; every further mutation fails with
    /// [`Error::ReadOnly`]. Call [`Database::journal`] first to keep the
    /// in-memory tree.
    pub fn close(&self) -> Result<(), Error> {
        let _guard = self.write_lock.lock();
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    /// A read-only view of the state with the given root, if it is held by
    /// any live layer.
    pub fn get_reader(&self, root: H256) -> Option<Reader> {
        self.tree.get(convert_empty(root)).map(Reader::new)
    }

    /// Pins a read-only snapshot of a historical disk state by replaying
    /// reverse diffs over the live one, without disturbing the tree.
    pub fn snapshot(&self, root: H256) -> Result<Reader, Error> {
        let root = convert_empty(root);
        let bottom = self.tree.bottom();
        let Layer::Disk(disk) = &*bottom else {
            unreachable!("tree bottom is always the disk layer")
        };
        let mut overlay = disk.dirty_copy()?;
        let (mut id, mut current) = (disk.id(), disk.root());
        while current != root {
            if id == 0 {
                return Err(Error::Unrecoverable);
            }
            let freezer = self.freezer.as_ref().ok_or(Error::Unrecoverable)?;
            let diff = load_reverse_diff(&**freezer, id)?;
            if diff.root != current {
                return Err(Error::UnmatchedReverseDiff);
            }
            overlay.rollback(&diff);
            current = diff.parent;
            id -= 1;
        }
        Ok(Reader::new(Arc::new(Layer::DiskSnap(
            DiskLayerSnapshot::new(root, id, self.diskdb.clone(), self.clean.clone(), overlay),
        ))))
    }

    /// Re-bounds the dirty cache of the current disk layer.
    pub fn set_cache_size(&self, bytes: usize) -> Result<(), Error> {
        let _guard = self.write_lock.lock();
        self.ensure_writable()?;
        let bottom = self.tree.bottom();
        let Layer::Disk(disk) = &*bottom else {
            unreachable!("tree bottom is always the disk layer")
        };
        disk.set_cache_size(bytes)
    }

    /// Approximate memory held by diff layers and the dirty cache.
    pub fn size(&self) -> (u64, usize) {
        let mut diffs = 0u64;
        let mut dirty = 0usize;
        self.tree.for_each(|_, layer| {
            match &**layer {
                Layer::Diff(l) => diffs += l.memory(),
                Layer::Disk(l) => dirty = l.size(),
                Layer::DiskSnap(_) => {}
            }
            true
        });
        (diffs, dirty)
    }

    /// Number of live layers, the disk layer included.
    pub fn layer_count(&self) -> usize {
        self.tree.len()
    }

    /// Root of the current disk layer.
    pub fn disk_root(&self) -> H256 {
        self.tree.bottom().root()
    }

    /// Id of the newest reverse diff absorbed by the disk layer.
    pub fn disk_id(&self) -> u64 {
        self.tree.bottom().id()
    }
}

/// Reconstructs the layer chain from the journal, or starts fresh from the
/// persisted state when no usable journal exists.
fn load_layers(
    diskdb: &Arc<dyn KeyValueStore>,
    clean: Option<Arc<CleanCache>>,
    config: &Config,
    persistent_id: u64,
) -> Result<Arc<Layer>, Error> {
    let root = read_account_trie_root(&**diskdb)?;
    let disk = Arc::new(Layer::Disk(DiskLayer::new(
        root,
        persistent_id,
        diskdb.clone(),
        clean,
        DiskCache::new(config.dirty_cache_bytes),
    )));
    let Some(blob) = read_trie_journal(&**diskdb)? else {
        return Ok(disk);
    };
    let journal = match Journal::decode(&blob) {
        Ok(journal) => journal,
        Err(err) => {
            log::warn!("discarded undecodable trie journal: {err}");
            return Ok(disk);
        }
    };
    if journal.disk_root != root || journal.disk_id != persistent_id {
        log::warn!(
            "discarded stale trie journal: root {} != {} or id {} != {persistent_id}",
            hex::encode(journal.disk_root),
            hex::encode(root),
            journal.disk_id,
        );
        return Ok(disk);
    }
    let mut head = disk.clone();
    for layer in journal.layers.into_iter().rev() {
        if layer.id != head.id() + 1 {
            log::warn!("discarded ragged trie journal at id {}", layer.id);
            return Ok(disk);
        }
        head = head.update(layer.root, layer.id, layer.nodes);
    }
    log::debug!("loaded trie journal: head {}", hex::encode(head.root()));
    Ok(head)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::freezer::{MemoryFreezer, STATE_HISTORY_TABLES, TRIE_HISTORY_TABLES};
    use crate::history::load_state_history;
    use crate::kv::MemoryDatabase;
    use crate::nodeset::{MemoryNode, NodeSet};
    use crate::{keccak, EMPTY_ROOT};

    /// Encoded leaf node with an even-length terminated key.
    fn leaf_rlp(key: &[u8; 32], value: &[u8]) -> Vec<u8> {
        let mut compact = vec![0x20];
        compact.extend_from_slice(key);
        let mut stream = rlp::RlpStream::new_list(2);
        stream.append(&compact);
        stream.append(&value.to_vec());
        stream.out().to_vec()
    }

    #[test]
    fn state_history_of_a_commit() {
        let diskdb = Arc::new(MemoryDatabase::new());
        let state_freezer = Arc::new(MemoryFreezer::new(STATE_HISTORY_TABLES));
        let db = Database::open(
            diskdb,
            Some(Arc::new(MemoryFreezer::new(TRIE_HISTORY_TABLES))),
            Some(state_freezer.clone()),
            Config::default(),
        )
        .unwrap();

        let account = [7u8; 32];
        let slot = [9u8; 32];
        // account trie root whose previous value carried one leaf
        let mut set = NodeSet::new(H256::zero());
        set.mark_updated(
            &[],
            MemoryNode::from_blob(b"new account root".to_vec()),
            leaf_rlp(&account, b"old account"),
        );
        let mut merged = MergedNodeSet::from_set(set);
        // storage trie of that account, one previous slot leaf
        let mut set = NodeSet::new(H256::from_slice(&account));
        set.mark_updated(
            &[],
            MemoryNode::from_blob(b"new storage root".to_vec()),
            leaf_rlp(&slot, b"old slot"),
        );
        merged.merge(set).unwrap();

        let root = H256::repeat_byte(0xaa);
        db.update(root, EMPTY_ROOT, merged).unwrap();
        db.commit(root, false).unwrap();

        let accounts = load_state_history(&*state_freezer, 1).unwrap().unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].hash, H256::from_slice(&account));
        assert_eq!(accounts[0].prev, b"old account");
        assert_eq!(
            accounts[0].slots,
            vec![(H256::from_slice(&slot), b"old slot".to_vec())]
        );
    }

    #[test]
    fn snapshot_pins_historical_state() {
        let diskdb = Arc::new(MemoryDatabase::new());
        let db = Database::open(
            diskdb,
            Some(Arc::new(MemoryFreezer::new(TRIE_HISTORY_TABLES))),
            None,
            Config::builder().dirty_cache_bytes(0).build(),
        )
        .unwrap();

        let blobs = [b"gen-1".to_vec(), b"gen-2".to_vec(), b"gen-3".to_vec()];
        let mut parent = EMPTY_ROOT;
        let mut roots = Vec::new();
        for (i, blob) in blobs.iter().enumerate() {
            let mut set = NodeSet::new(H256::zero());
            let prev = if i == 0 {
                Vec::new()
            } else {
                blobs[i - 1].clone()
            };
            set.mark_updated(b"\x01", MemoryNode::from_blob(blob.clone()), prev);
            let root = H256::repeat_byte(i as u8 + 1);
            db.update(root, parent, MergedNodeSet::from_set(set)).unwrap();
            roots.push(root);
            parent = root;
        }
        db.commit(parent, false).unwrap();

        // live state serves the newest blob
        let reader = db.get_reader(roots[2]).unwrap();
        assert_eq!(
            reader
                .node_blob(H256::zero(), b"\x01", keccak(b"gen-3"))
                .unwrap()
                .unwrap(),
            b"gen-3"
        );
        // a pinned snapshot replays reverse diffs back to generation one
        let snap = db.snapshot(roots[0]).unwrap();
        assert_eq!(
            snap.node_blob(H256::zero(), b"\x01", keccak(b"gen-1"))
                .unwrap()
                .unwrap(),
            b"gen-1"
        );
        // and to the empty state, where the node is absent
        let snap = db.snapshot(EMPTY_ROOT).unwrap();
        assert!(snap
            .node_blob(H256::zero(), b"\x01", keccak(b"gen-1"))
            .unwrap()
            .is_none());
        // unknown states are refused
        assert!(db.snapshot(H256::repeat_byte(0x77)).is_err());
    }

    #[test]
    fn read_only_database_rejects_mutation() {
        let diskdb = Arc::new(MemoryDatabase::new());
        let db = Database::open(
            diskdb.clone(),
            None,
            None,
            Config::builder().read_only(true).build(),
        )
        .unwrap();
        let err = db.update(H256::repeat_byte(1), EMPTY_ROOT, MergedNodeSet::new());
        assert!(matches!(err, Err(Error::ReadOnly)));

        let db = Database::open(diskdb, None, None, Config::default()).unwrap();
        db.close().unwrap();
        let err = db.commit(EMPTY_ROOT, false);
        assert!(matches!(err, Err(Error::ReadOnly)));
    }
}
