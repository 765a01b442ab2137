//! End-to-end scenarios: fill the store with generations of random node
//! mutations, then exercise commit, rollback, journaling and reset.

use std::sync::Arc;

use loam::freezer::{Freezer, REVERSE_DIFF_HASH_TABLE, REVERSE_DIFF_TABLE, TRIE_HISTORY_TABLES};
use loam::{
    keccak, Config, Database, Error, Hash, MemoryDatabase, MemoryFreezer, MemoryNode,
    MergedNodeSet, NodeSet, EMPTY_ROOT,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

struct TestEnv {
    diskdb: Arc<MemoryDatabase>,
    freezer: Arc<MemoryFreezer>,
    db: Database,
    roots: Vec<Hash>,
    /// Per generation: the touched paths and the blobs they hold in that
    /// generation's state; an empty blob records a deletion.
    paths: Vec<Vec<Vec<u8>>>,
    blobs: Vec<Vec<Vec<u8>>>,
}

fn random_node(rng: &mut StdRng) -> MemoryNode {
    let blob: Vec<u8> = (0..100).map(|_| rng.gen()).collect();
    MemoryNode::from_blob(blob)
}

/// Builds one generation of random node mutations: creations on fresh
/// paths, modifications and deletions of paths touched by the previous
/// generation, and a fresh root node at the empty path.
fn fill(
    rng: &mut StdRng,
    count: usize,
    prev_paths: &[Vec<Vec<u8>>],
    prev_blobs: &[Vec<Vec<u8>>],
    root_blob: &[u8],
) -> (Hash, Vec<u8>, NodeSet) {
    let mut set = NodeSet::new(Hash::zero());
    for _ in 0..count {
        match rng.gen_range(0..3) {
            0 => {
                // node creation
                let path: [u8; 32] = rng.gen();
                if set.contains(&path) {
                    continue;
                }
                set.mark_updated(&path, random_node(rng), Vec::new());
            }
            1 => {
                // modification of a node from the previous generation
                let Some(paths) = prev_paths.last() else {
                    continue;
                };
                if paths.is_empty() {
                    continue;
                }
                let index = rng.gen_range(0..paths.len());
                let path = &paths[index];
                if path.is_empty() || set.contains(path) {
                    continue;
                }
                let prev = prev_blobs.last().expect("recorded together")[index].clone();
                set.mark_updated(path, random_node(rng), prev);
            }
            _ => {
                // node deletion
                let (Some(paths), Some(blobs)) = (prev_paths.last(), prev_blobs.last()) else {
                    continue;
                };
                if paths.is_empty() {
                    continue;
                }
                let index = rng.gen_range(0..paths.len());
                let (path, blob) = (&paths[index], &blobs[index]);
                if path.is_empty() || blob.is_empty() || set.contains(path) {
                    continue;
                }
                set.mark_deleted(path, blob.clone());
            }
        }
    }
    // the new root node lives at the empty path
    let root = random_node(rng);
    let blob = root.blob().to_vec();
    let hash = root.hash();
    set.mark_updated(&[], root, root_blob.to_vec());
    (hash, blob, set)
}

/// Runs `gens` generations of updates against a fresh database.
fn fill_db(gens: usize, per_gen: usize, config: Config) -> TestEnv {
    let mut rng = StdRng::seed_from_u64(42);
    let diskdb = Arc::new(MemoryDatabase::new());
    let freezer = Arc::new(MemoryFreezer::new(TRIE_HISTORY_TABLES));
    let db = Database::open(diskdb.clone(), Some(freezer.clone()), None, config).unwrap();

    let mut roots = Vec::new();
    let mut paths: Vec<Vec<Vec<u8>>> = Vec::new();
    let mut blobs: Vec<Vec<Vec<u8>>> = Vec::new();
    let mut parent = EMPTY_ROOT;
    let mut root_blob = Vec::new();
    for _ in 0..gens {
        let (root, blob, set) = fill(&mut rng, per_gen, &paths, &blobs, &root_blob);
        let mut path_list = Vec::new();
        let mut blob_list = Vec::new();
        set.for_each_with_order(false, |path, n| {
            path_list.push(path.to_vec());
            blob_list.push(if n.node.is_deleted() {
                Vec::new()
            } else {
                n.node.blob().to_vec()
            });
        });
        paths.push(path_list);
        blobs.push(blob_list);

        db.update(root, parent, MergedNodeSet::from_set(set)).unwrap();
        roots.push(root);
        parent = root;
        root_blob = blob;
    }
    TestEnv {
        diskdb,
        freezer,
        db,
        roots,
        paths,
        blobs,
    }
}

fn test_config() -> Config {
    // a small dirty cache keeps the flush path busy during the fill
    Config::builder().dirty_cache_bytes(256 * 1024).build()
}

/// Asserts that every path touched by generation `index` reads back its
/// recorded blob through the given database, and deletions read as absent.
fn check_generation(db: &Database, env: &TestEnv, index: usize) {
    let reader = db.get_reader(env.roots[index]).expect("layer is live");
    for (path, blob) in env.paths[index].iter().zip(&env.blobs[index]) {
        if blob.is_empty() {
            let got = reader.node_blob(Hash::zero(), path, keccak(blob)).unwrap();
            assert!(got.is_none(), "deleted node resurfaced at {}", hex::encode(path));
        } else {
            let got = reader
                .node_blob(Hash::zero(), path, keccak(blob))
                .unwrap()
                .unwrap_or_else(|| panic!("missing node at {}", hex::encode(path)));
            assert_eq!(got, *blob, "wrong node at {}", hex::encode(path));
        }
    }
}

#[test]
fn fill_and_roll_back() {
    let env = fill_db(2 * 128, 500, test_config());
    let index = env
        .roots
        .iter()
        .position(|r| *r == env.db.disk_root())
        .expect("disk root is one of the generations");

    // reverse diffs exist exactly for the flattened generations, and each
    // records its post-state root
    for i in 0..=index {
        let id = i as u64 + 1;
        let root = env.freezer.ancient(REVERSE_DIFF_HASH_TABLE, id).unwrap();
        assert_eq!(root, Some(env.roots[i].as_bytes().to_vec()));
    }
    for i in index + 1..env.roots.len() {
        let id = i as u64 + 1;
        assert_eq!(env.freezer.ancient(REVERSE_DIFF_TABLE, id).unwrap(), None);
    }

    // commit the head, then unwind one generation at a time
    let head = *env.roots.last().unwrap();
    env.db.commit(head, false).unwrap();
    assert_eq!(env.db.disk_root(), head);
    for i in (1..env.roots.len()).rev() {
        env.db.recover(env.roots[i - 1]).unwrap();
        assert_eq!(env.db.disk_root(), env.roots[i - 1]);
        check_generation(&env.db, &env, i - 1);
    }
    assert_eq!(env.db.layer_count(), 1);
}

#[test]
fn roll_back_to_empty() {
    let env = fill_db(2 * 128, 100, test_config());
    env.db.recover(Hash::zero()).unwrap();
    assert_eq!(env.db.disk_root(), EMPTY_ROOT);
    assert_eq!(env.db.layer_count(), 1);

    // every node of every generation is gone
    let reader = env.db.get_reader(EMPTY_ROOT).unwrap();
    for (paths, blobs) in env.paths.iter().zip(&env.blobs) {
        for (path, blob) in paths.iter().zip(blobs) {
            if blob.is_empty() {
                continue;
            }
            let got = reader.node_blob(Hash::zero(), path, keccak(blob)).unwrap();
            assert!(got.is_none(), "state survived rollback at {}", hex::encode(path));
        }
    }
}

#[test]
fn recoverable_window() {
    let env = fill_db(2 * 128, 100, test_config());
    let index = env
        .roots
        .iter()
        .position(|r| *r == env.db.disk_root())
        .unwrap();

    // the empty state and everything below the disk layer can be rolled
    // back to; the disk layer itself and the in-memory layers cannot
    assert!(env.db.recoverable(Hash::zero()));
    for i in 0..index {
        assert!(env.db.recoverable(env.roots[i]), "generation {i}");
    }
    for i in index..env.roots.len() {
        assert!(!env.db.recoverable(env.roots[i]), "generation {i}");
    }
}

#[test]
fn retention_truncates_old_diffs() {
    let gens = 300;
    let config = Config::builder()
        .dirty_cache_bytes(256 * 1024)
        .retention(128)
        .build();
    let env = fill_db(gens, 50, config);
    let disk_id = env.db.disk_id();
    assert_eq!(disk_id, gens as u64 - 128);
    let tail = env.freezer.tail();
    assert_eq!(tail, disk_id - 128 + 1);

    // the oldest reachable state is the parent of the oldest retained diff
    let oldest = (tail - 2) as usize;
    assert!(env.db.recoverable(env.roots[oldest]));
    assert!(!env.db.recoverable(env.roots[oldest - 1]));
    assert!(!env.db.recoverable(Hash::zero()));

    // an out-of-window recovery is rejected without touching state
    let before = env.db.disk_root();
    let layers = env.db.layer_count();
    assert!(matches!(
        env.db.recover(env.roots[oldest - 1]),
        Err(Error::Unrecoverable)
    ));
    assert_eq!(env.db.disk_root(), before);
    assert_eq!(env.db.layer_count(), layers);

    // shrinking the dirty budget flushes whatever is still buffered
    env.db.set_cache_size(0).unwrap();
    let (_, dirty) = env.db.size();
    assert_eq!(dirty, 0);
}

#[test]
fn journal_across_restart() {
    let env = fill_db(2 * 128, 100, test_config());
    let index = env
        .roots
        .iter()
        .position(|r| *r == env.db.disk_root())
        .unwrap();
    let head = *env.roots.last().unwrap();
    env.db.journal(head).unwrap();
    env.db.close().unwrap();

    let db = Database::open(
        env.diskdb.clone(),
        Some(env.freezer.clone()),
        None,
        test_config(),
    )
    .unwrap();
    assert_eq!(db.layer_count(), env.roots.len() - index);
    for i in index..env.roots.len() {
        check_generation(&db, &env, i);
    }
}

#[test]
fn reset_wipes_history() {
    let env = fill_db(2 * 128, 100, test_config());
    let head = *env.roots.last().unwrap();
    env.db.journal(head).unwrap();

    // only the currently persisted state is a legal reset target
    assert!(matches!(
        env.db.reset(Hash::repeat_byte(0x42)),
        Err(Error::StateMismatch { .. })
    ));
    let persisted = env.db.disk_root();
    let held = env.db.get_reader(head).unwrap();
    env.db.reset(persisted).unwrap();

    // layers of the discarded tree refuse further reads
    let last = env.paths.last().unwrap();
    let err = held.node_blob(Hash::zero(), &last[0], keccak(&env.blobs.last().unwrap()[0]));
    assert!(matches!(err, Err(Error::Stale)));

    assert_eq!(env.db.layer_count(), 1);
    assert_eq!(env.db.disk_root(), persisted);
    assert_eq!(env.db.disk_id(), 0);
    assert_eq!(env.freezer.head(), 0);
    assert!(!env.db.recoverable(env.roots[0]));

    // a reopen sees no journal and starts from the persisted state
    env.db.close().unwrap();
    let db = Database::open(
        env.diskdb.clone(),
        Some(env.freezer.clone()),
        None,
        test_config(),
    )
    .unwrap();
    assert_eq!(db.layer_count(), 1);
    assert_eq!(db.disk_root(), persisted);
}

#[test]
fn commit_leaves_single_layer() {
    let env = fill_db(64, 100, test_config());
    let head = *env.roots.last().unwrap();
    env.db.commit(head, false).unwrap();
    assert_eq!(env.db.layer_count(), 1);
    assert_eq!(env.db.disk_root(), head);
    check_generation(&env.db, &env, env.roots.len() - 1);

    // the key-value store carries the committed state: a fresh database
    // over the same store starts at the committed root
    env.db.close().unwrap();
    let db = Database::open(
        env.diskdb.clone(),
        Some(env.freezer.clone()),
        None,
        test_config(),
    )
    .unwrap();
    assert_eq!(db.disk_root(), head);
}

#[test]
fn held_layers_go_stale_on_commit() {
    let env = fill_db(10, 50, test_config());
    let held = env.db.get_reader(env.roots[5]).unwrap();
    let path = &env.paths[5][0];
    let blob = &env.blobs[5][0];
    if !blob.is_empty() {
        assert!(held.node_blob(Hash::zero(), path, keccak(blob)).is_ok());
    }

    env.db.commit(*env.roots.last().unwrap(), false).unwrap();
    // the flattened layer refuses any further access
    let err = held.node_blob(Hash::zero(), path, keccak(blob));
    assert!(matches!(err, Err(Error::Stale)));
}

#[test]
fn update_boundaries() {
    let env = fill_db(4, 20, test_config());
    // the zero root aliases the empty root at every boundary
    let by_zero = env.db.get_reader(Hash::zero()).unwrap();
    let by_empty = env.db.get_reader(EMPTY_ROOT).unwrap();
    assert_eq!(by_zero.root(), by_empty.root());
    // self-loops are rejected
    let err = env
        .db
        .update(env.roots[3], env.roots[3], MergedNodeSet::new());
    assert!(matches!(err, Err(Error::Cycle)));
    // orphan parents are rejected
    let err = env
        .db
        .update(Hash::repeat_byte(0x99), Hash::repeat_byte(0x98), MergedNodeSet::new());
    assert!(matches!(err, Err(Error::ParentMissing(_))));
}
