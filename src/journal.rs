//! Serialization of the in-memory diff chain, written to the key-value
//! store at shutdown and replayed on the next open.

use std::collections::HashMap;
use std::sync::Arc;

use primitive_types::H256;

use crate::codec::{put_bytes, put_hash, put_u64, Cursor};
use crate::errors::Error;
use crate::nodeset::{MemoryNode, NodeWithPrev};

const JOURNAL_VERSION: u64 = 0;

/// One journaled diff layer.
pub(crate) struct JournalLayer {
    pub root: H256,
    pub id: u64,
    pub nodes: HashMap<H256, HashMap<Vec<u8>, NodeWithPrev>>,
}

/// The serialized tree: the disk anchor plus the diff chain above it,
/// ordered top to bottom. Restoring walks the list in reverse so every
/// layer's parent exists before the layer itself.
pub(crate) struct Journal {
    pub disk_root: H256,
    pub disk_id: u64,
    pub layers: Vec<JournalLayer>,
}

impl Journal {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        put_hash(&mut out, &self.disk_root);
        out.extend_from_slice(&self.disk_id.to_le_bytes());
        put_u64(&mut out, self.layers.len() as u64);
        for layer in &self.layers {
            put_hash(&mut out, &layer.root);
            out.extend_from_slice(&layer.id.to_le_bytes());
            put_u64(&mut out, layer.nodes.len() as u64);
            let mut owners: Vec<&H256> = layer.nodes.keys().collect();
            owners.sort();
            for owner in owners {
                let subset = &layer.nodes[owner];
                put_hash(&mut out, owner);
                put_u64(&mut out, subset.len() as u64);
                let mut paths: Vec<&Vec<u8>> = subset.keys().collect();
                paths.sort();
                for path in paths {
                    let n = &subset[path];
                    put_bytes(&mut out, path);
                    if n.node.is_deleted() {
                        put_u64(&mut out, 0);
                        put_u64(&mut out, 0);
                    } else {
                        put_bytes(&mut out, n.node.hash().as_bytes());
                        put_bytes(&mut out, n.node.blob());
                    }
                    put_bytes(&mut out, &n.prev);
                }
            }
        }
        out
    }

    pub fn decode(blob: &[u8]) -> Result<Self, Error> {
        if blob.len() < 8 {
            return Err(Error::Corrupted("journal too short".into()));
        }
        let version = u64::from_le_bytes(blob[..8].try_into().expect("length checked"));
        if version != JOURNAL_VERSION {
            return Err(Error::Corrupted(format!("unknown journal version {version}")));
        }
        let mut cur = Cursor::new(&blob[8..]);
        let disk_root = cur.hash()?;
        let disk_id = cur.fixed_u64()?;
        let mut layers = Vec::new();
        for _ in 0..cur.u64()? {
            let root = cur.hash()?;
            let id = cur.fixed_u64()?;
            let mut nodes = HashMap::new();
            for _ in 0..cur.u64()? {
                let owner = cur.hash()?;
                let mut subset = HashMap::new();
                for _ in 0..cur.u64()? {
                    let path = cur.bytes()?;
                    let hash = cur.bytes()?;
                    let node_blob = cur.bytes()?;
                    let prev = cur.bytes()?;
                    let node = if hash.is_empty() {
                        if !node_blob.is_empty() {
                            return Err(Error::Corrupted("tombstone with payload".into()));
                        }
                        MemoryNode::deleted()
                    } else if hash.len() == 32 {
                        MemoryNode::with_hash(H256::from_slice(&hash), Arc::new(node_blob))
                    } else {
                        return Err(Error::Corrupted("malformed node hash".into()));
                    };
                    subset.insert(path, NodeWithPrev { node, prev });
                }
                nodes.insert(owner, subset);
            }
            layers.push(JournalLayer { root, id, nodes });
        }
        if !cur.is_empty() {
            return Err(Error::Corrupted("trailing journal bytes".into()));
        }
        Ok(Self {
            disk_root,
            disk_id,
            layers,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn journal_round_trip() {
        let mut subset = HashMap::new();
        subset.insert(
            b"\x01\x02".to_vec(),
            NodeWithPrev {
                node: MemoryNode::from_blob(b"blob-1".to_vec()),
                prev: b"old".to_vec(),
            },
        );
        subset.insert(
            b"\x01\x03".to_vec(),
            NodeWithPrev {
                node: MemoryNode::deleted(),
                prev: b"gone".to_vec(),
            },
        );
        let mut nodes = HashMap::new();
        nodes.insert(H256::repeat_byte(5), subset);
        let journal = Journal {
            disk_root: H256::repeat_byte(1),
            disk_id: 41,
            layers: vec![
                JournalLayer {
                    root: H256::repeat_byte(3),
                    id: 43,
                    nodes,
                },
                JournalLayer {
                    root: H256::repeat_byte(2),
                    id: 42,
                    nodes: HashMap::new(),
                },
            ],
        };
        let decoded = Journal::decode(&journal.encode()).unwrap();
        assert_eq!(decoded.disk_root, journal.disk_root);
        assert_eq!(decoded.disk_id, 41);
        assert_eq!(decoded.layers.len(), 2);
        assert_eq!(decoded.layers[0].root, H256::repeat_byte(3));
        assert_eq!(decoded.layers[0].id, 43);
        let subset = &decoded.layers[0].nodes[&H256::repeat_byte(5)];
        let live = &subset[&b"\x01\x02".to_vec()];
        assert_eq!(live.node.blob(), b"blob-1");
        assert_eq!(live.prev, b"old");
        let dead = &subset[&b"\x01\x03".to_vec()];
        assert!(dead.node.is_deleted());
        assert_eq!(dead.prev, b"gone");

        assert!(Journal::decode(b"\x01").is_err());
        let mut bad = journal.encode();
        bad[0] = 7;
        assert!(Journal::decode(&bad).is_err());
    }
}
