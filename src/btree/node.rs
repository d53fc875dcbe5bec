use bytes::Bytes;
use crate::codec::{BitReader, BitWriter};
use crate::core::error::{Error, Result};
use crate::btree::record::RecordHandler;
use crate::storage::block_file::NULL_BLOCK;

// Block header: [u8 flags][u16 entry_count][u32 prev][u32 next][u32 rightmost]
pub const NODE_HEADER_LEN: usize = 15;
const FLAG_LEAF: u8 = 0x01;

/// One record in a leaf: its key plus the full encoded record bytes.
#[derive(Debug, Clone)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub record: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct LeafNode {
    pub prev: u32,
    pub next: u32,
    pub entries: Vec<LeafEntry>,
}

/// Routing entry: `child` holds keys strictly below `key`.
#[derive(Debug, Clone)]
pub struct InternalEntry {
    pub key: Vec<u8>,
    pub child: u32,
}

#[derive(Debug, Clone)]
pub struct InternalNode {
    pub entries: Vec<InternalEntry>,
    /// Child for keys at or above the last routing key.
    pub rightmost: u32,
}

#[derive(Debug, Clone)]
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl LeafNode {
    pub fn empty() -> Self {
        LeafNode {
            prev: NULL_BLOCK,
            next: NULL_BLOCK,
            entries: Vec::new(),
        }
    }

    /// Binary search: `Ok` position of an exact match, `Err` insertion slot.
    pub fn find(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.as_slice().cmp(key))
    }
}

impl InternalNode {
    /// Slot of the child to descend into for `key`. `entries.len()` means
    /// the rightmost child.
    pub fn child_slot(&self, key: &[u8]) -> usize {
        self.entries
            .iter()
            .position(|e| key < e.key.as_slice())
            .unwrap_or(self.entries.len())
    }

    pub fn child_at(&self, slot: usize) -> u32 {
        if slot < self.entries.len() {
            self.entries[slot].child
        } else {
            self.rightmost
        }
    }

    pub fn child_count(&self) -> usize {
        self.entries.len() + 1
    }

    pub fn set_child(&mut self, slot: usize, block: u32) {
        if slot < self.entries.len() {
            self.entries[slot].child = block;
        } else {
            self.rightmost = block;
        }
    }

    /// Replace the child at `slot` with a freshly split pair.
    pub fn apply_split(&mut self, slot: usize, left: u32, separator: Vec<u8>, right: u32) {
        if slot < self.entries.len() {
            self.entries[slot].child = right;
            self.entries.insert(
                slot,
                InternalEntry {
                    key: separator,
                    child: left,
                },
            );
        } else {
            self.entries.push(InternalEntry {
                key: separator,
                child: left,
            });
            self.rightmost = right;
        }
    }

    /// Collapse the children at `right_slot - 1` and `right_slot` into a
    /// single merged child, dropping the separator between them.
    pub fn apply_merge(&mut self, right_slot: usize, merged: u32) {
        debug_assert!(right_slot >= 1 && right_slot <= self.entries.len());
        self.entries.remove(right_slot - 1);
        self.set_child(right_slot - 1, merged);
    }

    /// Rewire a rebalanced sibling pair and its new separator.
    pub fn apply_rebalance(
        &mut self,
        right_slot: usize,
        left: u32,
        separator: Vec<u8>,
        right: u32,
    ) {
        debug_assert!(right_slot >= 1 && right_slot <= self.entries.len());
        self.entries[right_slot - 1].key = separator;
        self.entries[right_slot - 1].child = left;
        self.set_child(right_slot, right);
    }
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Encoded size in bytes, header included.
    pub fn encoded_len(&self) -> usize {
        match self {
            Node::Leaf(leaf) => {
                NODE_HEADER_LEN + leaf.entries.iter().map(|e| e.record.len()).sum::<usize>()
            }
            Node::Internal(node) => {
                NODE_HEADER_LEN
                    + node
                        .entries
                        .iter()
                        .map(|e| 2 + e.key.len() + 4)
                        .sum::<usize>()
            }
        }
    }

    pub fn encode(&self, block_size: usize) -> Result<Bytes> {
        if self.encoded_len() > block_size {
            return Err(Error::internal(format!(
                "node of {} bytes exceeds block size {}",
                self.encoded_len(),
                block_size
            )));
        }
        let mut w = BitWriter::with_capacity(block_size);
        match self {
            Node::Leaf(leaf) => {
                w.write_u8(FLAG_LEAF);
                w.write_u16(leaf.entries.len() as u16);
                w.write_u32(leaf.prev);
                w.write_u32(leaf.next);
                w.write_u32(NULL_BLOCK);
                for entry in &leaf.entries {
                    w.write_raw(&entry.record);
                }
            }
            Node::Internal(node) => {
                w.write_u8(0);
                w.write_u16(node.entries.len() as u16);
                w.write_u32(NULL_BLOCK);
                w.write_u32(NULL_BLOCK);
                w.write_u32(node.rightmost);
                for entry in &node.entries {
                    w.write_u16(entry.key.len() as u16);
                    w.write_raw(&entry.key);
                    w.write_u32(entry.child);
                }
            }
        }
        let mut buf = w.finish();
        buf.resize(block_size, 0);
        Ok(Bytes::from(buf))
    }

    pub fn decode(block: &[u8], handler: &dyn RecordHandler) -> Result<Node> {
        let mut r = BitReader::new(block);
        let flags = r.read_u8()?;
        let count = r.read_u16()? as usize;
        let prev = r.read_u32()?;
        let next = r.read_u32()?;
        let rightmost = r.read_u32()?;

        if flags & FLAG_LEAF != 0 {
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let start = r.position();
                let key = handler.read_record(&mut r)?;
                r.align_to_byte();
                let end = r.position();
                entries.push(LeafEntry {
                    key,
                    record: block[start..end].to_vec(),
                });
            }
            Ok(Node::Leaf(LeafNode {
                prev,
                next,
                entries,
            }))
        } else {
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let key_len = r.read_u16()? as usize;
                let key = r.read_raw(key_len)?;
                let child = r.read_u32()?;
                entries.push(InternalEntry { key, child });
            }
            if rightmost == NULL_BLOCK {
                return Err(Error::corrupt("internal node without rightmost child"));
            }
            Ok(Node::Internal(InternalNode { entries, rightmost }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::btree::record::DictionaryRecordHandler;
    use crate::core::types::Value;
    use crate::serial::SerializerRegistry;

    fn handler() -> DictionaryRecordHandler {
        DictionaryRecordHandler::new(Arc::new(SerializerRegistry::new()))
    }

    #[test]
    fn leaf_encode_decode() {
        let h = handler();
        let mut leaf = LeafNode::empty();
        for key in ["alpha", "beta", "gamma"] {
            let record = h.encode(key, Some(&Value::Int32(key.len() as i32))).unwrap();
            leaf.entries.push(LeafEntry {
                key: key.as_bytes().to_vec(),
                record,
            });
        }
        leaf.prev = 4;
        leaf.next = 9;

        let block = Node::Leaf(leaf.clone()).encode(4096).unwrap();
        match Node::decode(&block, &h).unwrap() {
            Node::Leaf(got) => {
                assert_eq!(got.prev, 4);
                assert_eq!(got.next, 9);
                assert_eq!(got.entries.len(), 3);
                for (a, b) in got.entries.iter().zip(leaf.entries.iter()) {
                    assert_eq!(a.key, b.key);
                    assert_eq!(a.record, b.record);
                }
            }
            Node::Internal(_) => panic!("expected leaf"),
        }
    }

    #[test]
    fn internal_encode_decode_and_routing() {
        let h = handler();
        let node = InternalNode {
            entries: vec![
                InternalEntry {
                    key: b"m".to_vec(),
                    child: 2,
                },
                InternalEntry {
                    key: b"t".to_vec(),
                    child: 3,
                },
            ],
            rightmost: 4,
        };

        assert_eq!(node.child_at(node.child_slot(b"a")), 2);
        assert_eq!(node.child_at(node.child_slot(b"m")), 3); // separator goes right
        assert_eq!(node.child_at(node.child_slot(b"z")), 4);

        let block = Node::Internal(node.clone()).encode(4096).unwrap();
        match Node::decode(&block, &h).unwrap() {
            Node::Internal(got) => {
                assert_eq!(got.rightmost, 4);
                assert_eq!(got.entries.len(), 2);
                assert_eq!(got.entries[0].key, b"m");
            }
            Node::Leaf(_) => panic!("expected internal"),
        }
    }

    #[test]
    fn split_and_merge_bookkeeping() {
        let mut node = InternalNode {
            entries: vec![InternalEntry {
                key: b"k".to_vec(),
                child: 5,
            }],
            rightmost: 6,
        };

        // Split the rightmost child.
        node.apply_split(1, 7, b"r".to_vec(), 8);
        assert_eq!(node.entries.len(), 2);
        assert_eq!(node.entries[1].key, b"r");
        assert_eq!(node.entries[1].child, 7);
        assert_eq!(node.rightmost, 8);

        // Merge them back.
        node.apply_merge(2, 9);
        assert_eq!(node.entries.len(), 1);
        assert_eq!(node.rightmost, 9);
    }
}
