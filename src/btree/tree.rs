use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex as StateMutex;
use tokio::sync::Mutex;
use crate::btree::node::{InternalEntry, InternalNode, LeafEntry, LeafNode, Node, NODE_HEADER_LEN};
use crate::btree::record::RecordHandler;
use crate::core::error::{Error, ErrorKind, Result};
use crate::storage::block_file::{BlockFile, NULL_BLOCK};

/// Immutable view of a tree at one published version. Cursors hold an `Arc`
/// of the snapshot they were opened against; blocks replaced after that
/// version are not reused while the snapshot is referenced.
#[derive(Debug)]
pub struct TreeSnapshot {
    pub version: u64,
    pub root: u32,
}

/// Version bookkeeping: which snapshot is current, which older ones are
/// still referenced, and which replaced blocks wait for their referencing
/// snapshots to die before they can be reused.
struct SnapshotTracker {
    inner: StateMutex<TrackerInner>,
}

struct TrackerInner {
    current: Arc<TreeSnapshot>,
    live: Vec<(u64, Weak<TreeSnapshot>)>,
    pending_free: Vec<(u64, Vec<u32>)>,
}

impl SnapshotTracker {
    fn new(root: u32) -> Self {
        SnapshotTracker {
            inner: StateMutex::new(TrackerInner {
                current: Arc::new(TreeSnapshot { version: 0, root }),
                live: Vec::new(),
                pending_free: Vec::new(),
            }),
        }
    }

    fn current(&self) -> Arc<TreeSnapshot> {
        self.inner.lock().current.clone()
    }

    /// Swap in a new root and return the replaced blocks that no live
    /// snapshot can still reach.
    fn publish(&self, root: u32, freed: Vec<u32>) -> Vec<u32> {
        let mut inner = self.inner.lock();
        let version = inner.current.version + 1;
        let old = std::mem::replace(
            &mut inner.current,
            Arc::new(TreeSnapshot { version, root }),
        );
        inner.live.push((old.version, Arc::downgrade(&old)));
        drop(old);
        if !freed.is_empty() {
            inner.pending_free.push((version, freed));
        }

        inner.live.retain(|(_, weak)| weak.strong_count() > 0);
        let oldest_live = inner.live.iter().map(|(v, _)| *v).min();

        let mut reusable = Vec::new();
        inner.pending_free.retain(|(v, blocks)| {
            // Blocks replaced by version v are safe once every snapshot
            // older than v is gone.
            let safe = oldest_live.map(|oldest| oldest >= *v).unwrap_or(true);
            if safe {
                reusable.extend(blocks.iter().copied());
            }
            !safe
        });
        reusable
    }
}

enum Pending {
    One(Node),
    Split(Node, Vec<u8>, Node),
}

/// B+Tree over a block file.
///
/// Mutations are copy-on-write at node granularity: every node touched by
/// an insert or delete is rewritten to a freshly allocated block and the
/// root pointer is committed only after the new subtree is durable, so a
/// cursor keeps seeing the tree shape of the snapshot it opened. A
/// structural invariant violation halts further writes to the file while
/// reads stay available.
pub struct BTreeFile {
    pub file: Arc<BlockFile>,
    handler: Arc<dyn RecordHandler>,
    tracker: SnapshotTracker,
    writer: Mutex<()>,
    halted: AtomicBool,
}

impl BTreeFile {
    pub async fn open(file: Arc<BlockFile>, handler: Arc<dyn RecordHandler>) -> Self {
        let root = file.root().await;
        BTreeFile {
            file,
            handler,
            tracker: SnapshotTracker::new(root),
            writer: Mutex::new(()),
            halted: AtomicBool::new(false),
        }
    }

    pub fn handler(&self) -> Arc<dyn RecordHandler> {
        self.handler.clone()
    }

    pub fn snapshot(&self) -> Arc<TreeSnapshot> {
        self.tracker.current()
    }

    fn capacity(&self) -> usize {
        self.file.block_size
    }

    fn min_fill(&self) -> usize {
        self.capacity() / 4
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst) || self.file.is_halted()
    }

    fn check_writes(&self) -> Result<()> {
        if self.is_halted() {
            return Err(Error::invalid_state(format!(
                "{} is halted for writes",
                self.file.path.display()
            )));
        }
        Ok(())
    }

    fn halt_on_structural_error(&self, err: Error) -> Error {
        if matches!(err.kind, ErrorKind::CorruptRecord | ErrorKind::Internal) {
            tracing::error!(file = %self.file.path.display(), %err, "structural error; halting writes");
            self.halted.store(true, Ordering::SeqCst);
        }
        err
    }

    pub async fn decode_node(&self, block: u32) -> Result<Node> {
        let data = self.file.read_block(block).await?;
        Node::decode(&data, self.handler.as_ref())
    }

    /// Point lookup inside a snapshot. Returns the raw record bytes.
    pub async fn get(&self, key: &[u8], snapshot: &TreeSnapshot) -> Result<Option<Vec<u8>>> {
        let mut current = snapshot.root;
        if current == NULL_BLOCK {
            return Ok(None);
        }
        loop {
            match self.decode_node(current).await? {
                Node::Internal(node) => current = node.child_at(node.child_slot(key)),
                Node::Leaf(leaf) => {
                    return Ok(leaf.find(key).ok().map(|i| leaf.entries[i].record.clone()));
                }
            }
        }
    }

    /// Insert or replace. Returns the previous record for a replacement.
    pub async fn insert(&self, key: &[u8], record: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let _write = self.writer.lock().await;
        self.check_writes()?;
        if NODE_HEADER_LEN + record.len() > self.capacity() {
            return Err(Error::invalid_argument(format!(
                "record of {} bytes cannot fit a {}-byte block",
                record.len(),
                self.capacity()
            )));
        }
        match self.insert_inner(key, record).await {
            Ok(old) => Ok(old),
            Err(err) => Err(self.halt_on_structural_error(err)),
        }
    }

    async fn insert_inner(&self, key: &[u8], record: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let snapshot = self.tracker.current();
        let mut freed = Vec::new();
        let mut old_record = None;

        let new_root = if snapshot.root == NULL_BLOCK {
            let mut leaf = LeafNode::empty();
            leaf.entries.push(LeafEntry {
                key: key.to_vec(),
                record,
            });
            self.write_node(&Node::Leaf(leaf)).await?
        } else {
            let (path, mut leaf, leaf_block) = self.descend(snapshot.root, key).await?;
            freed.push(leaf_block);
            match leaf.find(key) {
                Ok(i) => {
                    old_record = Some(std::mem::replace(&mut leaf.entries[i].record, record));
                }
                Err(i) => leaf.entries.insert(
                    i,
                    LeafEntry {
                        key: key.to_vec(),
                        record,
                    },
                ),
            }
            self.propagate(path, Node::Leaf(leaf), &mut freed).await?
        };

        self.commit(new_root, freed).await?;
        Ok(old_record)
    }

    /// Delete by key. Returns the removed record, if any.
    pub async fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let _write = self.writer.lock().await;
        self.check_writes()?;
        match self.remove_inner(key).await {
            Ok(old) => Ok(old),
            Err(err) => Err(self.halt_on_structural_error(err)),
        }
    }

    async fn remove_inner(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let snapshot = self.tracker.current();
        if snapshot.root == NULL_BLOCK {
            return Ok(None);
        }
        let (path, mut leaf, leaf_block) = self.descend(snapshot.root, key).await?;
        let slot = match leaf.find(key) {
            Ok(slot) => slot,
            Err(_) => return Ok(None),
        };
        let old = leaf.entries.remove(slot).record;

        let mut freed = vec![leaf_block];
        let new_root = self.propagate(path, Node::Leaf(leaf), &mut freed).await?;
        self.commit(new_root, freed).await?;
        Ok(Some(old))
    }

    async fn descend(
        &self,
        root: u32,
        key: &[u8],
    ) -> Result<(Vec<(u32, InternalNode, usize)>, LeafNode, u32)> {
        let mut path = Vec::new();
        let mut current = root;
        loop {
            match self.decode_node(current).await? {
                Node::Internal(node) => {
                    let slot = node.child_slot(key);
                    let child = node.child_at(slot);
                    path.push((current, node, slot));
                    current = child;
                }
                Node::Leaf(leaf) => return Ok((path, leaf, current)),
            }
        }
    }

    /// Rewrite the modified node and every ancestor on the path, splitting
    /// on overflow and merging/rebalancing on underflow. Returns the new
    /// root block.
    async fn propagate(
        &self,
        mut path: Vec<(u32, InternalNode, usize)>,
        node: Node,
        freed: &mut Vec<u32>,
    ) -> Result<u32> {
        let mut pending = self.check_overflow(node)?;

        while let Some((parent_block, mut parent, slot)) = path.pop() {
            freed.push(parent_block);
            match pending {
                Pending::One(node) => {
                    if node.encoded_len() < self.min_fill() {
                        self.fix_underflow(&mut parent, slot, node, freed).await?;
                    } else {
                        let block = self.write_node(&node).await?;
                        parent.set_child(slot, block);
                    }
                }
                Pending::Split(left, separator, right) => {
                    let (lb, rb) = self.write_pair(left, right).await?;
                    parent.apply_split(slot, lb, separator, rb);
                }
            }
            pending = self.check_overflow(Node::Internal(parent))?;
        }

        match pending {
            Pending::One(Node::Internal(node)) if node.entries.is_empty() => {
                // Root with a single child: drop a level.
                Ok(node.rightmost)
            }
            Pending::One(Node::Leaf(leaf)) if leaf.entries.is_empty() => Ok(NULL_BLOCK),
            Pending::One(node) => self.write_node(&node).await,
            Pending::Split(left, separator, right) => {
                let (lb, rb) = self.write_pair(left, right).await?;
                let root = InternalNode {
                    entries: vec![InternalEntry {
                        key: separator,
                        child: lb,
                    }],
                    rightmost: rb,
                };
                self.write_node(&Node::Internal(root)).await
            }
        }
    }

    /// Merge an undersized child with an adjacent sibling; if the merged
    /// node would overflow, redistribute by splitting it again.
    async fn fix_underflow(
        &self,
        parent: &mut InternalNode,
        slot: usize,
        node: Node,
        freed: &mut Vec<u32>,
    ) -> Result<()> {
        if parent.entries.is_empty() {
            return Err(Error::internal("routing node lost its separators"));
        }
        // Merge children right_slot-1 and right_slot.
        let right_slot = if slot > 0 { slot } else { 1 };
        let (left, right) = if slot == right_slot {
            let sibling = parent.child_at(right_slot - 1);
            freed.push(sibling);
            (self.decode_node(sibling).await?, node)
        } else {
            let sibling = parent.child_at(right_slot);
            freed.push(sibling);
            (node, self.decode_node(sibling).await?)
        };
        let separator = parent.entries[right_slot - 1].key.clone();
        let merged = self.merge(left, separator, right)?;

        if merged.encoded_len() <= self.capacity() {
            let block = self.write_node(&merged).await?;
            parent.apply_merge(right_slot, block);
        } else {
            let (left, separator, right) = self.split(merged)?;
            let (lb, rb) = self.write_pair(left, right).await?;
            parent.apply_rebalance(right_slot, lb, separator, rb);
        }
        Ok(())
    }

    fn check_overflow(&self, node: Node) -> Result<Pending> {
        if node.encoded_len() > self.capacity() {
            let (left, separator, right) = self.split(node)?;
            Ok(Pending::Split(left, separator, right))
        } else {
            Ok(Pending::One(node))
        }
    }

    fn split(&self, node: Node) -> Result<(Node, Vec<u8>, Node)> {
        match node {
            Node::Leaf(mut leaf) => {
                if leaf.entries.len() < 2 {
                    return Err(Error::internal("cannot split a leaf of one record"));
                }
                let total: usize = leaf.entries.iter().map(|e| e.record.len()).sum();
                let mut acc = 0;
                let mut mid = leaf.entries.len() / 2;
                for (i, entry) in leaf.entries.iter().enumerate() {
                    acc += entry.record.len();
                    if acc * 2 >= total {
                        mid = i + 1;
                        break;
                    }
                }
                let mid = mid.clamp(1, leaf.entries.len() - 1);
                let right_entries = leaf.entries.split_off(mid);
                let separator = right_entries[0].key.clone();
                let right = LeafNode {
                    prev: NULL_BLOCK, // linked in write_pair
                    next: leaf.next,
                    entries: right_entries,
                };
                let left = LeafNode {
                    prev: leaf.prev,
                    next: NULL_BLOCK,
                    entries: leaf.entries,
                };
                Ok((Node::Leaf(left), separator, Node::Leaf(right)))
            }
            Node::Internal(mut node) => {
                if node.entries.len() < 3 {
                    return Err(Error::internal("routing node too wide to split"));
                }
                let mid = (node.entries.len() / 2).clamp(1, node.entries.len() - 2);
                let right_entries = node.entries.split_off(mid + 1);
                let promoted = node.entries.pop().expect("median entry");
                let left = InternalNode {
                    rightmost: promoted.child,
                    entries: node.entries,
                };
                let right = InternalNode {
                    entries: right_entries,
                    rightmost: node.rightmost,
                };
                Ok((Node::Internal(left), promoted.key, Node::Internal(right)))
            }
        }
    }

    fn merge(&self, left: Node, separator: Vec<u8>, right: Node) -> Result<Node> {
        match (left, right) {
            (Node::Leaf(mut left), Node::Leaf(right)) => {
                left.entries.extend(right.entries);
                left.next = right.next;
                Ok(Node::Leaf(left))
            }
            (Node::Internal(mut left), Node::Internal(right)) => {
                left.entries.push(InternalEntry {
                    key: separator,
                    child: left.rightmost,
                });
                left.entries.extend(right.entries);
                left.rightmost = right.rightmost;
                Ok(Node::Internal(left))
            }
            _ => Err(Error::internal("sibling nodes at different levels")),
        }
    }

    async fn write_node(&self, node: &Node) -> Result<u32> {
        let block = self.file.allocate_block().await?;
        self.file
            .write_block(block, node.encode(self.capacity())?)
            .await?;
        Ok(block)
    }

    async fn write_pair(&self, mut left: Node, mut right: Node) -> Result<(u32, u32)> {
        let lb = self.file.allocate_block().await?;
        let rb = self.file.allocate_block().await?;
        if let (Node::Leaf(left), Node::Leaf(right)) = (&mut left, &mut right) {
            left.next = rb;
            right.prev = lb;
        }
        tracing::debug!(file = %self.file.path.display(), left = lb, right = rb, "node split");
        self.file
            .write_block(lb, left.encode(self.capacity())?)
            .await?;
        self.file
            .write_block(rb, right.encode(self.capacity())?)
            .await?;
        Ok((lb, rb))
    }

    /// Make the new subtree durable, move the root, then release blocks no
    /// live snapshot can reach.
    async fn commit(&self, new_root: u32, freed: Vec<u32>) -> Result<()> {
        self.file.commit_root(new_root).await?;
        let reusable = self.tracker.publish(new_root, freed);
        for block in reusable {
            self.file.free_block(block).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use crate::btree::record::DictionaryRecordHandler;
    use crate::core::config::Config;
    use crate::core::types::Value;
    use crate::serial::SerializerRegistry;

    struct Fixture {
        _dir: tempfile::TempDir,
        tree: BTreeFile,
        handler: Arc<DictionaryRecordHandler>,
    }

    async fn fixture(block_size: usize) -> Fixture {
        let dir = tempdir().unwrap();
        let config = Config {
            storage_path: dir.path().to_path_buf(),
            block_size,
            ..Config::default()
        };
        let file = Arc::new(BlockFile::open(dir.path().join("t.btree"), &config).unwrap());
        let registry = Arc::new(SerializerRegistry::new());
        let handler = Arc::new(DictionaryRecordHandler::new(registry));
        let tree = BTreeFile::open(file, handler.clone()).await;
        Fixture {
            _dir: dir,
            tree,
            handler,
        }
    }

    fn record(f: &Fixture, key: &str, value: i64) -> Vec<u8> {
        f.handler.encode(key, Some(&Value::Int64(value))).unwrap()
    }

    #[tokio::test]
    async fn inserts_split_and_stay_findable() {
        let f = fixture(1024).await;
        let count = 400;
        for i in 0..count {
            let key = format!("key-{:05}", i * 7 % count);
            f.tree
                .insert(key.as_bytes(), record(&f, &key, i as i64))
                .await
                .unwrap();
        }

        let snapshot = f.tree.snapshot();
        for i in 0..count {
            let key = format!("key-{:05}", i);
            let got = f.tree.get(key.as_bytes(), &snapshot).await.unwrap();
            assert!(got.is_some(), "missing {}", key);
        }
        assert!(
            f.tree.get(b"key-99999", &snapshot).await.unwrap().is_none()
        );
    }

    #[tokio::test]
    async fn replace_returns_previous_record() {
        let f = fixture(1024).await;
        f.tree.insert(b"a", record(&f, "a", 1)).await.unwrap();
        let old = f.tree.insert(b"a", record(&f, "a", 2)).await.unwrap();
        assert!(old.is_some());
        let (_, value) = f.handler.decode(&old.unwrap()).unwrap();
        assert_eq!(value, Some(Value::Int64(1)));

        let snapshot = f.tree.snapshot();
        let current = f.tree.get(b"a", &snapshot).await.unwrap().unwrap();
        let (_, value) = f.handler.decode(&current).unwrap();
        assert_eq!(value, Some(Value::Int64(2)));
    }

    #[tokio::test]
    async fn delete_merges_back_to_empty() {
        let f = fixture(1024).await;
        let count = 300;
        for i in 0..count {
            let key = format!("k{:05}", i);
            f.tree
                .insert(key.as_bytes(), record(&f, &key, i as i64))
                .await
                .unwrap();
        }

        // Remove every other key, then the rest.
        for i in (0..count).step_by(2) {
            let key = format!("k{:05}", i);
            assert!(f.tree.remove(key.as_bytes()).await.unwrap().is_some());
        }
        let snapshot = f.tree.snapshot();
        for i in 0..count {
            let key = format!("k{:05}", i);
            let found = f.tree.get(key.as_bytes(), &snapshot).await.unwrap();
            assert_eq!(found.is_some(), i % 2 == 1, "key {}", key);
        }

        for i in (1..count).step_by(2) {
            let key = format!("k{:05}", i);
            assert!(f.tree.remove(key.as_bytes()).await.unwrap().is_some());
        }
        let snapshot = f.tree.snapshot();
        assert_eq!(snapshot.root, NULL_BLOCK);

        // The emptied tree accepts new inserts.
        f.tree.insert(b"again", record(&f, "again", 0)).await.unwrap();
        let snapshot = f.tree.snapshot();
        assert!(f.tree.get(b"again", &snapshot).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn removing_missing_key_is_a_miss_not_an_error() {
        let f = fixture(1024).await;
        f.tree.insert(b"x", record(&f, "x", 1)).await.unwrap();
        assert!(f.tree.remove(b"y").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn old_snapshot_keeps_pre_mutation_view() {
        let f = fixture(1024).await;
        for i in 0..120 {
            let key = format!("k{:04}", i);
            f.tree
                .insert(key.as_bytes(), record(&f, &key, i as i64))
                .await
                .unwrap();
        }

        let before = f.tree.snapshot();
        f.tree
            .insert(b"k0050", record(&f, "k0050", -1))
            .await
            .unwrap();
        f.tree.remove(b"k0051").await.unwrap();

        // The old snapshot still resolves the original records.
        let old = f.tree.get(b"k0050", &before).await.unwrap().unwrap();
        let (_, value) = f.handler.decode(&old).unwrap();
        assert_eq!(value, Some(Value::Int64(50)));
        assert!(f.tree.get(b"k0051", &before).await.unwrap().is_some());

        // The current snapshot sees the mutation.
        let now = f.tree.snapshot();
        let new = f.tree.get(b"k0050", &now).await.unwrap().unwrap();
        let (_, value) = f.handler.decode(&new).unwrap();
        assert_eq!(value, Some(Value::Int64(-1)));
        assert!(f.tree.get(b"k0051", &now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blocks_are_recycled_once_snapshots_die() {
        let f = fixture(1024).await;
        for round in 0..5 {
            for i in 0..60 {
                let key = format!("k{:04}", i);
                f.tree
                    .insert(key.as_bytes(), record(&f, &key, round))
                    .await
                    .unwrap();
            }
        }
        // Copy-on-write keeps replacing blocks; without recycling the file
        // would grow per mutation, with it the block count stays modest.
        let blocks = f.tree.file.block_count().await;
        let free = f.tree.file.free_count().await;
        assert!(
            (blocks as u64 - free) < 60,
            "{} blocks, {} free",
            blocks,
            free
        );
    }

    #[tokio::test]
    async fn oversized_record_is_rejected() {
        let f = fixture(1024).await;
        let err = f
            .tree
            .insert(b"big", vec![0u8; 2000])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }
}
