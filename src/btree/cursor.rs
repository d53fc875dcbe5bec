use std::sync::Arc;
use crate::btree::node::{InternalNode, LeafNode, Node};
use crate::btree::record::RecordHandler;
use crate::btree::tree::{BTreeFile, TreeSnapshot};
use crate::core::error::{Error, Result};
use crate::core::types::ObjectId;
use crate::storage::block_file::{BlockFile, NULL_BLOCK};

/// Where a cursor's object id lives in its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSource {
    /// The key is the 16-byte object id (primary trees).
    WholeKey,
    /// The key ends with the 16-byte object id (index trees).
    Suffix,
    /// Records carry no object id (dictionary trees).
    Absent,
}

/// Split a sort field into its name and descending flag (`-name`).
pub fn parse_direction(field: &str) -> (&str, bool) {
    match field.strip_prefix('-') {
        Some(name) => (name, true),
        None => (field, false),
    }
}

/// Bidirectional iterator over a tree snapshot's in-order sequence.
///
/// `current_*` accessors are only valid after a successful move. The two
/// sort-order predicates let the query layer check, without scanning,
/// whether this cursor's natural order (or its exact reverse) satisfies a
/// requested ordering given the fields a filter pins constant.
#[allow(async_fn_in_trait)]
pub trait Cursor: Send {
    async fn move_next(&mut self) -> Result<bool>;
    async fn move_previous(&mut self) -> Result<bool>;
    fn current_key(&self) -> Result<&[u8]>;
    fn current_record(&self) -> Result<&[u8]>;
    fn current_object_id(&self) -> Result<ObjectId>;
    fn same_sort_order(&self, constant_fields: &[String], sort_order: &[String]) -> bool;
    fn reverse_sort_order(&self, constant_fields: &[String], sort_order: &[String]) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Unstarted,
    On,
    Before,
    After,
}

/// Cursor over one tree snapshot. Traversal keeps an explicit ancestor
/// stack; under copy-on-write the stored sibling links are only hints
/// within the version that wrote them, while the stack is always exact for
/// the pinned snapshot.
pub struct TreeCursor {
    file: Arc<BlockFile>,
    handler: Arc<dyn RecordHandler>,
    snapshot: Arc<TreeSnapshot>,
    order: Vec<String>,
    id_source: IdSource,
    stack: Vec<(InternalNode, usize)>,
    leaf: Option<LeafNode>,
    entry: usize,
    position: Position,
}

impl TreeCursor {
    pub fn new(tree: &BTreeFile, order: Vec<String>, id_source: IdSource) -> Self {
        TreeCursor {
            file: tree.file.clone(),
            handler: tree.handler(),
            snapshot: tree.snapshot(),
            order,
            id_source,
            stack: Vec::new(),
            leaf: None,
            entry: 0,
            position: Position::Unstarted,
        }
    }

    pub fn snapshot(&self) -> &Arc<TreeSnapshot> {
        &self.snapshot
    }

    async fn decode(&self, block: u32) -> Result<Node> {
        let data = self.file.read_block(block).await?;
        Node::decode(&data, self.handler.as_ref())
    }

    /// Walk from `block` to the leftmost or rightmost leaf below it,
    /// pushing ancestor frames along the way.
    async fn descend_edge(&mut self, mut block: u32, leftmost: bool) -> Result<bool> {
        loop {
            match self.decode(block).await? {
                Node::Internal(node) => {
                    let slot = if leftmost { 0 } else { node.child_count() - 1 };
                    block = node.child_at(slot);
                    self.stack.push((node, slot));
                }
                Node::Leaf(leaf) => {
                    if leaf.entries.is_empty() {
                        self.leaf = None;
                        return Ok(false);
                    }
                    self.entry = if leftmost { 0 } else { leaf.entries.len() - 1 };
                    self.leaf = Some(leaf);
                    self.position = Position::On;
                    return Ok(true);
                }
            }
        }
    }

    async fn start(&mut self, leftmost: bool) -> Result<bool> {
        self.stack.clear();
        self.leaf = None;
        if self.snapshot.root == NULL_BLOCK {
            self.position = if leftmost {
                Position::After
            } else {
                Position::Before
            };
            return Ok(false);
        }
        let found = self.descend_edge(self.snapshot.root, leftmost).await?;
        if !found {
            self.position = if leftmost {
                Position::After
            } else {
                Position::Before
            };
        }
        Ok(found)
    }

    /// Climb to the next sibling subtree in the given direction and descend
    /// its near edge.
    async fn advance_across_leaves(&mut self, forward: bool) -> Result<bool> {
        while let Some((node, slot)) = self.stack.pop() {
            let next_slot = if forward {
                if slot + 1 < node.child_count() {
                    Some(slot + 1)
                } else {
                    None
                }
            } else if slot > 0 {
                Some(slot - 1)
            } else {
                None
            };
            if let Some(slot) = next_slot {
                let child = node.child_at(slot);
                self.stack.push((node, slot));
                return self.descend_edge(child, forward).await;
            }
        }
        self.leaf = None;
        self.position = if forward {
            Position::After
        } else {
            Position::Before
        };
        Ok(false)
    }

    /// Position on the first entry at or after `key`; returns false when no
    /// such entry exists.
    pub async fn seek_at_or_after(&mut self, key: &[u8]) -> Result<bool> {
        self.stack.clear();
        self.leaf = None;
        if self.snapshot.root == NULL_BLOCK {
            self.position = Position::After;
            return Ok(false);
        }
        let mut block = self.snapshot.root;
        loop {
            match self.decode(block).await? {
                Node::Internal(node) => {
                    let slot = node.child_slot(key);
                    block = node.child_at(slot);
                    self.stack.push((node, slot));
                }
                Node::Leaf(leaf) => {
                    let slot = match leaf.find(key) {
                        Ok(slot) => slot,
                        Err(slot) => slot,
                    };
                    if slot < leaf.entries.len() {
                        self.entry = slot;
                        self.leaf = Some(leaf);
                        self.position = Position::On;
                        return Ok(true);
                    }
                    // Past the last entry of this leaf; continue in the
                    // next one.
                    self.leaf = Some(leaf);
                    return self.advance_across_leaves(true).await;
                }
            }
        }
    }
}

impl Cursor for TreeCursor {
    async fn move_next(&mut self) -> Result<bool> {
        match self.position {
            Position::Unstarted | Position::Before => self.start(true).await,
            Position::On => {
                let leaf = self.leaf.as_ref().expect("positioned cursor has a leaf");
                if self.entry + 1 < leaf.entries.len() {
                    self.entry += 1;
                    Ok(true)
                } else {
                    self.advance_across_leaves(true).await
                }
            }
            Position::After => Ok(false),
        }
    }

    async fn move_previous(&mut self) -> Result<bool> {
        match self.position {
            Position::Unstarted | Position::After => self.start(false).await,
            Position::On => {
                if self.entry > 0 {
                    self.entry -= 1;
                    Ok(true)
                } else {
                    self.advance_across_leaves(false).await
                }
            }
            Position::Before => Ok(false),
        }
    }

    fn current_key(&self) -> Result<&[u8]> {
        match (&self.position, &self.leaf) {
            (Position::On, Some(leaf)) => Ok(&leaf.entries[self.entry].key),
            _ => Err(Error::invalid_state("cursor is not positioned on a record")),
        }
    }

    fn current_record(&self) -> Result<&[u8]> {
        match (&self.position, &self.leaf) {
            (Position::On, Some(leaf)) => Ok(&leaf.entries[self.entry].record),
            _ => Err(Error::invalid_state("cursor is not positioned on a record")),
        }
    }

    fn current_object_id(&self) -> Result<ObjectId> {
        let key = self.current_key()?;
        let id_bytes = match self.id_source {
            IdSource::WholeKey => key,
            IdSource::Suffix => {
                if key.len() < 16 {
                    return Err(Error::corrupt("index key shorter than an object id"));
                }
                &key[key.len() - 16..]
            }
            IdSource::Absent => {
                return Err(Error::invalid_state("records in this tree have no object id"));
            }
        };
        ObjectId::from_slice(id_bytes).ok_or_else(|| Error::corrupt("malformed object id in key"))
    }

    fn same_sort_order(&self, constant_fields: &[String], sort_order: &[String]) -> bool {
        order_matches(&self.order, constant_fields, sort_order, false)
    }

    fn reverse_sort_order(&self, constant_fields: &[String], sort_order: &[String]) -> bool {
        order_matches(&self.order, constant_fields, sort_order, true)
    }
}

/// Check whether a cursor's natural field order satisfies `sort_order`,
/// ignoring fields pinned constant; `reversed` flips every direction.
fn order_matches(
    natural: &[String],
    constant_fields: &[String],
    sort_order: &[String],
    reversed: bool,
) -> bool {
    let is_constant =
        |name: &str| constant_fields.iter().any(|c| c.as_str() == name);

    let mut natural = natural
        .iter()
        .map(|f| parse_direction(f))
        .filter(|(name, _)| !is_constant(name));

    for requested in sort_order {
        let (want_name, want_desc) = parse_direction(requested);
        if is_constant(want_name) {
            continue;
        }
        match natural.next() {
            Some((name, desc)) if name == want_name && (desc != want_desc) == reversed => {}
            _ => return false,
        }
    }
    true
}

/// Inverts any cursor: next and previous swap, and the two sort-order
/// predicates trade places.
pub struct ReversedCursor<C: Cursor> {
    inner: C,
}

impl<C: Cursor> ReversedCursor<C> {
    pub fn new(inner: C) -> Self {
        ReversedCursor { inner }
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C: Cursor> Cursor for ReversedCursor<C> {
    async fn move_next(&mut self) -> Result<bool> {
        self.inner.move_previous().await
    }

    async fn move_previous(&mut self) -> Result<bool> {
        self.inner.move_next().await
    }

    fn current_key(&self) -> Result<&[u8]> {
        self.inner.current_key()
    }

    fn current_record(&self) -> Result<&[u8]> {
        self.inner.current_record()
    }

    fn current_object_id(&self) -> Result<ObjectId> {
        self.inner.current_object_id()
    }

    fn same_sort_order(&self, constant_fields: &[String], sort_order: &[String]) -> bool {
        self.inner.reverse_sort_order(constant_fields, sort_order)
    }

    fn reverse_sort_order(&self, constant_fields: &[String], sort_order: &[String]) -> bool {
        self.inner.same_sort_order(constant_fields, sort_order)
    }
}
