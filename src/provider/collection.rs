use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use parking_lot::RwLock;
use tokio::sync::{Mutex, MutexGuard};
use crate::btree::cursor::{Cursor, IdSource, ReversedCursor, TreeCursor};
use crate::btree::record::{ObjectPayload, ObjectRecordHandler};
use crate::btree::tree::{BTreeFile, TreeSnapshot};
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::stats::CollectionStats;
use crate::core::types::{ObjectId, TypedObject, Value};
use crate::filter::{compare_values, Filter};
use crate::index::IndexFile;
use crate::serial::SerializerRegistry;
use crate::storage::blob::BlobFile;
use crate::storage::block_file::BlockFile;
use crate::storage::layout::StorageLayout;

/// One collection: its primary tree (keyed by object id), its BLOB file,
/// and its secondary indexes. Mutations serialize on the writer lock and
/// follow one ordering: BLOB chain first, then the primary leaf, then the
/// index entries, then the old chain is released — so a failed step never
/// leaves a partial mutation visible and a crash never strands a leaf
/// pointing at a missing chain.
pub struct Collection {
    pub name: String,
    primary: BTreeFile,
    blob: BlobFile,
    handler: Arc<ObjectRecordHandler>,
    indexes: RwLock<Vec<Arc<IndexFile>>>,
    writer: Mutex<()>,
    registry: Arc<SerializerRegistry>,
    record_size_limit: usize,
    lock_timeout: Duration,
}

impl Collection {
    pub async fn open(
        layout: &StorageLayout,
        name: &str,
        config: &Config,
        registry: Arc<SerializerRegistry>,
        index_defs: &[Vec<String>],
    ) -> Result<Self> {
        let file = Arc::new(BlockFile::open(layout.tree_path(name), config)?);
        let handler = Arc::new(ObjectRecordHandler::new(registry.clone()));
        let primary = BTreeFile::open(file, handler.clone()).await;
        let blob = BlobFile::open(layout.blob_path(name), config)?;

        let mut indexes = Vec::with_capacity(index_defs.len());
        for fields in index_defs {
            let index =
                IndexFile::open(layout.index_path(name, fields), config, fields.clone()).await?;
            indexes.push(Arc::new(index));
        }

        Ok(Collection {
            name: name.to_string(),
            primary,
            blob,
            handler,
            indexes: RwLock::new(indexes),
            writer: Mutex::new(()),
            registry,
            record_size_limit: config.effective_record_limit(),
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
        })
    }

    #[cfg(test)]
    pub(crate) async fn hold_writer_for_test(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().await
    }

    async fn lock_writer(&self) -> Result<MutexGuard<'_, ()>> {
        tokio::time::timeout(self.lock_timeout, self.writer.lock())
            .await
            .map_err(|_| {
                Error::lock_timeout(format!(
                    "writer lock on collection '{}' not acquired within {:?}",
                    self.name, self.lock_timeout
                ))
            })
    }

    /// Serialize an object, promoting it to a BLOB chain when it exceeds
    /// the inline limit. The chain is durable before this returns.
    async fn encode_record(
        &self,
        id: &ObjectId,
        object: &TypedObject,
    ) -> Result<(Vec<u8>, Option<crate::storage::blob::BlobPointer>)> {
        let payload = self.registry.serialize_object(object)?;
        if payload.len() > self.record_size_limit {
            let pointer = self.blob.write_chain(&payload).await?;
            Ok((self.handler.encode_blob(id, &pointer), Some(pointer)))
        } else {
            Ok((self.handler.encode_inline(id, &payload), None))
        }
    }

    /// Rebuild an object from its leaf record, following a BLOB chain when
    /// the payload is out of line.
    async fn materialize(&self, record: &[u8]) -> Result<TypedObject> {
        let (id, payload) = self.handler.decode(record)?;
        let mut object = match payload {
            ObjectPayload::Inline(object) => object,
            ObjectPayload::Blob(pointer) => {
                let payload = self.blob.read_chain(&pointer).await?;
                self.registry.deserialize_object(&payload)?
            }
        };
        object.object_id = Some(id);
        Ok(object)
    }

    pub async fn insert(&self, mut object: TypedObject) -> Result<ObjectId> {
        let _write = self.lock_writer().await?;

        let id = object.object_id.unwrap_or_else(ObjectId::new);
        object.object_id = Some(id);
        let snapshot = self.primary.snapshot();
        if self.primary.get(id.as_bytes(), &snapshot).await?.is_some() {
            return Err(Error::invalid_argument(format!(
                "object {} already exists in '{}'",
                id, self.name
            )));
        }

        let (record, pointer) = self.encode_record(&id, &object).await?;
        self.primary.insert(id.as_bytes(), record).await?;

        let indexes = self.indexes.read().clone();
        for (i, index) in indexes.iter().enumerate() {
            if let Err(err) = index.add(&object, &id).await {
                // Roll the partial mutation back before surfacing the error.
                for done in &indexes[..i] {
                    let _ = done.remove(&object, &id).await;
                }
                let _ = self.primary.remove(id.as_bytes()).await;
                if let Some(pointer) = pointer {
                    let _ = self.blob.free_chain(&pointer).await;
                }
                return Err(err);
            }
        }
        Ok(id)
    }

    pub async fn update(&self, object: &TypedObject) -> Result<()> {
        let _write = self.lock_writer().await?;

        let id = object
            .object_id
            .ok_or_else(|| Error::invalid_argument("update requires an assigned object id"))?;
        let snapshot = self.primary.snapshot();
        let old_record = self
            .primary
            .get(id.as_bytes(), &snapshot)
            .await?
            .ok_or_else(|| Error::key_not_found(format!("object {} in '{}'", id, self.name)))?;
        let old_object = self.materialize(&old_record).await?;
        let old_pointer = match self.handler.decode(&old_record)? {
            (_, ObjectPayload::Blob(pointer)) => Some(pointer),
            _ => None,
        };

        let mut object = object.clone();
        object.object_id = Some(id);

        // New chain first, then the leaf, then the indexes; the old chain
        // goes away only after the overwrite is durable.
        let (record, _pointer) = self.encode_record(&id, &object).await?;
        self.primary.insert(id.as_bytes(), record).await?;

        let indexes = self.indexes.read().clone();
        for index in indexes {
            let old_key = index.key_for(&old_object, &id)?;
            let new_key = index.key_for(&object, &id)?;
            if old_key != new_key {
                if let Err(err) = async {
                    index.remove(&old_object, &id).await?;
                    index.add(&object, &id).await
                }
                .await
                {
                    // Leaf and index no longer agree; stop writes, keep reads.
                    self.primary.file.halt();
                    return Err(err);
                }
            }
        }

        if let Some(pointer) = old_pointer {
            self.blob.free_chain(&pointer).await?;
        }
        Ok(())
    }

    pub async fn delete(&self, id: ObjectId) -> Result<()> {
        let _write = self.lock_writer().await?;

        let snapshot = self.primary.snapshot();
        let old_record = self
            .primary
            .get(id.as_bytes(), &snapshot)
            .await?
            .ok_or_else(|| Error::key_not_found(format!("object {} in '{}'", id, self.name)))?;
        let old_object = self.materialize(&old_record).await?;
        let old_pointer = match self.handler.decode(&old_record)? {
            (_, ObjectPayload::Blob(pointer)) => Some(pointer),
            _ => None,
        };

        self.primary.remove(id.as_bytes()).await?;
        let indexes = self.indexes.read().clone();
        for index in indexes {
            if let Err(err) = index.remove(&old_object, &id).await {
                self.primary.file.halt();
                return Err(err);
            }
        }
        if let Some(pointer) = old_pointer {
            self.blob.free_chain(&pointer).await?;
        }
        Ok(())
    }

    pub async fn get(&self, id: ObjectId) -> Result<Option<TypedObject>> {
        let snapshot = self.primary.snapshot();
        self.get_at(&snapshot, &id).await
    }

    async fn get_at(
        &self,
        snapshot: &TreeSnapshot,
        id: &ObjectId,
    ) -> Result<Option<TypedObject>> {
        match self.primary.get(id.as_bytes(), snapshot).await? {
            Some(record) => Ok(Some(self.materialize(&record).await?)),
            None => Ok(None),
        }
    }

    /// Register a new index and backfill it from the primary tree. A no-op
    /// when an index over the same fields already exists.
    pub async fn ensure_index(
        &self,
        layout: &StorageLayout,
        config: &Config,
        fields: Vec<String>,
    ) -> Result<()> {
        let _write = self.lock_writer().await?;
        if self
            .indexes
            .read()
            .iter()
            .any(|index| index.field_names == fields)
        {
            return Ok(());
        }

        let index = Arc::new(
            IndexFile::open(layout.index_path(&self.name, &fields), config, fields).await?,
        );

        let mut cursor = self.primary_cursor();
        while cursor.move_next().await? {
            let object = self.materialize(cursor.current_record()?).await?;
            let id = cursor.current_object_id()?;
            index.add(&object, &id).await?;
        }

        self.indexes.write().push(index);
        Ok(())
    }

    pub async fn drop_index(&self, layout: &StorageLayout, fields: &[String]) -> Result<()> {
        let _write = self.lock_writer().await?;
        let mut indexes = self.indexes.write();
        let before = indexes.len();
        indexes.retain(|index| index.field_names != fields);
        if indexes.len() == before {
            return Err(Error::key_not_found(format!(
                "no index over {:?} on '{}'",
                fields, self.name
            )));
        }
        drop(indexes);
        std::fs::remove_file(layout.index_path(&self.name, fields))?;
        Ok(())
    }

    pub fn index_fields(&self) -> Vec<Vec<String>> {
        self.indexes
            .read()
            .iter()
            .map(|index| index.field_names.clone())
            .collect()
    }

    fn primary_cursor(&self) -> TreeCursor {
        TreeCursor::new(&self.primary, Vec::new(), IdSource::WholeKey)
    }

    pub async fn count(&self) -> Result<usize> {
        let mut cursor = self.primary_cursor();
        let mut count = 0;
        while cursor.move_next().await? {
            count += 1;
        }
        Ok(count)
    }

    /// Open a lazy result stream. Index selection: the filter's constant
    /// fields are matched against each index's leading fields, and the
    /// requested ordering must be the chosen cursor's natural order or its
    /// exact reverse; otherwise the results are materialized and sorted.
    pub async fn find(
        self: &Arc<Self>,
        filter: Option<Filter>,
        sort_order: &[&str],
        offset: usize,
        count: usize,
    ) -> Result<FindResults> {
        let normalized = filter.map(|f| f.normalize());
        let constants = normalized
            .as_ref()
            .map(|f| f.constant_fields())
            .unwrap_or_default();
        let sort: Vec<String> = sort_order.iter().map(|s| s.to_string()).collect();

        let constant_values: HashMap<String, Value> = normalized
            .as_ref()
            .map(|filter| {
                constants
                    .iter()
                    .filter_map(|name| {
                        filter
                            .constant_value(name)
                            .map(|value| (name.clone(), value.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        // Snapshots for the cursor and the primary lookups are taken inside
        // the writer lock so they describe one committed state.
        let _write = self.lock_writer().await?;

        let mut best: Option<(usize, bool, Arc<IndexFile>)> = None;
        for index in self.indexes.read().iter() {
            let probe = index.cursor();
            let same = probe.same_sort_order(&constants, &sort);
            let reverse = probe.reverse_sort_order(&constants, &sort);
            if !same && !reverse {
                continue;
            }
            let score = index.match_score(&constants);
            let better = match &best {
                None => true,
                Some((best_score, best_reversed, _)) => {
                    score > *best_score || (score == *best_score && *best_reversed && same)
                }
            };
            if better {
                best = Some((score, !same, index.clone()));
            }
        }

        let primary_snapshot = self.primary.snapshot();
        let mode = match best {
            Some((score, reversed, index)) if score > 0 || !sort.is_empty() => {
                let prefix = index.constant_prefix(&constant_values)?;
                let cursor = if reversed {
                    CollectionCursor::ReversedIndex(ReversedCursor::new(index.cursor()))
                } else {
                    CollectionCursor::Index(index.cursor())
                };
                FindMode::Stream {
                    cursor,
                    prefix,
                    started: false,
                    forward: !reversed,
                }
            }
            _ if sort.is_empty() => FindMode::Stream {
                cursor: CollectionCursor::Primary(self.primary_cursor()),
                prefix: None,
                started: false,
                forward: true,
            },
            _ => {
                // No index produces the requested order: materialize and sort.
                drop(_write);
                return self
                    .find_materialized(normalized, &sort, offset, count)
                    .await;
            }
        };

        Ok(FindResults {
            collection: self.clone(),
            primary_snapshot,
            residual: normalized,
            to_skip: offset,
            remaining: count,
            mode,
        })
    }

    async fn find_materialized(
        self: &Arc<Self>,
        filter: Option<Filter>,
        sort: &[String],
        offset: usize,
        count: usize,
    ) -> Result<FindResults> {
        let primary_snapshot = self.primary.snapshot();
        let mut matching = Vec::new();
        let mut cursor = self.primary_cursor();
        while cursor.move_next().await? {
            let object = self.materialize(cursor.current_record()?).await?;
            if filter.as_ref().map(|f| f.applies_to(&object)).unwrap_or(true) {
                matching.push(object);
            }
        }

        matching.sort_by(|a, b| {
            for field in sort {
                let (name, descending) = crate::btree::cursor::parse_direction(field);
                let left = a.get_field(name).unwrap_or(&Value::Null);
                let right = b.get_field(name).unwrap_or(&Value::Null);
                let ordering = match (left, right) {
                    (Value::Null, Value::Null) => std::cmp::Ordering::Equal,
                    (Value::Null, _) => std::cmp::Ordering::Less,
                    (_, Value::Null) => std::cmp::Ordering::Greater,
                    _ => compare_values(left, right).unwrap_or(std::cmp::Ordering::Equal),
                };
                let ordering = if descending { ordering.reverse() } else { ordering };
                if ordering != std::cmp::Ordering::Equal {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });

        let selected: VecDeque<TypedObject> =
            matching.into_iter().skip(offset).take(count).collect();

        Ok(FindResults {
            collection: self.clone(),
            primary_snapshot,
            residual: None,
            to_skip: 0,
            remaining: usize::MAX,
            mode: FindMode::Materialized(selected),
        })
    }

    pub async fn flush(&self) -> Result<()> {
        self.primary.file.flush().await?;
        self.blob.flush().await?;
        let indexes = self.indexes.read().clone();
        for index in indexes {
            index.flush().await?;
        }
        Ok(())
    }

    pub fn clear_caches(&self) {
        self.primary.file.clear_cache();
        self.blob.clear_cache();
        for index in self.indexes.read().iter() {
            index.clear_cache();
        }
    }

    pub async fn stats(&self) -> Result<CollectionStats> {
        let index_count = self.indexes.read().len();
        Ok(CollectionStats {
            name: self.name.clone(),
            object_count: self.count().await?,
            index_count,
            block_count: self.primary.file.block_count().await,
            free_blocks: self.primary.file.free_count().await,
            cache: self.primary.file.cache_stats(),
        })
    }
}

enum CollectionCursor {
    Primary(TreeCursor),
    Index(TreeCursor),
    ReversedIndex(ReversedCursor<TreeCursor>),
}

impl CollectionCursor {
    async fn move_next(&mut self) -> Result<bool> {
        match self {
            CollectionCursor::Primary(c) | CollectionCursor::Index(c) => c.move_next().await,
            CollectionCursor::ReversedIndex(c) => c.move_next().await,
        }
    }

    async fn seek_at_or_after(&mut self, key: &[u8]) -> Result<bool> {
        match self {
            CollectionCursor::Primary(c) | CollectionCursor::Index(c) => {
                c.seek_at_or_after(key).await
            }
            CollectionCursor::ReversedIndex(_) => {
                Err(Error::internal("reversed cursors do not seek"))
            }
        }
    }

    fn current_key(&self) -> Result<&[u8]> {
        match self {
            CollectionCursor::Primary(c) | CollectionCursor::Index(c) => c.current_key(),
            CollectionCursor::ReversedIndex(c) => c.current_key(),
        }
    }

    fn current_object_id(&self) -> Result<ObjectId> {
        match self {
            CollectionCursor::Primary(c) | CollectionCursor::Index(c) => c.current_object_id(),
            CollectionCursor::ReversedIndex(c) => c.current_object_id(),
        }
    }
}

enum FindMode {
    Stream {
        cursor: CollectionCursor,
        prefix: Option<Vec<u8>>,
        started: bool,
        forward: bool,
    },
    Materialized(VecDeque<TypedObject>),
}

/// Lazy result sequence. Objects are dereferenced through the primary tree
/// snapshot pinned when the query opened, so concurrent writers never leak
/// into an open result set.
pub struct FindResults {
    collection: Arc<Collection>,
    primary_snapshot: Arc<TreeSnapshot>,
    residual: Option<Filter>,
    to_skip: usize,
    remaining: usize,
    mode: FindMode,
}

impl FindResults {
    pub async fn next(&mut self) -> Result<Option<TypedObject>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        match &mut self.mode {
            FindMode::Materialized(queue) => {
                let object = queue.pop_front();
                if object.is_some() {
                    self.remaining = self.remaining.saturating_sub(1);
                }
                Ok(object)
            }
            FindMode::Stream {
                cursor,
                prefix,
                started,
                forward,
            } => {
                loop {
                    let advanced = if !*started && *forward && prefix.is_some() {
                        *started = true;
                        cursor.seek_at_or_after(prefix.as_ref().expect("prefix set")).await?
                    } else {
                        *started = true;
                        cursor.move_next().await?
                    };
                    if !advanced {
                        return Ok(None);
                    }

                    if let Some(prefix) = prefix.as_ref() {
                        let key = cursor.current_key()?;
                        if !key.starts_with(prefix) {
                            if *forward || key < prefix.as_slice() {
                                // Walked out of the pinned-prefix region.
                                return Ok(None);
                            }
                            // Reversed cursor still above the region.
                            continue;
                        }
                    }

                    let id = cursor.current_object_id()?;
                    let Some(object) = self
                        .collection
                        .get_at(&self.primary_snapshot, &id)
                        .await?
                    else {
                        continue;
                    };
                    if let Some(filter) = &self.residual {
                        if !filter.applies_to(&object) {
                            continue;
                        }
                    }
                    if self.to_skip > 0 {
                        self.to_skip -= 1;
                        continue;
                    }
                    self.remaining -= 1;
                    return Ok(Some(object));
                }
            }
        }
    }

    /// Drain the rest of the stream into a vector.
    pub async fn collect(&mut self) -> Result<Vec<TypedObject>> {
        let mut objects = Vec::new();
        while let Some(object) = self.next().await? {
            objects.push(object);
        }
        Ok(objects)
    }
}
