use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use crate::btree::cursor::{parse_direction, IdSource, TreeCursor};
use crate::btree::record::RecordHandler;
use crate::btree::tree::BTreeFile;
use crate::codec::BitReader;
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::types::{ObjectId, TypedObject, Value};
use crate::index::key;
use crate::storage::block_file::BlockFile;

/// Records of an index tree are bare keys: the composite field encoding
/// followed by the 16-byte object id that makes the key unique.
struct IndexRecordHandler {
    directions: Vec<bool>,
}

impl RecordHandler for IndexRecordHandler {
    fn read_record(&self, r: &mut BitReader<'_>) -> Result<Vec<u8>> {
        let tail = r.tail();
        let mut pos = 0;
        for &descending in &self.directions {
            pos = key::skip_field(tail, pos, descending)?;
        }
        let end = pos + 16;
        if end > tail.len() {
            return Err(Error::corrupt("index record truncated before object id"));
        }
        let record = tail[..end].to_vec();
        r.skip_bits(end as u64 * 8)?;
        Ok(record)
    }

    fn is_blob(&self, _record: &[u8]) -> Result<bool> {
        Ok(false)
    }
}

/// Secondary index: a B+Tree mapping composite field values to object ids,
/// kept in exact sync with its primary tree inside the collection's writer
/// critical section.
pub struct IndexFile {
    /// Field list as declared, `-` prefix marking descending fields.
    pub field_names: Vec<String>,
    names: Vec<String>,
    directions: Vec<bool>,
    tree: BTreeFile,
}

impl IndexFile {
    pub async fn open(
        path: impl AsRef<Path>,
        config: &Config,
        field_names: Vec<String>,
    ) -> Result<Self> {
        if field_names.is_empty() {
            return Err(Error::invalid_argument("an index needs at least one field"));
        }
        let mut names = Vec::with_capacity(field_names.len());
        let mut directions = Vec::with_capacity(field_names.len());
        for field in &field_names {
            let (name, descending) = parse_direction(field);
            names.push(name.to_string());
            directions.push(descending);
        }

        let file = Arc::new(BlockFile::open(path, config)?);
        let handler = Arc::new(IndexRecordHandler {
            directions: directions.clone(),
        });
        let tree = BTreeFile::open(file, handler).await;

        Ok(IndexFile {
            field_names,
            names,
            directions,
            tree,
        })
    }

    /// Plain field names, directions stripped.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_halted(&self) -> bool {
        self.tree.is_halted()
    }

    /// Entry key for an object: every indexed field, then the object id.
    pub fn key_for(&self, object: &TypedObject, id: &ObjectId) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for (name, &descending) in self.names.iter().zip(&self.directions) {
            key::encode_field(&mut out, object.get_field(name), descending)?;
        }
        out.extend_from_slice(id.as_bytes());
        Ok(out)
    }

    /// Key prefix covering the leading fields pinned by `constants`, used
    /// to seek an index cursor. `None` when the first field is not pinned.
    pub fn constant_prefix(&self, constants: &HashMap<String, Value>) -> Result<Option<Vec<u8>>> {
        let mut out = Vec::new();
        let mut pinned = 0;
        for (name, &descending) in self.names.iter().zip(&self.directions) {
            match constants.get(name) {
                Some(value) => {
                    key::encode_field(&mut out, Some(value), descending)?;
                    pinned += 1;
                }
                None => break,
            }
        }
        Ok(if pinned == 0 { None } else { Some(out) })
    }

    /// How many leading index fields are pinned constant by a filter.
    pub fn match_score(&self, constant_fields: &[String]) -> usize {
        self.names
            .iter()
            .take_while(|name| constant_fields.contains(*name))
            .count()
    }

    pub async fn add(&self, object: &TypedObject, id: &ObjectId) -> Result<()> {
        let entry = self.key_for(object, id)?;
        let record = entry.clone();
        self.tree.insert(&entry, record).await?;
        Ok(())
    }

    pub async fn remove(&self, object: &TypedObject, id: &ObjectId) -> Result<()> {
        let entry = self.key_for(object, id)?;
        self.tree.remove(&entry).await?;
        Ok(())
    }

    /// Cursor over the index's natural order.
    pub fn cursor(&self) -> TreeCursor {
        TreeCursor::new(&self.tree, self.field_names.clone(), IdSource::Suffix)
    }

    pub async fn flush(&self) -> Result<()> {
        self.tree.file.flush().await
    }

    pub fn clear_cache(&self) {
        self.tree.file.clear_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use crate::btree::cursor::Cursor;

    fn object(room: &str, value: i64) -> TypedObject {
        TypedObject::new("Reading")
            .with_field("room", Value::String(room.into()))
            .with_field("value", Value::Int64(value))
    }

    async fn index(dir: &Path, fields: &[&str]) -> IndexFile {
        let config = Config {
            storage_path: dir.to_path_buf(),
            block_size: 1024,
            ..Config::default()
        };
        IndexFile::open(
            dir.join("t.room+value.idx"),
            &config,
            fields.iter().map(|s| s.to_string()).collect(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn entries_come_back_in_field_order() {
        let dir = tempdir().unwrap();
        let idx = index(dir.path(), &["room", "value"]).await;

        let mut ids = Vec::new();
        for (room, value) in [("b", 2), ("a", 9), ("a", 1), ("c", 5)] {
            let id = ObjectId::new();
            idx.add(&object(room, value), &id).await.unwrap();
            ids.push((room, value, id));
        }

        let mut cursor = idx.cursor();
        let mut seen = Vec::new();
        while cursor.move_next().await.unwrap() {
            seen.push(cursor.current_object_id().unwrap());
        }
        ids.sort_by_key(|(room, value, _)| (room.to_string(), *value));
        let expected: Vec<ObjectId> = ids.iter().map(|(_, _, id)| *id).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn descending_field_reverses_that_component() {
        let dir = tempdir().unwrap();
        let idx = index(dir.path(), &["room", "-value"]).await;

        let low = ObjectId::new();
        let high = ObjectId::new();
        idx.add(&object("a", 1), &low).await.unwrap();
        idx.add(&object("a", 9), &high).await.unwrap();

        let mut cursor = idx.cursor();
        assert!(cursor.move_next().await.unwrap());
        assert_eq!(cursor.current_object_id().unwrap(), high);
        assert!(cursor.move_next().await.unwrap());
        assert_eq!(cursor.current_object_id().unwrap(), low);
    }

    #[tokio::test]
    async fn remove_deletes_exactly_one_entry() {
        let dir = tempdir().unwrap();
        let idx = index(dir.path(), &["room"]).await;

        let a = ObjectId::new();
        let b = ObjectId::new();
        // Same field values, different ids: distinct entries.
        idx.add(&object("a", 1), &a).await.unwrap();
        idx.add(&object("a", 1), &b).await.unwrap();
        idx.remove(&object("a", 1), &a).await.unwrap();

        let mut cursor = idx.cursor();
        assert!(cursor.move_next().await.unwrap());
        assert_eq!(cursor.current_object_id().unwrap(), b);
        assert!(!cursor.move_next().await.unwrap());
    }

    #[tokio::test]
    async fn prefix_and_score_follow_leading_fields() {
        let dir = tempdir().unwrap();
        let idx = index(dir.path(), &["room", "value"]).await;

        let mut constants = HashMap::new();
        assert!(idx.constant_prefix(&constants).unwrap().is_none());
        assert_eq!(idx.match_score(&[]), 0);

        constants.insert("room".to_string(), Value::String("a".into()));
        assert!(idx.constant_prefix(&constants).unwrap().is_some());
        assert_eq!(idx.match_score(&["room".to_string()]), 1);
        assert_eq!(
            idx.match_score(&["room".to_string(), "value".to_string()]),
            2
        );
        // A pinned second field without the first cannot use the index.
        assert_eq!(idx.match_score(&["value".to_string()]), 0);
    }
}
