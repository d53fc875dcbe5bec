use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use parking_lot::Mutex;
use serde::{Serialize, Deserialize};
use tokio::sync::RwLock;
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::stats::EngineStats;
use crate::core::types::{ObjectId, ObjectSchema, TypedObject};
use crate::filter::Filter;
use crate::provider::collection::{Collection, FindResults};
use crate::serial::SerializerRegistry;
use crate::storage::file_lock::FileLock;
use crate::storage::layout::StorageLayout;

/// Durable description of the store: which collections exist and which
/// indexes each one maintains.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    collections: BTreeMap<String, CollectionMeta>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct CollectionMeta {
    indexes: Vec<Vec<String>>,
}

/// The engine handle. One per database directory (enforced by a file
/// lock), constructed explicitly and passed by reference — there is no
/// process-wide instance.
pub struct StorageEngine {
    config: Config,
    layout: StorageLayout,
    registry: Arc<SerializerRegistry>,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    manifest: Mutex<Manifest>,
    started_at: Instant,
    start_time: SystemTime,
    _lock: FileLock,
}

impl StorageEngine {
    pub fn open(config: Config) -> Result<Self> {
        let layout = StorageLayout::new(config.storage_path.clone())?;
        let lock = FileLock::acquire(&layout.lock_path(), true)?;

        let manifest_path = layout.manifest_path();
        let manifest = if manifest_path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&manifest_path)?)?
        } else {
            Manifest::default()
        };

        Ok(StorageEngine {
            config,
            layout,
            registry: Arc::new(SerializerRegistry::new()),
            collections: RwLock::new(HashMap::new()),
            manifest: Mutex::new(manifest),
            started_at: Instant::now(),
            start_time: SystemTime::now(),
            _lock: lock,
        })
    }

    /// Register an object schema; must happen before objects of that type
    /// are stored or loaded.
    pub fn register_schema(&self, schema: ObjectSchema) {
        self.registry.register(schema);
    }

    pub fn registry(&self) -> Arc<SerializerRegistry> {
        self.registry.clone()
    }

    fn persist_manifest(&self) -> Result<()> {
        let manifest = self.manifest.lock();
        let json = serde_json::to_string_pretty(&*manifest)?;
        std::fs::write(self.layout.manifest_path(), json)?;
        Ok(())
    }

    fn validate_name(name: &str) -> Result<()> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(Error::invalid_argument(format!(
                "collection name '{}' must be alphanumeric with '_' or '-'",
                name
            )));
        }
        Ok(())
    }

    /// Resolve a collection, opening (and registering) it on first use.
    pub async fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        if let Some(collection) = self.collections.read().await.get(name) {
            return Ok(collection.clone());
        }
        Self::validate_name(name)?;

        let mut collections = self.collections.write().await;
        if let Some(collection) = collections.get(name) {
            return Ok(collection.clone());
        }

        let (index_defs, is_new) = {
            let mut manifest = self.manifest.lock();
            match manifest.collections.get(name) {
                Some(meta) => (meta.indexes.clone(), false),
                None => {
                    manifest
                        .collections
                        .insert(name.to_string(), CollectionMeta::default());
                    (Vec::new(), true)
                }
            }
        };

        let collection = Arc::new(
            Collection::open(
                &self.layout,
                name,
                &self.config,
                self.registry.clone(),
                &index_defs,
            )
            .await?,
        );
        collections.insert(name.to_string(), collection.clone());
        drop(collections);

        if is_new {
            self.persist_manifest()?;
        }
        tracing::debug!(collection = name, new = is_new, "collection opened");
        Ok(collection)
    }

    pub async fn insert(&self, collection: &str, object: TypedObject) -> Result<ObjectId> {
        self.collection(collection).await?.insert(object).await
    }

    pub async fn update(&self, collection: &str, object: &TypedObject) -> Result<()> {
        self.collection(collection).await?.update(object).await
    }

    pub async fn delete(&self, collection: &str, id: ObjectId) -> Result<()> {
        self.collection(collection).await?.delete(id).await
    }

    pub async fn get_object(
        &self,
        collection: &str,
        id: ObjectId,
    ) -> Result<Option<TypedObject>> {
        self.collection(collection).await?.get(id).await
    }

    /// Query a collection. `sort_order` entries are field names, `-` prefix
    /// for descending; `count` bounds the stream (`usize::MAX` for all).
    pub async fn find(
        &self,
        collection: &str,
        filter: Option<Filter>,
        sort_order: &[&str],
        offset: usize,
        count: usize,
    ) -> Result<FindResults> {
        self.collection(collection)
            .await?
            .find(filter, sort_order, offset, count)
            .await
    }

    /// Create an index over the given fields (descending with a `-`
    /// prefix), backfilling from existing objects.
    pub async fn ensure_index(&self, collection: &str, fields: &[&str]) -> Result<()> {
        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        let handle = self.collection(collection).await?;
        handle
            .ensure_index(&self.layout, &self.config, fields.clone())
            .await?;

        {
            let mut manifest = self.manifest.lock();
            let meta = manifest.collections.entry(collection.to_string()).or_default();
            if !meta.indexes.contains(&fields) {
                meta.indexes.push(fields);
            }
        }
        self.persist_manifest()
    }

    pub async fn drop_index(&self, collection: &str, fields: &[&str]) -> Result<()> {
        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        let handle = self.collection(collection).await?;
        handle.drop_index(&self.layout, &fields).await?;

        {
            let mut manifest = self.manifest.lock();
            if let Some(meta) = manifest.collections.get_mut(collection) {
                meta.indexes.retain(|defined| defined != &fields);
            }
        }
        self.persist_manifest()
    }

    pub async fn count(&self, collection: &str) -> Result<usize> {
        self.collection(collection).await?.count().await
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.manifest.lock().collections.keys().cloned().collect()
    }

    /// Push every dirty cached block of every open collection to disk.
    pub async fn flush(&self) -> Result<()> {
        for collection in self.collections.read().await.values() {
            collection.flush().await?;
        }
        Ok(())
    }

    /// Drop all cached blocks; the next reads hit the files.
    pub async fn clear_caches(&self) {
        for collection in self.collections.read().await.values() {
            collection.clear_caches();
        }
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let mut collections = Vec::new();
        for collection in self.collections.read().await.values() {
            collections.push(collection.stats().await?);
        }
        collections.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(EngineStats {
            uptime_secs: self.started_at.elapsed().as_secs(),
            start_time: self.start_time,
            collection_count: collections.len(),
            collections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use crate::core::types::{FieldKind, Value};

    fn reading_schema() -> ObjectSchema {
        ObjectSchema::new("Reading")
            .field("room", FieldKind::String)
            .field("value", FieldKind::Double)
            .nullable_field("note", FieldKind::String)
            .nullable_field("payload", FieldKind::ByteArray)
    }

    fn reading(room: &str, value: f64) -> TypedObject {
        TypedObject::new("Reading")
            .with_field("room", Value::String(room.into()))
            .with_field("value", Value::Double(value))
    }

    async fn engine(dir: &std::path::Path) -> StorageEngine {
        let config = Config {
            storage_path: dir.to_path_buf(),
            block_size: 4096,
            ..Config::default()
        };
        let engine = StorageEngine::open(config).unwrap();
        engine.register_schema(reading_schema());
        engine
    }

    #[tokio::test]
    async fn insert_get_update_delete_cycle() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;

        let id = engine
            .insert("readings", reading("lab", 21.5))
            .await
            .unwrap();

        let got = engine.get_object("readings", id).await.unwrap().unwrap();
        assert_eq!(got.object_id, Some(id));
        assert_eq!(got.get_field("value"), Some(&Value::Double(21.5)));

        let mut updated = got.clone();
        updated.set_field("value", Value::Double(22.0));
        engine.update("readings", &updated).await.unwrap();
        let got = engine.get_object("readings", id).await.unwrap().unwrap();
        assert_eq!(got.get_field("value"), Some(&Value::Double(22.0)));

        engine.delete("readings", id).await.unwrap();
        assert!(engine.get_object("readings", id).await.unwrap().is_none());

        let err = engine.delete("readings", id).await.unwrap_err();
        assert_eq!(err.kind, crate::core::error::ErrorKind::KeyNotFound);
    }

    #[tokio::test]
    async fn update_requires_an_id() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;
        let err = engine
            .update("readings", &reading("lab", 1.0))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::core::error::ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn find_with_index_streams_matching_objects() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;
        engine.ensure_index("readings", &["room", "value"]).await.unwrap();

        for i in 0..40 {
            let room = if i % 2 == 0 { "lab" } else { "hall" };
            engine
                .insert("readings", reading(room, i as f64))
                .await
                .unwrap();
        }

        let filter = Filter::eq("room", Value::String("lab".into()));
        let mut results = engine
            .find("readings", Some(filter), &[], 0, usize::MAX)
            .await
            .unwrap();
        let objects = results.collect().await.unwrap();
        assert_eq!(objects.len(), 20);
        assert!(objects
            .iter()
            .all(|o| o.get_field("room") == Some(&Value::String("lab".into()))));
    }

    #[tokio::test]
    async fn index_and_primary_stay_in_sync() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;
        engine.ensure_index("readings", &["room"]).await.unwrap();

        let id = engine
            .insert("readings", reading("lab", 1.0))
            .await
            .unwrap();

        let by_room = |room: &str| Filter::eq("room", Value::String(room.into()));

        let found = engine
            .find("readings", Some(by_room("lab")), &[], 0, usize::MAX)
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].object_id, Some(id));

        // Moving the object to another room relocates its index entry.
        let mut moved = found[0].clone();
        moved.set_field("room", Value::String("attic".into()));
        engine.update("readings", &moved).await.unwrap();

        let stale = engine
            .find("readings", Some(by_room("lab")), &[], 0, usize::MAX)
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert!(stale.is_empty());
        let fresh = engine
            .find("readings", Some(by_room("attic")), &[], 0, usize::MAX)
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(fresh.len(), 1);

        // Deleting removes the entry atomically with the object.
        engine.delete("readings", id).await.unwrap();
        let gone = engine
            .find("readings", Some(by_room("attic")), &[], 0, usize::MAX)
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert!(gone.is_empty());
    }

    #[tokio::test]
    async fn sorted_find_uses_index_order_both_ways() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;
        engine.ensure_index("readings", &["value"]).await.unwrap();

        for value in [5.0, 1.0, 9.0, 3.0, 7.0] {
            engine.insert("readings", reading("lab", value)).await.unwrap();
        }

        let ascending = engine
            .find("readings", None, &["value"], 0, usize::MAX)
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        let values: Vec<f64> = ascending
            .iter()
            .map(|o| match o.get_field("value") {
                Some(Value::Double(v)) => *v,
                other => panic!("unexpected field {:?}", other),
            })
            .collect();
        assert_eq!(values, vec![1.0, 3.0, 5.0, 7.0, 9.0]);

        // Descending comes from the same index, reversed.
        let descending = engine
            .find("readings", None, &["-value"], 0, usize::MAX)
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        let values: Vec<f64> = descending
            .iter()
            .map(|o| match o.get_field("value") {
                Some(Value::Double(v)) => *v,
                other => panic!("unexpected field {:?}", other),
            })
            .collect();
        assert_eq!(values, vec![9.0, 7.0, 5.0, 3.0, 1.0]);
    }

    #[tokio::test]
    async fn find_without_matching_index_sorts_materialized() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;

        for (room, value) in [("b", 2.0), ("a", 9.0), ("c", 1.0)] {
            engine.insert("readings", reading(room, value)).await.unwrap();
        }

        let sorted = engine
            .find("readings", None, &["room"], 0, usize::MAX)
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        let rooms: Vec<&Value> = sorted.iter().map(|o| o.get_field("room").unwrap()).collect();
        assert_eq!(
            rooms,
            vec![
                &Value::String("a".into()),
                &Value::String("b".into()),
                &Value::String("c".into())
            ]
        );
    }

    #[tokio::test]
    async fn offset_and_count_page_through_results() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;
        engine.ensure_index("readings", &["value"]).await.unwrap();

        for i in 0..10 {
            engine.insert("readings", reading("lab", i as f64)).await.unwrap();
        }

        let page = engine
            .find("readings", None, &["value"], 3, 4)
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        let values: Vec<f64> = page
            .iter()
            .map(|o| match o.get_field("value") {
                Some(Value::Double(v)) => *v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(values, vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[tokio::test]
    async fn oversized_objects_overflow_to_blob_chains() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;

        // Far larger than the 4KB block's inline limit.
        let payload: Vec<u8> = (0..50_000).map(|i| (i % 256) as u8).collect();
        let mut object = reading("lab", 0.0);
        object.set_field("payload", Value::ByteArray(payload.clone()));

        let id = engine.insert("readings", object).await.unwrap();
        engine.clear_caches().await;

        let got = engine.get_object("readings", id).await.unwrap().unwrap();
        assert_eq!(got.get_field("payload"), Some(&Value::ByteArray(payload)));

        // Overwriting with an inline-sized object releases the chain.
        let mut small = got.clone();
        small.fields.remove("payload");
        engine.update("readings", &small).await.unwrap();
        let got = engine.get_object("readings", id).await.unwrap().unwrap();
        assert!(got.get_field("payload").is_none());
    }

    #[tokio::test]
    async fn open_result_stream_sees_pre_update_snapshot() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;
        engine.ensure_index("readings", &["value"]).await.unwrap();

        let mut ids = Vec::new();
        for i in 0..20 {
            ids.push(
                engine
                    .insert("readings", reading("lab", i as f64))
                    .await
                    .unwrap(),
            );
        }

        let mut results = engine
            .find("readings", None, &["value"], 0, usize::MAX)
            .await
            .unwrap();
        let first = results.next().await.unwrap().unwrap();
        assert_eq!(first.get_field("value"), Some(&Value::Double(0.0)));

        // Update an object the stream has not reached yet.
        let mut late = engine
            .get_object("readings", ids[15])
            .await
            .unwrap()
            .unwrap();
        late.set_field("note", Value::String("changed".into()));
        engine.update("readings", &late).await.unwrap();

        // The open stream keeps the pre-update view.
        let mut seen_fifteen = false;
        while let Some(object) = results.next().await.unwrap() {
            if object.object_id == Some(ids[15]) {
                seen_fifteen = true;
                assert!(object.get_field("note").is_none(), "pre-update snapshot");
            }
        }
        assert!(seen_fifteen);

        // A fresh query sees the update.
        let fresh = engine
            .get_object("readings", ids[15])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh.get_field("note"), Some(&Value::String("changed".into())));
    }

    #[tokio::test]
    async fn collections_and_indexes_reopen_from_manifest() {
        let dir = tempdir().unwrap();
        let id;
        {
            let engine = engine(dir.path()).await;
            engine.ensure_index("readings", &["room"]).await.unwrap();
            id = engine.insert("readings", reading("lab", 4.0)).await.unwrap();
            engine.flush().await.unwrap();
        }

        let reopened = engine(dir.path()).await;
        assert_eq!(reopened.collection_names(), vec!["readings".to_string()]);
        let got = reopened.get_object("readings", id).await.unwrap().unwrap();
        assert_eq!(got.get_field("room"), Some(&Value::String("lab".into())));

        // The index reopened too and serves filtered queries.
        let found = reopened
            .find(
                "readings",
                Some(Filter::eq("room", Value::String("lab".into()))),
                &[],
                0,
                usize::MAX,
            )
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn second_engine_on_same_directory_is_rejected() {
        let dir = tempdir().unwrap();
        let _engine = engine(dir.path()).await;
        let config = Config {
            storage_path: dir.path().to_path_buf(),
            ..Config::default()
        };
        assert!(StorageEngine::open(config).is_err());
    }

    #[tokio::test]
    async fn writer_lock_times_out_under_contention() {
        let dir = tempdir().unwrap();
        let mut config = Config {
            storage_path: dir.path().to_path_buf(),
            block_size: 4096,
            ..Config::default()
        };
        config.lock_timeout_ms = 50;
        let engine = StorageEngine::open(config).unwrap();
        engine.register_schema(reading_schema());

        let collection = engine.collection("readings").await.unwrap();
        // Hold the writer lock from outside, then try to mutate.
        let guard = collection.hold_writer_for_test().await;
        let err = engine
            .insert("readings", reading("lab", 1.0))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::core::error::ErrorKind::LockTimeout);
        drop(guard);

        engine.insert("readings", reading("lab", 1.0)).await.unwrap();
    }

    #[tokio::test]
    async fn stats_report_open_collections() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;
        engine.insert("readings", reading("lab", 1.0)).await.unwrap();
        engine.insert("readings", reading("lab", 2.0)).await.unwrap();

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.collection_count, 1);
        assert_eq!(stats.collections[0].object_count, 2);
        assert!(stats.collections[0].block_count > 1);
    }
}
