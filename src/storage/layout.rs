use std::path::PathBuf;
use std::fs;
use crate::core::error::Result;

/// Directory structure for data files
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub base_dir: PathBuf,          // Root directory
    pub collections_dir: PathBuf,   // Tree/blob/index files per collection
    pub meta_dir: PathBuf,          // Manifest location
}

impl StorageLayout {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        let collections_dir = base_dir.join("collections");
        let meta_dir = base_dir.join("meta");

        fs::create_dir_all(&collections_dir)?;
        fs::create_dir_all(&meta_dir)?;

        Ok(StorageLayout {
            base_dir,
            collections_dir,
            meta_dir,
        })
    }

    /// Primary B+Tree file of a collection.
    pub fn tree_path(&self, collection: &str) -> PathBuf {
        self.collections_dir.join(format!("{}.btree", collection))
    }

    /// BLOB chain file of a collection.
    pub fn blob_path(&self, collection: &str) -> PathBuf {
        self.collections_dir.join(format!("{}.blob", collection))
    }

    /// Secondary index file; the index name is its field list.
    pub fn index_path(&self, collection: &str, field_names: &[String]) -> PathBuf {
        self.collections_dir
            .join(format!("{}.{}.idx", collection, field_names.join("+")))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.meta_dir.join("collections.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base_dir.join(".lock")
    }
}
