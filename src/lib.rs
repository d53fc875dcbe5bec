pub mod core;
pub mod codec;
pub mod serial;
pub mod storage;
pub mod btree;
pub mod index;
pub mod filter;
pub mod provider;

pub use crate::core::config::Config;
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::types::{FieldKind, ObjectId, ObjectSchema, TypedObject, Value};
pub use crate::filter::Filter;
pub use crate::provider::{FindResults, StorageEngine};

// ┌──────────────────────────────────────────────────────────────────────────┐
// │                        OBELISK STRUCT ARCHITECTURE                        │
// └──────────────────────────────────────────────────────────────────────────┘
//
// ┌────────────────────────────── FAÇADE LAYER ──────────────────────────────┐
// │                                                                           │
// │  struct StorageEngine            struct Collection                        │
// │  • config: Config                • primary: BTreeFile                     │
// │  • layout: StorageLayout         • blob: BlobFile                         │
// │  • registry: Arc<Registry>       • indexes: Vec<Arc<IndexFile>>           │
// │  • collections: RwLock<Map>      • writer: Mutex<()>  (one writer,        │
// │  • manifest: Mutex<Manifest>     │    many snapshot readers)              │
// │  • _lock: FileLock               • record_size_limit (BLOB promotion)     │
// │                                                                           │
// │  StorageEngine ──resolves──> Collection ──streams──> FindResults          │
// └───────────────────────────────────────────────────────────────────────────┘
//
// ┌────────────────────────────── QUERY LAYER ───────────────────────────────┐
// │                                                                           │
// │  enum Filter                     trait Cursor                             │
// │  • FieldEqualTo / Range / ...    • move_next / move_previous              │
// │  • And / Or / Not                • current_key / current_object_id        │
// │  • applies_to(object)            • same_sort_order / reverse_sort_order   │
// │  • negate / normalize            struct TreeCursor (snapshot-pinned)      │
// │  • constant_fields ──picks──>    struct ReversedCursor<C>                 │
// │    IndexFile by key prefix                                                │
// └───────────────────────────────────────────────────────────────────────────┘
//
// ┌────────────────────────────── TREE LAYER ────────────────────────────────┐
// │                                                                           │
// │  struct BTreeFile                struct IndexFile                         │
// │  • copy-on-write nodes           • composite key encoding (index::key)    │
// │  • split / merge / rebalance     • (fields ‖ object id) → object id       │
// │  • TreeSnapshot versions,        trait RecordHandler                      │
// │    deferred block free           • ObjectRecordHandler (id + payload)     │
// │                                  • DictionaryRecordHandler (key → value)  │
// └───────────────────────────────────────────────────────────────────────────┘
//
// ┌────────────────────────────── CODEC LAYER ───────────────────────────────┐
// │                                                                           │
// │  struct BitWriter / BitReader    struct SerializerRegistry                │
// │  • bit-packed fields, 6-bit tags • ObjectSchema per type, no reflection   │
// │  • read_*/skip_* parity          • nullable promotion via NumericValue    │
// └───────────────────────────────────────────────────────────────────────────┘
//
// ┌───────────────────────────── STORAGE LAYER ──────────────────────────────┐
// │                                                                           │
// │  struct BlockFile                struct BlockCache                        │
// │  • header: root + free chain     • lru + max age + sweep                  │
// │  • positional block I/O          • EvictionListener flushes dirty         │
// │  struct BlobFile                 struct StorageLayout / FileLock          │
// │  • chained oversized payloads    • per-collection files, dir lock         │
// └───────────────────────────────────────────────────────────────────────────┘
