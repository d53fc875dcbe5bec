use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use bytes::Bytes;
use roaring::RoaringBitmap;
use tokio::sync::RwLock;
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::storage::cache::{BlockCache, CacheStats, CachedBlock, EvictionListener};

const MAGIC: &[u8; 4] = b"OBLK";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 30;

/// Block index 0 holds the file header; it is never handed out by the
/// allocator, which makes 0 usable as a null block pointer.
pub const NULL_BLOCK: u32 = 0;

/// A single file managed as an array of fixed-size blocks.
///
/// Reads go through the bounded [`BlockCache`]; writes are write-back, with
/// dirty blocks flushed on eviction, on `flush`, and before the header (and
/// with it the root pointer) is committed. All I/O is positional, so a write
/// touches exactly one block.
pub struct BlockFile {
    pub path: PathBuf,
    file: File,
    pub block_size: usize,
    state: RwLock<FileState>,
    cache: BlockCache,
    halted: Arc<AtomicBool>,
}

impl std::fmt::Debug for BlockFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockFile")
            .field("path", &self.path)
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

struct FileState {
    block_count: u32,
    root: u32,
    free_head: u32,
    free_blocks: RoaringBitmap,
}

/// Flushes dirty blocks as they leave the cache. A failed eviction write
/// halts the file for further writes; reads stay available.
struct DirtyFlusher {
    file: File,
    block_size: usize,
    halted: Arc<AtomicBool>,
}

impl EvictionListener for DirtyFlusher {
    fn on_evict(&self, index: u32, block: &CachedBlock) {
        if !block.dirty {
            return;
        }
        let offset = index as u64 * self.block_size as u64;
        if let Err(err) = self.file.write_at(&block.data, offset) {
            tracing::error!(index, %err, "flush of evicted block failed; halting writes");
            self.halted.store(true, Ordering::SeqCst);
        }
    }
}

impl BlockFile {
    /// Open or create a block file. For an existing file the header's block
    /// size is authoritative; the configured size only applies on creation.
    pub fn open(path: impl AsRef<Path>, config: &Config) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let file_len = file.metadata()?.len();

        let (block_size, state) = if file_len == 0 {
            let block_size = config.block_size;
            if block_size < 512 {
                return Err(Error::invalid_argument(format!(
                    "block size {} below minimum of 512",
                    block_size
                )));
            }
            let state = FileState {
                block_count: 1, // header block
                root: NULL_BLOCK,
                free_head: NULL_BLOCK,
                free_blocks: RoaringBitmap::new(),
            };
            file.set_len(block_size as u64)?;
            write_header(&file, block_size, &state)?;
            file.sync_data()?;
            (block_size, state)
        } else {
            let (block_size, block_count, root, free_head) = read_header(&file)?;
            let free_blocks = rebuild_free_set(&file, block_size, block_count, free_head)?;
            (
                block_size,
                FileState {
                    block_count,
                    root,
                    free_head,
                    free_blocks,
                },
            )
        };

        let halted = Arc::new(AtomicBool::new(false));
        let flusher = DirtyFlusher {
            file: file.try_clone()?,
            block_size,
            halted: halted.clone(),
        };
        let cache = BlockCache::new(
            config.cache_max_entries,
            Duration::from_secs(config.cache_max_age_secs),
            Duration::from_secs(config.cache_sweep_interval_secs),
            Box::new(flusher),
        );

        Ok(BlockFile {
            path,
            file,
            block_size,
            state: RwLock::new(state),
            cache,
            halted,
        })
    }

    pub async fn read_block(&self, index: u32) -> Result<Bytes> {
        let state = self.state.read().await;
        if index == NULL_BLOCK || index >= state.block_count {
            return Err(Error::internal(format!(
                "block {} out of range (file has {})",
                index, state.block_count
            )));
        }
        drop(state);

        if let Some(block) = self.cache.get(index) {
            return Ok(block.data);
        }

        let mut buf = vec![0u8; self.block_size];
        self.file
            .read_exact_at(&mut buf, index as u64 * self.block_size as u64)?;
        let data = Bytes::from(buf);
        self.cache.put(
            index,
            CachedBlock {
                data: data.clone(),
                dirty: false,
                loaded_at: Instant::now(),
            },
        );
        Ok(data)
    }

    /// Write-back: the block lands in the cache dirty and reaches disk on
    /// eviction or the next flush.
    pub async fn write_block(&self, index: u32, data: Bytes) -> Result<()> {
        self.check_writable()?;
        if data.len() != self.block_size {
            return Err(Error::invalid_argument(format!(
                "block payload is {} bytes, block size is {}",
                data.len(),
                self.block_size
            )));
        }
        let state = self.state.read().await;
        if index == NULL_BLOCK || index >= state.block_count {
            return Err(Error::internal(format!(
                "block {} out of range (file has {})",
                index, state.block_count
            )));
        }
        drop(state);

        self.cache.put(
            index,
            CachedBlock {
                data,
                dirty: true,
                loaded_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Reuse a freed block if any, otherwise grow the file by one block.
    pub async fn allocate_block(&self) -> Result<u32> {
        self.check_writable()?;
        let mut state = self.state.write().await;

        if state.free_head != NULL_BLOCK {
            let index = state.free_head;
            let mut next_buf = [0u8; 4];
            self.file
                .read_exact_at(&mut next_buf, index as u64 * self.block_size as u64)?;
            state.free_head = u32::from_le_bytes(next_buf);
            state.free_blocks.remove(index);
            return Ok(index);
        }

        let index = state.block_count;
        state.block_count += 1;
        self.file
            .set_len(state.block_count as u64 * self.block_size as u64)?;
        Ok(index)
    }

    /// Return a block to the free chain for reuse.
    pub async fn free_block(&self, index: u32) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        if index == NULL_BLOCK || index >= state.block_count {
            return Err(Error::internal(format!("cannot free block {}", index)));
        }
        if state.free_blocks.contains(index) {
            return Err(Error::internal(format!("double free of block {}", index)));
        }

        self.cache.discard(index);
        let mut buf = vec![0u8; self.block_size];
        buf[0..4].copy_from_slice(&state.free_head.to_le_bytes());
        self.file
            .write_at(&buf, index as u64 * self.block_size as u64)?;
        state.free_head = index;
        state.free_blocks.insert(index);
        Ok(())
    }

    /// Extend the file to hold at least `new_block_count` blocks.
    pub async fn grow(&self, new_block_count: u32) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        if new_block_count > state.block_count {
            state.block_count = new_block_count;
            self.file
                .set_len(new_block_count as u64 * self.block_size as u64)?;
        }
        Ok(())
    }

    pub async fn root(&self) -> u32 {
        self.state.read().await.root
    }

    /// Publish a new root: dirty blocks are durable before the header that
    /// references them is rewritten.
    pub async fn commit_root(&self, root: u32) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        self.flush_dirty()?;
        self.file.sync_data()?;
        state.root = root;
        write_header(&self.file, self.block_size, &state)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Write all dirty cache entries and the current header to disk.
    pub async fn flush(&self) -> Result<()> {
        let state = self.state.write().await;
        self.flush_dirty()?;
        write_header(&self.file, self.block_size, &state)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn flush_dirty(&self) -> Result<()> {
        for (index, data) in self.cache.dirty_blocks() {
            self.file
                .write_at(&data, index as u64 * self.block_size as u64)?;
            self.cache.mark_dirty(index, false);
        }
        Ok(())
    }

    /// Drop every cached block, flushing dirty ones first.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub async fn block_count(&self) -> u32 {
        self.state.read().await.block_count
    }

    pub async fn free_count(&self) -> u64 {
        self.state.read().await.free_blocks.len()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Stop accepting writes; reads stay available.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_halted() {
            return Err(Error::invalid_state(format!(
                "{} is halted for writes",
                self.path.display()
            )));
        }
        Ok(())
    }
}

fn write_header(file: &File, block_size: usize, state: &FileState) -> Result<()> {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..4].copy_from_slice(MAGIC);
    buf[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf[6..10].copy_from_slice(&(block_size as u32).to_le_bytes());
    buf[10..14].copy_from_slice(&state.block_count.to_le_bytes());
    buf[14..18].copy_from_slice(&state.root.to_le_bytes());
    buf[18..22].copy_from_slice(&state.free_head.to_le_bytes());
    buf[22..26].copy_from_slice(&(state.free_blocks.len() as u32).to_le_bytes());
    let crc = crc32fast::hash(&buf[0..26]);
    buf[26..30].copy_from_slice(&crc.to_le_bytes());
    file.write_at(&buf, 0)?;
    Ok(())
}

fn read_header(file: &File) -> Result<(usize, u32, u32, u32)> {
    let mut buf = [0u8; HEADER_LEN];
    file.read_exact_at(&mut buf, 0)
        .map_err(|_| Error::corrupt("file header truncated"))?;
    if &buf[0..4] != MAGIC {
        return Err(Error::corrupt("bad magic in file header"));
    }
    let crc = u32::from_le_bytes(buf[26..30].try_into().expect("4 bytes"));
    if crc != crc32fast::hash(&buf[0..26]) {
        return Err(Error::corrupt("file header checksum mismatch"));
    }
    let version = u16::from_le_bytes(buf[4..6].try_into().expect("2 bytes"));
    if version != FORMAT_VERSION {
        return Err(Error::corrupt(format!("unsupported format version {}", version)));
    }
    let block_size = u32::from_le_bytes(buf[6..10].try_into().expect("4 bytes")) as usize;
    let block_count = u32::from_le_bytes(buf[10..14].try_into().expect("4 bytes"));
    let root = u32::from_le_bytes(buf[14..18].try_into().expect("4 bytes"));
    let free_head = u32::from_le_bytes(buf[18..22].try_into().expect("4 bytes"));
    Ok((block_size, block_count, root, free_head))
}

fn rebuild_free_set(
    file: &File,
    block_size: usize,
    block_count: u32,
    free_head: u32,
) -> Result<RoaringBitmap> {
    let mut free_blocks = RoaringBitmap::new();
    let mut current = free_head;
    while current != NULL_BLOCK {
        if current >= block_count || !free_blocks.insert(current) {
            return Err(Error::corrupt(format!(
                "free chain broken at block {}",
                current
            )));
        }
        let mut next_buf = [0u8; 4];
        file.read_exact_at(&mut next_buf, current as u64 * block_size as u64)?;
        current = u32::from_le_bytes(next_buf);
    }
    Ok(free_blocks)
}
