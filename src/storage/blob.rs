use std::collections::HashSet;
use std::path::Path;
use bytes::Bytes;
use crate::codec::{BitReader, BitWriter};
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::storage::block_file::{BlockFile, NULL_BLOCK};

// Per-chunk header inside a blob block: next block pointer + payload length.
const CHUNK_HEADER: usize = 6;

/// Reference to a BLOB chain, stored in a leaf in place of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobPointer {
    pub total_len: u32,
    pub start_block: u32,
}

impl BlobPointer {
    pub fn write(&self, w: &mut BitWriter) {
        w.write_u32(self.total_len);
        w.write_u32(self.start_block);
    }

    pub fn read(r: &mut BitReader<'_>) -> Result<Self> {
        Ok(BlobPointer {
            total_len: r.read_u32()?,
            start_block: r.read_u32()?,
        })
    }
}

/// Chained storage for payloads too large to live inline in a leaf.
///
/// Each chunk block carries `[u32 next][u16 len][data]`, chunked so the
/// block size is respected; a zero-length chunk with no successor
/// terminates an empty stream.
pub struct BlobFile {
    blocks: BlockFile,
}

impl BlobFile {
    pub fn open(path: impl AsRef<Path>, config: &Config) -> Result<Self> {
        Ok(BlobFile {
            blocks: BlockFile::open(path, config)?,
        })
    }

    fn chunk_capacity(&self) -> usize {
        self.blocks.block_size - CHUNK_HEADER
    }

    /// Write a payload as a new chain and return its pointer. The chain is
    /// fully durable before the caller commits a leaf that references it.
    pub async fn write_chain(&self, payload: &[u8]) -> Result<BlobPointer> {
        let capacity = self.chunk_capacity();
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![&[]]
        } else {
            payload.chunks(capacity).collect()
        };

        let mut block_ids = Vec::with_capacity(chunks.len());
        for _ in &chunks {
            block_ids.push(self.blocks.allocate_block().await?);
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let next = block_ids.get(i + 1).copied().unwrap_or(NULL_BLOCK);
            let mut buf = vec![0u8; self.blocks.block_size];
            buf[0..4].copy_from_slice(&next.to_le_bytes());
            buf[4..6].copy_from_slice(&(chunk.len() as u16).to_le_bytes());
            buf[CHUNK_HEADER..CHUNK_HEADER + chunk.len()].copy_from_slice(chunk);
            self.blocks.write_block(block_ids[i], Bytes::from(buf)).await?;
        }
        self.blocks.flush().await?;

        Ok(BlobPointer {
            total_len: payload.len() as u32,
            start_block: block_ids[0],
        })
    }

    /// Reassemble a chain into its original payload.
    pub async fn read_chain(&self, pointer: &BlobPointer) -> Result<Vec<u8>> {
        let capacity = self.chunk_capacity();
        let mut payload = Vec::with_capacity(pointer.total_len as usize);
        let mut seen = HashSet::new();
        let mut current = pointer.start_block;

        while current != NULL_BLOCK {
            if !seen.insert(current) {
                return Err(Error::blob_chain(format!(
                    "cycle in blob chain at block {}",
                    current
                )));
            }
            let block = self.blocks.read_block(current).await.map_err(|err| {
                Error::blob_chain(format!("unreadable chunk block {}: {}", current, err))
            })?;
            let next = u32::from_le_bytes(block[0..4].try_into().expect("4 bytes"));
            let len = u16::from_le_bytes(block[4..6].try_into().expect("2 bytes")) as usize;
            if len > capacity {
                return Err(Error::blob_chain(format!(
                    "chunk length {} exceeds capacity in block {}",
                    len, current
                )));
            }
            payload.extend_from_slice(&block[CHUNK_HEADER..CHUNK_HEADER + len]);
            if payload.len() > pointer.total_len as usize {
                return Err(Error::blob_chain("chain longer than recorded length"));
            }
            current = next;
        }

        if payload.len() != pointer.total_len as usize {
            return Err(Error::blob_chain(format!(
                "chain ends at {} of {} bytes",
                payload.len(),
                pointer.total_len
            )));
        }
        Ok(payload)
    }

    /// Release every block of a chain. Called only after the leaf no longer
    /// references the chain.
    pub async fn free_chain(&self, pointer: &BlobPointer) -> Result<()> {
        let mut seen = HashSet::new();
        let mut current = pointer.start_block;
        while current != NULL_BLOCK {
            if !seen.insert(current) {
                return Err(Error::blob_chain(format!(
                    "cycle in blob chain at block {}",
                    current
                )));
            }
            let block = self.blocks.read_block(current).await.map_err(|err| {
                Error::blob_chain(format!("unreadable chunk block {}: {}", current, err))
            })?;
            let next = u32::from_le_bytes(block[0..4].try_into().expect("4 bytes"));
            self.blocks.free_block(current).await?;
            current = next;
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        self.blocks.flush().await
    }

    pub fn clear_cache(&self) {
        self.blocks.clear_cache();
    }
}
