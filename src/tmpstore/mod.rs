//! Temporary block store with transparent spill to disk.
//!
//! During the scatter phase every storage-node task appends the serialized
//! blocks it receives into its own store; addresses handed out by
//! [`TmpBlockStore::write_block`] are stable until the store is dropped.
//! While the cumulative size stays below the configured threshold the data
//! lives in an in-memory buffer. Crossing the threshold lazily creates an
//! anonymous temp file, flushes the buffer and keeps appending there.
//!
//! A store is single-writer until [`TmpBlockStore::finalize`] and read-only
//! afterwards: in-memory reads need no lock and file reads use positioned
//! I/O, so a finalized store can serve many concurrent readers. The backing
//! file is anonymous (already unlinked), so dropping the store is guaranteed
//! to release the disk space.

mod error;

pub use error::{StoreError, StoreResult};

use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Smallest allowed in-memory threshold.
const MIN_INMEMORY_SIZE: usize = 64 * 1024;

/// Largest allowed in-memory threshold.
const MAX_INMEMORY_SIZE: usize = 4 * 1024 * 1024;

/// Derives the in-memory threshold from the total memory the process is
/// allowed to use, clamped to `[64KiB, 4MiB]`.
pub fn inmemory_threshold(allowed_memory_bytes: usize) -> usize {
    (allowed_memory_bytes / 1024).clamp(MIN_INMEMORY_SIZE, MAX_INMEMORY_SIZE)
}

/// Address of one serialized block inside a [`TmpBlockStore`].
///
/// `source_idx` identifies the owning store when several stores are read
/// side by side (one per storage node). Addresses are valid only while the
/// owning store is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TmpBlockAddr {
    pub offset: u64,
    pub size: usize,
    pub source_idx: usize,
}

/// Append-only, positionally addressable block buffer.
pub struct TmpBlockStore {
    source_idx: usize,
    max_inmemory_size: usize,
    spill_dir: PathBuf,
    /// Write buffer; before any spill it holds the whole store contents.
    buf: Vec<u8>,
    file: Option<File>,
    /// Total bytes appended, including bytes still in `buf`.
    len: u64,
    finalized: bool,
}

impl TmpBlockStore {
    /// Creates an empty store. `source_idx` is baked into every address the
    /// store hands out. No file is created until the threshold is crossed.
    pub fn new(source_idx: usize, max_inmemory_size: usize, spill_dir: impl AsRef<Path>) -> Self {
        Self {
            source_idx,
            max_inmemory_size: max_inmemory_size.max(1),
            spill_dir: spill_dir.as_ref().to_path_buf(),
            buf: Vec::new(),
            file: None,
            len: 0,
            finalized: false,
        }
    }

    /// Total number of bytes written so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the store has spilled to disk.
    pub fn spilled(&self) -> bool {
        self.file.is_some()
    }

    /// Appends `data` and returns its address.
    ///
    /// Any filesystem error is fatal to the request: a partial write leaves
    /// the store unusable, so the error is propagated rather than retried.
    pub fn write_block(&mut self, data: &[u8]) -> StoreResult<TmpBlockAddr> {
        if self.finalized {
            return Err(StoreError::Finalized);
        }
        let addr = TmpBlockAddr {
            offset: self.len,
            size: data.len(),
            source_idx: self.source_idx,
        };
        self.len += data.len() as u64;

        if self.buf.len() + data.len() <= self.max_inmemory_size {
            self.buf.extend_from_slice(data);
            return Ok(addr);
        }

        // Threshold crossed: flush the buffer to the (lazily created) spill
        // file and restart buffering with the new block.
        if self.file.is_none() {
            let f = tempfile::tempfile_in(&self.spill_dir)
                .map_err(|e| StoreError::Spill(self.spill_dir.display().to_string(), e))?;
            tracing::debug!(
                source_idx = self.source_idx,
                buffered = self.buf.len(),
                "temporary block store spilling to disk"
            );
            self.file = Some(f);
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(&self.buf)?;
        }
        self.buf.clear();
        self.buf.extend_from_slice(data);
        Ok(addr)
    }

    /// Flushes any buffered bytes and switches the store to read-only mode.
    /// Must be called before [`TmpBlockStore::read_block_at`].
    pub fn finalize(&mut self) -> StoreResult<()> {
        if self.finalized {
            return Ok(());
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(&self.buf)?;
            file.flush()?;
            self.buf = Vec::new();
        }
        self.finalized = true;
        Ok(())
    }

    /// Reads the block at `addr` into `dst` (cleared first).
    ///
    /// Safe to call from many threads at once on a finalized store: memory
    /// reads are plain slicing and file reads are positioned.
    pub fn read_block_at(&self, addr: TmpBlockAddr, dst: &mut Vec<u8>) -> StoreResult<()> {
        if !self.finalized {
            return Err(StoreError::NotFinalized);
        }
        if addr.offset + addr.size as u64 > self.len {
            return Err(StoreError::BadAddr {
                offset: addr.offset,
                size: addr.size,
                len: self.len,
            });
        }
        dst.clear();
        dst.resize(addr.size, 0);
        match &self.file {
            None => {
                let start = addr.offset as usize;
                dst.copy_from_slice(&self.buf[start..start + addr.size]);
            }
            Some(file) => {
                file.read_exact_at(dst, addr.offset)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for TmpBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TmpBlockStore")
            .field("source_idx", &self.source_idx)
            .field("len", &self.len)
            .field("spilled", &self.spilled())
            .field("finalized", &self.finalized)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn store(max_inmemory: usize) -> (TmpBlockStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = TmpBlockStore::new(0, max_inmemory, dir.path());
        (store, dir)
    }

    #[test]
    fn test_threshold_clamped() {
        assert_eq!(inmemory_threshold(0), 64 * 1024);
        assert_eq!(inmemory_threshold(256 * 1024 * 1024), 256 * 1024);
        assert_eq!(inmemory_threshold(1 << 40), 4 * 1024 * 1024);
    }

    #[test]
    fn test_inmemory_roundtrip() {
        let (mut store, _dir) = store(1024 * 1024);
        let blocks: Vec<Vec<u8>> = (0u8..10).map(|i| vec![i; 100 + i as usize]).collect();
        let addrs: Vec<_> = blocks
            .iter()
            .map(|b| store.write_block(b).unwrap())
            .collect();
        assert!(!store.spilled());
        store.finalize().unwrap();

        let mut buf = Vec::new();
        for (addr, block) in addrs.iter().zip(&blocks) {
            store.read_block_at(*addr, &mut buf).unwrap();
            assert_eq!(&buf, block);
        }
    }

    #[test]
    fn test_spill_roundtrip_random_sizes() {
        // Small threshold so the store crosses from the in-memory regime to
        // the spill regime mid-sequence.
        let (mut store, _dir) = store(4 * 1024);
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);

        let blocks: Vec<Vec<u8>> = (0..64)
            .map(|_| {
                let size = rng.gen_range(1..600);
                (0..size).map(|_| rng.gen::<u8>()).collect()
            })
            .collect();
        let addrs: Vec<_> = blocks
            .iter()
            .map(|b| store.write_block(b).unwrap())
            .collect();
        assert!(store.spilled());
        store.finalize().unwrap();

        let mut buf = Vec::new();
        for (addr, block) in addrs.iter().zip(&blocks) {
            store.read_block_at(*addr, &mut buf).unwrap();
            assert_eq!(&buf, block, "mismatch at offset {}", addr.offset);
        }
    }

    #[test]
    fn test_spill_after_threshold_crossed() {
        // 10 blocks of 8192 samples each (16 bytes per sample) against a
        // 64KiB threshold: the first blocks stay buffered, then the store
        // spills, and every address reads back identical bytes afterwards.
        let (mut store, _dir) = store(64 * 1024);
        let blocks: Vec<Vec<u8>> = (0..10u8)
            .map(|i| {
                (0..8192u32 * 16)
                    .map(|j| (j as u8).wrapping_add(i))
                    .collect()
            })
            .collect();
        let addrs: Vec<_> = blocks
            .iter()
            .map(|b| store.write_block(b).unwrap())
            .collect();
        assert!(store.spilled());
        store.finalize().unwrap();

        let mut buf = Vec::new();
        for (addr, block) in addrs.iter().zip(&blocks) {
            store.read_block_at(*addr, &mut buf).unwrap();
            assert_eq!(&buf, block);
        }
    }

    #[test]
    fn test_concurrent_reads_after_finalize() {
        let (mut store, _dir) = store(1024);
        let blocks: Vec<Vec<u8>> = (0u8..32).map(|i| vec![i; 257]).collect();
        let addrs: Vec<_> = blocks
            .iter()
            .map(|b| store.write_block(b).unwrap())
            .collect();
        store.finalize().unwrap();

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let mut buf = Vec::new();
                    for (addr, block) in addrs.iter().zip(&blocks) {
                        store.read_block_at(*addr, &mut buf).unwrap();
                        assert_eq!(&buf, block);
                    }
                });
            }
        });
    }

    #[test]
    fn test_read_before_finalize_rejected() {
        let (mut store, _dir) = store(1024);
        let addr = store.write_block(b"abc").unwrap();
        let mut buf = Vec::new();
        assert!(matches!(
            store.read_block_at(addr, &mut buf),
            Err(StoreError::NotFinalized)
        ));
    }

    #[test]
    fn test_write_after_finalize_rejected() {
        let (mut store, _dir) = store(1024);
        store.finalize().unwrap();
        assert!(matches!(
            store.write_block(b"abc"),
            Err(StoreError::Finalized)
        ));
    }

    #[test]
    fn test_bad_addr_rejected() {
        let (mut store, _dir) = store(1024);
        store.write_block(b"abc").unwrap();
        store.finalize().unwrap();
        let mut buf = Vec::new();
        let bad = TmpBlockAddr {
            offset: 1,
            size: 3,
            source_idx: 0,
        };
        assert!(matches!(
            store.read_block_at(bad, &mut buf),
            Err(StoreError::BadAddr { .. })
        ));
    }

    #[test]
    fn test_empty_store_finalize_and_drop() {
        let (mut store, _dir) = store(1024);
        store.finalize().unwrap();
        assert!(store.is_empty());
        drop(store);
    }
}
