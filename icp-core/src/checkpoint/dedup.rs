// icp-core/src/checkpoint/dedup.rs

//! Block-level change detection.
//!
//! A variable is cut into fixed-size blocks. Each block's digest is compared
//! with the digest the previous layer committed for the same position; only
//! blocks that are new or differ are written.

use std::io::Write;
use std::path::Path;

use super::format::{BlockMetaRecord, MAX_BLOCK_INDEX, MAX_VAR_ID};
use super::hashing::{HashArray, HashFunction, StreamingDigest};
use super::registry::VarId;
use crate::config::IncrementalConfig;
use crate::error::{IcpError, Result};

/// Destination of committed blocks for one layer.
pub struct BlockSink<'a, W: Write + ?Sized> {
    out: &'a mut W,
    path: &'a Path,
    layer_hash: &'a mut StreamingDigest,
    with_meta: bool,
    written: u64,
}

impl<'a, W: Write + ?Sized> BlockSink<'a, W> {
    /// `with_meta` prefixes every block with its meta record.
    pub fn new(
        out: &'a mut W,
        path: &'a Path,
        layer_hash: &'a mut StreamingDigest,
        with_meta: bool,
    ) -> Self {
        Self {
            out,
            path,
            layer_hash,
            with_meta,
            written: 0,
        }
    }

    /// Bytes written through this sink.
    pub fn written(&self) -> u64 {
        self.written
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.out.write_all(bytes).map_err(|e| {
            IcpError::storage_with_source(self.path, "failed to write block data", e)
        })?;
        self.written += bytes.len() as u64;
        Ok(())
    }
}

/// Block counts of one variable or one layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockStats {
    /// Bytes of the variable.
    pub data_size: u64,
    /// Block payload bytes written, padding included.
    pub committed_bytes: u64,
    pub committed_blocks: u64,
    pub unchanged_blocks: u64,
}

impl std::ops::AddAssign for BlockStats {
    fn add_assign(&mut self, other: Self) {
        self.data_size += other.data_size;
        self.committed_bytes += other.committed_bytes;
        self.committed_blocks += other.committed_blocks;
        self.unchanged_blocks += other.unchanged_blocks;
    }
}

/// Result of committing one variable.
#[derive(Debug, Clone)]
pub struct VariableCommit {
    pub var_id: VarId,
    /// Digests of every block of the variable, pending until the layer is
    /// durable.
    pub hashes: HashArray,
    /// Indices of the blocks that were written.
    pub committed: Vec<u64>,
    pub stats: BlockStats,
}

/// Decides which blocks of a variable must be written.
#[derive(Debug, Clone)]
pub struct DirtySetDetector {
    block_size: u64,
    hash: HashFunction,
    max_var_id: u32,
    max_block_index: u64,
}

impl DirtySetDetector {
    pub fn new(block_size: u64, hash: HashFunction) -> Self {
        Self {
            block_size,
            hash,
            max_var_id: MAX_VAR_ID,
            max_block_index: MAX_BLOCK_INDEX,
        }
    }

    /// Lowers the id limits below what the meta record can hold.
    pub fn with_limits(mut self, max_var_id: u32, max_block_index: u64) -> Self {
        self.max_var_id = max_var_id.min(MAX_VAR_ID);
        self.max_block_index = max_block_index.min(MAX_BLOCK_INDEX);
        self
    }

    pub fn from_config(config: &IncrementalConfig) -> Self {
        Self::new(config.block_size, config.hash_function)
            .with_limits(config.max_var_id, config.max_block_index)
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn hash_function(&self) -> HashFunction {
        self.hash
    }

    /// Number of blocks covering `size` bytes.
    pub fn block_count(&self, size: u64) -> u64 {
        size.div_ceil(self.block_size)
    }

    /// Checks that every block of the variable can be addressed by a meta
    /// record.
    ///
    /// # Errors
    ///
    /// Returns `ConfigOverflow` if the id or the last block index is too
    /// large.
    pub fn check_limits(&self, var_id: VarId, size: u64) -> Result<()> {
        if var_id > self.max_var_id {
            return Err(IcpError::config_overflow(
                var_id,
                format!("variable id exceeds the maximum of {}", self.max_var_id),
            ));
        }
        let blocks = self.block_count(size);
        if blocks > 0 && blocks - 1 > self.max_block_index {
            return Err(IcpError::config_overflow(
                var_id,
                format!(
                    "{blocks} blocks of {} bytes exceed the maximum block index {}",
                    self.block_size, self.max_block_index
                ),
            ));
        }
        Ok(())
    }

    /// Writes the blocks of `data` that differ from `previous`.
    ///
    /// Without a previous array every block is written. On error nothing is
    /// returned, so the caller's previous array stays authoritative.
    pub fn commit_variable<W: Write + ?Sized>(
        &self,
        sink: &mut BlockSink<'_, W>,
        var_id: VarId,
        data: &[u8],
        previous: Option<&HashArray>,
    ) -> Result<VariableCommit> {
        let size = data.len() as u64;
        self.check_limits(var_id, size)?;

        let block_size = usize::try_from(self.block_size)
            .map_err(|_| IcpError::config("block size does not fit in memory"))?;
        let count = self.block_count(size);
        let mut hashes = HashArray::with_capacity(self.hash, count as usize);
        let mut committed = Vec::new();
        let mut stats = BlockStats {
            data_size: size,
            ..BlockStats::default()
        };
        let mut padded = vec![0u8; block_size];

        for (index, piece) in data.chunks(block_size).enumerate() {
            let index = index as u64;
            let block: &[u8] = if piece.len() == block_size {
                piece
            } else {
                padded[..piece.len()].copy_from_slice(piece);
                padded[piece.len()..].fill(0);
                &padded
            };

            let digest = self.hash.digest(block);
            hashes.push(&digest);

            if previous.and_then(|p| p.get(index)) == Some(digest.as_slice()) {
                stats.unchanged_blocks += 1;
                continue;
            }

            if sink.with_meta {
                let meta = BlockMetaRecord::new(var_id, index)
                    .ok_or_else(|| IcpError::config_overflow(var_id, "block index overflow"))?;
                sink.write(&meta.to_bytes())?;
            }
            sink.write(block)?;
            sink.layer_hash.update_block(var_id, index, &digest);

            committed.push(index);
            stats.committed_blocks += 1;
            stats.committed_bytes += self.block_size;
        }

        Ok(VariableCommit {
            var_id,
            hashes,
            committed,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(
        detector: &DirtySetDetector,
        data: &[u8],
        previous: Option<&HashArray>,
        with_meta: bool,
    ) -> (VariableCommit, Vec<u8>) {
        let mut out = Vec::new();
        let mut layer_hash = detector.hash_function().streaming();
        let path = Path::new("test.icp");
        let mut sink = BlockSink::new(&mut out, path, &mut layer_hash, with_meta);
        let result = detector.commit_variable(&mut sink, 1, data, previous).unwrap();
        (result, out)
    }

    #[test]
    fn test_first_commit_writes_every_block_padded() {
        let detector = DirtySetDetector::new(64, HashFunction::Xxhash64);
        let data = vec![5u8; 200];

        let (result, out) = commit(&detector, &data, None, false);

        assert_eq!(result.committed, vec![0, 1, 2, 3]);
        assert_eq!(result.hashes.len(), 4);
        assert_eq!(out.len(), 256);
        assert_eq!(&out[200..], &[0u8; 56]);
        assert_eq!(result.stats.data_size, 200);
        assert_eq!(result.stats.committed_bytes, 256);
    }

    #[test]
    fn test_unchanged_blocks_are_skipped() {
        let detector = DirtySetDetector::new(64, HashFunction::Crc32);
        let mut data = vec![1u8; 200];
        let (first, _) = commit(&detector, &data, None, true);

        data[70] = 9;
        let (second, out) = commit(&detector, &data, Some(&first.hashes), true);

        assert_eq!(second.committed, vec![1]);
        assert_eq!(second.stats.unchanged_blocks, 3);
        assert_eq!(out.len(), 6 + 64);
        let meta = BlockMetaRecord::from_bytes(&out[..6]).unwrap();
        assert_eq!(meta, BlockMetaRecord { var_id: 1, block_id: 1 });
    }

    #[test]
    fn test_identical_bytes_commit_nothing() {
        let detector = DirtySetDetector::new(16, HashFunction::Blake3);
        let data: Vec<u8> = (0..100).collect();
        let (first, _) = commit(&detector, &data, None, true);
        let (second, out) = commit(&detector, &data, Some(&first.hashes), true);

        assert!(second.committed.is_empty());
        assert!(out.is_empty());
        assert_eq!(second.hashes, first.hashes);
    }

    #[test]
    fn test_growth_commits_new_blocks() {
        let detector = DirtySetDetector::new(10, HashFunction::Xxhash64);
        let (first, _) = commit(&detector, &[4u8; 20], None, true);
        let (second, _) = commit(&detector, &[4u8; 35], Some(&first.hashes), true);

        assert_eq!(second.committed, vec![2, 3]);
    }

    #[test]
    fn test_limits() {
        let detector = DirtySetDetector::new(64, HashFunction::Xxhash64).with_limits(10, 3);

        assert!(detector.check_limits(10, 256).is_ok());
        assert!(matches!(
            detector.check_limits(11, 64),
            Err(IcpError::ConfigOverflow { var_id: 11, .. })
        ));
        assert!(matches!(
            detector.check_limits(1, 257),
            Err(IcpError::ConfigOverflow { var_id: 1, .. })
        ));
        assert!(detector.check_limits(1, 0).is_ok());
    }

    #[test]
    fn test_overflow_writes_nothing() {
        let detector = DirtySetDetector::new(8, HashFunction::Xxhash64).with_limits(100, 1);
        let mut out = Vec::new();
        let mut layer_hash = detector.hash_function().streaming();
        let path = Path::new("x");
        let mut sink = BlockSink::new(&mut out, path, &mut layer_hash, true);

        assert!(detector.commit_variable(&mut sink, 2, &[0u8; 17], None).is_err());
        assert_eq!(sink.written(), 0);
        drop(sink);
        assert!(out.is_empty());
    }
}
