// icp-core/src/checkpoint/hashing.rs

//! Block digests and per-variable hash arrays.

use serde::{Deserialize, Serialize};
use std::hash::Hasher;

use twox_hash::XxHash64;

/// Hash function used for block digests and layer hashes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashFunction {
    /// XXHash64, seed 0. 8-byte digests.
    #[default]
    Xxhash64,
    /// CRC-32 (IEEE). 4-byte digests.
    Crc32,
    /// BLAKE3. 32-byte digests.
    Blake3,
}

impl HashFunction {
    /// Parses a hash function name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "xxhash64" | "xxh64" => Some(Self::Xxhash64),
            "crc32" => Some(Self::Crc32),
            "blake3" => Some(Self::Blake3),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Xxhash64 => "xxhash64",
            Self::Crc32 => "crc32",
            Self::Blake3 => "blake3",
        }
    }

    /// Width of one digest in bytes.
    pub fn digest_width(self) -> usize {
        match self {
            Self::Xxhash64 => 8,
            Self::Crc32 => 4,
            Self::Blake3 => blake3::OUT_LEN,
        }
    }

    /// Digest of `data`.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Xxhash64 => {
                let mut hasher = XxHash64::with_seed(0);
                hasher.write(data);
                hasher.finish().to_le_bytes().to_vec()
            }
            Self::Crc32 => crc32fast::hash(data).to_le_bytes().to_vec(),
            Self::Blake3 => blake3::hash(data).as_bytes().to_vec(),
        }
    }

    /// Starts an incremental digest.
    pub fn streaming(self) -> StreamingDigest {
        let state = match self {
            Self::Xxhash64 => StreamingState::Xxhash64(XxHash64::with_seed(0)),
            Self::Crc32 => StreamingState::Crc32(crc32fast::Hasher::new()),
            Self::Blake3 => StreamingState::Blake3(Box::new(blake3::Hasher::new())),
        };
        StreamingDigest { state }
    }
}

impl std::fmt::Display for HashFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

enum StreamingState {
    Xxhash64(XxHash64),
    Crc32(crc32fast::Hasher),
    Blake3(Box<blake3::Hasher>),
}

/// Incremental digest; a layer hash is one of these fed with the position and
/// digest of each of the layer's committed blocks.
pub struct StreamingDigest {
    state: StreamingState,
}

impl StreamingDigest {
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            StreamingState::Xxhash64(h) => h.write(data),
            StreamingState::Crc32(h) => h.update(data),
            StreamingState::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Folds one committed block into a layer hash: its position within the
    /// variable, then its digest.
    pub fn update_block(&mut self, var_id: u32, block_id: u64, digest: &[u8]) {
        self.update(&var_id.to_le_bytes());
        self.update(&block_id.to_le_bytes());
        self.update(digest);
    }

    pub fn finalize(self) -> Vec<u8> {
        match self.state {
            StreamingState::Xxhash64(h) => h.finish().to_le_bytes().to_vec(),
            StreamingState::Crc32(h) => h.finalize().to_le_bytes().to_vec(),
            StreamingState::Blake3(h) => h.finalize().as_bytes().to_vec(),
        }
    }
}

impl std::fmt::Debug for StreamingDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.state {
            StreamingState::Xxhash64(_) => "xxhash64",
            StreamingState::Crc32(_) => "crc32",
            StreamingState::Blake3(_) => "blake3",
        };
        f.debug_struct("StreamingDigest").field("function", &name).finish()
    }
}

/// One digest per block of a variable, as committed by the last layer.
///
/// Digests are stored back to back in a single buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashArray {
    function: HashFunction,
    digests: Vec<u8>,
}

impl HashArray {
    pub fn new(function: HashFunction) -> Self {
        Self::with_capacity(function, 0)
    }

    pub fn with_capacity(function: HashFunction, blocks: usize) -> Self {
        Self {
            function,
            digests: Vec::with_capacity(blocks * function.digest_width()),
        }
    }

    pub fn function(&self) -> HashFunction {
        self.function
    }

    /// Appends the digest of the next block.
    pub fn push(&mut self, digest: &[u8]) {
        debug_assert_eq!(digest.len(), self.function.digest_width());
        self.digests.extend_from_slice(digest);
    }

    /// Digest of block `index`, if the array covers it.
    pub fn get(&self, index: u64) -> Option<&[u8]> {
        let width = self.function.digest_width();
        let start = usize::try_from(index).ok()?.checked_mul(width)?;
        self.digests.get(start..start + width)
    }

    /// Number of blocks covered.
    pub fn len(&self) -> usize {
        self.digests.len() / self.function.digest_width()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.digests.chunks_exact(self.function.digest_width())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_widths() {
        for function in [HashFunction::Xxhash64, HashFunction::Crc32, HashFunction::Blake3] {
            assert_eq!(function.digest(b"abc").len(), function.digest_width());
            let mut s = function.streaming();
            s.update(b"abc");
            assert_eq!(s.finalize().len(), function.digest_width());
        }
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        for function in [HashFunction::Xxhash64, HashFunction::Crc32, HashFunction::Blake3] {
            let mut s = function.streaming();
            s.update(b"hello ");
            s.update(b"world");
            assert_eq!(s.finalize(), function.digest(b"hello world"), "{function}");
        }
    }

    #[test]
    fn test_parse() {
        assert_eq!(HashFunction::parse("XXHASH64"), Some(HashFunction::Xxhash64));
        assert_eq!(HashFunction::parse("crc32"), Some(HashFunction::Crc32));
        assert_eq!(HashFunction::parse("blake3"), Some(HashFunction::Blake3));
        assert_eq!(HashFunction::parse("md5"), None);
        assert_eq!(HashFunction::default().as_str(), "xxhash64");
    }

    #[test]
    fn test_hash_array_indexing() {
        let function = HashFunction::Crc32;
        let mut array = HashArray::new(function);
        array.push(&function.digest(b"a"));
        array.push(&function.digest(b"b"));

        assert_eq!(array.len(), 2);
        assert_eq!(array.get(1), Some(function.digest(b"b").as_slice()));
        assert_eq!(array.get(2), None);
        assert_eq!(array.iter().count(), 2);
    }
}
