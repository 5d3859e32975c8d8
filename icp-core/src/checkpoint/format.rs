// icp-core/src/checkpoint/format.rs

//! On-disk records of the layered checkpoint format.
//!
//! ## File Layout
//!
//! ```text
//! +------------------------------------+
//! | block_size (u64) | stack_size (u32)|  <- layer 0 only
//! +------------------------------------+
//! | checkpoint_id (i32) | var_count    |  <- layer preamble
//! +------------------------------------+
//! | layer 0: per variable              |
//! |   var_id (i32) | data_size (u64)   |
//! |   blocks, zero-padded              |
//! | layer > 0: per committed block     |
//! |   meta (6 bytes) | block           |
//! +------------------------------------+
//! | Trailer (bincode)                  |  <- LayerTrailer
//! +------------------------------------+
//! | Trailer Length (u32) | "ICPT"      |
//! +------------------------------------+
//! ```
//!
//! Every finalized layer appends its own trailer, which describes all layers
//! present in the file up to and including itself. Readers use the newest
//! trailer that verifies; bytes of a layer that never got its trailer are
//! ignored. All integers are little-endian.

use serde::{Deserialize, Serialize};

use super::hashing::HashFunction;
use super::layout::DataBlock;
use super::registry::VarId;
use crate::error::{IcpError, Result};

/// Bits of a meta record holding the variable id.
pub const VAR_ID_BITS: u32 = 18;

/// Bits of a meta record holding the block index.
pub const BLOCK_ID_BITS: u32 = 30;

/// Largest variable id a meta record can carry.
pub const MAX_VAR_ID: u32 = (1 << VAR_ID_BITS) - 1;

/// Largest block index a meta record can carry.
pub const MAX_BLOCK_INDEX: u64 = (1 << BLOCK_ID_BITS) - 1;

/// Size of the file header written with layer 0.
pub const FILE_HEADER_SIZE: usize = 12;

/// Size of the per-layer preamble.
pub const LAYER_PREAMBLE_SIZE: usize = 8;

/// Size of a variable header in layer 0.
pub const VAR_HEADER_SIZE: usize = 12;

/// Size of a block meta record.
pub const META_RECORD_SIZE: usize = 6;

/// Magic bytes closing every layer trailer.
pub const FOOTER_MAGIC: [u8; 4] = *b"ICPT";

/// Trailer length plus magic.
pub const FOOTER_SIZE: usize = 8;

/// Current trailer version.
pub const TRAILER_VERSION: u32 = 1;

/// Name of the base file holding the layers of one stack.
pub fn base_file_name(file_id: u64, rank: u32) -> String {
    format!("dcp-id{file_id}-rank{rank}.icp")
}

/// Parses a base file name into `(file_id, rank)`.
pub fn parse_base_file_name(name: &str) -> Option<(u64, u32)> {
    let rest = name.strip_prefix("dcp-id")?.strip_suffix(".icp")?;
    let (id, rank) = rest.split_once("-rank")?;
    Some((id.parse().ok()?, rank.parse().ok()?))
}

/// Name of the file written by a full (non-incremental) checkpoint.
pub fn full_file_name(checkpoint_id: i32, rank: u32) -> String {
    format!("Ckpt{checkpoint_id}-Rank{rank}.icp")
}

/// Parses a full checkpoint file name into `(checkpoint_id, rank)`.
pub fn parse_full_file_name(name: &str) -> Option<(i32, u32)> {
    let rest = name.strip_prefix("Ckpt")?.strip_suffix(".icp")?;
    let (id, rank) = rest.split_once("-Rank")?;
    Some((id.parse().ok()?, rank.parse().ok()?))
}

/// Header at the start of a base file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub block_size: u64,
    pub stack_size: u32,
}

impl FileHeader {
    pub fn to_bytes(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut bytes = [0u8; FILE_HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.block_size.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.stack_size.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < FILE_HEADER_SIZE {
            return None;
        }
        Some(Self {
            block_size: u64::from_le_bytes(bytes[0..8].try_into().ok()?),
            stack_size: u32::from_le_bytes(bytes[8..12].try_into().ok()?),
        })
    }
}

/// Preamble at the start of every layer body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerPreamble {
    pub checkpoint_id: i32,
    pub var_count: i32,
}

impl LayerPreamble {
    pub fn to_bytes(&self) -> [u8; LAYER_PREAMBLE_SIZE] {
        let mut bytes = [0u8; LAYER_PREAMBLE_SIZE];
        bytes[0..4].copy_from_slice(&self.checkpoint_id.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.var_count.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < LAYER_PREAMBLE_SIZE {
            return None;
        }
        Some(Self {
            checkpoint_id: i32::from_le_bytes(bytes[0..4].try_into().ok()?),
            var_count: i32::from_le_bytes(bytes[4..8].try_into().ok()?),
        })
    }
}

/// Variable header in layer 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarHeader {
    pub var_id: i32,
    pub data_size: u64,
}

impl VarHeader {
    pub fn to_bytes(&self) -> [u8; VAR_HEADER_SIZE] {
        let mut bytes = [0u8; VAR_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.var_id.to_le_bytes());
        bytes[4..12].copy_from_slice(&self.data_size.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < VAR_HEADER_SIZE {
            return None;
        }
        Some(Self {
            var_id: i32::from_le_bytes(bytes[0..4].try_into().ok()?),
            data_size: u64::from_le_bytes(bytes[4..12].try_into().ok()?),
        })
    }
}

/// Identifies a committed block in layers after the first.
///
/// Packed as a 48-bit little-endian word: the low 18 bits hold the variable
/// id, the high 30 bits the block index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMetaRecord {
    pub var_id: VarId,
    pub block_id: u64,
}

impl BlockMetaRecord {
    /// Returns `None` if either field exceeds its bit width.
    pub fn new(var_id: VarId, block_id: u64) -> Option<Self> {
        (var_id <= MAX_VAR_ID && block_id <= MAX_BLOCK_INDEX).then_some(Self { var_id, block_id })
    }

    pub fn to_bytes(&self) -> [u8; META_RECORD_SIZE] {
        let word = u64::from(self.var_id & MAX_VAR_ID)
            | ((self.block_id & MAX_BLOCK_INDEX) << VAR_ID_BITS);
        let mut bytes = [0u8; META_RECORD_SIZE];
        bytes.copy_from_slice(&word.to_le_bytes()[..META_RECORD_SIZE]);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < META_RECORD_SIZE {
            return None;
        }
        let mut word = [0u8; 8];
        word[..META_RECORD_SIZE].copy_from_slice(&bytes[..META_RECORD_SIZE]);
        let word = u64::from_le_bytes(word);
        Some(Self {
            var_id: (word & u64::from(MAX_VAR_ID)) as VarId,
            block_id: word >> VAR_ID_BITS,
        })
    }
}

/// Size of one variable as of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableExtent {
    pub var_id: VarId,
    pub size: u64,
}

/// Description of one layer inside a base file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSummary {
    pub layer: u32,
    pub checkpoint_id: i32,
    /// Offset of the layer preamble.
    pub body_offset: u64,
    /// Bytes from the preamble up to the trailer.
    pub body_size: u64,
    /// Digest over the digests of the committed blocks, in write order.
    pub layer_hash: Vec<u8>,
    pub variables: Vec<VariableExtent>,
    pub committed_blocks: u64,
}

impl LayerSummary {
    pub fn extent(&self, id: VarId) -> Option<&VariableExtent> {
        self.variables.iter().find(|v| v.var_id == id)
    }
}

/// Metadata appended after every finalized layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerTrailer {
    pub version: u32,
    pub hash_function: HashFunction,
    pub block_size: u64,
    pub stack_size: u32,
    pub file_id: u64,
    pub rank: u32,
    /// Summaries of layers 0 through the one this trailer closes.
    pub layers: Vec<LayerSummary>,
    /// Layout of all variables when the closing layer was written.
    pub datastructure: Vec<DataBlock>,
    /// Digest over every other field.
    pub descriptor_digest: Vec<u8>,
}

#[derive(Serialize)]
struct DigestInput<'a> {
    version: u32,
    hash_function: HashFunction,
    block_size: u64,
    stack_size: u32,
    file_id: u64,
    rank: u32,
    layers: &'a [LayerSummary],
    datastructure: &'a [DataBlock],
}

impl LayerTrailer {
    fn digest_input(&self) -> Result<Vec<u8>> {
        let input = DigestInput {
            version: self.version,
            hash_function: self.hash_function,
            block_size: self.block_size,
            stack_size: self.stack_size,
            file_id: self.file_id,
            rank: self.rank,
            layers: &self.layers,
            datastructure: &self.datastructure,
        };
        bincode::serialize(&input)
            .map_err(|e| IcpError::serialization(format!("failed to encode trailer: {e}")))
    }

    /// Computes and stores the descriptor digest.
    pub fn seal(mut self) -> Result<Self> {
        self.descriptor_digest = self.hash_function.digest(&self.digest_input()?);
        Ok(self)
    }

    /// Whether the stored digest matches the content.
    pub fn verify(&self) -> bool {
        self.digest_input()
            .map(|input| self.hash_function.digest(&input) == self.descriptor_digest)
            .unwrap_or(false)
    }

    /// The layer this trailer closes.
    pub fn newest(&self) -> Option<&LayerSummary> {
        self.layers.last()
    }

    /// Serializes the trailer followed by its footer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = bincode::serialize(self)
            .map_err(|e| IcpError::serialization(format!("failed to encode trailer: {e}")))?;
        let len = u32::try_from(bytes.len())
            .map_err(|_| IcpError::serialization("trailer larger than 4 GiB"))?;
        bytes.extend_from_slice(&len.to_le_bytes());
        bytes.extend_from_slice(&FOOTER_MAGIC);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}

/// Finds the newest trailer in `data` whose digest verifies.
///
/// Returns the trailer and the offset at which it starts.
pub fn locate_trailer(data: &[u8]) -> Option<(LayerTrailer, u64)> {
    let mut end = data.len();
    while end >= FOOTER_SIZE {
        if data[end - 4..end] == FOOTER_MAGIC {
            let len_bytes: [u8; 4] = data[end - 8..end - 4].try_into().ok()?;
            let len = u32::from_le_bytes(len_bytes) as usize;
            if let Some(start) = (end - FOOTER_SIZE).checked_sub(len) {
                if let Some(trailer) = LayerTrailer::from_bytes(&data[start..end - FOOTER_SIZE]) {
                    if trailer.verify() {
                        return Some((trailer, start as u64));
                    }
                }
            }
        }
        end -= 1;
    }
    None
}
