// icp-core/src/checkpoint/writer.rs

//! Layer writers.
//!
//! A checkpoint goes through `initialize`, one `write_variable` per protected
//! variable, and `finalize`. Only a successful `finalize` makes the layer
//! valid: it appends the trailer and syncs the file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::Hasher;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};
use twox_hash::XxHash64;

use super::dedup::{BlockSink, BlockStats, DirtySetDetector};
use super::format::{
    FileHeader, LayerPreamble, LayerSummary, LayerTrailer, VarHeader, VariableExtent,
    FOOTER_SIZE, TRAILER_VERSION,
};
use super::hashing::{HashArray, HashFunction, StreamingDigest};
use super::layout::{DataBlock, Datastructure};
use super::reader::LayerFile;
use super::registry::VarId;
use crate::config::{IncrementalConfig, IoMode};
use crate::error::{IcpError, Result};
use crate::storage::{OpenMode, StorageBackend, StorageWriter};

/// Where and what one checkpoint writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerPlan {
    pub rank: u32,
    pub file_id: u64,
    pub layer: u32,
    pub checkpoint_id: i32,
    pub var_count: usize,
    pub path: PathBuf,
}

/// Sizes and block counts of a finalized layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerStats {
    pub layer: u32,
    pub variables: usize,
    /// Bytes of all protected variables.
    pub data_size: u64,
    /// Block payload bytes written by this layer.
    pub dcp_size: u64,
    /// Bytes appended to the file, headers and trailer included.
    pub layer_size: u64,
    pub committed_blocks: u64,
    pub unchanged_blocks: u64,
}

impl LayerStats {
    /// Share of the protected bytes that had to be written.
    pub fn dcp_ratio(&self) -> f64 {
        if self.data_size == 0 {
            0.0
        } else {
            self.dcp_size as f64 / self.data_size as f64
        }
    }
}

/// Outcome of a successful `finalize`.
#[derive(Debug, Clone)]
pub struct FinalizedLayer {
    pub path: PathBuf,
    pub layer: u32,
    pub file_size: u64,
    pub stats: LayerStats,
    /// New hash arrays, to replace the session's once the layer is durable.
    pub hashes: BTreeMap<VarId, HashArray>,
}

fn write_bytes(writer: &mut dyn StorageWriter, path: &Path, bytes: &[u8]) -> Result<()> {
    writer
        .write_all(bytes)
        .map_err(|e| IcpError::storage_with_source(path, "failed to write checkpoint data", e))
}

fn not_initialized(kind: &str) -> IcpError {
    IcpError::serialization(format!("{kind} writer used before initialize"))
}

struct ActiveLayer {
    plan: LayerPlan,
    writer: Box<dyn StorageWriter>,
    start: u64,
    body_offset: u64,
    body_written: u64,
    layer_hash: StreamingDigest,
    prior: Vec<LayerSummary>,
    extents: Vec<VariableExtent>,
    pending: BTreeMap<VarId, HashArray>,
    stats: BlockStats,
}

/// Writes layers of the incremental format.
pub struct IncrementalLayerWriter {
    storage: Arc<dyn StorageBackend>,
    detector: DirtySetDetector,
    stack_size: u32,
    active: Option<ActiveLayer>,
}

impl IncrementalLayerWriter {
    pub fn new(storage: Arc<dyn StorageBackend>, config: &IncrementalConfig) -> Self {
        Self {
            storage,
            detector: DirtySetDetector::from_config(config),
            stack_size: config.stack_size,
            active: None,
        }
    }

    pub fn detector(&self) -> &DirtySetDetector {
        &self.detector
    }

    /// Opens the layer: truncates the base file for layer 0, appends
    /// otherwise.
    ///
    /// # Errors
    ///
    /// For layers after the first, fails if the base file does not end with
    /// exactly `plan.layer` finalized layers written with the same geometry.
    pub fn initialize(&mut self, plan: LayerPlan) -> Result<()> {
        self.active = None;

        let prior = if plan.layer == 0 {
            Vec::new()
        } else {
            let file = LayerFile::open(self.storage.as_ref(), &plan.path)?;
            let header = file.header();
            if header.block_size != self.detector.block_size()
                || header.stack_size != self.stack_size
                || file.trailer().hash_function != self.detector.hash_function()
            {
                return Err(IcpError::format(
                    &plan.path,
                    "base file was written with a different block size, stack size or hash",
                ));
            }
            if file.layers().len() != plan.layer as usize {
                return Err(IcpError::format(
                    &plan.path,
                    format!(
                        "expected {} finalized layers before layer {}, found {}",
                        plan.layer,
                        plan.layer,
                        file.layers().len()
                    ),
                ));
            }
            file.layers().to_vec()
        };

        let mode = if plan.layer == 0 {
            OpenMode::Truncate
        } else {
            OpenMode::Append
        };
        let mut writer = self.storage.open_write(&plan.path, mode)?;
        let start = writer.position()?;

        if plan.layer == 0 {
            let header = FileHeader {
                block_size: self.detector.block_size(),
                stack_size: self.stack_size,
            };
            write_bytes(writer.as_mut(), &plan.path, &header.to_bytes())?;
        }
        let body_offset = writer.position()?;

        let preamble = LayerPreamble {
            checkpoint_id: plan.checkpoint_id,
            var_count: i32::try_from(plan.var_count)
                .map_err(|_| IcpError::config("too many protected variables"))?,
        };
        let preamble = preamble.to_bytes();
        write_bytes(writer.as_mut(), &plan.path, &preamble)?;

        debug!(
            path = %plan.path.display(),
            layer = plan.layer,
            checkpoint_id = plan.checkpoint_id,
            "Opened checkpoint layer"
        );

        self.active = Some(ActiveLayer {
            layer_hash: self.detector.hash_function().streaming(),
            plan,
            writer,
            start,
            body_offset,
            body_written: preamble.len() as u64,
            prior,
            extents: Vec::new(),
            pending: BTreeMap::new(),
            stats: BlockStats::default(),
        });
        Ok(())
    }

    /// Writes one variable: its header at layer 0, then its changed blocks.
    ///
    /// # Errors
    ///
    /// `UnknownVariable` if the layout has no chunks for `id`,
    /// `ConfigOverflow` if the variable cannot be addressed (nothing is
    /// written), or a storage error.
    pub fn write_variable(
        &mut self,
        id: VarId,
        data: &[u8],
        previous: Option<&HashArray>,
        layout: &mut Datastructure,
    ) -> Result<BlockStats> {
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| not_initialized("incremental"))?;
        layout.chunks(id)?;
        self.detector.check_limits(id, data.len() as u64)?;

        let layer = active.plan.layer;
        if layer == 0 {
            let header = VarHeader {
                var_id: id as i32,
                data_size: data.len() as u64,
            };
            write_bytes(active.writer.as_mut(), &active.plan.path, &header.to_bytes())?;
            active.body_written += header.to_bytes().len() as u64;
        }

        let previous = if layer == 0 { None } else { previous };
        let mut sink = BlockSink::new(
            active.writer.as_mut(),
            &active.plan.path,
            &mut active.layer_hash,
            layer > 0,
        );
        let commit = self.detector.commit_variable(&mut sink, id, data, previous);
        active.body_written += sink.written();
        let commit = commit?;

        layout.mark_written(
            id,
            &commit.committed,
            self.detector.block_size(),
            data,
            self.detector.hash_function(),
        )?;

        debug!(
            var_id = id,
            committed = commit.stats.committed_blocks,
            unchanged = commit.stats.unchanged_blocks,
            "Wrote variable"
        );

        active.extents.push(VariableExtent {
            var_id: id,
            size: data.len() as u64,
        });
        active.pending.insert(id, commit.hashes);
        active.stats += commit.stats;
        Ok(commit.stats)
    }

    /// Appends the trailer and syncs the file.
    pub fn finalize(&mut self, layout: &Datastructure) -> Result<FinalizedLayer> {
        let mut active = self
            .active
            .take()
            .ok_or_else(|| not_initialized("incremental"))?;
        let plan = active.plan;

        let summary = LayerSummary {
            layer: plan.layer,
            checkpoint_id: plan.checkpoint_id,
            body_offset: active.body_offset,
            body_size: active.body_written,
            layer_hash: active.layer_hash.finalize(),
            variables: active.extents,
            committed_blocks: active.stats.committed_blocks,
        };
        let mut layers = active.prior;
        layers.push(summary);

        let trailer = LayerTrailer {
            version: TRAILER_VERSION,
            hash_function: self.detector.hash_function(),
            block_size: self.detector.block_size(),
            stack_size: self.stack_size,
            file_id: plan.file_id,
            rank: plan.rank,
            layers,
            datastructure: layout.blocks().to_vec(),
            descriptor_digest: Vec::new(),
        }
        .seal()?;

        write_bytes(active.writer.as_mut(), &plan.path, &trailer.to_bytes()?)?;
        let file_size = active.writer.position()?;
        active.writer.finish()?;

        let stats = LayerStats {
            layer: plan.layer,
            variables: active.pending.len(),
            data_size: active.stats.data_size,
            dcp_size: active.stats.committed_bytes,
            layer_size: file_size - active.start,
            committed_blocks: active.stats.committed_blocks,
            unchanged_blocks: active.stats.unchanged_blocks,
        };

        info!(
            path = %plan.path.display(),
            layer = plan.layer,
            checkpoint_id = plan.checkpoint_id,
            data_size = stats.data_size,
            dcp_size = stats.dcp_size,
            layer_size = stats.layer_size,
            "Finalized checkpoint layer ({:.1}% of data written)",
            stats.dcp_ratio() * 100.0
        );

        Ok(FinalizedLayer {
            path: plan.path,
            layer: plan.layer,
            file_size,
            stats,
            hashes: active.pending,
        })
    }
}

/// Magic bytes closing a full checkpoint file.
pub const FULL_FOOTER_MAGIC: [u8; 4] = *b"ICPF";

/// One variable of a full checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullVariableEntry {
    pub var_id: VarId,
    pub size: u64,
    /// XXHash64 of the variable's bytes.
    pub checksum: u64,
}

/// Metadata at the end of a full checkpoint file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullTrailer {
    pub checkpoint_id: i32,
    pub rank: u32,
    /// Bytes before the trailer.
    pub body_size: u64,
    pub variables: Vec<FullVariableEntry>,
    pub datastructure: Vec<DataBlock>,
}

impl FullTrailer {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = bincode::serialize(self)
            .map_err(|e| IcpError::serialization(format!("failed to encode trailer: {e}")))?;
        let len = u32::try_from(bytes.len())
            .map_err(|_| IcpError::serialization("trailer larger than 4 GiB"))?;
        bytes.extend_from_slice(&len.to_le_bytes());
        bytes.extend_from_slice(&FULL_FOOTER_MAGIC);
        Ok(bytes)
    }

    /// Reads the trailer from the end of a full checkpoint file.
    pub fn from_file_bytes(data: &[u8]) -> Option<Self> {
        let end = data.len().checked_sub(FOOTER_SIZE)?;
        if data[end + 4..] != FULL_FOOTER_MAGIC {
            return None;
        }
        let len = u32::from_le_bytes(data[end..end + 4].try_into().ok()?) as usize;
        let start = end.checked_sub(len)?;
        bincode::deserialize(&data[start..end]).ok()
    }
}

/// XXHash64 checksum of a variable, as stored in full checkpoints.
pub fn variable_checksum(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

struct ActiveFull {
    plan: LayerPlan,
    temp_path: PathBuf,
    writer: Box<dyn StorageWriter>,
    body_end: u64,
    variables: Vec<FullVariableEntry>,
    stats: BlockStats,
}

/// Writes one complete file per checkpoint.
///
/// Every chunk goes to its slot in the layout image, so a variable that only
/// changed size keeps the offsets of its other chunks. The file is written
/// under a temporary name and renamed into place by `finalize`.
pub struct FullWriter {
    storage: Arc<dyn StorageBackend>,
    hash: HashFunction,
    active: Option<ActiveFull>,
}

impl FullWriter {
    pub fn new(storage: Arc<dyn StorageBackend>, config: &IncrementalConfig) -> Self {
        Self {
            storage,
            hash: config.hash_function,
            active: None,
        }
    }

    pub fn initialize(&mut self, plan: LayerPlan) -> Result<()> {
        self.active = None;
        let file_name = plan
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| IcpError::format(&plan.path, "checkpoint path has no file name"))?;
        let temp_path = plan.path.with_file_name(format!(".{file_name}.tmp"));
        let writer = self.storage.open_write(&temp_path, OpenMode::Truncate)?;

        debug!(path = %plan.path.display(), checkpoint_id = plan.checkpoint_id, "Opened full checkpoint");

        self.active = Some(ActiveFull {
            plan,
            temp_path,
            writer,
            body_end: 0,
            variables: Vec::new(),
            stats: BlockStats::default(),
        });
        Ok(())
    }

    pub fn write_variable(
        &mut self,
        id: VarId,
        data: &[u8],
        layout: &mut Datastructure,
    ) -> Result<BlockStats> {
        let active = self.active.as_mut().ok_or_else(|| not_initialized("full"))?;

        let chunks: Vec<(u64, u64, u64)> = layout
            .chunks(id)?
            .iter()
            .filter(|c| c.chunk_size > 0)
            .map(|c| (c.memory_offset, c.chunk_size, c.file_offset))
            .collect();

        let mut written = Vec::with_capacity(chunks.len());
        for (memory_offset, chunk_size, file_offset) in chunks {
            let bytes = data
                .get(memory_offset as usize..(memory_offset + chunk_size) as usize)
                .ok_or_else(|| {
                    IcpError::serialization(format!("variable {id} is smaller than its layout"))
                })?;
            active
                .writer
                .seek(SeekFrom::Start(file_offset))
                .map_err(|e| {
                    IcpError::storage_with_source(&active.temp_path, "failed to seek", e)
                })?;
            write_bytes(active.writer.as_mut(), &active.temp_path, bytes)?;
            active.body_end = active.body_end.max(file_offset + chunk_size);
            written.push(memory_offset);
        }

        // A full checkpoint holds every byte, so every chunk carries content.
        let block_size = data.len().max(1) as u64;
        let all: Vec<u64> = if data.is_empty() { Vec::new() } else { vec![0] };
        layout.mark_written(id, &all, block_size, data, self.hash)?;

        let stats = BlockStats {
            data_size: data.len() as u64,
            committed_bytes: data.len() as u64,
            committed_blocks: written.len() as u64,
            unchanged_blocks: 0,
        };
        active.variables.push(FullVariableEntry {
            var_id: id,
            size: data.len() as u64,
            checksum: variable_checksum(data),
        });
        active.stats += stats;
        Ok(stats)
    }

    pub fn finalize(&mut self, layout: &Datastructure) -> Result<FinalizedLayer> {
        let mut active = self.active.take().ok_or_else(|| not_initialized("full"))?;
        let plan = active.plan;

        let trailer = FullTrailer {
            checkpoint_id: plan.checkpoint_id,
            rank: plan.rank,
            body_size: active.body_end,
            variables: active.variables,
            datastructure: layout.blocks().to_vec(),
        };
        active
            .writer
            .seek(SeekFrom::Start(active.body_end))
            .map_err(|e| IcpError::storage_with_source(&active.temp_path, "failed to seek", e))?;
        write_bytes(active.writer.as_mut(), &active.temp_path, &trailer.to_bytes()?)?;
        let file_size = active.writer.position()?;
        active.writer.finish()?;
        self.storage.rename(&active.temp_path, &plan.path)?;

        let stats = LayerStats {
            layer: 0,
            variables: trailer.variables.len(),
            data_size: active.stats.data_size,
            dcp_size: active.stats.committed_bytes,
            layer_size: file_size,
            committed_blocks: active.stats.committed_blocks,
            unchanged_blocks: 0,
        };
        info!(
            path = %plan.path.display(),
            checkpoint_id = plan.checkpoint_id,
            size = file_size,
            "Finalized full checkpoint"
        );

        Ok(FinalizedLayer {
            path: plan.path,
            layer: 0,
            file_size,
            stats,
            hashes: BTreeMap::new(),
        })
    }
}

/// The writer selected by the session's I/O mode.
pub enum LayerSink {
    Incremental(IncrementalLayerWriter),
    Full(FullWriter),
}

impl LayerSink {
    pub fn for_mode(storage: Arc<dyn StorageBackend>, config: &IncrementalConfig) -> Self {
        match config.mode {
            IoMode::Incremental => Self::Incremental(IncrementalLayerWriter::new(storage, config)),
            IoMode::Full => Self::Full(FullWriter::new(storage, config)),
        }
    }

    pub fn mode(&self) -> IoMode {
        match self {
            Self::Incremental(_) => IoMode::Incremental,
            Self::Full(_) => IoMode::Full,
        }
    }

    pub fn initialize(&mut self, plan: LayerPlan) -> Result<()> {
        match self {
            Self::Incremental(w) => w.initialize(plan),
            Self::Full(w) => w.initialize(plan),
        }
    }

    /// `previous` is ignored by the full writer.
    pub fn write_variable(
        &mut self,
        id: VarId,
        data: &[u8],
        previous: Option<&HashArray>,
        layout: &mut Datastructure,
    ) -> Result<BlockStats> {
        match self {
            Self::Incremental(w) => w.write_variable(id, data, previous, layout),
            Self::Full(w) => w.write_variable(id, data, layout),
        }
    }

    pub fn finalize(&mut self, layout: &Datastructure) -> Result<FinalizedLayer> {
        match self {
            Self::Incremental(w) => w.finalize(layout),
            Self::Full(w) => w.finalize(layout),
        }
    }
}
