// icp-core/src/checkpoint/reader.rs

//! Parsing and verification of layered base files.

use std::ops::Range;
use std::path::{Path, PathBuf};

use super::format::{
    locate_trailer, BlockMetaRecord, FileHeader, LayerPreamble, LayerSummary, LayerTrailer,
    VarHeader, FILE_HEADER_SIZE, LAYER_PREAMBLE_SIZE, META_RECORD_SIZE, VAR_HEADER_SIZE,
};
use super::registry::VarId;
use crate::error::{IcpError, Result};
use crate::storage::StorageBackend;

/// A block recorded by a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRef {
    pub var_id: VarId,
    pub block_id: u64,
    /// Location of the padded block within the file.
    pub range: Range<usize>,
}

/// A layer whose hash has been verified.
#[derive(Debug, Clone)]
pub struct VerifiedLayer {
    pub summary: LayerSummary,
    pub blocks: Vec<BlockRef>,
}

/// A base file loaded into memory, positioned on its newest valid trailer.
#[derive(Debug)]
pub struct LayerFile {
    path: PathBuf,
    data: Vec<u8>,
    header: FileHeader,
    trailer: LayerTrailer,
}

impl LayerFile {
    /// Reads a base file through the storage backend.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the file cannot be read and a format error
    /// if it carries no valid header or trailer.
    pub fn open(storage: &dyn StorageBackend, path: &Path) -> Result<Self> {
        let mut reader = storage.open_read(path)?;
        let data = reader.read_all()?;
        Self::from_bytes(path, data)
    }

    pub fn from_bytes(path: impl Into<PathBuf>, data: Vec<u8>) -> Result<Self> {
        let path = path.into();
        let header = FileHeader::from_bytes(&data)
            .ok_or_else(|| IcpError::format(&path, "file is shorter than its header"))?;
        let (trailer, _) = locate_trailer(&data)
            .ok_or_else(|| IcpError::format(&path, "no finalized layer found"))?;

        if trailer.block_size != header.block_size || trailer.stack_size != header.stack_size {
            return Err(IcpError::format(
                &path,
                format!(
                    "header ({} / {}) disagrees with trailer ({} / {})",
                    header.block_size, header.stack_size, trailer.block_size, trailer.stack_size
                ),
            ));
        }
        if header.block_size == 0 {
            return Err(IcpError::format(&path, "block size is zero"));
        }
        if trailer.layers.is_empty() {
            return Err(IcpError::format(&path, "trailer lists no layers"));
        }

        Ok(Self {
            path,
            data,
            header,
            trailer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> FileHeader {
        self.header
    }

    pub fn trailer(&self) -> &LayerTrailer {
        &self.trailer
    }

    pub fn layers(&self) -> &[LayerSummary] {
        &self.trailer.layers
    }

    /// Summary of the newest finalized layer.
    pub fn newest(&self) -> &LayerSummary {
        // `from_bytes` rejects trailers without layers.
        &self.trailer.layers[self.trailer.layers.len() - 1]
    }

    pub fn file_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Bytes of a block returned by [`verify_layer`](Self::verify_layer).
    pub fn block_bytes(&self, block: &BlockRef) -> &[u8] {
        &self.data[block.range.clone()]
    }

    fn corrupt(&self, layer: u32, message: impl Into<String>) -> IcpError {
        IcpError::corrupt_layer(&self.path, layer, message)
    }

    /// Re-reads a layer's body and checks it against its summary.
    ///
    /// # Errors
    ///
    /// Returns `CorruptLayer` if the layer is missing from the trailer, its
    /// body cannot be parsed, or its recomputed hash differs.
    pub fn verify_layer(&self, layer: u32) -> Result<VerifiedLayer> {
        let summary = self
            .trailer
            .layers
            .get(layer as usize)
            .filter(|s| s.layer == layer)
            .ok_or_else(|| self.corrupt(layer, "layer is not listed in the trailer"))?;

        let start = usize::try_from(summary.body_offset).unwrap_or(usize::MAX);
        let end = usize::try_from(summary.body_offset.saturating_add(summary.body_size))
            .unwrap_or(usize::MAX);
        if end > self.data.len() || start < FILE_HEADER_SIZE || start > end {
            return Err(self.corrupt(layer, "layer body lies outside the file"));
        }

        let preamble = LayerPreamble::from_bytes(&self.data[start..end])
            .ok_or_else(|| self.corrupt(layer, "layer body is shorter than its preamble"))?;
        if preamble.checkpoint_id != summary.checkpoint_id {
            return Err(self.corrupt(
                layer,
                format!(
                    "preamble checkpoint id {} does not match {}",
                    preamble.checkpoint_id, summary.checkpoint_id
                ),
            ));
        }
        if usize::try_from(preamble.var_count).ok() != Some(summary.variables.len()) {
            return Err(self.corrupt(
                layer,
                format!(
                    "preamble lists {} variables, trailer {}",
                    preamble.var_count,
                    summary.variables.len()
                ),
            ));
        }

        let block_size = self.header.block_size as usize;
        let mut pos = start + LAYER_PREAMBLE_SIZE;
        let blocks = if layer == 0 {
            self.parse_full_body(summary, &mut pos, end, block_size)?
        } else {
            self.parse_delta_body(summary, &mut pos, end, block_size)?
        };

        let hash = self.trailer.hash_function;
        let mut layer_hash = hash.streaming();
        for block in &blocks {
            layer_hash.update_block(
                block.var_id,
                block.block_id,
                &hash.digest(self.block_bytes(block)),
            );
        }
        let computed = layer_hash.finalize();
        if computed != summary.layer_hash {
            return Err(self.corrupt(
                layer,
                format!(
                    "layer hash mismatch: stored {}, computed {}",
                    hex::encode(&summary.layer_hash),
                    hex::encode(&computed)
                ),
            ));
        }
        if blocks.len() as u64 != summary.committed_blocks {
            return Err(self.corrupt(
                layer,
                format!(
                    "found {} blocks, trailer records {}",
                    blocks.len(),
                    summary.committed_blocks
                ),
            ));
        }

        Ok(VerifiedLayer {
            summary: summary.clone(),
            blocks,
        })
    }

    fn parse_full_body(
        &self,
        summary: &LayerSummary,
        pos: &mut usize,
        end: usize,
        block_size: usize,
    ) -> Result<Vec<BlockRef>> {
        let layer = summary.layer;
        let mut blocks = Vec::new();
        for extent in &summary.variables {
            let header = self
                .data
                .get(*pos..end)
                .and_then(VarHeader::from_bytes)
                .ok_or_else(|| self.corrupt(layer, "truncated variable header"))?;
            if i64::from(header.var_id) != i64::from(extent.var_id)
                || header.data_size != extent.size
            {
                return Err(self.corrupt(
                    layer,
                    format!(
                        "variable header ({}, {} bytes) does not match ({}, {} bytes)",
                        header.var_id, header.data_size, extent.var_id, extent.size
                    ),
                ));
            }
            *pos += VAR_HEADER_SIZE;

            let count = header.data_size.div_ceil(block_size as u64) as usize;
            for block_id in 0..count {
                let range = *pos..*pos + block_size;
                if range.end > end {
                    return Err(self.corrupt(
                        layer,
                        format!("variable {} is truncated", extent.var_id),
                    ));
                }
                blocks.push(BlockRef {
                    var_id: extent.var_id,
                    block_id: block_id as u64,
                    range,
                });
                *pos += block_size;
            }
        }
        if *pos != end {
            return Err(self.corrupt(layer, "unexpected bytes after the last variable"));
        }
        Ok(blocks)
    }

    fn parse_delta_body(
        &self,
        summary: &LayerSummary,
        pos: &mut usize,
        end: usize,
        block_size: usize,
    ) -> Result<Vec<BlockRef>> {
        let layer = summary.layer;
        let record = META_RECORD_SIZE + block_size;
        if (end - *pos) % record != 0 {
            return Err(self.corrupt(
                layer,
                format!("body of {} bytes is not a whole number of blocks", end - *pos),
            ));
        }

        let mut blocks = Vec::with_capacity((end - *pos) / record);
        while *pos < end {
            let meta = BlockMetaRecord::from_bytes(&self.data[*pos..end])
                .ok_or_else(|| self.corrupt(layer, "truncated block meta record"))?;
            let extent = summary.extent(meta.var_id).ok_or_else(|| {
                self.corrupt(
                    layer,
                    format!("block refers to unknown variable {}", meta.var_id),
                )
            })?;
            if meta.block_id >= extent.size.div_ceil(block_size as u64) {
                return Err(self.corrupt(
                    layer,
                    format!(
                        "block {} lies beyond variable {} ({} bytes)",
                        meta.block_id, meta.var_id, extent.size
                    ),
                ));
            }
            let data_start = *pos + META_RECORD_SIZE;
            blocks.push(BlockRef {
                var_id: meta.var_id,
                block_id: meta.block_id,
                range: data_start..data_start + block_size,
            });
            *pos += record;
        }
        Ok(blocks)
    }

    /// Verifies every layer, in order.
    pub fn verify_all(&self) -> Vec<(u32, Result<VerifiedLayer>)> {
        (0..self.trailer.layers.len() as u32)
            .map(|layer| (layer, self.verify_layer(layer)))
            .collect()
    }
}
