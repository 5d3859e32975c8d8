// icp-core/src/checkpoint/layout.rs

//! Data layout of protected variables.
//!
//! Every variable is described by a chain of chunks. A chunk is a slice of
//! the variable's bytes (`memory_offset..memory_offset + chunk_size`) with a
//! reserved slot of `container_size` bytes at `file_offset` in the logical
//! image of all variables. The chunks created by one update are grouped into
//! one [`DataBlock`]; blocks are appended to an arena and never reordered,
//! so file offsets only grow.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::hashing::HashFunction;
use super::registry::{VarId, VariableRegistry};
use crate::error::{IcpError, Result};

/// One chunk of a variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbVar {
    pub var_id: VarId,
    /// Position of this chunk in the variable's chain.
    pub container_id: u32,
    /// Bytes reserved for this chunk.
    pub container_size: u64,
    /// Bytes currently used; 0 when the variable is no longer protected.
    pub chunk_size: u64,
    pub memory_offset: u64,
    pub file_offset: u64,
    /// Bytes of this chunk were written by the current layer.
    pub has_content: bool,
    pub content_hash: Option<Vec<u8>>,
}

impl DbVar {
    fn memory_range(&self) -> std::ops::Range<u64> {
        self.memory_offset..self.memory_offset + self.chunk_size
    }
}

/// Chunks created by one layout update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBlock {
    pub id: u32,
    pub vars: Vec<DbVar>,
    /// Sum of the container sizes of `vars`.
    pub byte_count: u64,
}

/// What an update changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayoutChanges {
    pub added: usize,
    pub grown: usize,
    pub shrunk: usize,
    pub removed: usize,
}

impl LayoutChanges {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Arena of data blocks describing all variables ever protected.
#[derive(Debug, Clone, Default)]
pub struct Datastructure {
    blocks: Vec<DataBlock>,
    end_offset: u64,
}

impl Datastructure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a layout from the blocks stored in a checkpoint file.
    pub fn from_blocks(blocks: Vec<DataBlock>) -> Self {
        let end_offset = blocks
            .iter()
            .flat_map(|b| &b.vars)
            .map(|v| v.file_offset + v.container_size)
            .max()
            .unwrap_or(0);
        Self { blocks, end_offset }
    }

    pub fn blocks(&self) -> &[DataBlock] {
        &self.blocks
    }

    /// End of the last reserved slot.
    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    /// Brings the layout in line with the registry.
    ///
    /// Growth reuses trimmed capacity first, then appends a chunk for the
    /// difference; shrinking trims chunks from the tail of the chain;
    /// variables missing from the registry keep their chunks with a size
    /// of zero. Content flags of every chunk are cleared.
    pub fn update(&mut self, registry: &VariableRegistry) -> LayoutChanges {
        let mut changes = LayoutChanges::default();
        let mut fresh: Vec<DbVar> = Vec::new();

        for chunk in self.blocks.iter_mut().flat_map(|b| b.vars.iter_mut()) {
            chunk.has_content = false;
            chunk.content_hash = None;
        }

        for var in registry.iter() {
            let size = var.size();
            let mut chain: Vec<&mut DbVar> = self
                .blocks
                .iter_mut()
                .flat_map(|b| b.vars.iter_mut())
                .filter(|c| c.var_id == var.id())
                .collect();

            if chain.is_empty() {
                fresh.push(DbVar {
                    var_id: var.id(),
                    container_id: 0,
                    container_size: size,
                    chunk_size: size,
                    memory_offset: 0,
                    file_offset: self.end_offset,
                    has_content: false,
                    content_hash: None,
                });
                self.end_offset += size;
                changes.added += 1;
                continue;
            }

            let previous: u64 = chain.iter().map(|c| c.chunk_size).sum();
            let capacity: u64 = chain.iter().map(|c| c.container_size).sum();
            let mut remaining = size;
            for chunk in chain.iter_mut() {
                chunk.chunk_size = remaining.min(chunk.container_size);
                remaining -= chunk.chunk_size;
            }

            if remaining > 0 {
                fresh.push(DbVar {
                    var_id: var.id(),
                    container_id: chain.len() as u32,
                    container_size: remaining,
                    chunk_size: remaining,
                    memory_offset: capacity,
                    file_offset: self.end_offset,
                    has_content: false,
                    content_hash: None,
                });
                self.end_offset += remaining;
            }

            if size > previous {
                changes.grown += 1;
            } else if size < previous {
                changes.shrunk += 1;
            }
        }

        let live: BTreeSet<VarId> = registry.iter().map(|v| v.id()).collect();
        let mut removed = BTreeSet::new();
        for chunk in self.blocks.iter_mut().flat_map(|b| b.vars.iter_mut()) {
            if !live.contains(&chunk.var_id) && chunk.chunk_size > 0 {
                chunk.chunk_size = 0;
                removed.insert(chunk.var_id);
            }
        }
        changes.removed = removed.len();

        if !fresh.is_empty() {
            self.blocks.push(DataBlock {
                id: self.blocks.len() as u32,
                byte_count: fresh.iter().map(|c| c.container_size).sum(),
                vars: fresh,
            });
        }

        changes
    }

    /// Chunks of a variable, in chain order.
    ///
    /// # Errors
    ///
    /// Returns `UnknownVariable` if the variable was never laid out.
    pub fn chunks(&self, id: VarId) -> Result<Vec<&DbVar>> {
        let mut chain: Vec<&DbVar> = self
            .blocks
            .iter()
            .flat_map(|b| &b.vars)
            .filter(|c| c.var_id == id)
            .collect();
        if chain.is_empty() {
            return Err(IcpError::unknown_variable(id));
        }
        chain.sort_by_key(|c| c.container_id);
        Ok(chain)
    }

    /// Current size of a variable.
    pub fn variable_size(&self, id: VarId) -> Result<u64> {
        Ok(self.chunks(id)?.iter().map(|c| c.chunk_size).sum())
    }

    pub fn contains(&self, id: VarId) -> bool {
        self.blocks.iter().flat_map(|b| &b.vars).any(|c| c.var_id == id)
    }

    /// Marks the chunks of `id` overlapping any committed block as holding
    /// content of the current layer and records their digest.
    ///
    /// `data` is the variable's full byte content.
    pub fn mark_written(
        &mut self,
        id: VarId,
        committed: &[u64],
        block_size: u64,
        data: &[u8],
        hash: HashFunction,
    ) -> Result<()> {
        if !self.contains(id) {
            return Err(IcpError::unknown_variable(id));
        }
        for chunk in self
            .blocks
            .iter_mut()
            .flat_map(|b| b.vars.iter_mut())
            .filter(|c| c.var_id == id && c.chunk_size > 0)
        {
            let range = chunk.memory_range();
            let touched = committed.iter().any(|&block| {
                let start = block * block_size;
                start < range.end && range.start < start + block_size
            });
            if touched {
                let bytes = data
                    .get(range.start as usize..range.end as usize)
                    .ok_or_else(|| {
                        IcpError::serialization(format!(
                            "variable {id} is smaller than its layout ({} < {})",
                            data.len(),
                            range.end
                        ))
                    })?;
                chunk.has_content = true;
                chunk.content_hash = Some(hash.digest(bytes));
            }
        }
        Ok(())
    }
}
