// icp-core/src/recovery/files.rs

//! Where each level keeps its files.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::ResilienceLevel;
use crate::checkpoint::format::base_file_name;
use crate::config::LevelDirs;
use crate::error::{IcpError, Result};
use crate::storage::{OpenMode, StorageBackend};

/// File naming for every resilience level.
#[derive(Debug, Clone, Default)]
pub struct LevelFiles {
    dirs: LevelDirs,
}

impl LevelFiles {
    pub fn new(dirs: LevelDirs) -> Self {
        Self { dirs }
    }

    pub fn dirs(&self) -> &LevelDirs {
        &self.dirs
    }

    /// A rank's own base file at `level`.
    pub fn own_path(&self, level: ResilienceLevel, file_id: u64, rank: u32) -> PathBuf {
        self.dirs.dir(level).join(base_file_name(file_id, rank))
    }

    /// Copy of `owner`'s base file, held by its right neighbour.
    pub fn partner_copy_path(&self, file_id: u64, owner: u32) -> PathBuf {
        self.dirs
            .partner
            .join(format!("dcp-id{file_id}-rank{owner}.partner.icp"))
    }

    /// Redundancy file a rank contributes to its erasure group.
    pub fn erasure_path(&self, file_id: u64, rank: u32) -> PathBuf {
        self.dirs.erasure.join(format!("rs-id{file_id}-rank{rank}.icp"))
    }

    /// Copies a rank's base file from one level to another.
    pub fn replicate(
        &self,
        storage: &dyn StorageBackend,
        from: ResilienceLevel,
        to: ResilienceLevel,
        file_id: u64,
        rank: u32,
    ) -> Result<u64> {
        copy_object(
            storage,
            &self.own_path(from, file_id, rank),
            &self.own_path(to, file_id, rank),
        )
    }

    /// Places the partner copy of `owner`'s local base file.
    pub fn stage_partner_copy(
        &self,
        storage: &dyn StorageBackend,
        file_id: u64,
        owner: u32,
    ) -> Result<u64> {
        copy_object(
            storage,
            &self.own_path(ResilienceLevel::Local, file_id, owner),
            &self.partner_copy_path(file_id, owner),
        )
    }
}

/// Copies an object within a backend, returning the bytes copied.
pub fn copy_object(storage: &dyn StorageBackend, from: &Path, to: &Path) -> Result<u64> {
    let data = storage.open_read(from)?.read_all()?;
    let mut writer = storage.open_write(to, OpenMode::Truncate)?;
    writer
        .write_all(&data)
        .map_err(|e| IcpError::storage_with_source(to, "failed to write copy", e))?;
    writer.finish()?;
    debug!(from = %from.display(), to = %to.display(), bytes = data.len(), "Copied checkpoint file");
    Ok(data.len() as u64)
}
