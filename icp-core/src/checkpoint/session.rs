// icp-core/src/checkpoint/session.rs

//! Per-rank checkpoint session.
//!
//! The session owns everything that lives from one checkpoint to the next:
//! the layer counter, the variable layout and the hash arrays of the last
//! durable layer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::dedup::DirtySetDetector;
use super::format::{base_file_name, full_file_name, parse_base_file_name, parse_full_file_name};
use super::hashing::HashArray;
use super::layout::Datastructure;
use super::registry::{VarId, VariableRegistry};
use super::writer::{FinalizedLayer, LayerPlan, LayerSink, LayerStats};
use crate::config::{IcpConfig, IncrementalConfig, IoMode};
use crate::error::Result;
use crate::recovery::ResilienceLevel;
use crate::storage::StorageBackend;

/// Record of a successful checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointReceipt {
    pub checkpoint_id: i32,
    pub rank: u32,
    pub file_id: u64,
    pub layer: u32,
    /// Resilience level the file was written to.
    pub level: u8,
    pub path: PathBuf,
    pub file_size: u64,
    pub stats: LayerStats,
}

/// Newest base file of `rank` in `dir`, as `(file_id, path)`.
pub fn latest_base_file(
    storage: &dyn StorageBackend,
    dir: &Path,
    rank: u32,
) -> Result<Option<(u64, PathBuf)>> {
    let newest = storage
        .list(dir)?
        .iter()
        .filter_map(|name| parse_base_file_name(name))
        .filter(|&(_, r)| r == rank)
        .map(|(id, _)| id)
        .max();
    Ok(newest.map(|id| (id, dir.join(base_file_name(id, rank)))))
}

/// Checkpoint state of one rank.
pub struct CheckpointSession {
    storage: Arc<dyn StorageBackend>,
    config: IncrementalConfig,
    rank: u32,
    level: ResilienceLevel,
    dir: PathBuf,
    counter: u64,
    layout: Datastructure,
    hashes: BTreeMap<VarId, HashArray>,
    detector: DirtySetDetector,
    sink: LayerSink,
    last: Option<CheckpointReceipt>,
}

impl CheckpointSession {
    /// Creates a session writing to the configured level's directory.
    ///
    /// File ids continue after the newest base file already present for
    /// this rank, so an existing restart root is never overwritten.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the directory
    /// cannot be created or listed.
    pub fn new(storage: Arc<dyn StorageBackend>, config: &IcpConfig, rank: u32) -> Result<Self> {
        config.validate()?;
        let level = config.incremental.target_level()?;
        let dir = config.levels.dir(level).to_path_buf();
        storage.create_dir_all(&dir)?;

        let next_file_id = latest_base_file(storage.as_ref(), &dir, rank)?
            .map_or(0, |(id, _)| id + 1);
        let counter = next_file_id * u64::from(config.incremental.stack_size);

        info!(
            rank,
            level = %level,
            dir = %dir.display(),
            mode = ?config.incremental.mode,
            block_size = config.incremental.block_size,
            stack_size = config.incremental.stack_size,
            hash = %config.incremental.hash_function,
            next_file_id,
            "Checkpoint session ready"
        );

        Ok(Self {
            sink: LayerSink::for_mode(storage.clone(), &config.incremental),
            detector: DirtySetDetector::from_config(&config.incremental),
            storage,
            config: config.incremental.clone(),
            rank,
            level,
            dir,
            counter,
            layout: Datastructure::new(),
            hashes: BTreeMap::new(),
            last: None,
        })
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn level(&self) -> ResilienceLevel {
        self.level
    }

    pub fn mode(&self) -> IoMode {
        self.sink.mode()
    }

    /// Directory the session writes to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of checkpoints taken, including those of earlier sessions
    /// whose files were found at startup.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// `(file_id, layer)` the next checkpoint will write.
    pub fn next_position(&self) -> (u64, u32) {
        match self.sink.mode() {
            IoMode::Incremental => {
                let stack = u64::from(self.config.stack_size);
                (self.counter / stack, (self.counter % stack) as u32)
            }
            IoMode::Full => (self.counter, 0),
        }
    }

    pub fn layout(&self) -> &Datastructure {
        &self.layout
    }

    /// Hash array of a variable as committed by the last durable layer.
    pub fn hash_array(&self, id: VarId) -> Option<&HashArray> {
        self.hashes.get(&id)
    }

    /// Receipt of the last successful checkpoint.
    pub fn last_receipt(&self) -> Option<&CheckpointReceipt> {
        self.last.as_ref()
    }

    /// Writes one checkpoint of every registered variable.
    ///
    /// On failure the layer counter and hash arrays are left as they were,
    /// so the next call retries the same layer.
    ///
    /// # Errors
    ///
    /// `ConfigOverflow` if any variable cannot be addressed (checked before
    /// anything is written), or the error of the failing write.
    pub fn checkpoint(
        &mut self,
        checkpoint_id: i32,
        registry: &VariableRegistry,
    ) -> Result<CheckpointReceipt> {
        for var in registry.iter() {
            self.detector.check_limits(var.id(), var.size())?;
        }

        let changes = self.layout.update(registry);
        if !changes.is_empty() {
            debug!(rank = self.rank, ?changes, "Variable layout changed");
        }

        let (file_id, layer) = self.next_position();
        let path = match self.sink.mode() {
            IoMode::Incremental => self.dir.join(base_file_name(file_id, self.rank)),
            IoMode::Full => self.dir.join(full_file_name(checkpoint_id, self.rank)),
        };
        let plan = LayerPlan {
            rank: self.rank,
            file_id,
            layer,
            checkpoint_id,
            var_count: registry.len(),
            path,
        };

        let finalized = match self.write_layer(plan, registry) {
            Ok(finalized) => finalized,
            Err(e) => {
                warn!(
                    rank = self.rank,
                    checkpoint_id,
                    file_id,
                    layer,
                    error = %e,
                    "Checkpoint failed; previous layer stays authoritative"
                );
                return Err(e);
            }
        };

        self.hashes = finalized.hashes;
        self.counter += 1;

        if layer == 0 {
            self.remove_stale_files(&finalized.path);
        }

        let receipt = CheckpointReceipt {
            checkpoint_id,
            rank: self.rank,
            file_id,
            layer,
            level: self.level.number(),
            path: finalized.path,
            file_size: finalized.file_size,
            stats: finalized.stats,
        };
        self.last = Some(receipt.clone());
        Ok(receipt)
    }

    fn write_layer(
        &mut self,
        plan: LayerPlan,
        registry: &VariableRegistry,
    ) -> Result<FinalizedLayer> {
        self.sink.initialize(plan)?;
        for var in registry.iter() {
            self.sink.write_variable(
                var.id(),
                var.bytes(),
                self.hashes.get(&var.id()),
                &mut self.layout,
            )?;
        }
        self.sink.finalize(&self.layout)
    }

    /// Deletes this rank's files that the new durable base file supersedes.
    ///
    /// Failures are logged; the checkpoint itself is already durable.
    fn remove_stale_files(&self, current: &Path) {
        let names = match self.storage.list(&self.dir) {
            Ok(names) => names,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Failed to list old checkpoint files");
                return;
            }
        };

        let current_name = current.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        for name in names {
            let stale = match self.sink.mode() {
                IoMode::Incremental => parse_base_file_name(&name)
                    .map_or(false, |(_, rank)| rank == self.rank && name != current_name),
                IoMode::Full => parse_full_file_name(&name)
                    .map_or(false, |(_, rank)| rank == self.rank && name != current_name),
            };
            if !stale {
                continue;
            }
            let path = self.dir.join(&name);
            match self.storage.delete(&path) {
                Ok(()) => info!(path = %path.display(), "Removed superseded checkpoint file"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove old checkpoint file"),
            }
        }
    }
}
