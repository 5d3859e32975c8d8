// icp-core/src/checkpoint/mod.rs

//! Incremental checkpointing of protected variables.
//!
//! This module provides:
//! - A registry of protected variables and their chunked layout
//! - Block-level change detection against the previous layer's digests
//! - Layered base files: a full snapshot at layer 0 followed by layers that
//!   only carry changed blocks, rotated every `stack_size` checkpoints
//! - Verification and byte-exact replay of any finalized layer
//! - A full (non-incremental) mode writing one complete file per checkpoint
//!
//! See [`format`] for the on-disk layout.
//!
//! # Example
//!
//! ```no_run
//! use icp_core::checkpoint::{CheckpointSession, Reconstructor, VariableRegistry};
//! use icp_core::config::IcpConfig;
//! use icp_core::storage::build_storage;
//!
//! let config = IcpConfig::default();
//! let storage = build_storage(&config.storage).unwrap();
//!
//! let mut registry = VariableRegistry::new();
//! registry.protect(0, vec![0u8; 4096], 8);
//!
//! let mut session = CheckpointSession::new(storage.clone(), &config, 0).unwrap();
//! let receipt = session.checkpoint(1, &registry).unwrap();
//!
//! let restored = Reconstructor::new(storage).reconstruct(&receipt.path).unwrap();
//! assert_eq!(restored.variable(0).unwrap(), registry.get(0).unwrap().bytes());
//! ```

pub mod dedup;
pub mod format;
pub mod hashing;
pub mod layout;
pub mod reader;
pub mod reconstruct;
pub mod registry;
pub mod session;
pub mod writer;

pub use dedup::{BlockStats, DirtySetDetector};
pub use format::{BlockMetaRecord, LayerSummary, LayerTrailer, MAX_BLOCK_INDEX, MAX_VAR_ID};
pub use hashing::{HashArray, HashFunction};
pub use layout::{DataBlock, Datastructure, DbVar};
pub use reader::LayerFile;
pub use reconstruct::{read_full_checkpoint, Reconstructor, RestoredState};
pub use registry::{ProtectedVariable, VarId, VariableRegistry};
pub use session::{latest_base_file, CheckpointReceipt, CheckpointSession};
pub use writer::{FullWriter, IncrementalLayerWriter, LayerPlan, LayerSink, LayerStats};
