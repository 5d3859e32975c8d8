// icp-core/src/lib.rs

//! Incremental multi-level checkpoint engine - Core Library
//!
//! This crate provides incremental checkpointing of registered memory
//! regions, including block-level deduplication into layered base files,
//! verification and reconstruction of any finalized layer, and the vote
//! protocol a group of ranks uses to decide which resilience level it can
//! recover from.

pub mod config;
pub mod error;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::{IcpConfig, IncrementalConfig, IoMode, LevelDirs};
pub use error::{IcpError, Result, StatusCode};
pub use storage::{
    build_storage, LocalStorage, MemoryStorage, ObjectMeta, OpenMode, StorageBackend,
    StorageReader, StorageWriter,
};

pub mod checkpoint;
pub use checkpoint::{
    CheckpointReceipt, CheckpointSession, HashFunction, LayerFile, Reconstructor, RestoredState,
    VarId, VariableRegistry,
};

pub mod recovery;
pub use recovery::{
    Expectation, GroupExchange, InProcessGroup, LevelValidator, RecoveryReport, ResilienceLevel,
    SoloExchange, Verdict,
};
