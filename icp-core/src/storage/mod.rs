// icp-core/src/storage/mod.rs

//! Storage abstraction for the checkpoint engine.
//!
//! The engine only needs a small contract from a backend: open an object in
//! truncate or append mode, write and seek through the handle, then `finish`
//! it (flush + fsync + close). Reading, listing and deletion are used by
//! recovery and by base-file rotation.
//!
//! # Example
//!
//! ```no_run
//! use icp_core::config::StorageConfig;
//! use icp_core::storage::{LocalStorage, OpenMode, StorageBackend};
//! use std::io::Write;
//! use std::path::Path;
//!
//! let storage = LocalStorage::new(&StorageConfig::default()).unwrap();
//!
//! let mut writer = storage.open_write(Path::new("l1/example.bin"), OpenMode::Truncate).unwrap();
//! writer.write_all(b"Hello, world!").unwrap();
//! writer.finish().unwrap();
//!
//! let mut reader = storage.open_read(Path::new("l1/example.bin")).unwrap();
//! let content = reader.read_all().unwrap();
//! ```

mod local;
mod memory;
mod traits;

pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use traits::{ObjectMeta, OpenMode, StorageBackend, StorageReader, StorageWriter};

use std::sync::Arc;

use crate::config::{StorageBackendType, StorageConfig};
use crate::error::Result;

/// Builds the backend selected by the configuration.
///
/// # Errors
///
/// Returns an error if the backend cannot be initialized.
pub fn build_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    let storage: Arc<dyn StorageBackend> = match config.backend {
        StorageBackendType::Local => Arc::new(LocalStorage::new(config)?),
        StorageBackendType::Memory => Arc::new(MemoryStorage::new()),
    };
    Ok(storage)
}
