// icp-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

use crate::checkpoint::VarId;

/// Caller-visible outcome of a checkpoint or recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// The operation completed.
    Success,
    /// This attempt (or this resilience level) is unusable; a lower level or
    /// a later attempt may still work.
    SoftFailure,
    /// Unrecoverable; the caller should abort.
    HardFailure,
}

#[derive(Error, Debug)]
pub enum IcpError {

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration overflow for variable {var_id}: {message}")]
    ConfigOverflow {
        var_id: VarId,
        message: String,
    },

    #[error("Corrupt layer {layer} in '{path}': {message}")]
    CorruptLayer {
        path: PathBuf,
        layer: u32,
        message: String,
    },

    #[error("Variable {id} is not registered")]
    UnknownVariable {
        id: VarId,
    },

    #[error("Variable {id} has no recorded blocks in the replayed layers")]
    VariableNotFound {
        id: VarId,
    },

    #[error("Malformed checkpoint file '{path}': {message}")]
    Format {
        path: PathBuf,
        message: String,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, IcpError>;

// Convenience constructors
impl IcpError {

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn config_overflow(var_id: VarId, message: impl Into<String>) -> Self {
        Self::ConfigOverflow {
            var_id,
            message: message.into(),
        }
    }

    pub fn corrupt_layer(path: impl Into<PathBuf>, layer: u32, message: impl Into<String>) -> Self {
        Self::CorruptLayer {
            path: path.into(),
            layer,
            message: message.into(),
        }
    }

    pub fn unknown_variable(id: VarId) -> Self {
        Self::UnknownVariable { id }
    }

    pub fn variable_not_found(id: VarId) -> Self {
        Self::VariableNotFound { id }
    }

    pub fn format(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Format {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Maps the error onto the status reported to the caller.
    ///
    /// Configuration problems cannot be fixed by retrying or by switching
    /// resilience level; everything else only invalidates the current attempt.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::ConfigOverflow { .. } | Self::Config { .. } => StatusCode::HardFailure,
            Self::Storage { .. }
            | Self::CorruptLayer { .. }
            | Self::UnknownVariable { .. }
            | Self::VariableNotFound { .. }
            | Self::Format { .. }
            | Self::Serialization { .. } => StatusCode::SoftFailure,
        }
    }

    /// Returns true if this is a `CorruptLayer` error.
    pub fn is_corrupt_layer(&self) -> bool {
        matches!(self, Self::CorruptLayer { .. })
    }
}
