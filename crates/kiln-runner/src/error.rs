//! Error types for build execution.

use kiln_core::{KilnError, StoreError};
use kiln_state::StorageError;

/// A driver could not be instantiated or could not bring up its
/// environment.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("no driver registered for type {0:?}")]
    Unsupported(String),

    #[error("invalid driver option {key}: {value:?}")]
    Option { key: String, value: String },

    #[error("driver setup failed: {0}")]
    Setup(String),

    #[error("driver is not created")]
    NotCreated,

    #[error("placing {name}: {source}")]
    Place {
        name: String,
        #[source]
        source: TransferError,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Moving a blob between a build environment and the store.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transfer task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl TransferError {
    /// Whether the blob or its row does not exist.
    pub fn is_not_exist(&self) -> bool {
        match self {
            TransferError::Store(e) => e.is_not_exist(),
            TransferError::Storage(e) => e.is_not_found(),
            TransferError::Task(_) => false,
        }
    }
}

/// Failures of the worker around a build run. Job failures are statuses,
/// not errors.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Kiln(#[from] KilnError),
}

pub type Result<T> = std::result::Result<T, RunnerError>;
