//! Error types for siege-state

use thiserror::Error;

use crate::storage_traits::RunStatus;

/// Errors that can occur in the persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// No run with this ID exists
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// Requested status change is not an edge of the run state machine
    #[error("invalid status transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },

    /// Agent results are write-once per run
    #[error("results already recorded for run {run_id}")]
    ResultsAlreadyRecorded { run_id: String },

    /// Sequence number collision on append (backend uniqueness violation)
    #[error("duplicate sequence {seq} for run {run_id}")]
    DuplicateSequence { run_id: String, seq: u64 },

    /// Backend (database) failure
    #[error("storage backend error: {0}")]
    Backend(String),

    /// (De)serialization failure at the storage boundary
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
