use thiserror::Error;

/// Errors that can occur in the patch state layer.
#[derive(Error, Debug)]
pub enum PatchError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("Patch not found: {0}")]
    PatchNotFound(String),

    #[error(
        "Could not acquire lock {path} after {attempts} attempts - another process may be running"
    )]
    LockAcquisition { path: String, attempts: u32 },

    #[error("Could not restore {package_id} before re-applying: {report}")]
    RollbackIncomplete { package_id: String, report: String },

    #[error("Invalid integrity string: {0}")]
    InvalidIntegrity(String),

    #[error("Integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PatchError {
    /// Whether this error came from the cross-process lock.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, PatchError::LockAcquisition { .. })
    }
}
