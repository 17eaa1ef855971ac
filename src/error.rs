//! Error taxonomy (spec.md §7).
//!
//! Not tied to any one module: `ValidationError`, `ConflictError`,
//! `ProviderError`, `IntegrityError`, and `StorageError` map directly onto
//! spec.md's categories. `GateBlocked` deliberately has no variant here - a
//! blocked gate is an expected outcome (spec.md §7), carried as data in
//! `GateResult`/`CommitResult`/`ExecuteResult`, never raised as an error.
//!
//! Follows the teacher's manual `Display` + `std::error::Error` + `From`
//! style (see `ArtifactStoreError`, `BookError`) rather than `thiserror`,
//! which the teacher never depends on.

use std::fmt;

#[derive(Debug)]
pub enum PspError {
    /// Bad inputs, unknown purpose, malformed payload - no retry.
    Validation(String),
    /// Idempotency replay with divergent inputs, or an illegal state
    /// transition - caller sees prior result or explicit refusal.
    Conflict(String),
    /// Rail submission failure or timeout.
    Provider(String),
    /// Double-entry imbalance, missing account - fatal for the posting,
    /// never swallowed.
    Integrity(String),
    /// Database unavailable - caller retries at operation granularity.
    Storage(String),
}

impl fmt::Display for PspError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PspError::Validation(msg) => write!(f, "validation error: {msg}"),
            PspError::Conflict(msg) => write!(f, "conflict: {msg}"),
            PspError::Provider(msg) => write!(f, "provider error: {msg}"),
            PspError::Integrity(msg) => write!(f, "integrity error: {msg}"),
            PspError::Storage(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for PspError {}

impl From<rusqlite::Error> for PspError {
    fn from(e: rusqlite::Error) -> Self {
        PspError::Storage(e.to_string())
    }
}

pub type PspResult<T> = Result<T, PspError>;
