//! Error taxonomy for the reservation engine.
//!
//! `Conflict` and `Expired` are expected business outcomes and travel back to
//! the caller unchanged. `Busy` means row-lock contention and may be retried a
//! bounded number of times. `LedgerCorruption` is a defect signal: it is never
//! retried and never clamped away.

use uuid::Uuid;

use crate::PlacementType;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {resource} {id}")]
    NotFound { resource: &'static str, id: String },

    /// Capacity exhausted. Callers must not retry; the slot is simply gone.
    #[error("not enough inventory: {remaining} slot(s) remaining")]
    Conflict { remaining: i32 },

    /// A concurrent writer holds the counter row lock.
    #[error("inventory row is locked by a concurrent writer")]
    Busy,

    #[error("reservation is no longer active")]
    Expired,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("alert transition not allowed from '{from}'")]
    InvalidTransition { from: String },

    /// A counter would go negative or exceed its total. Signals a bug or a
    /// manual data edit upstream; the operation halts, other rows proceed.
    #[error("ledger corruption on episode {episode_id} {placement}: {message}")]
    LedgerCorruption {
        episode_id: Uuid,
        placement: PlacementType,
        message: String,
    },

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),
}

impl EngineError {
    pub fn not_found(resource: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }
}
