use thiserror::Error;

use crate::chain::ChainError;
use crate::digest::Digest;
use crate::generation::GenerationError;
use crate::ledger::ProofStatus;

#[derive(Error, Debug)]
pub enum ProofError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("AI service error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Local ledger error: {0}")]
    Ledger(#[from] sqlx::Error),

    #[error("Ledger migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Proof not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition for {digest}: {from} -> {to}")]
    InvalidTransition {
        digest: Digest,
        from: ProofStatus,
        to: ProofStatus,
    },

    #[error("Corrupt ledger row: {0}")]
    CorruptRecord(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, ProofError>;
