use crate::transfer::types::TransferStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Transfer not found: {0}")]
    NotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Operation {op} not valid in state {status:?}")]
    InvalidState { op: &'static str, status: TransferStatus },

    #[error("Concurrent transfer limit reached ({0} active)")]
    LimitExceeded(usize),

    #[error("File size {size} exceeds maximum {max}")]
    SizeExceeded { size: u64, max: u64 },

    #[error("File type blocked: {0}")]
    TypeBlocked(String),

    #[error("Chunk {index} out of range (total {total})")]
    ChunkOutOfRange { index: u32, total: u32 },

    #[error("Malformed chunk: {0}")]
    BadChunk(String),

    #[error("Chunk {index} failed integrity check {attempts} times")]
    RetriesExhausted { index: u32, attempts: u32 },

    #[error("Transfer timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Security error: {0}")]
    Security(#[from] crate::security::SecurityError),

    #[error("Router error: {0}")]
    Router(#[from] crate::router::RouterError),
}

impl TransferError {
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::NotFound(_) | TransferError::SessionNotFound(_) => "not_found",
            TransferError::InvalidState { .. } => "invalid_state",
            TransferError::LimitExceeded(_) => "limit_exceeded",
            TransferError::SizeExceeded { .. } | TransferError::TypeBlocked(_) => "blocked",
            TransferError::ChunkOutOfRange { .. } | TransferError::BadChunk(_) => "protocol",
            TransferError::RetriesExhausted { .. } => "integrity",
            TransferError::Timeout(_) => "timeout",
            TransferError::Io(_) => "io",
            TransferError::Security(e) => e.kind(),
            TransferError::Router(e) => e.kind(),
        }
    }
}

pub type TransferResult<T> = Result<T, TransferError>;
