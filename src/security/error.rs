use thiserror::Error;

#[derive(Error, Debug)]
pub enum SecurityError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("File blocked: {0}")]
    Blocked(String),

    #[error("File not found: {0}")]
    NotFound(String),
}

impl SecurityError {
    /// Wire-level error kind for `error {error, message}` envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            SecurityError::Io(_) => "io",
            SecurityError::InvalidKeyLength(_) => "encryption",
            SecurityError::Encryption(_) | SecurityError::Decryption(_) => "encryption",
            SecurityError::ChecksumMismatch { .. } => "integrity",
            SecurityError::Blocked(_) => "blocked",
            SecurityError::NotFound(_) => "not_found",
        }
    }
}

pub type SecurityResult<T> = Result<T, SecurityError>;
