use crate::router::envelope::PeerRole;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Malformed frame: {0}")]
    BadFrame(String),

    #[error("No {role:?} peer attached to session {session_id}")]
    PeerUnavailable { session_id: String, role: PeerRole },

    #[error("Peer mailbox closed")]
    PeerGone,

    #[error("Write timed out")]
    WriteTimeout,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RouterError {
    pub fn kind(&self) -> &'static str {
        match self {
            RouterError::UnknownType(_)
            | RouterError::BadFrame(_)
            | RouterError::Serialization(_) => "protocol",
            RouterError::PeerUnavailable { .. } | RouterError::PeerGone => "not_found",
            RouterError::WriteTimeout => "timeout",
        }
    }
}

pub type RouterResult<T> = Result<T, RouterError>;
