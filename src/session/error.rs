use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Privilege request not found: {0}")]
    RequestNotFound(String),

    #[error("Session limit reached ({0} active)")]
    LimitExceeded(usize),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Privilege type {0} is not allowed")]
    PrivilegeNotAllowed(String),

    #[error("Privilege {0} is already active")]
    PrivilegeAlreadyActive(String),

    #[error("Justification too short: need at least {min} characters, got {got}")]
    JustificationTooShort { min: usize, got: usize },

    #[error("Privilege escalation is disabled")]
    EscalationDisabled,
}

impl SessionError {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::NotFound(_) | SessionError::RequestNotFound(_) => "not_found",
            SessionError::LimitExceeded(_) => "limit_exceeded",
            SessionError::InvalidState(_) => "invalid_state",
            SessionError::PrivilegeNotAllowed(_) | SessionError::EscalationDisabled => {
                "unauthorized"
            }
            SessionError::PrivilegeAlreadyActive(_) => "already_exists",
            SessionError::JustificationTooShort { .. } => "blocked",
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
