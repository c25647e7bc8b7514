use crate::session::types::{ClientInfo, PrivilegeType};
use crate::transfer::types::{TransferDirection, TransferProgress, TransferStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Client,
    Portal,
}

impl PeerRole {
    pub fn other(&self) -> PeerRole {
        match self {
            PeerRole::Client => PeerRole::Portal,
            PeerRole::Portal => PeerRole::Client,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Pause,
    Resume,
    Cancel,
}

/// Control-plane envelope catalogue. Every text frame on a peer link is one
/// of these, tagged by `type`; outbound frames additionally carry an
/// ISO-8601 `timestamp`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    // Session plane
    SessionRegister {
        session_id: String,
        role: PeerRole,
    },
    SessionCreate {
        client_id: String,
        technician_id: String,
        client_info: ClientInfo,
    },
    SessionJoin {
        session_id: String,
    },
    SessionTerminate {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    SessionInfo {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<crate::session::types::SessionSummary>,
    },
    SessionRegistered {
        session_id: String,
        role: PeerRole,
    },
    SessionCreated {
        session_id: String,
    },
    SessionJoined {
        session_id: String,
    },
    SessionTerminated {
        session_id: String,
        reason: String,
    },
    SessionExpired {
        session_id: String,
    },

    // Privilege plane
    PrivilegeRequest {
        session_id: String,
        privilege_type: PrivilegeType,
        justification: String,
        duration_secs: i64,
    },
    PrivilegeResponse {
        session_id: String,
        request_id: String,
        approved: bool,
        approver: String,
    },
    PrivilegeRevoke {
        session_id: String,
        privilege_type: PrivilegeType,
    },
    PrivilegeRequested {
        session_id: String,
        request_id: String,
        privilege_type: PrivilegeType,
        justification: String,
        duration_secs: i64,
    },
    PrivilegeApproved {
        session_id: String,
        request_id: String,
        privilege_type: PrivilegeType,
        expires_at: chrono::DateTime<chrono::Utc>,
    },
    PrivilegeDenied {
        session_id: String,
        request_id: String,
        privilege_type: PrivilegeType,
    },
    PrivilegeRevoked {
        session_id: String,
        privilege_type: PrivilegeType,
    },
    PrivilegeExpired {
        session_id: String,
        privilege_type: PrivilegeType,
    },

    // Transfer plane
    FileTransferRequest {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        transfer_id: Option<String>,
        filename: String,
        file_size: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
        direction: TransferDirection,
        #[serde(skip_serializing_if = "Option::is_none")]
        technician_id: Option<String>,
    },
    FileTransferResponse {
        transfer_id: String,
        accepted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    TransferApproval {
        transfer_id: String,
        approved: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    TransferStatusUpdate {
        transfer_id: String,
        status: TransferStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TransferControl {
        transfer_id: String,
        action: ControlAction,
    },
    ControlResponse {
        transfer_id: String,
        action: ControlAction,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ProgressRequest {
        transfer_id: String,
    },
    ProgressResponse {
        transfer_id: String,
        progress: TransferProgress,
    },
    ChunkAck {
        transfer_id: String,
        chunk_index: u32,
    },
    ChunkRetransmissionRequest {
        transfer_id: String,
        chunk_index: u32,
    },

    // Liveness
    Ping,
    Pong,
    Heartbeat,
    HeartbeatResponse,

    // Generic
    Error {
        error: String,
        message: String,
    },
}

impl Envelope {
    /// Serialize with the outbound `timestamp` field attached.
    pub fn to_text(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.insert(
                "timestamp".to_string(),
                serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
            );
        }
        value.to_string()
    }

    /// Parse an inbound text frame. Unknown `type` values come back as
    /// `UnknownType` so the caller can log and drop without disconnecting.
    pub fn parse(text: &str) -> crate::router::error::RouterResult<Envelope> {
        use crate::router::error::RouterError;

        let value: serde_json::Value = serde_json::from_str(text)?;
        let type_name = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| RouterError::BadFrame("missing type field".to_string()))?
            .to_string();

        serde_json::from_value(value).map_err(|e| {
            if e.to_string().starts_with("unknown variant") {
                RouterError::UnknownType(type_name)
            } else {
                RouterError::BadFrame(format!("bad {type_name} envelope: {e}"))
            }
        })
    }

    pub fn error(kind: &str, message: impl Into<String>) -> Envelope {
        Envelope::Error {
            error: kind.to_string(),
            message: message.into(),
        }
    }
}
