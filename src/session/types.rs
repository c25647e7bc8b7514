use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientInfo {
    pub hostname: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Active,
    Disconnected,
    Terminated,
    Expired,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Terminated | SessionStatus::Expired)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeType {
    Admin,
    Elevated,
    Registry,
    Services,
    Network,
}

impl PrivilegeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivilegeType::Admin => "admin",
            PrivilegeType::Elevated => "elevated",
            PrivilegeType::Registry => "registry",
            PrivilegeType::Services => "services",
            PrivilegeType::Network => "network",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeRequestStatus {
    Pending,
    Approved,
    Denied,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivilegeRequest {
    pub id: String,
    pub privilege_type: PrivilegeType,
    pub justification: String,
    /// Duration after clamping to the configured maximum.
    pub effective_duration_secs: i64,
    pub requested_at: DateTime<Utc>,
    pub status: PrivilegeRequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivePrivilege {
    pub privilege_type: PrivilegeType,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub granted_by: String,
}

impl ActivePrivilege {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStats {
    pub messages_routed: u64,
    pub bytes_transferred: u64,
    pub transfers_started: u64,
    pub transfers_completed: u64,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub client_id: String,
    pub technician_id: String,
    pub client_info: ClientInfo,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub stats: SessionStats,
    pub privilege_requests: Vec<PrivilegeRequest>,
    pub active_privileges: HashMap<PrivilegeType, ActivePrivilege>,
}

impl Session {
    pub fn new(client_id: String, technician_id: String, client_info: ClientInfo) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            client_id,
            technician_id,
            client_info,
            status: SessionStatus::Pending,
            start_time: now,
            last_activity: now,
            end_time: None,
            stats: SessionStats::default(),
            privilege_requests: Vec::new(),
            active_privileges: HashMap::new(),
        }
    }

    /// `last_activity` only ever moves forward.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    pub fn is_expired(
        &self,
        now: DateTime<Utc>,
        session_timeout: chrono::Duration,
        idle_timeout: chrono::Duration,
    ) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        now > self.start_time + session_timeout || now > self.last_activity + idle_timeout
    }

    pub fn request_mut(&mut self, request_id: &str) -> Option<&mut PrivilegeRequest> {
        self.privilege_requests
            .iter_mut()
            .find(|r| r.id == request_id)
    }
}

/// Read-only view handed out over the API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub session_id: String,
    pub client_id: String,
    pub technician_id: String,
    pub client_info: ClientInfo,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub stats: SessionStats,
    pub pending_privilege_requests: usize,
    pub active_privileges: Vec<ActivePrivilege>,
}

impl SessionSummary {
    pub fn from_session(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            client_id: session.client_id.clone(),
            technician_id: session.technician_id.clone(),
            client_info: session.client_info.clone(),
            status: session.status,
            start_time: session.start_time,
            last_activity: session.last_activity,
            end_time: session.end_time,
            stats: session.stats,
            pending_privilege_requests: session
                .privilege_requests
                .iter()
                .filter(|r| r.status == PrivilegeRequestStatus::Pending)
                .count(),
            active_privileges: session.active_privileges.values().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(!SessionStatus::Pending.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
        assert!(!SessionStatus::Disconnected.is_terminal());
        assert!(SessionStatus::Terminated.is_terminal());
        assert!(SessionStatus::Expired.is_terminal());
    }

    #[test]
    fn test_expiry_windows() {
        let mut session = Session::new("c".into(), "t".into(), ClientInfo::default());
        let session_timeout = chrono::Duration::hours(4);
        let idle_timeout = chrono::Duration::minutes(30);

        let now = Utc::now();
        assert!(!session.is_expired(now, session_timeout, idle_timeout));

        // Idle past the window.
        assert!(session.is_expired(
            now + chrono::Duration::minutes(31),
            session_timeout,
            idle_timeout
        ));

        // Terminal sessions never report expired.
        session.status = SessionStatus::Terminated;
        assert!(!session.is_expired(
            now + chrono::Duration::hours(10),
            session_timeout,
            idle_timeout
        ));
    }

    #[test]
    fn test_privilege_expiry() {
        let now = Utc::now();
        let privilege = ActivePrivilege {
            privilege_type: PrivilegeType::Elevated,
            granted_at: now,
            expires_at: now + chrono::Duration::seconds(60),
            granted_by: "end-user".into(),
        };
        assert!(!privilege.is_expired(now + chrono::Duration::seconds(59)));
        assert!(privilege.is_expired(now + chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_summary_counts_pending_requests() {
        let mut session = Session::new("c".into(), "t".into(), ClientInfo::default());
        session.privilege_requests.push(PrivilegeRequest {
            id: "r1".into(),
            privilege_type: PrivilegeType::Admin,
            justification: "disk diagnostics".into(),
            effective_duration_secs: 600,
            requested_at: Utc::now(),
            status: PrivilegeRequestStatus::Pending,
            approver: None,
            approved_at: None,
        });

        let summary = SessionSummary::from_session(&session);
        assert_eq!(summary.pending_privilege_requests, 1);
        assert!(summary.active_privileges.is_empty());
    }
}
