use crate::audit::{AuditEvent, AuditLogger, Severity};
use crate::config::ConfigHandle;
use crate::router::envelope::{Envelope, PeerRole};
use crate::router::registry::Registry;
use crate::session::error::{SessionError, SessionResult};
use crate::session::types::{
    ActivePrivilege, ClientInfo, PrivilegeRequest, PrivilegeRequestStatus, PrivilegeType, Session,
    SessionStatus, SessionSummary,
};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Outcome of one cleanup pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    pub expired_sessions: usize,
    pub expired_privileges: usize,
    pub purged_sessions: usize,
}

/// Grace window before terminal sessions are dropped from the map.
const PURGE_GRACE_SECS: i64 = 3600;

pub struct SessionManager {
    sessions: DashMap<String, Arc<RwLock<Session>>>,
    config: Arc<ConfigHandle>,
    audit: Arc<AuditLogger>,
    registry: Arc<Registry>,
}

impl SessionManager {
    pub fn new(config: Arc<ConfigHandle>, audit: Arc<AuditLogger>, registry: Arc<Registry>) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            audit,
            registry,
        }
    }

    pub fn create_session(
        &self,
        client_id: &str,
        technician_id: &str,
        client_info: ClientInfo,
    ) -> SessionResult<String> {
        let max = self
            .config
            .snapshot()
            .remote_access
            .max_concurrent_sessions;
        let active = self.active_session_count();
        if active >= max {
            return Err(SessionError::LimitExceeded(active));
        }

        let session = Session::new(client_id.to_string(), technician_id.to_string(), client_info);
        let session_id = session.id.clone();

        self.audit.log(
            AuditEvent::new("session_created")
                .session(&session_id)
                .user(client_id)
                .technician(technician_id),
        );
        self.sessions
            .insert(session_id.clone(), Arc::new(RwLock::new(session)));
        Ok(session_id)
    }

    fn handle(&self, session_id: &str) -> SessionResult<Arc<RwLock<Session>>> {
        self.sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    pub fn get(&self, session_id: &str) -> Option<SessionSummary> {
        let handle = self.sessions.get(session_id)?.value().clone();
        let session = handle.read();
        Some(summarize(&session))
    }

    /// True when the session exists and has not reached a terminal state.
    pub fn is_live(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|e| !e.value().read().status.is_terminal())
            .unwrap_or(false)
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        self.sessions
            .iter()
            .map(|e| summarize(&e.value().read()))
            .collect()
    }

    pub fn list_by_client(&self, client_id: &str) -> Vec<SessionSummary> {
        self.sessions
            .iter()
            .filter(|e| e.value().read().client_id == client_id)
            .map(|e| summarize(&e.value().read()))
            .collect()
    }

    pub fn list_by_technician(&self, technician_id: &str) -> Vec<SessionSummary> {
        self.sessions
            .iter()
            .filter(|e| e.value().read().technician_id == technician_id)
            .map(|e| summarize(&e.value().read()))
            .collect()
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|e| !e.value().read().status.is_terminal())
            .count()
    }

    /// Record a connection attach for `(session, role)`. The registry entry
    /// itself is owned by the router layer; this updates session state only.
    pub fn register_connection(&self, session_id: &str, role: PeerRole) -> SessionResult<()> {
        let handle = self.handle(session_id)?;
        let mut session = handle.write();
        if session.status.is_terminal() {
            return Err(SessionError::InvalidState(format!(
                "session {session_id} is closed"
            )));
        }
        session.touch();
        if role == PeerRole::Client
            && matches!(
                session.status,
                SessionStatus::Pending | SessionStatus::Disconnected
            )
        {
            session.status = SessionStatus::Active;
        }
        drop(session);

        self.audit.log(
            AuditEvent::new("connection_registered")
                .session(session_id)
                .detail("role", format!("{role:?}").to_lowercase()),
        );
        Ok(())
    }

    pub fn unregister_connection(&self, session_id: &str, role: PeerRole) {
        let Ok(handle) = self.handle(session_id) else {
            return;
        };
        {
            let mut session = handle.write();
            if role == PeerRole::Client && session.status == SessionStatus::Active {
                session.status = SessionStatus::Disconnected;
            }
        }
        self.audit.log(
            AuditEvent::new("connection_unregistered")
                .session(session_id)
                .detail("role", format!("{role:?}").to_lowercase()),
        );
    }

    pub fn touch(&self, session_id: &str) {
        if let Some(entry) = self.sessions.get(session_id) {
            entry.value().write().touch();
        }
    }

    pub fn record_message(&self, session_id: &str) {
        if let Some(entry) = self.sessions.get(session_id) {
            let mut session = entry.value().write();
            session.stats.messages_routed += 1;
            session.touch();
        }
    }

    pub fn record_bytes(&self, session_id: &str, bytes: u64) {
        if let Some(entry) = self.sessions.get(session_id) {
            let mut session = entry.value().write();
            session.stats.bytes_transferred += bytes;
            session.touch();
        }
    }

    pub fn record_transfer_started(&self, session_id: &str) {
        if let Some(entry) = self.sessions.get(session_id) {
            entry.value().write().stats.transfers_started += 1;
        }
    }

    pub fn record_transfer_completed(&self, session_id: &str) {
        if let Some(entry) = self.sessions.get(session_id) {
            entry.value().write().stats.transfers_completed += 1;
        }
    }

    pub fn request_privilege(
        &self,
        session_id: &str,
        privilege_type: PrivilegeType,
        justification: &str,
        requested_duration_secs: i64,
    ) -> SessionResult<PrivilegeRequest> {
        let policy = self.config.snapshot().remote_access.privilege_escalation.clone();
        if !policy.enabled {
            return Err(SessionError::EscalationDisabled);
        }
        if !policy
            .allowed_privileges
            .iter()
            .any(|p| p == privilege_type.as_str())
        {
            return Err(SessionError::PrivilegeNotAllowed(
                privilege_type.as_str().to_string(),
            ));
        }
        if policy.require_justification && justification.len() < policy.min_justification_length {
            return Err(SessionError::JustificationTooShort {
                min: policy.min_justification_length,
                got: justification.len(),
            });
        }

        let effective = if requested_duration_secs <= 0 {
            policy.default_privilege_duration_secs
        } else {
            requested_duration_secs.min(policy.max_privilege_duration_secs)
        };

        let request = PrivilegeRequest {
            id: uuid::Uuid::new_v4().to_string(),
            privilege_type,
            justification: justification.to_string(),
            effective_duration_secs: effective,
            requested_at: Utc::now(),
            status: PrivilegeRequestStatus::Pending,
            approver: None,
            approved_at: None,
        };

        let handle = self.handle(session_id)?;
        {
            let mut session = handle.write();
            if session.status.is_terminal() {
                return Err(SessionError::InvalidState(format!(
                    "session {session_id} is closed"
                )));
            }
            session.privilege_requests.push(request.clone());
            session.touch();
        }

        self.audit.log(
            AuditEvent::new("privilege_requested")
                .session(session_id)
                .detail("privilege_type", privilege_type.as_str())
                .detail("duration_secs", effective)
                .detail("justification", justification),
        );
        // Approval happens on the end-user side.
        self.registry.send_envelope(
            session_id,
            PeerRole::Client,
            &Envelope::PrivilegeRequested {
                session_id: session_id.to_string(),
                request_id: request.id.clone(),
                privilege_type,
                justification: justification.to_string(),
                duration_secs: effective,
            },
        );

        Ok(request)
    }

    pub fn approve_privilege(
        &self,
        session_id: &str,
        request_id: &str,
        approver: &str,
    ) -> SessionResult<ActivePrivilege> {
        let handle = self.handle(session_id)?;
        let privilege = {
            let mut session = handle.write();
            let now = Utc::now();

            let (privilege_type, duration) = {
                let request = session
                    .request_mut(request_id)
                    .ok_or_else(|| SessionError::RequestNotFound(request_id.to_string()))?;
                if request.status != PrivilegeRequestStatus::Pending {
                    return Err(SessionError::InvalidState(format!(
                        "request {request_id} is not pending"
                    )));
                }
                (
                    request.privilege_type,
                    chrono::Duration::seconds(request.effective_duration_secs),
                )
            };

            if let Some(existing) = session.active_privileges.get(&privilege_type) {
                if !existing.is_expired(now) {
                    return Err(SessionError::PrivilegeAlreadyActive(
                        privilege_type.as_str().to_string(),
                    ));
                }
            }

            let request = session
                .request_mut(request_id)
                .expect("request located above");
            request.status = PrivilegeRequestStatus::Approved;
            request.approver = Some(approver.to_string());
            request.approved_at = Some(now);

            let privilege = ActivePrivilege {
                privilege_type,
                granted_at: now,
                expires_at: now + duration,
                granted_by: approver.to_string(),
            };
            session
                .active_privileges
                .insert(privilege_type, privilege.clone());
            session.touch();
            privilege
        };

        let severity = if privilege.privilege_type == PrivilegeType::Admin {
            Severity::High
        } else {
            Severity::Medium
        };
        self.audit.log(
            AuditEvent::new("privilege_approved")
                .session(session_id)
                .user(approver)
                .severity(severity)
                .detail("privilege_type", privilege.privilege_type.as_str())
                .detail("expires_at", privilege.expires_at.to_rfc3339()),
        );
        self.registry.broadcast(
            session_id,
            &Envelope::PrivilegeApproved {
                session_id: session_id.to_string(),
                request_id: request_id.to_string(),
                privilege_type: privilege.privilege_type,
                expires_at: privilege.expires_at,
            },
        );

        Ok(privilege)
    }

    pub fn deny_privilege(
        &self,
        session_id: &str,
        request_id: &str,
        approver: &str,
    ) -> SessionResult<()> {
        let handle = self.handle(session_id)?;
        let privilege_type = {
            let mut session = handle.write();
            let request = session
                .request_mut(request_id)
                .ok_or_else(|| SessionError::RequestNotFound(request_id.to_string()))?;
            if request.status != PrivilegeRequestStatus::Pending {
                return Err(SessionError::InvalidState(format!(
                    "request {request_id} is not pending"
                )));
            }
            request.status = PrivilegeRequestStatus::Denied;
            request.approver = Some(approver.to_string());
            request.privilege_type
        };

        self.audit.log(
            AuditEvent::new("privilege_denied")
                .session(session_id)
                .user(approver)
                .detail("privilege_type", privilege_type.as_str()),
        );
        self.registry.broadcast(
            session_id,
            &Envelope::PrivilegeDenied {
                session_id: session_id.to_string(),
                request_id: request_id.to_string(),
                privilege_type,
            },
        );
        Ok(())
    }

    pub fn revoke_privilege(
        &self,
        session_id: &str,
        privilege_type: PrivilegeType,
    ) -> SessionResult<()> {
        let handle = self.handle(session_id)?;
        let removed = handle.write().active_privileges.remove(&privilege_type);
        if removed.is_none() {
            return Err(SessionError::NotFound(format!(
                "no active {} privilege",
                privilege_type.as_str()
            )));
        }

        self.audit.log(
            AuditEvent::new("privilege_revoked")
                .session(session_id)
                .detail("privilege_type", privilege_type.as_str()),
        );
        self.registry.broadcast(
            session_id,
            &Envelope::PrivilegeRevoked {
                session_id: session_id.to_string(),
                privilege_type,
            },
        );
        Ok(())
    }

    /// True only while an unexpired grant exists; expiry is observed here
    /// even before the sweeper removes the record.
    pub fn has_active_privilege(&self, session_id: &str, privilege_type: PrivilegeType) -> bool {
        let Some(entry) = self.sessions.get(session_id) else {
            return false;
        };
        let session = entry.value().read();
        session
            .active_privileges
            .get(&privilege_type)
            .map(|p| !p.is_expired(Utc::now()))
            .unwrap_or(false)
    }

    pub fn terminate(&self, session_id: &str, reason: &str) -> SessionResult<()> {
        let handle = self.handle(session_id)?;
        {
            let mut session = handle.write();
            if session.status.is_terminal() {
                return Err(SessionError::InvalidState(format!(
                    "session {session_id} already closed"
                )));
            }
            session.status = SessionStatus::Terminated;
            session.end_time = Some(Utc::now());
            session.active_privileges.clear();
        }

        self.audit.log(
            AuditEvent::new("session_terminated")
                .session(session_id)
                .detail("reason", reason),
        );
        self.registry.broadcast(
            session_id,
            &Envelope::SessionTerminated {
                session_id: session_id.to_string(),
                reason: reason.to_string(),
            },
        );
        self.registry.drop_session(session_id);
        Ok(())
    }

    /// One cleanup pass: expire sessions and privileges, purge terminal
    /// sessions past the grace window.
    pub fn sweep(&self) -> SweepReport {
        let now = Utc::now();
        let config = self.config.snapshot();
        let session_timeout =
            chrono::Duration::seconds(config.remote_access.session_timeout_secs as i64);
        let idle_timeout = chrono::Duration::seconds(config.remote_access.idle_timeout_secs as i64);

        let mut report = SweepReport::default();
        let mut expired_ids = Vec::new();
        let mut expired_privileges = Vec::new();
        let mut purge_ids = Vec::new();

        for entry in self.sessions.iter() {
            let mut session = entry.value().write();

            if session.is_expired(now, session_timeout, idle_timeout) {
                session.status = SessionStatus::Expired;
                session.end_time = Some(now);
                session.active_privileges.clear();
                expired_ids.push(session.id.clone());
            } else {
                let expired: Vec<PrivilegeType> = session
                    .active_privileges
                    .iter()
                    .filter(|(_, p)| p.is_expired(now))
                    .map(|(t, _)| *t)
                    .collect();
                for privilege_type in expired {
                    session.active_privileges.remove(&privilege_type);
                    expired_privileges.push((session.id.clone(), privilege_type));
                }
            }

            if session.status.is_terminal() {
                let closed_at = session.end_time.unwrap_or(session.last_activity);
                if (now - closed_at).num_seconds() > PURGE_GRACE_SECS {
                    purge_ids.push(session.id.clone());
                }
            }
        }

        for session_id in &expired_ids {
            self.audit
                .log(AuditEvent::new("session_expired").session(session_id));
            self.registry.broadcast(
                session_id,
                &Envelope::SessionExpired {
                    session_id: session_id.clone(),
                },
            );
            self.registry.drop_session(session_id);
        }
        for (session_id, privilege_type) in &expired_privileges {
            self.audit.log(
                AuditEvent::new("privilege_expired")
                    .session(session_id)
                    .detail("privilege_type", privilege_type.as_str()),
            );
            self.registry.broadcast(
                session_id,
                &Envelope::PrivilegeExpired {
                    session_id: session_id.clone(),
                    privilege_type: *privilege_type,
                },
            );
        }
        for session_id in &purge_ids {
            self.sessions.remove(session_id);
        }

        report.expired_sessions = expired_ids.len();
        report.expired_privileges = expired_privileges.len();
        report.purged_sessions = purge_ids.len();
        report
    }
}

fn summarize(session: &Session) -> SessionSummary {
    let now = Utc::now();
    let mut summary = SessionSummary::from_session(session);
    // Expired grants are never observable, even between sweeps.
    summary.active_privileges.retain(|p| !p.is_expired(now));
    summary
}
