use crate::router::envelope::{ControlAction, Envelope, PeerRole};
use crate::router::error::RouterError;
use crate::router::frame::decode_chunk_frame;
use crate::router::registry::Registry;
use crate::session::manager::SessionManager;
use crate::transfer::engine::TransferEngine;
use crate::transfer::types::TransferRequest;
use std::sync::Arc;

/// Role-aware dispatch between attached peers and the session manager /
/// transfer engine. One router serves every connection; per-connection
/// read/write loops live in the API layer.
pub struct MessageRouter {
    registry: Arc<Registry>,
    sessions: Arc<SessionManager>,
    transfers: Arc<TransferEngine>,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<Registry>,
        sessions: Arc<SessionManager>,
        transfers: Arc<TransferEngine>,
    ) -> Self {
        Self {
            registry,
            sessions,
            transfers,
        }
    }

    /// Handle one inbound text frame from `(session, role)`.
    pub async fn handle_text(&self, session_id: &str, role: PeerRole, text: &str) {
        self.sessions.record_message(session_id);

        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(RouterError::UnknownType(type_name)) => {
                // Unknown types are logged and dropped, never a disconnect.
                tracing::warn!(session_id, type_name, "dropping unknown envelope type");
                return;
            }
            Err(e) => {
                self.reply(session_id, role, &Envelope::error(e.kind(), e.to_string()));
                return;
            }
        };

        if let Err((kind, message)) = self.dispatch(session_id, role, envelope).await {
            self.reply(session_id, role, &Envelope::error(kind, message));
        }
    }

    /// Handle one inbound binary frame (upload chunk traffic).
    pub async fn handle_binary(&self, session_id: &str, role: PeerRole, data: &[u8]) {
        if role != PeerRole::Client {
            self.reply(
                session_id,
                role,
                &Envelope::error("unauthorized", "only the client peer streams chunks"),
            );
            return;
        }

        let (header, payload) = match decode_chunk_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                self.reply(session_id, role, &Envelope::error(e.kind(), e.to_string()));
                return;
            }
        };

        self.sessions.touch(session_id);
        if let Err(e) = self.transfers.write_chunk(session_id, header, payload).await {
            // Recoverable integrity failures were already answered with a
            // retransmission request inside the engine.
            self.reply(session_id, role, &Envelope::error(e.kind(), e.to_string()));
        }
    }

    async fn dispatch(
        &self,
        session_id: &str,
        role: PeerRole,
        envelope: Envelope,
    ) -> Result<(), (&'static str, String)> {
        match envelope {
            // Liveness. Read-deadline refresh happens in the socket loop.
            Envelope::Ping => {
                self.reply(session_id, role, &Envelope::Pong);
            }
            Envelope::Heartbeat => {
                self.reply(session_id, role, &Envelope::HeartbeatResponse);
            }
            Envelope::Pong | Envelope::HeartbeatResponse => {}

            // Session plane.
            Envelope::SessionRegister { .. } => {
                // The actual binding happened at connection attach.
                self.reply(
                    session_id,
                    role,
                    &Envelope::SessionRegistered {
                        session_id: session_id.to_string(),
                        role,
                    },
                );
            }
            Envelope::SessionCreate {
                client_id,
                technician_id,
                client_info,
            } => {
                let new_id = self
                    .sessions
                    .create_session(&client_id, &technician_id, client_info)
                    .map_err(|e| (e.kind(), e.to_string()))?;
                self.reply(
                    session_id,
                    role,
                    &Envelope::SessionCreated { session_id: new_id },
                );
            }
            Envelope::SessionJoin {
                session_id: target,
            } => {
                if !self.sessions.is_live(&target) {
                    return Err(("not_found", format!("session {target} is not live")));
                }
                self.reply(
                    session_id,
                    role,
                    &Envelope::SessionJoined {
                        session_id: target,
                    },
                );
            }
            Envelope::SessionTerminate {
                session_id: target,
                reason,
            } => {
                self.sessions
                    .terminate(&target, reason.as_deref().unwrap_or("closed by peer"))
                    .map_err(|e| (e.kind(), e.to_string()))?;
            }
            Envelope::SessionInfo {
                session_id: target, ..
            } => {
                let summary = self
                    .sessions
                    .get(&target)
                    .ok_or_else(|| ("not_found", format!("session {target} not found")))?;
                self.reply(
                    session_id,
                    role,
                    &Envelope::SessionInfo {
                        session_id: target,
                        summary: Some(summary),
                    },
                );
            }

            // Privilege plane. Elevation is requested by the technician and
            // decided on the end-user side.
            Envelope::PrivilegeRequest {
                privilege_type,
                justification,
                duration_secs,
                ..
            } => {
                let request = self
                    .sessions
                    .request_privilege(session_id, privilege_type, &justification, duration_secs)
                    .map_err(|e| (e.kind(), e.to_string()))?;
                self.reply(
                    session_id,
                    role,
                    &Envelope::PrivilegeRequested {
                        session_id: session_id.to_string(),
                        request_id: request.id,
                        privilege_type,
                        justification,
                        duration_secs: request.effective_duration_secs,
                    },
                );
            }
            Envelope::PrivilegeResponse {
                request_id,
                approved,
                approver,
                ..
            } => {
                if role != PeerRole::Client {
                    return Err((
                        "unauthorized",
                        "privilege decisions come from the end user".to_string(),
                    ));
                }
                if approved {
                    self.sessions
                        .approve_privilege(session_id, &request_id, &approver)
                        .map(|_| ())
                        .map_err(|e| (e.kind(), e.to_string()))?;
                } else {
                    self.sessions
                        .deny_privilege(session_id, &request_id, &approver)
                        .map_err(|e| (e.kind(), e.to_string()))?;
                }
            }
            Envelope::PrivilegeRevoke { privilege_type, .. } => {
                self.sessions
                    .revoke_privilege(session_id, privilege_type)
                    .map_err(|e| (e.kind(), e.to_string()))?;
            }

            // Transfer plane.
            Envelope::FileTransferRequest {
                filename,
                file_size,
                checksum,
                direction,
                technician_id,
                ..
            } => {
                let transfer_id = self
                    .transfers
                    .create_transfer(
                        session_id,
                        TransferRequest {
                            filename,
                            file_size,
                            checksum,
                            direction,
                            source_path: None,
                            requested_by: technician_id,
                        },
                    )
                    .map_err(|e| (e.kind(), e.to_string()))?;
                self.reply(
                    session_id,
                    role,
                    &Envelope::FileTransferResponse {
                        transfer_id,
                        accepted: true,
                        message: None,
                    },
                );
            }
            Envelope::TransferApproval {
                transfer_id,
                approved,
                message,
            } => {
                if role != PeerRole::Client {
                    return Err((
                        "unauthorized",
                        "transfer approval comes from the end user".to_string(),
                    ));
                }
                self.transfers
                    .approve(&transfer_id, approved, message)
                    .await
                    .map_err(|e| (e.kind(), e.to_string()))?;
            }
            Envelope::TransferControl {
                transfer_id,
                action,
            } => {
                let result = match action {
                    ControlAction::Pause => self.transfers.pause(&transfer_id),
                    ControlAction::Resume => self.transfers.resume(&transfer_id),
                    ControlAction::Cancel => self.transfers.cancel(&transfer_id).await,
                };
                let response = match result {
                    Ok(()) => Envelope::ControlResponse {
                        transfer_id,
                        action,
                        success: true,
                        message: None,
                    },
                    Err(e) => Envelope::ControlResponse {
                        transfer_id,
                        action,
                        success: false,
                        message: Some(e.to_string()),
                    },
                };
                self.reply(session_id, role, &response);
            }
            Envelope::ProgressRequest { transfer_id } => {
                let progress = self
                    .transfers
                    .progress(&transfer_id)
                    .map_err(|e| (e.kind(), e.to_string()))?;
                self.reply(
                    session_id,
                    role,
                    &Envelope::ProgressResponse {
                        transfer_id,
                        progress,
                    },
                );
            }
            Envelope::ChunkAck {
                transfer_id,
                chunk_index,
            } => {
                self.transfers
                    .handle_chunk_ack(&transfer_id, chunk_index)
                    .await
                    .map_err(|e| (e.kind(), e.to_string()))?;
            }
            Envelope::ChunkRetransmissionRequest {
                transfer_id,
                chunk_index,
            } => {
                self.transfers
                    .handle_retransmission_request(&transfer_id, chunk_index)
                    .map_err(|e| (e.kind(), e.to_string()))?;
            }

            Envelope::Error { error, message } => {
                tracing::warn!(session_id, ?role, error, message, "peer reported error");
            }

            // Broker-originated notifications looped back by a peer.
            other => {
                tracing::debug!(
                    session_id,
                    ?role,
                    envelope = ?other,
                    "ignoring notification-only envelope from peer"
                );
            }
        }
        Ok(())
    }

    fn reply(&self, session_id: &str, role: PeerRole, envelope: &Envelope) {
        self.registry.send_envelope(session_id, role, envelope);
    }

    /// Peer attach: bind the mailbox in the registry (displacing any prior
    /// peer of that role) and update session state.
    pub fn attach_peer(
        &self,
        session_id: &str,
        role: PeerRole,
        handle: crate::router::registry::PeerHandle,
    ) -> Result<(), (&'static str, String)> {
        self.sessions
            .register_connection(session_id, role)
            .map_err(|e| (e.kind(), e.to_string()))?;
        self.registry.register(session_id, role, handle);
        self.reply(
            session_id,
            role,
            &Envelope::SessionRegistered {
                session_id: session_id.to_string(),
                role,
            },
        );
        Ok(())
    }

    /// Peer detach: drop the registry binding if it still belongs to this
    /// connection, then update session state.
    pub fn detach_peer(&self, session_id: &str, role: PeerRole, conn_id: &str) {
        if self.registry.unregister(session_id, role, conn_id) {
            self.sessions.unregister_connection(session_id, role);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLogger;
    use crate::config::{BrokerConfig, ConfigHandle};
    use crate::router::registry::{OutboundFrame, PeerHandle};
    use crate::security::validator::FileValidator;
    use crate::session::types::ClientInfo;
    use crate::transfer::types::TransferDirection;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Harness {
        _dir: TempDir,
        router: MessageRouter,
        sessions: Arc<SessionManager>,
        transfers: Arc<TransferEngine>,
        session_id: String,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config = BrokerConfig::default();
        config.transfer.temp_dir = dir.path().join("tmp");
        config.security.quarantine_dir = dir.path().join("q");

        let config = Arc::new(ConfigHandle::new(config).unwrap());
        let audit = Arc::new(AuditLogger::disabled());
        let registry = Arc::new(Registry::new());
        let sessions = Arc::new(SessionManager::new(
            config.clone(),
            audit.clone(),
            registry.clone(),
        ));
        let validator = Arc::new(FileValidator::new(
            config.snapshot().security.clone(),
            audit.clone(),
        ));
        let transfers = Arc::new(TransferEngine::new(
            config,
            validator,
            None,
            audit.clone(),
            registry.clone(),
            sessions.clone(),
        ));
        let router = MessageRouter::new(registry, sessions.clone(), transfers.clone());
        let session_id = sessions
            .create_session("client-1", "tech-1", ClientInfo::default())
            .unwrap();

        Harness {
            _dir: dir,
            router,
            sessions,
            transfers,
            session_id,
        }
    }

    fn attach(h: &Harness, role: PeerRole, conn: &str) -> mpsc::Receiver<OutboundFrame> {
        let (handle, rx) = PeerHandle::channel(conn.to_string());
        h.router.attach_peer(&h.session_id, role, handle).unwrap();
        rx
    }

    async fn next_envelope(rx: &mut mpsc::Receiver<OutboundFrame>) -> Envelope {
        loop {
            match rx.recv().await.expect("peer channel closed") {
                OutboundFrame::Text(text) => return Envelope::parse(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_attach_acks_and_activates() {
        let h = harness().await;
        let mut rx = attach(&h, PeerRole::Client, "c1");

        match next_envelope(&mut rx).await {
            Envelope::SessionRegistered { role, .. } => assert_eq!(role, PeerRole::Client),
            other => panic!("expected registration ack, got {other:?}"),
        }
        assert!(h.sessions.get(&h.session_id).unwrap().status.is_active());
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let h = harness().await;
        let mut rx = attach(&h, PeerRole::Portal, "p1");
        let _ = next_envelope(&mut rx).await; // registration ack

        h.router
            .handle_text(&h.session_id, PeerRole::Portal, &Envelope::Ping.to_text())
            .await;
        assert_eq!(next_envelope(&mut rx).await, Envelope::Pong);

        h.router
            .handle_text(
                &h.session_id,
                PeerRole::Portal,
                &Envelope::Heartbeat.to_text(),
            )
            .await;
        assert_eq!(next_envelope(&mut rx).await, Envelope::HeartbeatResponse);
    }

    #[tokio::test]
    async fn test_unknown_type_dropped_silently() {
        let h = harness().await;
        let mut rx = attach(&h, PeerRole::Portal, "p1");
        let _ = next_envelope(&mut rx).await;

        h.router
            .handle_text(
                &h.session_id,
                PeerRole::Portal,
                r#"{"type":"mouse_move","x":10,"y":20}"#,
            )
            .await;
        // No error envelope, no disconnect.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_json_gets_error_envelope() {
        let h = harness().await;
        let mut rx = attach(&h, PeerRole::Portal, "p1");
        let _ = next_envelope(&mut rx).await;

        h.router
            .handle_text(&h.session_id, PeerRole::Portal, "{not json")
            .await;
        match next_envelope(&mut rx).await {
            Envelope::Error { error, .. } => assert_eq!(error, "protocol"),
            other => panic!("expected error envelope, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transfer_request_and_approval_routing() {
        let h = harness().await;
        let mut portal_rx = attach(&h, PeerRole::Portal, "p1");
        let mut client_rx = attach(&h, PeerRole::Client, "c1");
        let _ = next_envelope(&mut portal_rx).await;
        let _ = next_envelope(&mut client_rx).await;

        // Technician requests an upload over the portal link.
        let request = Envelope::FileTransferRequest {
            session_id: h.session_id.clone(),
            transfer_id: None,
            filename: "notes.txt".to_string(),
            file_size: 1024,
            checksum: None,
            direction: TransferDirection::Upload,
            technician_id: Some("tech-1".to_string()),
        };
        h.router
            .handle_text(&h.session_id, PeerRole::Portal, &request.to_text())
            .await;

        // The client sees the annotated request for its approval prompt.
        let transfer_id = loop {
            match next_envelope(&mut client_rx).await {
                Envelope::FileTransferRequest {
                    transfer_id: Some(id),
                    filename,
                    ..
                } => {
                    assert_eq!(filename, "notes.txt");
                    break id;
                }
                _ => continue,
            }
        };

        // The portal gets the acceptance ack carrying the same id.
        let acked = loop {
            match next_envelope(&mut portal_rx).await {
                Envelope::FileTransferResponse {
                    transfer_id,
                    accepted,
                    ..
                } => {
                    assert!(accepted);
                    break transfer_id;
                }
                _ => continue,
            }
        };
        assert_eq!(acked, transfer_id);

        // The portal cannot approve; the client can.
        h.router
            .handle_text(
                &h.session_id,
                PeerRole::Portal,
                &Envelope::TransferApproval {
                    transfer_id: transfer_id.clone(),
                    approved: true,
                    message: None,
                }
                .to_text(),
            )
            .await;
        match next_envelope(&mut portal_rx).await {
            Envelope::Error { error, .. } => assert_eq!(error, "unauthorized"),
            other => panic!("expected unauthorized, got {other:?}"),
        }

        h.router
            .handle_text(
                &h.session_id,
                PeerRole::Client,
                &Envelope::TransferApproval {
                    transfer_id: transfer_id.clone(),
                    approved: true,
                    message: None,
                }
                .to_text(),
            )
            .await;
        assert_eq!(
            h.transfers.get(&transfer_id).unwrap().status,
            crate::transfer::types::TransferStatus::InProgress
        );
    }

    #[tokio::test]
    async fn test_privilege_round_trip_over_wire() {
        let h = harness().await;
        let mut portal_rx = attach(&h, PeerRole::Portal, "p1");
        let mut client_rx = attach(&h, PeerRole::Client, "c1");
        let _ = next_envelope(&mut portal_rx).await;
        let _ = next_envelope(&mut client_rx).await;

        h.router
            .handle_text(
                &h.session_id,
                PeerRole::Portal,
                &Envelope::PrivilegeRequest {
                    session_id: h.session_id.clone(),
                    privilege_type: crate::session::types::PrivilegeType::Elevated,
                    justification: "driver reinstall".to_string(),
                    duration_secs: 600,
                }
                .to_text(),
            )
            .await;

        // Client receives the approval prompt.
        let request_id = loop {
            match next_envelope(&mut client_rx).await {
                Envelope::PrivilegeRequested { request_id, .. } => break request_id,
                _ => continue,
            }
        };

        // End user approves.
        h.router
            .handle_text(
                &h.session_id,
                PeerRole::Client,
                &Envelope::PrivilegeResponse {
                    session_id: h.session_id.clone(),
                    request_id,
                    approved: true,
                    approver: "end-user".to_string(),
                }
                .to_text(),
            )
            .await;

        assert!(h.sessions.has_active_privilege(
            &h.session_id,
            crate::session::types::PrivilegeType::Elevated
        ));
    }

    #[tokio::test]
    async fn test_binary_from_portal_rejected() {
        let h = harness().await;
        let mut portal_rx = attach(&h, PeerRole::Portal, "p1");
        let _ = next_envelope(&mut portal_rx).await;

        h.router
            .handle_binary(&h.session_id, PeerRole::Portal, &[0, 0, 0, 2, b'{', b'}'])
            .await;
        match next_envelope(&mut portal_rx).await {
            Envelope::Error { error, .. } => assert_eq!(error, "unauthorized"),
            other => panic!("expected unauthorized, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_detach_requires_matching_conn() {
        let h = harness().await;
        let _rx1 = attach(&h, PeerRole::Client, "old-conn");
        let _rx2 = attach(&h, PeerRole::Client, "new-conn");

        // Old connection's teardown must not disturb the replacement.
        h.router.detach_peer(&h.session_id, PeerRole::Client, "old-conn");
        assert!(h.sessions.get(&h.session_id).unwrap().status.is_active());

        h.router.detach_peer(&h.session_id, PeerRole::Client, "new-conn");
        assert_eq!(
            h.sessions.get(&h.session_id).unwrap().status,
            crate::session::types::SessionStatus::Disconnected
        );
    }
}
