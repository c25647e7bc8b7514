use crate::router::envelope::{Envelope, PeerRole};
use crate::router::error::{RouterError, RouterResult};
use bytes::Bytes;
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::mpsc;

const MAILBOX_CAPACITY: usize = 256;

#[derive(Debug)]
pub enum OutboundFrame {
    Text(String),
    Binary(Bytes),
    Close,
}

/// Handle to one attached peer: the connection id plus its mailbox.
/// The raw socket stays with the connection's writer task.
#[derive(Clone)]
pub struct PeerHandle {
    pub conn_id: String,
    tx: mpsc::Sender<OutboundFrame>,
}

impl PeerHandle {
    pub fn new(conn_id: String, tx: mpsc::Sender<OutboundFrame>) -> Self {
        Self { conn_id, tx }
    }

    pub fn channel(conn_id: String) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        (Self::new(conn_id, tx), rx)
    }

    fn try_send(&self, frame: OutboundFrame) -> bool {
        self.tx.try_send(frame).is_ok()
    }
}

/// Role-keyed connection registry. Registering a `(session, role)` pair
/// atomically displaces the previous holder; the displaced mailbox gets a
/// close frame so its writer task finishes the frame in flight and exits.
pub struct Registry {
    peers: DashMap<(String, PeerRole), PeerHandle>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    /// Attach a peer, returning the displaced handle if one existed.
    pub fn register(&self, session_id: &str, role: PeerRole, handle: PeerHandle) -> Option<PeerHandle> {
        let displaced = self
            .peers
            .insert((session_id.to_string(), role), handle);
        if let Some(old) = &displaced {
            let _ = old.try_send(OutboundFrame::Close);
        }
        displaced
    }

    /// Detach a peer, but only if the registration still belongs to this
    /// connection (a replacement must not be knocked out by its predecessor).
    pub fn unregister(&self, session_id: &str, role: PeerRole, conn_id: &str) -> bool {
        self.peers
            .remove_if(&(session_id.to_string(), role), |_, handle| {
                handle.conn_id == conn_id
            })
            .is_some()
    }

    pub fn is_attached(&self, session_id: &str, role: PeerRole) -> bool {
        self.peers.contains_key(&(session_id.to_string(), role))
    }

    /// Drop both peers of a session (termination path).
    pub fn drop_session(&self, session_id: &str) {
        for role in [PeerRole::Client, PeerRole::Portal] {
            if let Some((_, handle)) = self.peers.remove(&(session_id.to_string(), role)) {
                let _ = handle.try_send(OutboundFrame::Close);
            }
        }
    }

    /// Best-effort control-plane send. Control paths never block on a slow
    /// peer; a full mailbox drops the envelope and the heartbeat machinery
    /// deals with the dead connection.
    pub fn send_envelope(&self, session_id: &str, role: PeerRole, envelope: &Envelope) {
        if let Some(handle) = self.peers.get(&(session_id.to_string(), role)) {
            if !handle.try_send(OutboundFrame::Text(envelope.to_text())) {
                tracing::warn!(session_id, ?role, "peer mailbox full, dropping envelope");
            }
        }
    }

    /// Send to both peers of the session triangle.
    pub fn broadcast(&self, session_id: &str, envelope: &Envelope) {
        self.send_envelope(session_id, PeerRole::Client, envelope);
        self.send_envelope(session_id, PeerRole::Portal, envelope);
    }

    /// Mirror an event to the opposite role.
    pub fn mirror(&self, session_id: &str, from: PeerRole, envelope: &Envelope) {
        self.send_envelope(session_id, from.other(), envelope);
    }

    /// Backpressured binary send for chunk frames, bounded by a deadline.
    pub async fn send_binary(
        &self,
        session_id: &str,
        role: PeerRole,
        frame: Bytes,
        deadline: Duration,
    ) -> RouterResult<()> {
        let tx = {
            let handle = self.peers.get(&(session_id.to_string(), role)).ok_or_else(|| {
                RouterError::PeerUnavailable {
                    session_id: session_id.to_string(),
                    role,
                }
            })?;
            handle.tx.clone()
        };

        match tokio::time::timeout(deadline, tx.send(OutboundFrame::Binary(frame))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RouterError::PeerGone),
            Err(_) => Err(RouterError::WriteTimeout),
        }
    }

    pub fn attached_count(&self) -> usize {
        self.peers.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
