use crate::broker::Broker;
use crate::router::{Envelope, OutboundFrame, PeerHandle, PeerRole};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::time::timeout;

#[derive(Debug, Deserialize)]
pub struct AttachParams {
    pub session_id: String,
    pub role: PeerRole,
}

/// Peer attachment endpoint: `GET /ws?session_id=...&role=client|portal`.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<AttachParams>,
    State(broker): State<Arc<Broker>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, broker, params.session_id, params.role))
}

async fn handle_socket(socket: WebSocket, broker: Arc<Broker>, session_id: String, role: PeerRole) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (handle, mut outbound) = PeerHandle::channel(conn_id.clone());

    let (mut sink, mut stream) = socket.split();

    if let Err((kind, message)) = broker.router.attach_peer(&session_id, role, handle) {
        let _ = sink
            .send(Message::Text(Envelope::error(kind, message).to_text()))
            .await;
        let _ = sink.send(Message::Close(None)).await;
        return;
    }
    tracing::info!(session_id, ?role, conn_id, "peer attached");

    let config = broker.config.snapshot();
    let read_timeout = config.remote_access.websocket_read_timeout();
    let write_timeout = config.remote_access.websocket_write_timeout();

    // Writer task: drains the peer mailbox onto the socket. A frame that
    // cannot be written within the deadline kills the connection.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let message = match frame {
                OutboundFrame::Text(text) => Message::Text(text),
                OutboundFrame::Binary(bytes) => Message::Binary(bytes.to_vec()),
                OutboundFrame::Close => break,
            };
            match timeout(write_timeout, sink.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => break,
                Err(_) => {
                    tracing::warn!("write deadline exceeded, dropping connection");
                    break;
                }
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    // Reader loop: every inbound frame refreshes the read deadline.
    loop {
        let inbound = match timeout(read_timeout, stream.next()).await {
            Err(_) => {
                tracing::info!(session_id, ?role, "read deadline expired");
                break;
            }
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(message))) => message,
        };

        match inbound {
            Message::Text(text) => broker.router.handle_text(&session_id, role, &text).await,
            Message::Binary(data) => broker.router.handle_binary(&session_id, role, &data).await,
            // Transport-level ping/pong only refresh the deadline.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
        }
    }

    broker.router.detach_peer(&session_id, role, &conn_id);
    writer.abort();
    tracing::info!(session_id, ?role, conn_id, "peer detached");
}
