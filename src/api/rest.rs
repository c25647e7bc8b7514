use crate::api::error::{ApiError, ApiResult};
use crate::api::types::*;
use crate::api::websocket::websocket_handler;
use crate::broker::Broker;
use crate::config::TransferConfig;
use crate::transfer::{TransferProgress, TransferRequest, TransferSummary};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// REST + WebSocket façade. Thin adapters only: every handler maps a
/// request onto one core operation.
pub fn api_router(broker: Arc<Broker>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/info", get(info))
        .route("/ws", get(websocket_handler))
        .route("/api/v1/sessions", get(list_sessions))
        .route("/api/v1/transfers", get(list_transfers).post(create_transfer))
        .route("/api/v1/transfers/:id", get(get_transfer))
        .route("/api/v1/transfers/:id/approve", post(approve_transfer))
        .route("/api/v1/transfers/:id/control", post(control_transfer))
        .route("/api/v1/transfers/:id/progress", get(get_progress))
        .route(
            "/api/v1/config/transfer",
            get(get_transfer_config).put(put_transfer_config),
        )
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/files/:id/download", get(download_file))
        .layer(cors)
        .with_state(broker)
}

async fn health() -> &'static str {
    "OK"
}

async fn info(State(broker): State<Arc<Broker>>) -> Json<InfoResponse> {
    Json(InfoResponse {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: broker.uptime_secs(),
    })
}

async fn list_sessions(State(broker): State<Arc<Broker>>) -> Json<ListSessionsResponse> {
    let sessions = broker.sessions.list();
    let count = sessions.len();
    Json(ListSessionsResponse { sessions, count })
}

async fn list_transfers(State(broker): State<Arc<Broker>>) -> Json<ListTransfersResponse> {
    let transfers = broker.transfers.list();
    let count = transfers.len();
    Json(ListTransfersResponse { transfers, count })
}

async fn create_transfer(
    State(broker): State<Arc<Broker>>,
    Json(req): Json<CreateTransferRequest>,
) -> ApiResult<(StatusCode, Json<CreateTransferResponse>)> {
    let transfer_id = broker.transfers.create_transfer(
        &req.session_id,
        TransferRequest {
            filename: req.filename,
            file_size: req.file_size,
            checksum: req.checksum,
            direction: req.direction,
            source_path: req.source_path,
            requested_by: req.requested_by,
        },
    )?;
    Ok((StatusCode::CREATED, Json(CreateTransferResponse { transfer_id })))
}

async fn get_transfer(
    State(broker): State<Arc<Broker>>,
    Path(id): Path<String>,
) -> ApiResult<Json<TransferSummary>> {
    broker
        .transfers
        .get(&id)
        .map(Json)
        .ok_or(ApiError::NotFound(id))
}

async fn approve_transfer(
    State(broker): State<Arc<Broker>>,
    Path(id): Path<String>,
    Json(req): Json<ApproveRequest>,
) -> ApiResult<Json<SuccessResponse>> {
    broker
        .transfers
        .approve(&id, req.approved, req.message)
        .await?;
    let verdict = if req.approved { "approved" } else { "rejected" };
    Ok(Json(SuccessResponse {
        message: format!("transfer {id} {verdict}"),
    }))
}

async fn control_transfer(
    State(broker): State<Arc<Broker>>,
    Path(id): Path<String>,
    Json(req): Json<ControlRequest>,
) -> ApiResult<Json<SuccessResponse>> {
    use crate::router::ControlAction;
    match req.action {
        ControlAction::Pause => broker.transfers.pause(&id)?,
        ControlAction::Resume => broker.transfers.resume(&id)?,
        ControlAction::Cancel => broker.transfers.cancel(&id).await?,
    }
    Ok(Json(SuccessResponse {
        message: format!("{:?} applied to {id}", req.action),
    }))
}

async fn get_progress(
    State(broker): State<Arc<Broker>>,
    Path(id): Path<String>,
) -> ApiResult<Json<TransferProgress>> {
    Ok(Json(broker.transfers.progress(&id)?))
}

async fn get_transfer_config(State(broker): State<Arc<Broker>>) -> Json<TransferConfig> {
    Json(broker.config.snapshot().transfer.clone())
}

async fn put_transfer_config(
    State(broker): State<Arc<Broker>>,
    Json(config): Json<TransferConfig>,
) -> ApiResult<Json<SuccessResponse>> {
    broker.config.update_transfer(config)?;
    Ok(Json(SuccessResponse {
        message: "transfer config updated".to_string(),
    }))
}

async fn stats(State(broker): State<Arc<Broker>>) -> Json<StatsResponse> {
    let transfers = broker.transfers.list();
    Json(StatsResponse {
        uptime_secs: broker.uptime_secs(),
        active_sessions: broker.sessions.active_session_count(),
        attached_peers: broker.registry.attached_count(),
        active_transfers: broker.transfers.active_count(),
        total_transfers: transfers.len(),
    })
}

async fn download_file(
    State(broker): State<Arc<Broker>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let (filename, data) = broker.transfers.read_completed_file(&id).await?;
    let headers = [
        (
            header::CONTENT_TYPE,
            "application/octet-stream".to_string(),
        ),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        ),
    ];
    Ok((headers, data))
}
