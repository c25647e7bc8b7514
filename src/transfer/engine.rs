use crate::audit::{AuditEvent, AuditLogger};
use crate::config::{ConfigHandle, TransferConfig};
use crate::router::envelope::{Envelope, PeerRole};
use crate::router::frame::ChunkFrameHeader;
use crate::router::registry::Registry;
use crate::security::checksum::{sha256_bytes, verify_file_checksum};
use crate::security::crypto::{secure_delete, FileCryptor};
use crate::security::validator::FileValidator;
use crate::session::manager::SessionManager;
use crate::transfer::error::{TransferError, TransferResult};
use crate::transfer::state_machine::{transition, TransferEvent};
use crate::transfer::stream::run_download_sender;
use crate::transfer::types::{
    SpeedTracker, Transfer, TransferDirection, TransferProgress, TransferRequest, TransferStatus,
    TransferSummary,
};
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Notify;

/// Minimum spacing between progress envelopes per transfer.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Grace window before terminal transfer records (and their files) are
/// dropped by the sweep.
const PURGE_GRACE_SECS: i64 = 3600;

/// Cooperative stop/pause flags shared between control ops and the
/// per-transfer stream task. Checked at chunk boundaries only.
pub(crate) struct TransferFlags {
    paused: AtomicBool,
    stopped: AtomicBool,
    wake: Notify,
}

impl TransferFlags {
    fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.wake.notify_waiters();
    }

    /// Stop wins over pause and wakes any pause waiter.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wake.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Block until resumed or stopped. Returns the time spent paused so the
    /// caller can shift its retry deadlines by the same amount.
    pub async fn wait_while_paused(&self) -> Duration {
        if !self.is_paused() || self.is_stopped() {
            return Duration::ZERO;
        }
        let start = Instant::now();
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            // Register interest before the flag re-check so a concurrent
            // resume or cancel cannot slip between check and await.
            notified.as_mut().enable();
            if !self.is_paused() || self.is_stopped() {
                return start.elapsed();
            }
            notified.await;
        }
    }
}

pub(crate) struct TransferHandle {
    pub record: RwLock<Transfer>,
    pub flags: TransferFlags,
    /// Policy snapshot captured at creation; config swaps do not apply to
    /// in-flight transfers.
    pub config: TransferConfig,
    pub ws_write_timeout: Duration,
    /// Upload temp file, owned here and closed on teardown.
    pub file: tokio::sync::Mutex<Option<tokio::fs::File>>,
    pub speed: Mutex<SpeedTracker>,
    last_progress: Mutex<Option<Instant>>,
    /// Receiver-requested resends, drained by the download sender task.
    pub retransmit: Mutex<HashSet<u32>>,
}

impl TransferHandle {
    fn new(transfer: Transfer, config: TransferConfig, ws_write_timeout: Duration) -> Self {
        Self {
            record: RwLock::new(transfer),
            flags: TransferFlags::new(),
            config,
            ws_write_timeout,
            file: tokio::sync::Mutex::new(None),
            speed: Mutex::new(SpeedTracker::default()),
            last_progress: Mutex::new(None),
            retransmit: Mutex::new(HashSet::new()),
        }
    }
}

pub struct TransferEngine {
    transfers: DashMap<String, Arc<TransferHandle>>,
    config: Arc<ConfigHandle>,
    validator: Arc<FileValidator>,
    cryptor: Option<Arc<FileCryptor>>,
    audit: Arc<AuditLogger>,
    registry: Arc<Registry>,
    sessions: Arc<SessionManager>,
}

impl TransferEngine {
    pub fn new(
        config: Arc<ConfigHandle>,
        validator: Arc<FileValidator>,
        cryptor: Option<Arc<FileCryptor>>,
        audit: Arc<AuditLogger>,
        registry: Arc<Registry>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            transfers: DashMap::new(),
            config,
            validator,
            cryptor,
            audit,
            registry,
            sessions,
        }
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    fn handle(&self, transfer_id: &str) -> TransferResult<Arc<TransferHandle>> {
        self.transfers
            .get(transfer_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_string()))
    }

    /// Transfers currently holding a concurrency slot.
    pub fn active_count(&self) -> usize {
        self.transfers
            .iter()
            .filter(|e| e.value().record.read().status.is_streaming())
            .count()
    }

    pub fn get(&self, transfer_id: &str) -> Option<TransferSummary> {
        self.transfers
            .get(transfer_id)
            .map(|e| TransferSummary::from_transfer(&e.value().record.read()))
    }

    pub fn list(&self) -> Vec<TransferSummary> {
        self.transfers
            .iter()
            .map(|e| TransferSummary::from_transfer(&e.value().record.read()))
            .collect()
    }

    /// Register a transfer request. The record lands in `pending`; policy
    /// violations reject it immediately and surface as errors.
    pub fn create_transfer(
        &self,
        session_id: &str,
        request: TransferRequest,
    ) -> TransferResult<String> {
        if !self.sessions.is_live(session_id) {
            return Err(TransferError::SessionNotFound(session_id.to_string()));
        }

        let config = self.config.snapshot();
        let transfer_config = config.transfer.clone();
        let ws_write_timeout = config.remote_access.websocket_write_timeout();

        let active = self.active_count();
        if active >= transfer_config.max_concurrent {
            return Err(TransferError::LimitExceeded(active));
        }

        let transfer = Transfer::new(
            session_id.to_string(),
            &request,
            transfer_config.chunk_size,
        );
        let transfer_id = transfer.id.clone();

        self.audit.log(
            AuditEvent::new("transfer_requested")
                .session(session_id)
                .transfer(&transfer_id)
                .filename(&request.filename)
                .file_size(request.file_size)
                .detail(
                    "direction",
                    serde_json::to_value(request.direction).unwrap_or_default(),
                ),
        );

        let handle = Arc::new(TransferHandle::new(
            transfer,
            transfer_config.clone(),
            ws_write_timeout,
        ));
        self.transfers.insert(transfer_id.clone(), handle.clone());

        // Policy gate: filename rules, extension allow-list, size cap.
        if let Err(e) = self.screen_request(&transfer_config, &request) {
            self.reject_now(&handle, e.to_string());
            return Err(e);
        }

        // Both peers learn the assigned id; the non-requesting side shows
        // the approval prompt.
        self.registry.broadcast(
            session_id,
            &Envelope::FileTransferRequest {
                session_id: session_id.to_string(),
                transfer_id: Some(transfer_id.clone()),
                filename: request.filename.clone(),
                file_size: request.file_size,
                checksum: request.checksum.clone(),
                direction: request.direction,
                technician_id: request.requested_by.clone(),
            },
        );

        Ok(transfer_id)
    }

    fn screen_request(
        &self,
        config: &TransferConfig,
        request: &TransferRequest,
    ) -> TransferResult<()> {
        self.validator.check_filename(&request.filename)?;

        if !config.allowed_types.is_empty() {
            let ext = request
                .filename
                .rfind('.')
                .map(|i| request.filename[i..].to_lowercase());
            let allowed = ext.as_deref().map_or(false, |ext| {
                config
                    .allowed_types
                    .iter()
                    .any(|a| a.trim_start_matches('.').eq_ignore_ascii_case(ext.trim_start_matches('.')))
            });
            if !allowed {
                return Err(TransferError::TypeBlocked(format!(
                    "extension {} is not in the allow-list",
                    ext.unwrap_or_else(|| "(none)".to_string())
                )));
            }
        }

        if request.file_size > config.max_file_size {
            return Err(TransferError::SizeExceeded {
                size: request.file_size,
                max: config.max_file_size,
            });
        }
        Ok(())
    }

    /// Immediate pending → rejected, used for policy failures at request time.
    fn reject_now(&self, handle: &Arc<TransferHandle>, reason: String) {
        let (transfer_id, session_id, filename) = {
            let mut record = handle.record.write();
            record.status = TransferStatus::Rejected;
            record.end_time = Some(Utc::now());
            record.error = Some(reason.clone());
            (
                record.id.clone(),
                record.session_id.clone(),
                record.filename.clone(),
            )
        };
        self.audit.log(
            AuditEvent::new("transfer_rejected")
                .session(&session_id)
                .transfer(&transfer_id)
                .filename(&filename)
                .failure(reason.clone()),
        );
        self.emit_status(
            &session_id,
            &transfer_id,
            TransferStatus::Rejected,
            Some(reason),
        );
    }

    /// Approval decision for a pending transfer. On approve the temp file is
    /// allocated and the stream starts; on reject resources are released.
    pub async fn approve(
        self: &Arc<Self>,
        transfer_id: &str,
        approved: bool,
        message: Option<String>,
    ) -> TransferResult<()> {
        let handle = self.handle(transfer_id)?;

        {
            let record = handle.record.read();
            if record.status != TransferStatus::Pending {
                return Err(TransferError::InvalidState {
                    op: "approve",
                    status: record.status,
                });
            }
        }

        if !approved {
            let session_id = {
                let mut record = handle.record.write();
                record.status = transition(record.status, TransferEvent::Reject)?;
                record.end_time = Some(Utc::now());
                record.error = message.clone();
                record.session_id.clone()
            };
            self.audit.log(
                AuditEvent::new("transfer_rejected")
                    .session(&session_id)
                    .transfer(transfer_id)
                    .failure(message.clone().unwrap_or_else(|| "declined".to_string())),
            );
            self.registry.broadcast(
                &session_id,
                &Envelope::TransferApproval {
                    transfer_id: transfer_id.to_string(),
                    approved: false,
                    message: message.clone(),
                },
            );
            self.emit_status(&session_id, transfer_id, TransferStatus::Rejected, message);
            return Ok(());
        }

        // The cap is enforced again here: approvals are what actually
        // consume a slot (seed scenario: the third approval fails).
        let active = self.active_count();
        if active >= handle.config.max_concurrent {
            return Err(TransferError::LimitExceeded(active));
        }

        let (session_id, direction, filename, temp_path) = {
            let mut record = handle.record.write();
            record.status = transition(record.status, TransferEvent::Approve)?;
            record.approved_at = Some(Utc::now());
            let temp_path = handle
                .config
                .temp_dir
                .join(format!("transfer_{}_{}", record.id, record.filename));
            record.temp_path = Some(temp_path.clone());
            (
                record.session_id.clone(),
                record.direction,
                record.filename.clone(),
                temp_path,
            )
        };

        tokio::fs::create_dir_all(&handle.config.temp_dir).await?;

        self.audit.log(
            AuditEvent::new("transfer_approved")
                .session(&session_id)
                .transfer(transfer_id)
                .filename(&filename),
        );
        self.registry.broadcast(
            &session_id,
            &Envelope::TransferApproval {
                transfer_id: transfer_id.to_string(),
                approved: true,
                message,
            },
        );

        match direction {
            TransferDirection::Upload => self.start_upload(&handle, &temp_path).await?,
            TransferDirection::Download => self.start_download(&handle, &temp_path).await?,
        }

        self.sessions.record_transfer_started(&session_id);
        Ok(())
    }

    async fn start_upload(
        self: &Arc<Self>,
        handle: &Arc<TransferHandle>,
        temp_path: &std::path::Path,
    ) -> TransferResult<()> {
        let file = match tokio::fs::File::create(temp_path).await {
            Ok(file) => file,
            Err(e) => {
                self.fail(handle, format!("cannot create temp file: {e}")).await;
                return Err(e.into());
            }
        };

        let zero_byte = handle.record.read().total_chunks == 0;
        if zero_byte {
            drop(file);
            self.complete(handle).await?;
            return Ok(());
        }

        *handle.file.lock().await = Some(file);
        self.mark_started(handle)?;
        Ok(())
    }

    async fn start_download(
        self: &Arc<Self>,
        handle: &Arc<TransferHandle>,
        temp_path: &std::path::Path,
    ) -> TransferResult<()> {
        let (transfer_id, source, expected) = {
            let record = handle.record.read();
            (
                record.id.clone(),
                record.source_path.clone(),
                record.expected_checksum.clone(),
            )
        };
        let Some(source) = source else {
            let reason = "download has no staged source file".to_string();
            self.fail(handle, reason.clone()).await;
            return Err(TransferError::NotFound(reason));
        };

        if let Err(e) = tokio::fs::copy(&source, temp_path).await {
            self.fail(handle, format!("cannot stage source file: {e}")).await;
            return Err(e.into());
        }
        let staged_size = tokio::fs::metadata(temp_path).await?.len();

        if let Some(expected) = &expected {
            if let Err(e) = verify_file_checksum(temp_path, expected).await {
                self.fail(handle, format!("source checksum mismatch: {e}")).await;
                return Err(e.into());
            }
        }

        let zero_byte = {
            let mut record = handle.record.write();
            record.set_file_size(staged_size);
            record.total_chunks == 0
        };
        if zero_byte {
            self.complete(handle).await?;
            return Ok(());
        }

        self.mark_started(handle)?;
        let engine = self.clone();
        let worker_handle = handle.clone();
        tokio::spawn(async move {
            run_download_sender(engine, worker_handle, transfer_id).await;
        });
        Ok(())
    }

    fn mark_started(&self, handle: &Arc<TransferHandle>) -> TransferResult<()> {
        let (transfer_id, session_id) = {
            let mut record = handle.record.write();
            record.status = transition(record.status, TransferEvent::Start)?;
            (record.id.clone(), record.session_id.clone())
        };
        self.audit.log(
            AuditEvent::new("transfer_started")
                .session(&session_id)
                .transfer(&transfer_id),
        );
        self.emit_status(&session_id, &transfer_id, TransferStatus::InProgress, None);
        Ok(())
    }

    /// Accept one upload chunk frame. Duplicates are re-acked but not
    /// re-applied; checksum mismatches trigger retransmission rather than
    /// failure until the per-chunk retry budget runs out.
    pub async fn write_chunk(
        &self,
        session_id: &str,
        header: ChunkFrameHeader,
        payload: Bytes,
    ) -> TransferResult<()> {
        let handle = self.handle(&header.transfer_id)?;
        let index = header.chunk_index;

        let (offset, duplicate) = {
            let record = handle.record.read();
            if record.session_id != session_id {
                return Err(TransferError::BadChunk(format!(
                    "chunk addressed to transfer of another session ({})",
                    record.session_id
                )));
            }
            if record.status != TransferStatus::InProgress {
                return Err(TransferError::InvalidState {
                    op: "write_chunk",
                    status: record.status,
                });
            }
            if record.direction != TransferDirection::Upload {
                return Err(TransferError::BadChunk(
                    "binary chunks only flow client → broker on uploads".to_string(),
                ));
            }
            if index >= record.total_chunks {
                return Err(TransferError::ChunkOutOfRange {
                    index,
                    total: record.total_chunks,
                });
            }
            if header.is_last != (index == record.total_chunks - 1) {
                return Err(TransferError::BadChunk(format!(
                    "is_last flag wrong for chunk {index}"
                )));
            }
            if payload.len() != record.chunk_len(index) {
                return Err(TransferError::BadChunk(format!(
                    "chunk {index} has {} bytes, expected {}",
                    payload.len(),
                    record.chunk_len(index)
                )));
            }
            (
                index as u64 * record.chunk_size as u64,
                record.completed_chunks.contains(&index),
            )
        };

        if duplicate {
            // Idempotent: acknowledge again without touching the file.
            self.registry.send_envelope(
                session_id,
                PeerRole::Client,
                &Envelope::ChunkAck {
                    transfer_id: header.transfer_id.clone(),
                    chunk_index: index,
                },
            );
            return Ok(());
        }

        if !sha256_bytes(&payload).eq_ignore_ascii_case(&header.checksum) {
            return self.chunk_integrity_failure(&handle, session_id, index).await;
        }

        let write_result = {
            let mut guard = handle.file.lock().await;
            match guard.as_mut() {
                Some(file) => async {
                    file.seek(SeekFrom::Start(offset)).await?;
                    file.write_all(&payload).await?;
                    Ok::<(), std::io::Error>(())
                }
                .await,
                None => {
                    return Err(TransferError::InvalidState {
                        op: "write_chunk",
                        status: handle.record.read().status,
                    })
                }
            }
        };
        if let Err(e) = write_result {
            self.fail(&handle, format!("chunk write failed: {e}")).await;
            return Err(e.into());
        }

        let (transfer_id, completed_all) = {
            let mut record = handle.record.write();
            if record.status != TransferStatus::InProgress {
                // Cancelled or failed while the write was in flight.
                return Ok(());
            }
            record.completed_chunks.insert(index);
            record.failed_chunks.remove(&index);
            record.bytes_transferred += payload.len() as u64;
            (record.id.clone(), record.is_complete())
        };

        handle.speed.lock().record(payload.len() as u64);
        self.sessions.record_bytes(session_id, payload.len() as u64);
        self.registry.send_envelope(
            session_id,
            PeerRole::Client,
            &Envelope::ChunkAck {
                transfer_id,
                chunk_index: index,
            },
        );
        self.maybe_emit_progress(&handle, false);

        if completed_all {
            self.finalize_upload(&handle).await?;
        }
        Ok(())
    }

    async fn chunk_integrity_failure(
        &self,
        handle: &Arc<TransferHandle>,
        session_id: &str,
        index: u32,
    ) -> TransferResult<()> {
        let (transfer_id, attempts) = {
            let mut record = handle.record.write();
            let attempts = {
                let entry = record.failed_chunks.entry(index).or_insert(0);
                *entry += 1;
                *entry
            };
            (record.id.clone(), attempts)
        };

        if attempts > handle.config.max_chunk_retries {
            self.fail(
                handle,
                format!("chunk {index} failed integrity check {attempts} times"),
            )
            .await;
            return Err(TransferError::RetriesExhausted { index, attempts });
        }

        tracing::debug!(
            transfer_id,
            index,
            attempts,
            "chunk checksum mismatch, requesting retransmission"
        );
        self.registry.send_envelope(
            session_id,
            PeerRole::Client,
            &Envelope::ChunkRetransmissionRequest {
                transfer_id,
                chunk_index: index,
            },
        );
        Ok(())
    }

    async fn finalize_upload(&self, handle: &Arc<TransferHandle>) -> TransferResult<()> {
        // Close the temp file before verification.
        if let Some(mut file) = handle.file.lock().await.take() {
            file.sync_all().await?;
        }

        let (temp_path, expected) = {
            let record = handle.record.read();
            (record.temp_path.clone(), record.expected_checksum.clone())
        };

        if let (Some(path), Some(expected)) = (&temp_path, &expected) {
            if let Err(e) = verify_file_checksum(path, expected).await {
                self.fail(handle, format!("whole-file checksum mismatch: {e}")).await;
                return Err(e.into());
            }
        }

        if handle.config.encrypt_files {
            if let (Some(cryptor), Some(path)) = (&self.cryptor, &temp_path) {
                cryptor.encrypt_file(path).await?;
            }
        }

        self.complete(handle).await
    }

    async fn complete(&self, handle: &Arc<TransferHandle>) -> TransferResult<()> {
        let (transfer_id, session_id, filename, file_size, direction, temp_path) = {
            let mut record = handle.record.write();
            record.status = transition(record.status, TransferEvent::Complete)?;
            record.end_time = Some(Utc::now());
            (
                record.id.clone(),
                record.session_id.clone(),
                record.filename.clone(),
                record.file_size,
                record.direction,
                record.temp_path.clone(),
            )
        };

        // The served copy of a download is not needed once delivered.
        if direction == TransferDirection::Download {
            if let Some(path) = temp_path {
                let _ = tokio::fs::remove_file(&path).await;
            }
        }

        self.audit.log(
            AuditEvent::new("transfer_completed")
                .session(&session_id)
                .transfer(&transfer_id)
                .filename(&filename)
                .file_size(file_size),
        );
        self.sessions.record_transfer_completed(&session_id);
        self.maybe_emit_progress(handle, true);
        self.emit_status(&session_id, &transfer_id, TransferStatus::Completed, None);
        Ok(())
    }

    /// Ack from the client for a download chunk. Completion is ack-driven.
    pub async fn handle_chunk_ack(&self, transfer_id: &str, chunk_index: u32) -> TransferResult<()> {
        let handle = self.handle(transfer_id)?;

        let accepted = {
            let mut record = handle.record.write();
            if record.direction != TransferDirection::Download
                || record.status != TransferStatus::InProgress
            {
                return Ok(());
            }
            if chunk_index >= record.total_chunks {
                return Err(TransferError::ChunkOutOfRange {
                    index: chunk_index,
                    total: record.total_chunks,
                });
            }
            if !record.completed_chunks.insert(chunk_index) {
                None
            } else {
                record.failed_chunks.remove(&chunk_index);
                let len = record.chunk_len(chunk_index) as u64;
                record.bytes_transferred += len;
                Some((len, record.session_id.clone(), record.is_complete()))
            }
        };

        let Some((len, session_id, completed_all)) = accepted else {
            return Ok(());
        };

        handle.retransmit.lock().remove(&chunk_index);
        handle.speed.lock().record(len);
        self.sessions.record_bytes(&session_id, len);
        self.maybe_emit_progress(&handle, false);

        if completed_all {
            self.complete(&handle).await?;
        }
        Ok(())
    }

    /// Receiver-initiated resend request; takes precedence over the
    /// sender's own retry timer.
    pub fn handle_retransmission_request(
        &self,
        transfer_id: &str,
        chunk_index: u32,
    ) -> TransferResult<()> {
        let handle = self.handle(transfer_id)?;
        {
            let record = handle.record.read();
            if record.direction != TransferDirection::Download {
                return Ok(());
            }
            if chunk_index >= record.total_chunks {
                return Err(TransferError::ChunkOutOfRange {
                    index: chunk_index,
                    total: record.total_chunks,
                });
            }
        }
        handle.retransmit.lock().insert(chunk_index);
        Ok(())
    }

    /// Idempotent pause: pausing a paused transfer is a no-op.
    pub fn pause(&self, transfer_id: &str) -> TransferResult<()> {
        let handle = self.handle(transfer_id)?;
        let session_id = {
            let mut record = handle.record.write();
            if record.status == TransferStatus::Paused {
                return Ok(());
            }
            record.status = transition(record.status, TransferEvent::Pause)?;
            record.session_id.clone()
        };
        handle.flags.pause();

        self.audit.log(
            AuditEvent::new("transfer_paused")
                .session(&session_id)
                .transfer(transfer_id),
        );
        self.emit_status(&session_id, transfer_id, TransferStatus::Paused, None);
        Ok(())
    }

    /// Idempotent resume: resuming a running transfer is a no-op.
    pub fn resume(&self, transfer_id: &str) -> TransferResult<()> {
        let handle = self.handle(transfer_id)?;
        let session_id = {
            let mut record = handle.record.write();
            if record.status == TransferStatus::InProgress {
                return Ok(());
            }
            record.status = transition(record.status, TransferEvent::Resume)?;
            record.session_id.clone()
        };
        handle.flags.resume();

        self.audit.log(
            AuditEvent::new("transfer_resumed")
                .session(&session_id)
                .transfer(transfer_id),
        );
        self.emit_status(&session_id, transfer_id, TransferStatus::InProgress, None);
        Ok(())
    }

    /// Cancel wins over pause and is a no-op on terminal transfers.
    pub async fn cancel(&self, transfer_id: &str) -> TransferResult<()> {
        let handle = self.handle(transfer_id)?;
        let (session_id, temp_path, direction) = {
            let mut record = handle.record.write();
            if record.status.is_terminal() {
                return Ok(());
            }
            record.status = transition(record.status, TransferEvent::Cancel)?;
            record.end_time = Some(Utc::now());
            (
                record.session_id.clone(),
                record.temp_path.take(),
                record.direction,
            )
        };
        handle.flags.stop();

        if let Some(mut file) = handle.file.lock().await.take() {
            let _ = file.sync_all().await;
        }
        if let Some(path) = temp_path {
            remove_transfer_file(&path, direction).await;
        }

        self.audit.log(
            AuditEvent::new("transfer_cancelled")
                .session(&session_id)
                .transfer(transfer_id),
        );
        self.emit_status(&session_id, transfer_id, TransferStatus::Cancelled, None);
        Ok(())
    }

    /// Transition to failed, release resources, notify. Quiet no-op when
    /// the record already reached a terminal state.
    pub(crate) async fn fail(&self, handle: &Arc<TransferHandle>, reason: String) {
        let info = {
            let mut record = handle.record.write();
            match transition(record.status, TransferEvent::Fail) {
                Ok(next) => {
                    record.status = next;
                    record.error = Some(reason.clone());
                    record.end_time = Some(Utc::now());
                    Some((
                        record.id.clone(),
                        record.session_id.clone(),
                        record.temp_path.take(),
                        record.direction,
                    ))
                }
                Err(_) => None,
            }
        };
        let Some((transfer_id, session_id, temp_path, direction)) = info else {
            return;
        };
        handle.flags.stop();

        if let Some(mut file) = handle.file.lock().await.take() {
            let _ = file.sync_all().await;
        }
        if let Some(path) = temp_path {
            remove_transfer_file(&path, direction).await;
        }

        self.audit.log(
            AuditEvent::new("transfer_failed")
                .session(&session_id)
                .transfer(&transfer_id)
                .failure(reason.clone()),
        );
        self.emit_status(
            &session_id,
            &transfer_id,
            TransferStatus::Failed,
            Some(reason),
        );
    }

    pub fn progress(&self, transfer_id: &str) -> TransferResult<TransferProgress> {
        let handle = self.handle(transfer_id)?;
        Ok(build_progress(&handle))
    }

    /// Read back a completed upload, transparently decrypting at-rest
    /// ciphertext. Serves the REST download endpoint.
    pub async fn read_completed_file(
        &self,
        transfer_id: &str,
    ) -> TransferResult<(String, Vec<u8>)> {
        let handle = self.handle(transfer_id)?;
        let (filename, temp_path, status) = {
            let record = handle.record.read();
            (
                record.filename.clone(),
                record.temp_path.clone(),
                record.status,
            )
        };
        if status != TransferStatus::Completed {
            return Err(TransferError::InvalidState {
                op: "download",
                status,
            });
        }
        let path = temp_path.ok_or_else(|| TransferError::NotFound(transfer_id.to_string()))?;
        let data = tokio::fs::read(&path).await?;

        let data = if handle.config.encrypt_files {
            match &self.cryptor {
                Some(cryptor) => cryptor.decrypt_bytes(&data)?,
                None => data,
            }
        } else {
            data
        };
        Ok((filename, data))
    }

    /// One cleanup pass: wall-clock transfer timeouts, terminal-record
    /// purge, and dangling temp files nothing references any more.
    pub async fn sweep(&self) {
        let now = Utc::now();

        let mut stale = Vec::new();
        let mut purge = Vec::new();
        for entry in self.transfers.iter() {
            let record = entry.value().record.read();
            if record.status.is_streaming() {
                if let Some(approved_at) = record.approved_at {
                    let age = (now - approved_at).num_seconds().max(0) as u64;
                    if age > entry.value().config.transfer_timeout_secs {
                        stale.push(entry.value().clone());
                    }
                }
            } else if record.status.is_terminal() {
                let closed_at = record.end_time.unwrap_or(record.requested_at);
                if (now - closed_at).num_seconds() > PURGE_GRACE_SECS {
                    purge.push((record.id.clone(), record.temp_path.clone()));
                }
            }
        }

        for handle in stale {
            self.fail(&handle, "transfer timed out".to_string()).await;
        }
        for (transfer_id, temp_path) in purge {
            if let Some(path) = temp_path {
                let _ = tokio::fs::remove_file(&path).await;
            }
            self.transfers.remove(&transfer_id);
        }

        self.remove_dangling_temp_files().await;
    }

    async fn remove_dangling_temp_files(&self) {
        let temp_dir = self.config.snapshot().transfer.temp_dir.clone();
        let referenced: HashSet<PathBuf> = self
            .transfers
            .iter()
            .filter_map(|e| e.value().record.read().temp_path.clone())
            .collect();

        let Ok(mut entries) = tokio::fs::read_dir(&temp_dir).await else {
            return;
        };
        let cutoff = std::time::SystemTime::now() - Duration::from_secs(3600);
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if referenced.contains(&path) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_file() && meta.modified().map(|m| m < cutoff).unwrap_or(false) {
                tracing::debug!(path = %path.display(), "removing dangling temp file");
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
    }

    fn emit_status(
        &self,
        session_id: &str,
        transfer_id: &str,
        status: TransferStatus,
        error: Option<String>,
    ) {
        self.registry.broadcast(
            session_id,
            &Envelope::TransferStatusUpdate {
                transfer_id: transfer_id.to_string(),
                status,
                error,
            },
        );
    }

    /// Progress envelopes are capped at one per second per transfer
    /// regardless of chunk rate; `force` bypasses the cap for terminal
    /// updates.
    fn maybe_emit_progress(&self, handle: &Arc<TransferHandle>, force: bool) {
        {
            let mut last = handle.last_progress.lock();
            if !force {
                if let Some(at) = *last {
                    if at.elapsed() < PROGRESS_INTERVAL {
                        return;
                    }
                }
            }
            *last = Some(Instant::now());
        }

        let progress = build_progress(handle);
        let session_id = handle.record.read().session_id.clone();
        self.registry.broadcast(
            &session_id,
            &Envelope::ProgressResponse {
                transfer_id: progress.transfer_id.clone(),
                progress,
            },
        );
    }
}

fn build_progress(handle: &Arc<TransferHandle>) -> TransferProgress {
    let record = handle.record.read();
    let mut speed = handle.speed.lock();
    let current_speed_bps = speed.bytes_per_sec();
    let remaining = record.file_size.saturating_sub(record.bytes_transferred);
    let eta_secs = if record.status == TransferStatus::InProgress {
        speed.eta_secs(remaining)
    } else {
        None
    };
    TransferProgress {
        transfer_id: record.id.clone(),
        bytes_transferred: record.bytes_transferred,
        total_bytes: record.file_size,
        progress_percent: record.progress_percent(),
        current_speed_bps,
        eta_secs,
        status: record.status,
    }
}

async fn remove_transfer_file(path: &std::path::Path, direction: TransferDirection) {
    match direction {
        // Download payloads get the overwrite treatment; best-effort.
        TransferDirection::Download => {
            if secure_delete(path).await.is_err() {
                let _ = tokio::fs::remove_file(path).await;
            }
        }
        TransferDirection::Upload => {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::router::registry::{OutboundFrame, PeerHandle};
    use crate::session::types::ClientInfo;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Harness {
        _dir: TempDir,
        temp_dir: PathBuf,
        engine: Arc<TransferEngine>,
        sessions: Arc<SessionManager>,
        registry: Arc<Registry>,
        session_id: String,
    }

    async fn harness() -> Harness {
        harness_with(|_| {}).await
    }

    async fn harness_with(tweak: impl FnOnce(&mut BrokerConfig)) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config = BrokerConfig::default();
        config.transfer.temp_dir = dir.path().join("transfer_tmp");
        config.security.quarantine_dir = dir.path().join("quarantine");
        tweak(&mut config);
        let temp_dir = config.transfer.temp_dir.clone();

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
        let cryptor = config
            .snapshot()
            .security
            .encryption_key_bytes()
            .unwrap()
            .map(|key| Arc::new(FileCryptor::new(&key).unwrap()));
        let engine = Arc::new(TransferEngine::new(
            config,
            validator,
            cryptor,
            audit,
            registry.clone(),
            sessions.clone(),
        ));
        let session_id = sessions
            .create_session("client-1", "tech-1", ClientInfo::default())
            .unwrap();

        Harness {
            _dir: dir,
            temp_dir,
            engine,
            sessions,
            registry,
            session_id,
        }
    }

    fn attach_client(h: &Harness) -> mpsc::Receiver<OutboundFrame> {
        let (handle, rx) = PeerHandle::channel("client-conn".to_string());
        h.registry.register(&h.session_id, PeerRole::Client, handle);
        rx
    }

    fn upload_request(filename: &str, data: &[u8]) -> TransferRequest {
        TransferRequest {
            filename: filename.to_string(),
            file_size: data.len() as u64,
            checksum: Some(sha256_bytes(data)),
            direction: TransferDirection::Upload,
            source_path: None,
            requested_by: Some("tech-1".to_string()),
        }
    }

    fn good_frame(transfer_id: &str, index: u32, payload: &[u8], total: u32) -> ChunkFrameHeader {
        ChunkFrameHeader {
            transfer_id: transfer_id.to_string(),
            chunk_index: index,
            checksum: sha256_bytes(payload),
            is_last: index == total - 1,
        }
    }

    fn test_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn push_all_chunks(h: &Harness, transfer_id: &str, data: &[u8]) -> TransferResult<()> {
        let chunk_size = 64 * 1024;
        let total = data.len().div_ceil(chunk_size) as u32;
        for index in 0..total {
            let start = index as usize * chunk_size;
            let end = (start + chunk_size).min(data.len());
            let payload = &data[start..end];
            h.engine
                .write_chunk(
                    &h.session_id,
                    good_frame(transfer_id, index, payload, total),
                    Bytes::copy_from_slice(payload),
                )
                .await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_pause_waiter_woken_by_resume() {
        let flags = Arc::new(TransferFlags::new());
        flags.pause();

        let waiter_flags = flags.clone();
        let waiter = tokio::spawn(async move { waiter_flags.wait_while_paused().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        flags.resume();
        let paused_for = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("resume did not wake the pause waiter")
            .unwrap();
        assert!(paused_for >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_pause_waiter_woken_by_stop() {
        let flags = Arc::new(TransferFlags::new());
        flags.pause();

        let waiter_flags = flags.clone();
        let waiter = tokio::spawn(async move { waiter_flags.wait_while_paused().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        // Cancel wins over pause and must unblock the waiter.
        flags.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("stop did not wake the pause waiter")
            .unwrap();
    }

    #[tokio::test]
    async fn test_happy_path_upload() {
        let h = harness().await;
        let data = test_bytes(200_000);

        let transfer_id = h
            .engine
            .create_transfer(&h.session_id, upload_request("notes.txt", &data))
            .unwrap();
        assert_eq!(
            h.engine.get(&transfer_id).unwrap().status,
            TransferStatus::Pending
        );
        assert_eq!(h.engine.get(&transfer_id).unwrap().total_chunks, 4);

        h.engine.approve(&transfer_id, true, None).await.unwrap();
        assert_eq!(
            h.engine.get(&transfer_id).unwrap().status,
            TransferStatus::InProgress
        );

        push_all_chunks(&h, &transfer_id, &data).await.unwrap();

        let summary = h.engine.get(&transfer_id).unwrap();
        assert_eq!(summary.status, TransferStatus::Completed);
        assert_eq!(summary.bytes_transferred, 200_000);
        assert_eq!(summary.completed_chunks, 4);

        let temp = h.temp_dir.join(format!("transfer_{transfer_id}_notes.txt"));
        let written = tokio::fs::read(&temp).await.unwrap();
        assert_eq!(written, data);
    }

    #[tokio::test]
    async fn test_upload_acks_every_chunk() {
        let h = harness().await;
        let mut rx = attach_client(&h);
        let data = test_bytes(200_000);

        let transfer_id = h
            .engine
            .create_transfer(&h.session_id, upload_request("notes.txt", &data))
            .unwrap();
        h.engine.approve(&transfer_id, true, None).await.unwrap();
        push_all_chunks(&h, &transfer_id, &data).await.unwrap();

        let mut acked = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let OutboundFrame::Text(text) = frame {
                if let Ok(Envelope::ChunkAck { chunk_index, .. }) = Envelope::parse(&text) {
                    acked.push(chunk_index);
                }
            }
        }
        assert_eq!(acked, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_reject_by_extension() {
        let h = harness().await;
        let result = h.engine.create_transfer(
            &h.session_id,
            TransferRequest {
                filename: "payload.exe".to_string(),
                file_size: 1000,
                checksum: None,
                direction: TransferDirection::Upload,
                source_path: None,
                requested_by: None,
            },
        );

        match result {
            Err(TransferError::Security(e)) => assert!(e.to_string().contains(".exe")),
            other => panic!("expected blocked extension, got {other:?}"),
        }
        // The record is kept in `rejected` for the audit trail; no temp file.
        let rejected: Vec<_> = h
            .engine
            .list()
            .into_iter()
            .filter(|t| t.status == TransferStatus::Rejected)
            .collect();
        assert_eq!(rejected.len(), 1);
        assert!(rejected[0].error.as_ref().unwrap().contains(".exe"));
        assert!(!h.temp_dir.exists() || std::fs::read_dir(&h.temp_dir).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_allow_list_blocks_unlisted_types() {
        let h = harness_with(|c| c.transfer.allowed_types = vec![".txt".to_string()]).await;

        assert!(h
            .engine
            .create_transfer(&h.session_id, upload_request("notes.txt", b"ok"))
            .is_ok());
        assert!(matches!(
            h.engine
                .create_transfer(&h.session_id, upload_request("photo.png", b"ok")),
            Err(TransferError::TypeBlocked(_))
        ));
    }

    #[tokio::test]
    async fn test_size_boundary() {
        let h = harness_with(|c| c.transfer.max_file_size = 1000).await;

        let mut request = upload_request("a.txt", b"");
        request.file_size = 1000;
        assert!(h.engine.create_transfer(&h.session_id, request).is_ok());

        let mut request = upload_request("b.txt", b"");
        request.file_size = 1001;
        assert!(matches!(
            h.engine.create_transfer(&h.session_id, request),
            Err(TransferError::SizeExceeded { size: 1001, max: 1000 })
        ));
    }

    #[tokio::test]
    async fn test_reject_releases_pending() {
        let h = harness().await;
        let transfer_id = h
            .engine
            .create_transfer(&h.session_id, upload_request("notes.txt", b"data"))
            .unwrap();

        h.engine
            .approve(&transfer_id, false, Some("not now".to_string()))
            .await
            .unwrap();
        let summary = h.engine.get(&transfer_id).unwrap();
        assert_eq!(summary.status, TransferStatus::Rejected);

        // Approving a rejected transfer is invalid.
        assert!(matches!(
            h.engine.approve(&transfer_id, true, None).await,
            Err(TransferError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_zero_byte_upload_completes_without_chunks() {
        let h = harness().await;
        let transfer_id = h
            .engine
            .create_transfer(&h.session_id, upload_request("empty.txt", b""))
            .unwrap();
        assert_eq!(h.engine.get(&transfer_id).unwrap().total_chunks, 0);

        h.engine.approve(&transfer_id, true, None).await.unwrap();
        let summary = h.engine.get(&transfer_id).unwrap();
        assert_eq!(summary.status, TransferStatus::Completed);
        assert_eq!(summary.bytes_transferred, 0);
    }

    #[tokio::test]
    async fn test_duplicate_chunk_is_idempotent() {
        let h = harness().await;
        let data = test_bytes(64 * 1024);
        let transfer_id = h
            .engine
            .create_transfer(&h.session_id, upload_request("one.bin", &data))
            .unwrap();
        h.engine.approve(&transfer_id, true, None).await.unwrap();

        let frame = good_frame(&transfer_id, 0, &data, 1);
        h.engine
            .write_chunk(&h.session_id, frame.clone(), Bytes::copy_from_slice(&data))
            .await
            .unwrap();

        let after_first = h.engine.get(&transfer_id).unwrap();
        assert_eq!(after_first.status, TransferStatus::Completed);
        assert_eq!(after_first.bytes_transferred, data.len() as u64);

        // Replayed frame: acknowledged, not re-applied.
        h.engine
            .write_chunk(&h.session_id, frame, Bytes::copy_from_slice(&data))
            .await
            .unwrap();
        let after_second = h.engine.get(&transfer_id).unwrap();
        assert_eq!(after_second.bytes_transferred, data.len() as u64);

        let temp = h.temp_dir.join(format!("transfer_{transfer_id}_one.bin"));
        assert_eq!(tokio::fs::read(&temp).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_chunk_retry_then_success() {
        let h = harness().await;
        let mut rx = attach_client(&h);
        let data = test_bytes(200_000);
        let transfer_id = h
            .engine
            .create_transfer(&h.session_id, upload_request("notes.txt", &data))
            .unwrap();
        h.engine.approve(&transfer_id, true, None).await.unwrap();

        let chunk2 = &data[2 * 64 * 1024..3 * 64 * 1024];
        let mut bad = good_frame(&transfer_id, 2, chunk2, 4);
        bad.checksum = sha256_bytes(b"corrupted");

        // Two corrupt deliveries of index 2.
        for _ in 0..2 {
            h.engine
                .write_chunk(&h.session_id, bad.clone(), Bytes::copy_from_slice(chunk2))
                .await
                .unwrap();
        }

        let retransmissions: Vec<u32> = {
            let mut seen = Vec::new();
            while let Ok(frame) = rx.try_recv() {
                if let OutboundFrame::Text(text) = frame {
                    if let Ok(Envelope::ChunkRetransmissionRequest { chunk_index, .. }) =
                        Envelope::parse(&text)
                    {
                        seen.push(chunk_index);
                    }
                }
            }
            seen
        };
        assert_eq!(retransmissions, vec![2, 2]);

        push_all_chunks(&h, &transfer_id, &data).await.unwrap();
        assert_eq!(
            h.engine.get(&transfer_id).unwrap().status,
            TransferStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_chunk_retries_exhausted_fails_transfer() {
        let h = harness().await;
        let data = test_bytes(200_000);
        let transfer_id = h
            .engine
            .create_transfer(&h.session_id, upload_request("notes.txt", &data))
            .unwrap();
        h.engine.approve(&transfer_id, true, None).await.unwrap();

        let chunk0 = &data[..64 * 1024];
        let mut bad = good_frame(&transfer_id, 0, chunk0, 4);
        bad.checksum = sha256_bytes(b"corrupted");

        for _ in 0..3 {
            h.engine
                .write_chunk(&h.session_id, bad.clone(), Bytes::copy_from_slice(chunk0))
                .await
                .unwrap();
        }
        let result = h
            .engine
            .write_chunk(&h.session_id, bad, Bytes::copy_from_slice(chunk0))
            .await;
        assert!(matches!(
            result,
            Err(TransferError::RetriesExhausted { index: 0, .. })
        ));

        let summary = h.engine.get(&transfer_id).unwrap();
        assert_eq!(summary.status, TransferStatus::Failed);
        let temp = h.temp_dir.join(format!("transfer_{transfer_id}_notes.txt"));
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn test_whole_file_checksum_mismatch_fails() {
        let h = harness().await;
        let data = test_bytes(100_000);
        let mut request = upload_request("notes.txt", &data);
        request.checksum = Some(sha256_bytes(b"some other file"));

        let transfer_id = h.engine.create_transfer(&h.session_id, request).unwrap();
        h.engine.approve(&transfer_id, true, None).await.unwrap();

        let result = push_all_chunks(&h, &transfer_id, &data).await;
        assert!(result.is_err());
        assert_eq!(
            h.engine.get(&transfer_id).unwrap().status,
            TransferStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_pause_blocks_bytes_and_is_idempotent() {
        let h = harness().await;
        let data = test_bytes(200_000);
        let transfer_id = h
            .engine
            .create_transfer(&h.session_id, upload_request("notes.txt", &data))
            .unwrap();
        h.engine.approve(&transfer_id, true, None).await.unwrap();

        let chunk0 = &data[..64 * 1024];
        h.engine
            .write_chunk(
                &h.session_id,
                good_frame(&transfer_id, 0, chunk0, 4),
                Bytes::copy_from_slice(chunk0),
            )
            .await
            .unwrap();

        h.engine.pause(&transfer_id).unwrap();
        h.engine.pause(&transfer_id).unwrap(); // no-op
        assert_eq!(
            h.engine.get(&transfer_id).unwrap().status,
            TransferStatus::Paused
        );

        // Bytes in paused state are a fault and do not mutate anything.
        let chunk1 = &data[64 * 1024..2 * 64 * 1024];
        let result = h
            .engine
            .write_chunk(
                &h.session_id,
                good_frame(&transfer_id, 1, chunk1, 4),
                Bytes::copy_from_slice(chunk1),
            )
            .await;
        assert!(matches!(result, Err(TransferError::InvalidState { .. })));
        assert_eq!(
            h.engine.get(&transfer_id).unwrap().bytes_transferred,
            64 * 1024
        );

        h.engine.resume(&transfer_id).unwrap();
        h.engine.resume(&transfer_id).unwrap(); // no-op
        push_all_chunks(&h, &transfer_id, &data).await.unwrap();
        let summary = h.engine.get(&transfer_id).unwrap();
        assert_eq!(summary.status, TransferStatus::Completed);
        assert_eq!(summary.bytes_transferred, 200_000);
    }

    #[tokio::test]
    async fn test_cancel_removes_temp_and_is_noop_after() {
        let h = harness().await;
        let data = test_bytes(200_000);
        let transfer_id = h
            .engine
            .create_transfer(&h.session_id, upload_request("notes.txt", &data))
            .unwrap();
        h.engine.approve(&transfer_id, true, None).await.unwrap();

        let temp = h.temp_dir.join(format!("transfer_{transfer_id}_notes.txt"));
        assert!(temp.exists());

        h.engine.cancel(&transfer_id).await.unwrap();
        assert_eq!(
            h.engine.get(&transfer_id).unwrap().status,
            TransferStatus::Cancelled
        );
        assert!(!temp.exists());

        // Terminal: further control ops are no-ops.
        h.engine.cancel(&transfer_id).await.unwrap();
        assert!(matches!(
            h.engine.pause(&transfer_id),
            Err(TransferError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrency_cap_enforced_at_approval() {
        let h = harness_with(|c| c.transfer.max_concurrent = 2).await;

        let ids: Vec<String> = (0..3)
            .map(|i| {
                h.engine
                    .create_transfer(
                        &h.session_id,
                        upload_request(&format!("file{i}.txt"), b"payload"),
                    )
                    .unwrap()
            })
            .collect();

        h.engine.approve(&ids[0], true, None).await.unwrap();
        h.engine.approve(&ids[1], true, None).await.unwrap();
        assert!(matches!(
            h.engine.approve(&ids[2], true, None).await,
            Err(TransferError::LimitExceeded(2))
        ));
        // Still pending; a freed slot lets the approval succeed.
        assert_eq!(
            h.engine.get(&ids[2]).unwrap().status,
            TransferStatus::Pending
        );

        h.engine.cancel(&ids[0]).await.unwrap();
        h.engine.approve(&ids[2], true, None).await.unwrap();
        assert_eq!(
            h.engine.get(&ids[2]).unwrap().status,
            TransferStatus::InProgress
        );
    }

    #[tokio::test]
    async fn test_encrypted_at_rest() {
        let h = harness_with(|c| {
            c.transfer.encrypt_files = true;
            c.security.encryption_key = Some("ab".repeat(32));
        })
        .await;
        let data = test_bytes(100_000);
        let transfer_id = h
            .engine
            .create_transfer(&h.session_id, upload_request("secret.txt", &data))
            .unwrap();
        h.engine.approve(&transfer_id, true, None).await.unwrap();
        push_all_chunks(&h, &transfer_id, &data).await.unwrap();

        assert_eq!(
            h.engine.get(&transfer_id).unwrap().status,
            TransferStatus::Completed
        );

        // On disk: ciphertext. Through the engine: plaintext.
        let temp = h.temp_dir.join(format!("transfer_{transfer_id}_secret.txt"));
        let on_disk = tokio::fs::read(&temp).await.unwrap();
        assert_ne!(on_disk, data);

        let (filename, served) = h.engine.read_completed_file(&transfer_id).await.unwrap();
        assert_eq!(filename, "secret.txt");
        assert_eq!(served, data);
    }

    #[tokio::test]
    async fn test_download_flow_with_acks() {
        let h = harness().await;
        let mut rx = attach_client(&h);

        let data = test_bytes(150_000);
        let source = h._dir.path().join("staged.bin");
        tokio::fs::write(&source, &data).await.unwrap();

        let transfer_id = h
            .engine
            .create_transfer(
                &h.session_id,
                TransferRequest {
                    filename: "staged.bin".to_string(),
                    file_size: data.len() as u64,
                    checksum: Some(sha256_bytes(&data)),
                    direction: TransferDirection::Download,
                    source_path: Some(source.clone()),
                    requested_by: Some("tech-1".to_string()),
                },
            )
            .unwrap();
        h.engine.approve(&transfer_id, true, None).await.unwrap();

        // Drive the client side: receive frames, verify, ack.
        let mut received: Vec<(u32, Vec<u8>)> = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while received.len() < 3 {
            let frame = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("timed out waiting for chunk frames")
                .expect("peer channel closed");
            let OutboundFrame::Binary(bytes) = frame else {
                continue;
            };
            let (header, payload) = crate::router::frame::decode_chunk_frame(&bytes).unwrap();
            assert_eq!(header.transfer_id, transfer_id);
            assert_eq!(sha256_bytes(&payload), header.checksum);
            received.push((header.chunk_index, payload.to_vec()));
            h.engine
                .handle_chunk_ack(&transfer_id, header.chunk_index)
                .await
                .unwrap();
        }

        // Reassemble and compare.
        received.sort_by_key(|(i, _)| *i);
        let reassembled: Vec<u8> = received.into_iter().flat_map(|(_, p)| p).collect();
        assert_eq!(reassembled, data);

        // Completion is ack-driven.
        let mut status = h.engine.get(&transfer_id).unwrap().status;
        let wait_deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while status != TransferStatus::Completed && tokio::time::Instant::now() < wait_deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = h.engine.get(&transfer_id).unwrap().status;
        }
        assert_eq!(status, TransferStatus::Completed);

        // Served copy is cleaned up, source is untouched.
        let temp = h.temp_dir.join(format!("transfer_{transfer_id}_staged.bin"));
        assert!(!temp.exists());
        assert!(source.exists());
    }

    #[tokio::test]
    async fn test_download_missing_source_fails() {
        let h = harness().await;
        let transfer_id = h
            .engine
            .create_transfer(
                &h.session_id,
                TransferRequest {
                    filename: "ghost.bin".to_string(),
                    file_size: 100,
                    checksum: None,
                    direction: TransferDirection::Download,
                    source_path: Some(h._dir.path().join("missing.bin")),
                    requested_by: None,
                },
            )
            .unwrap();

        assert!(h.engine.approve(&transfer_id, true, None).await.is_err());
        assert_eq!(
            h.engine.get(&transfer_id).unwrap().status,
            TransferStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_sweep_times_out_stalled_transfer() {
        let h = harness().await;
        let data = test_bytes(100_000);
        let transfer_id = h
            .engine
            .create_transfer(&h.session_id, upload_request("slow.bin", &data))
            .unwrap();
        h.engine.approve(&transfer_id, true, None).await.unwrap();

        // Age the approval past the wall-clock budget.
        {
            let handle = h.engine.handle(&transfer_id).unwrap();
            handle.record.write().approved_at =
                Some(Utc::now() - chrono::Duration::minutes(31));
        }

        h.engine.sweep().await;
        let summary = h.engine.get(&transfer_id).unwrap();
        assert_eq!(summary.status, TransferStatus::Failed);
        assert!(summary.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_unknown_transfer() {
        let h = harness().await;
        assert!(matches!(
            h.engine.progress("nope"),
            Err(TransferError::NotFound(_))
        ));
        assert!(matches!(
            h.engine.pause("nope"),
            Err(TransferError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_session_stats_updated() {
        let h = harness().await;
        let data = test_bytes(64 * 1024);
        let transfer_id = h
            .engine
            .create_transfer(&h.session_id, upload_request("s.bin", &data))
            .unwrap();
        h.engine.approve(&transfer_id, true, None).await.unwrap();
        push_all_chunks(&h, &transfer_id, &data).await.unwrap();

        let stats = h.sessions.get(&h.session_id).unwrap().stats;
        assert_eq!(stats.transfers_started, 1);
        assert_eq!(stats.transfers_completed, 1);
        assert_eq!(stats.bytes_transferred, 64 * 1024);
    }

    #[tokio::test]
    async fn test_progress_reporting() {
        let h = harness().await;
        let data = test_bytes(200_000);
        let transfer_id = h
            .engine
            .create_transfer(&h.session_id, upload_request("p.bin", &data))
            .unwrap();
        h.engine.approve(&transfer_id, true, None).await.unwrap();

        let chunk0 = &data[..64 * 1024];
        h.engine
            .write_chunk(
                &h.session_id,
                good_frame(&transfer_id, 0, chunk0, 4),
                Bytes::copy_from_slice(chunk0),
            )
            .await
            .unwrap();

        let progress = h.engine.progress(&transfer_id).unwrap();
        assert_eq!(progress.bytes_transferred, 64 * 1024);
        assert_eq!(progress.total_bytes, 200_000);
        assert!(progress.progress_percent > 30.0 && progress.progress_percent < 35.0);
        assert_eq!(progress.status, TransferStatus::InProgress);
    }
}
