use crate::router::envelope::PeerRole;
use crate::router::frame::{encode_chunk_frame, ChunkFrameHeader};
use crate::security::checksum::sha256_bytes;
use crate::transfer::engine::{TransferEngine, TransferHandle};
use crate::transfer::error::{TransferError, TransferResult};
use bytes::Bytes;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};

/// Poll interval of the ack-wait loop.
const ACK_POLL: Duration = Duration::from_millis(100);

/// Download sender task: streams the staged file to the client as chunk
/// frames, then waits out acks and retransmission requests. One task per
/// transfer; it owns the file handle for its whole life.
pub(crate) async fn run_download_sender(
    engine: Arc<TransferEngine>,
    handle: Arc<TransferHandle>,
    transfer_id: String,
) {
    if let Err(e) = drive(&engine, &handle).await {
        tracing::warn!(transfer_id, error = %e, "download sender stopped");
        engine
            .fail(&handle, format!("download stream failed: {e}"))
            .await;
    }
}

struct SendState {
    last_sent: HashMap<u32, Instant>,
    send_count: HashMap<u32, u32>,
    retry_attempts: u32,
}

impl SendState {
    fn shift_deadlines(&mut self, by: Duration) {
        for t in self.last_sent.values_mut() {
            *t += by;
        }
    }

    fn record_send(&mut self, index: u32) {
        self.last_sent.insert(index, Instant::now());
        *self.send_count.entry(index).or_insert(0) += 1;
    }

    fn budget_left(&self, index: u32) -> TransferResult<()> {
        let sends = self.send_count.get(&index).copied().unwrap_or(0);
        if sends > self.retry_attempts {
            return Err(TransferError::Timeout(format!(
                "chunk {index} unacknowledged after {sends} sends"
            )));
        }
        Ok(())
    }

    fn timer_expired(&self, index: u32, timeout: Duration) -> bool {
        self.last_sent
            .get(&index)
            .map(|t| t.elapsed() >= timeout)
            .unwrap_or(true)
    }
}

async fn drive(engine: &Arc<TransferEngine>, handle: &Arc<TransferHandle>) -> TransferResult<()> {
    let (session_id, transfer_id, temp_path, total_chunks, chunk_size, file_size) = {
        let record = handle.record.read();
        let temp_path = record
            .temp_path
            .clone()
            .ok_or_else(|| TransferError::NotFound(record.id.clone()))?;
        (
            record.session_id.clone(),
            record.id.clone(),
            temp_path,
            record.total_chunks,
            record.chunk_size,
            record.file_size,
        )
    };
    let chunk_timeout = handle.config.chunk_timeout();
    let mut state = SendState {
        last_sent: HashMap::new(),
        send_count: HashMap::new(),
        retry_attempts: handle.config.retry_attempts,
    };

    let file = File::open(&temp_path).await?;
    let mut reader = BufReader::with_capacity(chunk_size.min(512 * 1024), file);

    // Sequential pass over the whole file.
    for index in 0..total_chunks {
        if handle.flags.is_stopped() {
            return Ok(());
        }
        let paused_for = handle.flags.wait_while_paused().await;
        if !paused_for.is_zero() {
            // Retry timers resume with their remaining interval.
            state.shift_deadlines(paused_for);
        }
        if handle.flags.is_stopped() {
            return Ok(());
        }

        send_index(
            engine, handle, &mut reader, &session_id, &transfer_id, index, total_chunks,
            chunk_size, file_size, &mut state,
        )
        .await?;
    }

    // Ack wait: serve retransmission requests first, then timer expiries.
    loop {
        if handle.flags.is_stopped() {
            return Ok(());
        }
        {
            let record = handle.record.read();
            if record.status.is_terminal() {
                return Ok(());
            }
        }
        let paused_for = handle.flags.wait_while_paused().await;
        if !paused_for.is_zero() {
            state.shift_deadlines(paused_for);
        }
        if handle.flags.is_stopped() {
            return Ok(());
        }

        let requested: Vec<u32> = {
            let mut pending = handle.retransmit.lock();
            pending.drain().collect()
        };
        for index in requested {
            send_index(
                engine, handle, &mut reader, &session_id, &transfer_id, index, total_chunks,
                chunk_size, file_size, &mut state,
            )
            .await?;
        }

        let outstanding: Vec<u32> = {
            let record = handle.record.read();
            (0..total_chunks)
                .filter(|i| !record.completed_chunks.contains(i))
                .collect()
        };
        if outstanding.is_empty() {
            // Completion is ack-driven; the engine already finalized.
            return Ok(());
        }
        for index in outstanding {
            if state.timer_expired(index, chunk_timeout) {
                send_index(
                    engine, handle, &mut reader, &session_id, &transfer_id, index, total_chunks,
                    chunk_size, file_size, &mut state,
                )
                .await?;
            }
        }

        tokio::time::sleep(ACK_POLL).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn send_index(
    engine: &Arc<TransferEngine>,
    handle: &Arc<TransferHandle>,
    reader: &mut BufReader<File>,
    session_id: &str,
    transfer_id: &str,
    index: u32,
    total_chunks: u32,
    chunk_size: usize,
    file_size: u64,
    state: &mut SendState,
) -> TransferResult<()> {
    {
        // Skip anything the client already confirmed.
        let record = handle.record.read();
        if record.completed_chunks.contains(&index) {
            return Ok(());
        }
    }
    state.budget_left(index)?;

    let payload = read_chunk(reader, index, chunk_size, file_size).await?;
    let header = ChunkFrameHeader {
        transfer_id: transfer_id.to_string(),
        chunk_index: index,
        checksum: sha256_bytes(&payload),
        is_last: index == total_chunks - 1,
    };
    let frame = encode_chunk_frame(&header, &payload)?;

    send_frame(engine, handle, session_id, frame, state.retry_attempts).await?;
    state.record_send(index);
    Ok(())
}

/// Send one frame with linear back-off: 1 s, 2 s, 3 s between attempts.
async fn send_frame(
    engine: &Arc<TransferEngine>,
    handle: &Arc<TransferHandle>,
    session_id: &str,
    frame: Bytes,
    retry_attempts: u32,
) -> TransferResult<()> {
    let mut attempt = 0u32;
    loop {
        match engine
            .registry()
            .send_binary(
                session_id,
                PeerRole::Client,
                frame.clone(),
                handle.ws_write_timeout,
            )
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempt += 1;
                if attempt > retry_attempts || handle.flags.is_stopped() {
                    return Err(e.into());
                }
                tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
            }
        }
    }
}

async fn read_chunk(
    reader: &mut BufReader<File>,
    index: u32,
    chunk_size: usize,
    file_size: u64,
) -> std::io::Result<Vec<u8>> {
    let offset = index as u64 * chunk_size as u64;
    let len = file_size.saturating_sub(offset).min(chunk_size as u64) as usize;
    reader.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}
