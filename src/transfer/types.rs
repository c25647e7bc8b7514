use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    /// Client → portal.
    Upload,
    /// Portal → client.
    Download,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Approved,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Rejected,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed
                | TransferStatus::Failed
                | TransferStatus::Cancelled
                | TransferStatus::Rejected
        )
    }

    /// States that hold a concurrency slot.
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            TransferStatus::Approved | TransferStatus::InProgress | TransferStatus::Paused
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub filename: String,
    pub file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub direction: TransferDirection,
    /// For downloads: the staged file the broker serves from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: String,
    pub session_id: String,
    pub direction: TransferDirection,
    pub filename: String,
    pub file_size: u64,
    pub expected_checksum: Option<String>,
    pub status: TransferStatus,
    pub requested_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub temp_path: Option<PathBuf>,
    pub source_path: Option<PathBuf>,
    pub requested_by: Option<String>,
    pub total_chunks: u32,
    pub chunk_size: usize,
    pub completed_chunks: HashSet<u32>,
    pub failed_chunks: HashMap<u32, u32>,
    pub bytes_transferred: u64,
    pub error: Option<String>,
}

impl Transfer {
    pub fn new(session_id: String, request: &TransferRequest, chunk_size: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id,
            direction: request.direction,
            filename: request.filename.clone(),
            file_size: request.file_size,
            expected_checksum: request.checksum.clone(),
            status: TransferStatus::Pending,
            requested_at: Utc::now(),
            approved_at: None,
            end_time: None,
            temp_path: None,
            source_path: request.source_path.clone(),
            requested_by: request.requested_by.clone(),
            total_chunks: total_chunks_for(request.file_size, chunk_size),
            chunk_size,
            completed_chunks: HashSet::new(),
            failed_chunks: HashMap::new(),
            bytes_transferred: 0,
            error: None,
        }
    }

    /// Recompute chunk geometry when the real file size is learned late
    /// (download requests may arrive with size 0).
    pub fn set_file_size(&mut self, file_size: u64) {
        self.file_size = file_size;
        self.total_chunks = total_chunks_for(file_size, self.chunk_size);
    }

    /// Payload length of a given chunk index.
    pub fn chunk_len(&self, index: u32) -> usize {
        let start = index as u64 * self.chunk_size as u64;
        let remaining = self.file_size.saturating_sub(start);
        remaining.min(self.chunk_size as u64) as usize
    }

    pub fn is_complete(&self) -> bool {
        self.completed_chunks.len() as u32 >= self.total_chunks
    }

    pub fn progress_percent(&self) -> f32 {
        if self.file_size == 0 {
            return if self.status == TransferStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        (self.bytes_transferred as f32 / self.file_size as f32) * 100.0
    }
}

pub fn total_chunks_for(file_size: u64, chunk_size: usize) -> u32 {
    if file_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size as u64) as u32
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferProgress {
    pub transfer_id: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub progress_percent: f32,
    pub current_speed_bps: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u64>,
    pub status: TransferStatus,
}

/// Read-only view handed out over the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSummary {
    pub transfer_id: String,
    pub session_id: String,
    pub direction: TransferDirection,
    pub filename: String,
    pub file_size: u64,
    pub status: TransferStatus,
    pub requested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub completed_chunks: u32,
    pub total_chunks: u32,
    pub bytes_transferred: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferSummary {
    pub fn from_transfer(transfer: &Transfer) -> Self {
        Self {
            transfer_id: transfer.id.clone(),
            session_id: transfer.session_id.clone(),
            direction: transfer.direction,
            filename: transfer.filename.clone(),
            file_size: transfer.file_size,
            status: transfer.status,
            requested_at: transfer.requested_at,
            approved_at: transfer.approved_at,
            end_time: transfer.end_time,
            completed_chunks: transfer.completed_chunks.len() as u32,
            total_chunks: transfer.total_chunks,
            bytes_transferred: transfer.bytes_transferred,
            error: transfer.error.clone(),
        }
    }
}

const SPEED_WINDOW: Duration = Duration::from_secs(5);

/// Rolling byte-rate window feeding speed and ETA estimates.
#[derive(Debug, Default)]
pub struct SpeedTracker {
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedTracker {
    pub fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, bytes));
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some((t, _)) = self.samples.front() {
            if now.duration_since(*t) > SPEED_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn bytes_per_sec(&mut self) -> u64 {
        let now = Instant::now();
        self.prune(now);
        let total: u64 = self.samples.iter().map(|(_, b)| b).sum();
        let Some((oldest, _)) = self.samples.front() else {
            return 0;
        };
        let elapsed = now.duration_since(*oldest).as_secs_f64().max(0.25);
        (total as f64 / elapsed) as u64
    }

    pub fn eta_secs(&mut self, remaining_bytes: u64) -> Option<u64> {
        let bps = self.bytes_per_sec();
        if bps == 0 {
            return None;
        }
        Some(remaining_bytes.div_ceil(bps))
    }
}
