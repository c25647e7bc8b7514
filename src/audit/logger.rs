use crate::audit::types::AuditEvent;
use chrono::{NaiveDate, Utc};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

const QUEUE_CAPACITY: usize = 1000;
const ROTATE_SIZE: u64 = 100 * 1024 * 1024;

enum AuditCommand {
    Event(Box<AuditEvent>),
    Flush(oneshot::Sender<()>),
    Rotate,
    Cleanup,
}

/// Append-only structured event sink.
///
/// Producers enqueue into a bounded channel; a single writer task owns the
/// active file. The queue never blocks a control path: on overflow the
/// event is dropped with a note on stderr.
pub struct AuditLogger {
    tx: Option<mpsc::Sender<AuditCommand>>,
}

impl AuditLogger {
    pub fn new(log_dir: PathBuf, retention_days: u32) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let writer = AuditWriter {
            dir: log_dir,
            retention: Duration::from_secs(u64::from(retention_days) * 86_400),
            file: None,
            file_date: Utc::now().date_naive(),
            bytes_written: 0,
            disabled: false,
        };
        tokio::spawn(writer.run(rx));
        Self { tx: Some(tx) }
    }

    /// A logger that drops everything. Used when auditing is disabled.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Non-blocking enqueue.
    pub fn log(&self, event: AuditEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(_)) =
            tx.try_send(AuditCommand::Event(Box::new(event)))
        {
            eprintln!("audit: queue full, dropping event");
        }
    }

    /// Force a file swap regardless of size.
    pub fn rotate(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(AuditCommand::Rotate);
        }
    }

    /// Remove archived logs past the retention window.
    pub fn cleanup(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(AuditCommand::Cleanup);
        }
    }

    /// Wait until every event enqueued so far has hit the writer.
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(AuditCommand::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

struct AuditWriter {
    dir: PathBuf,
    retention: Duration,
    file: Option<File>,
    file_date: NaiveDate,
    bytes_written: u64,
    disabled: bool,
}

impl AuditWriter {
    async fn run(mut self, mut rx: mpsc::Receiver<AuditCommand>) {
        self.remove_expired().await;
        while let Some(command) = rx.recv().await {
            match command {
                AuditCommand::Event(event) => self.write_event(&event).await,
                AuditCommand::Flush(ack) => {
                    if let Some(file) = self.file.as_mut() {
                        let _ = file.sync_data().await;
                    }
                    let _ = ack.send(());
                }
                AuditCommand::Rotate => self.rotate().await,
                AuditCommand::Cleanup => self.remove_expired().await,
            }
        }
    }

    fn active_path(&self) -> PathBuf {
        self.dir
            .join(format!("audit-{}.log", self.file_date.format("%Y%m%d")))
    }

    async fn write_event(&mut self, event: &AuditEvent) {
        if self.disabled {
            return;
        }

        let today = Utc::now().date_naive();
        if self.bytes_written >= ROTATE_SIZE || today != self.file_date {
            self.rotate().await;
            self.file_date = today;
        }

        let result = self.try_write(event).await;
        if let Err(e) = result {
            // One-shot warning; callers keep running without auditing.
            self.disabled = true;
            self.file = None;
            eprintln!("audit: log directory unwritable, auditing disabled: {e}");
        }
    }

    async fn try_write(&mut self, event: &AuditEvent) -> std::io::Result<()> {
        if self.file.is_none() {
            tokio::fs::create_dir_all(&self.dir).await?;
            let path = self.active_path();
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            self.bytes_written = file.metadata().await?.len();
            self.file = Some(file);
        }

        let mut line = serde_json::to_vec(event).unwrap_or_default();
        line.push(b'\n');

        let file = self.file.as_mut().expect("file opened above");
        file.write_all(&line).await?;
        self.bytes_written += line.len() as u64;

        if event.severity.requires_sync() {
            file.sync_data().await?;
        }
        Ok(())
    }

    async fn rotate(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.sync_data().await;
        }
        let active = self.active_path();
        if tokio::fs::try_exists(&active).await.unwrap_or(false) {
            let archived = self.dir.join(format!(
                "audit-{}.log",
                Utc::now().format("%Y%m%d-%H%M%S")
            ));
            if archived != active {
                let _ = tokio::fs::rename(&active, &archived).await;
            }
        }
        self.bytes_written = 0;
        self.remove_expired().await;
    }

    async fn remove_expired(&self) {
        let cutoff = SystemTime::now() - self.retention;
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().map(|e| e != "log").unwrap_or(true) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if let Ok(modified) = meta.modified() {
                if modified < cutoff {
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }
    }
}
