use crate::audit::AuditLogger;
use crate::config::{BrokerConfig, ConfigError, ConfigHandle};
use crate::router::{MessageRouter, Registry};
use crate::security::{FileCryptor, FileValidator, MalwareScanner};
use crate::session::SessionManager;
use crate::transfer::TransferEngine;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// The assembled broker: one instance owns the five components and wires
/// them together. The server binary and the test suites both go through
/// this.
pub struct Broker {
    pub config: Arc<ConfigHandle>,
    pub audit: Arc<AuditLogger>,
    pub validator: Arc<FileValidator>,
    pub registry: Arc<Registry>,
    pub sessions: Arc<SessionManager>,
    pub transfers: Arc<TransferEngine>,
    pub router: Arc<MessageRouter>,
    start_time: Instant,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Result<Arc<Self>, ConfigError> {
        Self::with_scanner(config, None)
    }

    pub fn with_scanner(
        config: BrokerConfig,
        scanner: Option<Arc<dyn MalwareScanner>>,
    ) -> Result<Arc<Self>, ConfigError> {
        let config = Arc::new(ConfigHandle::new(config)?);
        let snapshot = config.snapshot();

        let audit = if snapshot.remote_access.audit_enabled {
            Arc::new(AuditLogger::new(
                snapshot.remote_access.audit_log_dir.clone(),
                snapshot.remote_access.audit_retention_days,
            ))
        } else {
            Arc::new(AuditLogger::disabled())
        };

        let mut validator = FileValidator::new(snapshot.security.clone(), audit.clone());
        if let Some(scanner) = scanner {
            validator = validator.with_scanner(scanner);
        }
        let validator = Arc::new(validator);

        let cryptor = match snapshot.security.encryption_key_bytes()? {
            Some(key) => Some(Arc::new(
                FileCryptor::new(&key).map_err(|e| ConfigError::EncryptionKey(e.to_string()))?,
            )),
            None => None,
        };

        let registry = Arc::new(Registry::new());
        let sessions = Arc::new(SessionManager::new(
            config.clone(),
            audit.clone(),
            registry.clone(),
        ));
        let transfers = Arc::new(TransferEngine::new(
            config.clone(),
            validator.clone(),
            cryptor,
            audit.clone(),
            registry.clone(),
            sessions.clone(),
        ));
        let router = Arc::new(MessageRouter::new(
            registry.clone(),
            sessions.clone(),
            transfers.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            audit,
            validator,
            registry,
            sessions,
            transfers,
            router,
            start_time: Instant::now(),
        }))
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Single sweeper task: session expiry, privilege expiry, transfer
    /// timeouts, terminal-record purges, temp-file and audit-log cleanup.
    pub fn spawn_cleanup_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            let interval_secs = broker
                .config
                .snapshot()
                .transfer
                .cleanup_interval_secs
                .max(1);
            let mut tick = tokio::time::interval(Duration::from_secs(interval_secs));
            // The immediate first tick would sweep an empty broker.
            tick.tick().await;
            loop {
                tick.tick().await;
                let report = broker.sessions.sweep();
                broker.transfers.sweep().await;
                broker.audit.cleanup();
                tracing::debug!(
                    expired_sessions = report.expired_sessions,
                    expired_privileges = report.expired_privileges,
                    purged_sessions = report.purged_sessions,
                    "cleanup sweep finished"
                );
            }
        })
    }
}
