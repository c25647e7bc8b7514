use crate::config::error::ConfigResult;
use crate::config::types::{BrokerConfig, TransferConfig};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;

/// Shared configuration handle with copy-on-write updates.
///
/// Readers take cheap `Arc` snapshots; an update builds a new config,
/// validates it, and swaps the pointer. In-flight transfers keep whatever
/// snapshot they captured at approval time, so a policy change never
/// flips mid-stream.
pub struct ConfigHandle {
    inner: RwLock<Arc<BrokerConfig>>,
}

impl ConfigHandle {
    pub fn new(config: BrokerConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: RwLock::new(Arc::new(config)),
        })
    }

    pub async fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let config: BrokerConfig = serde_json::from_str(&raw)?;
        Self::new(config)
    }

    /// Current config snapshot.
    pub fn snapshot(&self) -> Arc<BrokerConfig> {
        self.inner.read().clone()
    }

    /// Validate and atomically publish a new transfer section.
    pub fn update_transfer(&self, transfer: TransferConfig) -> ConfigResult<()> {
        transfer.validate()?;
        let mut guard = self.inner.write();
        let mut next = (**guard).clone();
        next.transfer = transfer;
        next.validate()?;
        *guard = Arc::new(next);
        Ok(())
    }
}
