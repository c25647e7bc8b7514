use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanVerdict {
    pub clean: bool,
    pub engine: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threat: Option<String>,
}

impl ScanVerdict {
    pub fn clean(engine: &str) -> Self {
        Self {
            clean: true,
            engine: engine.to_string(),
            threat: None,
        }
    }

    pub fn infected(engine: &str, threat: impl Into<String>) -> Self {
        Self {
            clean: false,
            engine: engine.to_string(),
            threat: Some(threat.into()),
        }
    }
}

/// Pluggable malware scanner. The broker ships no engine of its own;
/// deployments wire in whatever scanner they run.
pub trait MalwareScanner: Send + Sync {
    fn scan(&self, path: &Path, head: &[u8]) -> ScanVerdict;
}

/// Default scanner that trusts everything.
pub struct NoopScanner;

impl MalwareScanner for NoopScanner {
    fn scan(&self, _path: &Path, _head: &[u8]) -> ScanVerdict {
        ScanVerdict::clean("noop")
    }
}
