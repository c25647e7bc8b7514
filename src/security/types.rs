use crate::security::scanner::ScanVerdict;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub mime_type: String,
    pub file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub quarantined: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantine_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan: Option<ScanVerdict>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            mime_type: String::new(),
            file_size: 0,
            checksum: None,
            quarantined: false,
            quarantine_path: None,
            scan: None,
        }
    }

    pub fn reject(&mut self, reason: impl Into<String>) {
        self.valid = false;
        self.errors.push(reason.into());
    }

    pub fn warn(&mut self, note: impl Into<String>) {
        self.warnings.push(note.into());
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}
