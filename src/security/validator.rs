use crate::audit::{AuditEvent, AuditLogger};
use crate::config::SecurityConfig;
use crate::security::checksum::sha256_file;
use crate::security::error::{SecurityError, SecurityResult};
use crate::security::scanner::{MalwareScanner, NoopScanner};
use crate::security::types::ValidationReport;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

const FORBIDDEN_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*', '\0'];

const WINDOWS_RESERVED: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const SNIFF_LEN: usize = 512;

pub struct FileValidator {
    config: SecurityConfig,
    scanner: Arc<dyn MalwareScanner>,
    audit: Arc<AuditLogger>,
}

impl FileValidator {
    pub fn new(config: SecurityConfig, audit: Arc<AuditLogger>) -> Self {
        Self {
            config,
            scanner: Arc::new(NoopScanner),
            audit,
        }
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn MalwareScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    /// Filename and extension policy, applied before any bytes exist.
    /// Collects every violation rather than stopping at the first.
    pub fn filename_errors(&self, name: &str) -> Vec<String> {
        let mut errors = Vec::new();

        if name.is_empty() {
            errors.push("filename is empty".to_string());
            return errors;
        }
        if name.len() > self.config.max_filename_length {
            errors.push(format!(
                "filename exceeds {} characters",
                self.config.max_filename_length
            ));
        }
        if let Some(c) = name.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
            errors.push(format!("filename contains forbidden character {c:?}"));
        }

        let stem = name.split('.').next().unwrap_or(name);
        if WINDOWS_RESERVED
            .iter()
            .any(|r| r.eq_ignore_ascii_case(stem))
        {
            errors.push(format!("filename uses reserved name {stem:?}"));
        }

        if let Some(ext) = extension_of(name) {
            if self
                .config
                .blocked_extensions
                .iter()
                .any(|b| b.eq_ignore_ascii_case(&ext))
            {
                errors.push(format!("extension {ext} is blocked"));
            }
        }

        errors
    }

    /// Convenience wrapper that turns filename violations into a `Blocked`
    /// error and records the security violation.
    pub fn check_filename(&self, name: &str) -> SecurityResult<()> {
        let errors = self.filename_errors(name);
        if errors.is_empty() {
            return Ok(());
        }
        let reason = errors.join("; ");
        self.audit.log(
            AuditEvent::new("security_violation")
                .filename(name)
                .failure(reason.clone()),
        );
        Err(SecurityError::Blocked(reason))
    }

    /// Full validation of an on-disk file: filename rules, MIME detection,
    /// optional checksum, optional malware scan with quarantine.
    pub async fn validate_file(
        &self,
        path: &Path,
        original_name: &str,
    ) -> SecurityResult<ValidationReport> {
        let mut report = ValidationReport::new();

        for error in self.filename_errors(original_name) {
            report.reject(error);
        }

        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| SecurityError::NotFound(format!("{}: {}", path.display(), e)))?;
        report.file_size = meta.len();

        let head = read_head(path).await?;
        report.mime_type = detect_mime(original_name, &head);

        if !self.config.allowed_mime_types.is_empty()
            && !self
                .config
                .allowed_mime_types
                .iter()
                .any(|m| m.eq_ignore_ascii_case(&report.mime_type))
        {
            report.reject(format!("MIME type {} is not allowed", report.mime_type));
        }

        if self.config.require_checksum {
            report.checksum = Some(sha256_file(path).await?);
        }

        if self.config.scan_for_malware && report.valid {
            let verdict = self.scanner.scan(path, &head);
            if !verdict.clean {
                let threat = verdict.threat.clone().unwrap_or_else(|| "unknown".into());
                let quarantine_path = self.quarantine(path, original_name).await?;
                self.audit.log(
                    AuditEvent::new("file_quarantined")
                        .filename(original_name)
                        .file_size(report.file_size)
                        .detail("threat", threat.clone())
                        .detail(
                            "quarantine_path",
                            quarantine_path.display().to_string(),
                        ),
                );
                report.reject(format!("malware detected: {threat}"));
                report.quarantined = true;
                report.quarantine_path = Some(quarantine_path);
            }
            report.scan = Some(verdict);
        }

        if report.valid {
            self.audit.log(
                AuditEvent::new("file_validated")
                    .filename(original_name)
                    .file_size(report.file_size),
            );
        } else {
            self.audit.log(
                AuditEvent::new("security_violation")
                    .filename(original_name)
                    .file_size(report.file_size)
                    .failure(report.errors.join("; ")),
            );
        }

        Ok(report)
    }

    /// Move a file into the quarantine directory under a timestamped name.
    async fn quarantine(&self, path: &Path, original_name: &str) -> SecurityResult<PathBuf> {
        tokio::fs::create_dir_all(&self.config.quarantine_dir).await?;
        let target = self.config.quarantine_dir.join(format!(
            "{}_{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            original_name
        ));
        tokio::fs::rename(path, &target).await?;
        Ok(target)
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }
}

fn extension_of(name: &str) -> Option<String> {
    let idx = name.rfind('.')?;
    if idx == 0 {
        return None;
    }
    Some(name[idx..].to_lowercase())
}

async fn read_head(path: &Path) -> SecurityResult<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut head = vec![0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < head.len() {
        let n = file.read(&mut head[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    head.truncate(filled);
    Ok(head)
}

/// MIME by extension lookup first, magic-number sniff second.
fn detect_mime(name: &str, head: &[u8]) -> String {
    if let Some(ext) = extension_of(name) {
        let by_ext = match ext.as_str() {
            ".txt" | ".log" => Some("text/plain"),
            ".csv" => Some("text/csv"),
            ".html" | ".htm" => Some("text/html"),
            ".xml" => Some("application/xml"),
            ".json" => Some("application/json"),
            ".pdf" => Some("application/pdf"),
            ".zip" => Some("application/zip"),
            ".gz" => Some("application/gzip"),
            ".png" => Some("image/png"),
            ".jpg" | ".jpeg" => Some("image/jpeg"),
            ".gif" => Some("image/gif"),
            ".mp4" => Some("video/mp4"),
            ".mp3" => Some("audio/mpeg"),
            ".doc" => Some("application/msword"),
            ".docx" => {
                Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document")
            }
            _ => None,
        };
        if let Some(mime) = by_ext {
            return mime.to_string();
        }
    }

    if head.starts_with(b"%PDF") {
        return "application/pdf".to_string();
    }
    if head.starts_with(&[0x50, 0x4b, 0x03, 0x04]) {
        return "application/zip".to_string();
    }
    if head.starts_with(&[0xff, 0xd8, 0xff]) {
        return "image/jpeg".to_string();
    }
    if head.starts_with(&[0x89, 0x50, 0x4e, 0x47]) {
        return "image/png".to_string();
    }
    "application/octet-stream".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::scanner::ScanVerdict;
    use tempfile::TempDir;

    struct MarkerScanner;

    impl MalwareScanner for MarkerScanner {
        fn scan(&self, _path: &Path, head: &[u8]) -> ScanVerdict {
            if head.windows(5).any(|w| w == b"EICAR") {
                ScanVerdict::infected("marker", "Eicar-Test-Signature")
            } else {
                ScanVerdict::clean("marker")
            }
        }
    }

    fn validator(config: SecurityConfig) -> FileValidator {
        FileValidator::new(config, Arc::new(AuditLogger::disabled()))
    }

    #[test]
    fn test_filename_rules() {
        let v = validator(SecurityConfig::default());

        assert!(v.filename_errors("notes.txt").is_empty());
        assert!(!v.filename_errors("").is_empty());
        assert!(!v.filename_errors("bad<name>.txt").is_empty());
        assert!(!v.filename_errors("pipe|name.txt").is_empty());
        assert!(!v.filename_errors(&"a".repeat(300)).is_empty());
    }

    #[test]
    fn test_windows_reserved_names() {
        let v = validator(SecurityConfig::default());
        assert!(!v.filename_errors("CON").is_empty());
        assert!(!v.filename_errors("con.txt").is_empty());
        assert!(!v.filename_errors("Com3.log").is_empty());
        assert!(!v.filename_errors("lpt9.dat").is_empty());
        // Not reserved: the name merely starts with a reserved word.
        assert!(v.filename_errors("console.txt").is_empty());
    }

    #[test]
    fn test_blocked_extensions() {
        let v = validator(SecurityConfig::default());
        assert!(!v.filename_errors("payload.exe").is_empty());
        assert!(!v.filename_errors("payload.EXE").is_empty());
        assert!(!v.filename_errors("script.ps1").is_empty());
        assert!(v.filename_errors("archive.tar").is_empty());
    }

    #[test]
    fn test_check_filename_reports_blocked() {
        let v = validator(SecurityConfig::default());
        let err = v.check_filename("payload.exe").unwrap_err();
        match err {
            SecurityError::Blocked(reason) => assert!(reason.contains(".exe")),
            other => panic!("expected Blocked, got {other:?}"),
        }
    }

    #[test]
    fn test_mime_by_extension_and_sniff() {
        assert_eq!(detect_mime("a.txt", b""), "text/plain");
        assert_eq!(detect_mime("a.pdf", b""), "application/pdf");
        assert_eq!(detect_mime("mystery", b"%PDF-1.7"), "application/pdf");
        assert_eq!(
            detect_mime("mystery", &[0x50, 0x4b, 0x03, 0x04, 0x00]),
            "application/zip"
        );
        assert_eq!(
            detect_mime("mystery", &[0x89, 0x50, 0x4e, 0x47]),
            "image/png"
        );
        assert_eq!(
            detect_mime("mystery", b"plain old bytes"),
            "application/octet-stream"
        );
    }

    #[tokio::test]
    async fn test_validate_clean_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("upload.tmp");
        tokio::fs::write(&path, b"some harmless text").await.unwrap();

        let v = validator(SecurityConfig::default());
        let report = v.validate_file(&path, "notes.txt").await.unwrap();

        assert!(report.valid);
        assert_eq!(report.mime_type, "text/plain");
        assert_eq!(report.file_size, 18);
        assert!(report.checksum.is_some());
        assert!(!report.quarantined);
    }

    #[tokio::test]
    async fn test_validate_blocked_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("upload.tmp");
        tokio::fs::write(&path, b"MZ fake binary").await.unwrap();

        let v = validator(SecurityConfig::default());
        let report = v.validate_file(&path, "payload.exe").await.unwrap();

        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains(".exe")));
    }

    #[tokio::test]
    async fn test_mime_allow_list() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("upload.tmp");
        tokio::fs::write(&path, b"text").await.unwrap();

        let mut config = SecurityConfig::default();
        config.allowed_mime_types = vec!["application/pdf".to_string()];
        let v = validator(config);

        let report = v.validate_file(&path, "notes.txt").await.unwrap();
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("text/plain")));
    }

    #[tokio::test]
    async fn test_quarantine_on_dirty_scan() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("upload.tmp");
        tokio::fs::write(&path, b"EICAR test body").await.unwrap();

        let mut config = SecurityConfig::default();
        config.scan_for_malware = true;
        config.quarantine_dir = dir.path().join("quarantine");
        let v = validator(config).with_scanner(Arc::new(MarkerScanner));

        let report = v.validate_file(&path, "sample.txt").await.unwrap();

        assert!(!report.valid);
        assert!(report.quarantined);
        assert!(!path.exists(), "original file should be moved away");

        let qpath = report.quarantine_path.unwrap();
        assert!(qpath.exists());
        let name = qpath.file_name().unwrap().to_string_lossy().to_string();
        // <YYYYMMDD_HHMMSS>_<original>
        assert!(name.ends_with("_sample.txt"));
        assert_eq!(name.len(), "19700101_000000_sample.txt".len());
    }

    #[tokio::test]
    async fn test_clean_scan_not_quarantined() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("upload.tmp");
        tokio::fs::write(&path, b"wholesome bytes").await.unwrap();

        let mut config = SecurityConfig::default();
        config.scan_for_malware = true;
        config.quarantine_dir = dir.path().join("quarantine");
        let v = validator(config).with_scanner(Arc::new(MarkerScanner));

        let report = v.validate_file(&path, "sample.txt").await.unwrap();
        assert!(report.valid);
        assert!(!report.quarantined);
        assert!(path.exists());
        assert!(report.scan.unwrap().clean);
    }
}
