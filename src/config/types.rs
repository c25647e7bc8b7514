use crate::config::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub tls_enabled: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub cors_origins: Vec<String>,
    pub max_connections: usize,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            tls_enabled: false,
            cert_file: None,
            key_file: None,
            cors_origins: Vec::new(),
            max_connections: 256,
            read_timeout_secs: 30,
            write_timeout_secs: 30,
            idle_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub max_file_size: u64,
    pub allowed_types: Vec<String>,
    pub temp_dir: PathBuf,
    pub max_concurrent: usize,
    pub transfer_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    pub require_approval: bool,
    pub audit_log: bool,
    pub encrypt_files: bool,
    pub chunk_size: usize,
    pub retry_attempts: u32,
    pub max_chunk_retries: u32,
    pub chunk_timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024,
            allowed_types: Vec::new(),
            temp_dir: PathBuf::from("./transfer_tmp"),
            max_concurrent: 5,
            transfer_timeout_secs: 30 * 60,
            cleanup_interval_secs: 5 * 60,
            require_approval: true,
            audit_log: true,
            encrypt_files: false,
            chunk_size: 64 * 1024,
            retry_attempts: 3,
            max_chunk_retries: 3,
            chunk_timeout_secs: 30,
        }
    }
}

impl TransferConfig {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.chunk_size == 0 {
            return Err(ConfigError::invalid("chunk_size", "must be non-zero"));
        }
        if self.max_file_size == 0 {
            return Err(ConfigError::invalid("max_file_size", "must be non-zero"));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("max_concurrent", "must be non-zero"));
        }
        if self.transfer_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "transfer_timeout_secs",
                "must be non-zero",
            ));
        }
        Ok(())
    }
}

fn default_blocked_extensions() -> Vec<String> {
    [
        ".exe", ".bat", ".cmd", ".com", ".scr", ".pif", ".vbs", ".js", ".jar", ".msi", ".dll",
        ".sys", ".ps1", ".sh", ".php", ".asp", ".jsp",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// 64 hex chars (32 bytes). Read from config, never written back out.
    #[serde(skip_serializing)]
    pub encryption_key: Option<String>,
    pub allowed_mime_types: Vec<String>,
    pub blocked_extensions: Vec<String>,
    pub max_filename_length: usize,
    pub scan_for_malware: bool,
    pub quarantine_dir: PathBuf,
    pub require_checksum: bool,
    pub checksum_algorithm: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            encryption_key: None,
            allowed_mime_types: Vec::new(),
            blocked_extensions: default_blocked_extensions(),
            max_filename_length: 255,
            scan_for_malware: false,
            quarantine_dir: PathBuf::from("./quarantine"),
            require_checksum: true,
            checksum_algorithm: "SHA256".to_string(),
        }
    }
}

impl SecurityConfig {
    /// Decode the configured encryption key, enforcing the 32-byte length.
    pub fn encryption_key_bytes(&self) -> ConfigResult<Option<[u8; 32]>> {
        let Some(hex_key) = &self.encryption_key else {
            return Ok(None);
        };
        let raw = hex::decode(hex_key)
            .map_err(|e| ConfigError::EncryptionKey(format!("not valid hex: {e}")))?;
        let key: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| ConfigError::EncryptionKey(format!("expected 32 bytes, got {}", raw.len())))?;
        Ok(Some(key))
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_filename_length == 0 {
            return Err(ConfigError::invalid(
                "max_filename_length",
                "must be non-zero",
            ));
        }
        if self.checksum_algorithm != "SHA256" {
            return Err(ConfigError::invalid(
                "checksum_algorithm",
                format!("unsupported algorithm {:?}", self.checksum_algorithm),
            ));
        }
        // Decoding errors surface here rather than at first use.
        self.encryption_key_bytes()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivilegeEscalationConfig {
    pub enabled: bool,
    pub require_approval: bool,
    pub max_privilege_duration_secs: i64,
    pub default_privilege_duration_secs: i64,
    pub min_justification_length: usize,
    pub allowed_privileges: Vec<String>,
    pub require_justification: bool,
}

impl Default for PrivilegeEscalationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            require_approval: true,
            max_privilege_duration_secs: 2 * 60 * 60,
            default_privilege_duration_secs: 30 * 60,
            min_justification_length: 10,
            allowed_privileges: ["admin", "elevated", "registry", "services", "network"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            require_justification: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteAccessConfig {
    pub max_concurrent_sessions: usize,
    pub session_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub websocket_read_timeout_secs: u64,
    pub websocket_write_timeout_secs: u64,
    pub privilege_escalation: PrivilegeEscalationConfig,
    pub audit_enabled: bool,
    pub audit_log_dir: PathBuf,
    pub audit_retention_days: u32,
}

impl Default for RemoteAccessConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 10,
            session_timeout_secs: 4 * 60 * 60,
            idle_timeout_secs: 30 * 60,
            websocket_read_timeout_secs: 60,
            websocket_write_timeout_secs: 10,
            privilege_escalation: PrivilegeEscalationConfig::default(),
            audit_enabled: true,
            audit_log_dir: PathBuf::from("./audit_logs"),
            audit_retention_days: 90,
        }
    }
}

impl RemoteAccessConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn websocket_read_timeout(&self) -> Duration {
        Duration::from_secs(self.websocket_read_timeout_secs)
    }

    pub fn websocket_write_timeout(&self) -> Duration {
        Duration::from_secs(self.websocket_write_timeout_secs)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent_sessions == 0 {
            return Err(ConfigError::invalid(
                "max_concurrent_sessions",
                "must be non-zero",
            ));
        }
        if self.privilege_escalation.max_privilege_duration_secs <= 0 {
            return Err(ConfigError::invalid(
                "max_privilege_duration_secs",
                "must be positive",
            ));
        }
        if self.privilege_escalation.default_privilege_duration_secs <= 0 {
            return Err(ConfigError::invalid(
                "default_privilege_duration_secs",
                "must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub server: ServerConfig,
    pub transfer: TransferConfig,
    pub security: SecurityConfig,
    pub remote_access: RemoteAccessConfig,
}

impl BrokerConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        self.transfer.validate()?;
        self.security.validate()?;
        self.remote_access.validate()?;

        // A broker configured for at-rest encryption must be given a stable
        // key up front; generating one would orphan existing ciphertext.
        if self.transfer.encrypt_files && self.security.encryption_key.is_none() {
            return Err(ConfigError::EncryptionKey(
                "encrypt_files is enabled but no encryption_key is configured".to_string(),
            ));
        }
        Ok(())
    }
}
