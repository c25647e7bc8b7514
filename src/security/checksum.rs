use crate::security::error::{SecurityError, SecurityResult};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

/// SHA-256 of a byte slice, lowercase hex.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Streaming SHA-256 of a file, lowercase hex.
pub async fn sha256_file(path: &Path) -> SecurityResult<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| SecurityError::NotFound(format!("{}: {}", path.display(), e)))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Verify a file against an expected hex digest (case-insensitive).
pub async fn verify_file_checksum(path: &Path, expected: &str) -> SecurityResult<()> {
    let actual = sha256_file(path).await?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(SecurityError::ChecksumMismatch {
            expected: expected.to_lowercase(),
            actual,
        });
    }
    Ok(())
}
