use crate::security::error::{SecurityError, SecurityResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use std::path::Path;
use tokio::io::AsyncWriteExt;

pub const NONCE_SIZE: usize = 12;
pub const KEY_SIZE: usize = 32;

/// AES-256-GCM cipher for at-rest file and chunk encryption.
///
/// Ciphertext layout is `nonce(12) || ciphertext || tag(16)` with a fresh
/// random nonce per unit. Never reuse a nonce with the same key.
pub struct FileCryptor {
    cipher: Aes256Gcm,
}

impl FileCryptor {
    pub fn new(key: &[u8]) -> SecurityResult<Self> {
        if key.len() != KEY_SIZE {
            return Err(SecurityError::InvalidKeyLength(key.len()));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| SecurityError::Encryption(format!("invalid key: {e}")))?;
        Ok(Self { cipher })
    }

    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> SecurityResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| SecurityError::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt_bytes(&self, data: &[u8]) -> SecurityResult<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return Err(SecurityError::Decryption("ciphertext too short".into()));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| SecurityError::Decryption("authentication tag mismatch".into()))
    }

    pub fn encrypt_chunk(&self, chunk: &[u8]) -> SecurityResult<Vec<u8>> {
        self.encrypt_bytes(chunk)
    }

    pub fn decrypt_chunk(&self, chunk: &[u8]) -> SecurityResult<Vec<u8>> {
        self.decrypt_bytes(chunk)
    }

    /// Encrypt a file in place via a sibling temp file.
    pub async fn encrypt_file(&self, path: &Path) -> SecurityResult<()> {
        let plaintext = tokio::fs::read(path).await?;
        let ciphertext = self.encrypt_bytes(&plaintext)?;
        write_replace(path, &ciphertext).await
    }

    /// Decrypt a file in place via a sibling temp file.
    pub async fn decrypt_file(&self, path: &Path) -> SecurityResult<()> {
        let ciphertext = tokio::fs::read(path).await?;
        let plaintext = self.decrypt_bytes(&ciphertext)?;
        write_replace(path, &plaintext).await
    }
}

async fn write_replace(path: &Path, data: &[u8]) -> SecurityResult<()> {
    let staged = path.with_extension("staged");
    {
        let mut file = tokio::fs::File::create(&staged).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
    }
    tokio::fs::rename(&staged, path).await?;
    Ok(())
}

/// Overwrite a file with three passes of random bytes, syncing each pass,
/// then unlink it.
pub async fn secure_delete(path: &Path) -> SecurityResult<()> {
    let meta = tokio::fs::metadata(path).await?;
    let len = meta.len() as usize;

    for _ in 0..3 {
        let mut noise = vec![0u8; len];
        rand::rngs::OsRng.fill_bytes(&mut noise);
        let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
        file.write_all(&noise).await?;
        file.sync_all().await?;
    }

    tokio::fs::remove_file(path).await?;
    Ok(())
}
