//! Encrypted secrets vault.
//!
//! Entries live as `secrets/<key>.enc`: a random 96-bit nonce followed by
//! the AES-256-GCM ciphertext. The vault key arrives as 64 hex chars via
//! `SOS_SECRET_KEY` and never touches disk.

use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use secrecy::{ExposeSecret, Secret};
use tracing::debug;

use sos_types::{SosError, SosResult};

const NONCE_LEN: usize = 12;

fn key_error(detail: &str) -> SosError {
    SosError::Validation(format!("SOS_SECRET_KEY must be 64 hex chars: {detail}"))
}

/// AES-256-GCM vault over `secrets/<key>.enc` files.
pub struct SecretsVault {
    root: PathBuf,
    cipher: Aes256Gcm,
}

impl SecretsVault {
    /// Open the vault at `root` with a 64-hex-char key.
    pub async fn open<P: AsRef<Path>>(root: P, hex_key: &Secret<String>) -> SosResult<Self> {
        let raw = hex::decode(hex_key.expose_secret().trim()).map_err(|e| key_error(&e.to_string()))?;
        if raw.len() != 32 {
            return Err(key_error(&format!("{} bytes after decode", raw.len())));
        }
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| SosError::Internal(format!("create secrets dir: {e}")))?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&raw));
        Ok(Self { root, cipher })
    }

    fn path_for(&self, key: &str) -> SosResult<PathBuf> {
        if key.is_empty() || key.contains('/') || key.contains("..") {
            return Err(SosError::Validation(format!(
                "secret key {key:?} must be a bare name"
            )));
        }
        Ok(self.root.join(format!("{key}.enc")))
    }

    /// Encrypt and store a secret value.
    pub async fn put(&self, key: &str, value: &Secret<String>) -> SosResult<()> {
        let path = self.path_for(key)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, value.expose_secret().as_bytes())
            .map_err(|_| SosError::Internal("secret encryption failed".into()))?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        tokio::fs::write(&path, &blob)
            .await
            .map_err(|e| SosError::Internal(format!("write secret: {e}")))?;
        debug!(key, "secret stored");
        Ok(())
    }

    /// Decrypt a stored secret, or `NotFound`.
    pub async fn get(&self, key: &str) -> SosResult<Secret<String>> {
        let path = self.path_for(key)?;
        let blob = match tokio::fs::read(&path).await {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SosError::NotFound(format!("secret {key}")))
            }
            Err(e) => return Err(SosError::Internal(format!("read secret: {e}"))),
        };
        if blob.len() <= NONCE_LEN {
            return Err(SosError::Internal(format!("secret {key} is truncated")));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SosError::Internal(format!("secret {key} failed authentication")))?;
        String::from_utf8(plaintext)
            .map(Secret::new)
            .map_err(|_| SosError::Internal(format!("secret {key} is not utf-8")))
    }

    /// Remove a secret; absent keys are fine.
    pub async fn delete(&self, key: &str) -> SosResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SosError::Internal(format!("delete secret: {e}"))),
        }
    }

    /// Names of stored secrets.
    pub async fn list(&self) -> SosResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| SosError::Internal(format!("list secrets: {e}")))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SosError::Internal(format!("read secrets dir: {e}")))?
        {
            let name = entry.file_name();
            if let Some(stem) = name.to_string_lossy().strip_suffix(".enc") {
                names.push(stem.to_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}
