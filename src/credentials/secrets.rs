use crate::error::CredentialError;
use anyhow::{Context, Result};
use chacha20poly1305::{
    ChaCha20Poly1305, KeyInit, Nonce,
    aead::{Aead, OsRng, rand_core::RngCore},
};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, Zeroizing};

const KEY_FILE: &str = ".secret_key";
const ENC_PREFIX: &str = "ENC:";
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Decrypt capability for credential fields stored at rest.
pub trait Decrypt: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<Zeroizing<String>>;
}

/// ChaCha20-Poly1305 store for credential fields; values are `ENC:<hex>`.
pub struct SecretStore {
    root: PathBuf,
    encrypt: bool,
}

impl SecretStore {
    pub fn new(root: &Path, encrypt: bool) -> Self {
        Self {
            root: root.to_path_buf(),
            encrypt,
        }
    }

    /// Returns `true` if the value has already been encrypted.
    #[must_use]
    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(ENC_PREFIX)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if !self.encrypt || plaintext.is_empty() || Self::is_encrypted(plaintext) {
            return Ok(plaintext.to_string());
        }

        let mut key_bytes = self.load_or_create_key()?;
        let cipher = ChaCha20Poly1305::new_from_slice(&key_bytes).context("invalid key length")?;
        key_bytes.zeroize();

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(format!("{ENC_PREFIX}{}", hex::encode(combined)))
    }

    fn key_path(&self) -> PathBuf {
        self.root.join(KEY_FILE)
    }

    fn read_key_file(path: &Path) -> Result<Vec<u8>> {
        let hex_key = fs::read_to_string(path).context("failed to read key file")?;
        let key = hex::decode(hex_key.trim()).context("invalid hex in key file")?;
        if key.len() != KEY_LEN {
            anyhow::bail!("key file has invalid length (expected 32 bytes)");
        }
        Ok(key)
    }

    fn write_new_key_file(path: &Path, key: &[u8]) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;

            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)
                .context("failed to create key file")?;
            file.write_all(hex::encode(key).as_bytes())
                .context("failed to write key file")?;
            file.sync_all().context("failed to sync key file")?;
        }

        #[cfg(not(unix))]
        {
            fs::write(path, hex::encode(key)).context("failed to write key file")?;
        }

        Ok(())
    }

    fn load_or_create_key(&self) -> Result<Vec<u8>> {
        let path = self.key_path();
        if path.exists() {
            return Self::read_key_file(&path);
        }
        let mut key = vec![0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        match Self::write_new_key_file(&path, &key) {
            Ok(()) => Ok(key),
            Err(error) => {
                let is_already_exists = error
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io| io.kind() == std::io::ErrorKind::AlreadyExists);
                if is_already_exists {
                    Self::read_key_file(&path)
                } else {
                    Err(error)
                }
            }
        }
    }

    fn decrypt_value(&self, value: &str) -> std::result::Result<Vec<u8>, CredentialError> {
        let combined = hex::decode(&value[ENC_PREFIX.len()..])
            .map_err(|e| CredentialError::Decrypt(format!("invalid hex in encrypted value: {e}")))?;
        if combined.len() < NONCE_LEN {
            return Err(CredentialError::Decrypt("encrypted value too short".into()));
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);

        let path = self.key_path();
        if !path.exists() {
            return Err(CredentialError::Decrypt(format!(
                "no secret key at {}",
                path.display()
            )));
        }
        let mut key_bytes =
            Self::read_key_file(&path).map_err(|e| CredentialError::Decrypt(e.to_string()))?;
        let cipher = ChaCha20Poly1305::new_from_slice(&key_bytes)
            .map_err(|_| CredentialError::Decrypt("invalid key length".into()))?;
        key_bytes.zeroize();

        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| CredentialError::Decrypt(e.to_string()))
    }
}

impl Decrypt for SecretStore {
    fn decrypt(&self, value: &str) -> Result<Zeroizing<String>> {
        if !Self::is_encrypted(value) {
            return Ok(Zeroizing::new(value.to_string()));
        }
        let plaintext = self.decrypt_value(value)?;
        match String::from_utf8(plaintext) {
            Ok(text) => Ok(Zeroizing::new(text)),
            Err(err) => {
                let mut bytes = err.into_bytes();
                bytes.zeroize();
                Err(CredentialError::Decrypt("decrypted value is not valid UTF-8".into()).into())
            }
        }
    }
}
