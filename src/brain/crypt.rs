//! AES-256-GCM encryption for brain contents and configuration secrets.
//!
//! The brain key is a random 32-byte value stored on disk encrypted under the
//! operator's `GOPHER_ENCRYPTION_KEY`, so the operator key can be rotated
//! without re-encrypting every memory.

use crate::base64_file::{ENCRYPTED_HEADER, decode_wrapped, encode_wrapped, write_private};
use crate::error::BrainError;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::path::Path;

const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

/// File name of the encrypted brain key under the config directory.
pub const KEY_FILE: &str = "binary-encrypted-key";

pub struct Crypt {
    cipher: Aes256Gcm,
}

impl Crypt {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Build a cipher from an operator-supplied key; only the first 32 bytes
    /// are used and shorter keys are refused.
    pub fn from_passphrase(passphrase: &str) -> Result<Self, BrainError> {
        let bytes = passphrase.as_bytes();
        if bytes.len() < KEY_LEN {
            return Err(BrainError::Crypt(format!(
                "encryption key must be at least {KEY_LEN} bytes"
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes[..KEY_LEN]);
        Ok(Self::new(&key))
    }

    /// Encrypt to `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, BrainError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|error| BrainError::Crypt(format!("encryption failed: {error}")))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, BrainError> {
        if sealed.len() < NONCE_LEN {
            return Err(BrainError::Crypt("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|error| BrainError::Crypt(format!("decryption failed: {error}")))
    }

    /// Encrypt and base64-encode a string, for configuration values.
    pub fn encrypt_string(&self, plaintext: &str) -> Result<String, BrainError> {
        Ok(STANDARD.encode(self.encrypt(plaintext.as_bytes())?))
    }

    pub fn decrypt_string(&self, encoded: &str) -> Result<String, BrainError> {
        let sealed = STANDARD
            .decode(encoded.trim())
            .map_err(|error| BrainError::Crypt(format!("invalid base64: {error}")))?;
        String::from_utf8(self.decrypt(&sealed)?)
            .map_err(|error| BrainError::Crypt(format!("decrypted value is not UTF-8: {error}")))
    }
}

impl std::fmt::Debug for Crypt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crypt").finish_non_exhaustive()
    }
}

/// Read the brain key at `path`, decrypting it with `operator`; when the file
/// is absent a fresh key is generated and written.
pub fn load_or_create_brain_key(path: &Path, operator: &Crypt) -> Result<[u8; KEY_LEN], BrainError> {
    match std::fs::read(path) {
        Ok(raw) => {
            let sealed = decode_wrapped(ENCRYPTED_HEADER, &raw)
                .map_err(|error| BrainError::Crypt(format!("{}: {error}", path.display())))?;
            let plain = operator.decrypt(&sealed)?;
            <[u8; KEY_LEN]>::try_from(plain.as_slice()).map_err(|_| {
                BrainError::Crypt(format!("{}: brain key has the wrong length", path.display()))
            })
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(&Aes256Gcm::generate_key(&mut OsRng));
            let sealed = operator.encrypt(&key)?;
            write_private(path, encode_wrapped(ENCRYPTED_HEADER, &sealed).as_bytes())
                .map_err(|error| BrainError::Storage(error.to_string()))?;
            tracing::info!(path = %path.display(), "generated new brain encryption key");
            Ok(key)
        }
        Err(error) => Err(BrainError::Storage(format!("{}: {error}", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPERATOR_KEY: &str = "0123456789abcdef0123456789abcdef-extra";

    #[test]
    fn seal_and_open() {
        let crypt = Crypt::from_passphrase(OPERATOR_KEY).expect("key");
        let sealed = crypt.encrypt(b"launch codes").expect("encrypt");
        assert_ne!(&sealed[NONCE_LEN..], b"launch codes");
        assert_eq!(crypt.decrypt(&sealed).expect("decrypt"), b"launch codes");
    }

    #[test]
    fn short_passphrase_is_rejected() {
        assert!(Crypt::from_passphrase("too short").is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let crypt = Crypt::from_passphrase(OPERATOR_KEY).expect("key");
        let mut sealed = crypt.encrypt(b"value").expect("encrypt");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(crypt.decrypt(&sealed).is_err());
    }

    #[test]
    fn brain_key_is_created_once_and_reloaded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(KEY_FILE);
        let operator = Crypt::from_passphrase(OPERATOR_KEY).expect("key");
        let first = load_or_create_brain_key(&path, &operator).expect("create");
        let raw = std::fs::read_to_string(&path).expect("read key file");
        assert!(raw.starts_with(ENCRYPTED_HEADER));
        let second = load_or_create_brain_key(&path, &operator).expect("reload");
        assert_eq!(first, second);
    }

    #[test]
    fn string_helpers_round_trip() {
        let crypt = Crypt::from_passphrase(OPERATOR_KEY).expect("key");
        let encoded = crypt.encrypt_string("hunter2").expect("encrypt");
        assert_eq!(crypt.decrypt_string(&encoded).expect("decrypt"), "hunter2");
    }
}
