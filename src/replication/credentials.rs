//! Password handling for replication sessions
//!
//! Passwords are stored as base64(nonce || AES-256-GCM ciphertext) and only
//! turned back into plaintext, inside a zeroizing buffer, right before a
//! session is opened.

use crate::domain::ports::PasswordDecrypter;
use crate::error::{Error, Result};
use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use zeroize::Zeroizing;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// AES-256-GCM password cipher
pub struct AesGcmPasswordCipher {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl std::fmt::Debug for AesGcmPasswordCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AesGcmPasswordCipher([REDACTED])")
    }
}

impl AesGcmPasswordCipher {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Build from a base64 encoded 32-byte key
    pub fn from_base64_key(encoded: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| Error::Credential(format!("invalid key encoding: {}", e)))?,
        );
        let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            Error::Credential(format!(
                "invalid key length: expected {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self::new(key))
    }

    /// Build from the key held in environment variable `var`
    pub fn from_env(var: &str) -> Result<Self> {
        let encoded = Zeroizing::new(std::env::var(var).map_err(|_| {
            Error::Credential(format!("credential key variable {} is not set", var))
        })?);
        Self::from_base64_key(&encoded)
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(self.key.as_slice())
            .map_err(|_| Error::Credential("invalid key length".into()))
    }

    /// Encrypt a password for storage
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| Error::Credential("password encryption failed".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }
}

impl PasswordDecrypter for AesGcmPasswordCipher {
    fn decrypt(&self, stored: &str) -> Result<Zeroizing<String>> {
        let sealed = STANDARD
            .decode(stored.trim())
            .map_err(|e| Error::Credential(format!("invalid password encoding: {}", e)))?;
        if sealed.len() <= NONCE_LEN {
            return Err(Error::Credential("stored password is truncated".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

        let plaintext = Zeroizing::new(
            self.cipher()?
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| Error::Credential("password decryption failed".into()))?,
        );
        let password = std::str::from_utf8(&plaintext)
            .map_err(|_| Error::Credential("decrypted password is not UTF-8".into()))?;
        Ok(Zeroizing::new(password.to_string()))
    }
}

/// Passthrough for deployments that keep the password unencrypted
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextPassword;

impl PasswordDecrypter for PlaintextPassword {
    fn decrypt(&self, stored: &str) -> Result<Zeroizing<String>> {
        Ok(Zeroizing::new(stored.to_string()))
    }
}
