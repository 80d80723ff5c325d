//! Authenticated encryption envelope for data stored on the device
//!
//! Payloads are sealed with AES-256-GCM under a locally generated key. The
//! envelope is a small JSON object:
//!
//! ```json
//! { "ciphertext": "<base64>", "iv": "<base64>", "version": 1 }
//! ```
//!
//! `ciphertext` includes the 16-byte GCM tag. Every call to [`encrypt`] draws a
//! fresh 12-byte IV from the OS random source.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::seed::EncryptionKey;

/// The only envelope version this code writes or reads
pub const ENVELOPE_VERSION: u32 = 1;

/// AES-GCM nonce length in bytes
pub const IV_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub ciphertext: String,
    pub iv: String,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptionError {
    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u32),

    #[error("Malformed envelope: {0} is not valid base64")]
    MalformedBase64(&'static str),

    #[error("Invalid IV length: expected {IV_LEN} bytes, got {0}")]
    InvalidIvLength(usize),

    #[error("Decryption failed: wrong key or tampered ciphertext")]
    AuthenticationFailed,
}

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("Encryption failed")]
    Encryption,

    #[error(transparent)]
    Decryption(#[from] DecryptionError),
}

/// Seal `plaintext` under `key`.
pub fn encrypt(plaintext: &[u8], key: &EncryptionKey) -> Result<EncryptedEnvelope, CipherError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CipherError::Encryption)?;

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CipherError::Encryption)?;

    Ok(EncryptedEnvelope {
        ciphertext: BASE64.encode(ciphertext),
        iv: BASE64.encode(iv),
        version: ENVELOPE_VERSION,
    })
}

/// Open an envelope produced by [`encrypt`].
pub fn decrypt(envelope: &EncryptedEnvelope, key: &EncryptionKey) -> Result<Vec<u8>, DecryptionError> {
    if envelope.version != ENVELOPE_VERSION {
        return Err(DecryptionError::UnsupportedVersion(envelope.version));
    }

    let iv = BASE64
        .decode(&envelope.iv)
        .map_err(|_| DecryptionError::MalformedBase64("iv"))?;
    if iv.len() != IV_LEN {
        return Err(DecryptionError::InvalidIvLength(iv.len()));
    }
    let ciphertext = BASE64
        .decode(&envelope.ciphertext)
        .map_err(|_| DecryptionError::MalformedBase64("ciphertext"))?;

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| DecryptionError::AuthenticationFailed)?;
    cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
        .map_err(|_| DecryptionError::AuthenticationFailed)
}

/// String `ciphertext`, string `iv` and a numeric `version`
fn envelope_parts(value: &Value) -> Option<(&str, &str, f64)> {
    let obj = value.as_object()?;
    let ciphertext = obj.get("ciphertext")?.as_str()?;
    let iv = obj.get("iv")?.as_str()?;
    let version = obj.get("version")?.as_f64()?;
    Some((ciphertext, iv, version))
}

/// Structural check for an envelope: an object with string `ciphertext`,
/// string `iv` and `version == 1` (`1.0` included). Never panics, whatever
/// the input.
pub fn is_encrypted(value: &Value) -> bool {
    envelope_parts(value).is_some_and(|(_, _, version)| version == f64::from(ENVELOPE_VERSION))
}

/// A persisted record, either sealed or written before encryption existed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredRecord {
    Plaintext(Vec<u8>),
    Envelope(EncryptedEnvelope),
}

impl StoredRecord {
    /// Classify raw bytes read from storage.
    ///
    /// Envelopes are recognised by shape. One carrying another whole-number
    /// version is still an envelope, so opening it reports
    /// [`DecryptionError::UnsupportedVersion`]. Anything else is treated as
    /// legacy plaintext; deciding whether that plaintext is usable is the
    /// caller's job.
    pub fn classify(bytes: &[u8]) -> Self {
        let envelope = serde_json::from_slice::<Value>(bytes).ok().and_then(|value| {
            let (ciphertext, iv, version) = envelope_parts(&value)?;
            let whole = version.fract() == 0.0 && (0.0..=f64::from(u32::MAX)).contains(&version);
            whole.then(|| EncryptedEnvelope {
                ciphertext: ciphertext.to_string(),
                iv: iv.to_string(),
                version: version as u32,
            })
        });
        match envelope {
            Some(envelope) => StoredRecord::Envelope(envelope),
            None => StoredRecord::Plaintext(bytes.to_vec()),
        }
    }

    /// Seal `plaintext` and wrap it as a record.
    pub fn seal(plaintext: &[u8], key: &EncryptionKey) -> Result<Self, CipherError> {
        Ok(StoredRecord::Envelope(encrypt(plaintext, key)?))
    }

    /// Bytes to write to storage
    pub fn to_bytes(&self) -> Result<Vec<u8>, CipherError> {
        match self {
            StoredRecord::Plaintext(bytes) => Ok(bytes.clone()),
            StoredRecord::Envelope(envelope) => {
                serde_json::to_vec(envelope).map_err(|_| CipherError::Encryption)
            }
        }
    }

    /// Plaintext content, decrypting if needed
    pub fn open(self, key: &EncryptionKey) -> Result<Vec<u8>, DecryptionError> {
        match self {
            StoredRecord::Plaintext(bytes) => Ok(bytes),
            StoredRecord::Envelope(envelope) => decrypt(&envelope, key),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, StoredRecord::Envelope(_))
    }
}
