//! Local key material
//!
//! A seed is 32 bytes from the OS random source, stored hex-encoded
//! (64 characters). The seed bytes are used directly as the AES-256 key.

use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

/// Seed length in bytes
pub const SEED_LEN: usize = 32;

/// `^[0-9a-f]{64}$`, case-insensitive
pub fn is_valid_seed(s: &str) -> bool {
    s.len() == SEED_LEN * 2 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Key seed, persisted hex-encoded
#[derive(Clone, PartialEq, Eq)]
pub struct SecretSeed([u8; SEED_LEN]);

impl SecretSeed {
    /// Generate a fresh seed from the OS random source
    pub fn generate() -> Self {
        let mut bytes = [0u8; SEED_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Accept a stored seed; `None` if it does not look like one.
    /// Surrounding whitespace (a trailing newline in a key file) is ignored.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if !is_valid_seed(s) {
            return None;
        }
        let mut bytes = [0u8; SEED_LEN];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }

    /// Lowercase hex form, as written to storage
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn key(&self) -> EncryptionKey {
        EncryptionKey(self.0)
    }

    /// Short non-secret identifier for logs
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..4])
    }
}

impl std::fmt::Debug for SecretSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretSeed({})", self.fingerprint())
    }
}

/// 256-bit symmetric key
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; SEED_LEN]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; SEED_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SEED_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}
