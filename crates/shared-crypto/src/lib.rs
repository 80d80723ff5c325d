//! Shared cryptography utilities
//!
//! This crate provides the at-rest encryption used for locally stored
//! signing material: versioned AES-GCM envelopes and the key seed they are
//! sealed under.

pub mod envelope;
pub mod seed;

pub use envelope::{
    decrypt, encrypt, is_encrypted, CipherError, DecryptionError, EncryptedEnvelope,
    StoredRecord, ENVELOPE_VERSION,
};
pub use seed::{is_valid_seed, EncryptionKey, SecretSeed};
