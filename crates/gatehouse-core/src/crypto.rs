//! Cryptographic primitives for Gatehouse.
//!
//! Provides AES-256-GCM authenticated encryption with a URL-safe base64
//! envelope, Argon2id password hashing, random bearer-token generation, and
//! permissive key decoding. Key material is zeroized on drop and never
//! appears in `Debug` output.
//!
//! # Security model
//!
//! - Every encryption generates a fresh 96-bit nonce via `OsRng`.
//! - Envelope format: `base64url(nonce (12 bytes) || ciphertext || tag (16 bytes))`.
//! - User passwords use Argon2id with the library defaults (OWASP profile).
//! - Bearer tokens draw from the OS CSPRNG, URL-safe alphabet, 48 chars by
//!   default (~286 bits).

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::Argon2;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use rand::RngCore;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Nonce length for AES-256-GCM (96 bits).
const NONCE_LEN: usize = 12;

/// Minimum envelope length after decoding: nonce + GCM tag.
const MIN_ENVELOPE_LEN: usize = NONCE_LEN + 16;

/// Default length of generated bearer tokens.
pub const DEFAULT_TOKEN_LEN: usize = 48;

/// URL-safe token alphabet (64 symbols, no padding characters).
const TOKEN_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// A 256-bit symmetric key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random key from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    /// Borrow the raw key bytes. The caller must not log or persist them.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Decode key material from hex, standard base64, URL-safe base64, or raw
/// bytes, in that order. Returns the decoded bytes.
///
/// Raw input is accepted last so that e.g. a 64-char hex string is treated
/// as 32 key bytes, not 64.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDecode`] if the input is empty.
pub fn decode_key(input: &str) -> Result<Vec<u8>, CryptoError> {
    if input.is_empty() {
        return Err(CryptoError::KeyDecode {
            reason: "empty key".to_owned(),
        });
    }

    if let Ok(bytes) = hex::decode(input) {
        return Ok(bytes);
    }
    if let Ok(bytes) = STANDARD.decode(input) {
        return Ok(bytes);
    }
    if let Ok(bytes) = URL_SAFE.decode(input) {
        return Ok(bytes);
    }
    if let Ok(bytes) = URL_SAFE_NO_PAD.decode(input) {
        return Ok(bytes);
    }
    Ok(input.as_bytes().to_vec())
}

/// Decode key material and require an exact decoded length.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDecode`] for empty input and
/// [`CryptoError::KeyLength`] (reporting the decoded byte length) when the
/// decoded size differs from `expected`.
pub fn decode_key_exact(input: &str, expected: usize) -> Result<Vec<u8>, CryptoError> {
    let bytes = decode_key(input)?;
    if bytes.len() != expected {
        return Err(CryptoError::KeyLength {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

/// Decode a 32-byte [`SecretKey`] from any accepted encoding.
///
/// # Errors
///
/// See [`decode_key_exact`].
pub fn decode_secret_key(input: &str) -> Result<SecretKey, CryptoError> {
    let bytes = decode_key_exact(input, 32)?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(SecretKey::from_bytes(key))
}

/// Encrypt plaintext under the key with a fresh random nonce.
///
/// Returns the URL-safe base64 envelope `nonce || ciphertext || tag`.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn encrypt(key: &SecretKey, plaintext: &[u8]) -> Result<String, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(URL_SAFE_NO_PAD.encode(combined))
}

/// Decrypt an envelope produced by [`encrypt`].
///
/// # Errors
///
/// - [`CryptoError::Decryption`] if the envelope is not valid base64 or
///   authentication fails (wrong key, corrupted data, tampered tag).
/// - [`CryptoError::EnvelopeTooShort`] if the decoded bytes cannot contain
///   a nonce and tag.
pub fn decrypt(key: &SecretKey, envelope: &str) -> Result<Vec<u8>, CryptoError> {
    let combined = URL_SAFE_NO_PAD
        .decode(envelope)
        .map_err(|e| CryptoError::Decryption {
            reason: format!("invalid envelope encoding: {e}"),
        })?;

    if combined.len() < MIN_ENVELOPE_LEN {
        return Err(CryptoError::EnvelopeTooShort {
            expected: MIN_ENVELOPE_LEN,
            actual: combined.len(),
        });
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| CryptoError::Decryption {
            reason: e.to_string(),
        })
}

/// Hash a password with Argon2id, returning a PHC-format string.
///
/// # Errors
///
/// Returns [`CryptoError::PasswordHash`] if hashing fails internally.
pub fn hash_password(password: &str) -> Result<String, CryptoError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CryptoError::PasswordHash {
            reason: e.to_string(),
        })
}

/// Verify a password against a stored PHC hash. Returns `false` for a
/// mismatch, an error only for a malformed stored hash.
///
/// # Errors
///
/// Returns [`CryptoError::PasswordHash`] if the stored hash cannot be
/// parsed.
pub fn verify_password(password: &str, stored_hash: &str) -> Result<bool, CryptoError> {
    let parsed = PasswordHash::new(stored_hash).map_err(|e| CryptoError::PasswordHash {
        reason: e.to_string(),
    })?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Generate a cryptographically random URL-safe token of the given length.
#[must_use]
pub fn generate_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| TOKEN_ALPHABET[(*b & 0x3f) as usize] as char)
        .collect()
}

/// Constant-time equality for bearer secrets.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
