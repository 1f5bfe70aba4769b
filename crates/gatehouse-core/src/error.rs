//! Error types for `gatehouse-core`.
//!
//! Each error variant carries enough context to diagnose the problem from a
//! log line. Crypto errors never include key material or plaintext — only
//! operation descriptions and lengths.

use std::time::Duration;

use gatehouse_storage::StoreError;

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-256-GCM decryption failed (wrong key, corrupted envelope, or
    /// tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// Envelope is too short to contain a nonce and tag.
    #[error("envelope too short: expected at least {expected} bytes, got {actual}")]
    EnvelopeTooShort { expected: usize, actual: usize },

    /// A key could not be decoded from any accepted encoding.
    #[error("key decode failed: {reason}")]
    KeyDecode { reason: String },

    /// A key decoded to the wrong number of bytes.
    #[error("key must decode to {expected} bytes, got {actual}")]
    KeyLength { expected: usize, actual: usize },

    /// Password hashing or verification failed internally.
    #[error("password hash error: {reason}")]
    PasswordHash { reason: String },
}

/// Errors from permission registration and evaluation.
#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    /// A permission ID was registered twice.
    #[error("permission already registered: {id}")]
    DuplicateId { id: String },

    /// A `depends_on` or `implies` edge references an unknown permission.
    #[error("permission '{id}' references unknown permission '{references}'")]
    UnknownReference { id: String, references: String },

    /// The `depends_on` graph contains a cycle through this permission.
    #[error("permission dependency cycle through '{id}'")]
    DependencyCycle { id: String },

    /// An operation named a permission that is not in the registry.
    #[error("unknown permission: {id}")]
    UnknownPermission { id: String },

    /// Attempted to delete or mutate a system role.
    #[error("cannot modify system role: {name}")]
    SystemRole { name: String },

    /// The store failed. Evaluation treats this as a denial.
    #[error("permission store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from authentication, token, and session operations.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Unknown user or wrong password. Deliberately indistinguishable.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The account is deactivated.
    #[error("account is locked out")]
    LockedOut,

    /// Multi-factor authentication is required to proceed.
    #[error("multi-factor authentication required")]
    MfaRequired,

    /// No such session or refresh token.
    #[error("session not found")]
    NotFound,

    /// The session has expired.
    #[error("session expired")]
    Expired,

    /// The session was revoked.
    #[error("session revoked")]
    Revoked,

    /// Too many attempts; retry after the window passes.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Access-token signing or validation failed.
    #[error("token error: {reason}")]
    Token { reason: String },

    /// A cryptographic primitive failed.
    #[error("auth crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The store failed.
    #[error("auth store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from the credential vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// No such identity.
    #[error("vault identity not found")]
    NotFound,

    /// The caller neither owns the identity nor holds a live share.
    #[error("not authorised to read this identity")]
    Forbidden,

    /// The owner already has an identity with this name.
    #[error("identity name already in use: {name}")]
    NameTaken { name: String },

    /// A cryptographic operation failed.
    #[error("vault crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The store failed.
    #[error("vault store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from SSO identity resolution.
#[derive(Debug, thiserror::Error)]
pub enum SsoError {
    /// The external identity carried no email address.
    #[error("identity is missing an email address")]
    EmailRequired,

    /// The account is bound to a different external provider.
    #[error("account is bound to provider '{existing}'")]
    ProviderMismatch { existing: String },

    /// No matching user and auto-provisioning is disabled.
    #[error("no account for this identity and auto-provisioning is disabled")]
    ProvisioningDisabled,

    /// Could not derive a free username after bounded attempts.
    #[error("could not allocate a username for '{base}'")]
    UsernameExhausted { base: String },

    /// Session issuance failed.
    #[error("sso auth error: {0}")]
    Auth(#[from] AuthError),

    /// The store failed.
    #[error("sso store error: {0}")]
    Store(#[from] StoreError),
}
