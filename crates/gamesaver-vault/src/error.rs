//! Vault error types.
//!
//! All vault subsystems surface errors through [`VaultError`], which is the
//! single error type returned by every public API in this crate.  The three
//! decode failures callers most often branch on ([`VaultError::Format`],
//! [`VaultError::Authentication`] and [`VaultError::UnsupportedVersion`]) are
//! kept distinct so a store can tell a truncated file from a wrong passphrase.

/// Unified error type for the GameSaver envelope vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    // -- Envelope decode errors --------------------------------------------
    /// The envelope is not valid base64, is truncated, or its fixed-size
    /// fields do not fit.
    #[error("malformed envelope: {reason}")]
    Format { reason: String },

    /// The authentication tag or MAC did not verify (wrong passphrase, wrong
    /// associated data, or tampered bytes).
    #[error("authentication failed: wrong passphrase, associated data mismatch, or tampered data")]
    Authentication,

    /// The leading version byte does not name a known algorithm.
    #[error("unsupported envelope version: {version}")]
    UnsupportedVersion { version: u8 },

    // -- Crypto errors ------------------------------------------------------
    /// Encryption failed (e.g. invalid key length, cipher construction).
    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    /// Key derivation failed (e.g. random salt generation).
    #[error("key derivation failed: {reason}")]
    KeyDerivationFailed { reason: String },

    // -- Secret store errors ------------------------------------------------
    /// No local secret has been generated yet.
    #[error("local secret not found")]
    SecretNotFound,

    /// Reading or writing the local secret failed.
    #[error("secret store failure: {reason}")]
    SecretStoreFailed { reason: String },

    // -- Underlying errors --------------------------------------------------
    /// I/O error from the filesystem (secret file operations).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant.  Prefer a typed variant whenever possible.
    #[error("internal vault error: {0}")]
    Internal(String),
}

impl VaultError {
    /// Shorthand for building a [`VaultError::Format`].
    pub(crate) fn format(reason: impl Into<String>) -> Self {
        Self::Format {
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the vault crate.
pub type Result<T> = std::result::Result<T, VaultError>;
