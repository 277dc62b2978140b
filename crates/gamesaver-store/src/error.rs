//! Error types for the gamesaver-store crate.
//!
//! All storage operations return [`StoreError`] via [`StoreResult`].
//! Read paths generally do not surface these: a failed read is recovered from
//! backup or reported as "no data" at the store boundary. Writes, deletes and
//! configuration loading do return them.

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the storage engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Envelope encryption or decryption failed.
    #[error("vault error: {0}")]
    Vault(#[from] gamesaver_vault::VaultError),

    /// JSON serialization or deserialization of a payload failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A profile id or module key cannot be used as a path segment.
    #[error("invalid {kind} `{name}`: {reason}")]
    InvalidName {
        kind: &'static str,
        name: String,
        reason: &'static str,
    },

    /// A per-module operation was requested in single-file layout.
    #[error("operation `{operation}` requires the split layout")]
    LayoutMismatch { operation: &'static str },

    /// No profile exists and creation on missing is disabled.
    #[error("profile not found: {profile_id}")]
    ProfileMissing { profile_id: String },

    /// Settings failed validation.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The settings file is not valid TOML.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}
