//! Authenticated save-data envelopes for GameSaver.
//!
//! This crate turns a plaintext save payload into a versioned, authenticated,
//! base64 text blob and back. Two algorithms are supported and discriminated
//! by the leading version byte, so files written by either remain readable.
//!
//! # Modules
//!
//! - [`crypto`] -- AES-256-GCM, AES-256-CBC, HMAC-SHA256, PBKDF2, CSPRNG.
//! - [`envelope`] -- the versioned envelope format (`seal` / `open`).
//! - [`secret`] -- local secret storage and passphrase derivation.
//! - [`error`] -- Unified error types.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use gamesaver_vault::{envelope, FileSecretStore, PassphraseSource};
//!
//! # fn example() -> gamesaver_vault::Result<()> {
//! let source = PassphraseSource::new(Box::new(FileSecretStore::new("saves/local_secret.key")), true);
//! let passphrase = source.passphrase()?;
//!
//! let sealed = envelope::seal(br#"{"Inventory":{"gold":100}}"#, passphrase.as_bytes(), None)?;
//! let opened = envelope::open(&sealed, passphrase.as_bytes(), None)?;
//! assert_eq!(opened, br#"{"Inventory":{"gold":100}}"#);
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod envelope;
pub mod error;
pub mod secret;

// Re-export the most commonly used types at the crate root for convenience.
pub use envelope::EnvelopeVersion;
pub use error::{Result, VaultError};
pub use secret::{FileSecretStore, MemorySecretStore, Passphrase, PassphraseSource, SecretStore};
