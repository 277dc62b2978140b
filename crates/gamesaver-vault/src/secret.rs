//! Local secret storage and passphrase derivation.
//!
//! Save files are never encrypted with a user-typed password. Instead a
//! random 32-byte *local secret* is generated the first time encryption is
//! needed and persisted outside any envelope through a [`SecretStore`]. The
//! passphrase handed to the envelope is then
//!
//! ```text
//! base64( SHA-256( base64(secret) | device-id | APP_SALT ) )
//! ```
//!
//! where `device-id` is either a stable machine identifier (when bound to the
//! device) or the literal `any_device`.
//!
//! Discarding the stored secret via [`PassphraseSource::reset`] makes every
//! previously written envelope undecryptable.
//!
//! # Security Notes
//!
//! - [`FileSecretStore`] restricts the secret file to mode 0600 on Unix. It
//!   does not protect against an attacker with access to the same account.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::crypto;
use crate::error::{Result, VaultError};

/// Length of the generated local secret in bytes.
pub const SECRET_LEN: usize = 32;

/// Constant mixed into every passphrase. Changing this invalidates all
/// previously written envelopes.
const APP_SALT: &str = "GameSaver|envelope|v1";

/// Device id used when the passphrase is not bound to the machine.
const ANY_DEVICE: &str = "any_device";

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over where the local secret lives.
///
/// Implementations must be `Send + Sync` so a passphrase source can be shared
/// across async tasks.
pub trait SecretStore: Send + Sync {
    /// Retrieve the stored secret.
    ///
    /// Returns [`VaultError::SecretNotFound`] if none has been stored yet.
    fn get_secret(&self) -> Result<Vec<u8>>;

    /// Store (or overwrite) the secret.
    fn set_secret(&self, secret: &[u8]) -> Result<()>;

    /// Check whether a secret has been stored.
    fn has_secret(&self) -> Result<bool>;

    /// Delete the stored secret. Deleting a missing secret is not an error.
    fn delete_secret(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// Secret store that keeps the secret base64-encoded in a single file.
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    /// Create a store backed by `path`. The file is created on first
    /// [`set_secret`](SecretStore::set_secret); missing parent directories
    /// are created then.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default secret location: `<root>/local_secret.key`.
    pub fn default_path(root: &Path) -> PathBuf {
        root.join("local_secret.key")
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SecretStore for FileSecretStore {
    fn get_secret(&self) -> Result<Vec<u8>> {
        if !self.path.exists() {
            return Err(VaultError::SecretNotFound);
        }

        let text = std::fs::read_to_string(&self.path)?;
        let secret = BASE64
            .decode(text.trim())
            .map_err(|e| VaultError::SecretStoreFailed {
                reason: format!("secret file is not valid base64: {e}"),
            })?;

        if secret.is_empty() {
            return Err(VaultError::SecretStoreFailed {
                reason: "secret file is empty".into(),
            });
        }

        tracing::debug!(path = %self.path.display(), "loaded local secret");
        Ok(secret)
    }

    fn set_secret(&self, secret: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(&self.path, BASE64.encode(secret))?;

        // Restrict file permissions on Unix (owner read/write only).
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::info!(path = %self.path.display(), "stored local secret");
        Ok(())
    }

    fn has_secret(&self) -> Result<bool> {
        Ok(self.path.exists())
    }

    fn delete_secret(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
            tracing::info!(path = %self.path.display(), "deleted local secret");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local secret store. Useful for tests and for hosts that manage
/// the secret themselves.
#[derive(Default)]
pub struct MemorySecretStore {
    secret: Mutex<Option<Vec<u8>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn get_secret(&self) -> Result<Vec<u8>> {
        self.secret
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(VaultError::SecretNotFound)
    }

    fn set_secret(&self, secret: &[u8]) -> Result<()> {
        *self.secret.lock().unwrap_or_else(PoisonError::into_inner) = Some(secret.to_vec());
        Ok(())
    }

    fn has_secret(&self) -> Result<bool> {
        Ok(self
            .secret
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some())
    }

    fn delete_secret(&self) -> Result<()> {
        *self.secret.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Passphrase
// ---------------------------------------------------------------------------

/// A derived envelope passphrase.
#[derive(Clone, PartialEq, Eq)]
pub struct Passphrase(String);

impl Passphrase {
    /// Derive a passphrase from raw secret bytes and a device id.
    pub fn derive(secret: &[u8], device_id: &str) -> Self {
        let mix = format!("{}|{}|{}", BASE64.encode(secret), device_id, APP_SALT);
        Self(BASE64.encode(crypto::sha256(mix.as_bytes())))
    }

    /// Bytes handed to the key derivation function.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passphrase(..)")
    }
}

/// Produces the passphrase for envelopes from a [`SecretStore`], creating
/// the secret on first use.
pub struct PassphraseSource {
    store: Box<dyn SecretStore>,
    device_id: String,
    cached: Mutex<Option<Passphrase>>,
}

impl PassphraseSource {
    /// Create a source that mixes the machine's device id into the
    /// passphrase when `bind_to_device` is set.
    pub fn new(store: Box<dyn SecretStore>, bind_to_device: bool) -> Self {
        let device_id = if bind_to_device {
            device_identifier()
        } else {
            ANY_DEVICE.to_string()
        };
        Self::with_device_id(store, device_id)
    }

    /// Create a source with an explicit device id.
    pub fn with_device_id(store: Box<dyn SecretStore>, device_id: impl Into<String>) -> Self {
        Self {
            store,
            device_id: device_id.into(),
            cached: Mutex::new(None),
        }
    }

    /// Return the passphrase, generating and storing a new local secret if
    /// none exists yet.
    pub fn passphrase(&self) -> Result<Passphrase> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(passphrase) = cached.as_ref() {
            return Ok(passphrase.clone());
        }

        let secret = match self.store.get_secret() {
            Ok(secret) => secret,
            Err(VaultError::SecretNotFound) => {
                let secret = crypto::random_array::<SECRET_LEN>()?.to_vec();
                self.store.set_secret(&secret)?;
                tracing::info!("generated new local secret");
                secret
            }
            Err(e) => return Err(e),
        };

        let passphrase = Passphrase::derive(&secret, &self.device_id);
        *cached = Some(passphrase.clone());
        Ok(passphrase)
    }

    /// Discard the stored secret so the next call to
    /// [`passphrase`](Self::passphrase) generates a new one.
    ///
    /// Every envelope written under the old secret becomes unreadable.
    pub fn reset(&self) -> Result<()> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        self.store.delete_secret()?;
        *cached = None;
        tracing::warn!("local secret reset; existing encrypted saves are no longer readable");
        Ok(())
    }
}

/// Stable identifier for this machine and user.
///
/// Prefers the systemd/dbus machine id; otherwise combines hostname and
/// username.
pub fn device_identifier() -> String {
    #[cfg(unix)]
    {
        for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
            if let Ok(id) = std::fs::read_to_string(path) {
                let id = id.trim();
                if !id.is_empty() {
                    return id.to_string();
                }
            }
        }
    }

    let hostname = hostname();
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown-user".into());
    format!("{hostname}/{username}")
}

fn hostname() -> String {
    #[cfg(unix)]
    {
        std::fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .or_else(|_| std::env::var("HOSTNAME"))
            .or_else(|_| std::env::var("HOST"))
            .unwrap_or_else(|_| "unknown-host".into())
    }

    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "unknown-host".into())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
