//! Save settings.
//!
//! [`SaveSettings`] is the configuration surface shared by the store and the
//! save orchestrator: where profiles live, whether payloads are encrypted,
//! single-file versus split layout, autosave, and creation-on-missing.
//! Sensible defaults are provided via [`Default`], settings can be read from
//! TOML, overridden from `GAMESAVER_*` environment variables, and adjusted
//! with builder-style `with_*` setters.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::profile::validate_name;

/// Default file name (without extension) in single-file layout.
pub const DEFAULT_FILE_NAME: &str = "Default";

/// Default save file extension.
pub const DEFAULT_FILE_EXTENSION: &str = ".tdv";

/// Profile used when no profile has been saved yet.
pub const DEFAULT_PROFILE_ID: &str = "PROFILE A";

/// Default cap on simultaneous file reads.
pub const DEFAULT_READ_CONCURRENCY: usize = 5;

/// How a profile is laid out on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// `root/<profile>/<file_name>.<ext>` holding every module.
    #[default]
    SingleFile,
    /// `root/<profile>/<module>.<ext>`, one file per module.
    Split,
}

impl std::str::FromStr for Layout {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single_file" | "single" => Ok(Self::SingleFile),
            "split" => Ok(Self::Split),
            other => Err(StoreError::InvalidConfig {
                reason: format!("unknown layout `{other}`"),
            }),
        }
    }
}

/// Configuration for profile storage and the save orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveSettings {
    /// Directory containing one sub-directory per profile.
    ///
    /// Default: **`saves`**.
    pub root: PathBuf,

    /// Encrypt payloads into envelopes before writing.
    ///
    /// Default: **true**.
    pub use_encryption: bool,

    /// Single-file or split layout.
    ///
    /// Default: **single file**.
    pub layout: Layout,

    /// File name (without extension) used in single-file layout.
    pub file_name: String,

    /// Extension of save files; a leading dot is optional.
    pub file_extension: String,

    /// Run the periodic autosave timer.
    ///
    /// Default: **true**.
    pub enable_autosave: bool,

    /// Seconds between autosaves. Non-positive disables autosave.
    ///
    /// Default: **300**.
    pub autosave_interval_secs: f64,

    /// Start an empty profile when none exists on disk.
    ///
    /// Default: **true**.
    pub create_profile_if_missing: bool,

    /// Profile selected when no profile has been used before.
    pub default_profile_id: String,

    /// Maximum number of files read concurrently.
    ///
    /// Default: **5**.
    pub read_concurrency: usize,

    /// Mix the machine identifier into the encryption passphrase.
    ///
    /// Default: **true**.
    pub bind_to_device: bool,

    /// Where the local secret is kept. Defaults to `<root>/local_secret.key`.
    pub secret_path: Option<PathBuf>,
}

impl Default for SaveSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("saves"),
            use_encryption: true,
            layout: Layout::SingleFile,
            file_name: DEFAULT_FILE_NAME.to_string(),
            file_extension: DEFAULT_FILE_EXTENSION.to_string(),
            enable_autosave: true,
            autosave_interval_secs: 300.0,
            create_profile_if_missing: true,
            default_profile_id: DEFAULT_PROFILE_ID.to_string(),
            read_concurrency: DEFAULT_READ_CONCURRENCY,
            bind_to_device: true,
            secret_path: None,
        }
    }
}

impl SaveSettings {
    /// Default settings rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Parse settings from a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> StoreResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read settings from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let settings = Self::from_toml_str(&text)?;
        tracing::info!(path = %path.display(), "save settings loaded");
        Ok(settings)
    }

    /// Apply `GAMESAVER_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> StoreResult<Self> {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply `GAMESAVER_*` overrides using `lookup` to resolve variables.
    pub fn with_overrides_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> StoreResult<Self> {
        if let Some(root) = lookup("GAMESAVER_ROOT") {
            self.root = PathBuf::from(root);
        }
        if let Some(value) = lookup("GAMESAVER_USE_ENCRYPTION") {
            self.use_encryption = parse_bool("GAMESAVER_USE_ENCRYPTION", &value)?;
        }
        if let Some(value) = lookup("GAMESAVER_LAYOUT") {
            self.layout = value.parse()?;
        }
        if let Some(value) = lookup("GAMESAVER_AUTOSAVE_SECS") {
            self.autosave_interval_secs =
                value.trim().parse().map_err(|_| StoreError::InvalidConfig {
                    reason: format!("GAMESAVER_AUTOSAVE_SECS is not a number: `{value}`"),
                })?;
        }
        Ok(self)
    }

    /// Check the settings for values the store cannot work with.
    pub fn validate(&self) -> StoreResult<()> {
        if self.root.as_os_str().is_empty() {
            return Err(invalid("root directory is empty"));
        }
        if self.extension().is_empty() {
            return Err(invalid("file extension is empty"));
        }
        if self.layout == Layout::SingleFile {
            validate_name("file name", &self.file_name)?;
        }
        if self.read_concurrency == 0 {
            return Err(invalid("read_concurrency must be at least 1"));
        }
        if !self.autosave_interval_secs.is_finite() {
            return Err(invalid("autosave_interval_secs must be finite"));
        }
        if self.autosave_interval_secs > 0.0
            && Duration::try_from_secs_f64(self.autosave_interval_secs).is_err()
        {
            return Err(invalid("autosave_interval_secs is too large"));
        }
        validate_name("profile id", &self.default_profile_id)?;
        Ok(())
    }

    /// The extension without its leading dot.
    pub fn extension(&self) -> &str {
        self.file_extension.trim().trim_start_matches('.')
    }

    /// File name of a whole profile in single-file layout.
    pub fn profile_file_name(&self) -> String {
        format!("{}.{}", self.file_name, self.extension())
    }

    /// File name of a module in split layout.
    pub fn module_file_name(&self, module_key: &str) -> String {
        format!("{module_key}.{}", self.extension())
    }

    /// Resolved location of the local secret.
    pub fn secret_path(&self) -> PathBuf {
        self.secret_path
            .clone()
            .unwrap_or_else(|| gamesaver_vault::FileSecretStore::default_path(&self.root))
    }

    /// Autosave period, or `None` when autosave is off.
    pub fn autosave_interval(&self) -> Option<Duration> {
        if !self.enable_autosave || self.autosave_interval_secs <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(self.autosave_interval_secs).ok()
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_encryption(mut self, enabled: bool) -> Self {
        self.use_encryption = enabled;
        self
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = name.into();
        self
    }

    pub fn with_file_extension(mut self, extension: impl Into<String>) -> Self {
        self.file_extension = extension.into();
        self
    }

    /// Set the autosave period in seconds; non-positive disables the timer.
    pub fn with_autosave(mut self, enabled: bool, interval_secs: f64) -> Self {
        self.enable_autosave = enabled;
        self.autosave_interval_secs = interval_secs;
        self
    }

    pub fn with_create_profile_if_missing(mut self, create: bool) -> Self {
        self.create_profile_if_missing = create;
        self
    }

    pub fn with_default_profile_id(mut self, id: impl Into<String>) -> Self {
        self.default_profile_id = id.into();
        self
    }

    pub fn with_read_concurrency(mut self, limit: usize) -> Self {
        self.read_concurrency = limit;
        self
    }

    pub fn with_bind_to_device(mut self, bind: bool) -> Self {
        self.bind_to_device = bind;
        self
    }

    pub fn with_secret_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.secret_path = Some(path.into());
        self
    }
}

fn invalid(reason: &str) -> StoreError {
    StoreError::InvalidConfig {
        reason: reason.to_string(),
    }
}

fn parse_bool(name: &str, value: &str) -> StoreResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(StoreError::InvalidConfig {
            reason: format!("{name} is not a boolean: `{value}`"),
        }),
    }
}
