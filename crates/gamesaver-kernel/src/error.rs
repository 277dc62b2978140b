//! Kernel error types.
//!
//! Every public API in this crate returns [`KernelError`]. Failures inside a
//! save cycle are not among them: a cycle reports its outcome through the
//! save-completed event and the [`SaveOutcome`](crate::SaveOutcome) of its
//! handle instead.

/// Unified error type for the GameSaver orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Registration errors ------------------------------------------------
    /// Two distinct participants claimed the same module key.
    #[error("module key `{key}` is already owned by another participant")]
    KeyCollision { key: String },

    // -- Profile errors -----------------------------------------------------
    /// No profile exists on disk and creation on missing is disabled.
    #[error("profile not found: {profile_id}")]
    ProfileMissing { profile_id: String },

    /// There is no resident profile to operate on.
    #[error("no profile is loaded; start a new game first")]
    NoProfileLoaded,

    // -- Lifecycle errors ---------------------------------------------------
    /// Initialization failed; the manager ignores further work.
    #[error("save manager is inert after failed initialization")]
    Inert,

    /// Settings were rejected during initialization.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // -- Wrapped errors -----------------------------------------------------
    #[error("store error: {0}")]
    Store(#[from] gamesaver_store::StoreError),

    #[error("vault error: {0}")]
    Vault(#[from] gamesaver_vault::VaultError),

    /// A module payload could not be converted to or from a typed value.
    #[error("module `{key}` has an unexpected shape: {source}")]
    Module {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    // -- Generic ------------------------------------------------------------
    #[error("internal kernel error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
