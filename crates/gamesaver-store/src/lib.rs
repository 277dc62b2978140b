//! # gamesaver-store
//!
//! Durable profile storage for GameSaver.
//!
//! Profiles live in one directory each under a configurable root and are
//! written with an atomic replace-and-backup protocol. Reads recover from the
//! backup when the primary file is corrupt, truncated, or fails
//! authentication.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  ModuleCache (active profile, in memory) │
//! ├─────────────────────────────────────────┤
//! │  FileStore                               │
//! │    single file: <root>/<id>/Default.tdv  │
//! │    split:       <root>/<id>/<key>.tdv    │
//! ├─────────────────────────────────────────┤
//! │  gamesaver-vault envelopes (optional)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use gamesaver_store::{Durability, FileStore, ProfileData, SaveSettings};
//!
//! let store = FileStore::new(SaveSettings::new("saves"))?;
//! let mut data = ProfileData::new();
//! data.insert("Inventory", serde_json::json!({"gold": 100}));
//! store.write_profile("PROFILE A", &data, Durability::Immediate).await?;
//! let loaded = store.read_profile("PROFILE A").await;
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
pub mod profile;

// ── re-exports ───────────────────────────────────────────────────────

pub use cache::{CacheStats, ModuleCache};
pub use config::{Layout, SaveSettings};
pub use error::{StoreError, StoreResult};
pub use fs::{Durability, FileStore, ProfileInfo};
pub use profile::{ProfileData, validate_name};
