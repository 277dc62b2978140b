//! GameSaver orchestration kernel.
//!
//! This crate coordinates loading and saving the active profile on top of
//! `gamesaver-store`:
//!
//! - **[`participant`]** -- The [`Participant`] trait, per-module
//!   [`ProfileView`]s, and the ready-made [`SharedModule`] participant.
//! - **[`registry`]** -- Key-unique participant registry plus the queue that
//!   buffers registrations made before startup finished.
//! - **[`coordinator`]** -- Coalesces overlapping save requests into
//!   serialized cycles with at most one trailing cycle.
//! - **[`events`]** -- Publish/subscribe bus for load and save notifications
//!   backed by [`tokio::sync::broadcast`].
//! - **[`manager`]** -- [`SaveManager`], the orchestrator tying it together
//!   with autosave and lifecycle hooks.
//! - **[`error`]** -- Unified kernel error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod coordinator;
pub mod error;
pub mod events;
pub mod manager;
pub mod participant;
pub mod registry;

// Re-export the most commonly used types at the crate root for convenience.
pub use coordinator::{SaveCoordinator, SaveHandle, SaveOutcome};
pub use error::{KernelError, Result};
pub use events::{EventBus, SaveEvent};
pub use manager::{Readiness, SaveManager};
pub use participant::{Participant, ProfileView, Registration, SharedModule};
pub use registry::{PendingQueue, SaveRegistry};

pub use gamesaver_store::{Durability, Layout, SaveSettings};
