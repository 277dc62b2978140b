//! Save lifecycle notifications.
//!
//! The [`EventBus`] is a thin publish/subscribe layer over
//! [`tokio::sync::broadcast`]. The orchestrator publishes a [`SaveEvent`]
//! when a load or save starts and when it completes; hosts subscribe to drive
//! UI indicators or logging.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use gamesaver_kernel::events::{EventBus, SaveEvent};
//! # async fn example() {
//! let bus = EventBus::new(64);
//! let mut rx = bus.subscribe();
//!
//! bus.publish(SaveEvent::SaveStarted { profile_id: "PROFILE A".into() });
//!
//! let event = rx.recv().await.unwrap();
//! # }
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A notification about the active profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveEvent {
    /// A profile load began.
    LoadStarted { profile_id: String },

    /// A profile load finished. `found` is false when no profile existed on
    /// disk (a new one may still have been created).
    LoadCompleted { profile_id: String, found: bool },

    /// A save cycle began.
    SaveStarted { profile_id: String },

    /// A save cycle finished, successfully or not.
    SaveCompleted { profile_id: String, success: bool },

    /// A profile directory was deleted.
    ProfileDeleted { profile_id: String },
}

impl SaveEvent {
    /// The profile the event refers to.
    pub fn profile_id(&self) -> &str {
        match self {
            Self::LoadStarted { profile_id }
            | Self::LoadCompleted { profile_id, .. }
            | Self::SaveStarted { profile_id }
            | Self::SaveCompleted { profile_id, .. }
            | Self::ProfileDeleted { profile_id } => profile_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

/// Publish/subscribe bus for [`SaveEvent`]s.
///
/// Cheaply cloneable. Subscribers receive `Arc<SaveEvent>` so a broadcast
/// does not clone the payload per receiver.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<SaveEvent>>,
}

impl EventBus {
    /// Create a bus with the given channel capacity.
    ///
    /// A subscriber that falls more than `capacity` events behind receives
    /// [`broadcast::error::RecvError::Lagged`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event, returning how many subscribers will see it.
    ///
    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, event: SaveEvent) -> usize {
        match self.sender.send(Arc::new(event)) {
            Ok(n) => {
                tracing::trace!(receivers = n, "save event published");
                n
            }
            Err(_) => 0,
        }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<SaveEvent>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
