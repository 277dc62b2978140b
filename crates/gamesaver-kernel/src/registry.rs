//! Participant registry and the deferred registration queue.
//!
//! Participants may attach before the orchestrator has finished starting up.
//! Those registrations land in a [`PendingQueue`] which the orchestrator
//! drains exactly once, in submission order, during initialization. Once
//! drained the queue is closed and later registrations are applied directly
//! to the [`SaveRegistry`].
//!
//! # Example
//!
//! ```rust
//! # use std::sync::Arc;
//! # use gamesaver_kernel::participant::{Registration, SharedModule};
//! # use gamesaver_kernel::registry::SaveRegistry;
//! let mut registry = SaveRegistry::new();
//! let inventory = Arc::new(SharedModule::<u32>::new("Inventory"));
//! registry.insert(Registration::new(inventory)).unwrap();
//! assert!(registry.get("Inventory").is_some());
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{KernelError, Result};
use crate::participant::{Participant, Registration};

// ---------------------------------------------------------------------------
// SaveRegistry
// ---------------------------------------------------------------------------

/// Outcome of inserting a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    /// The participant was added.
    New,
    /// The same participant was already registered; nothing changed.
    Existing,
}

/// Registered participants, in registration order, unique by module key.
#[derive(Debug, Default)]
pub struct SaveRegistry {
    entries: Vec<Registration>,
}

impl SaveRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a registration.
    ///
    /// A different participant already holding the same key is a
    /// [`KernelError::KeyCollision`].
    pub fn insert(&mut self, registration: Registration) -> Result<Inserted> {
        if let Some(existing) = self.get(registration.key()) {
            if existing.is(registration.participant()) {
                return Ok(Inserted::Existing);
            }
            tracing::error!(module_key = registration.key(), "module key collision");
            return Err(KernelError::KeyCollision {
                key: registration.key().to_string(),
            });
        }

        tracing::debug!(module_key = registration.key(), "participant registered");
        self.entries.push(registration);
        Ok(Inserted::New)
    }

    /// Remove `participant`, returning its registration if it was present.
    pub fn remove(&mut self, participant: &Arc<dyn Participant>) -> Option<Registration> {
        let index = self.entries.iter().position(|r| r.is(participant))?;
        let removed = self.entries.remove(index);
        tracing::debug!(module_key = removed.key(), "participant unregistered");
        Some(removed)
    }

    pub fn get(&self, key: &str) -> Option<&Registration> {
        self.entries.iter().find(|r| r.key() == key)
    }

    pub fn contains(&self, participant: &Arc<dyn Participant>) -> bool {
        self.entries.iter().any(|r| r.is(participant))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Registration> {
        self.entries.iter()
    }

    /// Module keys in registration order.
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|r| r.key().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// PendingQueue
// ---------------------------------------------------------------------------

enum QueueState {
    Open(VecDeque<Registration>),
    Closed,
}

/// Registrations submitted before the orchestrator was ready.
///
/// Append-only while open. [`drain_or_close`](Self::drain_or_close) hands
/// out the buffered registrations and closes the queue once it finds it
/// empty, so registrations racing with the flush are never lost.
pub struct PendingQueue {
    state: Mutex<QueueState>,
}

impl PendingQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::Open(VecDeque::new())),
        }
    }

    /// Buffer a registration.
    ///
    /// Returns `Ok(None)` when buffered and `Ok(Some(registration))` when the
    /// queue is already closed and the caller must apply it directly. A
    /// different participant with the same key already buffered is a
    /// [`KernelError::KeyCollision`].
    pub fn push(&self, registration: Registration) -> Result<Option<Registration>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let QueueState::Open(queue) = &mut *state else {
            return Ok(Some(registration));
        };

        if let Some(existing) = queue.iter().find(|r| r.key() == registration.key()) {
            if existing.is(registration.participant()) {
                return Ok(None);
            }
            return Err(KernelError::KeyCollision {
                key: registration.key().to_string(),
            });
        }

        tracing::debug!(module_key = registration.key(), "registration deferred");
        queue.push_back(registration);
        Ok(None)
    }

    /// Drop a buffered registration of `participant`.
    ///
    /// Returns `None` when the queue is closed, otherwise whether a
    /// registration was removed.
    pub fn remove(&self, participant: &Arc<dyn Participant>) -> Option<bool> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *state {
            QueueState::Open(queue) => {
                let before = queue.len();
                queue.retain(|r| !r.is(participant));
                Some(queue.len() != before)
            }
            QueueState::Closed => None,
        }
    }

    /// Take everything buffered so far, or close the queue and return `None`
    /// if nothing is buffered. Once closed, always returns `None`.
    pub fn drain_or_close(&self) -> Option<Vec<Registration>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let QueueState::Open(queue) = &mut *state else {
            return None;
        };
        if !queue.is_empty() {
            return Some(queue.drain(..).collect());
        }
        *state = QueueState::Closed;
        None
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            QueueState::Closed
        )
    }

    pub fn len(&self) -> usize {
        match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            QueueState::Open(queue) => queue.len(),
            QueueState::Closed => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
