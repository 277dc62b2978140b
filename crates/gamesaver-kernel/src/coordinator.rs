//! Save request coalescing.
//!
//! [`SaveCoordinator`] turns any number of overlapping save requests into a
//! strictly sequential series of save cycles:
//!
//! ```text
//! Idle ──request──▶ Running ──done──▶ trailing requested? ──yes──▶ Running
//!                                          │
//!                                          no
//!                                          ▼
//!                                        Idle
//! ```
//!
//! A request made while a cycle is running does not start a second cycle.
//! It marks that one more cycle must follow and receives the [`SaveHandle`]
//! already in use, which resolves once the running cycle and every trailing
//! cycle have finished. However many requests arrive during one cycle, at
//! most one trailing cycle follows it, and that cycle runs with the
//! strongest [`Durability`] any of them asked for.
//!
//! Cycles run on a spawned task, so a cycle that has started always runs to
//! completion even if every caller stops waiting.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use gamesaver_store::Durability;
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Result of a coalesced save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOutcome {
    /// Whether the last cycle run for this handle succeeded.
    pub success: bool,
    /// Number of cycles run before the handle resolved.
    pub cycles: u32,
}

impl SaveOutcome {
    /// Outcome of a save that never ran.
    pub const NOT_RUN: Self = Self {
        success: false,
        cycles: 0,
    };
}

/// Shared completion handle for a run of save cycles.
///
/// Every caller coalesced into the same run holds a clone of the same
/// handle. Waiting never fails: a failed save resolves with
/// `success == false`.
#[derive(Debug, Clone)]
pub struct SaveHandle {
    rx: watch::Receiver<Option<SaveOutcome>>,
}

impl SaveHandle {
    /// A handle that is already resolved.
    pub fn resolved(outcome: SaveOutcome) -> Self {
        let (_tx, rx) = watch::channel(Some(outcome));
        Self { rx }
    }

    /// Wait until the run this handle belongs to has finished.
    pub async fn wait(mut self) -> SaveOutcome {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).unwrap_or(SaveOutcome::NOT_RUN),
            // The driver went away without reporting.
            Err(_) => SaveOutcome::NOT_RUN,
        }
    }

    /// Whether both handles belong to the same run.
    pub fn same_as(&self, other: &SaveHandle) -> bool {
        self.rx.same_channel(&other.rx)
    }

    pub fn is_finished(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CycleState {
    active: Option<ActiveRun>,
}

struct ActiveRun {
    handle: SaveHandle,
    trailing: Option<Durability>,
}

/// Coalesces save requests into serialized cycles.
///
/// Cheaply cloneable; clones share state.
#[derive(Clone, Default)]
pub struct SaveCoordinator {
    state: Arc<Mutex<CycleState>>,
}

impl SaveCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a save with the given durability.
    ///
    /// When idle, spawns a driver that calls `run` once per cycle and
    /// returns a fresh handle. When a cycle is already running, `run` is
    /// dropped, a trailing cycle is recorded (escalating its durability if
    /// `mode` is stronger) and the running handle is returned.
    ///
    /// `run` resolves to whether the cycle succeeded.
    pub fn request<F, Fut>(&self, mode: Durability, run: F) -> SaveHandle
    where
        F: FnMut(Durability) -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(active) = state.active.as_mut() {
            let trailing = active.trailing.map_or(mode, |pending| pending.max(mode));
            active.trailing = Some(trailing);
            tracing::debug!(durability = ?trailing, "save coalesced into trailing cycle");
            return active.handle.clone();
        }

        let (tx, rx) = watch::channel(None);
        let handle = SaveHandle { rx };
        state.active = Some(ActiveRun {
            handle: handle.clone(),
            trailing: None,
        });
        drop(state);

        tokio::spawn(drive(Arc::clone(&self.state), tx, mode, run));
        handle
    }

    /// Whether a cycle is running or queued.
    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .is_some()
    }
}

async fn drive<F, Fut>(
    state: Arc<Mutex<CycleState>>,
    tx: watch::Sender<Option<SaveOutcome>>,
    mut mode: Durability,
    mut run: F,
) where
    F: FnMut(Durability) -> Fut,
    Fut: Future<Output = bool>,
{
    let mut reset = ResetOnDrop {
        state: Arc::clone(&state),
        armed: true,
    };

    let mut cycles = 0;
    let success = loop {
        tracing::debug!(cycle = cycles + 1, durability = ?mode, "save cycle starting");
        let ok = run(mode).await;
        cycles += 1;

        match next_cycle(&state) {
            Some(next) => mode = next,
            None => break ok,
        }
    };
    reset.armed = false;

    tx.send_replace(Some(SaveOutcome { success, cycles }));
}

/// Take the trailing request, or go idle if there is none.
fn next_cycle(state: &Mutex<CycleState>) -> Option<Durability> {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    let next = state.active.as_mut().and_then(|active| active.trailing.take());
    if next.is_none() {
        state.active = None;
    }
    next
}

/// Returns the coordinator to idle if the driver unwinds mid-cycle.
struct ResetOnDrop {
    state: Arc<Mutex<CycleState>>,
    armed: bool,
}

impl Drop for ResetOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .active = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_request_runs_one_cycle() {
        let coordinator = SaveCoordinator::new();
        let handle = coordinator.request(Durability::Async, |_| async { true });

        let outcome = handle.wait().await;
        assert_eq!(
            outcome,
            SaveOutcome {
                success: true,
                cycles: 1
            }
        );
        assert!(!coordinator.is_running());
    }

    #[tokio::test]
    async fn failed_cycle_still_resolves() {
        let coordinator = SaveCoordinator::new();
        let outcome = coordinator
            .request(Durability::Immediate, |_| async { false })
            .wait()
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.cycles, 1);
    }

    #[tokio::test]
    async fn sequential_requests_get_distinct_handles() {
        let coordinator = SaveCoordinator::new();
        let first = coordinator.request(Durability::Async, |_| async { true });
        first.clone().wait().await;
        let second = coordinator.request(Durability::Async, |_| async { true });

        assert!(!first.same_as(&second));
        assert_eq!(second.wait().await.cycles, 1);
    }

    #[test]
    fn resolved_handle_is_finished() {
        let handle = SaveHandle::resolved(SaveOutcome::NOT_RUN);
        assert!(handle.is_finished());
    }
}
