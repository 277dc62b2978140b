//! Integration tests for the gamesaver-kernel crate.
//!
//! These tests drive a [`SaveManager`] over a temporary directory and check
//! registration ordering, save coalescing, failure reporting, and profile
//! management end to end.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use gamesaver_kernel::{
    Durability, KernelError, Layout, Participant, Readiness, Registration, SaveCoordinator,
    SaveEvent, SaveManager, SaveOutcome, SaveSettings, SharedModule,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Semaphore, broadcast};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Inventory {
    gold: u32,
}

fn settings(root: &Path) -> SaveSettings {
    SaveSettings::new(root)
        .with_default_profile_id("A")
        .with_bind_to_device(false)
        .with_autosave(false, 0.0)
}

fn inventory() -> Arc<SharedModule<Inventory>> {
    Arc::new(SharedModule::new("Inventory"))
}

fn drain(rx: &mut broadcast::Receiver<Arc<SaveEvent>>) -> Vec<SaveEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push((*event).clone());
    }
    events
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ═══════════════════════════════════════════════════════════════════════
//  Round trips
// ═══════════════════════════════════════════════════════════════════════

async fn round_trip(layout: Layout) {
    let dir = tempfile::tempdir().unwrap();
    let manager = SaveManager::start(settings(dir.path()).with_layout(layout))
        .await
        .unwrap();

    let items = inventory();
    manager.register(Registration::new(items.clone())).await.unwrap();
    items.set(Inventory { gold: 100 });

    let outcome = manager.save_game(Durability::Immediate).await.unwrap();
    assert_eq!(
        outcome,
        SaveOutcome {
            success: true,
            cycles: 1
        }
    );
    drop(manager);

    let reopened = SaveManager::start(settings(dir.path()).with_layout(layout))
        .await
        .unwrap();
    assert_eq!(reopened.profile_id().await.unwrap(), "A");

    let restored = inventory();
    reopened.register(Registration::new(restored.clone())).await.unwrap();
    assert_eq!(restored.get(), Inventory { gold: 100 });
}

#[tokio::test]
async fn single_file_round_trip_across_managers() {
    round_trip(Layout::SingleFile).await;
}

#[tokio::test]
async fn split_round_trip_across_managers() {
    round_trip(Layout::Split).await;
}

#[tokio::test]
async fn split_layout_writes_one_file_per_module() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SaveManager::start(
        settings(dir.path())
            .with_layout(Layout::Split)
            .with_encryption(false),
    )
    .await
    .unwrap();

    manager.register(Registration::new(inventory())).await.unwrap();
    manager
        .register(Registration::new(Arc::new(SharedModule::<u32>::with_value("Stats", 50))))
        .await
        .unwrap();
    assert!(manager.save_game(Durability::Async).await.unwrap().success);

    assert!(dir.path().join("A").join("Inventory.tdv").is_file());
    let stats = std::fs::read_to_string(dir.path().join("A").join("Stats.tdv")).unwrap();
    assert_eq!(stats.trim(), "50");
}

// ═══════════════════════════════════════════════════════════════════════
//  Registration
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn deferred_registrations_apply_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SaveManager::new(settings(dir.path()));
    let order = Arc::new(Mutex::new(Vec::new()));

    for key in ["C", "A", "B"] {
        let order = Arc::clone(&order);
        let registration = Registration::new(Arc::new(SharedModule::<u32>::new(key)))
            .on_load_completed(move |view| order.lock().unwrap().push(view.key().to_string()));
        manager.register(registration).await.unwrap();
    }
    assert!(order.lock().unwrap().is_empty());

    manager.initialize().await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["C", "A", "B"]);
    assert_eq!(manager.registered_keys().await.unwrap(), vec!["C", "A", "B"]);
}

#[tokio::test]
async fn deferred_registration_receives_saved_module() {
    let dir = tempfile::tempdir().unwrap();
    {
        let manager = SaveManager::start(settings(dir.path())).await.unwrap();
        let items = inventory();
        manager.register(Registration::new(items.clone())).await.unwrap();
        items.set(Inventory { gold: 7 });
        manager.save_game(Durability::Immediate).await.unwrap();
    }

    let manager = SaveManager::new(settings(dir.path()));
    let items = inventory();
    manager.register(Registration::new(items.clone())).await.unwrap();
    assert_eq!(items.get(), Inventory::default());

    manager.initialize().await.unwrap();
    assert_eq!(items.get(), Inventory { gold: 7 });
}

#[tokio::test]
async fn key_collision_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SaveManager::start(settings(dir.path())).await.unwrap();

    let first = inventory();
    manager.register(Registration::new(first.clone())).await.unwrap();
    // Registering the same participant again is a no-op.
    manager.register(Registration::new(first.clone())).await.unwrap();

    let result = manager.register(Registration::new(inventory())).await;
    assert!(matches!(result, Err(KernelError::KeyCollision { ref key }) if key == "Inventory"));
    assert_eq!(manager.registered_keys().await.unwrap(), vec!["Inventory"]);
}

#[tokio::test]
async fn key_collision_is_rejected_before_startup() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SaveManager::new(settings(dir.path()));

    manager.register(Registration::new(inventory())).await.unwrap();
    assert!(matches!(
        manager.register(Registration::new(inventory())).await,
        Err(KernelError::KeyCollision { .. })
    ));
}

#[tokio::test]
async fn invalid_module_key_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SaveManager::start(settings(dir.path())).await.unwrap();
    let sneaky = Arc::new(SharedModule::<u32>::new("../escape"));

    assert!(matches!(
        manager.register(Registration::new(sneaky)).await,
        Err(KernelError::Store(_))
    ));
}

#[tokio::test]
async fn unregister_captures_final_state() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SaveManager::start(settings(dir.path())).await.unwrap();

    let items = inventory();
    manager.register(Registration::new(items.clone())).await.unwrap();
    items.set(Inventory { gold: 42 });

    let handle: Arc<dyn Participant> = items.clone();
    assert!(manager.unregister(&handle).await.unwrap());
    assert!(!manager.unregister(&handle).await.unwrap());

    // Changes after unregistering are not captured.
    items.set(Inventory { gold: 0 });
    assert_eq!(
        manager.resident_module("Inventory").await.unwrap(),
        Some(json!({"gold": 42}))
    );

    manager.save_game(Durability::Immediate).await.unwrap();
    let stored = manager.load_all_profiles().await.unwrap();
    assert_eq!(stored["A"].get("Inventory"), Some(&json!({"gold": 42})));
}

#[tokio::test]
async fn unregister_before_startup_drops_the_registration() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SaveManager::new(settings(dir.path()));
    let items = inventory();
    let handle: Arc<dyn Participant> = items.clone();

    manager.register(Registration::new(handle.clone())).await.unwrap();
    assert!(manager.unregister(&handle).await.unwrap());

    manager.initialize().await.unwrap();
    assert!(manager.registered_keys().await.unwrap().is_empty());
}

#[tokio::test]
async fn late_registration_gets_load_completed_callback() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SaveManager::start(settings(dir.path())).await.unwrap();
    let calls = Arc::new(Mutex::new(0));

    let counter = Arc::clone(&calls);
    manager
        .register(
            Registration::new(inventory()).on_load_completed(move |_| *counter.lock().unwrap() += 1),
        )
        .await
        .unwrap();
    assert_eq!(*calls.lock().unwrap(), 1);

    manager.load_game().await.unwrap();
    assert_eq!(*calls.lock().unwrap(), 2);
}

// ═══════════════════════════════════════════════════════════════════════
//  Save coalescing
// ═══════════════════════════════════════════════════════════════════════

fn gated_runner(
    gate: Arc<Semaphore>,
    modes: Arc<Mutex<Vec<Durability>>>,
) -> impl FnMut(Durability) -> BoxFuture<'static, bool> + Send + 'static {
    move |mode| {
        let gate = Arc::clone(&gate);
        let modes = Arc::clone(&modes);
        async move {
            modes.lock().unwrap().push(mode);
            gate.acquire().await.unwrap().forget();
            true
        }
        .boxed()
    }
}

#[tokio::test]
async fn overlapping_requests_share_one_trailing_cycle() {
    let coordinator = SaveCoordinator::new();
    let gate = Arc::new(Semaphore::new(0));
    let modes = Arc::new(Mutex::new(Vec::new()));

    let first = coordinator.request(
        Durability::Async,
        gated_runner(Arc::clone(&gate), Arc::clone(&modes)),
    );
    wait_until(|| modes.lock().unwrap().len() == 1).await;

    let second = coordinator.request(
        Durability::Async,
        gated_runner(Arc::clone(&gate), Arc::clone(&modes)),
    );
    let third = coordinator.request(
        Durability::Immediate,
        gated_runner(Arc::clone(&gate), Arc::clone(&modes)),
    );
    let fourth = coordinator.request(
        Durability::Async,
        gated_runner(Arc::clone(&gate), Arc::clone(&modes)),
    );
    assert!(first.same_as(&second));
    assert!(first.same_as(&third));
    assert!(first.same_as(&fourth));
    assert!(!first.is_finished());

    gate.add_permits(1);
    wait_until(|| modes.lock().unwrap().len() == 2).await;
    assert!(!second.is_finished());
    gate.add_permits(1);

    let outcome = first.wait().await;
    assert_eq!(
        outcome,
        SaveOutcome {
            success: true,
            cycles: 2
        }
    );
    // The trailing cycle escalates to the strongest mode requested.
    assert_eq!(
        *modes.lock().unwrap(),
        vec![Durability::Async, Durability::Immediate]
    );
    assert_eq!(third.wait().await, outcome);
    assert!(!coordinator.is_running());
}

#[tokio::test]
async fn request_after_completion_starts_a_new_run() {
    let coordinator = SaveCoordinator::new();
    let gate = Arc::new(Semaphore::new(2));
    let modes = Arc::new(Mutex::new(Vec::new()));

    let first = coordinator.request(
        Durability::Async,
        gated_runner(Arc::clone(&gate), Arc::clone(&modes)),
    );
    assert_eq!(first.clone().wait().await.cycles, 1);

    let second = coordinator.request(
        Durability::Async,
        gated_runner(Arc::clone(&gate), Arc::clone(&modes)),
    );
    assert!(!first.same_as(&second));
    assert_eq!(second.wait().await.cycles, 1);
}

#[tokio::test]
async fn burst_of_save_requests_runs_at_most_two_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SaveManager::start(settings(dir.path())).await.unwrap();
    manager.register(Registration::new(inventory())).await.unwrap();
    let mut rx = manager.subscribe();

    let handles = join_all((0..10).map(|_| manager.request_save(Durability::Async))).await;
    let outcomes = join_all(handles.into_iter().map(|h| h.unwrap().wait())).await;

    for outcome in &outcomes {
        assert!(outcome.success);
        assert!(outcome.cycles <= 2);
    }
    let started = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, SaveEvent::SaveStarted { .. }))
        .count();
    assert!((1..=2).contains(&started), "ran {started} cycles");
}

// ═══════════════════════════════════════════════════════════════════════
//  Failure reporting
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn failed_write_completes_with_failure() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SaveManager::start(settings(dir.path())).await.unwrap();
    manager.register(Registration::new(inventory())).await.unwrap();

    // The profile directory cannot be created over a plain file.
    std::fs::write(dir.path().join("A"), b"in the way").unwrap();
    let mut rx = manager.subscribe();

    let outcome = manager.save_game(Durability::Immediate).await.unwrap();
    assert!(!outcome.success);
    assert_eq!(
        drain(&mut rx),
        vec![
            SaveEvent::SaveStarted {
                profile_id: "A".into()
            },
            SaveEvent::SaveCompleted {
                profile_id: "A".into(),
                success: false
            },
        ]
    );
}

#[tokio::test]
async fn invalid_configuration_leaves_manager_inert() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SaveManager::new(settings(dir.path()).with_file_extension(""));

    assert!(matches!(
        manager.initialize().await,
        Err(KernelError::InvalidConfig { .. })
    ));
    assert_eq!(manager.readiness(), Readiness::Inert);
    assert!(matches!(manager.ready().await, Err(KernelError::Inert)));
    assert!(matches!(
        manager.request_save(Durability::Async).await,
        Err(KernelError::Inert)
    ));
    assert!(matches!(manager.list_profiles().await, Err(KernelError::Inert)));
    assert!(!dir.path().join("A").exists());
}

#[tokio::test]
async fn oversized_autosave_interval_leaves_manager_inert() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SaveManager::new(settings(dir.path()).with_autosave(true, 1e20));

    assert!(matches!(
        manager.initialize().await,
        Err(KernelError::InvalidConfig { .. })
    ));
    assert_eq!(manager.readiness(), Readiness::Inert);
    assert!(matches!(manager.profile_id().await, Err(KernelError::Inert)));
}

#[tokio::test]
async fn missing_profile_without_creation_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SaveManager::start(settings(dir.path()).with_create_profile_if_missing(false))
        .await
        .unwrap();
    let mut rx = manager.subscribe();

    assert!(matches!(
        manager.load_game().await,
        Err(KernelError::ProfileMissing { ref profile_id }) if profile_id == "A"
    ));
    assert_eq!(
        drain(&mut rx),
        vec![
            SaveEvent::LoadStarted {
                profile_id: "A".into()
            },
            SaveEvent::LoadCompleted {
                profile_id: "A".into(),
                found: false
            },
        ]
    );
}

// ═══════════════════════════════════════════════════════════════════════
//  Profiles
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn most_recent_profile_is_chosen_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SaveManager::start(settings(dir.path())).await.unwrap();
    manager.save_game(Durability::Immediate).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.set_profile_id("B").await.unwrap();
    manager.save_game(Durability::Immediate).await.unwrap();
    drop(manager);

    let reopened = SaveManager::start(settings(dir.path())).await.unwrap();
    assert_eq!(reopened.profile_id().await.unwrap(), "B");
}

#[tokio::test]
async fn getters_wait_for_startup() {
    let dir = tempfile::tempdir().unwrap();
    {
        let manager = SaveManager::start(settings(dir.path())).await.unwrap();
        manager.set_profile_id("B").await.unwrap();
        let items = inventory();
        manager.register(Registration::new(items.clone())).await.unwrap();
        items.set(Inventory { gold: 3 });
        manager.save_game(Durability::Immediate).await.unwrap();
    }

    let manager = SaveManager::new(settings(dir.path()));
    manager.register(Registration::new(inventory())).await.unwrap();

    // Queried before startup has picked the most recent profile.
    let (profile_id, keys, resident, loaded, started) = tokio::join!(
        manager.profile_id(),
        manager.registered_keys(),
        manager.resident_module("Inventory"),
        manager.has_profile(),
        manager.initialize(),
    );
    started.unwrap();
    assert_eq!(profile_id.unwrap(), "B");
    assert_eq!(keys.unwrap(), vec!["Inventory"]);
    assert_eq!(resident.unwrap(), Some(json!({"gold": 3})));
    assert!(loaded.unwrap());
}

#[tokio::test]
async fn new_game_then_load_restores_disk_state() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SaveManager::start(settings(dir.path())).await.unwrap();
    let items = inventory();
    manager.register(Registration::new(items.clone())).await.unwrap();
    items.set(Inventory { gold: 5 });
    manager.save_game(Durability::Immediate).await.unwrap();

    manager.new_game().await.unwrap();
    assert_eq!(manager.resident_module("Inventory").await.unwrap(), None);

    items.set(Inventory { gold: 9 });
    manager.load_game().await.unwrap();
    assert_eq!(items.get(), Inventory { gold: 5 });
}

#[tokio::test]
async fn deleting_active_profile_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SaveManager::start(settings(dir.path())).await.unwrap();
    let items = inventory();
    manager.register(Registration::new(items.clone())).await.unwrap();

    items.set(Inventory { gold: 1 });
    manager.save_game(Durability::Immediate).await.unwrap();

    items.set(Inventory { gold: 2 });
    manager.set_profile_id("B").await.unwrap();
    manager.save_game(Durability::Immediate).await.unwrap();
    assert_eq!(manager.list_profiles().await.unwrap().len(), 2);

    let mut rx = manager.subscribe();
    assert!(manager.delete_profile("B").await.unwrap());
    assert!(!manager.delete_profile("B").await.unwrap());

    assert_eq!(manager.profile_id().await.unwrap(), "A");
    assert_eq!(items.get(), Inventory { gold: 1 });
    assert!(drain(&mut rx).contains(&SaveEvent::ProfileDeleted {
        profile_id: "B".into()
    }));

    let ids: Vec<String> = manager
        .list_profiles()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(ids, vec!["A"]);
}

#[tokio::test]
async fn load_all_profiles_leaves_active_profile_alone() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SaveManager::start(settings(dir.path())).await.unwrap();
    let items = inventory();
    manager.register(Registration::new(items.clone())).await.unwrap();

    for (id, gold) in [("A", 1), ("B", 2), ("C", 3)] {
        manager.set_profile_id(id).await.unwrap();
        items.set(Inventory { gold });
        manager.save_game(Durability::Async).await.unwrap();
    }

    let all = manager.load_all_profiles().await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all["B"].get("Inventory"), Some(&json!({"gold": 2})));
    assert_eq!(manager.profile_id().await.unwrap(), "C");
}

#[tokio::test]
async fn reset_secret_orphans_encrypted_saves() {
    let dir = tempfile::tempdir().unwrap();
    {
        let manager = SaveManager::start(settings(dir.path())).await.unwrap();
        let items = inventory();
        manager.register(Registration::new(items.clone())).await.unwrap();
        items.set(Inventory { gold: 100 });
        manager.save_game(Durability::Immediate).await.unwrap();
        assert!(manager.reset_secret().await.unwrap());
    }

    let manager = SaveManager::start(settings(dir.path())).await.unwrap();
    let items = inventory();
    manager.register(Registration::new(items.clone())).await.unwrap();
    assert_eq!(items.get(), Inventory::default());
}

#[tokio::test]
async fn reset_secret_without_encryption_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SaveManager::start(settings(dir.path()).with_encryption(false))
        .await
        .unwrap();
    assert!(!manager.reset_secret().await.unwrap());
}

// ═══════════════════════════════════════════════════════════════════════
//  Autosave and lifecycle hooks
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn autosave_persists_without_explicit_requests() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SaveManager::start(settings(dir.path()).with_autosave(true, 0.05))
        .await
        .unwrap();
    let items = inventory();
    manager.register(Registration::new(items.clone())).await.unwrap();
    items.set(Inventory { gold: 3 });

    let mut rx = manager.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(event) = rx.recv().await {
                if matches!(*event, SaveEvent::SaveCompleted { success: true, .. }) {
                    break;
                }
            }
        }
    })
    .await
    .expect("autosave never ran");

    let stored = manager.load_all_profiles().await.unwrap();
    assert_eq!(stored["A"].get("Inventory"), Some(&json!({"gold": 3})));
}

#[tokio::test]
async fn shutdown_saves_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SaveManager::start(settings(dir.path())).await.unwrap();
    let items = inventory();
    manager.register(Registration::new(items.clone())).await.unwrap();
    items.set(Inventory { gold: 11 });

    let outcome = manager.shutdown().await.unwrap();
    assert!(outcome.success);

    let suspended = manager.on_suspend().await.unwrap().wait().await;
    assert!(suspended.success);
    assert!(dir.path().join("A").join("Default.tdv").is_file());
}
