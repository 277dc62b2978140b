//! The save manager.
//!
//! [`SaveManager`] ties the store, the module cache, the participant
//! registry and the save coordinator together. It is constructed once by
//! the host and handed to whoever needs it; clones share one instance.
//!
//! # Lifecycle
//!
//! 1. [`SaveManager::new`] builds an idle manager. Participants may already
//!    [`register`](SaveManager::register); their registrations are buffered.
//! 2. [`SaveManager::initialize`] validates the settings, opens the store,
//!    picks the active profile (most recently used, else the configured
//!    default), loads it, applies the buffered registrations in order,
//!    announces the load, and starts the autosave timer.
//! 3. Every other operation waits for initialization to finish. If it
//!    failed the manager is inert and those operations return
//!    [`KernelError::Inert`].
//!
//! # Concurrency
//!
//! A single async mutex guards the session (store, active profile id,
//! module cache and registry). Save cycles, loads, registrations and
//! profile switches all run under it, so exactly one of them touches the
//! session at a time. Save requests go through the [`SaveCoordinator`] and
//! are coalesced before they ever reach the lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use gamesaver_store::{
    Durability, FileStore, ModuleCache, ProfileData, ProfileInfo, SaveSettings, validate_name,
};
use gamesaver_vault::PassphraseSource;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::coordinator::{SaveCoordinator, SaveHandle, SaveOutcome};
use crate::error::{KernelError, Result};
use crate::events::{EventBus, SaveEvent};
use crate::participant::{Participant, ProfileView, Registration};
use crate::registry::{Inserted, PendingQueue, SaveRegistry};

/// Where the manager is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Initialization has not finished.
    Starting,
    /// Accepting operations.
    Ready,
    /// Initialization failed; operations are refused.
    Inert,
}

// ---------------------------------------------------------------------------
// SaveManager
// ---------------------------------------------------------------------------

/// Orchestrates loading and saving the active profile.
#[derive(Clone)]
pub struct SaveManager {
    inner: Arc<Inner>,
}

struct Inner {
    settings: SaveSettings,
    passphrase: Option<Arc<PassphraseSource>>,
    pending: PendingQueue,
    session: Mutex<Session>,
    coordinator: SaveCoordinator,
    events: EventBus,
    readiness: watch::Sender<Readiness>,
    init_started: AtomicBool,
    autosave: StdMutex<Option<JoinHandle<()>>>,
}

/// State guarded by the writer lock.
struct Session {
    store: Option<FileStore>,
    profile_id: String,
    cache: Option<ModuleCache>,
    registry: SaveRegistry,
}

impl SaveManager {
    /// Create an idle manager. Call [`initialize`](Self::initialize) to
    /// start it.
    pub fn new(settings: SaveSettings) -> Self {
        Self::build(settings, None)
    }

    /// Create an idle manager whose store takes its passphrase from
    /// `source` instead of the secret file named in the settings.
    pub fn with_passphrase_source(settings: SaveSettings, source: Arc<PassphraseSource>) -> Self {
        Self::build(settings, Some(source))
    }

    /// Create and initialize a manager.
    pub async fn start(settings: SaveSettings) -> Result<Self> {
        let manager = Self::new(settings);
        manager.initialize().await?;
        Ok(manager)
    }

    fn build(settings: SaveSettings, passphrase: Option<Arc<PassphraseSource>>) -> Self {
        let (readiness, _) = watch::channel(Readiness::Starting);
        let profile_id = settings.default_profile_id.clone();
        Self {
            inner: Arc::new(Inner {
                settings,
                passphrase,
                pending: PendingQueue::new(),
                session: Mutex::new(Session {
                    store: None,
                    profile_id,
                    cache: None,
                    registry: SaveRegistry::new(),
                }),
                coordinator: SaveCoordinator::new(),
                events: EventBus::default(),
                readiness,
                init_started: AtomicBool::new(false),
                autosave: StdMutex::new(None),
            }),
        }
    }

    /// Run the initialization sequence.
    ///
    /// On failure the error is logged, the manager becomes inert and the
    /// error is returned; the host keeps running. Calling this again waits
    /// for the first call to finish.
    pub async fn initialize(&self) -> Result<()> {
        if self.inner.init_started.swap(true, Ordering::SeqCst) {
            return self.ready().await;
        }

        match self.inner.bootstrap().await {
            Ok(()) => {
                self.inner.readiness.send_replace(Readiness::Ready);
                self.inner.start_autosave();
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "save manager failed to initialize; saving is disabled");
                self.inner.readiness.send_replace(Readiness::Inert);
                Err(e)
            }
        }
    }

    pub fn readiness(&self) -> Readiness {
        *self.inner.readiness.borrow()
    }

    /// Wait for initialization to finish.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.inner.readiness.subscribe();
        let state = *rx
            .wait_for(|state| *state != Readiness::Starting)
            .await
            .map_err(|_| KernelError::Internal("readiness channel closed".into()))?;
        match state {
            Readiness::Ready => Ok(()),
            _ => Err(KernelError::Inert),
        }
    }

    pub fn settings(&self) -> &SaveSettings {
        &self.inner.settings
    }

    /// Subscribe to load and save notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<SaveEvent>> {
        self.inner.events.subscribe()
    }

    // -- registration -------------------------------------------------------

    /// Register a participant.
    ///
    /// Before initialization has finished the registration is buffered and
    /// applied, in order, during initialization. Afterwards it is applied
    /// immediately: if a profile is resident the participant is handed its
    /// module at once, followed by its load-completed callback.
    ///
    /// A different participant already owning the key is rejected with
    /// [`KernelError::KeyCollision`].
    pub async fn register(&self, registration: Registration) -> Result<()> {
        validate_name("module key", registration.key())?;
        let Some(registration) = self.inner.pending.push(registration)? else {
            return Ok(());
        };

        let mut session = self.inner.session.lock().await;
        self.inner.attach(&mut session, registration).await
    }

    /// Unregister a participant, first capturing its current state into the
    /// resident profile so it is included in the next save.
    ///
    /// Returns whether the participant was registered.
    pub async fn unregister(&self, participant: &Arc<dyn Participant>) -> Result<bool> {
        if self.inner.pending.remove(participant) == Some(true) {
            return Ok(true);
        }

        let mut session = self.inner.session.lock().await;
        self.inner.detach(&mut session, participant).await
    }

    /// Module keys of the attached participants, in registration order.
    ///
    /// Waits for startup; registrations still deferred are not listed.
    pub async fn registered_keys(&self) -> Result<Vec<String>> {
        self.ready().await?;
        Ok(self.inner.session.lock().await.registry.keys())
    }

    // -- load ---------------------------------------------------------------

    /// Reload the active profile from disk and hand every participant its
    /// module.
    ///
    /// If no profile exists and creation on missing is enabled, an empty
    /// profile is started instead. Otherwise returns
    /// [`KernelError::ProfileMissing`].
    pub async fn load_game(&self) -> Result<()> {
        self.ready().await?;
        let mut session = self.inner.session.lock().await;
        self.inner.reload(&mut session).await
    }

    /// Load every profile on disk without changing the active one.
    pub async fn load_all_profiles(&self) -> Result<BTreeMap<String, ProfileData>> {
        let store = self.store().await?;
        Ok(store.read_all_profiles().await)
    }

    /// Describe every profile on disk, most recently modified first.
    pub async fn list_profiles(&self) -> Result<Vec<ProfileInfo>> {
        let store = self.store().await?;
        Ok(store.list_profiles().await?)
    }

    // -- save ---------------------------------------------------------------

    /// Request a save cycle.
    ///
    /// Requests made while a cycle runs are coalesced into one trailing
    /// cycle and share its handle. The handle never reports an error; a
    /// failed cycle resolves with `success == false`.
    pub async fn request_save(&self, mode: Durability) -> Result<SaveHandle> {
        self.ready().await?;
        Ok(self.inner.request_save(mode))
    }

    /// Request a save and wait for it.
    pub async fn save_game(&self, mode: Durability) -> Result<SaveOutcome> {
        Ok(self.request_save(mode).await?.wait().await)
    }

    /// Hook for the host going to the background: request an immediate save.
    pub async fn on_suspend(&self) -> Result<SaveHandle> {
        self.request_save(Durability::Immediate).await
    }

    /// Hook for the host shutting down: stop autosave and save immediately.
    pub async fn shutdown(&self) -> Result<SaveOutcome> {
        self.inner.stop_autosave();
        let outcome = self.save_game(Durability::Immediate).await?;
        info!(success = outcome.success, "save manager shut down");
        Ok(outcome)
    }

    // -- profiles -----------------------------------------------------------

    /// Id of the active profile. Waits for startup to pick it.
    pub async fn profile_id(&self) -> Result<String> {
        self.ready().await?;
        Ok(self.inner.session.lock().await.profile_id.clone())
    }

    /// Whether a profile is resident in memory.
    pub async fn has_profile(&self) -> Result<bool> {
        self.ready().await?;
        Ok(self.inner.session.lock().await.cache.is_some())
    }

    /// Discard resident data and start an empty profile under the active id.
    ///
    /// Nothing is written until the next save.
    pub async fn new_game(&self) -> Result<()> {
        self.ready().await?;
        let mut session = self.inner.session.lock().await;
        let store = session.store.clone().ok_or(KernelError::Inert)?;
        let profile_id = session.profile_id.clone();
        session.cache = Some(ModuleCache::new(store, profile_id.as_str()));
        info!(profile_id = %profile_id, "new game started");
        Ok(())
    }

    /// Switch the active profile id without touching resident data, so the
    /// next save writes the current state under `profile_id`.
    pub async fn set_profile_id(&self, profile_id: impl Into<String>) -> Result<()> {
        let profile_id = profile_id.into();
        validate_name("profile id", &profile_id)?;
        self.ready().await?;

        let mut session = self.inner.session.lock().await;
        if let Some(cache) = session.cache.as_mut() {
            cache.retarget(profile_id.as_str());
        }
        info!(from = %session.profile_id, to = %profile_id, "active profile changed");
        session.profile_id = profile_id;
        Ok(())
    }

    /// Delete a profile from disk.
    ///
    /// Deleting the active profile re-resolves the active id (most recently
    /// used, else the default) and reloads it. Returns whether anything was
    /// deleted.
    pub async fn delete_profile(&self, profile_id: &str) -> Result<bool> {
        validate_name("profile id", profile_id)?;
        self.ready().await?;

        let mut session = self.inner.session.lock().await;
        let store = session.store.clone().ok_or(KernelError::Inert)?;
        let deleted = store.delete_profile(profile_id).await?;
        if deleted {
            self.inner.events.publish(SaveEvent::ProfileDeleted {
                profile_id: profile_id.to_string(),
            });
        }

        if session.profile_id == profile_id {
            session.profile_id = store
                .most_recently_used_profile()
                .await
                .unwrap_or_else(|| self.inner.settings.default_profile_id.clone());
            session.cache = None;
            if let Err(e) = self.inner.reload(&mut session).await {
                warn!(profile_id = %session.profile_id, error = %e, "no profile to fall back to");
            }
        }
        Ok(deleted)
    }

    /// Discard the local encryption secret. Every existing encrypted save
    /// becomes unreadable. Returns `false` when encryption is disabled.
    pub async fn reset_secret(&self) -> Result<bool> {
        let store = self.store().await?;
        match store.passphrase_source() {
            Some(source) => {
                source.reset()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// A copy of a resident module, if any.
    pub async fn resident_module(&self, key: &str) -> Result<Option<Value>> {
        self.ready().await?;
        let session = self.inner.session.lock().await;
        Ok(session
            .cache
            .as_ref()
            .and_then(|cache| cache.all().get(key).cloned()))
    }

    async fn store(&self) -> Result<FileStore> {
        self.ready().await?;
        self.inner
            .session
            .lock()
            .await
            .store
            .clone()
            .ok_or(KernelError::Inert)
    }
}

impl std::fmt::Debug for SaveManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveManager")
            .field("root", &self.inner.settings.root)
            .field("readiness", &self.readiness())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Inner
// ---------------------------------------------------------------------------

impl Inner {
    async fn bootstrap(&self) -> Result<()> {
        self.settings
            .validate()
            .map_err(|e| KernelError::InvalidConfig {
                reason: e.to_string(),
            })?;

        let store = match &self.passphrase {
            Some(source) => FileStore::with_passphrase_source(self.settings.clone(), Arc::clone(source))?,
            None => FileStore::new(self.settings.clone())?,
        };
        let profile_id = store
            .most_recently_used_profile()
            .await
            .unwrap_or_else(|| self.settings.default_profile_id.clone());

        let mut session = self.session.lock().await;
        session.store = Some(store);
        session.profile_id = profile_id.clone();

        self.events.publish(SaveEvent::LoadStarted {
            profile_id: profile_id.clone(),
        });
        let found = self.load_profile_data(&mut session).await;

        let mut flushed = 0;
        while let Some(batch) = self.pending.drain_or_close() {
            for registration in batch {
                let key = registration.key().to_string();
                match self.attach(&mut session, registration).await {
                    Ok(()) => flushed += 1,
                    Err(e) => error!(module_key = %key, error = %e, "deferred registration rejected"),
                }
            }
        }

        self.events.publish(SaveEvent::LoadCompleted {
            profile_id: profile_id.clone(),
            found,
        });
        info!(
            profile_id = %profile_id,
            found,
            resident = session.cache.is_some(),
            deferred_registrations = flushed,
            "save manager initialized"
        );
        Ok(())
    }

    /// Read the active profile into the cache. Returns whether it existed on
    /// disk.
    async fn load_profile_data(&self, session: &mut Session) -> bool {
        let Some(store) = session.store.clone() else {
            return false;
        };
        let profile_id = session.profile_id.clone();

        match store.read_profile(&profile_id).await {
            Some(data) => {
                info!(profile_id = %profile_id, modules = data.len(), "profile loaded");
                session.cache = Some(ModuleCache::from_profile(store, profile_id, data));
                true
            }
            None if self.settings.create_profile_if_missing => {
                info!(profile_id = %profile_id, "no saved profile; starting a new one");
                session.cache = Some(ModuleCache::new(store, profile_id));
                false
            }
            None => {
                warn!(profile_id = %profile_id, "no saved profile and creation is disabled");
                session.cache = None;
                false
            }
        }
    }

    /// Full load: read, hand out modules, notify.
    async fn reload(&self, session: &mut Session) -> Result<()> {
        let profile_id = session.profile_id.clone();
        self.events.publish(SaveEvent::LoadStarted {
            profile_id: profile_id.clone(),
        });

        let found = self.load_profile_data(session).await;
        let result = if session.cache.is_some() {
            self.hand_off_all(session).await;
            Ok(())
        } else {
            Err(KernelError::ProfileMissing {
                profile_id: profile_id.clone(),
            })
        };

        self.events
            .publish(SaveEvent::LoadCompleted { profile_id, found });
        result
    }

    /// Give every registered participant its module, then fire the
    /// load-completed callbacks of those that opted in.
    async fn hand_off_all(&self, session: &mut Session) {
        let registrations: Vec<Registration> = session.registry.iter().cloned().collect();
        let Some(cache) = session.cache.as_mut() else {
            return;
        };
        let profile_id = cache.profile_id().to_string();

        let mut loaded = Vec::with_capacity(registrations.len());
        for registration in &registrations {
            match cache.get_or_create(registration.key()).await {
                Ok(mut module) => {
                    let view = ProfileView::new(&profile_id, registration.key(), &mut module);
                    registration.participant().load_from(&view);
                    loaded.push((registration, module));
                }
                Err(e) => warn!(module_key = registration.key(), error = %e, "module unavailable"),
            }
        }

        for (registration, mut module) in loaded {
            if registration.wants_load_completed() {
                let view = ProfileView::new(&profile_id, registration.key(), &mut module);
                registration.notify_load_completed(&view);
            }
        }
        debug!(profile_id = %profile_id, participants = registrations.len(), "modules handed off");
    }

    async fn attach(&self, session: &mut Session, registration: Registration) -> Result<()> {
        if session.registry.insert(registration.clone())? == Inserted::Existing {
            return Ok(());
        }

        if let Some(cache) = session.cache.as_mut() {
            let mut module = cache.get_or_create(registration.key()).await?;
            let view = ProfileView::new(cache.profile_id(), registration.key(), &mut module);
            registration.participant().load_from(&view);
            registration.notify_load_completed(&view);
        }
        Ok(())
    }

    async fn detach(&self, session: &mut Session, participant: &Arc<dyn Participant>) -> Result<bool> {
        let Some(registration) = session.registry.remove(participant) else {
            return Ok(false);
        };
        if let Some(cache) = session.cache.as_mut() {
            capture(cache, &registration).await?;
        }
        Ok(true)
    }

    fn request_save(self: &Arc<Self>, mode: Durability) -> SaveHandle {
        let inner = Arc::clone(self);
        self.coordinator.request(mode, move |mode| {
            let inner = Arc::clone(&inner);
            async move { inner.run_cycle(mode).await }
        })
    }

    /// One save cycle. Failures are logged and reported through the
    /// save-completed event; they never propagate.
    async fn run_cycle(&self, mode: Durability) -> bool {
        let mut session = self.session.lock().await;
        let profile_id = session.profile_id.clone();
        self.events.publish(SaveEvent::SaveStarted {
            profile_id: profile_id.clone(),
        });

        let success = match self.persist(&mut session, mode).await {
            Ok(()) => {
                info!(profile_id = %profile_id, durability = ?mode, "game saved");
                true
            }
            Err(e) => {
                error!(profile_id = %profile_id, durability = ?mode, error = %e, "save cycle failed");
                false
            }
        };

        self.events
            .publish(SaveEvent::SaveCompleted { profile_id, success });
        success
    }

    async fn persist(&self, session: &mut Session, mode: Durability) -> Result<()> {
        let Session {
            store,
            cache,
            registry,
            ..
        } = session;
        let store = store.as_ref().ok_or(KernelError::Inert)?;
        let cache = cache.as_mut().ok_or(KernelError::NoProfileLoaded)?;

        for registration in registry.iter() {
            capture(cache, registration).await?;
        }
        store.write_profile(cache.profile_id(), cache.all(), mode).await?;
        Ok(())
    }

    fn start_autosave(self: &Arc<Self>) {
        let Some(period) = self.settings.autosave_interval() else {
            info!("autosave disabled");
            return;
        };

        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                debug!("autosave requested");
                inner.request_save(Durability::Async);
            }
        });

        let previous = self
            .autosave
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!(interval_secs = period.as_secs_f64(), "autosave started");
    }

    fn stop_autosave(&self) {
        let task = self
            .autosave
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            debug!("autosave stopped");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop_autosave();
    }
}

/// Pull a participant's current state into its module.
async fn capture(cache: &mut ModuleCache, registration: &Registration) -> Result<()> {
    let mut module = cache.get_or_create(registration.key()).await?;
    let profile_id = cache.profile_id().to_string();
    let mut view = ProfileView::new(&profile_id, registration.key(), &mut module);
    registration.participant().save_into(&mut view);
    cache.set(registration.key(), module);
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
