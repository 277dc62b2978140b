//! Durable file store.
//!
//! [`FileStore`] persists profiles under `root/<profile id>/` either as one
//! file holding every module or as one file per module. Every write goes
//! through [`write_atomic`]:
//!
//! 1. The new bytes are staged to `<path>.tmp`.
//! 2. If `<path>` exists, its current contents are hard-linked (or copied)
//!    to `<path>.bak.tmp`.
//! 3. `<path>.tmp` is renamed over `<path>`.
//! 4. `<path>.bak.tmp` is renamed onto `<path>.bak`.
//! 5. `<path>.tmp` is removed if anything is left of it.
//!
//! Every rename is atomic, so `<path>` is at every instant either the
//! previous complete version or the new complete version. `<path>.bak`
//! holds the last version committed before the current one and is only
//! replaced once the new primary is in place.
//!
//! Reads are admitted through a bounded semaphore, then fetch, decrypt and
//! deserialize in order. If any step fails the read is repeated under the
//! profile directory's write lock; if it still fails the backup is copied
//! over the primary and the read is retried once. A read that still fails
//! yields `None`; read errors never escape the store.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gamesaver_vault::{FileSecretStore, PassphraseSource, envelope};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{Layout, SaveSettings};
use crate::error::{StoreError, StoreResult};
use crate::profile::{ProfileData, validate_name};

/// Suffix of the staged copy written before the swap.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Suffix of the previous committed version.
pub const BACKUP_SUFFIX: &str = ".bak";

/// Suffix of the copy staged while restoring a backup. Distinct from
/// [`TEMP_SUFFIX`] so a restore never clobbers a writer's staged file.
pub const RESTORE_SUFFIX: &str = ".restore.tmp";

/// How hard a write tries to reach stable storage before returning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Durability {
    /// Leave flushing to the operating system.
    #[default]
    Async,
    /// fsync the staged file before the swap and the directory after it.
    Immediate,
}

/// Summary of one profile directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileInfo {
    pub id: String,
    /// Newest modification time among the profile's save files and backups.
    pub last_modified: Option<DateTime<Utc>>,
    /// Number of save files (excluding backups).
    pub files: usize,
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// Profile persistence rooted at a directory.
///
/// Cloning is cheap; clones share the read limiter and directory locks.
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<Inner>,
}

struct Inner {
    settings: SaveSettings,
    codec: Codec,
    read_limiter: Semaphore,
    dir_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl FileStore {
    /// Create a store from validated settings.
    ///
    /// When encryption is enabled the local secret lives at
    /// [`SaveSettings::secret_path`].
    pub fn new(settings: SaveSettings) -> StoreResult<Self> {
        let passphrase = settings.use_encryption.then(|| {
            Arc::new(PassphraseSource::new(
                Box::new(FileSecretStore::new(settings.secret_path())),
                settings.bind_to_device,
            ))
        });
        Self::build(settings, passphrase)
    }

    /// Create a store that takes its passphrase from `source`.
    ///
    /// The source is ignored when encryption is disabled in `settings`.
    pub fn with_passphrase_source(
        settings: SaveSettings,
        source: Arc<PassphraseSource>,
    ) -> StoreResult<Self> {
        let passphrase = settings.use_encryption.then_some(source);
        Self::build(settings, passphrase)
    }

    fn build(settings: SaveSettings, passphrase: Option<Arc<PassphraseSource>>) -> StoreResult<Self> {
        settings.validate()?;
        info!(
            root = %settings.root.display(),
            layout = ?settings.layout,
            encrypted = passphrase.is_some(),
            "file store ready"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                read_limiter: Semaphore::new(settings.read_concurrency),
                codec: Codec { passphrase },
                settings,
                dir_locks: DashMap::new(),
            }),
        })
    }

    pub fn settings(&self) -> &SaveSettings {
        &self.inner.settings
    }

    pub fn root(&self) -> &Path {
        &self.inner.settings.root
    }

    pub fn layout(&self) -> Layout {
        self.inner.settings.layout
    }

    /// The passphrase source, if encryption is enabled.
    pub fn passphrase_source(&self) -> Option<&Arc<PassphraseSource>> {
        self.inner.codec.passphrase.as_ref()
    }

    /// Directory of a profile.
    pub fn profile_dir(&self, profile_id: &str) -> StoreResult<PathBuf> {
        validate_name("profile id", profile_id)?;
        Ok(self.root().join(profile_id))
    }

    /// Path of the whole-profile file (single-file layout).
    pub fn profile_path(&self, profile_id: &str) -> StoreResult<PathBuf> {
        Ok(self
            .profile_dir(profile_id)?
            .join(self.settings().profile_file_name()))
    }

    /// Path of one module's file (split layout).
    pub fn module_path(&self, profile_id: &str, module_key: &str) -> StoreResult<PathBuf> {
        validate_name("module key", module_key)?;
        Ok(self
            .profile_dir(profile_id)?
            .join(self.settings().module_file_name(module_key)))
    }

    // -- reads --------------------------------------------------------------

    /// Load a whole profile.
    ///
    /// In split layout every module file is read independently; a module
    /// whose file and backup are both unreadable is skipped and the rest of
    /// the profile is still returned. Returns `None` when the profile does
    /// not exist or nothing could be read.
    pub async fn read_profile(&self, profile_id: &str) -> Option<ProfileData> {
        let dir = match self.profile_dir(profile_id) {
            Ok(dir) => dir,
            Err(e) => {
                warn!(profile_id, error = %e, "refusing to read profile");
                return None;
            }
        };
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            debug!(profile_id, "profile directory does not exist");
            return None;
        }

        match self.layout() {
            Layout::SingleFile => {
                let path = dir.join(self.settings().profile_file_name());
                self.read_decoded::<ProfileData>(path).await
            }
            Layout::Split => self.read_split_profile(profile_id, dir).await,
        }
    }

    async fn read_split_profile(&self, profile_id: &str, dir: PathBuf) -> Option<ProfileData> {
        let suffix = format!(".{}", self.settings().extension());
        let listing = tokio::task::spawn_blocking(move || module_files(&dir, &suffix)).await;
        let files = match listing {
            Ok(Ok(files)) => files,
            Ok(Err(e)) => {
                warn!(profile_id, error = %e, "failed to list profile directory");
                return None;
            }
            Err(e) => {
                warn!(profile_id, error = %e, "profile listing task failed");
                return None;
            }
        };

        let reads = files.into_iter().map(|(key, path)| async move {
            let module = self.read_decoded::<Value>(path).await;
            (key, module)
        });

        let mut data = ProfileData::new();
        for (key, module) in futures::future::join_all(reads).await {
            match module {
                Some(module) => {
                    data.insert(key, module);
                }
                None => warn!(profile_id, module_key = %key, "skipping unreadable module"),
            }
        }

        (!data.is_empty()).then_some(data)
    }

    /// Load a single module (split layout only).
    ///
    /// `Ok(None)` means the module has no file or could not be recovered.
    pub async fn read_module(&self, profile_id: &str, module_key: &str) -> StoreResult<Option<Value>> {
        if self.layout() != Layout::Split {
            return Err(StoreError::LayoutMismatch {
                operation: "read_module",
            });
        }
        let path = self.module_path(profile_id, module_key)?;
        Ok(self.read_decoded::<Value>(path).await)
    }

    /// Load every profile under the root concurrently.
    ///
    /// Profiles that cannot be read are logged and left out.
    pub async fn read_all_profiles(&self) -> BTreeMap<String, ProfileData> {
        let ids = match self.profile_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(root = %self.root().display(), error = %e, "failed to enumerate profiles");
                return BTreeMap::new();
            }
        };

        let reads = ids.into_iter().map(|id| async move {
            let data = self.read_profile(&id).await;
            (id, data)
        });

        let mut profiles = BTreeMap::new();
        for (id, data) in futures::future::join_all(reads).await {
            match data {
                Some(data) => {
                    profiles.insert(id, data);
                }
                None => warn!(profile_id = %id, "failed to load profile"),
            }
        }
        profiles
    }

    async fn read_decoded<T>(&self, path: PathBuf) -> Option<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let Ok(_permit) = self.inner.read_limiter.acquire().await else {
            return None;
        };

        let codec = self.inner.codec.clone();
        let first = {
            let path = path.clone();
            let codec = codec.clone();
            tokio::task::spawn_blocking(move || {
                let aad = associated_data(&path);
                read_once(&path, |bytes| codec.decode::<T>(bytes, &aad))
            })
        };
        match first.await {
            Ok(ReadAttempt::Decoded(value)) => return Some(value),
            Ok(ReadAttempt::Missing) => return None,
            Ok(ReadAttempt::Failed(e)) => {
                warn!(path = %path.display(), error = %e, "failed to read file");
            }
            Err(e) => {
                warn!(error = %e, "read task failed");
                return None;
            }
        }

        // Restoring the backup rewrites the primary, so it runs under the
        // same directory lock as writes.
        let lock = path.parent().map(|dir| self.dir_lock(dir));
        let _guard = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let task = tokio::task::spawn_blocking(move || {
            let aad = associated_data(&path);
            read_with_restore(&path, |bytes| codec.decode::<T>(bytes, &aad))
        });
        task.await.unwrap_or_else(|e| {
            warn!(error = %e, "read task failed");
            None
        })
    }

    // -- writes -------------------------------------------------------------

    /// Persist a whole profile.
    ///
    /// Single-file layout writes one file; split layout writes one file per
    /// module. Writes within a profile directory are serialized.
    pub async fn write_profile(
        &self,
        profile_id: &str,
        data: &ProfileData,
        durability: Durability,
    ) -> StoreResult<()> {
        let dir = self.profile_dir(profile_id)?;
        let lock = self.dir_lock(&dir);
        let _guard = lock.lock().await;

        match self.layout() {
            Layout::SingleFile => {
                let path = dir.join(self.settings().profile_file_name());
                self.encode_and_write(path, data.clone(), durability).await?;
            }
            Layout::Split => {
                for (key, module) in data.iter() {
                    let path = self.module_path(profile_id, key)?;
                    self.encode_and_write(path, module.clone(), durability).await?;
                }
            }
        }

        debug!(profile_id, modules = data.len(), durability = ?durability, "profile written");
        Ok(())
    }

    /// Persist one module (split layout only).
    pub async fn write_module(
        &self,
        profile_id: &str,
        module_key: &str,
        module: &Value,
        durability: Durability,
    ) -> StoreResult<()> {
        if self.layout() != Layout::Split {
            return Err(StoreError::LayoutMismatch {
                operation: "write_module",
            });
        }
        let path = self.module_path(profile_id, module_key)?;
        let lock = self.dir_lock(&self.profile_dir(profile_id)?);
        let _guard = lock.lock().await;

        self.encode_and_write(path, module.clone(), durability).await?;
        debug!(profile_id, module_key, durability = ?durability, "module written");
        Ok(())
    }

    async fn encode_and_write<T>(&self, path: PathBuf, value: T, durability: Durability) -> StoreResult<()>
    where
        T: Serialize + Send + 'static,
    {
        let codec = self.inner.codec.clone();
        tokio::task::spawn_blocking(move || {
            let bytes = codec.encode(&value, &associated_data(&path))?;
            write_atomic(&path, &bytes, durability)?;
            Ok(())
        })
        .await?
    }

    fn dir_lock(&self, dir: &Path) -> Arc<Mutex<()>> {
        self.inner
            .dir_locks
            .entry(dir.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // -- profile management -------------------------------------------------

    /// Remove a profile directory and everything in it.
    ///
    /// Returns `false` when the profile did not exist.
    pub async fn delete_profile(&self, profile_id: &str) -> StoreResult<bool> {
        let dir = self.profile_dir(profile_id)?;
        let lock = self.dir_lock(&dir);
        let guard = lock.lock().await;

        let deleted = match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(profile_id, path = %dir.display(), "profile deleted");
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        // Only the map and this call hold the lock: nobody is waiting on it.
        self.inner
            .dir_locks
            .remove_if(&dir, |_, entry| Arc::strong_count(entry) == 2);
        drop(guard);
        Ok(deleted)
    }

    /// Describe every profile directory, most recently modified first.
    pub async fn list_profiles(&self) -> StoreResult<Vec<ProfileInfo>> {
        let root = self.root().to_path_buf();
        let extension = self.settings().extension().to_string();
        tokio::task::spawn_blocking(move || scan_profiles(&root, &extension)).await?
    }

    /// Id of the profile holding the most recently modified save file or
    /// backup, or `None` if there is none.
    pub async fn most_recently_used_profile(&self) -> Option<String> {
        match self.list_profiles().await {
            Ok(profiles) => profiles
                .into_iter()
                .filter(|p| p.last_modified.is_some())
                .max_by_key(|p| p.last_modified)
                .map(|p| p.id),
            Err(e) => {
                warn!(root = %self.root().display(), error = %e, "failed to find most recent profile");
                None
            }
        }
    }

    async fn profile_ids(&self) -> StoreResult<Vec<String>> {
        let root = self.root().to_path_buf();
        tokio::task::spawn_blocking(move || {
            let entries = match fs::read_dir(&root) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let mut ids = Vec::new();
            for entry in entries {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    ids.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            ids.sort();
            Ok(ids)
        })
        .await?
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("root", &self.root())
            .field("layout", &self.layout())
            .field("encrypted", &self.inner.codec.passphrase.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// JSON serialization plus optional envelope encryption.
#[derive(Clone)]
struct Codec {
    passphrase: Option<Arc<PassphraseSource>>,
}

impl Codec {
    fn encode<T: Serialize>(&self, value: &T, aad: &[u8]) -> StoreResult<Vec<u8>> {
        let json = serde_json::to_vec(value)?;
        let Some(source) = &self.passphrase else {
            return Ok(json);
        };
        let passphrase = source.passphrase()?;
        Ok(envelope::seal(&json, passphrase.as_bytes(), Some(aad))?.into_bytes())
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8], aad: &[u8]) -> StoreResult<T> {
        let Some(source) = &self.passphrase else {
            return Ok(serde_json::from_slice(bytes)?);
        };
        let passphrase = source.passphrase()?;
        let text = String::from_utf8_lossy(bytes);
        let plain = envelope::open(text.trim(), passphrase.as_bytes(), Some(aad))?;
        Ok(serde_json::from_slice(&plain)?)
    }
}

/// Envelopes are bound to the file name they were written under, so a file
/// moved onto another module's name fails authentication.
fn associated_data(path: &Path) -> Vec<u8> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned().into_bytes())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Atomic file protocol
// ---------------------------------------------------------------------------

/// `<path>.tmp`
pub fn tmp_path(path: &Path) -> PathBuf {
    with_suffix(path, TEMP_SUFFIX)
}

/// `<path>.bak`
pub fn bak_path(path: &Path) -> PathBuf {
    with_suffix(path, BACKUP_SUFFIX)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Replace `path` with `bytes` so that readers never observe a partial file,
/// keeping the previous version at `<path>.bak`.
pub fn write_atomic(path: &Path, bytes: &[u8], durability: Durability) -> io::Result<()> {
    let result = stage_temp(path, bytes, durability).and_then(|_| commit_staged(path, durability));

    let tmp = tmp_path(path);
    if let Err(e) = remove_if_exists(&tmp) {
        warn!(path = %tmp.display(), error = %e, "failed to remove temp file");
    }
    result
}

/// Write `bytes` to `<path>.tmp`, creating the parent directory if needed.
pub fn stage_temp(path: &Path, bytes: &[u8], durability: Durability) -> io::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    if durability == Durability::Immediate {
        file.sync_all()?;
    }
    Ok(tmp)
}

/// Swap a previously staged `<path>.tmp` into `path`, moving the current
/// contents of `path` to `<path>.bak`.
pub fn commit_staged(path: &Path, durability: Durability) -> io::Result<()> {
    let tmp = tmp_path(path);

    let staging = if path.exists() {
        let staging = with_suffix(path, ".bak.tmp");
        remove_if_exists(&staging)?;
        if fs::hard_link(path, &staging).is_err() {
            fs::copy(path, &staging)?;
        }
        Some(staging)
    } else {
        None
    };

    if let Err(e) = fs::rename(&tmp, path) {
        // The old backup is still the previous version; leave it alone.
        if let Some(staging) = &staging {
            let _ = remove_if_exists(staging);
        }
        return Err(e);
    }
    if let Some(staging) = &staging {
        fs::rename(staging, bak_path(path))?;
    }

    if durability == Durability::Immediate {
        if let Some(parent) = path.parent() {
            sync_dir(parent)?;
        }
    }
    debug!(path = %path.display(), durability = ?durability, "file committed");
    Ok(())
}

/// Copy `<path>.bak` over `path`. Returns `false` if there is no backup or
/// it could not be restored.
pub fn try_rollback(path: &Path) -> bool {
    let bak = bak_path(path);
    if !bak.exists() {
        warn!(path = %bak.display(), "rollback failed: backup not found");
        return false;
    }

    let staging = with_suffix(path, RESTORE_SUFFIX);
    let restored = fs::copy(&bak, &staging).and_then(|_| fs::rename(&staging, path));
    match restored {
        Ok(()) => {
            warn!(path = %path.display(), "restored file from backup");
            true
        }
        Err(e) => {
            let _ = remove_if_exists(&staging);
            warn!(path = %path.display(), error = %e, "rollback failed");
            false
        }
    }
}

/// Read and decode `path`, restoring from backup and retrying once on
/// failure. A missing primary file is reported as `None` without touching
/// the backup.
fn read_with_restore<T>(path: &Path, decode: impl Fn(&[u8]) -> StoreResult<T>) -> Option<T> {
    let mut allow_restore = true;
    loop {
        match read_once(path, &decode) {
            ReadAttempt::Decoded(value) => return Some(value),
            ReadAttempt::Missing => return None,
            ReadAttempt::Failed(e) => {
                warn!(path = %path.display(), error = %e, "failed to read file");
                if allow_restore && try_rollback(path) {
                    allow_restore = false;
                    continue;
                }
                return None;
            }
        }
    }
}

/// Outcome of a single fetch-and-decode.
enum ReadAttempt<T> {
    Decoded(T),
    Missing,
    Failed(StoreError),
}

fn read_once<T>(path: &Path, decode: impl Fn(&[u8]) -> StoreResult<T>) -> ReadAttempt<T> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "file not found");
            return ReadAttempt::Missing;
        }
        Err(e) => return ReadAttempt::Failed(e.into()),
    };
    match decode(&bytes) {
        Ok(value) => {
            debug!(path = %path.display(), "file read");
            ReadAttempt::Decoded(value)
        }
        Err(e) => ReadAttempt::Failed(e),
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Directory scans
// ---------------------------------------------------------------------------

/// `(module key, path)` for every `*.<ext>` file in a profile directory.
fn module_files(dir: &Path, suffix: &str) -> io::Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(key) = name.strip_suffix(suffix) {
            if !key.is_empty() {
                files.push((key.to_string(), entry.path()));
            }
        }
    }
    files.sort();
    Ok(files)
}

fn scan_profiles(root: &Path, extension: &str) -> StoreResult<Vec<ProfileInfo>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let save_suffix = format!(".{extension}");
    let mut profiles = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let mut newest: Option<SystemTime> = None;
        let mut files = 0;
        for file in fs::read_dir(entry.path())? {
            let file = file?;
            let name = file.file_name().to_string_lossy().into_owned();
            let is_save = name.ends_with(&save_suffix);
            if !is_save && !name.ends_with(BACKUP_SUFFIX) {
                continue;
            }
            if is_save {
                files += 1;
            }
            let modified = file.metadata()?.modified()?;
            newest = newest.max(Some(modified));
        }

        profiles.push(ProfileInfo {
            id: entry.file_name().to_string_lossy().into_owned(),
            last_modified: newest.map(DateTime::<Utc>::from),
            files,
        });
    }

    profiles.sort_by(|a, b| b.last_modified.cmp(&a.last_modified).then(a.id.cmp(&b.id)));
    Ok(profiles)
}
