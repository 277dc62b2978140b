//! Participants: the producers and consumers of module data.
//!
//! A [`Participant`] owns exactly one module of the active profile,
//! identified by a stable key. At load time it is handed a read-only
//! [`ProfileView`] of that module; at save time it writes its current state
//! into a mutable view. Participants that want to know when a whole load
//! has finished opt in through [`Registration::on_load_completed`].
//!
//! [`SharedModule`] is a ready-made participant for any serde type.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{KernelError, Result};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A collaborator that supplies and consumes one module of a profile.
///
/// Implementations are shared across tasks and must use interior mutability
/// for their state.
pub trait Participant: Send + Sync {
    /// Key of the module this participant owns. Must not change after
    /// registration.
    fn key(&self) -> &str;

    /// Restore state from the module.
    fn load_from(&self, view: &ProfileView<'_>);

    /// Write current state into the module.
    fn save_into(&self, view: &mut ProfileView<'_>);
}

/// Whether two handles refer to the same participant object.
pub fn same_participant(a: &Arc<dyn Participant>, b: &Arc<dyn Participant>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

// ---------------------------------------------------------------------------
// ProfileView
// ---------------------------------------------------------------------------

/// One participant's window onto its module in the active profile.
pub struct ProfileView<'a> {
    profile_id: &'a str,
    key: &'a str,
    module: &'a mut Value,
}

impl<'a> ProfileView<'a> {
    pub fn new(profile_id: &'a str, key: &'a str, module: &'a mut Value) -> Self {
        Self {
            profile_id,
            key,
            module,
        }
    }

    pub fn profile_id(&self) -> &str {
        self.profile_id
    }

    pub fn key(&self) -> &str {
        self.key
    }

    /// The raw module payload.
    pub fn module(&self) -> &Value {
        self.module
    }

    /// True for a freshly created module nobody has written yet.
    pub fn is_empty(&self) -> bool {
        match &*self.module {
            Value::Object(map) => map.is_empty(),
            Value::Null => true,
            _ => false,
        }
    }

    /// Deserialize the whole module.
    pub fn read<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.module.clone()).map_err(|source| KernelError::Module {
            key: self.key.to_string(),
            source,
        })
    }

    /// Replace the whole module with `value`.
    pub fn write<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        *self.module = serde_json::to_value(value).map_err(|source| KernelError::Module {
            key: self.key.to_string(),
            source,
        })?;
        Ok(())
    }

    /// Read one field of an object module. `None` if the field is absent or
    /// does not deserialize as `T`.
    pub fn field<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.module
            .get(name)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Set one field, turning the module into an object if it is not one.
    pub fn set_field<T: Serialize>(&mut self, name: &str, value: T) -> Result<()> {
        let value = serde_json::to_value(value).map_err(|source| KernelError::Module {
            key: self.key.to_string(),
            source,
        })?;
        if !self.module.is_object() {
            *self.module = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut *self.module {
            map.insert(name.to_string(), value);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Callback fired after a load has been handed to every participant.
pub type LoadCompletedFn = Arc<dyn Fn(&ProfileView<'_>) + Send + Sync>;

/// A participant together with its opt-in callbacks.
///
/// The key is read once, when the registration is built.
#[derive(Clone)]
pub struct Registration {
    participant: Arc<dyn Participant>,
    key: String,
    on_load_completed: Option<LoadCompletedFn>,
}

impl Registration {
    pub fn new(participant: Arc<dyn Participant>) -> Self {
        let key = participant.key().to_string();
        Self {
            participant,
            key,
            on_load_completed: None,
        }
    }

    /// Opt into a notification once the profile has been loaded into every
    /// registered participant.
    pub fn on_load_completed(
        mut self,
        callback: impl Fn(&ProfileView<'_>) + Send + Sync + 'static,
    ) -> Self {
        self.on_load_completed = Some(Arc::new(callback));
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn participant(&self) -> &Arc<dyn Participant> {
        &self.participant
    }

    /// Whether this registration wraps `participant`.
    pub fn is(&self, participant: &Arc<dyn Participant>) -> bool {
        same_participant(&self.participant, participant)
    }

    pub(crate) fn wants_load_completed(&self) -> bool {
        self.on_load_completed.is_some()
    }

    pub(crate) fn notify_load_completed(&self, view: &ProfileView<'_>) {
        if let Some(callback) = &self.on_load_completed {
            callback(view);
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("key", &self.key)
            .field("on_load_completed", &self.on_load_completed.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SharedModule
// ---------------------------------------------------------------------------

/// A participant holding a typed value behind a mutex.
///
/// Loading an empty module resets the value to `T::default()`; a module that
/// does not deserialize as `T` is logged and also resets it.
pub struct SharedModule<T> {
    key: String,
    state: Mutex<T>,
}

impl<T> SharedModule<T>
where
    T: Serialize + DeserializeOwned + Default + Send,
{
    pub fn new(key: impl Into<String>) -> Self {
        Self::with_value(key, T::default())
    }

    pub fn with_value(key: impl Into<String>, value: T) -> Self {
        Self {
            key: key.into(),
            state: Mutex::new(value),
        }
    }

    /// A copy of the current value.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, value: T) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }

    /// Mutate the value in place.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl<T> Participant for SharedModule<T>
where
    T: Serialize + DeserializeOwned + Default + Send,
{
    fn key(&self) -> &str {
        &self.key
    }

    fn load_from(&self, view: &ProfileView<'_>) {
        let value = if view.is_empty() {
            T::default()
        } else {
            view.read::<T>().unwrap_or_else(|e| {
                tracing::warn!(
                    profile_id = view.profile_id(),
                    module_key = view.key(),
                    error = %e,
                    "module did not match its participant; using defaults"
                );
                T::default()
            })
        };
        self.set(value);
    }

    fn save_into(&self, view: &mut ProfileView<'_>) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = view.write(&*state) {
            tracing::warn!(module_key = %self.key, error = %e, "failed to capture module state");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Inventory {
        gold: u32,
    }

    #[test]
    fn view_typed_access() {
        let mut module = json!({});
        let mut view = ProfileView::new("A", "Inventory", &mut module);
        assert!(view.is_empty());

        view.write(&Inventory { gold: 100 }).unwrap();
        assert_eq!(view.read::<Inventory>().unwrap(), Inventory { gold: 100 });
        assert_eq!(view.field::<u32>("gold"), Some(100));
        assert_eq!(view.field::<String>("gold"), None);

        view.set_field("silver", 3).unwrap();
        assert_eq!(module, json!({"gold": 100, "silver": 3}));
    }

    #[test]
    fn set_field_on_non_object_replaces_it() {
        let mut module = json!([1, 2]);
        let mut view = ProfileView::new("A", "K", &mut module);
        view.set_field("x", true).unwrap();
        assert_eq!(module, json!({"x": true}));
    }

    #[test]
    fn read_mismatch_is_a_module_error() {
        let mut module = json!({"gold": "lots"});
        let view = ProfileView::new("A", "Inventory", &mut module);
        assert!(matches!(
            view.read::<Inventory>(),
            Err(KernelError::Module { ref key, .. }) if key == "Inventory"
        ));
    }

    #[test]
    fn shared_module_round_trip() {
        let participant = SharedModule::with_value("Inventory", Inventory { gold: 7 });
        let mut module = json!({});

        participant.save_into(&mut ProfileView::new("A", "Inventory", &mut module));
        assert_eq!(module, json!({"gold": 7}));

        participant.set(Inventory { gold: 0 });
        participant.load_from(&ProfileView::new("A", "Inventory", &mut module));
        assert_eq!(participant.get(), Inventory { gold: 7 });
    }

    #[test]
    fn shared_module_resets_on_empty_or_bad_module() {
        let participant = SharedModule::with_value("Inventory", Inventory { gold: 7 });

        let mut empty = json!({});
        participant.load_from(&ProfileView::new("A", "Inventory", &mut empty));
        assert_eq!(participant.get(), Inventory::default());

        participant.update(|inv| inv.gold = 5);
        let mut bad = json!("not an inventory");
        participant.load_from(&ProfileView::new("A", "Inventory", &mut bad));
        assert_eq!(participant.get(), Inventory::default());
    }

    #[test]
    fn registration_identity() {
        let a: Arc<dyn Participant> = Arc::new(SharedModule::<Inventory>::new("Inventory"));
        let b: Arc<dyn Participant> = Arc::new(SharedModule::<Inventory>::new("Inventory"));

        let reg = Registration::new(Arc::clone(&a));
        assert_eq!(reg.key(), "Inventory");
        assert!(reg.is(&a));
        assert!(!reg.is(&b));
        assert!(!reg.wants_load_completed());
        assert!(Registration::new(b).on_load_completed(|_| {}).wants_load_completed());
    }
}
