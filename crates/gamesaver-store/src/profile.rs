//! The plaintext profile document.
//!
//! A profile is a mapping from module key to that module's structured
//! payload. In single-file layout the whole [`ProfileData`] is serialized
//! together; in split layout each entry is written to its own file.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

/// All modules of one profile, keyed by module key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileData {
    modules: BTreeMap<String, Value>,
}

impl ProfileData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.modules.get(key)
    }

    /// Insert or replace a module, returning the previous payload.
    pub fn insert(&mut self, key: impl Into<String>, module: Value) -> Option<Value> {
        self.modules.insert(key.into(), module)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.modules.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.modules.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.modules.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Serialize the document to JSON bytes.
    pub fn to_json(&self) -> StoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.modules)?)
    }

    /// Parse a document from JSON bytes. The top level must be an object.
    pub fn from_json(bytes: &[u8]) -> StoreResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl FromIterator<(String, Value)> for ProfileData {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            modules: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for ProfileData {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.modules.into_iter()
    }
}

/// Check that `name` can be used as a single path segment.
///
/// Profile ids and module keys become directory and file names, so they must
/// be non-empty, must not be `.` or `..`, and must not contain path
/// separators or NUL.
pub fn validate_name(kind: &'static str, name: &str) -> StoreResult<()> {
    let reason = if name.trim().is_empty() {
        Some("must not be empty")
    } else if name == "." || name == ".." {
        Some("must not be a relative path component")
    } else if name.contains(['/', '\\']) {
        Some("must not contain path separators")
    } else if name.contains('\0') {
        Some("must not contain NUL")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StoreError::InvalidName {
            kind,
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn document_is_a_plain_json_object() {
        let mut data = ProfileData::new();
        data.insert("Inventory", json!({"gold": 100}));
        data.insert("Stats", json!({"hp": 50}));

        let bytes = data.to_json().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            json!({"Inventory": {"gold": 100}, "Stats": {"hp": 50}})
        );
        assert_eq!(ProfileData::from_json(&bytes).unwrap(), data);
    }

    #[test]
    fn non_object_document_is_rejected() {
        assert!(ProfileData::from_json(b"[1,2,3]").is_err());
        assert!(ProfileData::from_json(b"not json").is_err());
    }

    #[test]
    fn insert_replaces_and_returns_previous() {
        let mut data = ProfileData::new();
        assert!(data.insert("A", json!(1)).is_none());
        assert_eq!(data.insert("A", json!(2)), Some(json!(1)));
        assert_eq!(data.len(), 1);
        assert_eq!(data.get("A"), Some(&json!(2)));
    }

    #[test]
    fn name_validation() {
        for ok in ["PROFILE A", "Inventory", "slot-1", "a.b"] {
            validate_name("profile id", ok).unwrap();
        }
        for bad in ["", "  ", ".", "..", "a/b", "a\\b", "nul\0"] {
            assert!(
                matches!(
                    validate_name("module key", bad),
                    Err(StoreError::InvalidName { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
    }
}
