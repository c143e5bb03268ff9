//! Key registry: keys indexed by id, the active key, expiry and persistence.
//!
//! Persisted as `{"l":[<exported key>, ...],"e":"<base64 active id>"}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::RegistryError;
use crate::key::{KeyId, SymmetricKey};

/// In-memory key registry, optionally backed by a JSON file.
///
/// Invariant: the active id, when set, names a key held by the registry.
#[derive(Debug, Clone, Default)]
pub struct KeyRegistry {
    keys: HashMap<KeyId, SymmetricKey>,
    active: Option<KeyId>,
    store: Option<PathBuf>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry persisted at `path`; existing contents are loaded now.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let mut registry = if path.exists() {
            let data = std::fs::read_to_string(&path)
                .map_err(|e| RegistryError::Storage(format!("read {}: {}", path.display(), e)))?;
            Self::from_json(&data)?
        } else {
            Self::new()
        };
        tracing::debug!(path = %path.display(), keys = registry.len(), "key registry opened");
        registry.store = Some(path);
        Ok(registry)
    }

    pub fn store_path(&self) -> Option<&Path> {
        self.store.as_deref()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SymmetricKey> {
        self.keys.values()
    }

    // -----------------------------------------------------------------------
    // Insertion and lookup
    // -----------------------------------------------------------------------

    /// Add a key, assigning a fresh unique id when it has none.
    ///
    /// Re-adding an identical key is a no-op; a different key under an
    /// existing id is rejected.
    pub fn add(&mut self, mut key: SymmetricKey) -> Result<KeyId, RegistryError> {
        let id = match key.id() {
            Some(id) => id,
            None => {
                let id = self.unused_id();
                key.assign_id(id);
                id
            }
        };

        if let Some(existing) = self.keys.get(&id) {
            if *existing == key {
                return Ok(id);
            }
            return Err(RegistryError::DuplicateKeyId(id));
        }

        self.keys.insert(id, key);
        Ok(id)
    }

    pub fn get(&self, id: &KeyId) -> Option<&SymmetricKey> {
        self.keys.get(id)
    }

    /// Lookup by an optional id; a missing id is an error, a missing key is not.
    pub fn lookup(&self, id: Option<&KeyId>) -> Result<Option<&SymmetricKey>, RegistryError> {
        let id = id.ok_or(RegistryError::EmptyLookup)?;
        Ok(self.keys.get(id))
    }

    pub fn remove(&mut self, id: &KeyId) -> Option<SymmetricKey> {
        if self.active.as_ref() == Some(id) {
            self.active = None;
        }
        self.keys.remove(id)
    }

    fn unused_id(&self) -> KeyId {
        loop {
            let id = KeyId::generate();
            if !self.keys.contains_key(&id) {
                return id;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Active key
    // -----------------------------------------------------------------------

    pub fn active(&self) -> Option<&SymmetricKey> {
        self.active.as_ref().and_then(|id| self.keys.get(id))
    }

    pub fn active_id(&self) -> Option<KeyId> {
        self.active
    }

    /// Make `key` active. It must be stored, unchanged, under its own id.
    pub fn set_active(&mut self, key: &SymmetricKey) -> Result<(), RegistryError> {
        let id = key.id().ok_or(RegistryError::EmptyLookup)?;
        match self.keys.get(&id) {
            Some(stored) if stored == key => {
                self.active = Some(id);
                Ok(())
            }
            _ => Err(RegistryError::KeyNotInRegistry(Some(id))),
        }
    }

    /// Pick the active key automatically: among keys valid at `now`, the one
    /// created last. Equal creation times resolve to the smallest id.
    /// Clears the active key when nothing is valid.
    pub fn select_active(&mut self, now: DateTime<Utc>) -> Option<&SymmetricKey> {
        self.active = self
            .keys
            .iter()
            .filter(|(_, key)| key.is_valid_at(now))
            .max_by(|(a_id, a), (b_id, b)| {
                a.created_at()
                    .cmp(&b.created_at())
                    .then_with(|| b_id.cmp(a_id))
            })
            .map(|(id, _)| *id);
        self.active()
    }

    // -----------------------------------------------------------------------
    // Expiry
    // -----------------------------------------------------------------------

    /// Remove every key whose end date has been reached. Returns how many went.
    pub fn cleanup(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.keys.len();
        self.keys.retain(|_, key| !key.is_expired_at(now));
        if let Some(id) = self.active {
            if !self.keys.contains_key(&id) {
                self.active = None;
            }
        }
        before - self.keys.len()
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn to_json(&self) -> Result<String, RegistryError> {
        let mut keys: Vec<&SymmetricKey> = self.keys.values().collect();
        keys.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then_with(|| a.id().cmp(&b.id())));

        let doc = RegistryDocument {
            l: keys.iter().map(|k| k.export()).collect(),
            e: self.active.map(|id| id.to_base64()),
        };
        serde_json::to_string(&doc).map_err(|e| RegistryError::Format(e.to_string()))
    }

    pub fn from_json(data: &str) -> Result<Self, RegistryError> {
        let doc: RegistryDocument =
            serde_json::from_str(data).map_err(|e| RegistryError::Format(e.to_string()))?;

        let mut registry = Self::new();
        for exported in &doc.l {
            let key = SymmetricKey::import(exported)?;
            if key.id().is_none() {
                return Err(RegistryError::Format("stored key without id".into()));
            }
            registry.add(key)?;
        }
        if let Some(active) = doc.e.as_deref() {
            let id = KeyId::from_base64(active)?;
            if !registry.keys.contains_key(&id) {
                return Err(RegistryError::KeyNotInRegistry(Some(id)));
            }
            registry.active = Some(id);
        }
        Ok(registry)
    }

    /// Write the registry to its backing file. No-op without one.
    pub fn persist(&self) -> Result<(), RegistryError> {
        match &self.store {
            Some(path) => self.save_to(path),
            None => Ok(()),
        }
    }

    /// Atomic write: write to temp, then rename.
    pub fn save_to(&self, path: &Path) -> Result<(), RegistryError> {
        let json = self.to_json()?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| RegistryError::Storage(format!("write: {}", e)))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| RegistryError::Storage(format!("rename: {}", e)))?;
        tracing::debug!(path = %path.display(), keys = self.keys.len(), "key registry persisted");
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct RegistryDocument {
    l: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    e: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Validity;
    use chrono::Duration;

    fn key_at(now: DateTime<Utc>, created_days: i64, start: i64, end: i64) -> SymmetricKey {
        SymmetricKey::generate(now + Duration::days(created_days)).with_validity(Validity::new(
            Some(now + Duration::days(start)),
            Some(now + Duration::days(end)),
        ))
    }

    // === Selection ===

    #[test]
    fn selects_latest_created_valid_key() {
        let now = Utc::now();
        let mut registry = KeyRegistry::new();
        let current = registry.add(key_at(now, -5, -5, 5)).unwrap();
        registry.add(key_at(now, -2, -2, -1)).unwrap();
        registry.add(key_at(now, -3, -3, -2)).unwrap();

        let selected = registry.select_active(now).and_then(|k| k.id());
        assert_eq!(selected, Some(current));
        assert_eq!(registry.active_id(), Some(current));
    }

    #[test]
    fn newer_valid_key_wins() {
        let now = Utc::now();
        let mut registry = KeyRegistry::new();
        registry.add(key_at(now, -5, -5, 5)).unwrap();
        let newer = registry.add(key_at(now, -1, -1, 5)).unwrap();

        assert_eq!(registry.select_active(now).and_then(|k| k.id()), Some(newer));
    }

    #[test]
    fn no_valid_key_clears_active() {
        let now = Utc::now();
        let mut registry = KeyRegistry::new();
        let id = registry.add(key_at(now, -3, -3, -2)).unwrap();
        let stored = registry.get(&id).unwrap().clone();
        registry.set_active(&stored).unwrap();

        assert!(registry.select_active(now).is_none());
        assert_eq!(registry.active_id(), None);
    }

    #[test]
    fn equal_creation_time_prefers_smallest_id() {
        let now = Utc::now();
        let mut registry = KeyRegistry::new();
        let small = KeyId::from_bytes([1; 8]);
        let large = KeyId::from_bytes([9; 8]);
        registry.add(SymmetricKey::generate(now).with_id(large)).unwrap();
        registry.add(SymmetricKey::generate(now).with_id(small)).unwrap();

        assert_eq!(registry.select_active(now).and_then(|k| k.id()), Some(small));
    }

    // === Insertion and lookup ===

    #[test]
    fn add_assigns_unique_ids() {
        let mut registry = KeyRegistry::new();
        let a = registry.add(SymmetricKey::generate(Utc::now())).unwrap();
        let b = registry.add(SymmetricKey::generate(Utc::now())).unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.get(&a).and_then(|k| k.id()), Some(a));
    }

    #[test]
    fn readding_identical_key_is_noop() {
        let mut registry = KeyRegistry::new();
        let key = SymmetricKey::generate(Utc::now()).with_id(KeyId::from_bytes([3; 8]));
        registry.add(key.clone()).unwrap();
        registry.add(key).unwrap();
        assert_eq!(registry.len(), 1);

        let clash = SymmetricKey::generate(Utc::now()).with_id(KeyId::from_bytes([3; 8]));
        assert_eq!(
            registry.add(clash),
            Err(RegistryError::DuplicateKeyId(KeyId::from_bytes([3; 8])))
        );
    }

    #[test]
    fn lookup_without_id_fails() {
        let registry = KeyRegistry::new();
        assert_eq!(registry.lookup(None).unwrap_err(), RegistryError::EmptyLookup);
        assert!(registry.lookup(Some(&KeyId::generate())).unwrap().is_none());
    }

    #[test]
    fn set_active_requires_stored_key() {
        let mut registry = KeyRegistry::new();
        let stranger = SymmetricKey::generate(Utc::now()).with_id(KeyId::from_bytes([4; 8]));
        assert_eq!(
            registry.set_active(&stranger),
            Err(RegistryError::KeyNotInRegistry(Some(KeyId::from_bytes([4; 8]))))
        );

        let id = registry.add(stranger.clone()).unwrap();
        registry.set_active(&stranger).unwrap();
        assert_eq!(registry.active_id(), Some(id));
    }

    // === Expiry ===

    #[test]
    fn cleanup_removes_expired_and_clears_active() {
        let now = Utc::now();
        let mut registry = KeyRegistry::new();
        let id = registry.add(key_at(now, -3, -3, -1)).unwrap();
        let expired = registry.get(&id).unwrap().clone();
        registry.set_active(&expired).unwrap();
        registry.add(key_at(now, -1, -1, 1)).unwrap();

        assert_eq!(registry.cleanup(now), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.active().is_none());
    }

    // === Persistence ===

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        // export form has millisecond precision
        let now = DateTime::<Utc>::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();

        let mut registry = KeyRegistry::open(&path).unwrap();
        registry.add(key_at(now, -2, -2, 2)).unwrap();
        let id = registry.add(key_at(now, -1, -1, 2)).unwrap();
        registry.select_active(now);
        registry.persist().unwrap();

        let reloaded = KeyRegistry::open(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.active_id(), Some(id));
        assert_eq!(reloaded.get(&id), registry.get(&id));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn rejects_unknown_active_id() {
        let data = r#"{"l":[],"e":"AQEBAQEBAQE="}"#;
        assert_eq!(
            KeyRegistry::from_json(data).unwrap_err(),
            RegistryError::KeyNotInRegistry(Some(KeyId::from_bytes([1; 8])))
        );
    }
}
