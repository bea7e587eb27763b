use std::collections::HashMap;
use std::sync::Mutex;

use crate::app::{ListmillError, Result};
use crate::storage::Storage;

/// In-memory store, used by tests and dry runs.
#[derive(Default)]
pub struct MemoryStorage {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.map
            .lock()
            .map_err(|e| ListmillError::Storage(e.to_string()))
    }
}

impl Storage for MemoryStorage {
    fn get(&self, keys: &[&str]) -> Result<HashMap<String, String>> {
        let map = self.lock()?;
        Ok(keys
            .iter()
            .filter_map(|&key| map.get(key).map(|value| (key.to_string(), value.clone())))
            .collect())
    }

    fn set(&self, entries: &[(String, String)]) -> Result<()> {
        let mut map = self.lock()?;
        for (key, value) in entries {
            map.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> Result<()> {
        let mut map = self.lock()?;
        for &key in keys {
            map.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove_round_trip() {
        let storage = MemoryStorage::new();
        storage.set_one("cache/easylist", "||a.com^").unwrap();

        assert_eq!(
            storage.get_one("cache/easylist").unwrap().as_deref(),
            Some("||a.com^")
        );
        assert_eq!(storage.get_one("missing").unwrap(), None);

        storage.remove_one("cache/easylist").unwrap();
        assert_eq!(storage.get_one("cache/easylist").unwrap(), None);
    }

    #[test]
    fn multi_key_get_returns_only_present_keys() {
        let storage = MemoryStorage::new();
        storage.set_one("a", "1").unwrap();
        storage.set_one("b", "2").unwrap();

        let out = storage.get(&["a", "b", "c"]).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out.get("a").map(String::as_str), Some("1"));
    }
}
