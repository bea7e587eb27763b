pub mod memory;
pub mod sqlite;

use std::collections::HashMap;

use crate::app::Result;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// Flat key/value blob store backing the registries, the content cache,
/// and user-asset settings.
pub trait Storage: Send + Sync {
    fn get(&self, keys: &[&str]) -> Result<HashMap<String, String>>;
    fn set(&self, entries: &[(String, String)]) -> Result<()>;
    fn remove(&self, keys: &[&str]) -> Result<()>;

    fn get_one(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get(&[key])?.remove(key))
    }

    fn set_one(&self, key: &str, value: &str) -> Result<()> {
        self.set(&[(key.to_string(), value.to_string())])
    }

    fn remove_one(&self, key: &str) -> Result<()> {
        self.remove(&[key])
    }
}
