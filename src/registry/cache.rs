//! Cache registry: what has been fetched, and when.
//!
//! Metadata lives in one persistent map; content blobs live beside it at
//! `cache/<key>`. A registry entry without its blob is treated as absent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::app::Result;
use crate::events::{AssetEvent, EventBus};
use crate::registry::{now_ms, DebouncedSaver, Field, KeyPattern};
use crate::storage::Storage;

pub const CACHE_REGISTRY_KEY: &str = "assetCacheRegistry";

pub const ENOTFOUND: &str = "ENOTFOUND";

const SAVE_DEBOUNCE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheEntry {
    /// Epoch ms of the last successful write; 0 means dirty.
    #[serde(rename = "writeTime")]
    pub write_time: i64,
    /// Epoch ms of the last read that requested update tracking.
    #[serde(rename = "readTime")]
    pub read_time: i64,
    /// Authoritative origin timestamp of the cached content; 0 unknown.
    #[serde(rename = "resourceTime")]
    pub resource_time: i64,
    /// URL of the last successful fetch.
    #[serde(rename = "remoteURL", skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    /// Refresh TTL in days.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    /// Diff-path TTL in days.
    #[serde(rename = "diffExpires", skip_serializing_if = "Option::is_none")]
    pub diff_expires: Option<f64>,
    #[serde(rename = "diffName", skip_serializing_if = "Option::is_none")]
    pub diff_name: Option<String>,
    #[serde(rename = "diffPath", skip_serializing_if = "Option::is_none")]
    pub diff_path: Option<String>,
}

/// Merge patch for cache metadata; `Clear` deletes the stored value.
#[derive(Debug, Default)]
pub struct CachePatch {
    pub write_time: Field<i64>,
    pub resource_time: Field<i64>,
    pub remote_url: Field<String>,
    pub expires: Field<f64>,
    pub diff_expires: Field<f64>,
    pub diff_name: Field<String>,
    pub diff_path: Field<String>,
}

impl CachePatch {
    fn apply_to(self, entry: &mut CacheEntry) -> bool {
        let before = entry.clone();
        if let Field::Set(t) = self.write_time {
            entry.write_time = t;
        }
        if let Field::Set(t) = self.resource_time {
            entry.resource_time = t;
        }
        self.remote_url.apply(&mut entry.remote_url);
        self.expires.apply(&mut entry.expires);
        self.diff_expires.apply(&mut entry.diff_expires);
        self.diff_name.apply(&mut entry.diff_name);
        self.diff_path.apply(&mut entry.diff_path);
        *entry != before
    }
}

/// Content plus provenance, as returned by reads and gets.
#[derive(Debug, Clone, Default)]
pub struct AssetContent {
    pub key: String,
    pub content: String,
    pub source_url: Option<String>,
    pub error: Option<String>,
}

impl AssetContent {
    pub fn not_found(key: &str) -> Self {
        Self {
            key: key.to_string(),
            error: Some(ENOTFOUND.to_string()),
            ..Self::default()
        }
    }
}

/// Details accompanying a cache write.
#[derive(Debug, Clone, Default)]
pub struct WriteDetails {
    pub url: Option<String>,
    pub resource_time: i64,
    pub silent: bool,
}

pub struct CacheRegistry {
    storage: Arc<dyn Storage>,
    events: Arc<EventBus>,
    /// Process start, used to garbage-collect entries not read since.
    start_time: i64,
    map: OnceCell<Mutex<HashMap<String, CacheEntry>>>,
    saver: DebouncedSaver,
}

impl CacheRegistry {
    pub fn new(storage: Arc<dyn Storage>, events: Arc<EventBus>) -> Self {
        Self {
            storage,
            events,
            start_time: now_ms(),
            map: OnceCell::new(),
            saver: DebouncedSaver::new(SAVE_DEBOUNCE),
        }
    }

    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    async fn loaded(&self) -> Result<&Mutex<HashMap<String, CacheEntry>>> {
        self.map
            .get_or_try_init(|| async {
                let map = match self.storage.get_one(CACHE_REGISTRY_KEY)? {
                    Some(json) => match serde_json::from_str(&json) {
                        Ok(map) => map,
                        Err(e) => {
                            warn!(error = %e, "cache registry unreadable, starting empty");
                            HashMap::new()
                        }
                    },
                    None => HashMap::new(),
                };
                Ok(Mutex::new(map))
            })
            .await
    }

    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let map = self.loaded().await?;
        Ok(lock(map).get(key).cloned())
    }

    pub async fn entries(&self) -> Result<HashMap<String, CacheEntry>> {
        let map = self.loaded().await?;
        Ok(lock(map).clone())
    }

    /// Read cached content. A hit with `update_read_time` touches the
    /// entry's read time and lazily persists the registry.
    pub async fn read(
        self: &Arc<Self>,
        key: &str,
        update_read_time: bool,
    ) -> Result<AssetContent> {
        self.loaded().await?;
        let content = self.storage.get_one(&blob_key(key))?;
        let Some(content) = content.filter(|c| !c.is_empty()) else {
            return Ok(AssetContent::not_found(key));
        };

        debug!(key, bytes = content.len(), "cache hit");
        if update_read_time {
            let map = self.loaded().await?;
            if let Some(entry) = lock(map).get_mut(key) {
                entry.read_time = now_ms();
            }
            self.schedule_save();
        }

        Ok(AssetContent {
            key: key.to_string(),
            content,
            source_url: None,
            error: None,
        })
    }

    /// Write content and stamp the entry. Empty content is a removal.
    pub async fn write(
        self: &Arc<Self>,
        key: &str,
        content: &str,
        details: WriteDetails,
    ) -> Result<()> {
        if content.is_empty() {
            return self.remove(&KeyPattern::from(key)).await;
        }

        let map = self.loaded().await?;
        let now = now_ms();
        {
            let mut map = lock(map);
            let entry = map.entry(key.to_string()).or_default();
            entry.write_time = now;
            entry.read_time = now;
            entry.resource_time = details.resource_time;
            if let Some(url) = details.url {
                entry.remote_url = Some(url);
            }
        }

        self.storage.set_one(&blob_key(key), content)?;
        self.persist().await?;
        debug!(key, bytes = content.len(), "cache write");

        if !details.silent {
            self.events.emit(AssetEvent::AssetUpdated {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    /// Delete matching entries and their content blobs.
    pub async fn remove(self: &Arc<Self>, pattern: &KeyPattern) -> Result<()> {
        let map = self.loaded().await?;
        let removed: Vec<String> = {
            let mut map = lock(map);
            let keys: Vec<String> = map
                .keys()
                .filter(|key| pattern.matches(key))
                .cloned()
                .collect();
            for key in &keys {
                map.remove(key);
            }
            keys
        };

        if removed.is_empty() {
            return Ok(());
        }

        let blob_keys: Vec<String> = removed.iter().map(|key| blob_key(key)).collect();
        let blob_refs: Vec<&str> = blob_keys.iter().map(String::as_str).collect();
        self.storage.remove(&blob_refs)?;
        self.persist().await?;

        for key in removed {
            debug!(key, "cache entry removed");
            self.events.emit(AssetEvent::AssetUpdated { key });
        }
        Ok(())
    }

    /// Patch entry metadata; persists lazily when anything changed.
    pub async fn set_details(self: &Arc<Self>, key: &str, patch: CachePatch) -> Result<()> {
        let map = self.loaded().await?;
        let changed = {
            let mut map = lock(map);
            match map.get_mut(key) {
                Some(entry) => patch.apply_to(entry),
                None => false,
            }
        };
        if changed {
            self.schedule_save();
        }
        Ok(())
    }

    /// Zero the write time of matching entries so the next cycle treats
    /// them as obsolete. Content stays in place.
    pub async fn mark_dirty(
        self: &Arc<Self>,
        pattern: &KeyPattern,
        exclude: Option<&KeyPattern>,
    ) -> Result<()> {
        let map = self.loaded().await?;
        let mut changed = false;
        {
            let mut map = lock(map);
            for (key, entry) in map.iter_mut() {
                if !pattern.matches(key) {
                    continue;
                }
                if exclude.is_some_and(|ex| ex.matches(key)) {
                    continue;
                }
                if entry.write_time != 0 {
                    entry.write_time = 0;
                    changed = true;
                }
            }
        }
        if changed {
            self.schedule_save();
        }
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        self.saver.cancel();
        let map = self.loaded().await?;
        let snapshot = lock(map).clone();
        let json = serde_json::to_string(&snapshot)?;
        self.storage.set_one(CACHE_REGISTRY_KEY, &json)
    }

    fn schedule_save(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.saver.schedule(move || async move {
            if let Err(e) = this.persist().await {
                warn!(error = %e, "cache registry save failed");
            }
        });
    }
}

fn blob_key(key: &str) -> String {
    format!("cache/{key}")
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use regex::Regex;

    use super::*;
    use crate::storage::MemoryStorage;

    fn cache() -> (Arc<CacheRegistry>, Arc<dyn Storage>) {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let registry = Arc::new(CacheRegistry::new(storage.clone(), Arc::new(EventBus::new())));
        (registry, storage)
    }

    #[tokio::test]
    async fn write_read_round_trip() {
        let (cache, _) = cache();
        cache
            .write("easylist", "||a.com^", WriteDetails::default())
            .await
            .unwrap();

        let out = cache.read("easylist", false).await.unwrap();
        assert_eq!(out.content, "||a.com^");
        assert!(out.error.is_none());

        let entry = cache.get("easylist").await.unwrap().unwrap();
        assert!(entry.write_time > 0);
        assert_eq!(entry.write_time, entry.read_time);
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let (cache, _) = cache();
        let out = cache.read("easylist", false).await.unwrap();
        assert_eq!(out.error.as_deref(), Some(ENOTFOUND));
        assert_eq!(out.content, "");
    }

    #[tokio::test]
    async fn write_records_url_and_resource_time() {
        let (cache, _) = cache();
        cache
            .write(
                "easylist",
                "||a.com^",
                WriteDetails {
                    url: Some("https://h/e.txt".to_string()),
                    resource_time: 1_704_067_200_000,
                    silent: true,
                },
            )
            .await
            .unwrap();

        let entry = cache.get("easylist").await.unwrap().unwrap();
        assert_eq!(entry.remote_url.as_deref(), Some("https://h/e.txt"));
        assert_eq!(entry.resource_time, 1_704_067_200_000);
    }

    #[tokio::test]
    async fn empty_write_removes_entry_and_blob() {
        let (cache, storage) = cache();
        cache
            .write("easylist", "||a.com^", WriteDetails::default())
            .await
            .unwrap();
        cache
            .write("easylist", "", WriteDetails::default())
            .await
            .unwrap();

        assert!(cache.get("easylist").await.unwrap().is_none());
        assert_eq!(storage.get_one("cache/easylist").unwrap(), None);
    }

    #[tokio::test]
    async fn read_with_update_advances_read_time() {
        let (cache, _) = cache();
        cache
            .write("easylist", "||a.com^", WriteDetails::default())
            .await
            .unwrap();
        let before = cache.get("easylist").await.unwrap().unwrap().read_time;

        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.read("easylist", true).await.unwrap();

        let after = cache.get("easylist").await.unwrap().unwrap().read_time;
        assert!(after > before);
    }

    #[tokio::test]
    async fn remove_by_regex_pattern() {
        let (cache, storage) = cache();
        cache
            .write("compiled/easylist", "x", WriteDetails::default())
            .await
            .unwrap();
        cache
            .write("easylist", "y", WriteDetails::default())
            .await
            .unwrap();

        cache
            .remove(&KeyPattern::Regex(Regex::new("^compiled/").unwrap()))
            .await
            .unwrap();

        assert!(cache.get("compiled/easylist").await.unwrap().is_none());
        assert_eq!(storage.get_one("cache/compiled/easylist").unwrap(), None);
        assert!(cache.get("easylist").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn mark_dirty_zeroes_write_time_but_keeps_content() {
        let (cache, _) = cache();
        cache
            .write("easylist", "||a.com^", WriteDetails::default())
            .await
            .unwrap();
        cache
            .write("easyprivacy", "||b.com^", WriteDetails::default())
            .await
            .unwrap();

        cache
            .mark_dirty(&KeyPattern::All, Some(&KeyPattern::from("easyprivacy")))
            .await
            .unwrap();

        assert_eq!(cache.get("easylist").await.unwrap().unwrap().write_time, 0);
        assert!(cache.get("easyprivacy").await.unwrap().unwrap().write_time > 0);
        assert_eq!(cache.read("easylist", false).await.unwrap().content, "||a.com^");
    }

    #[tokio::test]
    async fn set_details_patches_and_clears() {
        let (cache, _) = cache();
        cache
            .write("easylist", "||a.com^", WriteDetails::default())
            .await
            .unwrap();

        cache
            .set_details(
                "easylist",
                CachePatch {
                    expires: Field::Set(4.0),
                    diff_path: Field::Set("../patches/e.diff".to_string()),
                    ..CachePatch::default()
                },
            )
            .await
            .unwrap();
        let entry = cache.get("easylist").await.unwrap().unwrap();
        assert_eq!(entry.expires, Some(4.0));

        cache
            .set_details(
                "easylist",
                CachePatch {
                    diff_path: Field::Clear,
                    ..CachePatch::default()
                },
            )
            .await
            .unwrap();
        let entry = cache.get("easylist").await.unwrap().unwrap();
        assert_eq!(entry.diff_path, None);
        assert_eq!(entry.expires, Some(4.0));
    }

    #[tokio::test]
    async fn registry_persists_across_instances() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        {
            let cache = Arc::new(CacheRegistry::new(storage.clone(), Arc::new(EventBus::new())));
            cache
                .write("easylist", "||a.com^", WriteDetails::default())
                .await
                .unwrap();
        }

        let cache = Arc::new(CacheRegistry::new(storage, Arc::new(EventBus::new())));
        let entry = cache.get("easylist").await.unwrap().unwrap();
        assert!(entry.write_time > 0);
        assert_eq!(cache.read("easylist", false).await.unwrap().content, "||a.com^");
    }
}
