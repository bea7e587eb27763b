//! Source registry: where assets come from.
//!
//! Persistent map of asset key to source descriptor, lazily loaded and
//! bootstrapped from the source dictionary (`assets.json`) on first run.
//! Descriptors round-trip under the dictionary's wire names so upstream
//! files ingest directly.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::app::{ListmillError, Result};
use crate::events::{AssetEvent, EventBus};
use crate::fetcher::{is_external_url, TextFetcher};
use crate::registry::{now_ms, DebouncedSaver, Field};
use crate::storage::Storage;

pub const SOURCE_REGISTRY_KEY: &str = "assetSourceRegistry";

const SAVE_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LastError {
    pub time: i64,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceDescriptor {
    /// Candidate URLs, tried in order.
    #[serde(
        rename = "contentURL",
        deserialize_with = "url_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub content_url: Vec<String>,
    /// Mirror URLs, shuffled before use to spread load.
    #[serde(rename = "cdnURLs", skip_serializing_if = "Option::is_none")]
    pub cdn_urls: Option<Vec<String>>,
    /// Asset type tag; `filters` selects list assembly on fetch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Default refresh TTL in days, used when the cache entry has none.
    #[serde(rename = "updateAfter", skip_serializing_if = "Option::is_none")]
    pub update_after: Option<f64>,
    #[serde(rename = "hasLocalURL", skip_serializing_if = "std::ops::Not::not")]
    pub has_local_url: bool,
    #[serde(rename = "hasRemoteURL", skip_serializing_if = "std::ops::Not::not")]
    pub has_remote_url: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub off: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitter: Option<String>,
    #[serde(rename = "submitTime", skip_serializing_if = "Option::is_none")]
    pub submit_time: Option<i64>,
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birthtime: Option<i64>,
    /// Only meaningful on the `assets.json` entry: keys of the lists
    /// enabled by default.
    #[serde(rename = "defaultListset", skip_serializing_if = "Option::is_none")]
    pub default_listset: Option<Vec<String>>,
    /// Dictionary fields the engine carries but does not interpret
    /// (title, group, tags, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl SourceDescriptor {
    pub fn is_filter_list(&self) -> bool {
        self.content.as_deref() == Some("filters")
    }

    fn refresh_url_flags(&mut self) {
        self.has_remote_url = self.content_url.iter().any(|u| is_external_url(u));
        self.has_local_url = self.content_url.iter().any(|u| !is_external_url(u));
    }
}

/// `contentURL` in dictionaries may be a single string, a sequence, or
/// absent; anything else collapses to an empty sequence.
fn url_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(urls_from_value(&value))
}

fn urls_from_value(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

/// Registration patch. Each field is merged independently; `Clear`
/// deletes the stored value, mirroring `null` in dictionary JSON.
#[derive(Debug, Default)]
pub struct SourcePatch {
    pub content_url: Field<Vec<String>>,
    pub cdn_urls: Field<Vec<String>>,
    pub content: Field<String>,
    pub update_after: Field<f64>,
    pub off: Field<bool>,
    pub external: Field<bool>,
    pub submitter: Field<String>,
    pub last_error: Field<LastError>,
    pub birthtime: Field<i64>,
    pub default_listset: Field<Vec<String>>,
    pub extra: Vec<(String, Option<Value>)>,
}

impl SourcePatch {
    pub fn with_urls(urls: Vec<String>) -> Self {
        Self {
            content_url: Field::Set(urls),
            ..Self::default()
        }
    }

    pub fn from_json(value: &Value) -> Self {
        let mut patch = Self::default();
        let Some(obj) = value.as_object() else {
            return patch;
        };
        for (key, v) in obj {
            match key.as_str() {
                "contentURL" => {
                    patch.content_url = if v.is_null() {
                        Field::Clear
                    } else {
                        Field::Set(urls_from_value(v))
                    };
                }
                "cdnURLs" => patch.cdn_urls = option_field(v, |v| Some(urls_from_value(v))),
                "content" => patch.content = option_field(v, |v| v.as_str().map(String::from)),
                "updateAfter" => patch.update_after = option_field(v, Value::as_f64),
                "off" => patch.off = option_field(v, Value::as_bool),
                "external" => patch.external = option_field(v, Value::as_bool),
                "submitter" => patch.submitter = option_field(v, |v| v.as_str().map(String::from)),
                "birthtime" => patch.birthtime = option_field(v, Value::as_i64),
                "defaultListset" => {
                    patch.default_listset = option_field(v, |v| Some(urls_from_value(v)));
                }
                "lastError" => {
                    patch.last_error = if v.is_null() {
                        Field::Clear
                    } else {
                        match serde_json::from_value(v.clone()) {
                            Ok(err) => Field::Set(err),
                            Err(_) => Field::Keep,
                        }
                    };
                }
                "hasLocalURL" | "hasRemoteURL" | "submitTime" => {
                    // derived or stamped, never taken from input
                }
                _ => patch.extra.push((key.clone(), (!v.is_null()).then(|| v.clone()))),
            }
        }
        patch
    }

    pub fn apply_to(self, entry: &mut SourceDescriptor, now_ms: i64) {
        match self.content_url {
            Field::Keep => {}
            Field::Clear => entry.content_url.clear(),
            Field::Set(urls) => entry.content_url = urls,
        }
        self.cdn_urls.apply(&mut entry.cdn_urls);
        self.content.apply(&mut entry.content);
        self.update_after.apply(&mut entry.update_after);
        self.off.apply(&mut entry.off);
        self.external.apply(&mut entry.external);
        self.last_error.apply(&mut entry.last_error);
        self.birthtime.apply(&mut entry.birthtime);
        self.default_listset.apply(&mut entry.default_listset);
        match self.submitter {
            Field::Keep => {}
            Field::Clear => {
                entry.submitter = None;
                entry.submit_time = None;
            }
            Field::Set(submitter) => {
                entry.submitter = Some(submitter);
                entry.submit_time = Some(now_ms);
            }
        }
        for (key, value) in self.extra {
            match value {
                Some(value) => {
                    entry.extra.insert(key, value);
                }
                None => {
                    entry.extra.remove(&key);
                }
            }
        }
        entry.refresh_url_flags();
    }
}

fn option_field<T>(value: &Value, convert: impl Fn(&Value) -> Option<T>) -> Field<T> {
    if value.is_null() {
        Field::Clear
    } else {
        match convert(value) {
            Some(v) => Field::Set(v),
            None => Field::Keep,
        }
    }
}

pub struct SourceRegistry {
    storage: Arc<dyn Storage>,
    events: Arc<EventBus>,
    fetcher: Arc<TextFetcher>,
    bootstrap_url: Option<String>,
    assets_json_path: String,
    map: OnceCell<Mutex<HashMap<String, SourceDescriptor>>>,
    saver: DebouncedSaver,
}

impl SourceRegistry {
    pub fn new(
        storage: Arc<dyn Storage>,
        events: Arc<EventBus>,
        fetcher: Arc<TextFetcher>,
        bootstrap_url: Option<String>,
        assets_json_path: String,
    ) -> Self {
        Self {
            storage,
            events,
            fetcher,
            bootstrap_url,
            assets_json_path,
            map: OnceCell::new(),
            saver: DebouncedSaver::new(SAVE_DEBOUNCE),
        }
    }

    /// Initialization is memoized: concurrent first callers await the
    /// same load.
    async fn loaded(&self) -> Result<&Mutex<HashMap<String, SourceDescriptor>>> {
        self.map
            .get_or_try_init(|| async {
                if let Some(json) = self.storage.get_one(SOURCE_REGISTRY_KEY)? {
                    match serde_json::from_str::<HashMap<String, SourceDescriptor>>(&json) {
                        Ok(map) if !map.is_empty() => return Ok(Mutex::new(map)),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "source registry unreadable, rebuilding"),
                    }
                }
                let map = self.bootstrap().await;
                self.persist_map(&map);
                Ok(Mutex::new(map))
            })
            .await
    }

    /// First-run state: fetch the source dictionary, preferring the
    /// remote bootstrap location over the bundled copy.
    async fn bootstrap(&self) -> HashMap<String, SourceDescriptor> {
        let mut candidates: Vec<&str> = Vec::new();
        if let Some(url) = &self.bootstrap_url {
            candidates.push(url);
        }
        candidates.push(&self.assets_json_path);

        for url in candidates {
            let fetched = self.fetcher.fetch_text(url).await;
            if !fetched.is_ok() || fetched.content.is_empty() {
                continue;
            }
            let mut map = HashMap::new();
            match ingest_json(&mut map, &fetched.content, true, &self.events) {
                Ok(_) => {
                    info!(url, entries = map.len(), "source registry bootstrapped");
                    return map;
                }
                Err(e) => warn!(url, error = %e, "bootstrap dictionary rejected"),
            }
        }

        warn!("source registry bootstrap failed, starting empty");
        HashMap::new()
    }

    pub async fn register(self: &Arc<Self>, key: &str, patch: SourcePatch) -> Result<()> {
        let map = self.loaded().await?;
        {
            let mut map = lock(map);
            let entry = map.entry(key.to_string()).or_default();
            patch.apply_to(entry, now_ms());
        }
        self.schedule_save();
        Ok(())
    }

    pub async fn remove(self: &Arc<Self>, key: &str) -> Result<()> {
        let map = self.loaded().await?;
        let removed = lock(map).remove(key).is_some();
        if removed {
            self.schedule_save();
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<SourceDescriptor>> {
        let map = self.loaded().await?;
        Ok(lock(map).get(key).cloned())
    }

    pub async fn all(&self) -> Result<HashMap<String, SourceDescriptor>> {
        let map = self.loaded().await?;
        Ok(lock(map).clone())
    }

    /// Reingest a source dictionary. Returns the keys of built-in
    /// entries that disappeared; their cached content must be purged by
    /// the caller.
    pub async fn update_from_json(
        self: &Arc<Self>,
        json: &str,
        silent: bool,
    ) -> Result<Vec<String>> {
        let map = self.loaded().await?;
        let removed = {
            let mut map = lock(map);
            ingest_json(&mut map, json, silent, &self.events)?
        };
        self.schedule_save();
        Ok(removed)
    }

    pub async fn record_error(self: &Arc<Self>, key: &str, error: String) -> Result<()> {
        let map = self.loaded().await?;
        let mut changed = false;
        {
            let mut map = lock(map);
            if let Some(entry) = map.get_mut(key) {
                entry.last_error = Some(LastError {
                    time: now_ms(),
                    error,
                });
                changed = true;
            }
        }
        if changed {
            self.schedule_save();
        }
        Ok(())
    }

    /// A successful refresh clears both the error and the birth marker.
    pub async fn clear_error(self: &Arc<Self>, key: &str) -> Result<()> {
        let map = self.loaded().await?;
        let mut changed = false;
        {
            let mut map = lock(map);
            if let Some(entry) = map.get_mut(key) {
                if entry.last_error.is_some() || entry.birthtime.is_some() {
                    entry.last_error = None;
                    entry.birthtime = None;
                    changed = true;
                }
            }
        }
        if changed {
            self.schedule_save();
        }
        Ok(())
    }

    fn schedule_save(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.saver.schedule(move || async move {
            if let Some(map) = this.map.get() {
                let snapshot = lock(map).clone();
                this.persist_map(&snapshot);
            }
        });
    }

    fn persist_map(&self, map: &HashMap<String, SourceDescriptor>) {
        match serde_json::to_string(map) {
            Ok(json) => {
                if let Err(e) = self.storage.set_one(SOURCE_REGISTRY_KEY, &json) {
                    warn!(error = %e, "source registry save failed");
                }
            }
            Err(e) => warn!(error = %e, "source registry serialization failed"),
        }
    }
}

fn ingest_json(
    map: &mut HashMap<String, SourceDescriptor>,
    json: &str,
    silent: bool,
    events: &EventBus,
) -> Result<Vec<String>> {
    let value: Value = serde_json::from_str(json)?;
    let Some(obj) = value.as_object() else {
        return Err(ListmillError::Other(
            "source dictionary is not a JSON object".to_string(),
        ));
    };

    let mut default_listset: Vec<String> = obj
        .iter()
        .filter(|(_, v)| {
            v.get("content").and_then(Value::as_str) == Some("filters") && v.get("off").is_none()
        })
        .map(|(k, _)| k.clone())
        .collect();
    default_listset.sort();

    // Built-in entries absent from the new dictionary are dropped;
    // user-submitted ones survive.
    let incoming: HashSet<&String> = obj.keys().collect();
    let removed: Vec<String> = map
        .iter()
        .filter(|(key, entry)| !incoming.contains(key) && entry.submitter.is_none())
        .map(|(key, _)| key.clone())
        .collect();
    for key in &removed {
        map.remove(key);
    }

    let now = now_ms();
    for (key, entry_value) in obj {
        let is_new = !map.contains_key(key);
        let entry = map.entry(key.clone()).or_default();
        SourcePatch::from_json(entry_value).apply_to(entry, now);
        if is_new && !silent && entry.submitter.is_none() {
            events.emit(AssetEvent::BuiltinSourceAdded { key: key.clone() });
        }
    }

    if let Some(entry) = map.get_mut("assets.json") {
        entry.default_listset = Some(default_listset);
    }

    events.emit(AssetEvent::SourcesUpdated);
    Ok(removed)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
