pub mod cache;
pub mod source;

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use regex::Regex;
use tokio::task::JoinHandle;

pub use cache::{AssetContent, CacheEntry, CachePatch, CacheRegistry, ENOTFOUND};
pub use source::{LastError, SourceDescriptor, SourcePatch, SourceRegistry};

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One field of a registry patch. Distinguishes leaving a field alone
/// from clearing it, which JSON merge semantics conflate with `null`.
#[derive(Debug, Clone, PartialEq)]
pub enum Field<T> {
    Keep,
    Clear,
    Set(T),
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Keep
    }
}

impl<T> Field<T> {
    pub fn apply(self, slot: &mut Option<T>) {
        match self {
            Field::Keep => {}
            Field::Clear => *slot = None,
            Field::Set(value) => *slot = Some(value),
        }
    }
}

/// Key selector for bulk cache operations.
#[derive(Debug, Clone)]
pub enum KeyPattern {
    Exact(String),
    Set(Vec<String>),
    Regex(Regex),
    All,
}

impl KeyPattern {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Exact(k) => k == key,
            KeyPattern::Set(keys) => keys.iter().any(|k| k == key),
            KeyPattern::Regex(re) => re.is_match(key),
            KeyPattern::All => true,
        }
    }
}

impl From<&str> for KeyPattern {
    fn from(key: &str) -> Self {
        KeyPattern::Exact(key.to_string())
    }
}

/// Single-slot timer with reset-on-schedule semantics. Scheduling while a
/// save is pending replaces the pending save, so bursts collapse into one
/// write of the then-current snapshot.
pub struct DebouncedSaver {
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl DebouncedSaver {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    pub fn schedule<F, Fut>(&self, save: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        let delay = self.delay;
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            save().await;
        }));
    }

    pub fn cancel(&self) {
        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = pending.take() {
            handle.abort();
        }
    }
}
