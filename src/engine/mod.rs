//! Asset engine: cache-first reads, ranked-URL acquisition, and
//! staleness-aware remote refreshes.

pub mod diff;
pub mod updater;

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{debug, info};

use crate::app::Result;
use crate::assembler::{ListAssembler, ScopeSplitter};
use crate::config::EngineConfig;
use crate::events::EventBus;
use crate::fetcher::{is_external_url, Fetcher, TextFetcher};
use crate::metadata::{self, ListMetadata};
use crate::registry::cache::WriteDetails;
use crate::registry::{
    now_ms, AssetContent, CachePatch, CacheRegistry, Field, KeyPattern, SourceDescriptor,
    SourcePatch, SourceRegistry, ENOTFOUND,
};
use crate::storage::Storage;

pub use diff::PatchWorker;
pub use updater::{UpdateOptions, Updater};

/// Keys with this prefix live in settings storage and are never cached.
const USER_ASSET_PREFIX: &str = "user-";

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Also report the URL the content came from.
    pub need_source_url: bool,
    /// Do not write fetched content to the cache.
    pub dont_cache: bool,
    /// Suppress the update notification for the cache write.
    pub silent: bool,
}

/// Merged per-asset view over the two registries.
#[derive(Debug, Clone, Serialize)]
pub struct AssetStatus {
    #[serde(flatten)]
    pub source: SourceDescriptor,
    #[serde(rename = "writeTime")]
    pub write_time: i64,
    #[serde(rename = "resourceTime")]
    pub resource_time: i64,
    #[serde(rename = "remoteURL", skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    pub cached: bool,
    pub obsolete: bool,
}

pub struct AssetEngine {
    pub(crate) config: EngineConfig,
    pub(crate) settings: Arc<dyn Storage>,
    pub(crate) text_fetcher: Arc<TextFetcher>,
    pub(crate) assembler: ListAssembler,
    pub(crate) sources: Arc<SourceRegistry>,
    pub(crate) cache: Arc<CacheRegistry>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) updater: Updater,
    pub(crate) patch_worker: Option<Arc<dyn PatchWorker>>,
}

impl AssetEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        storage: Arc<dyn Storage>,
        settings: Arc<dyn Storage>,
        transport: Arc<dyn Fetcher>,
        splitter: Arc<dyn ScopeSplitter>,
        events: Arc<EventBus>,
        patch_worker: Option<Arc<dyn PatchWorker>>,
    ) -> Arc<Self> {
        let text_fetcher = Arc::new(TextFetcher::new(
            transport,
            config.local_root.clone(),
            config.bust_full,
            config.html_check,
        ));
        let sources = Arc::new(SourceRegistry::new(
            storage.clone(),
            events.clone(),
            text_fetcher.clone(),
            config.bootstrap_url.clone(),
            config.assets_json_path.clone(),
        ));
        let cache = Arc::new(CacheRegistry::new(storage, events.clone()));
        let assembler = ListAssembler::new(text_fetcher.clone(), splitter);
        let updater = Updater::new(config.update_delay_ms);

        Arc::new(Self {
            config,
            settings,
            text_fetcher,
            assembler,
            sources,
            cache,
            events,
            updater,
            patch_worker,
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn cache(&self) -> &Arc<CacheRegistry> {
        &self.cache
    }

    pub fn sources(&self) -> &Arc<SourceRegistry> {
        &self.sources
    }

    /// Cache-first read; on miss, try the source URLs in order.
    pub async fn get(self: &Arc<Self>, key: &str, options: GetOptions) -> Result<AssetContent> {
        if key.starts_with(USER_ASSET_PREFIX) {
            return self.read_user_asset(key);
        }

        // Compiled artifacts are read at every launch; touching their
        // read time would force a registry write on each start.
        let update_read_time = !key.starts_with("compiled/") && !key.starts_with("selfie/");
        let cached = self.cache.read(key, update_read_time).await?;
        if cached.error.is_none() {
            return Ok(cached);
        }

        let source = self.sources.get(key).await?;
        let (urls, is_filters, has_local_url) = match &source {
            Some(source) => {
                let mut urls = source.content_url.clone();
                if let Some(cdn_urls) = &source.cdn_urls {
                    urls.extend(cdn_urls.iter().cloned());
                }
                (urls, source.is_filter_list(), source.has_local_url)
            }
            // A bare URL works as its own one-off source descriptor.
            None if is_external_url(key) => (vec![key.to_string()], true, false),
            None => (Vec::new(), false, false),
        };

        let mut last_error: Option<String> = None;
        for url in urls {
            let external = is_external_url(&url);
            if external && has_local_url {
                continue;
            }
            let (content, resource_time, error) = self.fetch_one(&url, is_filters).await;
            if let Some(error) = error {
                last_error = Some(error);
                continue;
            }
            if content.is_empty() {
                last_error = Some(ENOTFOUND.to_string());
                continue;
            }

            if external && !options.dont_cache {
                self.cache
                    .write(
                        key,
                        &content,
                        WriteDetails {
                            url: Some(url.clone()),
                            resource_time,
                            silent: options.silent,
                        },
                    )
                    .await?;
                self.sources.clear_error(key).await?;
            }

            return Ok(AssetContent {
                key: key.to_string(),
                content,
                source_url: options.need_source_url.then(|| url),
                error: None,
            });
        }

        let error = last_error.unwrap_or_else(|| ENOTFOUND.to_string());
        if source.is_some() {
            self.sources.record_error(key, error.clone()).await?;
        }
        Ok(AssetContent {
            key: key.to_string(),
            content: String::new(),
            source_url: None,
            error: Some(error),
        })
    }

    /// Refetch a known asset unconditionally, honouring staleness: a
    /// remote copy older than the cached one never overwrites it.
    pub async fn get_remote(self: &Arc<Self>, key: &str) -> Result<AssetContent> {
        let Some(source) = self.sources.get(key).await? else {
            return Ok(AssetContent::not_found(key));
        };
        let cache_details = self.cache.get(key).await?.unwrap_or_default();

        let mut urls = source.content_url.clone();
        if let Some(cdn_urls) = &source.cdn_urls {
            let mut cdn_urls = cdn_urls.clone();
            cdn_urls.shuffle(&mut rand::thread_rng());
            if self.text_fetcher.remote_server_friendly() {
                // Mirrors first: background cycles spare the origin.
                cdn_urls.extend(urls);
                urls = cdn_urls;
            } else {
                urls.extend(cdn_urls);
            }
        }
        if key == "assets.json" {
            // The dictionary location selects dev vs release builds.
            for url in urls.iter_mut() {
                if url.ends_with("/assets/assets.json") {
                    *url = self.config.assets_json_path.clone();
                }
            }
        }

        let is_filters = source.is_filter_list();
        let mut last_error: Option<String> = None;
        let mut all_stale = false;
        for url in urls {
            let (content, resource_time, error) = self.fetch_one(&url, is_filters).await;
            if content.is_empty() || error.is_some() {
                let error = match error {
                    Some(e) if e.starts_with("cannot connect") => "network error".to_string(),
                    Some(e) => e,
                    None => ENOTFOUND.to_string(),
                };
                debug!(key, url = %url, error = %error, "refresh candidate failed");
                last_error = Some(error);
                continue;
            }

            if resource_time > 0
                && cache_details.resource_time > 0
                && resource_time < cache_details.resource_time
            {
                debug!(key, url = %url, "remote copy older than cache, skipped");
                all_stale = true;
                continue;
            }

            self.cache
                .write(
                    key,
                    &content,
                    WriteDetails {
                        url: Some(url.clone()),
                        resource_time,
                        silent: false,
                    },
                )
                .await?;
            if is_filters {
                let md = metadata::extract_metadata(&content);
                self.cache.set_details(key, diff_details(&md)).await?;
            }
            self.sources.clear_error(key).await?;
            info!(key, url = %url, "asset refreshed");

            return Ok(AssetContent {
                key: key.to_string(),
                content,
                source_url: Some(url),
                error: None,
            });
        }

        if all_stale {
            // Leave the cached copy in place, but stop treating it as
            // obsolete until the origin actually moves forward.
            self.cache
                .set_details(
                    key,
                    CachePatch {
                        write_time: Field::Set(cache_details.resource_time),
                        ..CachePatch::default()
                    },
                )
                .await?;
            return Ok(AssetContent {
                key: key.to_string(),
                content: String::new(),
                source_url: None,
                error: None,
            });
        }

        let error = last_error.unwrap_or_else(|| ENOTFOUND.to_string());
        self.sources.record_error(key, error).await?;
        Ok(AssetContent::not_found(key))
    }

    /// Store content for a key: settings storage for user assets, the
    /// cache otherwise.
    pub async fn put(self: &Arc<Self>, key: &str, content: &str) -> Result<()> {
        if key.starts_with(USER_ASSET_PREFIX) {
            return self.settings.set_one(key, content);
        }
        self.cache
            .write(key, content, WriteDetails::default())
            .await
    }

    pub async fn register(self: &Arc<Self>, key: &str, patch: SourcePatch) -> Result<()> {
        self.sources.register(key, patch).await
    }

    /// Remove an asset from both registries and drop its cached content.
    pub async fn unregister(self: &Arc<Self>, key: &str) -> Result<()> {
        self.sources.remove(key).await?;
        self.cache.remove(&KeyPattern::from(key)).await
    }

    /// Drop every cached entry; registered sources stay.
    pub async fn rmrf(self: &Arc<Self>) -> Result<()> {
        self.cache.remove(&KeyPattern::All).await
    }

    /// Reingest the source dictionary and purge cache entries of
    /// built-in sources that disappeared.
    pub async fn ingest_sources(self: &Arc<Self>, json: &str, silent: bool) -> Result<()> {
        let removed = self.sources.update_from_json(json, silent).await?;
        if !removed.is_empty() {
            self.cache.remove(&KeyPattern::Set(removed)).await?;
        }
        Ok(())
    }

    /// Merged registry view, keyed by asset.
    pub async fn metadata(&self) -> Result<HashMap<String, AssetStatus>> {
        let sources = self.sources.all().await?;
        let cache = self.cache.entries().await?;
        let now = now_ms();

        let mut out = HashMap::new();
        for (key, source) in sources {
            let entry = cache.get(&key);
            let write_time = entry.map_or(0, |e| e.write_time);
            let update_after = entry
                .and_then(|e| e.expires)
                .or(source.update_after)
                .unwrap_or(self.config.default_update_after_days);
            let status = AssetStatus {
                write_time,
                resource_time: entry.map_or(0, |e| e.resource_time),
                remote_url: entry.and_then(|e| e.remote_url.clone()),
                cached: entry.is_some(),
                obsolete: write_time + days_to_ms(update_after) <= now,
                source,
            };
            out.insert(key, status);
        }
        Ok(out)
    }

    /// Fetch one URL, via list assembly for filter lists. The returned
    /// resource time prefers the content's own `Last-Modified` header
    /// over the transport-level one.
    async fn fetch_one(&self, url: &str, is_filters: bool) -> (String, i64, Option<String>) {
        if is_filters {
            let out = self.assembler.assemble(url).await;
            if out.error.is_none() {
                let last_modified = metadata::extract_metadata(&out.content).last_modified;
                if last_modified > 0 {
                    return (out.content, last_modified, None);
                }
            }
            (out.content, out.resource_time, out.error)
        } else {
            let out = self.text_fetcher.fetch_text(url).await;
            (out.content, out.resource_time, out.error)
        }
    }

    fn read_user_asset(&self, key: &str) -> Result<AssetContent> {
        match self.settings.get_one(key)? {
            Some(content) => Ok(AssetContent {
                key: key.to_string(),
                content,
                source_url: None,
                error: None,
            }),
            None => Ok(AssetContent::not_found(key)),
        }
    }
}

pub(crate) fn days_to_ms(days: f64) -> i64 {
    (days * 86_400_000.0) as i64
}

fn diff_details(md: &ListMetadata) -> CachePatch {
    CachePatch {
        expires: set_or_clear((md.expires > 0.0).then_some(md.expires)),
        diff_expires: set_or_clear((md.diff_expires > 0.0).then_some(md.diff_expires)),
        diff_name: set_or_clear(md.diff_name.clone()),
        diff_path: set_or_clear(md.diff_path.clone()),
        ..CachePatch::default()
    }
}

fn set_or_clear<T>(value: Option<T>) -> Field<T> {
    match value {
        Some(value) => Field::Set(value),
        None => Field::Clear,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{engine, ScriptedTransport};

    async fn seed_source(engine: &Arc<AssetEngine>, key: &str, url: &str) {
        engine
            .register(
                key,
                SourcePatch {
                    content: Field::Set("filters".to_string()),
                    ..SourcePatch::with_urls(vec![url.to_string()])
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cache_hit_answers_without_fetching() {
        let transport = ScriptedTransport::new();
        let engine = engine(transport.clone());
        seed_source(&engine, "easylist", "https://h/e.txt").await;
        engine
            .cache
            .write("easylist", "! Title: x\n||a.com^", WriteDetails::default())
            .await
            .unwrap();

        let out = engine.get("easylist", GetOptions::default()).await.unwrap();

        assert_eq!(out.key, "easylist");
        assert_eq!(out.content, "! Title: x\n||a.com^");
        assert!(out.error.is_none());
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn first_fetch_caches_with_resource_time() {
        let body = "! Last-Modified: Mon, 01 Jan 2024 00:00:00 GMT\n||x^";
        let transport = ScriptedTransport::new().body("https://h/e.txt", body);
        let engine = engine(transport);
        seed_source(&engine, "easylist", "https://h/e.txt").await;

        let out = engine.get("easylist", GetOptions::default()).await.unwrap();
        assert!(out.error.is_none());

        let cached = engine.cache.read("easylist", false).await.unwrap();
        assert!(cached.content.contains("||x^"));
        let entry = engine.cache.get("easylist").await.unwrap().unwrap();
        assert_eq!(entry.resource_time, 1_704_067_200_000);
        assert_eq!(entry.remote_url.as_deref(), Some("https://h/e.txt"));
    }

    #[tokio::test]
    async fn bare_url_key_acts_as_its_own_source() {
        let transport = ScriptedTransport::new().body("https://h/ad-hoc.txt", "||adhoc^");
        let engine = engine(transport);

        let out = engine
            .get(
                "https://h/ad-hoc.txt",
                GetOptions {
                    need_source_url: true,
                    ..GetOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(out.content.contains("||adhoc^"));
        assert_eq!(out.source_url.as_deref(), Some("https://h/ad-hoc.txt"));
    }

    #[tokio::test]
    async fn all_urls_failing_reports_last_error() {
        let transport = ScriptedTransport::new();
        let engine = engine(transport);
        seed_source(&engine, "easylist", "https://h/e.txt").await;

        let out = engine.get("easylist", GetOptions::default()).await.unwrap();

        assert_eq!(out.content, "");
        assert_eq!(out.error.as_deref(), Some("404 Not Found"));
        let source = engine.sources.get("easylist").await.unwrap().unwrap();
        assert_eq!(
            source.last_error.map(|e| e.error),
            Some("404 Not Found".to_string())
        );
    }

    #[tokio::test]
    async fn external_urls_gated_by_local_availability() {
        let transport = ScriptedTransport::new();
        let engine = engine(transport.clone());
        engine
            .register(
                "mixed",
                SourcePatch {
                    content: Field::Set("internal".to_string()),
                    ..SourcePatch::with_urls(vec![
                        "https://h/mixed.txt".to_string(),
                        "missing/local.txt".to_string(),
                    ])
                },
            )
            .await
            .unwrap();

        let out = engine.get("mixed", GetOptions::default()).await.unwrap();

        // the external candidate is skipped entirely, the local one fails
        assert!(out.error.is_some());
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn dont_cache_leaves_cache_empty() {
        let transport = ScriptedTransport::new().body("https://h/e.txt", "||x^");
        let engine = engine(transport);
        seed_source(&engine, "easylist", "https://h/e.txt").await;

        engine
            .get(
                "easylist",
                GetOptions {
                    dont_cache: true,
                    ..GetOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(engine.cache.get("easylist").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_remote_rejected_and_write_time_reset() {
        let body = "! Last-Modified: Thu, 01 Jan 1970 00:00:01 GMT\n||old^";
        let transport = ScriptedTransport::new().body("https://h/e.txt", body);
        let engine = engine(transport);
        seed_source(&engine, "easylist", "https://h/e.txt").await;
        engine
            .cache
            .write(
                "easylist",
                "||cached^",
                WriteDetails {
                    url: None,
                    resource_time: 2000,
                    silent: true,
                },
            )
            .await
            .unwrap();

        let out = engine.get_remote("easylist").await.unwrap();

        assert_eq!(out.content, "");
        assert!(out.error.is_none());
        assert_eq!(
            engine.cache.read("easylist", false).await.unwrap().content,
            "||cached^"
        );
        let entry = engine.cache.get("easylist").await.unwrap().unwrap();
        assert_eq!(entry.write_time, 2000);
    }

    #[tokio::test]
    async fn fresh_remote_overwrites_and_harvests_diff_metadata() {
        let body = "! Last-Modified: Mon, 01 Jan 2024 00:00:00 GMT\n\
                    ! Expires: 2d\n\
                    ! Diff-Path: ../patches/e.diff\n\
                    ! Diff-Name: easylist\n\
                    ||new^";
        let transport = ScriptedTransport::new().body("https://h/e.txt", body);
        let engine = engine(transport);
        seed_source(&engine, "easylist", "https://h/e.txt").await;

        let out = engine.get_remote("easylist").await.unwrap();
        assert!(out.error.is_none());

        let entry = engine.cache.get("easylist").await.unwrap().unwrap();
        assert_eq!(entry.resource_time, 1_704_067_200_000);
        assert_eq!(entry.expires, Some(2.0));
        assert_eq!(entry.diff_path.as_deref(), Some("../patches/e.diff"));
        assert_eq!(entry.diff_name.as_deref(), Some("easylist"));
    }

    #[tokio::test]
    async fn get_remote_total_failure_is_enotfound() {
        let transport = ScriptedTransport::new();
        let engine = engine(transport);
        seed_source(&engine, "easylist", "https://h/e.txt").await;

        let out = engine.get_remote("easylist").await.unwrap();

        assert_eq!(out.error.as_deref(), Some(ENOTFOUND));
        let source = engine.sources.get("easylist").await.unwrap().unwrap();
        assert!(source.last_error.is_some());
    }

    #[tokio::test]
    async fn user_assets_live_in_settings_storage() {
        let transport = ScriptedTransport::new();
        let engine = engine(transport.clone());

        engine.put("user-filters", "||mine^").await.unwrap();
        let out = engine
            .get("user-filters", GetOptions::default())
            .await
            .unwrap();

        assert_eq!(out.content, "||mine^");
        assert_eq!(transport.request_count(), 0);
        assert!(engine.cache.get("user-filters").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unregister_purges_both_registries_and_blob() {
        let transport = ScriptedTransport::new().body("https://h/e.txt", "||x^");
        let engine = engine(transport);
        seed_source(&engine, "easylist", "https://h/e.txt").await;
        engine.get("easylist", GetOptions::default()).await.unwrap();

        engine.unregister("easylist").await.unwrap();

        assert!(engine.sources.get("easylist").await.unwrap().is_none());
        assert!(engine.cache.get("easylist").await.unwrap().is_none());
        let out = engine.cache.read("easylist", false).await.unwrap();
        assert_eq!(out.error.as_deref(), Some(ENOTFOUND));
    }

    #[tokio::test]
    async fn metadata_merges_both_registries() {
        let transport = ScriptedTransport::new().body("https://h/e.txt", "||x^");
        let engine = engine(transport);
        seed_source(&engine, "easylist", "https://h/e.txt").await;
        engine.get("easylist", GetOptions::default()).await.unwrap();

        let metadata = engine.metadata().await.unwrap();
        let status = metadata.get("easylist").unwrap();

        assert!(status.cached);
        assert!(!status.obsolete);
        assert_eq!(status.remote_url.as_deref(), Some("https://h/e.txt"));
    }
}
