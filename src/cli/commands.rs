use regex::Regex;

use crate::app::{AppContext, ListmillError, Result};
use crate::engine::updater::UpdateOptions;
use crate::engine::GetOptions;
use crate::events::AssetEvent;
use crate::registry::{Field, KeyPattern, SourcePatch};

pub async fn get_asset(ctx: &AppContext, key: &str, no_cache: bool) -> Result<()> {
    let out = ctx
        .engine
        .get(
            key,
            GetOptions {
                need_source_url: true,
                dont_cache: no_cache,
                silent: false,
            },
        )
        .await?;

    if let Some(error) = out.error {
        return Err(ListmillError::Other(format!("{key}: {error}")));
    }
    if let Some(url) = &out.source_url {
        eprintln!("fetched from {url}");
    }
    println!("{}", out.content);
    Ok(())
}

pub async fn update_assets(ctx: &AppContext, delay_secs: Option<u64>) -> Result<()> {
    // Entries unread since process start would be evicted instead of
    // refreshed; the CLI runs one-shot, so it claims every asset.
    ctx.events.add_keep_policy(|_| true);
    let mut rx = ctx.events.subscribe();

    ctx.engine.update_start(UpdateOptions {
        delay_ms: delay_secs.map(|s| s * 1000),
        auto: false,
    });

    loop {
        match rx.recv().await {
            Ok(AssetEvent::AssetUpdated { key }) => println!("  updated {key}"),
            Ok(AssetEvent::UpdateFailed { key, error }) => {
                eprintln!("  failed {key}: {error}");
            }
            Ok(AssetEvent::CycleCompleted { updated }) => {
                println!("Update complete: {} assets changed", updated.len());
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                return Err(ListmillError::Other(format!(
                    "event stream closed: {e}"
                )));
            }
        }
    }
}

pub async fn list_assets(ctx: &AppContext) -> Result<()> {
    let metadata = ctx.engine.metadata().await?;
    if metadata.is_empty() {
        println!("No assets registered");
        return Ok(());
    }

    let mut keys: Vec<&String> = metadata.keys().collect();
    keys.sort();
    for key in keys {
        let status = &metadata[key];
        let state = if !status.cached {
            "not cached"
        } else if status.obsolete {
            "obsolete"
        } else {
            "fresh"
        };
        println!("{key} [{state}]");
        for url in &status.source.content_url {
            println!("  {url}");
        }
        if let Some(error) = &status.source.last_error {
            println!("  last error: {}", error.error);
        }
    }
    Ok(())
}

pub async fn register_asset(
    ctx: &AppContext,
    key: &str,
    urls: Vec<String>,
    filters: bool,
) -> Result<()> {
    let patch = SourcePatch {
        content: if filters {
            Field::Set("filters".to_string())
        } else {
            Field::Keep
        },
        ..SourcePatch::with_urls(urls)
    };
    ctx.engine.register(key, patch).await?;
    println!("Registered {key}");
    Ok(())
}

pub async fn unregister_asset(ctx: &AppContext, key: &str) -> Result<()> {
    ctx.engine.unregister(key).await?;
    println!("Unregistered {key}");
    Ok(())
}

pub async fn mark_dirty(ctx: &AppContext, pattern: Option<String>) -> Result<()> {
    let pattern = match pattern {
        Some(raw) => KeyPattern::Regex(
            Regex::new(&raw).map_err(|e| ListmillError::Other(format!("bad pattern: {e}")))?,
        ),
        None => KeyPattern::All,
    };
    ctx.engine.cache().mark_dirty(&pattern, None).await?;
    println!("Marked matching assets for refresh");
    Ok(())
}
