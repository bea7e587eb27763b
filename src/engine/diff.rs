//! Differential update phase.
//!
//! Assets advertising a diff bundle can be brought up to date by
//! applying a small patch to the cached content instead of refetching
//! the whole list. Patch application itself runs in an external worker;
//! this module owns the message protocol and the phase driver.
//!
//! Jobs past their diff TTL are *hard* and are handed to the worker as
//! soon as it reports ready. Jobs still inside the TTL are *soft*: they
//! are posted only once every hard job has completed, for the worker to
//! take up at its own discretion. A `Broken` report ends the phase; the
//! full-refresh phase still runs afterwards.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::engine::{days_to_ms, diff_details, AssetEngine};
use crate::metadata;
use crate::registry::cache::WriteDetails;
use crate::registry::now_ms;

/// One patchable asset.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffJob {
    /// Asset key.
    pub name: String,
    pub diff_name: String,
    pub patch_path: String,
    pub cdn_urls: Vec<String>,
    /// Hard jobs are posted with `fetch` set; the worker must resolve
    /// them immediately.
    pub fetch: bool,
}

#[derive(Debug)]
pub enum WorkerRequest {
    Apply(DiffJob),
    /// Reply to `NeedText`: the cached content of `name`.
    Text { name: String, text: String },
}

#[derive(Debug)]
pub enum WorkerReply {
    /// The worker is up; jobs may be posted.
    Ready,
    /// The worker needs the currently cached content of `name`.
    NeedText { name: String },
    /// A patch applied cleanly; `text` is the new content.
    Updated {
        name: String,
        text: String,
        patch_url: String,
        patch_size: usize,
    },
    /// One job failed; the phase continues.
    Failed { name: String, error: String },
    /// The worker is unusable; the phase ends.
    Broken { error: String },
}

/// Spawn seam for the external patch worker.
pub trait PatchWorker: Send + Sync {
    fn spawn(&self) -> (mpsc::Sender<WorkerRequest>, mpsc::Receiver<WorkerReply>);
}

impl AssetEngine {
    pub(crate) async fn run_diff_phase(self: &Arc<Self>) {
        let Some(worker) = self.patch_worker.clone() else {
            return;
        };
        let (mut hard, mut soft) = match self.diff_candidates().await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "diff candidate enumeration failed");
                return;
            }
        };
        if hard.is_empty() {
            return;
        }
        info!(hard = hard.len(), soft = soft.len(), "diff phase started");

        let (tx, mut rx) = worker.spawn();
        let mut pending = 0usize;
        while let Some(reply) = rx.recv().await {
            match reply {
                WorkerReply::Ready => {
                    for job in hard.drain(..) {
                        pending += 1;
                        if tx.send(WorkerRequest::Apply(job)).await.is_err() {
                            return;
                        }
                    }
                }
                WorkerReply::NeedText { name } => {
                    let text = match self.cache.read(&name, false).await {
                        Ok(content) => content.content,
                        Err(e) => {
                            warn!(key = %name, error = %e, "cache read for patching failed");
                            String::new()
                        }
                    };
                    if tx.send(WorkerRequest::Text { name, text }).await.is_err() {
                        return;
                    }
                }
                WorkerReply::Updated {
                    name,
                    text,
                    patch_url,
                    patch_size,
                } => {
                    debug!(key = %name, patch_url = %patch_url, patch_size, "patch applied");
                    self.accept_patched(&name, &text).await;
                    pending = pending.saturating_sub(1);
                }
                WorkerReply::Failed { name, error } => {
                    warn!(key = %name, error = %error, "patch failed");
                    pending = pending.saturating_sub(1);
                }
                WorkerReply::Broken { error } => {
                    error!(error = %error, "patch worker broken, ending diff phase");
                    return;
                }
            }

            if pending == 0 {
                if soft.is_empty() {
                    break;
                }
                for job in soft.drain(..) {
                    pending += 1;
                    if tx.send(WorkerRequest::Apply(job)).await.is_err() {
                        return;
                    }
                }
            }
        }
        info!("diff phase finished");
    }

    async fn accept_patched(self: &Arc<Self>, key: &str, text: &str) {
        let md = metadata::extract_metadata(text);
        let write = self
            .cache
            .write(
                key,
                text,
                WriteDetails {
                    url: None,
                    resource_time: md.last_modified,
                    silent: false,
                },
            )
            .await;
        if let Err(e) = write {
            warn!(key, error = %e, "patched content write failed");
            return;
        }
        if let Err(e) = self.cache.set_details(key, diff_details(&md)).await {
            warn!(key, error = %e, "patched metadata write failed");
        }
        self.updater.record_updated(key.to_string());
    }

    /// Diff-capable candidates, split into hard (past the diff TTL) and
    /// soft (still within it).
    async fn diff_candidates(self: &Arc<Self>) -> crate::app::Result<(Vec<DiffJob>, Vec<DiffJob>)> {
        let sources = self.sources.all().await?;
        let cache_entries = self.cache.entries().await?;
        let now = now_ms();

        let mut hard = Vec::new();
        let mut soft = Vec::new();
        for (key, entry) in &cache_entries {
            let Some(source) = sources.get(key) else {
                continue;
            };
            let (Some(diff_name), Some(diff_path)) = (&entry.diff_name, &entry.diff_path) else {
                continue;
            };
            let job = DiffJob {
                name: key.clone(),
                diff_name: diff_name.clone(),
                patch_path: diff_path.clone(),
                cdn_urls: source.cdn_urls.clone().unwrap_or_default(),
                fetch: false,
            };
            let diff_expires = entry.diff_expires.unwrap_or(0.0);
            if entry.write_time + days_to_ms(diff_expires) > now {
                soft.push(job);
            } else {
                hard.push(DiffJob { fetch: true, ..job });
            }
        }
        hard.sort_by(|a, b| a.name.cmp(&b.name));
        soft.sort_by(|a, b| a.name.cmp(&b.name));
        Ok((hard, soft))
    }
}
