//! Update cycle orchestration.
//!
//! A cycle runs the diff phase first, then refreshes remaining obsolete
//! assets one at a time, oldest first, pacing full fetches with an
//! interruptible delay. Assets nobody claims through a keep policy are
//! garbage-collected when they have not been read since process start.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::app::Result;
use crate::engine::{days_to_ms, AssetEngine};
use crate::events::AssetEvent;
use crate::registry::{now_ms, KeyPattern};

#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Delay between full fetches; the effective delay only ever
    /// shrinks within an active cycle.
    pub delay_ms: Option<u64>,
    /// Background cycle: prefer mirrors and skip cache busting.
    pub auto: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Idle,
    Updating,
}

struct State {
    status: Status,
    /// Keys refreshed this cycle; each key is fetched at most once.
    fetched: HashSet<String>,
    /// Keys whose content changed this cycle, in refresh order.
    updated: Vec<String>,
    asset_delay_ms: u64,
    auto: bool,
    stop: bool,
}

pub struct Updater {
    default_delay_ms: u64,
    state: Mutex<State>,
    wake: Notify,
}

impl Updater {
    pub(crate) fn new(default_delay_ms: u64) -> Self {
        Self {
            default_delay_ms,
            state: Mutex::new(State {
                status: Status::Idle,
                fetched: HashSet::new(),
                updated: Vec::new(),
                asset_delay_ms: default_delay_ms,
                auto: false,
                stop: false,
            }),
            wake: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn record_updated(&self, key: String) {
        self.lock().updated.push(key);
    }
}

impl AssetEngine {
    /// Start an update cycle, or tighten the pacing of the one already
    /// running.
    pub fn update_start(self: &Arc<Self>, options: UpdateOptions) {
        let mut state = self.updater.lock();
        let requested = options.delay_ms.unwrap_or(self.updater.default_delay_ms);
        state.asset_delay_ms = state.asset_delay_ms.min(requested);
        state.auto = options.auto;

        if state.status == Status::Updating {
            drop(state);
            self.updater.wake.notify_one();
            return;
        }

        state.status = Status::Updating;
        state.fetched.clear();
        state.updated.clear();
        state.stop = false;
        drop(state);

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_cycle().await;
        });
    }

    /// Cancel the next scheduled step. An in-flight fetch is not
    /// aborted; its result still lands before the cycle finalizes.
    pub fn update_stop(self: &Arc<Self>) {
        {
            let mut state = self.updater.lock();
            if state.status != Status::Updating {
                return;
            }
            state.stop = true;
        }
        self.updater.wake.notify_one();
    }

    /// True for a manually triggered cycle; background cycles pace
    /// themselves too slowly to count.
    pub fn is_updating(&self) -> bool {
        let state = self.updater.lock();
        state.status == Status::Updating
            && state.asset_delay_ms <= self.config.manual_update_delay_ms
    }

    async fn run_cycle(self: Arc<Self>) {
        info!("update cycle started");
        let auto = self.updater.lock().auto;
        self.text_fetcher.set_remote_server_friendly(auto);

        self.run_diff_phase().await;

        'cycle: loop {
            if self.updater.lock().stop {
                break;
            }
            match self.update_next().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(error = %e, "update step failed");
                    break;
                }
            }

            // Pace the next fetch. The wait is interruptible so a later
            // update_start with a tighter delay takes effect at once.
            let started = tokio::time::Instant::now();
            loop {
                let delay = Duration::from_millis(self.updater.lock().asset_delay_ms);
                let elapsed = started.elapsed();
                if elapsed >= delay {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay - elapsed) => break,
                    _ = self.updater.wake.notified() => {
                        if self.updater.lock().stop {
                            break 'cycle;
                        }
                    }
                }
            }
        }

        self.update_done();
    }

    /// Refresh the single most obsolete candidate. Returns false when no
    /// candidate remains.
    async fn update_next(self: &Arc<Self>) -> Result<bool> {
        let sources = self.sources.all().await?;
        let cache_entries = self.cache.entries().await?;
        let start_time = self.cache.start_time();
        let now = now_ms();

        let (already_fetched, auto) = {
            let state = self.updater.lock();
            (state.fetched.clone(), state.auto)
        };

        let mut candidates: Vec<(String, i64)> = Vec::new();
        let mut garbage: Vec<String> = Vec::new();
        for (key, entry) in &cache_entries {
            let Some(source) = sources.get(key) else {
                continue;
            };
            if !source.has_remote_url || already_fetched.contains(key) {
                continue;
            }
            // The keep policy only decides the eviction of entries
            // unread since process start; actively read assets stay in
            // rotation either way.
            if !self.events.should_keep(key) && entry.read_time < start_time {
                garbage.push(key.clone());
                continue;
            }
            let update_after = entry
                .expires
                .or(source.update_after)
                .unwrap_or(self.config.default_update_after_days);
            if entry.write_time + days_to_ms(update_after) > now {
                continue;
            }
            candidates.push((key.clone(), entry.write_time));
        }

        if !garbage.is_empty() {
            info!(count = garbage.len(), "evicting unused cached assets");
            self.cache.remove(&KeyPattern::Set(garbage)).await?;
        }

        candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        let Some((key, _)) = candidates.into_iter().next() else {
            return Ok(false);
        };

        self.updater.lock().fetched.insert(key.clone());
        self.text_fetcher.set_remote_server_friendly(auto);

        let result = self.get_remote(&key).await?;
        if result.error.is_none() && !result.content.is_empty() {
            self.updater.lock().updated.push(key.clone());
            if key == "assets.json" {
                if let Err(e) = self.ingest_sources(&result.content, false).await {
                    warn!(error = %e, "source dictionary reingest failed");
                }
            }
        } else if let Some(error) = result.error {
            self.events.emit(AssetEvent::UpdateFailed { key, error });
        }
        Ok(true)
    }

    fn update_done(self: &Arc<Self>) {
        let updated = {
            let mut state = self.updater.lock();
            state.status = Status::Idle;
            state.asset_delay_ms = self.updater.default_delay_ms;
            state.stop = false;
            std::mem::take(&mut state.updated)
        };
        self.text_fetcher.set_remote_server_friendly(false);
        info!(updated = updated.len(), "update cycle finished");
        self.events.emit(AssetEvent::CycleCompleted { updated });
    }
}
