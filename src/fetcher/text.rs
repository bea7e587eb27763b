use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::fetcher::{is_external_url, FetchedText, Fetcher};

/// Text acquisition layer over the raw transport.
///
/// Non-external URLs are resolved against a local asset root. External
/// URLs get a cache-busting query parameter unless the fetcher is in
/// remote-server-friendly mode (background updates).
pub struct TextFetcher {
    transport: Arc<dyn Fetcher>,
    local_root: PathBuf,
    bust_full: bool,
    html_check: bool,
    remote_server_friendly: AtomicBool,
}

impl TextFetcher {
    pub fn new(
        transport: Arc<dyn Fetcher>,
        local_root: PathBuf,
        bust_full: bool,
        html_check: bool,
    ) -> Self {
        Self {
            transport,
            local_root,
            bust_full,
            html_check,
            remote_server_friendly: AtomicBool::new(false),
        }
    }

    pub fn set_remote_server_friendly(&self, on: bool) {
        self.remote_server_friendly.store(on, Ordering::Relaxed);
    }

    pub fn remote_server_friendly(&self) -> bool {
        self.remote_server_friendly.load(Ordering::Relaxed)
    }

    pub async fn fetch_text(&self, url: &str) -> FetchedText {
        let mut result = if is_external_url(url) {
            let actual = if self.remote_server_friendly() {
                url.to_string()
            } else {
                append_bust(url, bust_token(self.bust_full, Utc::now().timestamp_millis()))
            };
            debug!(url = %actual, "fetching");
            self.transport.fetch(&actual).await
        } else {
            self.read_local(url).await
        };

        // The caller-supplied URL is always echoed back, not the
        // rewritten one.
        result.url = url.to_string();

        if self.html_check && result.error.is_none() {
            let trimmed = result.content.trim();
            if trimmed.starts_with('<') && trimmed.ends_with('>') {
                result.content.clear();
                result.error = Some("fetch_text(): not a text file".to_string());
            }
        }

        result
    }

    async fn read_local(&self, path: &str) -> FetchedText {
        let full = self.local_root.join(path);
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => FetchedText {
                url: path.to_string(),
                content,
                status: 0,
                resource_time: 0,
                error: None,
            },
            Err(_) => FetchedText::failure(path, 0, format!("cannot connect to {path}")),
        }
    }
}

/// Cache-bust token: hourly granularity normally, second granularity when
/// `full`. The moduli are prime to minimize cross-day collisions.
fn bust_token(full: bool, now_ms: i64) -> i64 {
    if full {
        (now_ms / 1000) % 86_413
    } else {
        (now_ms / 3_600_000) % 13
    }
}

fn append_bust(url: &str, token: i64) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}_={token}")
}
