use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use futures::StreamExt;
use reqwest::header::{HeaderMap, AGE, DATE};
use reqwest::Client;
use tokio::time::timeout;

use crate::fetcher::{FetchedText, Fetcher};

pub struct HttpFetcher {
    client: Client,
    no_progress_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout_secs: u64) -> Self {
        let client = Client::builder()
            .gzip(true)
            .brotli(true)
            .user_agent(concat!("listmill/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            no_progress_timeout: Duration::from_secs(timeout_secs),
        }
    }
}

/// Origin timestamp from response headers: `Date` minus `Age`, epoch ms.
fn resource_time_from_headers(headers: &HeaderMap) -> i64 {
    let Some(date) = headers
        .get(DATE)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| DateTime::parse_from_rfc2822(s).ok())
    else {
        return 0;
    };
    let age_secs = headers
        .get(AGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<i64>().ok())
        .unwrap_or(0);
    (date.timestamp_millis() - age_secs * 1000).max(0)
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> FetchedText {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(url, error = %e, "transport failure");
                return FetchedText::failure(url, 0, format!("cannot connect to {url}"));
            }
        };

        let status = response.status();
        if !status.is_success() {
            return FetchedText::failure(
                url,
                status.as_u16(),
                format!(
                    "{} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("")
                ),
            );
        }

        let resource_time = resource_time_from_headers(response.headers());

        // The timeout is measured as no-progress time: every delivered
        // chunk resets it.
        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        loop {
            match timeout(self.no_progress_timeout, stream.next()).await {
                Ok(Some(Ok(chunk))) => body.extend_from_slice(&chunk),
                Ok(Some(Err(e))) => {
                    tracing::debug!(url, error = %e, "body read failure");
                    return FetchedText::failure(url, 0, format!("cannot connect to {url}"));
                }
                Ok(None) => break,
                Err(_) => {
                    return FetchedText::failure(url, 0, format!("cannot connect to {url}"));
                }
            }
        }

        FetchedText {
            url: url.to_string(),
            content: String::from_utf8_lossy(&body).into_owned(),
            status: status.as_u16(),
            resource_time,
            error: None,
        }
    }
}
