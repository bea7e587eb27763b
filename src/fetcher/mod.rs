pub mod http_fetcher;
pub mod text;

use async_trait::async_trait;

pub use http_fetcher::HttpFetcher;
pub use text::TextFetcher;

/// Outcome of a single text GET.
///
/// Failures are carried in-band through `error`: a failed URL is a
/// recoverable condition that triggers fallback to the next candidate.
#[derive(Debug, Clone, Default)]
pub struct FetchedText {
    /// The URL the caller asked for, echoed back verbatim.
    pub url: String,
    pub content: String,
    /// HTTP status; 0 for local reads and transport-level failures.
    pub status: u16,
    /// Origin timestamp in epoch milliseconds (`Date` minus `Age`),
    /// 0 when unknown.
    pub resource_time: i64,
    pub error: Option<String>,
}

impl FetchedText {
    pub fn failure(url: impl Into<String>, status: u16, error: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> FetchedText;
}

/// True for URLs with an explicit scheme, e.g. `https://` or `file://`.
pub fn is_external_url(url: &str) -> bool {
    match url.find("://") {
        Some(i) if i > 0 => url[..i]
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b == b'-'),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_url_detection() {
        assert!(is_external_url("https://example.com/list.txt"));
        assert!(is_external_url("chrome-extension://abc/def"));
        assert!(!is_external_url("assets/easylist.txt"));
        assert!(!is_external_url("://nothing"));
        assert!(!is_external_url("HTTPS://example.com"));
    }
}
