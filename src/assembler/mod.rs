//! Recursive filter-list assembly.
//!
//! A filter list may pull in sublists with `!#include <path>` directives.
//! The assembler fetches the main list, splices every included sublist in
//! place between sentinel banners, and aborts the whole assembly if any
//! sublist fails. Include paths resolve relative to the list that
//! references them, so an included list may itself include siblings.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use futures::future::join_all;
use regex::Regex;
use url::Url;

use crate::fetcher::{FetchedText, TextFetcher};
use crate::metadata;

/// Scope boundaries of preparser conditionals (`!#if` blocks).
///
/// Returned offsets split the text into slices that alternate between
/// active (even position, scanned for includes) and inactive (odd
/// position, emitted verbatim), starting active at offset zero.
pub trait ScopeSplitter: Send + Sync {
    fn split(&self, text: &str) -> Vec<usize>;
}

/// Treats the whole list as active.
pub struct NoSplit;

impl ScopeSplitter for NoSplit {
    fn split(&self, _text: &str) -> Vec<usize> {
        Vec::new()
    }
}

#[derive(Debug, Clone)]
pub struct AssembledList {
    pub url: String,
    pub content: String,
    /// Maximum origin timestamp over the main list and every sublist.
    pub resource_time: i64,
    pub error: Option<String>,
}

enum Part {
    Text(String),
    Pending(String),
    Fetched(FetchedText),
}

pub struct ListAssembler {
    fetcher: Arc<TextFetcher>,
    splitter: Arc<dyn ScopeSplitter>,
}

impl ListAssembler {
    pub fn new(fetcher: Arc<TextFetcher>, splitter: Arc<dyn ScopeSplitter>) -> Self {
        Self { fetcher, splitter }
    }

    pub async fn assemble(&self, main_url: &str) -> AssembledList {
        let mut scheduled: HashSet<String> = HashSet::from([main_url.to_string()]);
        let mut parts = vec![Part::Pending(main_url.to_string())];
        let mut resource_time = 0i64;

        loop {
            // Settle every pending fetch in this round together.
            let pending: Vec<usize> = parts
                .iter()
                .enumerate()
                .filter_map(|(i, part)| matches!(part, Part::Pending(_)).then_some(i))
                .collect();
            let fetches = pending.iter().map(|&i| {
                let Part::Pending(url) = &parts[i] else {
                    unreachable!("index was collected as pending");
                };
                self.fetcher.fetch_text(url)
            });
            let results = join_all(fetches).await;
            for (&i, result) in pending.iter().zip(results) {
                if let Some(error) = result.error {
                    // Any sublist failure aborts the whole assembly.
                    return AssembledList {
                        url: main_url.to_string(),
                        content: String::new(),
                        resource_time: 0,
                        error: Some(error),
                    };
                }
                resource_time = resource_time.max(result.resource_time);
                parts[i] = Part::Fetched(result);
            }

            // A lone diff-updatable list manages its own composition:
            // no include expansion.
            if parts.len() == 1 {
                if let Part::Fetched(fetched) = &parts[0] {
                    if metadata::is_diff_updatable(&fetched.content) {
                        let content = fetched.content.clone();
                        parts[0] = Part::Text(content);
                    }
                }
            }

            let mut next = Vec::with_capacity(parts.len());
            for part in parts {
                match part {
                    Part::Text(text) => next.push(Part::Text(text)),
                    Part::Fetched(fetched) => {
                        self.expand(&fetched, &mut next, &mut scheduled);
                    }
                    Part::Pending(_) => {
                        unreachable!("pending parts were settled above");
                    }
                }
            }
            parts = next;

            if !parts.iter().any(|part| matches!(part, Part::Pending(_))) {
                break;
            }
        }

        let mut content = String::new();
        for part in parts {
            if let Part::Text(text) = part {
                content.push_str(&text);
            }
        }
        if !content.ends_with('\n') {
            content.push('\n');
        }

        AssembledList {
            url: main_url.to_string(),
            content,
            resource_time,
            error: None,
        }
    }

    fn expand(&self, fetched: &FetchedText, out: &mut Vec<Part>, scheduled: &mut HashSet<String>) {
        let text = &fetched.content;
        let boundaries = self.splitter.split(text);
        let mut start = 0usize;
        let mut active = true;
        for end in boundaries
            .into_iter()
            .filter(|&b| b <= text.len())
            .chain(std::iter::once(text.len()))
        {
            if end < start {
                continue;
            }
            let slice = &text[start..end];
            if active {
                self.expand_includes(slice, &fetched.url, out, scheduled);
            } else if !slice.is_empty() {
                out.push(Part::Text(slice.to_string()));
            }
            active = !active;
            start = end;
        }
    }

    fn expand_includes(
        &self,
        slice: &str,
        parent_url: &str,
        out: &mut Vec<Part>,
        scheduled: &mut HashSet<String>,
    ) {
        let mut cursor = 0usize;
        for caps in include_directive().captures_iter(slice) {
            let whole = caps.get(0).expect("match exists");
            let path = &caps[1];
            if Url::parse(path).is_ok() {
                continue;
            }
            if path.contains("..") {
                continue;
            }
            let Some(dir) = parent_dir(parent_url) else {
                continue;
            };
            let sub_url = format!("{dir}{path}");
            if !scheduled.insert(sub_url.clone()) {
                continue;
            }
            // Emit up to and including the directive line, then the
            // sublist framed by sentinel banners.
            out.push(Part::Text(slice[cursor..whole.end()].to_string()));
            out.push(Part::Text(format!("! >>>>>>>> {sub_url}\n")));
            out.push(Part::Pending(sub_url.clone()));
            out.push(Part::Text(format!("! <<<<<<<< {sub_url}\n")));
            cursor = whole.end();
        }
        if cursor < slice.len() {
            out.push(Part::Text(slice[cursor..].to_string()));
        }
    }
}

/// Everything up to and including the last `/`.
fn parent_dir(url: &str) -> Option<&str> {
    url.rfind('/').map(|i| &url[..=i])
}

fn include_directive() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^!#include +(\S+).*\n?").expect("include pattern is valid")
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::fetcher::Fetcher;

    struct MapTransport {
        bodies: HashMap<String, String>,
        requested: Mutex<Vec<String>>,
    }

    impl MapTransport {
        fn new(bodies: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                bodies: bodies
                    .iter()
                    .map(|(url, body)| (url.to_string(), body.to_string()))
                    .collect(),
                requested: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Fetcher for MapTransport {
        async fn fetch(&self, url: &str) -> FetchedText {
            let bare = url.split('?').next().unwrap_or(url);
            self.requested.lock().unwrap().push(bare.to_string());
            match self.bodies.get(bare) {
                Some(body) => FetchedText {
                    url: url.to_string(),
                    content: body.clone(),
                    status: 200,
                    resource_time: 0,
                    error: None,
                },
                None => FetchedText::failure(url, 404, "404 Not Found"),
            }
        }
    }

    fn assembler(transport: Arc<MapTransport>) -> ListAssembler {
        let fetcher = Arc::new(TextFetcher::new(transport, PathBuf::from("."), false, true));
        ListAssembler::new(fetcher, Arc::new(NoSplit))
    }

    #[tokio::test]
    async fn sublist_spliced_between_banners() {
        let transport = MapTransport::new(&[
            ("https://h/a.txt", "! Title: a\n!#include b.txt\n||a^"),
            ("https://h/b.txt", "||b^"),
        ]);
        let assembler = assembler(transport);

        let out = assembler.assemble("https://h/a.txt").await;

        assert!(out.error.is_none());
        assert_eq!(
            out.content,
            "! Title: a\n!#include b.txt\n! >>>>>>>> https://h/b.txt\n||b^! <<<<<<<< https://h/b.txt\n||a^\n"
        );
    }

    #[tokio::test]
    async fn nested_include_resolves_against_parent() {
        let transport = MapTransport::new(&[
            ("https://h/lists/a.txt", "!#include sub/b.txt\n"),
            ("https://h/lists/sub/b.txt", "!#include c.txt\n"),
            ("https://h/lists/sub/c.txt", "||c^\n"),
        ]);
        let assembler = assembler(transport);

        let out = assembler.assemble("https://h/lists/a.txt").await;

        assert!(out.error.is_none());
        assert!(out.content.contains("! >>>>>>>> https://h/lists/sub/c.txt\n"));
        assert!(out.content.contains("||c^"));
    }

    #[tokio::test]
    async fn absolute_and_traversal_includes_skipped() {
        let transport = MapTransport::new(&[(
            "https://h/a.txt",
            "!#include https://evil/x.txt\n!#include ../evil.txt\n||a^",
        )]);
        let assembler = assembler(transport.clone());

        let out = assembler.assemble("https://h/a.txt").await;

        assert!(out.error.is_none());
        assert_eq!(
            out.content,
            "!#include https://evil/x.txt\n!#include ../evil.txt\n||a^\n"
        );
        assert_eq!(transport.requested.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn include_cycles_deduplicated() {
        let transport = MapTransport::new(&[
            ("https://h/a.txt", "!#include b.txt\n"),
            ("https://h/b.txt", "!#include a.txt\n||b^\n"),
        ]);
        let assembler = assembler(transport.clone());

        let out = assembler.assemble("https://h/a.txt").await;

        assert!(out.error.is_none());
        let requested = transport.requested.lock().unwrap();
        assert_eq!(
            requested.iter().filter(|u| u.ends_with("a.txt")).count(),
            1
        );
    }

    #[tokio::test]
    async fn sublist_failure_aborts_assembly() {
        let transport = MapTransport::new(&[(
            "https://h/a.txt",
            "! Title: a\n!#include missing.txt\n||a^",
        )]);
        let assembler = assembler(transport);

        let out = assembler.assemble("https://h/a.txt").await;

        assert_eq!(out.url, "https://h/a.txt");
        assert_eq!(out.content, "");
        assert_eq!(out.error.as_deref(), Some("404 Not Found"));
    }

    #[tokio::test]
    async fn diff_updatable_list_short_circuits_expansion() {
        let transport = MapTransport::new(&[(
            "https://h/a.txt",
            "! Diff-Path: ../patches/a.diff\n!#include b.txt\n||a^",
        )]);
        let assembler = assembler(transport.clone());

        let out = assembler.assemble("https://h/a.txt").await;

        assert!(out.error.is_none());
        assert_eq!(
            out.content,
            "! Diff-Path: ../patches/a.diff\n!#include b.txt\n||a^\n"
        );
        assert_eq!(transport.requested.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn inactive_scope_not_scanned_for_includes() {
        struct SecondHalfInactive;
        impl ScopeSplitter for SecondHalfInactive {
            fn split(&self, text: &str) -> Vec<usize> {
                text.find("!#if").map(|i| vec![i]).unwrap_or_default()
            }
        }

        let transport = MapTransport::new(&[(
            "https://h/a.txt",
            "||a^\n!#if cap_html_filtering\n!#include b.txt\n!#endif\n",
        )]);
        let fetcher = Arc::new(TextFetcher::new(
            transport.clone(),
            PathBuf::from("."),
            false,
            true,
        ));
        let assembler = ListAssembler::new(fetcher, Arc::new(SecondHalfInactive));

        let out = assembler.assemble("https://h/a.txt").await;

        assert!(out.error.is_none());
        assert_eq!(
            out.content,
            "||a^\n!#if cap_html_filtering\n!#include b.txt\n!#endif\n"
        );
        assert_eq!(transport.requested.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resource_time_is_max_over_parts() {
        struct TimedTransport;
        #[async_trait]
        impl Fetcher for TimedTransport {
            async fn fetch(&self, url: &str) -> FetchedText {
                let bare = url.split('?').next().unwrap_or(url);
                let (content, resource_time) = if bare.ends_with("a.txt") {
                    ("!#include b.txt\n".to_string(), 1000)
                } else {
                    ("||b^\n".to_string(), 2000)
                };
                FetchedText {
                    url: url.to_string(),
                    content,
                    status: 200,
                    resource_time,
                    error: None,
                }
            }
        }

        let fetcher = Arc::new(TextFetcher::new(
            Arc::new(TimedTransport),
            PathBuf::from("."),
            false,
            true,
        ));
        let assembler = ListAssembler::new(fetcher, Arc::new(NoSplit));

        let out = assembler.assemble("https://h/a.txt").await;
        assert_eq!(out.resource_time, 2000);
    }
}
