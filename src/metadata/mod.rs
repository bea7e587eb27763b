//! Filter-list header extraction.
//!
//! Lists advertise freshness and diff-update information through comment
//! headers near the top of the file, e.g.:
//!
//! ```text
//! ! Title: EasyList
//! ! Last-Modified: Mon, 01 Jan 2024 00:00:00 GMT
//! ! Expires: 4 days
//! ! Diff-Path: ../patches/easylist.diff
//! ```
//!
//! Only the first kibibyte of content is scanned. Field names match
//! case-insensitively, with `-` and whitespace interchangeable.

use std::collections::HashMap;

use chrono::DateTime;
use regex::RegexBuilder;

/// Headers beyond this offset are ignored.
const HEADER_SCAN_LIMIT: usize = 1024;

const KNOWN_FIELDS: [&str; 5] = [
    "Last-Modified",
    "Expires",
    "Diff-Name",
    "Diff-Path",
    "Diff-Expires",
];

/// Normalized header metadata of a filter list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListMetadata {
    /// Epoch milliseconds from `Last-Modified`, 0 when absent or unparsable.
    pub last_modified: i64,
    /// Refresh TTL in days from `Expires`, 0 when absent. At least 0.5.
    pub expires: f64,
    /// Diff-path TTL in days from `Diff-Expires`, 0 when absent. At least 0.25.
    pub diff_expires: f64,
    pub diff_name: Option<String>,
    pub diff_path: Option<String>,
}

/// Extract the raw values of `fields` from the head of `content`.
///
/// Values framed as `%...%` are unresolved template placeholders and are
/// dropped.
pub fn extract_fields(content: &str, fields: &[&str]) -> HashMap<String, String> {
    let head = head(content);
    let mut out = HashMap::new();
    for &field in fields {
        let pattern = format!("^(?:!|#)[ \\t]*{}[ \\t]*:[ \\t]*(.+)$", field_pattern(field));
        let re = RegexBuilder::new(&pattern)
            .multi_line(true)
            .case_insensitive(true)
            .build()
            .expect("field pattern is valid");
        let Some(caps) = re.captures(head) else { continue };
        let value = caps[1].trim();
        if value.is_empty() || is_template(value) {
            continue;
        }
        out.insert(field.to_string(), value.to_string());
    }
    out
}

/// Extract and normalize the known freshness fields.
///
/// The TTL floors apply to any extracted value, including an explicit
/// zero; only an absent or unparsable field leaves the TTL at 0.
pub fn extract_metadata(content: &str) -> ListMetadata {
    let fields = extract_fields(content, &KNOWN_FIELDS);
    let mut metadata = ListMetadata::default();
    if let Some(value) = fields.get("Last-Modified") {
        metadata.last_modified = parse_last_modified(value);
    }
    if let Some(days) = fields.get("Expires").and_then(|v| parse_expires_opt(v)) {
        metadata.expires = days.max(0.5);
    }
    if let Some(days) = fields.get("Diff-Expires").and_then(|v| parse_expires_opt(v)) {
        metadata.diff_expires = days.max(0.25);
    }
    metadata.diff_name = fields.get("Diff-Name").cloned();
    metadata.diff_path = fields.get("Diff-Path").cloned();
    metadata
}

/// Whether a list manages its own composition through diff updates.
pub fn is_diff_updatable(content: &str) -> bool {
    extract_fields(content, &["Diff-Path"]).contains_key("Diff-Path")
}

/// Parse an `Expires`-style value into days. Hours are quantized to
/// quarter-day steps. Returns 0 when the value does not parse.
pub fn parse_expires(value: &str) -> f64 {
    parse_expires_opt(value).unwrap_or(0.0)
}

fn parse_expires_opt(value: &str) -> Option<f64> {
    let re = RegexBuilder::new(r"(\d+)\s*([dh])?")
        .case_insensitive(true)
        .build()
        .expect("expires pattern is valid");
    let caps = re.captures(value)?;
    let amount = caps[1].parse::<u32>().ok()?;
    match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        Some(unit) if unit == "h" => Some((f64::from(amount) / 6.0).ceil() / 4.0),
        _ => Some(f64::from(amount)),
    }
}

/// RFC 2822 date to epoch milliseconds, 0 on parse failure.
pub fn parse_last_modified(value: &str) -> i64 {
    DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0)
}

fn is_template(value: &str) -> bool {
    value.len() >= 2 && value.starts_with('%') && value.ends_with('%')
}

fn head(content: &str) -> &str {
    if content.len() <= HEADER_SCAN_LIMIT {
        return content;
    }
    let mut end = HEADER_SCAN_LIMIT;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    &content[..end]
}

fn field_pattern(field: &str) -> String {
    field
        .chars()
        .map(|c| {
            if c == '-' {
                "[\\s-]".to_string()
            } else {
                c.to_string()
            }
        })
        .collect()
}
