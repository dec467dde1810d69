//! Parsing of pasted link lists.
//!
//! Accepted shapes:
//! - a JSON list whose items are `{"name": ..., "url": ...}` objects or URL strings
//! - a single JSON `{"name": ..., "url": ...}` object
//! - newline-separated bare URLs

use serde_json::Value;
use tracing::warn;
use url::Url;

use crate::error::DownloadError;

/// Stems that say nothing about the content; the parent directory is used instead.
const GENERIC_STEMS: &[&str] = &["video", "manifest", "playlist", "index", "master", "chunklist"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    pub name: Option<String>,
    pub url: Url,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub entries: Vec<ImportEntry>,
    /// One message per skipped item.
    pub skipped: Vec<String>,
}

impl ImportReport {
    fn push_url(&mut self, name: Option<String>, raw: &str) {
        match parse_http_url(raw) {
            Ok(url) => self.entries.push(ImportEntry {
                name: name.filter(|n| !n.trim().is_empty()),
                url,
            }),
            Err(reason) => {
                warn!(input = raw, %reason, "Skipping import item");
                self.skipped.push(format!("{raw}: {reason}"));
            }
        }
    }
}

fn parse_http_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw.trim()).map_err(|e| e.to_string())?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("unsupported scheme `{other}`")),
    }
}

fn entry_from_object(report: &mut ImportReport, object: &serde_json::Map<String, Value>) {
    let Some(url) = object.get("url").and_then(Value::as_str) else {
        report.skipped.push(format!("object without a `url` string: {}", Value::Object(object.clone())));
        return;
    };
    let name = match object.get("name") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    };
    report.push_url(name, url);
}

/// Parse pasted import text into entries. Items that are not http(s) URLs are skipped and
/// reported; malformed JSON or a JSON value of the wrong shape is an error.
pub fn parse_import(text: &str) -> Result<ImportReport, DownloadError> {
    let text = text.trim();
    let mut report = ImportReport::default();
    if text.is_empty() {
        return Ok(report);
    }

    if text.starts_with('[') || text.starts_with('{') {
        let value: Value = serde_json::from_str(text).map_err(|e| DownloadError::Import {
            reason: format!("invalid JSON: {e}"),
        })?;
        match value {
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::Object(object) => entry_from_object(&mut report, &object),
                        Value::String(url) => report.push_url(None, &url),
                        other => report.skipped.push(format!("unsupported list item: {other}")),
                    }
                }
            }
            Value::Object(object) => {
                if !object.contains_key("url") {
                    return Err(DownloadError::Import {
                        reason: "JSON object must have a `url` field".to_string(),
                    });
                }
                entry_from_object(&mut report, &object);
            }
            other => {
                return Err(DownloadError::Import {
                    reason: format!("expected a JSON list or object, got {other}"),
                });
            }
        }
        return Ok(report);
    }

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        report.push_url(None, line);
    }
    Ok(report)
}

/// Human-readable name derived from the URL path: the file stem, or the parent directory when
/// the stem is generic. `-` and `_` become spaces. `None` when nothing usable is found.
pub fn fallback_name(url: &Url) -> Option<String> {
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();
    let (last, parents) = segments.split_last()?;
    let stem = match last.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => last,
    };

    let candidate = if GENERIC_STEMS.contains(&stem.to_ascii_lowercase().as_str()) {
        parents.last().copied()?
    } else {
        stem
    };

    let name = candidate.replace(['-', '_'], " ");
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}
