#![forbid(unsafe_code)]

//! Source Lister: turns a creator/tag identifier into an ordered list of
//! candidate items. Listing failures never escape the pipeline boundary —
//! a source that cannot be listed contributes an empty batch and an error
//! log entry, and the run continues with the remaining sources.

use std::time::Duration;

use crate::fetcher::{FlatEntry, MediaFetcher};
use crate::report::ErrorLog;

const PLATFORM_BASE: &str = "https://www.tiktok.com";

/// Normalized identity of a creator profile or tag page being scanned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    /// Stable key used for dedup scoping (`@handle` or `tag/name`).
    pub key: String,
    pub display_name: String,
    pub canonical_url: String,
}

/// A discovered video before the store has been consulted. Exists only in
/// pipeline memory; graduates into a store record once processed.
#[derive(Debug, Clone)]
pub struct CandidateItem {
    pub id: String,
    pub title: String,
    pub webpage_url: String,
    pub uploader: String,
    pub upload_date: Option<String>,
    pub caption: Option<String>,
    pub duration: Option<u64>,
}

/// Accepts `@handle`, `#tag`, a bare handle, or a full URL and produces the
/// canonical scan target.
pub fn normalize_source(input: &str) -> SourceSpec {
    let trimmed = input.trim();
    if let Some(tag) = trimmed.strip_prefix('#') {
        return SourceSpec {
            key: format!("tag/{}", tag.to_lowercase()),
            display_name: format!("#{tag}"),
            canonical_url: format!("{PLATFORM_BASE}/tag/{tag}"),
        };
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        let slug = trimmed
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(trimmed)
            .to_string();
        let key = if slug.starts_with('@') {
            slug.clone()
        } else {
            trimmed.trim_end_matches('/').to_lowercase()
        };
        return SourceSpec {
            key,
            display_name: slug,
            canonical_url: trimmed.to_string(),
        };
    }
    let handle = if trimmed.starts_with('@') {
        trimmed.to_string()
    } else {
        format!("@{trimmed}")
    };
    SourceSpec {
        key: handle.clone(),
        display_name: handle.clone(),
        canonical_url: format!("{PLATFORM_BASE}/{handle}"),
    }
}

fn entry_to_item(entry: FlatEntry, fallback_uploader: &str) -> Option<CandidateItem> {
    let id = entry.id.filter(|id| !id.is_empty())?;
    let webpage_url = entry
        .webpage_url
        .or(entry.url)
        .filter(|url| !url.is_empty())?;
    let title = entry
        .title
        .or(entry.description.clone())
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| "Untitled".to_string());
    let uploader = entry
        .uploader
        .or(entry.channel)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| fallback_uploader.to_string());
    Some(CandidateItem {
        id,
        title,
        webpage_url,
        uploader,
        upload_date: entry.upload_date.filter(|date| !date.is_empty()),
        caption: entry.description.filter(|text| !text.is_empty()),
        duration: entry.duration.map(|seconds| seconds.round() as u64),
    })
}

/// Lists candidate items for one source in deterministic order: ascending
/// by upload date where known, provider order otherwise (missing dates sort
/// last, preserving relative order). `max_items` is a hard cap.
pub fn list_items(
    fetcher: &MediaFetcher,
    source: &SourceSpec,
    max_items: Option<usize>,
    timeout: Duration,
    log: &ErrorLog,
) -> Vec<CandidateItem> {
    let entries = match fetcher.list_flat(&source.canonical_url, max_items, timeout) {
        Ok(entries) => entries,
        Err(err) => {
            eprintln!("  Warning: listing failed for {}: {err:#}", source.key);
            log.note(&format!("listing {}", source.key), &format!("{err:#}"));
            return Vec::new();
        }
    };

    let mut items: Vec<CandidateItem> = entries
        .into_iter()
        .filter_map(|entry| entry_to_item(entry, &source.display_name))
        .collect();

    items.sort_by(|a, b| {
        let a_key = a.upload_date.as_deref().unwrap_or("99999999");
        let b_key = b.upload_date.as_deref().unwrap_or("99999999");
        a_key.cmp(b_key)
    });

    if let Some(max) = max_items {
        items.truncate(max);
    }
    items
}
