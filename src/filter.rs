#![forbid(unsafe_code)]

//! Criteria filtering: hashtag rules applied before download, a date window
//! over normalized upload dates, and the post-download duration sweep that
//! needs a local file to probe.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use lazy_static::lazy_static;
use regex::Regex;

use crate::probe::MediaProber;
use crate::store::{DedupStore, StoredVideo, VideoStatus};

lazy_static! {
    static ref HASHTAG_RE: Regex = Regex::new(r"#(\w+)").expect("hashtag pattern");
}

/// How a required tag set is matched against the tags found in a caption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagMode {
    /// At least one required tag present.
    Any,
    /// Every required tag present.
    All,
}

impl TagMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "any" => Ok(TagMode::Any),
            "all" => Ok(TagMode::All),
            other => anyhow::bail!("unknown tag mode: {other} (expected any|all)"),
        }
    }
}

/// Extracts hashtags from caption text. Supports the fullwidth `＃` marker,
/// is unicode-aware, and normalizes to lowercase without the marker.
pub fn extract_hashtags(text: &str) -> Vec<String> {
    let normalized = text.replace('＃', "#");
    HASHTAG_RE
        .captures_iter(&normalized)
        .map(|cap| cap[1].to_lowercase())
        .collect()
}

/// Tests a caption's tags against the required set. An empty required set
/// always passes.
pub fn contains_required_hashtags(found: &[String], required: &[String], mode: TagMode) -> bool {
    let required: Vec<String> = required
        .iter()
        .map(|tag| tag.trim_start_matches(['#', '＃']).to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect();
    if required.is_empty() {
        return true;
    }
    match mode {
        TagMode::Any => required.iter().any(|tag| found.contains(tag)),
        TagMode::All => required.iter().all(|tag| found.contains(tag)),
    }
}

/// Convenience for the pre-download filter: extracts tags from a caption and
/// applies the rule in one step.
pub fn caption_passes_hashtags(caption: &str, required: &[String], mode: TagMode) -> bool {
    contains_required_hashtags(&extract_hashtags(caption), required, mode)
}

/// Accepts `YYYYMMDD` or `YYYY-MM-DD`, returns `YYYY-MM-DD` or `None`.
pub fn normalize_upload_date(raw: &str) -> Option<String> {
    let s = raw.trim();
    if s.len() == 8 && s.chars().all(|c| c.is_ascii_digit()) {
        let formatted = format!("{}-{}-{}", &s[0..4], &s[4..6], &s[6..8]);
        return NaiveDate::parse_from_str(&formatted, "%Y-%m-%d")
            .ok()
            .map(|_| formatted);
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|_| s.to_string())
}

pub fn parse_upload_date(raw: &str) -> Option<NaiveDate> {
    let normalized = normalize_upload_date(raw)?;
    NaiveDate::parse_from_str(&normalized, "%Y-%m-%d").ok()
}

/// Cutoff date for a `[now - days, now]` window.
pub fn window_cutoff(days: u32) -> NaiveDate {
    Utc::now().date_naive() - ChronoDuration::days(days as i64)
}

/// True when the date falls inside the window. Items with no parseable date
/// pass leniently; the enrichment cap means some items legitimately stay
/// dateless.
pub fn date_within_window(upload_date: Option<&str>, cutoff: NaiveDate) -> bool {
    match upload_date.and_then(parse_upload_date) {
        Some(date) => date >= cutoff,
        None => true,
    }
}

/// Duration bounds for the post-download sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct DurationBounds {
    pub min_seconds: Option<u64>,
    pub max_seconds: Option<u64>,
}

impl DurationBounds {
    pub fn is_active(&self) -> bool {
        self.min_seconds.is_some() || self.max_seconds.is_some()
    }

    /// `None` durations fail an active bound: a file we cannot probe cannot
    /// be shown to satisfy the criteria.
    pub fn accepts(&self, duration: Option<u64>) -> bool {
        if !self.is_active() {
            return true;
        }
        let Some(duration) = duration else {
            return false;
        };
        if let Some(min) = self.min_seconds
            && duration < min
        {
            return false;
        }
        if let Some(max) = self.max_seconds
            && duration > max
        {
            return false;
        }
        true
    }
}

/// Outcome counters for one library sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub checked: u64,
    pub kept: u64,
    pub deleted: u64,
    pub flagged: u64,
}

/// Re-checks every `success` record against duration bounds and hashtag
/// rules using the on-disk artifacts as ground truth. With `delete` set,
/// offenders lose their files and are marked `deleted`; otherwise they are
/// only counted.
pub async fn sweep_library(
    store: &DedupStore,
    prober: &MediaProber,
    bounds: DurationBounds,
    required_tags: &[String],
    mode: TagMode,
    delete: bool,
) -> Result<SweepStats> {
    let mut stats = SweepStats::default();
    let records = store.list_by_status(VideoStatus::Success, None).await?;

    for record in records {
        stats.checked += 1;

        let duration_ok = if bounds.is_active() {
            let duration = match record.file_path.as_deref() {
                Some(path) => prober.duration_seconds(std::path::Path::new(path))?,
                None => None,
            };
            bounds.accepts(duration)
        } else {
            true
        };

        let hashtag_ok = if required_tags.is_empty() {
            true
        } else {
            let caption = record
                .caption_path
                .as_deref()
                .and_then(|path| std::fs::read_to_string(path).ok())
                .unwrap_or_default();
            caption_passes_hashtags(&caption, required_tags, mode)
        };

        if duration_ok && hashtag_ok {
            stats.kept += 1;
            continue;
        }

        if delete {
            remove_artifacts(&record);
            store
                .record_status(
                    &record.source_key,
                    &record.video_id,
                    &record.title,
                    &record.url,
                    VideoStatus::Deleted,
                    None,
                    None,
                )
                .await?;
            stats.deleted += 1;
        } else {
            stats.flagged += 1;
        }
    }

    Ok(stats)
}

fn remove_artifacts(record: &StoredVideo) {
    for path in [record.file_path.as_deref(), record.caption_path.as_deref()]
        .into_iter()
        .flatten()
    {
        let path = std::path::Path::new(path);
        if path.exists()
            && let Err(err) = std::fs::remove_file(path)
        {
            eprintln!("  Warning: could not remove {}: {}", path.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::test_support::install_ffprobe_stub;
    use tempfile::tempdir;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn extract_hashtags_normalizes_markers_and_case() {
        let found = extract_hashtags("Look! #Shorts and ＃CatVideos plus #fyp_2026");
        assert_eq!(found, vec!["shorts", "catvideos", "fyp_2026"]);
        assert!(extract_hashtags("no tags here").is_empty());
    }

    #[test]
    fn any_mode_needs_one_match() {
        let found = extract_hashtags("a clip #shorts");
        assert!(contains_required_hashtags(&found, &tags(&["#shorts", "#other"]), TagMode::Any));
        assert!(!contains_required_hashtags(&found, &tags(&["#missing"]), TagMode::Any));
    }

    #[test]
    fn all_mode_needs_every_match() {
        let found = extract_hashtags("#a and #b");
        assert!(contains_required_hashtags(&found, &tags(&["#a", "#b"]), TagMode::All));
        assert!(!contains_required_hashtags(&found, &tags(&["#a", "#c"]), TagMode::All));
    }

    #[test]
    fn fullwidth_marker_matches_case_insensitively() {
        assert!(caption_passes_hashtags("＃Foo content", &tags(&["#foo"]), TagMode::Any));
        assert!(caption_passes_hashtags("#FOO", &tags(&["foo"]), TagMode::Any));
    }

    #[test]
    fn empty_required_set_always_passes() {
        assert!(caption_passes_hashtags("anything", &[], TagMode::Any));
        assert!(caption_passes_hashtags("", &[], TagMode::All));
    }

    #[test]
    fn normalize_upload_date_accepts_both_formats() {
        assert_eq!(normalize_upload_date("20260115").as_deref(), Some("2026-01-15"));
        assert_eq!(normalize_upload_date("2026-01-15").as_deref(), Some("2026-01-15"));
        assert_eq!(normalize_upload_date("20269999"), None);
        assert_eq!(normalize_upload_date("recently"), None);
    }

    #[test]
    fn date_window_is_lenient_for_unknown_dates() {
        let cutoff = window_cutoff(7);
        assert!(date_within_window(None, cutoff));
        assert!(date_within_window(Some("junk"), cutoff));
        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        assert!(date_within_window(Some(&today), cutoff));
        assert!(!date_within_window(Some("2001-01-01"), cutoff));
    }

    #[test]
    fn duration_bounds_reject_unprobeable_files() {
        let bounds = DurationBounds {
            min_seconds: Some(10),
            max_seconds: Some(60),
        };
        assert!(bounds.accepts(Some(30)));
        assert!(!bounds.accepts(Some(5)));
        assert!(!bounds.accepts(Some(61)));
        assert!(!bounds.accepts(None));
        assert!(DurationBounds::default().accepts(None));
    }

    #[tokio::test]
    async fn sweep_deletes_offenders_and_marks_them() -> Result<()> {
        let dir = tempdir()?;
        let store = DedupStore::open(&dir.path().join("clipvault.db")).await?;
        let stub = install_ffprobe_stub(dir.path(), "1080x1920", "90")?;
        let prober = MediaProber::with_program(stub);

        let keep_media = dir.path().join("0001 - keep.mp4");
        let keep_caption = dir.path().join("0001 - keep.txt");
        std::fs::write(&keep_media, "bytes")?;
        std::fs::write(&keep_caption, "caption #shorts")?;
        store
            .record_status(
                "@cats",
                "keep",
                "Keep",
                "u",
                VideoStatus::Success,
                Some(keep_media.to_str().unwrap()),
                Some(keep_caption.to_str().unwrap()),
            )
            .await?;

        let drop_media = dir.path().join("0002 - drop.mp4");
        let drop_caption = dir.path().join("0002 - drop.txt");
        std::fs::write(&drop_media, "bytes")?;
        std::fs::write(&drop_caption, "caption without tags")?;
        store
            .record_status(
                "@cats",
                "drop",
                "Drop",
                "u",
                VideoStatus::Success,
                Some(drop_media.to_str().unwrap()),
                Some(drop_caption.to_str().unwrap()),
            )
            .await?;

        let stats = sweep_library(
            &store,
            &prober,
            DurationBounds {
                min_seconds: Some(30),
                max_seconds: None,
            },
            &tags(&["#shorts"]),
            TagMode::Any,
            true,
        )
        .await?;

        assert_eq!(stats.checked, 2);
        assert_eq!(stats.kept, 1);
        assert_eq!(stats.deleted, 1);
        assert!(keep_media.exists());
        assert!(!drop_media.exists());
        assert!(!drop_caption.exists());
        assert_eq!(
            store.get("@cats", "drop").await?.unwrap().status,
            VideoStatus::Deleted
        );
        Ok(())
    }

    #[tokio::test]
    async fn sweep_without_delete_only_flags() -> Result<()> {
        let dir = tempdir()?;
        let store = DedupStore::open(&dir.path().join("clipvault.db")).await?;
        let stub = install_ffprobe_stub(dir.path(), "1080x1920", "5")?;
        let prober = MediaProber::with_program(stub);

        let media = dir.path().join("0001 - short.mp4");
        std::fs::write(&media, "bytes")?;
        store
            .record_status(
                "@cats",
                "short",
                "Short",
                "u",
                VideoStatus::Success,
                Some(media.to_str().unwrap()),
                None,
            )
            .await?;

        let stats = sweep_library(
            &store,
            &prober,
            DurationBounds {
                min_seconds: Some(10),
                max_seconds: None,
            },
            &[],
            TagMode::All,
            false,
        )
        .await?;

        assert_eq!(stats.flagged, 1);
        assert_eq!(stats.deleted, 0);
        assert!(media.exists());
        assert_eq!(
            store.get("@cats", "short").await?.unwrap().status,
            VideoStatus::Success
        );
        Ok(())
    }
}
