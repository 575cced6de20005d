#![forbid(unsafe_code)]

//! Ordinal filename construction for the output directory.
//!
//! Every downloaded clip is named `NNNN - <title> - <creator>.<ext>` and its
//! caption sidecar shares the base name with a `.txt` extension, so a plain
//! directory scan can pair them without consulting the store.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const MAX_TITLE_LEN: usize = 80;
const MAX_CREATOR_LEN: usize = 50;
const MAX_FILENAME_LEN: usize = 255;

/// Strips a string down to something every filesystem accepts: printable
/// ASCII only, reserved characters replaced, runs of whitespace and
/// underscores collapsed.
pub fn sanitize_component(raw: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(raw.len().min(max_len));
    let mut last_was_sep = false;
    for c in raw.chars() {
        let mapped = match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => Some('_'),
            c if (' '..='~').contains(&c) => Some(c),
            _ => None,
        };
        let Some(mapped) = mapped else { continue };
        if mapped == ' ' || mapped == '_' {
            if last_was_sep {
                continue;
            }
            last_was_sep = true;
            out.push('_');
        } else {
            last_was_sep = false;
            out.push(mapped);
        }
    }
    let trimmed = out.trim_matches('_');
    let mut result: String = trimmed.chars().take(max_len).collect();
    if result.is_empty() {
        result = "untitled".to_string();
    }
    result
}

fn filename_is_safe(name: &str) -> bool {
    name.is_ascii()
        && name.len() <= MAX_FILENAME_LEN
        && !name
            .chars()
            .any(|c| matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') || c.is_control())
}

/// Builds the final media filename for a reserved ordinal. Falls back to a
/// bare `NNNN - video_<id>` form when nothing of the title survives
/// sanitization (an all-emoji title, say) or the name is otherwise unusable.
pub fn media_file_name(index: u64, title: &str, creator: &str, video_id: &str, ext: &str) -> String {
    let safe_title = sanitize_component(title, MAX_TITLE_LEN);
    let safe_creator = sanitize_component(creator, MAX_CREATOR_LEN);
    let candidate = format!("{index:04} - {safe_title} - {safe_creator}.{ext}");
    let title_survived = safe_title != "untitled" || title.trim().eq_ignore_ascii_case("untitled");
    if title_survived && filename_is_safe(&candidate) {
        candidate
    } else {
        let safe_id = sanitize_component(video_id, 40);
        format!("{index:04} - video_{safe_id}.{ext}")
    }
}

/// Caption sidecar name for a media filename: same base, `.txt` extension.
pub fn caption_file_name(media_name: &str) -> String {
    match media_name.rsplit_once('.') {
        Some((base, _)) => format!("{base}.txt"),
        None => format!("{media_name}.txt"),
    }
}

/// Appends `_1`, `_2`, ... before the extension until the name is free.
/// Ordinals make collisions rare; this guards against counter resets.
pub fn unique_file_name(dir: &Path, file_name: &str) -> String {
    if !dir.join(file_name).exists() {
        return file_name.to_string();
    }
    let (base, ext) = match file_name.rsplit_once('.') {
        Some((base, ext)) => (base.to_string(), format!(".{ext}")),
        None => (file_name.to_string(), String::new()),
    };
    let mut counter = 1;
    loop {
        let candidate = format!("{base}_{counter}{ext}");
        if !dir.join(&candidate).exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Scans a directory for the highest `NNNN - ` filename prefix. Used to
/// reconcile the sequence counter against files that survived a store reset.
pub fn highest_existing_index(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let mut highest = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some((prefix, _)) = name.split_once(" - ")
            && let Ok(index) = prefix.trim().parse::<u64>()
        {
            highest = highest.max(index);
        }
    }
    highest
}

/// Deletes leftover partial-download artifacts for a filename prefix.
pub fn cleanup_partials(dir: &Path, prefix: &str) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(prefix) && (name.ends_with(".part") || name.ends_with(".ytdl")) {
            if let Err(err) = fs::remove_file(entry.path()) {
                eprintln!("  Warning: could not remove partial {}: {}", name, err);
            }
        }
    }
}

/// Creates the output directory if needed and returns the absolute form used
/// as the sequence-counter key, so relative and absolute invocations share
/// one counter row.
pub fn canonical_output_dir(dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    dir.canonicalize()
        .with_context(|| format!("resolving {}", dir.display()))
}
