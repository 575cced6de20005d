#![forbid(unsafe_code)]

//! Run accounting and the append-only failure log.
//!
//! Reporting is strictly best-effort: nothing in this module returns an
//! error to the pipeline, because a bookkeeping failure must never roll
//! back or block an acquisition that already happened.

use chrono::Utc;
use parking_lot::Mutex;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Counters for a single scanned source.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SourceTally {
    pub listed: u64,
    pub filtered_out: u64,
    pub duplicate: u64,
    pub downloaded_ok: u64,
    pub downloaded_fail: u64,
}

impl SourceTally {
    pub fn absorb(&mut self, other: &SourceTally) {
        self.listed += other.listed;
        self.filtered_out += other.filtered_out;
        self.duplicate += other.duplicate;
        self.downloaded_ok += other.downloaded_ok;
        self.downloaded_fail += other.downloaded_fail;
    }
}

impl fmt::Display for SourceTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "listed {}, filtered {}, duplicates {}, downloaded {}, failed {}",
            self.listed, self.filtered_out, self.duplicate, self.downloaded_ok, self.downloaded_fail
        )
    }
}

/// Aggregated counters for a whole batch, keyed in scan order.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub per_source: Vec<(String, SourceTally)>,
}

impl RunSummary {
    pub fn record(&mut self, source_key: &str, tally: SourceTally) {
        self.per_source.push((source_key.to_string(), tally));
    }

    pub fn totals(&self) -> SourceTally {
        let mut total = SourceTally::default();
        for (_, tally) in &self.per_source {
            total.absorb(tally);
        }
        total
    }

    pub fn print(&self) {
        println!();
        println!("===================================");
        println!("Run summary");
        println!("===================================");
        for (key, tally) in &self.per_source {
            println!("{key}: {tally}");
        }
        if self.per_source.len() > 1 {
            println!("total: {}", self.totals());
        }
    }
}

/// Append-only UTF-8 failure log, one timestamped multi-line entry per
/// failure. Writes are serialized; write errors degrade to stderr.
#[derive(Debug)]
pub struct ErrorLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ErrorLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records an item-level failure with enough context to retry it by hand.
    pub fn record_failure(&self, item_id: &str, url: &str, class: &str, message: &str) {
        let entry = format!(
            "[{}] id={} url={} class={}\n{}\n\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            item_id,
            url,
            class,
            message.trim_end(),
        );
        self.append(&entry);
    }

    /// Records a stage-level problem that has no single item attached
    /// (listing failures, store write errors).
    pub fn note(&self, context: &str, message: &str) {
        let entry = format!(
            "[{}] {}\n{}\n\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            context,
            message.trim_end(),
        );
        self.append(&entry);
    }

    fn append(&self, entry: &str) {
        let _guard = self.lock.lock();
        if let Some(parent) = self.path.parent()
            && let Err(err) = std::fs::create_dir_all(parent)
        {
            eprintln!("  Warning: could not create error log dir: {err}");
            return;
        }
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(entry.as_bytes()));
        if let Err(err) = result {
            eprintln!("  Warning: could not append to error log: {err}");
        }
    }
}
