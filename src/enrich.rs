#![forbid(unsafe_code)]

//! Metadata enrichment: lazy, bounded backfill of captions and upload dates
//! for items whose flat listing left them blank. Enrichment is best-effort
//! throughout; an item that cannot be enriched keeps its listing metadata.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::NaiveDate;
use parking_lot::Mutex;

use crate::fetcher::{FullInfo, MediaFetcher, classify_failure};
use crate::filter::{normalize_upload_date, parse_upload_date};
use crate::lister::CandidateItem;
use crate::retry::{Backoff, RetryPolicy};

const ENRICH_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct Enricher {
    fetcher: MediaFetcher,
    policy: RetryPolicy,
    timeout: Duration,
}

impl Enricher {
    pub fn new(fetcher: MediaFetcher, timeout: Duration, backoff: Backoff) -> Self {
        Self {
            fetcher,
            policy: RetryPolicy::new(ENRICH_ATTEMPTS, backoff),
            timeout,
        }
    }

    fn fetch_info_best_effort(&self, url: &str) -> Option<FullInfo> {
        let result = self.policy.run_blocking(
            |err| classify_failure(&format!("{err:#}")),
            |_| self.fetcher.fetch_info(url, self.timeout),
        );
        match result {
            Ok(info) => Some(info),
            Err(err) => {
                eprintln!("  Warning: metadata fetch failed for {url}: {err:#}");
                None
            }
        }
    }

    /// Full caption text for one item, or `None` when the provider has
    /// nothing (or keeps refusing).
    pub fn fetch_caption(&self, item: &CandidateItem) -> Option<String> {
        self.fetch_info_best_effort(&item.webpage_url)
            .and_then(|info| info.caption_text().map(str::to_string))
    }

    /// Normalized (`YYYY-MM-DD`) upload date for one item.
    pub fn fetch_upload_date(&self, item: &CandidateItem) -> Option<String> {
        self.fetch_info_best_effort(&item.webpage_url)
            .and_then(|info| info.upload_date.as_deref().and_then(normalize_upload_date))
    }

    /// Backfills missing upload dates (and, opportunistically, captions) for
    /// at most `cap` items using a small worker pool. Stops early once an
    /// enriched date falls before `cutoff` — sources are assumed close to
    /// chronological, so older items only get older. Returns the number of
    /// dates filled.
    pub async fn backfill_upload_dates(
        &self,
        items: &mut [CandidateItem],
        cap: usize,
        cutoff: Option<NaiveDate>,
        workers: usize,
    ) -> usize {
        let targets: VecDeque<(usize, String)> = items
            .iter()
            .enumerate()
            .filter(|(_, item)| {
                item.upload_date
                    .as_deref()
                    .and_then(normalize_upload_date)
                    .is_none()
            })
            .map(|(index, item)| (index, item.webpage_url.clone()))
            .take(cap)
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let queue = Arc::new(Mutex::new(targets));
        let results: Arc<Mutex<Vec<(usize, FullInfo)>>> = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..workers.max(1) {
            let enricher = self.clone();
            let queue = Arc::clone(&queue);
            let results = Arc::clone(&results);
            let stop = Arc::clone(&stop);
            handles.push(tokio::task::spawn_blocking(move || {
                loop {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    let job = queue.lock().pop_front();
                    let Some((index, url)) = job else { break };
                    let Some(info) = enricher.fetch_info_best_effort(&url) else {
                        continue;
                    };
                    if let Some(cutoff) = cutoff
                        && let Some(date) = info.upload_date.as_deref().and_then(parse_upload_date)
                        && date < cutoff
                    {
                        stop.store(true, Ordering::Relaxed);
                    }
                    results.lock().push((index, info));
                }
            }));
        }
        for handle in handles {
            if let Err(err) = handle.await {
                eprintln!("  Warning: enrichment worker panicked: {err}");
            }
        }

        let mut filled = 0;
        let mut results = results.lock();
        for (index, info) in results.drain(..) {
            let item = &mut items[index];
            if let Some(date) = info.upload_date.as_deref().and_then(normalize_upload_date) {
                item.upload_date = Some(date);
                filled += 1;
            }
            if item.caption.is_none()
                && let Some(caption) = info.caption_text()
            {
                item.caption = Some(caption.to_string());
            }
        }
        filled
    }

    /// Fetches captions for the given item indices with the same small
    /// pool. Used by the hashtag prefilter, which needs caption text for
    /// items the flat listing left blank. Returns the number filled.
    pub async fn backfill_captions(
        &self,
        items: &mut [CandidateItem],
        indices: Vec<usize>,
        workers: usize,
    ) -> usize {
        let targets: VecDeque<(usize, String)> = indices
            .into_iter()
            .filter(|&index| items[index].caption.is_none())
            .map(|index| (index, items[index].webpage_url.clone()))
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let queue = Arc::new(Mutex::new(targets));
        let results: Arc<Mutex<Vec<(usize, FullInfo)>>> = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..workers.max(1) {
            let enricher = self.clone();
            let queue = Arc::clone(&queue);
            let results = Arc::clone(&results);
            handles.push(tokio::task::spawn_blocking(move || {
                loop {
                    let job = queue.lock().pop_front();
                    let Some((index, url)) = job else { break };
                    if let Some(info) = enricher.fetch_info_best_effort(&url) {
                        results.lock().push((index, info));
                    }
                }
            }));
        }
        for handle in handles {
            if let Err(err) = handle.await {
                eprintln!("  Warning: enrichment worker panicked: {err}");
            }
        }

        let mut filled = 0;
        let mut results = results.lock();
        for (index, info) in results.drain(..) {
            let item = &mut items[index];
            if let Some(caption) = info.caption_text() {
                item.caption = Some(caption.to_string());
                filled += 1;
            }
            if item.upload_date.is_none()
                && let Some(date) = info.upload_date.as_deref().and_then(normalize_upload_date)
            {
                item.upload_date = Some(date);
            }
        }
        filled
    }
}
