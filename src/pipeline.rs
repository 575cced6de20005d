#![forbid(unsafe_code)]

//! Batch driver: wires the lister, enricher, filter, dedup store and
//! orchestrator together and runs them over a list of sources. All shared
//! state lives in one explicit `PipelineContext` handed to every stage.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};

use crate::config::{PipelineTuning, RuntimePaths};
use crate::enrich::Enricher;
use crate::fetcher::MediaFetcher;
use crate::filter::{self, TagMode};
use crate::lister::{self, CandidateItem, SourceSpec};
use crate::naming;
use crate::orchestrator::Orchestrator;
use crate::probe::MediaProber;
use crate::report::{ErrorLog, RunSummary, SourceTally};
use crate::retry::Backoff;
use crate::store::{DedupStore, VideoStatus};

/// Pre-download acceptance rules for a run.
#[derive(Debug, Clone)]
pub struct FilterRules {
    pub required_tags: Vec<String>,
    pub tag_mode: TagMode,
    pub days_window: Option<u32>,
}

impl Default for FilterRules {
    fn default() -> Self {
        Self {
            required_tags: Vec::new(),
            tag_mode: TagMode::Any,
            days_window: None,
        }
    }
}

/// Everything a pipeline stage needs, owned in one place.
pub struct PipelineContext {
    pub paths: RuntimePaths,
    pub tuning: PipelineTuning,
    pub store: Arc<DedupStore>,
    pub fetcher: MediaFetcher,
    pub prober: MediaProber,
    pub log: Arc<ErrorLog>,
    pub cancel: Arc<AtomicBool>,
    orchestrator: Arc<Orchestrator>,
}

impl PipelineContext {
    pub async fn new(
        paths: RuntimePaths,
        tuning: PipelineTuning,
        fetcher: MediaFetcher,
        prober: MediaProber,
    ) -> Result<Self> {
        let store = Arc::new(
            DedupStore::open(&paths.db_path)
                .await
                .context("opening dedup store")?,
        );
        let log = Arc::new(ErrorLog::new(&paths.error_log_path));
        let cancel = Arc::new(AtomicBool::new(false));
        let enricher = Enricher::new(
            fetcher.clone(),
            tuning.enrich_timeout,
            Backoff::new(tuning.backoff_base, tuning.backoff_cap),
        );
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            fetcher.clone(),
            prober.clone(),
            enricher,
            Arc::clone(&log),
            tuning.clone(),
            Arc::clone(&cancel),
        ));
        Ok(Self {
            paths,
            tuning,
            store,
            fetcher,
            prober,
            log,
            cancel,
            orchestrator,
        })
    }

    pub fn enricher(&self) -> Enricher {
        Enricher::new(
            self.fetcher.clone(),
            self.tuning.enrich_timeout,
            Backoff::new(self.tuning.backoff_base, self.tuning.backoff_cap),
        )
    }

    /// Each source gets its own flat subdirectory of the output root; the
    /// sequence counter is scoped to that directory.
    pub fn source_output_dir(&self, source: &SourceSpec) -> PathBuf {
        self.paths
            .output_root
            .join(naming::sanitize_component(&source.key, 80))
    }

    /// Runs the full pipeline over every source. A source that fails is
    /// logged and skipped; the batch always continues.
    pub async fn run_batch(
        &self,
        sources: &[SourceSpec],
        rules: &FilterRules,
        max_items: Option<usize>,
        retry_failed: bool,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        for source in sources {
            if self.cancel.load(Ordering::Relaxed) {
                println!("Interrupt observed; skipping remaining sources.");
                break;
            }
            println!();
            println!("Scanning {}...", source.key);
            match self.run_source(source, rules, max_items, retry_failed).await {
                Ok(tally) => {
                    println!("{}: {}", source.key, tally);
                    summary.record(&source.key, tally);
                }
                Err(err) => {
                    eprintln!("  Warning: source {} failed: {err:#}", source.key);
                    self.log
                        .note(&format!("source {}", source.key), &format!("{err:#}"));
                    summary.record(&source.key, SourceTally::default());
                }
            }
        }
        Ok(summary)
    }

    async fn run_source(
        &self,
        source: &SourceSpec,
        rules: &FilterRules,
        max_items: Option<usize>,
        retry_failed: bool,
    ) -> Result<SourceTally> {
        let mut tally = SourceTally::default();

        let mut items = {
            let fetcher = self.fetcher.clone();
            let source = source.clone();
            let log = Arc::clone(&self.log);
            let timeout = self.tuning.listing_timeout;
            tokio::task::spawn_blocking(move || {
                lister::list_items(&fetcher, &source, max_items, timeout, &log)
            })
            .await
            .unwrap_or_default()
        };
        tally.listed = items.len() as u64;

        if let Err(err) = self
            .store
            .upsert_source(&source.key, &source.display_name, &source.canonical_url)
            .await
        {
            self.log
                .note(&format!("upsert source {}", source.key), &format!("{err:#}"));
        }

        if let Some(days) = rules.days_window
            && !items.is_empty()
        {
            let cutoff = filter::window_cutoff(days);
            self.enricher()
                .backfill_upload_dates(
                    &mut items,
                    self.tuning.enrich_cap,
                    Some(cutoff),
                    self.tuning.enrich_workers,
                )
                .await;
            let before = items.len();
            items.retain(|item| filter::date_within_window(item.upload_date.as_deref(), cutoff));
            tally.filtered_out += (before - items.len()) as u64;
        }

        if !rules.required_tags.is_empty() && !items.is_empty() {
            items = self.prefilter_hashtags(source, items, rules, &mut tally).await?;
        }

        let mut fresh = Vec::new();
        for item in items {
            if self.store.is_known(&source.key, &item.id).await? {
                tally.duplicate += 1;
            } else {
                fresh.push(item);
            }
        }

        if retry_failed {
            let requeued = self.collect_requeued(source, &fresh).await?;
            if !requeued.is_empty() {
                println!("  Re-queuing {} previously failed item(s)", requeued.len());
            }
            fresh.extend(requeued);
        }

        if !fresh.is_empty() && !self.cancel.load(Ordering::Relaxed) {
            let output_dir = self.source_output_dir(source);
            let (ok, fail) = Arc::clone(&self.orchestrator)
                .download_batch(source, fresh, &output_dir)
                .await?;
            tally.downloaded_ok = ok;
            tally.downloaded_fail = fail;
        }

        Ok(tally)
    }

    /// Hashtag prefilter. Items already known to the store skip caption
    /// enrichment entirely (their verdict is recorded from an earlier scan)
    /// and flow on to the dedup stage, which drops them as duplicates.
    async fn prefilter_hashtags(
        &self,
        source: &SourceSpec,
        mut items: Vec<CandidateItem>,
        rules: &FilterRules,
        tally: &mut SourceTally,
    ) -> Result<Vec<CandidateItem>> {
        let mut known = HashSet::new();
        for item in &items {
            if self.store.is_known(&source.key, &item.id).await? {
                known.insert(item.id.clone());
            }
        }

        let need_caption: Vec<usize> = items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.caption.is_none() && !known.contains(&item.id))
            .map(|(index, _)| index)
            .collect();
        if !need_caption.is_empty() {
            self.enricher()
                .backfill_captions(&mut items, need_caption, self.tuning.enrich_workers)
                .await;
        }

        let mut kept = Vec::new();
        for item in items {
            if known.contains(&item.id) {
                kept.push(item);
                continue;
            }
            let caption = item.caption.as_deref().unwrap_or(&item.title);
            if filter::caption_passes_hashtags(caption, &rules.required_tags, rules.tag_mode) {
                kept.push(item);
            } else {
                tally.filtered_out += 1;
                // Captions are immutable once observed; recording the skip
                // spares every future scan this item's enrichment cost.
                if let Err(err) = self
                    .store
                    .record_status(
                        &source.key,
                        &item.id,
                        &item.title,
                        &item.webpage_url,
                        VideoStatus::SkippedHashtag,
                        None,
                        None,
                    )
                    .await
                {
                    self.log
                        .note(&format!("mark skipped {}", item.id), &format!("{err:#}"));
                }
            }
        }
        Ok(kept)
    }

    /// Items reset to `queued` by an explicit retry request, rebuilt from
    /// their stored metadata so they bypass the known-id drop.
    async fn collect_requeued(
        &self,
        source: &SourceSpec,
        fresh: &[CandidateItem],
    ) -> Result<Vec<CandidateItem>> {
        let reset = self.store.requeue_failed(&source.key).await?;
        if reset > 0 {
            println!("  Reset {reset} failed item(s) to queued");
        }
        let queued = self
            .store
            .list_by_status(VideoStatus::Queued, Some(&source.key))
            .await?;
        let have: HashSet<&str> = fresh.iter().map(|item| item.id.as_str()).collect();
        Ok(queued
            .into_iter()
            .filter(|record| !have.contains(record.video_id.as_str()) && !record.url.is_empty())
            .map(|record| CandidateItem {
                id: record.video_id,
                title: record.title,
                webpage_url: record.url,
                uploader: source.display_name.clone(),
                upload_date: None,
                caption: None,
                duration: None,
            })
            .collect())
    }
}
