#![forbid(unsafe_code)]

//! Download orchestration: a bounded worker pool that takes pre-numbered
//! candidate items end-to-end — sidecar caption, strategy-fallback download,
//! quality-floor verification, store bookkeeping — with cooperative
//! cancellation between items.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rand::Rng;

use crate::config::PipelineTuning;
use crate::enrich::Enricher;
use crate::fetcher::{MediaFetcher, classify_failure, default_strategies};
use crate::lister::{CandidateItem, SourceSpec};
use crate::naming;
use crate::probe::MediaProber;
use crate::report::ErrorLog;
use crate::retry::{Backoff, ErrorClass};
use crate::store::{DedupStore, VideoStatus};

/// One unit of work: a candidate item plus the ordinal reserved for it.
#[derive(Debug, Clone)]
struct DownloadJob {
    item: CandidateItem,
    index: u64,
}

pub struct Orchestrator {
    store: Arc<DedupStore>,
    fetcher: MediaFetcher,
    prober: MediaProber,
    enricher: Enricher,
    log: Arc<ErrorLog>,
    tuning: PipelineTuning,
    cancel: Arc<AtomicBool>,
    consecutive_fs_errors: AtomicU32,
}

impl Orchestrator {
    pub fn new(
        store: Arc<DedupStore>,
        fetcher: MediaFetcher,
        prober: MediaProber,
        enricher: Enricher,
        log: Arc<ErrorLog>,
        tuning: PipelineTuning,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            fetcher,
            prober,
            enricher,
            log,
            tuning,
            cancel,
            consecutive_fs_errors: AtomicU32::new(0),
        }
    }

    /// Downloads a batch of items for one source. Ordinals are reserved for
    /// the whole batch before any worker starts, so filenames are
    /// deterministic regardless of completion order. Returns
    /// `(downloaded_ok, downloaded_fail)`.
    pub async fn download_batch(
        self: Arc<Self>,
        source: &SourceSpec,
        items: Vec<CandidateItem>,
        output_dir: &Path,
    ) -> Result<(u64, u64)> {
        if items.is_empty() {
            return Ok((0, 0));
        }
        let output_dir = naming::canonical_output_dir(output_dir)?;
        let indices = self
            .store
            .reserve_sequence(&output_dir, items.len() as u64)
            .await
            .context("reserving sequence numbers")?;

        let jobs: VecDeque<DownloadJob> = items
            .into_iter()
            .zip(indices)
            .map(|(item, index)| DownloadJob { item, index })
            .collect();
        let total = jobs.len();
        let queue = Arc::new(Mutex::new(jobs));
        let ok = Arc::new(AtomicU64::new(0));
        let fail = Arc::new(AtomicU64::new(0));
        let done = Arc::new(AtomicU64::new(0));

        let workers = self.tuning.download_workers.clamp(1, total.max(1));
        let mut handles = Vec::new();
        for _ in 0..workers {
            let orchestrator = Arc::clone(&self);
            let source = source.clone();
            let output_dir = output_dir.clone();
            let queue = Arc::clone(&queue);
            let ok = Arc::clone(&ok);
            let fail = Arc::clone(&fail);
            let done = Arc::clone(&done);
            handles.push(tokio::spawn(async move {
                loop {
                    if orchestrator.cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let job = queue.lock().pop_front();
                    let Some(job) = job else { break };
                    let current = done.fetch_add(1, Ordering::Relaxed) + 1;
                    println!(
                        "[{}/{}] Downloading {} as #{:04}",
                        current, total, job.item.id, job.index
                    );
                    if orchestrator.process_item(&source, &job, &output_dir).await {
                        ok.fetch_add(1, Ordering::Relaxed);
                    } else {
                        fail.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }));
        }
        for handle in handles {
            if let Err(err) = handle.await {
                eprintln!("  Warning: download worker panicked: {err}");
            }
        }

        Ok((ok.load(Ordering::Relaxed), fail.load(Ordering::Relaxed)))
    }

    /// Handles one item end-to-end. Returns true on a verified download.
    async fn process_item(&self, source: &SourceSpec, job: &DownloadJob, output_dir: &Path) -> bool {
        let item = &job.item;
        let file_name = naming::media_file_name(
            job.index,
            &item.title,
            &item.uploader,
            &item.id,
            &self.tuning.file_format,
        );
        let file_name = naming::unique_file_name(output_dir, &file_name);
        let media_path = output_dir.join(&file_name);
        let caption_name = naming::caption_file_name(&file_name);
        let caption_path = output_dir.join(&caption_name);
        let prefix = file_name
            .rsplit_once('.')
            .map(|(stem, _)| stem.to_string())
            .unwrap_or_else(|| file_name.clone());

        // Lazy caption enrichment: only items that reached the download
        // stage without caption text cost a metadata fetch.
        let caption_text = match &item.caption {
            Some(text) => Some(text.clone()),
            None => {
                let enricher = self.enricher.clone();
                let lookup = item.clone();
                tokio::task::spawn_blocking(move || enricher.fetch_caption(&lookup))
                    .await
                    .unwrap_or(None)
            }
        };

        // The sidecar is written before the media file so an interrupted
        // download can never leave a clip without its caption.
        let caption_written = self.write_caption(item, caption_text, &caption_path);
        let caption_recorded = caption_written.then(|| caption_path.to_string_lossy().into_owned());

        self.record(
            source,
            item,
            VideoStatus::Downloading,
            None,
            caption_recorded.as_deref(),
        )
        .await;

        naming::cleanup_partials(output_dir, &prefix);

        // Small start offset so a full pool does not hit the provider in
        // one synchronized burst.
        let start_jitter = rand::rng().random_range(150..500);
        tokio::time::sleep(std::time::Duration::from_millis(start_jitter)).await;

        let backoff = Backoff::new(self.tuning.backoff_base, self.tuning.backoff_cap);
        let strategies = default_strategies(self.tuning.quality_floor);
        let mut transient_attempts: u32 = 0;
        let mut last_error = String::from("no strategy attempted");

        for strategy in &strategies {
            let attempt = {
                let fetcher = self.fetcher.clone();
                let url = item.webpage_url.clone();
                let path = media_path.clone();
                let strategy = strategy.clone();
                let format = self.tuning.file_format.clone();
                let timeout = self.tuning.download_timeout;
                tokio::task::spawn_blocking(move || {
                    fetcher.download(&url, &path, &strategy, &format, timeout)
                })
                .await
            };
            let outcome = match attempt {
                Ok(outcome) => outcome,
                Err(join_err) => Err(anyhow::anyhow!("download task failed: {join_err}")),
            };

            match outcome {
                Ok(()) => match self.verify_artifact(&media_path).await {
                    ArtifactCheck::Good => {
                        self.consecutive_fs_errors.store(0, Ordering::Relaxed);
                        let media_recorded = media_path.to_string_lossy().into_owned();
                        self.record(
                            source,
                            item,
                            VideoStatus::Success,
                            Some(media_recorded.as_str()),
                            caption_recorded.as_deref(),
                        )
                        .await;
                        return true;
                    }
                    ArtifactCheck::Rejected(reason) => {
                        // Never keep an under-floor or truncated artifact
                        // around while falling through to the next strategy.
                        remove_file_best_effort(&media_path);
                        last_error = format!("{} via {}", reason, strategy.name);
                        transient_attempts += 1;
                        if transient_attempts >= self.tuning.max_transient_attempts {
                            break;
                        }
                        tokio::time::sleep(backoff.delay(transient_attempts)).await;
                    }
                },
                Err(err) => {
                    let message = format!("{err:#}");
                    match classify_failure(&message) {
                        ErrorClass::Fatal => {
                            last_error = message;
                            self.finish_failed(source, item, caption_recorded.as_deref(), &media_path, "fatal", &last_error)
                                .await;
                            return false;
                        }
                        ErrorClass::FormatUnavailable => {
                            // Selector cannot be served; the next strategy is
                            // the retry, no point waiting.
                            last_error = message;
                        }
                        ErrorClass::Transient => {
                            last_error = message;
                            transient_attempts += 1;
                            if transient_attempts >= self.tuning.max_transient_attempts {
                                break;
                            }
                            tokio::time::sleep(backoff.delay(transient_attempts)).await;
                        }
                    }
                }
            }
        }

        self.finish_failed(
            source,
            item,
            caption_recorded.as_deref(),
            &media_path,
            "exhausted",
            &last_error,
        )
        .await;
        false
    }

    /// Size and quality-floor verification of a finished download.
    async fn verify_artifact(&self, media_path: &Path) -> ArtifactCheck {
        let size = std::fs::metadata(media_path).map(|meta| meta.len()).unwrap_or(0);
        if size < self.tuning.min_file_bytes {
            return ArtifactCheck::Rejected(format!(
                "artifact too small ({size} bytes), likely truncated"
            ));
        }
        if self.tuning.quality_floor == 0 {
            return ArtifactCheck::Good;
        }
        let probe = {
            let prober = self.prober.clone();
            let path = media_path.to_path_buf();
            tokio::task::spawn_blocking(move || prober.dimensions(&path)).await
        };
        match probe {
            Ok(Ok(Some((width, height)))) => {
                let short_dim = width.min(height);
                if short_dim < self.tuning.quality_floor {
                    ArtifactCheck::Rejected(format!(
                        "resolution {width}x{height} below floor {}",
                        self.tuning.quality_floor
                    ))
                } else {
                    ArtifactCheck::Good
                }
            }
            // An unprobeable file is accepted: the floor rejects proven
            // low-quality artifacts, not probe failures.
            Ok(Ok(None)) => ArtifactCheck::Good,
            Ok(Err(err)) => {
                eprintln!("  Warning: probe failed for {}: {err:#}", media_path.display());
                ArtifactCheck::Good
            }
            Err(join_err) => {
                eprintln!("  Warning: probe task failed: {join_err}");
                ArtifactCheck::Good
            }
        }
    }

    fn write_caption(
        &self,
        item: &CandidateItem,
        caption_text: Option<String>,
        caption_path: &Path,
    ) -> bool {
        let body = caption_text.unwrap_or_else(|| item.title.clone());
        let content = format!(
            "Title: {}\nCreator: {}\nURL: {}\nID: {}\nCaption:\n{}\n",
            item.title, item.uploader, item.webpage_url, item.id, body
        );
        match std::fs::write(caption_path, content) {
            Ok(()) => {
                self.consecutive_fs_errors.store(0, Ordering::Relaxed);
                true
            }
            Err(err) => {
                eprintln!(
                    "  Warning: could not write caption {}: {}",
                    caption_path.display(),
                    err
                );
                self.log.record_failure(
                    &item.id,
                    &item.webpage_url,
                    "filesystem",
                    &format!("caption write failed: {err}"),
                );
                self.note_fs_error();
                false
            }
        }
    }

    async fn finish_failed(
        &self,
        source: &SourceSpec,
        item: &CandidateItem,
        caption_path: Option<&str>,
        media_path: &Path,
        class: &str,
        message: &str,
    ) {
        remove_file_best_effort(media_path);
        self.log
            .record_failure(&item.id, &item.webpage_url, class, message);
        // The orphaned caption stays on disk; the failed status makes the
        // pairing unambiguous for external cleanup sweeps.
        self.record(source, item, VideoStatus::Failed, None, caption_path)
            .await;
    }

    /// Store bookkeeping is non-fatal to the item: the download already
    /// succeeded or failed independently of it.
    async fn record(
        &self,
        source: &SourceSpec,
        item: &CandidateItem,
        status: VideoStatus,
        file_path: Option<&str>,
        caption_path: Option<&str>,
    ) {
        if let Err(err) = self
            .store
            .record_status(
                &source.key,
                &item.id,
                &item.title,
                &item.webpage_url,
                status,
                file_path,
                caption_path,
            )
            .await
        {
            eprintln!("  Warning: store update failed for {}: {err:#}", item.id);
            self.log.note(
                &format!("store update {} -> {}", item.id, status.as_str()),
                &format!("{err:#}"),
            );
        }
    }

    fn note_fs_error(&self) {
        let seen = self.consecutive_fs_errors.fetch_add(1, Ordering::Relaxed) + 1;
        let limit = self.tuning.max_consecutive_fs_errors;
        if limit > 0 && seen >= limit && !self.cancel.swap(true, Ordering::Relaxed) {
            eprintln!("  Warning: {seen} consecutive filesystem errors, stopping dispatch");
            self.log.note(
                "filesystem",
                &format!("{seen} consecutive filesystem errors, run aborted"),
            );
        }
    }
}

enum ArtifactCheck {
    Good,
    Rejected(String),
}

fn remove_file_best_effort(path: &Path) {
    if path.exists()
        && let Err(err) = std::fs::remove_file(path)
    {
        eprintln!("  Warning: could not remove {}: {}", path.display(), err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::test_support::install_fetcher_stub;
    use crate::lister::normalize_source;
    use crate::probe::test_support::install_ffprobe_stub;
    use crate::retry::Backoff;
    use std::time::Duration;
    use tempfile::tempdir;

    fn fast_tuning() -> PipelineTuning {
        PipelineTuning {
            download_workers: 2,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(4),
            max_transient_attempts: 3,
            min_file_bytes: 1000,
            quality_floor: 720,
            ..PipelineTuning::default()
        }
    }

    fn item(id: &str) -> CandidateItem {
        CandidateItem {
            id: id.to_string(),
            title: format!("Title {id}"),
            webpage_url: format!("https://clips.example/v/{id}"),
            uploader: "Creator".to_string(),
            upload_date: Some("2026-01-01".to_string()),
            caption: Some(format!("Caption for {id} #shorts")),
            duration: None,
        }
    }

    async fn build(
        dir: &std::path::Path,
        dims: &str,
        tuning: PipelineTuning,
    ) -> anyhow::Result<(Arc<Orchestrator>, Arc<DedupStore>, Arc<AtomicBool>)> {
        let fetcher_stub = install_fetcher_stub(dir, "{}")?;
        let probe_stub = install_ffprobe_stub(dir, dims, "30")?;
        let store = Arc::new(DedupStore::open(&dir.join("clipvault.db")).await?);
        let fetcher = MediaFetcher::with_program(fetcher_stub);
        let prober = MediaProber::with_program(probe_stub);
        let enricher = Enricher::new(
            fetcher.clone(),
            Duration::from_secs(10),
            Backoff::new(Duration::from_millis(1), Duration::from_millis(2)),
        );
        let log = Arc::new(ErrorLog::new(&dir.join("errors.log")));
        let cancel = Arc::new(AtomicBool::new(false));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            fetcher,
            prober,
            enricher,
            log,
            tuning,
            Arc::clone(&cancel),
        ));
        Ok((orchestrator, store, cancel))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn batch_downloads_and_pairs_files() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (orchestrator, store, _cancel) = build(dir.path(), "1080x1920", fast_tuning()).await?;
        let source = normalize_source("@creator");
        let out = dir.path().join("out");

        let (ok, fail) = orchestrator
            .download_batch(&source, vec![item("alpha"), item("bravo")], &out)
            .await?;
        assert_eq!((ok, fail), (2, 0));

        for id in ["alpha", "bravo"] {
            let record = store.get("@creator", id).await?.expect("record");
            assert_eq!(record.status, VideoStatus::Success);
            let media = record.file_path.expect("file path");
            let caption = record.caption_path.expect("caption path");
            assert!(std::path::Path::new(&media).exists());
            assert!(std::path::Path::new(&caption).exists());
            // Paired by name: same base, different extension.
            assert_eq!(
                media.trim_end_matches("mp4").trim_end_matches('.'),
                caption.trim_end_matches("txt").trim_end_matches('.')
            );
            let caption_text = std::fs::read_to_string(&caption)?;
            assert!(caption_text.contains(&format!("ID: {id}")));
            assert!(caption_text.contains("URL: https://clips.example/v/"));
            assert!(caption_text.contains("Title: "));
            assert!(caption_text.contains("Caption:"));
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn transient_failures_exhaust_and_mark_failed() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (orchestrator, store, _cancel) = build(dir.path(), "1080x1920", fast_tuning()).await?;
        std::fs::write(dir.path().join("fail_ids.txt"), "alpha\n")?;
        let source = normalize_source("@creator");
        let out = dir.path().join("out");

        let (ok, fail) = orchestrator
            .download_batch(&source, vec![item("alpha")], &out)
            .await?;
        assert_eq!((ok, fail), (0, 1));

        let record = store.get("@creator", "alpha").await?.expect("record");
        assert_eq!(record.status, VideoStatus::Failed);
        assert!(record.file_path.is_none());
        // The orphaned caption is acceptable because the status is failed.
        assert!(record.caption_path.is_some());

        let log = std::fs::read_to_string(dir.path().join("errors.log"))?;
        assert!(log.contains("id=alpha"));
        assert!(log.contains("403"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fatal_failure_short_circuits_strategies() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (orchestrator, store, _cancel) = build(dir.path(), "1080x1920", fast_tuning()).await?;
        std::fs::write(dir.path().join("fatal_ids.txt"), "gone\n")?;
        let source = normalize_source("@creator");
        let out = dir.path().join("out");

        let (ok, fail) = orchestrator
            .download_batch(&source, vec![item("gone")], &out)
            .await?;
        assert_eq!((ok, fail), (0, 1));
        assert_eq!(
            store.get("@creator", "gone").await?.unwrap().status,
            VideoStatus::Failed
        );
        let log = std::fs::read_to_string(dir.path().join("errors.log"))?;
        assert!(log.contains("class=fatal"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn under_floor_artifacts_are_deleted_and_rejected() -> anyhow::Result<()> {
        let dir = tempdir()?;
        // Every strategy produces a 360p file; the floor rejects them all.
        let (orchestrator, store, _cancel) = build(dir.path(), "360x640", fast_tuning()).await?;
        let source = normalize_source("@creator");
        let out = dir.path().join("out");

        let (ok, fail) = orchestrator
            .download_batch(&source, vec![item("lowres")], &out)
            .await?;
        assert_eq!((ok, fail), (0, 1));

        let record = store.get("@creator", "lowres").await?.expect("record");
        assert_eq!(record.status, VideoStatus::Failed);
        // No under-floor artifact may survive as ambient garbage.
        let leftovers: Vec<_> = std::fs::read_dir(&out)?
            .flatten()
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".mp4")
            })
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn floor_zero_accepts_any_resolution() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut tuning = fast_tuning();
        tuning.quality_floor = 0;
        let (orchestrator, store, _cancel) = build(dir.path(), "360x640", tuning).await?;
        let source = normalize_source("@creator");

        let (ok, fail) = orchestrator
            .download_batch(&source, vec![item("lowres")], &dir.path().join("out"))
            .await?;
        assert_eq!((ok, fail), (1, 0));
        assert_eq!(
            store.get("@creator", "lowres").await?.unwrap().status,
            VideoStatus::Success
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancellation_stops_dispatch_before_new_items() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (orchestrator, store, cancel) = build(dir.path(), "1080x1920", fast_tuning()).await?;
        cancel.store(true, Ordering::Relaxed);
        let source = normalize_source("@creator");

        let (ok, fail) = orchestrator
            .download_batch(&source, vec![item("alpha"), item("bravo")], &dir.path().join("out"))
            .await?;
        assert_eq!((ok, fail), (0, 0));
        assert!(store.get("@creator", "alpha").await?.is_none());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn numbering_continues_above_existing_files() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (orchestrator, store, _cancel) = build(dir.path(), "1080x1920", fast_tuning()).await?;
        let out = dir.path().join("out");
        std::fs::create_dir_all(&out)?;
        std::fs::write(out.join("0009 - previous - run.mp4"), "x")?;
        let source = normalize_source("@creator");

        let (ok, _) = orchestrator
            .download_batch(&source, vec![item("alpha")], &out)
            .await?;
        assert_eq!(ok, 1);
        let record = store.get("@creator", "alpha").await?.unwrap();
        assert!(record.file_path.unwrap().contains("0010 - "));
        Ok(())
    }
}
