#![forbid(unsafe_code)]

//! Command-line driver for the bulk acquisition pipeline: scans creator
//! profiles or tag pages, filters candidates, downloads the survivors with
//! the bounded worker pool, and prints a per-source summary.

use anyhow::{Context, Result, bail};
use clipvault_tools::config::{PipelineTuning, RuntimeOverrides, resolve_runtime_paths};
use clipvault_tools::fetcher::MediaFetcher;
use clipvault_tools::filter::TagMode;
use clipvault_tools::lister::{SourceSpec, normalize_source};
use clipvault_tools::pipeline::{FilterRules, PipelineContext};
use clipvault_tools::probe::MediaProber;
use clipvault_tools::security::ensure_not_root;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

#[derive(Debug, Clone)]
struct BulkArgs {
    sources: Vec<String>,
    sources_file: Option<PathBuf>,
    output_root: Option<PathBuf>,
    db_path: Option<PathBuf>,
    max_items: Option<usize>,
    days: Option<u32>,
    tags: Vec<String>,
    tag_mode: TagMode,
    workers: Option<usize>,
    quality_floor: Option<u32>,
    file_format: Option<String>,
    retry_failed: bool,
}

impl BulkArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(env::args().skip(1))
    }

    #[cfg(test)]
    fn from_slice(values: &[&str]) -> Result<Self> {
        Self::from_iter(values.iter().map(|value| value.to_string()))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self {
            sources: Vec::new(),
            sources_file: None,
            output_root: None,
            db_path: None,
            max_items: None,
            days: None,
            tags: Vec::new(),
            tag_mode: TagMode::Any,
            workers: None,
            quality_floor: None,
            file_format: None,
            retry_failed: false,
        };
        let mut args = iter.into_iter();

        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--sources-file=") {
                parsed.sources_file = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--output=") {
                parsed.output_root = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--db=") {
                parsed.db_path = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--max-items=") {
                parsed.max_items = Some(Self::parse_count(value, "--max-items")?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--days=") {
                parsed.days = Some(Self::parse_count(value, "--days")? as u32);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--tags=") {
                parsed.tags = Self::parse_tags(value);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--tag-mode=") {
                parsed.tag_mode = TagMode::parse(value)?;
                continue;
            }
            if let Some(value) = arg.strip_prefix("--workers=") {
                parsed.workers = Some(Self::parse_count(value, "--workers")?.max(1));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--quality-floor=") {
                parsed.quality_floor = Some(Self::parse_count(value, "--quality-floor")? as u32);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--format=") {
                parsed.file_format = Some(Self::parse_format(value)?);
                continue;
            }

            match arg.as_str() {
                "--sources-file" => parsed.sources_file = Some(PathBuf::from(Self::value(&mut args, &arg)?)),
                "--output" => parsed.output_root = Some(PathBuf::from(Self::value(&mut args, &arg)?)),
                "--db" => parsed.db_path = Some(PathBuf::from(Self::value(&mut args, &arg)?)),
                "--max-items" => {
                    parsed.max_items =
                        Some(Self::parse_count(&Self::value(&mut args, &arg)?, "--max-items")?)
                }
                "--days" => {
                    parsed.days =
                        Some(Self::parse_count(&Self::value(&mut args, &arg)?, "--days")? as u32)
                }
                "--tags" => parsed.tags = Self::parse_tags(&Self::value(&mut args, &arg)?),
                "--tag-mode" => parsed.tag_mode = TagMode::parse(&Self::value(&mut args, &arg)?)?,
                "--workers" => {
                    parsed.workers =
                        Some(Self::parse_count(&Self::value(&mut args, &arg)?, "--workers")?.max(1))
                }
                "--quality-floor" => {
                    parsed.quality_floor = Some(
                        Self::parse_count(&Self::value(&mut args, &arg)?, "--quality-floor")? as u32,
                    )
                }
                "--format" => parsed.file_format = Some(Self::parse_format(&Self::value(&mut args, &arg)?)?),
                "--retry-failed" => parsed.retry_failed = true,
                _ if arg.starts_with('-') => bail!("unknown argument: {arg}"),
                _ => parsed.sources.push(arg),
            }
        }

        if parsed.sources.is_empty() && parsed.sources_file.is_none() {
            bail!(
                "Usage: bulk_download [options] <source>...\n       bulk_download [options] --sources-file <path>\n\nSources are profile handles (@user), tags (#tag), or full URLs.\nOptions: --output <dir> --db <path> --max-items N --days N\n         --tags a,b --tag-mode any|all --workers N\n         --quality-floor N --format mp4|webm --retry-failed"
            );
        }
        Ok(parsed)
    }

    fn value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
        args.next()
            .ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))
    }

    fn parse_count(value: &str, flag: &str) -> Result<usize> {
        value
            .trim()
            .parse::<usize>()
            .with_context(|| format!("{flag} expects a number, got {value:?}"))
    }

    fn parse_tags(value: &str) -> Vec<String> {
        value
            .split(',')
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty())
            .collect()
    }

    fn parse_format(value: &str) -> Result<String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp4" => Ok("mp4".to_string()),
            "webm" => Ok("webm".to_string()),
            other => bail!("unsupported format: {other} (expected mp4|webm)"),
        }
    }
}

/// Reads one source per line, skipping blanks and `#` comments — except
/// lines that are exactly a hashtag source (`#tag`), which are kept.
fn read_sources_file(path: &PathBuf) -> Result<Vec<String>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut sources = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix('#') {
            // A lone `#tag` token is a tag source; anything else is a comment.
            if rest.is_empty() || rest.contains(char::is_whitespace) {
                continue;
            }
        }
        sources.push(trimmed.to_string());
    }
    Ok(sources)
}

#[tokio::main]
async fn main() -> Result<()> {
    ensure_not_root("bulk_download")?;
    let args = BulkArgs::parse()?;

    let paths = resolve_runtime_paths(RuntimeOverrides {
        output_root: args.output_root.clone(),
        db_path: args.db_path.clone(),
        ..RuntimeOverrides::default()
    })?;

    let mut tuning = PipelineTuning::default();
    if let Some(workers) = args.workers {
        tuning.download_workers = workers;
    }
    if let Some(floor) = args.quality_floor {
        tuning.quality_floor = floor;
    }
    if let Some(format) = &args.file_format {
        tuning.file_format = format.clone();
    }

    let fetcher = MediaFetcher::new();
    fetcher.ensure_available()?;
    let prober = MediaProber::new();
    if tuning.quality_floor > 0
        && let Err(err) = prober.ensure_available()
    {
        eprintln!("  Warning: {err:#}; disabling the quality floor for this run");
        tuning.quality_floor = 0;
    }

    let mut raw_sources = args.sources.clone();
    if let Some(file) = &args.sources_file {
        raw_sources.extend(read_sources_file(file)?);
    }
    let sources: Vec<SourceSpec> = raw_sources.iter().map(|s| normalize_source(s)).collect();
    if sources.is_empty() {
        bail!("no sources to scan");
    }

    let rules = FilterRules {
        required_tags: args.tags.clone(),
        tag_mode: args.tag_mode,
        days_window: args.days,
    };

    println!("===================================");
    println!("Clipvault Bulk Downloader");
    println!("===================================");
    println!("Sources: {}", sources.len());
    println!("Output root: {}", paths.output_root.display());
    println!("Database: {}", paths.db_path.display());
    if !rules.required_tags.is_empty() {
        println!(
            "Hashtag rule: {:?} ({})",
            rules.required_tags,
            match rules.tag_mode {
                TagMode::Any => "any",
                TagMode::All => "all",
            }
        );
    }
    if let Some(days) = rules.days_window {
        println!("Date window: last {days} day(s)");
    }

    let ctx = PipelineContext::new(paths, tuning, fetcher, prober).await?;

    // First Ctrl-C drains in-flight items and stops dispatch; workers
    // finish their current clip so no half-written pair is left behind.
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            eprintln!("Interrupt received: finishing in-flight items, no new dispatch.");
            cancel.store(true, Ordering::Relaxed);
        }
    });

    let summary = ctx
        .run_batch(&sources, &rules, args.max_items, args.retry_failed)
        .await?;
    summary.print();
    println!();
    println!("Error log: {}", ctx.log.path().display());

    Ok(())
}
