#![forbid(unsafe_code)]

//! Post-download sweep over the acquired library: re-checks `success`
//! records against duration bounds and hashtag rules, optionally deleting
//! the offenders' files and marking them `deleted` in the store.

use anyhow::{Context, Result, bail};
use clipvault_tools::config::{RuntimeOverrides, resolve_runtime_paths};
use clipvault_tools::filter::{DurationBounds, TagMode, sweep_library};
use clipvault_tools::probe::MediaProber;
use clipvault_tools::security::ensure_not_root;
use clipvault_tools::store::DedupStore;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
struct SweepArgs {
    db_path: Option<PathBuf>,
    output_root: Option<PathBuf>,
    min_duration: Option<u64>,
    max_duration: Option<u64>,
    tags: Vec<String>,
    tag_mode: TagMode,
    delete: bool,
}

impl SweepArgs {
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
            db_path: None,
            output_root: None,
            min_duration: None,
            max_duration: None,
            tags: Vec::new(),
            tag_mode: TagMode::All,
            delete: false,
        };
        let mut args = iter.into_iter();

        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--db=") {
                parsed.db_path = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--output=") {
                parsed.output_root = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--min-duration=") {
                parsed.min_duration = Some(Self::parse_seconds(value, "--min-duration")?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--max-duration=") {
                parsed.max_duration = Some(Self::parse_seconds(value, "--max-duration")?);
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

            match arg.as_str() {
                "--db" => parsed.db_path = Some(PathBuf::from(Self::value(&mut args, &arg)?)),
                "--output" => {
                    parsed.output_root = Some(PathBuf::from(Self::value(&mut args, &arg)?))
                }
                "--min-duration" => {
                    parsed.min_duration =
                        Some(Self::parse_seconds(&Self::value(&mut args, &arg)?, "--min-duration")?)
                }
                "--max-duration" => {
                    parsed.max_duration =
                        Some(Self::parse_seconds(&Self::value(&mut args, &arg)?, "--max-duration")?)
                }
                "--tags" => parsed.tags = Self::parse_tags(&Self::value(&mut args, &arg)?),
                "--tag-mode" => parsed.tag_mode = TagMode::parse(&Self::value(&mut args, &arg)?)?,
                "--delete" => parsed.delete = true,
                _ if arg.starts_with('-') => bail!("unknown argument: {arg}"),
                _ => bail!("unexpected positional argument: {arg}"),
            }
        }

        if parsed.min_duration.is_none() && parsed.max_duration.is_none() && parsed.tags.is_empty()
        {
            bail!(
                "Usage: filter_library [--db <path>] [--output <dir>] [--delete]\n                      [--min-duration SECS] [--max-duration SECS]\n                      [--tags a,b] [--tag-mode any|all]\n\nAt least one criterion (duration bound or tag set) is required."
            );
        }
        if let (Some(min), Some(max)) = (parsed.min_duration, parsed.max_duration)
            && min > max
        {
            bail!("--min-duration must not exceed --max-duration");
        }
        Ok(parsed)
    }

    fn value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
        args.next()
            .ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))
    }

    fn parse_seconds(value: &str, flag: &str) -> Result<u64> {
        value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{flag} expects seconds, got {value:?}"))
    }

    fn parse_tags(value: &str) -> Vec<String> {
        value
            .split(',')
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty())
            .collect()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    ensure_not_root("filter_library")?;
    let args = SweepArgs::parse()?;

    let paths = resolve_runtime_paths(RuntimeOverrides {
        output_root: args.output_root.clone(),
        db_path: args.db_path.clone(),
        ..RuntimeOverrides::default()
    })?;

    let bounds = DurationBounds {
        min_seconds: args.min_duration,
        max_seconds: args.max_duration,
    };
    let prober = MediaProber::new();
    if bounds.is_active() {
        prober
            .ensure_available()
            .context("duration bounds need a working ffprobe")?;
    }

    println!("===================================");
    println!("Clipvault Library Sweep");
    println!("===================================");
    println!("Database: {}", paths.db_path.display());
    if bounds.is_active() {
        println!(
            "Duration: {:?}..{:?} seconds",
            args.min_duration, args.max_duration
        );
    }
    if !args.tags.is_empty() {
        println!("Tags: {:?}", args.tags);
    }
    println!(
        "Mode: {}",
        if args.delete {
            "delete offenders"
        } else {
            "report only"
        }
    );
    println!();

    let store = DedupStore::open(&paths.db_path).await?;
    let stats = sweep_library(
        &store,
        &prober,
        bounds,
        &args.tags,
        args.tag_mode,
        args.delete,
    )
    .await?;

    println!("Checked: {}", stats.checked);
    println!("Kept: {}", stats.kept);
    if args.delete {
        println!("Deleted: {}", stats.deleted);
    } else {
        println!("Flagged: {}", stats.flagged);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_require_at_least_one_criterion() {
        let err = SweepArgs::from_slice(&["--delete"]).unwrap_err();
        assert!(err.to_string().contains("Usage"));
    }

    #[test]
    fn args_parse_duration_bounds_and_tags() {
        let args = SweepArgs::from_slice(&[
            "--min-duration=10",
            "--max-duration",
            "60",
            "--tags",
            "#shorts",
            "--tag-mode=any",
            "--delete",
        ])
        .unwrap();
        assert_eq!(args.min_duration, Some(10));
        assert_eq!(args.max_duration, Some(60));
        assert_eq!(args.tags, vec!["#shorts"]);
        assert_eq!(args.tag_mode, TagMode::Any);
        assert!(args.delete);
    }

    #[test]
    fn args_reject_inverted_bounds() {
        let err =
            SweepArgs::from_slice(&["--min-duration=60", "--max-duration=10"]).unwrap_err();
        assert!(err.to_string().contains("must not exceed"));
    }

    #[test]
    fn args_reject_unknown_flags() {
        let err = SweepArgs::from_slice(&["--tags=a", "--bogus"]).unwrap_err();
        assert!(err.to_string().contains("unknown argument"));
    }
}
