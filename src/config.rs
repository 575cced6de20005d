#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::time::Duration;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_OUTPUT_ROOT: &str = "downloads";
pub const DB_FILE: &str = "clipvault.db";
pub const ERROR_LOG_FILE: &str = "download_errors.log";

/// Resolved filesystem locations for one pipeline instance.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub output_root: PathBuf,
    pub db_path: PathBuf,
    pub error_log_path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub output_root: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn load_runtime_paths() -> Result<RuntimePaths> {
    resolve_runtime_paths(RuntimeOverrides::default())
}

/// Resolution order for every location: CLI override, process environment,
/// `.env` file, built-in default. The DB and error log default to living
/// inside the output root so one directory holds a complete archive.
pub fn resolve_runtime_paths(overrides: RuntimeOverrides) -> Result<RuntimePaths> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_paths_with_overrides(&file_vars, env_var_string, overrides)
}

fn build_runtime_paths_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimePaths> {
    let output_root = overrides
        .output_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("CLIPVAULT_OUTPUT_ROOT", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_OUTPUT_ROOT.to_string());
    let output_root = PathBuf::from(output_root);

    let db_path = overrides
        .db_path
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("CLIPVAULT_DB_PATH", file_vars, &env_lookup))
        .map(PathBuf::from)
        .unwrap_or_else(|| output_root.join(DB_FILE));

    let error_log_path = lookup_value("CLIPVAULT_ERROR_LOG", file_vars, &env_lookup)
        .map(PathBuf::from)
        .unwrap_or_else(|| output_root.join(ERROR_LOG_FILE));

    Ok(RuntimePaths {
        output_root,
        db_path,
        error_log_path,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

/// Knobs for the acquisition pipeline. Every field has a conservative
/// default; binaries override individual fields from CLI flags.
#[derive(Debug, Clone)]
pub struct PipelineTuning {
    /// Size of the download worker pool.
    pub download_workers: usize,
    /// Size of the (cheaper, smaller) metadata enrichment pool.
    pub enrich_workers: usize,
    /// Transient-failure budget per item, across all strategies.
    pub max_transient_attempts: u32,
    /// First backoff delay after a transient failure.
    pub backoff_base: Duration,
    /// Ceiling for any single backoff delay.
    pub backoff_cap: Duration,
    /// Minimum acceptable short dimension of a downloaded file; 0 disables.
    pub quality_floor: u32,
    /// Files smaller than this are treated as corrupt downloads.
    pub min_file_bytes: u64,
    /// Container format passed to the fetcher's merge step.
    pub file_format: String,
    /// How many dateless items the enricher will backfill per source.
    pub enrich_cap: usize,
    pub listing_timeout: Duration,
    pub enrich_timeout: Duration,
    pub download_timeout: Duration,
    /// Abort the whole run after this many consecutive filesystem errors.
    pub max_consecutive_fs_errors: u32,
}

impl Default for PipelineTuning {
    fn default() -> Self {
        Self {
            download_workers: 3,
            enrich_workers: 2,
            max_transient_attempts: 5,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
            quality_floor: 720,
            min_file_bytes: 1000,
            file_format: "mp4".to_string(),
            enrich_cap: 25,
            listing_timeout: Duration::from_secs(60),
            enrich_timeout: Duration::from_secs(15),
            download_timeout: Duration::from_secs(900),
            max_consecutive_fs_errors: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn paths_from(contents: &str) -> RuntimePaths {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_paths_with_overrides(&vars, |_| None, RuntimeOverrides::default()).unwrap()
    }

    #[test]
    fn defaults_apply_when_nothing_is_configured() {
        let paths = paths_from("");
        assert_eq!(paths.output_root, PathBuf::from(DEFAULT_OUTPUT_ROOT));
        assert_eq!(
            paths.db_path,
            PathBuf::from(DEFAULT_OUTPUT_ROOT).join(DB_FILE)
        );
        assert_eq!(
            paths.error_log_path,
            PathBuf::from(DEFAULT_OUTPUT_ROOT).join(ERROR_LOG_FILE)
        );
    }

    #[test]
    fn env_file_sets_output_root_and_derived_paths() {
        let paths = paths_from("CLIPVAULT_OUTPUT_ROOT=\"/clips\"\n");
        assert_eq!(paths.output_root, PathBuf::from("/clips"));
        assert_eq!(paths.db_path, PathBuf::from("/clips").join(DB_FILE));
    }

    #[test]
    fn explicit_db_path_wins_over_derived_default() {
        let paths =
            paths_from("CLIPVAULT_OUTPUT_ROOT=\"/clips\"\nCLIPVAULT_DB_PATH=\"/state/dedup.db\"\n");
        assert_eq!(paths.db_path, PathBuf::from("/state/dedup.db"));
    }

    #[test]
    fn overrides_win_over_file_and_env() {
        let cfg = make_config("CLIPVAULT_OUTPUT_ROOT=\"/file\"\n");
        let vars = read_env_file(cfg.path()).unwrap();
        let paths = build_runtime_paths_with_overrides(
            &vars,
            |key| {
                if key == "CLIPVAULT_OUTPUT_ROOT" {
                    Some("/env".to_string())
                } else {
                    None
                }
            },
            RuntimeOverrides {
                output_root: Some(PathBuf::from("/override")),
                ..RuntimeOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(paths.output_root, PathBuf::from("/override"));
    }

    #[test]
    fn env_lookup_wins_over_file_value() {
        let cfg = make_config("CLIPVAULT_OUTPUT_ROOT=\"/file\"\n");
        let vars = read_env_file(cfg.path()).unwrap();
        let paths = build_runtime_paths_with_overrides(
            &vars,
            |key| {
                if key == "CLIPVAULT_OUTPUT_ROOT" {
                    Some("/env".to_string())
                } else {
                    None
                }
            },
            RuntimeOverrides::default(),
        )
        .unwrap();
        assert_eq!(paths.output_root, PathBuf::from("/env"));
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export CLIPVAULT_OUTPUT_ROOT="/clips"
            CLIPVAULT_DB_PATH='/state/db.sqlite'
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("CLIPVAULT_OUTPUT_ROOT").unwrap(), "/clips");
        assert_eq!(vars.get("CLIPVAULT_DB_PATH").unwrap(), "/state/db.sqlite");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn tuning_defaults_are_sane() {
        let tuning = PipelineTuning::default();
        assert!(tuning.download_workers >= 1);
        assert!(tuning.enrich_workers <= tuning.download_workers);
        assert!(tuning.backoff_base < tuning.backoff_cap);
    }
}
