#![forbid(unsafe_code)]

//! Wrapper around the external media fetcher (yt-dlp). All subprocess
//! invocations live here: flat listing, single-item metadata dumps, and the
//! actual download attempts, each bounded by a hard timeout.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use crate::retry::ErrorClass;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// One entry of a flat (no-download) playlist listing. Everything is
/// optional because providers omit fields freely in flat mode.
#[derive(Debug, Clone, Deserialize)]
pub struct FlatEntry {
    pub id: Option<String>,
    pub title: Option<String>,
    pub url: Option<String>,
    pub webpage_url: Option<String>,
    pub uploader: Option<String>,
    pub channel: Option<String>,
    pub upload_date: Option<String>,
    pub duration: Option<f64>,
    pub description: Option<String>,
}

/// Full single-item metadata dump. Only the fields the pipeline reads are
/// declared; older uploads may lack any of them.
#[derive(Debug, Clone, Deserialize)]
pub struct FullInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub fulltitle: Option<String>,
    pub description: Option<String>,
    pub upload_date: Option<String>,
    pub uploader: Option<String>,
    pub channel: Option<String>,
    pub webpage_url: Option<String>,
    pub duration: Option<f64>,
}

impl FullInfo {
    /// Caption text preference: full description, then title variants.
    pub fn caption_text(&self) -> Option<&str> {
        self.description
            .as_deref()
            .or(self.fulltitle.as_deref())
            .or(self.title.as_deref())
            .filter(|text| !text.is_empty())
    }
}

/// One configured combination of quality selector and client/network
/// options, attempted in fixed priority order per item.
#[derive(Debug, Clone)]
pub struct DownloadStrategy {
    pub name: &'static str,
    pub format: String,
    pub extra_args: Vec<String>,
}

/// Strategy ladder: highest quality first, progressively more permissive.
/// The floor constrains the selector where supported; the post-download
/// probe enforces it for the permissive fallbacks.
pub fn default_strategies(quality_floor: u32) -> Vec<DownloadStrategy> {
    let floor_selector = if quality_floor > 0 {
        format!("bv*[height>={quality_floor}]+ba/b[height>={quality_floor}]")
    } else {
        "bv*+ba/b".to_string()
    };
    vec![
        DownloadStrategy {
            name: "best-floor",
            format: floor_selector,
            extra_args: vec![
                "--add-header".to_string(),
                "Accept-Language: en-US,en;q=0.9".to_string(),
                "--user-agent".to_string(),
                BROWSER_USER_AGENT.to_string(),
            ],
        },
        DownloadStrategy {
            name: "best-any-ipv4",
            format: "bv*+ba/b".to_string(),
            extra_args: vec!["--force-ipv4".to_string(), "-N".to_string(), "1".to_string()],
        },
        DownloadStrategy {
            name: "premerged",
            format: "b".to_string(),
            extra_args: vec!["--force-ipv4".to_string()],
        },
    ]
}

/// Classifies fetcher diagnostics into the retry taxonomy. Unknown output
/// counts as transient so it consumes a backoff slot instead of aborting
/// the item.
pub fn classify_failure(diagnostic: &str) -> ErrorClass {
    const FATAL: &[&str] = &[
        "HTTP Error 404",
        "HTTP Error 410",
        "Video unavailable",
        "This video is private",
        "has been removed",
        "Unsupported URL",
        "Invalid URL",
        "is not a valid URL",
        "account has been terminated",
    ];
    const FORMAT: &[&str] = &["Requested format is not available"];
    const TRANSIENT: &[&str] = &[
        "HTTP Error 403",
        "HTTP Error 429",
        "HTTP Error 5",
        "rate limit",
        "rate-limit",
        "timed out",
        "timeout",
        "Connection reset",
        "Connection refused",
        "fragment",
        "Temporary failure",
        "Unable to connect",
    ];
    let lowered = diagnostic.to_lowercase();
    for pattern in FATAL {
        if lowered.contains(&pattern.to_lowercase()) {
            return ErrorClass::Fatal;
        }
    }
    for pattern in FORMAT {
        if lowered.contains(&pattern.to_lowercase()) {
            return ErrorClass::FormatUnavailable;
        }
    }
    for pattern in TRANSIENT {
        if lowered.contains(&pattern.to_lowercase()) {
            return ErrorClass::Transient;
        }
    }
    ErrorClass::Transient
}

#[derive(Debug, Clone)]
pub struct MediaFetcher {
    program: PathBuf,
}

impl Default for MediaFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaFetcher {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("yt-dlp"),
        }
    }

    /// Points the fetcher at an alternative executable. Tests inject shell
    /// stubs through this.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Runs `--version` to fail loudly when the fetcher is missing.
    pub fn ensure_available(&self) -> Result<()> {
        let status = Command::new(&self.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => bail!("media fetcher is installed but returned a failure status"),
            Err(err) => bail!("media fetcher is not installed or not in PATH: {}", err),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.program)
    }

    /// Flat listing of a profile/tag URL: one JSON object per stdout line.
    /// Unparseable lines are skipped with a warning rather than failing the
    /// whole listing.
    pub fn list_flat(
        &self,
        list_url: &str,
        max_items: Option<usize>,
        timeout: Duration,
    ) -> Result<Vec<FlatEntry>> {
        let mut command = self.command();
        command
            .arg("--flat-playlist")
            .arg("--dump-json")
            .arg("--no-warnings")
            .arg("--ignore-errors");
        if let Some(max) = max_items {
            command.arg("--playlist-end").arg(max.to_string());
        }
        command.arg(list_url);

        let output = run_with_timeout(command, timeout)
            .with_context(|| format!("listing {}", list_url))?;
        if !output.status.success() {
            bail!(
                "listing failed for {} (status {}): {}",
                list_url,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut entries = Vec::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<FlatEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    eprintln!("  Warning: skipping malformed listing entry: {err}");
                }
            }
        }
        Ok(entries)
    }

    /// Full metadata for one watch-page URL.
    pub fn fetch_info(&self, url: &str, timeout: Duration) -> Result<FullInfo> {
        let mut command = self.command();
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg(url);

        let output =
            run_with_timeout(command, timeout).with_context(|| format!("fetching metadata for {url}"))?;
        if !output.status.success() {
            bail!(
                "metadata command failed for {} (status {}): {}",
                url,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let info: FullInfo = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("deserializing metadata JSON for {url}"))?;
        Ok(info)
    }

    /// One download attempt with one strategy. On failure the error message
    /// carries the fetcher's stderr so `classify_failure` can pattern-match
    /// it.
    pub fn download(
        &self,
        url: &str,
        output_path: &Path,
        strategy: &DownloadStrategy,
        file_format: &str,
        timeout: Duration,
    ) -> Result<()> {
        let mut command = self.command();
        command
            .arg("--no-warnings")
            .arg("--quiet")
            .arg("--no-progress")
            .arg("--ignore-config")
            .arg("--no-playlist")
            .arg("--no-check-certificates")
            .arg("--no-cache-dir")
            .arg("--retries")
            .arg("3")
            .arg("--fragment-retries")
            .arg("3")
            .arg("--retry-sleep")
            .arg("5")
            .arg("--merge-output-format")
            .arg(file_format)
            .arg("-f")
            .arg(&strategy.format);
        for arg in &strategy.extra_args {
            command.arg(arg);
        }
        command
            .arg("--output")
            .arg(output_path.as_os_str())
            .arg(url);

        let output = run_with_timeout(command, timeout)
            .with_context(|| format!("downloading {url} via {}", strategy.name))?;
        if !output.status.success() {
            bail!(
                "download failed for {} via {} (status {}): {}",
                url,
                strategy.name,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Waits for a child process, killing it once the deadline passes. The
/// fetcher occasionally wedges on stalled connections; a hard kill is the
/// only reliable bound.
fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<Output> {
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawning media fetcher")?;
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait().context("waiting for media fetcher")? {
            Some(_) => return child.wait_with_output().context("collecting fetcher output"),
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    bail!("fetcher timed out after {}s", timeout.as_secs());
                }
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use anyhow::Result;
    use std::path::{Path, PathBuf};

    /// Installs a fake fetcher covering every invocation mode the pipeline
    /// uses: flat listing, metadata dumps, and downloads that materialize a
    /// file at the requested output path.
    ///
    /// Failure injection via control files next to the script:
    /// - `fail_ids.txt`: one video id per line whose download exits 1 with a
    ///   403 on stderr (transient).
    /// - `fatal_ids.txt`: ids whose download exits 1 with a 404 (fatal).
    pub fn install_fetcher_stub(dir: &Path, entries_json: &str) -> Result<PathBuf> {
        let script_path = dir.join("yt-dlp");
        let script = format!(
            r#"#!/usr/bin/env bash
set -eu
args=("$@")
output=""
url=""
prev=""
for a in "$@"; do
  if [[ "$prev" == "--output" ]]; then
    output="$a"
  fi
  prev="$a"
  url="$a"
done

entries='{entries_json}'

if printf '%s\n' "${{args[@]}}" | grep -q -- '--version'; then
  echo "stub 2026.01.01"
  exit 0
fi

if printf '%s\n' "${{args[@]}}" | grep -q -- '--flat-playlist'; then
  printf '%s\n' "$entries"
  exit 0
fi

if printf '%s\n' "${{args[@]}}" | grep -q -- '--dump-single-json'; then
  vid="${{url##*/}}"
  vid="${{vid##*=}}"
  printf '{{"id":"%s","title":"Title %s","description":"Caption for %s #shorts #demo","upload_date":"20260101","uploader":"Creator","webpage_url":"%s","duration":30}}\n' "$vid" "$vid" "$vid" "$url"
  exit 0
fi

here="$(cd "$(dirname "$0")" && pwd)"
vid="${{url##*/}}"
vid="${{vid##*=}}"
if [[ -f "$here/fail_ids.txt" ]] && grep -qx "$vid" "$here/fail_ids.txt"; then
  echo "ERROR: unable to download video data: HTTP Error 403: Forbidden" >&2
  exit 1
fi
if [[ -f "$here/fatal_ids.txt" ]] && grep -qx "$vid" "$here/fatal_ids.txt"; then
  echo "ERROR: HTTP Error 404: Not Found" >&2
  exit 1
fi
mkdir -p "$(dirname "$output")"
head -c 4096 /dev/zero > "$output"
exit 0
"#
        );
        std::fs::write(&script_path, script)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script_path)?.permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script_path, perms)?;
        }
        Ok(script_path)
    }

    /// Flat-listing payload with predictable ids `alpha`..`echo`.
    pub fn five_entry_listing() -> String {
        [
            r#"{"id":"alpha","title":"Alpha","url":"https://clips.example/v/alpha","uploader":"Creator","upload_date":"20260101"}"#,
            r#"{"id":"bravo","title":"Bravo","url":"https://clips.example/v/bravo","uploader":"Creator","upload_date":"20260102"}"#,
            r#"{"id":"charlie","title":"Charlie","url":"https://clips.example/v/charlie","uploader":"Creator","upload_date":"20260103"}"#,
            r#"{"id":"delta","title":"Delta","url":"https://clips.example/v/delta","uploader":"Creator","upload_date":"20260104"}"#,
            r#"{"id":"echo","title":"Echo","url":"https://clips.example/v/echo","uploader":"Creator","upload_date":"20260105"}"#,
        ]
        .join("\n")
    }
}
