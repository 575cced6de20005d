#![forbid(unsafe_code)]

//! Local media prober, backed by ffprobe. Supplies the dimensions used by
//! the quality-floor check and the durations used by the library sweep.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

#[derive(Debug, Clone)]
pub struct MediaProber {
    program: PathBuf,
}

impl Default for MediaProber {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaProber {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("ffprobe"),
        }
    }

    /// Points the prober at an alternative executable. Tests inject shell
    /// stubs through this.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Runs `ffprobe -version` to fail loudly when the tool is missing.
    pub fn ensure_available(&self) -> Result<()> {
        let status = Command::new(&self.program)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => anyhow::bail!("ffprobe is installed but returned a failure status"),
            Err(err) => anyhow::bail!("ffprobe is not installed or not in PATH: {}", err),
        }
    }

    /// Width and height of the first video stream, or `None` when the file
    /// cannot be probed (callers decide whether that is acceptable).
    pub fn dimensions(&self, file: &Path) -> Result<Option<(u32, u32)>> {
        if !file.exists() {
            return Ok(None);
        }
        let output = Command::new(&self.program)
            .arg("-v")
            .arg("error")
            .arg("-select_streams")
            .arg("v:0")
            .arg("-show_entries")
            .arg("stream=width,height")
            .arg("-of")
            .arg("csv=s=x:p=0")
            .arg(file)
            .output()
            .with_context(|| format!("probing dimensions of {}", file.display()))?;
        if !output.status.success() {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let line = text.trim();
        let Some((w, h)) = line.split_once('x') else {
            return Ok(None);
        };
        match (w.trim().parse::<u32>(), h.trim().parse::<u32>()) {
            (Ok(w), Ok(h)) if w > 0 && h > 0 => Ok(Some((w, h))),
            _ => Ok(None),
        }
    }

    /// Container-level duration in whole seconds, or `None` on probe failure.
    pub fn duration_seconds(&self, file: &Path) -> Result<Option<u64>> {
        if !file.exists() {
            return Ok(None);
        }
        let output = Command::new(&self.program)
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(file)
            .output()
            .with_context(|| format!("probing duration of {}", file.display()))?;
        if !output.status.success() {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let Ok(seconds) = text.trim().parse::<f64>() else {
            return Ok(None);
        };
        Ok(Some(seconds.round() as u64))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use anyhow::Result;
    use std::path::{Path, PathBuf};

    /// Installs a fake ffprobe that reports fixed dimensions and duration.
    pub fn install_ffprobe_stub(dir: &Path, dims: &str, duration: &str) -> Result<PathBuf> {
        let script_path = dir.join("ffprobe");
        let script = format!(
            r#"#!/usr/bin/env bash
set -eu
for arg in "$@"; do
  if [[ "$arg" == "-version" ]]; then
    echo "ffprobe stub"
    exit 0
  fi
  if [[ "$arg" == "stream=width,height" ]]; then
    echo "{dims}"
    exit 0
  fi
  if [[ "$arg" == "format=duration" ]]; then
    echo "{duration}"
    exit 0
  fi
done
exit 1
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
}
