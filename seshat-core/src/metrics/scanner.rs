//! External batch line scanner.
//!
//! Metric evidence lines are found with ripgrep rather than re-reading
//! every log through serde: the scanner gets a regex and a batch of
//! files and returns the matching lines tagged with their file.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// One matched line
#[derive(Debug, Clone)]
pub struct ScanMatch {
    pub path: PathBuf,
    pub line: String,
}

/// Seam over the external scanner so metric computation can be tested
/// without a ripgrep binary on PATH.
pub trait LineScanner: Send + Sync {
    /// Scan `files` for `pattern`, returning every matching line.
    ///
    /// No matches is `Ok(vec![])`, not an error.
    fn scan(
        &self,
        pattern: &str,
        files: &[PathBuf],
    ) -> impl std::future::Future<Output = Result<Vec<ScanMatch>>> + Send;
}

/// ripgrep-backed scanner using `rg --json` output
pub struct RgScanner {
    program: String,
}

/// `rg --json` envelope; only `match` events matter
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RgEvent {
    Match { data: RgMatchData },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct RgMatchData {
    path: RgText,
    lines: RgText,
}

#[derive(Debug, Deserialize)]
struct RgText {
    text: Option<String>,
}

impl RgScanner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for RgScanner {
    fn default() -> Self {
        Self::new("rg")
    }
}

impl LineScanner for RgScanner {
    async fn scan(&self, pattern: &str, files: &[PathBuf]) -> Result<Vec<ScanMatch>> {
        if files.is_empty() {
            return Ok(vec![]);
        }

        let output = Command::new(&self.program)
            .arg("--json")
            .arg("--no-ignore")
            .arg("-e")
            .arg(pattern)
            .arg("--")
            .args(files)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Scanner(format!("failed to launch {}: {}", self.program, e)))?;

        // Exit code 1 means no matches; anything above is a real failure
        match output.status.code() {
            Some(0) | Some(1) => {}
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(Error::Scanner(format!(
                    "{} exited with {:?}: {}",
                    self.program,
                    code,
                    stderr.trim()
                )));
            }
        }

        let mut matches = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let Ok(event) = serde_json::from_str::<RgEvent>(line) else {
                continue;
            };
            if let RgEvent::Match { data } = event {
                let (Some(path), Some(text)) = (data.path.text, data.lines.text) else {
                    continue;
                };
                matches.push(ScanMatch {
                    path: PathBuf::from(path),
                    line: text.trim_end_matches('\n').to_string(),
                });
            }
        }

        Ok(matches)
    }
}
