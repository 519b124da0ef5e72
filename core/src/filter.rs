/*
 * filter.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Phineas, a store-and-forward ebXML messaging node.
 *
 * Phineas is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Phineas is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Phineas.  If not, see <http://www.gnu.org/licenses/>.
 */

//! External payload filters.
//!
//! A filter command reads the payload on stdin and writes the transformed
//! payload on stdout, unless the command line carries `$in`/`$out`
//! placeholders, which are substituted with temporary file names. stderr
//! is captured and reported to the caller; a filter that outlives the
//! configured timeout is killed.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug)]
pub struct FilterError(String);

impl FilterError {
    fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for FilterError {}

/// Filter output: the transformed payload plus whatever the filter wrote
/// on stderr (empty when it stayed quiet).
pub struct FilterOutput {
    pub data: Vec<u8>,
    pub stderr: String,
}

fn temp_path(tag: char) -> PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEQ: AtomicU64 = AtomicU64::new(0);
    std::env::temp_dir().join(format!(
        "phineas-filter-{}{}-{}",
        tag,
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ))
}

/// Run `command` over `input`, waiting at most `timeout`.
pub async fn run(
    command: &str,
    input: &[u8],
    timeout: Duration,
) -> Result<FilterOutput, FilterError> {
    let mut cmd = command.to_string();
    let in_file = if cmd.contains("$in") {
        let path = temp_path('R');
        tokio::fs::write(&path, input)
            .await
            .map_err(|e| FilterError::new(format!("filter input file: {}", e)))?;
        cmd = cmd.replace("$in", &format!("\"{}\"", path.display()));
        Some(path)
    } else {
        None
    };
    let out_file = if cmd.contains("$out") {
        let path = temp_path('W');
        cmd = cmd.replace("$out", &format!("\"{}\"", path.display()));
        Some(path)
    } else {
        None
    };

    let mut argv = shell_split(&cmd);
    if argv.is_empty() {
        return Err(FilterError::new("empty filter command"));
    }
    let program = argv.remove(0);
    let mut child = Command::new(&program)
        .args(&argv)
        .stdin(if in_file.is_none() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(if out_file.is_none() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| FilterError::new(format!("can't start filter '{}': {}", program, e)))?;

    if in_file.is_none() {
        if let Some(mut stdin) = child.stdin.take() {
            let data = input.to_vec();
            tokio::spawn(async move {
                let _ = stdin.write_all(&data).await;
                let _ = stdin.shutdown().await;
            });
        }
    }

    let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;
    let output = match waited {
        Ok(result) => result.map_err(|e| FilterError::new(format!("filter wait: {}", e)))?,
        Err(_) => {
            cleanup(&in_file, &out_file).await;
            return Err(FilterError::new(format!(
                "filter '{}' timed out after {:?}",
                program, timeout
            )));
        }
    };

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !output.status.success() {
        cleanup(&in_file, &out_file).await;
        return Err(FilterError::new(format!(
            "filter '{}' exited {}: {}",
            program, output.status, stderr
        )));
    }
    let data = match &out_file {
        Some(path) => tokio::fs::read(path)
            .await
            .map_err(|e| FilterError::new(format!("filter output file: {}", e)))?,
        None => output.stdout,
    };
    cleanup(&in_file, &out_file).await;
    Ok(FilterOutput { data, stderr })
}

async fn cleanup(in_file: &Option<PathBuf>, out_file: &Option<PathBuf>) {
    if let Some(p) = in_file {
        let _ = tokio::fs::remove_file(p).await;
    }
    if let Some(p) = out_file {
        let _ = tokio::fs::remove_file(p).await;
    }
}

/// Split a command line on whitespace, honoring double quotes.
fn shell_split(cmd: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut quoted = false;
    for c in cmd.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !cur.is_empty() {
                    out.push(std::mem::take(&mut cur));
                }
            }
            c => cur.push(c),
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_quoted_arguments() {
        let args = shell_split("prog -f \"/tmp/a b\" x");
        assert_eq!(args, vec!["prog", "-f", "/tmp/a b", "x"]);
    }

    #[tokio::test]
    async fn pipes_through_cat() {
        let out = run("cat", b"The quick brown fox", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.data, b"The quick brown fox");
    }

    #[tokio::test]
    async fn substitutes_in_placeholder() {
        let out = run("cat $in", b"payload bytes", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.data, b"payload bytes");
    }

    #[tokio::test]
    async fn kills_overrunning_filter() {
        let err = run("sleep 30", b"", Duration::from_millis(200)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn reports_exit_failure() {
        let err = run("false", b"", Duration::from_secs(5)).await;
        assert!(err.is_err());
    }
}
