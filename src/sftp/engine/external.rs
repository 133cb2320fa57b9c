//! External rsync engine
//!
//! Delegates a whole transfer to an `rsync` subprocess over ssh, re-using
//! the transport's credentials. In-memory key material is staged in a
//! temporary file whose permissions are restricted before the key bytes
//! are written; the file is removed when the run ends. Subprocess stdout
//! is parsed for rate / percentage and surfaced through the progress
//! callback, throttled to one parsed update per 100 ms.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ProgressEvent, ProgressFn};
use crate::sftp::control::CancelToken;
use crate::sftp::error::TransferError;
use crate::sftp::path_utils::to_slash;
use crate::ssh::SshConfig;

const UPDATE_THROTTLE: Duration = Duration::from_millis(100);

pub struct RsyncEngine {
    config: SshConfig,
}

impl RsyncEngine {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    pub async fn upload(
        &self,
        token: &CancelToken,
        local_path: &str,
        remote_path: &str,
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<(), TransferError> {
        self.run(token, local_path, remote_path, true, progress).await
    }

    pub async fn download(
        &self,
        token: &CancelToken,
        remote_path: &str,
        local_path: &str,
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<(), TransferError> {
        self.run(token, remote_path, local_path, false, progress).await
    }

    async fn run(
        &self,
        token: &CancelToken,
        src: &str,
        dest: &str,
        upload: bool,
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<(), TransferError> {
        // Key material staged for the subprocess; dropped (removed) on
        // every exit path of this function.
        let key_file = match self.config.auth.key_bytes() {
            Some(pem) => Some(write_temp_key(pem)?),
            None => None,
        };
        let key_path = key_file
            .as_ref()
            .map(|f| f.path().to_string_lossy().to_string());

        let ssh_cmd = build_ssh_command(self.config.port, key_path.as_deref());
        let remote_prefix = format!("{}@{}:", self.config.username, self.config.host);

        let (source, destination) = if upload {
            (local_arg(src), format!("{}{}", remote_prefix, dest))
        } else {
            (format!("{}{}", remote_prefix, src), local_arg(dest))
        };

        debug!("rsync {} -> {} (-e {})", source, destination, ssh_cmd);

        let mut cmd = Command::new("rsync");
        cmd.arg("-avz")
            .arg("--info=progress2")
            .arg("-e")
            .arg(&ssh_cmd)
            .arg(&source)
            .arg(&destination)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group, so a terminal SIGINT aimed at us does not
        // race the engine's own teardown of the subprocess
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TransferError::External("rsync binary not found".into())
            } else {
                TransferError::Io(e)
            }
        })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransferError::External("rsync stdout unavailable".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransferError::External("rsync stderr unavailable".into()))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        });

        // Stream stdout through the line splitter until EOF or cancel
        let mut splitter = LineSplitter::new();
        let mut buf = [0u8; 4096];
        // Backdated so the first parsed line is delivered immediately
        let mut last_update = Instant::now()
            .checked_sub(UPDATE_THROTTLE)
            .unwrap_or_else(Instant::now);

        let stream_result: Result<(), TransferError> = loop {
            let n = tokio::select! {
                read = stdout.read(&mut buf) => match read {
                    Ok(n) => n,
                    Err(e) => break Err(TransferError::Io(e)),
                },
                _ = token.cancelled() => break Err(TransferError::Cancelled),
            };
            if n == 0 {
                break Ok(());
            }

            let mut callback_err = None;
            for line in splitter.push(&buf[..n]) {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let parsed = parse_progress_line(line);
                let is_progress = parsed.speed.is_some() || parsed.percent.is_some();
                if is_progress {
                    if last_update.elapsed() < UPDATE_THROTTLE {
                        continue;
                    }
                    last_update = Instant::now();
                }

                if let Some(progress) = progress {
                    if let Err(e) = progress(ProgressEvent::Line {
                        line,
                        speed: parsed.speed,
                        percent: parsed.percent,
                    }) {
                        callback_err = Some(e);
                        break;
                    }
                }
            }
            if let Some(e) = callback_err {
                break Err(e);
            }
        };

        if let Err(e) = stream_result {
            let _ = child.start_kill();
            let _ = child.wait().await;
            let _ = stderr_task.await;
            return Err(e);
        }

        let status = tokio::select! {
            status = child.wait() => status.map_err(TransferError::Io)?,
            _ = token.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                let _ = stderr_task.await;
                return Err(TransferError::Cancelled);
            }
        };

        let stderr_text = stderr_task.await.unwrap_or_default();

        if token.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if !status.success() {
            warn!("rsync failed: {}", stderr_text.trim());
            return Err(TransferError::External(format!(
                "rsync exited with {}: {}",
                status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".into()),
                stderr_text.trim()
            )));
        }

        Ok(())
    }
}

/// Stage in-memory key material as an identity file for the subprocess.
///
/// Permissions are restricted to owner-only before the key bytes reach
/// disk; ssh itself also refuses group/world-readable identity files.
fn write_temp_key(pem: &[u8]) -> Result<NamedTempFile, TransferError> {
    use std::io::Write;

    let file = tempfile::Builder::new()
        .prefix("skiff-rsync-")
        .suffix(".pem")
        .tempfile()
        .map_err(TransferError::Io)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(TransferError::Io)?;
    }

    file.as_file().write_all(pem).map_err(TransferError::Io)?;
    file.as_file().sync_all().map_err(TransferError::Io)?;
    Ok(file)
}

fn build_ssh_command(port: u16, key_path: Option<&str>) -> String {
    let mut cmd = format!("ssh -p {}", port);
    if let Some(key) = key_path {
        if cfg!(windows) {
            cmd.push_str(&format!(" -i \"{}\"", to_slash(key)));
        } else {
            cmd.push_str(&format!(" -i '{}'", key));
        }
    }
    cmd.push_str(" -o StrictHostKeyChecking=no");
    cmd
}

/// Local paths in rsync argv use forward slashes so cygwin/msys builds
/// accept them on Windows
fn local_arg(path: &str) -> String {
    if cfg!(windows) {
        to_slash(path)
    } else {
        path.to_string()
    }
}

/// Split a byte stream into lines on `\n` *and* `\r` — rsync redraws its
/// progress line with bare carriage returns.
struct LineSplitter {
    partial: Vec<u8>,
}

impl LineSplitter {
    fn new() -> Self {
        Self { partial: Vec::new() }
    }

    fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in data {
            if byte == b'\n' || byte == b'\r' {
                if !self.partial.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.partial).into_owned());
                    self.partial.clear();
                }
            } else {
                self.partial.push(byte);
            }
        }
        lines
    }
}

/// Anything we could pull out of one rsync output line
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub(crate) struct ParsedProgress {
    pub speed: Option<f64>,
    pub percent: Option<u8>,
}

/// Parse one rsync `--info=progress2` line.
///
/// Recognizes `<rate>/s` fields, `<NN>%` byte percentages, and the
/// `ir-chk=remaining/total` file counter; the counter wins over the byte
/// percentage because it keeps moving when totals are unknown.
pub(crate) fn parse_progress_line(line: &str) -> ParsedProgress {
    if !line.contains("/s") {
        return ParsedProgress::default();
    }

    let mut parsed = ParsedProgress::default();
    let mut counter_percent: Option<u8> = None;

    for field in line.split_whitespace() {
        if let Some(rate) = field.strip_suffix("/s") {
            if let Some(speed) = parse_rate(rate) {
                if speed > 0.0 {
                    parsed.speed = Some(speed);
                }
            }
        }

        if let Some(pct) = field.strip_suffix('%') {
            if let Ok(p) = pct.parse::<u8>() {
                if p > 0 {
                    parsed.percent = Some(p.min(100));
                }
            }
        }

        // ir-chk=1625/1649 means 1649-1625=24 files done out of 1649
        if let Some(rest) = field.strip_prefix("ir-chk=") {
            let rest = rest.trim_end_matches(')');
            if let Some((remaining, total)) = rest.split_once('/') {
                if let (Ok(remaining), Ok(total)) =
                    (remaining.parse::<u64>(), total.parse::<u64>())
                {
                    if total > 0 && remaining <= total {
                        counter_percent = Some(((total - remaining) * 100 / total) as u8);
                    }
                }
            }
        }
    }

    if let Some(p) = counter_percent {
        parsed.percent = Some(p);
    }
    parsed
}

/// Convert an rsync rate field (`"69.68MB"`, `"1,234kB"`) to bytes/sec.
///
/// rsync prints binary multiples with uppercase prefixes and decimal
/// kilobytes as `kB`.
pub(crate) fn parse_rate(s: &str) -> Option<f64> {
    let s = s.trim();

    let (number, multiplier) = if let Some(n) = s.strip_suffix("GB") {
        (n, 1024.0 * 1024.0 * 1024.0)
    } else if let Some(n) = s.strip_suffix("MB") {
        (n, 1024.0 * 1024.0)
    } else if let Some(n) = s.strip_suffix("KB") {
        (n, 1024.0)
    } else if let Some(n) = s.strip_suffix("kB") {
        (n, 1000.0)
    } else if let Some(n) = s.strip_suffix('B') {
        (n, 1.0)
    } else {
        (s, 1.0)
    };

    number
        .replace(',', "")
        .parse::<f64>()
        .ok()
        .map(|v| v * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rate_units() {
        assert_eq!(parse_rate("1.00GB"), Some(1024.0 * 1024.0 * 1024.0));
        assert_eq!(parse_rate("69.68MB"), Some(69.68 * 1024.0 * 1024.0));
        assert_eq!(parse_rate("512KB"), Some(512.0 * 1024.0));
        assert_eq!(parse_rate("1.5kB"), Some(1500.0));
        assert_eq!(parse_rate("750B"), Some(750.0));
        assert_eq!(parse_rate("1,234.5kB"), Some(1_234_500.0));
        assert_eq!(parse_rate("junk"), None);
    }

    #[test]
    fn test_parse_progress2_line() {
        let line = "  1,523,712  49%   69.68MB/s    0:00:01";
        let parsed = parse_progress_line(line);
        assert_eq!(parsed.speed, Some(69.68 * 1024.0 * 1024.0));
        assert_eq!(parsed.percent, Some(49));
    }

    #[test]
    fn test_file_counter_wins_over_byte_percent() {
        let line = "  3,211,264   7%   10.00MB/s    0:00:12 (xfr#5, ir-chk=1625/1649)";
        let parsed = parse_progress_line(line);
        // 1649-1625 = 24 done of 1649 -> 1%
        assert_eq!(parsed.percent, Some((24 * 100 / 1649) as u8));
        assert!(parsed.speed.is_some());
    }

    #[test]
    fn test_non_progress_lines_parse_to_nothing() {
        assert_eq!(parse_progress_line("sending incremental file list"), ParsedProgress::default());
        assert_eq!(parse_progress_line("photos/raw/b.raw"), ParsedProgress::default());
    }

    #[test]
    fn test_line_splitter_handles_cr() {
        let mut splitter = LineSplitter::new();
        let lines = splitter.push(b"first\rsecond\nthi");
        assert_eq!(lines, vec!["first", "second"]);
        let lines = splitter.push(b"rd\r");
        assert_eq!(lines, vec!["third"]);
    }

    #[test]
    fn test_build_ssh_command() {
        let cmd = build_ssh_command(2222, Some("/tmp/key.pem"));
        assert!(cmd.starts_with("ssh -p 2222"));
        assert!(cmd.contains("key.pem"));
        assert!(cmd.ends_with("-o StrictHostKeyChecking=no"));

        let cmd = build_ssh_command(22, None);
        assert!(!cmd.contains("-i"));
    }

    #[test]
    fn test_temp_key_restricted_before_write() {
        let file = write_temp_key(b"-----BEGIN KEY-----").unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = file.as_file().metadata().unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let contents = std::fs::read(file.path()).unwrap();
        assert_eq!(contents, b"-----BEGIN KEY-----");
    }
}
