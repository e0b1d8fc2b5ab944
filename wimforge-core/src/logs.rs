//! The two user-facing log files.
//!
//! - The error log collects one line per failure and is truncated when a
//!   session starts.
//! - The transcript records every command, its exit code and its raw output,
//!   and is only written when verbose logging is enabled.
//!
//! Write failures are traced and swallowed: a broken log file must never
//! abort an image operation.
use crate::command::CommandLine;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub const ERROR_LOG_NAME: &str = "wimforge-errors.log";
pub const TRANSCRIPT_NAME: &str = "wimforge-verbose.log";

#[derive(Clone, Debug)]
pub struct Logs {
    error_log: PathBuf,
    transcript: PathBuf,
    verbose: bool,
}

impl Logs {
    pub fn new(dir: &Path, verbose: bool) -> Self {
        Self {
            error_log: dir.join(ERROR_LOG_NAME),
            transcript: dir.join(TRANSCRIPT_NAME),
            verbose,
        }
    }

    pub fn error_log_path(&self) -> &Path {
        &self.error_log
    }

    pub fn transcript_path(&self) -> &Path {
        &self.transcript
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Truncates the error log so it only holds failures from this session.
    pub fn start_session(&self) {
        match fs::remove_file(&self.error_log) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                let path = self.error_log.display();
                tracing::debug!(%path, "could not truncate error log: {e}");
            }
        }
    }

    /// Appends one failure message to the error log.
    pub fn error(&self, message: &str) {
        let line = format!("{}\n", message.trim_end());
        if let Err(e) = append(&self.error_log, &line) {
            tracing::debug!(path = %self.error_log.display(), "error log write failed: {e}");
        }
    }

    /// Records a finished command in the transcript.
    pub fn transcript_command(
        &self,
        cmd: &CommandLine,
        code: i32,
        stdout: Option<&str>,
        stderr: Option<&str>,
    ) {
        if !self.verbose {
            return;
        }
        let mut text = format!("\n== CMD ==\n{cmd}\nRC: {code}\n");
        for (title, body) in [("STDOUT", stdout), ("STDERR", stderr)] {
            if let Some(body) = body.filter(|b| !b.is_empty()) {
                text.push_str(&format!("-- {title} --\n{body}"));
                if !body.ends_with('\n') {
                    text.push('\n');
                }
            }
        }
        self.write_transcript(&text);
    }

    /// Records the start of a streamed command in the transcript.
    pub fn transcript_start(&self, cmd: &CommandLine) {
        if self.verbose {
            self.write_transcript(&format!("\n== STREAM ==\n{cmd}\n"));
        }
    }

    /// Appends one raw diagnostic line verbatim.
    pub fn transcript_line(&self, line: &str) {
        if self.verbose {
            self.write_transcript(&format!("{line}\n"));
        }
    }

    fn write_transcript(&self, text: &str) {
        if let Err(e) = append(&self.transcript, text) {
            tracing::debug!(path = %self.transcript.display(), "transcript write failed: {e}");
        }
    }
}

fn append(path: &Path, text: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(text.as_bytes())
}

/// Returns the last `n` lines of a log file; an unreadable file yields none.
pub fn tail(path: &Path, n: usize) -> Vec<String> {
    let Ok(file) = File::open(path) else {
        return Vec::new();
    };
    let lines: Vec<String> = BufReader::new(file)
        .split(b'\n')
        .filter_map(|chunk| chunk.ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .collect();
    let skip = lines.len().saturating_sub(n);
    lines.into_iter().skip(skip).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_start_truncates_error_log() {
        let dir = tempfile::tempdir().unwrap();
        let logs = Logs::new(dir.path(), false);
        logs.error("EXPORT: index 2 failed (primary)");
        assert_eq!(tail(logs.error_log_path(), 10).len(), 1);
        logs.start_session();
        assert!(tail(logs.error_log_path(), 10).is_empty());
        logs.start_session();
    }

    #[test]
    fn transcript_only_written_when_verbose() {
        let dir = tempfile::tempdir().unwrap();
        let quiet = Logs::new(dir.path(), false);
        quiet.transcript_line("10%");
        assert!(!quiet.transcript_path().exists());

        let loud = Logs::new(dir.path(), true);
        let cmd = CommandLine::new("dism").arg("/Get-WimInfo");
        loud.transcript_command(&cmd, 0, Some("Index : 1"), None);
        let text = fs::read_to_string(loud.transcript_path()).unwrap();
        assert!(text.contains("== CMD ==\ndism /Get-WimInfo\nRC: 0\n"));
        assert!(text.contains("-- STDOUT --\nIndex : 1\n"));
        assert!(!text.contains("STDERR"));
    }

    #[test]
    fn tail_returns_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        fs::write(&path, "a\nb\nc\nd").unwrap();
        assert_eq!(tail(&path, 2), vec!["c".to_string(), "d".to_string()]);
        assert!(tail(&dir.path().join("missing"), 5).is_empty());
    }
}
