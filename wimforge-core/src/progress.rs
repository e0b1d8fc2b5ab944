//! Streaming long-running tool invocations with single-line progress.
//!
//! Both image tools print their percent-complete markers on the diagnostic
//! stream, redrawing with bare carriage returns. [`ProgressStreamer`] reads
//! that stream as it is produced, pulls a percentage out of each line and
//! forwards it to a [`ProgressSink`]. [`LineRenderer`] is the sink used by the
//! console front-end: it redraws one line in place and never lets it wrap.
use crate::command::CommandLine;
use crate::config::ProgressMode;
use crate::error::Result;
use crate::logs::Logs;
use crate::process::{CANCELLED_EXIT_CODE, TERMINATE_GRACE, exit_code, spawn_error, terminate};
use std::io::{Read, Write};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MIN_BAR: usize = 10;
const MAX_BAR: usize = 50;

/// Receives progress from a streamed run.
pub trait ProgressSink {
    /// A new, strictly higher whole percentage was observed.
    fn update(&mut self, percent: u8);
    /// The tool exited after reporting some progress.
    fn finish(&mut self);
    /// The run was cancelled by the user.
    fn interrupted(&mut self) {}
}

/// A sink that discards everything.
pub struct Silent;

impl ProgressSink for Silent {
    fn update(&mut self, _percent: u8) {}
    fn finish(&mut self) {}
}

/// Extracts the first `N%` or `N.N%` marker from a line, rounded half-up and
/// clamped to 100.
pub fn parse_percent(line: &str) -> Option<u8> {
    let bytes = line.as_bytes();
    for (pos, _) in line.match_indices('%') {
        let mut start = pos;
        while start > 0 && bytes[start - 1].is_ascii_digit() {
            start -= 1;
        }
        if start == pos {
            continue;
        }
        // Extend over an integer part in front of a decimal point.
        if start >= 2 && bytes[start - 1] == b'.' && bytes[start - 2].is_ascii_digit() {
            start -= 1;
            while start > 0 && bytes[start - 1].is_ascii_digit() {
                start -= 1;
            }
        }
        let value: f64 = line[start..pos].parse().ok()?;
        return Some((value + 0.5).floor().min(100.0) as u8);
    }
    None
}

/// Width of the bar for a terminal `columns` wide, leaving room for the label
/// and the `": 100% []"` decoration.
pub fn bar_width(columns: usize, label: &str) -> usize {
    columns
        .saturating_sub(label.chars().count() + 10)
        .clamp(MIN_BAR, MAX_BAR)
}

/// Renders `"\r<label>: <pct>% [<bar>]"`.
pub fn render_line(label: &str, percent: u8, bar_width: usize) -> String {
    let filled = usize::from(percent.min(100)) * bar_width / 100;
    format!(
        "\r{label}: {percent:>3}% [{}{}]",
        "#".repeat(filled),
        " ".repeat(bar_width - filled)
    )
}

/// Drawing state for one streamed operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressState {
    /// Last rendered percentage, `-1` before the first redraw.
    pub last_percent: i32,
    /// Terminal width the line was laid out for.
    pub columns: usize,
    pub bar_width: usize,
}

impl ProgressState {
    pub fn new(columns: usize, label: &str) -> Self {
        Self {
            last_percent: -1,
            columns,
            bar_width: bar_width(columns, label),
        }
    }
}

/// Draws progress on a single line of `out`.
pub struct LineRenderer<W: Write> {
    label: String,
    out: W,
    state: ProgressState,
}

impl<W: Write> LineRenderer<W> {
    pub fn new(label: impl Into<String>, out: W, columns: usize) -> Self {
        let label = label.into();
        let state = ProgressState::new(columns, &label);
        Self { label, out, state }
    }

    pub fn state(&self) -> ProgressState {
        self.state
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn draw(&mut self, percent: u8, newline: bool) {
        self.state.last_percent = i32::from(percent);
        let mut line = render_line(&self.label, percent, self.state.bar_width);
        if newline {
            line.push('\n');
        }
        // A closed terminal is not worth failing the operation over.
        self.out.write_all(line.as_bytes()).ok();
        self.out.flush().ok();
    }
}

impl<W: Write> ProgressSink for LineRenderer<W> {
    fn update(&mut self, percent: u8) {
        if i32::from(percent) != self.state.last_percent {
            self.draw(percent, false);
        }
    }

    fn finish(&mut self) {
        self.draw(100, true);
    }

    /// Replaces a partly drawn bar with a `cancelled` marker on the same line.
    fn interrupted(&mut self) {
        if self.state.last_percent < 0 {
            return;
        }
        let text = format!("{}: cancelled", self.label);
        let width = self.state.columns.saturating_sub(1).max(text.chars().count());
        let line = format!("\r{text:<width$}\n");
        self.out.write_all(line.as_bytes()).ok();
        self.out.flush().ok();
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ProgressStreamer<'a> {
    logs: &'a Logs,
    mode: ProgressMode,
}

impl<'a> ProgressStreamer<'a> {
    pub fn new(logs: &'a Logs, mode: ProgressMode) -> Self {
        Self { logs, mode }
    }

    /// Runs `cmd`, streaming its diagnostic output into `sink`, and returns
    /// the tool's exit code.
    ///
    /// Clearing `running` terminates the tool and yields
    /// [`CANCELLED_EXIT_CODE`] rather than an error.
    pub fn stream_run(
        &self,
        cmd: &CommandLine,
        running: &AtomicBool,
        sink: &mut dyn ProgressSink,
    ) -> Result<i32> {
        tracing::debug!(%cmd, "streaming");
        self.logs.transcript_start(cmd);
        let mut child = cmd
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(cmd, e))?;

        let lines = match child.stderr.take() {
            Some(stderr) => read_lines(stderr),
            None => mpsc::channel().1,
        };

        let draw = self.mode == ProgressMode::Line;
        let mut last: i32 = -1;
        loop {
            if !running.load(Ordering::SeqCst) {
                return Ok(self.cancel(cmd, &mut child, sink, draw));
            }
            match lines.recv_timeout(POLL_INTERVAL) {
                Ok(line) => {
                    self.logs.transcript_line(&line);
                    if let Some(percent) = parse_percent(&line) {
                        if i32::from(percent) > last {
                            last = i32::from(percent);
                            if draw {
                                sink.update(percent);
                            }
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if !running.load(Ordering::SeqCst) {
                return Ok(self.cancel(cmd, &mut child, sink, draw));
            }
            thread::sleep(POLL_INTERVAL / 2);
        };

        let code = exit_code(status);
        if last >= 0 && draw {
            sink.finish();
        }
        self.logs.transcript_line(&format!("RC: {code}"));
        tracing::debug!(%cmd, code, "stream finished");
        Ok(code)
    }

    fn cancel(
        &self,
        cmd: &CommandLine,
        child: &mut std::process::Child,
        sink: &mut dyn ProgressSink,
        draw: bool,
    ) -> i32 {
        tracing::info!(%cmd, "cancelling at user request");
        terminate(child, TERMINATE_GRACE);
        if draw {
            sink.interrupted();
        }
        self.logs
            .transcript_line(&format!("RC: {CANCELLED_EXIT_CODE} (cancelled)"));
        CANCELLED_EXIT_CODE
    }
}

/// Splits a byte stream into lines on both `\n` and `\r`, skipping empties.
fn read_lines<R: Read + Send + 'static>(mut stream: R) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        let mut current = Vec::new();
        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for &byte in &buf[..n] {
                if byte == b'\n' || byte == b'\r' {
                    if !current.is_empty() {
                        let line = String::from_utf8_lossy(&current).into_owned();
                        if tx.send(line).is_err() {
                            return;
                        }
                        current.clear();
                    }
                } else {
                    current.push(byte);
                }
            }
        }
        if !current.is_empty() {
            tx.send(String::from_utf8_lossy(&current).into_owned()).ok();
        }
    });
    rx
}
