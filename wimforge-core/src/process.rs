//! Launching external tools.
//!
//! [`ProcessRunner::run`] is the plain "run to completion" primitive. The
//! spinner variant exists for informational queries that print no progress
//! percentages but can take a long time; it keeps both output streams drained
//! on background threads while the caller animates something.
use crate::command::CommandLine;
use crate::error::{Error, Result};
use crate::logs::Logs;
use std::io::{self, Read};
use std::process::{Child, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// The exit code reported when the user interrupted a running tool.
pub const CANCELLED_EXIT_CODE: i32 = 130;

const SPINNER_TICK: Duration = Duration::from_millis(120);
const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
pub(crate) const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Outcome of one finished process.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessResult {
    pub code: i32,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn cancelled(&self) -> bool {
        self.code == CANCELLED_EXIT_CODE
    }

    /// Standard output followed by standard error, for text scraping.
    pub fn combined_output(&self) -> String {
        let mut text = self.stdout.clone().unwrap_or_default();
        if let Some(err) = &self.stderr {
            text.push('\n');
            text.push_str(err);
        }
        text
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ProcessRunner<'a> {
    logs: &'a Logs,
}

impl<'a> ProcessRunner<'a> {
    pub fn new(logs: &'a Logs) -> Self {
        Self { logs }
    }

    /// Runs `cmd` to completion.
    ///
    /// With `capture` both streams are returned; otherwise they are discarded.
    /// Verbose logging captures internally either way so the transcript is
    /// complete.
    pub fn run(&self, cmd: &CommandLine, capture: bool) -> Result<ProcessResult> {
        tracing::debug!(%cmd, capture, "running");
        let mut command = cmd.to_command();
        command.stdin(Stdio::null());

        let result = if capture || self.logs.verbose() {
            let output = command.output().map_err(|e| spawn_error(cmd, e))?;
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            let code = exit_code(output.status);
            self.logs
                .transcript_command(cmd, code, Some(&stdout), Some(&stderr));
            if capture {
                ProcessResult {
                    code,
                    stdout: Some(stdout),
                    stderr: Some(stderr),
                }
            } else {
                ProcessResult {
                    code,
                    ..ProcessResult::default()
                }
            }
        } else {
            let status = command
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map_err(|e| spawn_error(cmd, e))?;
            ProcessResult {
                code: exit_code(status),
                ..ProcessResult::default()
            }
        };

        Ok(result)
    }

    /// Runs `cmd` with both streams captured, calling `on_tick` roughly every
    /// 120 ms until it exits so the caller can show liveness.
    ///
    /// If `running` is cleared the child is terminated and the result carries
    /// [`CANCELLED_EXIT_CODE`].
    pub fn run_with_spinner(
        &self,
        cmd: &CommandLine,
        running: &AtomicBool,
        mut on_tick: impl FnMut(),
    ) -> Result<ProcessResult> {
        tracing::debug!(%cmd, "running with spinner");
        let mut child = cmd
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(cmd, e))?;

        let stdout_rx = child.stdout.take().map(drain);
        let stderr_rx = child.stderr.take().map(drain);

        let mut cancelled = false;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }
            if !running.load(Ordering::SeqCst) {
                cancelled = true;
                terminate(&mut child, TERMINATE_GRACE);
                break None;
            }
            on_tick();
            thread::sleep(SPINNER_TICK);
        };

        let stdout = collect(stdout_rx);
        let stderr = collect(stderr_rx);
        let code = match status {
            Some(status) if !cancelled => exit_code(status),
            _ => CANCELLED_EXIT_CODE,
        };
        self.logs
            .transcript_command(cmd, code, Some(&stdout), Some(&stderr));

        Ok(ProcessResult {
            code,
            stdout: Some(stdout),
            stderr: Some(stderr),
        })
    }
}

/// Maps a spawn failure, turning a missing executable into [`Error::ToolNotFound`].
pub(crate) fn spawn_error(cmd: &CommandLine, e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::ToolNotFound {
            program: cmd.program.clone(),
        }
    } else {
        Error::Io(e)
    }
}

pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Asks `child` to stop, waits up to `grace`, then kills it.
pub(crate) fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        if let Err(e) = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM) {
            tracing::debug!("SIGTERM failed: {e}");
        }
    }
    #[cfg(not(unix))]
    {
        child.kill().ok();
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => thread::sleep(Duration::from_millis(50)),
            Err(_) => break,
        }
    }
    tracing::warn!(pid = child.id(), "tool ignored termination request, killing");
    child.kill().ok();
    child.wait().ok();
}

fn drain<R: Read + Send + 'static>(mut stream: R) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).ok();
        tx.send(String::from_utf8_lossy(&buf).into_owned()).ok();
    });
    rx
}

fn collect(rx: Option<mpsc::Receiver<String>>) -> String {
    rx.and_then(|rx| rx.recv_timeout(DRAIN_JOIN_TIMEOUT).ok())
        .unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testutil::fake_tool;
    use std::fs;

    #[test]
    fn captures_both_streams() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "tool", "echo out\necho err >&2\nexit 3");
        let logs = Logs::new(dir.path(), false);
        let result = ProcessRunner::new(&logs)
            .run(&CommandLine::new(&tool), true)
            .unwrap();
        assert_eq!(result.code, 3);
        assert_eq!(result.stdout.as_deref(), Some("out\n"));
        assert_eq!(result.stderr.as_deref(), Some("err\n"));
    }

    #[test]
    fn uncaptured_run_returns_no_streams() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "tool", "echo out");
        let logs = Logs::new(dir.path(), false);
        let result = ProcessRunner::new(&logs)
            .run(&CommandLine::new(&tool), false)
            .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, None);
    }

    #[test]
    fn arguments_are_not_shell_interpreted() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "tool", "printf '%s|' \"$@\"");
        let logs = Logs::new(dir.path(), false);
        let cmd = CommandLine::new(&tool).args(["a b", "$(id)", ";echo x"]);
        let result = ProcessRunner::new(&logs).run(&cmd, true).unwrap();
        assert_eq!(result.stdout.as_deref(), Some("a b|$(id)|;echo x|"));
    }

    #[test]
    fn missing_executable_is_tool_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let logs = Logs::new(dir.path(), false);
        let cmd = CommandLine::new(dir.path().join("no-such-tool"));
        let err = ProcessRunner::new(&logs).run(&cmd, false).unwrap_err();
        assert!(matches!(err, Error::ToolNotFound { .. }));
    }

    #[test]
    fn verbose_transcript_records_uncaptured_runs() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "tool", "echo hidden");
        let logs = Logs::new(dir.path(), true);
        let result = ProcessRunner::new(&logs)
            .run(&CommandLine::new(&tool).arg("/Get-WimInfo"), false)
            .unwrap();
        assert_eq!(result.stdout, None);
        let transcript = fs::read_to_string(logs.transcript_path()).unwrap();
        assert!(transcript.contains("/Get-WimInfo"));
        assert!(transcript.contains("-- STDOUT --\nhidden\n"));
    }

    #[test]
    fn spinner_variant_ticks_and_captures() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "tool", "sleep 0.4\necho 'Index : 1'");
        let logs = Logs::new(dir.path(), false);
        let running = AtomicBool::new(true);
        let mut ticks = 0;
        let result = ProcessRunner::new(&logs)
            .run_with_spinner(&CommandLine::new(&tool), &running, || ticks += 1)
            .unwrap();
        assert!(result.success());
        assert!(ticks >= 1);
        assert_eq!(result.stdout.as_deref(), Some("Index : 1\n"));
    }

    #[test]
    fn spinner_variant_honours_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "tool", "exec sleep 30");
        let logs = Logs::new(dir.path(), false);
        let running = AtomicBool::new(false);
        let started = Instant::now();
        let result = ProcessRunner::new(&logs)
            .run_with_spinner(&CommandLine::new(&tool), &running, || {})
            .unwrap();
        assert!(result.cancelled());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn spinner_variant_does_not_wait_for_inherited_pipes() {
        let dir = tempfile::tempdir().unwrap();
        // The background child keeps both pipes open long after the tool exits.
        let tool = fake_tool(dir.path(), "tool", "echo early\nsleep 30 &\nexit 0");
        let logs = Logs::new(dir.path(), false);
        let running = AtomicBool::new(true);
        let started = Instant::now();
        let result = ProcessRunner::new(&logs)
            .run_with_spinner(&CommandLine::new(&tool), &running, || {})
            .unwrap();
        assert!(result.success());
        assert!(started.elapsed() < Duration::from_secs(8));
        // The unfinished drain is abandoned along with what it had read.
        assert_eq!(result.stdout.as_deref(), Some(""));
    }

    #[test]
    fn combined_output_joins_both_streams() {
        let result = ProcessResult {
            code: 0,
            stdout: Some("State : Enabled".into()),
            stderr: Some("warning".into()),
        };
        assert_eq!(result.combined_output(), "State : Enabled\nwarning");
        assert_eq!(ProcessResult::default().combined_output(), "");
    }
}
