//! Mounting and unmounting image indices on tracked scratch directories.
//!
//! The guarantees this module provides:
//! - A failed mount never leaves its directory behind: the half-mounted
//!   directory is unmounted with discard and released before the error is
//!   returned.
//! - An unmount always releases the directory, even when the tool reports an
//!   error.
//! - A cancelled mount or unmount keeps its directory tracked so the exit
//!   sweep can deal with it once the tool has let go.
use crate::config::ProgressMode;
use crate::error::{Error, Result};
use crate::logs::Logs;
use crate::process::{CANCELLED_EXIT_CODE, ProcessResult, ProcessRunner};
use crate::progress::{ProgressSink, ProgressStreamer, Silent};
use crate::removal::RemovalOutcome;
use crate::session::{MountMode, MountSession, MountSessionTracker, SweepReport};
use crate::tools::Tools;
use std::path::Path;
use std::sync::atomic::AtomicBool;

const MOUNT_PREFIX: &str = "mnt_";

/// A successful mount, plus any notice the caller should show.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mounted {
    pub session: MountSession,
    /// Set when the configured mount base could not be used.
    pub fallback: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnmountOutcome {
    /// Exit code of the unmount command, `None` if nothing was mounted there.
    pub code: Option<i32>,
    pub removal: RemovalOutcome,
}

impl UnmountOutcome {
    pub fn tool_succeeded(&self) -> bool {
        self.code.is_none_or(|code| code == 0)
    }
}

/// Fails for images that cannot be serviced read-write.
///
/// `.esd` containers are solid-compressed and the image tool refuses to
/// mount them for writing; they must be exported to `.wim` first.
pub fn ensure_writable(image: &Path) -> Result<()> {
    let is_esd = image
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("esd"));
    if is_esd {
        return Err(Error::OperationNotAllowed(format!(
            "{} is an ESD image and cannot be modified; convert it to WIM first",
            image.display()
        )));
    }
    Ok(())
}

pub struct ImageMountManager<'a> {
    tools: &'a Tools,
    logs: &'a Logs,
    tracker: &'a MountSessionTracker,
    progress: ProgressMode,
}

impl<'a> ImageMountManager<'a> {
    pub fn new(
        tools: &'a Tools,
        logs: &'a Logs,
        tracker: &'a MountSessionTracker,
        progress: ProgressMode,
    ) -> Self {
        Self {
            tools,
            logs,
            tracker,
            progress,
        }
    }

    fn streamer(&self) -> ProgressStreamer<'a> {
        ProgressStreamer::new(self.logs, self.progress)
    }

    /// Asks the image tool to drop stale mount registrations. Idempotent.
    pub fn cleanup_orphans(&self) -> Result<ProcessResult> {
        let cmd = self.tools.primary().arg("/Cleanup-Mountpoints");
        let result = ProcessRunner::new(self.logs).run(&cmd, false)?;
        if !result.success() {
            tracing::warn!(code = result.code, "orphan mount cleanup reported an error");
        }
        Ok(result)
    }

    /// Mounts `index` of `image` on a new tracked directory.
    pub fn mount(
        &self,
        image: &Path,
        index: u32,
        mode: MountMode,
        running: &AtomicBool,
        sink: &mut dyn ProgressSink,
    ) -> Result<Mounted> {
        if mode == MountMode::ReadWrite {
            ensure_writable(image)?;
        }
        self.cleanup_orphans()?;

        let created = self.tracker.create(MOUNT_PREFIX)?;
        let dir = created.path;
        let mut cmd = self
            .tools
            .primary()
            .arg("/Mount-Wim")
            .flag_path("/WimFile:", image)
            .arg(format!("/Index:{index}"))
            .flag_path("/MountDir:", &dir);
        if mode == MountMode::ReadOnly {
            cmd = cmd.arg("/ReadOnly");
        }

        let code = match self.streamer().stream_run(&cmd, running, sink) {
            Ok(code) => code,
            Err(e) => {
                self.tracker.release(&dir);
                return Err(e);
            }
        };
        if code == CANCELLED_EXIT_CODE {
            tracing::info!(dir = %dir.display(), "mount cancelled; kept for the exit sweep");
            return Err(Error::Cancelled);
        }
        if code != 0 {
            self.logs.error(&format!(
                "Mount failed: {} index {index}, tool rc={code}",
                image.display()
            ));
            self.unmount(&dir, false, running, &mut Silent).ok();
            if self.tracker.is_tracked(&dir) {
                self.tracker.release(&dir);
            }
            return Err(Error::MountFailed {
                image: image.to_path_buf(),
                index,
                code,
            });
        }

        tracing::info!(image = %image.display(), index, %mode, dir = %dir.display(), "mounted");
        Ok(Mounted {
            session: self.tracker.attach(&dir, image, index, mode),
            fallback: created.fallback,
        })
    }

    /// Unmounts whatever is mounted on `dir`, committing or discarding
    /// changes, and releases the directory.
    pub fn unmount(
        &self,
        dir: &Path,
        commit: bool,
        running: &AtomicBool,
        sink: &mut dyn ProgressSink,
    ) -> Result<UnmountOutcome> {
        if !dir.exists() {
            return Ok(UnmountOutcome {
                code: None,
                removal: self.tracker.release(dir),
            });
        }

        let cmd = self
            .tools
            .primary()
            .arg("/Unmount-Wim")
            .flag_path("/MountDir:", dir)
            .arg(if commit { "/Commit" } else { "/Discard" });
        let run = self.streamer().stream_run(&cmd, running, sink);
        if let Ok(CANCELLED_EXIT_CODE) = run {
            tracing::info!(dir = %dir.display(), "unmount cancelled; kept for the exit sweep");
            return Err(Error::Cancelled);
        }

        let removal = self.release(dir);
        let code = run?;
        if code != 0 {
            self.logs.error(&format!(
                "Unmount reported rc={code} for {} ({})",
                dir.display(),
                if commit { "commit" } else { "discard" }
            ));
        }
        Ok(UnmountOutcome {
            code: Some(code),
            removal,
        })
    }

    pub fn unmount_session(
        &self,
        session: &MountSession,
        commit: bool,
        running: &AtomicBool,
        sink: &mut dyn ProgressSink,
    ) -> Result<UnmountOutcome> {
        self.unmount(&session.directory, commit, running, sink)
    }

    fn release(&self, dir: &Path) -> RemovalOutcome {
        let removal = self.tracker.release(dir);
        if let Some(err) = removal.clone().into_error() {
            self.logs.error(&format!("[CLEANUP] {err}"));
        }
        removal
    }

    /// Process-exit safety net: orphan cleanup, then sweep every tracked
    /// directory. Safe to run after partial cleanup.
    pub fn teardown(&self) -> SweepReport {
        if let Err(e) = self.cleanup_orphans() {
            tracing::warn!("orphan cleanup during teardown failed: {e}");
        }
        let report = self.tracker.sweep_all();
        for (dir, reason) in &report.failed {
            self.logs
                .error(&format!("[CLEANUP] could not remove {}: {reason}", dir.display()));
        }
        report
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::removal::RetryPolicy;
    use crate::testutil::{fake_tool, recorded_calls};
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;

    const RECORD: &str = "echo \"$@\" >> \"$(dirname \"$0\")/calls.log\"";

    struct Rig {
        dir: tempfile::TempDir,
        tools: Tools,
        logs: Logs,
        tracker: MountSessionTracker,
    }

    impl Rig {
        fn new(body: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let primary = fake_tool(dir.path(), "dism", &format!("{RECORD}\n{body}"));
            let logs = Logs::new(dir.path(), false);
            let tracker = MountSessionTracker::with_policy(
                Some(dir.path().join("mounts")),
                RetryPolicy {
                    attempts: 2,
                    delay: Duration::from_millis(1),
                },
            );
            Self {
                tools: Tools {
                    primary,
                    alternate: PathBuf::from("/nonexistent/wimlib-imagex"),
                },
                dir,
                logs,
                tracker,
            }
        }

        fn manager(&self) -> ImageMountManager<'_> {
            ImageMountManager::new(&self.tools, &self.logs, &self.tracker, ProgressMode::Off)
        }

        fn calls(&self) -> Vec<String> {
            recorded_calls(self.dir.path())
        }

        fn leftover_mount_dirs(&self) -> usize {
            fs::read_dir(self.dir.path().join("mounts"))
                .map(|entries| entries.count())
                .unwrap_or(0)
        }
    }

    #[test]
    fn read_only_mount_then_discard_leaves_nothing() {
        let rig = Rig::new("echo '100%' >&2");
        let running = AtomicBool::new(true);
        let mounted = rig
            .manager()
            .mount(Path::new("/img/install.wim"), 1, MountMode::ReadOnly, &running, &mut Silent)
            .unwrap();
        let dir = mounted.session.directory.clone();
        assert!(dir.is_dir());
        assert!(mounted.fallback.is_none());
        assert_eq!(rig.tracker.sessions(), vec![mounted.session.clone()]);

        let calls = rig.calls();
        assert_eq!(calls[0], "/Cleanup-Mountpoints");
        assert!(calls[1].starts_with("/Mount-Wim /WimFile:/img/install.wim /Index:1 /MountDir:"));
        assert!(calls[1].ends_with("/ReadOnly"));

        let outcome = rig
            .manager()
            .unmount_session(&mounted.session, false, &running, &mut Silent)
            .unwrap();
        assert!(outcome.tool_succeeded());
        assert!(outcome.removal.is_gone());
        assert!(!dir.exists());
        assert!(rig.tracker.tracked_dirs().is_empty());
        assert!(rig.calls()[2].ends_with("/Discard"));
    }

    #[test]
    fn read_write_mount_omits_read_only_flag() {
        let rig = Rig::new("exit 0");
        let running = AtomicBool::new(true);
        let mounted = rig
            .manager()
            .mount(Path::new("/img/install.wim"), 2, MountMode::ReadWrite, &running, &mut Silent)
            .unwrap();
        assert!(!rig.calls()[1].contains("/ReadOnly"));
        rig.manager()
            .unmount(&mounted.session.directory, true, &running, &mut Silent)
            .unwrap();
        assert!(rig.calls()[2].ends_with("/Commit"));
    }

    #[test]
    fn failed_mount_rolls_back_its_directory() {
        let rig = Rig::new("case \"$1\" in /Mount-Wim) exit 5;; esac\nexit 0");
        let running = AtomicBool::new(true);
        let err = rig
            .manager()
            .mount(Path::new("/img/install.wim"), 9, MountMode::ReadOnly, &running, &mut Silent)
            .unwrap_err();
        assert!(matches!(err, Error::MountFailed { index: 9, code: 5, .. }));
        assert!(rig.tracker.tracked_dirs().is_empty());
        assert_eq!(rig.leftover_mount_dirs(), 0);

        let calls = rig.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[2].starts_with("/Unmount-Wim"));
        assert!(calls[2].ends_with("/Discard"));
        let errors = fs::read_to_string(rig.logs.error_log_path()).unwrap();
        assert!(errors.contains("Mount failed"));
    }

    #[test]
    fn esd_cannot_be_mounted_read_write() {
        let rig = Rig::new("exit 0");
        let running = AtomicBool::new(true);
        let err = rig
            .manager()
            .mount(Path::new("/img/install.ESD"), 1, MountMode::ReadWrite, &running, &mut Silent)
            .unwrap_err();
        assert!(matches!(err, Error::OperationNotAllowed(_)));
        assert!(rig.calls().is_empty());
        assert!(rig.tracker.tracked_dirs().is_empty());
        assert!(ensure_writable(Path::new("install.wim")).is_ok());
    }

    #[test]
    fn failing_unmount_still_releases_directory() {
        let rig = Rig::new("case \"$1\" in /Unmount-Wim) exit 2;; esac\nexit 0");
        let running = AtomicBool::new(true);
        let mounted = rig
            .manager()
            .mount(Path::new("/img/install.wim"), 1, MountMode::ReadOnly, &running, &mut Silent)
            .unwrap();
        let dir = mounted.session.directory;
        let outcome = rig.manager().unmount(&dir, true, &running, &mut Silent).unwrap();
        assert_eq!(outcome.code, Some(2));
        assert!(!outcome.tool_succeeded());
        assert!(!dir.exists());
        assert!(!rig.tracker.is_tracked(&dir));
    }

    #[test]
    fn unmount_of_vanished_directory_just_untracks() {
        let rig = Rig::new("exit 0");
        let dir = rig.tracker.create("mnt_").unwrap().path;
        fs::remove_dir(&dir).unwrap();
        let running = AtomicBool::new(true);
        let outcome = rig.manager().unmount(&dir, false, &running, &mut Silent).unwrap();
        assert_eq!(outcome.code, None);
        assert_eq!(outcome.removal, RemovalOutcome::AlreadyAbsent);
        assert!(rig.tracker.tracked_dirs().is_empty());
        assert!(rig.calls().is_empty());
    }

    #[test]
    fn missing_tool_is_surfaced_before_creating_anything() {
        let mut rig = Rig::new("exit 0");
        rig.tools.primary = rig.dir.path().join("no-dism");
        let running = AtomicBool::new(true);
        let err = rig
            .manager()
            .mount(Path::new("/img/install.wim"), 1, MountMode::ReadOnly, &running, &mut Silent)
            .unwrap_err();
        assert!(matches!(err, Error::ToolNotFound { .. }));
        assert!(rig.tracker.tracked_dirs().is_empty());
    }

    #[test]
    fn cancelled_mount_keeps_directory_for_teardown() {
        let rig = Rig::new("case \"$1\" in /Mount-Wim) exec sleep 30;; esac\nexit 0");
        // Orphan cleanup ignores the flag; only the streamed mount is cut short.
        let running = AtomicBool::new(false);
        let err = rig
            .manager()
            .mount(Path::new("/img/install.wim"), 1, MountMode::ReadOnly, &running, &mut Silent)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(rig.tracker.tracked_dirs().len(), 1);

        let report = rig.manager().teardown();
        assert_eq!(report.removed.len(), 1);
        assert!(rig.tracker.tracked_dirs().is_empty());
        assert_eq!(rig.leftover_mount_dirs(), 0);
    }
}
