//! One place that owns everything a session needs.
use crate::config::Settings;
use crate::export::ExportCoordinator;
use crate::logs::Logs;
use crate::mount::ImageMountManager;
use crate::process::ProcessRunner;
use crate::servicing::Servicer;
use crate::session::{MountSessionTracker, SweepReport};
use crate::split::Splitter;
use crate::tools::Tools;
use std::sync::Once;

/// Settings, tool locations, logs and the mount registry for one process.
///
/// Components borrow from here instead of reaching for globals; the exit
/// teardown is guarded so it runs at most once however many paths trigger it.
pub struct Toolkit {
    settings: Settings,
    tools: Tools,
    logs: Logs,
    tracker: MountSessionTracker,
    teardown: Once,
}

impl Toolkit {
    pub fn new(settings: Settings) -> Self {
        let tools = Tools::from_settings(&settings);
        let logs = Logs::new(&settings.log_folder(), settings.verbose);
        let tracker = MountSessionTracker::new(settings.mount_base.clone());
        Self::with_parts(settings, tools, logs, tracker)
    }

    pub fn with_parts(
        settings: Settings,
        tools: Tools,
        logs: Logs,
        tracker: MountSessionTracker,
    ) -> Self {
        Self {
            settings,
            tools,
            logs,
            tracker,
            teardown: Once::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn tools(&self) -> &Tools {
        &self.tools
    }

    pub fn logs(&self) -> &Logs {
        &self.logs
    }

    pub fn tracker(&self) -> &MountSessionTracker {
        &self.tracker
    }

    pub fn runner(&self) -> ProcessRunner<'_> {
        ProcessRunner::new(&self.logs)
    }

    pub fn mounts(&self) -> ImageMountManager<'_> {
        ImageMountManager::new(&self.tools, &self.logs, &self.tracker, self.settings.progress)
    }

    pub fn exports(&self) -> ExportCoordinator<'_> {
        ExportCoordinator::new(&self.tools, &self.logs, self.settings.progress)
    }

    pub fn servicer(&self) -> Servicer<'_> {
        Servicer::new(&self.tools, &self.logs, self.mounts(), self.settings.progress)
    }

    pub fn splitter(&self) -> Splitter<'_> {
        Splitter::new(&self.tools, &self.logs, self.settings.progress)
    }

    /// Orphan cleanup plus a sweep of every tracked directory.
    ///
    /// Returns `None` when teardown already ran.
    pub fn teardown(&self) -> Option<SweepReport> {
        let mut report = None;
        self.teardown.call_once(|| {
            tracing::debug!(tracked = self.tracker.tracked_dirs().len(), "teardown");
            report = Some(self.mounts().teardown());
        });
        report
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::removal::RetryPolicy;
    use crate::testutil::{fake_tool, recorded_calls};
    use std::time::Duration;

    #[test]
    fn teardown_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Tools {
            primary: fake_tool(
                dir.path(),
                "dism",
                "echo \"$@\" >> \"$(dirname \"$0\")/calls.log\"",
            ),
            alternate: dir.path().join("no-wimlib"),
        };
        let logs = Logs::new(dir.path(), false);
        let tracker = MountSessionTracker::with_policy(
            Some(dir.path().join("mounts")),
            RetryPolicy {
                attempts: 1,
                delay: Duration::ZERO,
            },
        );
        let kit = Toolkit::with_parts(Settings::default(), tools, logs, tracker);
        let leftover = kit.tracker().create("mnt_").unwrap().path;

        let first = kit.teardown().unwrap();
        assert_eq!(first.removed, vec![leftover.clone()]);
        assert!(!leftover.exists());
        assert!(kit.teardown().is_none());
        assert_eq!(recorded_calls(dir.path()), ["/Cleanup-Mountpoints"]);
    }
}
