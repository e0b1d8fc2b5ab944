//! Servicing a mounted image: health checks, optional features, packages,
//! drivers and component cleanup.
//!
//! Every operation mounts the index itself, works on the mount directory and
//! unmounts again before it returns. Read-only work always discards.
//! Read-write work commits only when the change went through, judged by the
//! exit code or by re-querying the image afterwards. The re-query scrapes the
//! tool's English output, so it confirms on a best-effort basis only.
use crate::command::CommandLine;
use crate::config::ProgressMode;
use crate::error::{Error, Result};
use crate::logs::Logs;
use crate::mount::{ImageMountManager, UnmountOutcome, ensure_writable};
use crate::process::{CANCELLED_EXIT_CODE, ProcessResult, ProcessRunner};
use crate::progress::{ProgressSink, ProgressStreamer, Silent};
use crate::query::{self, field, parse_indices};
use crate::session::MountMode;
use crate::tools::Tools;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use walkdir::WalkDir;

/// The setup image inside `boot.wim`, the one that needs boot-critical drivers.
pub const BOOT_SETUP_INDEX: u32 = 2;

/// Feedback for operations made of several tool runs.
pub trait Feedback {
    /// A progress sink for the streamed step called `step`, e.g. `Mount`.
    fn step(&mut self, step: &str) -> Box<dyn ProgressSink>;
    /// Called every so often while a query without progress output runs.
    fn tick(&mut self) {}
}

impl Feedback for Silent {
    fn step(&mut self, _step: &str) -> Box<dyn ProgressSink> {
        Box::new(Silent)
    }
}

/// What a servicing operation produced and what became of its mount.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Serviced<T> {
    pub value: T,
    /// Whether changes were saved back into the image.
    pub committed: bool,
    pub unmount: UnmountOutcome,
    /// Set when the configured mount base could not be used.
    pub fallback: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Health {
    pub check: ProcessResult,
    pub scan: ProcessResult,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Feature {
    pub name: String,
    pub state: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FeatureFilter {
    #[default]
    All,
    Disabled,
    PayloadRemoved,
}

impl FeatureFilter {
    pub fn matches(self, state: &str) -> bool {
        let state = state.to_ascii_lowercase();
        match self {
            Self::All => true,
            Self::Disabled => state.contains("disabled"),
            Self::PayloadRemoved => state.contains("payload removed"),
        }
    }
}

impl FromStr for FeatureFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "disabled" => Ok(Self::Disabled),
            "removed" | "payload-removed" => Ok(Self::PayloadRemoved),
            other => Err(Error::InvalidInput(format!(
                "unknown feature filter '{other}' (expected all, disabled or removed)"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeatureAction {
    Enable,
    Disable,
}

impl FeatureAction {
    fn verb(self) -> &'static str {
        match self {
            Self::Enable => "/Enable-Feature",
            Self::Disable => "/Disable-Feature",
        }
    }

    fn step(self) -> &'static str {
        match self {
            Self::Enable => "Enable",
            Self::Disable => "Disable",
        }
    }

    fn log_label(self) -> &'static str {
        match self {
            Self::Enable => "ENABLEFEAT: enabling",
            Self::Disable => "DISABLEFEAT: disabling",
        }
    }
}

/// A feature's state as re-queried after a change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeatureState {
    /// The feature is in the requested state.
    Reached(String),
    /// The change is staged and completes on the next boot.
    Pending(String),
    Other(String),
    /// No `State :` line was found.
    Unknown,
}

impl FeatureState {
    pub fn classify(state: Option<&str>, action: FeatureAction) -> Self {
        let Some(state) = state else {
            return Self::Unknown;
        };
        let lower = state.to_ascii_lowercase();
        let (reached, pending) = match action {
            FeatureAction::Enable => ("enabled", "enable pending"),
            FeatureAction::Disable => ("disabled", "disable pending"),
        };
        if lower.contains(pending) {
            Self::Pending(state.to_string())
        } else if lower.contains(reached) {
            Self::Reached(state.to_string())
        } else {
            Self::Other(state.to_string())
        }
    }

    pub fn confirmed(&self) -> bool {
        matches!(self, Self::Reached(_) | Self::Pending(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeatureChange {
    pub code: i32,
    pub state: FeatureState,
}

/// Third-party driver counts around an add-driver run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriverChange {
    pub code: i32,
    pub before: usize,
    pub after: usize,
}

impl DriverChange {
    pub fn added(&self) -> usize {
        self.after.saturating_sub(self.before)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverRemoval {
    pub attempted: usize,
    pub failed: Vec<PathBuf>,
}

/// `Feature Name :` / `State :` pairs from a feature listing.
pub fn parse_features(text: &str) -> Vec<Feature> {
    let mut features = Vec::new();
    let mut name = None;
    for line in text.lines() {
        if let Some(value) = field(line, "feature name") {
            name = Some(value.to_string());
        } else if let Some(state) = field(line, "state") {
            if let Some(name) = name.take() {
                features.push(Feature {
                    name,
                    state: state.to_string(),
                });
            }
        }
    }
    features
}

/// The first `State :` value in `text`.
pub fn parse_state(text: &str) -> Option<&str> {
    text.lines().find_map(|line| field(line, "state"))
}

/// Number of `Published Name :` lines, one per third-party driver.
pub fn count_drivers(text: &str) -> usize {
    text.lines()
        .filter(|line| field(line, "published name").is_some())
        .count()
}

/// `.inf` files anywhere below `folder`, sorted.
pub fn find_inf_files(folder: &Path) -> Vec<PathBuf> {
    let mut infs: Vec<PathBuf> = WalkDir::new(folder)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("inf"))
        })
        .map(|e| e.into_path())
        .collect();
    infs.sort();
    infs
}

fn require_existing(path: &Path, what: &str) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    Err(Error::InvalidInput(format!(
        "{what} {} does not exist",
        path.display()
    )))
}

pub struct Servicer<'a> {
    tools: &'a Tools,
    logs: &'a Logs,
    mounts: ImageMountManager<'a>,
    progress: ProgressMode,
}

impl<'a> Servicer<'a> {
    pub fn new(
        tools: &'a Tools,
        logs: &'a Logs,
        mounts: ImageMountManager<'a>,
        progress: ProgressMode,
    ) -> Self {
        Self {
            tools,
            logs,
            mounts,
            progress,
        }
    }

    /// `/CheckHealth` then `/ScanHealth` on a read-only mount.
    pub fn check_health(
        &self,
        image: &Path,
        index: u32,
        running: &AtomicBool,
        feedback: &mut dyn Feedback,
    ) -> Result<Serviced<Health>> {
        self.with_mount(image, index, MountMode::ReadOnly, running, feedback, |dir, feedback| {
            let health_query = |what: &str| {
                self.on_image(dir)
                    .arg("/Cleanup-Image")
                    .arg(format!("/{what}"))
            };
            let check = self.query(health_query("CheckHealth"), running, feedback)?;
            let scan = self.query(health_query("ScanHealth"), running, feedback)?;
            for (what, result) in [("CheckHealth", &check), ("ScanHealth", &scan)] {
                if !result.success() {
                    self.logs
                        .error(&format!("CHECKHEALTH: {what} reported rc={}", result.code));
                }
            }
            Ok((Health { check, scan }, false))
        })
    }

    /// The optional features of an index, narrowed by `filter`.
    pub fn list_features(
        &self,
        image: &Path,
        index: u32,
        filter: FeatureFilter,
        running: &AtomicBool,
        feedback: &mut dyn Feedback,
    ) -> Result<Serviced<Vec<Feature>>> {
        self.with_mount(image, index, MountMode::ReadOnly, running, feedback, |dir, feedback| {
            let cmd = self.on_image(dir).args(["/Get-Features", "/English"]);
            let result = self.query(cmd, running, feedback)?;
            if !result.success() {
                self.logs
                    .error(&format!("FEATURES: listing failed (rc={})", result.code));
                return Err(Error::ToolFailed {
                    operation: "Feature listing".into(),
                    code: result.code,
                });
            }
            let features = parse_features(result.stdout.as_deref().unwrap_or_default())
                .into_iter()
                .filter(|f| filter.matches(&f.state))
                .collect();
            Ok((features, false))
        })
    }

    /// Enables or disables feature `name`, then re-queries its state.
    ///
    /// Commits when the tool succeeded or the re-query shows the requested
    /// (or pending) state.
    pub fn set_feature(
        &self,
        image: &Path,
        index: u32,
        name: &str,
        action: FeatureAction,
        running: &AtomicBool,
        feedback: &mut dyn Feedback,
    ) -> Result<Serviced<FeatureChange>> {
        ensure_writable(image)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("a feature name is required".into()));
        }
        self.with_mount(image, index, MountMode::ReadWrite, running, feedback, |dir, feedback| {
            let mut cmd = self
                .on_image(dir)
                .arg(action.verb())
                .arg(format!("/FeatureName:{name}"));
            if action == FeatureAction::Enable {
                cmd = cmd.arg("/All");
            }
            let code = self.stream(cmd, running, feedback, action.step())?;
            if code != 0 {
                self.logs
                    .error(&format!("{} {name} failed (rc={code})", action.log_label()));
            }

            let info = self
                .on_image(dir)
                .arg("/Get-FeatureInfo")
                .arg(format!("/FeatureName:{name}"))
                .arg("/English");
            let text = self.query(info, running, feedback)?.combined_output();
            let state = FeatureState::classify(parse_state(&text), action);
            tracing::info!(feature = name, code, ?state, "feature change");
            let commit = code == 0 || state.confirmed();
            Ok((FeatureChange { code, state }, commit))
        })
    }

    /// Adds a `.cab`/`.msu` package. Commits only if the tool succeeded.
    pub fn add_package(
        &self,
        image: &Path,
        index: u32,
        package: &Path,
        running: &AtomicBool,
        feedback: &mut dyn Feedback,
    ) -> Result<Serviced<i32>> {
        ensure_writable(image)?;
        require_existing(package, "package")?;
        self.with_mount(image, index, MountMode::ReadWrite, running, feedback, |dir, feedback| {
            let cmd = self
                .on_image(dir)
                .arg("/Add-Package")
                .flag_path("/PackagePath:", package);
            let code = self.stream(cmd, running, feedback, "Package")?;
            if code != 0 {
                self.logs.error(&format!(
                    "ADDPKG: adding {} failed (rc={code})",
                    package.display()
                ));
            }
            Ok((code, code == 0))
        })
    }

    /// Adds the drivers in `driver` (an `.inf` or a folder searched
    /// recursively).
    pub fn add_driver(
        &self,
        image: &Path,
        index: u32,
        driver: &Path,
        force_unsigned: bool,
        running: &AtomicBool,
        feedback: &mut dyn Feedback,
    ) -> Result<Serviced<DriverChange>> {
        ensure_writable(image)?;
        require_existing(driver, "driver path")?;
        self.with_mount(image, index, MountMode::ReadWrite, running, feedback, |dir, feedback| {
            self.inject_driver(dir, driver, force_unsigned, "ADDDRV", running, feedback)
        })
    }

    /// [`Self::add_driver`] into the setup image of a `boot.wim`.
    pub fn add_boot_driver(
        &self,
        boot: &Path,
        driver: &Path,
        force_unsigned: bool,
        running: &AtomicBool,
        feedback: &mut dyn Feedback,
    ) -> Result<Serviced<DriverChange>> {
        ensure_writable(boot)?;
        require_existing(driver, "driver path")?;
        self.require_setup_index(boot, running, feedback)?;
        let mode = MountMode::ReadWrite;
        self.with_mount(boot, BOOT_SETUP_INDEX, mode, running, feedback, |dir, feedback| {
            self.inject_driver(dir, driver, force_unsigned, "ADDDRVBOOT", running, feedback)
        })
    }

    /// Removes every `.inf` found below `folder` from the setup image of a
    /// `boot.wim`. Commits when at least one removal succeeded.
    pub fn remove_boot_drivers(
        &self,
        boot: &Path,
        folder: &Path,
        running: &AtomicBool,
        feedback: &mut dyn Feedback,
    ) -> Result<Serviced<DriverRemoval>> {
        ensure_writable(boot)?;
        let infs = find_inf_files(folder);
        if infs.is_empty() {
            return Err(Error::InvalidInput(format!(
                "no .inf files below {}",
                folder.display()
            )));
        }
        self.require_setup_index(boot, running, feedback)?;
        let mode = MountMode::ReadWrite;
        self.with_mount(boot, BOOT_SETUP_INDEX, mode, running, feedback, |dir, feedback| {
            let mut failed = Vec::new();
            for inf in &infs {
                let cmd = self.on_image(dir).arg("/Remove-Driver").flag_path("/Driver:", inf);
                let code = self.stream(cmd, running, feedback, "Remove")?;
                if code != 0 {
                    self.logs.error(&format!(
                        "REMDRVBOOT: removing {} failed (rc={code})",
                        inf.display()
                    ));
                    failed.push(inf.clone());
                }
            }
            let commit = failed.len() < infs.len();
            let removal = DriverRemoval {
                attempted: infs.len(),
                failed,
            };
            Ok((removal, commit))
        })
    }

    /// Component store cleanup with `/ResetBase`. Commits only if the tool
    /// succeeded.
    pub fn cleanup_image(
        &self,
        image: &Path,
        index: u32,
        running: &AtomicBool,
        feedback: &mut dyn Feedback,
    ) -> Result<Serviced<i32>> {
        ensure_writable(image)?;
        self.with_mount(image, index, MountMode::ReadWrite, running, feedback, |dir, feedback| {
            let cmd = self
                .on_image(dir)
                .args(["/Cleanup-Image", "/StartComponentCleanup", "/ResetBase"]);
            let code = self.stream(cmd, running, feedback, "Cleanup")?;
            if code != 0 {
                self.logs
                    .error(&format!("CLEANUP: component cleanup failed (rc={code})"));
            }
            Ok((code, code == 0))
        })
    }

    /// Mounts, runs `work` on the mount directory and unmounts, committing
    /// when `work` asks for it and the mount is writable.
    ///
    /// If `work` fails the mount is discarded before the error is returned.
    /// A cancellation leaves the session attached for the exit path.
    fn with_mount<T>(
        &self,
        image: &Path,
        index: u32,
        mode: MountMode,
        running: &AtomicBool,
        feedback: &mut dyn Feedback,
        work: impl FnOnce(&Path, &mut dyn Feedback) -> Result<(T, bool)>,
    ) -> Result<Serviced<T>> {
        let mounted = {
            let mut sink = feedback.step("Mount");
            self.mounts.mount(image, index, mode, running, sink.as_mut())?
        };
        let dir = mounted.session.directory.clone();

        let (value, commit) = match work(&dir, &mut *feedback) {
            Ok(done) => done,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                if let Err(unmount) = self.mounts.unmount(&dir, false, running, &mut Silent) {
                    tracing::warn!(dir = %dir.display(), "discard after failed step: {unmount}");
                }
                return Err(e);
            }
        };

        let commit = commit && mode == MountMode::ReadWrite;
        let mut sink = feedback.step(if commit { "Commit" } else { "Unmount" });
        let unmount = self.mounts.unmount(&dir, commit, running, sink.as_mut())?;
        Ok(Serviced {
            value,
            committed: commit && unmount.tool_succeeded(),
            unmount,
            fallback: mounted.fallback,
        })
    }

    fn inject_driver(
        &self,
        dir: &Path,
        driver: &Path,
        force_unsigned: bool,
        label: &str,
        running: &AtomicBool,
        feedback: &mut dyn Feedback,
    ) -> Result<(DriverChange, bool)> {
        let before = self.driver_count(dir, running, feedback)?;
        let mut cmd = self
            .on_image(dir)
            .arg("/Add-Driver")
            .flag_path("/Driver:", driver)
            .arg("/Recurse");
        if force_unsigned {
            cmd = cmd.arg("/ForceUnsigned");
        }
        let code = self.stream(cmd, running, feedback, "Driver")?;
        if code != 0 {
            self.logs.error(&format!(
                "{label}: adding {} failed (rc={code})",
                driver.display()
            ));
        }
        let after = self.driver_count(dir, running, feedback)?;
        let change = DriverChange { code, before, after };
        Ok((change, code == 0 || change.added() > 0))
    }

    fn driver_count(
        &self,
        dir: &Path,
        running: &AtomicBool,
        feedback: &mut dyn Feedback,
    ) -> Result<usize> {
        let cmd = self.on_image(dir).args(["/Get-Drivers", "/English"]);
        let result = self.query(cmd, running, feedback)?;
        Ok(count_drivers(&result.combined_output()))
    }

    fn require_setup_index(
        &self,
        boot: &Path,
        running: &AtomicBool,
        feedback: &mut dyn Feedback,
    ) -> Result<()> {
        let result = query::image_info(self.tools, self.logs, boot, running, || feedback.tick())?;
        if result.cancelled() {
            return Err(Error::Cancelled);
        }
        if !parse_indices(&result.combined_output()).contains(&BOOT_SETUP_INDEX) {
            return Err(Error::InvalidInput(format!(
                "{} has no index {BOOT_SETUP_INDEX}",
                boot.display()
            )));
        }
        Ok(())
    }

    fn on_image(&self, dir: &Path) -> CommandLine {
        self.tools.primary().flag_path("/Image:", dir)
    }

    fn stream(
        &self,
        cmd: CommandLine,
        running: &AtomicBool,
        feedback: &mut dyn Feedback,
        step: &str,
    ) -> Result<i32> {
        let mut sink = feedback.step(step);
        let code = ProgressStreamer::new(self.logs, self.progress).stream_run(
            &cmd,
            running,
            sink.as_mut(),
        )?;
        if code == CANCELLED_EXIT_CODE {
            return Err(Error::Cancelled);
        }
        Ok(code)
    }

    fn query(
        &self,
        cmd: CommandLine,
        running: &AtomicBool,
        feedback: &mut dyn Feedback,
    ) -> Result<ProcessResult> {
        let result =
            ProcessRunner::new(self.logs).run_with_spinner(&cmd, running, || feedback.tick())?;
        if result.cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(result)
    }
}
