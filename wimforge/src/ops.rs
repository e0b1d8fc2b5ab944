//! The operations behind both the subcommands and the menu.
//!
//! Each one takes fully gathered inputs, drives the core library and prints
//! the outcome. Failures are returned for the caller to report.
use crate::ui;
use anyhow::{Context, Result, bail};
use console::style;
use indicatif::{HumanBytes, ProgressBar};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use wimforge_core::config::{BackendChoice, ProgressMode, Settings};
use wimforge_core::error::Error;
use wimforge_core::export::{Backend, Compression, ExportJob};
use wimforge_core::logs;
use wimforge_core::progress::{ProgressSink, Silent};
use wimforge_core::query;
use wimforge_core::servicing::{Feedback, FeatureAction, FeatureFilter, FeatureState, Serviced};
use wimforge_core::session::{MountMode, MountSession, dir_size};
use wimforge_core::split::swm_parts;
use wimforge_core::toolkit::Toolkit;
use wimforge_core::tools::{PRIMARY_TOOL, alternate_available, query_version};

/// What to do with a mount once it is up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AfterMount {
    /// Ask; "leave mounted" is offered.
    Ask,
    /// Ask, but the mount must be undone before returning.
    AskMustUnmount,
}

fn with_spinner<T>(kit: &Toolkit, message: &str, work: impl FnOnce(&mut dyn FnMut()) -> T) -> T {
    let pb = ui::spinner(message, kit.settings().info_spinner);
    let mut tick = || pb.tick();
    let result = work(&mut tick);
    pb.finish_and_clear();
    result
}

pub fn info(kit: &Toolkit, running: &AtomicBool, image: &Path) -> Result<()> {
    let result = with_spinner(kit, "Reading image information...", |tick| {
        query::image_info(kit.tools(), kit.logs(), image, running, tick)
    })?;
    if result.cancelled() {
        return Err(Error::Cancelled.into());
    }
    ui::print_output(result.stdout.as_deref());
    if !result.success() {
        ui::print_output(result.stderr.as_deref());
        bail!("reading {} failed (rc={})", image.display(), result.code);
    }
    Ok(())
}

pub fn mounted(kit: &Toolkit, running: &AtomicBool) -> Result<()> {
    let result = with_spinner(kit, "Querying mounted images...", |tick| {
        query::mounted_images(kit.tools(), kit.logs(), running, tick)
    })?;
    if result.cancelled() {
        return Err(Error::Cancelled.into());
    }
    ui::print_output(result.stdout.as_deref());
    let sessions = kit.tracker().sessions();
    if !sessions.is_empty() {
        ui::header("Mounted by this session");
        for session in sessions {
            print_session(&session);
        }
    }
    Ok(())
}

fn print_session(session: &MountSession) {
    println!(
        "  {} {} #{} -> {}",
        style(session.mode).yellow(),
        session.image.display(),
        session.index,
        style(session.directory.display()).cyan()
    );
}

pub fn cleanup_mounts(kit: &Toolkit) -> Result<()> {
    let result = kit.mounts().cleanup_orphans()?;
    if result.success() {
        ui::ok("Orphan mount registrations cleaned up.");
    } else {
        ui::warn(format!("{PRIMARY_TOOL} reported rc={} during cleanup.", result.code));
    }
    Ok(())
}

pub fn mount(
    kit: &Toolkit,
    running: &AtomicBool,
    image: &Path,
    index: u32,
    mode: MountMode,
    after: AfterMount,
) -> Result<()> {
    let mut line = ui::progress_line("Mount");
    let mounted = kit.mounts().mount(image, index, mode, running, &mut line)?;
    if let Some(notice) = &mounted.fallback {
        ui::warn(notice);
    }
    let dir = &mounted.session.directory;
    if dir.join("Windows").is_dir() {
        ui::ok(format!("Mounted ({mode}): {}", style(dir.display()).cyan()));
    } else {
        ui::info(format!(
            "Mounted ({mode}) on {}, but it has no Windows folder (different image?)",
            dir.display()
        ));
    }

    let mut actions = Vec::new();
    if after == AfterMount::Ask {
        actions.push(("Leave mounted and return", None));
    }
    if mode == MountMode::ReadWrite {
        actions.push(("Unmount and save changes (commit)", Some(true)));
        actions.push(("Unmount and discard changes", Some(false)));
    } else {
        actions.push(("Unmount", Some(false)));
    }
    let labels: Vec<&str> = actions.iter().map(|(label, _)| *label).collect();
    let choice = ui::choose("Next", &labels, 0)?;
    let commit = match choice.map(|i| actions[i].1) {
        Some(Some(commit)) => commit,
        _ if after == AfterMount::Ask => {
            ui::info("Left mounted. Unmount it from the menu before quitting to keep changes.");
            return Ok(());
        }
        // Backing out of a mount that must not outlive us discards it.
        _ => false,
    };
    unmount(kit, running, dir, commit)
}

pub fn unmount(kit: &Toolkit, running: &AtomicBool, dir: &Path, commit: bool) -> Result<()> {
    let mut line = ui::progress_line(if commit { "Commit" } else { "Unmount" });
    let outcome = kit.mounts().unmount(dir, commit, running, &mut line)?;
    match outcome.code {
        None => ui::info(format!("{} was not mounted; stopped tracking it.", dir.display())),
        Some(0) => ui::ok(if commit {
            "Unmounted, changes saved."
        } else {
            "Unmounted, changes discarded."
        }),
        Some(code) => ui::warn(format!("Unmount reported rc={code}; see the error log.")),
    }
    if let Some(err) = outcome.removal.into_error() {
        ui::warn(err);
    }
    Ok(())
}

/// Mounts still attached when the process is about to exit.
pub fn unmount_leftovers(kit: &Toolkit, running: &AtomicBool) {
    for session in kit.tracker().sessions() {
        ui::warn(format!(
            "{} is still mounted; discarding its changes.",
            session.directory.display()
        ));
        if let Err(e) = kit
            .mounts()
            .unmount_session(&session, false, running, &mut Silent)
        {
            kit.logs().error(&format!("Exit unmount of {}: {e}", session.directory.display()));
        }
    }
}

/// Progress lines for streamed steps and a spinner for the queries between
/// them.
struct Console {
    spinner_enabled: bool,
    spinner: Option<ProgressBar>,
}

impl Console {
    fn new(kit: &Toolkit) -> Self {
        Self {
            spinner_enabled: kit.settings().info_spinner,
            spinner: None,
        }
    }

    fn clear(&mut self) {
        if let Some(pb) = self.spinner.take() {
            pb.finish_and_clear();
        }
    }
}

impl Feedback for Console {
    fn step(&mut self, step: &str) -> Box<dyn ProgressSink> {
        self.clear();
        Box::new(ui::progress_line(step))
    }

    fn tick(&mut self) {
        let enabled = self.spinner_enabled;
        self.spinner
            .get_or_insert_with(|| ui::spinner("Querying the image...", enabled))
            .tick();
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Mount notices and the final verdict of a read-write operation.
fn report_serviced<T>(done: &Serviced<T>, saved: &str) {
    if let Some(notice) = &done.fallback {
        ui::warn(notice);
    }
    if let Some(err) = done.unmount.removal.clone().into_error() {
        ui::warn(err);
    }
    if done.committed {
        ui::ok(saved);
    } else if !done.unmount.tool_succeeded() {
        ui::warn("Unmount reported an error; see the error log.");
    } else {
        ui::warn("Nothing was saved; the image is unchanged. See the error log.");
    }
}

pub fn check_health(kit: &Toolkit, running: &AtomicBool, image: &Path, index: u32) -> Result<()> {
    let done = kit
        .servicer()
        .check_health(image, index, running, &mut Console::new(kit))?;
    if let Some(notice) = &done.fallback {
        ui::warn(notice);
    }
    for (title, result) in [("CheckHealth", &done.value.check), ("ScanHealth", &done.value.scan)] {
        ui::header(title);
        ui::print_output(result.stdout.as_deref());
        if !result.success() {
            ui::print_output(result.stderr.as_deref());
            ui::warn(format!("{title} reported rc={}", result.code));
        }
    }
    Ok(())
}

pub fn list_features(
    kit: &Toolkit,
    running: &AtomicBool,
    image: &Path,
    index: u32,
    filter: FeatureFilter,
) -> Result<()> {
    let done = kit
        .servicer()
        .list_features(image, index, filter, running, &mut Console::new(kit))?;
    if let Some(notice) = &done.fallback {
        ui::warn(notice);
    }
    if done.value.is_empty() {
        ui::info("No features match.");
        return Ok(());
    }
    for feature in &done.value {
        println!("  {:<48} {}", feature.name, style(&feature.state).yellow());
    }
    ui::info(format!("{} feature(s)", done.value.len()));
    Ok(())
}

pub fn set_feature(
    kit: &Toolkit,
    running: &AtomicBool,
    image: &Path,
    index: u32,
    name: &str,
    action: FeatureAction,
) -> Result<()> {
    let done = kit
        .servicer()
        .set_feature(image, index, name, action, running, &mut Console::new(kit))?;
    match &done.value.state {
        FeatureState::Unknown => ui::info("The tool did not report the feature's state."),
        FeatureState::Reached(state)
        | FeatureState::Pending(state)
        | FeatureState::Other(state) => ui::info(format!("{} is now: {state}", name.trim())),
    }
    if let FeatureState::Pending(_) = done.value.state {
        ui::info("The change completes the next time the image boots.");
    }
    report_serviced(&done, "Feature change saved.");
    Ok(())
}

pub fn add_package(
    kit: &Toolkit,
    running: &AtomicBool,
    image: &Path,
    index: u32,
    package: &Path,
) -> Result<()> {
    let done = kit
        .servicer()
        .add_package(image, index, package, running, &mut Console::new(kit))?;
    report_serviced(&done, "Package added.");
    Ok(())
}

/// Adds drivers to `index` of `image`, or to the setup image of a
/// `boot.wim` when `index` is `None`.
pub fn add_driver(
    kit: &Toolkit,
    running: &AtomicBool,
    image: &Path,
    index: Option<u32>,
    driver: &Path,
    force_unsigned: bool,
) -> Result<()> {
    let servicer = kit.servicer();
    let mut console = Console::new(kit);
    let done = match index {
        Some(index) => {
            servicer.add_driver(image, index, driver, force_unsigned, running, &mut console)?
        }
        None => servicer.add_boot_driver(image, driver, force_unsigned, running, &mut console)?,
    };
    drop(console);
    let change = done.value;
    ui::info(format!(
        "Third-party drivers: {} before, {} after",
        change.before, change.after
    ));
    report_serviced(&done, "Drivers added.");
    Ok(())
}

pub fn remove_boot_drivers(
    kit: &Toolkit,
    running: &AtomicBool,
    boot: &Path,
    folder: &Path,
) -> Result<()> {
    let done = kit
        .servicer()
        .remove_boot_drivers(boot, folder, running, &mut Console::new(kit))?;
    let removal = &done.value;
    for inf in &removal.failed {
        ui::warn(format!("could not remove {}", inf.display()));
    }
    ui::info(format!(
        "Removed {} of {} driver(s)",
        removal.attempted - removal.failed.len(),
        removal.attempted
    ));
    report_serviced(&done, "Boot image updated.");
    Ok(())
}

pub fn cleanup_image(kit: &Toolkit, running: &AtomicBool, image: &Path, index: u32) -> Result<()> {
    let done = kit
        .servicer()
        .cleanup_image(image, index, running, &mut Console::new(kit))?;
    report_serviced(&done, "Component store cleaned up.");
    Ok(())
}

pub fn confirm_replace(path: &Path, assume_yes: bool) -> bool {
    if assume_yes {
        return true;
    }
    let prompt = format!("{} already exists. Delete it?", path.display());
    ui::confirm(&prompt, false).unwrap_or(false)
}

pub fn export(
    kit: &Toolkit,
    running: &AtomicBool,
    job: &ExportJob,
    assume_yes: bool,
) -> Result<()> {
    let mut confirm = |path: &Path| confirm_replace(path, assume_yes);
    let mut make_sink = |index: u32, backend: Backend| -> Box<dyn ProgressSink> {
        ui::info(format!("Exporting index {index} ({backend})..."));
        Box::new(ui::progress_line(&format!("Index {index}")))
    };
    let report = kit
        .exports()
        .export_indices(job, &mut confirm, running, &mut make_sink)?;
    if let Some(change) = &report.normalized {
        ui::info(&change.reason);
    }
    // Failed indices are already in the error log; the rest were written.
    let written = report.results.len() - report.failed().len();
    match report.failure() {
        Some(failure) => ui::warn(format!(
            "{failure}; {written} index(es) written to {}",
            job.destination.display()
        )),
        None => ui::ok(format!(
            "{written} index(es) written to {}",
            style(job.destination.display()).cyan()
        )),
    }
    Ok(())
}

pub fn export_job(
    source: PathBuf,
    indices: Vec<u32>,
    destination: PathBuf,
    compression: Compression,
    backend: BackendChoice,
    label: &str,
) -> ExportJob {
    ExportJob {
        source,
        indices,
        destination,
        compression,
        backend,
        label: label.to_string(),
    }
}

pub fn split(kit: &Toolkit, running: &AtomicBool, image: &Path, chunk_mb: u32) -> Result<()> {
    let size = fs::metadata(image)
        .with_context(|| format!("reading {}", image.display()))?
        .len();
    ui::info(format!("{} is {}", image.display(), HumanBytes(size)));
    let mut line = ui::progress_line("Split");
    let parts = kit.splitter().split_image(image, chunk_mb, running, &mut line)?;
    ui::ok(format!("Split into {} part(s):", parts.len()));
    for part in parts {
        let len = fs::metadata(&part).map(|m| m.len()).unwrap_or(0);
        println!("  - {} ({})", part.display(), HumanBytes(len));
    }
    Ok(())
}

/// Default recombine output: `<stem>_recombined.wim` beside the first part.
pub fn recombined_name(first: &Path) -> PathBuf {
    let stem = first
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    first.with_file_name(format!("{stem}_recombined.wim"))
}

#[allow(clippy::too_many_arguments)]
pub fn recombine(
    kit: &Toolkit,
    running: &AtomicBool,
    first: &Path,
    index: Option<u32>,
    output: Option<PathBuf>,
    compression: Compression,
    assume_yes: bool,
    interactive: bool,
) -> Result<()> {
    let parts = swm_parts(first)?;
    if parts.is_empty() {
        bail!("no .swm parts found next to {}", first.display());
    }
    let total: u64 = parts
        .iter()
        .filter_map(|p| fs::metadata(p).ok())
        .map(|m| m.len())
        .sum();
    ui::info(format!("Found {} part(s), {} in total", parts.len(), HumanBytes(total)));

    let index = match index {
        Some(index) => index,
        None => {
            let indices = with_spinner(kit, "Reading image info from parts...", |tick| {
                kit.splitter().swm_indices(first, running, tick)
            })?;
            match indices.as_slice() {
                [] => bail!("no indices found in {}", first.display()),
                [only] => *only,
                many if interactive => {
                    let labels: Vec<String> = many.iter().map(|i| format!("Index {i}")).collect();
                    match ui::choose("Index to recombine", &labels, 0)? {
                        Some(pick) => many[pick],
                        None => return Err(Error::Cancelled.into()),
                    }
                }
                many => bail!("the image holds indices {many:?}; pick one with --index"),
            }
        }
    };
    let output = output.unwrap_or_else(|| recombined_name(first));
    let mut confirm = |path: &Path| confirm_replace(path, assume_yes);
    let mut line = ui::progress_line("Recombine");
    kit.splitter()
        .recombine(first, index, &output, compression, &mut confirm, running, &mut line)?;
    let len = fs::metadata(&output).map(|m| m.len()).unwrap_or(0);
    ui::ok(format!(
        "Recombined image {} ({})",
        style(output.display()).cyan(),
        HumanBytes(len)
    ));
    Ok(())
}

/// Removes this session's scratch directories that have nothing mounted.
pub fn clean_temp(kit: &Toolkit) -> Result<()> {
    let mounted: Vec<PathBuf> = kit
        .tracker()
        .sessions()
        .into_iter()
        .map(|s| s.directory)
        .collect();
    let idle: Vec<PathBuf> = kit
        .tracker()
        .tracked_dirs()
        .into_iter()
        .filter(|dir| !mounted.contains(dir))
        .collect();
    if idle.is_empty() {
        ui::info("No unused mount folders from this session.");
        return Ok(());
    }

    let mut reclaimed = 0;
    let mut failed = 0;
    for dir in &idle {
        let size = dir_size(dir);
        let outcome = kit.tracker().release(dir);
        if outcome.is_gone() {
            println!("  - removed {} ({})", dir.display(), HumanBytes(size));
            reclaimed += size;
        } else {
            failed += 1;
            if let Some(err) = outcome.into_error() {
                kit.logs().error(&format!("[CLEANUP] {err}"));
                ui::warn(err);
            }
        }
    }
    ui::ok(format!(
        "Removed {} of {} folder(s), reclaimed {}",
        idle.len() - failed,
        idle.len(),
        HumanBytes(reclaimed)
    ));
    if !mounted.is_empty() {
        ui::info(format!("{} folder(s) still mounted were left alone.", mounted.len()));
    }
    Ok(())
}

pub fn show_logs(kit: &Toolkit) -> Result<()> {
    let lines = kit.settings().log_tail_lines;
    for (title, path) in [
        ("Error log", kit.logs().error_log_path()),
        ("Verbose log", kit.logs().transcript_path()),
    ] {
        ui::header(&format!("{title}: {}", path.display()));
        let tail = logs::tail(path, lines);
        if tail.is_empty() {
            println!("  (empty)");
        }
        for line in tail {
            println!("{line}");
        }
    }
    Ok(())
}

pub fn show_settings(kit: &Toolkit, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => ui::header(&format!("Settings: {}", path.display())),
        None => ui::header("Settings (no config directory on this platform)"),
    }
    print!("{}", kit.settings().render()?);

    let runner = kit.runner();
    let primary = query_version(&runner, &kit.tools().primary, &["/English", "/?"]);
    println!(
        "{:<14} {} ({})",
        "image tool",
        kit.tools().primary.display(),
        primary.as_deref().unwrap_or("version unknown")
    );
    let alternate = if alternate_available(&runner, kit.tools()) {
        query_version(&runner, &kit.tools().alternate, &["--version"])
            .unwrap_or_else(|| "present".to_string())
    } else {
        "not available".to_string()
    };
    println!(
        "{:<14} {} ({alternate})",
        "library tool",
        kit.tools().alternate.display()
    );
    Ok(())
}

/// Interactive settings editor. Changes apply from the next start.
pub fn edit_settings(current: &Settings, path: &Path) -> Result<()> {
    let mut settings = current.clone();
    let base = settings
        .mount_base
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let base = ui::ask_text("Mount folder (empty = system temp)", &base)?;
    settings.mount_base = match base.trim() {
        "" => None,
        dir => Some(PathBuf::from(dir)),
    };
    settings.verbose = ui::confirm("Write a verbose command transcript?", settings.verbose)?;
    let backends = [BackendChoice::Auto, BackendChoice::Primary, BackendChoice::Alternate];
    let current_backend = backends
        .iter()
        .position(|b| *b == settings.export_backend)
        .unwrap_or(0);
    if let Some(pick) = ui::choose("Export backend", &backends, current_backend)? {
        settings.export_backend = backends[pick];
    }
    let draw = ui::confirm("Draw a progress line?", settings.progress == ProgressMode::Line)?;
    settings.progress = if draw { ProgressMode::Line } else { ProgressMode::Off };
    settings.info_spinner = ui::confirm("Show a spinner for queries?", settings.info_spinner)?;

    settings.save(path)?;
    ui::ok(format!("Saved {}. Changes apply the next time wimforge starts.", path.display()));
    Ok(())
}
