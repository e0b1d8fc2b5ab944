//! The interactive loop shown when no subcommand is given.
use crate::ops::{self, AfterMount};
use crate::ui;
use anyhow::Result;
use console::style;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use wimforge_core::error::Error;
use wimforge_core::export::Compression;
use wimforge_core::servicing::{FeatureAction, FeatureFilter};
use wimforge_core::session::MountMode;
use wimforge_core::split::DEFAULT_CHUNK_MB;
use wimforge_core::toolkit::Toolkit;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Entry {
    Info,
    MountReadWrite,
    MountReadOnly,
    Unmount,
    Mounted,
    CleanupMounts,
    Export,
    Convert,
    Split,
    Recombine,
    Health,
    Features,
    EnableFeature,
    DisableFeature,
    AddPackage,
    AddDriver,
    AddBootDriver,
    RemoveBootDrivers,
    CleanupImage,
    CleanTemp,
    Logs,
    Settings,
    Quit,
}

const ENTRIES: &[(Entry, &str)] = &[
    (Entry::Info, "List image indexes"),
    (Entry::MountReadWrite, "Mount image (read-write)"),
    (Entry::MountReadOnly, "Mount image (read-only)"),
    (Entry::Unmount, "Unmount a mount directory"),
    (Entry::Mounted, "Show mounted images"),
    (Entry::CleanupMounts, "Cleanup orphan mounts"),
    (Entry::Export, "Export indexes to a new WIM/ESD"),
    (Entry::Convert, "Convert ESD to WIM"),
    (Entry::Split, "Split a WIM into SWM parts (FAT32)"),
    (Entry::Recombine, "Recombine SWM parts into a WIM"),
    (Entry::Health, "Check image health (read-only)"),
    (Entry::Features, "List optional features"),
    (Entry::EnableFeature, "Enable a feature"),
    (Entry::DisableFeature, "Disable a feature"),
    (Entry::AddPackage, "Add a package (.cab/.msu)"),
    (Entry::AddDriver, "Add drivers"),
    (Entry::AddBootDriver, "Add drivers to boot.wim (index 2)"),
    (Entry::RemoveBootDrivers, "Remove drivers from boot.wim (index 2)"),
    (Entry::CleanupImage, "Clean up the component store"),
    (Entry::CleanTemp, "Clean this session's temp folders"),
    (Entry::Logs, "Show recent logs"),
    (Entry::Settings, "Settings"),
    (Entry::Quit, "Quit"),
];

/// Runs the menu until the user quits. A failing entry is reported and the
/// loop carries on.
pub fn run(kit: &Toolkit, running: &AtomicBool, settings_path: Option<&Path>) -> Result<()> {
    let labels: Vec<&str> = ENTRIES.iter().map(|(_, label)| *label).collect();
    let mut last = 0;
    loop {
        println!();
        let title = style("wimforge").green().bold().to_string();
        let Some(pick) = ui::choose(&title, &labels, last)? else {
            return Ok(());
        };
        last = pick;
        let entry = ENTRIES[pick].0;
        if entry == Entry::Quit {
            return Ok(());
        }

        // Re-arm after a Ctrl+C that cancelled the previous entry.
        running.store(true, Ordering::SeqCst);
        if let Err(e) = dispatch(kit, running, entry, settings_path) {
            crate::report_error(kit, &e);
        }
    }
}

fn dispatch(
    kit: &Toolkit,
    running: &AtomicBool,
    entry: Entry,
    settings_path: Option<&Path>,
) -> Result<()> {
    match entry {
        Entry::Info => {
            let image = ui::ask_path("WIM/ESD path")?;
            ops::info(kit, running, &image)
        }
        Entry::MountReadWrite | Entry::MountReadOnly => {
            let mode = if entry == Entry::MountReadWrite {
                MountMode::ReadWrite
            } else {
                MountMode::ReadOnly
            };
            let image = ui::ask_path("WIM/ESD path")?;
            let index = ui::ask_number("Index", 1)?;
            ops::mount(kit, running, &image, index, mode, AfterMount::Ask)
        }
        Entry::Unmount => {
            let dir = pick_mount_dir(kit)?;
            let commit = ui::confirm("Save changes (commit)?", false)?;
            ops::unmount(kit, running, &dir, commit)
        }
        Entry::Mounted => ops::mounted(kit, running),
        Entry::CleanupMounts => ops::cleanup_mounts(kit),
        Entry::Export | Entry::Convert => {
            let convert = entry == Entry::Convert;
            let source = ui::ask_path(if convert { "ESD path" } else { "Source WIM/ESD" })?;
            ops::info(kit, running, &source)?;
            let indices = ui::parse_index_list(&ui::ask_text("Indexes (e.g. 1,3)", "1")?)?;
            let destination = ui::ask_path(if convert {
                "Destination WIM (.wim)"
            } else {
                "Destination WIM/ESD"
            })?;
            let compression = ask_compression(&["max", "fast", "none", "recovery"])?;
            let job = ops::export_job(
                source,
                indices,
                destination,
                compression,
                kit.settings().export_backend,
                if convert { "CONVERTESD" } else { "EXPORT" },
            );
            ops::export(kit, running, &job, false)
        }
        Entry::Split => {
            let image = ui::ask_path("Path to the .wim")?;
            let size = std::fs::metadata(&image).map(|m| m.len()).unwrap_or(0);
            if size < FAT32_LIMIT
                && !ui::confirm("The file fits on FAT32 already. Split anyway?", false)?
            {
                return Ok(());
            }
            let chunk = ui::ask_number("Chunk size in MB", DEFAULT_CHUNK_MB)?;
            ops::split(kit, running, &image, chunk)
        }
        Entry::Recombine => {
            let first = ui::ask_path("First .swm part (e.g. install.swm)")?;
            let output = ui::ask_path_or("Output WIM", ops::recombined_name(&first))?;
            let compression = ask_compression(&["max", "fast", "none"])?;
            ops::recombine(kit, running, &first, None, Some(output), compression, false, true)
        }
        Entry::Health => {
            let (image, index) = ask_image_index()?;
            ops::check_health(kit, running, &image, index)
        }
        Entry::Features => {
            let (image, index) = ask_image_index()?;
            let filters = ["All", "Disabled", "Payload removed"];
            let filter = match ui::choose("Show", &filters, 0)? {
                Some(1) => FeatureFilter::Disabled,
                Some(2) => FeatureFilter::PayloadRemoved,
                Some(_) => FeatureFilter::All,
                None => return Err(Error::Cancelled.into()),
            };
            ops::list_features(kit, running, &image, index, filter)
        }
        Entry::EnableFeature | Entry::DisableFeature => {
            let (image, index) = ask_image_index()?;
            let name = ui::ask_text("Feature name", "")?;
            let action = if entry == Entry::EnableFeature {
                FeatureAction::Enable
            } else {
                FeatureAction::Disable
            };
            ops::set_feature(kit, running, &image, index, &name, action)
        }
        Entry::AddPackage => {
            let (image, index) = ask_image_index()?;
            let package = ui::ask_path("Package (.cab/.msu)")?;
            ops::add_package(kit, running, &image, index, &package)
        }
        Entry::AddDriver => {
            let (image, index) = ask_image_index()?;
            let driver = ui::ask_path("Driver .inf or folder")?;
            let force = ui::confirm("Accept unsigned drivers?", false)?;
            ops::add_driver(kit, running, &image, Some(index), &driver, force)
        }
        Entry::AddBootDriver => {
            let boot = ui::ask_path("Path to boot.wim")?;
            let driver = ui::ask_path("Driver .inf or folder")?;
            let force = ui::confirm("Accept unsigned drivers?", false)?;
            ops::add_driver(kit, running, &boot, None, &driver, force)
        }
        Entry::RemoveBootDrivers => {
            let boot = ui::ask_path("Path to boot.wim")?;
            let folder = ui::ask_path("Folder with the .inf files to remove")?;
            ops::remove_boot_drivers(kit, running, &boot, &folder)
        }
        Entry::CleanupImage => {
            let (image, index) = ask_image_index()?;
            ops::cleanup_image(kit, running, &image, index)
        }
        Entry::CleanTemp => ops::clean_temp(kit),
        Entry::Logs => ops::show_logs(kit),
        Entry::Settings => match settings_path {
            Some(path) => ops::edit_settings(kit.settings(), path),
            None => ops::show_settings(kit, None),
        },
        Entry::Quit => Ok(()),
    }
}

fn ask_image_index() -> Result<(PathBuf, u32)> {
    let image = ui::ask_path("WIM/ESD path")?;
    let index = ui::ask_number("Index", 1)?;
    Ok((image, index))
}

const FAT32_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

fn ask_compression(modes: &[&str]) -> Result<Compression> {
    match ui::choose("Compression", modes, 0)? {
        Some(pick) => Ok(modes[pick].parse()?),
        None => Err(Error::Cancelled.into()),
    }
}

/// Offers this session's mounts, or any directory typed in.
fn pick_mount_dir(kit: &Toolkit) -> Result<PathBuf> {
    let sessions = kit.tracker().sessions();
    if sessions.is_empty() {
        return ui::ask_path("Mount directory to unmount");
    }
    let mut labels: Vec<String> = sessions
        .iter()
        .map(|s| {
            format!(
                "{} ({} #{} {})",
                s.directory.display(),
                s.image.display(),
                s.index,
                s.mode
            )
        })
        .collect();
    labels.push("Another directory...".to_string());
    match ui::choose("Mount directory", &labels, 0)? {
        Some(pick) if pick < sessions.len() => Ok(sessions[pick].directory.clone()),
        Some(_) => ui::ask_path("Mount directory to unmount"),
        None => Err(Error::Cancelled.into()),
    }
}
