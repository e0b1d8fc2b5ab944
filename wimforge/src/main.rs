mod menu;
mod ops;
mod term;
mod ui;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ops::AfterMount;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;
use wimforge_core::config::{BackendChoice, ProgressMode, Settings};
use wimforge_core::export::Compression;
use wimforge_core::servicing::{FeatureAction, FeatureFilter};
use wimforge_core::session::MountMode;
use wimforge_core::split::DEFAULT_CHUNK_MB;
use wimforge_core::toolkit::Toolkit;

#[derive(Parser)]
#[command(name = "wimforge")]
#[command(about = "An interactive console for servicing Windows image files", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Settings file to use instead of the default location
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Record every tool invocation in the verbose transcript
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Export backend: auto, primary (dism) or alternate (wimlib)
    #[arg(long, global = true, value_name = "BACKEND")]
    backend: Option<BackendChoice>,

    /// Folder to create mount directories in
    #[arg(long, global = true, value_name = "DIR")]
    mount_base: Option<PathBuf>,

    /// Do not draw progress lines
    #[arg(long, global = true)]
    no_progress: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the indexes of an image
    Info {
        #[arg(required = true)]
        image: PathBuf,
    },
    /// Mount an image index, then choose how to unmount it
    Mount {
        #[arg(required = true)]
        image: PathBuf,

        #[arg(short, long, default_value_t = 1)]
        index: u32,

        /// Mount read-write so changes can be committed
        #[arg(short = 'w', long)]
        read_write: bool,
    },
    /// Unmount a mount directory and remove it
    Unmount {
        #[arg(required = true)]
        dir: PathBuf,

        /// Save changes instead of discarding them
        #[arg(short, long)]
        commit: bool,
    },
    /// Show the images the system tool has mounted
    Mounted,
    /// Clear stale mount registrations
    CleanupMounts,
    /// Export indexes into a new or existing WIM/ESD
    Export {
        #[arg(required = true)]
        source: PathBuf,

        #[arg(required = true)]
        destination: PathBuf,

        /// Indexes to export, e.g. `1,3`
        #[arg(short, long, value_delimiter = ',', required = true)]
        indices: Vec<u32>,

        /// max, fast, none or recovery
        #[arg(short = 'c', long, default_value = "max")]
        compress: Compression,

        /// Delete an existing destination without asking
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Convert an ESD into a WIM
    Convert {
        #[arg(required = true)]
        source: PathBuf,

        #[arg(required = true)]
        destination: PathBuf,

        #[arg(short, long, value_delimiter = ',', required = true)]
        indices: Vec<u32>,

        #[arg(short = 'c', long, default_value = "max")]
        compress: Compression,

        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Split a WIM into size-bounded SWM parts
    Split {
        #[arg(required = true)]
        image: PathBuf,

        /// Largest part size in MB
        #[arg(long, default_value_t = DEFAULT_CHUNK_MB)]
        chunk_mb: u32,
    },
    /// Recombine SWM parts into one WIM
    Recombine {
        /// The first part, e.g. install.swm
        #[arg(required = true)]
        first: PathBuf,

        /// Index to recombine; detected when the image holds only one
        #[arg(short, long)]
        index: Option<u32>,

        /// Output WIM (default: <stem>_recombined.wim)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// max, fast or none
        #[arg(short = 'c', long, default_value = "max")]
        compress: Compression,

        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Run CheckHealth and ScanHealth on a read-only mount
    Health {
        #[arg(required = true)]
        image: PathBuf,

        #[arg(short, long, default_value_t = 1)]
        index: u32,
    },
    /// List the optional features of an index
    Features {
        #[arg(required = true)]
        image: PathBuf,

        #[arg(short, long, default_value_t = 1)]
        index: u32,

        /// all, disabled or removed
        #[arg(short, long, default_value = "all")]
        filter: FeatureFilter,
    },
    /// Enable an optional feature and its parents
    EnableFeature {
        #[arg(required = true)]
        image: PathBuf,

        #[arg(required = true)]
        name: String,

        #[arg(short, long, default_value_t = 1)]
        index: u32,
    },
    /// Disable an optional feature
    DisableFeature {
        #[arg(required = true)]
        image: PathBuf,

        #[arg(required = true)]
        name: String,

        #[arg(short, long, default_value_t = 1)]
        index: u32,
    },
    /// Add a .cab or .msu package
    AddPackage {
        #[arg(required = true)]
        image: PathBuf,

        #[arg(required = true)]
        package: PathBuf,

        #[arg(short, long, default_value_t = 1)]
        index: u32,
    },
    /// Add a driver .inf, or every driver below a folder
    AddDriver {
        #[arg(required = true)]
        image: PathBuf,

        #[arg(required = true)]
        driver: PathBuf,

        #[arg(short, long, default_value_t = 1)]
        index: u32,

        /// Accept unsigned drivers
        #[arg(long)]
        force_unsigned: bool,
    },
    /// Add drivers to the setup image (index 2) of a boot.wim
    AddBootDriver {
        #[arg(required = true)]
        boot: PathBuf,

        #[arg(required = true)]
        driver: PathBuf,

        #[arg(long)]
        force_unsigned: bool,
    },
    /// Remove the drivers named by the .inf files below a folder from boot.wim
    RemoveBootDrivers {
        #[arg(required = true)]
        boot: PathBuf,

        #[arg(required = true)]
        folder: PathBuf,
    },
    /// Clean up the component store and reset its base
    CleanupImage {
        #[arg(required = true)]
        image: PathBuf,

        #[arg(short, long, default_value_t = 1)]
        index: u32,
    },
    /// Show the tail of the error log and transcript
    Logs,
    /// Show the effective settings and tool versions
    Settings,
}

/// Unmounts anything left attached and sweeps the mount registry when
/// dropped, so every exit path cleans up.
struct ExitGuard<'a> {
    kit: &'a Toolkit,
    running: Arc<AtomicBool>,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        self.running.store(true, Ordering::SeqCst);
        ops::unmount_leftovers(self.kit, &self.running);
        let Some(report) = self.kit.teardown() else {
            return;
        };
        for (dir, reason) in &report.failed {
            ui::warn(format!("could not remove {}: {reason}", dir.display()));
        }
    }
}

/// Prints a failure and appends it to the error log.
pub fn report_error(kit: &Toolkit, e: &anyhow::Error) {
    ui::error(format!("{e:#}"));
    kit.logs().error(&format!("{e:#}"));
}

fn load_settings(cli: &Cli, path: Option<&Path>) -> (Settings, Option<String>) {
    let (mut settings, problem) = match path {
        Some(path) => match Settings::load(path) {
            Ok(settings) => (settings, None),
            Err(e) => {
                tracing::error!("{e}");
                (Settings::default(), Some(e.to_string()))
            }
        },
        None => (Settings::default(), None),
    };
    if cli.verbose {
        settings.verbose = true;
    }
    if let Some(backend) = cli.backend {
        settings.export_backend = backend;
    }
    if let Some(base) = &cli.mount_base {
        settings.mount_base = Some(base.clone());
    }
    if cli.no_progress {
        settings.progress = ProgressMode::Off;
    }
    (settings, problem)
}

fn run_command(
    kit: &Toolkit,
    running: &AtomicBool,
    command: Commands,
    settings_path: Option<&Path>,
) -> Result<()> {
    let backend = kit.settings().export_backend;
    match command {
        Commands::Info { image } => ops::info(kit, running, &image),
        Commands::Mount {
            image,
            index,
            read_write,
        } => {
            let mode = if read_write {
                MountMode::ReadWrite
            } else {
                MountMode::ReadOnly
            };
            ops::mount(kit, running, &image, index, mode, AfterMount::AskMustUnmount)
        }
        Commands::Unmount { dir, commit } => ops::unmount(kit, running, &dir, commit),
        Commands::Mounted => ops::mounted(kit, running),
        Commands::CleanupMounts => ops::cleanup_mounts(kit),
        Commands::Export {
            source,
            destination,
            indices,
            compress,
            yes,
        } => {
            let job = ops::export_job(source, indices, destination, compress, backend, "EXPORT");
            ops::export(kit, running, &job, yes)
        }
        Commands::Convert {
            source,
            destination,
            indices,
            compress,
            yes,
        } => {
            let label = "CONVERTESD";
            let job = ops::export_job(source, indices, destination, compress, backend, label);
            ops::export(kit, running, &job, yes)
        }
        Commands::Split { image, chunk_mb } => ops::split(kit, running, &image, chunk_mb),
        Commands::Recombine {
            first,
            index,
            output,
            compress,
            yes,
        } => ops::recombine(kit, running, &first, index, output, compress, yes, false),
        Commands::Health { image, index } => ops::check_health(kit, running, &image, index),
        Commands::Features {
            image,
            index,
            filter,
        } => ops::list_features(kit, running, &image, index, filter),
        Commands::EnableFeature { image, name, index } => {
            ops::set_feature(kit, running, &image, index, &name, FeatureAction::Enable)
        }
        Commands::DisableFeature { image, name, index } => {
            ops::set_feature(kit, running, &image, index, &name, FeatureAction::Disable)
        }
        Commands::AddPackage {
            image,
            package,
            index,
        } => ops::add_package(kit, running, &image, index, &package),
        Commands::AddDriver {
            image,
            driver,
            index,
            force_unsigned,
        } => ops::add_driver(kit, running, &image, Some(index), &driver, force_unsigned),
        Commands::AddBootDriver {
            boot,
            driver,
            force_unsigned,
        } => ops::add_driver(kit, running, &boot, None, &driver, force_unsigned),
        Commands::RemoveBootDrivers { boot, folder } => {
            ops::remove_boot_drivers(kit, running, &boot, &folder)
        }
        Commands::CleanupImage { image, index } => ops::cleanup_image(kit, running, &image, index),
        Commands::Logs => ops::show_logs(kit),
        Commands::Settings => ops::show_settings(kit, settings_path),
    }
}

fn main() -> Result<ExitCode> {
    let _echo = term::EchoGuard::new();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Cleared by Ctrl+C; long-running tools watch it and stop.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let cli = Cli::parse();
    let settings_path = cli.config.clone().or_else(Settings::default_path);
    let (settings, problem) = load_settings(&cli, settings_path.as_deref());

    let kit = Toolkit::new(settings);
    kit.logs().start_session();
    if let Some(problem) = problem {
        ui::warn(format!("{problem}; using default settings"));
        kit.logs().error(&problem);
    }
    let guard = ExitGuard {
        kit: &kit,
        running: running.clone(),
    };

    let code = match cli.command {
        Some(command) => match run_command(&kit, &running, command, settings_path.as_deref()) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                report_error(&kit, &e);
                ExitCode::FAILURE
            }
        },
        None => {
            menu::run(&kit, &running, settings_path.as_deref())?;
            ExitCode::SUCCESS
        }
    };

    drop(guard);
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_the_settings_file() {
        let cli = Cli::parse_from([
            "wimforge",
            "--verbose",
            "--backend",
            "wimlib",
            "--mount-base",
            "/scratch",
            "--no-progress",
            "logs",
        ]);
        let (settings, problem) = load_settings(&cli, None);
        assert!(problem.is_none());
        assert!(settings.verbose);
        assert_eq!(settings.export_backend, BackendChoice::Alternate);
        assert_eq!(settings.mount_base, Some(PathBuf::from("/scratch")));
        assert_eq!(settings.progress, ProgressMode::Off);
    }

    #[test]
    fn broken_settings_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "verbose = \"very\"").unwrap();
        let cli = Cli::parse_from(["wimforge", "mounted"]);
        let (settings, problem) = load_settings(&cli, Some(path.as_path()));
        assert_eq!(settings, Settings::default());
        assert!(problem.is_some());
    }

    #[test]
    fn export_parses_index_lists_and_compression() {
        let cli = Cli::parse_from([
            "wimforge", "export", "src.esd", "dst.wim", "-i", "1,3", "-c", "recovery", "-y",
        ]);
        let Some(Commands::Export {
            indices,
            compress,
            yes,
            ..
        }) = cli.command
        else {
            panic!("expected export");
        };
        assert_eq!(indices, vec![1, 3]);
        assert_eq!(compress, Compression::Recovery);
        assert!(yes);
    }

    #[test]
    fn feature_commands_take_a_filter_and_a_name() {
        let cli = Cli::parse_from([
            "wimforge",
            "features",
            "install.wim",
            "-i",
            "3",
            "-f",
            "removed",
        ]);
        let Some(Commands::Features { index, filter, .. }) = cli.command else {
            panic!("expected features");
        };
        assert_eq!(index, 3);
        assert_eq!(filter, FeatureFilter::PayloadRemoved);

        let cli = Cli::parse_from(["wimforge", "enable-feature", "install.wim", "NetFx3"]);
        let Some(Commands::EnableFeature { name, index, .. }) = cli.command else {
            panic!("expected enable-feature");
        };
        assert_eq!((name.as_str(), index), ("NetFx3", 1));
    }

    #[test]
    fn clean_temp_is_not_a_subcommand() {
        assert!(Cli::try_parse_from(["wimforge", "clean-temp"]).is_err());
    }
}
