//! Exporting image indices into a destination container.
//!
//! Every index is its own tool invocation so one bad index does not stop the
//! rest of the job. Two interchangeable backends can do the work: the image
//! tool itself, or the image-library tool when it is installed. `auto`
//! re-checks for the library tool on every job.
use crate::command::CommandLine;
use crate::config::{BackendChoice, ProgressMode};
use crate::error::{Error, Result};
use crate::logs::Logs;
use crate::process::{CANCELLED_EXIT_CODE, ProcessRunner};
use crate::progress::{ProgressSink, ProgressStreamer};
use crate::tools::{Tools, alternate_available, ensure_present};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::AtomicBool;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    Max,
    Fast,
    None,
    /// Solid archival compression; only `.esd` containers hold it.
    Recovery,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Max => "max",
            Self::Fast => "fast",
            Self::None => "none",
            Self::Recovery => "recovery",
        })
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "max" => Ok(Self::Max),
            "fast" => Ok(Self::Fast),
            "none" => Ok(Self::None),
            "recovery" => Ok(Self::Recovery),
            other => Err(Error::InvalidInput(format!(
                "unknown compression '{other}' (expected max, fast, none or recovery)"
            ))),
        }
    }
}

/// The tool that actually runs an export.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Primary,
    Alternate,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Primary => "dism",
            Self::Alternate => "wimlib",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportJob {
    pub source: PathBuf,
    /// Processed in order; repeats are exported again.
    pub indices: Vec<u32>,
    pub destination: PathBuf,
    pub compression: Compression,
    pub backend: BackendChoice,
    /// Prefix for error log entries, e.g. `EXPORT`.
    pub label: String,
}

/// A compression mode the destination could not take, and its replacement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressionChange {
    pub requested: Compression,
    pub applied: Compression,
    pub reason: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexResult {
    pub index: u32,
    pub code: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportReport {
    pub backend: Backend,
    pub compression: Compression,
    pub normalized: Option<CompressionChange>,
    pub results: Vec<IndexResult>,
}

impl ExportReport {
    pub fn failed(&self) -> Vec<u32> {
        self.results
            .iter()
            .filter(|r| r.code != 0)
            .map(|r| r.index)
            .collect()
    }

    /// A summary of the failed indices for display, `None` if all succeeded.
    ///
    /// A partial failure is not an error of the job: each failed index has
    /// already been logged and the remaining indices were still exported.
    pub fn failure(&self) -> Option<Error> {
        let failed = self.failed();
        if failed.is_empty() {
            return None;
        }
        Some(Error::PartialExportFailure {
            attempted: self.results.len(),
            failed: failed.len(),
            indices: failed,
        })
    }
}

fn is_esd(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("esd"))
}

/// Rewrites modes the chosen backend cannot produce for `destination`.
///
/// Only the image tool writing a non-`.esd` container needs this: it has no
/// archival codec there, so `recovery` becomes `max`. The library tool turns
/// `recovery` into its own archival flag.
pub fn normalize_compression(
    requested: Compression,
    destination: &Path,
    backend: Backend,
) -> (Compression, Option<CompressionChange>) {
    if requested == Compression::Recovery && backend == Backend::Primary && !is_esd(destination) {
        let change = CompressionChange {
            requested,
            applied: Compression::Max,
            reason: format!(
                "'recovery' is not valid for {}, using 'max'",
                destination.display()
            ),
        };
        return (Compression::Max, Some(change));
    }
    (requested, None)
}

/// Resolves `auto` by probing for the library tool. Never cached.
pub fn resolve_backend(
    choice: BackendChoice,
    runner: &ProcessRunner<'_>,
    tools: &Tools,
) -> Backend {
    match choice {
        BackendChoice::Primary => Backend::Primary,
        BackendChoice::Alternate => Backend::Alternate,
        BackendChoice::Auto => {
            if alternate_available(runner, tools) {
                Backend::Alternate
            } else {
                Backend::Primary
            }
        }
    }
}

pub fn primary_export_args(
    cmd: CommandLine,
    source: &Path,
    index: u32,
    destination: &Path,
    compression: Compression,
) -> CommandLine {
    cmd.arg("/Export-Image")
        .flag_path("/SourceImageFile:", source)
        .arg(format!("/SourceIndex:{index}"))
        .flag_path("/DestinationImageFile:", destination)
        .arg(format!("/Compress:{compression}"))
        .arg("/CheckIntegrity")
}

pub fn alternate_export_args(
    cmd: CommandLine,
    source: &Path,
    index: u32,
    destination: &Path,
    compression: Compression,
) -> CommandLine {
    let cmd = cmd
        .arg("export")
        .arg(source)
        .arg(index.to_string())
        .arg(destination)
        .arg("--check");
    if is_esd(destination) || compression == Compression::Recovery {
        return cmd.arg("--esd");
    }
    cmd.arg(match compression {
        Compression::None => "--compress=none",
        Compression::Fast => "--compress=XPRESS",
        _ => "--compress=LZX",
    })
}

pub struct ExportCoordinator<'a> {
    tools: &'a Tools,
    logs: &'a Logs,
    progress: ProgressMode,
}

impl<'a> ExportCoordinator<'a> {
    pub fn new(tools: &'a Tools, logs: &'a Logs, progress: ProgressMode) -> Self {
        Self {
            tools,
            logs,
            progress,
        }
    }

    /// Exports each index of `job` in turn.
    ///
    /// The backend is resolved and its executable checked first. Only then is
    /// an existing destination file deleted, and only if `confirm_delete`
    /// agrees; otherwise nothing runs and [`Error::DestinationKept`] is
    /// returned. Per-index failures are logged and recorded in the report.
    /// `make_sink` supplies a fresh progress sink for every index.
    pub fn export_indices(
        &self,
        job: &ExportJob,
        confirm_delete: &mut dyn FnMut(&Path) -> bool,
        running: &AtomicBool,
        make_sink: &mut dyn FnMut(u32, Backend) -> Box<dyn ProgressSink>,
    ) -> Result<ExportReport> {
        if job.indices.is_empty() {
            return Err(Error::InvalidInput("no indices selected".into()));
        }

        let runner = ProcessRunner::new(self.logs);
        let backend = resolve_backend(job.backend, &runner, self.tools);
        ensure_present(match backend {
            Backend::Primary => &self.tools.primary,
            Backend::Alternate => &self.tools.alternate,
        })?;

        if job.destination.is_file() {
            if !confirm_delete(&job.destination) {
                return Err(Error::DestinationKept(job.destination.clone()));
            }
            fs::remove_file(&job.destination)?;
        }

        let (compression, normalized) =
            normalize_compression(job.compression, &job.destination, backend);
        if let Some(change) = &normalized {
            tracing::info!(
                requested = %change.requested,
                applied = %change.applied,
                "compression normalized"
            );
        }
        tracing::info!(
            source = %job.source.display(),
            destination = %job.destination.display(),
            %backend,
            %compression,
            indices = ?job.indices,
            "export started"
        );

        let streamer = ProgressStreamer::new(self.logs, self.progress);
        let mut results = Vec::with_capacity(job.indices.len());
        for &index in &job.indices {
            let cmd = match backend {
                Backend::Primary => primary_export_args(
                    self.tools.primary(),
                    &job.source,
                    index,
                    &job.destination,
                    compression,
                ),
                Backend::Alternate => alternate_export_args(
                    self.tools.alternate(),
                    &job.source,
                    index,
                    &job.destination,
                    compression,
                ),
            };
            let mut sink = make_sink(index, backend);
            let code = streamer.stream_run(&cmd, running, sink.as_mut())?;
            if code == CANCELLED_EXIT_CODE {
                return Err(Error::Cancelled);
            }
            if code != 0 {
                self.logs
                    .error(&format!("{}: index {index} failed ({backend})", job.label));
            }
            results.push(IndexResult { index, code });
        }

        Ok(ExportReport {
            backend,
            compression,
            normalized,
            results,
        })
    }
}
