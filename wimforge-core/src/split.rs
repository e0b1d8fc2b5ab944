//! Splitting an image into size-bounded `.swm` parts and joining them again.
//!
//! The parts of a split image share a stem: `install.swm`, `install2.swm`,
//! `install3.swm`, ... The first part carries no number.
use crate::config::ProgressMode;
use crate::error::{Error, Result};
use crate::export::Compression;
use crate::logs::Logs;
use crate::process::{CANCELLED_EXIT_CODE, ProcessRunner};
use crate::progress::{ProgressSink, ProgressStreamer};
use crate::query::parse_indices;
use crate::tools::Tools;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

pub const DEFAULT_CHUNK_MB: u32 = 3800;
pub const MIN_CHUNK_MB: u32 = 100;

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

fn stem_of(path: &Path) -> Result<String> {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| Error::InvalidInput(format!("{} has no file name", path.display())))
}

/// The first part a split of `image` produces: `<stem>.swm` beside it.
pub fn first_part_for(image: &Path) -> Result<PathBuf> {
    Ok(image.with_file_name(format!("{}.swm", stem_of(image)?)))
}

/// Every `<stem>*.swm` file next to `first`, in part order.
pub fn swm_parts(first: &Path) -> Result<Vec<PathBuf>> {
    let stem = stem_of(first)?.to_ascii_lowercase();
    let dir = match first.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut parts: Vec<(u32, String, PathBuf)> = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || !has_extension(&path, "swm") {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
        let Some(rest) = name.strip_prefix(&stem) else {
            continue;
        };
        let suffix = rest.trim_end_matches(".swm");
        let number = match suffix {
            "" => 1,
            digits => digits.parse().unwrap_or(u32::MAX),
        };
        parts.push((number, name, path));
    }
    parts.sort();
    Ok(parts.into_iter().map(|(_, _, path)| path).collect())
}

pub struct Splitter<'a> {
    tools: &'a Tools,
    logs: &'a Logs,
    progress: ProgressMode,
}

impl<'a> Splitter<'a> {
    pub fn new(tools: &'a Tools, logs: &'a Logs, progress: ProgressMode) -> Self {
        Self {
            tools,
            logs,
            progress,
        }
    }

    /// Splits a `.wim` into parts of at most `chunk_mb` megabytes and returns
    /// the parts written.
    pub fn split_image(
        &self,
        image: &Path,
        chunk_mb: u32,
        running: &AtomicBool,
        sink: &mut dyn ProgressSink,
    ) -> Result<Vec<PathBuf>> {
        if !has_extension(image, "wim") {
            return Err(Error::InvalidInput(format!(
                "{} is not a .wim file",
                image.display()
            )));
        }
        if !image.is_file() {
            return Err(Error::InvalidInput(format!("{} not found", image.display())));
        }
        if chunk_mb < MIN_CHUNK_MB {
            return Err(Error::InvalidInput(format!(
                "chunk size {chunk_mb} MB is below the {MIN_CHUNK_MB} MB minimum"
            )));
        }

        let first = first_part_for(image)?;
        let cmd = self
            .tools
            .primary()
            .arg("/Split-Image")
            .flag_path("/ImageFile:", image)
            .flag_path("/SWMFile:", &first)
            .arg(format!("/FileSize:{chunk_mb}"));
        let code = ProgressStreamer::new(self.logs, self.progress).stream_run(&cmd, running, sink)?;
        self.check("Split", code)?;
        let parts = swm_parts(&first)?;
        tracing::info!(image = %image.display(), parts = parts.len(), "split finished");
        Ok(parts)
    }

    /// Index numbers stored in the split image starting at `first`.
    pub fn swm_indices(
        &self,
        first: &Path,
        running: &AtomicBool,
        on_tick: impl FnMut(),
    ) -> Result<Vec<u32>> {
        let cmd = self
            .tools
            .primary()
            .arg("/Get-ImageInfo")
            .flag_path("/ImageFile:", first)
            .flag_path("/SWMFile:", &wildcard_for(first)?);
        let result = ProcessRunner::new(self.logs).run_with_spinner(&cmd, running, on_tick)?;
        self.check("Reading split image info", result.code)?;
        Ok(parse_indices(&result.stdout.unwrap_or_default()))
    }

    /// Joins the parts starting at `first` back into one image holding
    /// `index`.
    ///
    /// Only `max`, `fast` and `none` are accepted. An existing `output` is
    /// deleted only if `confirm_overwrite` agrees.
    #[allow(clippy::too_many_arguments)]
    pub fn recombine(
        &self,
        first: &Path,
        index: u32,
        output: &Path,
        compression: Compression,
        confirm_overwrite: &mut dyn FnMut(&Path) -> bool,
        running: &AtomicBool,
        sink: &mut dyn ProgressSink,
    ) -> Result<()> {
        if !has_extension(first, "swm") || !first.is_file() {
            return Err(Error::InvalidInput(format!(
                "{} is not an existing .swm file",
                first.display()
            )));
        }
        if compression == Compression::Recovery {
            return Err(Error::InvalidInput(
                "recombine supports max, fast or none compression".into(),
            ));
        }
        if output.exists() {
            if !confirm_overwrite(output) {
                return Err(Error::DestinationKept(output.to_path_buf()));
            }
            fs::remove_file(output)?;
        }

        let cmd = self
            .tools
            .primary()
            .arg("/Export-Image")
            .flag_path("/SourceImageFile:", first)
            .flag_path("/SWMFile:", &wildcard_for(first)?)
            .arg(format!("/SourceIndex:{index}"))
            .flag_path("/DestinationImageFile:", output)
            .arg(format!("/Compress:{compression}"))
            .arg("/CheckIntegrity");
        let code = ProgressStreamer::new(self.logs, self.progress).stream_run(&cmd, running, sink)?;
        self.check("Recombine", code)?;
        tracing::info!(output = %output.display(), index, "recombine finished");
        Ok(())
    }

    fn check(&self, operation: &str, code: i32) -> Result<()> {
        match code {
            0 => Ok(()),
            CANCELLED_EXIT_CODE => Err(Error::Cancelled),
            code => {
                self.logs.error(&format!("{operation} failed (rc={code})"));
                Err(Error::ToolFailed {
                    operation: operation.to_string(),
                    code,
                })
            }
        }
    }
}

/// `<dir>/<stem>*.swm`, the pattern the image tool expects for the other parts.
fn wildcard_for(first: &Path) -> Result<PathBuf> {
    Ok(first.with_file_name(format!("{}*.swm", stem_of(first)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::Silent;

    fn touch(dir: &Path, names: &[&str]) {
        for name in names {
            fs::write(dir.join(name), b"part").unwrap();
        }
    }

    #[test]
    fn parts_are_ordered_numerically() {
        let dir = tempfile::tempdir().unwrap();
        touch(
            dir.path(),
            &[
                "install10.swm",
                "install2.swm",
                "install.swm",
                "install3.SWM",
                "other.swm",
                "install.wim",
            ],
        );
        let parts = swm_parts(&dir.path().join("install.swm")).unwrap();
        let names: Vec<_> = parts
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["install.swm", "install2.swm", "install3.SWM", "install10.swm"]);
    }

    #[test]
    fn first_part_and_wildcard_follow_the_stem() {
        let first = first_part_for(Path::new("/media/sources/install.wim")).unwrap();
        assert_eq!(first, PathBuf::from("/media/sources/install.swm"));
        assert_eq!(
            wildcard_for(&first).unwrap(),
            PathBuf::from("/media/sources/install*.swm")
        );
    }

    #[test]
    fn split_validates_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let logs = Logs::new(dir.path(), false);
        let tools = Tools {
            primary: dir.path().join("no-dism"),
            alternate: dir.path().join("no-wimlib"),
        };
        let splitter = Splitter::new(&tools, &logs, ProgressMode::Off);
        let running = AtomicBool::new(true);
        let wim = dir.path().join("install.wim");
        touch(dir.path(), &["install.wim", "install.esd"]);

        let esd_path = dir.path().join("install.esd");
        let esd = splitter.split_image(&esd_path, 3800, &running, &mut Silent);
        assert!(matches!(esd, Err(Error::InvalidInput(_))));
        let small = splitter.split_image(&wim, 99, &running, &mut Silent);
        assert!(matches!(small, Err(Error::InvalidInput(_))));
        let gone = dir.path().join("gone.wim");
        let missing = splitter.split_image(&gone, 3800, &running, &mut Silent);
        assert!(matches!(missing, Err(Error::InvalidInput(_))));
        let spawned = splitter.split_image(&wim, MIN_CHUNK_MB, &running, &mut Silent);
        assert!(matches!(spawned, Err(Error::ToolNotFound { .. })));
    }

    #[cfg(unix)]
    mod tool {
        use super::*;
        use crate::testutil::{fake_tool, recorded_calls};

        const RECORD: &str = "echo \"$@\" >> \"$(dirname \"$0\")/calls.log\"";

        fn rig(body: &str) -> (tempfile::TempDir, Tools, Logs) {
            let dir = tempfile::tempdir().unwrap();
            let tools = Tools {
                primary: fake_tool(dir.path(), "dism", &format!("{RECORD}\n{body}")),
                alternate: dir.path().join("no-wimlib"),
            };
            let logs = Logs::new(dir.path(), false);
            (dir, tools, logs)
        }

        #[test]
        fn split_reports_created_parts() {
            // The fake writes the parts the real tool would.
            let (dir, tools, logs) = rig(
                "d=$(dirname \"$0\")
touch \"$d/install.swm\" \"$d/install2.swm\"
echo '100%' >&2",
            );
            let wim = dir.path().join("install.wim");
            fs::write(&wim, b"image").unwrap();
            let running = AtomicBool::new(true);
            let parts = Splitter::new(&tools, &logs, ProgressMode::Off)
                .split_image(&wim, 3800, &running, &mut Silent)
                .unwrap();
            let expected = vec![dir.path().join("install.swm"), dir.path().join("install2.swm")];
            assert_eq!(parts, expected);
            let call = &recorded_calls(dir.path())[0];
            assert!(call.starts_with("/Split-Image /ImageFile:"));
            assert!(call.ends_with("install.swm /FileSize:3800"));
        }

        #[test]
        fn failed_split_is_logged() {
            let (dir, tools, logs) = rig("exit 3");
            let wim = dir.path().join("install.wim");
            fs::write(&wim, b"image").unwrap();
            let running = AtomicBool::new(true);
            let err = Splitter::new(&tools, &logs, ProgressMode::Off)
                .split_image(&wim, 3800, &running, &mut Silent)
                .unwrap_err();
            assert!(matches!(err, Error::ToolFailed { code: 3, .. }));
            assert_eq!(crate::logs::tail(logs.error_log_path(), 10), ["Split failed (rc=3)"]);
        }

        #[test]
        fn indices_come_from_image_info() {
            let (dir, tools, logs) = rig("echo 'Index : 1'\necho 'Index : 2'");
            let first = dir.path().join("install.swm");
            let running = AtomicBool::new(true);
            let indices = Splitter::new(&tools, &logs, ProgressMode::Off)
                .swm_indices(&first, &running, || {})
                .unwrap();
            assert_eq!(indices, vec![1, 2]);
            let call = &recorded_calls(dir.path())[0];
            assert!(call.starts_with("/Get-ImageInfo /ImageFile:"));
            assert!(call.ends_with("install*.swm"));
        }

        #[test]
        fn recombine_builds_export_with_wildcard() {
            let (dir, tools, logs) = rig("exit 0");
            let first = dir.path().join("install.swm");
            touch(dir.path(), &["install.swm", "install2.swm"]);
            let output = dir.path().join("joined.wim");
            let running = AtomicBool::new(true);
            let splitter = Splitter::new(&tools, &logs, ProgressMode::Off);
            let fast = Compression::Fast;
            splitter
                .recombine(&first, 6, &output, fast, &mut |_| true, &running, &mut Silent)
                .unwrap();
            let call = &recorded_calls(dir.path())[0];
            let expected_swm = format!("/SWMFile:{}", dir.path().join("install*.swm").display());
            assert!(call.contains(&expected_swm));
            assert!(call.contains("/SourceIndex:6"));
            assert!(call.ends_with("/Compress:fast /CheckIntegrity"));
        }

        #[test]
        fn recombine_refuses_recovery_and_kept_output() {
            let (dir, tools, logs) = rig("exit 0");
            let first = dir.path().join("install.swm");
            let output = dir.path().join("joined.wim");
            touch(dir.path(), &["install.swm", "joined.wim"]);
            let running = AtomicBool::new(true);
            let splitter = Splitter::new(&tools, &logs, ProgressMode::Off);

            let recovery = splitter.recombine(
                &first,
                1,
                &output,
                Compression::Recovery,
                &mut |_| true,
                &running,
                &mut Silent,
            );
            assert!(matches!(recovery, Err(Error::InvalidInput(_))));
            let kept = splitter.recombine(
                &first,
                1,
                &output,
                Compression::Max,
                &mut |_| false,
                &running,
                &mut Silent,
            );
            assert!(matches!(kept, Err(Error::DestinationKept(_))));
            assert!(output.exists());
            assert!(recorded_calls(dir.path()).is_empty());
        }
    }
}
