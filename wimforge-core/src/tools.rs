//! Locating and probing the two external tools.
use crate::command::CommandLine;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::process::ProcessRunner;
use std::path::{Path, PathBuf};

pub const PRIMARY_TOOL: &str = "dism";
pub const ALTERNATE_TOOL: &str = "wimlib-imagex";

/// Resolved locations of the image tool and the image-library tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tools {
    pub primary: PathBuf,
    pub alternate: PathBuf,
}

impl Tools {
    /// Uses the explicit paths from `settings` when set, otherwise searches.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            primary: settings
                .primary_tool
                .clone()
                .unwrap_or_else(locate_primary),
            alternate: settings
                .alternate_tool
                .clone()
                .unwrap_or_else(locate_alternate),
        }
    }

    pub fn primary(&self) -> CommandLine {
        CommandLine::new(&self.primary)
    }

    pub fn alternate(&self) -> CommandLine {
        CommandLine::new(&self.alternate)
    }
}

fn locate_primary() -> PathBuf {
    which::which(PRIMARY_TOOL).unwrap_or_else(|_| PathBuf::from(PRIMARY_TOOL))
}

/// Next to our own executable first, then `PATH`.
fn locate_alternate() -> PathBuf {
    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    if let Some(dir) = beside_exe {
        for name in [format!("{ALTERNATE_TOOL}.exe"), ALTERNATE_TOOL.to_string()] {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    which::which(ALTERNATE_TOOL).unwrap_or_else(|_| PathBuf::from(ALTERNATE_TOOL))
}

/// Runs `program`'s version query. `None` if it is missing or fails.
pub fn query_version(runner: &ProcessRunner<'_>, program: &Path, args: &[&str]) -> Option<String> {
    let result = runner
        .run(&CommandLine::new(program).args(args), true)
        .ok()?;
    if !result.success() {
        return None;
    }
    let stdout = result.stdout.unwrap_or_default();
    let text = if stdout.trim().is_empty() {
        result.stderr.unwrap_or_default()
    } else {
        stdout
    };
    parse_version(&text)
}

/// Whether the alternate tool is present and answers `--version`.
///
/// Checks on every call; nothing is cached.
pub fn alternate_available(runner: &ProcessRunner<'_>, tools: &Tools) -> bool {
    let version = CommandLine::new(&tools.alternate).arg("--version");
    matches!(runner.run(&version, true), Ok(result) if result.success())
}

/// Fails with [`Error::ToolNotFound`] unless `program` resolves to an
/// executable file, either as given or on `PATH`.
pub fn ensure_present(program: &Path) -> Result<()> {
    which::which(program).map(|_| ()).map_err(|_| Error::ToolNotFound {
        program: program.to_path_buf(),
    })
}

/// The first `N.N.N` or `N.N` token in `text`.
pub fn parse_version(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        let mut groups = 1;
        let mut end = skip_digits(bytes, i);
        while groups < 3
            && end + 1 < bytes.len()
            && bytes[end] == b'.'
            && bytes[end + 1].is_ascii_digit()
        {
            end = skip_digits(bytes, end + 1);
            groups += 1;
        }
        if groups >= 2 {
            return Some(text[start..end].to_string());
        }
        i = end;
    }
    None
}

fn skip_digits(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::Logs;

    #[test]
    fn parses_common_version_banners() {
        assert_eq!(parse_version("wimlib v1.14.4").as_deref(), Some("1.14.4"));
        assert_eq!(
            parse_version("wimlib-imagex 1.14.4 (using wimlib 1.13.0)").as_deref(),
            Some("1.14.4")
        );
        assert_eq!(parse_version("Version: 10.0.19041.844").as_deref(), Some("10.0.19041"));
        assert_eq!(parse_version("tool 2.1").as_deref(), Some("2.1"));
        assert_eq!(parse_version("build 42, no dots"), None);
        assert_eq!(parse_version("ends with 3."), None);
    }

    #[test]
    fn explicit_paths_win() {
        let settings = Settings {
            primary_tool: Some(PathBuf::from("/opt/dism")),
            alternate_tool: Some(PathBuf::from("/opt/wimlib")),
            ..Settings::default()
        };
        let tools = Tools::from_settings(&settings);
        assert_eq!(tools.primary, PathBuf::from("/opt/dism"));
        assert_eq!(tools.alternate(), CommandLine::new("/opt/wimlib"));
    }

    #[cfg(unix)]
    #[test]
    fn version_query_reads_version_and_detects_absence() {
        use crate::testutil::fake_tool;
        let dir = tempfile::tempdir().unwrap();
        let logs = Logs::new(dir.path(), false);
        let runner = ProcessRunner::new(&logs);
        let good = fake_tool(dir.path(), "wimlib", "echo 'wimlib-imagex 1.14.4'");
        let broken = fake_tool(dir.path(), "broken", "exit 1");

        assert_eq!(query_version(&runner, &good, &["--version"]).as_deref(), Some("1.14.4"));
        assert_eq!(query_version(&runner, &broken, &["--version"]), None);

        let mut tools = Tools {
            primary: PathBuf::from("dism"),
            alternate: good,
        };
        assert!(alternate_available(&runner, &tools));
        tools.alternate = broken;
        assert!(!alternate_available(&runner, &tools));
        tools.alternate = dir.path().join("missing");
        assert!(!alternate_available(&runner, &tools));
    }

    #[cfg(unix)]
    #[test]
    fn presence_check_needs_an_executable() {
        use crate::testutil::fake_tool;
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "wimlib", "exit 0");
        assert!(ensure_present(&tool).is_ok());
        let err = ensure_present(&dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, Error::ToolNotFound { .. }));
    }
}
