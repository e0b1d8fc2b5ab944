//! Persistent user settings.
//!
//! Settings live in a small TOML file under the platform configuration
//! directory (`~/.config/wimforge/settings.toml`, `%APPDATA%\wimforge\...`).
//! Every field has a default so a missing or partial file is never an error.
use crate::error::{Error, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const SETTINGS_FILE: &str = "settings.toml";

/// Which tool performs exports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// Use the alternate tool when it answers a version query.
    #[default]
    Auto,
    /// Always use the system image tool.
    Primary,
    /// Always use the alternate image-library tool.
    Alternate,
}

impl FromStr for BackendChoice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "primary" | "dism" => Ok(Self::Primary),
            "alternate" | "wimlib" => Ok(Self::Alternate),
            other => Err(Error::InvalidInput(format!(
                "unknown backend '{other}' (expected auto, primary or alternate)"
            ))),
        }
    }
}

impl fmt::Display for BackendChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Primary => "primary",
            Self::Alternate => "alternate",
        })
    }
}

/// Whether streamed operations draw a progress line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressMode {
    #[default]
    Line,
    Off,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base folder for mount directories. `None` uses the system temp root.
    pub mount_base: Option<PathBuf>,
    /// Append full command transcripts to the verbose log.
    pub verbose: bool,
    pub export_backend: BackendChoice,
    pub progress: ProgressMode,
    /// Animate a spinner while informational queries run.
    pub info_spinner: bool,
    pub log_tail_lines: usize,
    /// Folder for the error log and transcript. `None` uses the system temp root.
    pub log_dir: Option<PathBuf>,
    pub primary_tool: Option<PathBuf>,
    pub alternate_tool: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mount_base: None,
            verbose: false,
            export_backend: BackendChoice::Auto,
            progress: ProgressMode::Line,
            info_spinner: true,
            log_tail_lines: 100,
            log_dir: None,
            primary_tool: None,
            alternate_tool: None,
        }
    }
}

impl Settings {
    /// The default settings file location, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("wimforge").join(SETTINGS_FILE))
    }

    /// Loads settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading settings '{}'", path.display()))
            .map_err(|e| Error::Config(format!("{e:#}")))?;
        toml::from_str(&text)
            .with_context(|| format!("parsing settings '{}'", path.display()))
            .map_err(|e| Error::Config(format!("{e:#}")))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.render()?)?;
        Ok(())
    }

    /// The settings as they would be written to disk.
    pub fn render(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("serializing settings: {e}")))
    }

    /// The folder holding the error log and transcript.
    pub fn log_folder(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.log_tail_lines, 100);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        fs::write(&path, "verbose = true\nexport_backend = \"alternate\"\n").unwrap();
        let settings = Settings::load(&path).unwrap();
        assert!(settings.verbose);
        assert_eq!(settings.export_backend, BackendChoice::Alternate);
        assert_eq!(settings.progress, ProgressMode::Line);
        assert!(settings.info_spinner);
    }

    #[test]
    fn save_then_load_preserves_mount_base() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE);
        let settings = Settings {
            mount_base: Some(dir.path().join("mounts")),
            progress: ProgressMode::Off,
            ..Settings::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), settings);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        fs::write(&path, "export_backend = 7").unwrap();
        assert!(matches!(Settings::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn backend_accepts_tool_names() {
        assert_eq!("wimlib".parse::<BackendChoice>().unwrap(), BackendChoice::Alternate);
        assert_eq!("DISM".parse::<BackendChoice>().unwrap(), BackendChoice::Primary);
        assert!("zip".parse::<BackendChoice>().is_err());
    }
}
