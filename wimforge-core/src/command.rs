use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// A program plus its argument vector.
///
/// Arguments are handed to the OS one by one and never joined into a shell
/// string. The [`fmt::Display`] rendering exists only for logs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl CommandLine {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Appends `<flag><path>`, the `/Name:value` style the image tool expects.
    pub fn flag_path(self, flag: &str, path: &Path) -> Self {
        let mut joined = OsString::from(flag);
        joined.push(path.as_os_str());
        self.arg(joined)
    }

    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_path_joins_without_separator() {
        let cmd = CommandLine::new("dism")
            .arg("/Mount-Wim")
            .flag_path("/MountDir:", Path::new("/tmp/mnt_x"));
        assert_eq!(cmd.args[1], OsString::from("/MountDir:/tmp/mnt_x"));
        assert_eq!(cmd.to_string(), "dism /Mount-Wim /MountDir:/tmp/mnt_x");
    }

    #[test]
    fn paths_with_spaces_stay_one_argument() {
        let cmd = CommandLine::new("wimlib-imagex").args(["export", "/images/My Image.wim"]);
        assert_eq!(cmd.args.len(), 2);
        assert_eq!(cmd.args[1], OsString::from("/images/My Image.wim"));
    }
}
