//! Stubborn directory removal.
//!
//! Right after an unmount the OS or the image tool frequently still holds a
//! handle inside the mount directory, so a single `remove_dir_all` is not
//! enough. [`remove_dir_tree`] retries with a short delay, clearing read-only
//! bits between attempts, and as a last resort renames the directory to a
//! sentinel name before one final attempt. It never returns an error: the
//! result is a [`RemovalOutcome`] for the caller to log.
use crate::error::Error;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use walkdir::WalkDir;

const SENTINEL_SUFFIX: &str = "_to_delete";

/// Filesystem operations used by [`remove_dir_tree`].
pub trait DirOps {
    fn exists(&self, path: &Path) -> bool;
    fn remove_all(&self, path: &Path) -> io::Result<()>;
    /// Best-effort: clear read-only attributes below `path`.
    fn make_writable(&self, path: &Path);
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn pause(&self, delay: Duration);
}

/// The real filesystem.
pub struct RealFs;

impl DirOps for RealFs {
    fn exists(&self, path: &Path) -> bool {
        path.symlink_metadata().is_ok()
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path)
    }

    fn make_writable(&self, path: &Path) {
        for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
            let Ok(meta) = entry.path().symlink_metadata() else {
                continue;
            };
            if meta.file_type().is_symlink() {
                continue;
            }
            let mut perms = meta.permissions();
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let owner = if meta.is_dir() { 0o700 } else { 0o600 };
                perms.set_mode(perms.mode() | owner);
            }
            #[cfg(not(unix))]
            #[allow(clippy::permissions_set_readonly_false)]
            perms.set_readonly(false);
            fs::set_permissions(entry.path(), perms).ok();
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn pause(&self, delay: Duration) {
        thread::sleep(delay);
    }
}

/// How persistently to retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(200),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemovalOutcome {
    /// Nothing was there to remove.
    AlreadyAbsent,
    Removed { attempts: u32 },
    /// Removed only after being renamed out of the way.
    RemovedAfterRename { sentinel: PathBuf },
    /// Still on disk; `path` is where it now lives.
    Failed { path: PathBuf, reason: String },
}

impl RemovalOutcome {
    pub fn is_gone(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    /// The failure as a [`Error::CleanupFailure`], for logging.
    pub fn into_error(self) -> Option<Error> {
        match self {
            Self::Failed { path, reason } => Some(Error::CleanupFailure { path, reason }),
            _ => None,
        }
    }
}

/// Removes `path` and everything below it, retrying per `policy`.
///
/// Calling this on a path that does not exist is a no-op.
pub fn remove_dir_tree(ops: &dyn DirOps, path: &Path, policy: RetryPolicy) -> RemovalOutcome {
    if !ops.exists(path) {
        return RemovalOutcome::AlreadyAbsent;
    }

    let attempts = policy.attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        match ops.remove_all(path) {
            Ok(()) => return RemovalOutcome::Removed { attempts: attempt },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return RemovalOutcome::Removed { attempts: attempt };
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), attempt, "removal failed: {e}");
                last_error = e.to_string();
                ops.make_writable(path);
                ops.pause(policy.delay);
            }
        }
    }

    let sentinel = sentinel_for(ops, path);
    if let Err(e) = ops.rename(path, &sentinel) {
        return RemovalOutcome::Failed {
            path: path.to_path_buf(),
            reason: format!("{last_error}; rename to sentinel failed: {e}"),
        };
    }
    ops.make_writable(&sentinel);
    match ops.remove_all(&sentinel) {
        Ok(()) => RemovalOutcome::RemovedAfterRename { sentinel },
        Err(e) => RemovalOutcome::Failed {
            path: sentinel,
            reason: e.to_string(),
        },
    }
}

/// `<name>_to_delete`, made unique if an earlier sentinel is still around.
fn sentinel_for(ops: &dyn DirOps, path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mount".to_string());
    let mut candidate = path.with_file_name(format!("{name}{SENTINEL_SUFFIX}"));
    let mut n = 2;
    while ops.exists(&candidate) {
        candidate = path.with_file_name(format!("{name}{SENTINEL_SUFFIX}{n}"));
        n += 1;
    }
    candidate
}
