//! Registry of scratch directories created for mounting.
//!
//! Every directory handed out by [`MountSessionTracker::create`] stays in the
//! live set until [`MountSessionTracker::release`] has attempted to remove
//! it. If the process dies before that, [`MountSessionTracker::sweep_all`]
//! (run from the exit guard) removes whatever is left.
use crate::error::Result;
use crate::removal::{RealFs, RemovalOutcome, RetryPolicy, remove_dir_tree};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for MountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReadOnly => "RO",
            Self::ReadWrite => "RW",
        })
    }
}

/// One image index mounted on one scratch directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountSession {
    pub directory: PathBuf,
    pub image: PathBuf,
    pub index: u32,
    pub mode: MountMode,
    pub created_at: SystemTime,
}

/// A freshly created scratch directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedDir {
    pub path: PathBuf,
    /// Why the configured mount base was not used, if it wasn't.
    pub fallback: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub already_absent: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

pub struct MountSessionTracker {
    base: Option<PathBuf>,
    policy: RetryPolicy,
    /// Tracked directory -> the session mounted on it, once known.
    live: Mutex<BTreeMap<PathBuf, Option<MountSession>>>,
}

impl MountSessionTracker {
    pub fn new(base: Option<PathBuf>) -> Self {
        Self::with_policy(base, RetryPolicy::default())
    }

    pub fn with_policy(base: Option<PathBuf>, policy: RetryPolicy) -> Self {
        Self {
            base,
            policy,
            live: Mutex::new(BTreeMap::new()),
        }
    }

    /// Creates and tracks a uniquely named directory starting with `prefix`.
    ///
    /// An unusable mount base is not fatal: the directory goes under the
    /// system temp root and the reason is returned in [`CreatedDir::fallback`].
    pub fn create(&self, prefix: &str) -> Result<CreatedDir> {
        let mut fallback = None;
        if let Some(base) = &self.base {
            match make_unique_dir(base, prefix) {
                Ok(path) => return Ok(self.track(path, None)),
                Err(e) => {
                    tracing::warn!(base = %base.display(), "mount base unusable: {e}");
                    fallback = Some(format!(
                        "unable to use mount folder '{}': {e}; using the system temp folder",
                        base.display()
                    ));
                }
            }
        }
        let path = make_unique_dir(&std::env::temp_dir(), prefix)?;
        Ok(self.track(path, fallback))
    }

    fn track(&self, path: PathBuf, fallback: Option<String>) -> CreatedDir {
        tracing::debug!(dir = %path.display(), "tracking mount directory");
        self.live.lock().insert(path.clone(), None);
        CreatedDir { path, fallback }
    }

    /// Records what is mounted on a tracked (or newly adopted) directory.
    pub fn attach(
        &self,
        directory: &Path,
        image: &Path,
        index: u32,
        mode: MountMode,
    ) -> MountSession {
        let session = MountSession {
            directory: directory.to_path_buf(),
            image: image.to_path_buf(),
            index,
            mode,
            created_at: SystemTime::now(),
        };
        self.live
            .lock()
            .insert(directory.to_path_buf(), Some(session.clone()));
        session
    }

    pub fn sessions(&self) -> Vec<MountSession> {
        self.live.lock().values().flatten().cloned().collect()
    }

    pub fn tracked_dirs(&self) -> Vec<PathBuf> {
        self.live.lock().keys().cloned().collect()
    }

    pub fn is_tracked(&self, directory: &Path) -> bool {
        self.live.lock().contains_key(directory)
    }

    /// Removes `directory` from disk and from the live set.
    ///
    /// The entry is dropped whatever the outcome so shutdown does not retry
    /// forever; a failure is logged and returned for the caller to report.
    pub fn release(&self, directory: &Path) -> RemovalOutcome {
        let outcome = remove_dir_tree(&RealFs, directory, self.policy);
        self.live.lock().remove(directory);
        match &outcome {
            RemovalOutcome::Failed { path, reason } => {
                tracing::warn!(dir = %path.display(), "mount directory left behind: {reason}");
            }
            RemovalOutcome::RemovedAfterRename { sentinel } => {
                let (dir, sentinel) = (directory.display(), sentinel.display());
                tracing::debug!(%dir, %sentinel, "removed after rename");
            }
            _ => {}
        }
        outcome
    }

    /// Releases every directory still tracked.
    pub fn sweep_all(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for dir in self.tracked_dirs() {
            match self.release(&dir) {
                RemovalOutcome::AlreadyAbsent => report.already_absent.push(dir),
                RemovalOutcome::Failed { reason, .. } => report.failed.push((dir, reason)),
                _ => report.removed.push(dir),
            }
        }
        report
    }
}

fn make_unique_dir(base: &Path, prefix: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(base)?;
    let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(base)?;
    Ok(dir.keep())
}

/// Total size in bytes of the regular files below `path`.
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quick() -> RetryPolicy {
        RetryPolicy {
            attempts: 2,
            delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn create_uses_configured_base() {
        let base = tempfile::tempdir().unwrap();
        let tracker = MountSessionTracker::with_policy(Some(base.path().join("mounts")), quick());
        let dir = tracker.create("mnt_").unwrap();
        assert!(dir.fallback.is_none());
        assert!(dir.path.starts_with(base.path().join("mounts")));
        assert!(dir.path.is_dir());
        assert!(dir.path.file_name().unwrap().to_string_lossy().starts_with("mnt_"));
        assert!(tracker.is_tracked(&dir.path));
        tracker.release(&dir.path);
    }

    #[test]
    fn unusable_base_falls_back_to_temp() {
        let root = tempfile::tempdir().unwrap();
        let not_a_dir = root.path().join("file");
        fs::write(&not_a_dir, b"x").unwrap();
        let tracker = MountSessionTracker::with_policy(Some(not_a_dir), quick());
        let dir = tracker.create("mnt_").unwrap();
        assert!(dir.fallback.is_some());
        assert!(dir.path.starts_with(std::env::temp_dir()));
        assert!(tracker.is_tracked(&dir.path));
        tracker.release(&dir.path);
        assert!(!dir.path.exists());
    }

    #[test]
    fn names_are_unique() {
        let base = tempfile::tempdir().unwrap();
        let tracker = MountSessionTracker::with_policy(Some(base.path().to_path_buf()), quick());
        let a = tracker.create("mnt_").unwrap();
        let b = tracker.create("mnt_").unwrap();
        assert_ne!(a.path, b.path);
        assert_eq!(tracker.tracked_dirs().len(), 2);
        tracker.sweep_all();
    }

    #[test]
    fn release_removes_and_untracks_idempotently() {
        let base = tempfile::tempdir().unwrap();
        let tracker = MountSessionTracker::with_policy(Some(base.path().to_path_buf()), quick());
        let dir = tracker.create("mnt_").unwrap().path;
        fs::write(dir.join("leftover.txt"), b"data").unwrap();

        assert_eq!(tracker.release(&dir), RemovalOutcome::Removed { attempts: 1 });
        assert!(!dir.exists());
        assert!(!tracker.is_tracked(&dir));
        assert_eq!(tracker.release(&dir), RemovalOutcome::AlreadyAbsent);
    }

    #[test]
    fn attached_sessions_are_listed() {
        let base = tempfile::tempdir().unwrap();
        let tracker = MountSessionTracker::with_policy(Some(base.path().to_path_buf()), quick());
        let dir = tracker.create("mnt_").unwrap().path;
        let _unmounted = tracker.create("mnt_").unwrap();
        let session = tracker.attach(&dir, Path::new("install.wim"), 3, MountMode::ReadOnly);
        assert_eq!(tracker.sessions(), vec![session]);
        tracker.sweep_all();
        assert!(tracker.sessions().is_empty());
    }

    #[test]
    fn sweep_tolerates_externally_deleted_directories() {
        let base = tempfile::tempdir().unwrap();
        let tracker = MountSessionTracker::with_policy(Some(base.path().to_path_buf()), quick());
        let gone = tracker.create("mnt_").unwrap().path;
        let present = tracker.create("mnt_").unwrap().path;
        fs::remove_dir(&gone).unwrap();

        let report = tracker.sweep_all();
        assert_eq!(report.already_absent, vec![gone]);
        assert_eq!(report.removed, vec![present.clone()]);
        assert!(report.failed.is_empty());
        assert!(!present.exists());
        assert!(tracker.tracked_dirs().is_empty());
        assert_eq!(tracker.sweep_all(), SweepReport::default());
    }

    #[test]
    fn dir_size_counts_nested_files() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("a/b")).unwrap();
        fs::write(root.path().join("a/one"), [0u8; 10]).unwrap();
        fs::write(root.path().join("a/b/two"), [0u8; 5]).unwrap();
        assert_eq!(dir_size(root.path()), 15);
        assert_eq!(dir_size(&root.path().join("missing")), 0);
    }
}
