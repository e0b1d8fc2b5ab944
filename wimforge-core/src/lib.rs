//! The core, UI-agnostic library for the `wimforge` image servicing console.
//!
//! `wimforge-core` drives two external command-line tools: the system image
//! servicing tool (`dism`) and, when it is installed, the image-library tool
//! (`wimlib-imagex`). It handles the parts that have real invariants: scratch
//! mount directories that must never leak, long-running child processes whose
//! progress is streamed back as it happens, and exports that choose between
//! the two tools on every call.
//!
//! The library is structured into several key modules:
//! - [`process`]: Runs a tool to completion, optionally showing liveness.
//! - [`progress`]: Streams a tool's diagnostic output and reports percentages
//!   to a [`progress::ProgressSink`].
//! - [`session`]: The registry of mount directories, swept at exit.
//! - [`removal`]: Retrying directory removal with a rename fallback.
//! - [`mount`]: Mounting and unmounting image indices.
//! - [`export`]: Per-index exports with backend selection.
//! - [`split`]: Splitting into `.swm` parts and recombining them.
//! - [`servicing`]: Health checks, features, packages and drivers on a
//!   mount the operation manages itself.
//!
//! Progress is reported through sinks and plain callbacks so any front-end can
//! draw it in whatever way it likes. Cancellation is a shared flag: clearing
//! it stops the running tool and the operation reports
//! [`error::Error::Cancelled`].
//!
//! ## Example: Mounting an Image Read-Only
//!
//! ```rust,no_run
//! use wimforge_core::{config::Settings, progress::Silent, session::MountMode, toolkit::Toolkit};
//! use std::path::Path;
//! use std::sync::atomic::AtomicBool;
//!
//! fn main() -> wimforge_core::error::Result<()> {
//!     let kit = Toolkit::new(Settings::default());
//!     let running = AtomicBool::new(true);
//!
//!     let mounted = kit.mounts().mount(
//!         Path::new("install.wim"),
//!         1,
//!         MountMode::ReadOnly,
//!         &running,
//!         &mut Silent,
//!     )?;
//!     println!("Mounted on {}", mounted.session.directory.display());
//!
//!     kit.mounts().unmount(&mounted.session.directory, false, &running, &mut Silent)?;
//!     kit.teardown();
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod export;
pub mod logs;
pub mod mount;
pub mod process;
pub mod progress;
pub mod query;
pub mod removal;
pub mod servicing;
pub mod session;
pub mod split;
#[cfg(test)]
mod testutil;
pub mod toolkit;
pub mod tools;
