//! Rule backend adapter over `iptables-save`/`iptables-restore`.
//!
//! Each [`Table`] holds a declarative snapshot of the chains this engine
//! owns in one kernel (table, family) pair. `apply` re-renders the whole
//! snapshot and commits it in a single restore, so reapplying after drift
//! (or after a lost race with another agent) converges without tracking
//! what changed.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod driver;
mod lock;
mod rule;
mod table;
mod version;

pub use self::{
    driver::{CmdDriver, Driver},
    lock::{Lock, LockGuard, SharedLock},
    rule::{Action, MatchCriteria, Rule},
    table::{Chain, Table},
    version::{BackendMode, Version},
};

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to run {cmd}: {source}")]
    Exec {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{cmd} failed: {stderr}")]
    Command { cmd: String, stderr: String },

    #[error("timed out waiting for the xtables lock")]
    LockTimeout,

    #[error("lock file {path:?}: {source}")]
    LockFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unrecognized iptables version output {0:?}")]
    Version(String),
}

/// Backend options shared by every table.
#[derive(Clone, Debug)]
pub struct Options {
    pub backend: BackendMode,
    pub refresh_interval: Duration,
    pub lock_timeout: Duration,
    pub lock_probe_interval: Duration,
    pub initial_post_write_interval: Duration,
    pub restore_supports_lock: bool,
    pub lock_file_path: PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            backend: BackendMode::Auto,
            refresh_interval: Duration::from_secs(90),
            lock_timeout: Duration::ZERO,
            lock_probe_interval: Duration::from_millis(50),
            initial_post_write_interval: Duration::from_secs(1),
            restore_supports_lock: true,
            lock_file_path: PathBuf::from("/run/xtables.lock"),
        }
    }
}
