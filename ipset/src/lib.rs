//! Set backend adapter over `ipset(8)`.
//!
//! All sets are `hash:net`, which accepts both single addresses and CIDRs,
//! so one backend serves the per-policy source/destination sets and the
//! cluster-ignore sets alike.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::process::Command;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use egressgateway_core::Family;

pub const SET_TYPE: &str = "hash:net";

/// Describes a named kernel set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpSet {
    pub name: String,
    pub family: Family,
}

impl IpSet {
    pub fn new(name: impl Into<String>, family: Family) -> Self {
        Self {
            name: name.into(),
            family,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The entry is already a member of the set.
    #[error("entry is already added")]
    AlreadyAdded,

    /// The named set does not exist.
    #[error("set {0:?} does not exist")]
    NotFound(String),

    #[error("failed to run ipset: {0}")]
    Exec(#[from] std::io::Error),

    #[error("ipset {args}: {stderr}")]
    Command { args: String, stderr: String },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_already_added(&self) -> bool {
        matches!(self, Error::AlreadyAdded)
    }
}

/// The set backend contract used by the reconcilers.
///
/// `create_set` and the member operations are idempotent from the caller's
/// point of view when `ignore_existing` is set; the remaining benign
/// conditions surface as [`Error::AlreadyAdded`] / [`Error::NotFound`] so
/// callers can classify without string matching.
pub trait SetBackend: Send + Sync {
    fn create_set(&self, set: &IpSet, ignore_existing: bool) -> Result<(), Error>;
    fn destroy_set(&self, name: &str) -> Result<(), Error>;
    fn add_entry(&self, entry: &str, set: &IpSet, ignore_existing: bool) -> Result<(), Error>;
    fn del_entry(&self, entry: &str, set_name: &str) -> Result<(), Error>;
    fn list_entries(&self, name: &str) -> Result<Vec<String>, Error>;
}

const MSG_NOT_EXIST: &str = "The set with the given name does not exist";
const MSG_ALREADY_ADDED: &str = "it's already added";
const MSG_NOT_ADDED: &str = "it's not added";

/// Drives the `ipset` binary.
///
/// Set creation and destruction are serialized by a global mutex; member
/// mutations take a per-set mutex so concurrent reconcile passes touching
/// different sets do not contend.
pub struct CmdIpset {
    lifecycle: Mutex<()>,
    members: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CmdIpset {
    pub fn new() -> Self {
        Self {
            lifecycle: Mutex::new(()),
            members: Mutex::new(HashMap::new()),
        }
    }

    fn member_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.members
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn run(&self, args: &[&str]) -> Result<(), Error> {
        debug!(?args, "ipset");
        let out = Command::new("ipset").args(args).output()?;
        if out.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
        Err(classify(args, stderr))
    }
}

impl Default for CmdIpset {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(args: &[&str], stderr: String) -> Error {
    if stderr.contains(MSG_NOT_EXIST) {
        let name = args.get(1).unwrap_or(&"").to_string();
        return Error::NotFound(name);
    }
    if stderr.contains(MSG_ALREADY_ADDED) {
        return Error::AlreadyAdded;
    }
    Error::Command {
        args: args.join(" "),
        stderr,
    }
}

impl SetBackend for CmdIpset {
    fn create_set(&self, set: &IpSet, ignore_existing: bool) -> Result<(), Error> {
        let _guard = self.lifecycle.lock();
        let mut args = vec![
            "create",
            set.name.as_str(),
            SET_TYPE,
            "family",
            set.family.hash_family(),
        ];
        if ignore_existing {
            args.push("-exist");
        }
        self.run(&args)
    }

    fn destroy_set(&self, name: &str) -> Result<(), Error> {
        let _guard = self.lifecycle.lock();
        self.run(&["destroy", name])
    }

    fn add_entry(&self, entry: &str, set: &IpSet, ignore_existing: bool) -> Result<(), Error> {
        let lock = self.member_lock(&set.name);
        let _guard = lock.lock();
        let mut args = vec!["add", set.name.as_str(), entry];
        if ignore_existing {
            args.push("-exist");
        }
        self.run(&args)
    }

    fn del_entry(&self, entry: &str, set_name: &str) -> Result<(), Error> {
        let lock = self.member_lock(set_name);
        let _guard = lock.lock();
        match self.run(&["del", set_name, entry]) {
            // Removing an absent member converges to the same state.
            Err(Error::Command { stderr, .. }) if stderr.contains(MSG_NOT_ADDED) => Ok(()),
            res => res,
        }
    }

    fn list_entries(&self, name: &str) -> Result<Vec<String>, Error> {
        debug!(%name, "ipset list");
        let out = Command::new("ipset").args(["list", name]).output()?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
            return Err(classify(&["list", name], stderr));
        }
        let stdout = String::from_utf8_lossy(&out.stdout);
        Ok(parse_members(&stdout))
    }
}

/// Extracts the member lines from `ipset list` output: everything after the
/// `Members:` header, one entry per line.
fn parse_members(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| line.trim_end() != "Members:")
        .skip(1)
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}
