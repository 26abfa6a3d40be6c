use std::io::Write;
use std::process::{Command, Stdio};

use tracing::{debug, trace};

use egressgateway_core::Family;

use crate::{BackendMode, Error};

/// Reads and writes one kernel table. A seam so tables can be exercised
/// against recorded state instead of a live kernel.
pub trait Driver: Send + Sync {
    /// Dumps the current contents of the table (`iptables-save -t`).
    fn save(&mut self, table: &str, family: Family) -> Result<String, Error>;

    /// Commits a restore payload (`iptables-restore --noflush`).
    fn restore(&mut self, table: &str, family: Family, payload: &str, wait: bool)
        -> Result<(), Error>;
}

/// Drives the installed `iptables-save`/`iptables-restore` binaries for the
/// configured backend family.
pub struct CmdDriver {
    backend: BackendMode,
}

impl CmdDriver {
    pub fn new(backend: BackendMode) -> Self {
        Self { backend }
    }

    fn binary(&self, family: Family, op: &str) -> String {
        let base = match family {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        };
        match self.backend {
            BackendMode::Auto => format!("{}-{}", base, op),
            BackendMode::Legacy => format!("{}-legacy-{}", base, op),
            BackendMode::Nft => format!("{}-nft-{}", base, op),
        }
    }
}

impl Driver for CmdDriver {
    fn save(&mut self, table: &str, family: Family) -> Result<String, Error> {
        let bin = self.binary(family, "save");
        debug!(%bin, %table, "save");
        let out = Command::new(&bin)
            .args(["-t", table])
            .output()
            .map_err(|source| Error::Exec {
                cmd: bin.clone(),
                source,
            })?;
        if !out.status.success() {
            return Err(Error::Command {
                cmd: format!("{} -t {}", bin, table),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    fn restore(
        &mut self,
        table: &str,
        family: Family,
        payload: &str,
        wait: bool,
    ) -> Result<(), Error> {
        let bin = self.binary(family, "restore");
        debug!(%bin, %table, "restore");
        trace!(%payload);

        let mut cmd = Command::new(&bin);
        cmd.arg("--noflush");
        if wait {
            cmd.arg("--wait");
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::Exec {
                cmd: bin.clone(),
                source,
            })?;

        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(payload.as_bytes())
            .map_err(|source| Error::Exec {
                cmd: bin.clone(),
                source,
            })?;

        let out = child.wait_with_output().map_err(|source| Error::Exec {
            cmd: bin.clone(),
            source,
        })?;
        if !out.status.success() {
            return Err(Error::Command {
                cmd: bin,
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            });
        }
        Ok(())
    }
}
