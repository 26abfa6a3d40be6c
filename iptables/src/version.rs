use std::process::Command;
use std::str::FromStr;

use crate::Error;

/// Which iptables binary family drives the tables.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BackendMode {
    Legacy,
    Nft,
    /// Resolve from the installed `iptables --version` at startup.
    Auto,
}

impl FromStr for BackendMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy" => Ok(BackendMode::Legacy),
            "nft" => Ok(BackendMode::Nft),
            "auto" | "" => Ok(BackendMode::Auto),
            other => Err(format!("unknown iptables backend mode {:?}", other)),
        }
    }
}

/// Parsed `iptables --version` output.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub backend: BackendMode,
}

impl Version {
    pub fn detect() -> Result<Self, Error> {
        let out = Command::new("iptables")
            .arg("--version")
            .output()
            .map_err(|source| Error::Exec {
                cmd: "iptables --version".to_string(),
                source,
            })?;
        if !out.status.success() {
            return Err(Error::Command {
                cmd: "iptables --version".to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            });
        }
        Self::parse(&String::from_utf8_lossy(&out.stdout))
    }

    /// Parses lines like `iptables v1.8.7 (nf_tables)` or
    /// `iptables v1.6.1`.
    pub fn parse(output: &str) -> Result<Self, Error> {
        let line = output.trim();
        let err = || Error::Version(line.to_string());

        let rest = line.strip_prefix("iptables v").ok_or_else(err)?;
        let (version, backend) = match rest.split_once(' ') {
            Some((version, rest)) => {
                let backend = if rest.contains("nf_tables") {
                    BackendMode::Nft
                } else {
                    BackendMode::Legacy
                };
                (version, backend)
            }
            None => (rest, BackendMode::Legacy),
        };

        let mut parts = version.splitn(3, '.');
        let mut next = || -> Result<u32, Error> {
            parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(err)
        };
        Ok(Self {
            major: next()?,
            minor: next()?,
            patch: next()?,
            backend,
        })
    }

    pub fn at_least(&self, major: u32, minor: u32, patch: u32) -> bool {
        (self.major, self.minor, self.patch) >= (major, minor, patch)
    }

    /// `iptables-restore` takes the xtables lock natively from 1.6.2 on;
    /// older versions need the shared file lock.
    pub fn restore_supports_lock(&self) -> bool {
        self.at_least(1, 6, 2)
    }
}
