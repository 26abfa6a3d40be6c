//! The reconciliation engine.
//!
//! Three paths converge declarative state onto the kernel: the per-policy
//! path (sets plus that policy's rule), the gateway path (full rule-fabric
//! rebuild), and the cluster-info path (the two ignore sets). All paths are
//! edge-insensitive: each invocation converges observed state to desired
//! state, so a cancelled or failed pass is completed by the next one.

mod cluster_info;
mod gateway;
mod policy;
#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use anyhow::Result;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time;
use tracing::{debug, info, instrument, warn};

use egressgateway_core::{find_diff, Family, Mark, PolicyKey};
use egressgateway_ipset::{IpSet, SetBackend};
use egressgateway_iptables::{Chain, Rule, Table};

use crate::config::{AutoDetect, FileConfig};
use crate::index::Request;
use crate::resources::Resources;

/// Chain in the mangle table holding one mark rule per remotely-gatewayed
/// policy.
pub const MARK_CHAIN: &str = "EGRESSGATEWAY-MARK-REQUEST";

/// Chain in the nat table holding one SNAT rule per locally-gatewayed
/// policy.
pub const SNAT_CHAIN: &str = "EGRESSGATEWAY-SNAT-EIP";

/// Prefix tagging engine-owned chains and rules.
pub const CHAIN_PREFIX: &str = "egw:";

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// The per-family tables the engine programs.
pub struct Tables {
    pub mangle: Vec<Table>,
    pub nat: Vec<Table>,
    pub filter: Vec<Table>,
}

pub struct Reconciler<R> {
    resources: R,
    sets: Arc<dyn SetBackend>,

    node_name: String,
    enable_v4: bool,
    enable_v6: bool,
    base_mark: Mark,
    auto_detect: AutoDetect,
    custom_ignore_cidrs: Vec<String>,
    refresh_interval: Duration,

    /// Sets this engine has created, by name.
    set_cache: AHashMap<String, IpSet>,

    /// Desired mark rules, keyed by (canonical policy key, family) so chain
    /// contents render deterministically.
    mark_rules: BTreeMap<(String, Family), Rule>,

    /// Desired SNAT rules, keyed like `mark_rules`.
    snat_rules: BTreeMap<(String, Family), Rule>,

    mangle: Vec<Table>,
    nat: Vec<Table>,
    filter: Vec<Table>,
}

impl<R: Resources> Reconciler<R> {
    pub fn new(
        resources: R,
        sets: Arc<dyn SetBackend>,
        tables: Tables,
        config: &FileConfig,
        node_name: String,
    ) -> Result<Self> {
        let base_mark = config.base_mark()?;
        Ok(Self {
            resources,
            sets,
            node_name,
            enable_v4: config.enable_ipv4,
            enable_v6: config.enable_ipv6,
            base_mark,
            auto_detect: config.egress_ignore_cidr.auto_detect.clone(),
            custom_ignore_cidrs: config.egress_ignore_cidr.custom.clone(),
            refresh_interval: config.refresh_interval(),
            set_cache: AHashMap::new(),
            mark_rules: BTreeMap::new(),
            snat_rules: BTreeMap::new(),
            mangle: tables.mangle,
            nat: tables.nat,
            filter: tables.filter,
        })
    }

    /// Drives reconciliation until the event stream closes.
    ///
    /// The first full rebuild must succeed before any request is served;
    /// there is no valid operating state without it, so it retries
    /// unconditionally. Afterwards, failed requests are requeued with
    /// exponential backoff and the periodic refresh reapplies the table
    /// snapshots to recover from drift.
    pub async fn run(mut self, mut rx: UnboundedReceiver<Request>, requeue: UnboundedSender<Request>) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.rebuild().await {
                Ok(()) => break,
                Err(error) => {
                    warn!(%error, "initial apply failed; retrying");
                    time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
        info!("initial rule fabric applied");

        let mut attempts: AHashMap<Request, u32> = AHashMap::new();
        let mut refresh = time::interval(self.refresh_interval);
        refresh.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = rx.recv() => {
                    let Some(request) = request else {
                        debug!("event stream closed");
                        return;
                    };
                    match self.reconcile(&request).await {
                        Ok(()) => {
                            attempts.remove(&request);
                        }
                        Err(error) => {
                            let attempt = {
                                let attempt = attempts.entry(request.clone()).or_insert(0);
                                *attempt += 1;
                                *attempt
                            };
                            let delay = requeue_delay(attempt);
                            warn!(%error, ?request, attempt, ?delay, "reconcile failed; requeueing");
                            let tx = requeue.clone();
                            let request = request.clone();
                            tokio::spawn(async move {
                                time::sleep(delay).await;
                                let _ = tx.send(request);
                            });
                        }
                    }
                }
                _ = refresh.tick() => self.refresh(),
            }
        }
    }

    #[instrument(skip(self))]
    async fn reconcile(&mut self, request: &Request) -> Result<()> {
        match request {
            Request::Gateway => self.rebuild().await,
            Request::Policy(key) => self.reconcile_policy(key.clone()).await,
            Request::ClusterInfo => self.reconcile_cluster_info().await,
        }
    }

    /// Reapplies every table snapshot, restoring rules another agent may
    /// have flushed. Set memberships are not refreshed; they are corrected
    /// when their owning policy next reconciles.
    fn refresh(&mut self) {
        debug!("refreshing tables");
        for table in self
            .mangle
            .iter_mut()
            .chain(self.nat.iter_mut())
            .chain(self.filter.iter_mut())
        {
            if let Err(error) = table.apply() {
                warn!(%error, table = %table.name, family = %table.family, "refresh apply failed");
            }
        }
    }

    pub(crate) fn families(&self) -> Vec<Family> {
        let mut families = Vec::with_capacity(2);
        if self.enable_v4 {
            families.push(Family::V4);
        }
        if self.enable_v6 {
            families.push(Family::V6);
        }
        families
    }

    /// Creates the named set if this engine has not created it yet.
    pub(crate) fn ensure_set(&mut self, name: &str, family: Family) -> Result<IpSet> {
        if let Some(set) = self.set_cache.get(name) {
            return Ok(set.clone());
        }
        let set = IpSet::new(name, family);
        self.sets.create_set(&set, true)?;
        self.set_cache.insert(name.to_string(), set.clone());
        Ok(set)
    }

    /// Destroys a set if it exists; absence is success on the delete path.
    pub(crate) fn forget_set(&mut self, name: &str) {
        if let Err(error) = self.sets.destroy_set(name) {
            if !error.is_not_found() {
                warn!(%error, set = %name, "failed to destroy set");
            }
        }
        self.set_cache.remove(name);
    }

    /// Converges a set's membership onto `want`, adding before deleting so
    /// the set never passes through an empty window.
    pub(crate) fn sync_set_members(&self, set: &IpSet, want: &[String]) -> Result<()> {
        let have = match self.sets.list_entries(&set.name) {
            Ok(members) => members,
            Err(error) if error.is_not_found() => Vec::new(),
            Err(error) => return Err(error.into()),
        };
        let (to_add, to_del) = find_diff(&have, want);
        debug!(set = %set.name, ?to_add, ?to_del, "syncing set members");
        for member in &to_add {
            if let Err(error) = self.sets.add_entry(member, set, true) {
                if !error.is_already_added() {
                    return Err(error.into());
                }
            }
        }
        for member in &to_del {
            if let Err(error) = self.sets.del_entry(member, &set.name) {
                if !error.is_not_found() {
                    return Err(error.into());
                }
            }
        }
        Ok(())
    }

    /// Rewrites the two engine-owned chains from the rule books and commits
    /// the affected tables.
    pub(crate) fn sync_rule_chains(&mut self) -> Result<()> {
        let mut errors = Vec::new();
        for table in &mut self.mangle {
            let rules = self
                .mark_rules
                .iter()
                .filter(|(key, _)| key.1 == table.family)
                .map(|(_, rule)| rule.clone())
                .collect();
            table.update_chain(Chain::with_rules(MARK_CHAIN, rules));
            if let Err(error) = table.apply() {
                errors.push(anyhow::Error::new(error).context("failed to apply mangle table"));
            }
        }
        for table in &mut self.nat {
            let rules = self
                .snat_rules
                .iter()
                .filter(|(key, _)| key.1 == table.family)
                .map(|(_, rule)| rule.clone())
                .collect();
            table.update_chain(Chain::with_rules(SNAT_CHAIN, rules));
            if let Err(error) = table.apply() {
                errors.push(anyhow::Error::new(error).context("failed to apply nat table"));
            }
        }
        Errors::ok_if_empty(errors)
    }

    pub(crate) fn clear_policy_rules(&mut self, key: &PolicyKey) {
        let canonical = key.canonical();
        for family in [Family::V4, Family::V6] {
            self.mark_rules.remove(&(canonical.clone(), family));
            self.snat_rules.remove(&(canonical.clone(), family));
        }
    }
}

fn requeue_delay(attempt: u32) -> Duration {
    let factor = 1u32 << attempt.min(16).saturating_sub(1);
    (INITIAL_BACKOFF * factor).min(MAX_BACKOFF)
}

/// Aggregates per-resource failures from a best-effort pass.
#[derive(Debug)]
pub(crate) struct Errors(Vec<anyhow::Error>);

impl Errors {
    pub(crate) fn ok_if_empty(errors: Vec<anyhow::Error>) -> Result<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self(errors).into())
        }
    }
}

impl std::fmt::Display for Errors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0[0])?;
        for error in &self.0[1..] {
            write!(f, "; and {}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for Errors {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0[0])
    }
}
