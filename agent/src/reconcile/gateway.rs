//! Full rule-fabric rebuild.
//!
//! A gateway change can flip `ownedByLocalNode` for many policies at once
//! and retire marks, so this path recomputes every policy's sets and rules
//! and the static glue in one pass, committing each (table, family) once.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::{info, instrument, warn};

use egressgateway_core::{Mark, PolicyKey, MARK_AGENT_MASK, MARK_FULL_MASK};
use egressgateway_iptables::{Action, MatchCriteria, Rule};

use super::policy::Binding;
use super::{Errors, Reconciler, MARK_CHAIN, SNAT_CHAIN};
use crate::resources::Resources;

impl<R: Resources> Reconciler<R> {
    /// Rebuilds the entire on-node rule fabric from the gateway view.
    ///
    /// Best-effort per policy: one broken policy does not stop the others,
    /// but any failure fails the pass so it is retried.
    #[instrument(skip(self))]
    pub(crate) async fn rebuild(&mut self) -> Result<()> {
        let gateways = self.resources.list_gateways().await?;

        let mut bound: BTreeMap<PolicyKey, Binding> = BTreeMap::new();
        for gateway in &gateways {
            for node in gateway.status.iter().flat_map(|s| s.node_list.iter()) {
                for eip in &node.eips {
                    for policy in &eip.policies {
                        let key = match &policy.namespace {
                            Some(ns) if !ns.is_empty() => {
                                PolicyKey::namespaced(ns.clone(), policy.name.clone())
                            }
                            _ => PolicyKey::cluster(policy.name.clone()),
                        };
                        bound.insert(
                            key,
                            Binding {
                                node: node.name.clone(),
                                eip_v4: eip.ipv4.clone(),
                                eip_v6: eip.ipv6.clone(),
                            },
                        );
                    }
                }
            }
        }
        info!(policies = bound.len(), "rebuilding rule fabric");

        let mut errors = Vec::new();

        // Sets first; the rules reference them by name.
        let mut dest_empty: BTreeMap<PolicyKey, bool> = BTreeMap::new();
        for (key, binding) in &bound {
            let dest_subnets = match self.policy_dest_subnets(key).await {
                Ok(subnets) => subnets.unwrap_or_default(),
                Err(error) => {
                    errors.push(error.context(format!("failed to fetch policy {}", key)));
                    continue;
                }
            };
            dest_empty.insert(key.clone(), dest_subnets.is_empty());

            let owned = binding.node == self.node_name;
            if let Err(error) = self.sync_policy_sets(key, owned, &dest_subnets).await {
                errors.push(error.context(format!("failed to sync sets for policy {}", key)));
            }
        }

        // Rule books are rebuilt from scratch; stale policies drop out
        // here.
        self.mark_rules.clear();
        self.snat_rules.clear();
        for (key, binding) in &bound {
            // A policy whose fetch failed above is retried by the next
            // pass; do not guess at its rule shape now.
            let Some(&ignore_internal) = dest_empty.get(key) else {
                continue;
            };
            if binding.node == self.node_name {
                self.install_snat_rules(key, binding, ignore_internal);
                continue;
            }
            match self.resources.get_node_mark(&binding.node).await {
                Ok(Some(mark)) => match mark.parse::<Mark>() {
                    Ok(mark) => self.install_mark_rules(key, mark, ignore_internal),
                    Err(error) => {
                        errors.push(
                            anyhow::Error::new(error)
                                .context(format!("node {} published a bad mark", binding.node)),
                        );
                    }
                },
                Ok(None) => {
                    warn!(policy = %key, node = %binding.node, "gateway node has no mark; skipping this policy's rule");
                }
                Err(error) => {
                    errors.push(error.context(format!("failed to fetch mark for node {}", binding.node)));
                }
            }
        }

        self.install_static_rules();

        // One commit per (table, family).
        if let Err(error) = self.sync_rule_chains() {
            errors.push(error);
        }
        for table in &mut self.filter {
            if let Err(error) = table.apply() {
                errors.push(anyhow::Error::new(error).context("failed to apply filter table"));
            }
        }

        Errors::ok_if_empty(errors)
    }

    /// Glue attaching the engine's chains to the built-in ones. Idempotent:
    /// the rule backend recognizes rules it already placed.
    pub(crate) fn install_static_rules(&mut self) {
        let base = self.base_mark;

        for table in &mut self.filter {
            for (chain, rules) in filter_static_rules(base) {
                table.insert_or_append_rules(chain, rules);
            }
        }
        for table in &mut self.mangle {
            for (chain, rules) in mangle_static_rules(base) {
                table.insert_or_append_rules(chain, rules);
            }
        }
        for table in &mut self.nat {
            for (chain, rules) in nat_static_rules(base) {
                table.insert_or_append_rules(chain, rules);
            }
        }
    }
}

fn accept_on_mark(base: Mark) -> Rule {
    Rule::new(
        MatchCriteria::new().mark_matches_with_mask(base, MARK_FULL_MASK),
        Action::Accept,
    )
}

/// Marked flows short-circuit filtering: the gateway must forward them
/// regardless of the node's own filter policy.
pub(crate) fn filter_static_rules(base: Mark) -> Vec<(&'static str, Vec<Rule>)> {
    vec![
        ("FORWARD", vec![accept_on_mark(base)]),
        ("OUTPUT", vec![accept_on_mark(base)]),
    ]
}

/// Mangle glue: restore this agent's marks on forwarded packets, accept
/// already-marked flows, and route everything entering the node through the
/// mark-request chain.
pub(crate) fn mangle_static_rules(base: Mark) -> Vec<(&'static str, Vec<Rule>)> {
    vec![
        (
            "FORWARD",
            vec![Rule::new(
                MatchCriteria::new().mark_matches_with_mask(base, MARK_AGENT_MASK),
                Action::SetMaskedMark {
                    mark: base,
                    mask: MARK_FULL_MASK,
                },
            )],
        ),
        ("POSTROUTING", vec![accept_on_mark(base)]),
        (
            "PREROUTING",
            vec![Rule::new(
                MatchCriteria::new(),
                Action::Jump(MARK_CHAIN.to_string()),
            )],
        ),
    ]
}

/// Nat glue: marked flows leave untouched; everything else consults the
/// SNAT chain.
pub(crate) fn nat_static_rules(base: Mark) -> Vec<(&'static str, Vec<Rule>)> {
    vec![(
        "POSTROUTING",
        vec![
            accept_on_mark(base),
            Rule::new(MatchCriteria::new(), Action::Jump(SNAT_CHAIN.to_string())),
        ],
    )]
}
