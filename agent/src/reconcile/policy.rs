//! Per-policy reconciliation: the four named sets and the policy's single
//! rule in the owning chain.

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use egressgateway_core::{
    cluster_ignore_set, policy_set_name, policy_set_names, split_dest_subnets, Family, Mark,
    PolicyKey, SetKind, MARK_FULL_MASK,
};
use egressgateway_iptables::{Action, MatchCriteria, Rule};
use egressgateway_k8s_api::EgressGateway;

use super::Reconciler;
use crate::resources::Resources;

/// Where a policy's EIP currently lives, per the gateway status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Binding {
    pub node: String,
    pub eip_v4: Option<String>,
    pub eip_v6: Option<String>,
}

impl<R: Resources> Reconciler<R> {
    #[instrument(skip(self, key), fields(policy = %key))]
    pub(crate) async fn reconcile_policy(&mut self, key: PolicyKey) -> Result<()> {
        let Some(dest_subnets) = self.policy_dest_subnets(&key).await? else {
            info!("policy deleted; removing its rule and sets");
            return self.remove_policy(&key);
        };

        let gateways = self.resources.list_gateways().await?;
        let binding = find_binding(&gateways, &key);
        let owned = binding
            .as_ref()
            .map(|b| b.node == self.node_name)
            .unwrap_or(false);

        self.sync_policy_sets(&key, owned, &dest_subnets).await?;

        self.clear_policy_rules(&key);
        match binding {
            Some(binding) if owned => {
                self.install_snat_rules(&key, &binding, dest_subnets.is_empty());
            }
            Some(binding) => {
                match self.resources.get_node_mark(&binding.node).await? {
                    Some(mark) => {
                        let mark: Mark = mark
                            .parse()
                            .with_context(|| format!("node {} published a bad mark", binding.node))?;
                        self.install_mark_rules(&key, mark, dest_subnets.is_empty());
                    }
                    None => {
                        warn!(node = %binding.node, "gateway node has no mark; skipping this policy's rule");
                    }
                }
            }
            None => {
                debug!("policy is not bound to any gateway node yet");
            }
        }

        self.sync_rule_chains()
    }

    /// Tears down everything a policy owns: its rule first, then its four
    /// sets. Absent sets are success; the policy may never have reached
    /// this node.
    pub(crate) fn remove_policy(&mut self, key: &PolicyKey) -> Result<()> {
        self.clear_policy_rules(key);
        self.sync_rule_chains()?;
        for set in policy_set_names(key, true, true) {
            self.forget_set(&set.name);
        }
        Ok(())
    }

    /// Fetches the policy's destination subnets; `None` means the policy is
    /// gone (absent or marked for deletion).
    pub(crate) async fn policy_dest_subnets(&self, key: &PolicyKey) -> Result<Option<Vec<String>>> {
        match &key.namespace {
            Some(namespace) => {
                let policy = self.resources.get_policy(namespace, &key.name).await?;
                Ok(policy
                    .filter(|p| p.metadata.deletion_timestamp.is_none())
                    .map(|p| p.spec.dest_subnet))
            }
            None => {
                let policy = self.resources.get_cluster_policy(&key.name).await?;
                Ok(policy
                    .filter(|p| p.metadata.deletion_timestamp.is_none())
                    .map(|p| p.spec.dest_subnet))
            }
        }
    }

    /// Converges the policy's sets: sources from its endpoint slices,
    /// destinations from its canonicalized subnets.
    ///
    /// An endpoint contributes iff it runs on this node (its traffic must
    /// be marked as it leaves) or the EIP lives here (the gateway SNATs for
    /// every selected pod cluster-wide).
    pub(crate) async fn sync_policy_sets(
        &mut self,
        key: &PolicyKey,
        owned_by_local_node: bool,
        dest_subnets: &[String],
    ) -> Result<()> {
        let endpoints = self.resources.policy_endpoints(key).await?;

        let mut src_v4 = Vec::new();
        let mut src_v6 = Vec::new();
        for endpoint in endpoints {
            if owned_by_local_node || endpoint.node.as_deref() == Some(self.node_name.as_str()) {
                src_v4.extend(endpoint.ipv4);
                src_v6.extend(endpoint.ipv6);
            }
        }

        let (dst_v4, dst_v6) = split_dest_subnets(dest_subnets)
            .with_context(|| format!("policy {} has a malformed destination", key))?;

        for set_name in policy_set_names(key, self.enable_v4, self.enable_v6) {
            let want = match (set_name.kind, set_name.family) {
                (SetKind::Src, Family::V4) => &src_v4,
                (SetKind::Src, Family::V6) => &src_v6,
                (SetKind::Dst, Family::V4) => &dst_v4,
                (SetKind::Dst, Family::V6) => &dst_v6,
            };
            let set = self.ensure_set(&set_name.name, set_name.family)?;
            self.sync_set_members(&set, want)?;
        }
        Ok(())
    }

    pub(crate) fn install_snat_rules(
        &mut self,
        key: &PolicyKey,
        binding: &Binding,
        ignore_internal: bool,
    ) {
        for family in self.families() {
            let eip = match family {
                Family::V4 => &binding.eip_v4,
                Family::V6 => &binding.eip_v6,
            };
            let Some(eip) = eip else {
                continue;
            };
            let rule = Rule::new(
                policy_match(key, family, ignore_internal),
                Action::Snat { to: eip.clone() },
            );
            self.snat_rules.insert((key.canonical(), family), rule);
        }
    }

    pub(crate) fn install_mark_rules(&mut self, key: &PolicyKey, mark: Mark, ignore_internal: bool) {
        for family in self.families() {
            let rule = Rule::new(
                policy_match(key, family, ignore_internal),
                Action::SetMaskedMark {
                    mark,
                    mask: MARK_FULL_MASK,
                },
            );
            self.mark_rules.insert((key.canonical(), family), rule);
        }
    }
}

/// The shared match criteria of a policy's mark and SNAT rules: source in
/// the policy's src set, initiator direction only, and either destination
/// in its dst set or, when the policy names no destinations, destination
/// outside the cluster-ignore set.
pub(crate) fn policy_match(key: &PolicyKey, family: Family, ignore_internal: bool) -> MatchCriteria {
    let criteria =
        MatchCriteria::new().source_ip_set(&policy_set_name(SetKind::Src, family, key));
    let criteria = if ignore_internal {
        criteria.not_dest_ip_set(cluster_ignore_set(family))
    } else {
        criteria.dest_ip_set(&policy_set_name(SetKind::Dst, family, key))
    };
    criteria.ct_direction_original()
}

/// Scans gateway statuses for the node currently holding this policy's
/// EIP.
pub(crate) fn find_binding(gateways: &[EgressGateway], key: &PolicyKey) -> Option<Binding> {
    for gateway in gateways {
        for node in gateway.status.iter().flat_map(|s| s.node_list.iter()) {
            for eip in &node.eips {
                for policy in &eip.policies {
                    let namespace_matches = match (&policy.namespace, &key.namespace) {
                        (Some(a), Some(b)) => a == b,
                        (None, None) => true,
                        (Some(a), None) => a.is_empty(),
                        (None, Some(_)) => false,
                    };
                    if policy.name == key.name && namespace_matches {
                        return Some(Binding {
                            node: node.name.clone(),
                            eip_v4: eip.ipv4.clone(),
                            eip_v6: eip.ipv6.clone(),
                        });
                    }
                }
            }
        }
    }
    None
}
