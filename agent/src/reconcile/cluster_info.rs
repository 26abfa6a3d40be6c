//! Cluster-ignore reconciliation: mirrors the internal CIDRs published in
//! the cluster-info status (plus operator-configured extras) into the two
//! fixed-name ignore sets.

use anyhow::Result;
use tracing::{debug, instrument};

use egressgateway_core::{partition_cidrs, partition_ips, Family, CLUSTER_IGNORE_V4, CLUSTER_IGNORE_V6};

use super::Reconciler;
use crate::resources::Resources;

impl<R: Resources> Reconciler<R> {
    #[instrument(skip(self))]
    pub(crate) async fn reconcile_cluster_info(&mut self) -> Result<()> {
        let Some(info) = self.resources.get_cluster_info().await? else {
            debug!("no cluster info present");
            return Ok(());
        };
        if info.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }

        let mut want_v4 = Vec::new();
        let mut want_v6 = Vec::new();

        if let Some(ignore) = info.status.as_ref().and_then(|s| s.egress_ignore_cidr.as_ref()) {
            // Node addresses are members in host form; the rest are
            // networks.
            if self.auto_detect.node_ip {
                if let Some(pair) = &ignore.node_ip {
                    let (v4, v6) = partition_ips(pair.ipv4.iter().chain(pair.ipv6.iter()));
                    want_v4.extend(v4);
                    want_v6.extend(v6);
                }
            }
            if self.auto_detect.pod_cidr {
                if let Some(pair) = &ignore.pod_cidr {
                    let (v4, v6) = partition_cidrs(pair.ipv4.iter().chain(pair.ipv6.iter()));
                    want_v4.extend(v4);
                    want_v6.extend(v6);
                }
            }
            if self.auto_detect.cluster_ip {
                if let Some(pair) = &ignore.cluster_ip {
                    let (v4, v6) = partition_cidrs(pair.ipv4.iter().chain(pair.ipv6.iter()));
                    want_v4.extend(v4);
                    want_v6.extend(v6);
                }
            }
        }

        let (custom_v4, custom_v6) = partition_cidrs(&self.custom_ignore_cidrs);
        want_v4.extend(custom_v4);
        want_v6.extend(custom_v6);

        // Both sets always exist; the rules of every enabled family may
        // reference them.
        let set_v4 = self.ensure_set(CLUSTER_IGNORE_V4, Family::V4)?;
        let set_v6 = self.ensure_set(CLUSTER_IGNORE_V6, Family::V6)?;

        if self.enable_v4 {
            self.sync_set_members(&set_v4, &want_v4)?;
        }
        if self.enable_v6 {
            self.sync_set_members(&set_v6, &want_v6)?;
        }
        Ok(())
    }
}
