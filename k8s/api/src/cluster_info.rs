use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cluster-wide view of the internal CIDRs that egress rewriting must leave
/// alone. A central controller keeps the status current; agents mirror it
/// into the two cluster-ignore sets.
#[derive(Clone, Debug, Default, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "egressgateway.spidernet.io",
    version = "v1beta1",
    kind = "EgressClusterInfo",
    status = "EgressClusterInfoStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct EgressClusterInfoSpec {
    #[serde(default)]
    pub extra_cidr: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressClusterInfoStatus {
    #[serde(rename = "egressIgnoreCIDR")]
    pub egress_ignore_cidr: Option<IgnoreCidr>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IgnoreCidr {
    #[serde(rename = "nodeIP")]
    pub node_ip: Option<IpListPair>,
    #[serde(rename = "podCIDR")]
    pub pod_cidr: Option<IpListPair>,
    #[serde(rename = "clusterIP")]
    pub cluster_ip: Option<IpListPair>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IpListPair {
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub ipv6: Vec<String>,
}
