use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Forces egress traffic from selected pods in one namespace through a
/// gateway, rewriting its source to the bound EIP.
#[derive(Clone, Debug, Default, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "egressgateway.spidernet.io",
    version = "v1beta1",
    kind = "EgressPolicy",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EgressPolicySpec {
    pub egress_gateway_name: Option<String>,
    pub egress_ip: Option<EgressIp>,
    pub applied_to: Option<AppliedTo>,
    #[serde(default)]
    pub dest_subnet: Vec<String>,
}

/// Cluster-scoped variant of [`EgressPolicy`]; its applied-to selector may
/// additionally pick namespaces.
#[derive(Clone, Debug, Default, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "egressgateway.spidernet.io",
    version = "v1beta1",
    kind = "EgressClusterPolicy"
)]
#[serde(rename_all = "camelCase")]
pub struct EgressClusterPolicySpec {
    pub egress_gateway_name: Option<String>,
    pub egress_ip: Option<EgressIp>,
    pub applied_to: Option<ClusterAppliedTo>,
    #[serde(default)]
    pub dest_subnet: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressIp {
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    #[serde(rename = "useNodeIP", default)]
    pub use_node_ip: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppliedTo {
    pub pod_selector: Option<LabelSelector>,
    pub pod_subnet: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAppliedTo {
    pub pod_selector: Option<LabelSelector>,
    pub pod_subnet: Option<Vec<String>>,
    pub namespace_selector: Option<LabelSelector>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    pub match_labels: Option<BTreeMap<String, String>>,
}
