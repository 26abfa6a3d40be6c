use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Selects gateway nodes and the EIP pools they may carry. The gateway
/// controller elects nodes and binds policies to EIPs; agents only consume
/// the resulting status.
#[derive(Clone, Debug, Default, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "egressgateway.spidernet.io",
    version = "v1beta1",
    kind = "EgressGateway",
    status = "EgressGatewayStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct EgressGatewaySpec {
    pub ippools: Option<Ippools>,
    pub node_selector: Option<BTreeMap<String, String>>,
    pub cluster_default: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Ippools {
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub ipv6: Vec<String>,
    pub ipv4_default_eip: Option<String>,
    pub ipv6_default_eip: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressGatewayStatus {
    #[serde(default)]
    pub node_list: Vec<NodeStatus>,
}

/// One elected gateway node and the EIPs it currently holds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub name: String,
    #[serde(default)]
    pub eips: Vec<Eip>,
}

/// An EIP of each family and the policies bound to it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Eip {
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    #[serde(default)]
    pub policies: Vec<PolicyRef>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}
