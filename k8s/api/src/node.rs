use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Per-node egress state published by each agent's node-side controller.
/// The policy engine reads only `status.mark`, the fwmark routing traffic to
/// this node's tunnel.
#[derive(Clone, Debug, Default, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "egressgateway.spidernet.io",
    version = "v1beta1",
    kind = "EgressNode",
    status = "EgressNodeStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct EgressNodeSpec {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressNodeStatus {
    pub mark: Option<String>,
    pub phase: Option<String>,
}
