//! Typed bindings for the `egressgateway.spidernet.io/v1beta1` API group.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cluster_info;
mod endpoint;
mod gateway;
mod node;
mod policy;

pub use self::{
    cluster_info::{EgressClusterInfo, EgressClusterInfoSpec, EgressClusterInfoStatus, IgnoreCidr, IpListPair},
    endpoint::{EgressClusterEndpointSlice, EgressEndpoint, EgressEndpointSlice},
    gateway::{EgressGateway, EgressGatewaySpec, EgressGatewayStatus, Eip, Ippools, NodeStatus, PolicyRef},
    node::{EgressNode, EgressNodeSpec, EgressNodeStatus},
    policy::{
        AppliedTo, ClusterAppliedTo, EgressClusterPolicy, EgressClusterPolicySpec, EgressIp,
        EgressPolicy, EgressPolicySpec, LabelSelector,
    },
};

pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
pub use kube::{
    api::{Api, ListParams},
    Client, Resource, ResourceExt,
};

pub const GROUP: &str = "egressgateway.spidernet.io";
pub const VERSION: &str = "v1beta1";

/// Label carried by endpoint slices naming the policy that produced them.
pub const LABEL_POLICY_NAME: &str = "egressgateway.spidernet.io/policy-name";
