//! Shared vocabulary for the egress-gateway agent.
//!
//! Everything here is independent of Kubernetes and of the kernel backends:
//! IP families, fwmarks, policy identity, the deterministic ipset naming
//! scheme, and the canonicalization rules used when diffing set memberships.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cidr;
mod diff;
mod family;
mod mark;
mod policy;
mod set_name;

pub use self::{
    cidr::{partition_cidrs, partition_ips, split_dest_subnets, InvalidCidr},
    diff::{canonical_member, find_diff},
    family::Family,
    mark::{InvalidMark, Mark, MARK_AGENT_MASK, MARK_FULL_MASK},
    policy::PolicyKey,
    set_name::{
        cluster_ignore_set, policy_set_name, policy_set_names, SetKind, SetName,
        CLUSTER_IGNORE_V4, CLUSTER_IGNORE_V6,
    },
};

pub use ipnet::IpNet;
