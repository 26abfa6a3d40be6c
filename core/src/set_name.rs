use sha1::{Digest, Sha1};

use crate::{Family, PolicyKey};

/// Fixed names of the two cluster-wide ignore sets.
pub const CLUSTER_IGNORE_V4: &str = "egress-cluster-cidr-ipv4";
pub const CLUSTER_IGNORE_V6: &str = "egress-cluster-cidr-ipv6";

/// Kernel set names are limited to 31 characters.
const MAX_SET_NAME: usize = 31;

/// Whether a per-policy set holds source endpoint IPs or destination CIDRs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SetKind {
    Src,
    Dst,
}

/// A derived per-policy set name together with the family and kind it was
/// derived for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetName {
    pub name: String,
    pub family: Family,
    pub kind: SetKind,
}

pub fn cluster_ignore_set(family: Family) -> &'static str {
    match family {
        Family::V4 => CLUSTER_IGNORE_V4,
        Family::V6 => CLUSTER_IGNORE_V6,
    }
}

/// Derives the name of one of a policy's four sets.
///
/// The name is `prefix + hex(sha1(key))` truncated to fit the kernel's
/// 31-character limit, so distinct policy keys cannot collide in practice
/// and the same key always maps to the same set.
pub fn policy_set_name(kind: SetKind, family: Family, key: &PolicyKey) -> String {
    let prefix = match (kind, family) {
        (SetKind::Src, Family::V4) => "egress-src-v4-",
        (SetKind::Src, Family::V6) => "egress-src-v6-",
        (SetKind::Dst, Family::V4) => "egress-dst-v4-",
        (SetKind::Dst, Family::V6) => "egress-dst-v6-",
    };

    let digest = Sha1::digest(key.canonical().as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        hex.push_str(&format!("{:02x}", byte));
    }

    let mut name = String::with_capacity(MAX_SET_NAME);
    name.push_str(prefix);
    name.push_str(&hex[..MAX_SET_NAME - prefix.len()]);
    name
}

/// All set names owned by a policy, subject to per-family enablement.
pub fn policy_set_names(key: &PolicyKey, enable_v4: bool, enable_v6: bool) -> Vec<SetName> {
    let mut names = Vec::with_capacity(4);
    if enable_v4 {
        for kind in [SetKind::Src, SetKind::Dst] {
            names.push(SetName {
                name: policy_set_name(kind, Family::V4, key),
                family: Family::V4,
                kind,
            });
        }
    }
    if enable_v6 {
        for kind in [SetKind::Src, SetKind::Dst] {
            names.push(SetName {
                name: policy_set_name(kind, Family::V6, key),
                family: Family::V6,
                kind,
            });
        }
    }
    names
}
