use std::net::IpAddr;

use ipnet::IpNet;

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid CIDR {0:?}")]
pub struct InvalidCidr(pub String);

/// Splits a policy's `destSubnets` into canonical per-family member lists.
///
/// Bare IPs are accepted and canonicalized to host address form; host
/// prefixes collapse to bare addresses; any other CIDR becomes its canonical
/// network form. A malformed entry is a structural error: the policy came
/// from a CRD and must be surfaced rather than silently narrowed.
pub fn split_dest_subnets(subnets: &[String]) -> Result<(Vec<String>, Vec<String>), InvalidCidr> {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for item in subnets {
        if let Ok(ip) = item.parse::<IpAddr>() {
            match ip {
                IpAddr::V4(ip) => v4.push(ip.to_string()),
                IpAddr::V6(ip) => v6.push(ip.to_string()),
            }
            continue;
        }
        match item.parse::<IpNet>() {
            Ok(net @ IpNet::V4(_)) => v4.push(crate::canonical_member(&net.to_string())),
            Ok(net @ IpNet::V6(_)) => v6.push(crate::canonical_member(&net.to_string())),
            Err(_) => return Err(InvalidCidr(item.clone())),
        }
    }
    Ok((v4, v6))
}

/// Partitions plain addresses by family, in host address form. Entries that
/// do not parse are dropped: these come from another controller's status and
/// are not actionable here.
pub fn partition_ips(items: impl IntoIterator<Item = impl AsRef<str>>) -> (Vec<String>, Vec<String>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for item in items {
        match item.as_ref().parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => v4.push(ip.to_string()),
            Ok(IpAddr::V6(ip)) => v6.push(ip.to_string()),
            Err(_) => {}
        }
    }
    (v4, v6)
}

/// Partitions CIDRs by family in canonical network form, dropping entries
/// that do not parse.
pub fn partition_cidrs(
    items: impl IntoIterator<Item = impl AsRef<str>>,
) -> (Vec<String>, Vec<String>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for item in items {
        match item.as_ref().parse::<IpNet>() {
            Ok(net @ IpNet::V4(_)) => v4.push(net.trunc().to_string()),
            Ok(net @ IpNet::V6(_)) => v6.push(net.trunc().to_string()),
            Err(_) => {}
        }
    }
    (v4, v6)
}
