use std::collections::HashSet;

use ipnet::IpNet;

/// Rewrites a set member into the canonical form used for diffing.
///
/// `hash:net` sets accept both `10.0.0.1` and `10.0.0.1/32` for the same
/// member, and list entries back in their stored form; without a stable
/// canonical form a diff would flap. Host prefixes are stripped to bare
/// addresses and other CIDRs are rewritten to their canonical network form.
pub fn canonical_member(member: &str) -> String {
    if let Some(addr) = member.strip_suffix("/32") {
        if addr.parse::<std::net::Ipv4Addr>().is_ok() {
            return addr.to_string();
        }
    }
    if let Some(addr) = member.strip_suffix("/128") {
        if let Ok(ip) = addr.parse::<std::net::Ipv6Addr>() {
            return ip.to_string();
        }
    }
    if let Ok(net) = member.parse::<IpNet>() {
        return net.trunc().to_string();
    }
    member.to_string()
}

/// Diffs a set's current membership against the desired membership.
///
/// Desired entries are canonicalized first; current entries are taken as the
/// backend listed them. Returns `(to_add, to_del)` preserving input order.
/// `find_diff(a, a)` is empty for any `a`, and applying the diff to `old`
/// yields exactly the canonicalized `new`.
pub fn find_diff(old: &[String], new: &[String]) -> (Vec<String>, Vec<String>) {
    let new: Vec<String> = new.iter().map(|m| canonical_member(m)).collect();

    let old_set: HashSet<&str> = old.iter().map(String::as_str).collect();
    let new_set: HashSet<&str> = new.iter().map(String::as_str).collect();

    let mut to_add = Vec::new();
    let mut seen = HashSet::new();
    for member in &new {
        if !old_set.contains(member.as_str()) && seen.insert(member.as_str()) {
            to_add.push(member.clone());
        }
    }

    let mut to_del = Vec::new();
    let mut seen = HashSet::new();
    for member in old {
        if !new_set.contains(member.as_str()) && seen.insert(member.as_str()) {
            to_del.push(member.clone());
        }
    }

    (to_add, to_del)
}
