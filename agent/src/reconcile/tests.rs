use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use maplit::btreeset;
use parking_lot::Mutex;

use egressgateway_core::{
    policy_set_name, Family, PolicyKey, SetKind, CLUSTER_IGNORE_V4, CLUSTER_IGNORE_V6,
};
use egressgateway_ipset::{Error as SetError, IpSet, SetBackend};
use egressgateway_iptables::{Driver, Error as TableError, Options, Table};
use egressgateway_k8s_api::{
    EgressClusterInfo, EgressClusterInfoStatus, EgressClusterPolicy, EgressEndpoint, EgressGateway,
    EgressGatewayStatus, EgressPolicy, Eip, IgnoreCidr, IpListPair, NodeStatus, ObjectMeta,
    PolicyRef,
};

use super::policy::find_binding;
use super::*;
use crate::config::FileConfig;
use crate::resources::Resources;

const LOCAL_NODE: &str = "nodeA";
const REMOTE_NODE: &str = "nodeB";

// === fakes ===

/// In-memory set backend mirroring the ipset contract.
#[derive(Default)]
struct MemorySets {
    sets: Mutex<BTreeMap<String, (Family, BTreeSet<String>)>>,
}

impl MemorySets {
    fn exists(&self, name: &str) -> bool {
        self.sets.lock().contains_key(name)
    }

    fn members(&self, name: &str) -> BTreeSet<String> {
        self.sets
            .lock()
            .get(name)
            .map(|(_, members)| members.clone())
            .unwrap_or_default()
    }
}

impl SetBackend for MemorySets {
    fn create_set(&self, set: &IpSet, ignore_existing: bool) -> Result<(), SetError> {
        let mut sets = self.sets.lock();
        if sets.contains_key(&set.name) && !ignore_existing {
            return Err(SetError::Command {
                args: format!("create {}", set.name),
                stderr: "set already exists".to_string(),
            });
        }
        sets.entry(set.name.clone())
            .or_insert_with(|| (set.family, BTreeSet::new()));
        Ok(())
    }

    fn destroy_set(&self, name: &str) -> Result<(), SetError> {
        self.sets
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SetError::NotFound(name.to_string()))
    }

    fn add_entry(&self, entry: &str, set: &IpSet, ignore_existing: bool) -> Result<(), SetError> {
        let mut sets = self.sets.lock();
        let (_, members) = sets
            .get_mut(&set.name)
            .ok_or_else(|| SetError::NotFound(set.name.clone()))?;
        if !members.insert(entry.to_string()) && !ignore_existing {
            return Err(SetError::AlreadyAdded);
        }
        Ok(())
    }

    fn del_entry(&self, entry: &str, set_name: &str) -> Result<(), SetError> {
        let mut sets = self.sets.lock();
        let (_, members) = sets
            .get_mut(set_name)
            .ok_or_else(|| SetError::NotFound(set_name.to_string()))?;
        members.remove(entry);
        Ok(())
    }

    fn list_entries(&self, name: &str) -> Result<Vec<String>, SetError> {
        let sets = self.sets.lock();
        let (_, members) = sets
            .get(name)
            .ok_or_else(|| SetError::NotFound(name.to_string()))?;
        Ok(members.iter().cloned().collect())
    }
}

/// Shared fake kernel: chain contents per (table, family), mutated by a
/// miniature restore interpreter so applies observe their own prior state.
#[derive(Clone, Default)]
struct FakeKernel {
    tables: Arc<Mutex<BTreeMap<(String, Family), BTreeMap<String, Vec<String>>>>>,
}

impl FakeKernel {
    fn rules(&self, table: &str, family: Family, chain: &str) -> Vec<String> {
        self.tables
            .lock()
            .get(&(table.to_string(), family))
            .and_then(|chains| chains.get(chain))
            .cloned()
            .unwrap_or_default()
    }

    fn flush_chain(&self, table: &str, family: Family, chain: &str) {
        if let Some(chains) = self.tables.lock().get_mut(&(table.to_string(), family)) {
            if let Some(rules) = chains.get_mut(chain) {
                rules.clear();
            }
        }
    }

    fn driver(&self) -> Box<dyn Driver> {
        Box::new(FakeDriver {
            kernel: self.clone(),
        })
    }
}

struct FakeDriver {
    kernel: FakeKernel,
}

impl Driver for FakeDriver {
    fn save(&mut self, table: &str, family: Family) -> Result<String, TableError> {
        let tables = self.kernel.tables.lock();
        let mut out = format!("*{}\n", table);
        if let Some(chains) = tables.get(&(table.to_string(), family)) {
            for chain in chains.keys() {
                out.push_str(&format!(":{} - [0:0]\n", chain));
            }
            for (chain, rules) in chains {
                for rule in rules {
                    out.push_str(&format!("-A {} {}\n", chain, rule));
                }
            }
        }
        out.push_str("COMMIT\n");
        Ok(out)
    }

    fn restore(
        &mut self,
        table: &str,
        family: Family,
        payload: &str,
        _wait: bool,
    ) -> Result<(), TableError> {
        let mut tables = self.kernel.tables.lock();
        let chains = tables.entry((table.to_string(), family)).or_default();
        for line in payload.lines() {
            let line = line.trim_end();
            if line.is_empty() || line == "COMMIT" || line.starts_with('*') {
                continue;
            }
            if let Some(rest) = line.strip_prefix(':') {
                if let Some(name) = rest.split_whitespace().next() {
                    chains.entry(name.to_string()).or_default();
                }
            } else if let Some(name) = line.strip_prefix("-F ") {
                chains.entry(name.to_string()).or_default().clear();
            } else if let Some(rest) = line.strip_prefix("-D ") {
                let mut parts = rest.splitn(2, ' ');
                let chain = parts.next().unwrap_or_default().to_string();
                let index: usize = parts.next().unwrap_or("0").parse().unwrap_or(0);
                if let Some(rules) = chains.get_mut(&chain) {
                    if index >= 1 && index <= rules.len() {
                        rules.remove(index - 1);
                    }
                }
            } else if let Some(rest) = line.strip_prefix("-I ") {
                let mut parts = rest.splitn(3, ' ');
                let chain = parts.next().unwrap_or_default().to_string();
                let index: usize = parts.next().unwrap_or("1").parse().unwrap_or(1);
                let spec = parts.next().unwrap_or_default().to_string();
                let rules = chains.entry(chain).or_default();
                let at = (index - 1).min(rules.len());
                rules.insert(at, spec);
            } else if let Some(rest) = line.strip_prefix("-A ") {
                let mut parts = rest.splitn(2, ' ');
                let chain = parts.next().unwrap_or_default().to_string();
                let spec = parts.next().unwrap_or_default().to_string();
                chains.entry(chain).or_default().push(spec);
            }
        }
        Ok(())
    }
}

/// Canned cluster state behind the `Resources` seam.
#[derive(Clone, Default)]
struct FakeResources {
    state: Arc<Mutex<ClusterState>>,
}

#[derive(Default)]
struct ClusterState {
    gateways: Vec<EgressGateway>,
    policies: HashMap<(String, String), EgressPolicy>,
    cluster_policies: HashMap<String, EgressClusterPolicy>,
    node_marks: HashMap<String, String>,
    endpoints: HashMap<PolicyKey, Vec<EgressEndpoint>>,
    info: Option<EgressClusterInfo>,
}

impl FakeResources {
    fn set_gateway(&self, gateway: EgressGateway) {
        self.state.lock().gateways = vec![gateway];
    }

    fn set_policy(&self, policy: EgressPolicy) {
        let ns = policy.metadata.namespace.clone().unwrap();
        let name = policy.metadata.name.clone().unwrap();
        self.state.lock().policies.insert((ns, name), policy);
    }

    fn remove_policy(&self, ns: &str, name: &str) {
        self.state
            .lock()
            .policies
            .remove(&(ns.to_string(), name.to_string()));
    }

    fn set_cluster_policy(&self, policy: EgressClusterPolicy) {
        let name = policy.metadata.name.clone().unwrap();
        self.state.lock().cluster_policies.insert(name, policy);
    }

    fn set_node_mark(&self, node: &str, mark: &str) {
        self.state
            .lock()
            .node_marks
            .insert(node.to_string(), mark.to_string());
    }

    fn set_endpoints(&self, policy: PolicyKey, endpoints: Vec<EgressEndpoint>) {
        self.state.lock().endpoints.insert(policy, endpoints);
    }

    fn set_info(&self, info: EgressClusterInfo) {
        self.state.lock().info = Some(info);
    }
}

#[async_trait]
impl Resources for FakeResources {
    async fn list_gateways(&self) -> Result<Vec<EgressGateway>> {
        Ok(self.state.lock().gateways.clone())
    }

    async fn get_policy(&self, namespace: &str, name: &str) -> Result<Option<EgressPolicy>> {
        Ok(self
            .state
            .lock()
            .policies
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_cluster_policy(&self, name: &str) -> Result<Option<EgressClusterPolicy>> {
        Ok(self.state.lock().cluster_policies.get(name).cloned())
    }

    async fn get_node_mark(&self, name: &str) -> Result<Option<String>> {
        Ok(self.state.lock().node_marks.get(name).cloned())
    }

    async fn policy_endpoints(&self, policy: &PolicyKey) -> Result<Vec<EgressEndpoint>> {
        Ok(self
            .state
            .lock()
            .endpoints
            .get(policy)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_cluster_info(&self) -> Result<Option<EgressClusterInfo>> {
        Ok(self.state.lock().info.clone())
    }
}

// === fixtures ===

fn mk_gateway(node: &str, eip_v4: Option<&str>, eip_v6: Option<&str>, policies: &[PolicyKey]) -> EgressGateway {
    EgressGateway {
        metadata: ObjectMeta {
            name: Some("default".to_string()),
            ..Default::default()
        },
        spec: Default::default(),
        status: Some(EgressGatewayStatus {
            node_list: vec![NodeStatus {
                name: node.to_string(),
                eips: vec![Eip {
                    ipv4: eip_v4.map(str::to_string),
                    ipv6: eip_v6.map(str::to_string),
                    policies: policies
                        .iter()
                        .map(|key| PolicyRef {
                            name: key.name.clone(),
                            namespace: key.namespace.clone(),
                        })
                        .collect(),
                }],
            }],
        }),
    }
}

fn mk_policy(ns: &str, name: &str, dest: &[&str]) -> EgressPolicy {
    EgressPolicy {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: egressgateway_k8s_api::EgressPolicySpec {
            dest_subnet: dest.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        },
    }
}

fn mk_endpoint(node: &str, ipv4: &[&str], ipv6: &[&str]) -> EgressEndpoint {
    EgressEndpoint {
        node: Some(node.to_string()),
        ipv4: ipv4.iter().map(|s| s.to_string()).collect(),
        ipv6: ipv6.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

fn mk_info(node_ips: &[&str], pod_cidrs: &[&str], cluster_cidrs: &[&str]) -> EgressClusterInfo {
    let pair = |items: &[&str]| {
        let (v4, v6): (Vec<_>, Vec<_>) = items
            .iter()
            .map(|s| s.to_string())
            .partition(|s| !s.contains(':'));
        Some(IpListPair { ipv4: v4, ipv6: v6 })
    };
    EgressClusterInfo {
        metadata: ObjectMeta {
            name: Some("default".to_string()),
            ..Default::default()
        },
        spec: Default::default(),
        status: Some(EgressClusterInfoStatus {
            egress_ignore_cidr: Some(IgnoreCidr {
                node_ip: pair(node_ips),
                pod_cidr: pair(pod_cidrs),
                cluster_ip: pair(cluster_cidrs),
            }),
        }),
    }
}

struct Harness {
    reconciler: Reconciler<FakeResources>,
    resources: FakeResources,
    sets: Arc<MemorySets>,
    kernel: FakeKernel,
}

fn harness(enable_v6: bool) -> Harness {
    let resources = FakeResources::default();
    let sets = Arc::new(MemorySets::default());
    let kernel = FakeKernel::default();

    let config = FileConfig {
        enable_ipv6: enable_v6,
        ..Default::default()
    };
    let options = Options::default();

    let mut tables = Tables {
        mangle: Vec::new(),
        nat: Vec::new(),
        filter: Vec::new(),
    };
    let mut families = vec![Family::V4];
    if enable_v6 {
        families.push(Family::V6);
    }
    for family in families {
        tables
            .mangle
            .push(Table::new("mangle", family, CHAIN_PREFIX, &options, kernel.driver()));
        tables
            .nat
            .push(Table::new("nat", family, CHAIN_PREFIX, &options, kernel.driver()));
        tables
            .filter
            .push(Table::new("filter", family, CHAIN_PREFIX, &options, kernel.driver()));
    }

    let backend: Arc<dyn SetBackend> = sets.clone();
    let reconciler = Reconciler::new(
        resources.clone(),
        backend,
        tables,
        &config,
        LOCAL_NODE.to_string(),
    )
    .unwrap();

    Harness {
        reconciler,
        resources,
        sets,
        kernel,
    }
}

fn src_v4(key: &PolicyKey) -> String {
    policy_set_name(SetKind::Src, Family::V4, key)
}

fn dst_v4(key: &PolicyKey) -> String {
    policy_set_name(SetKind::Dst, Family::V4, key)
}

/// The state of scenario "single local policy": `ns1/app` with one dest
/// subnet, EIP on the local node, one local endpoint.
fn seed_local_policy(h: &Harness) -> PolicyKey {
    let key = PolicyKey::namespaced("ns1", "app");
    h.resources
        .set_gateway(mk_gateway(LOCAL_NODE, Some("192.168.10.5"), None, &[key.clone()]));
    h.resources.set_policy(mk_policy("ns1", "app", &["10.6.1.92/32"]));
    h.resources.set_endpoints(
        key.clone(),
        vec![mk_endpoint(LOCAL_NODE, &["10.244.0.7"], &[])],
    );
    key
}

// === scenarios ===

#[tokio::test]
async fn single_local_policy_programs_sets_and_snat_rule() {
    let mut h = harness(false);
    let key = seed_local_policy(&h);

    h.reconciler.rebuild().await.unwrap();

    assert_eq!(
        h.sets.members(&src_v4(&key)),
        btreeset! {"10.244.0.7".to_string()}
    );
    assert_eq!(
        h.sets.members(&dst_v4(&key)),
        btreeset! {"10.6.1.92".to_string()},
        "host prefixes canonicalize to bare addresses"
    );

    let snat = h.kernel.rules("nat", Family::V4, SNAT_CHAIN);
    assert_eq!(snat.len(), 1);
    assert!(snat[0].contains(&format!("-m set --match-set {} src", src_v4(&key))));
    assert!(snat[0].contains(&format!("-m set --match-set {} dst", dst_v4(&key))));
    assert!(snat[0].contains("-m conntrack --ctdir ORIGINAL"));
    assert!(snat[0].ends_with("-j SNAT --to-source 192.168.10.5"));

    assert!(h.kernel.rules("mangle", Family::V4, MARK_CHAIN).is_empty());
}

#[tokio::test]
async fn single_remote_policy_programs_mark_rule() {
    let mut h = harness(false);
    let key = PolicyKey::namespaced("ns1", "app");
    h.resources
        .set_gateway(mk_gateway(REMOTE_NODE, Some("192.168.10.5"), None, &[key.clone()]));
    h.resources.set_node_mark(REMOTE_NODE, "0x26000001");
    h.resources.set_policy(mk_policy("ns1", "app", &["10.6.1.92/32"]));
    h.resources.set_endpoints(
        key.clone(),
        vec![mk_endpoint(LOCAL_NODE, &["10.244.0.7"], &[])],
    );

    h.reconciler.rebuild().await.unwrap();

    // The endpoint is local, so it still feeds the src set for marking.
    assert_eq!(
        h.sets.members(&src_v4(&key)),
        btreeset! {"10.244.0.7".to_string()}
    );

    let mark = h.kernel.rules("mangle", Family::V4, MARK_CHAIN);
    assert_eq!(mark.len(), 1);
    assert!(mark[0].ends_with("-j MARK --set-xmark 0x26000001/0xffffffff"));

    assert!(h.kernel.rules("nat", Family::V4, SNAT_CHAIN).is_empty());
}

#[tokio::test]
async fn remote_endpoints_are_excluded_unless_gateway_is_local() {
    let mut h = harness(false);
    let key = seed_local_policy(&h);
    h.resources.set_endpoints(
        key.clone(),
        vec![
            mk_endpoint(LOCAL_NODE, &["10.244.0.7"], &[]),
            mk_endpoint(REMOTE_NODE, &["10.244.1.3"], &[]),
        ],
    );

    // EIP on the local node: the gateway SNATs for every selected pod.
    h.reconciler.rebuild().await.unwrap();
    assert_eq!(
        h.sets.members(&src_v4(&key)),
        btreeset! {"10.244.0.7".to_string(), "10.244.1.3".to_string()}
    );

    // EIP moves away: only local pods matter for the mark path.
    h.resources
        .set_gateway(mk_gateway(REMOTE_NODE, Some("192.168.10.5"), None, &[key.clone()]));
    h.resources.set_node_mark(REMOTE_NODE, "0x26000001");
    h.reconciler.rebuild().await.unwrap();
    assert_eq!(
        h.sets.members(&src_v4(&key)),
        btreeset! {"10.244.0.7".to_string()}
    );
}

#[tokio::test]
async fn empty_dest_subnets_negates_the_cluster_ignore_set() {
    let mut h = harness(false);
    let key = PolicyKey::namespaced("ns1", "app");
    h.resources
        .set_gateway(mk_gateway(LOCAL_NODE, Some("192.168.10.5"), None, &[key.clone()]));
    h.resources.set_policy(mk_policy("ns1", "app", &[]));
    h.resources.set_endpoints(
        key.clone(),
        vec![mk_endpoint(LOCAL_NODE, &["10.244.0.7"], &[])],
    );
    h.resources.set_info(mk_info(&[], &[], &["10.96.0.0/12"]));

    h.reconciler.reconcile_cluster_info().await.unwrap();
    h.reconciler.rebuild().await.unwrap();

    assert_eq!(
        h.sets.members(CLUSTER_IGNORE_V4),
        btreeset! {"10.96.0.0/12".to_string()}
    );

    let snat = h.kernel.rules("nat", Family::V4, SNAT_CHAIN);
    assert_eq!(snat.len(), 1);
    assert!(snat[0].contains(&format!("-m set ! --match-set {} dst", CLUSTER_IGNORE_V4)));
    assert!(!snat[0].contains(&format!("-m set --match-set {} dst", dst_v4(&key))));
}

#[tokio::test]
async fn policy_deletion_removes_rule_then_sets() {
    let mut h = harness(false);
    let key = seed_local_policy(&h);
    h.reconciler.rebuild().await.unwrap();
    assert!(h.sets.exists(&src_v4(&key)));

    h.resources.remove_policy("ns1", "app");
    h.reconciler.reconcile_policy(key.clone()).await.unwrap();

    assert!(!h.sets.exists(&src_v4(&key)));
    assert!(!h.sets.exists(&dst_v4(&key)));
    assert!(h.kernel.rules("nat", Family::V4, SNAT_CHAIN).is_empty());
}

#[tokio::test]
async fn refresh_restores_an_externally_flushed_chain() {
    let mut h = harness(false);
    seed_local_policy(&h);
    h.reconciler.rebuild().await.unwrap();
    assert_eq!(h.kernel.rules("nat", Family::V4, SNAT_CHAIN).len(), 1);

    h.kernel.flush_chain("nat", Family::V4, SNAT_CHAIN);
    assert!(h.kernel.rules("nat", Family::V4, SNAT_CHAIN).is_empty());

    // No CRD event: the periodic refresh alone restores the snapshot.
    h.reconciler.refresh();
    assert_eq!(h.kernel.rules("nat", Family::V4, SNAT_CHAIN).len(), 1);
}

#[tokio::test]
async fn gateway_rebind_swaps_snat_for_mark() {
    let mut h = harness(false);
    let key = seed_local_policy(&h);
    h.reconciler.rebuild().await.unwrap();
    assert_eq!(h.kernel.rules("nat", Family::V4, SNAT_CHAIN).len(), 1);

    h.resources
        .set_gateway(mk_gateway(REMOTE_NODE, Some("192.168.10.5"), None, &[key.clone()]));
    h.resources.set_node_mark(REMOTE_NODE, "0x26000002");
    h.reconciler.rebuild().await.unwrap();

    assert!(h.kernel.rules("nat", Family::V4, SNAT_CHAIN).is_empty());
    let mark = h.kernel.rules("mangle", Family::V4, MARK_CHAIN);
    assert_eq!(mark.len(), 1);
    assert!(mark[0].ends_with("-j MARK --set-xmark 0x26000002/0xffffffff"));

    assert_eq!(
        h.sets.members(&src_v4(&key)),
        btreeset! {"10.244.0.7".to_string()}
    );
}

// === other behaviors ===

#[tokio::test]
async fn rebuild_installs_static_glue_rules() {
    let mut h = harness(false);
    seed_local_policy(&h);
    h.reconciler.rebuild().await.unwrap();

    let forward = h.kernel.rules("filter", Family::V4, "FORWARD");
    assert!(forward
        .iter()
        .any(|r| r.contains("--mark 0x26000000/0xffffffff") && r.contains("-j ACCEPT")));

    let prerouting = h.kernel.rules("mangle", Family::V4, "PREROUTING");
    assert!(prerouting.iter().any(|r| r.contains("-j EGRESSGATEWAY-MARK-REQUEST")));

    let mangle_forward = h.kernel.rules("mangle", Family::V4, "FORWARD");
    assert!(mangle_forward.iter().any(|r| {
        r.contains("--mark 0x26000000/0xff000000")
            && r.contains("-j MARK --set-xmark 0x26000000/0xffffffff")
    }));

    let postrouting = h.kernel.rules("nat", Family::V4, "POSTROUTING");
    let accept_at = postrouting
        .iter()
        .position(|r| r.contains("-j ACCEPT"))
        .expect("accept-on-mark present");
    let jump_at = postrouting
        .iter()
        .position(|r| r.contains("-j EGRESSGATEWAY-SNAT-EIP"))
        .expect("jump present");
    assert!(accept_at < jump_at, "marked flows must be accepted before the SNAT jump");
}

#[tokio::test]
async fn rebuild_is_idempotent_for_glue_rules() {
    let mut h = harness(false);
    seed_local_policy(&h);
    h.reconciler.rebuild().await.unwrap();
    let first = h.kernel.rules("nat", Family::V4, "POSTROUTING");

    h.reconciler.rebuild().await.unwrap();
    h.reconciler.rebuild().await.unwrap();
    assert_eq!(h.kernel.rules("nat", Family::V4, "POSTROUTING"), first);
}

#[tokio::test]
async fn missing_gateway_node_mark_skips_the_rule() {
    let mut h = harness(false);
    let key = PolicyKey::namespaced("ns1", "app");
    h.resources
        .set_gateway(mk_gateway(REMOTE_NODE, Some("192.168.10.5"), None, &[key.clone()]));
    // No mark published for nodeB.
    h.resources.set_policy(mk_policy("ns1", "app", &[]));

    h.reconciler.rebuild().await.unwrap();
    assert!(h.kernel.rules("mangle", Family::V4, MARK_CHAIN).is_empty());
}

#[tokio::test]
async fn malformed_dest_subnet_fails_the_policy_pass() {
    let mut h = harness(false);
    let key = PolicyKey::namespaced("ns1", "app");
    h.resources
        .set_gateway(mk_gateway(LOCAL_NODE, Some("192.168.10.5"), None, &[key.clone()]));
    h.resources.set_policy(mk_policy("ns1", "app", &["10.6.1.92/33"]));

    assert!(h.reconciler.reconcile_policy(key).await.is_err());
}

#[tokio::test]
async fn cluster_policy_uses_the_unqualified_key() {
    let mut h = harness(false);
    let key = PolicyKey::cluster("all-pods");
    h.resources
        .set_gateway(mk_gateway(LOCAL_NODE, Some("192.168.10.5"), None, &[key.clone()]));
    h.resources.set_cluster_policy(EgressClusterPolicy {
        metadata: ObjectMeta {
            name: Some("all-pods".to_string()),
            ..Default::default()
        },
        spec: Default::default(),
    });
    h.resources.set_endpoints(
        key.clone(),
        vec![mk_endpoint(LOCAL_NODE, &["10.244.0.9"], &[])],
    );

    h.reconciler.rebuild().await.unwrap();
    assert_eq!(
        h.sets.members(&src_v4(&key)),
        btreeset! {"10.244.0.9".to_string()}
    );
}

#[tokio::test]
async fn dual_stack_policy_programs_both_families() {
    let mut h = harness(true);
    let key = PolicyKey::namespaced("ns1", "app");
    h.resources.set_gateway(mk_gateway(
        LOCAL_NODE,
        Some("192.168.10.5"),
        Some("fddd:192::5"),
        &[key.clone()],
    ));
    h.resources
        .set_policy(mk_policy("ns1", "app", &["10.6.0.0/16", "fddd:10::/64"]));
    h.resources.set_endpoints(
        key.clone(),
        vec![mk_endpoint(LOCAL_NODE, &["10.244.0.7"], &["fd00::7"])],
    );

    h.reconciler.rebuild().await.unwrap();

    assert_eq!(
        h.sets.members(&policy_set_name(SetKind::Src, Family::V6, &key)),
        btreeset! {"fd00::7".to_string()}
    );
    assert_eq!(
        h.sets.members(&policy_set_name(SetKind::Dst, Family::V6, &key)),
        btreeset! {"fddd:10::/64".to_string()}
    );

    let v4 = h.kernel.rules("nat", Family::V4, SNAT_CHAIN);
    let v6 = h.kernel.rules("nat", Family::V6, SNAT_CHAIN);
    assert_eq!(v4.len(), 1);
    assert_eq!(v6.len(), 1);
    assert!(v4[0].ends_with("-j SNAT --to-source 192.168.10.5"));
    assert!(v6[0].ends_with("-j SNAT --to-source fddd:192::5"));
}

#[tokio::test]
async fn cluster_info_updates_converge_membership() {
    let mut h = harness(false);
    h.resources.set_info(mk_info(
        &["172.18.0.2"],
        &["10.244.0.0/16"],
        &["10.96.0.0/12"],
    ));
    h.reconciler.reconcile_cluster_info().await.unwrap();
    assert_eq!(
        h.sets.members(CLUSTER_IGNORE_V4),
        btreeset! {
            "172.18.0.2".to_string(),
            "10.244.0.0/16".to_string(),
            "10.96.0.0/12".to_string(),
        }
    );
    // Both fixed-name sets exist even when only one family is enabled.
    assert!(h.sets.exists(CLUSTER_IGNORE_V6));

    // A node disappears: its address is removed, the rest stay.
    h.resources.set_info(mk_info(&[], &["10.244.0.0/16"], &["10.96.0.0/12"]));
    h.reconciler.reconcile_cluster_info().await.unwrap();
    assert_eq!(
        h.sets.members(CLUSTER_IGNORE_V4),
        btreeset! {
            "10.244.0.0/16".to_string(),
            "10.96.0.0/12".to_string(),
        }
    );
}

#[tokio::test]
async fn custom_ignore_cidrs_join_the_sets() {
    let mut h = harness(false);
    h.reconciler.custom_ignore_cidrs = vec!["203.0.113.0/24".to_string()];
    h.resources.set_info(mk_info(&[], &[], &[]));
    h.reconciler.reconcile_cluster_info().await.unwrap();
    assert_eq!(
        h.sets.members(CLUSTER_IGNORE_V4),
        btreeset! {"203.0.113.0/24".to_string()}
    );
}

#[test]
fn find_binding_matches_scope() {
    let namespaced = PolicyKey::namespaced("ns1", "app");
    let cluster = PolicyKey::cluster("app");

    let gateway = mk_gateway(LOCAL_NODE, Some("192.168.10.5"), None, &[namespaced.clone()]);
    let gateways = vec![gateway];

    let binding = find_binding(&gateways, &namespaced).expect("namespaced key binds");
    assert_eq!(binding.node, LOCAL_NODE);
    assert_eq!(binding.eip_v4.as_deref(), Some("192.168.10.5"));

    assert!(
        find_binding(&gateways, &cluster).is_none(),
        "a cluster-scoped key must not match a namespaced ref"
    );
}
