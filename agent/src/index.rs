//! Event router: translates watch events from the five resource kinds into
//! typed reconcile requests.
//!
//! Gateways and cluster-info pass straight through. Policies and endpoint
//! slices dispatch only on update and delete: a bare creation carries no
//! gateway binding yet, so the first apply of a key is recorded and
//! swallowed (the gateway status update that follows triggers the work).
//! Endpoint-slice events are remapped to the owning policy's key via the
//! policy-name label.

use ahash::AHashSet;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use egressgateway_core::PolicyKey;
use egressgateway_k8s_api::{
    EgressClusterEndpointSlice, EgressClusterInfo, EgressClusterPolicy, EgressEndpointSlice,
    EgressGateway, EgressPolicy, ResourceExt, LABEL_POLICY_NAME,
};

/// A unit of reconcile work, keyed the way the engine serializes it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Request {
    /// Rebuild the whole on-node rule fabric.
    Gateway,
    /// Re-converge one policy's sets and rules.
    Policy(PolicyKey),
    /// Re-converge the cluster-ignore sets.
    ClusterInfo,
}

pub type SharedIndex = Arc<RwLock<Index>>;

pub struct Index {
    tx: UnboundedSender<Request>,

    /// Policy keys that have had their creation observed.
    seen_policies: AHashSet<PolicyKey>,

    /// Endpoint-slice objects (namespace, name) whose creation has been
    /// observed.
    seen_slices: AHashSet<(Option<String>, String)>,
}

impl Index {
    pub fn shared(tx: UnboundedSender<Request>) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            tx,
            seen_policies: AHashSet::new(),
            seen_slices: AHashSet::new(),
        }))
    }

    fn dispatch(&self, request: Request) {
        debug!(?request, "dispatch");
        if self.tx.send(request).is_err() {
            warn!("reconciler is gone; dropping request");
        }
    }

    fn apply_policy_key(&mut self, key: PolicyKey) {
        if self.seen_policies.insert(key.clone()) {
            debug!(policy = %key, "created; waiting for its gateway binding");
            return;
        }
        self.dispatch(Request::Policy(key));
    }

    fn delete_policy_key(&mut self, key: PolicyKey) {
        self.seen_policies.remove(&key);
        self.dispatch(Request::Policy(key));
    }

    fn apply_slice(&mut self, namespace: Option<String>, slice_name: String, policy: PolicyKey) {
        if self.seen_slices.insert((namespace, slice_name)) {
            return;
        }
        self.dispatch(Request::Policy(policy));
    }
}

impl kubert::index::IndexNamespacedResource<EgressPolicy> for Index {
    fn apply(&mut self, policy: EgressPolicy) {
        let namespace = policy.namespace().expect("EgressPolicy must be namespaced");
        self.apply_policy_key(PolicyKey::namespaced(namespace, policy.name_unchecked()));
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_policy_key(PolicyKey::namespaced(namespace, name));
    }
}

impl kubert::index::IndexClusterResource<EgressClusterPolicy> for Index {
    fn apply(&mut self, policy: EgressClusterPolicy) {
        self.apply_policy_key(PolicyKey::cluster(policy.name_unchecked()));
    }

    fn delete(&mut self, name: String) {
        self.delete_policy_key(PolicyKey::cluster(name));
    }
}

impl kubert::index::IndexNamespacedResource<EgressEndpointSlice> for Index {
    fn apply(&mut self, slice: EgressEndpointSlice) {
        let namespace = slice
            .namespace()
            .expect("EgressEndpointSlice must be namespaced");
        let Some(policy_name) = slice.labels().get(LABEL_POLICY_NAME) else {
            return;
        };
        let policy = PolicyKey::namespaced(namespace.clone(), policy_name.clone());
        self.apply_slice(Some(namespace), slice.name_unchecked(), policy);
    }

    fn delete(&mut self, namespace: String, name: String) {
        // Slice deletions do not dispatch; the policy sees the change on
        // its next update or on the periodic gateway rebuild.
        self.seen_slices.remove(&(Some(namespace), name));
    }
}

impl kubert::index::IndexClusterResource<EgressClusterEndpointSlice> for Index {
    fn apply(&mut self, slice: EgressClusterEndpointSlice) {
        let Some(policy_name) = slice.labels().get(LABEL_POLICY_NAME) else {
            return;
        };
        let policy = PolicyKey::cluster(policy_name.clone());
        self.apply_slice(None, slice.name_unchecked(), policy);
    }

    fn delete(&mut self, name: String) {
        self.seen_slices.remove(&(None, name));
    }
}

impl kubert::index::IndexClusterResource<EgressGateway> for Index {
    fn apply(&mut self, _gateway: EgressGateway) {
        self.dispatch(Request::Gateway);
    }

    fn delete(&mut self, _name: String) {
        self.dispatch(Request::Gateway);
    }
}

impl kubert::index::IndexClusterResource<EgressClusterInfo> for Index {
    fn apply(&mut self, _info: EgressClusterInfo) {
        self.dispatch(Request::ClusterInfo);
    }

    fn delete(&mut self, _name: String) {
        self.dispatch(Request::ClusterInfo);
    }
}
