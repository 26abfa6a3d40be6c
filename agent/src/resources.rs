//! Read access to the cluster state the reconcilers consume.
//!
//! The engine never mutates the API server; everything it needs is a fetch
//! keyed off a reconcile request. Hiding the client behind a trait keeps
//! the reconcile paths testable against canned cluster state.

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::api::ListParams;

use egressgateway_core::PolicyKey;
use egressgateway_k8s_api::{
    Api, Client, EgressClusterEndpointSlice, EgressClusterInfo, EgressClusterPolicy,
    EgressEndpoint, EgressEndpointSlice, EgressGateway, EgressNode, EgressPolicy,
    LABEL_POLICY_NAME,
};

#[async_trait]
pub trait Resources: Send + Sync {
    async fn list_gateways(&self) -> Result<Vec<EgressGateway>>;

    async fn get_policy(&self, namespace: &str, name: &str) -> Result<Option<EgressPolicy>>;

    async fn get_cluster_policy(&self, name: &str) -> Result<Option<EgressClusterPolicy>>;

    /// The fwmark published for a gateway node, if the node exists and has
    /// one.
    async fn get_node_mark(&self, name: &str) -> Result<Option<String>>;

    /// All endpoints from live slices labeled for the policy.
    async fn policy_endpoints(&self, policy: &PolicyKey) -> Result<Vec<EgressEndpoint>>;

    async fn get_cluster_info(&self) -> Result<Option<EgressClusterInfo>>;
}

#[derive(Clone)]
pub struct KubeResources {
    client: Client,
}

impl KubeResources {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn policy_slice_params(name: &str) -> ListParams {
        ListParams::default().labels(&format!("{}={}", LABEL_POLICY_NAME, name))
    }
}

#[async_trait]
impl Resources for KubeResources {
    async fn list_gateways(&self) -> Result<Vec<EgressGateway>> {
        let api = Api::<EgressGateway>::all(self.client.clone());
        let gateways = api
            .list(&ListParams::default())
            .await
            .context("failed to list gateways")?;
        Ok(gateways.items)
    }

    async fn get_policy(&self, namespace: &str, name: &str) -> Result<Option<EgressPolicy>> {
        let api = Api::<EgressPolicy>::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .with_context(|| format!("failed to get policy {}/{}", namespace, name))
    }

    async fn get_cluster_policy(&self, name: &str) -> Result<Option<EgressClusterPolicy>> {
        let api = Api::<EgressClusterPolicy>::all(self.client.clone());
        api.get_opt(name)
            .await
            .with_context(|| format!("failed to get cluster policy {}", name))
    }

    async fn get_node_mark(&self, name: &str) -> Result<Option<String>> {
        let api = Api::<EgressNode>::all(self.client.clone());
        let node = api
            .get_opt(name)
            .await
            .with_context(|| format!("failed to get egress node {}", name))?;
        Ok(node.and_then(|n| n.status.and_then(|s| s.mark)))
    }

    async fn policy_endpoints(&self, policy: &PolicyKey) -> Result<Vec<EgressEndpoint>> {
        let params = Self::policy_slice_params(&policy.name);
        let mut endpoints = Vec::new();
        match &policy.namespace {
            Some(namespace) => {
                let api = Api::<EgressEndpointSlice>::namespaced(self.client.clone(), namespace);
                let slices = api
                    .list(&params)
                    .await
                    .with_context(|| format!("failed to list endpoint slices for {}", policy))?;
                for slice in slices.items {
                    if slice.metadata.deletion_timestamp.is_none() {
                        endpoints.extend(slice.endpoints);
                    }
                }
            }
            None => {
                let api = Api::<EgressClusterEndpointSlice>::all(self.client.clone());
                let slices = api
                    .list(&params)
                    .await
                    .with_context(|| format!("failed to list endpoint slices for {}", policy))?;
                for slice in slices.items {
                    if slice.metadata.deletion_timestamp.is_none() {
                        endpoints.extend(slice.endpoints);
                    }
                }
            }
        }
        Ok(endpoints)
    }

    async fn get_cluster_info(&self) -> Result<Option<EgressClusterInfo>> {
        let api = Api::<EgressClusterInfo>::all(self.client.clone());
        let infos = api
            .list(&ListParams::default())
            .await
            .context("failed to list cluster info")?;
        Ok(infos.items.into_iter().next())
    }
}
