use std::borrow::Cow;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{GROUP, VERSION};

/// A batch of endpoints selected by one policy's applied-to selector,
/// precomputed by the central controller and labeled with
/// [`crate::LABEL_POLICY_NAME`].
///
/// Unlike the other kinds, the endpoint list sits at the top level of the
/// object rather than under `spec`, so `kube::Resource` is implemented by
/// hand instead of via the derive.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EgressEndpointSlice {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub endpoints: Vec<EgressEndpoint>,
}

/// Cluster-scoped variant produced for `EgressClusterPolicy`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EgressClusterEndpointSlice {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub endpoints: Vec<EgressEndpoint>,
}

/// One selected pod and its addresses.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressEndpoint {
    pub namespace: Option<String>,
    pub pod: Option<String>,
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub ipv6: Vec<String>,
    pub node: Option<String>,
}

impl kube::Resource for EgressEndpointSlice {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "EgressEndpointSlice".into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        GROUP.into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        VERSION.into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "egressendpointslices".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl kube::Resource for EgressClusterEndpointSlice {
    type DynamicType = ();
    type Scope = ClusterResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "EgressClusterEndpointSlice".into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        GROUP.into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        VERSION.into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "egressclusterendpointslices".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
