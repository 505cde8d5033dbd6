//! The topology snapshot.
//!
//! A topology is a read-only value graph of the mesh-relevant cluster state,
//! rebuilt from scratch on every reconciliation. Nodes are held in `BTreeMap`s
//! keyed by `ResourceId` and cross-reference each other by key, so the graph
//! carries no shared ownership and iterates deterministically.

use crate::ResourceId;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Topology {
    pub services: BTreeMap<ResourceId, Service>,
    pub pods: BTreeMap<ResourceId, Pod>,
}

impl Topology {
    pub fn service(&self, id: &ResourceId) -> Option<&Service> {
        self.services.get(id)
    }

    pub fn pod(&self, id: &ResourceId) -> Option<&Pod> {
        self.pods.get(id)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Service {
    pub id: ResourceId,
    pub cluster_ip: Option<String>,
    pub ports: Vec<Port>,
    pub selector: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Ready endpoint subsets, mirroring the service's Endpoints object.
    pub subsets: Vec<Subset>,
    /// Pods backing this service, resolved through Endpoints target refs.
    pub pods: Vec<ResourceId>,
    /// TrafficTargets whose destination resolves to this service (ACL mode).
    pub traffic_targets: Vec<ServiceTrafficTarget>,
    /// TrafficSplits rooted at this service.
    pub traffic_splits: Vec<TrafficSplit>,
}

/// A user-facing service port.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Port {
    pub name: Option<String>,
    pub port: u16,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Subset {
    pub ports: Vec<Port>,
    pub addresses: Vec<Address>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Address {
    pub ip: String,
    pub pod: Option<ResourceId>,
}

impl Service {
    /// Resolves the ready endpoint addresses and target port for a service
    /// port, matching subsets by endpoint-port name the way kube-proxy does.
    pub fn endpoints_for_port(&self, port: &Port) -> Vec<(String, u16)> {
        let mut out = Vec::new();
        for subset in &self.subsets {
            let target = subset
                .ports
                .iter()
                .find(|ep| ep.name == port.name)
                .map(|ep| ep.port);
            if let Some(target) = target {
                for addr in &subset.addresses {
                    out.push((addr.ip.clone(), target));
                }
            }
        }
        out
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pod {
    pub id: ResourceId,
    pub service_account: String,
    pub ip: Option<String>,
    pub ready: bool,
}

/// A TrafficTarget resolved against the destination service.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServiceTrafficTarget {
    /// The TrafficTarget resource itself.
    pub id: ResourceId,
    /// Pods allowed to reach the destination.
    pub sources: Vec<ResourceId>,
    pub destination: Destination,
    pub rules: Vec<TrafficSpec>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Destination {
    pub service_account: String,
    pub namespace: String,
    /// Restricts the target to one destination port; `None` covers all ports.
    pub port: Option<u16>,
    /// Destination pods running under the target service account.
    pub pods: Vec<ResourceId>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TrafficSpec {
    Http(HttpRouteGroup),
    Tcp(TcpRoute),
}

/// An HTTPRouteGroup narrowed to the matches a TrafficTarget references.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HttpRouteGroup {
    pub id: ResourceId,
    pub matches: Vec<HttpMatch>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HttpMatch {
    pub name: String,
    pub methods: Vec<String>,
    pub path_regex: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TcpRoute {
    pub id: ResourceId,
}

/// A TrafficSplit with its backends resolved to existing services.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrafficSplit {
    pub id: ResourceId,
    pub backends: Vec<Backend>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Backend {
    pub service: ResourceId,
    pub weight: i32,
}
