//! The topology builder.
//!
//! Walks the index once and produces an immutable [`Topology`] snapshot:
//! services with their ports and ready endpoints, pods with identity and
//! readiness, and, in ACL mode, TrafficTargets resolved onto destination
//! services, plus TrafficSplits attached to their root services. Dangling
//! references are logged and dropped.

use crate::index::Index;
use trellis_controller_core::topology::{
    Address, Backend, Destination, HttpMatch, HttpRouteGroup, Pod, Port, Service,
    ServiceTrafficTarget, Subset, TcpRoute, Topology, TrafficSpec, TrafficSplit,
};
use trellis_controller_core::ResourceId;
use trellis_controller_k8s_api::{self as k8s, ResourceExt};

pub fn build(index: &Index, acl: bool) -> Topology {
    let mut topology = Topology::default();

    for (id, pod) in &index.pods {
        topology.pods.insert(id.clone(), convert_pod(id, pod));
    }

    for (id, svc) in &index.services {
        let mut service = convert_service(id, svc);
        if let Some(endpoints) = index.endpoints.get(id) {
            attach_endpoints(&mut service, endpoints, &topology.pods);
        }
        topology.services.insert(id.clone(), service);
    }

    if acl {
        let mut targets: Vec<_> = index.traffic_targets.iter().collect();
        targets.sort_by_key(|(id, _)| (*id).clone());
        for (id, target) in targets {
            resolve_traffic_target(index, &mut topology, id, target);
        }
    }

    let mut splits: Vec<_> = index.traffic_splits.iter().collect();
    splits.sort_by_key(|(id, _)| (*id).clone());
    for (id, split) in splits {
        resolve_traffic_split(&mut topology, id, split);
    }

    topology
}

fn convert_pod(id: &ResourceId, pod: &k8s::Pod) -> Pod {
    let service_account = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.service_account_name.clone())
        .unwrap_or_default();
    let ip = pod.status.as_ref().and_then(|status| status.pod_ip.clone());
    let ready = pod
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);

    Pod {
        id: id.clone(),
        service_account,
        ip,
        ready,
    }
}

fn convert_service(id: &ResourceId, svc: &k8s::Service) -> Service {
    let spec = svc.spec.as_ref();
    let cluster_ip = spec
        .and_then(|spec| spec.cluster_ip.clone())
        .filter(|ip| !ip.is_empty() && ip != "None");
    let ports = spec
        .and_then(|spec| spec.ports.as_ref())
        .into_iter()
        .flatten()
        .map(|port| Port {
            name: port.name.clone(),
            port: port.port as u16,
        })
        .collect();
    let selector = spec
        .and_then(|spec| spec.selector.clone())
        .unwrap_or_default();

    Service {
        id: id.clone(),
        cluster_ip,
        ports,
        selector,
        annotations: svc.annotations().clone(),
        ..Default::default()
    }
}

fn attach_endpoints(
    service: &mut Service,
    endpoints: &k8s::Endpoints,
    pods: &std::collections::BTreeMap<ResourceId, Pod>,
) {
    for subset in endpoints.subsets.iter().flatten() {
        let ports = subset
            .ports
            .iter()
            .flatten()
            .map(|port| Port {
                name: port.name.clone(),
                port: port.port as u16,
            })
            .collect();

        let mut addresses = Vec::new();
        for address in subset.addresses.iter().flatten() {
            let pod = address
                .target_ref
                .as_ref()
                .filter(|target| target.kind.as_deref() == Some("Pod"))
                .and_then(|target| {
                    let namespace = target
                        .namespace
                        .clone()
                        .unwrap_or_else(|| service.id.namespace.clone());
                    let name = target.name.clone()?;
                    let id = ResourceId::new(namespace, name);
                    // Only reference pods the index actually knows.
                    pods.contains_key(&id).then_some(id)
                });
            if let Some(pod) = &pod {
                if !service.pods.contains(pod) {
                    service.pods.push(pod.clone());
                }
            }
            addresses.push(Address {
                ip: address.ip.clone(),
                pod,
            });
        }

        service.subsets.push(Subset { ports, addresses });
    }
    service.pods.sort();
}

fn resolve_traffic_target(
    index: &Index,
    topology: &mut Topology,
    id: &ResourceId,
    target: &k8s::access::TrafficTarget,
) {
    let destination = &target.spec.destination;
    if destination.kind != "ServiceAccount" {
        tracing::warn!(traffic_target = %id, kind = %destination.kind, "Unsupported destination kind");
        return;
    }
    let destination_namespace = destination
        .namespace
        .clone()
        .unwrap_or_else(|| id.namespace.clone());

    let destination_pods =
        pods_for_service_account(&topology.pods, &destination_namespace, &destination.name);
    let mut sources = Vec::new();
    for subject in &target.spec.sources {
        if subject.kind != "ServiceAccount" {
            tracing::warn!(traffic_target = %id, kind = %subject.kind, "Unsupported source kind");
            continue;
        }
        let namespace = subject
            .namespace
            .clone()
            .unwrap_or_else(|| id.namespace.clone());
        for pod in pods_for_service_account(&topology.pods, &namespace, &subject.name) {
            if !sources.contains(&pod) {
                sources.push(pod);
            }
        }
    }
    sources.sort();

    let rules = resolve_rules(index, id, target);

    let Topology { services, pods: _ } = topology;
    for service in services.values_mut() {
        if !service
            .pods
            .iter()
            .any(|pod| destination_pods.contains(pod))
        {
            continue;
        }
        // An explicit destination port must exist on the service's endpoints;
        // an absent port covers all of them.
        if let Some(port) = destination.port {
            let exposed = service
                .subsets
                .iter()
                .flat_map(|subset| subset.ports.iter())
                .any(|ep| ep.port == port);
            if !exposed {
                continue;
            }
        }

        service.traffic_targets.push(ServiceTrafficTarget {
            id: id.clone(),
            sources: sources.clone(),
            destination: Destination {
                service_account: destination.name.clone(),
                namespace: destination_namespace.clone(),
                port: destination.port,
                pods: destination_pods.clone(),
            },
            rules: rules.clone(),
        });
    }
}

fn pods_for_service_account(
    pods: &std::collections::BTreeMap<ResourceId, Pod>,
    namespace: &str,
    service_account: &str,
) -> Vec<ResourceId> {
    pods.values()
        .filter(|pod| pod.id.namespace == namespace && pod.service_account == service_account)
        .map(|pod| pod.id.clone())
        .collect()
}

fn resolve_rules(
    index: &Index,
    id: &ResourceId,
    target: &k8s::access::TrafficTarget,
) -> Vec<TrafficSpec> {
    let mut rules = Vec::new();
    for rule in &target.spec.rules {
        let rule_id = ResourceId::new(id.namespace.clone(), rule.name.clone());
        match rule.kind.as_str() {
            "HTTPRouteGroup" => match index.http_route_groups.get(&rule_id) {
                Some(group) => rules.push(TrafficSpec::Http(narrow_route_group(
                    &rule_id,
                    group,
                    &rule.matches,
                ))),
                None => {
                    tracing::warn!(traffic_target = %id, group = %rule_id, "Dropping missing HTTPRouteGroup");
                }
            },
            "TCPRoute" => {
                if index.tcp_routes.contains_key(&rule_id) {
                    rules.push(TrafficSpec::Tcp(TcpRoute { id: rule_id }));
                } else {
                    tracing::warn!(traffic_target = %id, route = %rule_id, "Dropping missing TCPRoute");
                }
            }
            other => {
                tracing::warn!(traffic_target = %id, kind = %other, "Unsupported rule kind");
            }
        }
    }
    rules
}

fn narrow_route_group(
    id: &ResourceId,
    group: &k8s::specs::HTTPRouteGroup,
    names: &[String],
) -> HttpRouteGroup {
    let matches = group
        .spec
        .matches
        .iter()
        .filter(|m| names.is_empty() || names.iter().any(|name| *name == m.name))
        .map(|m| HttpMatch {
            name: m.name.clone(),
            methods: m.methods.clone(),
            path_regex: m.path_regex.clone(),
        })
        .collect::<Vec<_>>();

    for name in names {
        if !group.spec.matches.iter().any(|m| m.name == *name) {
            tracing::warn!(group = %id, %name, "Referenced match not present in group");
        }
    }

    HttpRouteGroup {
        id: id.clone(),
        matches,
    }
}

fn resolve_traffic_split(
    topology: &mut Topology,
    id: &ResourceId,
    split: &k8s::split::TrafficSplit,
) {
    let root = ResourceId::new(id.namespace.clone(), split.spec.service.clone());
    let backends: Vec<Backend> = split
        .spec
        .backends
        .iter()
        .filter_map(|backend| {
            let service = ResourceId::new(id.namespace.clone(), backend.service.clone());
            if !topology.services.contains_key(&service) {
                tracing::warn!(split = %id, backend = %service, "Dropping dangling split backend");
                return None;
            }
            Some(Backend {
                service,
                weight: backend.weight,
            })
        })
        .collect();

    match topology.services.get_mut(&root) {
        Some(service) => service.traffic_splits.push(TrafficSplit {
            id: id.clone(),
            backends,
        }),
        None => {
            tracing::warn!(split = %id, %root, "Dropping split with missing root service");
        }
    }
}

#[cfg(test)]
mod tests;
