use crate::{
    filter::ResourceFilter,
    index::{Index, Kind, SharedIndex},
    queue::WorkQueue,
    topology,
};
use kubert::index::IndexNamespacedResource;
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, ObjectReference, Pod, PodCondition,
    PodSpec, PodStatus, Service, ServicePort, ServiceSpec,
};
use trellis_controller_core::topology::TrafficSpec;
use trellis_controller_core::ResourceId;
use trellis_controller_k8s_api::{
    access::{IdentityBindingSubject, TrafficTarget, TrafficTargetRule, TrafficTargetSpec},
    specs::{HTTPRouteGroup, HttpMatch, HttpRouteGroupSpec},
    split::{TrafficSplit, TrafficSplitBackend, TrafficSplitSpec},
    ObjectMeta,
};

fn index() -> SharedIndex {
    Index::shared(
        ResourceFilter::default(),
        WorkQueue::new(),
        vec![Kind::Services],
    )
}

fn meta(ns: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(ns.to_string()),
        ..Default::default()
    }
}

fn service(ns: &str, name: &str, ports: &[(Option<&str>, u16)]) -> Service {
    Service {
        metadata: meta(ns, name),
        spec: Some(ServiceSpec {
            cluster_ip: Some("10.96.0.10".to_string()),
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port)| ServicePort {
                        name: port_name.map(str::to_string),
                        port: *port as i32,
                        ..Default::default()
                    })
                    .collect(),
            ),
            selector: Some(
                Some(("app".to_string(), name.to_string()))
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        }),
        status: None,
    }
}

fn endpoints(ns: &str, name: &str, pods: &[(&str, &str)], port: u16) -> Endpoints {
    Endpoints {
        metadata: meta(ns, name),
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                pods.iter()
                    .map(|(pod, ip)| EndpointAddress {
                        ip: ip.to_string(),
                        target_ref: Some(ObjectReference {
                            kind: Some("Pod".to_string()),
                            name: Some(pod.to_string()),
                            namespace: Some(ns.to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(vec![EndpointPort {
                port: port as i32,
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}

fn pod(ns: &str, name: &str, service_account: &str, ip: &str) -> Pod {
    Pod {
        metadata: meta(ns, name),
        spec: Some(PodSpec {
            service_account_name: Some(service_account.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            pod_ip: Some(ip.to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

#[test]
fn services_resolve_pods_through_endpoints() {
    let index = index();
    {
        let mut idx = index.write();
        idx.apply(service("a", "foo", &[(None, 80)]));
        idx.apply(endpoints("a", "foo", &[("foo-1", "10.4.0.7")], 8080));
        idx.apply(pod("a", "foo-1", "foo-sa", "10.4.0.7"));
    }

    let topology = topology::build(&index.read(), false);
    let svc = topology
        .service(&ResourceId::new("a", "foo"))
        .expect("service indexed");
    assert_eq!(svc.cluster_ip.as_deref(), Some("10.96.0.10"));
    assert_eq!(svc.ports.len(), 1);
    assert_eq!(svc.pods, vec![ResourceId::new("a", "foo-1")]);
    assert_eq!(
        svc.endpoints_for_port(&svc.ports[0]),
        vec![("10.4.0.7".to_string(), 8080)]
    );

    let pod = topology.pod(&ResourceId::new("a", "foo-1")).unwrap();
    assert_eq!(pod.service_account, "foo-sa");
    assert!(pod.ready);
}

#[test]
fn services_without_endpoints_have_no_backends() {
    let index = index();
    index.write().apply(service("a", "foo", &[(None, 80)]));

    let topology = topology::build(&index.read(), false);
    let svc = topology.service(&ResourceId::new("a", "foo")).unwrap();
    assert!(svc.subsets.is_empty());
    assert!(svc.pods.is_empty());
}

fn traffic_target(ns: &str, name: &str, dest_sa: &str, port: Option<u16>) -> TrafficTarget {
    let mut target = TrafficTarget::new(
        name,
        TrafficTargetSpec {
            destination: IdentityBindingSubject {
                kind: "ServiceAccount".to_string(),
                name: dest_sa.to_string(),
                namespace: Some(ns.to_string()),
                port,
            },
            sources: vec![IdentityBindingSubject {
                kind: "ServiceAccount".to_string(),
                name: "client".to_string(),
                namespace: Some(ns.to_string()),
                port: None,
            }],
            rules: vec![TrafficTargetRule {
                kind: "HTTPRouteGroup".to_string(),
                name: "api-routes".to_string(),
                matches: vec!["api".to_string()],
            }],
        },
    );
    target.metadata.namespace = Some(ns.to_string());
    target
}

fn route_group(ns: &str, name: &str) -> HTTPRouteGroup {
    let mut group = HTTPRouteGroup::new(
        name,
        HttpRouteGroupSpec {
            matches: vec![
                HttpMatch {
                    name: "api".to_string(),
                    methods: vec!["GET".to_string()],
                    path_regex: Some("/api/.*".to_string()),
                    ..Default::default()
                },
                HttpMatch {
                    name: "metrics".to_string(),
                    methods: vec!["GET".to_string()],
                    path_regex: Some("/metrics".to_string()),
                    ..Default::default()
                },
            ],
        },
    );
    group.metadata.namespace = Some(ns.to_string());
    group
}

#[test]
fn traffic_targets_attach_to_destination_services() {
    let index = index();
    {
        let mut idx = index.write();
        idx.apply(service("a", "foo", &[(None, 80)]));
        idx.apply(endpoints("a", "foo", &[("foo-1", "10.4.0.7")], 8080));
        idx.apply(pod("a", "foo-1", "foo-sa", "10.4.0.7"));
        idx.apply(pod("a", "client-1", "client", "10.4.0.9"));
        idx.apply(route_group("a", "api-routes"));
        idx.apply(traffic_target("a", "foo-tt", "foo-sa", None));
    }

    let topology = topology::build(&index.read(), true);
    let svc = topology.service(&ResourceId::new("a", "foo")).unwrap();
    assert_eq!(svc.traffic_targets.len(), 1);

    let tt = &svc.traffic_targets[0];
    assert_eq!(tt.sources, vec![ResourceId::new("a", "client-1")]);
    assert_eq!(tt.destination.pods, vec![ResourceId::new("a", "foo-1")]);
    // The referenced match is narrowed out of the group.
    match &tt.rules[0] {
        TrafficSpec::Http(group) => {
            assert_eq!(group.matches.len(), 1);
            assert_eq!(group.matches[0].name, "api");
        }
        other => panic!("expected http rule, got {other:?}"),
    }
}

#[test]
fn traffic_targets_respect_destination_ports() {
    let index = index();
    {
        let mut idx = index.write();
        idx.apply(service("a", "foo", &[(None, 80)]));
        idx.apply(endpoints("a", "foo", &[("foo-1", "10.4.0.7")], 8080));
        idx.apply(pod("a", "foo-1", "foo-sa", "10.4.0.7"));
        idx.apply(route_group("a", "api-routes"));
        idx.apply(traffic_target("a", "foo-tt", "foo-sa", Some(9999)));
    }

    let topology = topology::build(&index.read(), true);
    let svc = topology.service(&ResourceId::new("a", "foo")).unwrap();
    assert!(
        svc.traffic_targets.is_empty(),
        "destination port 9999 is not exposed by the endpoints"
    );
}

#[test]
fn traffic_targets_are_ignored_without_acl() {
    let index = index();
    {
        let mut idx = index.write();
        idx.apply(service("a", "foo", &[(None, 80)]));
        idx.apply(endpoints("a", "foo", &[("foo-1", "10.4.0.7")], 8080));
        idx.apply(pod("a", "foo-1", "foo-sa", "10.4.0.7"));
        idx.apply(route_group("a", "api-routes"));
        idx.apply(traffic_target("a", "foo-tt", "foo-sa", None));
    }

    let topology = topology::build(&index.read(), false);
    let svc = topology.service(&ResourceId::new("a", "foo")).unwrap();
    assert!(svc.traffic_targets.is_empty());
}

#[test]
fn missing_route_groups_drop_the_rule_only() {
    let index = index();
    {
        let mut idx = index.write();
        idx.apply(service("a", "foo", &[(None, 80)]));
        idx.apply(endpoints("a", "foo", &[("foo-1", "10.4.0.7")], 8080));
        idx.apply(pod("a", "foo-1", "foo-sa", "10.4.0.7"));
        // No HTTPRouteGroup applied.
        idx.apply(traffic_target("a", "foo-tt", "foo-sa", None));
    }

    let topology = topology::build(&index.read(), true);
    let svc = topology.service(&ResourceId::new("a", "foo")).unwrap();
    assert_eq!(svc.traffic_targets.len(), 1);
    assert!(svc.traffic_targets[0].rules.is_empty());
}

fn split(ns: &str, name: &str, root: &str, backends: &[(&str, i32)]) -> TrafficSplit {
    let mut split = TrafficSplit::new(
        name,
        TrafficSplitSpec {
            service: root.to_string(),
            backends: backends
                .iter()
                .map(|(service, weight)| TrafficSplitBackend {
                    service: service.to_string(),
                    weight: *weight,
                })
                .collect(),
        },
    );
    split.metadata.namespace = Some(ns.to_string());
    split
}

#[test]
fn splits_attach_to_root_and_drop_dangling_backends() {
    let index = index();
    {
        let mut idx = index.write();
        idx.apply(service("a", "foo", &[(None, 80)]));
        idx.apply(service("a", "foo-v1", &[(None, 80)]));
        idx.apply(split("a", "foo-split", "foo", &[("foo-v1", 80), ("foo-v2", 20)]));
        idx.apply(split("a", "orphan", "gone", &[("foo-v1", 100)]));
    }

    let topology = topology::build(&index.read(), false);
    let svc = topology.service(&ResourceId::new("a", "foo")).unwrap();
    assert_eq!(svc.traffic_splits.len(), 1);

    let ts = &svc.traffic_splits[0];
    assert_eq!(ts.id, ResourceId::new("a", "foo-split"));
    assert_eq!(ts.backends.len(), 1, "dangling foo-v2 dropped");
    assert_eq!(ts.backends[0].service, ResourceId::new("a", "foo-v1"));
    assert_eq!(ts.backends[0].weight, 80);
}

#[test]
fn identical_indexes_build_identical_topologies() {
    let build_one = || {
        let index = index();
        {
            let mut idx = index.write();
            idx.apply(service("a", "foo", &[(None, 80)]));
            idx.apply(service("b", "bar", &[(Some("web"), 8080)]));
            idx.apply(endpoints("a", "foo", &[("foo-1", "10.4.0.7")], 8080));
            idx.apply(pod("a", "foo-1", "foo-sa", "10.4.0.7"));
        }
        let snapshot = topology::build(&index.read(), false);
        snapshot
    };
    assert_eq!(build_one(), build_one());
}
