use super::*;
use std::collections::BTreeMap;
use trellis_controller_core::topology::{
    Address, Backend, Destination, HttpMatch, HttpRouteGroup, Pod, Port, Service,
    ServiceTrafficTarget, Subset, Topology, TrafficSpec, TrafficSplit,
};
use trellis_controller_core::ResourceId;

fn provider(acl: bool) -> (Provider, Arc<PortTable>, Arc<PortTable>) {
    let tcp = Arc::new(PortTable::new(10000, 10024));
    let udp = Arc::new(PortTable::new(15000, 15024));
    let provider = Provider::new(
        TrafficType::Http,
        acl,
        HttpPortPool::new(5000, 5009),
        tcp.clone(),
        udp.clone(),
    );
    (provider, tcp, udp)
}

fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn service(ns: &str, name: &str, port: u16, endpoints: &[(&str, u16)]) -> Service {
    Service {
        id: ResourceId::new(ns, name),
        cluster_ip: Some("10.96.0.10".to_string()),
        ports: vec![Port { name: None, port }],
        subsets: vec![Subset {
            ports: endpoints
                .first()
                .map(|(_, target)| Port {
                    name: None,
                    port: *target,
                })
                .into_iter()
                .collect(),
            addresses: endpoints
                .iter()
                .map(|(ip, _)| Address {
                    ip: ip.to_string(),
                    pod: None,
                })
                .collect(),
        }],
        ..Default::default()
    }
}

fn topology(services: Vec<Service>) -> Topology {
    let mut topology = Topology::default();
    for svc in services {
        topology.services.insert(svc.id.clone(), svc);
    }
    topology
}

#[test]
fn http_services_render_router_service_pairs() {
    let (provider, _, _) = provider(false);
    let topology = topology(vec![service(
        "a",
        "foo",
        80,
        &[("10.4.0.8", 80), ("10.4.0.7", 80)],
    )]);

    let config = provider.build_config(&topology);
    assert_eq!(config.http.routers.len(), 1);
    assert_eq!(config.http.services.len(), 1);
    assert!(config.http.middlewares.is_empty());

    let (key, router) = config.http.routers.iter().next().unwrap();
    assert!(key.starts_with("a-foo-80-"));
    assert_eq!(router.entry_points, vec!["http-5000".to_string()]);
    assert_eq!(
        router.rule,
        "Host(`foo.a.mesh`) || Host(`10.96.0.10`)"
    );
    assert_eq!(&router.service, key);

    let backend = &config.http.services[key];
    let servers = &backend.load_balancer.as_ref().unwrap().servers;
    // Sorted by URL regardless of endpoint order.
    assert_eq!(servers[0].url, "http://10.4.0.7:80");
    assert_eq!(servers[1].url, "http://10.4.0.8:80");
}

#[test]
fn second_port_lands_on_the_next_entry_point() {
    let (provider, _, _) = provider(false);
    let mut svc = service("b", "bar", 80, &[("10.4.1.1", 80)]);
    svc.ports.push(Port {
        name: None,
        port: 81,
    });
    let config = provider.build_config(&topology(vec![svc]));

    let entry_points: Vec<_> = config
        .http
        .routers
        .values()
        .flat_map(|router| router.entry_points.clone())
        .collect();
    assert!(entry_points.contains(&"http-5000".to_string()));
    assert!(entry_points.contains(&"http-5001".to_string()));
}

#[test]
fn annotation_middlewares_attach_to_the_router() {
    let (provider, _, _) = provider(false);
    let mut svc = service("a", "foo", 80, &[("10.4.0.7", 80)]);
    svc.annotations = annotations(&[
        ("mesh.trellis.io/retry-attempts", "3"),
        ("mesh.trellis.io/scheme", "h2c"),
    ]);
    let config = provider.build_config(&topology(vec![svc]));

    let router = config.http.routers.values().next().unwrap();
    assert_eq!(router.middlewares.len(), 1);
    let middleware = &config.http.middlewares[&router.middlewares[0]];
    assert_eq!(middleware.retry.as_ref().unwrap().attempts, 3);

    let backend = &config.http.services[&router.service];
    assert_eq!(
        backend.load_balancer.as_ref().unwrap().servers[0].url,
        "h2c://10.4.0.7:80"
    );
}

#[test]
fn tcp_services_use_the_port_table() {
    let (provider, tcp, _) = provider(false);
    tcp.set(&ServicePortRef::new("a", "foo", 80), 10000).unwrap();

    let mut svc = service("a", "foo", 80, &[("10.4.0.7", 8080)]);
    svc.annotations = annotations(&[("mesh.trellis.io/traffic-type", "tcp")]);
    let config = provider.build_config(&topology(vec![svc]));

    assert!(config.http.routers.is_empty());
    let (key, router) = config.tcp.routers.iter().next().unwrap();
    assert_eq!(router.entry_points, vec!["tcp-10000".to_string()]);
    assert_eq!(router.rule, "HostSNI(`*`)");
    let backend = &config.tcp.services[key];
    assert_eq!(
        backend.load_balancer.as_ref().unwrap().servers[0].address,
        "10.4.0.7:8080"
    );
}

#[test]
fn tcp_ports_without_mappings_are_skipped() {
    let (provider, _, _) = provider(false);
    let mut svc = service("a", "foo", 80, &[("10.4.0.7", 8080)]);
    svc.annotations = annotations(&[("mesh.trellis.io/traffic-type", "tcp")]);
    let config = provider.build_config(&topology(vec![svc]));
    assert!(config.tcp.routers.is_empty());
    assert!(config.tcp.services.is_empty());
}

#[test]
fn udp_services_render_without_rules() {
    let (provider, _, udp) = provider(false);
    udp.set(&ServicePortRef::new("a", "dns", 53), 15000).unwrap();

    let mut svc = service("a", "dns", 53, &[("10.4.0.7", 5353)]);
    svc.annotations = annotations(&[("mesh.trellis.io/traffic-type", "udp")]);
    let config = provider.build_config(&topology(vec![svc]));

    let (key, router) = config.udp.routers.iter().next().unwrap();
    assert_eq!(router.entry_points, vec!["udp-15000".to_string()]);
    let backend = &config.udp.services[key];
    assert_eq!(
        backend.load_balancer.as_ref().unwrap().servers[0].address,
        "10.4.0.7:5353"
    );
}

#[test]
fn invalid_traffic_type_skips_the_service() {
    let (provider, _, _) = provider(false);
    let mut svc = service("a", "foo", 80, &[("10.4.0.7", 80)]);
    svc.annotations = annotations(&[("mesh.trellis.io/traffic-type", "grpc")]);
    let config = provider.build_config(&topology(vec![svc]));
    assert_eq!(config, DynamicConfiguration::default());
}

#[test]
fn empty_endpoints_render_empty_backends() {
    let (provider, _, _) = provider(false);
    let mut svc = service("a", "foo", 80, &[("10.4.0.7", 80)]);
    svc.subsets.clear();
    let config = provider.build_config(&topology(vec![svc]));

    let router = config.http.routers.values().next().unwrap();
    let backend = &config.http.services[&router.service];
    assert!(backend.load_balancer.as_ref().unwrap().servers.is_empty());
}

fn acl_service() -> Service {
    let mut svc = service("a", "foo", 80, &[("10.4.0.7", 80)]);
    svc.pods = vec![ResourceId::new("a", "foo-1")];
    svc.traffic_targets = vec![ServiceTrafficTarget {
        id: ResourceId::new("a", "foo-tt"),
        sources: vec![ResourceId::new("a", "client-1")],
        destination: Destination {
            service_account: "foo-sa".to_string(),
            namespace: "a".to_string(),
            port: None,
            pods: vec![ResourceId::new("a", "foo-1")],
        },
        rules: vec![TrafficSpec::Http(HttpRouteGroup {
            id: ResourceId::new("a", "api-routes"),
            matches: vec![HttpMatch {
                name: "api".to_string(),
                methods: vec!["GET".to_string()],
                path_regex: Some("/api/.*".to_string()),
            }],
        })],
    }];
    svc
}

fn acl_topology() -> Topology {
    let mut topology = topology(vec![acl_service()]);
    topology.pods.insert(
        ResourceId::new("a", "client-1"),
        Pod {
            id: ResourceId::new("a", "client-1"),
            service_account: "client".to_string(),
            ip: Some("10.4.0.9".to_string()),
            ready: true,
        },
    );
    topology
}

#[test]
fn acl_routers_narrow_the_rule_and_whitelist_sources() {
    let (provider, _, _) = provider(true);
    let config = provider.build_config(&acl_topology());

    assert_eq!(config.http.routers.len(), 1);
    let (key, router) = config.http.routers.iter().next().unwrap();
    assert!(key.starts_with("a-foo-80-foo-tt-a-"));
    assert_eq!(
        router.rule,
        "PathPrefix(`/{path:api/.*}`) && Method(`GET`) && (Host(`foo.a.mesh`) || Host(`10.96.0.10`))"
    );

    assert_eq!(router.middlewares.len(), 1);
    let whitelist = &config.http.middlewares[&router.middlewares[0]];
    assert_eq!(
        whitelist.ip_white_list.as_ref().unwrap().source_range,
        vec!["10.4.0.9".to_string()]
    );

    assert!(
        config.http.services.contains_key(&router.service),
        "router must reference an existing service"
    );
}

#[test]
fn acl_disabled_ignores_traffic_targets() {
    let (provider, _, _) = provider(false);
    let config = provider.build_config(&acl_topology());
    let (key, _) = config.http.routers.iter().next().unwrap();
    assert!(
        !key.contains("foo-tt"),
        "plain router key expected, got {key}"
    );
}

#[test]
fn traffic_splits_render_weighted_services() {
    let (provider, _, _) = provider(false);
    let mut root = service("a", "foo", 80, &[("10.4.0.7", 80)]);
    root.traffic_splits = vec![TrafficSplit {
        id: ResourceId::new("a", "foo-split"),
        backends: vec![
            Backend {
                service: ResourceId::new("a", "foo-v1"),
                weight: 80,
            },
            Backend {
                service: ResourceId::new("a", "foo-v2"),
                weight: 20,
            },
        ],
    }];
    let v1 = service("a", "foo-v1", 80, &[("10.4.1.1", 80)]);
    let v2 = service("a", "foo-v2", 80, &[("10.4.1.2", 80)]);
    let config = provider.build_config(&topology(vec![root, v1, v2]));

    let root_router = config
        .http
        .routers
        .iter()
        .find(|(key, _)| key.starts_with("a-foo-80-"))
        .map(|(_, router)| router)
        .unwrap();
    let weighted = config.http.services[&root_router.service]
        .weighted
        .as_ref()
        .expect("root service must be weighted");
    assert_eq!(weighted.services.len(), 2);
    assert_eq!(weighted.services[0].weight, 80);
    assert_eq!(weighted.services[1].weight, 20);

    for child in &weighted.services {
        let child_service = &config.http.services[&child.name];
        assert!(child_service.load_balancer.is_some());
    }
    let first_child = &config.http.services[&weighted.services[0].name];
    assert_eq!(
        first_child.load_balancer.as_ref().unwrap().servers[0].url,
        "http://10.4.1.1:80"
    );
}

#[test]
fn references_always_resolve() {
    let (provider, tcp, _) = provider(true);
    tcp.set(&ServicePortRef::new("b", "raw", 9000), 10005)
        .unwrap();

    let mut raw = service("b", "raw", 9000, &[("10.4.2.1", 9000)]);
    raw.annotations = annotations(&[("mesh.trellis.io/traffic-type", "tcp")]);
    let mut topo = acl_topology();
    topo.services.insert(raw.id.clone(), raw);
    let config = provider.build_config(&topo);

    for router in config.http.routers.values() {
        assert!(config.http.services.contains_key(&router.service));
        for middleware in &router.middlewares {
            assert!(config.http.middlewares.contains_key(middleware));
        }
    }
    for router in config.tcp.routers.values() {
        assert!(config.tcp.services.contains_key(&router.service));
    }
}

#[test]
fn identical_topologies_serialize_identically() {
    let (provider, tcp, _) = provider(true);
    tcp.set(&ServicePortRef::new("b", "raw", 9000), 10005)
        .unwrap();

    let build = || {
        let mut raw = service("b", "raw", 9000, &[("10.4.2.1", 9000)]);
        raw.annotations = annotations(&[("mesh.trellis.io/traffic-type", "tcp")]);
        let mut topo = acl_topology();
        topo.services.insert(raw.id.clone(), raw);
        serde_json::to_vec(&provider.build_config(&topo)).unwrap()
    };
    assert_eq!(build(), build());
}
