//! HTTP rendering: routers, load-balanced and weighted services, and the
//! middleware bundles attached to them.

use trellis_controller_core::config::{
    DynamicConfiguration, HttpLoadBalancer, HttpMiddleware, HttpRouter, HttpServer, HttpService,
    IpWhiteList, WeightedRoundRobin, WeightedServiceRef,
};
use trellis_controller_core::topology::{
    Port, Service, ServiceTrafficTarget, Topology, TrafficSpec,
};
use trellis_controller_core::{key, Scheme};
use trellis_controller_k8s_index::annotations;
use trellis_controller_ports::HttpPortPool;

pub(crate) fn build(
    http_ports: &HttpPortPool,
    acl: bool,
    topology: &Topology,
    service: &Service,
    config: &mut DynamicConfiguration,
) {
    let scheme = match annotations::scheme(&service.annotations) {
        Ok(scheme) => scheme,
        Err(e) if e.is_not_found() => Scheme::default(),
        Err(error) => {
            tracing::warn!(service = %service.id, %error, "Falling back to the http scheme");
            Scheme::default()
        }
    };
    let bundle = match annotations::middlewares(&service.annotations) {
        Ok(bundle) => bundle,
        Err(error) => {
            tracing::warn!(service = %service.id, %error, "Ignoring malformed middleware annotations");
            HttpMiddleware::default()
        }
    };

    for (index, port) in service.ports.iter().enumerate() {
        let mesh_port = match http_ports.port_for_index(index) {
            Ok(mesh_port) => mesh_port,
            Err(error) => {
                tracing::warn!(service = %service.id, port = port.port, %error, "Skipping HTTP port");
                continue;
            }
        };
        let entry_point = format!("http-{mesh_port}");
        let port_str = port.port.to_string();

        let (backend, children) = backend_service(topology, service, port, scheme);
        for (child_key, child) in children {
            config.http.services.insert(child_key, child);
        }

        let bundle_key = (!bundle.is_empty()).then(|| {
            key::config_key(&[
                &service.id.namespace,
                &service.id.name,
                &port_str,
                "middleware",
            ])
        });
        if let Some(bundle_key) = &bundle_key {
            config
                .http
                .middlewares
                .insert(bundle_key.clone(), bundle.clone());
        }

        if acl && !service.traffic_targets.is_empty() {
            for target in &service.traffic_targets {
                if !target_applies(service, port, target) {
                    continue;
                }
                build_acl_router(
                    topology,
                    service,
                    target,
                    &port_str,
                    &entry_point,
                    bundle_key.as_deref(),
                    &backend,
                    config,
                );
            }
        } else {
            let base_key = key::config_key(&[
                &service.id.namespace,
                &service.id.name,
                &port_str,
            ]);
            config.http.routers.insert(
                base_key.clone(),
                HttpRouter {
                    entry_points: vec![entry_point],
                    middlewares: bundle_key.into_iter().collect(),
                    rule: host_rule(service),
                    service: base_key.clone(),
                },
            );
            config.http.services.insert(base_key, backend.clone());
        }
    }
}

/// An explicit destination port on a TrafficTarget restricts it to service
/// ports whose endpoints expose that pod port.
fn target_applies(service: &Service, port: &Port, target: &ServiceTrafficTarget) -> bool {
    match target.destination.port {
        None => true,
        Some(dest_port) => service
            .endpoints_for_port(port)
            .iter()
            .any(|(_, target_port)| *target_port == dest_port),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_acl_router(
    topology: &Topology,
    service: &Service,
    target: &ServiceTrafficTarget,
    port_str: &str,
    entry_point: &str,
    bundle_key: Option<&str>,
    backend: &HttpService,
    config: &mut DynamicConfiguration,
) {
    let target_key = key::config_key(&[
        &service.id.namespace,
        &service.id.name,
        port_str,
        &target.id.name,
        &target.id.namespace,
    ]);

    let mut middlewares: Vec<String> = bundle_key.map(str::to_string).into_iter().collect();

    let mut source_ips: Vec<String> = target
        .sources
        .iter()
        .filter_map(|pod| topology.pod(pod).and_then(|pod| pod.ip.clone()))
        .collect();
    source_ips.sort();
    source_ips.dedup();
    if source_ips.is_empty() {
        tracing::warn!(
            service = %service.id,
            traffic_target = %target.id,
            "No source pod IPs resolved, omitting whitelist middleware",
        );
    } else {
        let whitelist_key = key::config_key(&[
            &service.id.namespace,
            &service.id.name,
            port_str,
            &target.id.name,
            &target.id.namespace,
            "whitelist",
        ]);
        config.http.middlewares.insert(
            whitelist_key.clone(),
            HttpMiddleware {
                ip_white_list: Some(IpWhiteList {
                    source_range: source_ips,
                }),
                ..Default::default()
            },
        );
        middlewares.push(whitelist_key);
    }

    config.http.routers.insert(
        target_key.clone(),
        HttpRouter {
            entry_points: vec![entry_point.to_string()],
            middlewares,
            rule: acl_rule(&target.rules, &host_rule(service)),
            service: target_key.clone(),
        },
    );
    config.http.services.insert(target_key, backend.clone());
}

/// The backend for one service port: a plain load balancer, or (when a
/// TrafficSplit is rooted at the service) a weighted round robin over
/// per-backend child services.
fn backend_service(
    topology: &Topology,
    service: &Service,
    port: &Port,
    scheme: Scheme,
) -> (HttpService, Vec<(String, HttpService)>) {
    let split = match service.traffic_splits.first() {
        None => {
            return (
                HttpService {
                    load_balancer: Some(load_balancer(service, port, scheme)),
                    weighted: None,
                },
                Vec::new(),
            )
        }
        Some(split) => split,
    };
    if service.traffic_splits.len() > 1 {
        tracing::warn!(
            service = %service.id,
            split = %split.id,
            "Multiple TrafficSplits rooted at one service, using the first",
        );
    }

    let port_str = port.port.to_string();
    let mut children = Vec::new();
    let mut weighted = Vec::new();
    for backend in &split.backends {
        let backend_service = match topology.service(&backend.service) {
            Some(backend_service) => backend_service,
            None => continue,
        };
        let backend_port = match backend_service
            .ports
            .iter()
            .find(|p| p.port == port.port)
        {
            Some(backend_port) => backend_port,
            None => {
                tracing::warn!(
                    split = %split.id,
                    backend = %backend.service,
                    port = port.port,
                    "Split backend does not expose the root port",
                );
                continue;
            }
        };

        let child_key = key::config_key(&[
            &backend.service.namespace,
            &backend.service.name,
            &port_str,
            &split.id.name,
            &split.id.namespace,
        ]);
        children.push((
            child_key.clone(),
            HttpService {
                load_balancer: Some(load_balancer(backend_service, backend_port, scheme)),
                weighted: None,
            },
        ));
        weighted.push(WeightedServiceRef {
            name: child_key,
            weight: backend.weight,
        });
    }

    (
        HttpService {
            load_balancer: None,
            weighted: Some(WeightedRoundRobin { services: weighted }),
        },
        children,
    )
}

fn load_balancer(service: &Service, port: &Port, scheme: Scheme) -> HttpLoadBalancer {
    let mut servers: Vec<HttpServer> = service
        .endpoints_for_port(port)
        .into_iter()
        .map(|(ip, target)| HttpServer {
            url: format!("{scheme}://{ip}:{target}"),
        })
        .collect();
    servers.sort_by(|a, b| a.url.cmp(&b.url));
    HttpLoadBalancer {
        servers,
        pass_host_header: true,
    }
}

fn host_rule(service: &Service) -> String {
    let host = format!(
        "Host(`{}.{}.mesh`)",
        service.id.name, service.id.namespace
    );
    match &service.cluster_ip {
        Some(ip) => format!("{host} || Host(`{ip}`)"),
        None => host,
    }
}

/// Combines route-group matchers with the host rule: disjunction within a
/// group, conjunction across groups, and the host rule appended last.
fn acl_rule(rules: &[TrafficSpec], host: &str) -> String {
    let mut groups = Vec::new();
    for spec in rules {
        let group = match spec {
            TrafficSpec::Http(group) => group,
            // TCP routes do not narrow HTTP routers.
            TrafficSpec::Tcp(_) => continue,
        };

        // (fragment, needs parens when combined)
        let mut fragments: Vec<(String, bool)> = Vec::new();
        for m in &group.matches {
            let mut parts = Vec::new();
            if let Some(regex) = &m.path_regex {
                let regex = regex.trim_start_matches('/');
                parts.push(format!("PathPrefix(`/{{path:{regex}}}`)"));
            }
            if !m.methods.is_empty() && !m.methods.iter().any(|method| method == "*") {
                let methods = m
                    .methods
                    .iter()
                    .map(|method| format!("`{method}`"))
                    .collect::<Vec<_>>()
                    .join(",");
                parts.push(format!("Method({methods})"));
            }
            if parts.is_empty() {
                continue;
            }
            fragments.push((parts.join(" && "), parts.len() > 1));
        }

        match fragments.len() {
            0 => {}
            1 => groups.push(fragments.remove(0).0),
            _ => {
                let joined = fragments
                    .into_iter()
                    .map(|(fragment, compound)| {
                        if compound {
                            format!("({fragment})")
                        } else {
                            fragment
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(" || ");
                groups.push(format!("({joined})"));
            }
        }
    }

    if groups.is_empty() {
        return host.to_string();
    }
    format!("{} && ({host})", groups.join(" && "))
}
