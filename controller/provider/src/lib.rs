//! The configuration provider.
//!
//! Renders a topology snapshot and the current port maps into the dynamic
//! configuration served to mesh proxies. The walk is deterministic: services
//! iterate in `(namespace, name)` order, every emitted list is sorted, and
//! keys are content-addressed, so semantically identical topologies produce
//! byte-identical configurations.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod http;

use std::sync::Arc;
use trellis_controller_core::config::{
    DynamicConfiguration, TcpLoadBalancer, TcpRouter, TcpServer, TcpService, UdpLoadBalancer,
    UdpRouter, UdpService, UdpServer,
};
use trellis_controller_core::topology::{Service, Topology};
use trellis_controller_core::{key, ServicePortRef, TrafficType};
use trellis_controller_k8s_index::annotations;
use trellis_controller_ports::{HttpPortPool, PortMapper, PortTable};

pub struct Provider {
    default_traffic_type: TrafficType,
    acl: bool,
    http_ports: HttpPortPool,
    tcp_ports: Arc<PortTable>,
    udp_ports: Arc<PortTable>,
}

impl Provider {
    pub fn new(
        default_traffic_type: TrafficType,
        acl: bool,
        http_ports: HttpPortPool,
        tcp_ports: Arc<PortTable>,
        udp_ports: Arc<PortTable>,
    ) -> Self {
        Self {
            default_traffic_type,
            acl,
            http_ports,
            tcp_ports,
            udp_ports,
        }
    }

    /// Renders the full dynamic configuration for a topology snapshot.
    pub fn build_config(&self, topology: &Topology) -> DynamicConfiguration {
        let mut config = DynamicConfiguration::default();

        for service in topology.services.values() {
            let traffic_type = match annotations::traffic_type(&service.annotations) {
                Ok(ty) => ty,
                Err(e) if e.is_not_found() => self.default_traffic_type,
                Err(error) => {
                    // The sync path already surfaced this to the operator.
                    tracing::warn!(service = %service.id, %error, "Skipping service");
                    continue;
                }
            };

            match traffic_type {
                TrafficType::Http => {
                    http::build(&self.http_ports, self.acl, topology, service, &mut config)
                }
                TrafficType::Tcp => self.build_tcp(service, &mut config),
                TrafficType::Udp => self.build_udp(service, &mut config),
            }
        }

        config
    }

    fn build_tcp(&self, service: &Service, config: &mut DynamicConfiguration) {
        for port in &service.ports {
            let svc = ServicePortRef::new(
                service.id.namespace.clone(),
                service.id.name.clone(),
                port.port,
            );
            let mesh_port = match self.tcp_ports.find(&svc) {
                Some(mesh_port) => mesh_port,
                None => {
                    // The shadow sync has not assigned this port yet.
                    tracing::debug!(%svc, "No TCP mesh port assigned, skipping");
                    continue;
                }
            };

            let key = key::config_key(&[
                &service.id.namespace,
                &service.id.name,
                &port.port.to_string(),
            ]);
            config.tcp.routers.insert(
                key.clone(),
                TcpRouter {
                    entry_points: vec![format!("tcp-{mesh_port}")],
                    rule: "HostSNI(`*`)".to_string(),
                    service: key.clone(),
                },
            );
            config.tcp.services.insert(
                key,
                TcpService {
                    load_balancer: Some(TcpLoadBalancer {
                        servers: addresses(service, port),
                    }),
                },
            );
        }
    }

    fn build_udp(&self, service: &Service, config: &mut DynamicConfiguration) {
        for port in &service.ports {
            let svc = ServicePortRef::new(
                service.id.namespace.clone(),
                service.id.name.clone(),
                port.port,
            );
            let mesh_port = match self.udp_ports.find(&svc) {
                Some(mesh_port) => mesh_port,
                None => {
                    tracing::debug!(%svc, "No UDP mesh port assigned, skipping");
                    continue;
                }
            };

            let key = key::config_key(&[
                &service.id.namespace,
                &service.id.name,
                &port.port.to_string(),
            ]);
            config.udp.routers.insert(
                key.clone(),
                UdpRouter {
                    entry_points: vec![format!("udp-{mesh_port}")],
                    service: key.clone(),
                },
            );
            config.udp.services.insert(
                key,
                UdpService {
                    load_balancer: Some(UdpLoadBalancer {
                        servers: addresses(service, port)
                            .into_iter()
                            .map(|server| UdpServer {
                                address: server.address,
                            })
                            .collect(),
                    }),
                },
            );
        }
    }
}

fn addresses(
    service: &Service,
    port: &trellis_controller_core::topology::Port,
) -> Vec<TcpServer> {
    let mut servers: Vec<TcpServer> = service
        .endpoints_for_port(port)
        .into_iter()
        .map(|(ip, target)| TcpServer {
            address: format!("{ip}:{target}"),
        })
        .collect();
    servers.sort_by(|a, b| a.address.cmp(&b.address));
    servers
}

#[cfg(test)]
mod tests;
