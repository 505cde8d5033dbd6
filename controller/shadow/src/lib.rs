//! The shadow-service manager.
//!
//! For every user service there is exactly one shadow service in the mesh
//! namespace: same user-facing ports, target ports remapped onto the mesh
//! port ranges, selector pointing at the proxy pods. `sync_service` drives a
//! single user service to that state, creating, updating or deleting the
//! shadow and keeping the TCP/UDP port tables in step.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod labels;

pub use self::labels::{
    proxy_selector, shadow_annotations, shadow_label_selector, shadow_labels, APP_LABEL,
    APP_VALUE, COMPONENT_LABEL, PROXY_COMPONENT_LABEL, PROXY_COMPONENT_VALUE,
    SERVICE_NAMESPACE_LABEL, SERVICE_NAME_LABEL, SHADOW_COMPONENT_VALUE,
};

use std::sync::Arc;
use trellis_controller_core::{names, ResourceId, ServicePortRef, TrafficType};
use trellis_controller_k8s_api::{
    Api, Client, DeleteParams, IntOrString, ObjectMeta, PostParams, ResourceExt, Service,
    ServicePort, ServiceSpec,
};
use trellis_controller_k8s_index::annotations::{self, AnnotationError};
use trellis_controller_k8s_index::SharedIndex;
use trellis_controller_ports::{HttpPortPool, PortMapper, PortTable};

const UPDATE_ATTEMPTS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("invalid traffic type on {id}: {source}")]
    InvalidTrafficType {
        id: ResourceId,
        #[source]
        source: AnnotationError,
    },

    /// The deterministic name of a user service points at a shadow owned by
    /// another one: a naming collision. The upsert is rejected rather than
    /// silently overwriting the other service's shadow.
    #[error("shadow service {shadow} belongs to {owner}, not {expected}")]
    ShadowOwnershipMismatch {
        shadow: String,
        owner: String,
        expected: ResourceId,
    },

    #[error("conflict updating shadow service {shadow} persisted after {attempts} attempts")]
    ConflictExhausted { shadow: String, attempts: usize },

    #[error(transparent)]
    Api(#[from] kube::Error),
}

pub struct ShadowServiceManager {
    client: Client,
    index: SharedIndex,
    mesh_namespace: String,
    default_traffic_type: TrafficType,
    http_ports: HttpPortPool,
    tcp_ports: Arc<PortTable>,
    udp_ports: Arc<PortTable>,
}

impl ShadowServiceManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        index: SharedIndex,
        mesh_namespace: String,
        default_traffic_type: TrafficType,
        http_ports: HttpPortPool,
        tcp_ports: Arc<PortTable>,
        udp_ports: Arc<PortTable>,
    ) -> Self {
        Self {
            client,
            index,
            mesh_namespace,
            default_traffic_type,
            http_ports,
            tcp_ports,
            udp_ports,
        }
    }

    fn shadows(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.mesh_namespace)
    }

    /// Reconciles the shadow service of one user service.
    pub async fn sync_service(&self, id: &ResourceId) -> Result<(), SyncError> {
        let user = self.index.read().service(id).cloned();
        match user {
            Some(user) => self.upsert(id, &user).await,
            None => self.delete(id).await,
        }
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), SyncError> {
        let shadow_name = names::shadow_service(&self.mesh_namespace, id);
        let api = self.shadows();
        let shadow = match api.get_opt(&shadow_name).await? {
            Some(shadow) => shadow,
            None => {
                tracing::debug!(service = %id, "No shadow service to delete");
                return Ok(());
            }
        };

        // Release stateful mappings; HTTP ports are positional and carry no
        // state to release.
        for port in shadow.spec.iter().flat_map(|spec| spec.ports.iter().flatten()) {
            let svc = ServicePortRef::new(id.namespace.clone(), id.name.clone(), port.port as u16);
            if let Some(mesh_port) = self.tcp_ports.remove(&svc) {
                tracing::debug!(%svc, mesh_port, "Released TCP port mapping");
            } else if let Some(mesh_port) = self.udp_ports.remove(&svc) {
                tracing::debug!(%svc, mesh_port, "Released UDP port mapping");
            }
        }

        match api.delete(&shadow_name, &DeleteParams::default()).await {
            Ok(_) => {
                tracing::info!(service = %id, shadow = %shadow_name, "Deleted shadow service");
                Ok(())
            }
            Err(error) if is_not_found(&error) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn upsert(&self, id: &ResourceId, user: &Service) -> Result<(), SyncError> {
        let traffic_type = match annotations::traffic_type(user.annotations()) {
            Ok(ty) => ty,
            Err(e) if e.is_not_found() => self.default_traffic_type,
            Err(source) => {
                return Err(SyncError::InvalidTrafficType {
                    id: id.clone(),
                    source,
                })
            }
        };

        let user_ports: Vec<ServicePort> = user
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.clone())
            .unwrap_or_default();
        let desired = desired_shadow_ports(
            &self.http_ports,
            &self.tcp_ports,
            &self.udp_ports,
            id,
            traffic_type,
            &user_ports,
        );

        let shadow_name = names::shadow_service(&self.mesh_namespace, id);
        let api = self.shadows();
        match api.get_opt(&shadow_name).await? {
            None => {
                let shadow = Service {
                    metadata: ObjectMeta {
                        name: Some(shadow_name.clone()),
                        namespace: Some(self.mesh_namespace.clone()),
                        labels: Some(shadow_labels(id)),
                        annotations: Some(shadow_annotations(traffic_type)),
                        ..Default::default()
                    },
                    spec: Some(ServiceSpec {
                        selector: Some(proxy_selector()),
                        ports: Some(desired),
                        ..Default::default()
                    }),
                    status: None,
                };
                api.create(&PostParams::default(), &shadow).await?;
                tracing::info!(service = %id, shadow = %shadow_name, "Created shadow service");
                Ok(())
            }
            Some(existing) => {
                if let Some(owner) = foreign_owner(&existing, id) {
                    return Err(SyncError::ShadowOwnershipMismatch {
                        shadow: shadow_name,
                        owner,
                        expected: id.clone(),
                    });
                }
                self.update(id, traffic_type, existing, desired).await
            }
        }
    }

    async fn update(
        &self,
        id: &ResourceId,
        traffic_type: TrafficType,
        mut shadow: Service,
        desired: Vec<ServicePort>,
    ) -> Result<(), SyncError> {
        let shadow_name = shadow.name_unchecked();
        let existing = shadow
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.clone())
            .unwrap_or_default();
        for port in removed_ports(&existing, &desired) {
            let svc = ServicePortRef::new(id.namespace.clone(), id.name.clone(), port.port as u16);
            // Only stateful tables hold anything to release; a positional
            // HTTP target never appears in them.
            if let Some(mesh_port) = self.tcp_ports.remove(&svc) {
                tracing::debug!(%svc, mesh_port, "Released TCP port mapping");
            } else if let Some(mesh_port) = self.udp_ports.remove(&svc) {
                tracing::debug!(%svc, mesh_port, "Released UDP port mapping");
            }
        }

        let api = self.shadows();
        for attempt in 1..=UPDATE_ATTEMPTS {
            {
                let annotations = shadow.metadata.annotations.get_or_insert_with(Default::default);
                annotations::set_traffic_type(annotations, traffic_type);
            }
            shadow.spec.get_or_insert_with(Default::default).ports = Some(desired.clone());

            match api
                .replace(&shadow_name, &PostParams::default(), &shadow)
                .await
            {
                Ok(_) => {
                    tracing::info!(service = %id, shadow = %shadow_name, "Updated shadow service");
                    return Ok(());
                }
                Err(error) if is_conflict(&error) && attempt < UPDATE_ATTEMPTS => {
                    tracing::debug!(shadow = %shadow_name, attempt, "Conflict updating shadow, retrying");
                    shadow = match api.get_opt(&shadow_name).await? {
                        Some(shadow) => shadow,
                        // Deleted under us; the next sync recreates it.
                        None => return Ok(()),
                    };
                }
                Err(error) if is_conflict(&error) => {
                    return Err(SyncError::ConflictExhausted {
                        shadow: shadow_name,
                        attempts: UPDATE_ATTEMPTS,
                    });
                }
                Err(error) => return Err(error.into()),
            }
        }
        unreachable!("update loop either returns or retries")
    }
}

/// Computes the shadow port list for a user service.
///
/// Ports whose protocol is incompatible with the traffic type are dropped
/// with a warning; so are ports the allocator cannot place.
pub fn desired_shadow_ports(
    http_ports: &HttpPortPool,
    tcp_ports: &PortTable,
    udp_ports: &PortTable,
    id: &ResourceId,
    traffic_type: TrafficType,
    user_ports: &[ServicePort],
) -> Vec<ServicePort> {
    let mut desired = Vec::new();
    for (index, port) in user_ports.iter().enumerate() {
        if !compatible(traffic_type, port.protocol.as_deref()) {
            tracing::warn!(
                service = %id,
                port = port.port,
                protocol = port.protocol.as_deref().unwrap_or("TCP"),
                %traffic_type,
                "Dropping port incompatible with the service traffic type",
            );
            continue;
        }

        let svc = ServicePortRef::new(id.namespace.clone(), id.name.clone(), port.port as u16);
        // `add` returns the existing mapping when one is already in place.
        let target = match traffic_type {
            TrafficType::Http => http_ports.port_for_index(index),
            TrafficType::Tcp => tcp_ports.add(&svc),
            TrafficType::Udp => udp_ports.add(&svc),
        };
        let target = match target {
            Ok(target) => target,
            Err(error) => {
                tracing::error!(%svc, %error, "Skipping port without a mesh port");
                continue;
            }
        };

        desired.push(ServicePort {
            name: port.name.clone(),
            port: port.port,
            protocol: Some(shadow_protocol(traffic_type).to_string()),
            target_port: Some(IntOrString::Int(i32::from(target))),
            ..Default::default()
        });
    }
    desired
}

/// UDP traffic maps onto UDP ports only; HTTP and TCP traffic onto TCP ports
/// (including unspecified protocols, which Kubernetes defaults to TCP).
fn compatible(traffic_type: TrafficType, protocol: Option<&str>) -> bool {
    match traffic_type {
        TrafficType::Udp => protocol == Some("UDP"),
        TrafficType::Http | TrafficType::Tcp => matches!(protocol, None | Some("TCP")),
    }
}

fn shadow_protocol(traffic_type: TrafficType) -> &'static str {
    match traffic_type {
        TrafficType::Udp => "UDP",
        TrafficType::Http | TrafficType::Tcp => "TCP",
    }
}

/// Ports present on the shadow but absent from (or incompatible with) the
/// desired set.
pub fn removed_ports(existing: &[ServicePort], desired: &[ServicePort]) -> Vec<ServicePort> {
    existing
        .iter()
        .filter(|port| {
            !desired.iter().any(|d| {
                d.port == port.port
                    && d.protocol == port.protocol
                    && d.target_port == port.target_port
            })
        })
        .cloned()
        .collect()
}

/// Returns the owner recorded on a foreign shadow, `None` when `id` owns it.
fn foreign_owner(shadow: &Service, id: &ResourceId) -> Option<String> {
    let labels = shadow.labels();
    let name = labels.get(SERVICE_NAME_LABEL).map(String::as_str);
    let namespace = labels.get(SERVICE_NAMESPACE_LABEL).map(String::as_str);
    if name == Some(id.name.as_str()) && namespace == Some(id.namespace.as_str()) {
        return None;
    }
    Some(format!(
        "{}/{}",
        namespace.unwrap_or("<none>"),
        name.unwrap_or("<none>"),
    ))
}

fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409)
}

fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}
