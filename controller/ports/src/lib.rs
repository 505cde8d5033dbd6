//! Mesh port allocation.
//!
//! Every user service port is remapped onto a mesh-side port in one of three
//! reserved ranges. TCP and UDP mappings are stateful and survive restarts by
//! being reconstructed from the shadow services already present in the mesh
//! namespace; HTTP ports are positional (`min + port index`) and carry no
//! state at all.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use parking_lot::RwLock;
use std::collections::BTreeMap;
use trellis_controller_core::{names, ServicePortRef};
use trellis_controller_k8s_api::{IntOrString, ResourceExt, Service};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("no mesh port free in range [{min}, {max}]")]
    Exhausted { min: u16, max: u16 },

    #[error("mesh port {port} is outside the range [{min}, {max}]")]
    OutOfRange { port: u16, min: u16, max: u16 },
}

/// The mapping operations shared by stateful port tables.
pub trait PortMapper {
    /// Returns the mesh port already assigned to a service port, if any.
    fn find(&self, svc: &ServicePortRef) -> Option<u16>;

    /// Returns the existing assignment for a service port, or assigns the
    /// smallest free mesh port in the range.
    fn add(&self, svc: &ServicePortRef) -> Result<u16, PortError>;

    /// Records an explicit assignment, replacing any previous mapping of
    /// either the mesh port or the service port.
    fn set(&self, svc: &ServicePortRef, port: u16) -> Result<(), PortError>;

    /// Releases the mesh port assigned to a service port and returns it.
    fn remove(&self, svc: &ServicePortRef) -> Option<u16>;
}

/// A bounded table of mesh port assignments for one protocol.
#[derive(Debug)]
pub struct PortTable {
    min: u16,
    max: u16,
    table: RwLock<BTreeMap<u16, ServicePortRef>>,
}

impl PortTable {
    pub fn new(min: u16, max: u16) -> Self {
        debug_assert!(min <= max);
        Self {
            min,
            max,
            table: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// Reconstructs assignments from the shadow services of the mesh
    /// namespace.
    ///
    /// Shadow names that do not follow the naming scheme and target ports
    /// outside this table's range are skipped with a warning.
    pub fn load_state(&self, mesh_namespace: &str, shadows: &[Service]) {
        for shadow in shadows {
            let shadow_name = shadow.name_unchecked();
            let user = match names::parse_shadow_service(mesh_namespace, &shadow_name) {
                Some(user) => user,
                None => {
                    tracing::warn!(%shadow_name, "Skipping shadow service with unparseable name");
                    continue;
                }
            };

            let ports = shadow
                .spec
                .as_ref()
                .and_then(|spec| spec.ports.as_ref())
                .into_iter()
                .flatten();
            for port in ports {
                let target = match port.target_port {
                    Some(IntOrString::Int(target)) => target,
                    _ => continue,
                };
                let target = match u16::try_from(target) {
                    Ok(target) if self.contains(target) => target,
                    _ => {
                        tracing::warn!(
                            %shadow_name,
                            target_port = target,
                            "Skipping shadow port with target outside [{}, {}]",
                            self.min,
                            self.max,
                        );
                        continue;
                    }
                };

                let svc = ServicePortRef::new(
                    user.namespace.clone(),
                    user.name.clone(),
                    port.port as u16,
                );
                if let Err(error) = self.set(&svc, target) {
                    tracing::warn!(%svc, %error, "Failed to restore port mapping");
                }
            }
        }
    }
}

impl PortMapper for PortTable {
    fn find(&self, svc: &ServicePortRef) -> Option<u16> {
        self.table
            .read()
            .iter()
            .find(|(_, mapped)| *mapped == svc)
            .map(|(port, _)| *port)
    }

    fn add(&self, svc: &ServicePortRef) -> Result<u16, PortError> {
        if let Some(port) = self.find(svc) {
            return Ok(port);
        }

        let mut table = self.table.write();
        for port in self.min..=self.max {
            if let std::collections::btree_map::Entry::Vacant(entry) = table.entry(port) {
                entry.insert(svc.clone());
                return Ok(port);
            }
        }
        Err(PortError::Exhausted {
            min: self.min,
            max: self.max,
        })
    }

    fn set(&self, svc: &ServicePortRef, port: u16) -> Result<(), PortError> {
        if !self.contains(port) {
            return Err(PortError::OutOfRange {
                port,
                min: self.min,
                max: self.max,
            });
        }
        let mut table = self.table.write();
        table.retain(|_, mapped| mapped != svc);
        table.insert(port, svc.clone());
        Ok(())
    }

    fn remove(&self, svc: &ServicePortRef) -> Option<u16> {
        let mut table = self.table.write();
        let port = table
            .iter()
            .find(|(_, mapped)| *mapped == svc)
            .map(|(port, _)| *port)?;
        table.remove(&port);
        Some(port)
    }
}

/// The positional HTTP port pool.
///
/// HTTP routing discriminates by Host rule, so every service reuses the same
/// mesh ports: the i-th HTTP port of a service is always `min + i`.
#[derive(Copy, Clone, Debug)]
pub struct HttpPortPool {
    min: u16,
    max: u16,
}

impl HttpPortPool {
    pub fn new(min: u16, max: u16) -> Self {
        debug_assert!(min <= max);
        Self { min, max }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }

    /// Returns the mesh port for the i-th HTTP port of a service.
    pub fn port_for_index(&self, index: usize) -> Result<u16, PortError> {
        u16::try_from(index)
            .ok()
            .and_then(|index| self.min.checked_add(index))
            .filter(|port| *port <= self.max)
            .ok_or(PortError::Exhausted {
                min: self.min,
                max: self.max,
            })
    }
}
