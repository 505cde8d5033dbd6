use crate::{
    filter::ResourceFilter,
    queue::{Key, WorkQueue},
};
use ahash::{AHashMap, AHashSet};
use kubert::index::{IndexNamespacedResource, NamespacedRemoved};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;
use trellis_controller_core::ResourceId;
use trellis_controller_k8s_api::{
    access::TrafficTarget,
    specs::{HTTPRouteGroup, TCPRoute},
    split::TrafficSplit,
    Endpoints, Pod, ResourceExt, Service,
};

pub type SharedIndex = Arc<RwLock<Index>>;

/// The resource kinds the index is fed with.
///
/// Readiness requires one full list of every required kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Services,
    Endpoints,
    Pods,
    TrafficTargets,
    HttpRouteGroups,
    TcpRoutes,
    TrafficSplits,
}

/// The controller's in-memory mirror of the watched cluster state.
///
/// Fed by `kubert::index::namespaced` tasks, one per resource kind; read by
/// the worker when it resolves services and builds topology snapshots.
#[derive(Debug)]
pub struct Index {
    filter: ResourceFilter,
    queue: WorkQueue,

    required: Vec<Kind>,
    listed: AHashSet<Kind>,
    synced_tx: watch::Sender<bool>,

    pub(crate) services: AHashMap<ResourceId, Service>,
    pub(crate) endpoints: AHashMap<ResourceId, Endpoints>,
    pub(crate) pods: AHashMap<ResourceId, Pod>,
    pub(crate) traffic_targets: AHashMap<ResourceId, TrafficTarget>,
    pub(crate) http_route_groups: AHashMap<ResourceId, HTTPRouteGroup>,
    pub(crate) tcp_routes: AHashMap<ResourceId, TCPRoute>,
    pub(crate) traffic_splits: AHashMap<ResourceId, TrafficSplit>,
}

impl Index {
    pub fn shared(filter: ResourceFilter, queue: WorkQueue, required: Vec<Kind>) -> SharedIndex {
        let (synced_tx, _) = watch::channel(false);
        Arc::new(RwLock::new(Self {
            filter,
            queue,
            required,
            listed: AHashSet::new(),
            synced_tx,
            services: AHashMap::new(),
            endpoints: AHashMap::new(),
            pods: AHashMap::new(),
            traffic_targets: AHashMap::new(),
            http_route_groups: AHashMap::new(),
            tcp_routes: AHashMap::new(),
            traffic_splits: AHashMap::new(),
        }))
    }

    /// Receives `true` once every required kind has been listed at least once.
    pub fn synced_rx(&self) -> watch::Receiver<bool> {
        self.synced_tx.subscribe()
    }

    pub fn service(&self, id: &ResourceId) -> Option<&Service> {
        self.services.get(id)
    }

    pub fn filter(&self) -> &ResourceFilter {
        &self.filter
    }

    fn mark_listed(&mut self, kind: Kind) {
        self.listed.insert(kind);
        if self.required.iter().all(|kind| self.listed.contains(kind)) {
            let _ = self.synced_tx.send(true);
        }
    }
}

fn resource_id<T: ResourceExt>(resource: &T) -> ResourceId {
    ResourceId::new(
        resource.namespace().unwrap_or_default(),
        resource.name_unchecked(),
    )
}

/// A resync delivers the object unchanged; those events are discarded.
fn unchanged<T: ResourceExt>(old: Option<&T>, new: &T) -> bool {
    match (old.and_then(ResourceExt::resource_version), new.resource_version()) {
        (Some(old), Some(new)) => old == new,
        _ => false,
    }
}

// Everything that is not a Service only triggers a configuration rebuild, so
// the non-service kinds share one set of fold functions.

fn apply_secondary<T: ResourceExt>(
    filter: &ResourceFilter,
    queue: &WorkQueue,
    map: &mut AHashMap<ResourceId, T>,
    resource: T,
) {
    let id = resource_id(&resource);
    if filter.is_ignored(&id.namespace, resource.labels()) {
        if map.remove(&id).is_some() {
            queue.push(Key::Refresh);
        }
        return;
    }
    if unchanged(map.get(&id), &resource) {
        return;
    }
    map.insert(id, resource);
    queue.push(Key::Refresh);
}

fn delete_secondary<T>(
    queue: &WorkQueue,
    map: &mut AHashMap<ResourceId, T>,
    namespace: String,
    name: String,
) {
    if map.remove(&ResourceId::new(namespace, name)).is_some() {
        queue.push(Key::Refresh);
    }
}

fn reset_secondary<T: ResourceExt>(
    filter: &ResourceFilter,
    queue: &WorkQueue,
    map: &mut AHashMap<ResourceId, T>,
    resources: Vec<T>,
) {
    map.clear();
    for resource in resources {
        let id = resource_id(&resource);
        if filter.is_ignored(&id.namespace, resource.labels()) {
            continue;
        }
        map.insert(id, resource);
    }
    queue.push(Key::Refresh);
}

impl IndexNamespacedResource<Service> for Index {
    fn apply(&mut self, service: Service) {
        let id = resource_id(&service);
        if self.filter.is_ignored_service(&service) {
            // A service can become ignored by an edit; its shadow must go.
            if self.services.remove(&id).is_some() {
                self.queue.push(Key::Service(id));
            }
            return;
        }
        if unchanged(self.services.get(&id), &service) {
            return;
        }
        self.services.insert(id.clone(), service);
        self.queue.push(Key::Service(id));
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        self.services.remove(&id);
        if !self.filter.is_ignored(&id.namespace, &Default::default()) {
            // Sync even if the service was never cached: a stale shadow from
            // an earlier run may still exist.
            self.queue.push(Key::Service(id));
        }
    }

    fn reset(&mut self, services: Vec<Service>, removed: NamespacedRemoved) {
        // Every service that drops out of the relist still needs one sync so
        // its shadow is cleaned up.
        let mut vanished: AHashSet<ResourceId> = self.services.keys().cloned().collect();
        for (namespace, names) in removed {
            for name in names {
                vanished.insert(ResourceId::new(namespace.clone(), name));
            }
        }

        self.services.clear();
        for service in services {
            if self.filter.is_ignored_service(&service) {
                continue;
            }
            let id = resource_id(&service);
            vanished.remove(&id);
            self.services.insert(id.clone(), service);
            self.queue.push(Key::Service(id));
        }
        for id in vanished {
            self.queue.push(Key::Service(id));
        }
        self.mark_listed(Kind::Services);
    }
}

impl IndexNamespacedResource<Endpoints> for Index {
    fn apply(&mut self, endpoints: Endpoints) {
        apply_secondary(&self.filter, &self.queue, &mut self.endpoints, endpoints);
    }

    fn delete(&mut self, namespace: String, name: String) {
        delete_secondary(&self.queue, &mut self.endpoints, namespace, name);
    }

    fn reset(&mut self, endpoints: Vec<Endpoints>, _removed: NamespacedRemoved) {
        reset_secondary(&self.filter, &self.queue, &mut self.endpoints, endpoints);
        self.mark_listed(Kind::Endpoints);
    }
}

impl IndexNamespacedResource<Pod> for Index {
    fn apply(&mut self, pod: Pod) {
        apply_secondary(&self.filter, &self.queue, &mut self.pods, pod);
    }

    fn delete(&mut self, namespace: String, name: String) {
        delete_secondary(&self.queue, &mut self.pods, namespace, name);
    }

    fn reset(&mut self, pods: Vec<Pod>, _removed: NamespacedRemoved) {
        reset_secondary(&self.filter, &self.queue, &mut self.pods, pods);
        self.mark_listed(Kind::Pods);
    }
}

impl IndexNamespacedResource<TrafficTarget> for Index {
    fn apply(&mut self, target: TrafficTarget) {
        apply_secondary(&self.filter, &self.queue, &mut self.traffic_targets, target);
    }

    fn delete(&mut self, namespace: String, name: String) {
        delete_secondary(&self.queue, &mut self.traffic_targets, namespace, name);
    }

    fn reset(&mut self, targets: Vec<TrafficTarget>, _removed: NamespacedRemoved) {
        reset_secondary(&self.filter, &self.queue, &mut self.traffic_targets, targets);
        self.mark_listed(Kind::TrafficTargets);
    }
}

impl IndexNamespacedResource<HTTPRouteGroup> for Index {
    fn apply(&mut self, group: HTTPRouteGroup) {
        apply_secondary(&self.filter, &self.queue, &mut self.http_route_groups, group);
    }

    fn delete(&mut self, namespace: String, name: String) {
        delete_secondary(&self.queue, &mut self.http_route_groups, namespace, name);
    }

    fn reset(&mut self, groups: Vec<HTTPRouteGroup>, _removed: NamespacedRemoved) {
        reset_secondary(&self.filter, &self.queue, &mut self.http_route_groups, groups);
        self.mark_listed(Kind::HttpRouteGroups);
    }
}

impl IndexNamespacedResource<TCPRoute> for Index {
    fn apply(&mut self, route: TCPRoute) {
        apply_secondary(&self.filter, &self.queue, &mut self.tcp_routes, route);
    }

    fn delete(&mut self, namespace: String, name: String) {
        delete_secondary(&self.queue, &mut self.tcp_routes, namespace, name);
    }

    fn reset(&mut self, routes: Vec<TCPRoute>, _removed: NamespacedRemoved) {
        reset_secondary(&self.filter, &self.queue, &mut self.tcp_routes, routes);
        self.mark_listed(Kind::TcpRoutes);
    }
}

impl IndexNamespacedResource<TrafficSplit> for Index {
    fn apply(&mut self, split: TrafficSplit) {
        apply_secondary(&self.filter, &self.queue, &mut self.traffic_splits, split);
    }

    fn delete(&mut self, namespace: String, name: String) {
        delete_secondary(&self.queue, &mut self.traffic_splits, namespace, name);
    }

    fn reset(&mut self, splits: Vec<TrafficSplit>, _removed: NamespacedRemoved) {
        reset_secondary(&self.filter, &self.queue, &mut self.traffic_splits, splits);
        self.mark_listed(Kind::TrafficSplits);
    }
}
