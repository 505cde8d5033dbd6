//! The resource filter.
//!
//! A single predicate decides which cluster objects participate in
//! reconciliation. Rules are evaluated in order: the watched-namespace
//! allowlist, the ignored-namespace list, the ignored-app list, explicitly
//! ignored services, and ExternalName services.

use std::collections::BTreeMap;
use trellis_controller_core::ResourceId;
use trellis_controller_k8s_api::{ResourceExt, Service};

#[derive(Clone, Debug, Default)]
pub struct ResourceFilter {
    watched_namespaces: Vec<String>,
    ignored_namespaces: Vec<String>,
    ignored_apps: Vec<String>,
    ignored_services: Vec<ResourceId>,
}

impl ResourceFilter {
    pub fn new(watched_namespaces: Vec<String>, ignored_namespaces: Vec<String>) -> Self {
        Self {
            watched_namespaces,
            ignored_namespaces,
            ..Default::default()
        }
    }

    pub fn with_ignored_apps(mut self, apps: impl IntoIterator<Item = String>) -> Self {
        self.ignored_apps.extend(apps);
        self
    }

    pub fn with_ignored_namespaces(mut self, namespaces: impl IntoIterator<Item = String>) -> Self {
        self.ignored_namespaces.extend(namespaces);
        self
    }

    pub fn with_ignored_services(mut self, services: impl IntoIterator<Item = ResourceId>) -> Self {
        self.ignored_services.extend(services);
        self
    }

    /// Applies the namespace and app-label rules shared by every object kind.
    pub fn is_ignored(&self, namespace: &str, labels: &BTreeMap<String, String>) -> bool {
        if !self.watched_namespaces.is_empty()
            && !self.watched_namespaces.iter().any(|ns| ns == namespace)
        {
            return true;
        }

        if self.ignored_namespaces.iter().any(|ns| ns == namespace) {
            return true;
        }

        if let Some(app) = labels.get("app") {
            if self.ignored_apps.iter().any(|ignored| ignored == app) {
                return true;
            }
        }

        false
    }

    /// Applies all rules, including the service-specific ones.
    pub fn is_ignored_service(&self, svc: &Service) -> bool {
        static EMPTY: BTreeMap<String, String> = BTreeMap::new();
        let namespace = svc.namespace().unwrap_or_default();
        let labels = svc.metadata.labels.as_ref().unwrap_or(&EMPTY);
        if self.is_ignored(&namespace, labels) {
            return true;
        }

        let id = ResourceId::new(namespace, svc.name_unchecked());
        if self.ignored_services.iter().any(|ignored| *ignored == id) {
            return true;
        }

        svc.spec
            .as_ref()
            .and_then(|spec| spec.type_.as_deref())
            .map(|ty| ty == "ExternalName")
            .unwrap_or(false)
    }
}
