//! Labels, selectors and annotations stamped onto shadow services.

use std::collections::BTreeMap;
use trellis_controller_core::{ResourceId, TrafficType};
use trellis_controller_k8s_index::annotations;

pub const APP_LABEL: &str = "app";
pub const APP_VALUE: &str = "trellis-mesh";

pub const COMPONENT_LABEL: &str = "trellis.io/component";
pub const SHADOW_COMPONENT_VALUE: &str = "shadow-service";

/// Back-references to the user service a shadow mirrors.
pub const SERVICE_NAME_LABEL: &str = "trellis.io/service-name";
pub const SERVICE_NAMESPACE_LABEL: &str = "trellis.io/service-namespace";

pub const PROXY_COMPONENT_LABEL: &str = "component";
pub const PROXY_COMPONENT_VALUE: &str = "mesh-proxy";

pub fn shadow_labels(id: &ResourceId) -> BTreeMap<String, String> {
    [
        (APP_LABEL, APP_VALUE),
        (COMPONENT_LABEL, SHADOW_COMPONENT_VALUE),
        (SERVICE_NAME_LABEL, id.name.as_str()),
        (SERVICE_NAMESPACE_LABEL, id.namespace.as_str()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// The selector a shadow service uses to target the proxy pods.
pub fn proxy_selector() -> BTreeMap<String, String> {
    [
        (APP_LABEL, APP_VALUE),
        (PROXY_COMPONENT_LABEL, PROXY_COMPONENT_VALUE),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

pub fn shadow_annotations(traffic_type: TrafficType) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    annotations::set_traffic_type(&mut annotations, traffic_type);
    annotations
}

/// Label selector matching every shadow service in the mesh namespace.
pub fn shadow_label_selector() -> String {
    format!("{COMPONENT_LABEL}={SHADOW_COMPONENT_VALUE}")
}
