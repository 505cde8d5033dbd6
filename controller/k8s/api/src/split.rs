use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Splits traffic addressed to a root service across weighted backends.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "split.smi-spec.io",
    version = "v1alpha3",
    kind = "TrafficSplit",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSplitSpec {
    /// The root service traffic is addressed to.
    pub service: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backends: Vec<TrafficSplitBackend>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSplitBackend {
    pub service: String,
    pub weight: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_smi_manifest() {
        let split: TrafficSplit = serde_json::from_value(serde_json::json!({
            "apiVersion": "split.smi-spec.io/v1alpha3",
            "kind": "TrafficSplit",
            "metadata": { "name": "foo-split", "namespace": "a" },
            "spec": {
                "service": "foo",
                "backends": [
                    { "service": "foo-v1", "weight": 80 },
                    { "service": "foo-v2", "weight": 20 }
                ]
            }
        }))
        .unwrap();
        assert_eq!(split.spec.service, "foo");
        assert_eq!(split.spec.backends.len(), 2);
        assert_eq!(split.spec.backends[0].weight, 80);
    }
}
