#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod access;
pub mod specs;
pub mod split;

pub use k8s_openapi::{
    api::core::v1::{
        EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Namespace, Pod, PodSpec,
        PodStatus, Service, ServicePort, ServiceSpec,
    },
    apimachinery::pkg::util::intstr::IntOrString,
};
pub use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams},
    Client, Error, Resource, ResourceExt,
};

/// Checks whether a resource kind is served by the cluster.
///
/// Used at bootstrap to verify that the SMI CRD groups this controller
/// consumes are installed.
pub async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    match client.list_api_group_resources(&T::api_version(&dt)).await {
        Ok(resources) => resources.resources.iter().any(|r| r.kind == T::kind(&dt)),
        Err(_) => false,
    }
}
