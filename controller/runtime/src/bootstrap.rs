//! Cluster bootstrap and teardown.

use anyhow::{bail, Context, Result};
use trellis_controller_k8s_api::{
    access::TrafficTarget,
    api_resource_exists,
    specs::{HTTPRouteGroup, TCPRoute},
    split::TrafficSplit,
    Api, Client, DeleteParams, ListParams, Namespace, ObjectMeta, PostParams, Service,
};
use trellis_controller_shadow::{shadow_label_selector, APP_LABEL, APP_VALUE};

/// Verifies that every CRD group the controller consumes is served.
///
/// All missing groups are reported in one composite error so a broken
/// install surfaces completely on the first attempt.
pub async fn verify_custom_resources(client: &Client, acl: bool) -> Result<()> {
    let mut missing = Vec::new();
    if !api_resource_exists::<TrafficSplit>(client).await {
        missing.push("TrafficSplit (split.smi-spec.io/v1alpha3)");
    }
    if acl {
        if !api_resource_exists::<TrafficTarget>(client).await {
            missing.push("TrafficTarget (access.smi-spec.io/v1alpha2)");
        }
        if !api_resource_exists::<HTTPRouteGroup>(client).await {
            missing.push("HTTPRouteGroup (specs.smi-spec.io/v1alpha3)");
        }
        if !api_resource_exists::<TCPRoute>(client).await {
            missing.push("TCPRoute (specs.smi-spec.io/v1alpha3)");
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        bail!(
            "missing required custom resource definitions: {}",
            missing.join(", "),
        );
    }
}

/// Prepares the cluster: checks API reachability and CRDs, and ensures the
/// mesh namespace exists.
pub async fn prepare(client: &Client, mesh_namespace: &str, acl: bool) -> Result<()> {
    let namespaces = Api::<Namespace>::all(client.clone());
    namespaces
        .list(&ListParams::default().limit(1))
        .await
        .context("the Kubernetes API is unreachable")?;

    verify_custom_resources(client, acl).await?;

    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(mesh_namespace.to_string()),
            labels: Some(
                Some((APP_LABEL.to_string(), APP_VALUE.to_string()))
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    };
    match namespaces.create(&PostParams::default(), &namespace).await {
        Ok(_) => tracing::info!(namespace = mesh_namespace, "Created mesh namespace"),
        Err(kube::Error::Api(response)) if response.code == 409 => {
            tracing::debug!(namespace = mesh_namespace, "Mesh namespace already exists");
        }
        Err(error) => return Err(error).context("failed to create the mesh namespace"),
    }

    tracing::info!("Cluster is prepared");
    Ok(())
}

/// Removes everything the mesh created: shadow services, then the mesh
/// namespace itself.
pub async fn cleanup(client: &Client, mesh_namespace: &str) -> Result<()> {
    let shadows = Api::<Service>::namespaced(client.clone(), mesh_namespace);
    shadows
        .delete_collection(
            &DeleteParams::default(),
            &ListParams::default().labels(&shadow_label_selector()),
        )
        .await
        .context("failed to delete shadow services")?;
    tracing::info!(namespace = mesh_namespace, "Deleted shadow services");

    let namespaces = Api::<Namespace>::all(client.clone());
    match namespaces
        .delete(mesh_namespace, &DeleteParams::default())
        .await
    {
        Ok(_) => tracing::info!(namespace = mesh_namespace, "Deleted mesh namespace"),
        Err(kube::Error::Api(response)) if response.code == 404 => {
            tracing::debug!(namespace = mesh_namespace, "Mesh namespace already gone");
        }
        Err(error) => return Err(error).context("failed to delete the mesh namespace"),
    }

    Ok(())
}
