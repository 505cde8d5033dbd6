//! The mesh API server.
//!
//! Proxy pods poll this plain-HTTP endpoint for the latest configuration;
//! operators use the status routes for readiness, the proxy-node inventory
//! and a passthrough to an individual proxy's own configuration dump.

use crate::store::Store;
use bytes::Bytes;
use http::{header, Method, StatusCode};
use http_body_util::Full;
use hyper::{body::Incoming, service::service_fn, Request, Response};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use trellis_controller_k8s_api::{Api as KubeApi, Client, ListParams, Pod, ResourceExt};
use trellis_controller_shadow::{
    APP_LABEL, APP_VALUE, PROXY_COMPONENT_LABEL, PROXY_COMPONENT_VALUE,
};

/// The port every proxy pod serves its own API on.
const PROXY_API_PORT: u16 = 8080;

type Body = Full<Bytes>;

#[derive(Clone)]
pub struct Api {
    store: Store,
    client: Client,
    mesh_namespace: String,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Node {
    name: String,
    ip: Option<String>,
    ready: bool,
}

impl Api {
    pub fn new(store: Store, client: Client, mesh_namespace: String) -> Self {
        Self {
            store,
            client,
            mesh_namespace,
            http: reqwest::Client::new(),
        }
    }

    pub async fn serve(self, addr: SocketAddr, shutdown: drain::Watch) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "Mesh API listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    let api = self.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let api = api.clone();
                            async move { api.handle(req).await }
                        });
                        let io = TokioIo::new(stream);
                        if let Err(error) = hyper::server::conn::http1::Builder::new()
                            .serve_connection(io, service)
                            .await
                        {
                            tracing::debug!(%error, "API connection error");
                        }
                    });
                }
                _ = shutdown.clone().signaled() => {
                    tracing::debug!("Mesh API shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle(self, req: Request<Incoming>) -> Result<Response<Body>, Infallible> {
        if req.method() != Method::GET {
            return Ok(empty_response(StatusCode::METHOD_NOT_ALLOWED));
        }

        let path = req.uri().path().to_string();
        let rsp = match path.as_str() {
            "/api/configuration/current" => json_response(StatusCode::OK, &*self.store.config()),
            "/api/status/readiness" => {
                if self.store.is_ready() {
                    json_response(StatusCode::OK, &true)
                } else {
                    json_response(StatusCode::INTERNAL_SERVER_ERROR, &false)
                }
            }
            "/api/status/nodes" => self.nodes().await,
            _ => match node_name(&path) {
                Some(name) => self.node_configuration(name).await,
                None => empty_response(StatusCode::NOT_FOUND),
            },
        };
        Ok(rsp)
    }

    /// Lists the mesh proxy pods with their IP and readiness.
    async fn nodes(&self) -> Response<Body> {
        let pods = match self.proxy_pods().await {
            Ok(pods) => pods,
            Err(error) => {
                tracing::error!(%error, "Failed to list proxy pods");
                return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };
        let mut nodes: Vec<Node> = pods
            .iter()
            .map(|pod| Node {
                name: pod.name_unchecked(),
                ip: pod.status.as_ref().and_then(|status| status.pod_ip.clone()),
                ready: pod_ready(pod),
            })
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        json_response(StatusCode::OK, &nodes)
    }

    /// Proxies to one proxy pod's own configuration dump.
    async fn node_configuration(&self, name: &str) -> Response<Body> {
        let pods = match self.proxy_pods().await {
            Ok(pods) => pods,
            Err(error) => {
                tracing::error!(%error, "Failed to list proxy pods");
                return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };
        let ip = pods
            .iter()
            .find(|pod| pod.name_unchecked() == name)
            .and_then(|pod| pod.status.as_ref())
            .and_then(|status| status.pod_ip.clone());
        let ip = match ip {
            Some(ip) => ip,
            None => return empty_response(StatusCode::NOT_FOUND),
        };

        let url = format!("http://{ip}:{PROXY_API_PORT}/api/rawdata");
        match self.http.get(&url).send().await {
            Ok(upstream) => {
                let status = StatusCode::from_u16(upstream.status().as_u16())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                match upstream.bytes().await {
                    Ok(body) => Response::builder()
                        .status(status)
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(Full::new(body))
                        .unwrap_or_else(|_| empty_response(StatusCode::BAD_GATEWAY)),
                    Err(error) => {
                        tracing::error!(%error, %url, "Failed to read proxy response");
                        empty_response(StatusCode::BAD_GATEWAY)
                    }
                }
            }
            Err(error) => {
                tracing::error!(%error, %url, "Failed to reach proxy pod");
                empty_response(StatusCode::BAD_GATEWAY)
            }
        }
    }

    async fn proxy_pods(&self) -> Result<Vec<Pod>, kube::Error> {
        let api = KubeApi::<Pod>::namespaced(self.client.clone(), &self.mesh_namespace);
        let selector =
            format!("{APP_LABEL}={APP_VALUE},{PROXY_COMPONENT_LABEL}={PROXY_COMPONENT_VALUE}");
        let pods = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(pods.items)
    }
}

/// Parses `/api/status/node/{name}/configuration`.
fn node_name(path: &str) -> Option<&str> {
    let name = path
        .strip_prefix("/api/status/node/")?
        .strip_suffix("/configuration")?;
    (!name.is_empty() && !name.contains('/')).then_some(name)
}

fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap_or_else(|_| empty_response(StatusCode::INTERNAL_SERVER_ERROR)),
        Err(error) => {
            tracing::error!(%error, "Failed to encode response");
            empty_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn empty_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::default())
        .expect("empty response must be valid")
}

#[cfg(test)]
mod tests {
    use super::node_name;

    #[test]
    fn node_paths_parse() {
        assert_eq!(
            node_name("/api/status/node/proxy-abc12/configuration"),
            Some("proxy-abc12")
        );
        assert_eq!(node_name("/api/status/node//configuration"), None);
        assert_eq!(node_name("/api/status/node/a/b/configuration"), None);
        assert_eq!(node_name("/api/status/nodes"), None);
    }
}
