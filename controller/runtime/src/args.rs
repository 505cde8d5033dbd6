use crate::{api::Api as MeshApi, bootstrap, metrics::Metrics, store::Store, worker::Worker};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};
use trellis_controller_core::{ResourceId, TrafficType};
use trellis_controller_k8s_api::{
    access::TrafficTarget,
    specs::{HTTPRouteGroup, TCPRoute},
    split::TrafficSplit,
    Api, Endpoints, ListParams, Pod, Service,
};
use trellis_controller_k8s_index::{Index, Key, Kind, ResourceFilter, WorkQueue};
use trellis_controller_ports::{HttpPortPool, PortTable};
use trellis_controller_provider::Provider;
use trellis_controller_shadow::{shadow_label_selector, ShadowServiceManager};

const MIN_HTTP_PORT: u16 = 5000;
const MIN_TCP_PORT: u16 = 10000;
const MIN_UDP_PORT: u16 = 15000;

/// Bounds the initial wait for every resource watch to list its kind.
const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[clap(name = "trellis-controller", about = "The trellis mesh control plane", version)]
pub struct Args {
    #[clap(
        long,
        default_value = "trellis=info,warn",
        env = "TRELLIS_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The namespace the mesh components are deployed in.
    #[clap(long, default_value = "trellis", env = "TRELLIS_NAMESPACE")]
    namespace: String,

    /// Namespaces to watch; everything but the ignored namespaces when empty.
    #[clap(long, env = "TRELLIS_WATCH_NAMESPACES", value_delimiter = ',')]
    watch_namespaces: Vec<String>,

    /// Namespaces to ignore on top of kube-system and the mesh namespace.
    #[clap(long, env = "TRELLIS_IGNORE_NAMESPACES", value_delimiter = ',')]
    ignore_namespaces: Vec<String>,

    /// Enables SMI access control: TrafficTargets restrict who may reach a
    /// service, HTTPRouteGroups and TCPRoutes narrow how.
    #[clap(long, env = "TRELLIS_ACL")]
    acl: bool,

    /// Traffic type assumed for services without a traffic-type annotation.
    #[clap(long, default_value = "http", env = "TRELLIS_DEFAULT_MODE")]
    default_mode: TrafficType,

    #[clap(long, default_value = "0.0.0.0", env = "TRELLIS_API_HOST")]
    api_host: IpAddr,

    #[clap(long, default_value = "9000", env = "TRELLIS_API_PORT")]
    api_port: u16,

    /// Size of the HTTP mesh port range starting at 5000.
    #[clap(long, default_value = "10", env = "TRELLIS_LIMIT_HTTP_PORT")]
    limit_http_port: u16,

    /// Size of the TCP mesh port range starting at 10000.
    #[clap(long, default_value = "25", env = "TRELLIS_LIMIT_TCP_PORT")]
    limit_tcp_port: u16,

    /// Size of the UDP mesh port range starting at 15000.
    #[clap(long, default_value = "25", env = "TRELLIS_LIMIT_UDP_PORT")]
    limit_udp_port: u16,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Verify the cluster and create the mesh namespace.
    Prepare,
    /// Delete the shadow services and the mesh namespace.
    Cleanup,
}

fn port_range(min: u16, limit: u16, proto: &str) -> Result<(u16, u16)> {
    if limit == 0 {
        bail!("the {proto} port limit must be at least 1");
    }
    match min.checked_add(limit - 1) {
        Some(max) => Ok((min, max)),
        None => bail!("the {proto} port range [{min}, {min}+{limit}) overflows"),
    }
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            namespace,
            watch_namespaces,
            ignore_namespaces,
            acl,
            default_mode,
            api_host,
            api_port,
            limit_http_port,
            limit_tcp_port,
            limit_udp_port,
            command,
        } = self;

        let (http_min, http_max) = port_range(MIN_HTTP_PORT, limit_http_port, "HTTP")?;
        let (tcp_min, tcp_max) = port_range(MIN_TCP_PORT, limit_tcp_port, "TCP")?;
        let (udp_min, udp_max) = port_range(MIN_UDP_PORT, limit_udp_port, "UDP")?;

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(prom.sub_registry_with_prefix("trellis_controller"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;
        let client = runtime.client();

        match command {
            Some(Command::Prepare) => return bootstrap::prepare(&client, &namespace, acl).await,
            Some(Command::Cleanup) => return bootstrap::cleanup(&client, &namespace).await,
            None => {}
        }

        bootstrap::verify_custom_resources(&client, acl).await?;

        let filter = ResourceFilter::new(watch_namespaces, ignore_namespaces)
            .with_ignored_namespaces(["kube-system".to_string(), namespace.clone()])
            .with_ignored_apps(["trellis".to_string(), "jaeger".to_string()])
            .with_ignored_services([ResourceId::new("default", "kubernetes")]);

        let mut required = vec![
            Kind::Services,
            Kind::Endpoints,
            Kind::Pods,
            Kind::TrafficSplits,
        ];
        if acl {
            required.extend([Kind::TrafficTargets, Kind::HttpRouteGroups, Kind::TcpRoutes]);
        }

        let queue = WorkQueue::new();
        let index = Index::shared(filter, queue.clone(), required);

        let services = runtime.watch_all::<Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), services).instrument(info_span!("services")),
        );

        let endpoints = runtime.watch_all::<Endpoints>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), endpoints).instrument(info_span!("endpoints")),
        );

        let pods = runtime.watch_all::<Pod>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")),
        );

        let splits = runtime.watch_all::<TrafficSplit>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), splits).instrument(info_span!("trafficsplits")),
        );

        if acl {
            let targets = runtime.watch_all::<TrafficTarget>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(index.clone(), targets)
                    .instrument(info_span!("traffictargets")),
            );

            let groups = runtime.watch_all::<HTTPRouteGroup>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(index.clone(), groups)
                    .instrument(info_span!("httproutegroups")),
            );

            let routes = runtime.watch_all::<TCPRoute>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(index.clone(), routes).instrument(info_span!("tcproutes")),
            );
        }

        // Bound the wait for the initial lists; a watch that cannot list its
        // kind keeps the whole controller from starting.
        let mut synced = index.read().synced_rx();
        tokio::time::timeout(SYNC_TIMEOUT, async {
            while !*synced.borrow_and_update() {
                if synced.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for resource watches to sync"))?;
        info!("Resource watches synced");

        // Restore the stateful port tables from the shadow services written
        // by previous runs.
        let http_ports = HttpPortPool::new(http_min, http_max);
        let tcp_ports = Arc::new(PortTable::new(tcp_min, tcp_max));
        let udp_ports = Arc::new(PortTable::new(udp_min, udp_max));
        let shadows = Api::<Service>::namespaced(client.clone(), &namespace)
            .list(&ListParams::default().labels(&shadow_label_selector()))
            .await?;
        tcp_ports.load_state(&namespace, &shadows.items);
        udp_ports.load_state(&namespace, &shadows.items);

        let store = Store::new();
        let shadow = ShadowServiceManager::new(
            client.clone(),
            index.clone(),
            namespace.clone(),
            default_mode,
            http_ports,
            tcp_ports.clone(),
            udp_ports.clone(),
        );
        let provider = Provider::new(default_mode, acl, http_ports, tcp_ports, udp_ports);
        let worker = Worker::new(
            index.clone(),
            shadow,
            provider,
            store.clone(),
            queue.clone(),
            acl,
            metrics,
        );
        tokio::spawn(worker.run().instrument(info_span!("worker")));

        // Guarantee a first pass even on an empty cluster.
        queue.push(Key::Refresh);

        let api = MeshApi::new(store, client, namespace);
        let api_addr = SocketAddr::new(api_host, api_port);
        tokio::spawn(
            api.serve(api_addr, runtime.shutdown_handle())
                .instrument(info_span!("api")),
        );

        // Let the worker drain once shutdown is signaled.
        let shutdown = runtime.shutdown_handle();
        let drain_queue = queue.clone();
        tokio::spawn(async move {
            let _ = shutdown.signaled().await;
            drain_queue.close();
        });

        // Block on the shutdown signal; background tasks drain before exit.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }
        Ok(())
    }
}
