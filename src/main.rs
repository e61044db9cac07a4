use anyhow::Context as _;
use cutover::cluster::{ClusterClient, KubeClusterClient};
use cutover::config::DeployerConfig;
use cutover::controller::clock::SystemClock;
use cutover::controller::health_check::HttpHealthProbe;
use cutover::controller::lock::AppLocks;
use cutover::controller::{Deployer, ReplicaLifecycle};
use cutover::kv::{EtcdStore, KeyValueStore, MemoryStore};
use cutover::proxy::{IngressProxy, KvProxy, ProxyBackend, ProxyKind, StatusConfirmer};
use cutover::registry::KvDeploymentStore;
use cutover::server::{
    api, create_metrics, health_router, run_server, shutdown_channel, wait_for_signal,
    ReadinessState,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Per-request ceiling for etcd calls
const ETCD_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval for the ingress status page
const PROXY_STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Build a scheduler client from an explicit URL, or infer in-cluster/kubeconfig settings
async fn kube_client(url: Option<&str>) -> anyhow::Result<kube::Client> {
    let config = match url {
        Some(url) => {
            let uri = url
                .parse::<axum::http::Uri>()
                .with_context(|| format!("invalid scheduler URL '{}'", url))?;
            kube::Config::new(uri)
        }
        None => kube::Config::infer()
            .await
            .context("failed to infer Kubernetes configuration")?,
    };
    kube::Client::try_from(config).context("failed to create Kubernetes client")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS operations
    // This is required for rustls 0.23+ when no default provider is set via features
    let _ = rustls::crypto::ring::default_provider().install_default();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting cutover deployer");

    let config = DeployerConfig::from_env();
    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();
    let metrics = create_metrics().context("failed to create metrics registry")?;

    let client = kube_client(config.kubernetes_url.as_deref()).await?;
    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client));

    let store: Arc<dyn KeyValueStore> = match &config.etcd_url {
        Some(url) => {
            info!(url = %url, "Using etcd store");
            Arc::new(EtcdStore::new(url.clone(), ETCD_TIMEOUT))
        }
        None => {
            warn!("CUTOVER_ETCD_URL not set - deployment records are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let proxy: Arc<dyn ProxyBackend> = match config.proxy {
        ProxyKind::Kv => Arc::new(KvProxy::new(store.clone())),
        ProxyKind::Ingress => {
            let confirmer = config.proxy_status_url.as_ref().map(|url| {
                StatusConfirmer::new(
                    url.clone(),
                    config.proxy_confirm_timeout,
                    PROXY_STATUS_INTERVAL,
                )
            });
            if confirmer.is_none() {
                info!("Proxy status URL not configured - backend switches are not confirmed");
            }
            Arc::new(IngressProxy::new(cluster.clone(), confirmer))
        }
    };
    info!(proxy = %proxy.name(), "Proxy backend configured");

    let probe = Arc::new(HttpHealthProbe::new(
        config.health_check_method,
        config.health_check_interval,
    ));
    let lifecycle = Arc::new(ReplicaLifecycle::new(
        cluster,
        proxy,
        probe,
        config.lifecycle(),
    ));
    let deployer = Arc::new(Deployer::new(
        lifecycle,
        Arc::new(KvDeploymentStore::new(store)),
        Arc::new(AppLocks::new()),
        Arc::new(SystemClock),
        metrics.clone(),
        config.proxy_reload,
    ));

    let app = health_router(readiness.clone(), metrics).merge(api::router(deployer));
    let port = config.port;
    let server_signal = shutdown_signal;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = run_server(port, app, server_signal).await {
            warn!(error = %e, "Server failed");
        }
    });

    readiness.set_ready();
    info!(port = port, "Deployer ready");

    let signal = wait_for_signal()
        .await
        .context("failed to register signal handlers")?;
    info!(signal = signal, "Initiating graceful shutdown");
    // Mark not ready so K8s stops sending traffic during shutdown
    readiness.set_not_ready();
    shutdown_controller.shutdown();

    // Rollouts still running in the background are abandoned with the process
    if tokio::time::timeout(Duration::from_secs(30), server_handle)
        .await
        .is_err()
    {
        warn!("Server did not stop within 30s");
    }

    info!("cutover deployer shut down gracefully");
    Ok(())
}
