use anyhow::Context;
use kotsadm_bridge::config::{self, Readiness};
use kotsadm_bridge::license::LicenseClient;
use kotsadm_bridge::readiness;
use kotsadm_bridge::state::AppState;
use kotsadm_bridge::webserver;
use kube::Client;
use std::env;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

static DEFAULT_CONFIG_PATH: &str = "/etc/kotsadm-bridge/config.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting kotsadm-bridge {}", env!("CARGO_PKG_VERSION"));

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = config::load_config(&config_path)?;

    let kube_client = create_kube_client().await?;
    let http_client = reqwest::Client::builder()
        .build()
        .context("Failed to build HTTP client")?;
    let license_client = LicenseClient::new(http_client, config.license.api_endpoint.clone());
    info!(
        "Exchanging platform licenses through {}",
        license_client.api_endpoint()
    );
    let state = AppState::new(Arc::new(license_client));

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_admin_console(
        kube_client,
        config.readiness.clone(),
        state.clone(),
        shutdown.clone(),
    ));

    let app = webserver::create_app(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}

async fn create_kube_client() -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to namespace {}, Kubernetes API server with version {}.{}",
        client.default_namespace(),
        api_server_info.major,
        api_server_info.minor
    );
    Ok(client)
}

async fn wait_for_admin_console(
    client: Client,
    readiness_config: Readiness,
    state: AppState,
    shutdown: CancellationToken,
) {
    let selector = readiness_config.selector(client.default_namespace());
    let timeout = readiness_config.timeout();

    let outcome = readiness::poll_until_cancelled(&client, &selector, timeout, &shutdown).await;
    match outcome.into_result(&selector, timeout) {
        Ok(pod_name) => {
            info!("Admin console pod {} is ready", pod_name);
            state.mark_console_ready();
        }
        Err(e) => error!("Admin console did not become ready: {:#}", e),
    }
}
