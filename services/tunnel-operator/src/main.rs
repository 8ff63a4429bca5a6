//! Tunnel Operator
//!
//! Watches Tunnel resources and converges them onto Cloudflare tunnels,
//! DNS records and cloudflared Deployments.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use axum::{routing::get, Json, Router};
use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, CustomResourceExt};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tunnel_operator::config::{
    DEFAULT_CLOUDFLARED_IMAGE, DEFAULT_CLOUDFLARE_API_URL, DEFAULT_ROUTING_DOMAIN,
};
use tunnel_operator::{
    error_policy, reconcile, CloudflareClient, CloudflareConfig, Context, KubeStore,
    OperatorConfig, Tunnel,
};

/// Tunnel Operator - Cloudflare tunnels for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "tunnel-operator", version, about)]
struct Args {
    /// Print the Tunnel CustomResourceDefinition and exit
    #[arg(long, default_value = "false")]
    print_crd: bool,

    /// Cloudflare account owning the tunnels
    #[arg(long, env = "CLOUDFLARE_ACCOUNT_ID", default_value = "")]
    account_id: String,

    /// Cloudflare API token (Tunnel:Edit, DNS:Edit)
    #[arg(long, env = "CLOUDFLARE_API_TOKEN", default_value = "", hide_env_values = true)]
    api_token: String,

    /// DNS zone in which tunnel hostnames are published
    #[arg(long, env = "CLOUDFLARE_ZONE_NAME", default_value = "")]
    zone_name: String,

    /// Cloudflare v4 API base URL
    #[arg(long, env = "CLOUDFLARE_API_URL", default_value = DEFAULT_CLOUDFLARE_API_URL)]
    api_url: String,

    /// Domain tunnel identities resolve under
    #[arg(long, env = "TUNNEL_ROUTING_DOMAIN", default_value = DEFAULT_ROUTING_DOMAIN)]
    routing_domain: String,

    /// Image for the default cloudflared workload
    #[arg(long, env = "CLOUDFLARED_IMAGE", default_value = DEFAULT_CLOUDFLARED_IMAGE)]
    cloudflared_image: String,

    /// Periodic resync interval in seconds
    #[arg(long, env = "RESYNC_INTERVAL", default_value = "300")]
    resync_interval: u64,

    /// Seconds to wait after rolling the workload before checking it again
    #[arg(long, env = "ROLLOUT_COOLDOWN", default_value = "60")]
    rollout_cooldown: u64,

    /// Only watch Tunnels in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Address of the health endpoint
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8080")]
    health_addr: SocketAddr,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            routing_domain: self.routing_domain.clone(),
            cloudflared_image: self.cloudflared_image.clone(),
            resync_interval: Duration::from_secs(self.resync_interval),
            rollout_cooldown: Duration::from_secs(self.rollout_cooldown),
            ..Default::default()
        }
    }

    fn cloudflare_config(&self) -> CloudflareConfig {
        CloudflareConfig {
            api_url: self.api_url.clone(),
            api_token: self.api_token.clone(),
            account_id: self.account_id.clone(),
            zone_name: self.zone_name.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print!("{}", serde_yaml::to_string(&Tunnel::crd())?);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .json()
        .init();

    info!(
        namespace = ?args.namespace,
        zone = %args.zone_name,
        "Starting Tunnel Operator"
    );

    let cloudflare = Arc::new(
        CloudflareClient::connect(&args.cloudflare_config())
            .await
            .context("Failed to initialize Cloudflare client")?,
    );

    let client = Client::try_default()
        .await
        .context("Failed to create K8s client")?;
    let store = Arc::new(KubeStore::new(client.clone()));

    let ctx = Arc::new(Context {
        store: store.clone(),
        scheduler: store,
        tunnels: cloudflare.clone(),
        dns: cloudflare,
        config: args.operator_config(),
    });

    let (tunnels, secrets, deployments): (Api<Tunnel>, Api<Secret>, Api<Deployment>) =
        match args.namespace.as_deref() {
            Some(ns) => (
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client.clone(), ns),
            ),
            None => (
                Api::all(client.clone()),
                Api::all(client.clone()),
                Api::all(client),
            ),
        };

    let controller = Controller::new(tunnels, watcher::Config::default())
        .owns(secrets, watcher::Config::default())
        .owns(deployments, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => info!(tunnel = %obj.name, namespace = ?obj.namespace, "Reconciled"),
                Err(e) => warn!(error = %e, "Reconcile failed"),
            }
        });

    let app = Router::new().route("/health", get(health_check));
    let listener = tokio::net::TcpListener::bind(args.health_addr)
        .await
        .with_context(|| format!("Failed to bind {}", args.health_addr))?;
    info!("Health endpoint listening on {}", args.health_addr);

    tokio::select! {
        _ = controller => info!("Controller stopped"),
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!(error = %e, "Health server failed");
            }
        }
    }

    Ok(())
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "tunnel-operator",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
