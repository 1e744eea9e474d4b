//! Entrypoint to the sobeyshim node runtime.
//!
//! A single instance of this binary runs on each node and serves the CRI
//! runtime and image services to the local kubelet on
//! `unix:///run/sobeyshim.sock`. Startup order matters: configuration, etcd,
//! service construction, directory skeleton, IP-range initialisation, and
//! only then the socket bind, so a failure anywhere above never leaves a
//! stale socket behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as AnyhowContext;
use clap::Parser;
use tokio::net::UnixListener;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

use sobeyshim::config::Config;
use sobeyshim::network::CniNetworkPlugin;
use sobeyshim::os::RealOs;
use sobeyshim::server::{ImageServiceServer, RuntimeServiceServer};
use sobeyshim::service::SobeyService;
use sobeyshim::store::EtcdStore;

/// Unix socket the kubelet dials.
const ENDPOINT: &str = "/run/sobeyshim.sock";
/// CNI plugin binary driven for sandbox networking.
const CNI_PLUGIN_PATH: &str = "/opt/cni/bin/bridge";

#[derive(Parser)]
#[command(name = "sobeyshim", version)]
struct Args {
    /// Directory containing `config.yaml`.
    #[arg(long, default_value = ".")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load(&args.config)?;

    let db = Arc::new(
        EtcdStore::connect(&config.etcd)
            .await
            .context("cannot connect to etcd")?,
    );
    let plugin = Arc::new(CniNetworkPlugin::bridge(
        CNI_PLUGIN_PATH.to_string(),
        &config.server.ip_range,
    ));
    let service = Arc::new(SobeyService::new(
        Arc::new(RealOs),
        db,
        plugin,
        &config.server,
    )?);

    service.prepare_directories().await;
    service
        .init_ip_range()
        .await
        .context("cannot initialise the sandbox ip range")?;

    // systemd sends SIGTERM to stop services, CTRL+C sends SIGINT.
    let mut sigterm = signal(SignalKind::terminate()).context("cannot listen for SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("cannot listen for SIGINT")?;
    let shutdown_signal = async move {
        select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    };

    let endpoint = Path::new(ENDPOINT);
    if let Some(parent) = endpoint.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // A previous run may have left its socket path behind.
    if endpoint.exists() {
        std::fs::remove_file(endpoint)?;
    }
    let listener = UnixListener::bind(endpoint)
        .with_context(|| format!("cannot bind unix socket {ENDPOINT}"))?;
    tracing::info!(endpoint = ENDPOINT, "serving CRI requests");

    let result = Server::builder()
        .add_service(RuntimeServiceServer::new(service.clone()))
        .add_service(ImageServiceServer::new(service))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown_signal)
        .await;

    // Unlink the socket so a restart can rebind, then surface any server
    // error.
    let unlink_result = std::fs::remove_file(endpoint);
    result?;
    Ok(unlink_result?)
}
