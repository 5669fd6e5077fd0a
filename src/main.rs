//! Sidecar proxy entry point: parse CLI flags, load config/secrets,
//! load or generate the root CA, and run the accept loop.

mod ca;
mod cli;
mod config;
mod connect;
mod error;
mod flow;
mod http1;
mod listener;
mod logging;
mod magic;
mod router;
mod secrets;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use crate::listener::AppContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    logging::init(cli.verbose);

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let config_path = std::path::Path::new(&cli.config);
    let config = if config_path.exists() {
        config::Config::load(config_path)?
    } else {
        tracing::info!(path = %cli.config, "no config file found, using defaults");
        config::Config::default()
    };
    let mut config = config;
    if let Some(port) = cli.port {
        config.port = port;
    }
    let config = Arc::new(config);

    let secrets = Arc::new(secrets::load(std::path::Path::new(&config.env_file)));
    tracing::info!(count = secrets.len(), "loaded secrets");

    let (cert_path, key_path) = ca::resolve_paths(&config.ca.cert_path, &config.ca.key_path);
    let ca = Arc::new(ca::RootCa::load_or_generate(&cert_path, &key_path).await?);
    tracing::info!(cert_path = %cert_path.display(), "root CA ready");

    if cli.generate_ca {
        tracing::info!("--generate-ca: CA written, exiting without binding a listener");
        return Ok(());
    }

    let bind_ip = if config.unsafe_bind_all {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    };
    let addr = SocketAddr::from((bind_ip, config.port));
    let tcp_listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "sidecar proxy listening");

    let ctx = Arc::new(AppContext { config, secrets, ca });
    listener::run(tcp_listener, ctx).await
}
