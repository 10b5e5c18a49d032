//! backdial demo
//!
//! Plays one or both roles of the reverse-dialed transport:
//! - server: dials out to `BACKDIAL_ADDR` and serves `grpc.health.v1.Health`
//!   over the sockets it dialed
//! - client: listens on `BACKDIAL_ADDR`, health-checks every peer that dialed
//!   in, then dials `BACKDIAL_PEER_ID` directly
//! - both: the two roles in one process, the server dialing the local client

use anyhow::{Context, Result};
use async_trait::async_trait;
use backdial::{
    with_channel_check, with_dial_timeout, with_proxy_protocol, BoxError, ChannelCheck, Client,
    ClientOption, ReverseListener,
};
use tonic::transport::{Channel, Server};
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::{Config, Mode};

/// Only hand out channels whose peer answers a health check.
struct HealthCheck;

#[async_trait]
impl ChannelCheck for HealthCheck {
    async fn check(&self, channel: &Channel) -> Result<(), BoxError> {
        health_status(channel.clone()).await.map(|_| ())
    }
}

async fn health_status(channel: Channel) -> Result<i32, BoxError> {
    let response = HealthClient::new(channel)
        .check(HealthCheckRequest {
            service: String::new(),
        })
        .await?;
    Ok(response.into_inner().status)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to BACKDIAL_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        mode = ?config.mode,
        addr = %config.addr,
        peer_id = %config.peer_id,
        proxy_protocol = config.proxy_protocol,
        "Configuration loaded"
    );

    match config.mode {
        Mode::Server => run_server(config.addr.clone(), config).await,
        Mode::Client => {
            let client = start_client(&config).await?;
            run_checks_until_shutdown(&client, &config).await;
            Ok(())
        }
        Mode::Both => {
            let client = start_client(&config).await?;
            let target = client.local_addr().to_string();
            let server_config = config.clone();
            tokio::spawn(async move {
                if let Err(e) = run_server(target, server_config).await {
                    error!(error = %e, "Server role failed");
                }
            });
            run_checks_until_shutdown(&client, &config).await;
            Ok(())
        }
    }
}

async fn run_server(addr: String, config: Config) -> Result<()> {
    let timeout = with_dial_timeout(config.dial_timeout);
    let listener = ReverseListener::listen(&addr, &config.peer_id, &[&timeout])
        .await
        .with_context(|| format!("Failed to start reverse listener for {addr}"))?;

    let (_reporter, health) = tonic_health::server::health_reporter();
    info!(target = %listener.addr(), peer_id = %listener.peer_id(), "Serving health checks");

    Server::builder()
        .add_service(health)
        .serve_with_incoming_shutdown(listener.incoming(), shutdown_signal())
        .await
        .context("gRPC server failed")?;

    listener.close();
    Ok(())
}

async fn start_client(config: &Config) -> Result<Client> {
    let timeout = with_dial_timeout(config.dial_timeout);
    let check = with_channel_check(HealthCheck);
    let proxy = with_proxy_protocol();

    let mut opts: Vec<&dyn ClientOption> = vec![&timeout, &check];
    if config.proxy_protocol {
        opts.push(&proxy);
    }

    let client = Client::bind(&config.addr, &opts)
        .await
        .with_context(|| format!("Failed to bind {}", config.addr))?;
    info!(bind_addr = %client.local_addr(), "Client listening");
    Ok(client)
}

async fn run_checks_until_shutdown(client: &Client, config: &Config) {
    tokio::select! {
        _ = check_loop(client, config) => {}
        _ = shutdown_signal() => info!("Shutting down"),
    }
}

async fn check_loop(client: &Client, config: &Config) {
    let mut ticker = tokio::time::interval(config.check_interval);
    loop {
        ticker.tick().await;

        client
            .each(|peer_id, channel| async move {
                let status = health_status(channel).await?;
                info!(peer_id = %peer_id, status, "Broadcast health check");
                Ok::<(), BoxError>(())
            })
            .await;

        match client.dial(&config.peer_id).await {
            Ok(channel) => {
                let result = health_status(channel.channel().clone()).await;
                match &result {
                    Ok(status) => info!(peer_id = %config.peer_id, status, "Targeted health check"),
                    Err(e) => warn!(peer_id = %config.peer_id, error = %e, "Targeted health check failed"),
                }
                if let Err(e) = client
                    .put(channel, result.as_ref().err().map(|e| &**e))
                    .await
                {
                    warn!(error = %e, "Failed to return channel");
                }
            }
            Err(e) => warn!(peer_id = %config.peer_id, error = %e, "Dial failed"),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
