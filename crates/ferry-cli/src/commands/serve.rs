//! The `serve` command: run the transfer daemon.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};

use async_trait::async_trait;

use ferry_core::channel::{ChannelStream, ConnectionProvider, PacketStream};
use ferry_core::commander::Commander;
use ferry_core::directory::HostAuth;
use ferry_core::error::Error;
use ferry_core::runner::ClientRunner;
use ferry_core::session;

/// Arguments for `ferry serve`.
#[derive(Args)]
pub struct ServeArgs {
    /// Configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// Configure TCP keep-alive on a daemon socket so network equipment does
/// not silently drop idle transfer connections.
fn configure_tcp_keepalive(stream: &TcpStream) -> Result<()> {
    let socket_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));
    socket_ref
        .set_tcp_keepalive(&keepalive)
        .context("enabling TCP keep-alive")?;
    Ok(())
}

/// Dials peers over plain TCP. Hosts flagged `ssl` need a secure transport
/// provider, which this build does not carry.
pub struct TcpConnectionProvider;

#[async_trait]
impl ConnectionProvider for TcpConnectionProvider {
    async fn connect(&self, host: &HostAuth) -> ferry_core::Result<Box<dyn ChannelStream>> {
        if host.ssl {
            return Err(Error::Config(format!(
                "host '{}' requires a secure transport provider",
                host.host_id
            )));
        }
        let stream = TcpStream::connect(host.socket_address()).await?;
        if let Err(e) = configure_tcp_keepalive(&stream) {
            tracing::debug!(error = %e, "Keep-alive not enabled");
        }
        Ok(Box::new(stream))
    }
}

/// Run the daemon until ctrl-c or a protocol-level shutdown.
pub async fn run(args: ServeArgs) -> Result<()> {
    let config = super::load_config(args.config.as_ref())?;
    let (ctx, _store) = super::build_context(&config).await?;

    let runner = Arc::new(ClientRunner::new(
        Arc::clone(&ctx),
        Arc::new(TcpConnectionProvider),
        config.server.retry_limit,
        config.server.retry_delay,
        config.server.integrity_restart,
    ));
    let commander = Arc::new(Commander::new(
        Arc::clone(&runner),
        config.server.effective_runner_threads(),
        config.server.delay_commander,
        config.server.delay_between_submissions,
    ));
    commander.recover_from_startup().await?;

    let bind = format!("{}:{}", config.server.bind_address, config.server.port);
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(address = %bind, host = %ctx.host_id, "Ferry daemon listening");

    let accept_ctx = Arc::clone(&ctx);
    let accept = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    tracing::info!(peer = %peer_addr, "Connection accepted");
                    if let Err(e) = configure_tcp_keepalive(&stream) {
                        tracing::debug!(error = %e, "Keep-alive not enabled");
                    }
                    let session_ctx = Arc::clone(&accept_ctx);
                    tokio::spawn(session::serve_requested(
                        PacketStream::new(Box::new(stream)),
                        session_ctx,
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                }
            }
        }
    });

    let commander_loop = Arc::clone(&commander);
    let commander_task = tokio::spawn(async move { commander_loop.run().await });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("Shutting down, in-flight transfers run to completion");
    commander
        .shutdown_handle()
        .store(true, std::sync::atomic::Ordering::SeqCst);
    accept.abort();
    commander_task.await.ok();
    Ok(())
}
