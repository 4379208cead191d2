use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::catalog::Catalog;
use common::cli::{CommonArgs, CommonCommands, utils};
use router::InMemoryStateImpl;
use std::net::SocketAddr;
use tokio::sync::oneshot;

#[derive(Parser)]
#[command(name = "refguard")]
#[command(about = "Reference-integrity guard - refuses to delete context entities still referenced by peer services")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<GuardCommands>,

    #[arg(long, help = "HTTP API server port", default_value = "3000")]
    http_port: u16,

    #[arg(long, help = "Bind address for the HTTP server", default_value = "0.0.0.0")]
    bind: String,
}

#[derive(Subcommand)]
enum GuardCommands {
    #[command(flatten)]
    Common(CommonCommands),
}

impl Default for GuardCommands {
    fn default() -> Self {
        Self::Common(CommonCommands::Start)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    utils::init_logging(&cli.common);

    let config = utils::load_config(cli.common.config.as_ref())?;

    // Handle common commands that don't require starting the service
    let command = cli.command.unwrap_or_default();
    let GuardCommands::Common(ref common_cmd) = command;
    if utils::handle_common_command(common_cmd, &config).await? {
        return Ok(());
    }

    utils::validate_config(&config)?;

    log::info!("Starting refguard");

    let bind_ip = cli
        .bind
        .parse::<std::net::IpAddr>()
        .context("Invalid bind address")?;
    let http_addr = SocketAddr::new(bind_ip, cli.http_port);

    let catalog = Catalog::new(&config.database.dsn)
        .await
        .context("Failed to open catalog database")?;

    let state = InMemoryStateImpl::new(catalog, config.clone())
        .context("Failed to initialize usage probe")?;
    log::info!(
        "Probing peer records at {} (timeout {:?})",
        config.peers.assets_url,
        config.peers.timeout
    );
    if config.hard_delete_enabled() {
        log::info!("Hard delete is enabled");
    }

    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("Failed to bind HTTP API on {http_addr}"))?;

    let (http_shutdown_tx, http_shutdown_rx) = oneshot::channel::<()>();
    let http_handle = tokio::spawn(async move {
        let shutdown = async move {
            http_shutdown_rx.await.ok();
            log::info!("HTTP API shutting down gracefully");
        };
        if let Err(e) = router::serve(state, listener, shutdown).await {
            log::error!("HTTP API error: {e}");
        }
    });

    log::info!("HTTP API server listening on {http_addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c signal")?;

    log::info!("Shutting down refguard...");

    let _ = http_shutdown_tx.send(());
    let _ = http_handle.await;

    log::info!("refguard stopped gracefully");

    Ok(())
}
