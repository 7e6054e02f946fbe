use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nssrespd::config::ResponderConfig;
use nssrespd::error::{ResponderError, Result};
use nssrespd::graceful_shutdown::GracefulShutdown;
use nssrespd::http_server::HttpServer;
use nssrespd::protocol;
use nssrespd::provider::{Provider, RefreshKind};
use nssrespd::responder::ResponderContext;

#[derive(Parser, Debug)]
#[command(name = "nssrespd", about = "Identity-lookup responder core")]
struct Cli {
    #[arg(long, default_value = "/etc/nssrespd/nssrespd.toml")]
    config: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, default_value_t = 0x0001_0000u32, hide = true)]
    idmap_lower: u32,

    #[arg(long, default_value_t = 0x7fff_ffffu32, hide = true)]
    idmap_upper: u32,

    #[arg(long, default_value_t = 200_000u32)]
    idmap_range_size: u32,

    #[arg(long)]
    idmap_autorid: bool,
}

/// This binary has no real directory backend wired in, so every refresh
/// immediately reports success against whatever the persistent cache
/// already holds. A real deployment swaps this for an actual provider.
struct NullProvider;

#[async_trait::async_trait]
impl Provider for NullProvider {
    async fn account_request(&self, _domain: &str, _kind: RefreshKind, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn domains_refresh(&self, _hint_domain: Option<&str>) -> Result<()> {
        Ok(())
    }
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            return std::process::ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "responder exited with error");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = ResponderConfig::load(&cli.config)?;
    info!(path = %cli.config.display(), "loaded configuration");

    let ctx = Arc::new(ResponderContext::new(
        config,
        Arc::new(NullProvider),
        cli.idmap_lower,
        cli.idmap_upper,
        cli.idmap_range_size,
        cli.idmap_autorid,
    )?);

    let shutdown = Arc::new(GracefulShutdown::new(ctx.clone()));

    let unix_ctx = ctx.clone();
    let socket_path = unix_ctx.config.socket_path.clone();
    let unix_shutdown_rx = shutdown.subscribe();
    let unix_task = tokio::spawn(async move {
        if let Err(e) = protocol::run_unix_server(unix_ctx, &socket_path, unix_shutdown_rx).await {
            error!(error = %e, "unix server exited with error");
        }
    });

    if let Some(bind_addr) = ctx.config.http_bind_addr {
        let http_ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = HttpServer::new(http_ctx, bind_addr).start().await {
                error!(error = %e, "http server exited with error");
            }
        });
    }

    let sweep_ctx = ctx.clone();
    let mut sweep_shutdown_rx = shutdown.subscribe();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = sweep_shutdown_rx.recv() => return,
                _ = interval.tick() => sweep_ctx.run_coherence_sweep(),
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| ResponderError::Fatal(format!("failed to listen for ctrl-c: {e}")))?;
    info!("received shutdown signal");

    shutdown
        .shutdown()
        .await
        .map_err(|e| ResponderError::Fatal(format!("graceful shutdown failed: {e}")))?;

    unix_task.abort();
    Ok(())
}
