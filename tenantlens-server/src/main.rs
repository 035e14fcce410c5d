mod cli;
mod logging;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use cli::Cli;
use tenantlens::Config;
use tenantlens_server::{AppState, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose.tracing_level_filter(), cli.json_logs);

    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    let addr = config.bind_addr;
    let environment = config.environment;

    let state = AppState::new(config).context("failed to initialise services")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, ?environment, "tenantlens listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
