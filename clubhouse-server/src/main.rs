//! Service entry point

use clubhouse_server::{config::Config, observability, server, state::AppState};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::load()?;
    observability::init_tracing(&config)?;
    let metrics = observability::init_metrics()?;

    let state = AppState::initialize(config, metrics).await?;
    server::run(state).await?;

    Ok(())
}
