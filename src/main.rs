use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::io::AsyncReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cmdgate::api::{self, AppState};
use cmdgate::cli::{Cli, Commands};
use cmdgate::hook;
use cmdgate::notification::Notifier;
use cmdgate::rules;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Diagnostics always go to stderr: in hook mode stdout carries
    // exactly one decision JSON and nothing else.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cmdgate=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Cli::parse();

    match args.command {
        None | Some(Commands::Hook) => run_hook().await,
        Some(Commands::Serve { port }) => run_server(port).await,
        Some(Commands::Check { command }) => run_check(&command.join(" ")),
        Some(Commands::Test) => run_test().await,
        Some(Commands::Probe) => run_probe().await,
    }
}

async fn run_hook() -> anyhow::Result<()> {
    let mut input = String::new();
    if let Err(e) = tokio::io::stdin().read_to_string(&mut input).await {
        tracing::error!("failed to read hook input: {e}");
        input.clear();
    }

    let decision = hook::run(&input).await;
    println!("{}", serde_json::to_string(&decision)?);
    Ok(())
}

async fn run_server(port: u16) -> anyhow::Result<()> {
    let state = Arc::new(AppState::from_env()?);

    if let Some(store) = &state.store {
        cmdgate::jobs::cleanup::spawn(store.clone());
        tracing::info!("cleanup job started (hourly retention sweep)");
    }

    let app = api::api_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("cmdgate webhook server listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}

fn run_check(command: &str) -> anyhow::Result<()> {
    let config = cmdgate::config::load().unwrap_or_default();
    let classification = rules::classify(
        command,
        &config.rules.custom_patterns,
        &config.rules.whitelist,
    );
    println!("{}", serde_json::to_string_pretty(&classification)?);
    Ok(())
}

async fn run_test() -> anyhow::Result<()> {
    let config = cmdgate::config::load()?;
    let notifier = Notifier::from_config(&config.messenger)?;
    notifier.send_test().await?;
    println!("Test message sent via {}.", notifier.channel_name());
    Ok(())
}

async fn run_probe() -> anyhow::Result<()> {
    let config = cmdgate::config::load()?;
    let notifier = Notifier::from_config(&config.messenger)?;
    let handle = notifier.probe_connection().await?;
    println!("{} credentials OK: {handle}", notifier.channel_name());
    Ok(())
}
