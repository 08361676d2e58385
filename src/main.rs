// src/main.rs

use anyhow::Context;
use clap::Parser;
use keypool_proxy::cli::{Cli, Commands};
use keypool_proxy::config::load_config;
use keypool_proxy::pool::preview_key;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!(signal = "Ctrl+C", "Received signal. Initiating graceful shutdown...") },
        () = terminate => { info!(signal = "Terminate", "Received signal. Initiating graceful shutdown...") },
    }
}

fn init_tracing(json_logs: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json_logs {
        registry
            .with(fmt::layer().json().with_current_span(true).with_span_list(true))
            .init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config_path = cli.config_path();
    if !config_path.exists() {
        warn!(config.path = %config_path.display(), "Configuration file not found. Using defaults and environment variables.");
    }
    let mut config = load_config(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    match cli.command() {
        Commands::CheckConfig => {
            info!(
                keys = config.api_keys.len(),
                upstream = %config.upstream.base_url,
                default_strategy = config.strategy.default.label(),
                "Configuration is valid"
            );
            let mut shown = config.clone();
            shown.api_keys = shown.api_keys.iter().map(|k| preview_key(k)).collect();
            if shown.server.admin_token.is_some() {
                shown.server.admin_token = Some("****".to_string());
            }
            println!("{}", serde_yaml::to_string(&shown).context("failed to render configuration")?);
            Ok(())
        }
        Commands::Serve => {
            info!("Starting keypool-proxy...");
            keypool_proxy::run(config, shutdown_signal())
                .await
                .context("server terminated with an error")
        }
    }
}
