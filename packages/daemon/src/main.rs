// CLI entry point for the codegraph daemon.

use anyhow::Context;
use clap::Parser;
use codegraph_core::cli::{self, Cli};
use codegraph_core::config::CoreConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Exit code for an interrupted run, per convention.
const EXIT_INTERRUPTED: i32 = 130;

fn init_logging(config: &CoreConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn", config.logging.level)));

    if config.logging.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config_path = CoreConfig::resolve_path(cli.config.as_deref());
    let config = match CoreConfig::from_yaml(&config_path)
        .with_context(|| format!("loading configuration from {config_path}"))
    {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    };

    init_logging(&config);

    // The supervisor installs its own signal handling; one-shot commands
    // get interrupted here instead.
    let exit_code = if cli.is_daemon() {
        match cli::run(cli, config).await {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("error: {e:#}");
                1
            }
        }
    } else {
        tokio::select! {
            result = cli::run(cli, config) => match result {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("error: {e:#}");
                    1
                }
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("interrupted");
                EXIT_INTERRUPTED
            }
        }
    };

    std::process::exit(exit_code);
}
