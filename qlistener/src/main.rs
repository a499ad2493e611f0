use clap::Parser;
use log::{error, info, warn};
use qlistener::{AppConfig, Service, ServiceError};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal::unix::{SignalKind, signal};

/// Subscription lifecycle queue listener.
#[derive(Debug, Parser)]
#[command(name = "qlistener", version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("Loaded configuration: {:?}", config);

    if let Err(e) = run(config).await {
        error!("{}", e);
    }
    // shutdown always reports a non-zero status
    ExitCode::FAILURE
}

async fn run(config: AppConfig) -> Result<(), ServiceError> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    let mut service = Service::init(config).await?;
    service.start_consumers().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading caches");
                if let Err(e) = service.reload_all().await {
                    warn!("Cache reload failed, keeping the previous entries: {}", e);
                }
            }
            _ = service.failed() => {
                error!("A consumer failed, shutting down");
                break;
            }
        }
    }

    service.shutdown().await
}
