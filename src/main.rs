mod capture;
mod clock;
mod config;
mod control;
mod coordinator;
mod liveness;
mod report;
mod sample;
mod schedule;
mod signals;
mod throttle;
mod watchdog;
mod worker;

use capture::{CaptureSink, LogSink, WebhookSink};
use clap::Parser;
use config::FileSettings;
use control::SupervisorControl;
use coordinator::HttpCoordinator;
use std::path::PathBuf;
use watchdog::{Collaborators, WatchdogService};
use worker::HttpWorkerClient;

/// Keeps the measurement agent worker alive: checks that it is online,
/// supervised, running and making progress, and starts, restarts or
/// reboots when it is not.
#[derive(Parser, Debug)]
#[command(name = "packy-watchdog", version, about)]
pub struct Cli {
    /// Config file path (re-read every check)
    #[arg(short, long, default_value = "watchdog.toml")]
    config: PathBuf,

    /// Debug logging (every resolution step)
    #[arg(short, long)]
    verbose: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Run a single check iteration and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "packy_watchdog=debug,capture=info"
    } else {
        "packy_watchdog=info,capture=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let provider = FileSettings::new(&cli.config);
    // Endpoints are fixed for the life of the process; periods and state
    // flags are picked up from the file on every iteration
    let settings = config::load_settings(provider.path())?;

    if cli.dry_run {
        println!("Config file: {}", cli.config.display());
        println!("{settings:#?}");
        return Ok(());
    }

    let sink: Box<dyn CaptureSink> = match &settings.capture.webhook_url {
        Some(url) => Box::new(WebhookSink::new(url.as_str())?),
        None => Box::new(LogSink),
    };

    let mut service = WatchdogService::new(Collaborators {
        coordinator: Box::new(HttpCoordinator::new(
            settings.coordinator.url.as_str(),
            settings.coordinator.token.clone(),
            settings.coordinator.timeout_secs,
        )?),
        control: Box::new(SupervisorControl::new(&settings.control)),
        worker: Box::new(HttpWorkerClient::new(
            settings.worker.status_url.as_str(),
            settings.worker.http_timeout_secs,
        )?),
        settings: Box::new(provider),
        sink,
        clock: Box::new(clock::SystemClock),
    });

    if cli.once {
        service.run_once().await?;
        return Ok(());
    }

    signals::install(service.stop_handle())?;
    service.run().await;
    Ok(())
}
