use std::{path::PathBuf, time::Duration};

use ::tracing::{error, info_span};
use anyhow::{anyhow, Result};
use clap::Parser;
use service::Service;

mod config;
mod files;
mod http_objects;
mod middleware;
mod notifications;
mod routes;
mod service;
mod tracing;
mod uploads;
mod utils;
use tracing::setup_tracing;

#[cfg(test)]
mod integration_test;
#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> Result<config::ServerConfig> {
    match &cli.config {
        Some(path) => {
            let path = path
                .to_str()
                .ok_or_else(|| anyhow!("config path is not valid UTF-8: {:?}", path))?;
            config::ServerConfig::from_path(path)
        }
        None => config::ServerConfig::from_env(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error loading config: {:?}", err);
            std::process::exit(1);
        }
    };

    let tracing_provider = match setup_tracing(&config) {
        Ok(provider) => provider,
        Err(err) => {
            eprintln!("Error setting up tracing: {:?}", err);
            std::process::exit(1);
        }
    };

    let meter_provider = match metrics::init_provider(
        config.telemetry.enable_metrics,
        config.telemetry.endpoint.as_ref(),
        Duration::from_secs(config.telemetry.metrics_interval_secs),
        Some(&config.instance_id),
        env!("CARGO_PKG_VERSION"),
    ) {
        Ok(provider) => provider,
        Err(err) => {
            error!("Error setting up metrics: {:?}", err);
            None
        }
    };

    let root_span = info_span!(
        "upload-server",
        env = %config.env,
        "upload-server-instance" = %config.instance_id
    );
    let _guard = root_span.enter();

    match Service::new(config).await {
        Ok(service) => {
            if let Err(err) = service.start().await {
                error!("Error starting service: {:?}", err);
            }
        }
        Err(err) => error!("Error creating service: {:?}", err),
    }

    // export metrics and traces before shutdown
    if let Some(meter_provider) = meter_provider {
        if let Err(err) = meter_provider.shutdown() {
            error!("Error shutting down meter provider: {:?}", err);
        }
    }
    if let Some(tracer_provider) = tracing_provider {
        if let Err(err) = tracer_provider.force_flush() {
            error!("Error flushing traces: {:?}", err);
        }
        if let Err(err) = tracer_provider.shutdown() {
            error!("Error shutting down tracer provider: {:?}", err);
        }
    }
}
