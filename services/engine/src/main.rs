//! hostprov
//!
//! One broker command per process: read the input document, run the
//! operation against the provider and the store, print the JSON response on
//! stdout and exit with its code. Logs go to stderr.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hostprov_engine::cli::{self, Cli};
use hostprov_engine::config::{Config, ProviderConfig};
use hostprov_engine::provider::{SimulatedConfig, SimulatedProvider};
use hostprov_engine::{Engine, EngineError, Response, Store, SystemClock, TemplateCatalog};
use hostprov_reconcile::RequestStatus;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let response = match run(&cli).await {
        Ok(response) => response,
        Err(e) => Response::with_status(RequestStatus::Error, format!("{e:#}")),
    };

    match serde_json::to_string_pretty(&response) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("failed to encode response: {e}"),
    }
    std::process::exit(response.code);
}

async fn run(cli: &Cli) -> Result<Response> {
    let config = Config::from_env()?;
    let provider_config = ProviderConfig::load(&config.provider_config_path())?;

    let level = config
        .log_level
        .clone()
        .or_else(|| provider_config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    info!(
        command = cli.command.as_str(),
        provider = %config.provider_name,
        conf_dir = %config.conf_dir.display(),
        data_dir = %config.data_dir.display(),
        "Configuration loaded"
    );

    let templates = match TemplateCatalog::load(&config.templates_path()) {
        Ok(catalog) => catalog,
        Err(e) if cli.command.needs_templates() => {
            return Ok(Response::from_error(&EngineError::from(e)));
        }
        Err(e) => {
            warn!(error = %e, "Template catalog unavailable");
            TemplateCatalog::default()
        }
    };

    let clock = Arc::new(SystemClock);
    let state_file = provider_config.simulator_state_file.clone().unwrap_or_else(|| {
        config
            .data_dir
            .join(format!("{}-provider.json", config.provider_name))
    });
    let provider = SimulatedProvider::open(
        SimulatedConfig {
            auto_advance: true,
            state_file: Some(state_file),
            ..SimulatedConfig::default()
        },
        clock.clone(),
    )
    .context("failed to open provider")?;

    let store = Store::open(config.store_path()).context("failed to open store")?;

    let engine = Engine::new(Arc::new(provider), store, templates)
        .with_policy(provider_config.policy()?)
        .with_retry(provider_config.retry_policy()?)
        .with_max_parallel(config.max_parallel)
        .with_clock(clock);

    let raw_input = match cli.read_input() {
        Ok(raw) => raw,
        Err(e) => return Ok(Response::from_error(&e)),
    };

    Ok(cli::dispatch(&engine, cli.command, raw_input.as_deref()).await)
}
