//! CLI runner - executes commands
//!
//! Protocol output (spec, check status, catalog, read messages) goes to
//! stdout as JSON lines; human logs go to the tracing subscriber on stderr.

use crate::cli::commands::{Cli, Commands};
use crate::config::{spec_document, Catalog, ConfiguredCatalog, ConnectorConfig};
use crate::controller::Controller;
use crate::driver::SyncDriver;
use crate::error::{Error, Result};
use crate::http::KlaviyoClient;
use crate::streams::build_streams;
use futures::StreamExt;
use serde_json::{json, Value};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::error;

/// CLI runner
pub struct Runner {
    cli: Cli,
}

impl Runner {
    pub fn new(cli: Cli) -> Self {
        Self { cli }
    }

    /// Run the CLI command
    pub async fn run(&self) -> Result<()> {
        match &self.cli.command {
            Commands::Spec => {
                emit(&spec_document());
                Ok(())
            }
            Commands::Check { config } => {
                let config = load_config(config)?;
                init_logging(config.debug);
                self.check(&config).await
            }
            Commands::Discover { config } => {
                let config = load_config(config)?;
                init_logging(config.debug);
                self.discover(&config)
            }
            Commands::Read {
                config,
                catalog,
                state,
            } => {
                let config = load_config(config)?;
                init_logging(config.debug);
                let catalog = ConfiguredCatalog::from_value(load_json(catalog)?)?;
                let state = state.as_deref().map(load_json).transpose()?;
                self.read(config, catalog, state).await
            }
        }
    }

    async fn check(&self, config: &ConnectorConfig) -> Result<()> {
        let client = KlaviyoClient::new(config)?;
        match client.check(&Controller::new()).await {
            Ok(()) => emit(&json!({"status": "SUCCEEDED"})),
            Err(e) => {
                error!("connection check failed: {e}");
                emit(&json!({"status": "FAILED", "message": e.to_string()}));
            }
        }
        Ok(())
    }

    fn discover(&self, config: &ConnectorConfig) -> Result<()> {
        let client = Arc::new(KlaviyoClient::new(config)?);
        let streams = build_streams(config, client);
        let catalog = Catalog {
            streams: streams.iter().map(|s| s.catalog_entry()).collect(),
        };
        emit(&serde_json::to_value(&catalog)?);
        Ok(())
    }

    async fn read(
        &self,
        config: ConnectorConfig,
        catalog: ConfiguredCatalog,
        state: Option<Value>,
    ) -> Result<()> {
        let client = Arc::new(KlaviyoClient::new(&config)?);
        let streams = build_streams(&config, client);
        let driver = SyncDriver::new(config, streams);

        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let mut messages = driver.read(catalog, state);
        while let Some(item) = messages.next().await {
            match item {
                Ok(message) => {
                    writeln!(out, "{}", message.to_line())?;
                }
                Err(e) => {
                    out.flush()?;
                    error!("sync failed: {e}");
                    return Err(e);
                }
            }
        }
        out.flush()?;
        Ok(())
    }
}

/// Print one JSON document on its own stdout line
fn emit(value: &Value) {
    println!("{value}");
}

fn load_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("Failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| Error::config(format!("Invalid JSON in {}: {e}", path.display())))
}

fn load_config(path: &Path) -> Result<ConnectorConfig> {
    ConnectorConfig::from_value(load_json(path)?)
}

/// Initialize the stderr tracing subscriber; `debug` raises the level
fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
