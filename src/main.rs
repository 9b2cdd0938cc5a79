// src/main.rs

//! The main entry point for the EdgeCache server application.

use anyhow::Result;
use edgecache::config::{Config, LogFormat};
use edgecache::core::events::RollingWriter;
use edgecache::server;
use std::env;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("EdgeCache version {VERSION}");
        return Ok(());
    }

    // The configuration path comes from --config, defaulting to config.yaml.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.yaml");

    // The server cannot run without a valid configuration.
    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            std::process::exit(1);
        }
    };

    init_logging(&config)?;

    if let Err(e) = server::run(config).await {
        error!("Server runtime error: {}", e);
        return Err(e);
    }

    Ok(())
}

/// Sets up tracing with a console layer and an optional rotating file layer.
/// `RUST_LOG` overrides the configured level.
fn init_logging(config: &Config) -> Result<()> {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log.level.clone());
    let filter = EnvFilter::new(level);

    let registry = tracing_subscriber::registry().with(filter);

    let console_layer = if config.log.console.enabled {
        let layer = tracing_subscriber::fmt::layer().with_ansi(true);
        let layer = match config.log.console.format {
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Json => layer.json().boxed(),
        };
        Some(layer)
    } else {
        None
    };

    let file_layer = if config.log.file.enabled {
        let writer = RollingWriter::open(&config.log.file.path, config.log.file.rotation.clone())?;
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(move || writer.clone());
        let layer = match config.log.file.format {
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Json => layer.json().boxed(),
        };
        Some(layer)
    } else {
        None
    };

    registry.with(console_layer).with(file_layer).init();
    Ok(())
}
