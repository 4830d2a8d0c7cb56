use anyhow::Context;
use clap::Parser;
use screenshot_service::{setup_logging, Cli, CliRunner, ServiceConfig};
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting screenshot-service v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;
    let runner = CliRunner::new(config);

    if let Err(e) = runner.run(args.command).await {
        error!("{:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn load_config(args: &Cli) -> anyhow::Result<ServiceConfig> {
    let mut config = if let Some(config_path) = &args.config {
        let content = tokio::fs::read_to_string(config_path)
            .await
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?
    } else {
        ServiceConfig::default()
    };

    // CLI flags win over file values.
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if !args.whitelist.is_empty() {
        config.whitelist = args.whitelist.clone();
    }
    if args.cors {
        config.cors = true;
    }
    if args.cleanup {
        config.cleanup_runtime = true;
    }
    if let Some(storage) = &args.storage {
        config.storage_path = Some(storage.clone());
    }
    if let Some(timeout) = args.timeout {
        config.engine.capture_timeout = Duration::from_secs(timeout);
    }
    if let Some(max_concurrent) = args.max_concurrent {
        config.engine.max_concurrent_captures = max_concurrent;
    }
    if let Some(chromium_path) = &args.chromium_path {
        config.engine.chromium_path = Some(chromium_path.clone());
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.engine.chrome_path = Some(chrome_path.clone());
    }

    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Listen address: {}:{}", config.host, config.port);
    info!("Whitelist patterns: {}", config.whitelist.len());
    info!("Capture timeout: {:?}", config.engine.capture_timeout);
    info!(
        "Max concurrent captures: {}",
        config.engine.max_concurrent_captures
    );

    Ok(config)
}
