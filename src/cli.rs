use crate::authorize::resolve_target;
use crate::config::{EngineKind, OutputFormat, ServiceConfig};
use crate::engine::{BrowserEngine, CaptureEngine};
use crate::error::CaptureError;
use crate::options::{CaptureOptions, RawCaptureRequest};
use crate::routes::{build_router, AppState};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tokio::signal;
use tracing::info;

#[derive(Parser)]
#[command(name = "screenshot-service")]
#[command(about = "Web page capture service with URL allow-listing")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Address to bind")]
    pub host: Option<String>,

    #[arg(short, long, help = "Port to listen on")]
    pub port: Option<u16>,

    #[arg(long = "whitelist", help = "Allowed URL pattern (repeatable)")]
    pub whitelist: Vec<String>,

    #[arg(long, help = "Send CORS headers with direct responses")]
    pub cors: bool,

    #[arg(long, help = "Delete artifacts after delivery")]
    pub cleanup: bool,

    #[arg(long, help = "Directory for capture artifacts")]
    pub storage: Option<PathBuf>,

    #[arg(long, help = "Capture timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, help = "Maximum concurrent captures")]
    pub max_concurrent: Option<usize>,

    #[arg(long, help = "Chromium executable path")]
    pub chromium_path: Option<String>,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the capture HTTP service
    Serve,

    /// Capture a single page to a local file
    Capture {
        #[arg(short, long, help = "URL to capture")]
        url: String,

        #[arg(short, long, help = "Output file path")]
        output: PathBuf,

        #[arg(long, help = "Output format (png, jpg, jpeg, pdf, gif)")]
        format: Option<String>,

        #[arg(long, help = "Capture engine (chromium, chrome)")]
        engine: Option<String>,

        #[arg(long, help = "Viewport width")]
        width: Option<u32>,

        #[arg(long, help = "Viewport height")]
        height: Option<u32>,

        #[arg(long, help = "Delay in milliseconds before capturing")]
        delay: Option<u64>,

        #[arg(long, help = "User agent header")]
        agent: Option<String>,

        #[arg(long, help = "Page zoom factor")]
        zoom: Option<f64>,

        #[arg(long, help = "Re-render even if a cached artifact exists")]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct SingleCaptureOptions {
    pub url: String,
    pub output: PathBuf,
    pub format: Option<String>,
    pub engine: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub delay: Option<u64>,
    pub agent: Option<String>,
    pub zoom: Option<f64>,
    pub force: bool,
}

pub struct CliRunner {
    pub config: ServiceConfig,
}

impl CliRunner {
    pub fn new(config: ServiceConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Serve => self.run_serve().await,
            Commands::Capture {
                url,
                output,
                format,
                engine,
                width,
                height,
                delay,
                agent,
                zoom,
                force,
            } => {
                self.run_capture(SingleCaptureOptions {
                    url,
                    output,
                    format,
                    engine,
                    width,
                    height,
                    delay,
                    agent,
                    zoom,
                    force,
                })
                .await
            }
            Commands::Validate { config } => self.validate_config(config).await,
        }
    }

    pub async fn run_serve(&self) -> anyhow::Result<()> {
        let exporter = crate::metrics::install_recorder()?;
        let engine = Arc::new(BrowserEngine::new(
            self.config.engine.clone(),
            self.config.storage_dir(),
        ));
        let state = AppState::new(self.config.clone(), engine, Some(exporter))?;
        let app = build_router(state);

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        info!("Listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Server stopped");
        Ok(())
    }

    /// One-off capture straight through the engine, no HTTP and no
    /// allow-list: the operator typed the URL themselves.
    pub async fn run_capture(&self, options: SingleCaptureOptions) -> anyhow::Result<()> {
        info!("Capturing: {}", options.url);

        let format = parse_format(options.format.as_deref())?;
        let engine_kind = parse_engine(options.engine.as_deref())?;

        let raw = RawCaptureRequest {
            url: Some(options.url),
            format,
            engine: engine_kind,
            width: options.width,
            height: options.height,
            delay: options.delay,
            agent: options.agent,
            zoom: options.zoom,
            force: options.force.then_some(true),
            ..Default::default()
        };
        if let Err(errors) = raw.validate() {
            return Err(CaptureError::InvalidOptions(errors).into());
        }
        let capture_options = CaptureOptions::from_raw(raw);
        let target = resolve_target(&capture_options.url);

        let engine = BrowserEngine::new(self.config.engine.clone(), self.config.storage_dir());
        let started = Instant::now();
        let artifact = engine.capture(&target.url, &capture_options).await?;

        if let Some(parent) = options.output.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&artifact, &options.output).await?;
        let size = fs::metadata(&options.output).await?.len();
        crate::delivery::cleanup_artifact(&artifact, self.config.cleanup_runtime).await;

        println!("Screenshot captured successfully:");
        println!("  URL: {}", target.url);
        println!("  Output: {}", options.output.display());
        println!(
            "  Format: {:?}",
            capture_options.format.unwrap_or_default()
        );
        println!("  Size: {size} bytes");
        println!("  Duration: {:?}", started.elapsed());

        Ok(())
    }

    pub async fn validate_config(&self, config_path: PathBuf) -> anyhow::Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let content = fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let config: ServiceConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;
        config.validate()?;

        println!("Configuration is valid:");
        println!("  Listen address: {}:{}", config.host, config.port);
        println!("  Whitelist patterns: {}", config.whitelist.len());
        println!("  CORS headers: {}", config.cors);
        println!("  Runtime cleanup: {}", config.cleanup_runtime);
        println!("  Storage: {}", config.storage_dir().display());
        println!("  Default engine: {:?}", config.engine.default_engine);
        println!("  Capture timeout: {:?}", config.engine.capture_timeout);
        println!(
            "  Max concurrent captures: {}",
            config.engine.max_concurrent_captures
        );
        println!(
            "  Default viewport: {}x{}",
            config.engine.default_width, config.engine.default_height
        );

        Ok(())
    }
}

fn parse_format(format: Option<&str>) -> anyhow::Result<Option<OutputFormat>> {
    Ok(match format {
        None => None,
        Some("png") => Some(OutputFormat::Png),
        Some("jpg") => Some(OutputFormat::Jpg),
        Some("jpeg") => Some(OutputFormat::Jpeg),
        Some("pdf") => Some(OutputFormat::Pdf),
        Some("gif") => Some(OutputFormat::Gif),
        Some(other) => anyhow::bail!("Unknown output format: {other}"),
    })
}

fn parse_engine(engine: Option<&str>) -> anyhow::Result<Option<EngineKind>> {
    Ok(match engine {
        None => None,
        Some("chromium") => Some(EngineKind::Chromium),
        Some("chrome") => Some(EngineKind::Chrome),
        Some(other) => anyhow::bail!("Unknown capture engine: {other}"),
    })
}

/// Resolves when SIGINT or SIGTERM arrives.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install SIGINT handler");
    };
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format_accepts_known_names() {
        assert_eq!(parse_format(Some("png")).unwrap(), Some(OutputFormat::Png));
        assert_eq!(parse_format(Some("pdf")).unwrap(), Some(OutputFormat::Pdf));
        assert_eq!(parse_format(None).unwrap(), None);
        assert!(parse_format(Some("bmp")).is_err());
    }

    #[test]
    fn test_parse_engine_accepts_known_names() {
        assert_eq!(
            parse_engine(Some("chromium")).unwrap(),
            Some(EngineKind::Chromium)
        );
        assert_eq!(
            parse_engine(Some("chrome")).unwrap(),
            Some(EngineKind::Chrome)
        );
        assert!(parse_engine(Some("firefox")).is_err());
    }

    #[test]
    fn test_cli_parses_serve_with_overrides() {
        let cli = Cli::parse_from([
            "screenshot-service",
            "--port",
            "9000",
            "--whitelist",
            "http://example.com/*",
            "--whitelist",
            "https://example.com/*",
            "--cors",
            "serve",
        ]);

        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.whitelist.len(), 2);
        assert!(cli.cors);
        assert!(matches!(cli.command, Commands::Serve));
    }

    #[test]
    fn test_cli_parses_capture_subcommand() {
        let cli = Cli::parse_from([
            "screenshot-service",
            "capture",
            "--url",
            "http://example.com",
            "--output",
            "/tmp/out.png",
            "--format",
            "png",
            "--force",
        ]);

        match cli.command {
            Commands::Capture {
                url,
                output,
                format,
                force,
                ..
            } => {
                assert_eq!(url, "http://example.com");
                assert_eq!(output, PathBuf::from("/tmp/out.png"));
                assert_eq!(format.as_deref(), Some("png"));
                assert!(force);
            }
            _ => panic!("expected capture subcommand"),
        }
    }
}
