//! Configuration management with serde serialization/deserialization
//!
//! This module provides all configuration structures for the capture service,
//! including the HTTP listener settings, the URL allow-list, artifact cleanup
//! behavior, and the browser engine settings.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for the capture service
///
/// Controls the HTTP listener, the URL allow-list used to authorize capture
/// targets, CORS response headers, artifact cleanup, and the engine settings.
///
/// # Examples
///
/// ```rust
/// use screenshot_service::ServiceConfig;
///
/// // Use default configuration
/// let config = ServiceConfig::default();
///
/// // Create custom configuration
/// let config = ServiceConfig {
///     port: 8891,
///     whitelist: vec!["http://example.com/*".to_string()],
///     cleanup_runtime: true,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Address the HTTP listener binds to (default: "0.0.0.0")
    pub host: String,

    /// Port the HTTP listener binds to (default: 8891)
    pub port: u16,

    /// Allow-list of URL patterns that may be captured (default: empty)
    ///
    /// Patterns support `*` wildcards and `:name` segments, e.g.
    /// `"http://example.com/*"` or `"http(s)\\://:subdomain.example.com/*"`.
    /// An empty list authorizes nothing: every capture request is rejected
    /// until at least one pattern is configured.
    pub whitelist: Vec<String>,

    /// Attach permissive CORS headers to direct image responses (default: false)
    pub cors: bool,

    /// Delete the captured artifact after delivery completes (default: false)
    ///
    /// Applies to both direct responses and callback uploads. When false,
    /// artifacts accumulate under the storage directory and repeated requests
    /// for the same target reuse them.
    pub cleanup_runtime: bool,

    /// Directory captured artifacts are written to (default: system temp dir)
    pub storage_path: Option<PathBuf>,

    /// Browser engine settings
    pub engine: EngineSettings,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8891,
            whitelist: Vec::new(),
            cors: false,
            cleanup_runtime: false,
            storage_path: None,
            engine: EngineSettings::default(),
        }
    }
}

impl ServiceConfig {
    /// Resolve the directory artifacts are stored in.
    pub fn storage_dir(&self) -> PathBuf {
        self.storage_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("screenshot-service"))
    }

    /// Validate the configuration, returning the first problem found.
    pub fn validate(&self) -> Result<(), crate::error::CaptureError> {
        use crate::error::CaptureError;

        if self.port == 0 {
            return Err(CaptureError::ConfigurationError(
                "Port must be greater than 0".to_string(),
            ));
        }

        if self.engine.capture_timeout.as_secs() == 0 {
            return Err(CaptureError::ConfigurationError(
                "Capture timeout must be greater than 0".to_string(),
            ));
        }

        if self.engine.max_concurrent_captures == 0 {
            return Err(CaptureError::ConfigurationError(
                "Max concurrent captures must be greater than 0".to_string(),
            ));
        }

        if self.engine.default_width == 0 || self.engine.default_height == 0 {
            return Err(CaptureError::ConfigurationError(
                "Default viewport dimensions must be greater than 0".to_string(),
            ));
        }

        // Patterns are compiled again at startup; checking here surfaces bad
        // entries before the listener binds.
        crate::authorize::UrlAllowlist::compile(&self.whitelist)?;

        Ok(())
    }
}

/// Browser engine settings
///
/// # Examples
///
/// ```rust
/// use screenshot_service::EngineSettings;
/// use std::time::Duration;
///
/// let settings = EngineSettings {
///     capture_timeout: Duration::from_secs(60),
///     max_concurrent_captures: 4,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Backend used when a request does not name one (default: chromium)
    pub default_engine: EngineKind,

    /// Path to the Chromium executable (default: auto-detect)
    pub chromium_path: Option<String>,

    /// Path to the Chrome executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Timeout for a whole capture, from browser launch to artifact write
    /// (default: 30 seconds)
    pub capture_timeout: Duration,

    /// Maximum number of captures running at once (default: 8)
    ///
    /// Each capture launches its own browser process; this bound keeps the
    /// host from being overrun during request bursts.
    pub max_concurrent_captures: usize,

    /// Viewport width used when the request does not set one (default: 1024)
    pub default_width: u32,

    /// Viewport height used when the request does not set one (default: 768)
    pub default_height: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_engine: EngineKind::Chromium,
            chromium_path: None,
            chrome_path: None,
            capture_timeout: Duration::from_secs(30),
            max_concurrent_captures: 8,
            default_width: 1024,
            default_height: 768,
        }
    }
}

impl EngineSettings {
    /// Configured executable path for the given backend, if any.
    pub fn executable_for(&self, kind: EngineKind) -> Option<&str> {
        match kind {
            EngineKind::Chromium => self.chromium_path.as_deref(),
            EngineKind::Chrome => self.chrome_path.as_deref(),
        }
    }
}

/// Supported browser backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Chromium,
    Chrome,
}

impl Default for EngineKind {
    fn default() -> Self {
        Self::Chromium
    }
}

/// Supported artifact output formats
///
/// PNG and JPEG come straight from the browser screenshot, PDF from the
/// browser print pipeline, and GIF from a PNG capture converted after the
/// fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpg,
    Jpeg,
    Png,
    Pdf,
    Gif,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpg => "jpg",
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Png => "png",
            OutputFormat::Pdf => "pdf",
            OutputFormat::Gif => "gif",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Jpg | OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::Pdf => "application/pdf",
            OutputFormat::Gif => "image/gif",
        }
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Png
    }
}

/// Generate browser command-line arguments for one capture
///
/// Creates a set of Chrome/Chromium command-line arguments for headless
/// capture, sized to the requested viewport. Each call produces a unique
/// user data directory so concurrent browser processes never collide on
/// profile locks.
///
/// # Examples
///
/// ```rust
/// use screenshot_service::get_browser_args;
///
/// let args = get_browser_args(1024, 768, None, true);
/// assert!(args.contains(&"--headless".to_string()));
/// ```
pub fn get_browser_args(
    width: u32,
    height: u32,
    agent: Option<&str>,
    load_images: bool,
) -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), uuid::Uuid::new_v4());

    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--allow-running-insecure-content".to_string(),
        "--ignore-certificate-errors".to_string(),
        format!("--window-size={width},{height}"),
        format!("--user-data-dir=/tmp/screenshot-service-{unique_id}"),
    ];

    if !load_images {
        args.push("--blink-settings=imagesEnabled=false".to_string());
    }

    if let Some(agent) = agent {
        args.push(format!("--user-agent={agent}"));
    }

    args
}

pub fn create_browser_config(
    settings: &EngineSettings,
    kind: EngineKind,
    width: u32,
    height: u32,
    agent: Option<&str>,
    load_images: bool,
) -> chromiumoxide::browser::BrowserConfig {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(width, height)
        .args(get_browser_args(width, height, agent, load_images));

    if let Some(path) = settings.executable_for(kind) {
        builder = builder.chrome_executable(path);
    }

    builder
        .build()
        .unwrap_or_else(|_| BrowserConfig::with_executable("/usr/sbin/chromium"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.port, 8891);
        assert!(config.whitelist.is_empty());
        assert!(!config.cleanup_runtime);
        assert_eq!(config.engine.max_concurrent_captures, 8);
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let config = ServiceConfig {
            port: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = ServiceConfig::default();
        config.engine.capture_timeout = Duration::from_secs(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_pattern() {
        let config = ServiceConfig {
            whitelist: vec!["*".repeat(1_000_000)],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_defaults_with_patterns() {
        let config = ServiceConfig {
            whitelist: vec!["http://example.com/*".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_format_extension_and_mime() {
        assert_eq!(OutputFormat::Png.extension(), "png");
        assert_eq!(OutputFormat::Jpg.mime_type(), "image/jpeg");
        assert_eq!(OutputFormat::Pdf.mime_type(), "application/pdf");
    }

    #[test]
    fn test_browser_args_viewport_and_images() {
        let args = get_browser_args(800, 600, Some("test-agent"), false);
        assert!(args.contains(&"--window-size=800,600".to_string()));
        assert!(args.contains(&"--blink-settings=imagesEnabled=false".to_string()));
        assert!(args.contains(&"--user-agent=test-agent".to_string()));
    }

    #[test]
    fn test_executable_resolution() {
        let settings = EngineSettings {
            chromium_path: Some("/usr/bin/chromium".to_string()),
            ..Default::default()
        };
        assert_eq!(
            settings.executable_for(EngineKind::Chromium),
            Some("/usr/bin/chromium")
        );
        assert_eq!(settings.executable_for(EngineKind::Chrome), None);
    }
}
