//! Capture engine: dispatching a target URL to a headless browser
//!
//! This module provides the `CaptureEngine` contract the request pipeline
//! dispatches to, and the shipped `BrowserEngine` implementation that drives
//! headless Chromium/Chrome over the DevTools protocol. A capture is a single
//! awaited operation with exactly one outcome: the path of the written
//! artifact, or the error that stopped it. There are no retries and no
//! partial results.

use crate::config::{create_browser_config, EngineSettings, OutputFormat};
use crate::error::CaptureError;
use crate::options::CaptureOptions;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetScriptExecutionDisabledParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, Headers, SetExtraHttpHeadersParams, TimeSinceEpoch,
};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, PrintToPdfParams, Viewport as ClipViewport,
};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One-shot capture contract.
///
/// Implementations render the target with the given options, write the
/// artifact somewhere durable, and hand back its path. The call is made once
/// per authorized request and its single `Result` is the only completion
/// signal delivery ever sees.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CaptureEngine: Send + Sync {
    async fn capture(
        &self,
        target: &str,
        options: &CaptureOptions,
    ) -> Result<PathBuf, CaptureError>;
}

/// Headless-browser capture engine
///
/// Launches one browser process per capture, bounded by a concurrency
/// semaphore, and caches artifacts by a fingerprint of the target and the
/// rendering options: a repeated request reuses the file on disk unless it
/// sets `force`.
///
/// # Examples
///
/// ```rust,no_run
/// use screenshot_service::{
///     BrowserEngine, CaptureEngine, CaptureOptions, EngineSettings, RawCaptureRequest,
/// };
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = BrowserEngine::new(EngineSettings::default(), std::env::temp_dir());
///     let options = CaptureOptions::from_raw(RawCaptureRequest {
///         url: Some("http://example.com".to_string()),
///         ..Default::default()
///     });
///     let artifact = engine.capture("http://example.com", &options).await?;
///     println!("captured to {}", artifact.display());
///     Ok(())
/// }
/// ```
pub struct BrowserEngine {
    settings: EngineSettings,
    storage_dir: PathBuf,
    limiter: Arc<Semaphore>,
}

impl BrowserEngine {
    pub fn new(settings: EngineSettings, storage_dir: PathBuf) -> Self {
        let limiter = Arc::new(Semaphore::new(settings.max_concurrent_captures));
        Self {
            settings,
            storage_dir,
            limiter,
        }
    }

    /// Path the artifact for this target/options pair lives at.
    ///
    /// The name is a UUIDv5 over the capture fingerprint, so the same target
    /// with the same rendering options always maps to the same file.
    pub fn artifact_path(
        &self,
        target: &str,
        options: &CaptureOptions,
    ) -> Result<PathBuf, CaptureError> {
        let fingerprint = options.fingerprint(target)?;
        let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, fingerprint.as_bytes());
        let format = options.format.unwrap_or_default();
        Ok(self
            .storage_dir
            .join(format!("{}.{}", id, format.extension())))
    }

    async fn render(
        &self,
        target: &str,
        options: &CaptureOptions,
        path: &Path,
    ) -> Result<(), CaptureError> {
        let kind = options.engine.unwrap_or(self.settings.default_engine);
        let width = options.width.unwrap_or(self.settings.default_width);
        let height = options.height.unwrap_or(self.settings.default_height);
        let load_images = options.images.unwrap_or(true);

        let browser_config = create_browser_config(
            &self.settings,
            kind,
            width,
            height,
            options.agent.as_deref(),
            load_images,
        );

        let (mut browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| CaptureError::BrowserLaunchFailed(e.to_string()))?;

        // The handler drives DevTools protocol traffic and must be polled for
        // the lifetime of the browser.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {}", e);
                    break;
                }
            }
        });

        let result = self
            .render_page(&browser, target, options, width, height, path)
            .await;

        let _ = browser.close().await;
        handler_task.abort();

        result
    }

    async fn render_page(
        &self,
        browser: &Browser,
        target: &str,
        options: &CaptureOptions,
        width: u32,
        height: u32,
        path: &Path,
    ) -> Result<(), CaptureError> {
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| CaptureError::PageError(e.to_string()))?;

        self.apply_page_setup(&page, target, options, width, height)
            .await?;

        let nav_target = ensure_scheme(target);
        page.goto(nav_target.as_str())
            .await
            .map_err(|e| CaptureError::PageError(e.to_string()))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| CaptureError::PageError(e.to_string()))?;

        if let Some(delay) = options.delay {
            sleep(Duration::from_millis(delay)).await;
        }

        let bytes = self.produce_artifact(&page, options).await?;
        tokio::fs::write(path, &bytes).await?;

        let _ = page.close().await;
        Ok(())
    }

    async fn apply_page_setup(
        &self,
        page: &Page,
        target: &str,
        options: &CaptureOptions,
        width: u32,
        height: u32,
    ) -> Result<(), CaptureError> {
        let mut emulation_builder = SetDeviceMetricsOverrideParams::builder()
            .width(width)
            .height(height)
            .device_scale_factor(1.0)
            .mobile(false);
        if let Some(zoom) = options.zoom {
            emulation_builder = emulation_builder.scale(zoom);
        }
        let emulation_params = emulation_builder
            .build()
            .map_err(|e| CaptureError::PageError(e.to_string()))?;
        page.execute(emulation_params)
            .await
            .map_err(|e| CaptureError::PageError(e.to_string()))?;

        if options.js == Some(false) {
            let params = SetScriptExecutionDisabledParams::builder()
                .value(true)
                .build()
                .map_err(|e| CaptureError::PageError(e.to_string()))?;
            page.execute(params)
                .await
                .map_err(|e| CaptureError::PageError(e.to_string()))?;
        }

        if let Some(headers) = build_header_map(options) {
            let params = SetExtraHttpHeadersParams::builder()
                .headers(Headers::new(headers))
                .build()
                .map_err(|e| CaptureError::PageError(e.to_string()))?;
            page.execute(params)
                .await
                .map_err(|e| CaptureError::PageError(e.to_string()))?;
        }

        if let Some(cookies) = &options.cookies {
            if !cookies.is_empty() {
                let params = build_cookie_params(cookies, target)?;
                page.set_cookies(params)
                    .await
                    .map_err(|e| CaptureError::PageError(e.to_string()))?;
            }
        }

        Ok(())
    }

    async fn produce_artifact(
        &self,
        page: &Page,
        options: &CaptureOptions,
    ) -> Result<Vec<u8>, CaptureError> {
        let format = options.format.unwrap_or_default();

        match format {
            OutputFormat::Pdf => page
                .pdf(PrintToPdfParams::default())
                .await
                .map_err(|e| CaptureError::RenderFailed(e.to_string())),
            OutputFormat::Png => {
                self.screenshot(page, options, CaptureScreenshotFormat::Png, None)
                    .await
            }
            OutputFormat::Jpg | OutputFormat::Jpeg => {
                let quality = options
                    .quality
                    .map(|q| (q * 100.0).round() as i64)
                    .unwrap_or(75);
                self.screenshot(
                    page,
                    options,
                    CaptureScreenshotFormat::Jpeg,
                    Some(quality),
                )
                .await
            }
            OutputFormat::Gif => {
                let png = self
                    .screenshot(page, options, CaptureScreenshotFormat::Png, None)
                    .await?;
                convert_to_gif(png)
            }
        }
    }

    async fn screenshot(
        &self,
        page: &Page,
        options: &CaptureOptions,
        format: CaptureScreenshotFormat,
        quality: Option<i64>,
    ) -> Result<Vec<u8>, CaptureError> {
        let mut builder = ScreenshotParams::builder().format(format);

        if let Some(quality) = quality {
            builder = builder.quality(quality);
        }

        if let Some(clip) = options.clip_rect {
            builder = builder.clip(ClipViewport {
                x: clip.left as f64,
                y: clip.top as f64,
                width: clip.width as f64,
                height: clip.height as f64,
                scale: 1.0,
            });
        }

        page.screenshot(builder.build())
            .await
            .map_err(|e| CaptureError::RenderFailed(e.to_string()))
    }
}

#[async_trait]
impl CaptureEngine for BrowserEngine {
    async fn capture(
        &self,
        target: &str,
        options: &CaptureOptions,
    ) -> Result<PathBuf, CaptureError> {
        tokio::fs::create_dir_all(&self.storage_dir).await?;
        let path = self.artifact_path(target, options)?;

        let force = options.force.unwrap_or(false);
        if !force && tokio::fs::metadata(&path).await.is_ok() {
            debug!("Reusing cached artifact for {}: {}", target, path.display());
            metrics::increment_counter!("capture_cache_hits_total");
            return Ok(path);
        }

        let _permit = self.limiter.acquire().await?;

        let started = Instant::now();
        let result = match timeout(
            self.settings.capture_timeout,
            self.render(target, options, &path),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CaptureError::Timeout(self.settings.capture_timeout)),
        };

        match result {
            Ok(()) => {
                info!(
                    "Captured {} in {:?} -> {}",
                    target,
                    started.elapsed(),
                    path.display()
                );
                Ok(path)
            }
            Err(e) => {
                warn!("Capture of {} failed after {:?}: {}", target, started.elapsed(), e);
                Err(e)
            }
        }
    }
}

/// Targets without a scheme are navigated over plain HTTP.
fn ensure_scheme(target: &str) -> String {
    match url::Url::parse(target) {
        Ok(_) => target.to_string(),
        Err(_) => format!("http://{target}"),
    }
}

fn build_header_map(options: &CaptureOptions) -> Option<serde_json::Value> {
    let mut map = serde_json::Map::new();

    if let Some(headers) = &options.headers {
        for (name, value) in headers {
            map.insert(name.clone(), serde_json::Value::String(value.clone()));
        }
    }

    if let (Some(user), Some(password)) = (&options.user, &options.password) {
        let token = STANDARD.encode(format!("{user}:{password}"));
        map.insert(
            "Authorization".to_string(),
            serde_json::Value::String(format!("Basic {token}")),
        );
    }

    if map.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(map))
    }
}

fn build_cookie_params(
    cookies: &[crate::options::CookieSpec],
    target: &str,
) -> Result<Vec<CookieParam>, CaptureError> {
    let mut params = Vec::with_capacity(cookies.len());

    for cookie in cookies {
        let mut builder = CookieParam::builder()
            .name(cookie.name.clone())
            .value(cookie.value.clone());

        match &cookie.domain {
            Some(domain) => builder = builder.domain(domain.clone()),
            // Without an explicit domain the browser derives scope from the
            // target URL.
            None => builder = builder.url(ensure_scheme(target)),
        }

        if let Some(path) = &cookie.path {
            builder = builder.path(path.clone());
        }
        if let Some(httponly) = cookie.httponly {
            builder = builder.http_only(httponly);
        }
        if let Some(secure) = cookie.secure {
            builder = builder.secure(secure);
        }
        if let Some(expires) = cookie.expires.as_deref().and_then(parse_expires) {
            builder = builder.expires(TimeSinceEpoch::new(expires));
        }

        params.push(
            builder
                .build()
                .map_err(|e| CaptureError::PageError(e.to_string()))?,
        );
    }

    Ok(params)
}

/// Cookie expiry: epoch seconds, RFC 3339, or RFC 2822.
fn parse_expires(raw: &str) -> Option<f64> {
    if let Ok(seconds) = raw.parse::<f64>() {
        return seconds.is_finite().then_some(seconds);
    }
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.timestamp() as f64);
    }
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc2822(raw) {
        return Some(parsed.timestamp() as f64);
    }
    None
}

fn convert_to_gif(png: Vec<u8>) -> Result<Vec<u8>, CaptureError> {
    let img = image::load_from_memory(&png)
        .map_err(|e| CaptureError::RenderFailed(e.to_string()))?;

    let mut gif = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut gif), image::ImageFormat::Gif)
        .map_err(|e| CaptureError::RenderFailed(e.to_string()))?;

    Ok(gif)
}
