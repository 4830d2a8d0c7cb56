//! # Screenshot Service
//!
//! An HTTP service that captures web pages with a headless browser and hands
//! the result back as an image or PDF. Requests are validated, checked
//! against a URL allow-list, rendered by a capture engine, and delivered
//! either directly in the HTTP response or by streaming the artifact to a
//! caller-supplied callback address.
//!
//! ## Features
//!
//! - **Option normalization**: one canonical option set shared by the HTTP
//!   endpoint and the CLI, with collected (not fail-fast) validation errors
//! - **URL allow-listing**: wildcard patterns with base64 decode-detection,
//!   so wrapped URLs are authorized and captured in their decoded form
//! - **Artifact caching**: identical capture requests reuse the file on disk
//!   unless `force` is set
//! - **Two delivery modes**: stream the artifact in the response, or
//!   acknowledge immediately and upload to a callback URL in the background
//! - **Bounded concurrency**: a semaphore caps simultaneous browser launches
//! - **Observability**: Prometheus metrics, a JSON health endpoint, and
//!   request-level tracing
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use screenshot_service::{build_router, AppState, BrowserEngine, ServiceConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = ServiceConfig::default();
//!     config.whitelist = vec!["http://example.com/*".to_string()];
//!
//!     let engine = Arc::new(BrowserEngine::new(config.engine.clone(), config.storage_dir()));
//!     let app = build_router(AppState::new(config, engine, None)?);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8891").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ### Run the service
//! ```bash
//! screenshot-service --port 8891 --whitelist 'http://example.com/*' serve
//! ```
//!
//! ### One-off capture
//! ```bash
//! screenshot-service capture --url http://example.com --output page.png
//! ```
//!
//! ## HTTP Usage
//!
//! ```bash
//! # Image in the response
//! curl 'http://localhost:8891/?url=http%3A%2F%2Fexample.com&format=jpg' -o page.jpg
//!
//! # Acknowledge now, upload to the callback when rendered
//! curl -X POST http://localhost:8891/ \
//!     -H 'Content-Type: application/json' \
//!     -d '{"url": "http://example.com", "callback": "http://hooks.local/done"}'
//! ```

/// Service configuration and engine settings
pub mod config;

/// Error types and classification
pub mod error;

/// Capture request validation and option normalization
pub mod options;

/// URL allow-list authorization with base64 decode-detection
pub mod authorize;

/// Capture engines rendering pages into artifacts
pub mod engine;

/// Delivery strategies and artifact cleanup
pub mod delivery;

/// HTTP surface: capture endpoint, health, metrics
pub mod routes;

/// Command-line interface implementation
pub mod cli;

/// Service metrics and health reporting
pub mod metrics;


pub use authorize::*;
pub use cli::*;
pub use config::*;
pub use delivery::*;
pub use engine::*;
pub use error::*;
pub use options::*;
pub use routes::*;
pub use self::metrics::*;
