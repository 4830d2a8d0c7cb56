//! Result delivery: direct responses, callback uploads, and cleanup
//!
//! A capture produces exactly one [`CaptureOutcome`]; exactly one delivery
//! strategy consumes it. `DirectDelivery` turns the outcome into the HTTP
//! response for the connection that asked for it, `CallbackDelivery` pushes
//! the artifact (or a failure notice) to a remote address after the caller
//! has already been acknowledged. Both finish by conditionally removing the
//! artifact, so disk usage is bounded when runtime cleanup is enabled.

use crate::error::CaptureError;
use crate::options::CaptureOptions;
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use futures::{Stream, StreamExt};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, warn};

/// The single completion signal of a dispatched capture.
pub type CaptureOutcome = Result<PathBuf, CaptureError>;

/// One-shot delivery of a capture outcome.
///
/// A strategy is consumed by delivery: whatever happens, there is exactly one
/// report per outcome, and the artifact's afterlife (cleanup) is the
/// strategy's responsibility.
#[async_trait]
pub trait DeliverOutcome {
    type Report;

    async fn deliver(self, outcome: CaptureOutcome) -> Self::Report;
}

pub fn capture_failure_message(url: &str) -> String {
    format!("Can not capture site screenshot: {url}")
}

pub fn callback_ack_message(callback: &str) -> String {
    format!("Screenshot will be sent to \"{callback}\" when processed")
}

pub fn error_body(text: &str) -> serde_json::Value {
    json!({ "error": text })
}

pub fn message_body(text: &str) -> serde_json::Value {
    json!({ "message": text })
}

/// Log the failure and close the request with a JSON error body.
pub fn send_error(message: &str) -> Response {
    error!("{}", message);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(error_body(message)),
    )
        .into_response()
}

/// Callback addresses may omit the scheme; plain HTTP is assumed.
pub fn fix_callback_url(url: &str) -> String {
    if url.contains("://") {
        url.to_string()
    } else {
        format!("http://{url}")
    }
}

/// Remove a delivered artifact when runtime cleanup is enabled.
///
/// Failures are logged and swallowed: by the time cleanup runs, the response
/// or upload is already on the wire and nothing useful can be done.
pub async fn cleanup_artifact(path: &Path, enabled: bool) {
    if !enabled {
        return;
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Deleted file: {}", path.display()),
        Err(e) => warn!("Failed to delete file {}: {}", path.display(), e),
    }
}

/// Deletes the artifact when dropped, however the delivery ended.
///
/// Attached to the response body stream so cleanup also runs when the client
/// disconnects mid-download.
struct CleanupGuard {
    path: Option<PathBuf>,
    enabled: bool,
}

impl CleanupGuard {
    fn new(path: PathBuf, enabled: bool) -> Self {
        Self {
            path: Some(path),
            enabled,
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        if let Some(path) = self.path.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        cleanup_artifact(&path, true).await;
                    });
                }
                Err(_) => match std::fs::remove_file(&path) {
                    Ok(()) => debug!("Deleted file: {}", path.display()),
                    Err(e) => warn!("Failed to delete file {}: {}", path.display(), e),
                },
            }
        }
    }
}

/// File stream feeding a direct response body, with cleanup on drop.
struct ArtifactStream {
    inner: ReaderStream<tokio::fs::File>,
    _cleanup: CleanupGuard,
}

impl Stream for ArtifactStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Err(e))) => {
                // The status line is long gone; all that is left is to log
                // and tear the connection down.
                error!("{}", CaptureError::SendFailed(e.to_string()));
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }
}

/// Streams the artifact back over the requesting connection.
pub struct DirectDelivery {
    options: CaptureOptions,
    cors: bool,
    cleanup: bool,
}

impl DirectDelivery {
    pub fn new(options: CaptureOptions, cors: bool, cleanup: bool) -> Self {
        Self {
            options,
            cors,
            cleanup,
        }
    }
}

#[async_trait]
impl DeliverOutcome for DirectDelivery {
    type Report = Response;

    async fn deliver(self, outcome: CaptureOutcome) -> Response {
        let path = match outcome {
            Ok(path) => path,
            Err(_) => {
                return send_error(&capture_failure_message(&self.options.url));
            }
        };

        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                cleanup_artifact(&path, self.cleanup).await;
                return send_error(&CaptureError::SendFailed(e.to_string()).to_string());
            }
        };

        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                cleanup_artifact(&path, self.cleanup).await;
                return send_error(&CaptureError::SendFailed(e.to_string()).to_string());
            }
        };

        let mime = self.options.format.unwrap_or_default().mime_type();
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(mime));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
        if self.cors {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            );
            headers.insert(
                header::ACCESS_CONTROL_EXPOSE_HEADERS,
                HeaderValue::from_static("Content-Type"),
            );
        }

        let stream = ArtifactStream {
            inner: ReaderStream::new(file),
            _cleanup: CleanupGuard::new(path, self.cleanup),
        };

        (StatusCode::OK, headers, Body::from_stream(stream)).into_response()
    }
}

/// What a callback delivery ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryReport {
    /// Artifact bytes were streamed to the callback address.
    Uploaded,
    /// A failure payload was posted instead of the artifact.
    FailureNotified,
    /// Not even the failure payload could be posted.
    NotificationFailed,
}

/// Uploads the artifact to the caller-supplied callback address.
pub struct CallbackDelivery {
    options: CaptureOptions,
    client: reqwest::Client,
    cleanup: bool,
}

impl CallbackDelivery {
    pub fn new(options: CaptureOptions, client: reqwest::Client, cleanup: bool) -> Self {
        Self {
            options,
            client,
            cleanup,
        }
    }

    async fn post_failure(&self, callback_url: &str, message: &str) -> DeliveryReport {
        error!("{}", message);
        match self
            .client
            .post(callback_url)
            .json(&error_body(message))
            .send()
            .await
        {
            Ok(_) => DeliveryReport::FailureNotified,
            Err(e) => {
                warn!("Failed to notify \"{}\": {}", callback_url, e);
                DeliveryReport::NotificationFailed
            }
        }
    }

    async fn upload(&self, callback_url: &str, path: &Path) -> DeliveryReport {
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                let message = CaptureError::SizeDetectionFailed(e.to_string()).to_string();
                let report = self.post_failure(callback_url, &message).await;
                cleanup_artifact(path, self.cleanup).await;
                return report;
            }
        };

        let file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) => {
                let message = CaptureError::ReadFailed(e.to_string()).to_string();
                let report = self.post_failure(callback_url, &message).await;
                cleanup_artifact(path, self.cleanup).await;
                return report;
            }
        };

        // Read errors mid-transfer race a one-shot failure notification
        // against the already-running upload; the upload itself then dies on
        // the truncated body.
        let notify_client = self.client.clone();
        let notify_url = callback_url.to_string();
        let stream = ReaderStream::new(file).map(move |chunk| match chunk {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                let message = CaptureError::ReadFailed(e.to_string()).to_string();
                error!("{}", message);
                let client = notify_client.clone();
                let url = notify_url.clone();
                tokio::spawn(async move {
                    let _ = client.post(&url).json(&error_body(&message)).send().await;
                });
                Err(e)
            }
        });

        let report = match self
            .client
            .post(callback_url)
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await
        {
            Ok(response) => {
                debug!(
                    "Uploaded artifact to \"{}\" ({} bytes, status {})",
                    callback_url,
                    size,
                    response.status()
                );
                DeliveryReport::Uploaded
            }
            Err(e) => {
                let message = CaptureError::UploadFailed(e.to_string()).to_string();
                self.post_failure(callback_url, &message).await
            }
        };

        cleanup_artifact(path, self.cleanup).await;
        report
    }
}

#[async_trait]
impl DeliverOutcome for CallbackDelivery {
    type Report = DeliveryReport;

    async fn deliver(self, outcome: CaptureOutcome) -> DeliveryReport {
        let callback_url =
            fix_callback_url(self.options.callback.as_deref().unwrap_or_default());

        match outcome {
            Err(_) => {
                self.post_failure(
                    &callback_url,
                    &capture_failure_message(&self.options.url),
                )
                .await
            }
            Ok(path) => self.upload(&callback_url, &path).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::RawCaptureRequest;
    use std::time::Duration;

    fn options_for(url: &str) -> CaptureOptions {
        CaptureOptions::from_raw(RawCaptureRequest {
            url: Some(url.to_string()),
            ..Default::default()
        })
    }

    async fn write_artifact(name: &str, contents: &[u8]) -> PathBuf {
        let dir = std::env::temp_dir().join("screenshot-service-tests");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join(name);
        tokio::fs::write(&path, contents).await.unwrap();
        path
    }

    #[test]
    fn test_fix_callback_url() {
        assert_eq!(
            fix_callback_url("http://example.com/hook"),
            "http://example.com/hook"
        );
        assert_eq!(
            fix_callback_url("https://example.com/hook"),
            "https://example.com/hook"
        );
        assert_eq!(
            fix_callback_url("example.com/hook"),
            "http://example.com/hook"
        );
        assert_eq!(fix_callback_url("127.0.0.1:9000"), "http://127.0.0.1:9000");
        // Scheme-less hosts that merely start with "http" still get the
        // prefix; addresses with an actual scheme are left alone.
        assert_eq!(
            fix_callback_url("httpbin.org/hook"),
            "http://httpbin.org/hook"
        );
        assert_eq!(
            fix_callback_url("ftp://files.example.com/hook"),
            "ftp://files.example.com/hook"
        );
    }

    #[test]
    fn test_message_templates() {
        assert_eq!(
            capture_failure_message("http://example.com"),
            "Can not capture site screenshot: http://example.com"
        );
        assert_eq!(
            callback_ack_message("http://callback.example.com"),
            "Screenshot will be sent to \"http://callback.example.com\" when processed"
        );
    }

    #[tokio::test]
    async fn test_direct_delivery_failure_is_json_error() {
        let delivery = DirectDelivery::new(options_for("http://example.com/page"), false, false);
        let response = delivery
            .deliver(Err(CaptureError::Timeout(Duration::from_secs(30))))
            .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            json["error"],
            "Can not capture site screenshot: http://example.com/page"
        );
    }

    #[tokio::test]
    async fn test_direct_delivery_missing_artifact_is_send_failure() {
        let delivery = DirectDelivery::new(options_for("http://example.com"), false, false);
        let missing = std::env::temp_dir().join("screenshot-service-tests/no-such-artifact.png");
        let response = delivery.deliver(Ok(missing)).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let message = json["error"].as_str().unwrap();
        assert!(message.starts_with("Error while sending image file: "));
    }

    #[tokio::test]
    async fn test_direct_delivery_streams_artifact() {
        let path = write_artifact("direct-ok.png", b"fake png bytes").await;
        let delivery = DirectDelivery::new(options_for("http://example.com"), false, false);
        let response = delivery.deliver(Ok(path.clone())).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/png"
        );
        assert_eq!(
            response.headers().get(header::CONTENT_LENGTH).unwrap(),
            &b"fake png bytes".len().to_string()
        );
        assert!(response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        assert_eq!(&body[..], b"fake png bytes");

        // Cleanup disabled: the artifact survives delivery.
        assert!(path.exists());
        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_direct_delivery_cors_headers() {
        let path = write_artifact("direct-cors.png", b"x").await;
        let delivery = DirectDelivery::new(options_for("http://example.com"), true, false);
        let response = delivery.deliver(Ok(path.clone())).await;

        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_EXPOSE_HEADERS)
                .unwrap(),
            "Content-Type"
        );
        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_direct_delivery_cleanup_after_stream() {
        let path = write_artifact("direct-cleanup.png", b"to be removed").await;
        let delivery = DirectDelivery::new(options_for("http://example.com"), false, true);
        let response = delivery.deliver(Ok(path.clone())).await;

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        assert_eq!(&body[..], b"to be removed");

        // The drop guard deletes on a spawned task; give it a beat.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_direct_delivery_cleanup_on_abandoned_response() {
        let path = write_artifact("direct-abandoned.png", b"abandoned").await;
        let delivery = DirectDelivery::new(options_for("http://example.com"), false, true);
        let response = delivery.deliver(Ok(path.clone())).await;

        // Client gone before reading the body.
        drop(response);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_callback_unreachable_address_still_cleans_up() {
        // Bind and immediately drop a listener so the port is known-closed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let path = write_artifact("callback-dead-port.png", b"never uploaded").await;
        let mut options = options_for("http://example.com");
        options.callback = Some(format!("http://{addr}/hook"));

        let delivery = CallbackDelivery::new(options, reqwest::Client::new(), true);
        let report = delivery.deliver(Ok(path.clone())).await;

        // The upload and the follow-up failure payload both fail to connect;
        // the artifact is removed regardless.
        assert_eq!(report, DeliveryReport::NotificationFailed);
        assert!(!path.exists());
    }
}
