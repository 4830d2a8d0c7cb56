//! HTTP surface: capture endpoint, health, and metrics
//!
//! The capture endpoint accepts the same option set as a query string (GET)
//! or a JSON body (POST) and walks every request through the same pipeline:
//! validate the raw options, authorize the target against the allow-list,
//! dispatch the capture engine, then hand the outcome to whichever delivery
//! strategy the request selected.

use crate::authorize::{authorize, UrlAllowlist};
use crate::config::ServiceConfig;
use crate::delivery::{
    callback_ack_message, message_body, send_error, CallbackDelivery, DeliverOutcome,
    DeliveryReport, DirectDelivery,
};
use crate::engine::CaptureEngine;
use crate::metrics::{HealthReport, Metrics, ServiceHealth};
use crate::options::{CaptureOptions, RawCaptureRequest};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::error::CaptureError;

/// Everything a request handler needs, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub allowlist: Arc<UrlAllowlist>,
    pub engine: Arc<dyn CaptureEngine>,
    pub client: reqwest::Client,
    pub metrics: Arc<Metrics>,
    pub health: Arc<ServiceHealth>,
    pub exporter: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        config: ServiceConfig,
        engine: Arc<dyn CaptureEngine>,
        exporter: Option<PrometheusHandle>,
    ) -> Result<Self, CaptureError> {
        let allowlist = UrlAllowlist::compile(&config.whitelist)?;
        if allowlist.is_empty() {
            warn!("URL whitelist is empty; every capture request will be refused");
        }
        let health = ServiceHealth::new(config.storage_dir());

        Ok(Self {
            allowlist: Arc::new(allowlist),
            engine,
            client: reqwest::Client::new(),
            metrics: Arc::new(Metrics::new()),
            health: Arc::new(health),
            exporter,
            config: Arc::new(config),
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(capture_get).post(capture_post))
        .route("/health", get(health_endpoint))
        .route("/metrics", get(metrics_endpoint))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Validation failures answer 200 with the collected messages, so callers
/// polling the endpoint from scripts get a JSON body they can inspect.
fn validation_response(errors: Vec<String>) -> Response {
    (StatusCode::OK, Json(json!({ "error": errors }))).into_response()
}

async fn capture_get(
    State(state): State<AppState>,
    query: Result<Query<RawCaptureRequest>, QueryRejection>,
) -> Response {
    let raw = match query {
        Ok(Query(raw)) => raw,
        Err(rejection) => {
            state.metrics.record_rejected();
            return validation_response(vec![rejection.body_text()]);
        }
    };
    handle_capture(state, raw).await
}

async fn capture_post(
    State(state): State<AppState>,
    body: Result<Json<RawCaptureRequest>, JsonRejection>,
) -> Response {
    let raw = match body {
        Ok(Json(raw)) => raw,
        Err(rejection) => {
            state.metrics.record_rejected();
            return validation_response(vec![rejection.body_text()]);
        }
    };
    handle_capture(state, raw).await
}

/// Balances the in-flight gauge even when the request future is dropped by a
/// client disconnect.
struct InFlightRequest(Arc<Metrics>);

impl Drop for InFlightRequest {
    fn drop(&mut self) {
        self.0.request_finished();
    }
}

async fn handle_capture(state: AppState, raw: RawCaptureRequest) -> Response {
    state.health.record_request();
    state.metrics.request_started();
    let _in_flight = InFlightRequest(state.metrics.clone());
    process_capture(&state, raw).await
}

async fn process_capture(state: &AppState, raw: RawCaptureRequest) -> Response {
    if let Err(errors) = raw.validate() {
        state.metrics.record_rejected();
        return validation_response(errors);
    }

    let options = CaptureOptions::from_raw(raw);

    // The authorization subject is also the navigation target: when the url
    // arrived base64-wrapped, the decoded form is what gets captured.
    let target = match authorize(&state.allowlist, &options.url) {
        Ok(target) => target,
        Err(e) => {
            state.metrics.record_rejected();
            return send_error(&e.to_string());
        }
    };

    match options.callback.clone() {
        Some(callback) => {
            debug!("Streaming image (\"{}\") to \"{}\"", target.url, callback);
            acknowledge_and_dispatch(state, options, target.url, callback)
        }
        None => {
            debug!("Sending image (\"{}\") in response", target.url);
            capture_and_respond(state, options, target.url).await
        }
    }
}

/// Callback mode: acknowledge right away, then capture and upload on a
/// detached task. The requester never waits on the browser.
fn acknowledge_and_dispatch(
    state: &AppState,
    options: CaptureOptions,
    target_url: String,
    callback: String,
) -> Response {
    let ack = callback_ack_message(&callback);
    let delivery = CallbackDelivery::new(
        options.clone(),
        state.client.clone(),
        state.config.cleanup_runtime,
    );
    let engine = state.engine.clone();
    let metrics = state.metrics.clone();
    let health = state.health.clone();

    tokio::spawn(async move {
        let started = Instant::now();
        let outcome = engine.capture(&target_url, &options).await;
        let captured = outcome.is_ok();
        metrics.record_capture(started.elapsed(), captured);
        if !captured {
            health.record_capture_failure();
        }

        match delivery.deliver(outcome).await {
            DeliveryReport::Uploaded => metrics.record_callback_delivery(),
            DeliveryReport::FailureNotified => {
                if captured {
                    metrics.record_delivery_failure();
                }
            }
            DeliveryReport::NotificationFailed => metrics.record_delivery_failure(),
        }
    });

    (StatusCode::OK, Json(message_body(&ack))).into_response()
}

/// Direct mode: the requesting connection waits for the capture and gets the
/// artifact (or the failure) as its response.
///
/// The engine call runs on its own task so a client that hangs up while the
/// browser is still rendering only abandons the wait: the capture finishes and
/// the browser shuts down cleanly either way.
async fn capture_and_respond(
    state: &AppState,
    options: CaptureOptions,
    target_url: String,
) -> Response {
    let engine = state.engine.clone();
    let metrics = state.metrics.clone();
    let health = state.health.clone();
    let capture_options = options.clone();
    let capture = tokio::spawn(async move {
        let started = Instant::now();
        let outcome = engine.capture(&target_url, &capture_options).await;
        metrics.record_capture(started.elapsed(), outcome.is_ok());
        if outcome.is_err() {
            health.record_capture_failure();
        }
        outcome
    });

    let outcome = match capture.await {
        Ok(outcome) => outcome,
        Err(e) => Err(CaptureError::RenderFailed(format!(
            "capture task failed: {e}"
        ))),
    };
    let captured = outcome.is_ok();

    let delivery = DirectDelivery::new(options, state.config.cors, state.config.cleanup_runtime);
    let response = delivery.deliver(outcome).await;

    if captured {
        if response.status() == StatusCode::OK {
            state.metrics.record_direct_delivery();
        } else {
            state.metrics.record_delivery_failure();
        }
    }
    response
}

async fn health_endpoint(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.health.report().await)
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match &state.exporter {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
