use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{Extension, RawQuery},
    http::{
        header::{ACCESS_CONTROL_ALLOW_METHODS, CACHE_CONTROL, CONTENT_TYPE},
        HeaderValue, Method, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use snapgate_core::{AdmissionGate, GateError, RenderRequest, Renderer};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

const CACHE_CONTROL_VALUE: &str = "public, max-age=3600";
const ALLOWED_METHODS: &str = "GET, OPTIONS";

#[derive(Clone)]
struct HttpState {
    inner: Arc<HttpStateInner>,
}

struct HttpStateInner {
    gate: AdmissionGate,
    renderer: Arc<dyn Renderer>,
}

impl HttpState {
    fn new(gate: AdmissionGate, renderer: Arc<dyn Renderer>) -> Self {
        Self {
            inner: Arc::new(HttpStateInner { gate, renderer }),
        }
    }

    fn gate(&self) -> &AdmissionGate {
        &self.inner.gate
    }

    fn renderer(&self) -> &dyn Renderer {
        self.inner.renderer.as_ref()
    }
}

/// Boundary translation of [`GateError`] into `{ "error": ... }`.
#[derive(Debug)]
struct ApiError(GateError);

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("request failed: {:#}", self.0);
        }
        json_response(status, json!({ "error": self.0.message() }))
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL_VALUE));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    response
}

/// Router with the screenshot gate on `/` and a health probe.
pub fn build_router(
    gate: AdmissionGate,
    renderer: Arc<dyn Renderer>,
    cors_origin: &str,
) -> Result<Router> {
    let state = HttpState::new(gate, renderer);
    let cors = build_cors_layer(cors_origin)?;

    Ok(Router::new()
        .route("/", any(screenshot))
        .route("/health", get(health))
        .layer(Extension(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http()))
}

pub async fn run_http_server(
    host: &str,
    port: u16,
    gate: AdmissionGate,
    renderer: Arc<dyn Renderer>,
    cors_origin: &str,
) -> Result<()> {
    let router = build_router(gate, renderer, cors_origin)?;

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid bind address {host}:{port}"))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind snapgate HTTP server to {addr}"))?;

    tracing::info!("snapgate listening on {addr}");

    axum::serve(listener, router.into_make_service())
        .await
        .context("HTTP server encountered an unrecoverable error")?;

    Ok(())
}

async fn screenshot(
    Extension(state): Extension<HttpState>,
    method: Method,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    if method != Method::GET {
        return Err(GateError::MethodNotAllowed.into());
    }

    let gate = state.gate();
    let request =
        RenderRequest::from_query(query.as_deref().unwrap_or(""), gate.config().default_viewport)?;
    let outcome = gate.handle(&request, state.renderer()).await?;

    Ok(json_response(StatusCode::OK, outcome))
}

async fn health() -> Response {
    json_response(
        StatusCode::OK,
        json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "build": snapgate_build_info::build_id(),
            "revision": snapgate_build_info::revision(),
        }),
    )
}

fn build_cors_layer(origin: &str) -> Result<CorsLayer> {
    let layer = CorsLayer::new().allow_methods([Method::GET, Method::OPTIONS]);

    if origin.trim() == "*" {
        return Ok(layer.allow_origin(AllowOrigin::any()));
    }

    let value: HeaderValue = origin
        .trim()
        .parse()
        .with_context(|| format!("Invalid CORS origin '{origin}'"))?;
    Ok(layer.allow_origin(AllowOrigin::exact(value)))
}
