//! HTTP routes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{HeaderValue, Request, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::cors::{AllowHeaders, AllowMethods, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::detector::EdgeDetector;
use crate::error::{ApiError, ApiResult, INTERNAL_ERROR_DETAIL, error_body};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub detector: Arc<EdgeDetector>,
}

impl AppState {
    pub fn new(detector: EdgeDetector) -> Self {
        Self {
            detector: Arc::new(detector),
        }
    }
}

/// Create the API router.
pub fn create_router(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route("/", get(read_root))
        .route("/items/:item_id", get(read_item))
        .route("/chat", post(detect_edges))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.max_body_size))
        .layer(middleware::from_fn_with_state(
            config.is_production(),
            redact_server_errors,
        ))
        .layer(middleware::from_fn(request_logging))
        .layer(cors_layer(&config.cors_origins))
        .with_state(state)
}

/// CORS for an explicit origin allow-list with credentials. Methods and
/// headers are mirrored from the preflight since tower-http rejects `Any`
/// together with credentials.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .max_age(Duration::from_secs(600))
}

pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    // Skip liveness probe logging
    if uri.path() != "/" {
        info!(
            method = %method,
            uri = %uri,
            status = %response.status(),
            duration_ms = %start.elapsed().as_millis(),
            "Request completed"
        );
    }

    response
}

/// Replaces the body of 5xx responses with a generic detail when `redact` is
/// set. The full error is still logged where it is raised.
pub async fn redact_server_errors(State(redact): State<bool>, request: Request<Body>, next: Next) -> Response {
    let response = next.run(request).await;

    if redact && response.status().is_server_error() {
        return error_body(response.status(), INTERNAL_ERROR_DETAIL.to_string());
    }

    response
}

/// Liveness probe.
pub async fn read_root() -> Json<Value> {
    Json(json!({ "Hello": "World" }))
}

#[derive(Deserialize)]
pub struct ItemQuery {
    q: Option<String>,
}

#[derive(Serialize)]
pub struct ItemResponse {
    item_id: i64,
    q: Option<String>,
}

pub async fn read_item(Path(item_id): Path<i64>, Query(query): Query<ItemQuery>) -> Json<ItemResponse> {
    Json(ItemResponse {
        item_id,
        q: query.q,
    })
}

/// `POST /chat`: multipart `prompt` + `image`, answers with the PNG edge map.
pub async fn detect_edges(State(state): State<AppState>, mut multipart: Multipart) -> ApiResult<Response> {
    let mut prompt: Option<String> = None;
    let mut image: Option<Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?
    {
        match field.name() {
            Some("prompt") => {
                prompt = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::validation(format!("field `prompt`: {}", e.body_text())))?,
                );
            }
            Some("image") => {
                image = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::bad_request(e.body_text()))?,
                );
            }
            _ => {}
        }
    }

    let prompt = prompt.ok_or_else(|| ApiError::validation("field `prompt` is required"))?;
    let image = image.ok_or_else(|| ApiError::validation("field `image` is required"))?;
    info!(bytes = image.len(), "Received image for edge detection");

    let detector = Arc::clone(&state.detector);
    let png = tokio::task::spawn_blocking(move || detector.detect(&prompt, &image))
        .await
        .map_err(|e| ApiError::internal(format!("edge detection task failed: {e}")))??;

    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}
