use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, warn};

use crate::config::AiSettings;

const BODY_LIMIT: usize = 64 * 1024; // 64 KB

#[derive(Clone)]
struct AppState {
    ai: Arc<AiSettings>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeConfig {
    ai_api_key: Option<String>,
    ai_provider: String,
    ai_model: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let Self::NotFound(message) = self;
        (StatusCode::NOT_FOUND, Json(ErrorResponse { error: message })).into_response()
    }
}

// --- Middleware ---

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Handlers ---

async fn get_config(State(state): State<AppState>) -> Json<RuntimeConfig> {
    Json(RuntimeConfig {
        ai_api_key: state.ai.api_key.clone(),
        ai_provider: state.ai.provider.clone(),
        ai_model: state.ai.model.clone(),
    })
}

async fn not_found() -> ApiError {
    ApiError::NotFound("Not found".to_string())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/config", get(get_config))
        .fallback(not_found)
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

pub async fn start_server(ai: AiSettings, port: u16, bind: &str) -> anyhow::Result<()> {
    if ai.api_key.is_none() {
        warn!("OPENROUTER_API_KEY is not set; /api/config will return no key");
    }
    if bind != "127.0.0.1" && bind != "localhost" && ai.api_key.is_some() {
        eprintln!(
            "Warning: Listening on {bind}. Any device on your network can read the AI API key."
        );
    }

    let app = build_router(AppState { ai: Arc::new(ai) });
    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}")).await?;
    info!(bind, port, "config server started");
    eprintln!("Listening on http://{bind}:{port}");
    axum::serve(listener, app).await?;
    Ok(())
}
