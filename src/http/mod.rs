//! HTTP transport: the axum server that sits on top of the [`crate::facade::Server`]
//! handle (SPEC_FULL.md §15/§16). Every route in spec.md §6's table is wired
//! here or in the per-surface modules below; `native`/`openai`/`anthropic`
//! hold the request/response shaping, this module holds the router, the
//! Bearer auth gate, and CORS/tracing layers (`server-http.cpp`'s
//! equivalents, grounded on `ynishi-kaiba`'s axum+tower-http stack).

mod anthropic;
mod common;
mod native;
mod openai;

/// Unix timestamp for OpenAI-shaped response envelopes (`created` field).
pub fn common_unix_time() -> i64 {
    chrono::Utc::now().timestamp()
}

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::facade::Server;

#[derive(Clone)]
pub struct AppState(pub Arc<Server>);

impl std::ops::Deref for AppState {
    type Target = Server;
    fn deref(&self) -> &Server {
        &self.0
    }
}

pub fn build_router(server: Arc<Server>) -> Router {
    let state = AppState(server);

    let unauthenticated = Router::new().route("/health", get(native::health)).route("/v1/health", get(native::health));

    let authenticated = Router::new()
        .route("/metrics", get(native::metrics))
        .route("/props", get(native::get_props).post(native::post_props))
        .route("/api/show", post(native::api_show))
        .route("/completion", post(native::completion))
        .route("/completions", post(native::completion))
        .route("/v1/completions", post(openai::completions))
        .route("/chat/completions", post(openai::chat_completions))
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/api/chat", post(openai::chat_completions))
        .route("/v1/responses", post(openai::responses))
        .route("/v1/messages", post(anthropic::messages))
        .route("/v1/messages/count_tokens", post(anthropic::count_tokens))
        .route("/infill", post(native::infill))
        .route("/embedding", post(native::embedding))
        .route("/embeddings", post(native::embedding))
        .route("/v1/embeddings", post(openai::embeddings))
        .route("/rerank", post(native::rerank))
        .route("/reranking", post(native::rerank))
        .route("/v1/rerank", post(native::rerank))
        .route("/v1/reranking", post(native::rerank))
        .route("/tokenize", post(native::tokenize))
        .route("/detokenize", post(native::detokenize))
        .route("/apply-template", post(native::apply_template))
        .route("/models", get(openai::list_models))
        .route("/v1/models", get(openai::list_models))
        .route("/api/tags", get(openai::api_tags))
        .route("/lora-adapters", get(native::get_lora).post(native::post_lora))
        .route("/slots", get(native::slots_info))
        .route("/slots/{id_slot}", post(native::slots_action));

    let authenticated = authenticated.route_layer(middleware::from_fn_with_state(state.clone(), auth_layer));

    unauthenticated
        .merge(authenticated)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `Bearer` check against the configured `--api-key` list (SPEC_FULL.md §16
/// "API-key auth middleware"). No keys configured disables auth entirely.
async fn auth_layer(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    if state.config.api_keys.is_empty() {
        return Ok(next.run(req).await);
    }
    let header_val = req.headers().get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    let presented = header_val.and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(key) if state.config.api_keys.iter().any(|k| k == key) => Ok(next.run(req).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}
