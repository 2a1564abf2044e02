//! Shared state and routes of the HTTP server.
//!
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Router,
};

use crate::{
    describe::Captioner,
    encyclopedia::EncyclopediaStore,
    endpoints::{
        create_encyclopedia, describe, detect, encyclopedia_page, healthcheck, index,
        list_entries, list_places,
    },
    llm::LlmClient,
    nn::InferModel,
};

/// Camera frames arrive as base64 JSON, allow well above a full HD JPEG.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub struct AppState {
    /// Loaded once at startup and shared by all requests.
    pub model: Arc<dyn InferModel>,
    pub captioner: Arc<dyn Captioner>,
    pub llm: LlmClient,
    pub store: EncyclopediaStore,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/encyclopedia", get(encyclopedia_page))
        .route("/healthcheck", get(healthcheck))
        .route("/object-detection", post(detect))
        .route("/detect", post(detect))
        .route("/description", post(describe))
        .route("/describe", post(describe))
        .route(
            "/api/encyclopedia",
            get(list_entries).post(create_encyclopedia),
        )
        .route("/api/encyclopedia/places", get(list_places))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(Extension(state))
}
