//! Endpoints of HTTP server.
//!
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Query},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    Extension, Json,
};
use chrono::Local;
use common::protocol::{
    DescribeRequest, DescribeResponse, DescriptionSource, DetectRequest, DetectResponse,
    DetectionHint, EncyclopediaRequest, ErrorBody, GeneratedEncyclopedia,
};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::{
    app::AppState,
    describe::{describe_with_fallback, fallback_description},
    encyclopedia::{self, to_entries, validate_place, EncyclopediaStore},
    meter::METER,
    utils::decode_base64_image,
};

const MISSING_IMAGE: &str = "request body contains no image data";

/// Failure of a request, rendered as JSON [`ErrorBody`].
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Upstream(String),
    #[error("server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(error) => (StatusCode::BAD_REQUEST, ErrorBody { error, message: None }),
            ApiError::Unavailable(error) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody { error, message: None },
            ),
            ApiError::Upstream(error) => (StatusCode::BAD_GATEWAY, ErrorBody { error, message: None }),
            ApiError::Internal(e) => {
                log::error!("Request failed: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        error: "server error".into(),
                        message: Some(format!("{e:#}")),
                    },
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

fn bad_body(rejection: JsonRejection) -> ApiError {
    ApiError::BadRequest(format!("invalid request body: {rejection}"))
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

/// Camera page.
pub async fn index() -> Html<&'static str> {
    Html(include_str!("../static/index.html"))
}

pub async fn encyclopedia_page() -> Html<&'static str> {
    Html(include_str!("../static/encyclopedia.html"))
}

/// Run object detection on a base64 frame.
pub async fn detect(
    Extension(state): Extension<Arc<AppState>>,
    payload: Result<Json<DetectRequest>, JsonRejection>,
) -> Result<Json<DetectResponse>, ApiError> {
    METER.tick_detection();

    let Json(request) = payload.map_err(bad_body)?;
    let data = request
        .image
        .filter(|data| !data.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest(MISSING_IMAGE.into()))?;
    let image = decode_base64_image(&data).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    log::debug!("Detecting on {}x{} frame", image.width(), image.height());

    // Inference is CPU bound, keep it off the async workers
    let model = Arc::clone(&state.model);
    let detections = tokio::task::spawn_blocking(move || model.run(&image))
        .await
        .context("inference task failed")??;

    log::debug!("Found {} objects", detections.len());
    Ok(Json(detections.into()))
}

/// Describe the selected detection of a frame.
///
/// Always answers with a description: the language model's when it is
/// available, a templated one otherwise. Only a missing image is a 400.
pub async fn describe(
    Extension(state): Extension<Arc<AppState>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    METER.tick_description();

    let request = payload
        .map_err(|rejection| rejection.to_string())
        .and_then(|Json(body)| {
            serde_json::from_value::<DescribeRequest>(body).map_err(|e| e.to_string())
        });
    let request = match request {
        Ok(request) => request,
        Err(e) => {
            log::error!("Unreadable description request: {e}");
            return fallback_response(None, format!("invalid request body: {e}"));
        }
    };

    let Some(data) = request.image.filter(|data| !data.trim().is_empty()) else {
        return ApiError::BadRequest(MISSING_IMAGE.into()).into_response();
    };
    let hint = request.detection;

    let image = match decode_base64_image(&data) {
        Ok(image) => image,
        Err(e) => {
            log::error!("Failed to decode frame for description: {e}");
            return fallback_response(hint.as_ref(), e.to_string());
        }
    };

    let (description, source) =
        describe_with_fallback(state.captioner.as_ref(), &image, hint.as_ref()).await;
    if source == DescriptionSource::Fallback {
        METER.tick_fallback();
    }

    Json(DescribeResponse {
        description,
        source,
        error: None,
    })
    .into_response()
}

/// 500 answer that still carries a usable description.
fn fallback_response(hint: Option<&DetectionHint>, error: String) -> Response {
    METER.tick_fallback();
    let body = DescribeResponse {
        description: fallback_description(hint, Some(&error)),
        source: DescriptionSource::Fallback,
        error: Some(error),
    };

    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

/// Generate encyclopedia entries for a place and log them.
pub async fn create_encyclopedia(
    Extension(state): Extension<Arc<AppState>>,
    payload: Result<Json<EncyclopediaRequest>, JsonRejection>,
) -> Result<Json<GeneratedEncyclopedia>, ApiError> {
    let Json(request) = payload.map_err(bad_body)?;
    let place = validate_place(request.place.as_deref().unwrap_or_default())
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    if !state.llm.has_api_key() {
        return Err(ApiError::Unavailable(
            "language model API key is not configured".into(),
        ));
    }

    log::info!("Generating encyclopedia for {place}");
    let generated = encyclopedia::generate(&state.llm, &place)
        .await
        .map_err(|e| {
            log::warn!("Encyclopedia generation for {place} failed: {e:#}");
            ApiError::Upstream(format!("{e:#}"))
        })?;

    let entries = to_entries(&generated, Local::now().date_naive());
    with_store(&state, move |store| store.append(&entries)).await?;

    Ok(Json(generated))
}

/// Search parameters of the entries listing.
#[derive(Debug, Deserialize)]
pub struct EntriesParams {
    #[serde(default)]
    place: Option<String>,
}

pub async fn list_entries(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<EntriesParams>,
) -> Result<Json<Value>, ApiError> {
    let place = params.place.clone();
    let entries = with_store(&state, move |store| match &place {
        Some(place) => store.entries_for(place),
        None => store.entries(),
    })
    .await?;

    Ok(Json(json!({ "place": params.place, "entries": entries })))
}

pub async fn list_places(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let places = with_store(&state, |store| store.places()).await?;
    Ok(Json(json!({ "places": places })))
}

/// Run blocking file I/O of the encyclopedia log on the blocking pool.
async fn with_store<T, F>(state: &Arc<AppState>, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&EncyclopediaStore) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let state = Arc::clone(state);
    let result = tokio::task::spawn_blocking(move || f(&state.store))
        .await
        .context("encyclopedia task failed")??;

    Ok(result)
}
