//! Axum route handlers for the catalog HTTP server.
//!
//! # Routes
//!
//! - `GET  /health`          - Returns `{"status": "ok", "version": ...}`
//! - `GET  /models/:id`      - Effective traits, strata and phase status
//! - `POST /models/:id/load` - Run one lifecycle phase (`{"phase": "mapItems"}`)
//! - `GET  /workbench`       - Workbench and timeline contents
//! - `POST /init`            - Apply one init data document
//! - `POST /share`           - Apply a share link (`{"url": "..."}`)

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tower_http::cors::CorsLayer;

use crate::catalog::Catalog;
use crate::error::CatalogError;
use crate::init::InitData;
use crate::member::Phase;
use crate::model::Model;

/// Shared application state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
}

impl AppState {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }
}

type ApiError = (StatusCode, Json<Value>);

/// Build the axum router with all routes.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/models/:id", get(get_model_handler))
        .route("/models/:id/load", post(load_model_handler))
        .route("/workbench", get(workbench_handler))
        .route("/init", post(init_handler))
        .route("/share", post(share_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl ToString) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

fn catalog_error(error: CatalogError) -> ApiError {
    if error.is_programmer_error() {
        log::error!("Request hit a programming error: {}", error);
    }
    let status = match &error {
        CatalogError::UnknownTrait { .. }
        | CatalogError::UnknownModelType(_)
        | CatalogError::InvalidTraitValue { .. }
        | CatalogError::ReadOnlyStratum(_)
        | CatalogError::ModelTypeMismatch { .. }
        | CatalogError::InvalidDescription(_)
        | CatalogError::Parse(_)
        | CatalogError::InvalidInitData { .. }
        | CatalogError::UnsupportedShareVersion(_) => StatusCode::BAD_REQUEST,
        CatalogError::DuplicateModel(_) => StatusCode::CONFLICT,
        CatalogError::Load { .. }
        | CatalogError::Fetch { .. }
        | CatalogError::Dereference { .. }
        | CatalogError::Aggregate(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, error)
}

fn find_model(catalog: &Catalog, id: &str) -> Result<Arc<Model>, ApiError> {
    catalog
        .models()
        .get_by_id_or_share_key(id, None)
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, format!("No model with id or share key `{}`", id)))
}

fn phase_statuses(model: &Model) -> Map<String, Value> {
    model.runtime().observe(|| {
        Phase::ALL
            .iter()
            .map(|phase| (phase.name().to_string(), model.phase_status(*phase).to_json()))
            .collect()
    })
}

/// GET /health - liveness probe.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "service": "catalog-strata",
    }))
}

/// GET /models/:id - one model as seen through every stratum.
///
/// Reading effective traits may start the metadata load of a model that
/// has never been read; the response reflects what is known right now.
async fn get_model_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let model = find_model(&state.catalog, &id)?;
    let traits = model
        .runtime()
        .observe(|| model.effective_traits())
        .map_err(catalog_error)?;

    Ok(Json(json!({
        "id": model.id(),
        "type": model.type_name(),
        "shareKeys": state.catalog.models().share_keys_of(model.id()),
        "knownContainerUniqueIds": model.known_containers(),
        "traits": traits,
        "strata": model.plain_strata(),
        "phases": phase_statuses(&model),
    })))
}

#[derive(Debug, Default, Deserialize)]
struct LoadRequest {
    phase: Option<String>,
}

/// POST /models/:id/load - run a phase and report every phase's status.
///
/// The phase comes from the JSON body or the `phase` query parameter and
/// defaults to `metadata`.
async fn load_model_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LoadRequest>,
    body: Option<Json<LoadRequest>>,
) -> Result<Json<Value>, ApiError> {
    let model = find_model(&state.catalog, &id)?;
    let phase = match body.and_then(|Json(request)| request.phase).or(query.phase) {
        Some(name) => name.parse::<Phase>().map_err(catalog_error)?,
        None => Phase::Metadata,
    };

    log::debug!("Loading {} of `{}` over HTTP", phase, model.id());
    model.load_phase(phase).await.map_err(catalog_error)?;

    Ok(Json(json!({
        "id": model.id(),
        "phase": phase.name(),
        "phases": phase_statuses(&model),
    })))
}

/// GET /workbench - workbench items in order, plus the timeline.
async fn workbench_handler(State(state): State<AppState>) -> Json<Value> {
    let catalog = &state.catalog;
    let items: Vec<Value> = catalog
        .workbench_models()
        .iter()
        .map(|model| {
            let name = catalog.runtime().observe(|| model.name()).ok();
            json!({
                "id": model.id(),
                "type": model.type_name(),
                "name": name,
                "mapItems": model.phase_status(Phase::MapItems).to_json(),
            })
        })
        .collect();
    let view = catalog.view();

    Json(json!({
        "items": items,
        "timeline": view.timeline,
        "previewedItemId": view.previewed_item_id,
    }))
}

/// POST /init - apply one init data document to the catalog.
async fn init_handler(
    State(state): State<AppState>,
    Json(document): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let data = InitData::from_value("request", document).map_err(catalog_error)?;
    state
        .catalog
        .apply_init_data(data, false)
        .await
        .map_err(catalog_error)?;

    Ok(Json(json!({
        "status": "applied",
        "view": state.catalog.view(),
    })))
}

#[derive(Debug, Deserialize)]
struct ShareRequest {
    url: String,
}

/// POST /share - queue and apply a share link.
async fn share_handler(
    State(state): State<AppState>,
    Json(request): Json<ShareRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .catalog
        .apply_share_link(&request.url)
        .await
        .map_err(catalog_error)?;

    Ok(Json(json!({
        "status": "applied",
        "view": state.catalog.view(),
    })))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
