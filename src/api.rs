use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{delete, get, post},
    Router,
};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::coordinator::FleetCoordinator;
use crate::error::FleetError;
use crate::model::{DownloadOutcome, DownloadRequest, EndpointStatus, FleetReport};
use crate::registry::Endpoint;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<FleetCoordinator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Registry
        .route("/api/servers", get(list_servers).post(register_server))
        .route("/api/servers/:name", delete(remove_server))
        .route("/api/servers/:name/download", post(download_to_one))
        // Fleet
        .route("/api/fleet/status", get(fleet_status))
        .route("/api/fleet/available", get(available_servers))
        .route("/api/fleet/download", post(download_to_fleet))
        .route("/api/fleet/operations/:id/cancel", post(cancel_operation))
        // SSE Events
        .route("/api/events", get(sse_handler))
        .with_state(state)
}

/// JSON error body with a status picked from the error kind
pub struct ApiError(FleetError);

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FleetError::InvalidRequest(_)
            | FleetError::InvalidEndpoint { .. }
            | FleetError::DisallowedCatalogHost { .. } => StatusCode::BAD_REQUEST,
            FleetError::UnknownEndpoint(_) | FleetError::UnknownOperation(_) => StatusCode::NOT_FOUND,
            FleetError::DuplicateEndpoint(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::warn!("Request rejected: {}", self.0);
        }
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

// === Request Types ===

#[derive(Debug, Deserialize)]
pub struct RegisterServerRequest {
    pub name: String,
    #[serde(alias = "url")]
    pub address: String,
}

#[derive(Deserialize)]
pub struct DownloadBody {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Probe first and skip endpoints that are not online
    #[serde(default)]
    pub only_online: bool,
}

impl DownloadBody {
    fn to_request(&self) -> Result<DownloadRequest, FleetError> {
        DownloadRequest::new(&self.url, self.api_key.as_deref())
    }
}

// === Handlers ===

async fn health_check() -> &'static str {
    "OK"
}

async fn list_servers(State(state): State<AppState>) -> Json<Vec<Endpoint>> {
    Json(state.coordinator.endpoints().await)
}

async fn register_server(
    State(state): State<AppState>,
    Json(req): Json<RegisterServerRequest>,
) -> Result<(StatusCode, Json<Endpoint>), ApiError> {
    let endpoint = Endpoint::new(&req.name, &req.address)?;
    state.coordinator.register(endpoint.clone()).await?;
    Ok((StatusCode::CREATED, Json(endpoint)))
}

async fn remove_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Endpoint>, ApiError> {
    Ok(Json(state.coordinator.remove(&name).await?))
}

async fn fleet_status(State(state): State<AppState>) -> Json<Vec<EndpointStatus>> {
    Json(state.coordinator.check_fleet_status().await)
}

async fn available_servers(State(state): State<AppState>) -> Json<Vec<Endpoint>> {
    Json(state.coordinator.list_available().await)
}

async fn download_to_fleet(
    State(state): State<AppState>,
    Json(body): Json<DownloadBody>,
) -> Result<Json<FleetReport>, ApiError> {
    let request = body.to_request()?;
    let report = if body.only_online {
        state.coordinator.download_to_online(request).await?
    } else {
        state.coordinator.download_to_all(request).await?
    };
    Ok(Json(report))
}

async fn download_to_one(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<DownloadBody>,
) -> Result<Json<DownloadOutcome>, ApiError> {
    let request = body.to_request()?;
    Ok(Json(state.coordinator.download_to_one(&name, request).await?))
}

async fn cancel_operation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.coordinator.cancel(id).await {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(FleetError::UnknownOperation(id.to_string()).into())
    }
}

async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::info!("New SSE connection established");
    let rx = state.coordinator.subscribe();

    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).map(|msg| match msg {
        Ok(event) => {
            let data = serde_json::to_string(&event).unwrap_or_default();
            Ok(Event::default().event(event.status.clone()).data(data))
        }
        Err(_lag) => {
            tracing::warn!("SSE stream lagged");
            Ok(Event::default().comment("lagged"))
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
