//! HTTP request handlers for the REST API.
//!
//! Handlers parse and validate the request, delegate to the orchestrator or
//! backup engine, and map the result onto the wire.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};

use crate::{
    orchestration::{ImportServerRequest, UpdateServerRequest},
    runtime::ExecutionProvider,
    GarconError,
};

use super::{
    state::AppState,
    types::{
        ApiError, ConfigResponse, CreateBackupRequest, HealthResponse, ImportFoldersResponse,
        OrderRequest,
    },
};

//-------------------------------------------------------------------------------------------------
// Functions: Server Handlers
//-------------------------------------------------------------------------------------------------

/// Handler for `GET /servers`.
pub async fn list_servers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.list_servers().await)
}

/// Handler for `POST /servers`.
pub async fn import_server(
    State(state): State<AppState>,
    Json(request): Json<ImportServerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.orchestrator.import_server(request).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// Handler for `GET /servers/{id}`.
pub async fn get_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.get_server(&id).await?))
}

/// Handler for `PATCH /servers/{id}`.
pub async fn update_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateServerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.update_server(&id, request).await?))
}

/// Handler for `DELETE /servers/{id}`.
pub async fn delete_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.delete_server(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for `PUT /servers/order`.
pub async fn set_server_order(
    State(state): State<AppState>,
    Json(request): Json<OrderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.set_server_order(request.server_ids).await?;
    Ok(StatusCode::NO_CONTENT)
}

//-------------------------------------------------------------------------------------------------
// Functions: Lifecycle Handlers
//-------------------------------------------------------------------------------------------------

/// Handler for `POST /servers/{id}/start`.
pub async fn start_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.start_server(&id).await?))
}

/// Handler for `POST /servers/{id}/stop`.
pub async fn stop_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.stop_server(&id).await?))
}

/// Handler for `POST /servers/{id}/restart`.
pub async fn restart_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.restart_server(&id).await?))
}

/// Handler for `POST /servers/{id}/acknowledge-crash`.
pub async fn acknowledge_crash(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.acknowledge_crash(&id).await?))
}

//-------------------------------------------------------------------------------------------------
// Functions: Update Handlers
//-------------------------------------------------------------------------------------------------

/// Handler for `POST /servers/{id}/update/initiate`.
pub async fn initiate_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.initiate_update(&id).await?))
}

/// Handler for `POST /servers/{id}/update/apply`.
pub async fn apply_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.apply_update(&id).await?;
    Ok(Json(state.orchestrator.get_server(&id).await?))
}

/// Handler for `POST /servers/{id}/update/cancel`.
pub async fn cancel_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.cancel_update(&id).await?;
    Ok(Json(state.orchestrator.get_server(&id).await?))
}

//-------------------------------------------------------------------------------------------------
// Functions: Template Handlers
//-------------------------------------------------------------------------------------------------

/// Handler for `GET /templates`.
pub async fn list_templates(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.templates.list())
}

/// Handler for `GET /templates/{id}`.
pub async fn get_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let template = state.templates.get(&id)?;
    Ok(Json(template.as_ref().clone()))
}

//-------------------------------------------------------------------------------------------------
// Functions: Backup Handlers
//-------------------------------------------------------------------------------------------------

/// Handler for `GET /servers/{id}/backups`.
pub async fn list_backups(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.backups.list(&id).await?))
}

/// Handler for `POST /servers/{id}/backups`.
pub async fn create_backup(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Option<Json<CreateBackupRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let description = request.and_then(|Json(r)| r.description);
    let record = state.orchestrator.create_backup(&id, description).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// Handler for `DELETE /servers/{id}/backups/{timestamp}`.
pub async fn delete_backup(
    State(state): State<AppState>,
    Path((id, timestamp)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let timestamp = parse_timestamp(&timestamp)?;
    state.backups.delete(&id, &timestamp).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for `POST /servers/{id}/backups/{timestamp}/restore`.
pub async fn restore_backup(
    State(state): State<AppState>,
    Path((id, timestamp)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let timestamp = parse_timestamp(&timestamp)?;
    Ok(Json(state.orchestrator.restore_backup(&id, &timestamp).await?))
}

//-------------------------------------------------------------------------------------------------
// Functions: Operational Handlers
//-------------------------------------------------------------------------------------------------

/// Handler for `GET /health`.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let providers = state.orchestrator.providers();

    Json(HealthResponse {
        status: "ok",
        container_backend: providers.container.check_availability().await,
        native_backend: providers.native.check_availability().await,
    })
}

/// Handler for `GET /config`.
pub async fn config(State(state): State<AppState>) -> impl IntoResponse {
    Json(ConfigResponse {
        data_dir: state.settings.data_dir.display().to_string(),
        import_dir: state.settings.import_dir.display().to_string(),
        max_backups_per_type: state.settings.max_backups_per_type,
        auto_backup_on_stop: state.settings.auto_backup_on_stop,
    })
}

/// Handler for `GET /import/folders`.
pub async fn import_folders(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let folders = state.store.list_dirs(&state.settings.import_dir).await?;
    Ok(Json(ImportFoldersResponse { folders }))
}

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, GarconError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| GarconError::validation(format!("invalid backup timestamp '{}'", raw)))
}
