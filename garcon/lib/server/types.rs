//! Request and response types of the REST facade, and the error-to-status
//! mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::GarconError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Error response returned when an operation fails.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message describing what went wrong.
    pub error: String,
}

/// A facade-level error carrying its HTTP mapping.
#[derive(Debug)]
pub struct ApiError(pub GarconError);

/// Request body for creating a backup.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBackupRequest {
    /// Transient description echoed in the response record.
    #[serde(default)]
    pub description: Option<String>,
}

/// Request body for `PUT /servers/order`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    /// Server ids in the operator's preferred order.
    pub server_ids: Vec<String>,
}

/// Response body for `GET /health`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always "ok" when the process can answer.
    pub status: &'static str,

    /// Whether the container daemon answered a ping.
    pub container_backend: bool,

    /// Whether native execution is available on this host.
    pub native_backend: bool,
}

/// Response body for `GET /config`: the sanitised settings view.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    /// The managed data directory.
    pub data_dir: String,

    /// The import directory offered to the operator.
    pub import_dir: String,

    /// Per-server, per-type backup retention cap.
    pub max_backups_per_type: usize,

    /// Whether stopping a server takes an automatic backup first.
    pub auto_backup_on_stop: bool,
}

/// Response body for `GET /import/folders`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportFoldersResponse {
    /// Directory names under the import directory.
    pub folders: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<GarconError> for ApiError {
    fn from(error: GarconError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GarconError::Validation(_) => StatusCode::BAD_REQUEST,
            GarconError::NotFound(_) => StatusCode::NOT_FOUND,
            GarconError::Conflict(_) | GarconError::State(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Collaborator failures can leak paths or daemon internals; keep the
        // operator-facing message generic for those.
        let message = match status {
            StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!("internal error: {}", self.0);
                "internal error".to_string()
            }
            _ => self.0.to_string(),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let cases = [
            (GarconError::validation("bad"), StatusCode::BAD_REQUEST),
            (GarconError::not_found("gone"), StatusCode::NOT_FOUND),
            (GarconError::conflict("busy"), StatusCode::CONFLICT),
            (GarconError::state("illegal"), StatusCode::CONFLICT),
            (
                GarconError::native_process("boom"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            let response = ApiError(error).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
