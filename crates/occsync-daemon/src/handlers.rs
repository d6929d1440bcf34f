//! HTTP surface: workstation management, the credential bridge mount, and
//! the health probe.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{middleware, Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::bridge;
use crate::directory::{DirectoryError, Workstation};
use crate::identity::{require_identity, Identity};
use crate::provision::ProvisionError;
use crate::state::{AppState, BRIDGE_PREFIX};

/// Failures mapped onto HTTP responses.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApiError {
    /// Workstation name was empty after trimming.
    #[error("workstation name cannot be empty")]
    EmptyName,

    /// A workstation with that name already exists.
    #[error("workstation name already in use")]
    Conflict,

    /// The verified identity is not a numeric user id, so no relational
    /// membership can be recorded for it.
    #[error("user id must be numeric")]
    InvalidIdentity,

    /// The workstation exists but its document-store access grant failed.
    /// The client should retry or an operator should run the repair
    /// operation; re-creating the workstation would duplicate it.
    #[error("workstation created, but granting sync access failed: {0}")]
    AccessGrant(String),

    /// Relational-store failure.
    #[error("internal storage error")]
    Storage,
}

impl From<ProvisionError> for ApiError {
    fn from(value: ProvisionError) -> Self {
        match value {
            ProvisionError::EmptyName => Self::EmptyName,
            ProvisionError::Directory(DirectoryError::Conflict(_)) => Self::Conflict,
            ProvisionError::Directory(err) => {
                error!(error = %err, "provisioning storage failure");
                Self::Storage
            },
            ProvisionError::AccessGrant { database, source } => {
                error!(database = %database, error = %source, "access grant failed");
                Self::AccessGrant(format!(
                    "database {database} access grant failed; retry or run repair"
                ))
            },
        }
    }
}

impl From<DirectoryError> for ApiError {
    fn from(value: DirectoryError) -> Self {
        match value {
            DirectoryError::Conflict(_) => Self::Conflict,
            err => {
                error!(error = %err, "storage failure");
                Self::Storage
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::EmptyName => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict => StatusCode::CONFLICT,
            Self::InvalidIdentity => StatusCode::BAD_REQUEST,
            Self::AccessGrant(_) => StatusCode::BAD_GATEWAY,
            Self::Storage => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateWorkstationRequest {
    /// Display name; must be non-empty after trimming and unique.
    pub workstation_name: String,
}

fn numeric_user_id(identity: &Identity) -> Result<i64, ApiError> {
    identity.0.parse().map_err(|_| ApiError::InvalidIdentity)
}

async fn create_workstation(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<CreateWorkstationRequest>,
) -> Result<(StatusCode, Json<Workstation>), ApiError> {
    let user_id = numeric_user_id(&identity)?;
    let workstation = state
        .provisioner
        .create_workstation(user_id, &body.workstation_name)
        .await?;
    Ok((StatusCode::CREATED, Json(workstation)))
}

async fn list_workstations(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<Workstation>>, ApiError> {
    let user_id = numeric_user_id(&identity)?;
    Ok(Json(state.directory.workstations_for_user(user_id)?))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Build the daemon's router.
///
/// Everything except the health probe sits behind the identity middleware.
pub fn router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/api/workstations", post(create_workstation).get(list_workstations))
        .route(BRIDGE_PREFIX, any(bridge::forward))
        .route(&format!("{BRIDGE_PREFIX}/{{*path}}"), any(bridge::forward))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_identity));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(authed)
        .with_state(state)
}
