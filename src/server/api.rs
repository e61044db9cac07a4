//! Deployment API
//!
//! - `POST /deployments` - Accept a descriptor, roll it out in the background
//! - `GET /deployments/{namespace}/{app}` - Deployment history of an app
//! - `GET /deployments/{namespace}/{app}/{id}` - One deployment record
//! - `DELETE /deployments/{namespace}/{app}/{id}` - Undeploy the app
//!   (`?deleteHistory=true` also drops its records)

use crate::controller::{DeployError, Deployer};
use crate::model::Descriptor;
use crate::registry::StoreError;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Error body returned by every API handler
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        let status = match &err {
            DeployError::Validation(_) => StatusCode::BAD_REQUEST,
            DeployError::NotFound(_) | DeployError::Store(StoreError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UndeployParams {
    #[serde(default)]
    delete_history: bool,
}

/// Body is read as text so malformed JSON is a 400 like any other invalid descriptor
async fn create_deployment(
    State(deployer): State<Arc<Deployer>>,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let descriptor = Descriptor::from_json(&body).map_err(DeployError::from)?;
    let deployment = deployer.start_deploy(descriptor).await?;
    Ok((StatusCode::ACCEPTED, Json(deployment)))
}

async fn list_deployments(
    State(deployer): State<Arc<Deployer>>,
    Path((namespace, app)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let deployments = deployer
        .store()
        .list_by_app(&namespace, &app)
        .await
        .map_err(DeployError::from)?;
    Ok(Json(deployments))
}

async fn get_deployment(
    State(deployer): State<Arc<Deployer>>,
    Path((namespace, app, id)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(deployer.get(&namespace, &app, &id).await?))
}

async fn delete_deployment(
    State(deployer): State<Arc<Deployer>>,
    Path((namespace, app, id)): Path<(String, String, String)>,
    Query(params): Query<UndeployParams>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment = deployer.get(&namespace, &app, &id).await?;
    info!(
        deployment = %id,
        app = %app,
        namespace = %namespace,
        delete_history = params.delete_history,
        "Undeploy requested"
    );
    match deployer.undeploy(deployment, params.delete_history).await {
        Ok(deployment) => Ok(Json(deployment)),
        Err(e) => {
            warn!(deployment = %id, error = %e, "Undeploy failed");
            Err(e.into())
        }
    }
}

pub fn router(deployer: Arc<Deployer>) -> Router {
    Router::new()
        .route("/deployments", post(create_deployment))
        .route("/deployments/{namespace}/{app}", get(list_deployments))
        .route(
            "/deployments/{namespace}/{app}/{id}",
            get(get_deployment).delete(delete_deployment),
        )
        .with_state(deployer)
}

#[cfg(test)]
#[path = "api_test.rs"]
mod tests;
