// Thin HTTP surface over the doc manager. Handlers adapt requests and
// map the error taxonomy onto stable JSON error codes; all document
// logic lives behind `DocManager`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use vellum_common::update::DocumentUpdate;

use crate::doc::Doc;
use crate::error::UpdaterError;
use crate::manager::{DocManager, SetDocRequest};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<DocManager>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route(
            "/project/{project_id}/doc/{doc_id}",
            get(get_doc).post(set_doc).delete(delete_doc),
        )
        .route("/project/{project_id}/doc/{doc_id}/flush", post(flush_doc))
        .route("/project/{project_id}/doc/{doc_id}/pathname", post(rename_doc))
        .route("/project/{project_id}/doc/{doc_id}/change/accept", post(accept_changes))
        .route("/project/{project_id}/flush", post(flush_project))
        .route("/project/{project_id}", axum::routing::delete(delete_project))
        .route("/project/{project_id}/get_and_flush_if_old", post(get_and_flush_if_old))
        .with_state(state)
}

struct ApiError(UpdaterError);

impl From<UpdaterError> for ApiError {
    fn from(error: UpdaterError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            UpdaterError::NotFound => StatusCode::NOT_FOUND,
            UpdaterError::NotAuthorized => StatusCode::FORBIDDEN,
            UpdaterError::Validation(_) | UpdaterError::Ot(_) => StatusCode::BAD_REQUEST,
            UpdaterError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            UpdaterError::UpdateRangeNotAvailable => StatusCode::UNPROCESSABLE_ENTITY,
            UpdaterError::HashMismatch | UpdaterError::ProjectStateChanged => StatusCode::CONFLICT,
            UpdaterError::Locked => StatusCode::LOCKED,
            UpdaterError::LockTimeout => StatusCode::SERVICE_UNAVAILABLE,
            UpdaterError::PartialFlush
            | UpdaterError::AlreadyReported(_)
            | UpdaterError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": { "code": self.0.code(), "message": self.0.to_string() }
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct DocResponse {
    id: Uuid,
    snapshot: String,
    version: u64,
    #[serde(rename = "pathName")]
    path_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ops: Vec<DocumentUpdate>,
}

impl DocResponse {
    fn from_doc(doc: Doc, ops: Vec<DocumentUpdate>) -> Self {
        Self { id: doc.doc_id, snapshot: doc.snapshot, version: doc.version, path_name: doc.path_name, ops }
    }
}

async fn status() -> &'static str {
    "vellum-updater is alive"
}

#[derive(Deserialize)]
struct GetDocQuery {
    #[serde(rename = "fromVersion")]
    from_version: Option<u64>,
}

async fn get_doc(
    State(state): State<AppState>,
    Path((project_id, doc_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<GetDocQuery>,
) -> Result<Json<DocResponse>, ApiError> {
    let (doc, ops) = match query.from_version {
        Some(from_version) => {
            state.manager.get_doc_and_recent_updates(project_id, doc_id, from_version).await?
        }
        None => (state.manager.get_doc(project_id, doc_id).await?, Vec::new()),
    };
    Ok(Json(DocResponse::from_doc(doc, ops)))
}

#[derive(Deserialize)]
struct SetDocBody {
    #[serde(default)]
    snapshot: Option<String>,
    /// Line-array form accepted for callers that store docs as lines.
    #[serde(default)]
    lines: Option<Vec<String>>,
    source: String,
    #[serde(default)]
    user_id: Option<Uuid>,
    #[serde(default)]
    undo: bool,
}

async fn set_doc(
    State(state): State<AppState>,
    Path((project_id, doc_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<SetDocBody>,
) -> Result<StatusCode, ApiError> {
    let snapshot = match (body.snapshot, body.lines) {
        (Some(snapshot), _) => snapshot,
        (None, Some(lines)) => lines.join("\n"),
        (None, None) => {
            return Err(UpdaterError::Validation(
                "either snapshot or lines is required".to_owned(),
            )
            .into())
        }
    };
    let request = SetDocRequest {
        snapshot,
        source: body.source,
        user_id: body.user_id,
        undo: body.undo,
    };
    state.manager.set_doc(project_id, doc_id, request).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_doc(
    State(state): State<AppState>,
    Path((project_id, doc_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state.manager.flush_and_delete_doc(project_id, doc_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn flush_doc(
    State(state): State<AppState>,
    Path((project_id, doc_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state.manager.flush_doc_if_loaded(project_id, doc_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct RenameBody {
    #[serde(rename = "pathName")]
    path_name: String,
}

async fn rename_doc(
    State(state): State<AppState>,
    Path((project_id, doc_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<RenameBody>,
) -> Result<StatusCode, ApiError> {
    if body.path_name.is_empty() {
        return Err(UpdaterError::Validation("pathName must not be empty".to_owned()).into());
    }
    state.manager.rename_doc(project_id, doc_id, &body.path_name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct AcceptChangesBody {
    change_ids: Vec<String>,
}

async fn accept_changes(
    State(state): State<AppState>,
    Path((project_id, doc_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<AcceptChangesBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let accepted = state.manager.accept_changes(project_id, doc_id, &body.change_ids).await?;
    Ok(Json(json!({ "accepted": accepted })))
}

async fn flush_project(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.manager.flush_project(project_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct DeleteProjectQuery {
    #[serde(default)]
    background: bool,
}

async fn delete_project(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<DeleteProjectQuery>,
) -> Result<StatusCode, ApiError> {
    if query.background {
        state.manager.queue_flush_and_delete_project(project_id).await?;
    } else {
        state.manager.flush_and_delete_project(project_id).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ProjectStateBody {
    state: String,
}

async fn get_and_flush_if_old(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(body): Json<ProjectStateBody>,
) -> Result<Json<Vec<DocResponse>>, ApiError> {
    let docs = state.manager.get_project_docs_and_flush_if_old(project_id, &body.state).await?;
    Ok(Json(docs.into_iter().map(|doc| DocResponse::from_doc(doc, Vec::new())).collect()))
}
