// src/handlers/projects.rs
//! Project endpoints: create, list, status, script, and step execution.

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::AppError;
use crate::progress;
use crate::AppState;

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub description: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct StepRequest {
    pub description: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub id: String,
    pub completed_step: u32,
    pub description: String,
    pub running_step: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectResponse {
    pub id: String,
    pub completed_step: u32,
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

/// GET /api/projects - all projects, newest first.
pub async fn list_projects(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    let ids = match state.store.list_projects().await {
        Ok(ids) => ids,
        Err(e) => return e.into_response(),
    };

    let mut summaries = Vec::with_capacity(ids.len());
    for id in ids {
        let artifacts = match state.store.list_artifacts(&id).await {
            Ok(artifacts) => artifacts,
            Err(e) => {
                tracing::warn!("Skipping unreadable project {}: {}", id, e);
                continue;
            }
        };
        let description = state.store.read_description(&id).await.unwrap_or_default();
        summaries.push(ProjectSummary {
            completed_step: progress::completed_step(&artifacts),
            running_step: state.runs.running_step(&id),
            id,
            description,
        });
    }
    Json(summaries).into_response()
}

/// POST /api/projects - create a project; writing the description is step 1.
pub async fn create_project(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<CreateProjectRequest>,
) -> impl IntoResponse {
    let description = match request.description.filter(|d| !d.trim().is_empty()) {
        Some(description) => description,
        None => {
            return AppError::Validation("description is required".to_string()).into_response();
        }
    };

    match state.store.create_project(&description).await {
        Ok(id) => {
            tracing::info!("Created project {}", id);
            (
                StatusCode::OK,
                Json(CreateProjectResponse {
                    id,
                    completed_step: 1,
                }),
            )
                .into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// GET /api/projects/:id/status - derived status plus the in-flight step.
pub async fn get_status(
    Path(id): Path<String>,
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    if !state.store.project_exists(&id).await {
        return not_found("project not found");
    }
    match state.store.list_artifacts(&id).await {
        Ok(artifacts) => {
            let status = progress::status(artifacts, state.runs.running_step(&id));
            Json(status).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// GET /api/projects/:id/script - the persisted script, 404 until step 2 ran.
pub async fn get_script(
    Path(id): Path<String>,
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    if !state.store.script_file_exists(&id).await {
        return not_found("script not found");
    }
    match state.store.read_script(&id).await {
        Ok(script) => Json(script).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/projects/:id/step/:step_num - run one pipeline step.
///
/// The step itself executes on a spawned task that owns the run guard, for
/// two reasons: the guard entry must be released on every exit path, and a
/// step that has started must run to completion even if the requesting
/// client disconnects and this handler future is dropped.
pub async fn run_step(
    Path((id, step_num)): Path<(String, u32)>,
    Extension(state): Extension<Arc<AppState>>,
    body: Option<Json<StepRequest>>,
) -> impl IntoResponse {
    if !state.store.project_exists(&id).await {
        return not_found("project not found");
    }
    if !(1..=6).contains(&step_num) {
        return AppError::Validation(format!(
            "step must be between 1 and 6, got {}",
            step_num
        ))
        .into_response();
    }

    let guard = match state.runs.begin_run(&id, step_num) {
        Ok(guard) => guard,
        Err(e) => return e.into_response(),
    };

    let Json(request) = body.unwrap_or_default();
    let task_state = state.clone();
    let task_id = id.clone();
    let step_task = tokio::spawn(async move {
        // The guard lives inside the task, so it is dropped when the step
        // settles (or panics), not when the request is abandoned.
        let _guard = guard;
        task_state
            .pipeline
            .run_step(
                &task_state.store,
                &task_id,
                step_num,
                request.description.as_deref(),
            )
            .await
    });

    let result = match step_task.await {
        Ok(result) => result,
        Err(e) => Err(AppError::Internal(format!(
            "step {} task for project {} ended abnormally: {}",
            step_num, id, e
        ))),
    };

    match result {
        Ok(()) => match state.store.list_artifacts(&id).await {
            Ok(artifacts) => {
                let status = progress::status(artifacts, state.runs.running_step(&id));
                Json(status).into_response()
            }
            Err(e) => e.into_response(),
        },
        Err(e) => {
            tracing::error!("Step {} failed for project {}: {}", step_num, id, e);
            e.into_response()
        }
    }
}

pub fn project_routes() -> Router {
    Router::new()
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/:id/status", get(get_status))
        .route("/api/projects/:id/script", get(get_script))
        .route("/api/projects/:id/step/:step_num", post(run_step))
}
