//! Control API HTTP server
//!
//! Exposes the queue and the boundary operations over HTTP for the
//! dashboard and for scripting.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

use crate::job::{JobId, JobRequest};
use crate::picker::{open_folder, pick_output_folder, pick_source_files, PickError};
use crate::sequencer::QueueError;
use crate::service::{EnqueueReport, ServiceError, ServiceHandle};
use crate::status::QueueSnapshot;
use maxqueue_config::{Settings, SettingsPatch};

/// Errors that can occur when running the control API server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server stopped: {0}")]
    Serve(#[source] std::io::Error),
}

/// Error returned by a handler, rendered as `{"error": "..."}`
#[derive(Debug)]
pub enum ApiError {
    Service(ServiceError),
    Pick(PickError),
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        ApiError::Service(e)
    }
}

impl From<PickError> for ApiError {
    fn from(e: PickError) -> Self {
        ApiError::Pick(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Service(ServiceError::Queue(e)) => match e {
                QueueError::QueueLocked | QueueError::AlreadyRunning | QueueError::NothingPending => {
                    StatusCode::CONFLICT
                }
                QueueError::JobNotFound(_) => StatusCode::NOT_FOUND,
                QueueError::InvalidOrder => StatusCode::BAD_REQUEST,
            },
            ApiError::Service(ServiceError::Closed) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Service(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Pick(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Service(e) => e.to_string(),
            ApiError::Pick(e) => e.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Body of `POST /jobs` and `POST /render`
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AddJobsRequest {
    /// Scene files or folders to search for scene files
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub project: Option<String>,
    /// Only honoured when a single file is added
    #[serde(default)]
    pub output_name: Option<String>,
}

impl AddJobsRequest {
    fn into_job_requests(self) -> Vec<JobRequest> {
        let files = pick_source_files(&self.paths);
        let output_name = if files.len() == 1 { self.output_name } else { None };
        files
            .into_iter()
            .map(|source| JobRequest {
                source,
                output_name: output_name.clone(),
                project: self.project.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ReorderRequest {
    pub ids: Vec<JobId>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct OpenFolderRequest {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveJob {
    pub id: JobId,
}

/// Handler for GET /queue
async fn get_queue(State(service): State<ServiceHandle>) -> ApiResult<Json<QueueSnapshot>> {
    if service.is_closed() {
        return Err(ServiceError::Closed.into());
    }
    Ok(Json(service.snapshot()))
}

async fn get_active(State(service): State<ServiceHandle>) -> ApiResult<Json<Vec<ActiveJob>>> {
    let active = service.list_active().await?;
    Ok(Json(active.into_iter().map(|id| ActiveJob { id }).collect()))
}

async fn get_settings(State(service): State<ServiceHandle>) -> ApiResult<Json<Settings>> {
    Ok(Json(service.get_settings().await?))
}

async fn put_settings(
    State(service): State<ServiceHandle>,
    Json(patch): Json<SettingsPatch>,
) -> ApiResult<Json<Settings>> {
    if let Some(folder) = patch.output_folder.as_deref().filter(|f| !f.as_os_str().is_empty()) {
        pick_output_folder(folder)?;
    }
    Ok(Json(service.save_settings(patch).await?))
}

async fn add_jobs(
    State(service): State<ServiceHandle>,
    Json(request): Json<AddJobsRequest>,
) -> ApiResult<Json<EnqueueReport>> {
    Ok(Json(service.enqueue(request.into_job_requests()).await?))
}

/// Handler for POST /render: enqueue the given paths, then render everything.
async fn render_all(
    State(service): State<ServiceHandle>,
    Json(request): Json<AddJobsRequest>,
) -> ApiResult<Json<EnqueueReport>> {
    let project = request.project.clone();
    let report = if request.paths.is_empty() {
        EnqueueReport::default()
    } else {
        service.enqueue(request.into_job_requests()).await?
    };
    service.render_all(project).await?;
    Ok(Json(report))
}

async fn start(State(service): State<ServiceHandle>) -> ApiResult<StatusCode> {
    service.start().await?;
    Ok(StatusCode::ACCEPTED)
}

async fn cancel_job(
    State(service): State<ServiceHandle>,
    Path(id): Path<JobId>,
) -> ApiResult<Json<serde_json::Value>> {
    let canceled = service.cancel(id).await?;
    Ok(Json(json!({ "canceled": canceled })))
}

async fn remove_job(
    State(service): State<ServiceHandle>,
    Path(id): Path<JobId>,
) -> ApiResult<StatusCode> {
    service.remove(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reorder_queue(
    State(service): State<ServiceHandle>,
    Json(request): Json<ReorderRequest>,
) -> ApiResult<StatusCode> {
    service.reorder(request.ids).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_queue(State(service): State<ServiceHandle>) -> ApiResult<StatusCode> {
    service.clear().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for POST /open-folder; opens the output folder when no path is given.
async fn open_output_folder(
    State(service): State<ServiceHandle>,
    Json(request): Json<OpenFolderRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let path = match request.path {
        Some(path) => path,
        None => service.get_settings().await?.output_folder,
    };
    let ok = match open_folder(&path) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "could not open folder");
            false
        }
    };
    Ok(Json(json!({ "ok": ok })))
}

/// Creates the axum Router with the control API
pub fn create_control_router(service: ServiceHandle) -> Router {
    Router::new()
        .route("/queue", get(get_queue).delete(clear_queue))
        .route("/queue/order", put(reorder_queue))
        .route("/active", get(get_active))
        .route("/settings", get(get_settings).put(put_settings))
        .route("/jobs", post(add_jobs))
        .route("/jobs/:id", delete(remove_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/render", post(render_all))
        .route("/start", post(start))
        .route("/open-folder", post(open_output_folder))
        .with_state(service)
}

/// Runs the control API until `shutdown` resolves
pub async fn run_control_server<F>(
    service: ServiceHandle,
    addr: SocketAddr,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_control_router(service);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(%addr, "control API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(ServerError::Serve)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::LauncherEvent;
    use crate::sequencer::Sequencer;
    use crate::service::{launcher_channel, RenderService};
    use crate::testing::{test_settings, FakeLauncher};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn start_fake() -> (Router, ServiceHandle, mpsc::Sender<LauncherEvent>) {
        let (events_tx, events_rx) = launcher_channel();
        let (service, handle) =
            RenderService::new(Sequencer::new(FakeLauncher::new(), test_settings()), events_rx);
        service.spawn();
        (create_control_router(handle.clone()), handle, events_tx)
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        // Extractor rejections come back as plain text
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, json)
    }

    async fn add(app: &Router, paths: &[&str]) -> Vec<String> {
        let (status, json) = send(app, Method::POST, "/jobs", Some(json!({ "paths": paths }))).await;
        assert_eq!(status, StatusCode::OK);
        json["added"]
            .as_array()
            .unwrap()
            .iter()
            .map(|id| id.as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_get_queue_returns_json() {
        let (app, _handle, _events) = start_fake();
        add(&app, &["/scenes/a.max"]).await;

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/queue").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .expect("should have content-type header");
        assert!(content_type.to_str().unwrap().contains("application/json"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let snapshot: QueueSnapshot =
            serde_json::from_slice(&body).expect("should deserialize to QueueSnapshot");
        assert_eq!(snapshot.jobs.len(), 1);
        assert_eq!(snapshot.jobs[0].name, "a.max");
        assert!(!snapshot.running);
    }

    #[tokio::test]
    async fn test_add_jobs_reports_skips() {
        let (app, _handle, _events) = start_fake();

        let (status, json) = send(
            &app,
            Method::POST,
            "/jobs",
            Some(json!({ "paths": ["/scenes/a.max", "/scenes/a.fbx"], "project": "Villa" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["added"].as_array().unwrap().len(), 1);
        assert_eq!(json["skipped"][0]["reason"], "not_a_scene_file");

        let (_, again) = send(&app, Method::POST, "/jobs", Some(json!({ "paths": ["/scenes/a.max"] }))).await;
        assert_eq!(again["skipped"][0]["reason"], "already_queued");
    }

    #[tokio::test]
    async fn test_render_then_locked_mutations() {
        let (app, _handle, _events) = start_fake();

        let (status, _) = send(
            &app,
            Method::POST,
            "/render",
            Some(json!({ "paths": ["/scenes/a.max", "/scenes/b.max"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, active) = send(&app, Method::GET, "/active", None).await;
        let id = active[0]["id"].as_str().unwrap().to_string();

        let (status, json) = send(&app, Method::DELETE, &format!("/jobs/{}", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(json["error"].as_str().unwrap().contains("locked"));

        let (status, _) = send(&app, Method::DELETE, "/queue", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(&app, Method::POST, "/start", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, json) = send(&app, Method::POST, &format!("/jobs/{}/cancel", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["canceled"], true);
    }

    #[tokio::test]
    async fn test_idle_queue_edits() {
        let (app, handle, _events) = start_fake();
        let ids = add(&app, &["/scenes/a.max", "/scenes/b.max"]).await;

        let (status, _) = send(
            &app,
            Method::PUT,
            "/queue/order",
            Some(json!({ "ids": [ids[1], ids[0]] })),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(handle.snapshot().jobs[0].name, "b.max");

        let (status, _) = send(&app, Method::PUT, "/queue/order", Some(json!({ "ids": [ids[0]] }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, Method::DELETE, &format!("/jobs/{}", ids[0]), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, Method::DELETE, &format!("/jobs/{}", ids[0]), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, Method::DELETE, "/queue", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, Method::POST, "/start", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_settings_routes() {
        let (app, _handle, _events) = start_fake();
        let dir = tempfile::TempDir::new().unwrap();
        let folder = dir.path().join("Renders");

        let (status, json) = send(&app, Method::GET, "/settings", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["renderer_path"].as_str().unwrap().ends_with("3dsmaxcmd.exe"));

        let (status, json) = send(
            &app,
            Method::PUT,
            "/settings",
            Some(json!({ "output_folder": folder })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["output_folder"], folder.display().to_string());
        assert!(folder.is_dir());

        let file = dir.path().join("file.txt");
        std::fs::write(&file, b"x").unwrap();
        let (status, _) = send(&app, Method::PUT, "/settings", Some(json!({ "output_folder": file }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_open_missing_folder_is_not_ok() {
        let (app, _handle, _events) = start_fake();

        let (status, json) = send(
            &app,
            Method::POST,
            "/open-folder",
            Some(json!({ "path": "/definitely/not/here" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ok"], false);
    }

    #[tokio::test]
    async fn test_bad_job_id_is_rejected() {
        let (app, _handle, _events) = start_fake();
        let (status, _) = send(&app, Method::DELETE, "/jobs/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_closed_service_is_unavailable() {
        let (app, handle, _events) = start_fake();
        handle.shutdown().await.unwrap();

        let (status, _) = send(&app, Method::POST, "/start", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = send(&app, Method::GET, "/queue", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
