//! Public HTTP API.
//!
//! ```text
//!   GET  /api/version
//!   POST /api/jobs                        multipart: inputDataFile, params
//!   PUT  /api/jobs/{id}/cancel
//!   GET  /api/jobs/{id}/status
//!   GET  /api/jobs/{id}/logs              WebSocket
//!   GET  /api/jobs/{id}/results/{kind}    registered | colorlut | labels | all
//! ```

mod ws;

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::error::JobError;
use crate::job::workdir::{CONFIG_FILE, STATUS_FILE, write_marker};
use crate::job::{Job, JobConfig, JobDir, JobId, JobStatus, PRE_TRANSFORM_FILE, write_pre_transform};
use crate::orchestrator::{LogRelay, RelayTarget, Scheduler};

/// Multipart field carrying the input volume.
const INPUT_FIELD: &str = "inputDataFile";
/// Multipart field carrying the JSON parameters.
const PARAMS_FIELD: &str = "params";
/// Stored name of an input whose original name is unusable.
const DEFAULT_INPUT_NAME: &str = "input";

/// Shared state for the API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    pub relay: Arc<LogRelay>,
}

/// Origins allowed to open a log WebSocket.
#[derive(Debug, Clone)]
struct SocketOrigins(Arc<[String]>);

impl SocketOrigins {
    /// Browsers always send `Origin` on a WebSocket handshake; a missing or
    /// unlisted one is refused.
    fn allows(&self, headers: &HeaderMap) -> bool {
        headers
            .get(header::ORIGIN)
            .and_then(|o| o.to_str().ok())
            .is_some_and(|origin| self.0.iter().any(|allowed| allowed == origin))
    }
}

/// Router construction and serving.
pub struct ApiServer;

impl ApiServer {
    /// Build the full router: `/api` routes, CORS, tracing and body limit.
    pub fn router(state: ApiState, config: &ServerConfig) -> Router {
        let api = Router::new()
            .route("/version", get(version))
            .route("/jobs", post(submit_job))
            .route("/jobs/{id}/cancel", put(cancel_job))
            .route("/jobs/{id}/status", get(job_status))
            .route("/jobs/{id}/logs", get(follow_logs))
            .route("/jobs/{id}/results/{kind}", get(download_result));

        Router::new()
            .nest("/api", api)
            .layer(Extension(SocketOrigins(config.allowed_origins.clone().into())))
            .layer(DefaultBodyLimit::max(config.max_upload_bytes()))
            .layer(cors_layer(&config.allowed_origins))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve(
        router: Router,
        port: u16,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("API listening on {}", addr);
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(origin = %o, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::HEAD,
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true)
        .expose_headers([header::CONTENT_DISPOSITION])
        .max_age(Duration::from_secs(3600))
}

// -- Bodies --

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<JobId>,
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelResponse {
    job_id: JobId,
    status: &'static str,
}

fn submit_error(status: StatusCode, job_id: Option<&JobId>, message: impl Into<String>) -> Response {
    (
        status,
        Json(SubmitResponse {
            job_id: job_id.cloned(),
            message: message.into(),
        }),
    )
        .into_response()
}

fn parse_id(raw: &str) -> Result<JobId, StatusCode> {
    JobId::parse(raw).map_err(|e| {
        tracing::debug!(error = %e, "Rejected job id");
        StatusCode::BAD_REQUEST
    })
}

// -- Handlers --

async fn version() -> String {
    format!("regpool: v{}\n", env!("CARGO_PKG_VERSION"))
}

async fn submit_job(State(state): State<ApiState>, multipart: Multipart) -> Response {
    let dir = match state.scheduler.workspace().allocate().await {
        Ok(dir) => dir,
        Err(e) => {
            tracing::error!(error = %e, "Could not allocate job directory");
            return submit_error(StatusCode::INTERNAL_SERVER_ERROR, None, e.to_string());
        }
    };
    tracing::info!(job_id = %dir.id, "Job submission received");

    let upload = match read_upload(multipart, &dir.path).await {
        Ok(upload) => upload,
        Err(rejection) => {
            mark_failed(&dir).await;
            return submit_error(rejection.status, Some(&dir.id), rejection.message);
        }
    };

    let pre_transform = match write_pre_transform(&upload.params, &dir.path).await {
        Ok(file) => file.unwrap_or_default(),
        Err(e) => {
            mark_failed(&dir).await;
            let status = match e {
                JobError::InvalidParams(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            return submit_error(status, Some(&dir.id), e.to_string());
        }
    };

    let job_id = dir.id.clone();
    let config = JobConfig {
        moving_image: upload.input.display().to_string(),
        pre_transform,
    };
    match state.scheduler.submit(Job::new(dir, config)).await {
        Ok(_) => {
            let location = format!("/api/jobs/{}", job_id);
            (
                StatusCode::CREATED,
                [(header::LOCATION, location)],
                Json(SubmitResponse {
                    job_id: Some(job_id),
                    message: "Successfully submitted job!".to_string(),
                }),
            )
                .into_response()
        }
        Err(e) => submit_error(StatusCode::INTERNAL_SERVER_ERROR, Some(&job_id), e.to_string()),
    }
}

async fn cancel_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, StatusCode> {
    let id = parse_id(&id)?;
    if state.scheduler.status(&id).await.status == JobStatus::Unknown {
        return Err(StatusCode::NOT_FOUND);
    }
    state.scheduler.cancel(&id).await;
    Ok(Json(CancelResponse {
        job_id: id,
        status: "canceling",
    }))
}

async fn job_status(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(status) => return status.into_response(),
    };
    let report = state.scheduler.status(&id).await;
    if report.status == JobStatus::Unknown {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(report).into_response()
}

async fn follow_logs(
    State(state): State<ApiState>,
    Extension(origins): Extension<SocketOrigins>,
    Path(id): Path<String>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(status) => return status.into_response(),
    };

    let target = match state.scheduler.get(&id).await {
        Some(job) => RelayTarget::Tracked(job),
        None => {
            let status = state.scheduler.status(&id).await.status;
            // A `created` marker belongs to an upload still in flight.
            if matches!(status, JobStatus::Unknown | JobStatus::Created) {
                return StatusCode::NOT_FOUND.into_response();
            }
            RelayTarget::Untracked { job_id: id.clone(), status }
        }
    };

    if !origins.allows(&headers) {
        tracing::warn!(
            job_id = %id,
            origin = ?headers.get(header::ORIGIN),
            "Rejected log subscriber from disallowed origin"
        );
        return StatusCode::FORBIDDEN.into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    tracing::info!(job_id = %id, "Log subscriber connected");
    let relay = Arc::clone(&state.relay);
    ws.on_upgrade(move |socket| ws::relay_session(socket, relay, target))
}

async fn download_result(
    State(state): State<ApiState>,
    Path((id, kind)): Path<(String, String)>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(status) => return status.into_response(),
    };
    let Some(relative) = ResultKind::parse(&kind).map(ResultKind::path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(workdir) = state.scheduler.workspace().locate(&id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let path = workdir.join(relative);
    let opened = match tokio::fs::File::open(&path).await {
        Ok(file) => file.metadata().await.map(|meta| (file, meta)),
        Err(e) => Err(e),
    };
    let (file, len) = match opened {
        Ok((file, meta)) if meta.is_file() => (file, meta.len()),
        Ok(_) => {
            tracing::debug!(job_id = %id, path = %path.display(), "Result path is not a file");
            return (StatusCode::NOT_FOUND, "File not found.").into_response();
        }
        Err(e) => {
            tracing::debug!(job_id = %id, path = %path.display(), error = %e, "Result not available");
            return (StatusCode::NOT_FOUND, "File not found.").into_response();
        }
    };

    let file_name = FsPath::new(relative)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| relative.to_string());
    (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={}", file_name),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response()
}

/// Downloadable artifacts produced by the worker image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultKind {
    Registered,
    ColorLut,
    Labels,
    All,
}

impl ResultKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "registered" => Some(Self::Registered),
            "colorlut" => Some(Self::ColorLut),
            "labels" => Some(Self::Labels),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn path(self) -> &'static str {
        match self {
            Self::Registered => "results/registered/UserToAtlas_Warped.nii.gz",
            Self::ColorLut => "results/atlas/sp2_label_512_3dslicer_v1.0.0.ctbl",
            Self::Labels => "results/labels/AtlasToUser_labels.nii.gz",
            Self::All => "abartResults.zip",
        }
    }
}

// -- Upload handling --

struct Upload {
    input: PathBuf,
    params: String,
}

struct Rejection {
    status: StatusCode,
    message: String,
}

impl Rejection {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

/// Stream the input file into `dir` and collect the parameters.
async fn read_upload(mut multipart: Multipart, dir: &FsPath) -> Result<Upload, Rejection> {
    let mut input = None;
    let mut params = None;

    loop {
        let mut field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Err(Rejection::bad_request(format!("Malformed upload: {}", e))),
        };

        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some(INPUT_FIELD) => {
                let name = safe_file_name(field.file_name().unwrap_or_default());
                let path = dir.join(&name);
                let mut file = tokio::fs::File::create(&path)
                    .await
                    .map_err(|e| Rejection::internal(format!("Error saving input file: {}", e)))?;
                let mut size = 0usize;
                loop {
                    match field.chunk().await {
                        Ok(Some(chunk)) => {
                            size += chunk.len();
                            file.write_all(&chunk).await.map_err(|e| {
                                Rejection::internal(format!("Error saving input file: {}", e))
                            })?;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            return Err(Rejection::bad_request(format!(
                                "Error retrieving the file: {}",
                                e
                            )));
                        }
                    }
                }
                file.flush()
                    .await
                    .map_err(|e| Rejection::internal(format!("Error saving input file: {}", e)))?;
                tracing::debug!(file = %name, size, "Input file stored");
                input = Some(path);
            }
            Some(PARAMS_FIELD) => {
                let text = field.text().await.map_err(|e| {
                    Rejection::bad_request(format!("Error retrieving parameters: {}", e))
                })?;
                params = Some(text);
            }
            other => tracing::debug!(field = ?other, "Ignoring unexpected form field"),
        }
    }

    let input = input.ok_or_else(|| Rejection::bad_request("Missing input file"))?;
    let params = params
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| Rejection::bad_request("Missing parameters"))?;
    Ok(Upload { input, params })
}

async fn mark_failed(dir: &JobDir) {
    if let Err(e) = write_marker(&dir.path, JobStatus::Failed).await {
        tracing::warn!(job_id = %dir.id, error = %e, "Failed to write status marker");
    }
}

/// Reduce a client-supplied file name to a safe base name.
///
/// Multi-part extensions such as `.nii.gz` are kept, since the worker uses
/// them to detect the image format.
fn safe_file_name(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        DEFAULT_INPUT_NAME.to_string()
    } else if [CONFIG_FILE, STATUS_FILE, PRE_TRANSFORM_FILE].contains(&cleaned) {
        format!("input_{}", cleaned)
    } else {
        cleaned.to_string()
    }
}
