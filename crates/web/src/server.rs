//! Web server implementation

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};
use uuid::Uuid;

use cib_common::builder::{self, UserData};
use cib_common::validation;
use cib_common::{
    BuildManager, BuildSession, BuildState, BuilderConfig, Database, Error, KeyKind,
    PartitionError, PartitionLimits, PartitionView, Platform, Role, SessionStore, UserRecord,
    ValidationError, Vessel, API_VERSION,
};

/// Cookie holding the browser's session id
pub const SESSION_COOKIE: &str = "cib_session";

/// Response header carrying an installer's SHA-256
pub const CHECKSUM_HEADER: &str = "x-checksum-sha256";

/// Web server state
#[derive(Clone)]
pub struct WebServer {
    state: Arc<WebServerState>,
}

struct WebServerState {
    sessions: Arc<dyn SessionStore>,
    limits: PartitionLimits,
    builds: BuildManager,
}

pub async fn serve(addr: SocketAddr, cfg: &BuilderConfig) -> anyhow::Result<()> {
    let server = WebServer::from_config(cfg)?;
    server.serve(addr).await
}

impl WebServer {
    /// Create a new web server
    pub fn new(sessions: Arc<dyn SessionStore>, builds: BuildManager) -> Self {
        Self {
            state: Arc::new(WebServerState {
                sessions,
                limits: builds.limits(),
                builds,
            }),
        }
    }

    /// Open the store and build manager named by `cfg`
    pub fn from_config(cfg: &BuilderConfig) -> cib_common::Result<Self> {
        let db = Database::open(cfg.db_path(), cfg.limits())?;
        let builds = BuildManager::from_config(cfg, db.clone())?;
        Ok(Self::new(Arc::new(db), builds))
    }

    /// Create router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/health", get(health_handler))
            .route("/api/version", get(version_handler))

            // Session state
            .route("/api/state", get(get_state_handler).post(save_state_handler))
            .route("/api/state/reset", post(reset_state_handler))
            .route("/api/state/view", get(view_handler))

            // Users
            .route("/api/users", post(add_user_handler))
            .route("/api/users/:name", delete(remove_user_handler))

            // Vessels
            .route("/api/vessels/split", post(split_handler))
            .route("/api/vessels/:index", delete(remove_vessel_handler))
            .route(
                "/api/vessels/:index/owner",
                put(set_owner_handler).delete(clear_owner_handler),
            )
            .route("/api/vessels/:index/users", post(add_member_handler))
            .route("/api/vessels/:index/users/:user", delete(remove_member_handler))

            // Builds
            .route("/api/build", post(build_session_handler))
            .route("/api/v1/build", post(build_request_handler))
            .route("/api/builds/:build_id", get(build_status_handler))

            // Downloads
            .route("/download/:build_id/keys/:kind", get(download_keys_handler))
            .route(
                "/download/:build_id/installers/:platform",
                get(download_installer_handler),
            )

            // Fallback
            .fallback(not_found_handler)
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Start the web server
    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        info!("Installer builder listening on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error returned by API handlers, rendered as `{"error": "..."}`
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Builder(#[from] Error),

    #[error("{0}")]
    BadRequest(String),
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::Builder(e.into())
    }
}

impl From<PartitionError> for ApiError {
    fn from(e: PartitionError) -> Self {
        ApiError::Builder(e.into())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError::Builder(Error::Internal(e.to_string()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Builder(e) if e.is_user_error() => (StatusCode::BAD_REQUEST, e.to_string()),
            ApiError::Builder(Error::NotFound { .. }) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message.clone()),
            ApiError::Builder(e) => {
                error!("request failed: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============================================================================
// Sessions
// ============================================================================

/// Session id from the cookie, minting one (and setting the cookie) if absent
fn session_id(jar: CookieJar) -> (CookieJar, String) {
    let existing = jar
        .get(SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| Uuid::parse_str(v).is_ok());

    match existing {
        Some(id) => (jar, id),
        None => {
            let id = Uuid::new_v4().to_string();
            debug!(session = %id, "starting build session");
            let cookie = Cookie::build((SESSION_COOKIE, id.clone()))
                .path("/")
                .http_only(true);
            (jar.add(cookie), id)
        }
    }
}

fn load_session(state: &WebServerState, id: &str) -> ApiResult<BuildSession> {
    let stored = state.sessions.restore(id)?;
    Ok(BuildSession::from_state(stored, state.limits)?)
}

/// Restore the session, apply `f` and persist the result
fn mutate_session<F>(
    state: &WebServerState,
    jar: CookieJar,
    f: F,
) -> ApiResult<(CookieJar, Json<BuildState>)>
where
    F: FnOnce(&mut BuildSession) -> cib_common::Result<()>,
{
    let (jar, id) = session_id(jar);
    let mut session = load_session(state, &id)?;
    f(&mut session)?;

    let updated = session.to_state();
    state.sessions.save(Some(&id), &updated)?;
    Ok((jar, Json(updated)))
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "cib-web"
    }))
}

async fn version_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "version": API_VERSION,
        "builder": cib_common::VERSION,
    }))
}

async fn get_state_handler(
    State(state): State<Arc<WebServerState>>,
    jar: CookieJar,
) -> ApiResult<impl IntoResponse> {
    let (jar, id) = session_id(jar);
    let restored = state.sessions.restore(&id)?;
    Ok((jar, Json(restored)))
}

async fn save_state_handler(
    State(state): State<Arc<WebServerState>>,
    jar: CookieJar,
    Json(body): Json<BuildState>,
) -> ApiResult<impl IntoResponse> {
    let (jar, id) = session_id(jar);
    let session = BuildSession::from_state(body, state.limits)?;
    let saved = session.to_state();
    state.sessions.save(Some(&id), &saved)?;
    Ok((jar, Json(saved)))
}

async fn reset_state_handler(
    State(state): State<Arc<WebServerState>>,
    jar: CookieJar,
) -> ApiResult<impl IntoResponse> {
    let (jar, id) = session_id(jar);
    let reset = state.sessions.reset(&id)?;
    Ok((jar, Json(reset)))
}

async fn view_handler(
    State(state): State<Arc<WebServerState>>,
    jar: CookieJar,
) -> ApiResult<impl IntoResponse> {
    let (jar, id) = session_id(jar);
    let session = load_session(&state, &id)?;
    Ok((jar, Json(PartitionView::render(session.partition()))))
}

async fn add_user_handler(
    State(state): State<Arc<WebServerState>>,
    jar: CookieJar,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let mut name = None;
    let mut public_key = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("name") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.body_text()))?;
                name = Some(text.trim().to_string());
            }
            Some("public_key") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.body_text()))?;
                // browsers send an empty part when no file was chosen
                if !bytes.is_empty() {
                    public_key = Some(validation::validate_key_upload(&bytes)?);
                }
            }
            _ => {}
        }
    }

    let mut user = UserRecord::new(name.unwrap_or_default());
    user.public_key = public_key;
    mutate_session(&state, jar, |session| session.add_user(user))
}

async fn remove_user_handler(
    State(state): State<Arc<WebServerState>>,
    jar: CookieJar,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    mutate_session(&state, jar, |session| session.remove_user(&name).map(drop))
}

#[derive(Debug, Deserialize)]
struct SplitRequest {
    offset: u32,
}

async fn split_handler(
    State(state): State<Arc<WebServerState>>,
    jar: CookieJar,
    Json(req): Json<SplitRequest>,
) -> ApiResult<impl IntoResponse> {
    mutate_session(&state, jar, |session| {
        session.split(req.offset);
        Ok(())
    })
}

async fn remove_vessel_handler(
    State(state): State<Arc<WebServerState>>,
    jar: CookieJar,
    Path(index): Path<usize>,
) -> ApiResult<impl IntoResponse> {
    mutate_session(&state, jar, |session| session.remove_vessel(index).map(drop))
}

#[derive(Debug, Deserialize)]
struct UserRequest {
    user: String,
}

async fn set_owner_handler(
    State(state): State<Arc<WebServerState>>,
    jar: CookieJar,
    Path(index): Path<usize>,
    Json(req): Json<UserRequest>,
) -> ApiResult<impl IntoResponse> {
    mutate_session(&state, jar, |session| {
        session.assign(index, Role::Owner, &req.user)
    })
}

async fn clear_owner_handler(
    State(state): State<Arc<WebServerState>>,
    jar: CookieJar,
    Path(index): Path<usize>,
) -> ApiResult<impl IntoResponse> {
    mutate_session(&state, jar, |session| session.clear_owner(index).map(drop))
}

async fn add_member_handler(
    State(state): State<Arc<WebServerState>>,
    jar: CookieJar,
    Path(index): Path<usize>,
    Json(req): Json<UserRequest>,
) -> ApiResult<impl IntoResponse> {
    mutate_session(&state, jar, |session| {
        session.assign(index, Role::Member, &req.user)
    })
}

async fn remove_member_handler(
    State(state): State<Arc<WebServerState>>,
    jar: CookieJar,
    Path((index, user)): Path<(usize, String)>,
) -> ApiResult<impl IntoResponse> {
    mutate_session(&state, jar, |session| session.remove_member(index, &user))
}

async fn build_session_handler(
    State(state): State<Arc<WebServerState>>,
    jar: CookieJar,
) -> ApiResult<impl IntoResponse> {
    let (jar, id) = session_id(jar);
    let build_state = load_session(&state, &id)?.to_state();

    let builds = state.builds.clone();
    let results = tokio::task::spawn_blocking(move || builds.prepare(&build_state)).await??;
    Ok((jar, Json(results)))
}

#[derive(Debug, Deserialize)]
struct BuildRequest {
    vessels: Vec<Vessel>,
    #[serde(default)]
    user_data: BTreeMap<String, UserData>,
}

async fn build_request_handler(
    State(state): State<Arc<WebServerState>>,
    Json(req): Json<BuildRequest>,
) -> ApiResult<impl IntoResponse> {
    let build_state = builder::state_from_request(req.vessels, req.user_data);

    let builds = state.builds.clone();
    let results = tokio::task::spawn_blocking(move || builds.prepare(&build_state)).await??;
    Ok(Json(results))
}

async fn build_status_handler(
    State(state): State<Arc<WebServerState>>,
    Path(build_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.builds.status(&build_id)?))
}

async fn download_keys_handler(
    State(state): State<Arc<WebServerState>>,
    Path((build_id, kind)): Path<(String, String)>,
) -> ApiResult<Response> {
    let kind: KeyKind = kind.parse()?;

    let builds = state.builds.clone();
    let path = tokio::task::spawn_blocking(move || builds.key_bundle(&build_id, kind)).await??;
    file_response(path).await
}

async fn download_installer_handler(
    State(state): State<Arc<WebServerState>>,
    Path((build_id, platform)): Path<(String, String)>,
) -> ApiResult<Response> {
    let platform: Platform = platform.parse()?;

    let builds = state.builds.clone();
    let installer =
        tokio::task::spawn_blocking(move || builds.package(&build_id, platform)).await??;
    let mut response = file_response(installer.path).await?;
    if let Ok(value) = HeaderValue::from_str(&installer.sha256) {
        response.headers_mut().insert(CHECKSUM_HEADER, value);
    }
    Ok(response)
}

async fn file_response(path: PathBuf) -> ApiResult<Response> {
    let bytes = tokio::fs::read(&path).await.map_err(Error::from)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mime = mime_guess::from_path(&path).first_or_octet_stream();

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "not found"})),
    )
}
