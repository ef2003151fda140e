//! The stateless HTTP handlers behind `/sync`, plus auth and registration.
//! Every handler resolves the caller's email from the bearer token first,
//! then evaluates permissions on every path it touches; only then does it
//! read or mutate the snapshot folder and the metadata store.

use std::io::Write as _;
use std::path::PathBuf;

use axum::{
    extract::{FromRequestParts, Multipart, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use log::{debug, info, warn};
use serde::Deserialize;
use tower_http::compression::CompressionLayer;
use tower_http::decompression::RequestDecompressionLayer;

use crate::delta::{self, Delta};
use crate::errors::{ApiErrorKind, ErrorBody, SyncError};
use crate::metadata::{hash_bytes, FileMetadata};
use crate::permissions::{ComputedPermission, PermissionFile, PermissionKind};
use crate::protocol::{self, *};
use crate::server::auth::AuthService;
use crate::server::db::{self, MetaStore};
use crate::sync_path::SyncPath;

#[derive(Clone)]
pub struct AppState {
    pub store: MetaStore,
    pub auth: AuthService,
    pub snapshot: PathBuf,
    /// Every request as "METHOD /path", in arrival order. Cheap, bounded
    /// by test lifetimes in practice; also the debug log of the server.
    pub request_log: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
}

async fn log_requests(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let line = format!("{} {}", request.method(), request.uri().path());
    debug!("{line}");
    state.request_log.lock().unwrap().push(line);
    next.run(request).await
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sync/datasite_states", post(datasite_states))
        .route("/sync/dir_state", post(dir_state))
        .route("/sync/get_metadata", post(get_metadata))
        .route("/sync/get_diff", post(get_diff))
        .route("/sync/apply_diff", post(apply_diff))
        .route("/sync/create", post(create))
        .route("/sync/delete", post(delete))
        .route("/sync/download", post(download))
        .route("/sync/download_bulk", post(download_bulk))
        .route("/auth/request_email_token", post(request_email_token))
        .route("/auth/validate_email_token", post(validate_email_token))
        .route("/auth/whoami", post(whoami))
        .route("/register", post(register))
        .route("/info", get(info))
        .layer(axum::middleware::from_fn_with_state(state.clone(), log_requests))
        .layer(RequestDecompressionLayer::new())
        .layer(CompressionLayer::new())
        .with_state(state)
}

// ---- error envelope ----

/// Handler-side error carrying the wire kind; rendered as the JSON error
/// envelope with the matching status code.
#[derive(Debug)]
pub struct ServerError {
    kind: ApiErrorKind,
    message: String,
}

impl ServerError {
    fn new(kind: ApiErrorKind, message: impl Into<String>) -> ServerError {
        ServerError { kind, message: message.into() }
    }

    fn unauthorized(message: impl Into<String>) -> ServerError {
        Self::new(ApiErrorKind::Unauthorized, message)
    }

    fn denied(user: &str, path: &SyncPath, kind: PermissionKind) -> ServerError {
        warn!("Permission denied: {user} lacks {} on '{path}'", kind.name());
        Self::new(
            ApiErrorKind::PermissionDenied,
            format!("{user} may not {} '{path}'", kind.name()),
        )
    }

    fn not_found(path: &SyncPath) -> ServerError {
        Self::new(ApiErrorKind::NotFound, format!("'{path}' does not exist"))
    }

    fn bad_request(message: impl Into<String>) -> ServerError {
        Self::new(ApiErrorKind::BadRequest, message)
    }

    fn internal(message: impl Into<String>) -> ServerError {
        Self::new(ApiErrorKind::Internal, message)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match self.kind {
            ApiErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            ApiErrorKind::NotFound => StatusCode::NOT_FOUND,
            ApiErrorKind::AlreadyExists => StatusCode::CONFLICT,
            ApiErrorKind::HashMismatch => StatusCode::CONFLICT,
            ApiErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ApiErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody { error_kind: self.kind, message: self.message };
        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for ServerError {
    fn from(e: sqlx::Error) -> ServerError {
        match e {
            sqlx::Error::RowNotFound => Self::new(ApiErrorKind::NotFound, "no such row"),
            other => Self::internal(format!("database error: {other}")),
        }
    }
}

impl From<SyncError> for ServerError {
    fn from(e: SyncError) -> ServerError {
        match &e {
            SyncError::Api { kind, message } => Self::new(*kind, message.clone()),
            SyncError::Delta(_) => Self::bad_request(e.to_string()),
            SyncError::HashMismatch { .. } => Self::new(ApiErrorKind::HashMismatch, e.to_string()),
            _ => Self::internal(e.to_string()),
        }
    }
}

// ---- authentication extractor ----

/// The caller's email, resolved from the bearer token.
pub struct CurrentUser(pub String);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<CurrentUser, ServerError> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ServerError::unauthorized("missing Authorization header"))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ServerError::unauthorized("expected a bearer token"))?;
        let email = state.auth.resolve_bearer(token).map_err(ServerError::unauthorized)?;
        Ok(CurrentUser(email))
    }
}

// ---- permission gates ----

/// The operation gate for a single path, via the exact ancestor-chain rule
/// lookup (valid for paths that don't exist yet).
async fn check(state: &AppState, user: &str, path: &SyncPath, kind: PermissionKind) -> Result<(), ServerError> {
    let rules = state.store.rules_for_path(path).await?;
    let computed = ComputedPermission::evaluate(&rules, user, path);
    if computed.has_permission(kind) {
        Ok(())
    } else {
        Err(ServerError::denied(user, path, kind))
    }
}

/// The gate a mutation of `path` must pass: `write`, or `admin` when the
/// path is a permission file.
fn write_gate(path: &SyncPath) -> PermissionKind {
    if path.is_permission_file() {
        PermissionKind::Admin
    } else {
        PermissionKind::Write
    }
}

// ---- sync endpoints ----

async fn datasite_states(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<DatasiteStates>, ServerError> {
    let mut result = DatasiteStates::new();
    for datasite in state.store.list_datasites().await? {
        let rules = state.store.rules_under_dir(&datasite).await?;
        let files = state.store.list_metadata(&datasite).await?;
        let visible: Vec<FileMetadata> = files
            .into_iter()
            .filter(|m| ComputedPermission::evaluate(&rules, &user, &m.path).has_permission(PermissionKind::Read))
            .collect();
        if !visible.is_empty() {
            result.insert(datasite, visible);
        }
    }
    Ok(Json(result))
}

#[derive(Deserialize)]
struct DirQuery {
    dir: String,
}

async fn dir_state(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<DirQuery>,
) -> Result<Json<Vec<FileMetadata>>, ServerError> {
    let dir = SyncPath::try_from(query.dir.as_str()).map_err(ServerError::bad_request)?;
    let files = state.store.list_metadata(dir.as_str()).await?;
    let mut visible = Vec::with_capacity(files.len());
    for meta in files {
        // Rule lookup through the denormalized link table; evaluation
        // re-checks applicability exactly.
        let rules = state.store.rules_linked_to(&meta.path).await?;
        if ComputedPermission::evaluate(&rules, &user, &meta.path).has_permission(PermissionKind::Read) {
            visible.push(meta);
        }
    }
    Ok(Json(visible))
}

async fn get_metadata(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<PathRequest>,
) -> Result<Json<FileMetadata>, ServerError> {
    check(&state, &user, &request.path, PermissionKind::Read).await?;
    match state.store.get_metadata(&request.path).await? {
        Some(meta) => Ok(Json(meta)),
        None => Err(ServerError::not_found(&request.path)),
    }
}

async fn get_diff(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<DiffRequest>,
) -> Result<Json<DiffResponse>, ServerError> {
    check(&state, &user, &request.path, PermissionKind::Read).await?;
    if state.store.get_metadata(&request.path).await?.is_none() {
        return Err(ServerError::not_found(&request.path));
    }

    let disk = request.path.to_disk_path(&state.snapshot);
    let content = tokio::fs::read(&disk)
        .await
        .map_err(|e| ServerError::internal(format!("snapshot read of '{}': {e}", request.path)))?;

    let client_signature = protocol::decode_blob(&request.signature).map_err(ServerError::from)?;
    let diff = delta::diff(&client_signature, &content);

    Ok(Json(DiffResponse {
        path: request.path,
        diff: protocol::encode_blob(&diff)?,
        expected_hash: hash_bytes(&content),
    }))
}

async fn apply_diff(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<ApplyDiffRequest>,
) -> Result<Json<ApplyDiffResponse>, ServerError> {
    let path = request.path.clone();
    check(&state, &user, &path, write_gate(&path)).await?;
    if state.store.get_metadata(&path).await?.is_none() {
        return Err(ServerError::not_found(&path));
    }

    let disk = path.to_disk_path(&state.snapshot);
    let old = tokio::fs::read(&disk)
        .await
        .map_err(|e| ServerError::internal(format!("snapshot read of '{path}': {e}")))?;

    let diff: Delta = protocol::decode_blob(&request.diff)?;
    let new = delta::apply(&old, &diff)?;
    let new_hash = hash_bytes(&new);
    if new_hash != request.expected_hash {
        return Err(ServerError::new(
            ApiErrorKind::HashMismatch,
            format!("'{path}': expected {}, applying the diff yields {new_hash}", request.expected_hash),
        ));
    }

    // A permission file must still parse before it may replace the rules
    let parsed_permissions = parse_if_permission_file(&path, &new)?;

    // Stage next to the target, then: metadata row (and rules) inside one
    // IMMEDIATE transaction, rename over the target, commit. A crash
    // between the rename and the commit leaves DB and disk briefly
    // disagreeing; the startup rescan reconciles them.
    let staged = stage(&disk, new.clone()).await?;
    let meta = FileMetadata::from_bytes(path.clone(), &new, Utc::now())?;

    let mut tx = state.store.begin_immediate().await?;
    db::upsert_metadata(&mut tx, &meta).await?;
    if let Some(file) = &parsed_permissions {
        db::replace_rules(&mut tx, file).await?;
    }
    persist(staged, &disk).await?;
    tx.commit().await?;

    info!("{user} applied a diff to '{path}' ({} bytes, hash {new_hash})", new.len());
    Ok(Json(ApplyDiffResponse { path, applied_hash: new_hash }))
}

async fn create(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    mut multipart: Multipart,
) -> Result<Response, ServerError> {
    let field = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::bad_request(format!("bad multipart body: {e}")))?
        .ok_or_else(|| ServerError::bad_request("missing 'file' field"))?;
    if field.name() != Some("file") {
        return Err(ServerError::bad_request("expected a single 'file' field"));
    }
    let file_name = field
        .file_name()
        .ok_or_else(|| ServerError::bad_request("'file' field needs the relative path as its file name"))?
        .to_string();
    let path = SyncPath::try_from(file_name.as_str()).map_err(ServerError::bad_request)?;
    let data = field
        .bytes()
        .await
        .map_err(|e| ServerError::bad_request(format!("couldn't read upload: {e}")))?
        .to_vec();

    check(&state, &user, &path, PermissionKind::Create).await?;
    if path.is_permission_file() {
        // Creating a permission file is changing one
        check(&state, &user, &path, PermissionKind::Admin).await?;
    }
    let parsed_permissions = parse_if_permission_file(&path, &data)?;

    let disk = path.to_disk_path(&state.snapshot);
    let staged = stage(&disk, data.clone()).await?;
    let meta = FileMetadata::from_bytes(path.clone(), &data, Utc::now())?;

    let mut tx = state.store.begin_immediate().await?;
    if !db::insert_metadata_if_absent(&mut tx, &meta).await? {
        return Err(ServerError::new(ApiErrorKind::AlreadyExists, format!("'{path}' already exists")));
    }
    if let Some(file) = &parsed_permissions {
        db::replace_rules(&mut tx, file).await?;
    }
    persist(staged, &disk).await?;
    tx.commit().await?;

    info!("{user} created '{path}' ({} bytes)", data.len());
    Ok((StatusCode::CREATED, Json(meta)).into_response())
}

async fn delete(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<PathRequest>,
) -> Result<StatusCode, ServerError> {
    let path = request.path;
    check(&state, &user, &path, write_gate(&path)).await?;

    let mut tx = state.store.begin_immediate().await?;
    db::delete_metadata(&mut tx, &path)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => ServerError::not_found(&path),
            other => ServerError::from(other),
        })?;
    if path.is_permission_file() {
        let dir = path.parent().map(|p| p.to_string()).unwrap_or_default();
        db::delete_rules(&mut tx, &dir).await?;
    }

    let disk = path.to_disk_path(&state.snapshot);
    match tokio::fs::remove_file(&disk).await {
        Ok(()) => {}
        // Row existed but the file was already gone; the delete still wins
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(ServerError::internal(format!("couldn't delete '{path}': {e}"))),
    }
    tx.commit().await?;

    info!("{user} deleted '{path}'");
    Ok(StatusCode::NO_CONTENT)
}

async fn download(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<PathRequest>,
) -> Result<Response, ServerError> {
    check(&state, &user, &request.path, PermissionKind::Read).await?;
    if state.store.get_metadata(&request.path).await?.is_none() {
        return Err(ServerError::not_found(&request.path));
    }
    let disk = request.path.to_disk_path(&state.snapshot);
    let content = tokio::fs::read(&disk)
        .await
        .map_err(|e| ServerError::internal(format!("snapshot read of '{}': {e}", request.path)))?;
    Ok(([(axum::http::header::CONTENT_TYPE, "application/octet-stream")], content).into_response())
}

async fn download_bulk(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<BulkRequest>,
) -> Result<Response, ServerError> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for path in &request.paths {
        // Best-effort bundle: unreadable or missing entries are skipped
        let rules = state.store.rules_linked_to(path).await?;
        if !ComputedPermission::evaluate(&rules, &user, path).has_permission(PermissionKind::Read) {
            debug!("download_bulk: skipping '{path}' ({user} may not read it)");
            continue;
        }
        let disk = path.to_disk_path(&state.snapshot);
        let content = match tokio::fs::read(&disk).await {
            Ok(c) => c,
            Err(e) => {
                debug!("download_bulk: skipping '{path}': {e}");
                continue;
            }
        };
        zip.start_file(path.to_string(), options)
            .and_then(|()| zip.write_all(&content).map_err(zip::result::ZipError::Io))
            .map_err(|e| ServerError::internal(format!("zip error: {e}")))?;
    }
    let cursor = zip.finish().map_err(|e| ServerError::internal(format!("zip error: {e}")))?;
    Ok(([(axum::http::header::CONTENT_TYPE, "application/zip")], cursor.into_inner()).into_response())
}

// ---- auth and registration ----

async fn request_email_token(
    State(state): State<AppState>,
    Json(request): Json<EmailTokenRequest>,
) -> Result<Json<EmailTokenResponse>, ServerError> {
    if !crate::permissions::is_valid_email(&request.email) {
        return Err(ServerError::bad_request(format!("'{}' is not a valid email", request.email)));
    }
    // A real deployment delivers this by email; returning it directly is
    // the development flow.
    let email_token = state.auth.issue_email_token(&request.email).map_err(ServerError::internal)?;
    Ok(Json(EmailTokenResponse { email_token }))
}

async fn validate_email_token(
    State(state): State<AppState>,
    Json(request): Json<ValidateTokenRequest>,
) -> Result<Json<AccessTokenResponse>, ServerError> {
    let email = state
        .auth
        .validate_email_token(&request.email_token)
        .map_err(ServerError::unauthorized)?;
    let access_token = state.auth.issue_access_token(&email).map_err(ServerError::internal)?;
    info!("Issued access token for {email}");
    Ok(Json(AccessTokenResponse { access_token }))
}

async fn whoami(CurrentUser(user): CurrentUser) -> Json<WhoamiResponse> {
    Json(WhoamiResponse { email: user })
}

/// Records the user and creates their datasite root with the default
/// permission file. Unauthenticated: this is the bootstrap step.
async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Response, ServerError> {
    let email = request.email;
    if !crate::permissions::is_valid_email(&email) {
        return Err(ServerError::bad_request(format!("'{email}' is not a valid email")));
    }
    state.store.register_user(&email).await?;

    let site = state.snapshot.join(&email);
    tokio::fs::create_dir_all(&site)
        .await
        .map_err(|e| ServerError::internal(format!("couldn't create datasite folder: {e}")))?;

    let file = PermissionFile::default_for_owner(&email);
    let disk = file.path.to_disk_path(&state.snapshot);
    if !disk.exists() {
        let yaml = file.to_yaml().into_bytes();
        let meta = FileMetadata::from_bytes(file.path.clone(), &yaml, Utc::now())?;
        let staged = stage(&disk, yaml).await?;
        let mut tx = state.store.begin_immediate().await?;
        db::insert_metadata_if_absent(&mut tx, &meta).await?;
        db::replace_rules(&mut tx, &file).await?;
        persist(staged, &disk).await?;
        tx.commit().await?;
    }

    info!("Registered {email}");
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "status": "success" }))).into_response())
}

async fn info(State(_state): State<AppState>) -> Json<InfoResponse> {
    Json(InfoResponse { version: protocol::VERSION.to_string() })
}

// ---- staging helpers ----

fn parse_if_permission_file(path: &SyncPath, data: &[u8]) -> Result<Option<PermissionFile>, ServerError> {
    if !path.is_permission_file() {
        return Ok(None);
    }
    let text = std::str::from_utf8(data)
        .map_err(|_| ServerError::bad_request(format!("'{path}' is not valid UTF-8")))?;
    PermissionFile::parse(text, path)
        .map(Some)
        .map_err(|e| ServerError::bad_request(e.to_string()))
}

/// Writes `data` to a temp file alongside `target` (creating parents) and
/// hands back the staged path for a later atomic rename.
async fn stage(target: &std::path::Path, data: Vec<u8>) -> Result<tempfile::TempPath, ServerError> {
    let parent = target
        .parent()
        .ok_or_else(|| ServerError::internal("target has no parent"))?
        .to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<tempfile::TempPath> {
        std::fs::create_dir_all(&parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        Ok(tmp.into_temp_path())
    })
    .await
    .map_err(|e| ServerError::internal(format!("staging task: {e}")))?
    .map_err(|e| ServerError::internal(format!("staging failed: {e}")))
}

async fn persist(staged: tempfile::TempPath, target: &std::path::Path) -> Result<(), ServerError> {
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || staged.persist(&target))
        .await
        .map_err(|e| ServerError::internal(format!("rename task: {e}")))?
        .map_err(|e| ServerError::internal(format!("rename failed: {e}")))
}
