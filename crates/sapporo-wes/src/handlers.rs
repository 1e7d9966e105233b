// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP endpoint handlers.
//!
//! Handlers stay thin: authentication, parameter parsing, then a call into
//! the store/index/supervisor. Every read of a single run goes to disk
//! (the filesystem is authoritative); only `GET /runs` is served from the
//! snapshot, with `latest=true` as the per-row disk bypass.

use axum::Json;
use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::auth::authorize_run_access;
use crate::db;
use crate::error::{AppError, Result};
use crate::run_store::RunDirEntry;
use crate::schemas::{
    ExecutableWorkflows, MeResponse, OutputsListResponse, RunId, RunListResponse, RunLog,
    RunStatus, RunSummary, ServiceInfo, TokenResponse,
};
use crate::server::AppState;
use crate::state::State as RunState;
use crate::supervisor;
use crate::validator::{self, RawRunRequest, UploadedFile};

// === service info ===

pub async fn get_service_info(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ServiceInfo>> {
    // Anonymous access is allowed; a valid token narrows the counts to the
    // caller's runs.
    let username = match state.auth.authenticate(&headers).await {
        Ok(user) => user,
        Err(_) => None,
    };
    let mut info = state.service_info.clone();
    let pool = state.index.pool().await;
    info.system_state_counts = db::system_state_counts(&pool, username.as_deref()).await?;
    Ok(Json(info))
}

pub async fn get_executable_workflows(
    State(state): State<AppState>,
) -> Json<ExecutableWorkflows> {
    Json(state.executable_workflows.clone())
}

// === run listing ===

#[derive(Debug)]
struct ListParams {
    page_size: i64,
    page_token: Option<String>,
    sort_order: db::SortOrder,
    state: Option<RunState>,
    run_ids: Option<Vec<String>>,
    latest: bool,
    tags: Vec<(String, String)>,
}

fn parse_list_params(pairs: &[(String, String)]) -> Result<ListParams> {
    let mut params = ListParams {
        page_size: 10,
        page_token: None,
        sort_order: db::SortOrder::Desc,
        state: None,
        run_ids: None,
        latest: false,
        tags: Vec::new(),
    };
    for (key, value) in pairs {
        match key.as_str() {
            "page_size" => {
                params.page_size = value
                    .parse::<i64>()
                    .ok()
                    .filter(|n| *n >= 1)
                    .ok_or_else(|| {
                        AppError::InvalidRequest("`page_size` must be a positive integer".into())
                    })?;
            }
            "page_token" => {
                if !value.is_empty() {
                    params.page_token = Some(value.clone());
                }
            }
            "sort_order" => {
                params.sort_order = match value.as_str() {
                    "asc" => db::SortOrder::Asc,
                    "desc" => db::SortOrder::Desc,
                    other => {
                        return Err(AppError::InvalidRequest(format!(
                            "invalid `sort_order`: {other}"
                        )));
                    }
                };
            }
            "state" => {
                params.state = Some(value.parse().map_err(|_| {
                    AppError::InvalidRequest(format!("invalid `state`: {value}"))
                })?);
            }
            "run_ids" => {
                params
                    .run_ids
                    .get_or_insert_with(Vec::new)
                    .push(value.clone());
            }
            "latest" => {
                params.latest = value == "true" || value == "1";
            }
            "tags" => {
                let (tag_key, tag_value) = value.split_once(':').ok_or_else(|| {
                    AppError::InvalidRequest(format!("invalid `tags` entry (want key:value): {value}"))
                })?;
                params
                    .tags
                    .push((tag_key.to_string(), tag_value.to_string()));
            }
            _ => {}
        }
    }
    Ok(params)
}

pub async fn list_runs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<RunListResponse>> {
    let username = state.auth.authenticate(&headers).await?;
    let params = parse_list_params(&pairs)?;

    let filter = db::RunFilter {
        state: params.state,
        run_ids: params.run_ids.clone(),
        username: username.clone(),
        tags: params.tags.clone(),
    };
    let pool = state.index.pool().await;
    let (rows, next_page_token) = db::list_runs(
        &pool,
        &filter,
        params.page_size,
        params.page_token.as_deref(),
        params.sort_order,
        state.index.token_signer(),
    )
    .await?;
    let total_runs = db::count_runs(&pool, &filter).await?;

    let mut runs: Vec<RunSummary> = Vec::with_capacity(rows.len());
    for row in rows {
        if params.latest {
            // Bypass the snapshot: the matched row is re-read from disk.
            let run_id = row.run_id.clone();
            if state.store.exists(&run_id).await {
                runs.push(state.store.load_summary(&run_id).await);
            } else {
                runs.push(row.into_summary());
            }
        } else {
            runs.push(row.into_summary());
        }
    }

    Ok(Json(RunListResponse {
        runs,
        next_page_token,
        total_runs,
    }))
}

// === run creation ===

pub async fn post_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> Result<Json<RunId>> {
    let username = state.auth.authenticate(&headers).await?;
    let raw = extract_raw_request(&state, request).await?;
    let validated = validator::validate_run_request(
        raw,
        &state.service_info,
        &state.executable_workflows,
    )?;

    let new_run = crate::run_store::NewRun {
        run_request: validated.run_request,
        username: username.clone(),
        engine_params: validated.engine_params,
        service_config: state.config.capture(),
        attachments: validated.attachments,
    };
    let run_id = state.store.create(new_run).await?;

    // Make the run visible to list queries before the next snapshot
    let summary = state.store.load_summary(&run_id).await;
    let pool = state.index.pool().await;
    if let Err(e) = db::upsert_run(&pool, &summary, username.as_deref()).await {
        warn!(run_id = %run_id, error = %e, "failed to insert index row");
    }

    if let Err(e) = supervisor::fork_dispatcher(
        &state.store,
        &state.index,
        &state.config.run_sh,
        &run_id,
        state.run_lock(&run_id),
    )
    .await
    {
        // Never surfaced synchronously: the run exists, its terminal state
        // tells the story on the next status read.
        warn!(run_id = %run_id, error = %e, "dispatcher fork failed");
        let _ = state
            .store
            .append_system_log(&run_id, &format!("failed to fork dispatcher: {e}"))
            .await;
        let _ = state.store.write_state(&run_id, RunState::SystemError).await;
    }

    info!(run_id = %run_id, username = ?username, "run accepted");
    Ok(Json(RunId { run_id }))
}

/// Lower either body form into [`RawRunRequest`].
async fn extract_raw_request(state: &AppState, request: Request) -> Result<RawRunRequest> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, state)
            .await
            .map_err(|e| AppError::InvalidRequest(format!("invalid multipart body: {e}")))?;
        raw_from_multipart(multipart).await
    } else if content_type.starts_with("application/json") {
        let bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
            .await
            .map_err(|e| AppError::InvalidRequest(format!("failed to read body: {e}")))?;
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| AppError::InvalidRequest(format!("invalid JSON body: {e}")))?;
        RawRunRequest::from_json(value)
    } else {
        Err(AppError::InvalidRequest(format!(
            "unsupported content type: {content_type}"
        )))
    }
}

async fn raw_from_multipart(mut multipart: Multipart) -> Result<RawRunRequest> {
    let mut raw = RawRunRequest::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidRequest(format!("invalid multipart field: {e}")))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        if name == "workflow_attachment" {
            let file_name = field.file_name().map(str::to_string).unwrap_or_default();
            if file_name.is_empty() {
                continue;
            }
            let bytes = field
                .bytes()
                .await
                .map_err(|e| AppError::InvalidRequest(format!("failed to read attachment: {e}")))?;
            raw.workflow_attachment.push(UploadedFile {
                file_name,
                bytes: bytes.to_vec(),
            });
            continue;
        }
        let text = field
            .text()
            .await
            .map_err(|e| AppError::InvalidRequest(format!("failed to read field `{name}`: {e}")))?;
        match name.as_str() {
            "workflow_params" => raw.workflow_params = Some(Value::String(text)),
            "workflow_type" => raw.workflow_type = Some(text),
            "workflow_type_version" => raw.workflow_type_version = Some(text),
            "tags" => raw.tags = Some(Value::String(text)),
            "workflow_engine" => raw.workflow_engine = Some(text),
            "workflow_engine_version" => raw.workflow_engine_version = Some(text),
            "workflow_engine_parameters" => {
                raw.workflow_engine_parameters = Some(Value::String(text));
            }
            "workflow_url" => raw.workflow_url = Some(text),
            "workflow_attachment_obj" => {
                raw.workflow_attachment_obj = Some(Value::String(text));
            }
            _ => {}
        }
    }
    Ok(raw)
}

// === single-run reads ===

/// Authenticate the caller and gate access to `run_id`.
async fn gate(state: &AppState, headers: &HeaderMap, run_id: &str) -> Result<Option<String>> {
    let username = state.auth.authenticate(headers).await?;
    let exists = state.store.exists(run_id).await;
    let owner = if exists {
        state.store.read_username(run_id).await
    } else {
        None
    };
    authorize_run_access(username.as_deref(), exists, owner.as_deref())?;
    Ok(username)
}

pub async fn get_run_log(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<Json<RunLog>> {
    gate(&state, &headers, &run_id).await?;
    Ok(Json(state.store.load_log(&run_id).await))
}

pub async fn get_run_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<Json<RunStatus>> {
    gate(&state, &headers, &run_id).await?;
    Ok(Json(RunStatus {
        run_id: run_id.clone(),
        state: state.store.read_state(&run_id).await,
    }))
}

// === cancellation & deletion ===

pub async fn cancel_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<Json<RunId>> {
    gate(&state, &headers, &run_id).await?;
    let lock = state.run_lock(&run_id);
    let _guard = lock.lock().await;
    supervisor::cancel_run(&state.store, &run_id).await?;
    Ok(Json(RunId { run_id }))
}

pub async fn delete_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<Json<RunId>> {
    gate(&state, &headers, &run_id).await?;
    delete_one(&state, &run_id).await?;
    Ok(Json(RunId { run_id }))
}

#[derive(Debug, serde::Serialize)]
pub struct DeletedRuns {
    run_ids: Vec<String>,
}

pub async fn delete_runs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<DeletedRuns>> {
    let run_ids: Vec<String> = pairs
        .iter()
        .filter(|(k, _)| k == "run_ids")
        .map(|(_, v)| v.clone())
        .collect();
    if run_ids.is_empty() {
        return Err(AppError::InvalidRequest("`run_ids` is required".into()));
    }
    // Authorize everything before deleting anything
    for run_id in &run_ids {
        gate(&state, &headers, run_id).await?;
    }
    for run_id in &run_ids {
        delete_one(&state, run_id).await?;
    }
    Ok(Json(DeletedRuns { run_ids }))
}

async fn delete_one(state: &AppState, run_id: &str) -> Result<()> {
    let lock = state.run_lock(run_id);
    let _guard = lock.lock().await;
    state.store.delete(run_id).await?;
    let pool = state.index.pool().await;
    db::mark_deleted(&pool, run_id).await?;
    info!(run_id = %run_id, "run deleted");
    Ok(())
}

// === outputs & files ===

fn wants_download(pairs: &[(String, String)]) -> bool {
    pairs
        .iter()
        .any(|(k, v)| k == "download" && (v == "true" || v == "1"))
}

pub async fn get_outputs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Response> {
    gate(&state, &headers, &run_id).await?;
    let outputs = state
        .store
        .list_outputs(&run_id, &state.config.base_url)
        .await?;
    let body = Json(OutputsListResponse { outputs });
    if wants_download(&pairs) {
        Ok((
            [(
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"outputs.json\"",
            )],
            body,
        )
            .into_response())
    } else {
        Ok(body.into_response())
    }
}

pub async fn get_output_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((run_id, path)): Path<(String, String)>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Response> {
    gate(&state, &headers, &run_id).await?;
    let file_path = state.store.resolve_output_path(&run_id, &path)?;
    serve_file(file_path, wants_download(&pairs)).await
}

pub async fn get_data_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((run_id, path)): Path<(String, String)>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Response> {
    gate(&state, &headers, &run_id).await?;
    let file_path = state.store.resolve_data_path(&run_id, &path)?;
    serve_file(file_path, wants_download(&pairs)).await
}

pub async fn get_ro_crate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Response> {
    gate(&state, &headers, &run_id).await?;
    let path = state.store.entry_path(&run_id, RunDirEntry::RoCrate);
    serve_file(path, wants_download(&pairs)).await
}

async fn serve_file(path: std::path::PathBuf, download: bool) -> Result<Response> {
    let file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound("file not found".into()));
        }
        Err(e) => return Err(e.into()),
    };
    let meta = file.metadata().await?;
    if meta.is_dir() {
        return Err(AppError::NotFound("file not found".into()));
    }

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, header::HeaderValue::from(meta.len()));
    if download {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        if let Ok(value) =
            header::HeaderValue::from_str(&format!("attachment; filename=\"{file_name}\""))
        {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
    Ok(response)
}

// === tasks (protocol-level unsupported) ===

pub async fn list_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<Response> {
    gate(&state, &headers, &run_id).await?;
    Err(AppError::Unsupported(
        "task listing is unsupported in this implementation".into(),
    ))
}

pub async fn get_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((run_id, _task_id)): Path<(String, String)>,
) -> Result<Response> {
    gate(&state, &headers, &run_id).await?;
    Err(AppError::Unsupported(
        "task logs are unsupported in this implementation".into(),
    ))
}

// === auth endpoints ===

pub async fn post_token(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<TokenResponse>> {
    let mut username = None;
    let mut password = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidRequest(format!("invalid form: {e}")))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let text = field
            .text()
            .await
            .map_err(|e| AppError::InvalidRequest(format!("invalid form field: {e}")))?;
        match name.as_str() {
            "username" => username = Some(text),
            "password" => password = Some(text),
            _ => {}
        }
    }
    let username =
        username.ok_or_else(|| AppError::InvalidRequest("`username` is required".into()))?;
    let password =
        password.ok_or_else(|| AppError::InvalidRequest("`password` is required".into()))?;

    let access_token = state.auth.login(&username, &password)?;
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer".to_string(),
    }))
}

pub async fn get_me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MeResponse>> {
    if !state.auth.enabled() {
        return Err(AppError::InvalidRequest(
            "authentication is disabled on this service".into(),
        ));
    }
    let username = state
        .auth
        .authenticate(&headers)
        .await?
        .ok_or_else(|| AppError::Unauthenticated("missing credentials".into()))?;
    Ok(Json(MeResponse { username }))
}

/// Fallback for unmatched paths, so even 404s keep the error body shape.
pub async fn not_found() -> Response {
    AppError::NotFound("not found".into()).into_response()
}

/// Health probe; not part of the WES surface.
pub async fn healthcheck() -> StatusCode {
    StatusCode::OK
}
