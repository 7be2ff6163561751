//! HTTP handlers implementing the §6 surface. Each maps a request onto the
//! §4 components (Instance Manager, Run Coordinator, Orchestrator Adapter,
//! Workspace Materializer) and the component errors into a `BrokerError`.

use std::net::SocketAddr;

use axum::Json;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::BrokerError;
use crate::instances::{CreateInstanceRequest, HostContext, Instance};
use crate::orchestrator::PathEntry;
use crate::workspace::{self, FileMap, TreeNode};

use super::{AppState, AuthContext, host_context_from_parts};

fn with_peer(mut ctx: HostContext, addr: Option<SocketAddr>) -> HostContext {
    if ctx.peer_addr.is_none() {
        ctx.peer_addr = addr.map(|a| a.ip().to_string());
    }
    ctx
}

// --- GET /me --------------------------------------------------------------

#[derive(Serialize)]
pub struct MeResponse {
    username: String,
    role: &'static str,
}

pub async fn me(auth: AuthContext) -> Json<MeResponse> {
    Json(MeResponse {
        username: auth.principal.username,
        role: role_str(auth.principal.role),
    })
}

fn role_str(role: crate::auth::Role) -> &'static str {
    match role {
        crate::auth::Role::Free => "FREE",
        crate::auth::Role::Member => "MEMBER",
        crate::auth::Role::Admin => "ADMIN",
    }
}

// --- POST /containers -------------------------------------------------------

#[derive(Serialize)]
pub struct CreateInstanceResponse {
    id: String,
    name: String,
    image: String,
    owner: String,
    role: &'static str,
    limited_by_quota: bool,
    #[serde(rename = "projectName")]
    project_name: String,
    vnc_url: String,
    ws_url: String,
    port: u16,
}

pub async fn create_container(
    State(state): State<AppState>,
    auth: AuthContext,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    parts: axum::extract::Request,
) -> Result<Json<CreateInstanceResponse>, BrokerError> {
    let (parts, body) = parts.into_parts();
    let request: CreateInstanceRequest = parse_json_body(body).await?;

    let ctx = with_peer(host_context_from_parts(&parts), connect_info.map(|c| c.0));
    let request_port = state.config.port;
    let role = auth.principal.role;
    let limited_by_quota = role == crate::auth::Role::Free;

    let instance = state
        .instances
        .provision(&auth.principal, request, &auth.bearer_token)
        .await?;

    let urls = state.instances.build_access_urls(&instance, &ctx, request_port);

    Ok(Json(CreateInstanceResponse {
        id: instance.id,
        name: instance.name,
        image: instance.image,
        owner: instance.owner,
        role: role_str(role),
        limited_by_quota,
        project_name: instance.project_name,
        vnc_url: urls.vnc_url,
        ws_url: urls.ws_url,
        port: instance.port,
    }))
}

async fn parse_json_body<T: serde::de::DeserializeOwned>(body: axum::body::Body) -> Result<T, BrokerError> {
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| BrokerError::Internal(format!("failed to read request body: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| BrokerError::Internal(format!("invalid request body: {e}")))
}

// --- GET /containers/my -----------------------------------------------------

pub async fn list_containers(State(state): State<AppState>, auth: AuthContext) -> Result<Json<Value>, BrokerError> {
    let records = state.instances.list(&auth.principal, &auth.bearer_token).await?;
    Ok(Json(records))
}

// --- GET /containers/{id}/urls ----------------------------------------------

pub async fn container_urls(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Result<Json<crate::instances::InstanceUrls>, BrokerError> {
    let records = state.metadata.list_instances(&auth.bearer_token).await?;
    let record = find_record(&records, &id).ok_or_else(|| BrokerError::NotFound(id.clone()))?;
    if record.port == 0 {
        return Err(BrokerError::NoExternalPort);
    }

    let instance = Instance {
        id: record.container_id,
        name: record.container_name,
        image: record.image_name,
        owner: record.owner_username,
        project_name: record.project_name.unwrap_or_default(),
        port: record.port,
    };
    // No request `Parts` available from an extractor-only handler; fall
    // back straight to the peer address + configured port.
    let ctx = HostContext {
        peer_addr: connect_info.map(|c| c.0.ip().to_string()),
        ..Default::default()
    };
    let urls = state.instances.build_access_urls(&instance, &ctx, state.config.port);
    Ok(Json(urls))
}

struct FoundRecord {
    container_id: String,
    container_name: String,
    owner_username: String,
    image_name: String,
    project_name: Option<String>,
    port: u16,
}

fn find_record(records: &Value, id: &str) -> Option<FoundRecord> {
    let array = records.as_array()?;
    let entry = array.iter().find(|r| r.get("containerId").and_then(Value::as_str) == Some(id))?;
    Some(FoundRecord {
        container_id: entry.get("containerId")?.as_str()?.to_string(),
        container_name: entry.get("containerName").and_then(Value::as_str).unwrap_or(id).to_string(),
        owner_username: entry.get("ownerUsername").and_then(Value::as_str).unwrap_or_default().to_string(),
        image_name: entry.get("imageName").and_then(Value::as_str).unwrap_or_default().to_string(),
        project_name: entry.get("projectName").and_then(Value::as_str).map(String::from),
        port: entry.get("port").and_then(Value::as_u64).unwrap_or(0) as u16,
    })
}

// --- DELETE /containers/{id} ------------------------------------------------

pub async fn delete_container(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<StatusCode, BrokerError> {
    state.instances.teardown(&auth.principal, &id, &auth.bearer_token).await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- PATCH /containers/{id} --------------------------------------------------

#[derive(Deserialize)]
pub struct RenameContainerRequest {
    project_name: String,
}

pub async fn rename_container(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    Json(body): Json<RenameContainerRequest>,
) -> Result<Json<Value>, BrokerError> {
    state
        .instances
        .rename(&auth.principal, &id, &body.project_name, &auth.bearer_token)
        .await?;
    Ok(Json(json!({ "message": "renamed" })))
}

// --- GET /files/{id} ---------------------------------------------------------

#[derive(Serialize)]
pub struct FilesResponse {
    tree: TreeNode,
    #[serde(rename = "fileMap")]
    file_map: FileMap,
}

pub async fn get_files(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Json<FilesResponse>, BrokerError> {
    let handle = state.instances.resolve(&id).await?;
    let entries: Vec<PathEntry> = state.orchestrator.read_tree(&handle.id, &state.config.workspace).await?;
    let (tree, file_map) = workspace::tree_from_entries(entries);
    Ok(Json(FilesResponse { tree, file_map }))
}

// --- POST /save ---------------------------------------------------------

#[derive(Deserialize)]
pub struct SaveRequest {
    container_id: String,
    tree: TreeNode,
    #[serde(rename = "fileMap")]
    file_map: FileMap,
    run_code: String,
}

pub async fn save_files(
    State(state): State<AppState>,
    _auth: AuthContext,
    Json(body): Json<SaveRequest>,
) -> Result<Json<Value>, BrokerError> {
    let handle = state.instances.resolve(&body.container_id).await?;
    state.orchestrator.ensure_dir(&handle.id, &state.config.workspace).await?;
    workspace::materialize(
        state.orchestrator.as_ref(),
        &handle.id,
        &state.config.workspace,
        &body.tree,
        &body.file_map,
        &body.run_code,
    )
    .await?;
    Ok(Json(json!({ "message": "saved" })))
}

// --- POST /run ---------------------------------------------------------

#[derive(Deserialize)]
pub struct RunRequest {
    container_id: String,
    session_id: String,
    tree: TreeNode,
    #[serde(rename = "fileMap")]
    file_map: FileMap,
    run_code: String,
}

pub async fn run(
    State(state): State<AppState>,
    _auth: AuthContext,
    Json(body): Json<RunRequest>,
) -> Result<Json<crate::run::RunOutcome>, BrokerError> {
    let handle = state.instances.resolve(&body.container_id).await?;
    let outcome = state
        .run_coordinator
        .run(&handle.id, &body.session_id, &body.tree, &body.file_map, &body.run_code)
        .await?;
    Ok(Json(outcome))
}

// --- PATCH /files/{id} ---------------------------------------------------------

#[derive(Deserialize)]
pub struct RenameFileRequest {
    old_path: String,
    new_name: String,
}

#[derive(Serialize)]
pub struct RenameFileResponse {
    message: &'static str,
    new_path: String,
}

pub async fn rename_file(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(id): Path<String>,
    Json(body): Json<RenameFileRequest>,
) -> Result<Json<RenameFileResponse>, BrokerError> {
    if body.new_name.is_empty() || body.new_name.contains('/') {
        return Err(BrokerError::InvalidRequest("new_name must be a single path segment".into()));
    }
    let handle = state.instances.resolve(&id).await?;
    let new_path = match body.old_path.rsplit_once('/') {
        Some((parent, _)) => format!("{parent}/{}", body.new_name),
        None => body.new_name.clone(),
    };
    state.orchestrator.move_path(&handle.id, &body.old_path, &new_path).await?;
    Ok(Json(RenameFileResponse { message: "renamed", new_path }))
}

// --- DELETE /files/{id} ---------------------------------------------------------

#[derive(Deserialize)]
pub struct DeleteFileRequest {
    file_path: String,
}

pub async fn delete_file(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(id): Path<String>,
    Json(body): Json<DeleteFileRequest>,
) -> Result<Json<Value>, BrokerError> {
    let handle = state.instances.resolve(&id).await?;
    state.orchestrator.remove_path(&handle.id, &body.file_path).await?;
    Ok(Json(json!({ "message": "deleted" })))
}
