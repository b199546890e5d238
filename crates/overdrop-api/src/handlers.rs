use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use overdrop_domain::{
    ArtifactInfo, DeploymentConstructor, DeploymentId, DeploymentStatus, DeploymentType,
    DeviceDeploymentStatus, DeviceId, ImageId, InstalledArtifact, LogMessage, Payload, Tag,
};
use overdrop_engine::{CommitUpload, DeviceWork, NewImage};
use overdrop_store::{
    DeploymentQuery, DeviceStateFilter, ImageFilter, ImageSort, ReleaseFilter, SortOrder,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::{request_tenant, DEVICE_HEADER};
use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_PER_PAGE: usize = 20;
const DEFAULT_LINK_EXPIRE: Duration = Duration::from_secs(900);

fn device_from(headers: &HeaderMap) -> Result<DeviceId, ApiError> {
    headers
        .get(DEVICE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(DeviceId::new)
        .ok_or_else(|| ApiError::bad_request("missing device identity"))
}

fn parse_deployment_id(s: &str) -> Result<DeploymentId, ApiError> {
    DeploymentId::parse(s).map_err(|_| ApiError::bad_request("malformed deployment id"))
}

fn parse_image_id(s: &str) -> Result<ImageId, ApiError> {
    ImageId::parse(s).map_err(|_| ApiError::bad_request("malformed artifact id"))
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn ready(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let tenant = request_tenant(&headers);
    state.engine.healthy(&tenant).await?;
    Ok(StatusCode::OK)
}

// ── Device API ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DeviceProvides {
    #[serde(default)]
    pub artifact_name: String,
    pub device_type: String,
    #[serde(default)]
    pub artifact_provides: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct NextRequest {
    pub device_provides: DeviceProvides,
    /// Accepted but unused; pause states are driven by device reports.
    #[serde(default)]
    #[allow(dead_code)]
    pub update_control_map: Option<Value>,
}

fn render_work(work: DeviceWork) -> Value {
    let mut body = json!({
        "id": work.id,
        "type": work.deployment_type,
    });
    if let Some(link) = work.link {
        body["artifact"] = json!({
            "artifact_name": work.artifact_name,
            "source": { "uri": link.uri, "expire": link.expire },
            "device_types_compatible": work.device_types_compatible,
        });
    }
    if let Some(configuration) = work.configuration {
        body["configuration"] = configuration;
    }
    body
}

pub async fn next_deployment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NextRequest>,
) -> Result<Response, ApiError> {
    let tenant = request_tenant(&headers);
    let device = device_from(&headers)?;
    if body.device_provides.device_type.is_empty() {
        return Err(ApiError::bad_request("device_type must not be empty"));
    }
    let installed = InstalledArtifact {
        artifact_name: body.device_provides.artifact_name,
        device_type: body.device_provides.device_type,
        provides: body.device_provides.artifact_provides,
    };
    match state
        .engine
        .next_deployment(&tenant, &device, installed)
        .await?
    {
        None => Ok(StatusCode::NO_CONTENT.into_response()),
        Some(work) => Ok((StatusCode::OK, Json(render_work(work))).into_response()),
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusReport {
    pub status: String,
    #[serde(default)]
    pub substate: Option<String>,
}

/// Statuses a device may report. The rest are owned by the server.
fn parse_device_status(s: &str) -> Result<DeviceDeploymentStatus, ApiError> {
    let status: DeviceDeploymentStatus = s
        .parse()
        .map_err(|_| ApiError::bad_request(format!("unknown status '{}'", s)))?;
    match status {
        DeviceDeploymentStatus::Pending
        | DeviceDeploymentStatus::Aborted
        | DeviceDeploymentStatus::NoArtifact
        | DeviceDeploymentStatus::Decommissioned => Err(ApiError::bad_request(format!(
            "status '{}' cannot be reported by a device",
            s
        ))),
        other => Ok(other),
    }
}

pub async fn put_device_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(report): Json<StatusReport>,
) -> Result<StatusCode, ApiError> {
    let tenant = request_tenant(&headers);
    let device = device_from(&headers)?;
    let deployment_id = parse_deployment_id(&id)?;
    let status = parse_device_status(&report.status)?;
    state
        .engine
        .update_device_status(&tenant, deployment_id, &device, status, report.substate)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct LogBody {
    pub messages: Vec<LogMessage>,
}

pub async fn put_device_log(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<LogBody>,
) -> Result<StatusCode, ApiError> {
    let tenant = request_tenant(&headers);
    let device = device_from(&headers)?;
    let deployment_id = parse_deployment_id(&id)?;
    state
        .engine
        .save_device_log(&tenant, deployment_id, &device, body.messages)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Management: deployments ───────────────────────────────────────────────────

pub async fn post_deployment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(constructor): Json<DeploymentConstructor>,
) -> Result<Response, ApiError> {
    let tenant = request_tenant(&headers);
    let deployment = state.engine.create_deployment(&tenant, constructor).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": deployment.id }))).into_response())
}

#[derive(Debug, Deserialize, Default)]
pub struct DeploymentListParams {
    pub search: Option<String>,
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub deployment_type: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub sort: Option<String>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

fn parse_list_params(params: DeploymentListParams) -> Result<DeploymentQuery, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(|s| {
            s.parse::<DeploymentStatus>()
                .map_err(|_| ApiError::bad_request(format!("unknown status '{}'", s)))
        })
        .transpose()?;
    let deployment_type = match params.deployment_type.as_deref() {
        None => None,
        Some("software") => Some(DeploymentType::Software),
        Some("configuration") => Some(DeploymentType::Configuration),
        Some(other) => {
            return Err(ApiError::bad_request(format!(
                "unknown deployment type '{}'",
                other
            )))
        }
    };
    let sort = match params.sort.as_deref() {
        None | Some("desc") => SortOrder::Descending,
        Some("asc") => SortOrder::Ascending,
        Some(other) => return Err(ApiError::bad_request(format!("unknown sort '{}'", other))),
    };
    let page = params.page.unwrap_or(1).max(1);
    let per_page = params.per_page.unwrap_or(DEFAULT_PER_PAGE).max(1);
    Ok(DeploymentQuery {
        search: params.search,
        status,
        deployment_type,
        created_after: params.created_after,
        created_before: params.created_before,
        sort,
        skip: (page - 1) * per_page,
        limit: per_page,
    })
}

pub async fn list_deployments(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<DeploymentListParams>,
) -> Result<Response, ApiError> {
    let tenant = request_tenant(&headers);
    let query = parse_list_params(params)?;
    let (deployments, total) = state.engine.find_deployments(&tenant, &query).await?;
    let mut response = Json(json!(deployments)).into_response();
    response
        .headers_mut()
        .insert("X-Total-Count", total.into());
    Ok(response)
}

pub async fn get_deployment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let tenant = request_tenant(&headers);
    let deployment = state
        .engine
        .get_deployment(&tenant, parse_deployment_id(&id)?)
        .await?;
    Ok(Json(json!(deployment)))
}

pub async fn get_deployment_statistics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let tenant = request_tenant(&headers);
    let stats = state
        .engine
        .deployment_stats(&tenant, parse_deployment_id(&id)?)
        .await?;
    Ok(Json(json!(stats)))
}

#[derive(Debug, Deserialize)]
pub struct StatusChange {
    pub status: String,
}

pub async fn put_deployment_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(change): Json<StatusChange>,
) -> Result<StatusCode, ApiError> {
    if change.status != "aborted" {
        return Err(ApiError::bad_request(
            "the only allowed status change is 'aborted'",
        ));
    }
    let tenant = request_tenant(&headers);
    state
        .engine
        .abort_deployment(&tenant, parse_deployment_id(&id)?)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, Default)]
pub struct DeviceListParams {
    pub status: Option<String>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

fn parse_device_filter(s: &str) -> Result<DeviceStateFilter, ApiError> {
    match s {
        "paused" => Ok(DeviceStateFilter::Paused),
        "active" => Ok(DeviceStateFilter::Active),
        "finished" => Ok(DeviceStateFilter::Finished),
        other => other
            .parse::<DeviceDeploymentStatus>()
            .map(DeviceStateFilter::Status)
            .map_err(|_| ApiError::bad_request(format!("unknown status filter '{}'", other))),
    }
}

pub async fn list_deployment_devices(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(params): Query<DeviceListParams>,
) -> Result<Response, ApiError> {
    let tenant = request_tenant(&headers);
    let filter = params.status.as_deref().map(parse_device_filter).transpose()?;
    let page = params.page.unwrap_or(1).max(1);
    let per_page = params.per_page.unwrap_or(DEFAULT_PER_PAGE).max(1);
    let (rows, total) = state
        .engine
        .store()
        .find_device_deployments_for_deployment(
            &tenant,
            parse_deployment_id(&id)?,
            filter,
            (page - 1) * per_page,
            per_page,
        )
        .await
        .map_err(overdrop_engine::EngineError::from)?;
    let mut response = Json(json!(rows)).into_response();
    response
        .headers_mut()
        .insert("X-Total-Count", total.into());
    Ok(response)
}

pub async fn get_deployment_device_log(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, device)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let tenant = request_tenant(&headers);
    let log = state
        .engine
        .get_device_log(&tenant, parse_deployment_id(&id)?, &DeviceId::new(device))
        .await?;
    Ok(Json(json!(log.messages)))
}

pub async fn decommission_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device): Path<String>,
) -> Result<StatusCode, ApiError> {
    let tenant = request_tenant(&headers);
    state
        .engine
        .decommission_device(&tenant, &DeviceId::new(device))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ConfigurationDeployment {
    pub name: String,
    pub configuration: Value,
}

pub async fn post_configuration_deployment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device): Path<String>,
    Json(body): Json<ConfigurationDeployment>,
) -> Result<Response, ApiError> {
    let tenant = request_tenant(&headers);
    let deployment = state
        .engine
        .create_configuration_deployment(
            &tenant,
            body.name,
            DeviceId::new(device),
            body.configuration,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": deployment.id }))).into_response())
}

// ── Management: artifacts ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
pub struct ArtifactListParams {
    pub name: Option<String>,
    pub description: Option<String>,
    pub device_type: Option<String>,
    pub sort: Option<String>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

pub async fn list_artifacts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ArtifactListParams>,
) -> Result<Json<Value>, ApiError> {
    let tenant = request_tenant(&headers);
    let (sort, order) = match params.sort.as_deref() {
        None | Some("modified:desc") => (ImageSort::Modified, SortOrder::Descending),
        Some("modified:asc") => (ImageSort::Modified, SortOrder::Ascending),
        Some("name:asc") => (ImageSort::Name, SortOrder::Ascending),
        Some("name:desc") => (ImageSort::Name, SortOrder::Descending),
        Some(other) => return Err(ApiError::bad_request(format!("unknown sort '{}'", other))),
    };
    let filter = ImageFilter {
        name: params.name,
        description: params.description,
        device_type: params.device_type,
        sort,
        order,
        page: params.page.unwrap_or(1).max(1),
        per_page: params.per_page.unwrap_or(DEFAULT_PER_PAGE).max(1),
    };
    let images = state.engine.list_images(&tenant, &filter).await?;
    Ok(Json(json!(images)))
}

#[derive(Debug, Deserialize, Default)]
pub struct StageRequest {
    /// Validity of the presigned PUT, in seconds.
    pub expire_seconds: Option<u64>,
}

pub async fn post_artifact_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<StageRequest>,
) -> Result<Response, ApiError> {
    let tenant = request_tenant(&headers);
    let expire = Duration::from_secs(body.expire_seconds.unwrap_or(900));
    let intent = state.engine.stage_upload(&tenant, expire).await?;
    Ok((StatusCode::CREATED, Json(json!(intent))).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CommitRequest {
    pub artifact_name: String,
    pub device_types: Vec<String>,
}

pub async fn post_artifact_commit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<CommitRequest>,
) -> Result<StatusCode, ApiError> {
    let tenant = request_tenant(&headers);
    state
        .engine
        .commit_upload(
            &tenant,
            parse_image_id(&id)?,
            CommitUpload {
                artifact_name: body.artifact_name,
                device_types: body.device_types,
            },
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub device_types: Vec<String>,
    pub info: ArtifactInfo,
    #[serde(default)]
    pub signed: bool,
    #[serde(default)]
    pub updates: Vec<Payload>,
    #[serde(default)]
    pub provides: HashMap<String, String>,
    #[serde(default)]
    pub depends: HashMap<String, Value>,
    pub size: i64,
}

/// Workflow-runner callback after a successful artifact generation.
pub async fn post_artifact_complete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<CompleteRequest>,
) -> Result<Response, ApiError> {
    let tenant = request_tenant(&headers);
    let image = state
        .engine
        .complete_upload(
            &tenant,
            parse_image_id(&id)?,
            NewImage {
                description: body.description,
                name: body.name,
                device_types: body.device_types,
                info: body.info,
                signed: body.signed,
                updates: body.updates,
                provides: body.provides,
                depends: body.depends,
                size: body.size,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(json!(image))).into_response())
}

/// Workflow-runner callback after a failed generation.
pub async fn post_artifact_fail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let tenant = request_tenant(&headers);
    state.engine.fail_upload(&tenant, parse_image_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_artifact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let tenant = request_tenant(&headers);
    let image = state.engine.get_image(&tenant, parse_image_id(&id)?).await?;
    Ok(Json(json!(image)))
}

#[derive(Debug, Deserialize)]
pub struct ArtifactEdit {
    pub description: String,
}

pub async fn put_artifact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(edit): Json<ArtifactEdit>,
) -> Result<StatusCode, ApiError> {
    let tenant = request_tenant(&headers);
    state
        .engine
        .edit_image_description(&tenant, parse_image_id(&id)?, edit.description)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_artifact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let tenant = request_tenant(&headers);
    state.engine.delete_image(&tenant, parse_image_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_artifact_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let tenant = request_tenant(&headers);
    let link = state
        .engine
        .download_link(&tenant, parse_image_id(&id)?, DEFAULT_LINK_EXPIRE)
        .await?;
    Ok(Json(json!(link)))
}

// ── Management: releases ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
pub struct ReleaseListParams {
    pub name: Option<String>,
    pub description: Option<String>,
    pub device_type: Option<String>,
    pub tag: Option<String>,
    pub update_type: Option<String>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

pub async fn list_releases(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ReleaseListParams>,
) -> Result<Json<Value>, ApiError> {
    let tenant = request_tenant(&headers);
    let tag = params
        .tag
        .map(Tag::try_from)
        .transpose()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let filter = ReleaseFilter {
        name: params.name,
        description: params.description,
        device_type: params.device_type,
        tag,
        update_type: params.update_type,
        page: params.page.unwrap_or(1).max(1),
        per_page: params.per_page.unwrap_or(DEFAULT_PER_PAGE).max(1),
    };
    let releases = state.engine.list_releases(&tenant, &filter).await?;
    Ok(Json(json!(releases)))
}

pub async fn put_release_tags(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(tags): Json<Vec<String>>,
) -> Result<StatusCode, ApiError> {
    let tenant = request_tenant(&headers);
    let tags: Vec<Tag> = tags
        .into_iter()
        .map(Tag::try_from)
        .collect::<Result<_, _>>()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    state.engine.replace_release_tags(&tenant, &name, tags).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct NotesPatch {
    pub notes: String,
}

pub async fn patch_release(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(patch): Json<NotesPatch>,
) -> Result<StatusCode, ApiError> {
    let tenant = request_tenant(&headers);
    state
        .engine
        .update_release_notes(&tenant, &name, patch.notes)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_release(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let tenant = request_tenant(&headers);
    state.engine.delete_release(&tenant, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_release_tags(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let tenant = request_tenant(&headers);
    let tags = state.engine.list_tags(&tenant).await?;
    Ok(Json(json!(tags)))
}

pub async fn list_update_types(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let tenant = request_tenant(&headers);
    let types = state.engine.list_update_types(&tenant).await?;
    Ok(Json(json!(types)))
}
