//! Storage volume endpoints

use super::request::BufferedRequest;
use super::response::{empty_sync_response, outcome_response, respond, sync_response, with_etag};
use super::types::{VolumePost, VolumePut, VolumesPost};
use super::AppState;
use crate::common::{Error, Result};
use crate::orchestrator::{Caller, ListScope, PostRoute, VolumeFilter};
use crate::storage::volume::volume_url;
use crate::storage::VolumeKind;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::Response;

const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

fn caller(req: &BufferedRequest) -> Caller {
    Caller {
        authorization: req.header(header::AUTHORIZATION.as_str()).map(str::to_string),
    }
}

fn if_match(req: &BufferedRequest) -> Option<&str> {
    req.header(header::IF_MATCH.as_str())
}

/// Relay to the member holding the volume, looked up in the project the
/// record actually lives in
async fn forward_to_volume(
    state: &AppState,
    req: &BufferedRequest,
    pool: &str,
    project: &str,
    kind: VolumeKind,
    name: &str,
) -> Result<Option<Response>> {
    let volume_project = state.orch.volume_project(project, kind)?;
    state
        .orch
        .forwarder()
        .forward_if_volume_is_remote(req, pool, &volume_project, kind, name)
        .await
}

pub async fn list_volumes(
    State(state): State<AppState>,
    Path(pool): Path<String>,
    req: BufferedRequest,
) -> Response {
    respond(list(&state, &pool, None, &req))
}

pub async fn list_volumes_of_type(
    State(state): State<AppState>,
    Path((pool, kind)): Path<(String, String)>,
    req: BufferedRequest,
) -> Response {
    respond(VolumeKind::parse(&kind).and_then(|kind| list(&state, &pool, Some(kind), &req)))
}

fn list(state: &AppState, pool: &str, kind: Option<VolumeKind>, req: &BufferedRequest) -> Result<Response> {
    let member = match req.query_param("target") {
        Some(target) => {
            state.orch.db().transaction(|tx| tx.get_node_by_name(&target))?;
            Some(target)
        }
        None => None,
    };
    let all_projects = matches!(req.query_param("all-projects").as_deref(), Some("true" | "1"));
    if all_projects && req.query_param("project").is_some() {
        return Err(Error::InvalidInput(
            "Cannot specify a project when requesting all projects".into(),
        ));
    }
    let filter = VolumeFilter::parse(&req.query_param("filter").unwrap_or_default())?;
    let scope = ListScope {
        project: req.project(),
        all_projects,
        kind,
        member,
    };

    let volumes = state.orch.list_volumes(pool, &scope, &filter)?;
    let recursion = req
        .query_param("recursion")
        .and_then(|r| r.parse::<u32>().ok())
        .unwrap_or(0);
    if recursion > 0 {
        return Ok(sync_response(volumes));
    }
    let urls: Vec<String> = volumes
        .iter()
        .map(|v| volume_url(&v.pool, &v.project, v.kind, &v.name))
        .collect();
    Ok(sync_response(urls))
}

pub async fn create_volume(
    State(state): State<AppState>,
    Path(pool): Path<String>,
    req: BufferedRequest,
) -> Response {
    respond(create(&state, &pool, None, &req).await)
}

pub async fn create_volume_of_type(
    State(state): State<AppState>,
    Path((pool, kind)): Path<(String, String)>,
    req: BufferedRequest,
) -> Response {
    let result = match VolumeKind::parse(&kind) {
        Ok(kind) => create(&state, &pool, Some(kind), &req).await,
        Err(e) => Err(e),
    };
    respond(result)
}

async fn create(
    state: &AppState,
    pool: &str,
    kind: Option<VolumeKind>,
    req: &BufferedRequest,
) -> Result<Response> {
    if let Some(resp) = state.orch.forwarder().forward_if_target_is_remote(req).await? {
        return Ok(resp);
    }

    let is_binary = req
        .header(header::CONTENT_TYPE.as_str())
        .is_some_and(|ct| ct.starts_with(BINARY_CONTENT_TYPE));
    if is_binary {
        let name = req.header("X-LXD-name").map(str::to_string);
        let import_type = req.header("X-LXD-type").unwrap_or_default();
        let outcome = state
            .orch
            .import_volume(pool, &req.project(), name, import_type, &req.body[..])
            .await?;
        return Ok(outcome_response(outcome));
    }

    let body: VolumesPost = req.json()?;
    let outcome = state
        .orch
        .create_volume(pool, &req.project(), kind, body, &caller(req))
        .await?;
    Ok(outcome_response(outcome))
}

/// Path of a single volume
type VolumePath = Path<(String, String, String)>;

pub async fn get_volume(
    State(state): State<AppState>,
    Path((pool, kind, name)): VolumePath,
    req: BufferedRequest,
) -> Response {
    let result = async {
        let kind = VolumeKind::parse(&kind)?;
        let project = req.project();
        if let Some(resp) = forward_to_volume(&state, &req, &pool, &project, kind, &name).await? {
            return Ok(resp);
        }
        let volume = state.orch.get_volume(&pool, &project, kind, &name)?;
        let etag = volume.etag()?;
        Ok::<_, Error>(with_etag(sync_response(volume), &etag))
    };
    respond(result.await)
}

pub async fn put_volume(
    State(state): State<AppState>,
    Path((pool, kind, name)): VolumePath,
    req: BufferedRequest,
) -> Response {
    respond(update(&state, &pool, &kind, &name, &req, false).await)
}

pub async fn patch_volume(
    State(state): State<AppState>,
    Path((pool, kind, name)): VolumePath,
    req: BufferedRequest,
) -> Response {
    respond(update(&state, &pool, &kind, &name, &req, true).await)
}

async fn update(
    state: &AppState,
    pool: &str,
    kind: &str,
    name: &str,
    req: &BufferedRequest,
    patch: bool,
) -> Result<Response> {
    let kind = VolumeKind::parse(kind)?;
    let project = req.project();
    if let Some(resp) = forward_to_volume(state, req, pool, &project, kind, name).await? {
        return Ok(resp);
    }

    let body: VolumePut = req.json()?;
    let volume = if patch {
        state
            .orch
            .patch_volume(pool, &project, kind, name, body, if_match(req))
            .await?
    } else {
        state
            .orch
            .update_volume(pool, &project, kind, name, body, if_match(req))
            .await?
    };
    let etag = volume.etag()?;
    Ok(with_etag(empty_sync_response(None), &etag))
}

pub async fn post_volume(
    State(state): State<AppState>,
    Path((pool, kind, name)): VolumePath,
    req: BufferedRequest,
) -> Response {
    let result = async {
        let kind = VolumeKind::parse(&kind)?;
        let project = req.project();
        let mut body: VolumePost = req.json()?;

        match state.orch.route_post(&pool, &body)? {
            PostRoute::Forward(member) => {
                return state.orch.forwarder().forward(&member, &req).await;
            }
            PostRoute::LocalRename => {
                body.migration = false;
            }
            PostRoute::Local => {
                // `target` names the destination here, so only the volume's
                // own location decides forwarding
                if let Some(resp) =
                    forward_to_volume(&state, &req, &pool, &project, kind, &name).await?
                {
                    return Ok(resp);
                }
            }
        }

        let target = req.query_param("target");
        let outcome = state
            .orch
            .post_volume(&pool, &project, kind, &name, body, target.as_deref(), &caller(&req))
            .await?;
        Ok::<_, Error>(outcome_response(outcome))
    };
    respond(result.await)
}

pub async fn delete_volume(
    State(state): State<AppState>,
    Path((pool, kind, name)): VolumePath,
    req: BufferedRequest,
) -> Response {
    let result = async {
        let kind = VolumeKind::parse(&kind)?;
        let project = req.project();
        if let Some(resp) = forward_to_volume(&state, &req, &pool, &project, kind, &name).await? {
            return Ok(resp);
        }
        state.orch.delete_volume(&pool, &project, kind, &name).await?;
        Ok::<_, Error>(empty_sync_response(None))
    };
    respond(result.await)
}
