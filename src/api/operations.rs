//! Operation endpoints and server info

use super::request::BufferedRequest;
use super::response::{empty_sync_response, error_response, respond, sync_response};
use super::AppState;
use crate::common::{Error, Result};
use crate::migration::transport::AxumTransport;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

pub async fn server_info(State(state): State<AppState>) -> Response {
    sync_response(json!({
        "api_version": "1.0",
        "environment": {
            "server": "minivol",
            "server_name": state.orch.member(),
            "server_version": crate::VERSION,
        },
    }))
}

pub async fn list_operations(State(state): State<AppState>, req: BufferedRequest) -> Response {
    let result = async {
        if let Some(resp) = state.orch.forwarder().forward_if_target_is_remote(&req).await? {
            return Ok(resp);
        }
        let project = req.query_param("project");
        let ops = state.orch.tracker().list(project.as_deref());
        let recursion = req.query_param("recursion").is_some_and(|r| r != "0");
        if recursion {
            return Ok(sync_response(ops));
        }
        let urls: Vec<String> = ops
            .iter()
            .map(|op| format!("/1.0/operations/{}", op.id))
            .collect();
        Ok::<_, Error>(sync_response(urls))
    };
    respond(result.await)
}

pub async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: BufferedRequest,
) -> Response {
    let result = async {
        if let Some(resp) = state.orch.forwarder().forward_if_target_is_remote(&req).await? {
            return Ok(resp);
        }
        let op = state.orch.tracker().get(&id)?;
        Ok::<_, Error>(sync_response(op.view()))
    };
    respond(result.await)
}

pub async fn cancel_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: BufferedRequest,
) -> Response {
    let result = async {
        if let Some(resp) = state.orch.forwarder().forward_if_target_is_remote(&req).await? {
            return Ok(resp);
        }
        state.orch.tracker().cancel(&id).await?;
        Ok::<_, Error>(empty_sync_response(None))
    };
    respond(result.await)
}

/// `timeout` in seconds; absent or negative waits forever
fn wait_timeout(req: &BufferedRequest) -> Result<Option<Duration>> {
    match req.query_param("timeout") {
        None => Ok(None),
        Some(raw) => {
            let secs: i64 = raw
                .parse()
                .map_err(|_| Error::InvalidInput(format!("Invalid timeout {:?}", raw)))?;
            Ok((secs >= 0).then(|| Duration::from_secs(secs as u64)))
        }
    }
}

pub async fn wait_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: BufferedRequest,
) -> Response {
    let result = async {
        if let Some(resp) = state.orch.forwarder().forward_if_target_is_remote(&req).await? {
            return Ok(resp);
        }
        let timeout = wait_timeout(&req)?;
        let view = state.orch.tracker().wait(&id, timeout).await?;
        Ok::<_, Error>(sync_response(view))
    };
    respond(result.await)
}

#[derive(Debug, Deserialize)]
pub struct SecretQuery {
    #[serde(default)]
    secret: String,
}

/// Upgrade to a websocket and hand it to the operation as a channel
pub async fn operation_websocket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SecretQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let tracker = state.orch.tracker().clone();
    if let Err(e) = tracker.check_secret(&id, &query.secret) {
        return error_response(&e);
    }

    ws.on_upgrade(move |socket| async move {
        let transport = Box::new(AxumTransport(socket));
        if let Err(e) = tracker.connect(&id, &query.secret, transport).await {
            tracing::warn!(operation = %id, error = %e, "Rejected migration channel");
        }
    })
}
