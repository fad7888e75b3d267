//! Relaying requests to the member that must serve them

use crate::api::request::BufferedRequest;
use crate::cluster::client::MemberClient;
use crate::cluster::db::{ClusterDb, MemberRecord};
use crate::cluster::location::{Location, LocationResolver};
use crate::common::{timestamp_now, Error, Result};
use crate::storage::volume::VolumeKind;
use axum::body::Body;
use axum::http::header;
use axum::response::Response;
use std::sync::Arc;
use std::time::Duration;

/// Marks a request relayed by another member; such requests are never
/// forwarded again
pub const FORWARDED_HEADER: &str = "X-Minivol-Forwarded";

pub struct Forwarder {
    db: Arc<ClusterDb>,
    client: MemberClient,
    resolver: Arc<LocationResolver>,
    offline_threshold: Duration,
}

impl Forwarder {
    pub fn new(
        db: Arc<ClusterDb>,
        client: MemberClient,
        resolver: Arc<LocationResolver>,
        offline_threshold: Duration,
    ) -> Self {
        Self {
            db,
            client,
            resolver,
            offline_threshold,
        }
    }

    pub fn local(&self) -> &str {
        self.resolver.local()
    }

    pub fn client(&self) -> &MemberClient {
        &self.client
    }

    pub fn resolver(&self) -> &LocationResolver {
        &self.resolver
    }

    pub fn is_offline(&self, member: &MemberRecord) -> bool {
        member.name != self.local()
            && member.is_offline(timestamp_now(), self.offline_threshold.as_secs())
    }

    /// Member record, failing when it is past the offline threshold
    pub fn online_member(&self, name: &str) -> Result<MemberRecord> {
        let member = self.db.transaction(|tx| tx.get_node_by_name(name))?;
        if self.is_offline(&member) {
            return Err(Error::unavailable(&member.name, "member is offline"));
        }
        Ok(member)
    }

    /// Relay to `?target=` when it names another member
    pub async fn forward_if_target_is_remote(&self, req: &BufferedRequest) -> Result<Option<Response>> {
        if req.is_forwarded() {
            return Ok(None);
        }
        let target = match req.query_param("target") {
            Some(t) if t != self.local() => t,
            _ => return Ok(None),
        };
        let member = self.online_member(&target)?;
        self.forward(&member, req).await.map(Some)
    }

    /// Relay to the member hosting the volume, if that is not this one
    pub async fn forward_if_volume_is_remote(
        &self,
        req: &BufferedRequest,
        pool: &str,
        project: &str,
        kind: VolumeKind,
        name: &str,
    ) -> Result<Option<Response>> {
        if req.is_forwarded() {
            return Ok(None);
        }
        match self.resolver.resolve(pool, project, kind, name)? {
            Location::Remote(member) => {
                if self.is_offline(&member) {
                    return Err(Error::unavailable(
                        &member.name,
                        "The cluster member hosting the storage volume is offline",
                    ));
                }
                self.forward(&member, req).await.map(Some)
            }
            Location::Local | Location::NoOwner => Ok(None),
        }
    }

    /// Replay `req` on `member` and relay the response unchanged
    pub async fn forward(&self, member: &MemberRecord, req: &BufferedRequest) -> Result<Response> {
        tracing::debug!(member = %member.name, method = %req.method, path = %req.path_and_query(), "Forwarding request");
        let resp = self.client.send(member, req).await?;

        let mut builder = Response::builder().status(resp.status());
        for (name, value) in resp.headers() {
            if name == header::TRANSFER_ENCODING || name == header::CONNECTION {
                continue;
            }
            builder = builder.header(name, value);
        }
        builder
            .body(Body::from_stream(resp.bytes_stream()))
            .map_err(|e| Error::Http(format!("Failed to relay response: {}", e)))
    }
}
