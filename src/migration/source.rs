//! Sending side of a migration

use crate::cluster::db::VolumeRecord;
use crate::cluster::tls;
use crate::common::{Error, MigrationConfig, Result};
use crate::migration::session::{dial_channels, Channels, MigrationSession};
#[cfg(test)]
use crate::migration::transport::ArchiveTransport;
use crate::migration::transport::Transport;
use crate::migration::wire::{
    recv_json_or_cancel, send_json, send_section, ControlResult, DataMessage, OfferHeader,
    ResponseHeader, SectionKind, SnapshotHeader,
};
use crate::storage::volume::{split_snapshot, VolumeKind};
use crate::storage::StoragePool;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
#[cfg(test)]
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// First control message from the sink: its snapshot request, or a
/// failure report when it refused the offer
#[derive(Deserialize)]
#[serde(untagged)]
enum SinkReply {
    Ready(ResponseHeader),
    Refused(ControlResult),
}

/// Where a push-mode source connects to
#[derive(Debug, Clone, Default)]
pub struct PushTarget {
    /// Absolute URL of the sink's operation
    pub operation: String,
    pub secrets: HashMap<String, String>,
    pub certificate: Option<String>,
}

pub struct MigrationSource {
    session: Arc<MigrationSession>,
    push: Option<PushTarget>,
    volume_only: bool,
    config: MigrationConfig,
}

impl MigrationSource {
    /// Pull mode when `push` is `None`
    pub fn new(volume_only: bool, push: Option<PushTarget>, config: MigrationConfig) -> Result<Self> {
        if let Some(target) = &push {
            if let Some(pem) = &target.certificate {
                tls::parse_certificate(pem)?;
            }
        }
        Ok(Self {
            session: Arc::new(MigrationSession::new()),
            push,
            volume_only,
            config,
        })
    }

    pub fn is_push(&self) -> bool {
        self.push.is_some()
    }

    /// Session accepting inbound channels in pull mode
    pub fn session(&self) -> Arc<MigrationSession> {
        self.session.clone()
    }

    /// Operation metadata: channel secrets in pull mode, nothing in push mode
    pub fn metadata(&self) -> Map<String, Value> {
        if self.is_push() {
            Map::new()
        } else {
            self.session.metadata()
        }
    }

    /// Stop waiting or transferring
    pub fn disconnect(&self) {
        self.session.disconnect();
    }

    async fn channels(&self, cancel: &CancellationToken) -> Result<Channels> {
        match &self.push {
            Some(target) => {
                let dial = dial_channels(
                    &target.operation,
                    &target.secrets,
                    target.certificate.as_deref(),
                    self.config.handshake_timeout(),
                );
                tokio::select! {
                    _ = cancel.cancelled() => Err(Error::Cancelled),
                    _ = self.session.cancel_token().cancelled() => Err(Error::Cancelled),
                    res = dial => res,
                }
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(Error::Cancelled),
                    res = self.session.wait_for_channels(self.config.connect_timeout()) => res,
                }
            }
        }
    }

    /// Send the custom volume `name` and, unless volume-only, its snapshots
    pub async fn do_storage(
        &self,
        pool: &StoragePool,
        project: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (record, offer) = build_offer(pool, project, name, self.volume_only).await?;
        let mut channels = self.channels(cancel).await?;
        let mode = if self.is_push() { "push" } else { "pull" };
        tracing::info!(pool = %pool.name(), project, volume = name, mode, "Migration source connected");

        let result = self
            .transfer(pool, &record, &offer, &mut channels, cancel)
            .await;
        if let Err(e) = &result {
            let _ = send_json(
                channels.control.as_mut(),
                &ControlResult {
                    success: false,
                    message: e.to_string(),
                },
            )
            .await;
        }
        channels.close().await;
        result
    }

    async fn transfer(
        &self,
        pool: &StoragePool,
        record: &VolumeRecord,
        offer: &OfferHeader,
        channels: &mut Channels,
        cancel: &CancellationToken,
    ) -> Result<()> {
        send_json(channels.control.as_mut(), offer).await?;
        let response = match recv_json_or_cancel(channels.control.as_mut(), cancel).await? {
            SinkReply::Ready(response) => response,
            SinkReply::Refused(result) => {
                return Err(Error::Internal(format!(
                    "Migration refused by target: {}",
                    result.message
                )))
            }
        };

        send_sections(
            channels.filesystem.as_mut(),
            pool,
            record,
            offer,
            &response.snapshots,
            self.config.chunk_size,
            cancel,
        )
        .await?;

        let result: ControlResult = recv_json_or_cancel(channels.control.as_mut(), cancel).await?;
        if !result.success {
            return Err(Error::Internal(format!(
                "Migration failed on target: {}",
                result.message
            )));
        }
        tracing::info!(volume = %record.name, "Migration source finished");
        Ok(())
    }
}

/// Volume record and offer header, after checking that the snapshots known
/// to the metadata store match the ones the driver holds
pub(crate) async fn build_offer(
    pool: &StoragePool,
    project: &str,
    name: &str,
    volume_only: bool,
) -> Result<(VolumeRecord, OfferHeader)> {
    let record = pool.get_volume(project, VolumeKind::Custom, name)?;
    let snapshots = if volume_only {
        Vec::new()
    } else {
        pool.list_snapshots(&record)?
    };

    let headers: Vec<SnapshotHeader> = snapshots
        .iter()
        .map(|s| SnapshotHeader {
            name: split_snapshot(&s.name).1.unwrap_or(&s.name).to_string(),
            created_at: s.created_at,
            description: s.description.clone(),
            config: s.config.clone(),
        })
        .collect();

    if !volume_only {
        let on_disk = pool
            .driver()
            .list_snapshots(&StoragePool::driver_volume(&record))
            .await?;
        if let Some(extra) = on_disk
            .iter()
            .find(|d| !headers.iter().any(|h| &h.name == *d))
        {
            return Err(Error::ManifestMismatch(format!(
                "snapshot {:?} of {:?} exists in storage but not in the metadata store",
                extra, name
            )));
        }
        if let Some(missing) = headers.iter().find(|h| !on_disk.contains(&h.name)) {
            return Err(Error::ManifestMismatch(format!(
                "snapshot {:?} of {:?} is recorded but missing from storage",
                missing.name, name
            )));
        }
    }

    let offer = OfferHeader {
        name: record.name.clone(),
        content_type: record.content_type,
        description: record.description.clone(),
        config: record.config.clone(),
        snapshots: headers,
        volume_only,
    };
    Ok((record, offer))
}

/// Requested snapshots in offer order, then the volume, then `done`
async fn send_sections(
    data: &mut dyn Transport,
    pool: &StoragePool,
    record: &VolumeRecord,
    offer: &OfferHeader,
    wanted: &[String],
    chunk_size: usize,
    cancel: &CancellationToken,
) -> Result<()> {
    if let Some(unknown) = wanted
        .iter()
        .find(|w| !offer.snapshots.iter().any(|s| &s.name == *w))
    {
        return Err(Error::ManifestMismatch(format!(
            "target requested unknown snapshot {:?}",
            unknown
        )));
    }

    for snap in offer.snapshots.iter().filter(|s| wanted.contains(&s.name)) {
        let (reader, size) = pool.open_volume(record, Some(snap.name.as_str())).await?;
        send_section(data, SectionKind::Snapshot, &snap.name, reader, size, chunk_size, cancel)
            .await?;
    }
    let (reader, size) = pool.open_volume(record, None).await?;
    send_section(data, SectionKind::Volume, &record.name, reader, size, chunk_size, cancel).await?;
    send_json(data, &DataMessage::Done).await
}

/// Write a custom volume and its snapshots as a backup archive: the offer
/// header followed by the data sections, framed as on a migration channel
#[cfg(test)]
pub(crate) async fn export_backup<W>(
    pool: &StoragePool,
    project: &str,
    name: &str,
    volume_only: bool,
    chunk_size: usize,
    writer: W,
) -> Result<W>
where
    W: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (record, offer) = build_offer(pool, project, name, volume_only).await?;
    let wanted: Vec<String> = offer.snapshots.iter().map(|s| s.name.clone()).collect();
    let mut archive = ArchiveTransport::new(writer, u32::MAX);
    send_json(&mut archive, &offer).await?;
    send_sections(
        &mut archive,
        pool,
        &record,
        &offer,
        &wanted,
        chunk_size,
        &CancellationToken::new(),
    )
    .await?;
    archive.shutdown().await?;
    Ok(archive.into_inner())
}
