//! Receiving side of a migration, and backup import

use crate::cluster::db::VolumeRecord;
use crate::cluster::tls;
use crate::common::{Error, MigrationConfig, Result};
use crate::migration::session::{dial_channels, Channels, MigrationSession, CONTROL, FILESYSTEM};
use crate::migration::transport::{ArchiveTransport, Transport};
use crate::migration::wire::{
    recv_json, recv_json_or_cancel, recv_section, send_json, ControlResult, DataMessage,
    OfferHeader, ResponseHeader, SectionKind,
};
use crate::migration::MigrationMode;
use crate::storage::volume::{validate_volume_name, ContentType, VolumeKind};
use crate::storage::{NewVolume, StoragePool};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Largest frame accepted from a backup archive
const MAX_BACKUP_FRAME: u32 = 64 * 1024 * 1024;

/// How the sink reaches its source
#[derive(Debug, Clone)]
pub struct SinkArgs {
    pub mode: MigrationMode,
    /// Source operation URL, pull mode only
    pub operation: String,
    /// Source channel secrets, pull mode only
    pub secrets: HashMap<String, String>,
    pub certificate: Option<String>,
    pub volume_only: bool,
    pub refresh: bool,
}

/// Volume the sink creates or refreshes
#[derive(Debug, Clone, Default)]
pub struct SinkRequest {
    pub project: String,
    pub name: String,
    pub description: String,
    pub config: BTreeMap<String, String>,
    /// Content type the caller expects, if it declared one
    pub content_type: Option<ContentType>,
    /// Name the caller expects the source volume to have
    pub source_name: Option<String>,
}

pub struct MigrationSink {
    args: SinkArgs,
    session: Arc<MigrationSession>,
    config: MigrationConfig,
}

impl MigrationSink {
    pub fn new(args: SinkArgs, config: MigrationConfig) -> Result<Self> {
        if let Some(pem) = &args.certificate {
            tls::parse_certificate(pem)?;
        }
        if args.mode == MigrationMode::Pull {
            if args.operation.is_empty() {
                return Err(Error::InvalidInput(
                    "Pull mode migration requires the source operation".into(),
                ));
            }
            for channel in [CONTROL, FILESYSTEM] {
                if !args.secrets.contains_key(channel) {
                    return Err(Error::InvalidInput(format!(
                        "Missing websocket secret for {:?}",
                        channel
                    )));
                }
            }
        }
        Ok(Self {
            args,
            session: Arc::new(MigrationSession::new()),
            config,
        })
    }

    pub fn mode(&self) -> MigrationMode {
        self.args.mode
    }

    pub fn session(&self) -> Arc<MigrationSession> {
        self.session.clone()
    }

    /// Channel secrets in push mode, where the source dials in
    pub fn metadata(&self) -> Map<String, Value> {
        match self.args.mode {
            MigrationMode::Push => self.session.metadata(),
            MigrationMode::Pull => Map::new(),
        }
    }

    pub fn disconnect(&self) {
        self.session.disconnect();
    }

    async fn channels(&self, cancel: &CancellationToken) -> Result<Channels> {
        match self.args.mode {
            MigrationMode::Pull => {
                let dial = dial_channels(
                    &self.args.operation,
                    &self.args.secrets,
                    self.args.certificate.as_deref(),
                    self.config.handshake_timeout(),
                );
                tokio::select! {
                    _ = cancel.cancelled() => Err(Error::Cancelled),
                    _ = self.session.cancel_token().cancelled() => Err(Error::Cancelled),
                    res = dial => res,
                }
            }
            MigrationMode::Push => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(Error::Cancelled),
                    res = self.session.wait_for_channels(self.config.connect_timeout()) => res,
                }
            }
        }
    }

    /// Receive a volume into `pool`. A volume created here is removed
    /// again if the transfer fails; a refreshed one is left in place.
    pub async fn do_storage(
        &self,
        pool: &StoragePool,
        req: &SinkRequest,
        cancel: &CancellationToken,
    ) -> Result<VolumeRecord> {
        let mut channels = self.channels(cancel).await?;
        let result = async {
            let offer: OfferHeader = recv_json_or_cancel(channels.control.as_mut(), cancel).await?;
            self.receive(pool, req, &offer, &mut channels, cancel).await
        }
        .await;

        let outcome = match &result {
            Ok(_) => ControlResult {
                success: true,
                message: String::new(),
            },
            Err(e) => ControlResult {
                success: false,
                message: e.to_string(),
            },
        };
        if let Err(e) = send_json(channels.control.as_mut(), &outcome).await {
            tracing::debug!(error = %e, "Could not report migration result to source");
        }
        channels.close().await;
        result
    }

    async fn receive(
        &self,
        pool: &StoragePool,
        req: &SinkRequest,
        offer: &OfferHeader,
        channels: &mut Channels,
        cancel: &CancellationToken,
    ) -> Result<VolumeRecord> {
        check_offer(req, offer)?;
        let volume_only = self.args.volume_only || offer.volume_only;

        let (target, wanted, created) = if self.args.refresh {
            let dst = pool.get_volume(&req.project, VolumeKind::Custom, &req.name)?;
            if dst.content_type != offer.content_type {
                return Err(Error::InvalidInput(format!(
                    "Content type mismatch: source is {} but target is {}",
                    offer.content_type.as_str(),
                    dst.content_type.as_str()
                )));
            }
            let wanted = if volume_only {
                Vec::new()
            } else {
                pool.sync_snapshot_list(&dst, &offer.snapshots, |s| (s.name.clone(), s.created_at))
                    .await?
            };
            (dst, wanted, false)
        } else {
            let record = pool.create_custom_volume(new_volume(req, offer)).await?;
            let wanted = if volume_only {
                Vec::new()
            } else {
                offer.snapshots.iter().map(|s| s.name.clone()).collect()
            };
            (record, wanted, true)
        };

        let result = async {
            send_json(
                channels.control.as_mut(),
                &ResponseHeader {
                    refresh: self.args.refresh,
                    snapshots: wanted.clone(),
                },
            )
            .await?;
            receive_sections(channels.filesystem.as_mut(), pool, &target, offer, &wanted, cancel)
                .await
        }
        .await;

        match result {
            Ok(()) => {
                tracing::info!(pool = %pool.name(), project = %req.project, volume = %req.name, snapshots = wanted.len(), refresh = self.args.refresh, "Migration sink finished");
                Ok(target)
            }
            Err(e) => {
                if created {
                    if let Err(cleanup) = pool.delete_custom_volume(&req.project, &req.name).await {
                        tracing::error!(volume = %req.name, error = %cleanup, "Failed to remove partially received volume");
                    }
                }
                Err(e)
            }
        }
    }
}

/// Refuse an offer before anything is allocated
fn check_offer(req: &SinkRequest, offer: &OfferHeader) -> Result<()> {
    validate_volume_name(&req.name)?;
    if let Some(expected) = req.content_type {
        if expected != offer.content_type {
            return Err(Error::InvalidInput(format!(
                "Content type mismatch: expected {} but source offers {}",
                expected.as_str(),
                offer.content_type.as_str()
            )));
        }
    }
    if let Some(source_name) = &req.source_name {
        if !source_name.is_empty() && source_name != &offer.name {
            return Err(Error::InvalidInput(format!(
                "Source volume name mismatch: expected {:?} but source offers {:?}",
                source_name, offer.name
            )));
        }
    }
    Ok(())
}

fn new_volume(req: &SinkRequest, offer: &OfferHeader) -> NewVolume {
    NewVolume {
        project: req.project.clone(),
        name: req.name.clone(),
        description: if req.description.is_empty() {
            offer.description.clone()
        } else {
            req.description.clone()
        },
        config: if req.config.is_empty() {
            offer.config.clone()
        } else {
            req.config.clone()
        },
        content_type: offer.content_type,
    }
}

/// Read data sections until `done`, writing the wanted snapshots and the
/// volume into `target`
pub(crate) async fn receive_sections(
    data: &mut dyn Transport,
    pool: &StoragePool,
    target: &VolumeRecord,
    offer: &OfferHeader,
    wanted: &[String],
    cancel: &CancellationToken,
) -> Result<()> {
    let mut pending: Vec<&str> = wanted.iter().map(String::as_str).collect();
    let mut got_volume = false;

    loop {
        let msg: DataMessage = recv_json_or_cancel(data, cancel).await?;
        match msg {
            DataMessage::Begin {
                kind: SectionKind::Snapshot,
                name,
                size,
            } => {
                if got_volume || !pending.contains(&name.as_str()) {
                    return Err(Error::ManifestMismatch(format!(
                        "unexpected snapshot section {:?}",
                        name
                    )));
                }
                let header = offer
                    .snapshots
                    .iter()
                    .find(|s| s.name == name)
                    .ok_or_else(|| {
                        Error::ManifestMismatch(format!("snapshot {:?} was not offered", name))
                    })?;
                let snap = name.as_str();
                let section = recv_section(data, size, |mut reader| async move {
                    pool.import_snapshot(target, snap, header.created_at, header.config.clone(), &mut reader)
                        .await
                });
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    res = section => { res?; }
                }
                pending.retain(|p| *p != snap);
            }
            DataMessage::Begin {
                kind: SectionKind::Volume,
                size,
                ..
            } => {
                if got_volume {
                    return Err(Error::ManifestMismatch("volume sent twice".into()));
                }
                let vol = StoragePool::driver_volume(target);
                let vol = &vol;
                let section = recv_section(data, size, |mut reader| async move {
                    pool.driver().write_volume(vol, None, &mut reader).await
                });
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    res = section => { res?; }
                }
                got_volume = true;
            }
            DataMessage::End { .. } => {
                return Err(Error::ManifestMismatch("end of section outside a section".into()))
            }
            DataMessage::Done => break,
        }
    }

    if !pending.is_empty() {
        return Err(Error::ManifestMismatch(format!(
            "snapshots never received: {}",
            pending.join(", ")
        )));
    }
    if !got_volume {
        return Err(Error::ManifestMismatch("volume content never received".into()));
    }
    Ok(())
}

/// Name of the volume stored in a backup archive
pub async fn backup_name<S>(source: S) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut archive = ArchiveTransport::new(source, MAX_BACKUP_FRAME);
    let offer: OfferHeader = recv_json(&mut archive)
        .await
        .map_err(|e| Error::InvalidInput(format!("Invalid backup: {}", e)))?;
    Ok(offer.name)
}

/// Create a custom volume from a backup archive. `name` overrides the
/// name stored in the archive.
pub async fn import_backup<S>(
    pool: &StoragePool,
    project: &str,
    name: Option<&str>,
    source: S,
    cancel: &CancellationToken,
) -> Result<VolumeRecord>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut archive = ArchiveTransport::new(source, MAX_BACKUP_FRAME);
    let offer: OfferHeader = recv_json(&mut archive)
        .await
        .map_err(|e| Error::InvalidInput(format!("Invalid backup: {}", e)))?;

    let req = SinkRequest {
        project: project.to_string(),
        name: name.unwrap_or(&offer.name).to_string(),
        ..SinkRequest::default()
    };
    check_offer(&req, &offer)?;
    let record = pool.create_custom_volume(new_volume(&req, &offer)).await?;
    let wanted: Vec<String> = offer.snapshots.iter().map(|s| s.name.clone()).collect();

    match receive_sections(&mut archive, pool, &record, &offer, &wanted, cancel).await {
        Ok(()) => {
            tracing::info!(pool = %pool.name(), project, volume = %record.name, snapshots = wanted.len(), "Imported custom volume backup");
            Ok(record)
        }
        Err(e) => {
            if let Err(cleanup) = pool.delete_custom_volume(project, &req.name).await {
                tracing::error!(volume = %req.name, error = %cleanup, "Failed to remove partially imported volume");
            }
            Err(match e {
                Error::Websocket(msg) => Error::InvalidInput(format!("Invalid backup: {}", msg)),
                other => other,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterDb;
    use crate::migration::fixtures::{plug, pool};
    use crate::migration::transport::{Frame, MemoryTransport};
    use crate::migration::wire::SnapshotHeader;

    fn push_sink(refresh: bool) -> MigrationSink {
        MigrationSink::new(
            SinkArgs {
                mode: MigrationMode::Push,
                operation: String::new(),
                secrets: HashMap::new(),
                certificate: None,
                volume_only: false,
                refresh,
            },
            MigrationConfig::default(),
        )
        .unwrap()
    }

    fn offer(name: &str, content_type: ContentType) -> OfferHeader {
        OfferHeader {
            name: name.into(),
            content_type,
            description: String::new(),
            config: BTreeMap::new(),
            snapshots: Vec::new(),
            volume_only: false,
        }
    }

    fn request(name: &str) -> SinkRequest {
        SinkRequest {
            project: "default".into(),
            name: name.into(),
            ..SinkRequest::default()
        }
    }

    async fn final_result(control: &mut MemoryTransport) -> ControlResult {
        loop {
            let frame = control.recv_frame().await.unwrap().expect("control closed");
            let Frame::Text(text) = frame else { continue };
            if let Ok(result) = serde_json::from_str::<ControlResult>(&text) {
                return result;
            }
        }
    }

    #[test]
    fn test_pull_mode_needs_both_secrets() {
        let args = SinkArgs {
            mode: MigrationMode::Pull,
            operation: "https://node2/1.0/operations/abc".into(),
            secrets: HashMap::from([(CONTROL.to_string(), "s".to_string())]),
            certificate: None,
            volume_only: false,
            refresh: false,
        };
        let err = MigrationSink::new(args, MigrationConfig::default()).err().unwrap();
        assert!(matches!(err, Error::InvalidInput(ref m) if m.contains("filesystem")));
    }

    #[tokio::test]
    async fn test_mismatched_offer_allocates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(ClusterDb::in_memory());
        let dst = pool(&db, "dst", dir.path());

        let cases = [
            (
                SinkRequest {
                    content_type: Some(ContentType::Block),
                    ..request("copy")
                },
                "Content type mismatch",
            ),
            (
                SinkRequest {
                    source_name: Some("other".into()),
                    ..request("copy")
                },
                "Source volume name mismatch",
            ),
        ];
        for (req, expected) in cases {
            let sink = push_sink(false);
            let (mut control, _filesystem) = plug(&sink.session()).await;
            send_json(&mut control, &offer("data", ContentType::Filesystem))
                .await
                .unwrap();

            let err = sink
                .do_storage(&dst, &req, &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidInput(ref m) if m.contains(expected)), "{}", err);
            assert!(dst.get_volume("default", VolumeKind::Custom, "copy").is_err());

            let result = final_result(&mut control).await;
            assert!(!result.success);
            assert!(result.message.contains(expected));
        }
    }

    #[tokio::test]
    async fn test_refresh_requires_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(ClusterDb::in_memory());
        let dst = pool(&db, "dst", dir.path());

        let sink = push_sink(true);
        let (mut control, _filesystem) = plug(&sink.session()).await;
        send_json(&mut control, &offer("data", ContentType::Filesystem))
            .await
            .unwrap();
        let err = sink
            .do_storage(&dst, &request("missing"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_bad_checksum_removes_created_volume() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(ClusterDb::in_memory());
        let dst = pool(&db, "dst", dir.path());

        let sink = push_sink(false);
        let (mut control, mut filesystem) = plug(&sink.session()).await;
        send_json(&mut control, &offer("data", ContentType::Filesystem))
            .await
            .unwrap();
        send_json(
            &mut filesystem,
            &DataMessage::Begin {
                kind: SectionKind::Volume,
                name: "data".into(),
                size: 3,
            },
        )
        .await
        .unwrap();
        filesystem
            .send_frame(Frame::Binary(b"abc".to_vec()))
            .await
            .unwrap();
        send_json(
            &mut filesystem,
            &DataMessage::End {
                blake3: "0".repeat(64),
            },
        )
        .await
        .unwrap();

        let err = sink
            .do_storage(&dst, &request("copy"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }), "{}", err);
        assert!(dst.get_volume("default", VolumeKind::Custom, "copy").is_err());
        assert!(!final_result(&mut control).await.success);
    }

    #[tokio::test]
    async fn test_unrequested_snapshot_section_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(ClusterDb::in_memory());
        let dst = pool(&db, "dst", dir.path());

        let sink = SinkArgs {
            volume_only: true,
            ..push_sink(false).args
        };
        let sink = MigrationSink::new(sink, MigrationConfig::default()).unwrap();
        let (mut control, mut filesystem) = plug(&sink.session()).await;
        let mut offered = offer("data", ContentType::Filesystem);
        offered.snapshots.push(SnapshotHeader {
            name: "snap0".into(),
            created_at: 0,
            description: String::new(),
            config: BTreeMap::new(),
        });
        send_json(&mut control, &offered).await.unwrap();
        send_json(
            &mut filesystem,
            &DataMessage::Begin {
                kind: SectionKind::Snapshot,
                name: "snap0".into(),
                size: 0,
            },
        )
        .await
        .unwrap();

        let err = sink
            .do_storage(&dst, &request("copy"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ManifestMismatch(_)), "{}", err);
        assert!(dst.get_volume("default", VolumeKind::Custom, "copy").is_err());
    }
}
