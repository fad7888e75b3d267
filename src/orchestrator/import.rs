//! Binary uploads: ISO images and backup archives

use super::{Orchestrator, Outcome};
use crate::common::{Error, Result};
use crate::migration::{backup_name, import_backup};
use crate::operations::{OperationContext, OperationSpec, OperationType, Runner};
use crate::storage::{ContentType, NewVolume, StoragePool, VolumeKind};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

impl Orchestrator {
    /// Create a custom volume from an uploaded body. `iso` stores the bytes
    /// as an ISO volume; anything else is read as a backup archive.
    pub async fn import_volume<R>(
        self: &Arc<Self>,
        pool_name: &str,
        project: &str,
        name: Option<String>,
        import_type: &str,
        mut body: R,
    ) -> Result<Outcome>
    where
        R: AsyncRead + Send + Unpin,
    {
        let project = self.effective_project(project)?;
        let pool = self.pool(pool_name)?;

        if import_type == "iso" {
            let name = name.ok_or_else(|| Error::InvalidInput("No name provided".into()))?;
            let identity = Self::identity(pool.name(), &project, VolumeKind::Custom, &name);
            let _guard = self.locks.lock(&identity).await;
            self.check_new_volume(&pool, &project, &name, &Default::default())?;
            pool.create_custom_volume_from_reader(
                NewVolume {
                    project: project.clone(),
                    name,
                    content_type: ContentType::Iso,
                    ..NewVolume::default()
                },
                &mut body,
            )
            .await?;
            return Ok(Outcome::Done {
                location: Some(identity.url()),
            });
        }

        if let Some(name) = &name {
            self.check_new_volume(&pool, &project, name, &Default::default())?;
        }
        let spool = self.spool(&mut body).await?;
        let runner = BackupRunner {
            orch: self.clone(),
            pool,
            project: project.clone(),
            name,
            spool,
        };
        let op = self.launch(OperationSpec::task(
            OperationType::CustomVolumeBackupRestore,
            &project,
            Arc::new(runner),
        ))?;
        Ok(Outcome::Started(op))
    }

    /// Copy an upload to a local file so the request can finish before
    /// the restore does
    async fn spool<R>(&self, body: &mut R) -> Result<PathBuf>
    where
        R: AsyncRead + Send + Unpin,
    {
        tokio::fs::create_dir_all(&self.spool_dir).await?;
        let path = self
            .spool_dir
            .join(format!("{}.backup", uuid::Uuid::new_v4()));
        let result = async {
            let mut file = tokio::fs::File::create(&path).await?;
            let written = tokio::io::copy(body, &mut file).await?;
            file.flush().await?;
            Ok::<_, std::io::Error>(written)
        }
        .await;
        match result {
            Ok(written) => {
                tracing::debug!(path = %path.display(), bytes = written, "Spooled backup upload");
                Ok(path)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&path).await;
                Err(e.into())
            }
        }
    }
}

struct BackupRunner {
    orch: Arc<Orchestrator>,
    pool: StoragePool,
    project: String,
    name: Option<String>,
    spool: PathBuf,
}

impl BackupRunner {
    async fn open_spool(&self) -> Result<tokio::fs::File> {
        Ok(tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.spool)
            .await?)
    }

    async fn restore(&self, cancel: &CancellationToken) -> Result<()> {
        let name = match &self.name {
            Some(name) => name.clone(),
            None => backup_name(self.open_spool().await?).await?,
        };
        let identity = Orchestrator::identity(self.pool.name(), &self.project, VolumeKind::Custom, &name);
        let _guard = self.orch.locks.lock(&identity).await;
        self.orch
            .check_new_volume(&self.pool, &self.project, &name, &Default::default())?;
        import_backup(&self.pool, &self.project, Some(&name), self.open_spool().await?, cancel).await?;
        Ok(())
    }
}

#[async_trait]
impl Runner for BackupRunner {
    async fn run(&self, ctx: OperationContext) -> Result<()> {
        let result = self.restore(&ctx.cancel).await;
        if let Err(e) = tokio::fs::remove_file(&self.spool).await {
            tracing::warn!(path = %self.spool.display(), error = %e, "Failed to remove spooled backup");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::source::export_backup;
    use crate::operations::OperationStatus;
    use crate::orchestrator::tests::fixture;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_iso_upload() {
        let f = fixture();
        let data: &[u8] = b"\x01CD001 iso payload";
        f.orch
            .import_volume("default", "default", Some("installer".into()), "iso", data)
            .await
            .unwrap();

        let pool = f.orch.pool("default").unwrap();
        let record = pool.get_volume("default", VolumeKind::Custom, "installer").unwrap();
        assert_eq!(record.content_type, ContentType::Iso);
        let (mut reader, _) = pool.open_volume(&record, None).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, data);
    }

    #[tokio::test]
    async fn test_iso_upload_requires_name() {
        let f = fixture();
        let err = f
            .orch
            .import_volume("default", "default", None, "iso", &b""[..])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_backup_roundtrip_with_new_name() {
        let f = fixture();
        let pool = f.orch.pool("default").unwrap();
        let mut content: &[u8] = b"backup me";
        pool.create_custom_volume_from_reader(
            NewVolume {
                project: "default".into(),
                name: "orig".into(),
                ..NewVolume::default()
            },
            &mut content,
        )
        .await
        .unwrap();
        pool.create_custom_volume_snapshot("default", "orig", "snap0")
            .await
            .unwrap();

        let archive = export_backup(&pool, "default", "orig", false, 4, std::io::Cursor::new(Vec::new()))
            .await
            .unwrap()
            .into_inner();

        let op = match f
            .orch
            .import_volume("default", "default", Some("restored".into()), "", archive.as_slice())
            .await
            .unwrap()
        {
            Outcome::Started(op) => op,
            Outcome::Done { .. } => panic!("backup restore must run as an operation"),
        };
        let view = f
            .orch
            .tracker()
            .wait(op.id(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(view.status, OperationStatus::Success, "{}", view.err);

        let restored = pool.get_volume("default", VolumeKind::Custom, "restored").unwrap();
        assert_eq!(pool.list_snapshots(&restored).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backup_restore_waits_for_archived_name() {
        let f = fixture();
        let pool = f.orch.pool("default").unwrap();
        let mut content: &[u8] = b"keep me";
        pool.create_custom_volume_from_reader(
            NewVolume {
                project: "default".into(),
                name: "orig".into(),
                ..NewVolume::default()
            },
            &mut content,
        )
        .await
        .unwrap();
        let archive = export_backup(&pool, "default", "orig", true, 4, std::io::Cursor::new(Vec::new()))
            .await
            .unwrap()
            .into_inner();
        pool.delete_custom_volume("default", "orig").await.unwrap();

        let identity = Orchestrator::identity("default", "default", VolumeKind::Custom, "orig");
        let guard = f.orch.locks.lock(&identity).await;
        let op = match f
            .orch
            .import_volume("default", "default", None, "", archive.as_slice())
            .await
            .unwrap()
        {
            Outcome::Started(op) => op,
            Outcome::Done { .. } => panic!("backup restore must run as an operation"),
        };

        // the name only comes from the archive, and is still held
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(pool.get_volume("default", VolumeKind::Custom, "orig").is_err());

        drop(guard);
        let view = f
            .orch
            .tracker()
            .wait(op.id(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(view.status, OperationStatus::Success, "{}", view.err);
        assert!(pool.get_volume("default", VolumeKind::Custom, "orig").is_ok());
    }

    #[tokio::test]
    async fn test_backup_restore_rejects_taken_archived_name() {
        let f = fixture();
        let pool = f.orch.pool("default").unwrap();
        pool.create_custom_volume(NewVolume {
            project: "default".into(),
            name: "orig".into(),
            ..NewVolume::default()
        })
        .await
        .unwrap();
        let archive = export_backup(&pool, "default", "orig", true, 4, std::io::Cursor::new(Vec::new()))
            .await
            .unwrap()
            .into_inner();

        let op = match f
            .orch
            .import_volume("default", "default", None, "", archive.as_slice())
            .await
            .unwrap()
        {
            Outcome::Started(op) => op,
            Outcome::Done { .. } => panic!("backup restore must run as an operation"),
        };
        let view = f
            .orch
            .tracker()
            .wait(op.id(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(view.status, OperationStatus::Failure);
        assert!(view.err.contains("already exists"), "{}", view.err);
    }
}
