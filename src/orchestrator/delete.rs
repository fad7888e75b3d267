use super::Orchestrator;
use crate::common::{Error, Result};
use crate::storage::volume::{is_snapshot, VolumeAction};
use crate::storage::VolumeKind;

impl Orchestrator {
    /// Delete a custom or image volume that nothing else uses
    pub async fn delete_volume(
        &self,
        pool_name: &str,
        project: &str,
        kind: VolumeKind,
        name: &str,
    ) -> Result<()> {
        kind.require(VolumeAction::Delete)?;
        if is_snapshot(name) {
            return Err(Error::InvalidInput(
                "Snapshots are deleted together with their volume".into(),
            ));
        }
        let project = self.volume_project(project, kind)?;
        let pool = self.pool(pool_name)?;
        let identity = Self::identity(pool.name(), &project, kind, name);
        let _guard = self.locks.lock(&identity).await;

        let record = pool.get_volume(&project, kind, name)?;
        self.check_busy(&identity)?;

        let view = self.volume_view(&pool, &record)?;
        let own_image = format!("/1.0/images/{}", name);
        // an image volume is always referenced by its own image
        let only_own_image = kind == VolumeKind::Image
            && view.used_by.len() == 1
            && view.used_by[0].split('?').next() == Some(own_image.as_str());
        if !view.used_by.is_empty() && !only_own_image {
            return Err(Error::InvalidInput("Storage volume still in use".into()));
        }

        match kind {
            VolumeKind::Image => pool.delete_image_volume(&project, name).await,
            _ => pool.delete_custom_volume(&project, name).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cluster::db::{ImageRecord, VolumeRecord};
    use crate::common::Error;
    use crate::orchestrator::tests::{attach, fixture};
    use crate::storage::{ContentType, NewVolume, VolumeKind};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_delete_in_use_is_rejected() {
        let f = fixture();
        let pool = f.orch.pool("default").unwrap();
        pool.create_custom_volume(NewVolume {
            project: "default".into(),
            name: "data".into(),
            ..NewVolume::default()
        })
        .await
        .unwrap();
        attach(&f.db, "web", "default", "data", false);

        let err = f
            .orch
            .delete_volume("default", "default", VolumeKind::Custom, "data")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(ref m) if m == "Storage volume still in use"));
    }

    #[tokio::test]
    async fn test_delete_rejects_instance_volumes() {
        let f = fixture();
        let err = f
            .orch
            .delete_volume("default", "default", VolumeKind::VirtualMachine, "vm1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(ref m) if m.contains("virtual-machine")));
    }

    /// Image volume on the default pool cached by the image in each of `projects`
    async fn image_volume(
        f: &crate::orchestrator::tests::Fixture,
        fingerprint: &str,
        projects: &[&str],
    ) -> crate::storage::StoragePool {
        let pool = f.orch.pool("default").unwrap();
        let vol = crate::storage::DriverVolume::new(
            "default",
            VolumeKind::Image,
            fingerprint,
            ContentType::Filesystem,
        );
        pool.driver().create_volume(&vol).await.unwrap();
        f.db.transaction(|tx| {
            tx.create_storage_volume(VolumeRecord {
                id: 0,
                pool_id: pool.id(),
                project: "default".into(),
                kind: VolumeKind::Image,
                name: fingerprint.to_string(),
                member: Some("node1".into()),
                content_type: ContentType::Filesystem,
                description: String::new(),
                config: BTreeMap::new(),
                created_at: 0,
            })?;
            for project in projects {
                tx.put_image(ImageRecord {
                    project: project.to_string(),
                    fingerprint: fingerprint.to_string(),
                })?;
            }
            Ok(())
        })
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn test_image_volume_used_by_own_image() {
        let f = fixture();
        let fingerprint = "a".repeat(64);
        let pool = image_volume(&f, &fingerprint, &["default"]).await;

        let record = pool.get_volume("default", VolumeKind::Image, &fingerprint).unwrap();
        assert_eq!(f.orch.volume_view(&pool, &record).unwrap().used_by.len(), 1);

        f.orch
            .delete_volume("default", "default", VolumeKind::Image, &fingerprint)
            .await
            .unwrap();
        assert!(pool.get_volume("default", VolumeKind::Image, &fingerprint).is_err());
    }

    #[tokio::test]
    async fn test_image_volume_shared_by_two_projects_is_in_use() {
        let f = fixture();
        let fingerprint = "b".repeat(64);
        let pool = image_volume(&f, &fingerprint, &["default", "other"]).await;

        let record = pool.get_volume("default", VolumeKind::Image, &fingerprint).unwrap();
        assert_eq!(f.orch.volume_view(&pool, &record).unwrap().used_by.len(), 2);

        let err = f
            .orch
            .delete_volume("default", "default", VolumeKind::Image, &fingerprint)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(ref m) if m == "Storage volume still in use"));
        assert!(pool.get_volume("default", VolumeKind::Image, &fingerprint).is_ok());
    }
}
