//! Project disk limits
//!
//! `limits.disk` on a project caps the sum of the `size` config keys of all
//! custom volumes stored in it, across every pool.

use crate::cluster::db::ClusterTx;
use crate::common::{format_bytes, parse_size, Error, Result};
use crate::storage::volume::{is_snapshot, VolumeKind};
use std::collections::BTreeMap;

pub const LIMIT_KEY: &str = "limits.disk";
pub const SIZE_KEY: &str = "size";

/// Size a volume claims; volumes without a `size` key claim nothing
pub fn claimed_size(config: &BTreeMap<String, String>) -> Result<u64> {
    match config.get(SIZE_KEY) {
        Some(size) => parse_size(size),
        None => Ok(0),
    }
}

/// Check that giving volume `name` in `project` the config `config` keeps the
/// project under its disk limit. An existing volume of that name is replaced
/// in the sum, not added to it.
pub fn check_disk_limit(
    tx: &ClusterTx,
    project: &str,
    name: &str,
    config: &BTreeMap<String, String>,
) -> Result<()> {
    let limit = match tx.get_project(project)?.config.get(LIMIT_KEY) {
        Some(limit) => parse_size(limit)?,
        None => return Ok(()),
    };

    let mut used = claimed_size(config)?;
    for pool in tx.list_storage_pools() {
        for vol in tx.list_storage_volumes(pool.id, Some(project), Some(VolumeKind::Custom)) {
            if is_snapshot(&vol.name) || vol.name == name {
                continue;
            }
            used = used.saturating_add(claimed_size(&vol.config)?);
        }
    }

    if used > limit {
        return Err(Error::Forbidden(format!(
            "Project {:?} would use {} of disk, above its limit of {}",
            project,
            format_bytes(used),
            format_bytes(limit)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::db::tests::volume;
    use crate::cluster::ClusterDb;

    fn sized(size: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(SIZE_KEY.to_string(), size.to_string())])
    }

    #[test]
    fn test_disk_limit() {
        let db = ClusterDb::in_memory();
        db.transaction(|tx| {
            tx.create_project(
                "default",
                BTreeMap::from([(LIMIT_KEY.to_string(), "10GiB".to_string())]),
            )?;
            tx.create_project("open", BTreeMap::new())?;
            let pool = tx.create_storage_pool("default", "dir", "", BTreeMap::new())?;
            let mut v = volume(pool, "data", Some("node1"));
            v.config = sized("6GiB");
            tx.create_storage_volume(v)?;
            Ok(())
        })
        .unwrap();

        db.transaction(|tx| {
            assert!(check_disk_limit(tx, "default", "more", &sized("4GiB")).is_ok());
            let err = check_disk_limit(tx, "default", "more", &sized("5GiB")).unwrap_err();
            assert!(matches!(err, Error::Forbidden(_)));
            // resizing the existing volume replaces its claim
            assert!(check_disk_limit(tx, "default", "data", &sized("9GiB")).is_ok());
            assert!(check_disk_limit(tx, "open", "any", &sized("1TiB")).is_ok());
            Ok(())
        })
        .unwrap();
    }
}
