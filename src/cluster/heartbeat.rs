//! Member liveness
//!
//! Every interval the local member refreshes its own heartbeat and probes
//! the other members; a member that answers gets its heartbeat refreshed.
//! Members whose heartbeat is older than the offline threshold are treated
//! as offline by the forwarder.

use crate::cluster::client::MemberClient;
use crate::cluster::db::{ClusterDb, MemberRecord};
use crate::common::config::Config;
use crate::common::{timestamp_now, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Record the local member and the configured peers
pub fn register_members(db: &ClusterDb, config: &Config) -> Result<()> {
    let now = timestamp_now();
    db.transaction(|tx| {
        tx.upsert_member(MemberRecord {
            name: config.server.member_name.clone(),
            url: config.server.advertised_url(),
            last_heartbeat: now,
        })?;
        for seed in &config.cluster.members {
            let last_heartbeat = tx
                .get_node_by_name(&seed.name)
                .map(|m| m.last_heartbeat)
                .unwrap_or(0);
            tx.upsert_member(MemberRecord {
                name: seed.name.clone(),
                url: seed.url.clone(),
                last_heartbeat,
            })?;
        }
        Ok(())
    })
}

/// One round of heartbeats
pub async fn heartbeat_round(db: &ClusterDb, client: &MemberClient, local: &str) -> Result<()> {
    let now = timestamp_now();
    let members = db.transaction(|tx| {
        tx.touch_heartbeat(local, now)?;
        Ok(tx.list_members())
    })?;

    for member in members.iter().filter(|m| m.name != local) {
        match client.ping(member).await {
            Ok(()) => db.transaction(|tx| tx.touch_heartbeat(&member.name, timestamp_now()))?,
            Err(e) => tracing::debug!(member = %member.name, error = %e, "Heartbeat failed"),
        }
    }
    Ok(())
}

/// Run heartbeat rounds until `shutdown` fires
pub async fn run_heartbeat(
    db: Arc<ClusterDb>,
    client: MemberClient,
    local: String,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = heartbeat_round(&db, &client, &local).await {
                    tracing::warn!(error = %e, "Heartbeat round failed");
                }
            }
        }
    }
    tracing::debug!("Heartbeat task stopped");
}
