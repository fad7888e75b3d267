//! Channel rendezvous for a migration
//!
//! The side that waits for connections mints one single-use secret per
//! channel; the other side dials `/1.0/operations/<id>/websocket?secret=`.

use crate::common::{random_secret, Error, Result};
use crate::migration::transport::{dial, Transport};
use crate::operations::ChannelAcceptor;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub const CONTROL: &str = "control";
pub const FILESYSTEM: &str = "filesystem";
pub const CHANNELS: [&str; 2] = [CONTROL, FILESYSTEM];

/// Connected control and data channels
pub struct Channels {
    pub control: Box<dyn Transport>,
    pub filesystem: Box<dyn Transport>,
}

impl Channels {
    pub async fn close(mut self) {
        let _ = self.control.shutdown().await;
        let _ = self.filesystem.shutdown().await;
    }
}

struct Slot {
    channel: &'static str,
    secret: String,
    tx: Option<oneshot::Sender<Box<dyn Transport>>>,
}

/// Inbound side of a migration
pub struct MigrationSession {
    slots: Mutex<Vec<Slot>>,
    pending: Mutex<Option<HashMap<&'static str, oneshot::Receiver<Box<dyn Transport>>>>>,
    cancel: CancellationToken,
}

impl Default for MigrationSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationSession {
    pub fn new() -> Self {
        let mut slots = Vec::new();
        let mut pending = HashMap::new();
        for channel in CHANNELS {
            let (tx, rx) = oneshot::channel();
            slots.push(Slot {
                channel,
                secret: random_secret(),
                tx: Some(tx),
            });
            pending.insert(channel, rx);
        }
        Self {
            slots: Mutex::new(slots),
            pending: Mutex::new(Some(pending)),
            cancel: CancellationToken::new(),
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `{"control": "<secret>", "filesystem": "<secret>"}`
    pub fn secrets(&self) -> Map<String, Value> {
        self.slots()
            .iter()
            .map(|s| (s.channel.to_string(), Value::String(s.secret.clone())))
            .collect()
    }

    /// Operation metadata advertising the secrets
    pub fn metadata(&self) -> Map<String, Value> {
        let mut meta = Map::new();
        meta.insert("websockets".into(), Value::Object(self.secrets()));
        meta
    }

    /// Wait until both channels are connected, `timeout` elapses or the
    /// session is disconnected. Can only be called once.
    pub async fn wait_for_channels(&self, timeout: Duration) -> Result<Channels> {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| Error::Internal("Migration channels already claimed".into()))?;
        let control = pending.remove(CONTROL);
        let filesystem = pending.remove(FILESYSTEM);
        let (Some(control), Some(filesystem)) = (control, filesystem) else {
            return Err(Error::Internal("Migration session is missing a channel".into()));
        };

        let both = async {
            let control = control.await.map_err(|_| Error::Cancelled)?;
            let filesystem = filesystem.await.map_err(|_| Error::Cancelled)?;
            Ok::<_, Error>(Channels {
                control,
                filesystem,
            })
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            res = tokio::time::timeout(timeout, both) => res.map_err(|_| {
                Error::Timeout("Timed out waiting for migration connections".into())
            })?,
        }
    }

    /// Abort a pending or running migration
    pub fn disconnect(&self) {
        self.cancel.cancel();
        // drop unclaimed senders so waiters wake up
        for slot in self.slots().iter_mut() {
            slot.tx = None;
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[async_trait]
impl ChannelAcceptor for MigrationSession {
    fn accepts(&self, secret: &str) -> bool {
        self.slots()
            .iter()
            .any(|s| s.tx.is_some() && s.secret == secret)
    }

    async fn connect(&self, secret: &str, transport: Box<dyn Transport>) -> Result<()> {
        let (channel, tx) = {
            let mut slots = self.slots();
            let slot = slots
                .iter_mut()
                .find(|s| s.secret == secret)
                .ok_or_else(|| Error::Forbidden("Invalid websocket secret".into()))?;
            let tx = slot
                .tx
                .take()
                .ok_or_else(|| Error::Forbidden("Websocket secret already used".into()))?;
            (slot.channel, tx)
        };
        tx.send(transport)
            .map_err(|_| Error::Conflict("Migration is no longer waiting for connections".into()))?;
        tracing::debug!(channel, "Migration channel connected");
        Ok(())
    }
}

/// Dial both channels of a remote websocket operation
pub async fn dial_channels(
    operation: &str,
    secrets: &HashMap<String, String>,
    certificate: Option<&str>,
    timeout: Duration,
) -> Result<Channels> {
    let secret = |channel: &str| {
        secrets.get(channel).ok_or_else(|| {
            Error::InvalidInput(format!("Missing websocket secret for {:?}", channel))
        })
    };
    let control = dial(operation, secret(CONTROL)?, certificate, timeout).await?;
    let filesystem = dial(operation, secret(FILESYSTEM)?, certificate, timeout).await?;
    Ok(Channels {
        control: Box::new(control),
        filesystem: Box::new(filesystem),
    })
}
