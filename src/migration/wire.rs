//! Migration wire format
//!
//! Control channel: the source sends an [`OfferHeader`], the sink answers
//! with a [`ResponseHeader`] and finally reports a [`ControlResult`].
//!
//! Data channel: one section per transferred snapshot, then the volume
//! itself. A section is a `begin` text frame, binary chunks and an `end`
//! frame carrying the blake3 of the chunks. A `done` frame closes the list.

use crate::common::{Blake3Hasher, Error, Result};
use crate::migration::transport::{Frame, Transport};
use crate::storage::volume::ContentType;
use async_stream::try_stream;
use bytes::Bytes;
use futures_util::{pin_mut, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    /// Snapshot part only, without the parent name
    pub name: String,
    pub created_at: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferHeader {
    pub name: String,
    pub content_type: ContentType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub snapshots: Vec<SnapshotHeader>,
    #[serde(default)]
    pub volume_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub refresh: bool,
    /// Snapshots the sink wants, in transfer order
    pub snapshots: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResult {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKind {
    Snapshot,
    Volume,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DataMessage {
    Begin {
        kind: SectionKind,
        name: String,
        size: u64,
    },
    End {
        blake3: String,
    },
    Done,
}

pub async fn send_json<T: Serialize>(transport: &mut dyn Transport, value: &T) -> Result<()> {
    transport
        .send_frame(Frame::Text(serde_json::to_string(value)?))
        .await
}

/// Next text frame decoded as `T`; binary frames and closure are errors
pub async fn recv_json<T: DeserializeOwned>(transport: &mut dyn Transport) -> Result<T> {
    match transport.recv_frame().await? {
        Some(Frame::Text(text)) => serde_json::from_str(&text).map_err(|e| {
            Error::Websocket(format!("Malformed migration message: {}", e))
        }),
        Some(Frame::Binary(_)) => Err(Error::Websocket(
            "Unexpected binary frame on migration channel".into(),
        )),
        None => Err(Error::Websocket("Migration channel closed by peer".into())),
    }
}

/// `recv_json` that gives up when `cancel` fires
pub async fn recv_json_or_cancel<T: DeserializeOwned>(
    transport: &mut dyn Transport,
    cancel: &CancellationToken,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = recv_json(transport) => res,
    }
}

/// Chunks of `reader`, each at most `chunk_size` bytes
fn chunks<R>(reader: R, chunk_size: usize) -> impl Stream<Item = Result<Bytes>>
where
    R: AsyncRead + Send + Unpin,
{
    try_stream! {
        let inner = ReaderStream::with_capacity(reader, chunk_size);
        pin_mut!(inner);
        while let Some(chunk) = inner.next().await {
            yield chunk?;
        }
    }
}

/// Send one section read from `reader`
pub async fn send_section<R>(
    transport: &mut dyn Transport,
    kind: SectionKind,
    name: &str,
    reader: R,
    size: u64,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> Result<u64>
where
    R: AsyncRead + Send + Unpin,
{
    send_json(
        transport,
        &DataMessage::Begin {
            kind,
            name: name.to_string(),
            size,
        },
    )
    .await?;

    let mut hasher = Blake3Hasher::new();
    let mut sent = 0u64;
    let stream = chunks(reader, chunk_size);
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let chunk = chunk?;
        hasher.update(&chunk);
        sent += chunk.len() as u64;
        transport.send_frame(Frame::Binary(chunk.to_vec())).await?;
    }

    send_json(
        transport,
        &DataMessage::End {
            blake3: hasher.finalize(),
        },
    )
    .await?;
    tracing::debug!(section = ?kind, name, bytes = sent, "Sent migration section");
    Ok(sent)
}

/// Reader handed to the consumer of a section
pub type SectionReader = StreamReader<ReceiverStream<io::Result<Bytes>>, Bytes>;

/// Receive the body of a section whose `begin` frame was already read,
/// feeding it to `write`. The reader reports an error instead of a clean
/// end when the section is truncated or its checksum does not match, so a
/// consumer that commits on end of input never commits bad data.
pub async fn recv_section<F, Fut, T>(
    transport: &mut dyn Transport,
    size: u64,
    write: F,
) -> Result<T>
where
    F: FnOnce(SectionReader) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(4);
    let reader = StreamReader::new(ReceiverStream::new(rx));

    let pump = async move {
        let result = pump_section(transport, size, &tx).await;
        if let Err(e) = &result {
            let _ = tx
                .send(Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())))
                .await;
        }
        result
    };

    let (pumped, written) = tokio::join!(pump, write(reader));
    pumped?;
    written
}

async fn pump_section(
    transport: &mut dyn Transport,
    size: u64,
    tx: &mpsc::Sender<io::Result<Bytes>>,
) -> Result<()> {
    let mut hasher = Blake3Hasher::new();
    let mut received = 0u64;
    loop {
        match transport.recv_frame().await? {
            Some(Frame::Binary(data)) => {
                hasher.update(&data);
                received += data.len() as u64;
                if tx.send(Ok(Bytes::from(data))).await.is_err() {
                    return Err(Error::Internal("Volume writer stopped early".into()));
                }
            }
            Some(Frame::Text(text)) => {
                let msg: DataMessage = serde_json::from_str(&text)
                    .map_err(|e| Error::Websocket(format!("Malformed migration message: {}", e)))?;
                let expected = match msg {
                    DataMessage::End { blake3 } => blake3,
                    other => {
                        return Err(Error::ManifestMismatch(format!(
                            "expected end of section, got {:?}",
                            other
                        )))
                    }
                };
                if received != size {
                    return Err(Error::ManifestMismatch(format!(
                        "section announced {} bytes but carried {}",
                        size, received
                    )));
                }
                let actual = hasher.finalize();
                if actual != expected {
                    return Err(Error::ChecksumMismatch { expected, actual });
                }
                return Ok(());
            }
            None => return Err(Error::Websocket("Data channel closed mid-section".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::transport::memory_pair;
    use tokio::io::AsyncReadExt;

    async fn collect(mut reader: SectionReader) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    #[tokio::test]
    async fn test_section_transfer() {
        let (mut a, mut b) = memory_pair();
        let payload = vec![7u8; 10_000];
        let cancel = CancellationToken::new();

        let sender = async {
            send_section(&mut a, SectionKind::Volume, "data", payload.as_slice(), 10_000, 4096, &cancel)
                .await
        };
        let receiver = async {
            let begin: DataMessage = recv_json(&mut b).await?;
            let size = match begin {
                DataMessage::Begin { size, .. } => size,
                other => panic!("unexpected {:?}", other),
            };
            recv_section(&mut b, size, collect).await
        };
        let (sent, received) = tokio::join!(sender, receiver);
        assert_eq!(sent.unwrap(), 10_000);
        assert_eq!(received.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails_reader() {
        let (mut a, mut b) = memory_pair();
        a.send_frame(Frame::Binary(b"abc".to_vec())).await.unwrap();
        send_json(
            &mut a,
            &DataMessage::End {
                blake3: "0".repeat(64),
            },
        )
        .await
        .unwrap();

        let err = recv_section(&mut b, 3, collect).await.unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn test_truncated_section() {
        let (mut a, mut b) = memory_pair();
        a.send_frame(Frame::Binary(b"abc".to_vec())).await.unwrap();
        a.shutdown().await.unwrap();
        assert!(recv_section(&mut b, 10, collect).await.is_err());
    }

    #[test]
    fn test_data_message_format() {
        let json = serde_json::to_value(DataMessage::Begin {
            kind: SectionKind::Snapshot,
            name: "snap0".into(),
            size: 3,
        })
        .unwrap();
        assert_eq!(json["type"], "begin");
        assert_eq!(json["kind"], "snapshot");
        assert_eq!(serde_json::to_value(DataMessage::Done).unwrap()["type"], "done");
    }
}
