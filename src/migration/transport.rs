//! Message channels used by migration
//!
//! A [`Transport`] carries text and binary frames. Inbound channels come
//! from the axum websocket upgrade, outbound ones from tokio-tungstenite,
//! backups from a length-prefixed archive and tests from an in-memory pair.

use crate::cluster::tls;
use crate::common::{Error, Result};
use async_trait::async_trait;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

#[async_trait]
pub trait Transport: Send {
    async fn send_frame(&mut self, frame: Frame) -> Result<()>;

    /// Next data frame; `None` once the peer closed the channel
    async fn recv_frame(&mut self) -> Result<Option<Frame>>;

    async fn shutdown(&mut self) -> Result<()>;
}

/// Server side of an upgraded websocket
pub struct AxumTransport(pub WebSocket);

#[async_trait]
impl Transport for AxumTransport {
    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        let msg = match frame {
            Frame::Text(text) => AxumMessage::Text(text),
            Frame::Binary(data) => AxumMessage::Binary(data),
        };
        self.0.send(msg).await?;
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<Option<Frame>> {
        while let Some(msg) = self.0.recv().await {
            match msg? {
                AxumMessage::Text(text) => return Ok(Some(Frame::Text(text))),
                AxumMessage::Binary(data) => return Ok(Some(Frame::Binary(data))),
                AxumMessage::Close(_) => return Ok(None),
                AxumMessage::Ping(_) | AxumMessage::Pong(_) => continue,
            }
        }
        Ok(None)
    }

    async fn shutdown(&mut self) -> Result<()> {
        // peer may already be gone
        let _ = self.0.send(AxumMessage::Close(None)).await;
        Ok(())
    }
}

/// Client side of a dialed websocket
pub struct WsClientTransport(pub WebSocketStream<MaybeTlsStream<TcpStream>>);

#[async_trait]
impl Transport for WsClientTransport {
    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        let msg = match frame {
            Frame::Text(text) => WsMessage::Text(text),
            Frame::Binary(data) => WsMessage::Binary(data),
        };
        self.0.send(msg).await?;
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<Option<Frame>> {
        while let Some(msg) = self.0.next().await {
            match msg? {
                WsMessage::Text(text) => return Ok(Some(Frame::Text(text))),
                WsMessage::Binary(data) => return Ok(Some(Frame::Binary(data))),
                WsMessage::Close(_) => return Ok(None),
                _ => continue,
            }
        }
        Ok(None)
    }

    async fn shutdown(&mut self) -> Result<()> {
        let _ = self.0.close(None).await;
        Ok(())
    }
}

/// One end of an in-process channel pair
pub struct MemoryTransport {
    tx: Option<mpsc::Sender<Frame>>,
    rx: mpsc::Receiver<Frame>,
}

/// Two connected in-process transports
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::channel(16);
    let (b_tx, b_rx) = mpsc::channel(16);
    (
        MemoryTransport {
            tx: Some(a_tx),
            rx: b_rx,
        },
        MemoryTransport {
            tx: Some(b_tx),
            rx: a_rx,
        },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::Websocket("channel closed".into()))?;
        tx.send(frame)
            .await
            .map_err(|_| Error::Websocket("peer disconnected".into()))
    }

    async fn recv_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.rx.recv().await)
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

const TAG_TEXT: u8 = 0;
const TAG_BINARY: u8 = 1;

/// Frames stored back to back as `tag | u32 length | payload`.
/// Reading yields `None` at end of input.
pub struct ArchiveTransport<S> {
    inner: S,
    max_frame: u32,
}

impl<S> ArchiveTransport<S> {
    pub fn new(inner: S, max_frame: u32) -> Self {
        Self { inner, max_frame }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S> Transport for ArchiveTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        let (tag, payload) = match &frame {
            Frame::Text(text) => (TAG_TEXT, text.as_bytes()),
            Frame::Binary(data) => (TAG_BINARY, data.as_slice()),
        };
        self.inner.write_u8(tag).await?;
        self.inner.write_u32(payload.len() as u32).await?;
        self.inner.write_all(payload).await?;
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<Option<Frame>> {
        let tag = match self.inner.read_u8().await {
            Ok(tag) => tag,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let len = self.inner.read_u32().await?;
        if len > self.max_frame {
            return Err(Error::InvalidInput(format!(
                "Backup frame of {} bytes exceeds the limit of {}",
                len, self.max_frame
            )));
        }
        let mut payload = vec![0u8; len as usize];
        self.inner.read_exact(&mut payload).await?;
        match tag {
            TAG_TEXT => String::from_utf8(payload)
                .map(|text| Some(Frame::Text(text)))
                .map_err(|_| Error::InvalidInput("Backup contains a malformed text frame".into())),
            TAG_BINARY => Ok(Some(Frame::Binary(payload))),
            other => Err(Error::InvalidInput(format!(
                "Backup contains unknown frame type {}",
                other
            ))),
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.inner.flush().await?;
        Ok(())
    }
}

/// `ws(s)://host/1.0/operations/<id>/websocket?secret=<secret>`
pub fn websocket_url(operation: &str, secret: &str) -> Result<String> {
    let rest = if let Some(rest) = operation.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = operation.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        return Err(Error::InvalidInput(format!(
            "Migration operation URL must be absolute: {:?}",
            operation
        )));
    };
    Ok(format!(
        "{}/websocket?secret={}",
        rest.trim_end_matches('/'),
        crate::common::encode_segment(secret)
    ))
}

/// Dial one channel of a remote websocket operation. With `certificate`
/// the peer must present exactly that certificate.
pub async fn dial(
    operation: &str,
    secret: &str,
    certificate: Option<&str>,
    timeout: Duration,
) -> Result<WsClientTransport> {
    let url = websocket_url(operation, secret)?;
    let connector = match certificate {
        Some(pem) if url.starts_with("wss://") => {
            Some(Connector::Rustls(tls::pinned_client_config(pem)?))
        }
        _ => None,
    };

    let host = operation
        .split("://")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or(operation)
        .to_string();
    let connect = tokio_tungstenite::connect_async_tls_with_config(url, None, false, connector);
    let (stream, _) = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| Error::unavailable(&host, "websocket handshake timed out"))?
        .map_err(|e| Error::unavailable(&host, e))?;
    tracing::debug!(peer = %host, "Dialed migration channel");
    Ok(WsClientTransport(stream))
}
