//! Unix-socket relay medium
//!
//! A [`RelayHub`] accepts any number of peers on one socket path and forwards
//! every frame it reads from a peer to all other peers. Frames are
//! channel-agnostic at the hub; subscribers filter by channel on their side.
//!
//! ```text
//! ┌────────────┬─────────────┬──────────────┬─────────────┐
//! │ len: u32BE │ chan: u16BE │ channel utf8 │ payload ... │
//! └────────────┴─────────────┴──────────────┴─────────────┘
//!   len counts every byte after itself
//! ```
//!
//! A peer that only publishes sends one empty frame on
//! [`PUBLISH_ONLY_CHANNEL`] first; the hub then stops forwarding to it.

use async_trait::async_trait;
use realtime_config::bridge::MAX_FRAME_BYTES;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{MediumPublisher, PubSubMedium};
use crate::error::{BridgeError, BridgeResult};

/// Reserved channel a peer uses to opt out of receiving frames
pub const PUBLISH_ONLY_CHANNEL: &str = "relay:publish-only";

/// One decoded relay frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    pub channel: String,
    pub payload: Vec<u8>,
}

pub fn encode_frame(channel: &str, payload: &[u8]) -> BridgeResult<Vec<u8>> {
    let channel_len = u16::try_from(channel.len())
        .map_err(|_| BridgeError::Frame(format!("channel name of {} bytes", channel.len())))?;
    let body_len = 2 + channel.len() + payload.len();
    if body_len > MAX_FRAME_BYTES {
        return Err(BridgeError::Frame(format!(
            "frame of {} bytes exceeds {}",
            body_len, MAX_FRAME_BYTES
        )));
    }

    let mut frame = Vec::with_capacity(4 + body_len);
    frame.extend_from_slice(&(body_len as u32).to_be_bytes());
    frame.extend_from_slice(&channel_len.to_be_bytes());
    frame.extend_from_slice(channel.as_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Split a frame body (everything after the length prefix)
pub fn decode_frame_header(body: &[u8]) -> BridgeResult<(&str, &[u8])> {
    if body.len() < 2 {
        return Err(BridgeError::Frame("frame shorter than its header".to_string()));
    }
    let channel_len = u16::from_be_bytes([body[0], body[1]]) as usize;
    let rest = &body[2..];
    if channel_len > rest.len() {
        return Err(BridgeError::Frame(format!(
            "channel length {} exceeds frame body of {}",
            channel_len,
            rest.len()
        )));
    }

    let (channel, payload) = rest.split_at(channel_len);
    let channel = std::str::from_utf8(channel)
        .map_err(|e| BridgeError::Frame(format!("channel is not utf-8: {}", e)))?;
    Ok((channel, payload))
}

/// Read one frame; `None` on a clean end of stream
pub async fn read_frame<R>(reader: &mut R) -> BridgeResult<Option<RelayFrame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let body_len = u32::from_be_bytes(len_buf) as usize;
    if body_len > MAX_FRAME_BYTES {
        return Err(BridgeError::Frame(format!(
            "frame of {} bytes exceeds {}",
            body_len, MAX_FRAME_BYTES
        )));
    }

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;

    let (channel, payload) = decode_frame_header(&body)?;
    Ok(Some(RelayFrame {
        channel: channel.to_string(),
        payload: payload.to_vec(),
    }))
}

/// Fan-out hub for relay peers
pub struct RelayHub {
    listener: UnixListener,
    path: PathBuf,
    frames: broadcast::Sender<(u64, Arc<Vec<u8>>)>,
    next_peer: AtomicU64,
}

impl RelayHub {
    /// Bind the hub socket, replacing a stale socket file
    pub fn bind(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref().to_path_buf();

        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&path)?;
        let (frames, _) = broadcast::channel(10_000);
        info!("Relay hub listening on {}", path.display());

        Ok(Self {
            listener,
            path,
            frames,
            next_peer: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept peers until the task is cancelled
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let peer_id = self.next_peer.fetch_add(1, Ordering::Relaxed);
                    let frames = self.frames.clone();
                    tokio::spawn(async move {
                        handle_peer(stream, peer_id, frames).await;
                    });
                }
                Err(e) => {
                    warn!("Relay hub accept failed: {}", e);
                }
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

async fn handle_peer(
    stream: UnixStream,
    peer_id: u64,
    frames: broadcast::Sender<(u64, Arc<Vec<u8>>)>,
) {
    debug!("Relay peer {} connected", peer_id);
    let (mut read_half, mut write_half) = stream.into_split();
    let mut outbound = frames.subscribe();

    let write_task = tokio::spawn(async move {
        loop {
            match outbound.recv().await {
                Ok((from, frame)) => {
                    if from == peer_id {
                        continue;
                    }
                    if let Err(e) = write_half.write_all(&frame).await {
                        debug!("Relay peer {} write failed: {}", peer_id, e);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Relay peer {} lagged, skipped {} frames", peer_id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    loop {
        match read_frame(&mut read_half).await {
            Ok(Some(frame)) if frame.channel == PUBLISH_ONLY_CHANNEL => {
                debug!("Relay peer {} is publish-only", peer_id);
                write_task.abort();
            }
            Ok(Some(frame)) => match encode_frame(&frame.channel, &frame.payload) {
                Ok(encoded) => {
                    let _ = frames.send((peer_id, Arc::new(encoded)));
                }
                Err(e) => warn!("Relay peer {} sent unforwardable frame: {}", peer_id, e),
            },
            Ok(None) => break,
            Err(e) => {
                warn!("Relay peer {} read failed: {}", peer_id, e);
                break;
            }
        }
    }

    write_task.abort();
    debug!("Relay peer {} disconnected", peer_id);
}

/// Client side of a [`RelayHub`]
#[derive(Debug, Clone)]
pub struct RelaySocketMedium {
    path: PathBuf,
}

impl RelaySocketMedium {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn connect(&self) -> BridgeResult<UnixStream> {
        Ok(UnixStream::connect(&self.path).await?)
    }
}

struct RelayPublisher {
    writer: OwnedWriteHalf,
    // Held so the connection stays fully open; the hub never writes to it
    _reader: OwnedReadHalf,
}

#[async_trait]
impl MediumPublisher for RelayPublisher {
    async fn publish(&mut self, channel: &str, payload: &[u8]) -> BridgeResult<()> {
        let frame = encode_frame(channel, payload)?;
        self.writer.write_all(&frame).await?;
        Ok(())
    }
}

#[async_trait]
impl PubSubMedium for RelaySocketMedium {
    async fn publisher(&self) -> BridgeResult<Box<dyn MediumPublisher>> {
        let (reader, mut writer) = self.connect().await?.into_split();
        writer
            .write_all(&encode_frame(PUBLISH_ONLY_CHANNEL, &[])?)
            .await?;

        Ok(Box::new(RelayPublisher {
            writer,
            _reader: reader,
        }))
    }

    async fn subscriber(&self, channel: &str) -> BridgeResult<mpsc::Receiver<Vec<u8>>> {
        let stream = self.connect().await?;
        let (tx, rx) = mpsc::channel(1024);
        let channel = channel.to_string();

        tokio::spawn(async move {
            // Write half stays alive so the hub keeps this peer
            let (mut reader, _writer) = stream.into_split();
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) => {
                        if frame.channel != channel {
                            continue;
                        }
                        if tx.send(frame.payload).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        warn!("Relay hub closed the subscription");
                        break;
                    }
                    Err(e) => {
                        warn!("Relay subscription failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }
}
