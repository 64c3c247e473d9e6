use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{RelayError, Result};
use crate::ipc::{kinds, Envelope, MAX_FRAME_BYTES};

/// Frames queued per peer before broadcasts start dropping it.
const PEER_QUEUE_DEPTH: usize = 64;

/// A peer that accepts no bytes for this long is disconnected.
const PEER_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Future returned by a message handler. `Some(payload)` is written back as a reply.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Option<Value>>> + Send>>;

type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;
type Frame = Arc<[u8]>;
type Outbox = mpsc::Sender<Frame>;

/// Unix socket server for the orchestrator.
///
/// Every accepted connection gets a reader task and a writer task and may
/// carry any number of envelopes. An envelope whose `request_id` matches a
/// registered waiter is a reply and completes that waiter; everything else
/// goes to the handler registered for its `type`.
pub struct IpcServer {
    socket_path: PathBuf,
    handlers: RwLock<HashMap<String, Handler>>,
    waiters: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
    peers: Mutex<HashMap<u64, Outbox>>,
    next_peer_id: AtomicU64,
    shutdown_signal: watch::Sender<bool>,
}

impl IpcServer {
    pub fn new(socket_path: PathBuf) -> Self {
        let (shutdown_signal, _) = watch::channel(false);
        Self {
            socket_path,
            handlers: RwLock::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            next_peer_id: AtomicU64::new(1),
            shutdown_signal,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Register the handler for a message type. A later registration replaces an earlier one.
    pub fn on<F, Fut>(&self, kind: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |payload| Box::pin(handler(payload)) as HandlerFuture);
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind.to_string(), handler);
    }

    /// Bind the socket. A leftover socket file from a crashed instance is
    /// removed; a socket that still accepts connections is an error.
    pub fn listen(&self) -> Result<UnixListener> {
        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if self.socket_path.exists() {
            if std::os::unix::net::UnixStream::connect(&self.socket_path).is_ok() {
                return Err(RelayError::TransportBind {
                    path: self.socket_path.clone(),
                });
            }
            tracing::warn!(
                "removing stale socket file: {}",
                self.socket_path.display()
            );
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| RelayError::Ipc {
            reason: format!(
                "failed to bind socket at {}: {}",
                self.socket_path.display(),
                e
            ),
        })?;
        set_socket_permissions_0600(&self.socket_path);

        tracing::info!("listening on {}", self.socket_path.display());
        Ok(listener)
    }

    /// Accept connections until `shutdown` is called. Each connection is handled in a spawned task.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> Result<()> {
        let mut shutdown = self.shutdown_signal.subscribe();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let server = self.clone();
                            let peer_id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
                            tokio::spawn(async move {
                                server.handle_connection(peer_id, stream).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                _ = stopped(&mut shutdown) => {
                    tracing::info!("ipc server shutting down");
                    break;
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }

    /// Stop accepting and close every open connection.
    pub fn shutdown(&self) {
        self.shutdown_signal.send_replace(true);
    }

    /// Number of currently connected peers.
    pub fn client_count(&self) -> usize {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Wait for a reply carrying `request_id`, from any connection.
    pub async fn request(&self, request_id: &str, timeout: Duration) -> Result<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id.to_string(), tx);

        let result = tokio::time::timeout(timeout, rx).await;

        self.waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(request_id);

        match result {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) | Err(_) => Err(RelayError::TransportTimeout {
                request_id: request_id.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Complete a waiter from inside the process. Returns false if nobody is waiting.
    pub fn resolve_request(&self, request_id: &str, payload: Value) -> bool {
        let waiter = self
            .waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(request_id);
        match waiter {
            Some(tx) => tx
                .send(Envelope::new(
                    "resolved",
                    Some(request_id.to_string()),
                    payload,
                ))
                .is_ok(),
            None => false,
        }
    }

    /// Queue `message` for every live connection and return how many took it.
    /// Never waits on a peer: one whose queue is full or closed is dropped.
    pub fn broadcast(&self, message: &Envelope) -> usize {
        let frame = match encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("could not encode {} broadcast: {}", message.kind, e);
                return 0;
            }
        };

        let mut sent = 0;
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|peer_id, outbox| match outbox.try_send(frame.clone()) {
                Ok(()) => {
                    sent += 1;
                    true
                }
                Err(e) => {
                    tracing::debug!("dropping peer {} after failed broadcast: {}", peer_id, e);
                    false
                }
            });
        sent
    }

    async fn handle_connection(self: Arc<Self>, peer_id: u64, stream: UnixStream) {
        let (reader, writer) = stream.into_split();
        let (outbox, queue) = mpsc::channel(PEER_QUEUE_DEPTH);
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer_id, outbox.clone());
        tokio::spawn(write_frames(peer_id, writer, queue));
        tracing::debug!("peer {} connected", peer_id);

        let mut reader = BufReader::new(reader);
        let mut shutdown = self.shutdown_signal.subscribe();

        loop {
            tokio::select! {
                inbound = read_inbound(&mut reader) => match inbound {
                    Ok(Inbound::Frame(frame)) => self.process_frame(peer_id, &frame, &outbox).await,
                    Ok(Inbound::Oversized) => {
                        tracing::warn!(
                            "dropping frame over {} bytes from peer {}",
                            MAX_FRAME_BYTES,
                            peer_id
                        );
                    }
                    Ok(Inbound::Closed) => break,
                    Err(e) => {
                        tracing::warn!("peer {} read failed: {}", peer_id, e);
                        break;
                    }
                },
                // The writer gave up on this peer.
                _ = outbox.closed() => break,
                _ = stopped(&mut shutdown) => break,
            }
        }

        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&peer_id);
        tracing::debug!("peer {} disconnected", peer_id);
    }

    async fn process_frame(&self, peer_id: u64, frame: &[u8], outbox: &Outbox) {
        let trimmed = frame.trim_ascii();
        if trimmed.is_empty() {
            return;
        }

        let envelope: Envelope = match serde_json::from_slice(trimmed) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("dropping malformed message from peer {}: {}", peer_id, e);
                return;
            }
        };

        tracing::debug!(
            "peer {} sent type={} request_id={:?}",
            peer_id,
            envelope.kind,
            envelope.request_id
        );

        if let Some(request_id) = &envelope.request_id {
            let waiter = self
                .waiters
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(request_id);
            if let Some(tx) = waiter {
                let _ = tx.send(envelope);
                return;
            }
        }

        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&envelope.kind)
            .cloned();
        let Some(handler) = handler else {
            tracing::warn!("no handler for message type: {}", envelope.kind);
            return;
        };

        let reply = match handler(envelope.payload.clone()).await {
            Ok(Some(payload)) => Envelope::reply_to(&envelope, payload),
            Ok(None) => return,
            Err(e) => {
                tracing::error!("handler for {} failed: {}", envelope.kind, e);
                Envelope::new(
                    kinds::ERROR,
                    envelope.request_id.clone(),
                    serde_json::json!({ "error": e.to_string() }),
                )
            }
        };

        let sent = match encode(&reply) {
            Ok(frame) => outbox.send(frame).await.is_ok(),
            Err(e) => {
                tracing::warn!("could not encode reply for peer {}: {}", peer_id, e);
                false
            }
        };
        if !sent {
            tracing::warn!("failed to reply to peer {}", peer_id);
        }
    }
}

enum Inbound {
    Frame(Vec<u8>),
    Oversized,
    Closed,
}

/// Read one newline-terminated frame, never buffering more than `MAX_FRAME_BYTES`.
async fn read_inbound(reader: &mut BufReader<OwnedReadHalf>) -> std::io::Result<Inbound> {
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_FRAME_BYTES)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(Inbound::Closed);
    }
    if buf.last() == Some(&b'\n') || (n as u64) < MAX_FRAME_BYTES {
        return Ok(Inbound::Frame(buf));
    }

    // Discard the rest of the oversized frame, one bounded chunk at a time.
    loop {
        buf.clear();
        let n = (&mut *reader)
            .take(MAX_FRAME_BYTES)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 || buf.last() == Some(&b'\n') {
            return Ok(Inbound::Oversized);
        }
    }
}

/// Drain a peer's queue onto its socket. Ends when the queue closes, a write
/// fails, or the peer stops reading for `PEER_WRITE_TIMEOUT`.
async fn write_frames(peer_id: u64, mut writer: OwnedWriteHalf, mut queue: mpsc::Receiver<Frame>) {
    while let Some(frame) = queue.recv().await {
        match tokio::time::timeout(PEER_WRITE_TIMEOUT, write_frame(&mut writer, &frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!("peer {} write failed: {}", peer_id, e);
                break;
            }
            Err(_) => {
                tracing::warn!(
                    "peer {} accepted nothing for {}s, disconnecting",
                    peer_id,
                    PEER_WRITE_TIMEOUT.as_secs()
                );
                break;
            }
        }
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

fn encode(envelope: &Envelope) -> serde_json::Result<Frame> {
    let mut data = serde_json::to_vec(envelope)?;
    data.push(b'\n');
    Ok(Frame::from(data))
}

/// Resolves once the shutdown flag is set.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// Set socket permissions to 0600 (owner read/write only).
#[cfg(unix)]
fn set_socket_permissions_0600(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    if let Err(e) = std::fs::set_permissions(path, perms) {
        tracing::warn!("could not restrict {}: {}", path.display(), e);
    }
}

#[cfg(not(unix))]
fn set_socket_permissions_0600(_path: &Path) {
    // No-op on non-Unix platforms
}
