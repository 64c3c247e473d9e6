use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::Instant;

use crate::decision::Decision;
use crate::error::{RelayError, Result};
use crate::ipc::{kinds, Envelope, PermissionPoll, PermissionResponse, PollStatus, MAX_FRAME_BYTES};

/// Unix socket client used by hook helpers. One client is one connection.
pub struct IpcClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    poll_seq: u64,
}

impl IpcClient {
    /// Connect to the orchestrator socket.
    pub async fn connect(socket_path: &Path, timeout: Duration) -> Result<Self> {
        if !socket_path.exists() {
            return Err(RelayError::SocketNotFound {
                path: socket_path.to_path_buf(),
            });
        }

        let stream = tokio::time::timeout(timeout, UnixStream::connect(socket_path))
            .await
            .map_err(|_| RelayError::Ipc {
                reason: format!("connect timed out after {}ms", timeout.as_millis()),
            })?
            .map_err(|e| RelayError::Ipc {
                reason: format!("connect failed: {}", e),
            })?;

        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            poll_seq: 0,
        })
    }

    /// Send one envelope without waiting for anything back.
    pub async fn send(&mut self, kind: &str, payload: Value, request_id: Option<&str>) -> Result<()> {
        let envelope = Envelope::new(kind, request_id.map(String::from), payload);
        let mut data = serde_json::to_vec(&envelope)?;
        data.push(b'\n');
        self.writer
            .write_all(&data)
            .await
            .map_err(|e| RelayError::Ipc {
                reason: format!("write failed: {}", e),
            })?;
        self.writer.flush().await.map_err(|e| RelayError::Ipc {
            reason: format!("flush failed: {}", e),
        })
    }

    /// Send an envelope and read frames until the one carrying the same
    /// `request_id` arrives. Unrelated frames (broadcasts) are skipped.
    pub async fn request(
        &mut self,
        kind: &str,
        payload: Value,
        request_id: &str,
        timeout: Duration,
    ) -> Result<Envelope> {
        self.send(kind, payload, Some(request_id)).await?;

        let deadline = Instant::now() + timeout;
        loop {
            let frame = match tokio::time::timeout_at(deadline, self.read_frame()).await {
                Ok(frame) => frame?,
                Err(_) => {
                    return Err(RelayError::TransportTimeout {
                        request_id: request_id.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            };

            let Some(frame) = frame else {
                return Err(RelayError::Ipc {
                    reason: "orchestrator closed the connection".into(),
                });
            };

            match serde_json::from_slice::<Envelope>(&frame) {
                Ok(envelope) if envelope.request_id.as_deref() == Some(request_id) => {
                    return Ok(envelope)
                }
                Ok(envelope) => {
                    tracing::debug!("skipping unrelated frame of type {}", envelope.kind);
                }
                Err(e) => {
                    tracing::debug!("skipping unreadable frame: {}", e);
                }
            }
        }
    }

    /// Ask once for the state of a confirmation request.
    pub async fn poll_permission(
        &mut self,
        request_id: &str,
        timeout: Duration,
    ) -> Result<PermissionResponse> {
        self.poll_seq += 1;
        let poll_id = format!("poll_{}_{}", request_id, self.poll_seq);
        let payload = serde_json::to_value(PermissionPoll {
            request_id: request_id.to_string(),
        })?;

        let reply = self
            .request(kinds::GET_PERMISSION_RESPONSE, payload, &poll_id, timeout)
            .await?;
        if reply.kind == kinds::ERROR {
            return Err(RelayError::Ipc {
                reason: format!("orchestrator rejected poll: {}", reply.payload),
            });
        }
        Ok(serde_json::from_value(reply.payload)?)
    }

    /// Poll until the request is resolved or `max_wait` has elapsed.
    ///
    /// Each poll is a separate correlated request, so the wait survives
    /// orchestrator hiccups and can be resumed by a later hook invocation with
    /// the same `request_id`. Returns `None` when `max_wait` runs out.
    pub async fn poll_for_decision(
        &mut self,
        request_id: &str,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> Result<Option<PermissionResponse>> {
        let started = Instant::now();

        loop {
            match self
                .poll_permission(request_id, poll_interval + Duration::from_secs(1))
                .await
            {
                Ok(response) if response.status == PollStatus::NotFound => {
                    return Ok(Some(PermissionResponse {
                        request_id: request_id.to_string(),
                        status: PollStatus::NotFound,
                        decision: Some(Decision::Deny),
                        reason: Some("request not found".into()),
                    }));
                }
                Ok(response) if response.status.is_final() => return Ok(Some(response)),
                Ok(_) => {}
                Err(RelayError::TransportTimeout { .. }) => {
                    tracing::debug!("poll for {} timed out, retrying", request_id);
                }
                Err(e) => return Err(e),
            }

            if started.elapsed() + poll_interval > max_wait {
                return Ok(None);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Close the write side so the orchestrator sees EOF.
    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await.map_err(|e| RelayError::Ipc {
            reason: format!("shutdown failed: {}", e),
        })
    }

    /// Read one newline-terminated frame (bounded to 1MB to prevent OOM).
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = Vec::new();
        let n = (&mut self.reader)
            .take(MAX_FRAME_BYTES)
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| RelayError::Ipc {
                reason: format!("read failed: {}", e),
            })?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf))
    }
}
