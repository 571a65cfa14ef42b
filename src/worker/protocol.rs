//! Wire contract between the client and an out-of-process worker.
//!
//! Frames are length-delimited JSON: a 4-byte big-endian length prefix
//! followed by the JSON payload. Requests flow client to worker, carrying a
//! client-assigned id for log correlation; notifications flow worker to
//! client on a subscribed connection and carry no id, since delivery is
//! broadcast rather than request/response.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::command::Command;
use crate::error::{Result, StrongroomError};
use crate::model::ConflictSnapshot;
use crate::worker::ActionEvent;

/// Upper bound on a single frame. Command payloads carry opaque node bodies,
/// so the cap is generous, but a corrupt length prefix must not make us
/// allocate gigabytes.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// One request from the client to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// Client-assigned id, echoed in worker logs.
    pub id: u64,
    #[serde(flatten)]
    pub op: WorkerOp,
}

/// Operations the worker accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum WorkerOp {
    /// Turn this connection into a notification stream.
    Subscribe,
    /// Stop the in-flight command, if any.
    Stop,
    /// Execute a command.
    Start(Command),
    /// Re-emit the current command status to subscribers.
    QueryAction,
    /// Re-emit the pending store-change notice to subscribers.
    QueryStore,
    /// Adopt the externally changed store state.
    Resync,
}

/// One notification from the worker to a subscribed client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum WorkerNotification {
    /// Progress of the in-flight command.
    Action(ActionEvent),
    /// The persisted store changed underneath the session.
    StoreChanged(ConflictSnapshot),
}

async fn write_frame<W, T>(writer: &mut W, payload: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(payload)?;
    if bytes.len() > MAX_FRAME_SIZE as usize {
        return Err(StrongroomError::WorkerProtocol(format!(
            "frame too large: {} bytes (max {})",
            bytes.len(),
            MAX_FRAME_SIZE
        )));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_SIZE {
        return Err(StrongroomError::WorkerProtocol(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request: &WorkerRequest,
) -> Result<()> {
    write_frame(writer, request).await
}

pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<WorkerRequest> {
    read_frame(reader).await
}

pub async fn write_notification<W: AsyncWrite + Unpin>(
    writer: &mut W,
    notification: &WorkerNotification,
) -> Result<()> {
    write_frame(writer, notification).await
}

pub async fn read_notification<R: AsyncRead + Unpin>(reader: &mut R) -> Result<WorkerNotification> {
    read_frame(reader).await
}
