//! RPC message types and length-prefixed framing.
//!
//! Every channel (controller to node, node to node, client to node) carries
//! the same [`Message`] enum, bincode-encoded behind a 4-byte big-endian
//! length prefix. The enum discriminant is the explicit type code.

use crate::error::{NetworkError, ProtocolError, Result};
use crate::partitioning::KeyRange;
use crate::rebalancing::{MigrationOutcome, TransferAck, TransferBatch};
use crate::types::{MigrationId, ServerIdentity};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted on any channel.
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024;

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Network message wrapper for all communication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Command from the cluster controller.
    Control(ControlRequest),

    /// Reply to a control command.
    ControlReply(ControlResponse),

    /// Data transfer between nodes.
    Peer(PeerRequest),

    /// Reply to a peer transfer.
    PeerReply(PeerResponse),

    /// Client GET/PUT.
    Client(ClientRequest),

    /// Reply to a client request.
    ClientReply(ClientResponse),

    /// The request could not be decoded or was too large.
    Failed(String),
}

/// Commands the controller sends to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlRequest {
    /// Install initial metadata.
    Init { metadata: String },
    /// Replace cached metadata.
    Update { metadata: String },
    /// Begin serving clients.
    Start,
    /// Reject all client requests.
    Stop,
    /// Terminate the node.
    Shutdown,
    /// Reject writes, keep serving reads.
    LockWrite,
    /// Resume writes.
    UnlockWrite,
    /// Push a key range to another node.
    MoveData(MoveDataRequest),
    /// Report how a migration ended, fencing it if it never started.
    ResolveMigration { migration_id: MigrationId },
}

impl ControlRequest {
    /// Command keyword, as used in the line protocol and in logs.
    pub fn name(&self) -> &'static str {
        match self {
            ControlRequest::Init { .. } => "INIT",
            ControlRequest::Update { .. } => "UPDATE",
            ControlRequest::Start => "START",
            ControlRequest::Stop => "STOP",
            ControlRequest::Shutdown => "SHUTDOWN",
            ControlRequest::LockWrite => "LOCK_WRITE",
            ControlRequest::UnlockWrite => "UNLOCK_WRITE",
            ControlRequest::MoveData(_) => "MOVE_DATA",
            ControlRequest::ResolveMigration { .. } => "RESOLVE_MIGRATION",
        }
    }
}

/// A single migration step: move `range` to `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveDataRequest {
    /// Identifier the destination echoes in every acknowledgement.
    pub migration_id: MigrationId,
    /// Ring interval to move.
    pub range: KeyRange,
    /// Node receiving the records.
    pub destination: ServerIdentity,
    /// Metadata the cluster publishes once the range has moved. Clients
    /// asking for a moved key are redirected with it until the donor sees
    /// the next UPDATE.
    pub metadata: String,
}

/// Replies to control commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlResponse {
    /// Command applied.
    Success,
    /// Migration acknowledged by the destination and removed locally.
    MoveDataComplete {
        migration_id: MigrationId,
        transferred: usize,
    },
    /// Recorded result of a migration.
    MigrationResolved {
        migration_id: MigrationId,
        outcome: MigrationOutcome,
    },
    /// Command rejected; node state unchanged.
    Failed { reason: String },
}

impl ControlResponse {
    /// Create a failure response.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// Node-to-node transfer messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRequest {
    /// Store a single record.
    Put { key: String, value: String },
    /// Delete a single record.
    Delete { key: String },
    /// Store a batch of a migrating range.
    PutAll(TransferBatch),
    /// Drop the keys of batches from a migration that did not complete.
    Revert {
        migration_id: MigrationId,
        keys: Vec<String>,
    },
}

/// Replies to peer transfers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerResponse {
    /// Single record stored.
    Stored,
    /// Single record deleted.
    Deleted { existed: bool },
    /// Batch applied.
    Ack(TransferAck),
    /// Keys of an aborted migration dropped.
    Reverted {
        migration_id: MigrationId,
        removed: usize,
    },
    /// Transfer rejected.
    Failed { reason: String },
}

/// Client data requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientRequest {
    /// Read a key.
    Get { key: String },
    /// Write a key; the value `"null"` deletes it.
    Put { key: String, value: String },
}

impl ClientRequest {
    /// The key the request addresses.
    pub fn key(&self) -> &str {
        match self {
            ClientRequest::Get { key } | ClientRequest::Put { key, .. } => key,
        }
    }
}

/// Replies to client requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientResponse {
    GetSuccess { key: String, value: String },
    GetError { key: String },
    PutSuccess { key: String },
    PutUpdate { key: String },
    PutError { key: String, reason: String },
    DeleteSuccess { key: String },
    DeleteError { key: String },
    /// Node is stopped.
    ServerStopped,
    /// Node rejects writes while a range is migrating.
    ServerWriteLock,
    /// Node does not own the key; carries its current metadata.
    ServerNotResponsible { metadata: String },
}

impl ClientResponse {
    /// Status code as seen by clients.
    pub fn status_code(&self) -> &'static str {
        match self {
            ClientResponse::GetSuccess { .. } => "GET_SUCCESS",
            ClientResponse::GetError { .. } => "GET_ERROR",
            ClientResponse::PutSuccess { .. } => "PUT_SUCCESS",
            ClientResponse::PutUpdate { .. } => "PUT_UPDATE",
            ClientResponse::PutError { .. } => "PUT_ERROR",
            ClientResponse::DeleteSuccess { .. } => "DELETE_SUCCESS",
            ClientResponse::DeleteError { .. } => "DELETE_ERROR",
            ClientResponse::ServerStopped => "SERVER_STOPPED",
            ClientResponse::ServerWriteLock => "SERVER_WRITE_LOCK",
            ClientResponse::ServerNotResponsible { .. } => "SERVER_NOT_RESPONSIBLE",
        }
    }
}

/// Encode a message to bytes.
pub fn encode_message(msg: &Message) -> std::result::Result<Vec<u8>, bincode::Error> {
    bincode::serialize(msg)
}

/// Decode a message from bytes.
pub fn decode_message(data: &[u8]) -> std::result::Result<Message, bincode::Error> {
    bincode::deserialize(data)
}

/// Size of a message once framed.
pub fn framed_len(msg: &Message) -> Result<usize> {
    Ok(bincode::serialized_size(msg)? as usize + FRAME_HEADER_LEN)
}

/// Frame a message with length prefix for TCP transmission.
///
/// Refuses to produce a frame whose payload exceeds `max_size`.
pub fn frame_message(msg: &Message, max_size: usize) -> Result<Vec<u8>> {
    let data = encode_message(msg)?;
    if data.len() > max_size {
        return Err(ProtocolError::MessageTooLarge {
            size: data.len(),
            max: max_size,
        }
        .into());
    }

    let len = data.len() as u32;
    let mut framed = Vec::with_capacity(FRAME_HEADER_LEN + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&data);

    Ok(framed)
}

/// A frame read off the wire.
#[derive(Debug)]
pub enum Frame {
    /// A complete payload.
    Payload(Bytes),
    /// A payload above the size limit; its bytes were discarded.
    Oversized(usize),
}

/// Read one length-prefixed frame.
///
/// Returns `None` when the peer closed the connection between frames.
/// Oversized payloads are drained so the connection stays usable.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e).into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        let mut remainder = (&mut *reader).take(len as u64);
        let drained = tokio::io::copy(&mut remainder, &mut tokio::io::sink()).await?;
        if drained < len as u64 {
            return Err(NetworkError::ConnectionClosed.into());
        }
        return Ok(Some(Frame::Oversized(len)));
    }

    let mut data = BytesMut::zeroed(len);
    reader.read_exact(&mut data).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            NetworkError::ConnectionClosed
        } else {
            NetworkError::Io(e)
        }
    })?;

    Ok(Some(Frame::Payload(data.freeze())))
}

/// Frame and write a message, then flush.
pub async fn write_message<W>(writer: &mut W, msg: &Message, max_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = frame_message(msg, max_size)?;
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}
