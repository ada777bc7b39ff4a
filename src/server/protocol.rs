//! Wire Protocol
//!
//! Binary protocol using bincode inside u32-little-endian length-prefixed
//! frames. Peer RPCs and client RPCs share the single endpoint every
//! replica exposes.

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::consensus::{
    AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply,
};
use crate::store::{CommandError, Record};

/// Upper bound on a single frame body
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Request types accepted by every replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Peer plane: a candidate soliciting a vote
    RequestVote(RequestVoteArgs),

    /// Peer plane: heartbeat and log replication
    AppendEntries(AppendEntriesArgs),

    /// Create a record; executed on the leader
    Create {
        /// Name for the new record
        name: String,
    },

    /// Fetch a record by id; answered locally, possibly stale
    Read {
        /// Target record id
        id: u64,
    },

    /// Overwrite a record; executed on the leader
    Update {
        /// Target record id
        id: u64,
        /// Replacement name
        name: String,
        /// Replacement measure
        measure: u64,
    },

    /// Remove a record; executed on the leader
    Delete {
        /// Target record id
        id: u64,
    },

    /// Snapshot every record; answered locally, possibly stale
    List,

    /// Whether this replica has seen a leader (or is one)
    Healthcheck,
}

/// Response types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Answer to a vote solicitation
    Vote(RequestVoteReply),

    /// Answer to a replication attempt
    Appended(AppendEntriesReply),

    /// A single record
    Record(Record),

    /// Every record in the store
    Records(Vec<Record>),

    /// Whether a delete removed anything
    Deleted(bool),

    /// Readiness flag
    Health(bool),

    /// Error response
    Error {
        /// Machine-readable error kind
        code: ErrorCode,
        /// Human-readable detail
        message: String,
    },
}

/// Error codes surfaced to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// No leader is known; the caller should retry elsewhere
    NoLeader,
    /// The target record does not exist
    NotFound,
    /// The request could not be decoded
    InvalidRequest,
    /// Anything else
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::NoLeader => write!(f, "no leader"),
            ErrorCode::NotFound => write!(f, "not found"),
            ErrorCode::InvalidRequest => write!(f, "invalid request"),
            ErrorCode::Internal => write!(f, "internal error"),
        }
    }
}

impl Response {
    /// Create an error response
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }

    /// Map a command error onto the wire
    pub fn command_error(err: &CommandError) -> Self {
        let code = match err {
            CommandError::NotFound(_) => ErrorCode::NotFound,
            CommandError::NoLeader => ErrorCode::NoLeader,
        };
        Response::error(code, err.to_string())
    }

    /// Check if this is an error response
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

/// Write one length-prefixed bincode frame
pub async fn write_frame<W, T>(stream: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(message)?;
    let len = body.len() as u32;
    stream.write_all(&len.to_le_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed bincode frame
pub async fn read_frame<R, T>(stream: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    anyhow::ensure!(len <= MAX_FRAME_LEN, "frame of {} bytes over limit", len);

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(bincode::deserialize(&body)?)
}
