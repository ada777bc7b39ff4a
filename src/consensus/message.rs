//! Peer RPC Messages
//!
//! Argument and reply types for the two consensus RPCs.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use super::log::LogEntry;

/// Arguments a candidate sends when soliciting a vote
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    /// The candidate's own address
    pub candidate: SocketAddr,
    /// The candidate's term
    pub term: u64,
    /// Index of the candidate's newest log entry
    pub last_log_index: u64,
    /// Term of the candidate's newest log entry
    pub last_log_term: u64,
}

/// A voter's answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    /// The voter's term, for candidate step-down
    pub term: u64,
    /// Whether the vote was granted
    pub vote_granted: bool,
}

/// Heartbeat and log replication in a single RPC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    /// The leader's term
    pub term: u64,
    /// The leader's address, adopted by accepting receivers
    pub leader: SocketAddr,
    /// Index of the entry immediately before `entries`
    pub prev_log_index: u64,
    /// Term of the entry at `prev_log_index`
    pub prev_log_term: u64,
    /// Entries to replicate; empty for a pure heartbeat
    pub entries: Vec<LogEntry>,
    /// The leader's commit index
    pub leader_commit: u64,
}

/// A follower's answer to a replication attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    /// The receiver's term, for leader step-down
    pub term: u64,
    /// False on stale term or log mismatch; the leader backs off
    pub success: bool,
}
