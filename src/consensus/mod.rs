//! Leader-Based Consensus
//!
//! Replicated-log consensus in the Raft style: a randomized election
//! timeout picks a leader per term, the leader assigns log indices to
//! client commands and replicates them on a fixed heartbeat, and an
//! entry is committed once a majority holds it. Every replica applies
//! committed entries to the state machine in the same order.

mod log;
mod message;
mod peer;
mod replica;

pub use log::{Completion, LogEntry, RaftLog};
pub use message::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
pub use peer::Peer;
pub use replica::{CommitHandle, ProposeError, Replica, Role, TimingConfig};
