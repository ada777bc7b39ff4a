//! # ReplidB - Replicated In-Memory Record Store
//!
//! ReplidB keeps a small keyed record store consistent across a fixed
//! set of replicas using leader-based consensus. Clients may talk to
//! any member: commands are forwarded to the current leader, run
//! through the replicated log, and applied on every replica in the
//! same order; reads are answered locally and may be slightly stale.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  Client SDK / Gateway                     │
//! │   ├── Client (one replica, typed RPCs)                   │
//! │   └── ClusterClient (health probing, cached primary)     │
//! ├──────────────────────────────────────────────────────────┤
//! │                     RPC Surface                           │
//! │   ├── Framed bincode protocol (peer + client planes)     │
//! │   └── Handler (dispatch, leader forwarding)              │
//! ├──────────────────────────────────────────────────────────┤
//! │                   Consensus Core                          │
//! │   ├── Elections (randomized timeouts, majority votes)    │
//! │   ├── Replication (heartbeats, log catch-up)             │
//! │   └── Commit advancement + in-order applier              │
//! ├──────────────────────────────────────────────────────────┤
//! │               Replicated State Machine                    │
//! │   └── EntityStore (id -> record, store lock)             │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use replidb::{EntityStore, Replica, Server, TimingConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let listen = "127.0.0.1:8080".parse()?;
//!     let backends = vec!["127.0.0.1:8081".parse()?, "127.0.0.1:8082".parse()?];
//!
//!     let store = Arc::new(EntityStore::new());
//!     let replica = Replica::new(listen, &backends, store.clone(), TimingConfig::default());
//!     replica.spawn();
//!
//!     Server::new(listen, replica, store).run().await
//! }
//! ```
//!
//! State is purely in memory; a restarted replica rejoins empty and is
//! caught up from the leader's log.

#![warn(missing_docs)]

pub mod client;
pub mod consensus;
pub mod server;
pub mod store;

pub use client::{Client, ClusterClient};
pub use consensus::{
    AppendEntriesArgs, AppendEntriesReply, LogEntry, RaftLog, Replica, RequestVoteArgs,
    RequestVoteReply, Role, TimingConfig,
};
pub use server::{ErrorCode, Request, RequestHandler, Response, Server};
pub use store::{Command, CommandError, CommandReply, EntityStore, Record, StateMachine};
