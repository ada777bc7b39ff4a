//! Peer Handles
//!
//! One handle per cluster member, owning that member's cached RPC
//! connection and the leader-side replication pointers. The connection
//! is a single-writer resource: open, close, and replace all happen
//! under the handle's own lock, so reconnect races cannot double-dial.

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use crate::server::protocol::{read_frame, write_frame, Request, Response};

use super::message::{
    AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply,
};

/// A cluster member as seen from one replica.
pub struct Peer {
    addr: SocketAddr,
    /// Cached connection; `None` until dialed or after a failure
    client: Mutex<Option<TcpStream>>,
    /// Next log index to send this peer (leader state, floor 1)
    next_index: AtomicU64,
    /// Highest log index known replicated on this peer (leader state)
    match_index: AtomicU64,
}

impl Peer {
    /// Create a handle for `addr` with no connection yet
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            client: Mutex::new(None),
            next_index: AtomicU64::new(1),
            match_index: AtomicU64::new(0),
        }
    }

    /// The peer's transport address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Next entry index to ship to this peer
    pub fn next_index(&self) -> u64 {
        self.next_index.load(Ordering::SeqCst)
    }

    /// Reset the replication pointers, done on every election win
    pub fn reset_indices(&self, next_index: u64) {
        self.next_index.store(next_index, Ordering::SeqCst);
        self.match_index.store(0, Ordering::SeqCst);
    }

    /// Record a successful replication up to `match_index`
    pub fn advance_indices(&self, match_index: u64) {
        self.match_index.store(match_index, Ordering::SeqCst);
        self.next_index.store(match_index + 1, Ordering::SeqCst);
    }

    /// Back off after a log mismatch, never below 1
    pub fn regress_next_index(&self) {
        let current = self.next_index.load(Ordering::SeqCst);
        if current > 1 {
            self.next_index.store(current - 1, Ordering::SeqCst);
        }
    }

    /// Highest index known replicated on this peer
    pub fn match_index(&self) -> u64 {
        self.match_index.load(Ordering::SeqCst)
    }

    /// Solicit a vote. Waits for the connection if another call holds it.
    pub async fn request_vote(
        &self,
        args: RequestVoteArgs,
        deadline: Duration,
    ) -> Result<RequestVoteReply> {
        let mut client = self.client.lock().await;
        match self.call(&mut client, Request::RequestVote(args), deadline).await? {
            Response::Vote(reply) => Ok(reply),
            other => bail!("unexpected vote response: {:?}", other),
        }
    }

    /// Ship entries (or a bare heartbeat). Returns `None` when the
    /// previous call to this peer is still in flight, so a slow peer is
    /// skipped this tick instead of queueing work behind it.
    pub async fn append_entries(
        &self,
        args: AppendEntriesArgs,
        deadline: Duration,
    ) -> Result<Option<AppendEntriesReply>> {
        let Ok(mut client) = self.client.try_lock() else {
            return Ok(None);
        };
        match self.call(&mut client, Request::AppendEntries(args), deadline).await? {
            Response::Appended(reply) => Ok(Some(reply)),
            other => bail!("unexpected append response: {:?}", other),
        }
    }

    /// Forward an arbitrary client request to this peer. Used by
    /// non-leaders to relay commands to the leader.
    pub async fn forward(&self, request: Request, deadline: Duration) -> Result<Response> {
        let mut client = self.client.lock().await;
        self.call(&mut client, request, deadline).await
    }

    /// One request/response exchange over the cached connection. Any
    /// failure drops the connection so the next call redials.
    async fn call(
        &self,
        client: &mut Option<TcpStream>,
        request: Request,
        deadline: Duration,
    ) -> Result<Response> {
        let result = timeout(deadline, self.exchange(client, &request)).await;
        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                debug!(peer = %self.addr, error = %err, "peer call failed");
                *client = None;
                Err(err)
            }
            Err(_) => {
                debug!(peer = %self.addr, "peer call timed out");
                *client = None;
                bail!("call to {} timed out", self.addr)
            }
        }
    }

    async fn exchange(
        &self,
        client: &mut Option<TcpStream>,
        request: &Request,
    ) -> Result<Response> {
        if client.is_none() {
            let stream = TcpStream::connect(self.addr)
                .await
                .with_context(|| format!("failed to dial peer {}", self.addr))?;
            *client = Some(stream);
        }

        let stream = client.as_mut().unwrap();
        write_frame(stream, request).await?;
        read_frame(stream).await
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("addr", &self.addr)
            .field("next_index", &self.next_index())
            .field("match_index", &self.match_index())
            .finish()
    }
}
