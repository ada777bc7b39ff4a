//! Client SDK
//!
//! Typed access to the client RPC plane of a single replica. Commands
//! may be answered by any member; the replica forwards them to the
//! leader itself. For leader-agnostic access with failover, see
//! [`ClusterClient`].

mod cluster;

pub use cluster::ClusterClient;

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use tokio::net::TcpStream;

use crate::server::protocol::{read_frame, write_frame, Request, Response};
use crate::store::Record;

/// A connection to one replica.
pub struct Client {
    addr: SocketAddr,
    stream: TcpStream,
}

impl Client {
    /// Connect to a replica
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to replica {}", addr))?;
        Ok(Self { addr, stream })
    }

    /// The replica this client talks to
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Create a record and return it with its assigned id
    pub async fn create(&mut self, name: &str) -> Result<Record> {
        let response = self
            .send_request(Request::Create {
                name: name.to_string(),
            })
            .await?;

        match response {
            Response::Record(record) => Ok(record),
            Response::Error { code, message } => bail!("create failed ({}): {}", code, message),
            other => bail!("unexpected response: {:?}", other),
        }
    }

    /// Fetch a record by id. May be stale relative to the leader.
    pub async fn read(&mut self, id: u64) -> Result<Record> {
        let response = self.send_request(Request::Read { id }).await?;

        match response {
            Response::Record(record) => Ok(record),
            Response::Error { code, message } => bail!("read failed ({}): {}", code, message),
            other => bail!("unexpected response: {:?}", other),
        }
    }

    /// Overwrite a record's name and measure
    pub async fn update(&mut self, id: u64, name: &str, measure: u64) -> Result<Record> {
        let response = self
            .send_request(Request::Update {
                id,
                name: name.to_string(),
                measure,
            })
            .await?;

        match response {
            Response::Record(record) => Ok(record),
            Response::Error { code, message } => bail!("update failed ({}): {}", code, message),
            other => bail!("unexpected response: {:?}", other),
        }
    }

    /// Delete a record
    pub async fn delete(&mut self, id: u64) -> Result<bool> {
        let response = self.send_request(Request::Delete { id }).await?;

        match response {
            Response::Deleted(deleted) => Ok(deleted),
            Response::Error { code, message } => bail!("delete failed ({}): {}", code, message),
            other => bail!("unexpected response: {:?}", other),
        }
    }

    /// Snapshot every record. May be stale relative to the leader.
    pub async fn list(&mut self) -> Result<Vec<Record>> {
        let response = self.send_request(Request::List).await?;

        match response {
            Response::Records(records) => Ok(records),
            Response::Error { code, message } => bail!("list failed ({}): {}", code, message),
            other => bail!("unexpected response: {:?}", other),
        }
    }

    /// Whether the replica has seen a leader since boot
    pub async fn healthcheck(&mut self) -> Result<bool> {
        let response = self.send_request(Request::Healthcheck).await?;

        match response {
            Response::Health(ready) => Ok(ready),
            Response::Error { code, message } => {
                bail!("healthcheck failed ({}): {}", code, message)
            }
            other => bail!("unexpected response: {:?}", other),
        }
    }

    async fn send_request(&mut self, request: Request) -> Result<Response> {
        write_frame(&mut self.stream, &request).await?;
        read_frame(&mut self.stream).await
    }
}
