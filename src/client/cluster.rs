//! Cluster Client
//!
//! Leader-agnostic entry point for gateways: holds every replica
//! address, probes health to pick a primary, and caches that choice.
//! Any command error invalidates the primary and triggers one
//! re-probe-and-retry. Leader identity is never interpreted here; the
//! replicas forward commands themselves.

use anyhow::{bail, Result};
use futures::future::join_all;
use std::net::SocketAddr;
use tracing::{debug, warn};

use crate::store::Record;

use super::Client;

/// A client over the whole cluster.
pub struct ClusterClient {
    members: Vec<SocketAddr>,
    /// Cached connection to the current primary choice
    primary: Option<Client>,
}

impl ClusterClient {
    /// Create a cluster client over `members`
    pub fn new(members: Vec<SocketAddr>) -> Self {
        Self {
            members,
            primary: None,
        }
    }

    /// The member addresses this client cycles through
    pub fn members(&self) -> &[SocketAddr] {
        &self.members
    }

    /// Create a record through the cluster
    pub async fn create(&mut self, name: &str) -> Result<Record> {
        match self.primary_client().await?.create(name).await {
            Ok(record) => Ok(record),
            Err(err) => {
                self.invalidate_primary(&err);
                self.primary_client().await?.create(name).await
            }
        }
    }

    /// Fetch a record by id (possibly stale)
    pub async fn read(&mut self, id: u64) -> Result<Record> {
        match self.primary_client().await?.read(id).await {
            Ok(record) => Ok(record),
            Err(err) => {
                self.invalidate_primary(&err);
                self.primary_client().await?.read(id).await
            }
        }
    }

    /// Overwrite a record's name and measure
    pub async fn update(&mut self, id: u64, name: &str, measure: u64) -> Result<Record> {
        match self.primary_client().await?.update(id, name, measure).await {
            Ok(record) => Ok(record),
            Err(err) => {
                self.invalidate_primary(&err);
                self.primary_client().await?.update(id, name, measure).await
            }
        }
    }

    /// Delete a record
    pub async fn delete(&mut self, id: u64) -> Result<bool> {
        match self.primary_client().await?.delete(id).await {
            Ok(deleted) => Ok(deleted),
            Err(err) => {
                self.invalidate_primary(&err);
                self.primary_client().await?.delete(id).await
            }
        }
    }

    /// Snapshot every record (possibly stale)
    pub async fn list(&mut self) -> Result<Vec<Record>> {
        match self.primary_client().await?.list().await {
            Ok(records) => Ok(records),
            Err(err) => {
                self.invalidate_primary(&err);
                self.primary_client().await?.list().await
            }
        }
    }

    fn invalidate_primary(&mut self, err: &anyhow::Error) {
        warn!(error = %err, "command failed, invalidating primary");
        self.primary = None;
    }

    /// The cached primary, or a fresh healthy choice.
    async fn primary_client(&mut self) -> Result<&mut Client> {
        if self.primary.is_none() {
            self.primary = Some(self.select_primary().await?);
        }
        Ok(self.primary.as_mut().unwrap())
    }

    /// Probe every member in parallel; take the first that answers
    /// its healthcheck with `ready == true`.
    async fn select_primary(&self) -> Result<Client> {
        let probes = self.members.iter().map(|addr| async move {
            let mut client = Client::connect(*addr).await.ok()?;
            match client.healthcheck().await {
                Ok(true) => Some(client),
                Ok(false) => {
                    debug!(member = %addr, "member alive but not ready");
                    None
                }
                Err(_) => None,
            }
        });

        for client in join_all(probes).await.into_iter().flatten() {
            debug!(primary = %client.addr(), "selected primary");
            return Ok(client);
        }

        bail!("no healthy cluster member")
    }
}
