//! Common test utilities for cluster tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use replidb::{EntityStore, Record, Replica, Server, StateMachine, TimingConfig};

/// Shrunken protocol timing so tests converge fast. The ratios match
/// production: election_min > heartbeat by a healthy margin.
pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        heartbeat: Duration::from_millis(50),
        election_min: Duration::from_millis(75),
        election_max: Duration::from_millis(150),
        command_timeout: Duration::from_secs(2),
    }
}

/// One running cluster member.
pub struct TestReplica {
    pub addr: SocketAddr,
    pub replica: Arc<Replica>,
    pub store: Arc<EntityStore>,
    tasks: Vec<JoinHandle<()>>,
    crashed: bool,
}

impl TestReplica {
    /// Stop serving and participating, as if the process died.
    pub fn crash(&mut self) {
        self.replica.shutdown();
        for task in &self.tasks {
            task.abort();
        }
        self.crashed = true;
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed
    }
}

/// A fixed-membership cluster on loopback sockets.
pub struct TestCluster {
    pub members: Vec<TestReplica>,
}

impl TestCluster {
    /// Bind `size` listeners, then start a replica on each.
    pub async fn start(size: usize) -> Self {
        let mut listeners = Vec::new();
        for _ in 0..size {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listeners.push(listener);
        }
        let addrs: Vec<SocketAddr> =
            listeners.iter().map(|l| l.local_addr().unwrap()).collect();

        let mut members = Vec::new();
        for listener in listeners {
            let addr = listener.local_addr().unwrap();
            let store = Arc::new(EntityStore::new());
            let state_machine: Arc<dyn StateMachine> = Arc::clone(&store) as Arc<dyn StateMachine>;
            let replica = Replica::new(addr, &addrs, state_machine, fast_timing());

            let mut tasks = replica.spawn();
            let server = Server::new(addr, Arc::clone(&replica), Arc::clone(&store));
            tasks.push(tokio::spawn(async move {
                let _ = server.serve(listener).await;
            }));

            members.push(TestReplica {
                addr,
                replica,
                store,
                tasks,
                crashed: false,
            });
        }

        Self { members }
    }

    /// Wait until some live member leads; panics after 5 seconds.
    pub async fn wait_for_leader(&self) -> SocketAddr {
        for _ in 0..250 {
            for member in self.members.iter().filter(|m| !m.is_crashed()) {
                if member.replica.is_leader() {
                    return member.addr;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no leader emerged within 5s");
    }

    /// The member at `addr`
    pub fn member(&self, addr: SocketAddr) -> &TestReplica {
        self.members.iter().find(|m| m.addr == addr).unwrap()
    }

    /// Any live member that is not `addr`
    pub fn other_than(&self, addr: SocketAddr) -> &TestReplica {
        self.members
            .iter()
            .find(|m| m.addr != addr && !m.is_crashed())
            .unwrap()
    }

    /// Crash the member at `addr`
    pub fn crash(&mut self, addr: SocketAddr) {
        let member = self
            .members
            .iter_mut()
            .find(|m| m.addr == addr)
            .unwrap();
        member.crash();
    }

    /// Wait until every live member's store holds `expected` for `id`.
    pub async fn wait_for_record_everywhere(&self, id: u64, expected: &Record) {
        for _ in 0..250 {
            let all_match = self
                .members
                .iter()
                .filter(|m| !m.is_crashed())
                .all(|m| m.store.get(id).as_ref() == Some(expected));
            if all_match {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("record {} did not replicate everywhere within 5s", id);
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for member in &mut self.members {
            member.crash();
        }
    }
}
