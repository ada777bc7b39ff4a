//! Request Handler
//!
//! Dispatches both RPC planes: peer RPCs go straight to the consensus
//! receivers; client commands are executed through the log on the
//! leader, or forwarded to it from anywhere else. Reads never touch
//! the log and may be stale.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::consensus::{CommitHandle, ProposeError, Replica};
use crate::store::{Command, CommandError, CommandReply, EntityStore};

use super::protocol::{ErrorCode, Request, Response};

/// Per-replica request processor shared by every connection.
pub struct RequestHandler {
    replica: Arc<Replica>,
    store: Arc<EntityStore>,
}

impl RequestHandler {
    /// Create a handler over this replica's consensus core and store
    pub fn new(replica: Arc<Replica>, store: Arc<EntityStore>) -> Self {
        Self { replica, store }
    }

    /// Handle a request
    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::RequestVote(args) => Response::Vote(self.replica.handle_request_vote(&args)),

            Request::AppendEntries(args) => {
                Response::Appended(self.replica.handle_append_entries(args))
            }

            Request::Create { name } => {
                let proposed = self.replica.propose_create(name.clone());
                self.run_command(proposed, Request::Create { name }).await
            }

            Request::Update { id, name, measure } => {
                let command = Command::Edit {
                    id,
                    name: name.clone(),
                    measure,
                };
                let proposed = self.replica.propose(command);
                self.run_command(proposed, Request::Update { id, name, measure })
                    .await
            }

            Request::Delete { id } => {
                let proposed = self.replica.propose(Command::Delete { id });
                self.run_command(proposed, Request::Delete { id }).await
            }

            Request::Read { id } => match self.store.get(id) {
                Some(record) => Response::Record(record),
                None => Response::command_error(&CommandError::NotFound(id)),
            },

            Request::List => Response::Records(self.store.list()),

            Request::Healthcheck => Response::Health(self.replica.ready()),
        }
    }

    /// Wait out a local proposal, or forward the original request to
    /// the leader when this replica is not it.
    async fn run_command(
        &self,
        proposed: Result<CommitHandle, ProposeError>,
        request: Request,
    ) -> Response {
        match proposed {
            Ok(handle) => self.await_commit(handle).await,
            Err(ProposeError::NotLeader { leader: Some(_) }) => self.forward(request).await,
            Err(ProposeError::NotLeader { leader: None }) => {
                Response::command_error(&CommandError::NoLeader)
            }
        }
    }

    /// Block on the entry's done-signal until the applier fires it.
    async fn await_commit(&self, handle: CommitHandle) -> Response {
        let deadline = self.replica.timing().command_timeout;
        match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(Ok(CommandReply::Record(record)))) => Response::Record(record),
            Ok(Ok(Ok(CommandReply::Deleted(deleted)))) => Response::Deleted(deleted),
            Ok(Ok(Err(err))) => Response::command_error(&err),
            // The entry was truncated away by a new leader.
            Ok(Err(_)) => {
                debug!("proposal lost to a leader change");
                Response::command_error(&CommandError::NoLeader)
            }
            Err(_) => {
                warn!("command timed out waiting for commit");
                Response::command_error(&CommandError::NoLeader)
            }
        }
    }

    /// Relay a command to the current leader over its cached client.
    async fn forward(&self, request: Request) -> Response {
        let Some(leader) = self.replica.leader_peer() else {
            return Response::command_error(&CommandError::NoLeader);
        };

        debug!(leader = %leader.addr(), "forwarding command to leader");
        let deadline = self.replica.timing().command_timeout;
        match leader.forward(request, deadline).await {
            Ok(response) => response,
            Err(err) => {
                warn!(leader = %leader.addr(), error = %err, "leader unreachable");
                Response::error(ErrorCode::NoLeader, format!("leader unreachable: {}", err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::TimingConfig;
    use crate::store::StateMachine;
    use std::net::SocketAddr;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn follower_handler() -> RequestHandler {
        let store = Arc::new(EntityStore::new());
        let state_machine: Arc<dyn crate::store::StateMachine> =
            Arc::clone(&store) as Arc<dyn crate::store::StateMachine>;
        let replica = Replica::new(
            addr(7101),
            &[addr(7102), addr(7103)],
            state_machine,
            TimingConfig::default(),
        );
        RequestHandler::new(replica, store)
    }

    #[tokio::test]
    async fn test_command_without_leader_errors() {
        let handler = follower_handler();

        let response = handler
            .handle(Request::Create {
                name: "g1".to_string(),
            })
            .await;

        match response {
            Response::Error { code, .. } => assert_eq!(code, ErrorCode::NoLeader),
            other => panic!("expected NoLeader, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_miss_is_not_found() {
        let handler = follower_handler();

        let response = handler.handle(Request::Read { id: 9999 }).await;

        match response {
            Response::Error { code, .. } => assert_eq!(code, ErrorCode::NotFound),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reads_and_lists_are_local() {
        let store = Arc::new(EntityStore::new());
        let state_machine: Arc<dyn crate::store::StateMachine> =
            Arc::clone(&store) as Arc<dyn crate::store::StateMachine>;
        let replica = Replica::new(
            addr(7101),
            &[addr(7102)],
            state_machine,
            TimingConfig::default(),
        );
        let handler = RequestHandler::new(replica, Arc::clone(&store));

        // A record applied behind the handler's back (stale-read path).
        store
            .apply(&Command::Create {
                id: 3,
                name: "g3".to_string(),
            })
            .unwrap();

        match handler.handle(Request::Read { id: 3 }).await {
            Response::Record(record) => assert_eq!(record.name, "g3"),
            other => panic!("expected record, got {:?}", other),
        }

        match handler.handle(Request::List).await {
            Response::Records(records) => assert_eq!(records.len(), 1),
            other => panic!("expected records, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_healthcheck_tracks_ready() {
        let handler = follower_handler();

        match handler.handle(Request::Healthcheck).await {
            Response::Health(ready) => assert!(!ready),
            other => panic!("expected health, got {:?}", other),
        }

        // First heartbeat makes the replica ready.
        use crate::consensus::AppendEntriesArgs;
        handler.replica.handle_append_entries(AppendEntriesArgs {
            term: 1,
            leader: addr(7102),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: Vec::new(),
            leader_commit: 0,
        });

        match handler.handle(Request::Healthcheck).await {
            Response::Health(ready) => assert!(ready),
            other => panic!("expected health, got {:?}", other),
        }
    }
}
