//! Entity Store
//!
//! The replicated state machine: a mapping from record id to record,
//! mutated exclusively by the consensus applier in log order. Reads
//! bypass the log and may observe stale state.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// A single stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Cluster-unique id, assigned by the leader
    pub id: u64,
    /// Display name
    pub name: String,
    /// Free-form numeric measure
    pub measure: u64,
}

impl Record {
    /// Create a fresh record with a zeroed measure
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            measure: 0,
        }
    }
}

/// A state machine command carried inside a log entry.
///
/// The set is closed: the applier dispatch is total and an unknown
/// command cannot exist once a log entry deserializes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Insert a new record. The id was chosen by the proposing leader.
    Create { id: u64, name: String },
    /// Overwrite the name and measure of an existing record
    Edit { id: u64, name: String, measure: u64 },
    /// Remove a record
    Delete { id: u64 },
}

impl Command {
    /// The id this command targets
    pub fn id(&self) -> u64 {
        match self {
            Command::Create { id, .. } => *id,
            Command::Edit { id, .. } => *id,
            Command::Delete { id } => *id,
        }
    }
}

/// Successful result of applying a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    /// The record created or updated
    Record(Record),
    /// Whether a delete removed anything
    Deleted(bool),
}

/// Errors a command can surface to the proposing client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The target record does not exist
    #[error("record {0} not found")]
    NotFound(u64),
    /// No leader is known to execute the command
    #[error("no leader available")]
    NoLeader,
}

/// The seam between consensus and the state it drives. Invoked only by
/// the applier, strictly in log-index order.
pub trait StateMachine: Send + Sync + 'static {
    /// Apply one committed command and produce the client-visible reply.
    fn apply(&self, command: &Command) -> Result<CommandReply, CommandError>;
}

/// In-memory id -> record map guarded by a single store lock.
///
/// Writers (the applier) take the lock exclusively; readers share it and
/// accept staleness relative to the commit frontier.
#[derive(Debug, Default)]
pub struct EntityStore {
    records: RwLock<HashMap<u64, Record>>,
}

impl EntityStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a record by id. Log-free, possibly stale.
    pub fn get(&self, id: u64) -> Option<Record> {
        self.records.read().get(&id).cloned()
    }

    /// Snapshot every record. Log-free, possibly stale.
    pub fn list(&self) -> Vec<Record> {
        self.records.read().values().cloned().collect()
    }

    /// Number of records currently stored
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl StateMachine for EntityStore {
    fn apply(&self, command: &Command) -> Result<CommandReply, CommandError> {
        let mut records = self.records.write();

        match command {
            Command::Create { id, name } => {
                // An id collision would mean the leader proposed a reused
                // id, which the log-derived counter rules out.
                let record = Record::new(*id, name.clone());
                records.insert(*id, record.clone());
                Ok(CommandReply::Record(record))
            }
            Command::Edit { id, name, measure } => match records.get_mut(id) {
                Some(record) => {
                    record.name = name.clone();
                    record.measure = *measure;
                    Ok(CommandReply::Record(record.clone()))
                }
                None => Err(CommandError::NotFound(*id)),
            },
            Command::Delete { id } => {
                if records.remove(id).is_some() {
                    Ok(CommandReply::Deleted(true))
                } else {
                    Err(CommandError::NotFound(*id))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_inserts_with_zero_measure() {
        let store = EntityStore::new();

        let reply = store
            .apply(&Command::Create {
                id: 7,
                name: "leon".to_string(),
            })
            .unwrap();

        assert_eq!(
            reply,
            CommandReply::Record(Record {
                id: 7,
                name: "leon".to_string(),
                measure: 0,
            })
        );
        assert_eq!(store.get(7).unwrap().name, "leon");
    }

    #[test]
    fn test_edit_overwrites_name_and_measure() {
        let store = EntityStore::new();
        store
            .apply(&Command::Create {
                id: 1,
                name: "bob".to_string(),
            })
            .unwrap();

        let reply = store
            .apply(&Command::Edit {
                id: 1,
                name: "bobby".to_string(),
                measure: 257,
            })
            .unwrap();

        match reply {
            CommandReply::Record(record) => {
                assert_eq!(record.name, "bobby");
                assert_eq!(record.measure, 257);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_edit_missing_record_is_not_found() {
        let store = EntityStore::new();

        let err = store
            .apply(&Command::Edit {
                id: 42,
                name: "ghost".to_string(),
                measure: 1,
            })
            .unwrap_err();

        assert_eq!(err, CommandError::NotFound(42));
    }

    #[test]
    fn test_delete_removes_and_reports_missing() {
        let store = EntityStore::new();
        store
            .apply(&Command::Create {
                id: 3,
                name: "tmp".to_string(),
            })
            .unwrap();

        assert_eq!(
            store.apply(&Command::Delete { id: 3 }).unwrap(),
            CommandReply::Deleted(true)
        );
        assert!(store.get(3).is_none());

        let err = store.apply(&Command::Delete { id: 3 }).unwrap_err();
        assert_eq!(err, CommandError::NotFound(3));
    }

    #[test]
    fn test_list_returns_every_record() {
        let store = EntityStore::new();
        for id in 0..5 {
            store
                .apply(&Command::Create {
                    id,
                    name: format!("r{}", id),
                })
                .unwrap();
        }

        let mut listed = store.list();
        listed.sort_by_key(|r| r.id);
        assert_eq!(listed.len(), 5);
        assert_eq!(listed[4].name, "r4");
    }

    #[test]
    fn test_reads_do_not_block_each_other() {
        let store = EntityStore::new();
        store
            .apply(&Command::Create {
                id: 1,
                name: "a".to_string(),
            })
            .unwrap();

        // Two overlapping read guards are fine under the RwLock.
        let first = store.records.read();
        let second = store.records.read();
        assert_eq!(first.len(), second.len());
    }
}
