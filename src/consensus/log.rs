//! Replicated Log
//!
//! Append-mostly sequence of commands with dense indices. Index 0 is a
//! sentinel (term 0) so that previous-entry lookups always succeed; real
//! entries start at index 1. Truncation only ever happens at the first
//! index that conflicts with an incoming batch.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::store::{Command, CommandError, CommandReply};

/// One-shot rendezvous between the applier and the client handler that
/// proposed the entry. Fired exactly once, on the proposing leader only.
pub type Completion = oneshot::Sender<Result<CommandReply, CommandError>>;

/// A single log entry.
///
/// The `completion` side-channel is populated only on the proposing
/// leader and never travels over the wire.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogEntry {
    /// Dense position in the log, starting at 1
    pub index: u64,
    /// Term of the leader that created the entry
    pub term: u64,
    /// The state machine command to apply
    pub command: Command,
    /// Local done-signal for the proposing client handler
    #[serde(skip)]
    pub completion: Option<Completion>,
}

impl LogEntry {
    /// A wire entry with no local completion attached
    pub fn new(index: u64, term: u64, command: Command) -> Self {
        Self {
            index,
            term,
            command,
            completion: None,
        }
    }
}

// Completions stay with the owning log; copies that travel to peers or
// into tests carry none.
impl Clone for LogEntry {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            term: self.term,
            command: self.command.clone(),
            completion: None,
        }
    }
}

impl PartialEq for LogEntry {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.term == other.term && self.command == other.command
    }
}

impl Eq for LogEntry {}

/// The log itself. Entries are stored from index 1 upward; the sentinel
/// at index 0 is implicit and reported as term 0 by the accessors.
#[derive(Debug, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    /// A log holding only the sentinel
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries including the sentinel; equivalently the index
    /// the next appended entry will take.
    pub fn len(&self) -> u64 {
        self.entries.len() as u64 + 1
    }

    /// Index of the newest entry (0 when only the sentinel exists)
    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Term of the newest entry (0 when only the sentinel exists)
    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of the entry at `index`, or `None` past the end of the log.
    /// The sentinel makes this total for every index ≤ `last_index`.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.entries.get(index as usize - 1).map(|e| e.term)
    }

    /// The entry at `index`, if present (the sentinel is not an entry)
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Mutable access to the entry at `index`
    pub fn get_mut(&mut self, index: u64) -> Option<&mut LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get_mut(index as usize - 1)
    }

    /// Append one entry at the next dense index
    pub fn push(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.len(), "log indices must stay dense");
        self.entries.push(entry);
    }

    /// Drop every entry from `index` (inclusive) onward. Dropping an
    /// entry also drops its completion, which wakes any waiting client
    /// handler with a closed-channel error.
    pub fn truncate_from(&mut self, index: u64) {
        debug_assert!(index >= 1, "the sentinel is never truncated");
        self.entries.truncate(index.saturating_sub(1) as usize);
    }

    /// Clone the tail starting at `from` for shipment to a peer.
    /// Completions stay behind.
    pub fn tail_from(&self, from: u64) -> Vec<LogEntry> {
        let start = from.max(1) as usize - 1;
        if start >= self.entries.len() {
            return Vec::new();
        }
        self.entries[start..].to_vec()
    }

    /// Reconcile an incoming batch: entries already present with a
    /// matching term are skipped, the first term conflict truncates the
    /// tail, and everything past the end is appended.
    pub fn merge_tail(&mut self, entries: Vec<LogEntry>) {
        for entry in entries {
            debug_assert!(entry.index >= 1);
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_from(entry.index);
                    self.push(entry);
                }
                None => self.push(entry),
            }
        }
    }

    /// Highest record id any `Create` in the log has claimed. A freshly
    /// elected leader seeds its id counter from this, which keeps
    /// committed ids unique across leader changes (gaps are fine).
    pub fn highest_create_id(&self) -> Option<u64> {
        self.entries
            .iter()
            .filter_map(|e| match &e.command {
                Command::Create { id, .. } => Some(*id),
                _ => None,
            })
            .max()
    }
}
