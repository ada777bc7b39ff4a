//! Consensus Core
//!
//! The role machine every replica runs: election timeouts, candidacy,
//! leader heartbeats, log replication, commit advancement, and the
//! applier that feeds committed entries to the state machine.
//!
//! All shared state lives behind one replica lock which is never held
//! across an await point; peer connections have their own locks.

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::{Command, CommandError, CommandReply, StateMachine};

use super::log::{LogEntry, RaftLog};
use super::message::{
    AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply,
};
use super::peer::Peer;

/// Protocol timing knobs. The defaults follow the usual rule that the
/// minimum election timeout must exceed the heartbeat period by a
/// comfortable margin, so healthy leaders are never deposed by jitter.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Fixed period between leader heartbeats
    pub heartbeat: Duration,
    /// Lower bound of the randomized election timeout
    pub election_min: Duration,
    /// Upper bound of the randomized election timeout
    pub election_max: Duration,
    /// How long a client command may wait for commit and apply
    pub command_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_millis(300),
            election_min: Duration::from_millis(350),
            election_max: Duration::from_millis(700),
            command_timeout: Duration::from_secs(3),
        }
    }
}

impl TimingConfig {
    /// Draw one election timeout uniformly from `[election_min, election_max]`
    fn random_election_timeout(&self) -> Duration {
        rand::thread_rng().gen_range(self.election_min..=self.election_max)
    }
}

/// The three consensus roles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Passive; accepts entries from the leader, votes in elections
    Follower,
    /// Soliciting votes after an election timeout
    Candidate,
    /// Sole writer for its term; heartbeats the cluster
    Leader,
}

/// Receiver half of a proposed entry's done-signal. Resolves once the
/// entry is applied, or errors if the entry was truncated away.
pub type CommitHandle = oneshot::Receiver<Result<CommandReply, CommandError>>;

/// Why a proposal was refused locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposeError {
    /// This replica is not the leader; forward to `leader` if known
    NotLeader {
        /// The leader this replica currently believes in
        leader: Option<SocketAddr>,
    },
}

/// Everything guarded by the replica lock
struct RaftState {
    role: Role,
    term: u64,
    voted_for: Option<SocketAddr>,
    leader: Option<SocketAddr>,
    /// True once a heartbeat was accepted or we led ourselves
    ready: bool,
    log: RaftLog,
    commit_index: u64,
    last_applied: u64,
    /// Next record id to hand out while leading
    next_id: u64,
}

/// One cluster member's consensus engine.
pub struct Replica {
    addr: SocketAddr,
    peers: Vec<Arc<Peer>>,
    timing: TimingConfig,
    state: Mutex<RaftState>,
    /// Pinged by valid leader contact, granted votes, and our own
    /// heartbeat loop; the election timer re-arms on every ping.
    timer_reset: Notify,
    /// Pinged whenever the commit index moves
    apply_wake: Notify,
    state_machine: Arc<dyn StateMachine>,
    /// Stops the timer and leader loops once set
    shutdown: AtomicBool,
}

impl Replica {
    /// Build a replica for `addr` clustered with `backends`. Our own
    /// address may appear in the list; it is filtered out, so behavior
    /// is identical either way.
    pub fn new(
        addr: SocketAddr,
        backends: &[SocketAddr],
        state_machine: Arc<dyn StateMachine>,
        timing: TimingConfig,
    ) -> Arc<Self> {
        let peers = backends
            .iter()
            .filter(|peer| **peer != addr)
            .map(|peer| Arc::new(Peer::new(*peer)))
            .collect();

        Arc::new(Self {
            addr,
            peers,
            timing,
            state: Mutex::new(RaftState {
                role: Role::Follower,
                term: 0,
                voted_for: None,
                leader: None,
                ready: false,
                log: RaftLog::new(),
                commit_index: 0,
                last_applied: 0,
                next_id: 0,
            }),
            timer_reset: Notify::new(),
            apply_wake: Notify::new(),
            state_machine,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Start the election timer loop and the applier. The handles let
    /// callers tear a replica down (tests abort them to fake a crash).
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(self).run_timers()),
            tokio::spawn(Arc::clone(self).run_applier()),
        ]
    }

    /// This replica's own address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The timing knobs this replica runs with
    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    /// Stop participating: the timer loop and any leader loop exit at
    /// their next check. Used for teardown.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Current role
    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    /// Current term
    pub fn term(&self) -> u64 {
        self.state.lock().term
    }

    /// Whether this replica currently leads
    pub fn is_leader(&self) -> bool {
        let state = self.state.lock();
        state.role == Role::Leader
    }

    /// The leader this replica believes in, if any
    pub fn leader(&self) -> Option<SocketAddr> {
        self.state.lock().leader
    }

    /// The peer handle for the current leader, used for forwarding
    pub fn leader_peer(&self) -> Option<Arc<Peer>> {
        let leader = self.state.lock().leader?;
        self.peers.iter().find(|p| p.addr() == leader).cloned()
    }

    /// True once this replica has seen any heartbeat or led itself
    pub fn ready(&self) -> bool {
        self.state.lock().ready
    }

    /// Highest committed index
    pub fn commit_index(&self) -> u64 {
        self.state.lock().commit_index
    }

    /// Highest applied index
    pub fn last_applied(&self) -> u64 {
        self.state.lock().last_applied
    }

    /// Index of the newest log entry
    pub fn last_log_index(&self) -> u64 {
        self.state.lock().log.last_index()
    }

    /// (index, term) pairs of the whole log, for inspection in tests
    pub fn log_shape(&self) -> Vec<(u64, u64)> {
        let state = self.state.lock();
        (1..=state.log.last_index())
            .map(|i| (i, state.log.term_at(i).unwrap_or(0)))
            .collect()
    }

    /// Votes needed to win: a strict majority of the full membership
    fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    // === Proposals ===

    /// Propose creating a record. The id is allocated here, under the
    /// replica lock, from the log-derived counter.
    pub fn propose_create(&self, name: String) -> Result<CommitHandle, ProposeError> {
        let handle = {
            let mut state = self.state.lock();
            if state.role != Role::Leader {
                return Err(ProposeError::NotLeader { leader: state.leader });
            }
            let id = state.next_id;
            state.next_id += 1;
            Self::append_local(&mut state, Command::Create { id, name })
        };
        self.advance_commit();
        Ok(handle)
    }

    /// Propose an edit or delete command
    pub fn propose(&self, command: Command) -> Result<CommitHandle, ProposeError> {
        let handle = {
            let mut state = self.state.lock();
            if state.role != Role::Leader {
                return Err(ProposeError::NotLeader { leader: state.leader });
            }
            Self::append_local(&mut state, command)
        };
        self.advance_commit();
        Ok(handle)
    }

    fn append_local(state: &mut RaftState, command: Command) -> CommitHandle {
        let (tx, rx) = oneshot::channel();
        let index = state.log.len();
        debug!(index, term = state.term, ?command, "appending proposal");
        state.log.push(LogEntry {
            index,
            term: state.term,
            command,
            completion: Some(tx),
        });
        rx
    }

    // === Timers & elections ===

    async fn run_timers(self: Arc<Self>) {
        loop {
            if self.is_shutdown() {
                return;
            }
            let timeout = self.timing.random_election_timeout();
            tokio::select! {
                _ = self.timer_reset.notified() => {}
                _ = tokio::time::sleep(timeout) => {
                    let is_leader = self.state.lock().role == Role::Leader;
                    if !is_leader && !self.is_shutdown() {
                        self.run_election().await;
                    }
                }
            }
        }
    }

    /// One full candidacy: bump the term, vote for ourselves, solicit
    /// the peers in parallel, and tally replies as they arrive.
    async fn run_election(self: &Arc<Self>) {
        let (term, last_log_index, last_log_term) = {
            let mut state = self.state.lock();
            state.role = Role::Candidate;
            state.term += 1;
            state.voted_for = Some(self.addr);
            state.leader = None;
            (state.term, state.log.last_index(), state.log.last_term())
        };
        info!(term, "election timeout, starting candidacy");

        let mut calls: FuturesUnordered<_> = self
            .peers
            .iter()
            .map(|peer| {
                let peer = Arc::clone(peer);
                let args = RequestVoteArgs {
                    candidate: self.addr,
                    term,
                    last_log_index,
                    last_log_term,
                };
                let deadline = self.timing.election_min;
                async move { peer.request_vote(args, deadline).await }
            })
            .collect();

        let mut votes = 1;
        while votes < self.majority() {
            let Some(result) = calls.next().await else {
                break;
            };

            // A competing leader may have demoted us mid-tally.
            {
                let state = self.state.lock();
                if state.term != term || state.role != Role::Candidate {
                    return;
                }
            }

            match result {
                Ok(reply) if reply.vote_granted => votes += 1,
                Ok(reply) if reply.term > term => {
                    self.step_down(reply.term);
                    return;
                }
                Ok(_) => {}
                Err(err) => debug!(error = %err, "vote solicitation failed"),
            }
        }

        if votes >= self.majority() {
            info!(term, votes, "won election");
            self.become_leader(term);
        } else {
            debug!(term, votes, "election lost");
            let mut state = self.state.lock();
            if state.term == term && state.role == Role::Candidate {
                state.role = Role::Follower;
            }
        }
    }

    fn become_leader(self: &Arc<Self>, term: u64) {
        {
            let mut state = self.state.lock();
            if state.term != term || state.role != Role::Candidate {
                return;
            }
            state.role = Role::Leader;
            state.leader = Some(self.addr);
            state.ready = true;
            state.next_id = state
                .log
                .highest_create_id()
                .map_or(state.next_id, |id| id + 1);

            let next_index = state.log.len();
            for peer in &self.peers {
                peer.reset_indices(next_index);
            }
        }
        tokio::spawn(Arc::clone(self).lead(term));
    }

    /// The leader loop: one heartbeat fan-out per tick until deposed.
    async fn lead(self: Arc<Self>, term: u64) {
        info!(term, "leading");
        let mut ticker = tokio::time::interval(self.timing.heartbeat);

        loop {
            ticker.tick().await;

            if self.is_shutdown() {
                return;
            }
            {
                let state = self.state.lock();
                if state.role != Role::Leader || state.term != term {
                    info!(term, "no longer leading");
                    return;
                }
            }

            for peer in &self.peers {
                tokio::spawn(Arc::clone(&self).replicate_to(Arc::clone(peer), term));
            }

            self.advance_commit();
            // A live leader never times itself out.
            self.timer_reset.notify_one();
        }
    }

    /// Ship whatever follows the peer's next_index (possibly nothing).
    async fn replicate_to(self: Arc<Self>, peer: Arc<Peer>, term: u64) {
        let args = {
            let state = self.state.lock();
            if state.role != Role::Leader || state.term != term {
                return;
            }
            let next_index = peer.next_index();
            let prev_log_index = next_index - 1;
            let Some(prev_log_term) = state.log.term_at(prev_log_index) else {
                return;
            };
            AppendEntriesArgs {
                term,
                leader: self.addr,
                prev_log_index,
                prev_log_term,
                entries: state.log.tail_from(next_index),
                leader_commit: state.commit_index,
            }
        };

        let prev_log_index = args.prev_log_index;
        let sent = args.entries.len() as u64;

        match peer.append_entries(args, self.timing.heartbeat).await {
            Ok(None) => {} // previous call still in flight; skip this tick
            Ok(Some(reply)) => self.handle_append_reply(&peer, term, prev_log_index, sent, reply),
            Err(_) => {} // logged in the peer; it redials next tick
        }
    }

    fn handle_append_reply(
        &self,
        peer: &Peer,
        term: u64,
        prev_log_index: u64,
        sent: u64,
        reply: AppendEntriesReply,
    ) {
        if reply.term > term {
            self.step_down(reply.term);
            return;
        }
        if reply.success {
            peer.advance_indices(prev_log_index + sent);
            self.advance_commit();
        } else {
            debug!(peer = %peer.addr(), "log mismatch, backing off");
            peer.regress_next_index();
        }
    }

    /// Adopt a higher term and drop to follower.
    fn step_down(&self, new_term: u64) {
        let mut state = self.state.lock();
        if new_term > state.term {
            if state.role != Role::Follower {
                warn!(term = new_term, "observed higher term, stepping down");
            }
            state.term = new_term;
            state.voted_for = None;
            state.role = Role::Follower;
            state.leader = None;
        }
    }

    /// Find the largest N > commitIndex replicated on a majority with
    /// log[N].term == currentTerm. Counting replicas alone must never
    /// commit an entry from a prior term.
    fn advance_commit(&self) {
        let mut advanced = false;
        {
            let mut state = self.state.lock();
            if state.role != Role::Leader {
                return;
            }
            let mut n = state.log.last_index();
            while n > state.commit_index {
                if state.log.term_at(n) == Some(state.term) {
                    let replicated =
                        1 + self.peers.iter().filter(|p| p.match_index() >= n).count();
                    if replicated >= self.majority() {
                        debug!(commit_index = n, "advancing commit");
                        state.commit_index = n;
                        advanced = true;
                        break;
                    }
                }
                n -= 1;
            }
        }
        if advanced {
            self.apply_wake.notify_one();
        }
    }

    // === RPC receivers ===

    /// Vote receiver. Grants iff the candidate's term is current, we
    /// have not voted for anyone else this term, and the candidate's
    /// log is at least as up-to-date as ours.
    pub fn handle_request_vote(&self, args: &RequestVoteArgs) -> RequestVoteReply {
        let (reply, granted) = {
            let mut state = self.state.lock();

            if args.term > state.term {
                state.term = args.term;
                state.voted_for = None;
                state.role = Role::Follower;
                state.leader = None;
            }

            let mut granted = false;
            if args.term == state.term {
                let free_to_vote = state
                    .voted_for
                    .map_or(true, |voted| voted == args.candidate);
                let up_to_date = args.last_log_term > state.log.last_term()
                    || (args.last_log_term == state.log.last_term()
                        && args.last_log_index >= state.log.last_index());

                if free_to_vote && up_to_date {
                    state.voted_for = Some(args.candidate);
                    granted = true;
                }
            }

            debug!(candidate = %args.candidate, term = args.term, granted, "vote requested");
            (
                RequestVoteReply {
                    term: state.term,
                    vote_granted: granted,
                },
                granted,
            )
        };

        if granted {
            self.timer_reset.notify_one();
        }
        reply
    }

    /// Append receiver: term checks, leadership adoption, consistency
    /// check, conflict-truncating merge, and commit update, all under
    /// the replica lock.
    pub fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let (reply, valid_leader_contact, commit_moved) = {
            let mut state = self.state.lock();

            if args.term < state.term {
                debug!(leader = %args.leader, term = args.term, "rejecting stale leader");
                return AppendEntriesReply {
                    term: state.term,
                    success: false,
                };
            }

            if args.term > state.term {
                state.term = args.term;
                state.voted_for = None;
            }

            // Accept the sender as leader for this term. A candidate or
            // competing leader steps down here.
            if state.role != Role::Follower {
                info!(leader = %args.leader, term = args.term, "yielding to leader");
                state.role = Role::Follower;
            }
            if state.leader != Some(args.leader) {
                info!(leader = %args.leader, "following new leader");
                state.leader = Some(args.leader);
            }

            // Consistency check: our entry at prev_log_index must carry
            // prev_log_term, else the leader backs off and retries.
            if state.log.term_at(args.prev_log_index) != Some(args.prev_log_term) {
                debug!(
                    prev_log_index = args.prev_log_index,
                    "log mismatch, need earlier entries"
                );
                (
                    AppendEntriesReply {
                        term: state.term,
                        success: false,
                    },
                    true,
                    false,
                )
            } else {
                let last_new = args.prev_log_index + args.entries.len() as u64;
                state.log.merge_tail(args.entries);

                let mut commit_moved = false;
                if args.leader_commit > state.commit_index {
                    state.commit_index = args.leader_commit.min(last_new);
                    commit_moved = true;
                }

                state.ready = true;
                (
                    AppendEntriesReply {
                        term: state.term,
                        success: true,
                    },
                    true,
                    commit_moved,
                )
            }
        };

        if valid_leader_contact {
            self.timer_reset.notify_one();
        }
        if commit_moved {
            self.apply_wake.notify_one();
        }
        reply
    }

    // === Applier ===

    /// Drain committed-but-unapplied entries in index order, invoking
    /// the state machine once per entry and firing the done-signal on
    /// entries we proposed ourselves.
    async fn run_applier(self: Arc<Self>) {
        loop {
            loop {
                let next = {
                    let mut state = self.state.lock();
                    if state.last_applied < state.commit_index {
                        let index = state.last_applied + 1;
                        state.log.get_mut(index).map(|entry| {
                            (index, entry.command.clone(), entry.completion.take())
                        })
                    } else {
                        None
                    }
                };

                let Some((index, command, completion)) = next else {
                    break;
                };

                let outcome = self.state_machine.apply(&command);
                if let Err(err) = &outcome {
                    debug!(index, error = %err, "command failed at apply");
                }
                self.state.lock().last_applied = index;
                debug!(index, "applied entry");

                if let Some(done) = completion {
                    let _ = done.send(outcome);
                }
            }

            self.apply_wake.notified().await;
        }
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Replica")
            .field("addr", &self.addr)
            .field("role", &state.role)
            .field("term", &state.term)
            .field("leader", &state.leader)
            .field("commit_index", &state.commit_index)
            .field("last_applied", &state.last_applied)
            .finish()
    }
}
