//! # node
//!
//! why: define the raft state machine and every pure protocol step
//! relations: guarded by the peer mutex in peer.rs; uses message.rs and log.rs
//! what: NodeState enum, RaftNode struct, rpc handlers, reply folds, commit rule

use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::log::{Log, LogEntry};
use crate::message::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};

/// the three possible states a raft peer can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// passive state - listens for heartbeats, votes when asked
    Follower,
    /// transitional state - requesting votes to become leader
    Candidate,
    /// active state - manages log replication, sends heartbeats
    Leader,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

/// configuration for raft timing (in milliseconds)
///
/// the heartbeat interval must stay strictly below the minimum election
/// timeout so a live leader always refreshes followers in time.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// minimum election timeout in ms (default: 300)
    pub election_timeout_min: u64,
    /// maximum election timeout in ms, exclusive (default: 500)
    pub election_timeout_max: u64,
    /// heartbeat interval in ms (default: 200)
    pub heartbeat_interval: u64,
    /// background ticker period in ms (default: 10)
    pub tick_interval: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 300,
            election_timeout_max: 500,
            heartbeat_interval: 200,
            tick_interval: 10,
        }
    }
}

/// the durable slice of peer state, encoded as one blob for the storage layer
#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct PersistentState {
    current_term: u64,
    voted_for: Option<usize>,
    log: Log,
}

/// a single raft peer's state machine
///
/// implements the raft consensus algorithm including:
/// - leader election with randomized timeouts
/// - log replication with consistency checks and per-term conflict back-off
/// - commit index management restricted to current-term entries
///
/// every method assumes the caller holds the peer mutex; nothing in here
/// blocks or touches the network. mutations of the durable fields (term,
/// vote, log) raise an internal dirty flag that the runtime drains with
/// [`needs_persist`](RaftNode::needs_persist) before anything observable
/// leaves the peer.
#[derive(Debug)]
pub struct RaftNode {
    // -- identity --
    /// this peer's index into the cluster's peer list
    pub me: usize,
    /// number of peers in the cluster (including self)
    pub peer_count: usize,

    // -- persistent state (must survive restarts) --
    /// current term number (monotonically increasing)
    pub current_term: u64,
    /// peer index that received our vote in current term (if any)
    pub voted_for: Option<usize>,
    /// the replicated log, sentinel at index 0
    pub log: Log,

    // -- volatile state (all peers) --
    /// current state (follower, candidate, or leader)
    pub state: NodeState,
    /// index of highest log entry known to be committed
    pub commit_index: u64,
    /// index of highest log entry handed to the apply channel
    pub last_applied: u64,
    /// votes received in the current candidacy
    pub vote_count: usize,

    // -- volatile state (leaders only, reinitialized after election) --
    /// for each peer, index of next log entry to send
    pub next_index: Vec<u64>,
    /// for each peer, highest log index known to be replicated there
    pub match_index: Vec<u64>,

    // -- timing --
    /// timing configuration
    pub config: RaftConfig,
    election_timeout: Duration,
    last_heard: Instant,

    // set when term, vote, or log changed and the blob must be saved
    dirty: bool,
}

impl RaftNode {
    /// create a new raft peer in follower state
    pub fn new(me: usize, peer_count: usize) -> Self {
        Self::with_config(me, peer_count, RaftConfig::default())
    }

    /// create a peer with custom timing configuration
    pub fn with_config(me: usize, peer_count: usize, config: RaftConfig) -> Self {
        let mut node = Self {
            me,
            peer_count,
            current_term: 0,
            voted_for: None,
            log: Log::new(),
            state: NodeState::Follower,
            commit_index: 0,
            last_applied: 0,
            vote_count: 0,
            next_index: vec![1; peer_count],
            match_index: vec![0; peer_count],
            config,
            election_timeout: Duration::ZERO,
            last_heard: Instant::now(),
            dirty: false,
        };
        node.reset_election_timer();
        node
    }

    // -- quorum arithmetic --

    /// number of peers needed for a majority
    pub fn majority(&self) -> usize {
        self.peer_count / 2 + 1
    }

    // -- election timer --

    /// re-draw the randomized timeout and restart the clock
    ///
    /// per-thread rng keeps peers from drawing timeouts in lockstep.
    pub fn reset_election_timer(&mut self) {
        let span = self.config.election_timeout_min..self.config.election_timeout_max;
        self.election_timeout = Duration::from_millis(rand::thread_rng().gen_range(span));
        self.last_heard = Instant::now();
    }

    /// true when a non-leader has gone a full timeout without leader contact
    pub fn election_elapsed(&self) -> bool {
        self.state != NodeState::Leader && self.last_heard.elapsed() >= self.election_timeout
    }

    // -- persistence bookkeeping --

    /// returns and clears the dirty flag; the runtime saves the blob when true
    pub fn needs_persist(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// encode (term, vote, log) as the storage blob
    pub fn encoded_state(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.clone(),
        })
    }

    /// rehydrate (term, vote, log) from a storage blob
    pub fn restore(&mut self, data: &[u8]) -> serde_json::Result<()> {
        let state: PersistentState = serde_json::from_slice(data)?;
        self.current_term = state.current_term;
        self.voted_for = state.voted_for;
        self.log = state.log;
        Ok(())
    }

    // -- state transitions --

    /// start an election: become candidate, bump the term, vote for self
    ///
    /// returns the vote request to broadcast; the caller persists first.
    pub fn start_election(&mut self) -> RequestVoteArgs {
        self.current_term += 1;
        self.state = NodeState::Candidate;
        self.voted_for = Some(self.me);
        self.vote_count = 1; // our own vote
        self.dirty = true;
        self.reset_election_timer();

        debug!(me = self.me, term = self.current_term, "starting election");

        RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.me,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        }
    }

    /// take leadership of the current term
    pub fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        let next = self.log.last_index() + 1;
        for p in 0..self.peer_count {
            self.next_index[p] = next;
            self.match_index[p] = 0;
        }
        debug!(me = self.me, term = self.current_term, "became leader");
    }

    /// step down to follower
    ///
    /// the vote is cleared only when the term actually advances; demotion
    /// within the current term (a candidate observing the elected leader)
    /// must keep the self-vote so this peer cannot vote twice in the term.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            debug!(me = self.me, old_term = self.current_term, new_term = term, "stepping down");
            self.current_term = term;
            self.voted_for = None;
            self.dirty = true;
        }
        self.state = NodeState::Follower;
        self.vote_count = 0;
    }

    // -- client submission --

    /// append a command under the current term (leader only; caller checks)
    ///
    /// returns the index the entry will occupy if it commits.
    pub fn append_local(&mut self, command: Vec<u8>) -> u64 {
        self.log.push(LogEntry::new(self.current_term, command));
        self.dirty = true;
        self.log.last_index()
    }

    // -- outbound message construction --

    /// empty AppendEntries anchored at the tail (leader only)
    pub fn heartbeat_args(&self) -> Option<AppendEntriesArgs> {
        if self.state != NodeState::Leader {
            return None;
        }
        Some(AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.me,
            prev_log_index: self.log.last_index(),
            prev_log_term: self.log.last_term(),
            entries: Vec::new(),
            leader_commit: self.commit_index,
        })
    }

    /// AppendEntries carrying everything the follower is missing, if anything
    pub fn entries_for(&self, follower: usize) -> Option<AppendEntriesArgs> {
        if self.state != NodeState::Leader {
            return None;
        }
        let next = self.next_index[follower];
        if self.log.last_index() < next {
            return None;
        }
        let prev = next - 1;
        Some(AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.me,
            prev_log_index: prev,
            prev_log_term: self.log.term(prev),
            entries: self.log.tail_from(next),
            leader_commit: self.commit_index,
        })
    }

    // -- rpc handlers --

    /// handle a vote request from a candidate
    pub fn handle_request_vote(&mut self, args: &RequestVoteArgs) -> RequestVoteReply {
        if args.term < self.current_term {
            return RequestVoteReply {
                term: self.current_term,
                vote_granted: false,
            };
        }
        if args.term > self.current_term {
            self.become_follower(args.term);
        }

        let can_vote = self.voted_for.is_none() || self.voted_for == Some(args.candidate_id);
        let vote_granted = can_vote && self.log_up_to_date(args.last_log_index, args.last_log_term);

        if vote_granted {
            self.voted_for = Some(args.candidate_id);
            self.dirty = true;
            // only a grant refreshes the timer; a denied candidate must not
            // be able to suppress our own candidacy
            self.reset_election_timer();
            trace!(me = self.me, term = self.current_term, candidate = args.candidate_id, "vote granted");
        }

        RequestVoteReply {
            term: self.current_term,
            vote_granted,
        }
    }

    /// fold a vote reply into the candidacy; true if we just became leader
    pub fn handle_vote_reply(&mut self, args: &RequestVoteArgs, reply: &RequestVoteReply) -> bool {
        if reply.term > self.current_term {
            self.become_follower(reply.term);
            return false;
        }
        // count only live replies for the election we are still running
        if self.state != NodeState::Candidate
            || self.current_term != args.term
            || reply.term != args.term
            || !reply.vote_granted
        {
            return false;
        }

        self.vote_count += 1;
        if self.vote_count >= self.majority() {
            self.become_leader();
            return true;
        }
        false
    }

    /// handle a replication request from a leader
    pub fn handle_append_entries(&mut self, args: &AppendEntriesArgs) -> AppendEntriesReply {
        if args.term < self.current_term {
            return AppendEntriesReply {
                term: self.current_term,
                success: false,
                conflict_term: 0,
                conflict_index: 0,
                log_len: 0,
            };
        }
        // a valid request means the current term has a leader; a candidate
        // in the same term yields to it
        self.become_follower(args.term);
        self.reset_election_timer();

        // consistency check
        if self.log.last_index() < args.prev_log_index {
            // follower's log is too short
            return AppendEntriesReply {
                term: self.current_term,
                success: false,
                conflict_term: 0,
                conflict_index: 0,
                log_len: self.log.last_index(),
            };
        }
        if self.log.term(args.prev_log_index) != args.prev_log_term {
            // conflicting entry at prev_log_index: report the whole term
            let conflict_term = self.log.term(args.prev_log_index);
            return AppendEntriesReply {
                term: self.current_term,
                success: false,
                conflict_term,
                conflict_index: self.log.first_index_of_term(args.prev_log_index),
                log_len: self.log.last_index(),
            };
        }

        // truncate at the first divergence, then append what remains
        for (i, entry) in args.entries.iter().enumerate() {
            let index = args.prev_log_index + 1 + i as u64;
            if index > self.log.last_index() || self.log.term(index) != entry.term {
                if index <= self.log.last_index() {
                    trace!(me = self.me, from = index, "truncating conflicting tail");
                }
                self.log.truncate(index);
                self.log.append(args.entries[i..].iter().cloned());
                self.dirty = true;
                break;
            }
        }

        // follow the leader's commit point, bounded by what this request
        // verified to match
        let bound = args.prev_log_index + args.entries.len() as u64;
        let new_commit = args.leader_commit.min(bound);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            trace!(me = self.me, commit = new_commit, "commit index advanced by leader");
        }

        AppendEntriesReply {
            term: self.current_term,
            success: true,
            conflict_term: 0,
            conflict_index: 0,
            log_len: self.log.last_index(),
        }
    }

    /// fold an AppendEntries reply into leader bookkeeping
    pub fn handle_append_reply(
        &mut self,
        from: usize,
        args: &AppendEntriesArgs,
        reply: &AppendEntriesReply,
    ) {
        if reply.term > self.current_term {
            self.become_follower(reply.term);
            return;
        }
        // drop replies for elections past, or that arrive after we lost power
        if self.state != NodeState::Leader
            || self.current_term != args.term
            || reply.term != args.term
        {
            return;
        }

        if reply.success {
            self.match_index[from] = args.prev_log_index + args.entries.len() as u64;
            self.next_index[from] = self.match_index[from] + 1;
            return;
        }

        // conflict back-off: jump a full term per round trip
        if reply.conflict_index == 0 {
            // follower's log was too short; resume from its tail
            self.next_index[from] = reply.log_len.max(1);
        } else if let Some(last) = self.log.last_index_of_term(reply.conflict_term) {
            // we hold the conflicting term too: send from just past our
            // last entry of it
            self.next_index[from] = last + 1;
        } else {
            // term unknown to us: skip the follower's whole run of it
            self.next_index[from] = reply.conflict_index;
        }
    }

    // -- commit advancement --

    /// advance `commit_index` to the highest current-term entry replicated on
    /// a majority; true if it moved
    ///
    /// entries from earlier terms are never counted directly - they commit
    /// implicitly once a current-term entry at or after them does.
    pub fn advance_commit(&mut self) -> bool {
        if self.state != NodeState::Leader {
            return false;
        }
        let mut n = self.log.last_index();
        while n > self.commit_index {
            if self.log.term(n) == self.current_term {
                // self holds every entry through last_index
                let mut count = 1;
                for p in 0..self.peer_count {
                    if p != self.me && self.match_index[p] >= n {
                        count += 1;
                    }
                }
                if count >= self.majority() {
                    self.commit_index = n;
                    debug!(me = self.me, term = self.current_term, commit = n, "commit index advanced");
                    return true;
                }
            }
            n -= 1;
        }
        false
    }

    /// check if a candidate's log is at least as up-to-date as ours
    fn log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.log.last_term();
        if last_log_term != our_last_term {
            last_log_term > our_last_term
        } else {
            last_log_index >= self.log.last_index()
        }
    }
}
