//! # peer
//!
//! why: drive the state machine with real time, threads, and a network
//! relations: wraps node.rs under one mutex, talks through transport.rs,
//! persists through quorum-storage, streams commits to the host
//! what: RaftPeer handle, background tickers, apply loop, host-facing api

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use quorum_storage::Storage;
use tracing::{debug, warn};

use crate::message::{ApplyMsg, AppendEntriesArgs, RaftMessage, RequestVoteArgs};
use crate::node::{NodeState, RaftConfig, RaftNode};
use crate::transport::Transport;

/// attempts to read and decode the persisted blob before giving up
const RESTORE_ATTEMPTS: usize = 5;

/// how long the apply loop sleeps between kill-flag checks while idle
const APPLY_WAIT: Duration = Duration::from_millis(100);

/// a running consensus peer
///
/// one mutex serialises every read and write of the state machine; the apply
/// loop sleeps on a condvar bound to that mutex. background threads exit on
/// their next wake after [`kill`](RaftPeer::kill). outbound rpcs run on
/// short-lived threads that never hold the mutex across the network call.
pub struct RaftPeer {
    me: usize,
    peer_count: usize,
    node: Mutex<RaftNode>,
    apply_cond: Condvar,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn Storage>,
    apply_tx: Sender<ApplyMsg>,
    dead: AtomicBool,
}

impl RaftPeer {
    /// construct a peer, rehydrate it from storage, and start its background
    /// work; returns promptly
    pub fn new(
        peer_count: usize,
        me: usize,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
        apply_tx: Sender<ApplyMsg>,
    ) -> Arc<Self> {
        Self::with_config(peer_count, me, transport, storage, apply_tx, RaftConfig::default())
    }

    /// construct with custom timing configuration
    pub fn with_config(
        peer_count: usize,
        me: usize,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
        apply_tx: Sender<ApplyMsg>,
        config: RaftConfig,
    ) -> Arc<Self> {
        let mut node = RaftNode::with_config(me, peer_count, config);
        restore_or_abort(&mut node, storage.as_ref());
        node.reset_election_timer();

        let peer = Arc::new(Self {
            me,
            peer_count,
            node: Mutex::new(node),
            apply_cond: Condvar::new(),
            transport,
            storage,
            apply_tx,
            dead: AtomicBool::new(false),
        });

        peer.spawn_election_ticker();
        peer.spawn_heartbeat_ticker();
        peer.spawn_replication_ticker();
        peer.spawn_applier();

        peer
    }

    // -- host-facing api --

    /// submit a command for agreement
    ///
    /// returns (index, term, is_leader). when this peer is not the leader the
    /// index reported is where the command would have landed and nothing is
    /// appended; when it is, the entry is in the log and durably saved, but
    /// commitment is not promised.
    pub fn start(&self, command: Vec<u8>) -> (u64, u64, bool) {
        let mut node = self.node.lock();
        if self.killed() || node.state != NodeState::Leader {
            return (node.log.last_index() + 1, node.current_term, false);
        }

        let index = node.append_local(command);
        self.persist_if_dirty(&mut node);
        (index, node.current_term, true)
    }

    /// current term and whether this peer believes it is the leader
    pub fn get_state(&self) -> (u64, bool) {
        let node = self.node.lock();
        (node.current_term, node.state == NodeState::Leader)
    }

    /// stop all background activity; the peer emits nothing afterwards
    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
        self.apply_cond.notify_all();
    }

    /// true once `kill` has been called
    pub fn killed(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// serve one inbound rpc; `None` for reply messages or a killed peer
    pub fn handle(&self, message: RaftMessage) -> Option<RaftMessage> {
        if self.killed() {
            return None;
        }
        match message {
            RaftMessage::VoteRequest(args) => {
                let mut node = self.node.lock();
                let reply = node.handle_request_vote(&args);
                // durable before the reply leaves: the vote must survive a crash
                self.persist_if_dirty(&mut node);
                Some(RaftMessage::VoteReply(reply))
            }
            RaftMessage::Append(args) => {
                let mut node = self.node.lock();
                let before = node.commit_index;
                let reply = node.handle_append_entries(&args);
                self.persist_if_dirty(&mut node);
                if node.commit_index > before {
                    self.apply_cond.notify_all();
                }
                Some(RaftMessage::AppendReply(reply))
            }
            RaftMessage::VoteReply(_) | RaftMessage::AppendReply(_) => None,
        }
    }

    // -- background activities --

    /// watches the election timer and launches candidacies
    fn spawn_election_ticker(self: &Arc<Self>) {
        let peer = Arc::clone(self);
        thread::spawn(move || {
            let tick = peer.tick_interval();
            while !peer.killed() {
                thread::sleep(tick);
                let broadcast = {
                    let mut node = peer.node.lock();
                    if node.election_elapsed() {
                        let args = node.start_election();
                        peer.persist_if_dirty(&mut node);
                        if node.vote_count >= node.majority() {
                            // a lone peer is its own majority
                            node.become_leader();
                        }
                        Some(args)
                    } else {
                        None
                    }
                };
                if let Some(args) = broadcast {
                    peer.broadcast_vote_requests(args);
                }
            }
        });
    }

    /// refreshes followers with empty AppendEntries while leading
    fn spawn_heartbeat_ticker(self: &Arc<Self>) {
        let peer = Arc::clone(self);
        thread::spawn(move || {
            let interval = Duration::from_millis(peer.node.lock().config.heartbeat_interval);
            while !peer.killed() {
                thread::sleep(interval);
                let heartbeat = peer.node.lock().heartbeat_args();
                if let Some(args) = heartbeat {
                    peer.broadcast_append_entries(args);
                }
            }
        });
    }

    /// ships missing entries to lagging followers and advances the commit
    /// point while leading
    fn spawn_replication_ticker(self: &Arc<Self>) {
        let peer = Arc::clone(self);
        thread::spawn(move || {
            let tick = peer.tick_interval();
            while !peer.killed() {
                thread::sleep(tick);
                let (sends, advanced) = {
                    let mut node = peer.node.lock();
                    if node.state != NodeState::Leader {
                        continue;
                    }
                    let advanced = node.advance_commit();
                    let sends: Vec<(usize, AppendEntriesArgs)> = (0..peer.peer_count)
                        .filter(|&p| p != peer.me)
                        .filter_map(|p| node.entries_for(p).map(|args| (p, args)))
                        .collect();
                    (sends, advanced)
                };
                if advanced {
                    peer.apply_cond.notify_all();
                }
                for (target, args) in sends {
                    let peer = Arc::clone(&peer);
                    thread::spawn(move || peer.send_append_entries(target, args));
                }
            }
        });
    }

    /// streams committed entries to the host, in index order, exactly once
    fn spawn_applier(self: &Arc<Self>) {
        let peer = Arc::clone(self);
        thread::spawn(move || loop {
            let mut node = peer.node.lock();
            while node.commit_index <= node.last_applied {
                if peer.killed() {
                    return;
                }
                peer.apply_cond.wait_for(&mut node, APPLY_WAIT);
            }
            if peer.killed() {
                return;
            }
            while node.last_applied < node.commit_index {
                node.last_applied += 1;
                let index = node.last_applied;
                let msg = ApplyMsg {
                    command_valid: true,
                    command: node.log.entry(index).command.clone(),
                    command_index: index,
                    ..ApplyMsg::default()
                };
                if peer.apply_tx.send(msg).is_err() {
                    // the host dropped its end; nothing left to deliver to
                    return;
                }
            }
        });
    }

    // -- outbound rpcs --

    fn broadcast_vote_requests(self: &Arc<Self>, args: RequestVoteArgs) {
        for target in (0..self.peer_count).filter(|&p| p != self.me) {
            let peer = Arc::clone(self);
            let args = args.clone();
            thread::spawn(move || peer.send_request_vote(target, args));
        }
    }

    fn broadcast_append_entries(self: &Arc<Self>, args: AppendEntriesArgs) {
        for target in (0..self.peer_count).filter(|&p| p != self.me) {
            let peer = Arc::clone(self);
            let args = args.clone();
            thread::spawn(move || peer.send_append_entries(target, args));
        }
    }

    fn send_request_vote(self: &Arc<Self>, target: usize, args: RequestVoteArgs) {
        let reply = self
            .transport
            .call(target, RaftMessage::VoteRequest(args.clone()));
        let Some(RaftMessage::VoteReply(reply)) = reply else {
            return; // lost in transit; the election ticker will retry
        };

        let heartbeat = {
            let mut node = self.node.lock();
            let became_leader = node.handle_vote_reply(&args, &reply);
            self.persist_if_dirty(&mut node);
            if became_leader {
                node.heartbeat_args()
            } else {
                None
            }
        };
        // announce leadership immediately rather than waiting a full
        // heartbeat interval
        if let Some(args) = heartbeat {
            self.broadcast_append_entries(args);
        }
    }

    fn send_append_entries(self: &Arc<Self>, target: usize, args: AppendEntriesArgs) {
        let reply = self.transport.call(target, RaftMessage::Append(args.clone()));
        let Some(RaftMessage::AppendReply(reply)) = reply else {
            return;
        };

        let mut node = self.node.lock();
        node.handle_append_reply(target, &args, &reply);
        self.persist_if_dirty(&mut node);
    }

    // -- plumbing --

    fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.node.lock().config.tick_interval)
    }

    /// save the durable blob if the state machine changed it
    ///
    /// called with the mutex held so nothing that depends on the new state
    /// can be observed before it is durable. a peer that cannot persist
    /// cannot safely keep answering, so failure here is fatal.
    fn persist_if_dirty(&self, node: &mut RaftNode) {
        if !node.needs_persist() {
            return;
        }
        let blob = node
            .encoded_state()
            .unwrap_or_else(|err| panic!("peer {}: cannot encode raft state: {err}", self.me));
        if let Err(err) = self.storage.save_state(&blob) {
            panic!("peer {}: cannot persist raft state: {err}", self.me);
        }
    }
}

/// rehydrate from storage, retrying transient faults, aborting on rot
///
/// running without the durable term, vote, and log would let this peer
/// double-vote or resurrect discarded entries, so an unreadable blob is not
/// survivable.
fn restore_or_abort(node: &mut RaftNode, storage: &dyn Storage) {
    for attempt in 1..=RESTORE_ATTEMPTS {
        match storage.load_state() {
            Ok(data) if data.is_empty() => return, // fresh peer
            Ok(data) => match node.restore(&data) {
                Ok(()) => {
                    debug!(
                        me = node.me,
                        term = node.current_term,
                        last_index = node.log.last_index(),
                        "restored persisted state"
                    );
                    return;
                }
                Err(err) => {
                    warn!(me = node.me, attempt, %err, "failed to decode persisted state")
                }
            },
            Err(err) => warn!(me = node.me, attempt, %err, "failed to read persisted state"),
        }
    }
    panic!(
        "peer {}: persisted state unreadable after {} attempts",
        node.me, RESTORE_ATTEMPTS
    );
}
