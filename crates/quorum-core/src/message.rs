//! # message
//!
//! why: define the rpc payloads peers exchange and the apply-channel message
//! relations: handled by node.rs, carried by transport.rs, emitted by peer.rs
//! what: RequestVote and AppendEntries args/replies, RaftMessage envelope, ApplyMsg

use serde::{Deserialize, Serialize};

use crate::log::LogEntry;

/// arguments for a candidate's vote request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: usize,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// reply to a vote request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

/// arguments for log replication; empty `entries` doubles as the heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: usize,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// reply to AppendEntries
///
/// On rejection the conflict fields let the leader back its `next_index` off
/// by a whole term per round trip instead of one entry: `conflict_index == 0`
/// means the follower's log was too short (its last index is in `log_len`);
/// otherwise `conflict_term` is the offending term and `conflict_index` the
/// first index holding it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    pub conflict_term: u64,
    pub conflict_index: u64,
    pub log_len: u64,
}

/// envelope for everything that crosses the peer transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftMessage {
    VoteRequest(RequestVoteArgs),
    VoteReply(RequestVoteReply),
    Append(AppendEntriesArgs),
    AppendReply(AppendEntriesReply),
}

/// message delivered to the host service for each committed entry
///
/// `command_valid` is true for log deliveries. The snapshot fields are
/// reserved for hosts that also consume snapshot messages; this core never
/// sets them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyMsg {
    pub command_valid: bool,
    pub command: Vec<u8>,
    pub command_index: u64,

    pub snapshot_valid: bool,
    pub snapshot: Vec<u8>,
    pub snapshot_term: u64,
    pub snapshot_index: u64,
}
