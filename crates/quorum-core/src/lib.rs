//! # quorum-core
//!
//! why: keep an identically ordered replicated log across an odd-sized
//! cluster, tolerating minority crashes and lossy, reordering networks
//! relations: persists through quorum-storage, delivers commits to the host
//! over a crossbeam channel, sends rpcs through a pluggable Transport
//! what: raft state machine, rpc handlers, role/replication drivers, apply loop

pub mod log;
pub mod message;
pub mod node;
pub mod peer;
pub mod transport;

pub use log::{Log, LogEntry};
pub use message::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, RaftMessage, RequestVoteArgs,
    RequestVoteReply,
};
pub use node::{NodeState, RaftConfig, RaftNode};
pub use peer::RaftPeer;
pub use transport::{LocalNetwork, Transport};
