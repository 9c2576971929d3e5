//! # transport
//!
//! why: let peers exchange rpcs without owning the wire
//! relations: peer.rs sends through Transport and serves via RaftPeer::handle
//! what: Transport trait, LocalNetwork in-process fabric with fault injection

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rand::Rng;

use crate::message::RaftMessage;
use crate::peer::RaftPeer;

/// best-effort unary request/reply to a specific peer index
///
/// `None` means the request or its reply was lost; the caller retries via its
/// normal tickers. implementations may duplicate and reorder; the consensus
/// handlers are idempotent under their term guards.
pub trait Transport: Send + Sync {
    fn call(&self, target: usize, message: RaftMessage) -> Option<RaftMessage>;
}

struct NetworkInner {
    peers: Vec<Option<Weak<RaftPeer>>>,
    /// reachable[from][to]: can a request travel this direction
    reachable: Vec<Vec<bool>>,
    /// probability each leg (request, reply) is dropped
    loss_rate: f64,
}

/// an in-process cluster fabric for tests and single-process deployments
///
/// peers register after construction (they need an endpoint to be built, and
/// the fabric needs them to deliver), and registration is by weak reference
/// so a crashed-and-restarted peer can take over its slot.
pub struct LocalNetwork {
    inner: Mutex<NetworkInner>,
}

impl LocalNetwork {
    pub fn new(peer_count: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(NetworkInner {
                peers: vec![None; peer_count],
                reachable: vec![vec![true; peer_count]; peer_count],
                loss_rate: 0.0,
            }),
        })
    }

    /// place (or replace) a peer at its slot
    pub fn register(&self, index: usize, peer: &Arc<RaftPeer>) {
        self.inner.lock().peers[index] = Some(Arc::downgrade(peer));
    }

    /// the transport handle a peer sends through
    pub fn endpoint(self: &Arc<Self>, from: usize) -> Arc<dyn Transport> {
        Arc::new(Endpoint {
            network: Arc::clone(self),
            from,
        })
    }

    /// drop each request and each reply independently with this probability
    pub fn set_loss_rate(&self, rate: f64) {
        self.inner.lock().loss_rate = rate;
    }

    /// cut a peer off from everyone, both directions
    pub fn isolate(&self, index: usize) {
        let mut inner = self.inner.lock();
        let n = inner.peers.len();
        for other in 0..n {
            inner.reachable[index][other] = false;
            inner.reachable[other][index] = false;
        }
    }

    /// restore a peer's links to everyone
    pub fn reconnect(&self, index: usize) {
        let mut inner = self.inner.lock();
        let n = inner.peers.len();
        for other in 0..n {
            inner.reachable[index][other] = true;
            inner.reachable[other][index] = true;
        }
    }

    /// split the cluster: peers reach each other only within their group
    pub fn partition(&self, groups: &[&[usize]]) {
        let mut inner = self.inner.lock();
        let n = inner.peers.len();
        for from in 0..n {
            for to in 0..n {
                inner.reachable[from][to] = false;
            }
        }
        for group in groups {
            for &from in *group {
                for &to in *group {
                    inner.reachable[from][to] = true;
                }
            }
        }
    }

    /// undo all partitions and isolations
    pub fn heal(&self) {
        let mut inner = self.inner.lock();
        let n = inner.peers.len();
        inner.reachable = vec![vec![true; n]; n];
    }

    fn route(&self, from: usize, to: usize, message: RaftMessage) -> Option<RaftMessage> {
        let peer = {
            let inner = self.inner.lock();
            if !inner.reachable[from][to] || Self::lost(inner.loss_rate) {
                return None;
            }
            inner.peers[to].as_ref()?.upgrade()?
        };
        // the fabric lock is released before delivery so concurrent traffic
        // interleaves like a real network
        let reply = peer.handle(message)?;
        let inner = self.inner.lock();
        if !inner.reachable[to][from] || Self::lost(inner.loss_rate) {
            return None;
        }
        Some(reply)
    }

    fn lost(rate: f64) -> bool {
        rate > 0.0 && rand::thread_rng().gen_bool(rate)
    }
}

struct Endpoint {
    network: Arc<LocalNetwork>,
    from: usize,
}

impl Transport for Endpoint {
    fn call(&self, target: usize, message: RaftMessage) -> Option<RaftMessage> {
        self.network.route(self.from, target, message)
    }
}
