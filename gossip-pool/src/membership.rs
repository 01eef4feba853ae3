// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The authoritative in-process view of the cluster.

use tokio::sync::Notify;

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

/// A currently live peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// The gossip endpoint of the peer as `host:port`.
    pub addr: String,
}

/// Immutable snapshot of the live peers, keyed by peer name.
pub type NodeMap = Arc<HashMap<String, Node>>;

// A peer that announced its departure. Kept around so that a rejoin of its
// address is suppressed until the entry expires.
#[derive(Clone, Debug)]
pub(crate) struct LeftNode {
    pub(crate) addr: String,
    last_update: Instant,
}

struct Inner {
    nodes: NodeMap,
    left_nodes: HashMap<String, LeftNode>,
    seq: u64,
}

/// Tracks live and gracefully departed peers.
///
/// The live map is replaced wholesale on every mutation, so snapshots handed
/// out earlier stay valid without holding the lock. `seq` counts mutations
/// and drives the blocking watch.
pub(crate) struct Membership {
    left_node_expiry: Duration,
    notify: Notify,
    inner: Mutex<Inner>,
}

impl Membership {
    pub(crate) fn new(left_node_expiry: Duration) -> Self {
        Self {
            left_node_expiry,
            notify: Notify::new(),
            inner: Mutex::new(Inner {
                nodes: Arc::new(HashMap::new()),
                left_nodes: HashMap::new(),
                seq: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("error getting membership access")
    }

    /// Inserts or overwrites a live peer and wakes all watchers.
    pub(crate) fn join(&self, name: &str, addr: &str) {
        {
            let mut inner = self.lock();
            let mut nodes = HashMap::clone(&inner.nodes);
            nodes.insert(name.to_string(), Node { addr: addr.to_string() });
            inner.nodes = Arc::new(nodes);
            inner.seq += 1;
        }
        self.notify.notify_waiters();
    }

    /// Removes a live peer (dead or left) and wakes all watchers.
    pub(crate) fn leave(&self, name: &str) {
        {
            let mut inner = self.lock();
            let mut nodes = HashMap::clone(&inner.nodes);
            nodes.remove(name);
            inner.nodes = Arc::new(nodes);
            inner.seq += 1;
        }
        self.notify.notify_waiters();
    }

    /// Records a graceful departure.
    ///
    /// Returns `true` if the departure was not yet known. The caller is then
    /// responsible for passing the notice on to its peers; a `false` return
    /// terminates the dissemination.
    pub(crate) fn graceful_leave(&self, name: &str, addr: &str) -> bool {
        let mut inner = self.lock();

        if inner.left_nodes.contains_key(name) {
            return false;
        }
        inner.left_nodes.insert(
            name.to_string(),
            LeftNode {
                addr: addr.to_string(),
                last_update: Instant::now(),
            },
        );
        true
    }

    /// Returns the current sequence number and live map.
    pub(crate) fn snapshot(&self) -> (u64, NodeMap) {
        let inner = self.lock();
        (inner.seq, Arc::clone(&inner.nodes))
    }

    /// Waits until the sequence number exceeds `last_seq`, then returns the
    /// new snapshot.
    pub(crate) async fn wait_for_change(&self, last_seq: u64) -> (u64, NodeMap) {
        loop {
            let notified = self.notify.notified();
            {
                let inner = self.lock();
                if inner.seq > last_seq {
                    return (inner.seq, Arc::clone(&inner.nodes));
                }
            }
            notified.await;
        }
    }

    /// Unblocks all watchers without touching the live map. Used during
    /// shutdown so that stream senders can observe the termination flag.
    pub(crate) fn wake_watchers(&self) {
        {
            let mut inner = self.lock();
            inner.seq += 1;
        }
        self.notify.notify_waiters();
    }

    /// Returns a copy of the left-node ledger.
    pub(crate) fn left_nodes(&self) -> HashMap<String, LeftNode> {
        let inner = self.lock();
        inner.left_nodes.clone()
    }

    /// Filters `candidates` down to the addresses that are neither live nor
    /// known to have departed, and returns them with the current sequence
    /// number.
    ///
    /// Left entries whose address is among the candidates are garbage
    /// collected once they are older than the expiry and their peer is no
    /// longer live. The filtering happens against the ledger before
    /// collection, so the call that evicts an entry still suppresses its
    /// address; only a later call may hand it out again.
    pub(crate) fn not_joined(&self, candidates: &[String]) -> (u64, Vec<String>) {
        let mut inner = self.lock();

        let live_addrs: HashSet<&str> = inner.nodes.values().map(|node| node.addr.as_str()).collect();
        let left_addrs: HashSet<&str> = inner.left_nodes.values().map(|left| left.addr.as_str()).collect();

        let not_joined = candidates
            .iter()
            .filter(|addr| !live_addrs.contains(addr.as_str()) && !left_addrs.contains(addr.as_str()))
            .cloned()
            .collect();

        let now = Instant::now();
        let expired: Vec<String> = inner
            .left_nodes
            .iter()
            .filter(|(name, left)| {
                candidates.iter().any(|candidate| candidate == &left.addr)
                    && !inner.nodes.contains_key(*name)
                    && now.duration_since(left.last_update) >= self.left_node_expiry
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in expired {
            inner.left_nodes.remove(&name);
        }

        (inner.seq, not_joined)
    }
}
