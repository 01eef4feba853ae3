// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The boundary to the gossip backend.
//!
//! The backend is any SWIM style membership library. It owns failure
//! detection and the gossip transport; this crate only asks it to join and
//! leave, and reacts to its notifications through a [`Delegate`]. Graceful
//! departures ride on the backend's user-message and anti-entropy channels,
//! encoded by the [`Broadcast`] codec.

use crate::{
    event::{Event, EventTx},
    membership::Membership,
};

use std::{
    collections::VecDeque,
    str,
    sync::{Arc, Mutex},
};

/// An error produced by the gossip backend.
#[derive(Debug, thiserror::Error)]
#[error("gossip backend error: {0}")]
pub struct GossipError(#[from] Box<dyn std::error::Error + Send + Sync>);

impl GossipError {
    /// Wraps a backend specific error.
    pub fn new(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(err.into())
    }
}

/// A SWIM style gossip backend.
///
/// Implementations bind the gossip transport, invoke the [`Delegate`] for
/// membership notifications, user messages and anti-entropy sync, and drain
/// the delegate's broadcast queue into their retransmit schedule.
#[async_trait::async_trait]
pub trait Gossip: Send + Sync + Sized + 'static {
    /// Backend specific tuning.
    type Config: Send;

    /// Starts the backend with the local name and gossip bind port.
    async fn start(config: Self::Config, local_name: String, bind_port: u16, delegate: Delegate)
        -> Result<Self, GossipError>;

    /// The name under which the local node gossips.
    fn local_name(&self) -> String;

    /// The advertised gossip address of the local node as `host:port`.
    fn local_addr(&self) -> String;

    /// Contacts the given gossip addresses to (re-)join the cluster.
    /// Returns the number of peers successfully contacted.
    async fn join(&self, addrs: &[String]) -> Result<usize, GossipError>;

    /// Announces departure and disconnects from the cluster.
    async fn leave(&self) -> Result<(), GossipError>;
}

/// A graceful-leave notice as it travels through the gossip layer.
///
/// The wire form is `name "@" addr`; lists of notices are `,`-joined.
/// Neither field may therefore contain `@` or `,`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Broadcast {
    name: String,
    addr: String,
}

impl Broadcast {
    pub(crate) fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether this notice supersedes `other` in the transmit queue.
    pub(crate) fn invalidates(&self, other: &Broadcast) -> bool {
        self.name == other.name
    }

    pub(crate) fn marshal(&self) -> Vec<u8> {
        format!("{}@{}", self.name, self.addr).into_bytes()
    }

    pub(crate) fn unmarshal(bytes: &[u8]) -> Option<Self> {
        let s = str::from_utf8(bytes).ok()?;
        let (name, addr) = s.split_once('@')?;

        Some(Self::new(name, addr))
    }
}

/// Queue of graceful-leave notices awaiting retransmission.
///
/// A new notice replaces a queued one for the same peer, so the queue stays
/// bounded by the number of distinct departing peers.
#[derive(Clone, Default)]
pub(crate) struct BroadcastQueue {
    inner: Arc<Mutex<VecDeque<Broadcast>>>,
}

impl BroadcastQueue {
    pub(crate) fn queue(&self, broadcast: Broadcast) {
        let mut queue = self.inner.lock().expect("error getting queue access");
        queue.retain(|queued| !broadcast.invalidates(queued));
        queue.push_back(broadcast);
    }

    pub(crate) fn drain(&self, limit: usize) -> Vec<Broadcast> {
        let mut queue = self.inner.lock().expect("error getting queue access");
        let n = limit.min(queue.len());

        queue.drain(..n).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("error getting queue access").len()
    }
}

/// The callbacks a gossip backend drives.
///
/// Join/leave notifications update the membership view; user messages and
/// remote state carry graceful-leave notices, which are re-queued for
/// further dissemination exactly when they were not yet known locally.
#[derive(Clone)]
pub struct Delegate {
    members: Arc<Membership>,
    broadcasts: BroadcastQueue,
    event_tx: EventTx,
}

impl Delegate {
    pub(crate) fn new(members: Arc<Membership>, broadcasts: BroadcastQueue, event_tx: EventTx) -> Self {
        Self {
            members,
            broadcasts,
            event_tx,
        }
    }

    /// A peer was seen alive, either for the first time or with a new
    /// address.
    pub fn on_join(&self, name: &str, addr: &str) {
        log::debug!("Peer joined: {} ({}).", name, addr);

        self.members.join(name, addr);
        self.event_tx
            .send(Event::NodeJoined {
                name: name.to_string(),
                addr: addr.to_string(),
            })
            .ok();
    }

    /// A peer updated its metadata. Nodes carry no metadata here, so this
    /// is a no-op; it exists so backends have a target for the callback.
    pub fn on_update(&self, _name: &str, _addr: &str) {}

    /// A peer left the cluster or was declared dead.
    pub fn on_leave(&self, name: &str) {
        log::debug!("Peer left: {}.", name);

        self.members.leave(name);
        self.event_tx
            .send(Event::NodeLeft { name: name.to_string() })
            .ok();
    }

    /// A user message was received. Malformed messages are dropped.
    pub fn on_user_message(&self, bytes: &[u8]) {
        if let Some(broadcast) = Broadcast::unmarshal(bytes) {
            self.apply_graceful_leave(broadcast);
        } else {
            log::warn!("Dropping malformed broadcast ({} bytes).", bytes.len());
        }
    }

    /// Marshals the local left-node ledger for a push/pull sync.
    pub fn local_state(&self) -> Vec<u8> {
        let records: Vec<String> = self
            .members
            .left_nodes()
            .into_iter()
            .map(|(name, left)| format!("{}@{}", name, left.addr))
            .collect();

        records.join(",").into_bytes()
    }

    /// Merges a remote left-node ledger received from a push/pull sync.
    pub fn merge_remote_state(&self, bytes: &[u8]) {
        let s = match str::from_utf8(bytes) {
            Ok(s) => s,
            Err(_) => {
                log::warn!("Dropping malformed remote state ({} bytes).", bytes.len());
                return;
            }
        };

        for record in s.split(',').filter(|record| !record.is_empty()) {
            match Broadcast::unmarshal(record.as_bytes()) {
                Some(broadcast) => self.apply_graceful_leave(broadcast),
                None => log::warn!("Dropping malformed remote state record."),
            }
        }
    }

    /// Hands out up to `limit` queued notices for retransmission.
    pub fn get_broadcasts(&self, limit: usize) -> Vec<Vec<u8>> {
        self.broadcasts
            .drain(limit)
            .iter()
            .map(Broadcast::marshal)
            .collect()
    }

    fn apply_graceful_leave(&self, broadcast: Broadcast) {
        let continued = self.members.graceful_leave(broadcast.name(), broadcast.addr());
        if !continued {
            return;
        }

        log::debug!("Peer gracefully left: {} ({}).", broadcast.name(), broadcast.addr());

        self.event_tx
            .send(Event::NodeGracefullyLeft {
                name: broadcast.name().to_string(),
                addr: broadcast.addr().to_string(),
            })
            .ok();
        self.broadcasts.queue(broadcast);
    }
}
