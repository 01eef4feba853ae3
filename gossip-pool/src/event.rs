// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use tokio::sync::mpsc;

/// Membership related events.
#[derive(Debug)]
pub enum Event {
    /// A peer has joined the cluster.
    NodeJoined {
        /// The name of the peer.
        name: String,
        /// The gossip address of the peer.
        addr: String,
    },
    /// A peer has left the cluster, either deliberately or because it was
    /// declared dead by the failure detector.
    NodeLeft {
        /// The name of the peer.
        name: String,
    },
    /// A peer has announced its departure ahead of leaving.
    NodeGracefullyLeft {
        /// The name of the peer.
        name: String,
        /// The gossip address of the peer.
        addr: String,
    },
}

/// Exposes membership related events.
pub type EventRx = mpsc::UnboundedReceiver<Event>;
pub(crate) type EventTx = mpsc::UnboundedSender<Event>;

pub(crate) fn event_chan() -> (EventTx, EventRx) {
    mpsc::unbounded_channel::<Event>()
}
