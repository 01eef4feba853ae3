// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Reference counted client connections and the immutable table holding
//! them.

use tonic::transport::{Channel, Endpoint};

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// An error dialing a peer.
#[derive(Debug, thiserror::Error)]
#[error("error dialing {addr}: {source}")]
pub struct DialError {
    pub(crate) addr: String,
    pub(crate) source: Box<dyn std::error::Error + Send + Sync>,
}

/// A dispatchable transport handle.
///
/// Handles are cheap to clone; all clones refer to the same underlying
/// transport. `close` tears the transport down once the pool is done with
/// it.
pub trait Conn: Clone + Send + Sync + 'static {
    /// Closes the underlying transport.
    fn close(&self);
}

/// Dials the RPC endpoint of a peer.
#[async_trait::async_trait]
pub trait Dial: Send + Sync + 'static {
    /// The produced transport handle.
    type Conn: Conn;

    /// Connects to `addr` (`host:port`).
    async fn dial(&self, addr: &str) -> Result<Self::Conn, DialError>;
}

/// Dials tonic channels.
pub struct TonicDialer;

#[async_trait::async_trait]
impl Dial for TonicDialer {
    type Conn = Channel;

    async fn dial(&self, addr: &str) -> Result<Channel, DialError> {
        let endpoint = Endpoint::from_shared(format!("http://{}", addr)).map_err(|e| DialError {
            addr: addr.to_string(),
            source: e.into(),
        })?;

        endpoint.connect().await.map_err(|e| DialError {
            addr: addr.to_string(),
            source: e.into(),
        })
    }
}

impl Conn for Channel {
    fn close(&self) {
        // Hyper disconnects when the last clone of the channel is dropped,
        // i.e. when the table entry and all in-flight dispatchers are gone.
    }
}

/// A single pooled connection.
///
/// The reference count starts at 1 for the table's own reference and is the
/// only mutable field. Each record is padded to one cache line so that
/// dispatchers hammering the counters of neighboring entries do not share a
/// line.
#[repr(C, align(64))]
pub(crate) struct ClientConn<C> {
    conn: Box<C>,
    node_name: String,
    ref_count: AtomicU64,
}

impl<C: Conn> ClientConn<C> {
    pub(crate) fn new(node_name: impl Into<String>, conn: C) -> Self {
        Self {
            conn: Box::new(conn),
            node_name: node_name.into(),
            ref_count: AtomicU64::new(1),
        }
    }

    pub(crate) fn node_name(&self) -> &str {
        &self.node_name
    }

    pub(crate) fn conn(&self) -> &C {
        &self.conn
    }

    /// Takes a reference. Fails if the count already reached zero; such a
    /// connection is being torn down and must not be handed out again.
    pub(crate) fn acquire(&self) -> bool {
        let mut count = self.ref_count.load(Ordering::Acquire);
        loop {
            if count == 0 {
                return false;
            }
            match self
                .ref_count
                .compare_exchange(count, count + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => count = actual,
            }
        }
    }

    /// Drops a reference. A `true` return means the count reached zero and
    /// the caller must close the connection.
    pub(crate) fn release(&self) -> bool {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> u64 {
        self.ref_count.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn with_ref_count(node_name: impl Into<String>, conn: C, ref_count: u64) -> Self {
        Self {
            conn: Box::new(conn),
            node_name: node_name.into(),
            ref_count: AtomicU64::new(ref_count),
        }
    }
}

/// Immutable snapshot of the pooled connections, one per live peer.
pub(crate) struct ConnTable<C> {
    conns: Vec<Arc<ClientConn<C>>>,
}

impl<C> ConnTable<C> {
    pub(crate) fn new(conns: Vec<Arc<ClientConn<C>>>) -> Self {
        Self { conns }
    }

    pub(crate) fn conns(&self) -> &[Arc<ClientConn<C>>] {
        &self.conns
    }

    pub(crate) fn len(&self) -> usize {
        self.conns.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

impl<C> Default for ConnTable<C> {
    fn default() -> Self {
        Self { conns: Vec::new() }
    }
}
