// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The client side pool of RPC connections.
//!
//! A background watcher follows the membership stream of one of the
//! configured servers and mirrors it into an immutable connection table,
//! one connection per live peer. Dispatchers pick connections round-robin
//! without taking a lock; the table is swapped wholesale on every
//! membership change.

pub(crate) mod conn;

pub use conn::{Conn, Dial, DialError, TonicDialer};

use conn::{ClientConn, ConnTable};

use crate::{
    addr,
    config::{self, ClientConfig},
    proto::{pool_service_client::PoolServiceClient, NodeList, WatchRequest},
    task::{Runnable, ShutdownBus, ShutdownRx, Spawner},
};

use arc_swap::ArcSwap;
use tonic::transport::Endpoint;

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

/// An error raised by a dispatch.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The pool holds no live connection. The caller decides whether and
    /// when to retry.
    #[error("no connection available")]
    Unavailable,
}

#[derive(Debug, thiserror::Error)]
enum WatchError {
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),
    #[error("stream closed by server")]
    StreamClosed,
    #[error("invalid uri: {0}")]
    InvalidUri(#[from] tonic::codegen::http::uri::InvalidUri),
}

/// A pool of RPC connections following the cluster membership.
pub struct PoolClient<D: Dial = TonicDialer> {
    config: ClientConfig,
    dialer: D,
    conns: ArcSwap<ConnTable<D::Conn>>,
    seq: AtomicU64,
    shutdown_bus: Mutex<Option<ShutdownBus<1>>>,
}

impl PoolClient<TonicDialer> {
    /// Validates the configuration and starts the pool. The membership
    /// watcher runs until [`shutdown`](PoolClient::shutdown) is called.
    pub fn start(config: ClientConfig) -> Result<Arc<Self>, config::Error> {
        Self::start_with_dialer(config, TonicDialer)
    }
}

impl<D: Dial> PoolClient<D> {
    /// Starts the pool with a custom dialer.
    pub fn start_with_dialer(config: ClientConfig, dialer: D) -> Result<Arc<Self>, config::Error> {
        config.validate()?;

        let (shutdown_bus, mut registry) = ShutdownBus::<1>::new();
        let client = Arc::new(Self {
            config,
            dialer,
            conns: ArcSwap::from_pointee(ConnTable::default()),
            seq: AtomicU64::new(0),
            shutdown_bus: Mutex::new(Some(shutdown_bus)),
        });

        Spawner::spawn_runnable(
            Watcher {
                client: Arc::clone(&client),
            },
            registry.register(),
        );

        Ok(client)
    }

    /// Stops the membership watcher. Existing connections stay usable until
    /// they are dropped by their users.
    pub fn shutdown(&self) {
        if let Some(bus) = self
            .shutdown_bus
            .lock()
            .expect("error getting shutdown access")
            .take()
        {
            bus.trigger();
        }
    }

    /// Runs `f` against the next connection in round-robin order.
    ///
    /// The handle passed to `f` must not be retained past the call; the
    /// connection may be closed any time after `f` returns.
    pub async fn with_conn<F, Fut, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(D::Conn) -> Fut,
        Fut: Future<Output = T>,
    {
        let conn = match self.next_conn() {
            Some(conn) => conn,
            None => return Err(Error::Unavailable),
        };
        // Balances the acquire on every exit path, including panics.
        let _guard = ConnGuard(conn.as_ref());

        Ok(f(conn.conn().clone()).await)
    }

    // Selects and acquires the next connection. A connection that is
    // concurrently retired fails to acquire; the counter has already moved
    // on, so the retry lands on the following entry and cannot starve.
    fn next_conn(&self) -> Option<Arc<ClientConn<D::Conn>>> {
        loop {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;

            let table = self.conns.load();
            if table.is_empty() {
                return None;
            }

            let index = ((seq - 1) % table.len() as u64) as usize;
            let conn = &table.conns()[index];
            if conn.acquire() {
                return Some(Arc::clone(conn));
            }
        }
    }

    async fn apply_node_list(&self, node_list: NodeList) {
        let nodes: HashMap<String, String> = node_list
            .nodes
            .into_iter()
            .map(|node| (node.name, addr::rpc_addr(&node.addr, self.config.port_diff)))
            .collect();

        self.apply_nodes(&nodes).await;
    }

    // Mirrors a membership snapshot (name to RPC address) into a new
    // connection table. Surviving entries keep their reference counts;
    // removed entries lose the table's reference and are closed once their
    // last dispatcher finishes; added entries are dialed fresh.
    pub(crate) async fn apply_nodes(&self, nodes: &HashMap<String, String>) {
        let old = self.conns.load_full();

        let mut conns = Vec::with_capacity(nodes.len());
        for conn in old.conns() {
            if nodes.contains_key(conn.node_name()) {
                conns.push(Arc::clone(conn));
            } else if conn.release() {
                conn.conn().close();
            }
        }

        let mut added: Vec<&String> = nodes
            .keys()
            .filter(|name| !old.conns().iter().any(|conn| conn.node_name() == name.as_str()))
            .collect();
        added.sort();

        for name in added {
            match self.dialer.dial(&nodes[name]).await {
                Ok(conn) => conns.push(Arc::new(ClientConn::new(name.clone(), conn))),
                Err(e) => {
                    // The peer stays out of the table; a later membership
                    // change dials it again.
                    log::warn!("{}.", e);
                }
            }
        }

        self.conns.store(Arc::new(ConnTable::new(conns)));
    }
}

struct ConnGuard<'a, C: Conn>(&'a ClientConn<C>);

impl<C: Conn> Drop for ConnGuard<'_, C> {
    fn drop(&mut self) {
        if self.0.release() {
            self.0.conn().close();
        }
    }
}

// Follows the membership stream of one of the configured servers, rotating
// through them on failure.
struct Watcher<D: Dial> {
    client: Arc<PoolClient<D>>,
}

#[async_trait::async_trait]
impl<D: Dial> Runnable for Watcher<D> {
    const NAME: &'static str = "Watcher";

    async fn run(self, mut shutdown_rx: ShutdownRx) {
        let addresses = self.client.config.addresses.clone();
        let mut next_index = 0usize;

        loop {
            let address = &addresses[next_index % addresses.len()];
            next_index = next_index.wrapping_add(1);

            match self.follow_stream(address, &mut shutdown_rx).await {
                Ok(()) => return,
                Err(e) => log::warn!("Membership stream from {} failed: {}.", address, e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.client.config.watch_retry()) => {}
                _ = &mut shutdown_rx => return,
            }
        }
    }
}

impl<D: Dial> Watcher<D> {
    // Returns `Ok(())` only on shutdown; every other outcome is an error
    // that sends the watcher to the next server.
    async fn follow_stream(&self, address: &str, shutdown_rx: &mut ShutdownRx) -> Result<(), WatchError> {
        let channel = Endpoint::from_shared(format!("http://{}", address))?.connect().await?;
        let mut rpc = PoolServiceClient::new(channel);
        let mut stream = rpc.watch(WatchRequest {}).await?.into_inner();

        log::debug!("Following the membership stream from {}.", address);

        loop {
            tokio::select! {
                message = stream.message() => match message? {
                    Some(node_list) => self.client.apply_node_list(node_list).await,
                    None => return Err(WatchError::StreamClosed),
                },
                _ = &mut *shutdown_rx => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use super::conn::tests::{TestConn, TestDialer};

    use crate::proto::Node;

    fn make_client(dialer: Arc<TestDialer>) -> PoolClient<Arc<TestDialer>> {
        PoolClient {
            config: ClientConfig {
                addresses: vec!["address-1:4001".to_string()],
                port_diff: 200,
                watch_retry_secs: 1,
            },
            dialer,
            conns: ArcSwap::from_pointee(ConnTable::default()),
            seq: AtomicU64::new(0),
            shutdown_bus: Mutex::new(None),
        }
    }

    fn set_conns(client: &PoolClient<Arc<TestDialer>>, conns: Vec<Arc<ClientConn<TestConn>>>) {
        client.conns.store(Arc::new(ConnTable::new(conns)));
    }

    #[test]
    fn next_conn_rotates_over_the_table() {
        let client = make_client(Arc::new(TestDialer::default()));
        set_conns(
            &client,
            vec![
                Arc::new(ClientConn::with_ref_count("node-1", TestConn::default(), 10)),
                Arc::new(ClientConn::with_ref_count("node-2", TestConn::default(), 20)),
            ],
        );

        let conn = client.next_conn().unwrap();
        assert_eq!("node-1", conn.node_name());
        assert_eq!(11, conn.ref_count());
        assert_eq!(1, client.seq.load(Ordering::Relaxed));
        conn.release();

        let conn = client.next_conn().unwrap();
        assert_eq!("node-2", conn.node_name());
        assert_eq!(2, client.seq.load(Ordering::Relaxed));
        conn.release();

        let conn = client.next_conn().unwrap();
        assert_eq!("node-1", conn.node_name());
        assert_eq!(3, client.seq.load(Ordering::Relaxed));
        conn.release();
    }

    #[test]
    fn next_conn_without_table_entries() {
        let client = make_client(Arc::new(TestDialer::default()));
        assert!(client.next_conn().is_none());

        set_conns(&client, Vec::new());
        assert!(client.next_conn().is_none());
    }

    #[test]
    fn next_conn_skips_retired_connections() {
        let client = make_client(Arc::new(TestDialer::default()));
        let node_2 = Arc::new(ClientConn::with_ref_count("node-2", TestConn::default(), 1));
        set_conns(
            &client,
            vec![
                Arc::new(ClientConn::with_ref_count("node-1", TestConn::default(), 1)),
                Arc::clone(&node_2),
            ],
        );

        for expected in ["node-1", "node-2", "node-1"] {
            let conn = client.next_conn().unwrap();
            assert_eq!(expected, conn.node_name());
            conn.release();
        }

        // Retire node-2; its table reference is the last one.
        assert!(node_2.release());

        // The fourth pick lands on node-2, fails to acquire it and retries
        // onto node-1.
        let conn = client.next_conn().unwrap();
        assert_eq!("node-1", conn.node_name());
        assert_eq!(5, client.seq.load(Ordering::Relaxed));
        conn.release();
    }

    #[tokio::test]
    async fn with_conn_dispatches_and_balances() {
        let client = make_client(Arc::new(TestDialer::default()));
        let node_1 = Arc::new(ClientConn::with_ref_count("node-1", TestConn::default(), 5));
        set_conns(&client, vec![Arc::clone(&node_1)]);

        let result = client.with_conn(|_conn| async { 42 }).await;

        assert_eq!(Ok(42), result);
        assert_eq!(5, node_1.ref_count());
        assert!(!node_1.conn().is_closed());
    }

    #[tokio::test]
    async fn with_conn_without_connections() {
        let client = make_client(Arc::new(TestDialer::default()));

        let result = client.with_conn(|_conn| async { 42 }).await;

        assert_eq!(Err(Error::Unavailable), result);
    }

    #[tokio::test]
    async fn with_conn_balances_on_panic() {
        let dialer = Arc::new(TestDialer::default());
        let client = Arc::new(make_client(Arc::clone(&dialer)));
        let node_1 = Arc::new(ClientConn::with_ref_count("node-1", TestConn::default(), 5));
        set_conns(&client, vec![Arc::clone(&node_1)]);

        let dispatch = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .with_conn(|_conn| async { panic!("dispatch failure") })
                    .await
            })
        };

        assert!(dispatch.await.is_err());
        assert_eq!(5, node_1.ref_count());
    }

    #[tokio::test]
    async fn with_conn_closes_connection_retired_mid_dispatch() {
        let client = make_client(Arc::new(TestDialer::default()));
        let node_1 = Arc::new(ClientConn::with_ref_count("node-1", TestConn::default(), 1));
        set_conns(&client, vec![Arc::clone(&node_1)]);

        let result = client
            .with_conn(|_conn| async {
                // The table drops its reference while the dispatch is in
                // flight; the close must wait for the dispatch to finish.
                node_1.release();
                assert!(!node_1.conn().is_closed());
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(0, node_1.ref_count());
        assert!(node_1.conn().is_closed());
    }

    #[tokio::test]
    async fn apply_nodes_preserves_surviving_connections() {
        let dialer = Arc::new(TestDialer::default());
        let client = make_client(Arc::clone(&dialer));
        let conn_1 = Arc::new(ClientConn::with_ref_count("name-1", TestConn::default(), 10));
        let conn_2 = Arc::new(ClientConn::with_ref_count("name-2", TestConn::default(), 20));
        set_conns(&client, vec![Arc::clone(&conn_1), Arc::clone(&conn_2)]);

        let nodes: HashMap<String, String> = [
            ("name-1", "host-1:5600"),
            ("name-3", "host-3:5600"),
            ("name-4", "host-4:5600"),
        ]
        .iter()
        .map(|(name, addr)| (name.to_string(), addr.to_string()))
        .collect();

        client.apply_nodes(&nodes).await;

        let table = client.conns.load();
        let names: Vec<&str> = table.conns().iter().map(|conn| conn.node_name()).collect();
        assert_eq!(vec!["name-1", "name-3", "name-4"], names);

        assert_eq!(10, conn_1.ref_count());
        assert_eq!(19, conn_2.ref_count());
        assert!(!conn_2.conn().is_closed());

        assert_eq!(2, dialer.dial_count());
        assert_eq!(vec!["host-3:5600".to_string(), "host-4:5600".to_string()], dialer.dialed());

        // Each dialed connection starts with the table's reference.
        assert_eq!(1, table.conns()[1].ref_count());
        assert_eq!(1, table.conns()[2].ref_count());
    }

    #[tokio::test]
    async fn apply_nodes_closes_unreferenced_retirees() {
        let client = make_client(Arc::new(TestDialer::default()));
        let conn_1 = Arc::new(ClientConn::with_ref_count("name-1", TestConn::default(), 1));
        set_conns(&client, vec![Arc::clone(&conn_1)]);

        client.apply_nodes(&HashMap::new()).await;

        assert!(client.conns.load().is_empty());
        assert_eq!(0, conn_1.ref_count());
        assert!(conn_1.conn().is_closed());
    }

    #[tokio::test]
    async fn apply_node_list_translates_gossip_addresses() {
        let dialer = Arc::new(TestDialer::default());
        let client = make_client(Arc::clone(&dialer));

        client
            .apply_node_list(NodeList {
                nodes: vec![Node {
                    name: "name-1".to_string(),
                    addr: "host-1:5800".to_string(),
                }],
            })
            .await;

        assert_eq!(vec!["host-1:5600".to_string()], dialer.dialed());
    }
}
