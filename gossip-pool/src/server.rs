// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The pool server embedded by every process of the cluster.

use crate::{
    config::{self, ServerConfig},
    event::{event_chan, EventRx},
    gossip::{Broadcast, BroadcastQueue, Delegate, Gossip, GossipError},
    membership::{Membership, NodeMap},
    proto::{pool_service_client::PoolServiceClient, pool_service_server::PoolServiceServer, GetNodeRequest},
    rpc::PoolRpc,
    task::{Runnable, ShutdownBus, ShutdownRx, Spawner},
};

use tokio::time::sleep;
use tonic::transport::Endpoint;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// An error starting the pool server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configuration was rejected.
    #[error("configuration error: {0}")]
    Config(#[from] config::Error),
    /// The gossip backend failed to start.
    #[error("{0}")]
    Gossip(#[from] GossipError),
}

/// Joins the gossip cluster and serves the membership view to pool clients.
pub struct PoolServer<G: Gossip> {
    members: Arc<Membership>,
    gossip: Arc<G>,
    broadcasts: BroadcastQueue,
    shutdown: Arc<AtomicBool>,
    shutdown_bus: Mutex<Option<ShutdownBus<1>>>,
}

impl<G: Gossip> PoolServer<G> {
    /// Validates the configuration, starts the gossip backend and the
    /// bootstrap task, and returns the server together with its event
    /// stream.
    pub async fn start(config: ServerConfig, gossip_config: G::Config) -> Result<(Self, EventRx), Error> {
        config.validate()?;

        let members = Arc::new(Membership::new(config.left_node_expiry()));
        let broadcasts = BroadcastQueue::default();
        let (event_tx, event_rx) = event_chan();
        let delegate = Delegate::new(Arc::clone(&members), broadcasts.clone(), event_tx);

        let gossip = Arc::new(G::start(gossip_config, generate_name(), config.gossip_port(), delegate).await?);

        // The local node is part of the view from the start.
        members.join(&gossip.local_name(), &gossip.local_addr());

        let bootstrap = if config.dynamic_nodes {
            BootstrapMode::Dynamic(config.service_addr.clone())
        } else {
            BootstrapMode::Static(config.static_join_addrs())
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let (shutdown_bus, mut registry) = ShutdownBus::<1>::new();

        Spawner::spawn_runnable(
            Bootstrapper {
                members: Arc::clone(&members),
                gossip: Arc::clone(&gossip),
                bootstrap,
                join_retry: config.join_retry(),
                shutdown: Arc::clone(&shutdown),
            },
            registry.register(),
        );

        Ok((
            Self {
                members,
                gossip,
                broadcasts,
                shutdown,
                shutdown_bus: Mutex::new(Some(shutdown_bus)),
            },
            event_rx,
        ))
    }

    /// The name under which this node gossips.
    pub fn local_name(&self) -> String {
        self.gossip.local_name()
    }

    /// The advertised gossip address of this node.
    pub fn local_addr(&self) -> String {
        self.gossip.local_addr()
    }

    /// Returns the current sequence number and live map.
    pub fn nodes(&self) -> (u64, NodeMap) {
        self.members.snapshot()
    }

    /// Waits for the live map to move past `last_seq` and returns the new
    /// snapshot.
    pub async fn watch_nodes(&self, last_seq: u64) -> (u64, NodeMap) {
        self.members.wait_for_change(last_seq).await
    }

    /// The membership RPC, ready to be mounted on the embedding tonic
    /// server.
    pub fn service(&self) -> PoolServiceServer<PoolRpc> {
        PoolServiceServer::new(PoolRpc::new(
            Arc::clone(&self.members),
            self.local_name(),
            self.local_addr(),
            Arc::clone(&self.shutdown),
        ))
    }

    /// Leaves the cluster gracefully and stops all background work. Safe to
    /// call more than once.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        let name = self.gossip.local_name();
        let addr = self.gossip.local_addr();

        log::info!("Leaving the cluster as {} ({}).", name, addr);

        // Announce the departure explicitly: peers must learn of it even if
        // the gossip layer only observes a suspected death.
        self.members.graceful_leave(&name, &addr);
        self.broadcasts.queue(Broadcast::new(name, addr));

        if let Err(e) = self.gossip.leave().await {
            log::warn!("Error leaving the cluster: {}.", e);
        }

        if let Some(bus) = self
            .shutdown_bus
            .lock()
            .expect("error getting shutdown access")
            .take()
        {
            bus.trigger();
        }
        self.members.wake_watchers();
    }
}

// An opaque, process-unique gossip name.
fn generate_name() -> String {
    format!("{:032x}", rand::random::<u128>())
}

enum BootstrapMode {
    Static(Vec<String>),
    Dynamic(String),
}

#[derive(Debug, thiserror::Error)]
enum ResolveError {
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),
    #[error("invalid uri: {0}")]
    InvalidUri(#[from] tonic::codegen::http::uri::InvalidUri),
}

impl BootstrapMode {
    // The gossip addresses to try joining through.
    async fn addresses(&self) -> Result<Vec<String>, ResolveError> {
        match self {
            Self::Static(addrs) => Ok(addrs.clone()),
            Self::Dynamic(service_addr) => {
                let channel = Endpoint::from_shared(format!("http://{}", service_addr))?
                    .connect()
                    .await?;
                let node = PoolServiceClient::new(channel)
                    .get_node(GetNodeRequest {})
                    .await?
                    .into_inner();

                Ok(vec![node.addr])
            }
        }
    }
}

// Re-joins the cluster whenever bootstrap peers are missing from the local
// view, e.g. after a network partition healed.
struct Bootstrapper<G: Gossip> {
    members: Arc<Membership>,
    gossip: Arc<G>,
    bootstrap: BootstrapMode,
    join_retry: Duration,
    shutdown: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl<G: Gossip> Runnable for Bootstrapper<G> {
    const NAME: &'static str = "Bootstrapper";

    async fn run(self, mut shutdown_rx: ShutdownRx) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }

            let candidates = match self.bootstrap.addresses().await {
                Ok(candidates) => candidates,
                Err(e) => {
                    log::warn!("Error resolving bootstrap addresses: {}.", e);
                    tokio::select! {
                        _ = sleep(self.join_retry) => continue,
                        _ = &mut shutdown_rx => return,
                    }
                }
            };

            // The sequence number taken here guards the sleep below: any
            // membership movement after this point wakes the loop.
            let (seq, not_joined) = self.members.not_joined(&candidates);

            if not_joined.is_empty() {
                tokio::select! {
                    _ = self.members.wait_for_change(seq) => {}
                    _ = &mut shutdown_rx => return,
                }
                continue;
            }

            match self.gossip.join(&not_joined).await {
                Ok(contacted) => {
                    log::debug!("Joined the cluster via {} of {} peers.", contacted, not_joined.len());
                    tokio::select! {
                        _ = self.members.wait_for_change(seq) => {}
                        _ = &mut shutdown_rx => return,
                    }
                }
                Err(e) => {
                    log::warn!("Error joining the cluster: {}.", e);
                    tokio::select! {
                        _ = sleep(self.join_retry) => {}
                        _ = &mut shutdown_rx => return,
                    }
                }
            }
        }
    }
}
