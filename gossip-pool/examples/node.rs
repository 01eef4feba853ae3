// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! A single-process cluster node that serves the membership view and
//! queries it through its own pool.
//!
//! The gossip backend is stubbed out with a loopback implementation, so the
//! example runs standalone; replace [`LoopbackGossip`] with a binding to a
//! real SWIM library to form an actual cluster.

use gossip_pool::{
    proto::{pool_service_client::PoolServiceClient, GetNodeRequest},
    ClientConfig, Delegate, Gossip, GossipError, PoolClient, PoolServer, ServerConfig,
};

use log::LevelFilter;

use std::{io, net::SocketAddr, time::Duration};

fn setup_logger(level: LevelFilter) {
    fern::Dispatch::new()
        .level(level)
        .chain(io::stdout())
        .apply()
        .expect("fern");
}

fn read_config() -> ServerConfig {
    let config_json = r#"
    {
        "rpcPort": 5800,
        "staticAddresses": [ "127.0.0.1:5800" ]
    }"#;

    serde_json::from_str(config_json).expect("error deserializing json config")
}

// A gossip backend consisting of the local node alone.
struct LoopbackGossip {
    name: String,
    addr: String,
    delegate: Delegate,
}

#[async_trait::async_trait]
impl Gossip for LoopbackGossip {
    type Config = ();

    async fn start(
        _config: Self::Config,
        local_name: String,
        bind_port: u16,
        delegate: Delegate,
    ) -> Result<Self, GossipError> {
        Ok(Self {
            name: local_name,
            addr: format!("127.0.0.1:{}", bind_port),
            delegate,
        })
    }

    fn local_name(&self) -> String {
        self.name.clone()
    }

    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    async fn join(&self, addrs: &[String]) -> Result<usize, GossipError> {
        // There is no transport; every join "contacts" the local node only.
        log::info!("Pretending to join via {:?}.", addrs);
        self.delegate.on_join(&self.name, &self.addr);

        Ok(0)
    }

    async fn leave(&self) -> Result<(), GossipError> {
        self.delegate.on_leave(&self.name);

        Ok(())
    }
}

#[tokio::main]
async fn main() {
    setup_logger(LevelFilter::Debug);

    let config = read_config();

    let (server, mut event_rx) = PoolServer::<LoopbackGossip>::start(config.clone(), ())
        .await
        .expect("error starting pool server");

    // Mount the membership service on a tonic server.
    let rpc_addr: SocketAddr = format!("0.0.0.0:{}", config.rpc_port).parse().expect("invalid address");
    tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(server.service())
            .serve(rpc_addr),
    );

    // Log membership events as they happen.
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            log::info!("Membership event: {:?}.", event);
        }
    });

    // Follow the membership from the caller side.
    let client = PoolClient::start(ClientConfig {
        addresses: vec![format!("127.0.0.1:{}", config.rpc_port)],
        port_diff: config.port_diff,
        watch_retry_secs: 5,
    })
    .expect("error starting pool client");

    // Ask the cluster for a node identity through the pool, round-robin.
    let mut query = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = query.tick() => {
                let response = client
                    .with_conn(|channel| async move {
                        PoolServiceClient::new(channel).get_node(GetNodeRequest {}).await
                    })
                    .await;
                match response {
                    Ok(Ok(node)) => log::info!("Dispatched to {}.", node.into_inner().name),
                    Ok(Err(status)) => log::warn!("Dispatch failed: {}.", status),
                    Err(e) => log::warn!("{}.", e),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.shutdown();
    server.shutdown().await;
}
