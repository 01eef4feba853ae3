// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! A service-discovery fabric for RPC connection pools.
//!
//! Every process embeds a [`PoolServer`] that joins a gossip cluster of peer
//! processes; every caller embeds a [`PoolClient`] that follows the
//! membership stream of one of the servers and keeps one live connection per
//! peer, dispatching requests round-robin. Membership is learned by gossip,
//! graceful departures are disseminated reliably, and clients converge on
//! the live set without operator action.
//!
//! The gossip protocol itself (failure detection, transport, anti-entropy
//! scheduling) is not part of this crate. Any SWIM style library can be
//! plugged in by implementing the [`Gossip`] trait and driving the
//! [`Delegate`] it is handed.
//!
//! ## Example
//!
//! ```no_run
//! use gossip_pool::{ClientConfig, Delegate, Gossip, GossipError, PoolClient, PoolServer, ServerConfig};
//!
//! // A binding to the gossip library of your choice.
//! struct SwimBinding {
//!     // ...
//! }
//!
//! #[async_trait::async_trait]
//! impl Gossip for SwimBinding {
//!     type Config = ();
//!
//!     async fn start(
//!         _config: Self::Config,
//!         local_name: String,
//!         bind_port: u16,
//!         delegate: Delegate,
//!     ) -> Result<Self, GossipError> {
//!         // Bind the gossip transport to `bind_port`, use `local_name` as
//!         // the node name, and wire the library's callbacks to `delegate`.
//!         todo!()
//!     }
//!
//!     fn local_name(&self) -> String {
//!         todo!()
//!     }
//!
//!     fn local_addr(&self) -> String {
//!         todo!()
//!     }
//!
//!     async fn join(&self, _addrs: &[String]) -> Result<usize, GossipError> {
//!         todo!()
//!     }
//!
//!     async fn leave(&self) -> Result<(), GossipError> {
//!         todo!()
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let server_config: ServerConfig = serde_json::from_str(
//!         r#"
//!         {
//!             "rpcPort": 5800,
//!             "staticAddresses": [ "host-1:5800", "host-2:5800" ]
//!         }"#,
//!     )
//!     .expect("error deserializing json config");
//!
//!     let (server, mut event_rx) = PoolServer::<SwimBinding>::start(server_config.clone(), ())
//!         .await
//!         .expect("error starting pool server");
//!
//!     // Mount the membership service on the embedding gRPC server.
//!     let rpc_addr: std::net::SocketAddr = format!("0.0.0.0:{}", server_config.rpc_port).parse().unwrap();
//!     tokio::spawn(
//!         tonic::transport::Server::builder()
//!             .add_service(server.service())
//!             .serve(rpc_addr),
//!     );
//!
//!     // Follow the membership from the caller side and dispatch.
//!     let client = PoolClient::start(ClientConfig {
//!         addresses: vec!["host-1:5800".to_string(), "host-2:5800".to_string()],
//!         port_diff: 2000,
//!         watch_retry_secs: 60,
//!     })
//!     .expect("error starting pool client");
//!
//!     // let response = client.with_conn(|channel| async move { /* call a stub on `channel` */ }).await;
//!
//!     tokio::signal::ctrl_c().await.expect("error awaiting ctrl-c");
//!     client.shutdown();
//!     server.shutdown().await;
//! }
//! ```

mod addr;
mod membership;
mod rpc;
mod task;

pub mod client;
pub mod config;
pub mod event;
pub mod gossip;
pub mod server;

/// The generated RPC types of the membership service.
pub mod proto {
    #![allow(missing_docs)]

    tonic::include_proto!("poolpb");
}

pub use client::{Conn, Dial, DialError, PoolClient, TonicDialer};
pub use config::{ClientConfig, ServerConfig};
pub use event::{Event, EventRx};
pub use gossip::{Delegate, Gossip, GossipError};
pub use membership::{Node, NodeMap};
pub use rpc::PoolRpc;
pub use server::PoolServer;
