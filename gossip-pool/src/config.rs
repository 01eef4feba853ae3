// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Pool server and pool client configuration.

use crate::addr;

use serde::{Deserialize, Serialize};

use std::time::Duration;

const DEFAULT_PORT_DIFF: u16 = 2000;
const DEFAULT_LEFT_NODE_EXPIRY_SECS: u64 = 30;
const DEFAULT_JOIN_RETRY_SECS: u64 = 30;
const DEFAULT_WATCH_RETRY_SECS: u64 = 60;

/// A configuration error raised during construction.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The RPC port is missing.
    #[error("empty rpcPort in server config")]
    EmptyRpcPort,
    /// A static bootstrap address is not of the form `host:port`.
    #[error("invalid static address: {0}")]
    InvalidStaticAddress(String),
    /// Dynamic bootstrapping was requested without a resolver address.
    #[error("empty serviceAddress when dynamicNodes is true")]
    EmptyServiceAddress,
    /// Static bootstrapping was requested without any addresses.
    #[error("empty staticAddresses in server config")]
    EmptyStaticAddresses,
    /// The gossip port (RPC port plus port diff) does not fit a port number.
    #[error("gossip port overflows for rpcPort {rpc_port} and portDiff {port_diff}")]
    GossipPortOverflow {
        /// The configured RPC port.
        rpc_port: u16,
        /// The configured port diff.
        port_diff: u16,
    },
    /// The client was configured without bootstrap addresses.
    #[error("empty addresses in client config")]
    EmptyAddresses,
    /// A client bootstrap address is not of the form `host:port`.
    #[error("invalid client address: {0}")]
    InvalidClientAddress(String),
}

#[rustfmt::skip]
// # Example
// ```json
// {
//     "rpcPort": 5800,
//     "staticAddresses": [ "host-1:5800", "host-2:5800" ],
//     "portDiff": 2000,
//     "leftNodeExpirySecs": 30,
//     "joinRetrySecs": 30
// }
// ```

/// Configuration of a pool server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The port the embedding gRPC server listens on. The gossip transport
    /// binds to this port plus the port diff.
    #[serde(rename = "rpcPort")]
    pub rpc_port: u16,
    /// Whether peers are found through a resolver service instead of a
    /// static address list.
    #[serde(rename = "dynamicNodes", default)]
    pub dynamic_nodes: bool,
    /// The RPC addresses of the bootstrap peers (static mode).
    #[serde(rename = "staticAddresses", default)]
    pub static_addrs: Vec<String>,
    /// The RPC address of the resolver service (dynamic mode).
    #[serde(rename = "serviceAddress", default)]
    pub service_addr: String,
    /// The offset between the gossip port and the RPC port of a host.
    #[serde(rename = "portDiff", default = "default_port_diff")]
    pub port_diff: u16,
    /// How long a departed peer's address stays blocked from bootstrapping.
    #[serde(rename = "leftNodeExpirySecs", default = "default_left_node_expiry_secs")]
    pub left_node_expiry_secs: u64,
    /// The pause before retrying a failed cluster join.
    #[serde(rename = "joinRetrySecs", default = "default_join_retry_secs")]
    pub join_retry_secs: u64,
}

impl ServerConfig {
    /// Checks the configuration, returning the first violation found.
    pub fn validate(&self) -> Result<(), Error> {
        if self.rpc_port == 0 {
            return Err(Error::EmptyRpcPort);
        }
        if self.rpc_port.checked_add(self.port_diff).is_none() {
            return Err(Error::GossipPortOverflow {
                rpc_port: self.rpc_port,
                port_diff: self.port_diff,
            });
        }

        if self.dynamic_nodes {
            if self.service_addr.is_empty() {
                return Err(Error::EmptyServiceAddress);
            }
        } else {
            if self.static_addrs.is_empty() {
                return Err(Error::EmptyStaticAddresses);
            }
            for static_addr in &self.static_addrs {
                if addr::split_host_port(static_addr).is_err() {
                    return Err(Error::InvalidStaticAddress(static_addr.clone()));
                }
            }
        }

        Ok(())
    }

    /// The port the gossip transport binds to.
    pub fn gossip_port(&self) -> u16 {
        self.rpc_port.checked_add(self.port_diff).expect("invalid address")
    }

    // The static bootstrap addresses translated to their gossip endpoints.
    pub(crate) fn static_join_addrs(&self) -> Vec<String> {
        self.static_addrs
            .iter()
            .map(|static_addr| addr::gossip_addr(static_addr, self.port_diff))
            .collect()
    }

    pub(crate) fn left_node_expiry(&self) -> Duration {
        Duration::from_secs(self.left_node_expiry_secs)
    }

    pub(crate) fn join_retry(&self) -> Duration {
        Duration::from_secs(self.join_retry_secs)
    }
}

#[rustfmt::skip]
// # Example
// ```json
// {
//     "addresses": [ "host-1:5800", "host-2:5800" ],
//     "portDiff": 2000,
//     "watchRetrySecs": 60
// }
// ```

/// Configuration of a pool client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// The RPC addresses of the servers whose membership stream is followed.
    #[serde(rename = "addresses")]
    pub addresses: Vec<String>,
    /// The offset between the gossip port and the RPC port of a host.
    #[serde(rename = "portDiff", default = "default_port_diff")]
    pub port_diff: u16,
    /// The pause before reconnecting a broken membership stream.
    #[serde(rename = "watchRetrySecs", default = "default_watch_retry_secs")]
    pub watch_retry_secs: u64,
}

impl ClientConfig {
    /// Checks the configuration, returning the first violation found.
    pub fn validate(&self) -> Result<(), Error> {
        if self.addresses.is_empty() {
            return Err(Error::EmptyAddresses);
        }
        for address in &self.addresses {
            if addr::split_host_port(address).is_err() {
                return Err(Error::InvalidClientAddress(address.clone()));
            }
        }

        Ok(())
    }

    pub(crate) fn watch_retry(&self) -> Duration {
        Duration::from_secs(self.watch_retry_secs)
    }
}

fn default_port_diff() -> u16 {
    DEFAULT_PORT_DIFF
}

fn default_left_node_expiry_secs() -> u64 {
    DEFAULT_LEFT_NODE_EXPIRY_SECS
}

fn default_join_retry_secs() -> u64 {
    DEFAULT_JOIN_RETRY_SECS
}

fn default_watch_retry_secs() -> u64 {
    DEFAULT_WATCH_RETRY_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_config() -> ServerConfig {
        ServerConfig {
            rpc_port: 0,
            dynamic_nodes: false,
            static_addrs: Vec::new(),
            service_addr: String::new(),
            port_diff: DEFAULT_PORT_DIFF,
            left_node_expiry_secs: DEFAULT_LEFT_NODE_EXPIRY_SECS,
            join_retry_secs: DEFAULT_JOIN_RETRY_SECS,
        }
    }

    #[test]
    fn validate_server_config() {
        let table = [
            ("empty-port", server_config(), Some(Error::EmptyRpcPort)),
            (
                "invalid-static-addr",
                ServerConfig {
                    rpc_port: 4001,
                    static_addrs: vec!["address-1".to_string()],
                    ..server_config()
                },
                Some(Error::InvalidStaticAddress("address-1".to_string())),
            ),
            (
                "service-addr-empty-when-dynamic",
                ServerConfig {
                    rpc_port: 4001,
                    dynamic_nodes: true,
                    ..server_config()
                },
                Some(Error::EmptyServiceAddress),
            ),
            (
                "no-static-addrs",
                ServerConfig {
                    rpc_port: 4001,
                    ..server_config()
                },
                Some(Error::EmptyStaticAddresses),
            ),
            (
                "gossip-port-overflow",
                ServerConfig {
                    rpc_port: u16::MAX,
                    static_addrs: vec!["address-1:4001".to_string()],
                    ..server_config()
                },
                Some(Error::GossipPortOverflow {
                    rpc_port: u16::MAX,
                    port_diff: DEFAULT_PORT_DIFF,
                }),
            ),
            (
                "normal-static",
                ServerConfig {
                    rpc_port: 4001,
                    static_addrs: vec!["address-1:4001".to_string()],
                    ..server_config()
                },
                None,
            ),
            (
                "normal-dynamic",
                ServerConfig {
                    rpc_port: 4001,
                    dynamic_nodes: true,
                    service_addr: "service-name:4001".to_string(),
                    ..server_config()
                },
                None,
            ),
        ];

        for (name, config, expected) in table {
            assert_eq!(expected, config.validate().err(), "case: {}", name);
        }
    }

    #[test]
    fn static_join_addrs_are_translated() {
        let config = ServerConfig {
            rpc_port: 4001,
            static_addrs: vec!["address-1:8001".to_string(), "address-1:8002".to_string()],
            ..server_config()
        };

        assert_eq!(
            vec!["address-1:10001".to_string(), "address-1:10002".to_string()],
            config.static_join_addrs()
        );
    }

    #[test]
    fn gossip_port_is_offset_from_rpc_port() {
        let config = ServerConfig {
            rpc_port: 5800,
            port_diff: 200,
            ..server_config()
        };

        assert_eq!(6000, config.gossip_port());
    }

    #[test]
    fn validate_client_config() {
        let config = ClientConfig {
            addresses: Vec::new(),
            port_diff: DEFAULT_PORT_DIFF,
            watch_retry_secs: DEFAULT_WATCH_RETRY_SECS,
        };
        assert_eq!(Some(Error::EmptyAddresses), config.validate().err());

        let config = ClientConfig {
            addresses: vec!["address-1".to_string()],
            ..config
        };
        assert_eq!(
            Some(Error::InvalidClientAddress("address-1".to_string())),
            config.validate().err()
        );

        let config = ClientConfig {
            addresses: vec!["address-1:4001".to_string()],
            ..config
        };
        assert_eq!(None, config.validate().err());
    }

    #[test]
    fn server_config_deserializes_with_defaults() {
        let config: ServerConfig = serde_json::from_str(
            r#"
            {
                "rpcPort": 5800,
                "staticAddresses": [ "host-1:5800" ]
            }"#,
        )
        .expect("error deserializing json config");

        assert_eq!(5800, config.rpc_port);
        assert!(!config.dynamic_nodes);
        assert_eq!(DEFAULT_PORT_DIFF, config.port_diff);
        assert_eq!(DEFAULT_LEFT_NODE_EXPIRY_SECS, config.left_node_expiry_secs);
        assert_eq!(DEFAULT_JOIN_RETRY_SECS, config.join_retry_secs);
        assert!(config.validate().is_ok());
    }
}
