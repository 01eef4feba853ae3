// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! `host:port` handling and gossip/RPC port translation.
//!
//! Peers announce their gossip endpoint; the RPC endpoint lives on the same
//! host at `gossip port - port diff`. Addresses flow in from configuration
//! and from gossip notifications produced by this crate, so a malformed one
//! is a programmer error rather than an input error.

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub(crate) enum Error {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Splits `host:port` on the last colon.
pub(crate) fn split_host_port(addr: &str) -> Result<(&str, u16), Error> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidAddress(addr.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::InvalidAddress(addr.to_string()))?;

    Ok((host, port))
}

/// Returns the RPC address belonging to a gossip address.
pub(crate) fn rpc_addr(gossip_addr: &str, port_diff: u16) -> String {
    let (host, port) = split_host_port(gossip_addr).expect("invalid address");
    let port = port.checked_sub(port_diff).expect("invalid address");

    format!("{}:{}", host, port)
}

/// Returns the gossip address belonging to an RPC address.
pub(crate) fn gossip_addr(rpc_addr: &str, port_diff: u16) -> String {
    let (host, port) = split_host_port(rpc_addr).expect("invalid address");
    let port = port.checked_add(port_diff).expect("invalid address");

    format!("{}:{}", host, port)
}
