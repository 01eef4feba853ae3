// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The server side of the membership RPC.

use crate::{
    membership::{Membership, NodeMap},
    proto::{self, pool_service_server::PoolService, GetNodeRequest, GetNodeResponse, NodeList, WatchRequest},
};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

const STREAM_BUFFER_SIZE: usize = 8;

/// Serves the membership view to pool clients.
pub struct PoolRpc {
    members: Arc<Membership>,
    local_name: String,
    local_addr: String,
    shutdown: Arc<AtomicBool>,
}

impl PoolRpc {
    pub(crate) fn new(
        members: Arc<Membership>,
        local_name: String,
        local_addr: String,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            members,
            local_name,
            local_addr,
            shutdown,
        }
    }
}

#[tonic::async_trait]
impl PoolService for PoolRpc {
    type WatchStream = ReceiverStream<Result<NodeList, Status>>;

    async fn watch(&self, _request: Request<WatchRequest>) -> Result<Response<Self::WatchStream>, Status> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER_SIZE);
        let members = Arc::clone(&self.members);
        let shutdown = Arc::clone(&self.shutdown);

        tokio::spawn(async move {
            let (mut seq, nodes) = members.snapshot();
            if tx.send(Ok(node_list(&nodes))).await.is_err() {
                return;
            }
            let mut last_sent = nodes;

            loop {
                let (next_seq, nodes) = tokio::select! {
                    changed = members.wait_for_change(seq) => changed,
                    _ = tx.closed() => return,
                };
                seq = next_seq;

                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                // A wake-up without a map replacement (e.g. during another
                // stream's teardown) carries nothing new.
                if Arc::ptr_eq(&last_sent, &nodes) {
                    continue;
                }

                last_sent = Arc::clone(&nodes);
                if tx.send(Ok(node_list(&nodes))).await.is_err() {
                    return;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_node(&self, _request: Request<GetNodeRequest>) -> Result<Response<GetNodeResponse>, Status> {
        Ok(Response::new(GetNodeResponse {
            name: self.local_name.clone(),
            addr: self.local_addr.clone(),
        }))
    }
}

fn node_list(nodes: &NodeMap) -> NodeList {
    let mut nodes: Vec<proto::Node> = nodes
        .iter()
        .map(|(name, node)| proto::Node {
            name: name.clone(),
            addr: node.addr.clone(),
        })
        .collect();
    nodes.sort_by(|a, b| a.name.cmp(&b.name));

    NodeList { nodes }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_stream::StreamExt;

    use std::time::Duration;

    fn rpc() -> (PoolRpc, Arc<Membership>, Arc<AtomicBool>) {
        let members = Arc::new(Membership::new(Duration::from_secs(30)));
        let shutdown = Arc::new(AtomicBool::new(false));
        let rpc = PoolRpc::new(
            Arc::clone(&members),
            "local".to_string(),
            "local-host:6001".to_string(),
            Arc::clone(&shutdown),
        );

        (rpc, members, shutdown)
    }

    #[tokio::test]
    async fn watch_sends_snapshot_first() {
        let (rpc, members, _) = rpc();
        members.join("name-1", "addr-1");

        let mut stream = rpc.watch(Request::new(WatchRequest {})).await.unwrap().into_inner();

        let node_list = stream.next().await.unwrap().unwrap();
        assert_eq!(1, node_list.nodes.len());
        assert_eq!("name-1", node_list.nodes[0].name);
        assert_eq!("addr-1", node_list.nodes[0].addr);
    }

    #[tokio::test]
    async fn watch_streams_every_change() {
        let (rpc, members, _) = rpc();

        let mut stream = rpc.watch(Request::new(WatchRequest {})).await.unwrap().into_inner();
        assert!(stream.next().await.unwrap().unwrap().nodes.is_empty());

        members.join("name-1", "addr-1");
        let node_list = stream.next().await.unwrap().unwrap();
        assert_eq!(vec!["name-1".to_string()], names(&node_list));

        members.join("name-2", "addr-2");
        let node_list = stream.next().await.unwrap().unwrap();
        assert_eq!(vec!["name-1".to_string(), "name-2".to_string()], names(&node_list));

        members.leave("name-1");
        let node_list = stream.next().await.unwrap().unwrap();
        assert_eq!(vec!["name-2".to_string()], names(&node_list));
    }

    #[tokio::test]
    async fn watch_suppresses_wake_without_change() {
        let (rpc, members, _) = rpc();

        let mut stream = rpc.watch(Request::new(WatchRequest {})).await.unwrap().into_inner();
        stream.next().await.unwrap().unwrap();

        members.wake_watchers();

        let timeout = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(timeout.is_err());
    }

    #[tokio::test]
    async fn watch_ends_on_shutdown() {
        let (rpc, members, shutdown) = rpc();

        let mut stream = rpc.watch(Request::new(WatchRequest {})).await.unwrap().into_inner();
        stream.next().await.unwrap().unwrap();

        shutdown.store(true, Ordering::Relaxed);
        members.wake_watchers();

        let ended = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("stream did not end");
        assert!(ended.is_none());
    }

    fn names(node_list: &NodeList) -> Vec<String> {
        node_list.nodes.iter().map(|node| node.name.clone()).collect()
    }
}
