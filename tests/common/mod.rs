#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::sleep;

use meshkv::{
    ConflictConfig, InMemoryHub, MemoryStorage, NetConfig, Node, NodeConfig, StoreConfig,
    SyncConfig,
};

pub fn node_addr(index: usize) -> String {
    format!("mem://node{}", index)
}

pub fn node_config(index: usize, peer_indices: &[usize]) -> NodeConfig {
    NodeConfig {
        node_id: Some(format!("{:016x}", index + 1)),
        port: None,
        peers: peer_indices.iter().map(|peer| node_addr(*peer)).collect(),
        public_url: Some(node_addr(index)),
        data_dir: None,
        sync: SyncConfig {
            // Manual anti-entropy keeps the tests deterministic.
            interval_ms: None,
            chunk_size: 5,
            max_attempts: 3,
            retry_interval_ms: 200,
            initial_timeout_ms: 2_000,
        },
        conflict: ConflictConfig::default(),
        store: StoreConfig::default(),
        net: NetConfig {
            reconnect_initial_ms: 50,
            reconnect_max_ms: 400,
            ..NetConfig::default()
        },
    }
}

pub async fn start_node(hub: &Arc<InMemoryHub>, config: NodeConfig, index: usize) -> Node {
    let transport = hub.transport(&node_addr(index));
    Node::start(config, Arc::new(MemoryStorage::new()), transport)
        .await
        .expect("node failed to start")
}

/// Wait until the node reports `expected` open peers.
pub async fn wait_for_open_peers(node: &Node, expected: usize) {
    for _ in 0..200 {
        let open = node
            .stats()
            .await
            .peers
            .iter()
            .filter(|session| format!("{:?}", session.state).contains("Open"))
            .count();
        if open >= expected {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!(
        "node {} never reached {} open peers",
        node.node_id(),
        expected
    );
}

/// Poll until the node reads the expected value at the path.
pub async fn wait_for_value(node: &Node, path: &str, expected: Option<Value>) {
    for _ in 0..200 {
        if node.get(path).await.unwrap() == expected {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!(
        "node {} never converged at '{}': got {:?}, wanted {:?}",
        node.node_id(),
        path,
        node.get(path).await.unwrap(),
        expected
    );
}

/// Run manual anti-entropy on every node, twice, in order.
pub async fn settle(nodes: &[&Node]) {
    for _ in 0..2 {
        for node in nodes {
            node.run_anti_entropy(None).await.unwrap();
        }
    }
}
