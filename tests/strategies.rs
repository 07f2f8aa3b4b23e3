mod common;

use std::sync::Arc;

use serde_json::json;

use common::{node_config, settle, start_node, wait_for_open_peers, wait_for_value};
use meshkv::InMemoryHub;

// These scenarios force genuinely concurrent writes by keeping the two
// writers partitioned (their only link, the bridge node, is started after
// the writes) and then letting anti-entropy reconcile.

#[tokio::test]
async fn test_merge_fields_unions_concurrent_user_updates() {
    let hub = InMemoryHub::new();
    let strategies = vec![("users".to_string(), "merge-fields".to_string())];

    let mut a_config = node_config(0, &[2]);
    a_config.conflict.path_strategies = strategies.clone();
    let mut b_config = node_config(1, &[2]);
    b_config.conflict.path_strategies = strategies.clone();
    let mut bridge_config = node_config(2, &[]);
    bridge_config.conflict.path_strategies = strategies;

    let a = start_node(&hub, a_config, 0).await;
    let b = start_node(&hub, b_config, 1).await;

    // Concurrent: the two writers cannot reach each other yet.
    a.put("users/bob", json!({"name": "Bob", "email": "b@x"}))
        .await
        .unwrap();
    b.put("users/bob", json!({"name": "Bob", "phone": "555"}))
        .await
        .unwrap();

    let bridge = start_node(&hub, bridge_config, 2).await;
    wait_for_open_peers(&bridge, 2).await;
    settle(&[&bridge, &a, &b]).await;

    let merged = json!({"name": "Bob", "email": "b@x", "phone": "555"});
    for node in [&a, &b, &bridge] {
        wait_for_value(node, "users/bob", Some(merged.clone())).await;
    }

    for node in [a, b, bridge] {
        node.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_first_write_wins_keeps_the_earlier_value() {
    let hub = InMemoryHub::new();
    let strategies = vec![("settings".to_string(), "first-write-wins".to_string())];

    let mut a_config = node_config(0, &[2]);
    a_config.conflict.path_strategies = strategies.clone();
    let mut b_config = node_config(1, &[2]);
    b_config.conflict.path_strategies = strategies.clone();
    let mut bridge_config = node_config(2, &[]);
    bridge_config.conflict.path_strategies = strategies;

    let a = start_node(&hub, a_config, 0).await;
    let b = start_node(&hub, b_config, 1).await;

    b.put("settings/global", json!({"theme": "dark"}))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    a.put("settings/global", json!({"theme": "light"}))
        .await
        .unwrap();

    let bridge = start_node(&hub, bridge_config, 2).await;
    wait_for_open_peers(&bridge, 2).await;
    settle(&[&bridge, &a, &b]).await;

    for node in [&a, &b, &bridge] {
        wait_for_value(node, "settings/global", Some(json!({"theme": "dark"}))).await;
    }

    for node in [a, b, bridge] {
        node.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_custom_resolver_keeps_minimum_stock() {
    let hub = InMemoryHub::new();
    let a = start_node(&hub, node_config(0, &[2]), 0).await;
    let b = start_node(&hub, node_config(1, &[2]), 1).await;

    let min_stock: meshkv::CustomResolver = Arc::new(|_, local, remote| {
        let local_stock = local.value["stock"].as_i64().unwrap_or(i64::MAX);
        let remote_stock = remote.value["stock"].as_i64().unwrap_or(i64::MAX);
        if local_stock <= remote_stock {
            local.clone()
        } else {
            remote.clone()
        }
    });
    a.register_conflict_resolver("inventory", min_stock.clone())
        .unwrap();
    b.register_conflict_resolver("inventory", min_stock.clone())
        .unwrap();

    a.put("inventory/widget", json!({"stock": 100, "price": 29.99}))
        .await
        .unwrap();
    let low_stock = json!({"stock": 75, "price": 24.99, "onSale": true});
    b.put("inventory/widget", low_stock.clone()).await.unwrap();

    let bridge = start_node(&hub, node_config(2, &[]), 2).await;
    bridge
        .register_conflict_resolver("inventory", min_stock)
        .unwrap();
    wait_for_open_peers(&bridge, 2).await;
    settle(&[&bridge, &a, &b]).await;

    for node in [&a, &b, &bridge] {
        wait_for_value(node, "inventory/widget", Some(low_stock.clone())).await;
    }

    for node in [a, b, bridge] {
        node.close().await.unwrap();
    }
}

/// Strategy changes at runtime apply to later conflicts.
#[tokio::test]
async fn test_set_conflict_strategy_at_runtime() {
    let hub = InMemoryHub::new();
    let node = start_node(&hub, node_config(0, &[]), 0).await;

    node.set_conflict_strategy("cache", "last-write-wins").unwrap();
    assert!(matches!(
        node.set_conflict_strategy("cache", "bogus"),
        Err(meshkv::MeshError::UnknownStrategy(_))
    ));

    node.close().await.unwrap();
}
