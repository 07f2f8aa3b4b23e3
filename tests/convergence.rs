mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::sleep;

use common::{node_config, settle, start_node, wait_for_open_peers, wait_for_value};
use meshkv::InMemoryHub;

/// Three fully connected nodes, last-write-wins: the later write becomes
/// every node's value.
#[tokio::test]
async fn test_three_node_last_write_wins() {
    let hub = InMemoryHub::new();
    let mut configs = vec![
        node_config(0, &[]),
        node_config(1, &[0]),
        node_config(2, &[0, 1]),
    ];
    for config in &mut configs {
        config.conflict.default_strategy = "last-write-wins".to_string();
    }
    let n1 = start_node(&hub, configs.remove(0), 0).await;
    let n2 = start_node(&hub, configs.remove(0), 1).await;
    let n3 = start_node(&hub, configs.remove(0), 2).await;
    wait_for_open_peers(&n1, 2).await;
    wait_for_open_peers(&n2, 2).await;
    wait_for_open_peers(&n3, 2).await;

    n1.put("products/laptop", json!({"price": 1299}))
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;
    let newer = json!({"price": 1199, "features": ["16GB", "SSD"]});
    n3.put("products/laptop", newer.clone()).await.unwrap();

    settle(&[&n1, &n2, &n3]).await;
    for node in [&n1, &n2, &n3] {
        wait_for_value(node, "products/laptop", Some(newer.clone())).await;
    }

    for node in [n1, n2, n3] {
        node.close().await.unwrap();
    }
}

/// A flood frame reaching a node over two paths is applied once: one
/// subscriber notification, no duplicate commit.
#[tokio::test]
async fn test_duplicate_frames_apply_once() {
    let hub = InMemoryHub::new();
    let n1 = start_node(&hub, node_config(0, &[]), 0).await;
    let n2 = start_node(&hub, node_config(1, &[0]), 1).await;
    let n3 = start_node(&hub, node_config(2, &[0, 1]), 2).await;
    wait_for_open_peers(&n3, 2).await;
    wait_for_open_peers(&n1, 2).await;

    let notifications = Arc::new(Mutex::new(Vec::new()));
    let sink = notifications.clone();
    let _handle = n3
        .subscribe("events", move |value: Option<&Value>, path: &str| {
            sink.lock().unwrap().push((path.to_string(), value.cloned()));
        })
        .unwrap();

    // n1's write reaches n3 directly and via n2's forward.
    n1.put("events/alpha", json!(1)).await.unwrap();
    wait_for_value(&n3, "events/alpha", Some(json!(1))).await;
    sleep(Duration::from_millis(200)).await;

    let seen = notifications.lock().unwrap().clone();
    assert_eq!(seen, vec![("events/alpha".to_string(), Some(json!(1)))]);

    // Version history holds a single version on the receiving node.
    assert_eq!(n3.version_history("events/alpha").await.unwrap().len(), 1);

    for node in [n1, n2, n3] {
        node.close().await.unwrap();
    }
}

/// Writes from one node are observed in commit order on another.
#[tokio::test]
async fn test_per_path_order_is_preserved() {
    let hub = InMemoryHub::new();
    let n1 = start_node(&hub, node_config(0, &[]), 0).await;
    let n2 = start_node(&hub, node_config(1, &[0]), 1).await;
    wait_for_open_peers(&n1, 1).await;
    wait_for_open_peers(&n2, 1).await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = order.clone();
    let _handle = n2
        .subscribe("counter", move |value: Option<&Value>, _| {
            sink.lock().unwrap().push(value.cloned());
        })
        .unwrap();

    for i in 1..=5 {
        n1.put("counter/total", json!(i)).await.unwrap();
    }
    wait_for_value(&n2, "counter/total", Some(json!(5))).await;

    let seen = order.lock().unwrap().clone();
    let expected: Vec<_> = (1..=5).map(|i| Some(json!(i))).collect();
    assert_eq!(seen, expected);

    n1.close().await.unwrap();
    n2.close().await.unwrap();
}

/// Deletions propagate as tombstones and win over earlier values.
#[tokio::test]
async fn test_tombstones_propagate() {
    let hub = InMemoryHub::new();
    let n1 = start_node(&hub, node_config(0, &[]), 0).await;
    let n2 = start_node(&hub, node_config(1, &[0]), 1).await;
    wait_for_open_peers(&n1, 1).await;

    n1.put("users/bob", json!({"name": "Bob"})).await.unwrap();
    wait_for_value(&n2, "users/bob", Some(json!({"name": "Bob"}))).await;

    assert!(n1.del("users/bob").await.unwrap());
    wait_for_value(&n2, "users/bob", None).await;

    // The tombstone survives as a record so anti-entropy can carry it.
    let history = n2.version_history("users/bob").await.unwrap();
    assert!(history[0].deleted);

    // Deleting again reports nothing existed.
    assert!(!n1.del("users/bob").await.unwrap());

    n1.close().await.unwrap();
    n2.close().await.unwrap();
}

/// The per-path version ring stays bounded and newest-first under sustained
/// writes.
#[tokio::test]
async fn test_version_history_is_bounded() {
    let hub = InMemoryHub::new();
    let mut config = node_config(0, &[]);
    config.store.max_versions = 4;
    let node = start_node(&hub, config, 0).await;

    for i in 1..=10 {
        node.put("metrics/hits", json!(i)).await.unwrap();
    }
    let history = node.version_history("metrics/hits").await.unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].value, json!(10));
    assert_eq!(history[3].value, json!(7));

    node.close().await.unwrap();
}

/// Closing a node twice is a no-op, and a closed node refuses writes.
#[tokio::test]
async fn test_close_is_idempotent_and_rejects_writes() {
    let hub = InMemoryHub::new();
    let node = start_node(&hub, node_config(0, &[]), 0).await;
    node.put("a/b", json!(1)).await.unwrap();

    node.close().await.unwrap();
    node.close().await.unwrap();

    let result = node.put("a/c", json!(2)).await;
    assert!(matches!(result, Err(meshkv::MeshError::ShuttingDown)));
    // Reads still serve the in-memory state.
    assert_eq!(node.get("a/b").await.unwrap(), Some(json!(1)));
}

/// Host API validation errors.
#[tokio::test]
async fn test_invalid_paths_are_rejected() {
    let hub = InMemoryHub::new();
    let node = start_node(&hub, node_config(0, &[]), 0).await;

    assert!(matches!(
        node.put("bad:path", json!(1)).await,
        Err(meshkv::MeshError::InvalidPath(_))
    ));
    assert!(matches!(
        node.get("a//b").await,
        Err(meshkv::MeshError::InvalidPath(_))
    ));
    assert!(matches!(
        node.set_conflict_strategy("users", "nonexistent"),
        Err(meshkv::MeshError::UnknownStrategy(_))
    ));

    node.close().await.unwrap();
}

/// Scan is lexicographic, honours limits, and skips tombstones.
#[tokio::test]
async fn test_scan_over_replicated_data() {
    let hub = InMemoryHub::new();
    let n1 = start_node(&hub, node_config(0, &[]), 0).await;
    let n2 = start_node(&hub, node_config(1, &[0]), 1).await;
    wait_for_open_peers(&n1, 1).await;

    n1.put("users/al", json!(1)).await.unwrap();
    n1.put("users/bob", json!(2)).await.unwrap();
    n1.put("users/cy", json!(3)).await.unwrap();
    n1.del("users/bob").await.unwrap();
    wait_for_value(&n2, "users/cy", Some(json!(3))).await;
    wait_for_value(&n2, "users/bob", None).await;

    let entries = n2.scan("users", None).await.unwrap();
    let paths: Vec<_> = entries.iter().map(|(path, _)| path.as_str()).collect();
    assert_eq!(paths, vec!["users/al", "users/cy"]);

    let limited = n2.scan("users", Some(1)).await.unwrap();
    assert_eq!(limited.len(), 1);

    n1.close().await.unwrap();
    n2.close().await.unwrap();
}
