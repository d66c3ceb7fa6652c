//! Integration tests for the read-only HTTP monitor
//!
//! These tests verify that the monitor endpoints respond with the expected
//! JSON structures and never expose decrypted inventory.

#![cfg(feature = "api")]

use axum_test::TestServer;
use serde_json::Value;
use std::sync::Arc;
use pharmachain::api::build_monitor_router;
use pharmachain::config::Config;
use pharmachain::crypto::KeyPair;
use pharmachain::network::PeerAddr;
use pharmachain::node::Node;
use pharmachain::transaction::{MovementKind, Product, TransactionRecord};

async fn test_node() -> Arc<Node> {
    let mut config = Config::default();
    config.node.name = "monitor-test".to_string();
    config.ledger.difficulty = 1;
    config.network.listen_port = 0;
    config.network.monitor_port = 0;
    Arc::new(
        Node::with_institution_key(config, KeyPair::generate().public_key)
            .await
            .expect("Failed to create node"),
    )
}

#[tokio::test]
async fn test_monitor_endpoints() {
    let node = test_node().await;
    node.register_peer(PeerAddr::new("10.0.0.7", 5000));
    node.append_transaction(TransactionRecord::new(
        "FARM-09",
        Product::medication("Paracetamol", "PCM-500", 12, "500mg"),
        MovementKind::In,
        "pharmacist",
        "LOT-3",
        "06/30/2027",
    ))
    .expect("Failed to queue transaction");
    node.mine_block().await.expect("Mining failed");

    let server = TestServer::new(build_monitor_router(node.clone())).expect("Failed to create test server");

    // Not started yet, so not ready.
    let response = server.get("/health").await;
    assert_eq!(response.status_code(), 503);
    let json: Value = response.json();
    assert_eq!(json["status"], "unhealthy");
    assert_eq!(json["node_state"], "Booting");
    assert!(json["timestamp"].is_string());

    let response = server.get("/chain").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["length"], 2);
    assert_eq!(json["valid"], true);
    assert!(json["first_invalid"].is_null());
    let blocks = json["blocks"].as_array().expect("blocks should be an array");
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[1]["payload_count"], 1);
    assert_eq!(blocks[1]["hash_valid"], true);
    assert_eq!(blocks[1]["previous_hash"], blocks[0]["hash"]);

    let response = server.get("/chain?page=1&limit=1").await;
    let json: Value = response.json();
    assert_eq!(json["blocks"].as_array().map(Vec::len), Some(1));
    assert_eq!(json["blocks"][0]["index"], 1);

    let response = server.get("/chain/1").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["index"], 1);
    assert!(json["nonce"].is_number());

    let response = server.get("/chain/99").await;
    assert_eq!(response.status_code(), 404);
    let json: Value = response.json();
    assert!(json["error"].is_string());

    let response = server.get("/peers").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["count"], 1);
    assert_eq!(json["peers"][0], "10.0.0.7:5000");

    let response = server.get("/status").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["name"], "monitor-test");
    assert_eq!(json["chain_length"], 2);
    assert_eq!(json["pending_transactions"], 0);
    assert!(json["network"]["connections"].is_number());

    let response = server.get("/").await;
    assert_eq!(response.status_code(), 200);
    let page = response.text();
    assert!(page.contains("monitor-test"));
    assert!(!page.contains("Paracetamol"));
}

#[tokio::test]
async fn test_health_reports_ready_after_start() {
    tokio::time::timeout(std::time::Duration::from_secs(30), async {
        let node = test_node().await;
        node.start().await.expect("Failed to start node");

        // The initial sync round has no peers and finishes promptly.
        while node.state() != pharmachain::node::NodeState::Ready {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let server = TestServer::new(build_monitor_router(node.clone())).expect("Failed to create test server");
        let response = server.get("/health").await;
        assert_eq!(response.status_code(), 200);
        let json: Value = response.json();
        assert_eq!(json["status"], "healthy");

        node.shutdown();
        let response = server.get("/health").await;
        assert_eq!(response.status_code(), 503);
    })
    .await
    .expect("test_health_reports_ready_after_start timed out");
}
