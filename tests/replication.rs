//! Integration tests for the replication protocol
//!
//! Each test starts real nodes on ephemeral ports and talks to them over TCP.

use std::sync::Arc;
use std::time::Duration;

use pharmachain::config::Config;
use pharmachain::crypto::KeyPair;
use pharmachain::network::{default_client, PeerAddr};
use pharmachain::node::Node;
use pharmachain::sync::SyncOutcome;
use pharmachain::transaction::{MovementKind, Product, TransactionRecord};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const TEST_TIMEOUT: Duration = Duration::from_secs(60);

fn test_config(name: &str) -> Config {
    let mut config = Config::default();
    config.node.name = name.to_string();
    config.ledger.difficulty = 1;
    config.network.listen_port = 0;
    config.network.monitor_port = 0;
    config
}

/// Start a node on an ephemeral port and return it with its loopback address.
async fn start_node(name: &str, keys: &KeyPair) -> (Arc<Node>, PeerAddr) {
    let node = Arc::new(
        Node::with_institution_key(test_config(name), keys.public_key)
            .await
            .expect("Failed to create node"),
    );
    let addr = node.start().await.expect("Failed to start node");
    (node, PeerAddr::new("127.0.0.1", addr.port()))
}

fn record(pharmacy: &str, quantity: u32) -> TransactionRecord {
    TransactionRecord::new(
        pharmacy,
        Product::medication("Amoxicillin", "AMX-500", quantity, "500mg"),
        MovementKind::In,
        "pharmacist",
        "LOT-77",
        "12/31/2027",
    )
}

async fn raw_exchange(addr: &PeerAddr, line: &str) -> String {
    let stream = TcpStream::connect(addr.to_string()).await.expect("connect failed");
    let mut reader = BufReader::new(stream);
    reader.get_mut().write_all(line.as_bytes()).await.expect("write failed");
    let mut reply = String::new();
    reader.read_line(&mut reply).await.expect("read failed");
    reply.trim_end().to_string()
}

#[tokio::test]
async fn test_three_nodes_register_and_list_peers() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let keys = KeyPair::generate();
        let (a, addr_a) = start_node("a", &keys).await;
        let (b, addr_b) = start_node("b", &keys).await;
        let (c, addr_c) = start_node("c", &keys).await;
        let client = default_client();

        for (target, others) in [
            (&addr_a, [&addr_b, &addr_c]),
            (&addr_b, [&addr_a, &addr_c]),
            (&addr_c, [&addr_a, &addr_b]),
        ] {
            for other in others {
                client.register(target, other).await.expect("register failed");
            }
            // Registering twice is idempotent.
            client.register(target, others[0]).await.expect("re-register failed");
        }

        for (node, addr, mut expected) in [
            (&a, &addr_a, vec![addr_b.clone(), addr_c.clone()]),
            (&b, &addr_b, vec![addr_a.clone(), addr_c.clone()]),
            (&c, &addr_c, vec![addr_a.clone(), addr_b.clone()]),
        ] {
            expected.sort();
            let mut listed = client.list_peers(addr).await.unwrap();
            listed.sort();
            assert_eq!(listed, expected, "LIST_PEERS at {}", addr);
            assert_eq!(node.peers.list(), expected);
        }

        client.ping(&addr_c).await.unwrap();
        for node in [a, b, c] {
            node.shutdown();
        }
    })
    .await
    .expect("test_three_nodes_register_and_list_peers timed out");
}

#[tokio::test]
async fn test_mined_block_replicates_verbatim() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let keys = KeyPair::generate();
        let (miner, addr_miner) = start_node("miner", &keys).await;
        let (replica, addr_replica) = start_node("replica", &keys).await;
        miner.register_peer(addr_replica.clone());

        let stocked = record("FARM-01", 40);
        miner.append_transaction(stocked.clone()).unwrap();
        let first = miner.mine_block().await.unwrap().unwrap();
        let report = first.broadcast.join().await;
        assert_eq!(report.delivered, vec![addr_replica.clone()]);
        assert!(report.failed.is_empty());

        miner.append_transaction(record("FARM-01", 2)).unwrap();
        let second = miner.mine_block().await.unwrap().unwrap();
        second.broadcast.join().await;

        let client = default_client();
        assert_eq!(client.chain_length(&addr_miner).await.unwrap(), 3);
        assert_eq!(client.chain_length(&addr_replica).await.unwrap(), 3);

        let ledger = replica.ledger.read().await;
        assert_eq!(ledger.head(), &second.block);
        assert_eq!(ledger.head().calculate_hash(), second.block.hash);
        assert!(ledger.is_valid());
        drop(ledger);

        // The replica holds ciphertext only the institution can open.
        let opened = replica.open_block(1, &keys.secret_key).await.unwrap();
        assert_eq!(opened, vec![stocked]);
        assert_eq!(first.block.index, 1);

        miner.shutdown();
        replica.shutdown();
    })
    .await
    .expect("test_mined_block_replicates_verbatim timed out");
}

#[tokio::test]
async fn test_malformed_and_unknown_commands() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let keys = KeyPair::generate();
        let (node, addr) = start_node("strict", &keys).await;

        assert_eq!(raw_exchange(&addr, "PING\n").await, "PONG");
        assert_eq!(raw_exchange(&addr, "FROBNICATE|1\n").await, "ERR|UNKNOWN_CMD");
        assert_eq!(raw_exchange(&addr, "REGISTER_PEER|host\n").await, "ERR|MALFORMED");
        assert_eq!(raw_exchange(&addr, "REGISTER_PEER|host|notaport\n").await, "ERR|BAD_PORT");
        assert_eq!(raw_exchange(&addr, "REPLICATE_BLOCK|1|abc\n").await, "ERR|MALFORMED");
        assert_eq!(raw_exchange(&addr, "\n").await, "ERR|EMPTY");

        // None of the above touched the ledger or the registry.
        assert_eq!(node.ledger.read().await.len(), 1);
        assert!(node.peers.is_empty());

        let counters = node.network.counters();
        assert!(counters.malformed >= 4);
        node.shutdown();
    })
    .await
    .expect("test_malformed_and_unknown_commands timed out");
}

#[tokio::test]
async fn test_sync_adopts_longer_chain() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let keys = KeyPair::generate();
        let (ahead, addr_ahead) = start_node("ahead", &keys).await;
        let (behind, _) = start_node("behind", &keys).await;

        for quantity in [5, 6] {
            ahead.append_transaction(record("FARM-02", quantity)).unwrap();
            ahead.mine_block().await.unwrap();
        }
        assert_eq!(ahead.ledger.read().await.len(), 3);

        behind.append_transaction(record("FARM-03", 1)).unwrap();
        behind.register_peer(addr_ahead.clone());
        let outcome = behind.sync_with_peers().await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Adopted {
                peer: addr_ahead.clone(),
                length: 3
            }
        );
        assert_eq!(behind.ledger.read().await.blocks, ahead.ledger.read().await.blocks);
        assert!(behind.sync.is_synced().await);

        // Pending work survives adoption and is rebuilt on the new head.
        assert_eq!(behind.pending_transactions().len(), 1);
        let mined = behind.mine_block().await.unwrap().unwrap();
        assert_eq!(mined.block.index, 3);
        assert!(behind.validate_chain().await.is_ok());

        // A second round against a now-shorter peer keeps the local chain.
        let outcome = behind.sync_with_peers().await.unwrap();
        assert_eq!(outcome, SyncOutcome::KeptLocal { length: 4 });

        ahead.shutdown();
        behind.shutdown();
    })
    .await
    .expect("test_sync_adopts_longer_chain timed out");
}

#[tokio::test]
async fn test_unreachable_peer_does_not_block_sync() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let keys = KeyPair::generate();
        let (node, _) = start_node("alone", &keys).await;
        // Nothing listens on port 1 on loopback.
        node.register_peer(PeerAddr::new("127.0.0.1", 1));

        let outcome = node.sync_with_peers().await.unwrap();
        assert_eq!(outcome, SyncOutcome::KeptLocal { length: 1 });
        assert!(!node.sync.is_synced().await);
        node.shutdown();
    })
    .await
    .expect("test_unreachable_peer_does_not_block_sync timed out");
}
