//! Peer-to-peer replication over the line protocol
//!
//! `NetworkNode` owns the inbound side (accept loop, one task per socket) and
//! the outbound fan-out of freshly mined blocks. `PeerClient` is the
//! short-lived request/response client both the node and the CLI use.

use crate::blockchain::{Block, Ledger};
use crate::error::ChainError;
use crate::protocol::{
    parse_block_line, parse_chain_length, parse_peer_list, reason, Command, Response, MAX_LINE_BYTES,
};
use parking_lot::{Mutex, RwLock as SyncRwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// A peer endpoint. Ordered so registry listings are stable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddr {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| ChainError::MalformedMessage(format!("peer '{}' is not host:port", s)))?;
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| ChainError::MalformedMessage(format!("peer '{}' has a bad port", s)))?;
        if host.is_empty() {
            return Err(ChainError::MalformedMessage(format!("peer '{}' has no host", s)));
        }
        Ok(PeerAddr::new(host, port))
    }
}

/// Concurrent set of known peers, independent of the ledger lock.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: SyncRwLock<BTreeSet<PeerAddr>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `peer`. Returns false if it was already registered.
    pub fn register(&self, peer: PeerAddr) -> bool {
        let added = self.peers.write().insert(peer.clone());
        if added {
            info!(peer = %peer, "Peer registered");
        }
        added
    }

    pub fn remove(&self, peer: &PeerAddr) -> bool {
        self.peers.write().remove(peer)
    }

    pub fn contains(&self, peer: &PeerAddr) -> bool {
        self.peers.read().contains(peer)
    }

    /// Point-in-time copy of the registry.
    pub fn list(&self) -> Vec<PeerAddr> {
        self.peers.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

/// Timeouts and fan-out limits for peer traffic.
#[derive(Debug, Clone)]
pub struct NetworkSettings {
    /// Bounds both reading a request and writing its response.
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_concurrent_broadcasts: usize,
    /// Longest inbound request line accepted, newline included.
    pub max_line_bytes: usize,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            max_concurrent_broadcasts: 8,
            max_line_bytes: MAX_LINE_BYTES,
        }
    }
}

#[derive(Debug, Default)]
pub struct NetworkCounters {
    connections: AtomicU64,
    malformed: AtomicU64,
    replicas_accepted: AtomicU64,
    broadcasts_delivered: AtomicU64,
    broadcasts_failed: AtomicU64,
    write_timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub connections: u64,
    pub malformed: u64,
    pub replicas_accepted: u64,
    pub broadcasts_delivered: u64,
    pub broadcasts_failed: u64,
    pub write_timeouts: u64,
}

impl NetworkCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            replicas_accepted: self.replicas_accepted.load(Ordering::Relaxed),
            broadcasts_delivered: self.broadcasts_delivered.load(Ordering::Relaxed),
            broadcasts_failed: self.broadcasts_failed.load(Ordering::Relaxed),
            write_timeouts: self.write_timeouts.load(Ordering::Relaxed),
        }
    }
}

fn unreachable(peer: &PeerAddr, reason: impl fmt::Display) -> ChainError {
    ChainError::PeerUnreachable {
        peer: peer.to_string(),
        reason: reason.to_string(),
    }
}

/// One-request-per-connection client for the replication protocol.
#[derive(Debug, Clone)]
pub struct PeerClient {
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl PeerClient {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
        }
    }

    pub fn from_settings(settings: &NetworkSettings) -> Self {
        Self::new(settings.connect_timeout, settings.read_timeout)
    }

    async fn open(&self, peer: &PeerAddr, command: &Command) -> Result<BufReader<TcpStream>, ChainError> {
        let request = command.encode()?;
        let mut stream = timeout(
            self.connect_timeout,
            TcpStream::connect((peer.host.as_str(), peer.port)),
        )
        .await
        .map_err(|_| unreachable(peer, "connect timed out"))?
        .map_err(|e| unreachable(peer, e))?;

        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| unreachable(peer, e))?;
        Ok(BufReader::new(stream))
    }

    async fn next_line(&self, peer: &PeerAddr, reader: &mut BufReader<TcpStream>) -> Result<String, ChainError> {
        let mut line = String::new();
        let read = timeout(self.read_timeout, reader.read_line(&mut line))
            .await
            .map_err(|_| unreachable(peer, "read timed out"))?
            .map_err(|e| unreachable(peer, e))?;
        if read == 0 {
            return Err(unreachable(peer, "connection closed before reply"));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Send `command` and return the first reply line, without its newline.
    pub async fn request(&self, peer: &PeerAddr, command: &Command) -> Result<String, ChainError> {
        let mut reader = self.open(peer, command).await?;
        self.next_line(peer, &mut reader).await
    }

    pub async fn ping(&self, peer: &PeerAddr) -> Result<(), ChainError> {
        let reply = self.request(peer, &Command::Ping).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(ChainError::MalformedMessage(format!("unexpected reply to PING: {:?}", reply)))
        }
    }

    pub async fn chain_length(&self, peer: &PeerAddr) -> Result<usize, ChainError> {
        parse_chain_length(&self.request(peer, &Command::GetChain).await?)
    }

    pub async fn list_peers(&self, peer: &PeerAddr) -> Result<Vec<PeerAddr>, ChainError> {
        parse_peer_list(&self.request(peer, &Command::ListPeers).await?)
    }

    /// Ask `peer` to add `me` to its registry.
    pub async fn register(&self, peer: &PeerAddr, me: &PeerAddr) -> Result<(), ChainError> {
        let reply = self.request(peer, &Command::RegisterPeer(me.clone())).await?;
        if reply.starts_with("OK|REGISTERED|") {
            Ok(())
        } else {
            Err(ChainError::MalformedMessage(format!("registration refused: {}", reply)))
        }
    }

    pub async fn replicate(&self, peer: &PeerAddr, block: &Block) -> Result<(), ChainError> {
        let reply = self.request(peer, &Command::ReplicateBlock(block.clone())).await?;
        if reply == "OK|ADDED" {
            Ok(())
        } else {
            Err(ChainError::MalformedMessage(format!("replication refused: {}", reply)))
        }
    }

    pub async fn full_chain(&self, peer: &PeerAddr) -> Result<Vec<Block>, ChainError> {
        let mut reader = self.open(peer, &Command::GetFullChain).await?;
        let count = parse_chain_length(&self.next_line(peer, &mut reader).await?)?;

        let mut blocks = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let line = self.next_line(peer, &mut reader).await?;
            blocks.push(parse_block_line(&line)?);
        }
        Ok(blocks)
    }
}

/// Per-peer outcome of one broadcast.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<PeerAddr>,
    pub failed: Vec<(PeerAddr, ChainError)>,
}

type Delivery = (PeerAddr, Result<(), ChainError>);

/// In-flight deliveries of one block. Dropping it leaves the deliveries running.
#[derive(Debug)]
pub struct BroadcastHandle {
    peers: Vec<PeerAddr>,
    workers: Vec<JoinHandle<Vec<Delivery>>>,
}

impl BroadcastHandle {
    /// Number of peers the block is being sent to.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Number of tasks spawned for this broadcast.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every delivery to finish.
    pub async fn join(self) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut lost_worker = None;
        for worker in self.workers {
            match worker.await {
                Ok(deliveries) => {
                    for (peer, result) in deliveries {
                        match result {
                            Ok(()) => report.delivered.push(peer),
                            Err(e) => report.failed.push((peer, e)),
                        }
                    }
                }
                Err(e) => lost_worker = Some(e.to_string()),
            }
        }

        // Peers handled by a worker that died have no outcome of their own.
        if let Some(reason) = lost_worker {
            for peer in self.peers {
                let settled = report.delivered.contains(&peer) || report.failed.iter().any(|(p, _)| *p == peer);
                if !settled {
                    let err = unreachable(&peer, format!("delivery task failed: {}", reason));
                    report.failed.push((peer, err));
                }
            }
        }
        report
    }
}

/// Serves the replication protocol for one ledger and fans out new blocks.
pub struct NetworkNode {
    ledger: Arc<RwLock<Ledger>>,
    peers: Arc<PeerRegistry>,
    settings: NetworkSettings,
    client: PeerClient,
    broadcast_slots: Arc<Semaphore>,
    counters: Arc<NetworkCounters>,
}

impl NetworkNode {
    pub fn new(ledger: Arc<RwLock<Ledger>>, peers: Arc<PeerRegistry>, settings: NetworkSettings) -> Self {
        let client = PeerClient::from_settings(&settings);
        let broadcast_slots = Arc::new(Semaphore::new(settings.max_concurrent_broadcasts.max(1)));
        Self {
            ledger,
            peers,
            settings,
            client,
            broadcast_slots,
            counters: Arc::new(NetworkCounters::default()),
        }
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub fn client(&self) -> &PeerClient {
        &self.client
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Bind the protocol listener. Failure here is fatal for the node.
    pub async fn bind(addr: &str) -> Result<TcpListener, ChainError> {
        TcpListener::bind(addr).await.map_err(|e| ChainError::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        })
    }

    /// Bind `0.0.0.0:port` and serve until the task is aborted.
    pub async fn start_server(self: Arc<Self>, port: u16) -> Result<(), ChainError> {
        let listener = Self::bind(&format!("0.0.0.0:{}", port)).await?;
        self.serve(listener).await;
        Ok(())
    }

    /// Accept loop: one task per inbound socket.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Replication server listening");
        }
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    self.counters.connections.fetch_add(1, Ordering::Relaxed);
                    let node = self.clone();
                    tokio::spawn(async move {
                        node.handle_connection(stream, remote).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, remote: SocketAddr) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half.take(self.settings.max_line_bytes as u64));
        let mut line = String::new();

        let response = match timeout(self.settings.read_timeout, reader.read_line(&mut line)).await {
            Err(_) => {
                debug!(%remote, "Read timed out");
                Response::error(reason::TIMEOUT)
            }
            Ok(Err(e)) => {
                // Invalid UTF-8 lands here as well.
                debug!(%remote, error = %e, "Unreadable request");
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                Response::error(reason::MALFORMED)
            }
            Ok(Ok(_)) if !line.is_empty() && !line.ends_with('\n') => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                if reader.get_ref().limit() == 0 {
                    warn!(%remote, limit = self.settings.max_line_bytes, "Request line too long");
                    Response::error(reason::TOO_LONG)
                } else {
                    debug!(%remote, "Unterminated request line");
                    Response::error(reason::MALFORMED)
                }
            }
            Ok(Ok(_)) => self.dispatch(&line).await,
        };

        let encoded = match response.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(%remote, error = %e, "Failed to encode response");
                format!("ERR|{}\n", reason::MALFORMED)
            }
        };
        match timeout(self.settings.read_timeout, write_half.write_all(encoded.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(%remote, error = %e, "Failed to write response"),
            Err(_) => {
                self.counters.write_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(%remote, bytes = encoded.len(), "Response write timed out");
            }
        }
        let _ = write_half.shutdown().await;
    }

    /// Parse and execute one request line.
    pub async fn dispatch(&self, line: &str) -> Response {
        match Command::parse(line) {
            Ok(command) => self.execute(command).await,
            Err(ChainError::MalformedMessage(reason)) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(%reason, "Malformed request");
                Response::Error(reason)
            }
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Malformed request");
                Response::error(reason::MALFORMED)
            }
        }
    }

    async fn execute(&self, command: Command) -> Response {
        match command {
            Command::Ping => Response::Pong,
            Command::GetChain => Response::ChainLength(self.ledger.read().await.len()),
            Command::GetFullChain => Response::FullChain(self.ledger.read().await.snapshot()),
            Command::ListPeers => Response::Peers(self.peers.list()),
            Command::RegisterPeer(peer) => {
                self.peers.register(peer.clone());
                Response::Registered(peer)
            }
            Command::ReplicateBlock(block) => {
                self.ledger.write().await.accept_replica(block);
                self.counters.replicas_accepted.fetch_add(1, Ordering::Relaxed);
                Response::Added
            }
            Command::Unknown(name) => {
                debug!(command = %name, "Unknown command");
                Response::error(reason::UNKNOWN_CMD)
            }
        }
    }

    /// Send `block` to every registered peer. At most
    /// `max_concurrent_broadcasts` worker tasks are spawned; they share a queue
    /// of peers, and every connection also holds a slot of the node-wide
    /// broadcast pool. No retries.
    pub fn broadcast_block(&self, block: &Block) -> BroadcastHandle {
        let peers = self.peers.list();
        let worker_count = peers.len().min(self.settings.max_concurrent_broadcasts.max(1));
        debug!(index = block.index, peers = peers.len(), workers = worker_count, "Broadcasting block");

        let queue = Arc::new(Mutex::new(peers.iter().cloned().collect::<VecDeque<_>>()));
        let block = Arc::new(block.clone());
        let workers = (0..worker_count)
            .map(|_| {
                let queue = queue.clone();
                let slots = self.broadcast_slots.clone();
                let client = self.client.clone();
                let counters = self.counters.clone();
                let block = block.clone();
                tokio::spawn(async move {
                    let mut deliveries = Vec::new();
                    loop {
                        let next = queue.lock().pop_front();
                        let Some(target) = next else { break };
                        let result = deliver(&client, &slots, &counters, &target, &block).await;
                        deliveries.push((target, result));
                    }
                    deliveries
                })
            })
            .collect();

        BroadcastHandle { peers, workers }
    }
}

async fn deliver(
    client: &PeerClient,
    slots: &Semaphore,
    counters: &NetworkCounters,
    target: &PeerAddr,
    block: &Block,
) -> Result<(), ChainError> {
    let _permit = slots
        .acquire()
        .await
        .map_err(|_| unreachable(target, "broadcast pool closed"))?;
    match client.replicate(target, block).await {
        Ok(()) => {
            counters.broadcasts_delivered.fetch_add(1, Ordering::Relaxed);
            debug!(peer = %target, index = block.index, "Block delivered");
            Ok(())
        }
        Err(e) => {
            counters.broadcasts_failed.fetch_add(1, Ordering::Relaxed);
            warn!(peer = %target, error = %e, "Block replication failed");
            Err(e)
        }
    }
}

/// Convenience used by the CLI: a client with default timeouts.
pub fn default_client() -> PeerClient {
    PeerClient::from_settings(&NetworkSettings::default())
}

/// Encode `block` exactly as it would travel inside `REPLICATE_BLOCK`.
pub fn replication_line(block: &Block) -> Result<String, ChainError> {
    Command::ReplicateBlock(block.clone()).encode()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node() -> NetworkNode {
        let ledger = Arc::new(RwLock::new(Ledger::new(1)));
        NetworkNode::new(ledger, Arc::new(PeerRegistry::new()), NetworkSettings::default())
    }

    #[test]
    fn test_peer_addr_parse_and_display() {
        let peer: PeerAddr = "127.0.0.1:5001".parse().unwrap();
        assert_eq!(peer, PeerAddr::new("127.0.0.1", 5001));
        assert_eq!(peer.to_string(), "127.0.0.1:5001");

        assert!("nohost".parse::<PeerAddr>().is_err());
        assert!(":5001".parse::<PeerAddr>().is_err());
        assert!("h:0".parse::<PeerAddr>().is_err());
        assert!("h:port".parse::<PeerAddr>().is_err());
    }

    #[test]
    fn test_registry_is_idempotent() {
        let registry = PeerRegistry::new();
        assert!(registry.register(PeerAddr::new("a", 1)));
        assert!(!registry.register(PeerAddr::new("a", 1)));
        assert!(registry.register(PeerAddr::new("b", 2)));
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(&PeerAddr::new("a", 1)));
        assert!(!registry.remove(&PeerAddr::new("a", 1)));
        assert_eq!(registry.list(), vec![PeerAddr::new("b", 2)]);
    }

    #[tokio::test]
    async fn test_dispatch_table() {
        tokio::time::timeout(Duration::from_secs(10), async {
            let node = test_node();

            assert_eq!(node.dispatch("PING\n").await, Response::Pong);
            assert_eq!(node.dispatch("GET_CHAIN\n").await, Response::ChainLength(1));
            assert_eq!(node.dispatch("LIST_PEERS\n").await, Response::Peers(vec![]));
            assert_eq!(
                node.dispatch("REGISTER_PEER|10.1.1.1|6000\n").await,
                Response::Registered(PeerAddr::new("10.1.1.1", 6000))
            );
            assert_eq!(
                node.dispatch("LIST_PEERS\n").await,
                Response::Peers(vec![PeerAddr::new("10.1.1.1", 6000)])
            );
            assert_eq!(node.dispatch("HELLO\n").await, Response::error("UNKNOWN_CMD"));
            assert_eq!(node.dispatch("REGISTER_PEER|x|abc\n").await, Response::error("BAD_PORT"));
            assert_eq!(node.dispatch("\n").await, Response::error("EMPTY"));
            assert_eq!(node.counters().malformed, 2);
        })
        .await
        .expect("test_dispatch_table timed out");
    }

    #[tokio::test]
    async fn test_replicated_block_is_stored_verbatim() {
        tokio::time::timeout(Duration::from_secs(10), async {
            let node = test_node();
            let mut block = Block::with_timestamp(node.ledger.read().await.head_hash(), 1234);
            block.seal(vec!["cGF5bG9hZA==".to_string()], "a2V5".to_string());
            block.mine(1);
            block.index = 1;

            let line = replication_line(&block).unwrap();
            assert_eq!(node.dispatch(&line).await, Response::Added);

            let ledger = node.ledger.read().await;
            assert_eq!(ledger.len(), 2);
            assert_eq!(ledger.head(), &block);
            assert_eq!(ledger.head().calculate_hash(), block.hash);
            assert!(ledger.is_valid());
        })
        .await
        .expect("test_replicated_block_is_stored_verbatim timed out");
    }

    #[tokio::test]
    async fn test_broadcast_to_unreachable_peer_reports_failure() {
        tokio::time::timeout(Duration::from_secs(10), async {
            let node = test_node();
            // Bind then drop to get a port with nothing listening.
            let port = {
                let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
                listener.local_addr().unwrap().port()
            };
            node.peers().register(PeerAddr::new("127.0.0.1", port));

            let head = node.ledger.read().await.head().clone();
            let report = node.broadcast_block(&head).join().await;
            assert!(report.delivered.is_empty());
            assert_eq!(report.failed.len(), 1);
            assert!(matches!(report.failed[0].1, ChainError::PeerUnreachable { .. }));
            assert_eq!(node.counters().broadcasts_failed, 1);
        })
        .await
        .expect("test_broadcast_to_unreachable_peer_reports_failure timed out");
    }

    /// Serve `node` on a loopback port and return the address.
    async fn serve_on_loopback(node: NetworkNode) -> (Arc<NetworkNode>, SocketAddr) {
        let listener = NetworkNode::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let node = Arc::new(node);
        tokio::spawn(node.clone().serve(listener));
        (node, addr)
    }

    async fn exchange(addr: SocketAddr, request: Vec<u8>) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&request).await.unwrap();
        let mut reply = String::new();
        BufReader::new(stream).read_line(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn test_oversized_line_is_rejected_without_storing() {
        tokio::time::timeout(Duration::from_secs(10), async {
            let ledger = Arc::new(RwLock::new(Ledger::new(1)));
            let settings = NetworkSettings {
                max_line_bytes: 256,
                ..NetworkSettings::default()
            };
            let (node, addr) = serve_on_loopback(NetworkNode::new(ledger.clone(), Arc::new(PeerRegistry::new()), settings)).await;

            let mut block = Block::with_timestamp(ledger.read().await.head_hash(), 1234);
            block.seal(vec!["A".repeat(1024)], "a2V5".to_string());
            block.mine(1);
            block.index = 1;
            let line = replication_line(&block).unwrap();
            assert!(line.len() > 256);

            assert_eq!(exchange(addr, line.into_bytes()).await, "ERR|TOO_LONG\n");
            assert_eq!(ledger.read().await.len(), 1);
            assert_eq!(node.counters().replicas_accepted, 0);
            assert_eq!(node.counters().malformed, 1);

            // A line that fits still goes through.
            assert_eq!(exchange(addr, b"GET_CHAIN\n".to_vec()).await, "OK|1\n");
        })
        .await
        .expect("test_oversized_line_is_rejected_without_storing timed out");
    }

    #[tokio::test]
    async fn test_unterminated_line_is_malformed() {
        tokio::time::timeout(Duration::from_secs(10), async {
            let (node, addr) = serve_on_loopback(test_node()).await;

            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"PING").await.unwrap();
            stream.shutdown().await.unwrap();
            let mut reply = String::new();
            BufReader::new(stream).read_line(&mut reply).await.unwrap();

            assert_eq!(reply, "ERR|MALFORMED\n");
            assert_eq!(node.counters().malformed, 1);
        })
        .await
        .expect("test_unterminated_line_is_malformed timed out");
    }

    #[tokio::test]
    async fn test_silent_client_gets_timeout() {
        tokio::time::timeout(Duration::from_secs(10), async {
            let settings = NetworkSettings {
                read_timeout: Duration::from_millis(100),
                ..NetworkSettings::default()
            };
            let ledger = Arc::new(RwLock::new(Ledger::new(1)));
            let (_node, addr) = serve_on_loopback(NetworkNode::new(ledger, Arc::new(PeerRegistry::new()), settings)).await;

            // Never sends anything, never closes.
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut reply = String::new();
            BufReader::new(stream).read_line(&mut reply).await.unwrap();
            assert_eq!(reply, "ERR|TIMEOUT\n");
        })
        .await
        .expect("test_silent_client_gets_timeout timed out");
    }

    #[tokio::test]
    async fn test_stalled_reader_releases_connection() {
        tokio::time::timeout(Duration::from_secs(20), async {
            let ledger = Arc::new(RwLock::new(Ledger::new(1)));
            {
                // Far larger than loopback socket buffers can absorb.
                let mut ledger = ledger.write().await;
                let mut block = Block::with_timestamp(ledger.head_hash(), 1234);
                block.seal(vec!["A".repeat(48 * 1024 * 1024)], "a2V5".to_string());
                ledger.accept_replica(block);
            }
            let settings = NetworkSettings {
                read_timeout: Duration::from_millis(200),
                ..NetworkSettings::default()
            };
            let (node, addr) = serve_on_loopback(NetworkNode::new(ledger, Arc::new(PeerRegistry::new()), settings)).await;

            // Ask for the full chain, then never read the reply.
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"GET_FULL_CHAIN\n").await.unwrap();

            while node.counters().write_timeouts == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            assert_eq!(node.counters().write_timeouts, 1);
            drop(stream);
        })
        .await
        .expect("test_stalled_reader_releases_connection timed out");
    }

    #[tokio::test]
    async fn test_broadcast_spawns_bounded_workers() {
        tokio::time::timeout(Duration::from_secs(20), async {
            let ledger = Arc::new(RwLock::new(Ledger::new(1)));
            let settings = NetworkSettings {
                max_concurrent_broadcasts: 2,
                ..NetworkSettings::default()
            };
            let node = NetworkNode::new(ledger, Arc::new(PeerRegistry::new()), settings);
            // Hold all five listeners while collecting ports so none is reused.
            let listeners: Vec<_> = (0..5)
                .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
                .collect();
            let closed_ports: Vec<u16> = listeners.iter().map(|l| l.local_addr().unwrap().port()).collect();
            drop(listeners);
            for port in &closed_ports {
                node.peers().register(PeerAddr::new("127.0.0.1", *port));
            }

            let head = node.ledger.read().await.head().clone();
            let handle = node.broadcast_block(&head);
            assert_eq!(handle.len(), 5);
            assert_eq!(handle.worker_count(), 2);

            let report = handle.join().await;
            assert!(report.delivered.is_empty());
            assert_eq!(report.failed.len(), 5);
            assert_eq!(node.counters().broadcasts_failed, 5);
        })
        .await
        .expect("test_broadcast_spawns_bounded_workers timed out");
    }

    #[tokio::test]
    async fn test_broadcast_with_no_peers_is_empty() {
        let node = test_node();
        let head = node.ledger.read().await.head().clone();
        let handle = node.broadcast_block(&head);
        assert!(handle.is_empty());
        assert_eq!(handle.worker_count(), 0);
        assert!(handle.join().await.failed.is_empty());
    }
}
