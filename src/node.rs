//! Process-scoped node context
//!
//! `Node` owns everything one PharmaChain process needs: configuration, the
//! ledger, the peer registry, the replication service, the sync driver, the
//! sealing key and the optional audit store. Nothing lives in globals.

use crate::blockchain::{Block, Ledger};
use crate::codec::{open_batch, PayloadCodec};
use crate::config::Config;
use crate::crypto::{load_sealed_key, public_key_from_hex};
use crate::error::{ChainError, ValidationFailure};
use crate::miner::{CancelToken, MiningOutcome};
use crate::network::{BroadcastHandle, CounterSnapshot, NetworkNode, PeerAddr, PeerRegistry};
use crate::persistence::{InMemoryAudit, NonceAudit, SqliteAudit};
use crate::sync::{ChainSync, SyncOutcome};
use crate::transaction::{tally, StockLine, TransactionRecord};
use parking_lot::Mutex;
use secp256k1::{PublicKey, SecretKey};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    Booting,
    Syncing,
    Ready,
    Stopped,
}

/// A block this node mined and appended, plus its in-flight replication.
#[derive(Debug)]
pub struct MinedBlock {
    pub block: Block,
    pub attempts: u64,
    pub broadcast: BroadcastHandle,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub name: String,
    pub state: NodeState,
    pub chain_length: usize,
    pub difficulty: usize,
    pub head_hash: String,
    pub peers: usize,
    pub pending_transactions: usize,
    pub network: CounterSnapshot,
}

pub struct Node {
    pub config: Config,
    pub ledger: Arc<RwLock<Ledger>>,
    pub peers: Arc<PeerRegistry>,
    pub network: Arc<NetworkNode>,
    pub sync: Arc<ChainSync>,
    codec: PayloadCodec,
    audit: Option<Arc<dyn NonceAudit>>,
    pending: Mutex<Block>,
    state: Mutex<NodeState>,
    cancel: CancelToken,
    listen_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Build a node from `config`, resolving the institution key from the
    /// config or from the keystore's public half.
    pub async fn init(config: Config) -> Result<Self, ChainError> {
        let institution = resolve_institution_key(&config)?;
        Self::with_institution_key(config, institution).await
    }

    /// Build a node that seals blocks for `institution`. Mines genesis on a
    /// blocking thread.
    pub async fn with_institution_key(config: Config, institution: PublicKey) -> Result<Self, ChainError> {
        config.validate()?;
        info!(name = %config.node.name, difficulty = config.ledger.difficulty, "Starting PharmaChain node");

        let (difficulty, genesis_timestamp) = (config.ledger.difficulty, config.ledger.genesis_timestamp);
        let ledger = tokio::task::spawn_blocking(move || Ledger::with_genesis_timestamp(difficulty, genesis_timestamp))
            .await
            .map_err(|e| ChainError::InvalidBlock(format!("Genesis mining task failed: {}", e)))?;
        let head = ledger.head_hash();
        let ledger = Arc::new(RwLock::new(ledger));

        let peers = Arc::new(PeerRegistry::new());
        for peer in config.network.parsed_bootstrap_peers()? {
            peers.register(peer);
        }

        let settings = config.network.settings();
        let network = Arc::new(NetworkNode::new(ledger.clone(), peers.clone(), settings));
        let sync = Arc::new(ChainSync::new(network.client().clone()));
        let audit = open_audit(&config);

        Ok(Self {
            config,
            ledger,
            peers,
            network,
            sync,
            codec: PayloadCodec::new(institution),
            audit,
            pending: Mutex::new(Block::new(head)),
            state: Mutex::new(NodeState::Booting),
            cancel: CancelToken::new(),
            listen_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    fn set_state(&self, state: NodeState) {
        *self.state.lock() = state;
    }

    /// Address the replication server is bound to, once started.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock()
    }

    pub fn audit(&self) -> Option<&Arc<dyn NonceAudit>> {
        self.audit.as_ref()
    }

    /// Bind the replication server (fatal on failure), start the monitor and
    /// run an initial sync round against the bootstrap peers.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, ChainError> {
        let bind = format!("0.0.0.0:{}", self.config.network.listen_port);
        let listener = NetworkNode::bind(&bind).await?;
        let addr = listener.local_addr()?;
        *self.listen_addr.lock() = Some(addr);

        let network = self.network.clone();
        self.tasks.lock().push(tokio::spawn(async move {
            network.serve(listener).await;
        }));

        self.start_monitor().await?;

        self.set_state(NodeState::Syncing);
        let node = self.clone();
        self.tasks.lock().push(tokio::spawn(async move {
            if let Err(e) = node.sync_with_peers().await {
                warn!(error = %e, "Initial sync failed");
            }
            if node.state() == NodeState::Syncing {
                node.set_state(NodeState::Ready);
            }
        }));

        info!(%addr, peers = self.peers.len(), "Node started");
        Ok(addr)
    }

    #[cfg(feature = "api")]
    async fn start_monitor(self: &Arc<Self>) -> Result<(), ChainError> {
        let port = self.config.network.monitor_port;
        if port == 0 {
            debug!("Monitor disabled");
            return Ok(());
        }
        let bind = format!("0.0.0.0:{}", port);
        let listener = tokio::net::TcpListener::bind(&bind).await.map_err(|e| ChainError::Bind {
            addr: bind.clone(),
            reason: e.to_string(),
        })?;
        let node = self.clone();
        self.tasks.lock().push(tokio::spawn(async move {
            if let Err(e) = crate::api::serve(node, listener).await {
                error!(error = %e, "Monitor server failed");
            }
        }));
        Ok(())
    }

    #[cfg(not(feature = "api"))]
    async fn start_monitor(self: &Arc<Self>) -> Result<(), ChainError> {
        debug!("Monitor not compiled in");
        Ok(())
    }

    /// Stop serving and cancel in-flight mining.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.set_state(NodeState::Stopped);
        info!("Node stopped");
    }

    /// Validate and queue a record into the pending block.
    pub fn append_transaction(&self, tx: TransactionRecord) -> Result<(), ChainError> {
        tx.validate()?;
        debug!(tx = %tx, "Transaction queued");
        self.pending.lock().append_transaction(tx)
    }

    pub fn pending_transactions(&self) -> Vec<TransactionRecord> {
        self.pending.lock().pending_transactions().to_vec()
    }

    /// Seal the pending batch, mine it, append it and broadcast it.
    ///
    /// Returns `Ok(None)` if mining was cancelled by shutdown; the batch is
    /// then put back into the pending block.
    pub async fn mine_block(&self) -> Result<Option<MinedBlock>, ChainError> {
        let batch = {
            let mut pending = self.pending.lock();
            let batch = pending.pending_transactions().to_vec();
            if batch.is_empty() {
                return Err(ChainError::InvalidBlock("No pending transactions to mine".to_string()));
            }
            *pending = Block::new(pending.previous_hash.clone());
            batch
        };

        let mut block = Block::new(self.ledger.read().await.head_hash());
        for tx in &batch {
            block.append_transaction(tx.clone())?;
        }
        if let Err(e) = self.codec.seal_block(&mut block) {
            self.restore_batch(batch)?;
            return Err(e);
        }
        let difficulty = self.ledger.read().await.difficulty();

        let mut attempts = 0u64;
        loop {
            if self.cancel.is_cancelled() {
                self.restore_batch(batch)?;
                return Ok(None);
            }
            let cancel = self.cancel.clone();
            let (mined, outcome) = tokio::task::spawn_blocking(move || {
                let outcome = block.mine_with_cancel(difficulty, &cancel);
                (block, outcome)
            })
            .await
            .map_err(|e| ChainError::InvalidBlock(format!("Mining task failed: {}", e)))?;
            block = mined;

            match outcome {
                MiningOutcome::Cancelled { .. } => {
                    self.restore_batch(batch)?;
                    return Ok(None);
                }
                MiningOutcome::Mined { attempts: n, .. } => attempts += n,
            }

            let mut ledger = self.ledger.write().await;
            let head = ledger.head_hash();
            if block.previous_hash != head {
                // A replica or sync moved the head while we mined; rebuild on top of it.
                debug!(stale = %block.previous_hash, head = %head, "Head moved during mining, re-mining");
                block.previous_hash = head;
                continue;
            }

            let index = ledger.append(block.clone());
            block.index = index;
            self.rebase_pending(&block.hash)?;
            drop(ledger);

            if let Some(audit) = &self.audit {
                if let Err(e) = audit.store_nonce(block.index, &block.hash, block.nonce) {
                    warn!(index, error = %e, "Failed to record nonce in audit store");
                }
            }

            let broadcast = self.broadcast_block(&block);
            return Ok(Some(MinedBlock {
                block,
                attempts,
                broadcast,
            }));
        }
    }

    pub async fn validate_chain(&self) -> Result<(), ValidationFailure> {
        self.ledger.read().await.validate()
    }

    pub fn broadcast_block(&self, block: &Block) -> BroadcastHandle {
        self.network.broadcast_block(block)
    }

    pub fn register_peer(&self, peer: PeerAddr) -> bool {
        self.peers.register(peer)
    }

    pub async fn sync_with_peers(&self) -> Result<SyncOutcome, ChainError> {
        let peers = self.peers.list();
        let outcome = self.sync.synchronize(&self.ledger, &peers).await?;
        if let SyncOutcome::Adopted { .. } = outcome {
            let head = self.ledger.read().await.head_hash();
            self.rebase_pending(&head)?;
        }
        Ok(outcome)
    }

    /// Point the pending block at `head`, carrying over whatever was queued.
    fn rebase_pending(&self, head: &str) -> Result<(), ChainError> {
        let mut pending = self.pending.lock();
        if pending.previous_hash == head {
            return Ok(());
        }
        let carried = pending.pending_transactions().to_vec();
        *pending = Block::new(head);
        for tx in carried {
            pending.append_transaction(tx)?;
        }
        Ok(())
    }

    /// Put an unmined batch back in front of anything queued since it was taken.
    fn restore_batch(&self, batch: Vec<TransactionRecord>) -> Result<(), ChainError> {
        let mut pending = self.pending.lock();
        let queued = pending.pending_transactions().to_vec();
        *pending = Block::new(pending.previous_hash.clone());
        for tx in batch.into_iter().chain(queued) {
            pending.append_transaction(tx)?;
        }
        Ok(())
    }

    /// Decrypt the batch stored in block `index`.
    pub async fn open_block(&self, index: usize, secret: &SecretKey) -> Result<Vec<TransactionRecord>, ChainError> {
        let block = self
            .ledger
            .read()
            .await
            .get(index)
            .cloned()
            .ok_or_else(|| ChainError::InvalidBlock(format!("No block at index {}", index)))?;
        open_batch(&block, secret)
    }

    /// Stock per product for `pharmacy_id`, folded over every block.
    pub async fn inventory(&self, pharmacy_id: &str, secret: &SecretKey) -> Result<BTreeMap<String, StockLine>, ChainError> {
        let blocks = self.ledger.read().await.snapshot();
        let mut records = Vec::new();
        for block in &blocks {
            records.extend(open_batch(block, secret)?);
        }
        Ok(tally(&records, pharmacy_id))
    }

    pub async fn status(&self) -> NodeStatus {
        let ledger = self.ledger.read().await;
        NodeStatus {
            name: self.config.node.name.clone(),
            state: self.state(),
            chain_length: ledger.len(),
            difficulty: ledger.difficulty(),
            head_hash: ledger.head_hash(),
            peers: self.peers.len(),
            pending_transactions: self.pending.lock().pending_transactions().len(),
            network: self.network.counters(),
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn resolve_institution_key(config: &Config) -> Result<PublicKey, ChainError> {
    if let Some(hex_key) = &config.crypto.institution_public_key {
        return public_key_from_hex(hex_key);
    }
    if let Some(path) = &config.crypto.secret_key_file {
        let sealed = load_sealed_key(Path::new(path))?;
        return public_key_from_hex(&sealed.public_key);
    }
    Err(ChainError::ConfigError(
        "crypto.institution_public_key or crypto.secret_key_file must be set".to_string(),
    ))
}

fn open_audit(config: &Config) -> Option<Arc<dyn NonceAudit>> {
    if !config.audit.enabled {
        return None;
    }
    let path = config.audit_path();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(dir = %parent.display(), error = %e, "Failed to create data dir");
            }
        }
    }
    match SqliteAudit::open(&path.to_string_lossy()) {
        Ok(db) => Some(Arc::new(db)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to open audit DB, falling back to in-memory audit");
            Some(Arc::new(InMemoryAudit::new()))
        }
    }
}
