use crate::blockchain::core::validation::validate_blocks;
use crate::error::{ChainError, ValidationFailure};
use crate::miner::{mine_block, mine_block_with_cancel, CancelToken, MiningOutcome};
use crate::transaction::TransactionRecord;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

/// `previous_hash` carried by every genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Fixed creation time of the genesis block, so that nodes mining genesis at
/// the same difficulty agree on its hash.
pub const GENESIS_TIMESTAMP: u64 = 1672531200000;

/// Hex SHA-256 over the exact, delimiter-free concatenation
/// `previous_hash ++ timestamp ++ nonce ++ wrapped_key ++ payloads...`.
pub fn calculate_content_hash(
    previous_hash: &str,
    timestamp: u64,
    nonce: u64,
    wrapped_key: &str,
    encrypted_payloads: &[String],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    hasher.update(nonce.to_string().as_bytes());
    hasher.update(wrapped_key.as_bytes());
    for payload in encrypted_payloads {
        hasher.update(payload.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub index: u64,
    pub previous_hash: String,
    pub timestamp: u64,
    pub nonce: u64,
    pub hash: String,
    pub wrapped_key: String,
    pub encrypted_payloads: Vec<String>,
    /// Cleartext records awaiting sealing. Never hashed, never sent.
    #[serde(skip)]
    pending: Vec<TransactionRecord>,
    #[serde(skip)]
    sealed: bool,
}

impl Block {
    /// Create a pending block on top of `previous_hash`, stamped with the current time.
    pub fn new(previous_hash: impl Into<String>) -> Self {
        let timestamp = chrono::Utc::now().timestamp_millis() as u64;
        Self::with_timestamp(previous_hash, timestamp)
    }

    pub fn with_timestamp(previous_hash: impl Into<String>, timestamp: u64) -> Self {
        let mut block = Block {
            index: 0,
            previous_hash: previous_hash.into(),
            timestamp,
            nonce: 0,
            hash: String::new(),
            wrapped_key: String::new(),
            encrypted_payloads: Vec::new(),
            pending: Vec::new(),
            sealed: false,
        };
        block.hash = block.calculate_hash();
        block
    }

    /// Rebuild a block with exactly the given fields. The hash is taken as-is.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        index: u64,
        hash: String,
        previous_hash: String,
        nonce: u64,
        timestamp: u64,
        wrapped_key: String,
        encrypted_payloads: Vec<String>,
    ) -> Self {
        Block {
            index,
            previous_hash,
            timestamp,
            nonce,
            hash,
            wrapped_key,
            encrypted_payloads,
            pending: Vec::new(),
            sealed: true,
        }
    }

    pub fn calculate_hash(&self) -> String {
        calculate_content_hash(
            &self.previous_hash,
            self.timestamp,
            self.nonce,
            &self.wrapped_key,
            &self.encrypted_payloads,
        )
    }

    /// True when the stored hash matches the fields it claims to cover.
    pub fn validate_self(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    pub fn meets_difficulty(&self, difficulty: usize) -> bool {
        meets_difficulty(&self.hash, difficulty)
    }

    pub fn append_transaction(&mut self, tx: TransactionRecord) -> Result<(), ChainError> {
        if self.sealed {
            return Err(ChainError::InvalidBlock(
                "Cannot add transactions to a sealed block".to_string(),
            ));
        }
        self.pending.push(tx);
        Ok(())
    }

    pub fn pending_transactions(&self) -> &[TransactionRecord] {
        &self.pending
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Store the encrypted payload and wrapped key. The hash is recomputed by
    /// `mine`, not here.
    pub fn seal(&mut self, encrypted_payloads: Vec<String>, wrapped_key: String) {
        self.encrypted_payloads = encrypted_payloads;
        self.wrapped_key = wrapped_key;
        self.pending.clear();
        self.sealed = true;
    }

    /// Search nonces until the hash has `difficulty` leading hex zeros.
    /// Blocks the caller until it succeeds.
    pub fn mine(&mut self, difficulty: usize) {
        mine_block(self, difficulty);
    }

    pub fn mine_with_cancel(&mut self, difficulty: usize, cancel: &CancelToken) -> MiningOutcome {
        mine_block_with_cancel(self, difficulty, cancel)
    }

    pub fn short_hash(&self) -> &str {
        short_hash(&self.hash)
    }
}

pub fn meets_difficulty(hash: &str, difficulty: usize) -> bool {
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

pub fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

/// Append-only sequence of blocks anchored by a mined genesis block.
#[derive(Debug, Clone)]
pub struct Ledger {
    pub blocks: Vec<Block>,
    difficulty: usize,
}

impl Ledger {
    /// Build the chain and mine its genesis block. Blocks until genesis is found.
    pub fn new(difficulty: usize) -> Self {
        Self::with_genesis_timestamp(difficulty, GENESIS_TIMESTAMP)
    }

    pub fn with_genesis_timestamp(difficulty: usize, genesis_timestamp: u64) -> Self {
        let genesis = Self::create_genesis_block(difficulty, genesis_timestamp);
        info!(hash = %genesis.hash, difficulty, "Genesis block created");
        Ledger {
            blocks: vec![genesis],
            difficulty,
        }
    }

    fn create_genesis_block(difficulty: usize, timestamp: u64) -> Block {
        let mut genesis = Block::with_timestamp(GENESIS_PREVIOUS_HASH, timestamp);
        genesis.index = 0;
        genesis.sealed = true;
        genesis.mine(difficulty);
        genesis
    }

    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn head(&self) -> &Block {
        // Genesis is created in the constructor and replace_chain refuses empty chains.
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn head_hash(&self) -> String {
        self.head().hash.clone()
    }

    pub fn get(&self, index: usize) -> Option<&Block> {
        self.blocks.get(index)
    }

    /// Stamp `index` and `previous_hash` from the current head and push.
    ///
    /// Proof-of-work is not re-checked here; whoever hands a block to the
    /// ledger decides whether to trust it.
    pub fn append(&mut self, mut block: Block) -> u64 {
        block.index = self.blocks.len() as u64;
        block.previous_hash = self.head_hash();
        let index = block.index;
        info!(index, hash = %block.short_hash(), total = self.blocks.len() + 1, "Block appended");
        self.blocks.push(block);
        index
    }

    /// Store a block received from a peer exactly as it was sent: no index or
    /// link stamping, no hash recompute, no predecessor check.
    pub fn accept_replica(&mut self, block: Block) {
        info!(index = block.index, hash = %block.short_hash(), "Replicated block stored");
        self.blocks.push(block);
    }

    /// Walk the chain and report the first broken block, if any.
    pub fn validate(&self) -> Result<(), ValidationFailure> {
        validate_blocks(&self.blocks)
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Swap in `new_chain` wholesale. The caller validates it beforehand.
    pub fn replace_chain(&mut self, new_chain: Vec<Block>) -> Result<(), ChainError> {
        if new_chain.is_empty() {
            return Err(ChainError::InvalidBlock(
                "Replacement chain must contain a genesis block".to_string(),
            ));
        }
        self.blocks = new_chain;
        info!(total = self.blocks.len(), "Chain replaced");
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<Block> {
        self.blocks.clone()
    }
}
