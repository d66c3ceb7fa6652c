//! Proof-of-work search over the block's nonce.
//!
//! A block is mined once the first `difficulty` hex characters of its content
//! hash are all `'0'`. There is no iteration cap: the search runs until it
//! succeeds or, for the cancellable variant, until the node asks it to stop.

use crate::blockchain::{meets_difficulty, Block};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Iterations between checks of the cancellation flag.
const CANCEL_POLL_INTERVAL: u64 = 4096;

/// Cooperative stop signal shared between the node and in-flight mining.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiningOutcome {
    Mined { nonce: u64, attempts: u64 },
    Cancelled { attempts: u64 },
}

/// Mine `block` in place. Blocks until a qualifying nonce is found.
pub fn mine_block(block: &mut Block, difficulty: usize) {
    let never = CancelToken::new();
    // An untriggered token never yields Cancelled.
    let _ = mine_block_with_cancel(block, difficulty, &never);
}

/// Mine `block` in place, polling `cancel` between batches of attempts.
pub fn mine_block_with_cancel(block: &mut Block, difficulty: usize, cancel: &CancelToken) -> MiningOutcome {
    let started = Instant::now();

    // previous_hash ++ timestamp is a fixed prefix and wrapped_key ++ payloads a
    // fixed suffix; only the nonce in between changes per attempt.
    let mut prefix = Sha256::new();
    prefix.update(block.previous_hash.as_bytes());
    prefix.update(block.timestamp.to_string().as_bytes());
    let mut suffix = Vec::with_capacity(
        block.wrapped_key.len() + block.encrypted_payloads.iter().map(String::len).sum::<usize>(),
    );
    suffix.extend_from_slice(block.wrapped_key.as_bytes());
    for payload in &block.encrypted_payloads {
        suffix.extend_from_slice(payload.as_bytes());
    }

    let hash_with = |nonce: u64| {
        let mut hasher = prefix.clone();
        hasher.update(nonce.to_string().as_bytes());
        hasher.update(&suffix);
        hex::encode(hasher.finalize())
    };

    // Bring the stored hash in line with the sealed fields before testing it.
    block.hash = hash_with(block.nonce);

    let mut attempts = 0u64;
    while !meets_difficulty(&block.hash, difficulty) {
        if attempts % CANCEL_POLL_INTERVAL == 0 && cancel.is_cancelled() {
            debug!(attempts, "Mining cancelled");
            return MiningOutcome::Cancelled { attempts };
        }
        block.nonce = block.nonce.wrapping_add(1);
        block.hash = hash_with(block.nonce);
        attempts += 1;
    }

    info!(
        hash = %block.short_hash(),
        nonce = block.nonce,
        attempts,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Block mined"
    );
    MiningOutcome::Mined {
        nonce: block.nonce,
        attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mined_hash_meets_difficulty() {
        for difficulty in 0..=4 {
            let mut block = Block::with_timestamp("prev", 1_000 + difficulty as u64);
            block.seal(vec!["payload".to_string()], "key".to_string());
            mine_block(&mut block, difficulty);

            assert!(block.hash[..difficulty].chars().all(|c| c == '0'));
            assert!(block.validate_self());
        }
    }

    #[test]
    fn test_difficulty_two_prefix() {
        let mut block = Block::new("0");
        block.mine(2);
        assert!(block.hash.starts_with("00"));
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancelToken::new();
        cancel.cancel();

        let mut block = Block::with_timestamp("prev", 7);
        // Difficulty this high will not be met by the initial nonce.
        let outcome = block.mine_with_cancel(40, &cancel);
        assert_eq!(outcome, MiningOutcome::Cancelled { attempts: 0 });
        assert!(block.validate_self());
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        let handle = std::thread::spawn(move || {
            let mut block = Block::with_timestamp("prev", 8);
            block.mine_with_cancel(40, &worker_cancel)
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        cancel.cancel();
        let outcome = handle.join().unwrap();
        assert!(matches!(outcome, MiningOutcome::Cancelled { .. }));
    }
}
