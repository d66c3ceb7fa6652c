//! Nonce audit store for PharmaChain
//!
//! Every locally mined block's winning nonce is recorded outside the chain so
//! an auditor can later recompute block hashes independently. The store is
//! advisory: chain acceptance never consults it.

use crate::blockchain::{calculate_content_hash, Block};
use crate::error::ChainError;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

/// Abstraction for audit backends.
pub trait NonceAudit: Send + Sync {
    /// Record (or overwrite) the nonce mined for block `index`.
    fn store_nonce(&self, index: u64, hash: &str, nonce: u64) -> Result<(), ChainError>;
    fn fetch_nonce(&self, index: u64) -> Result<Option<u64>, ChainError>;
}

fn poisoned() -> ChainError {
    ChainError::DatabaseError("Mutex poisoned".to_string())
}

pub struct SqliteAudit {
    conn: Mutex<Connection>,
}

impl SqliteAudit {
    pub fn open(path: &str) -> Result<Self, ChainError> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open audit database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS block_registry (
                idx INTEGER PRIMARY KEY,
                hash TEXT NOT NULL,
                nonce INTEGER NOT NULL,
                mined_at INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create block_registry table: {}", e)))?;

        Ok(SqliteAudit { conn: Mutex::new(conn) })
    }

    pub fn in_memory() -> Result<Self, ChainError> {
        Self::open(":memory:")
    }

    /// Stored hash for block `index`, if any.
    pub fn fetch_hash(&self, index: u64) -> Result<Option<String>, ChainError> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        conn.query_row(
            "SELECT hash FROM block_registry WHERE idx = ?1",
            params![index as i64],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(|e| ChainError::DatabaseError(format!("Failed to read hash: {}", e)))
    }

    pub fn count(&self) -> Result<u64, ChainError> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        conn.query_row("SELECT COUNT(*) FROM block_registry", [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to count entries: {}", e)))
    }
}

impl NonceAudit for SqliteAudit {
    fn store_nonce(&self, index: u64, hash: &str, nonce: u64) -> Result<(), ChainError> {
        let mined_at = chrono::Utc::now().timestamp_millis();
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        // SQLite integers are signed; the nonce is stored bit-for-bit.
        conn.execute(
            "INSERT INTO block_registry (idx, hash, nonce, mined_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(idx) DO UPDATE SET hash = excluded.hash, nonce = excluded.nonce, mined_at = excluded.mined_at",
            params![index as i64, hash, nonce as i64, mined_at],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to store nonce: {}", e)))?;
        Ok(())
    }

    fn fetch_nonce(&self, index: u64) -> Result<Option<u64>, ChainError> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        let nonce = conn
            .query_row(
                "SELECT nonce FROM block_registry WHERE idx = ?1",
                params![index as i64],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to fetch nonce: {}", e)))?;
        Ok(nonce.map(|n| n as u64))
    }
}

/// Simple in-memory audit store useful for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryAudit {
    entries: Mutex<HashMap<u64, (String, u64)>>,
}

impl InMemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NonceAudit for InMemoryAudit {
    fn store_nonce(&self, index: u64, hash: &str, nonce: u64) -> Result<(), ChainError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        entries.insert(index, (hash.to_string(), nonce));
        Ok(())
    }

    fn fetch_nonce(&self, index: u64) -> Result<Option<u64>, ChainError> {
        let entries = self.entries.lock().map_err(|_| poisoned())?;
        Ok(entries.get(&index).map(|(_, nonce)| *nonce))
    }
}

/// First discrepancy between a chain and its audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditFinding {
    MissingNonce { index: u64 },
    /// Recomputing with the audited nonce does not reproduce the block's hash.
    HashMismatch { index: u64, audited_nonce: u64 },
}

impl fmt::Display for AuditFinding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuditFinding::MissingNonce { index } => write!(f, "no audited nonce for block #{}", index),
            AuditFinding::HashMismatch { index, audited_nonce } => write!(
                f,
                "block #{} does not hash to its stored value with audited nonce {}",
                index, audited_nonce
            ),
        }
    }
}

/// Recompute every non-genesis block's hash with the audited nonce.
pub fn cross_check(blocks: &[Block], audit: &dyn NonceAudit) -> Result<Option<AuditFinding>, ChainError> {
    for block in blocks.iter().skip(1) {
        let Some(nonce) = audit.fetch_nonce(block.index)? else {
            return Ok(Some(AuditFinding::MissingNonce { index: block.index }));
        };
        let recomputed = calculate_content_hash(
            &block.previous_hash,
            block.timestamp,
            nonce,
            &block.wrapped_key,
            &block.encrypted_payloads,
        );
        if recomputed != block.hash {
            return Ok(Some(AuditFinding::HashMismatch {
                index: block.index,
                audited_nonce: nonce,
            }));
        }
    }
    Ok(None)
}
