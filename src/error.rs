//! Error types for PharmaChain

use std::fmt;
use thiserror::Error;

/// Which structural rule a block broke during chain validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    /// Stored hash differs from the hash recomputed over the block's fields.
    HashMismatch,
    /// `previous_hash` does not reference the predecessor's stored hash.
    BrokenLink,
    /// First block is not a well-formed genesis block.
    MissingGenesis,
    /// Hash lacks the leading zeros the difficulty demands.
    InsufficientWork,
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ValidationKind::HashMismatch => write!(f, "hash mismatch"),
            ValidationKind::BrokenLink => write!(f, "broken link"),
            ValidationKind::MissingGenesis => write!(f, "missing genesis"),
            ValidationKind::InsufficientWork => write!(f, "insufficient proof of work"),
        }
    }
}

/// First structural violation found while walking a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationFailure {
    pub index: usize,
    pub kind: ValidationKind,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} at block #{}", self.kind, self.index)
    }
}

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: String, reason: String },
    #[error("Chain validation failed: {0}")]
    Validation(ValidationFailure),
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
    #[error("Cryptographic error: {0}")]
    CryptoError(String),
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<ValidationFailure> for ChainError {
    fn from(failure: ValidationFailure) -> Self {
        ChainError::Validation(failure)
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
