//! PharmaChain - a permissioned proof-of-work ledger for pharmacy inventory
//!
//! Pharmacies record inventory movements; each batch is encrypted for the
//! supervising institution, sealed into a block, mined and replicated to a
//! static set of peers over a line-oriented TCP protocol.
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Blockchain
//! - [`blockchain`] - Blocks, the ledger and structural validation
//! - [`transaction`] - Inventory movement records and stock tallies
//!
//! ## Consensus
//! - [`miner`] - Proof-of-work mining with cooperative cancellation
//!
//! ## Cryptography
//! - [`crypto`] - Institution key pairs (secp256k1) and the password-protected keystore
//! - [`codec`] - Per-block hybrid encryption envelope
//!
//! ## State Management
//! - [`persistence`] - Nonce audit store (SQLite)
//!
//! ## Networking
//! - [`protocol`] - Wire format of the replication protocol
//! - [`network`] - Peer registry, replication server and client
//! - [`sync`] - Longest-valid-chain synchronization
//!
//! ## Integration
//! - [`node`] - Process-scoped node context
//! - `api` - Read-only HTTP monitor (feature `api`)
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Blockchain
// ============================================================================
pub mod blockchain;
pub mod transaction;

// ============================================================================
// Consensus & Mining
// ============================================================================
pub mod miner;

// ============================================================================
// Cryptography & Security
// ============================================================================
pub mod codec;
pub mod crypto;

// ============================================================================
// State Management
// ============================================================================
pub mod persistence;

// ============================================================================
// Networking
// ============================================================================
pub mod network;
pub mod protocol;
pub mod sync;

// ============================================================================
// Integration
// ============================================================================
#[cfg(feature = "api")]
pub mod api;
pub mod node;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
