// Thin re-export module: implementation is in `blockchain/core.rs` so block
// structure, chain management and validation live in separate files.

pub mod core;
pub use core::*;
