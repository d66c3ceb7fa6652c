//! Transaction module split into types and validation for better modularity

pub mod types;
pub mod validation;

pub use types::*;

use crate::error::ChainError;
use std::collections::BTreeMap;

/// Serialize a batch into the cleartext JSON array that gets encrypted into a block.
pub fn batch_to_json(records: &[TransactionRecord]) -> Result<String, ChainError> {
    Ok(serde_json::to_string(records)?)
}

pub fn batch_from_json(json: &str) -> Result<Vec<TransactionRecord>, ChainError> {
    Ok(serde_json::from_str(json)?)
}

/// Current stock of one product at one pharmacy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockLine {
    pub code: String,
    pub name: String,
    pub quantity: i64,
}

/// Fold movements into per-product stock for `pharmacy_id`, keyed by product code.
pub fn tally<'a, I>(records: I, pharmacy_id: &str) -> BTreeMap<String, StockLine>
where
    I: IntoIterator<Item = &'a TransactionRecord>,
{
    let mut stock: BTreeMap<String, StockLine> = BTreeMap::new();
    for record in records.into_iter().filter(|r| r.pharmacy_id == pharmacy_id) {
        let line = stock
            .entry(record.product.code().to_string())
            .or_insert_with(|| StockLine {
                code: record.product.code().to_string(),
                name: record.product.name().to_string(),
                quantity: 0,
            });
        line.quantity += record.stock_delta();
    }
    stock
}
