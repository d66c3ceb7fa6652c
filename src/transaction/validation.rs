/// Validation logic for transaction records separated from type definitions
use crate::error::ChainError;
use crate::transaction::types::TransactionRecord;

/// Maximum length of any free-text field on a record.
pub const MAX_FIELD_LENGTH: usize = 256;

impl TransactionRecord {
    /// Reject records a pharmacy could not have meaningfully submitted.
    pub fn validate(&self) -> Result<(), ChainError> {
        let fields = [
            ("pharmacy_id", self.pharmacy_id.as_str()),
            ("product name", self.product.name()),
            ("product code", self.product.code()),
            ("actor", self.actor.as_str()),
        ];
        for (label, value) in fields {
            if value.trim().is_empty() {
                return Err(ChainError::InvalidTransaction(format!("{} must not be empty", label)));
            }
        }

        for (label, value) in fields.iter().copied().chain([("lot", self.lot.as_str()), ("expiry", self.expiry.as_str())]) {
            if value.len() > MAX_FIELD_LENGTH {
                return Err(ChainError::InvalidTransaction(format!(
                    "{} too long: {} bytes (max: {})",
                    label,
                    value.len(),
                    MAX_FIELD_LENGTH
                )));
            }
        }

        if self.product.quantity() == 0 {
            return Err(ChainError::InvalidTransaction(
                "Quantity must be greater than zero".to_string(),
            ));
        }

        if self.hash != self.calculate_hash() {
            return Err(ChainError::InvalidTransaction(format!(
                "Record hash mismatch for {}",
                self.hash
            )));
        }
        Ok(())
    }
}
