/// Transaction types for PharmaChain
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Direction of an inventory movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MovementKind {
    In,
    Out,
    Adjust,
}

impl MovementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementKind::In => "IN",
            MovementKind::Out => "OUT",
            MovementKind::Adjust => "ADJUST",
        }
    }
}

impl fmt::Display for MovementKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MovementKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IN" => Ok(MovementKind::In),
            "OUT" => Ok(MovementKind::Out),
            "ADJUST" => Ok(MovementKind::Adjust),
            other => Err(format!("unknown movement kind '{}'", other)),
        }
    }
}

/// A stocked item. Items whose category the node does not know are carried as
/// `Unknown` rather than being forced into a catalogue type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum Product {
    Medication {
        name: String,
        code: String,
        quantity: u32,
        dosage: String,
    },
    Unknown {
        name: String,
        code: String,
        quantity: u32,
    },
}

impl Product {
    pub fn medication(name: impl Into<String>, code: impl Into<String>, quantity: u32, dosage: impl Into<String>) -> Self {
        Product::Medication {
            name: name.into(),
            code: code.into(),
            quantity,
            dosage: dosage.into(),
        }
    }

    pub fn unknown(name: impl Into<String>, code: impl Into<String>, quantity: u32) -> Self {
        Product::Unknown {
            name: name.into(),
            code: code.into(),
            quantity,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Product::Medication { name, .. } | Product::Unknown { name, .. } => name,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Product::Medication { code, .. } | Product::Unknown { code, .. } => code,
        }
    }

    pub fn quantity(&self) -> u32 {
        match self {
            Product::Medication { quantity, .. } | Product::Unknown { quantity, .. } => *quantity,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            Product::Medication { .. } => "medication",
            Product::Unknown { .. } => "unknown",
        }
    }
}

/// An immutable inventory movement recorded by a pharmacy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub pharmacy_id: String,
    pub product: Product,
    pub kind: MovementKind,
    pub actor: String,
    pub lot: String,
    pub expiry: String,
    pub created_at: u64,
    pub hash: String,
}

impl TransactionRecord {
    pub fn new(
        pharmacy_id: impl Into<String>,
        product: Product,
        kind: MovementKind,
        actor: impl Into<String>,
        lot: impl Into<String>,
        expiry: impl Into<String>,
    ) -> Self {
        let created_at = chrono::Utc::now().timestamp_millis() as u64;
        let mut record = TransactionRecord {
            pharmacy_id: pharmacy_id.into(),
            product,
            kind,
            actor: actor.into(),
            lot: lot.into(),
            expiry: expiry.into(),
            created_at,
            hash: String::new(),
        };
        record.hash = record.calculate_hash();
        record
    }

    pub fn calculate_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.pharmacy_id.as_bytes());
        hasher.update(self.product.name().as_bytes());
        hasher.update(self.product.code().as_bytes());
        hasher.update(self.product.quantity().to_string().as_bytes());
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update(self.actor.as_bytes());
        hasher.update(self.lot.as_bytes());
        hasher.update(self.expiry.as_bytes());
        hasher.update(self.created_at.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Signed effect of this movement on stock. Only inbound movements add;
    /// outbound and adjustment movements both draw stock down.
    pub fn stock_delta(&self) -> i64 {
        let quantity = self.product.quantity() as i64;
        match self.kind {
            MovementKind::In => quantity,
            MovementKind::Out | MovementKind::Adjust => -quantity,
        }
    }
}

impl fmt::Display for TransactionRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let sign = match self.kind {
            MovementKind::In => "+",
            MovementKind::Out => "-",
            MovementKind::Adjust => "",
        };
        write!(
            f,
            "ID: {}... | {} {}{} of {} ({})",
            self.hash.get(..8).unwrap_or(&self.hash),
            self.kind,
            sign,
            self.product.quantity(),
            self.product.name(),
            self.product.code()
        )
    }
}
