use crate::blockchain::core::chain::{Block, GENESIS_PREVIOUS_HASH};
use crate::error::{ValidationFailure, ValidationKind};
use tracing::warn;

/// Check every block after genesis: its stored hash must match its fields and
/// its `previous_hash` must equal the predecessor's stored hash. Stops at the
/// first violation.
pub fn validate_blocks(blocks: &[Block]) -> Result<(), ValidationFailure> {
    for (i, pair) in blocks.windows(2).enumerate() {
        let (previous, current) = (&pair[0], &pair[1]);
        let index = i + 1;

        if !current.validate_self() {
            warn!(index, "Invalid hash in block");
            return Err(ValidationFailure {
                index,
                kind: ValidationKind::HashMismatch,
            });
        }

        if current.previous_hash != previous.hash {
            warn!(index, "Broken link in block");
            return Err(ValidationFailure {
                index,
                kind: ValidationKind::BrokenLink,
            });
        }
    }
    Ok(())
}

/// Stricter check for chains that arrive from elsewhere: a proper genesis, the
/// structural rules above, and proof-of-work on every block.
pub fn validate_foreign_chain(blocks: &[Block], difficulty: usize) -> Result<(), ValidationFailure> {
    let genesis = blocks.first().ok_or(ValidationFailure {
        index: 0,
        kind: ValidationKind::MissingGenesis,
    })?;
    if genesis.previous_hash != GENESIS_PREVIOUS_HASH || !genesis.validate_self() {
        return Err(ValidationFailure {
            index: 0,
            kind: ValidationKind::MissingGenesis,
        });
    }

    validate_blocks(blocks)?;

    if let Some(index) = blocks.iter().position(|b| !b.meets_difficulty(difficulty)) {
        return Err(ValidationFailure {
            index,
            kind: ValidationKind::InsufficientWork,
        });
    }
    Ok(())
}
