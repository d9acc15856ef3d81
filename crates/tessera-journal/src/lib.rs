//! Tessera Journal - audit trail of committed execution units.
//!
//! # Modules
//!
//! - [`journal`]: Change journal that records the receipt of every committed
//!   unit (sender, execution path, sequence position and ordered changes) and
//!   answers queries by entity, attribute key and sender.

#![deny(unsafe_code)]

pub mod journal;

/// Errors produced by the change journal.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// The same unit id was recorded twice.
    #[error("unit {unit_id} is already recorded")]
    DuplicateUnit { unit_id: u64 },

    /// A sequenced receipt arrived at or below the last recorded sequence.
    #[error("sequence {sequence} recorded after {previous}")]
    OutOfOrder { previous: u64, sequence: u64 },

    #[error("journal serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
