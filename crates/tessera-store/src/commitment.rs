//! Commitment tokens for multi-step mutations.
//!
//! [`Unit::begin`](crate::unit::Unit::begin) hands out a [`Commitment`] that
//! has no `Clone`, `Copy` or `Default` and can only be consumed by
//! [`Unit::complete`](crate::unit::Unit::complete). The unit keeps a ledger of
//! open commitments; if any is still open when the unit ends, the unit aborts
//! with [`StoreError::ProtocolViolation`] and every effect is discarded.

use std::collections::BTreeMap;
use std::fmt;

use crate::StoreError;

// ---------------------------------------------------------------------------
// Commitment
// ---------------------------------------------------------------------------

/// A single-use token that must be completed in the unit that issued it.
#[must_use = "a commitment must be passed to `Unit::complete` before the unit ends"]
pub struct Commitment {
    unit: u64,
    index: u64,
    op: String,
}

impl Commitment {
    /// The operation label given to `begin`.
    pub fn op(&self) -> &str {
        &self.op
    }
}

impl fmt::Debug for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Commitment(unit {}, #{} {:?})", self.unit, self.index, self.op)
    }
}

// ---------------------------------------------------------------------------
// CommitmentLedger
// ---------------------------------------------------------------------------

/// Open commitments of one unit.
#[derive(Debug, Default)]
pub(crate) struct CommitmentLedger {
    open: BTreeMap<u64, String>,
    next: u64,
}

impl CommitmentLedger {
    pub(crate) fn begin(&mut self, unit: u64, op: &str) -> Commitment {
        let index = self.next;
        self.next += 1;
        self.open.insert(index, op.to_owned());
        Commitment {
            unit,
            index,
            op: op.to_owned(),
        }
    }

    /// Consume `token`, which must be open in unit `unit`.
    pub(crate) fn settle(&mut self, unit: u64, token: Commitment) -> Result<(), StoreError> {
        let Commitment {
            unit: issued_by,
            index,
            op,
        } = token;
        if issued_by != unit {
            return Err(StoreError::ProtocolViolation {
                detail: format!("commitment '{op}' from unit {issued_by} completed in unit {unit}"),
            });
        }
        match self.open.remove(&index) {
            Some(_) => Ok(()),
            None => Err(StoreError::ProtocolViolation {
                detail: format!("commitment '{op}' is not open"),
            }),
        }
    }

    pub(crate) fn outstanding(&self) -> Vec<&str> {
        self.open.values().map(|op| op.as_str()).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
