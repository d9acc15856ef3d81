//! Audit journal of committed execution units.
//!
//! The [`ChangeJournal`] records the [`UnitReceipt`] of every committed unit.
//! Each receipt carries the unit's sender, execution path, sequence position
//! and the ordered list of [`Change`]s it made; aborted units produce no
//! receipt and therefore never appear here.
//!
//! # Query API
//!
//! - **Entity**: [`ChangeJournal::changes_for_entity`]
//! - **Attribute key**: [`ChangeJournal::changes_for_key`]
//! - **Sender**: [`ChangeJournal::changes_by_sender`]
//! - **Total order**: [`ChangeJournal::sequenced`]
//!
//! # Example
//!
//! ```
//! use tessera_journal::journal::ChangeJournal;
//! use tessera_store::prelude::*;
//!
//! let (mut store, _cap) = Store::open(StoreConfig::default()).unwrap();
//! store.register_attribute::<u32>("u32").unwrap();
//!
//! let committed = store
//!     .execute(UnitContext::independent(Holder(1), 0), |unit| {
//!         let e = unit.create_entity("counter");
//!         unit.add(e, "value", 0u32)?;
//!         Ok(e)
//!     })
//!     .unwrap();
//!
//! let mut journal = ChangeJournal::new();
//! journal.record(committed.receipt.clone()).unwrap();
//!
//! assert_eq!(journal.len(), 1);
//! assert_eq!(journal.changes_for_entity(committed.value).count(), 2);
//! ```

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use tessera_store::attribute::AttributeKey;
use tessera_store::entity::{EntityId, Holder};
use tessera_store::receipt::{Change, UnitReceipt};

use crate::JournalError;

// ---------------------------------------------------------------------------
// JournalEntry
// ---------------------------------------------------------------------------

/// One recorded change together with the unit that made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalEntry<'a> {
    pub unit_id: u64,
    pub sender: Holder,
    pub sequence: Option<u64>,
    pub timestamp_ms: u64,
    /// Position of the change within its unit.
    pub index: usize,
    pub change: &'a Change,
}

// ---------------------------------------------------------------------------
// ChangeJournal
// ---------------------------------------------------------------------------

/// Receipts of committed units, in the order they were recorded.
///
/// Sequenced receipts must arrive in strictly increasing sequence order, and
/// no unit may be recorded twice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeJournal {
    receipts: Vec<UnitReceipt>,
    #[serde(skip)]
    unit_ids: HashSet<u64>,
    last_sequence: Option<u64>,
}

impl ChangeJournal {
    /// An empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the receipt of a committed unit.
    pub fn record(&mut self, receipt: UnitReceipt) -> Result<(), JournalError> {
        if self.unit_ids.contains(&receipt.unit_id) {
            warn!(unit = receipt.unit_id, "unit recorded twice");
            return Err(JournalError::DuplicateUnit {
                unit_id: receipt.unit_id,
            });
        }
        if let (Some(previous), Some(sequence)) = (self.last_sequence, receipt.sequence) {
            if sequence <= previous {
                warn!(unit = receipt.unit_id, sequence, previous, "sequenced receipt out of order");
                return Err(JournalError::OutOfOrder { previous, sequence });
            }
        }

        trace!(
            unit = receipt.unit_id,
            sequence = ?receipt.sequence,
            changes = receipt.changes.len(),
            "receipt recorded"
        );
        if receipt.sequence.is_some() {
            self.last_sequence = receipt.sequence;
        }
        self.unit_ids.insert(receipt.unit_id);
        self.receipts.push(receipt);
        Ok(())
    }

    /// Forget every receipt.
    pub fn clear(&mut self) {
        self.receipts.clear();
        self.unit_ids.clear();
        self.last_sequence = None;
    }

    /// Number of recorded receipts.
    pub fn len(&self) -> usize {
        self.receipts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receipts.is_empty()
    }

    /// Total number of changes across all receipts.
    pub fn change_count(&self) -> usize {
        self.receipts.iter().map(|r| r.changes.len()).sum()
    }

    /// Recorded receipts in recording order.
    pub fn receipts(&self) -> &[UnitReceipt] {
        &self.receipts
    }

    /// Every recorded change in recording order.
    pub fn entries(&self) -> impl Iterator<Item = JournalEntry<'_>> {
        self.receipts.iter().flat_map(|receipt| {
            receipt
                .changes
                .iter()
                .enumerate()
                .map(move |(index, change)| JournalEntry {
                    unit_id: receipt.unit_id,
                    sender: receipt.sender,
                    sequence: receipt.sequence,
                    timestamp_ms: receipt.timestamp_ms,
                    index,
                    change,
                })
        })
    }

    /// Every change that touched `entity`.
    pub fn changes_for_entity(&self, entity: EntityId) -> impl Iterator<Item = JournalEntry<'_>> {
        self.entries()
            .filter(move |entry| entry.change.entity() == entity)
    }

    /// Attribute-level changes to `key` on `entity`.
    pub fn changes_for_key<'a>(
        &'a self,
        entity: EntityId,
        key: &'a AttributeKey,
    ) -> impl Iterator<Item = JournalEntry<'a>> {
        self.changes_for_entity(entity)
            .filter(move |entry| entry.change.key() == Some(key))
    }

    /// Changes made by units `sender` ran.
    pub fn changes_by_sender(&self, sender: Holder) -> impl Iterator<Item = JournalEntry<'_>> {
        self.entries().filter(move |entry| entry.sender == sender)
    }

    /// Receipts of sequenced units, in sequence order.
    pub fn sequenced(&self) -> impl Iterator<Item = &UnitReceipt> {
        self.receipts.iter().filter(|r| r.sequence.is_some())
    }

    /// Every entity touched by a recorded change, ascending.
    pub fn touched_entities(&self) -> BTreeSet<EntityId> {
        self.entries().map(|entry| entry.change.entity()).collect()
    }

    /// Blake3 hex digest over the canonical JSON of every receipt.
    pub fn digest(&self) -> Result<String, JournalError> {
        let bytes = serde_json::to_vec(&self.receipts)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }

    /// JSON encoding of the journal.
    pub fn to_json(&self) -> Result<String, JournalError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Load a journal, re-checking the ordering rules of [`record`](Self::record).
    pub fn from_json(json: &str) -> Result<Self, JournalError> {
        let stored: ChangeJournal = serde_json::from_str(json)?;
        let mut journal = ChangeJournal::new();
        for receipt in stored.receipts {
            journal.record(receipt)?;
        }
        Ok(journal)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
