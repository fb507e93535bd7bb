//! In-memory view of one log section.
//!
//! A [`LogSection`] holds the newest version of every live recovery
//! unit plus the changes not yet handed to the store. It is not
//! thread safe on its own; the coordinator wraps each one in a mutex
//! and only holds it long enough to stage a change or take a
//! snapshot.

use std::collections::BTreeMap;

use crate::errors::RecoveryLogError;
use crate::errors::Result;
use crate::model::*;

#[derive(Debug)]
pub struct LogSection {
    id: SectionId,
    /// Newest version of each live unit. Removed units are gone from
    /// here immediately, even before the discard is durable.
    live: BTreeMap<RecoveryUnitId, RecoveryRecord>,
    /// At most one pending change per unit; a later change to the
    /// same unit replaces the earlier one since only the newest
    /// version matters for recovery.
    dirty: BTreeMap<RecoveryUnitId, Change>,
    /// Highest sequence number handed out or seen in the store.
    high_water: SequenceNumber,
    /// Physical rows the store holds for this section, used to decide
    /// when a keypoint is worth it.
    stored_rows: u64,
    loaded: bool,
}

impl LogSection {
    pub fn new(id: SectionId) -> Self {
        Self {
            id,
            live: BTreeMap::new(),
            dirty: BTreeMap::new(),
            high_water: SequenceNumber::default(),
            stored_rows: 0,
            loaded: false,
        }
    }

    pub fn id(&self) -> SectionId {
        self.id
    }

    /// Insert or overwrite a unit and stage it for the next flush.
    pub fn put(&mut self, recovery_unit_id: RecoveryUnitId, payload: Vec<u8>) -> SequenceNumber {
        self.loaded = true;
        self.high_water = self.high_water.next();
        let record = RecoveryRecord {
            section_id: self.id,
            recovery_unit_id,
            sequence_number: self.high_water,
            payload,
        };
        tracing::trace!(
            "Staging upsert of unit {recovery_unit_id} in section {} at {:?} ({} bytes)",
            self.id,
            record.sequence_number,
            record.payload.len()
        );
        self.live.insert(recovery_unit_id, record.clone());
        self.dirty
            .insert(recovery_unit_id, Change::Upsert(record));
        self.high_water
    }

    /// Forget a unit. Returns [`None`] if the unit is not known, in
    /// which case nothing is staged.
    pub fn remove(&mut self, recovery_unit_id: RecoveryUnitId) -> Option<SequenceNumber> {
        self.loaded = true;
        self.live.remove(&recovery_unit_id)?;
        self.high_water = self.high_water.next();
        tracing::trace!(
            "Staging discard of unit {recovery_unit_id} in section {} at {:?}",
            self.id,
            self.high_water
        );
        self.dirty.insert(
            recovery_unit_id,
            Change::Discard(recovery_unit_id, self.high_water),
        );
        Some(self.high_water)
    }

    /// Take every pending change, leaving the dirty set empty.
    ///
    /// Changes staged after this call belong to the next snapshot.
    pub fn snapshot_for_flush(&mut self) -> Batch {
        let dirty = std::mem::take(&mut self.dirty);
        Batch {
            section_id: self.id,
            changes: dirty.into_values().collect(),
        }
    }

    /// Put a snapshot whose commit failed back into the dirty set.
    ///
    /// A unit that was changed again since the snapshot keeps its
    /// newer change.
    pub fn restage(&mut self, batch: Batch) {
        for change in batch.changes {
            self.dirty
                .entry(change.recovery_unit_id())
                .or_insert(change);
        }
    }

    /// Record that a snapshot is now durable.
    pub fn note_committed(&mut self, batch: &Batch) {
        self.stored_rows += batch.len() as u64;
    }

    /// Record that the store rewrote this section to only its live
    /// rows.
    pub fn note_keypointed(&mut self, stored_rows: u64) {
        self.stored_rows = stored_rows;
    }

    /// Bulk-populate from a replay.
    ///
    /// Must be the first thing that happens to a section. `high_water`
    /// is the highest sequence number the store holds for the section,
    /// including discarded units, so new writes always sort after
    /// anything durable.
    pub fn load_from_store(
        &mut self,
        records: impl IntoIterator<Item = RecoveryRecord>,
        high_water: SequenceNumber,
        stored_rows: u64,
    ) -> Result<()> {
        if self.loaded {
            return Err(RecoveryLogError::Store(format!(
                "section {} was already loaded or written to",
                self.id
            )));
        }
        for record in records {
            if record.section_id != self.id {
                return Err(RecoveryLogError::CorruptRecord(format!(
                    "record for section {} replayed into section {}",
                    record.section_id, self.id
                )));
            }
            self.high_water = self.high_water.max(record.sequence_number);
            match self.live.get(&record.recovery_unit_id) {
                Some(existing) if existing.sequence_number >= record.sequence_number => {}
                _ => {
                    self.live.insert(record.recovery_unit_id, record);
                }
            }
        }
        self.high_water = self.high_water.max(high_water);
        self.stored_rows = stored_rows;
        self.loaded = true;
        Ok(())
    }

    pub fn get(&self, recovery_unit_id: RecoveryUnitId) -> Option<&RecoveryRecord> {
        self.live.get(&recovery_unit_id)
    }

    pub fn live_units(&self) -> impl Iterator<Item = &RecoveryRecord> {
        self.live.values()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn pending_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Rows in the store that no longer back a live unit.
    pub fn dead_rows(&self) -> u64 {
        self.stored_rows.saturating_sub(self.live.len() as u64)
    }

    pub fn high_water(&self) -> SequenceNumber {
        self.high_water
    }

    /// Drop everything held in memory; used when ownership is lost.
    pub fn relinquish(&mut self) {
        self.live.clear();
        self.dirty.clear();
    }
}

#[test]
fn put_overwrites_and_dirty_keeps_newest() {
    let mut section = LogSection::new(SectionId(1));
    section.put(RecoveryUnitId(42), b"prepared".to_vec());
    section.put(RecoveryUnitId(42), b"committing".to_vec());

    assert_eq!(section.live_count(), 1);
    assert_eq!(
        section.get(RecoveryUnitId(42)).map(|r| r.payload.clone()),
        Some(b"committing".to_vec())
    );

    let batch = section.snapshot_for_flush();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.changes[0].sequence_number(), SequenceNumber(2));
    assert!(!section.is_dirty());
}

#[test]
fn remove_unknown_is_noop() {
    let mut section = LogSection::new(SectionId(1));
    assert_eq!(section.remove(RecoveryUnitId(9)), None);
    assert!(!section.is_dirty());
    assert_eq!(section.high_water(), SequenceNumber(0));
}

#[test]
fn remove_twice_stages_once() {
    let mut section = LogSection::new(SectionId(1));
    section.put(RecoveryUnitId(42), b"P".to_vec());
    section.snapshot_for_flush();

    assert_eq!(section.remove(RecoveryUnitId(42)), Some(SequenceNumber(2)));
    assert_eq!(section.remove(RecoveryUnitId(42)), None);

    let batch = section.snapshot_for_flush();
    assert_eq!(
        batch.changes,
        vec![Change::Discard(RecoveryUnitId(42), SequenceNumber(2))]
    );
}

#[test]
fn writes_after_snapshot_go_to_next_snapshot() {
    let mut section = LogSection::new(SectionId(1));
    section.put(RecoveryUnitId(1), b"a".to_vec());
    let first = section.snapshot_for_flush();
    section.put(RecoveryUnitId(2), b"b".to_vec());
    let second = section.snapshot_for_flush();

    assert_eq!(first.len(), 1);
    assert_eq!(first.changes[0].recovery_unit_id(), RecoveryUnitId(1));
    assert_eq!(second.len(), 1);
    assert_eq!(second.changes[0].recovery_unit_id(), RecoveryUnitId(2));
}

#[test]
fn restage_keeps_newer_change() {
    let mut section = LogSection::new(SectionId(1));
    section.put(RecoveryUnitId(1), b"old".to_vec());
    section.put(RecoveryUnitId(2), b"only".to_vec());
    let failed = section.snapshot_for_flush();

    section.put(RecoveryUnitId(1), b"new".to_vec());
    section.restage(failed);

    let retry = section.snapshot_for_flush();
    assert_eq!(retry.len(), 2);
    let unit1 = retry
        .upserts()
        .find(|r| r.recovery_unit_id == RecoveryUnitId(1))
        .unwrap();
    assert_eq!(unit1.payload, b"new".to_vec());
    assert_eq!(unit1.sequence_number, SequenceNumber(3));
}

#[test]
fn load_sets_high_water_past_discards() {
    let mut section = LogSection::new(SectionId(1));
    let record = RecoveryRecord {
        section_id: SectionId(1),
        recovery_unit_id: RecoveryUnitId(5),
        sequence_number: SequenceNumber(3),
        payload: b"P".to_vec(),
    };
    section
        .load_from_store(vec![record], SequenceNumber(10), 4)
        .unwrap();

    assert_eq!(section.live_count(), 1);
    assert_eq!(section.dead_rows(), 3);
    assert_eq!(
        section.put(RecoveryUnitId(6), b"Q".to_vec()),
        SequenceNumber(11)
    );
}

#[test]
fn load_twice_is_refused() {
    let mut section = LogSection::new(SectionId(1));
    section
        .load_from_store(Vec::new(), SequenceNumber(0), 0)
        .unwrap();
    assert!(section
        .load_from_store(Vec::new(), SequenceNumber(0), 0)
        .is_err());
}

#[test]
fn load_rejects_foreign_section() {
    let mut section = LogSection::new(SectionId(1));
    let record = RecoveryRecord {
        section_id: SectionId(2),
        recovery_unit_id: RecoveryUnitId(5),
        sequence_number: SequenceNumber(3),
        payload: Vec::new(),
    };
    assert!(matches!(
        section.load_from_store(vec![record], SequenceNumber(3), 1),
        Err(RecoveryLogError::CorruptRecord(..))
    ));
}
