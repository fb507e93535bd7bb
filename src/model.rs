//! Identifiers and records shared by every layer of the log.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Logical identity whose transactions a log instance records.
///
/// Maps 1:1 to a storage namespace: every record and lease row is
/// keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FailureScope(pub String);

impl FailureScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for FailureScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Identity of a server process that can hold leases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// One logical partition of a log, usually one per resource manager
/// or partner log.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectionId(pub u32);

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// One in-flight transaction or unit of work tracked by the log.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecoveryUnitId(pub u64);

impl fmt::Display for RecoveryUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Per-section write counter.
///
/// Every put or remove takes the next value, so the newest version of
/// a unit is always the one with the highest sequence number. Replays
/// and retried commits can therefore re-apply rows without changing
/// the result.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// One durable unit of the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub section_id: SectionId,
    pub recovery_unit_id: RecoveryUnitId,
    pub sequence_number: SequenceNumber,
    pub payload: Vec<u8>,
}

/// A unit that was logged but not forgotten when the log was last
/// written, handed to the transaction manager to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReconstructedUnit {
    pub section_id: SectionId,
    pub recovery_unit_id: RecoveryUnitId,
    pub sequence_number: SequenceNumber,
    pub payload: Vec<u8>,
}

impl From<RecoveryRecord> for ReconstructedUnit {
    fn from(record: RecoveryRecord) -> Self {
        Self {
            section_id: record.section_id,
            recovery_unit_id: record.recovery_unit_id,
            sequence_number: record.sequence_number,
            payload: record.payload,
        }
    }
}

/// A change staged in a [`crate::section::LogSection`] awaiting
/// commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Newest version of the unit.
    Upsert(RecoveryRecord),
    /// The unit was forgotten at this sequence number.
    Discard(RecoveryUnitId, SequenceNumber),
}

impl Change {
    pub fn recovery_unit_id(&self) -> RecoveryUnitId {
        match self {
            Self::Upsert(record) => record.recovery_unit_id,
            Self::Discard(id, _) => *id,
        }
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        match self {
            Self::Upsert(record) => record.sequence_number,
            Self::Discard(_, seq) => *seq,
        }
    }
}

/// All changes to one section that must become durable together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub section_id: SectionId,
    pub changes: Vec<Change>,
}

impl Batch {
    pub fn new(section_id: SectionId) -> Self {
        Self {
            section_id,
            changes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn upserts(&self) -> impl Iterator<Item = &RecoveryRecord> {
        self.changes.iter().filter_map(|change| match change {
            Change::Upsert(record) => Some(record),
            Change::Discard(..) => None,
        })
    }

    pub fn discards(&self) -> impl Iterator<Item = (RecoveryUnitId, SequenceNumber)> + '_ {
        self.changes.iter().filter_map(|change| match change {
            Change::Upsert(..) => None,
            Change::Discard(id, seq) => Some((*id, *seq)),
        })
    }
}
