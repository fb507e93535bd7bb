//! In-memory implementation of the recovery log and lease stores.
//!
//! Rows are kept encoded, exactly as a durable store would keep them,
//! so replays go through the codec. Clones share the same rows; two
//! clones handed to two coordinators behave like two servers sharing
//! one database.
//!
//! Also has switches to inject failures, which is mostly what it's
//! for.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use super::*;
use crate::codec;

type RowKey = (RecoveryUnitId, SequenceNumber);

#[derive(Debug, Default, Clone)]
struct StoredSection {
    /// `None` is a discard.
    rows: BTreeMap<RowKey, Option<Vec<u8>>>,
    /// Highest sequence number ever committed, surviving keypoints
    /// that drop the row that carried it.
    high_water: SequenceNumber,
}

#[derive(Debug, Default)]
struct State {
    sections: BTreeMap<(FailureScope, SectionId), StoredSection>,
    leases: BTreeMap<FailureScope, StoredLease>,
    faults: Faults,
    commits: u64,
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    /// Reject this many upcoming commits before touching any row.
    fail_commits: u32,
    /// Apply this many upcoming commits but report them as failed, as
    /// when a connection drops after the database committed.
    lose_commit_acks: u32,
    fail_keypoints: u32,
}

#[derive(Debug, Default, Clone)]
pub struct InMemStore {
    state: Arc<Mutex<State>>,
}

impl InMemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        let state = self
            .state
            .lock()
            .map_err(|_err| RecoveryLogError::Store("in-memory store lock poisoned".to_owned()))?;
        if state.faults.unavailable {
            return Err(RecoveryLogError::StoreUnavailable(
                "in-memory store switched off".to_owned(),
            ));
        }
        Ok(state)
    }

    fn raw_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Make every call fail as retryable until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.raw_state().faults.unavailable = unavailable;
    }

    pub fn fail_next_commits(&self, count: u32) {
        self.raw_state().faults.fail_commits = count;
    }

    pub fn lose_next_commit_acks(&self, count: u32) {
        self.raw_state().faults.lose_commit_acks = count;
    }

    pub fn fail_next_keypoints(&self, count: u32) {
        self.raw_state().faults.fail_keypoints = count;
    }

    /// Successful commit calls so far, acknowledged or not.
    pub fn commit_count(&self) -> u64 {
        self.raw_state().commits
    }

    /// Physical rows held for a section, discards included.
    pub fn row_count(&self, scope: &FailureScope, section_id: SectionId) -> usize {
        self.raw_state()
            .sections
            .get(&(scope.clone(), section_id))
            .map_or(0, |section| section.rows.len())
    }

    /// Overwrite every stored version of a unit with `bytes`.
    pub fn overwrite_unit(
        &self,
        scope: &FailureScope,
        section_id: SectionId,
        recovery_unit_id: RecoveryUnitId,
        bytes: &[u8],
    ) {
        if let Some(section) = self.raw_state().sections.get_mut(&(scope.clone(), section_id)) {
            for ((unit, _), payload) in section.rows.iter_mut() {
                if *unit == recovery_unit_id && payload.is_some() {
                    *payload = Some(bytes.to_vec());
                }
            }
        }
    }

    /// Overwrite the lease row directly, bypassing compare-and-swap.
    pub fn force_lease(&self, lease: StoredLease) {
        self.raw_state().leases.insert(lease.scope.clone(), lease);
    }
}

/// Newest row per unit, which may be a discard.
fn winners(
    rows: &BTreeMap<RowKey, Option<Vec<u8>>>,
) -> BTreeMap<RecoveryUnitId, (SequenceNumber, Option<&Vec<u8>>)> {
    let mut winners = BTreeMap::new();
    // Keys are sorted by (unit, seq), so the last one seen per unit
    // wins.
    for ((unit, seq), payload) in rows {
        winners.insert(*unit, (*seq, payload.as_ref()));
    }
    winners
}

fn apply(state: &mut State, scope: &FailureScope, batch: &Batch) -> Result<()> {
    let section = state
        .sections
        .get_mut(&(scope.clone(), batch.section_id))
        .ok_or_else(|| {
            RecoveryLogError::Schema(format!(
                "section {} of {scope} was never opened",
                batch.section_id
            ))
        })?;
    for change in &batch.changes {
        let payload = match change {
            Change::Upsert(record) => Some(codec::encode(record)),
            Change::Discard(..) => None,
        };
        section.rows.insert(
            (change.recovery_unit_id(), change.sequence_number()),
            payload,
        );
        section.high_water = section.high_water.max(change.sequence_number());
    }
    Ok(())
}

impl RecoveryLogStore for InMemStore {
    fn list_sections(&self, scope: &FailureScope) -> Result<Vec<SectionId>> {
        let state = self.state()?;
        Ok(state
            .sections
            .keys()
            .filter(|(s, _)| s == scope)
            .map(|(_, section_id)| *section_id)
            .collect())
    }

    fn open_section(&self, scope: &FailureScope, section_id: SectionId) -> Result<SectionCursor> {
        let mut state = self.state()?;
        let section = state
            .sections
            .entry((scope.clone(), section_id))
            .or_default();
        Ok(SectionCursor {
            scope: scope.clone(),
            section_id,
            high_water: section.high_water,
            stored_rows: section.rows.len() as u64,
        })
    }

    fn read_all<'a>(&'a self, cursor: &SectionCursor) -> Result<RecordIter<'a>> {
        let state = self.state()?;
        let live: Vec<_> = state
            .sections
            .get(&(cursor.scope.clone(), cursor.section_id))
            .map(|section| {
                winners(&section.rows)
                    .into_iter()
                    .filter_map(|(unit, (seq, payload))| {
                        payload.map(|bytes| (unit, seq, bytes.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let section_id = cursor.section_id;
        Ok(Box::new(live.into_iter().map(move |(unit, seq, bytes)| {
            let record = codec::decode(&bytes)?;
            if record.section_id != section_id
                || record.recovery_unit_id != unit
                || record.sequence_number != seq
            {
                return Err(RecoveryLogError::CorruptRecord(format!(
                    "row for unit {unit} holds a record for unit {}",
                    record.recovery_unit_id
                )));
            }
            Ok(record)
        })))
    }

    fn commit_batch(&self, cursor: &SectionCursor, batch: &Batch) -> Result<()> {
        self.commit_batches(&[(cursor, batch)])
    }

    fn supports_cross_section_commit(&self) -> bool {
        true
    }

    fn commit_batches(&self, batches: &[(&SectionCursor, &Batch)]) -> Result<()> {
        let mut state = self.state()?;
        if state.faults.fail_commits > 0 {
            state.faults.fail_commits -= 1;
            return Err(RecoveryLogError::StoreUnavailable(
                "injected commit failure".to_owned(),
            ));
        }

        // Stage against a copy so a bad batch leaves nothing behind.
        let mut staged = State {
            sections: state.sections.clone(),
            ..State::default()
        };
        for (cursor, batch) in batches {
            apply(&mut staged, &cursor.scope, batch)?;
        }
        state.sections = staged.sections;
        state.commits += 1;

        if state.faults.lose_commit_acks > 0 {
            state.faults.lose_commit_acks -= 1;
            return Err(RecoveryLogError::StoreUnavailable(
                "injected lost commit acknowledgement".to_owned(),
            ));
        }
        Ok(())
    }

    fn keypoint(&self, cursor: &SectionCursor) -> Result<u64> {
        let mut state = self.state()?;
        if state.faults.fail_keypoints > 0 {
            state.faults.fail_keypoints -= 1;
            return Err(RecoveryLogError::StoreUnavailable(
                "injected keypoint failure".to_owned(),
            ));
        }
        let Some(section) = state
            .sections
            .get_mut(&(cursor.scope.clone(), cursor.section_id))
        else {
            return Ok(0);
        };
        let kept: BTreeMap<RowKey, Option<Vec<u8>>> = winners(&section.rows)
            .into_iter()
            .filter_map(|(unit, (seq, payload))| {
                payload.map(|bytes| ((unit, seq), Some(bytes.clone())))
            })
            .collect();
        section.rows = kept;
        Ok(section.rows.len() as u64)
    }

    fn retire_scope(
        &self,
        scope: &FailureScope,
        owner: &OwnerId,
        lease_version: u64,
    ) -> Result<bool> {
        let mut state = self.state()?;
        match state.leases.get(scope) {
            Some(lease) if &lease.owner == owner && lease.version == lease_version => {}
            _ => return Ok(false),
        }
        state.leases.remove(scope);
        state.sections.retain(|(s, _), _| s != scope);
        Ok(true)
    }
}

impl LeaseStore for InMemStore {
    fn read_lease(&self, scope: &FailureScope) -> Result<Option<StoredLease>> {
        Ok(self.state()?.leases.get(scope).cloned())
    }

    fn read_leases(&self) -> Result<Vec<StoredLease>> {
        Ok(self.state()?.leases.values().cloned().collect())
    }

    fn insert_lease(&self, lease: &StoredLease) -> Result<bool> {
        let mut state = self.state()?;
        if state.leases.contains_key(&lease.scope) {
            return Ok(false);
        }
        state.leases.insert(lease.scope.clone(), lease.clone());
        Ok(true)
    }

    fn swap_lease(&self, expected_version: u64, lease: &StoredLease) -> Result<bool> {
        let mut state = self.state()?;
        match state.leases.get_mut(&lease.scope) {
            Some(current) if current.version == expected_version => {
                *current = lease.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete_lease(&self, scope: &FailureScope, owner: &OwnerId, version: u64) -> Result<bool> {
        let mut state = self.state()?;
        match state.leases.get(scope) {
            Some(lease) if &lease.owner == owner && lease.version == version => {
                state.leases.remove(scope);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
fn upsert(unit: u64, seq: u64, payload: &[u8]) -> Change {
    Change::Upsert(RecoveryRecord {
        section_id: SectionId(1),
        recovery_unit_id: RecoveryUnitId(unit),
        sequence_number: SequenceNumber(seq),
        payload: payload.to_vec(),
    })
}

#[test]
fn newest_row_wins_and_discards_hide() {
    let store = InMemStore::new();
    let scope = FailureScope::new("server1");
    let cursor = store.open_section(&scope, SectionId(1)).unwrap();
    let batch = Batch {
        section_id: SectionId(1),
        changes: vec![
            upsert(1, 1, b"a"),
            upsert(1, 3, b"b"),
            upsert(2, 2, b"c"),
            Change::Discard(RecoveryUnitId(2), SequenceNumber(4)),
        ],
    };
    store.commit_batch(&cursor, &batch).unwrap();

    let records: Vec<_> = store
        .read_all(&cursor)
        .unwrap()
        .collect::<Result<_>>()
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload, b"b".to_vec());
    assert_eq!(
        store.open_section(&scope, SectionId(1)).unwrap().high_water,
        SequenceNumber(4)
    );
}

#[test]
fn injected_commit_failure_writes_nothing() {
    let store = InMemStore::new();
    let scope = FailureScope::new("server1");
    let cursor = store.open_section(&scope, SectionId(1)).unwrap();
    store.fail_next_commits(1);

    let batch = Batch {
        section_id: SectionId(1),
        changes: vec![upsert(1, 1, b"a")],
    };
    let err = store.commit_batch(&cursor, &batch).unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(store.row_count(&scope, SectionId(1)), 0);

    store.commit_batch(&cursor, &batch).unwrap();
    assert_eq!(store.row_count(&scope, SectionId(1)), 1);
}

#[test]
fn lost_ack_still_applies() {
    let store = InMemStore::new();
    let scope = FailureScope::new("server1");
    let cursor = store.open_section(&scope, SectionId(1)).unwrap();
    store.lose_next_commit_acks(1);

    let batch = Batch {
        section_id: SectionId(1),
        changes: vec![upsert(1, 1, b"a")],
    };
    assert!(store.commit_batch(&cursor, &batch).is_err());
    store.commit_batch(&cursor, &batch).unwrap();
    assert_eq!(store.row_count(&scope, SectionId(1)), 1);
    assert_eq!(store.commit_count(), 2);
}

#[test]
fn keypoint_keeps_high_water_of_dropped_discard() {
    let store = InMemStore::new();
    let scope = FailureScope::new("server1");
    let cursor = store.open_section(&scope, SectionId(1)).unwrap();
    let batch = Batch {
        section_id: SectionId(1),
        changes: vec![
            upsert(1, 1, b"a"),
            upsert(2, 2, b"b"),
            Change::Discard(RecoveryUnitId(2), SequenceNumber(3)),
        ],
    };
    store.commit_batch(&cursor, &batch).unwrap();

    assert_eq!(store.keypoint(&cursor).unwrap(), 1);
    let cursor = store.open_section(&scope, SectionId(1)).unwrap();
    assert_eq!(cursor.stored_rows, 1);
    assert_eq!(cursor.high_water, SequenceNumber(3));
}

#[test]
fn unopened_section_fails_whole_commit() {
    let store = InMemStore::new();
    let scope = FailureScope::new("server1");
    let one = store.open_section(&scope, SectionId(1)).unwrap();
    let good = Batch {
        section_id: SectionId(1),
        changes: vec![upsert(1, 1, b"a")],
    };
    let unopened = SectionCursor {
        section_id: SectionId(9),
        ..one.clone()
    };
    let bad = Batch::new(SectionId(9));
    assert!(store
        .commit_batches(&[(&one, &good), (&unopened, &bad)])
        .is_err());
    assert_eq!(store.row_count(&scope, SectionId(1)), 0);
}

#[test]
fn clones_share_leases() {
    use chrono::TimeZone;

    let a = InMemStore::new();
    let b = a.clone();
    let lease = StoredLease {
        scope: FailureScope::new("server1"),
        owner: OwnerId::new("a"),
        expiry: Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap(),
        version: 1,
    };
    assert!(a.insert_lease(&lease).unwrap());
    assert!(!b.insert_lease(&lease).unwrap());
    assert_eq!(b.read_lease(&lease.scope).unwrap(), Some(lease));
}
