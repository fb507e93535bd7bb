//! Durable storage for recovery logs and leases.
//!
//! A store is the single source of truth on restart. There are two
//! traits a backend implements: [`RecoveryLogStore`] for record rows
//! and [`LeaseStore`] for the per-scope lease row. Both are
//! implemented by [`sqlite::SqliteStore`] and [`in_mem::InMemStore`].
//!
//! Stores only report conditions. They never skip a corrupt record or
//! decide a scope is unusable; that is the coordinator's call.
//!
//! ## Physical layout
//!
//! Every committed change is its own row keyed by `(scope, section,
//! generation, unit, sequence)`. An upsert row carries the encoded
//! record; a discard row carries no payload (a tombstone). The newest
//! row per unit wins, so replay is a "latest sequence per unit,
//! minus tombstones" query and re-applying a batch is harmless.
//!
//! A section's rows live in the generation named by its head. A
//! keypoint copies the winning rows into the next generation, swaps
//! the head in one transaction, and then deletes the old generation.
//! Opening a section deletes any generation that isn't the head,
//! which both finishes an interrupted cleanup and discards an
//! interrupted copy.
//!
//! A keypoint drops tombstones, so the head also keeps the highest
//! sequence number the section ever committed.

use chrono::DateTime;
use chrono::Utc;

use crate::config::RetryPolicy;
use crate::errors::RecoveryLogError;
use crate::errors::Result;
use crate::model::*;

pub mod in_mem;
pub mod sqlite;

/// Handle to one opened section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionCursor {
    pub scope: FailureScope,
    pub section_id: SectionId,
    /// Highest sequence number ever committed to the section,
    /// including ones whose rows a keypoint has since dropped.
    pub high_water: SequenceNumber,
    /// Physical rows currently stored for the section.
    pub stored_rows: u64,
}

/// Lazy, finite replay of one section. Only restartable by calling
/// [`RecoveryLogStore::read_all`] again.
pub type RecordIter<'a> = Box<dyn Iterator<Item = Result<RecoveryRecord>> + 'a>;

pub trait RecoveryLogStore: Send + Sync {
    /// Every section that has ever been opened for the scope.
    fn list_sections(&self, scope: &FailureScope) -> Result<Vec<SectionId>>;

    /// Make sure the section exists and clean up after any
    /// interrupted keypoint.
    fn open_section(&self, scope: &FailureScope, section_id: SectionId) -> Result<SectionCursor>;

    /// Newest live version of every unit in the section.
    ///
    /// Items that fail to decode are yielded as errors, not skipped.
    fn read_all<'a>(&'a self, cursor: &SectionCursor) -> Result<RecordIter<'a>>;

    /// Apply every change in the batch durably, or none of them.
    fn commit_batch(&self, cursor: &SectionCursor, batch: &Batch) -> Result<()>;

    /// Whether [`RecoveryLogStore::commit_batches`] is atomic across
    /// sections.
    fn supports_cross_section_commit(&self) -> bool {
        false
    }

    /// Commit several sections' batches.
    ///
    /// The default commits one section at a time, so only each
    /// individual batch is atomic.
    fn commit_batches(&self, batches: &[(&SectionCursor, &Batch)]) -> Result<()> {
        for (cursor, batch) in batches {
            self.commit_batch(cursor, batch)?;
        }
        Ok(())
    }

    /// Rewrite the section to only its live rows. Returns the number
    /// of rows stored afterwards.
    fn keypoint(&self, cursor: &SectionCursor) -> Result<u64>;

    /// Delete every record of the scope and its lease in one
    /// transaction, if the lease is still held at `lease_version` by
    /// `owner`. Returns false if the lease moved.
    fn retire_scope(
        &self,
        scope: &FailureScope,
        owner: &OwnerId,
        lease_version: u64,
    ) -> Result<bool>;
}

/// A lease row as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLease {
    pub scope: FailureScope,
    pub owner: OwnerId,
    pub expiry: DateTime<Utc>,
    pub version: u64,
}

/// Conditional writes on the lease row.
///
/// Every write is a compare-and-swap so that two servers racing on
/// the same scope can't both succeed.
pub trait LeaseStore: Send + Sync {
    fn read_lease(&self, scope: &FailureScope) -> Result<Option<StoredLease>>;

    fn read_leases(&self) -> Result<Vec<StoredLease>>;

    /// Insert only if the scope has no lease row. Returns whether the
    /// row was written.
    fn insert_lease(&self, lease: &StoredLease) -> Result<bool>;

    /// Replace the row only if its version is still
    /// `expected_version`. Returns whether the row was written.
    fn swap_lease(&self, expected_version: u64, lease: &StoredLease) -> Result<bool>;

    /// Delete the row only if it is still `owner`'s at `version`.
    fn delete_lease(&self, scope: &FailureScope, owner: &OwnerId, version: u64) -> Result<bool>;
}

/// Run a store operation, retrying retryable failures with backoff.
///
/// Non-retryable errors return immediately. Running out of attempts
/// turns the last retryable error into
/// [`RecoveryLogError::RetriesExhausted`], which is fatal.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    op: &'static str,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let backoff = policy.backoff(attempt);
                tracing::warn!(
                    "{op} failed on attempt {attempt}/{}; retrying in {backoff:?}: {err}",
                    policy.max_attempts
                );
                std::thread::sleep(backoff);
            }
            Err(err) if err.is_retryable() => {
                tracing::error!("{op} failed after {attempt} attempts: {err}");
                return Err(RecoveryLogError::RetriesExhausted {
                    op,
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            Err(err) => return Err(err),
        }
    }
}

#[test]
fn retry_succeeds_after_transient_failures() {
    let mut calls = 0;
    let res = with_retry(&RetryPolicy::immediate(3), "test op", || {
        calls += 1;
        if calls < 3 {
            Err(RecoveryLogError::StoreUnavailable("busy".to_owned()))
        } else {
            Ok(calls)
        }
    });
    assert_eq!(res.unwrap(), 3);
}

#[test]
fn retry_exhaustion_is_fatal() {
    let mut calls = 0;
    let res: Result<()> = with_retry(&RetryPolicy::immediate(2), "test op", || {
        calls += 1;
        Err(RecoveryLogError::StoreUnavailable("busy".to_owned()))
    });
    assert_eq!(calls, 2);
    let err = res.unwrap_err();
    assert!(matches!(
        err,
        RecoveryLogError::RetriesExhausted { attempts: 2, .. }
    ));
    assert!(!err.is_retryable());
}

#[test]
fn retry_skips_fatal_errors() {
    let mut calls = 0;
    let res: Result<()> = with_retry(&RetryPolicy::immediate(5), "test op", || {
        calls += 1;
        Err(RecoveryLogError::Schema("no such table".to_owned()))
    });
    assert_eq!(calls, 1);
    assert!(matches!(res, Err(RecoveryLogError::Schema(..))));
}
