//! The recovery log a transaction manager talks to.
//!
//! A [`RecoveryLog`] owns the lease of one failure scope while open,
//! keeps every section's live units in memory, and makes them durable
//! on [`RecoveryLog::force_flush`]. On [`RecoveryLog::open`] it
//! replays whatever a previous owner (this server before a crash, or
//! a dead peer) left behind.
//!
//! ```text
//! Closed -> Opening -> Replaying -> Open -> Closing -> Closed
//!              |           |          |        |
//!              +-----------+----------+--------+--> Failed
//! ```
//!
//! Losing the lease moves an open log straight back to `Closed` and
//! throws away its in-memory state. Any fatal error during replay or
//! flush moves it to `Failed`, where it stays; a failed log never
//! releases its lease, so peers wait for it to expire.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::RwLock;
use std::time::Instant;

use tokio::sync::watch;
use tracing::instrument;

use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::config::CorruptRecordPolicy;
use crate::config::RecoveryLogConfig;
use crate::errors::RecoveryLogError;
use crate::errors::Result;
use crate::lease::renewer::LeaseRenewer;
use crate::lease::LeaseManager;
use crate::lease::LeaseState;
use crate::model::*;
use crate::section::LogSection;
use crate::store::with_retry;
use crate::store::LeaseStore;
use crate::store::RecoveryLogStore;
use crate::store::SectionCursor;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LogState {
    Closed,
    Opening,
    Replaying,
    Open,
    Closing,
    Failed,
}

/// Everything recovered by [`RecoveryLog::open`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayedState {
    /// Units to hand to the transaction manager, in section and unit
    /// order.
    pub units: Vec<ReconstructedUnit>,
    /// Records skipped because they failed to decode. Always empty
    /// under [`CorruptRecordPolicy::Abort`].
    pub quarantined: Vec<QuarantinedRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantinedRecord {
    pub section_id: SectionId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionStats {
    pub section_id: SectionId,
    pub live_units: usize,
    pub pending_changes: usize,
    pub dead_rows: u64,
    pub high_water: SequenceNumber,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStats {
    pub scope: Option<FailureScope>,
    pub state: LogState,
    pub lease: LeaseState,
    pub flushes: u64,
    pub keypoints: u64,
    pub sections: Vec<SectionStats>,
}

struct Lifecycle {
    state: LogState,
    scope: Option<FailureScope>,
}

struct OpenSection {
    cursor: SectionCursor,
    log: Mutex<LogSection>,
}

/// Bookkeeping only touched with the flush lock held.
struct FlushState {
    flushes: u64,
    keypoints: u64,
    flushes_since_keypoint: u64,
    last_keypoint: Instant,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_err| RecoveryLogError::Store(format!("{what} lock poisoned")))
}

fn is_corruption(err: &RecoveryLogError) -> bool {
    matches!(
        err.root(),
        RecoveryLogError::CorruptRecord(..) | RecoveryLogError::UnsupportedVersion { .. }
    )
}

pub struct RecoveryLog {
    store: Arc<dyn RecoveryLogStore>,
    leases: Arc<LeaseManager>,
    clock: Arc<dyn Clock>,
    config: RecoveryLogConfig,
    lifecycle: Mutex<Lifecycle>,
    sections: RwLock<BTreeMap<SectionId, Arc<OpenSection>>>,
    /// Held while a new section is opened in the store, so opening
    /// one never runs beside a keypoint of the same section.
    creating: Mutex<()>,
    flush: Mutex<FlushState>,
    renewer: Mutex<Option<LeaseRenewer>>,
}

impl RecoveryLog {
    pub fn new(
        store: Arc<dyn RecoveryLogStore>,
        lease_store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        config: RecoveryLogConfig,
    ) -> Self {
        let leases = Arc::new(LeaseManager::new(
            lease_store,
            clock.clone(),
            config.lease.clone(),
            config.owner_id.clone(),
        ));
        let last_keypoint = clock.instant();
        Self {
            store,
            leases,
            clock,
            config,
            lifecycle: Mutex::new(Lifecycle {
                state: LogState::Closed,
                scope: None,
            }),
            sections: RwLock::new(BTreeMap::new()),
            creating: Mutex::new(()),
            flush: Mutex::new(FlushState {
                flushes: 0,
                keypoints: 0,
                flushes_since_keypoint: 0,
                last_keypoint,
            }),
            renewer: Mutex::new(None),
        }
    }

    /// Use one store for both records and leases, on the system
    /// clock.
    pub fn with_store<S>(store: Arc<S>, config: RecoveryLogConfig) -> Self
    where
        S: RecoveryLogStore + LeaseStore + 'static,
    {
        Self::new(store.clone(), store, Arc::new(SystemClock), config)
    }

    pub fn state(&self) -> LogState {
        self.lifecycle
            .lock()
            .map_or(LogState::Failed, |lifecycle| lifecycle.state)
    }

    fn set_state(&self, state: LogState) -> Result<()> {
        let mut lifecycle = lock(&self.lifecycle, "lifecycle")?;
        tracing::debug!("Recovery log {:?} -> {state:?}", lifecycle.state);
        lifecycle.state = state;
        Ok(())
    }

    /// Back to `Closed` after an open that never got to `Open`.
    fn abort_open(&self) -> Result<()> {
        let mut lifecycle = lock(&self.lifecycle, "lifecycle")?;
        tracing::debug!("Recovery log {:?} -> Closed", lifecycle.state);
        lifecycle.state = LogState::Closed;
        lifecycle.scope = None;
        Ok(())
    }

    fn state_error(found: LogState, needed: LogState, scope: Option<&FailureScope>) -> RecoveryLogError {
        match (found, scope) {
            (LogState::Failed, Some(scope)) => RecoveryLogError::LogFailed(scope.clone()),
            _ => RecoveryLogError::InvalidState { found, needed },
        }
    }

    /// Make sure the log is open and still owns its scope.
    fn ensure_open(&self) -> Result<FailureScope> {
        let scope = {
            let lifecycle = lock(&self.lifecycle, "lifecycle")?;
            match (&lifecycle.state, &lifecycle.scope) {
                (LogState::Open, Some(scope)) => scope.clone(),
                (found, scope) => {
                    return Err(Self::state_error(*found, LogState::Open, scope.as_ref()))
                }
            }
        };
        if !self.leases.check_local() {
            return Err(self.lose_ownership(&scope, "lease is no longer valid"));
        }
        Ok(scope)
    }

    /// Leave `Open` after the lease went away and drop everything held
    /// in memory.
    fn lose_ownership(&self, scope: &FailureScope, reason: &str) -> RecoveryLogError {
        tracing::warn!("Relinquishing recovery log of {scope}: {reason}");
        self.stop_renewer();
        if let Ok(sections) = self.sections.read() {
            for section in sections.values() {
                if let Ok(mut log) = section.log.lock() {
                    log.relinquish();
                }
            }
        }
        if let Ok(mut sections) = self.sections.write() {
            sections.clear();
        }
        let err = match self.leases.state() {
            LeaseState::Lost => RecoveryLogError::LeaseLost {
                scope: scope.clone(),
                reason: reason.to_owned(),
            },
            _ => self.leases.lose(scope, reason.to_owned()),
        };
        if let Ok(mut lifecycle) = self.lifecycle.lock() {
            if lifecycle.state != LogState::Failed {
                lifecycle.state = LogState::Closed;
            }
        }
        err
    }

    /// Move to `Failed`. The lease is kept until it expires.
    fn fail(&self, err: RecoveryLogError) -> RecoveryLogError {
        tracing::error!("Recovery log failed: {err}");
        self.stop_renewer();
        if let Ok(mut lifecycle) = self.lifecycle.lock() {
            lifecycle.state = LogState::Failed;
        }
        err
    }

    fn stop_renewer(&self) {
        let renewer = self
            .renewer
            .lock()
            .map(|mut renewer| renewer.take())
            .unwrap_or_else(|err| err.into_inner().take());
        if let Some(mut renewer) = renewer {
            renewer.stop();
        }
    }

    fn open_sections(&self) -> Result<Vec<Arc<OpenSection>>> {
        let sections = self
            .sections
            .read()
            .map_err(|_err| RecoveryLogError::Store("sections lock poisoned".to_owned()))?;
        Ok(sections.values().cloned().collect())
    }

    /// Acquire the scope's lease and replay every section.
    pub fn open(&self, scope: &FailureScope) -> Result<ReplayedState> {
        self.open_cancellable(scope, &AtomicBool::new(false))
    }

    /// Like [`RecoveryLog::open`], but gives up with
    /// [`RecoveryLogError::Cancelled`] between sections once `cancel`
    /// is set. A cancelled open releases the lease it took.
    #[instrument(name = "recovery_log_open", skip(self, cancel), fields(owner = %self.config.owner_id))]
    pub fn open_cancellable(
        &self,
        scope: &FailureScope,
        cancel: &AtomicBool,
    ) -> Result<ReplayedState> {
        {
            let mut lifecycle = lock(&self.lifecycle, "lifecycle")?;
            if lifecycle.state != LogState::Closed {
                return Err(Self::state_error(
                    lifecycle.state,
                    LogState::Closed,
                    lifecycle.scope.as_ref(),
                ));
            }
            lifecycle.state = LogState::Opening;
            lifecycle.scope = Some(scope.clone());
        }
        tracing::info!("Opening recovery log of {scope}");

        let lease = match with_retry(&self.config.retry, "lease acquire", || {
            self.leases.acquire(scope)
        }) {
            Ok(lease) => lease,
            Err(err) => {
                self.abort_open()?;
                return Err(err);
            }
        };
        // Replay can outlast a lease, so renew from here on.
        match LeaseRenewer::start(self.leases.clone()) {
            Ok(renewer) => *lock(&self.renewer, "renewer")? = Some(renewer),
            Err(err) => {
                self.leases.release(&lease);
                self.abort_open()?;
                return Err(err);
            }
        }

        self.set_state(LogState::Replaying)?;
        let replayed = self.replay(scope, cancel).and_then(|replayed| {
            // Units must not be handed out under a lease a peer could
            // already be taking over.
            if self.leases.check_local() {
                Ok(replayed)
            } else {
                Err(self
                    .leases
                    .lose(scope, "lease expired during replay".to_owned()))
            }
        });
        let replayed = match replayed {
            Ok(replayed) => replayed,
            Err(err) => {
                self.stop_renewer();
                if let Ok(mut sections) = self.sections.write() {
                    sections.clear();
                }
                return Err(match err.root() {
                    RecoveryLogError::Cancelled(..) => {
                        tracing::info!("Open of {scope} cancelled; releasing lease");
                        // The heartbeat may have moved the version on.
                        if let Some(lease) = self.leases.current() {
                            self.leases.release(&lease);
                        }
                        self.abort_open()?;
                        err
                    }
                    RecoveryLogError::LeaseLost { .. } => {
                        self.abort_open()?;
                        err
                    }
                    _ => self.fail(err),
                });
            }
        };

        {
            let mut flush = lock(&self.flush, "flush")?;
            flush.flushes_since_keypoint = 0;
            flush.last_keypoint = self.clock.instant();
        }
        self.set_state(LogState::Open)?;
        tracing::info!(
            "Recovery log of {scope} open with {} units to recover ({} quarantined)",
            replayed.units.len(),
            replayed.quarantined.len()
        );
        Ok(replayed)
    }

    fn replay(&self, scope: &FailureScope, cancel: &AtomicBool) -> Result<ReplayedState> {
        let section_ids = with_retry(&self.config.retry, "list sections", || {
            self.store.list_sections(scope)
        })?;
        tracing::debug!("Replaying {} sections of {scope}", section_ids.len());

        let mut replayed = ReplayedState::default();
        let mut opened = BTreeMap::new();
        for section_id in section_ids {
            if cancel.load(Ordering::Relaxed) {
                return Err(RecoveryLogError::Cancelled(scope.clone()));
            }
            if !self.leases.check_local() {
                return Err(self.leases.lose(
                    scope,
                    "lease expired during replay".to_owned(),
                ));
            }

            let (cursor, records, quarantined) = self.replay_section(scope, section_id)?;
            let mut log = LogSection::new(section_id);
            log.load_from_store(records, cursor.high_water, cursor.stored_rows)?;
            replayed
                .units
                .extend(log.live_units().cloned().map(ReconstructedUnit::from));
            replayed.quarantined.extend(quarantined);
            opened.insert(
                section_id,
                Arc::new(OpenSection {
                    cursor,
                    log: Mutex::new(log),
                }),
            );
        }
        if cancel.load(Ordering::Relaxed) {
            return Err(RecoveryLogError::Cancelled(scope.clone()));
        }

        *self
            .sections
            .write()
            .map_err(|_err| RecoveryLogError::Store("sections lock poisoned".to_owned()))? =
            opened;
        Ok(replayed)
    }

    #[allow(clippy::type_complexity)]
    fn replay_section(
        &self,
        scope: &FailureScope,
        section_id: SectionId,
    ) -> Result<(SectionCursor, Vec<RecoveryRecord>, Vec<QuarantinedRecord>)> {
        let policy = self.config.corrupt_records;
        with_retry(&self.config.retry, "replay section", || {
            let cursor = self.store.open_section(scope, section_id)?;
            let mut records = Vec::new();
            let mut quarantined = Vec::new();
            for item in self.store.read_all(&cursor)? {
                match item {
                    Ok(record) => records.push(record),
                    Err(err) if is_corruption(&err) && policy == CorruptRecordPolicy::Quarantine => {
                        tracing::warn!("Quarantining record in section {section_id} of {scope}: {err}");
                        quarantined.push(QuarantinedRecord {
                            section_id,
                            reason: err.to_string(),
                        });
                    }
                    Err(err) => return Err(err),
                }
            }
            tracing::debug!(
                "Replayed {} live units from section {section_id} of {scope}",
                records.len()
            );
            Ok((cursor, records, quarantined))
        })
    }

    fn section(&self, scope: &FailureScope, section_id: SectionId) -> Result<Arc<OpenSection>> {
        if let Some(section) = self
            .sections
            .read()
            .map_err(|_err| RecoveryLogError::Store("sections lock poisoned".to_owned()))?
            .get(&section_id)
        {
            return Ok(section.clone());
        }

        // Store I/O happens outside the sections lock so writers to
        // other sections and flushes carry on meanwhile.
        let _creating = lock(&self.creating, "section creation")?;
        if let Some(section) = self
            .sections
            .read()
            .map_err(|_err| RecoveryLogError::Store("sections lock poisoned".to_owned()))?
            .get(&section_id)
        {
            return Ok(section.clone());
        }
        tracing::debug!("Creating section {section_id} of {scope}");
        let cursor = with_retry(&self.config.retry, "open section", || {
            self.store.open_section(scope, section_id)
        })?;
        let mut log = LogSection::new(section_id);
        log.load_from_store(Vec::new(), cursor.high_water, cursor.stored_rows)?;

        let mut sections = self
            .sections
            .write()
            .map_err(|_err| RecoveryLogError::Store("sections lock poisoned".to_owned()))?;
        let section = sections.entry(section_id).or_insert_with(|| {
            Arc::new(OpenSection {
                cursor,
                log: Mutex::new(log),
            })
        });
        Ok(section.clone())
    }

    /// Record the newest state of a unit. Durable after the next
    /// successful [`RecoveryLog::force_flush`].
    pub fn write_record(
        &self,
        section_id: SectionId,
        recovery_unit_id: RecoveryUnitId,
        payload: Vec<u8>,
    ) -> Result<SequenceNumber> {
        let scope = self.ensure_open()?;
        let section = self.section(&scope, section_id)?;
        let seq = lock(&section.log, "section")?.put(recovery_unit_id, payload);
        Ok(seq)
    }

    /// Forget a unit. Returns whether the unit was known.
    pub fn remove_record(
        &self,
        section_id: SectionId,
        recovery_unit_id: RecoveryUnitId,
    ) -> Result<bool> {
        self.ensure_open()?;
        let section = self
            .sections
            .read()
            .map_err(|_err| RecoveryLogError::Store("sections lock poisoned".to_owned()))?
            .get(&section_id)
            .cloned();
        match section {
            Some(section) => Ok(lock(&section.log, "section")?
                .remove(recovery_unit_id)
                .is_some()),
            None => Ok(false),
        }
    }

    /// Make every write and remove that returned before this call
    /// durable.
    #[instrument(name = "recovery_log_force_flush", skip(self))]
    pub fn force_flush(&self) -> Result<()> {
        let scope = self.ensure_open()?;
        let mut flush = lock(&self.flush, "flush")?;
        self.flush_locked(&scope, &mut flush)?;
        self.keypoint_by_policy(&scope, &mut flush);
        Ok(())
    }

    /// Commit every dirty section. Must hold the flush lock.
    ///
    /// Anything not committed is put back into its section. Any error
    /// left after retrying is fatal and fails the log.
    fn flush_locked(&self, scope: &FailureScope, flush: &mut FlushState) -> Result<()> {
        let mut pending = Vec::new();
        for section in self.open_sections()? {
            let batch = lock(&section.log, "section")?.snapshot_for_flush();
            if !batch.is_empty() {
                pending.push((section, batch));
            }
        }
        if pending.is_empty() {
            tracing::trace!("Nothing to flush for {scope}");
            return Ok(());
        }
        let changes: usize = pending.iter().map(|(_, batch)| batch.len()).sum();
        tracing::debug!(
            "Flushing {changes} changes in {} sections of {scope}",
            pending.len()
        );

        let committed = if self.store.supports_cross_section_commit() {
            let batches: Vec<_> = pending
                .iter()
                .map(|(section, batch)| (&section.cursor, batch))
                .collect();
            match with_retry(&self.config.retry, "commit", || {
                self.store.commit_batches(&batches)
            }) {
                Ok(()) => Ok(pending.len()),
                Err(err) => Err((0, err)),
            }
        } else {
            pending
                .iter()
                .enumerate()
                .try_for_each(|(i, (section, batch))| {
                    with_retry(&self.config.retry, "commit", || {
                        self.store.commit_batch(&section.cursor, batch)
                    })
                    .map_err(|err| (i, err))
                })
                .map(|()| pending.len())
        };

        let (done, failure) = match committed {
            Ok(done) => (done, None),
            Err((done, err)) => (done, Some(err)),
        };
        for (i, (section, batch)) in pending.into_iter().enumerate() {
            let mut log = lock(&section.log, "section")?;
            if i < done {
                log.note_committed(&batch);
            } else {
                log.restage(batch);
            }
        }
        match failure {
            None => {
                flush.flushes += 1;
                flush.flushes_since_keypoint += 1;
                Ok(())
            }
            Some(err) => Err(self.fail(err)),
        }
    }

    /// Compact every section now.
    #[instrument(name = "recovery_log_keypoint", skip(self))]
    pub fn keypoint(&self) -> Result<()> {
        let scope = self.ensure_open()?;
        let mut flush = lock(&self.flush, "flush")?;
        for section in self.open_sections()? {
            self.keypoint_section(&scope, &section)?;
        }
        flush.keypoints += 1;
        flush.flushes_since_keypoint = 0;
        flush.last_keypoint = self.clock.instant();
        Ok(())
    }

    fn keypoint_section(&self, scope: &FailureScope, section: &OpenSection) -> Result<()> {
        let rows = with_retry(&self.config.retry, "keypoint", || {
            self.store.keypoint(&section.cursor)
        })?;
        tracing::debug!(
            "Keypointed section {} of {scope}; {rows} rows stored",
            section.cursor.section_id
        );
        lock(&section.log, "section")?.note_keypointed(rows);
        Ok(())
    }

    /// Run whichever configured keypoint triggers fired. A failed
    /// keypoint leaves the previous generation in place, so it is only
    /// logged.
    fn keypoint_by_policy(&self, scope: &FailureScope, flush: &mut FlushState) {
        let policy = &self.config.keypoint;
        let by_count = policy
            .after_flushes
            .map_or(false, |n| flush.flushes_since_keypoint >= n);
        let by_time = policy.interval().map_or(false, |interval| {
            self.clock.instant().saturating_duration_since(flush.last_keypoint) >= interval
        });

        let sections = match self.open_sections() {
            Ok(sections) => sections,
            Err(err) => {
                tracing::warn!("Skipping keypoint of {scope}: {err}");
                return;
            }
        };
        let targets: Vec<_> = if by_count || by_time {
            sections
        } else if let Some(threshold) = policy.dead_record_threshold {
            sections
                .into_iter()
                .filter(|section| {
                    section
                        .log
                        .lock()
                        .map_or(false, |log| log.dead_rows() >= threshold)
                })
                .collect()
        } else {
            Vec::new()
        };
        if targets.is_empty() {
            return;
        }

        for section in &targets {
            if let Err(err) = self.keypoint_section(scope, section) {
                tracing::warn!(
                    "Keypoint of section {} of {scope} failed; will try again later: {err}",
                    section.cursor.section_id
                );
                return;
            }
        }
        flush.keypoints += 1;
        if by_count || by_time {
            flush.flushes_since_keypoint = 0;
            flush.last_keypoint = self.clock.instant();
        }
    }

    /// Flush, then give up the scope.
    ///
    /// If the final flush fails the log is failed and the lease is
    /// kept, so nobody else recovers the scope before it expires.
    #[instrument(name = "recovery_log_close", skip(self))]
    pub fn close(&self) -> Result<()> {
        let scope = self.ensure_open()?;
        self.set_state(LogState::Closing)?;
        {
            let mut flush = lock(&self.flush, "flush")?;
            self.flush_locked(&scope, &mut flush)?;
        }

        self.stop_renewer();
        if let Some(lease) = self.leases.current() {
            self.leases.release(&lease);
        }
        self.sections
            .write()
            .map_err(|_err| RecoveryLogError::Store("sections lock poisoned".to_owned()))?
            .clear();
        self.set_state(LogState::Closed)?;
        tracing::info!("Closed recovery log of {scope}");
        Ok(())
    }

    /// Delete the scope from the store for good, lease included.
    ///
    /// Only allowed once every unit has been removed.
    #[instrument(name = "recovery_log_retire", skip(self))]
    pub fn retire(&self) -> Result<()> {
        let scope = self.ensure_open()?;
        let mut flush = lock(&self.flush, "flush")?;
        self.flush_locked(&scope, &mut flush)?;

        let mut live = 0;
        for section in self.open_sections()? {
            live += lock(&section.log, "section")?.live_count();
        }
        if live > 0 {
            return Err(RecoveryLogError::RetireRefused { scope, live });
        }

        self.stop_renewer();
        let lease = match self.leases.current() {
            Some(lease) => lease,
            None => return Err(self.lose_ownership(&scope, "no lease held at retire")),
        };
        let retired = with_retry(&self.config.retry, "retire", || {
            self.store.retire_scope(&scope, &lease.owner, lease.version)
        })
        .map_err(|err| self.fail(err))?;
        if !retired {
            return Err(self.lose_ownership(&scope, "lease moved before retire"));
        }

        self.leases.forget();
        self.sections
            .write()
            .map_err(|_err| RecoveryLogError::Store("sections lock poisoned".to_owned()))?
            .clear();
        self.set_state(LogState::Closed)?;
        tracing::info!("Retired {scope}");
        Ok(())
    }

    /// Whether the log is open and still holds a locally valid lease.
    ///
    /// Noticing the lease is gone also closes the log.
    pub fn try_check_ownership(&self) -> bool {
        self.ensure_open().is_ok()
    }

    /// Lease state changes, starting from the current one.
    pub fn ownership_events(&self) -> watch::Receiver<LeaseState> {
        self.leases.subscribe()
    }

    /// Takeover candidates: scopes whose other owners let their lease
    /// expire.
    pub fn expired_peers(&self) -> Result<Vec<FailureScope>> {
        Ok(self
            .leases
            .expired_peers()?
            .into_iter()
            .map(|lease| lease.scope)
            .collect())
    }

    pub fn stats(&self) -> LogStats {
        let (state, scope) = match self.lifecycle.lock() {
            Ok(lifecycle) => (lifecycle.state, lifecycle.scope.clone()),
            Err(_) => (LogState::Failed, None),
        };
        let (flushes, keypoints) = self
            .flush
            .lock()
            .map_or((0, 0), |flush| (flush.flushes, flush.keypoints));
        let sections = self
            .open_sections()
            .unwrap_or_default()
            .iter()
            .filter_map(|section| {
                let log = section.log.lock().ok()?;
                Some(SectionStats {
                    section_id: log.id(),
                    live_units: log.live_count(),
                    pending_changes: log.pending_count(),
                    dead_rows: log.dead_rows(),
                    high_water: log.high_water(),
                })
            })
            .collect();
        LogStats {
            scope,
            state,
            lease: self.leases.state(),
            flushes,
            keypoints,
            sections,
        }
    }
}

#[cfg(test)]
mod testing {
    use chrono::TimeZone;
    use chrono::Utc;

    use super::*;
    use crate::clock::TestingClock;
    use crate::config::LeaseConfig;
    use crate::config::RetryPolicy;

    pub(super) fn config(owner: &str) -> RecoveryLogConfig {
        RecoveryLogConfig {
            owner_id: OwnerId::new(owner),
            lease: LeaseConfig {
                duration_ms: 10_000,
                renew_interval_ms: 5_000,
                leeway_ms: 1_000,
            },
            retry: RetryPolicy::immediate(3),
            ..RecoveryLogConfig::default()
        }
    }

    pub(super) fn clock() -> TestingClock {
        TestingClock::new(Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap())
    }

    pub(super) fn mem_log(
        store: &crate::store::in_mem::InMemStore,
        clock: &TestingClock,
        config: RecoveryLogConfig,
    ) -> RecoveryLog {
        let store = Arc::new(store.clone());
        RecoveryLog::new(store.clone(), store, Arc::new(clock.clone()), config)
    }

    pub(super) fn payloads(replayed: &ReplayedState) -> Vec<(u32, u64, Vec<u8>)> {
        replayed
            .units
            .iter()
            .map(|unit| {
                (
                    unit.section_id.0,
                    unit.recovery_unit_id.0,
                    unit.payload.clone(),
                )
            })
            .collect()
    }
}

#[test]
fn basic_commit_and_recover() {
    use crate::config::StoreConfig;
    use crate::store::sqlite::SqliteStore;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.sqlite3");
    let scope = FailureScope::new("server1");

    {
        let store = Arc::new(SqliteStore::open(&path, &StoreConfig::default()).unwrap());
        let log = RecoveryLog::with_store(store, testing::config("a"));
        assert!(log.open(&scope).unwrap().units.is_empty());
        log.write_record(SectionId(1), RecoveryUnitId(42), b"P".to_vec())
            .unwrap();
        log.force_flush().unwrap();
        log.close().unwrap();
        assert_eq!(log.state(), LogState::Closed);
    }

    let store = Arc::new(SqliteStore::open(&path, &StoreConfig::default()).unwrap());
    let log = RecoveryLog::with_store(store, testing::config("b"));
    let replayed = log.open(&scope).unwrap();
    assert_eq!(testing::payloads(&replayed), vec![(1, 42, b"P".to_vec())]);
    assert_eq!(replayed.units[0].sequence_number, SequenceNumber(1));
}

#[test]
fn removed_record_not_resurrected() {
    use crate::config::StoreConfig;
    use crate::store::sqlite::SqliteStore;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.sqlite3");
    let scope = FailureScope::new("server1");

    {
        let store = Arc::new(SqliteStore::open(&path, &StoreConfig::default()).unwrap());
        let log = RecoveryLog::with_store(store, testing::config("a"));
        log.open(&scope).unwrap();
        log.write_record(SectionId(1), RecoveryUnitId(42), b"P".to_vec())
            .unwrap();
        log.force_flush().unwrap();
        assert!(log.remove_record(SectionId(1), RecoveryUnitId(42)).unwrap());
        log.force_flush().unwrap();
        log.close().unwrap();
    }

    let store = Arc::new(SqliteStore::open(&path, &StoreConfig::default()).unwrap());
    let log = RecoveryLog::with_store(store, testing::config("a"));
    assert!(log.open(&scope).unwrap().units.is_empty());
    // New writes sort after the discard.
    assert_eq!(
        log.write_record(SectionId(1), RecoveryUnitId(43), b"Q".to_vec())
            .unwrap(),
        SequenceNumber(3)
    );
}

#[test]
fn unflushed_writes_are_not_recovered() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = testing::clock();
    let scope = FailureScope::new("server1");

    let crashed = testing::mem_log(&store, &clock, testing::config("a"));
    crashed.open(&scope).unwrap();
    crashed
        .write_record(SectionId(1), RecoveryUnitId(1), b"durable".to_vec())
        .unwrap();
    crashed.force_flush().unwrap();
    crashed
        .write_record(SectionId(1), RecoveryUnitId(2), b"buffered".to_vec())
        .unwrap();
    drop(crashed);

    // Same identity after a restart.
    let log = testing::mem_log(&store, &clock, testing::config("a"));
    let replayed = log.open(&scope).unwrap();
    assert_eq!(
        testing::payloads(&replayed),
        vec![(1, 1, b"durable".to_vec())]
    );
}

#[test]
fn denied_ownership_loads_nothing() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = testing::clock();
    let scope = FailureScope::new("server1");

    let a = testing::mem_log(&store, &clock, testing::config("a"));
    a.open(&scope).unwrap();
    a.write_record(SectionId(1), RecoveryUnitId(1), b"P".to_vec())
        .unwrap();
    a.force_flush().unwrap();

    let b = testing::mem_log(&store, &clock, testing::config("b"));
    let err = b.open(&scope).unwrap_err();
    assert!(matches!(err, RecoveryLogError::OwnershipDenied { .. }));
    assert_eq!(b.state(), LogState::Closed);
    assert_eq!(b.stats().scope, None);
    assert!(b.stats().sections.is_empty());
    assert!(matches!(
        b.write_record(SectionId(1), RecoveryUnitId(2), Vec::new()),
        Err(RecoveryLogError::InvalidState { .. })
    ));
}

#[test]
fn peer_takes_over_after_expiry() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = testing::clock();
    let scope = FailureScope::new("server1");

    let a = testing::mem_log(&store, &clock, testing::config("a"));
    a.open(&scope).unwrap();
    a.write_record(SectionId(1), RecoveryUnitId(7), b"in doubt".to_vec())
        .unwrap();
    a.force_flush().unwrap();

    let b = testing::mem_log(&store, &clock, testing::config("b"));
    assert!(b.expired_peers().unwrap().is_empty());
    clock.advance(std::time::Duration::from_millis(11_001));
    assert_eq!(b.expired_peers().unwrap(), vec![scope.clone()]);

    let replayed = b.open(&scope).unwrap();
    assert_eq!(
        testing::payloads(&replayed),
        vec![(1, 7, b"in doubt".to_vec())]
    );

    let mut events = a.ownership_events();
    assert!(!a.try_check_ownership());
    assert_eq!(a.state(), LogState::Closed);
    assert_eq!(*events.borrow_and_update(), LeaseState::Lost);
    assert!(matches!(
        a.write_record(SectionId(1), RecoveryUnitId(8), Vec::new()),
        Err(RecoveryLogError::InvalidState { .. })
    ));
    assert!(b.try_check_ownership());
}

#[test]
fn flush_retries_transient_failures() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = testing::clock();
    let scope = FailureScope::new("server1");
    let log = testing::mem_log(&store, &clock, testing::config("a"));
    log.open(&scope).unwrap();

    log.write_record(SectionId(1), RecoveryUnitId(1), b"P".to_vec())
        .unwrap();
    store.fail_next_commits(2);
    log.force_flush().unwrap();
    assert_eq!(store.commit_count(), 1);
    assert_eq!(log.stats().sections[0].pending_changes, 0);
}

#[test]
fn lost_acknowledgement_is_retried_idempotently() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = testing::clock();
    let scope = FailureScope::new("server1");
    let log = testing::mem_log(&store, &clock, testing::config("a"));
    log.open(&scope).unwrap();

    log.write_record(SectionId(1), RecoveryUnitId(1), b"P".to_vec())
        .unwrap();
    store.lose_next_commit_acks(1);
    log.force_flush().unwrap();
    assert_eq!(store.commit_count(), 2);
    assert_eq!(store.row_count(&scope, SectionId(1)), 1);
}

#[test]
fn exhausted_retries_fail_the_log() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = testing::clock();
    let scope = FailureScope::new("server1");
    let log = testing::mem_log(&store, &clock, testing::config("a"));
    log.open(&scope).unwrap();

    log.write_record(SectionId(1), RecoveryUnitId(1), b"P".to_vec())
        .unwrap();
    store.fail_next_commits(10);
    let err = log.force_flush().unwrap_err();
    assert!(matches!(
        err,
        RecoveryLogError::RetriesExhausted { attempts: 3, .. }
    ));
    assert_eq!(log.state(), LogState::Failed);
    assert!(matches!(
        log.write_record(SectionId(1), RecoveryUnitId(2), Vec::new()),
        Err(RecoveryLogError::LogFailed(..))
    ));
    assert!(matches!(log.close(), Err(RecoveryLogError::LogFailed(..))));
    // The lease is left to expire.
    let lease = crate::store::LeaseStore::read_lease(&store, &scope).unwrap();
    assert_eq!(lease.map(|lease| lease.owner), Some(OwnerId::new("a")));
}

#[test]
fn corrupt_record_aborts_open() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = testing::clock();
    let scope = FailureScope::new("server1");
    {
        let log = testing::mem_log(&store, &clock, testing::config("a"));
        log.open(&scope).unwrap();
        log.write_record(SectionId(1), RecoveryUnitId(1), b"good".to_vec())
            .unwrap();
        log.write_record(SectionId(1), RecoveryUnitId(2), b"bad".to_vec())
            .unwrap();
        log.close().unwrap();
    }
    store.overwrite_unit(&scope, SectionId(1), RecoveryUnitId(2), &[1, 0, 0]);

    let log = testing::mem_log(&store, &clock, testing::config("a"));
    let err = log.open(&scope).unwrap_err();
    assert!(matches!(err, RecoveryLogError::CorruptRecord(..)));
    assert_eq!(log.state(), LogState::Failed);
    assert!(matches!(
        log.open(&scope),
        Err(RecoveryLogError::LogFailed(..))
    ));
}

#[test]
fn corrupt_record_quarantined_by_policy() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = testing::clock();
    let scope = FailureScope::new("server1");
    {
        let log = testing::mem_log(&store, &clock, testing::config("a"));
        log.open(&scope).unwrap();
        log.write_record(SectionId(1), RecoveryUnitId(1), b"good".to_vec())
            .unwrap();
        log.write_record(SectionId(1), RecoveryUnitId(2), b"bad".to_vec())
            .unwrap();
        log.close().unwrap();
    }
    store.overwrite_unit(&scope, SectionId(1), RecoveryUnitId(2), &[9]);

    let config = RecoveryLogConfig {
        corrupt_records: CorruptRecordPolicy::Quarantine,
        ..testing::config("a")
    };
    let log = testing::mem_log(&store, &clock, config);
    let replayed = log.open(&scope).unwrap();
    assert_eq!(
        testing::payloads(&replayed),
        vec![(1, 1, b"good".to_vec())]
    );
    assert_eq!(replayed.quarantined.len(), 1);
    assert_eq!(replayed.quarantined[0].section_id, SectionId(1));
}

#[test]
fn cross_section_flush_is_one_commit() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = testing::clock();
    let scope = FailureScope::new("server1");
    let log = testing::mem_log(&store, &clock, testing::config("a"));
    log.open(&scope).unwrap();

    log.write_record(SectionId(1), RecoveryUnitId(1), b"a".to_vec())
        .unwrap();
    log.write_record(SectionId(2), RecoveryUnitId(1), b"b".to_vec())
        .unwrap();
    log.force_flush().unwrap();
    assert_eq!(store.commit_count(), 1);
    // Nothing dirty, nothing committed.
    log.force_flush().unwrap();
    assert_eq!(store.commit_count(), 1);
}

#[test]
fn dead_rows_trigger_keypoint() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = testing::clock();
    let scope = FailureScope::new("server1");
    let mut config = testing::config("a");
    config.keypoint.dead_record_threshold = Some(3);
    let log = testing::mem_log(&store, &clock, config);
    log.open(&scope).unwrap();

    for i in 0..3u8 {
        log.write_record(SectionId(1), RecoveryUnitId(1), vec![i])
            .unwrap();
        log.force_flush().unwrap();
    }
    assert_eq!(store.row_count(&scope, SectionId(1)), 3);

    log.write_record(SectionId(1), RecoveryUnitId(1), vec![3])
        .unwrap();
    log.force_flush().unwrap();
    assert_eq!(store.row_count(&scope, SectionId(1)), 1);
    let stats = log.stats();
    assert_eq!(stats.keypoints, 1);
    assert_eq!(stats.sections[0].dead_rows, 0);
}

#[test]
fn flush_count_triggers_keypoint() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = testing::clock();
    let scope = FailureScope::new("server1");
    let mut config = testing::config("a");
    config.keypoint.after_flushes = Some(2);
    let log = testing::mem_log(&store, &clock, config);
    log.open(&scope).unwrap();

    log.write_record(SectionId(1), RecoveryUnitId(1), b"a".to_vec())
        .unwrap();
    log.force_flush().unwrap();
    assert!(log.remove_record(SectionId(1), RecoveryUnitId(1)).unwrap());
    log.force_flush().unwrap();

    assert_eq!(store.row_count(&scope, SectionId(1)), 0);
    assert_eq!(log.stats().keypoints, 1);
}

#[test]
fn failed_keypoint_leaves_flush_successful() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = testing::clock();
    let scope = FailureScope::new("server1");
    let mut config = testing::config("a");
    config.keypoint.after_flushes = Some(1);
    let log = testing::mem_log(&store, &clock, config);
    log.open(&scope).unwrap();

    store.fail_next_keypoints(10);
    log.write_record(SectionId(1), RecoveryUnitId(1), b"a".to_vec())
        .unwrap();
    log.force_flush().unwrap();
    assert_eq!(log.state(), LogState::Open);
    assert_eq!(log.stats().keypoints, 0);
}

#[test]
fn manual_keypoint_keeps_units() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = testing::clock();
    let scope = FailureScope::new("server1");
    {
        let log = testing::mem_log(&store, &clock, testing::config("a"));
        log.open(&scope).unwrap();
        for (unit, payload) in [(1, b"a1"), (2, b"b1"), (1, b"a2")] {
            log.write_record(SectionId(1), RecoveryUnitId(unit), payload.to_vec())
                .unwrap();
            log.force_flush().unwrap();
        }
        log.keypoint().unwrap();
        assert_eq!(store.row_count(&scope, SectionId(1)), 2);
        log.close().unwrap();
    }

    let log = testing::mem_log(&store, &clock, testing::config("a"));
    let replayed = log.open(&scope).unwrap();
    assert_eq!(
        testing::payloads(&replayed),
        vec![(1, 1, b"a2".to_vec()), (1, 2, b"b1".to_vec())]
    );
}

#[test]
fn retire_needs_no_live_units() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = testing::clock();
    let scope = FailureScope::new("server1");
    let log = testing::mem_log(&store, &clock, testing::config("a"));
    log.open(&scope).unwrap();
    log.write_record(SectionId(1), RecoveryUnitId(1), b"a".to_vec())
        .unwrap();

    assert!(matches!(
        log.retire(),
        Err(RecoveryLogError::RetireRefused { live: 1, .. })
    ));
    assert_eq!(log.state(), LogState::Open);

    log.remove_record(SectionId(1), RecoveryUnitId(1)).unwrap();
    log.retire().unwrap();
    assert_eq!(log.state(), LogState::Closed);
    assert!(store.list_sections(&scope).unwrap().is_empty());
    assert_eq!(
        crate::store::LeaseStore::read_lease(&store, &scope).unwrap(),
        None
    );
}

#[test]
fn cancelled_open_releases_lease() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = testing::clock();
    let scope = FailureScope::new("server1");
    {
        let log = testing::mem_log(&store, &clock, testing::config("a"));
        log.open(&scope).unwrap();
        log.write_record(SectionId(1), RecoveryUnitId(1), b"a".to_vec())
            .unwrap();
        log.close().unwrap();
    }

    let log = testing::mem_log(&store, &clock, testing::config("b"));
    let err = log
        .open_cancellable(&scope, &AtomicBool::new(true))
        .unwrap_err();
    assert!(matches!(err, RecoveryLogError::Cancelled(..)));
    assert_eq!(log.state(), LogState::Closed);
    assert_eq!(
        crate::store::LeaseStore::read_lease(&store, &scope).unwrap(),
        None
    );
    // And can be opened again afterwards.
    assert_eq!(log.open(&scope).unwrap().units.len(), 1);
}

#[test]
fn close_releases_for_peers() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = testing::clock();
    let scope = FailureScope::new("server1");
    let a = testing::mem_log(&store, &clock, testing::config("a"));
    a.open(&scope).unwrap();
    a.write_record(SectionId(3), RecoveryUnitId(9), b"z".to_vec())
        .unwrap();
    a.close().unwrap();
    assert_eq!(*a.ownership_events().borrow(), LeaseState::Released);

    let b = testing::mem_log(&store, &clock, testing::config("b"));
    assert_eq!(
        testing::payloads(&b.open(&scope).unwrap()),
        vec![(3, 9, b"z".to_vec())]
    );
}

#[test]
fn open_twice_is_invalid() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = testing::clock();
    let scope = FailureScope::new("server1");
    let log = testing::mem_log(&store, &clock, testing::config("a"));
    log.open(&scope).unwrap();
    assert!(matches!(
        log.open(&scope),
        Err(RecoveryLogError::InvalidState {
            found: LogState::Open,
            needed: LogState::Closed
        })
    ));
}

#[test]
fn stats_track_sections() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = testing::clock();
    let scope = FailureScope::new("server1");
    let log = testing::mem_log(&store, &clock, testing::config("a"));
    log.open(&scope).unwrap();
    log.write_record(SectionId(1), RecoveryUnitId(1), b"a".to_vec())
        .unwrap();
    log.write_record(SectionId(1), RecoveryUnitId(2), b"b".to_vec())
        .unwrap();
    log.force_flush().unwrap();
    log.write_record(SectionId(1), RecoveryUnitId(1), b"c".to_vec())
        .unwrap();

    let stats = log.stats();
    assert_eq!(stats.state, LogState::Open);
    assert_eq!(stats.lease, LeaseState::Owned);
    assert_eq!(stats.scope, Some(scope));
    assert_eq!(stats.flushes, 1);
    assert_eq!(
        stats.sections,
        vec![SectionStats {
            section_id: SectionId(1),
            live_units: 2,
            pending_changes: 1,
            dead_rows: 0,
            high_water: SequenceNumber(3),
        }]
    );
}

#[test]
fn replay_outlasting_lease_does_not_open() {
    use std::time::Duration;

    use crate::store::in_mem::InMemStore;
    use crate::store::RecordIter;

    /// Replays slower than the lease lasts.
    struct SlowReplay {
        inner: InMemStore,
        clock: crate::clock::TestingClock,
    }

    impl RecoveryLogStore for SlowReplay {
        fn list_sections(&self, scope: &FailureScope) -> Result<Vec<SectionId>> {
            self.inner.list_sections(scope)
        }

        fn open_section(
            &self,
            scope: &FailureScope,
            section_id: SectionId,
        ) -> Result<SectionCursor> {
            self.inner.open_section(scope, section_id)
        }

        fn read_all<'a>(&'a self, cursor: &SectionCursor) -> Result<RecordIter<'a>> {
            self.clock.advance(Duration::from_secs(12));
            self.inner.read_all(cursor)
        }

        fn commit_batch(&self, cursor: &SectionCursor, batch: &Batch) -> Result<()> {
            self.inner.commit_batch(cursor, batch)
        }

        fn keypoint(&self, cursor: &SectionCursor) -> Result<u64> {
            self.inner.keypoint(cursor)
        }

        fn retire_scope(
            &self,
            scope: &FailureScope,
            owner: &OwnerId,
            lease_version: u64,
        ) -> Result<bool> {
            self.inner.retire_scope(scope, owner, lease_version)
        }
    }

    let store = InMemStore::new();
    let clock = testing::clock();
    let scope = FailureScope::new("server1");
    {
        let log = testing::mem_log(&store, &clock, testing::config("a"));
        log.open(&scope).unwrap();
        log.write_record(SectionId(1), RecoveryUnitId(7), b"in doubt".to_vec())
            .unwrap();
        log.close().unwrap();
    }

    let slow = RecoveryLog::new(
        Arc::new(SlowReplay {
            inner: store.clone(),
            clock: clock.clone(),
        }),
        Arc::new(store.clone()),
        Arc::new(clock.clone()),
        testing::config("a"),
    );
    let err = slow.open(&scope).unwrap_err();
    assert!(matches!(err, RecoveryLogError::LeaseLost { .. }));
    assert_eq!(slow.state(), LogState::Closed);
    assert_eq!(slow.stats().scope, None);
    assert!(slow.stats().sections.is_empty());
    assert_eq!(*slow.ownership_events().borrow(), LeaseState::Lost);

    // Only the peer that takes over gets the unit.
    let b = testing::mem_log(&store, &clock, testing::config("b"));
    assert_eq!(
        testing::payloads(&b.open(&scope).unwrap()),
        vec![(1, 7, b"in doubt".to_vec())]
    );
}

#[test]
fn sequence_numbers_not_reused_after_keypoint_and_restart() {
    use crate::config::StoreConfig;
    use crate::store::sqlite::SqliteStore;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.sqlite3");
    let scope = FailureScope::new("server1");

    let high_water = {
        let store = Arc::new(SqliteStore::open(&path, &StoreConfig::default()).unwrap());
        let log = RecoveryLog::with_store(store, testing::config("a"));
        log.open(&scope).unwrap();
        log.write_record(SectionId(1), RecoveryUnitId(1), b"a".to_vec())
            .unwrap();
        log.write_record(SectionId(1), RecoveryUnitId(2), b"b".to_vec())
            .unwrap();
        log.force_flush().unwrap();
        assert!(log.remove_record(SectionId(1), RecoveryUnitId(2)).unwrap());
        log.force_flush().unwrap();
        log.keypoint().unwrap();
        let high_water = log.stats().sections[0].high_water;
        log.close().unwrap();
        high_water
    };
    assert_eq!(high_water, SequenceNumber(3));

    let store = Arc::new(SqliteStore::open(&path, &StoreConfig::default()).unwrap());
    let log = RecoveryLog::with_store(store, testing::config("a"));
    log.open(&scope).unwrap();
    assert_eq!(
        log.write_record(SectionId(1), RecoveryUnitId(3), b"c".to_vec())
            .unwrap(),
        SequenceNumber(4)
    );
}

#[test]
fn concurrent_writes_during_flushes_are_kept() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = testing::clock();
    let scope = FailureScope::new("server1");
    let log = testing::mem_log(&store, &clock, testing::config("a"));
    log.open(&scope).unwrap();

    let writers_done = AtomicBool::new(false);
    let expected: BTreeMap<(u32, u64), Vec<u8>> = std::thread::scope(|s| {
        let flusher = s.spawn(|| {
            let mut flushes = 0;
            loop {
                log.force_flush().unwrap();
                flushes += 1;
                if writers_done.load(Ordering::Acquire) {
                    break flushes;
                }
            }
        });
        let writers: Vec<_> = (0..4u64)
            .map(|t| {
                let log = &log;
                s.spawn(move || {
                    let section = SectionId(1 + (t % 2) as u32);
                    let mut acked = BTreeMap::new();
                    for i in 0..50u64 {
                        let unit = t * 1_000 + i;
                        log.write_record(section, RecoveryUnitId(unit), vec![1])
                            .unwrap();
                        log.write_record(section, RecoveryUnitId(unit), vec![2, t as u8])
                            .unwrap();
                        if i % 5 == 0 {
                            assert!(log.remove_record(section, RecoveryUnitId(unit)).unwrap());
                        } else {
                            acked.insert((section.0, unit), vec![2, t as u8]);
                        }
                    }
                    acked
                })
            })
            .collect();
        let mut expected = BTreeMap::new();
        for writer in writers {
            expected.extend(writer.join().unwrap());
        }
        writers_done.store(true, Ordering::Release);
        assert!(flusher.join().unwrap() > 0);
        expected
    });
    log.force_flush().unwrap();
    drop(log);

    let log = testing::mem_log(&store, &clock, testing::config("a"));
    let replayed = log.open(&scope).unwrap();
    assert_eq!(replayed.units.len(), expected.len());
    let recovered: BTreeMap<(u32, u64), Vec<u8>> = testing::payloads(&replayed)
        .into_iter()
        .map(|(section, unit, payload)| ((section, unit), payload))
        .collect();
    assert_eq!(recovered, expected);
}
