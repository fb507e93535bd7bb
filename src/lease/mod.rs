//! Exclusive, time-bounded ownership of a failure scope.
//!
//! A [`LeaseManager`] acquires, renews and releases the lease row of
//! one failure scope on behalf of one owner. Every write to the row is
//! a compare-and-swap on its version, so when several servers race
//! exactly one wins.
//!
//! Another owner's lease counts as expired only once its stored
//! deadline plus the configured leeway has passed on our wall clock.
//! Our own lease is judged with the monotonic clock against the
//! instant we started the write that last extended it, so we always
//! give up before any peer can take over.
//!
//! Ownership changes are published on a [`watch`] channel so the
//! transaction manager hears about loss without polling.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;
use tokio::sync::watch;
use tracing::instrument;

use crate::clock::Clock;
use crate::config::LeaseConfig;
use crate::errors::RecoveryLogError;
use crate::errors::Result;
use crate::model::FailureScope;
use crate::model::OwnerId;
use crate::store::LeaseStore;
use crate::store::StoredLease;

pub mod renewer;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LeaseState {
    Unowned,
    Acquiring,
    Owned,
    Renewing,
    /// Renewal failed or another owner took over; in-memory state must
    /// be dropped.
    Lost,
    Released,
}

/// A held lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub scope: FailureScope,
    pub owner: OwnerId,
    /// Incremented on every acquire and renew.
    pub version: u64,
    /// Deadline as stored, for other servers to read.
    pub expiry: DateTime<Utc>,
    valid_until: Instant,
}

impl Lease {
    /// Local deadline on the monotonic clock.
    pub fn valid_until(&self) -> Instant {
        self.valid_until
    }

    fn stored(&self) -> StoredLease {
        StoredLease {
            scope: self.scope.clone(),
            owner: self.owner.clone(),
            expiry: self.expiry,
            version: self.version,
        }
    }
}

fn add_millis(at: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
    let ms = i64::try_from(ms).unwrap_or(i64::MAX);
    at.checked_add_signed(chrono::Duration::milliseconds(ms))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    config: LeaseConfig,
    owner: OwnerId,
    held: Mutex<Option<Lease>>,
    status: watch::Sender<LeaseState>,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        config: LeaseConfig,
        owner: OwnerId,
    ) -> Self {
        let (status, _) = watch::channel(LeaseState::Unowned);
        Self {
            store,
            clock,
            config,
            owner,
            held: Mutex::new(None),
            status,
        }
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn renew_interval(&self) -> Duration {
        self.config.renew_interval()
    }

    pub fn state(&self) -> LeaseState {
        *self.status.borrow()
    }

    /// Watch every ownership transition from now on.
    pub fn subscribe(&self) -> watch::Receiver<LeaseState> {
        self.status.subscribe()
    }

    fn set_state(&self, state: LeaseState) {
        let prev = self.status.send_replace(state);
        if prev != state {
            tracing::debug!("Lease state of {} {prev:?} -> {state:?}", self.owner);
        }
    }

    fn held(&self) -> MutexGuard<'_, Option<Lease>> {
        // The guarded value is replaced whole, so a poisoned lock
        // still holds a consistent lease.
        self.held.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// The lease currently held, if any.
    pub fn current(&self) -> Option<Lease> {
        self.held().clone()
    }

    /// Whether we hold a lease that is still valid on the local
    /// monotonic clock.
    pub fn check_local(&self) -> bool {
        match (self.state(), self.held().as_ref()) {
            (LeaseState::Owned | LeaseState::Renewing, Some(lease)) => {
                self.clock.instant() < lease.valid_until
            }
            _ => false,
        }
    }

    fn is_expired(&self, lease: &StoredLease, now: DateTime<Utc>) -> bool {
        now > add_millis(lease.expiry, self.config.leeway_ms)
    }

    fn new_lease(&self, scope: &FailureScope, version: u64, started: Instant) -> Lease {
        Lease {
            scope: scope.clone(),
            owner: self.owner.clone(),
            version,
            expiry: add_millis(self.clock.now(), self.config.duration_ms),
            valid_until: started + self.config.duration(),
        }
    }

    /// Take the lease on `scope` if nobody else holds an unexpired
    /// one.
    ///
    /// Fails with [`RecoveryLogError::OwnershipDenied`] if someone
    /// else does, including when another server wins a race for the
    /// same row.
    #[instrument(name = "lease_acquire", skip(self), fields(owner = %self.owner))]
    pub fn acquire(&self, scope: &FailureScope) -> Result<Lease> {
        self.set_state(LeaseState::Acquiring);
        match self.try_acquire(scope) {
            Ok(lease) => {
                tracing::info!(
                    "Acquired lease on {scope} at version {} until {}",
                    lease.version,
                    lease.expiry
                );
                *self.held() = Some(lease.clone());
                self.set_state(LeaseState::Owned);
                Ok(lease)
            }
            Err(err) => {
                tracing::debug!("Could not acquire lease on {scope}: {err}");
                self.set_state(LeaseState::Unowned);
                Err(err)
            }
        }
    }

    fn try_acquire(&self, scope: &FailureScope) -> Result<Lease> {
        let started = self.clock.instant();
        let won = match self.store.read_lease(scope)? {
            None => {
                let lease = self.new_lease(scope, 1, started);
                self.store
                    .insert_lease(&lease.stored())?
                    .then_some(lease)
            }
            Some(held) => {
                if held.owner != self.owner {
                    if !self.is_expired(&held, self.clock.now()) {
                        return Err(RecoveryLogError::OwnershipDenied {
                            scope: scope.clone(),
                            holder: held.owner,
                            expiry: held.expiry,
                        });
                    }
                    tracing::info!(
                        "Taking over {scope} from {}; its lease expired at {}",
                        held.owner,
                        held.expiry
                    );
                }
                let lease = self.new_lease(scope, held.version + 1, started);
                self.store
                    .swap_lease(held.version, &lease.stored())?
                    .then_some(lease)
            }
        };

        match won {
            Some(lease) => Ok(lease),
            // Lost the race; report whoever won.
            None => match self.store.read_lease(scope)? {
                Some(winner) => Err(RecoveryLogError::OwnershipDenied {
                    scope: scope.clone(),
                    holder: winner.owner,
                    expiry: winner.expiry,
                }),
                None => Err(RecoveryLogError::StoreUnavailable(format!(
                    "lease on {scope} changed while acquiring"
                ))),
            },
        }
    }

    /// Extend a held lease.
    ///
    /// A version mismatch means someone else took the scope over and
    /// is [`RecoveryLogError::LeaseLost`], unless the row is ours one
    /// version ahead: an earlier renewal landed without being
    /// acknowledged, and renewal continues from it. A retryable store
    /// error is returned as is while the lease is still locally valid,
    /// and becomes `LeaseLost` once it is not.
    #[instrument(name = "lease_renew", skip(self, lease), fields(scope = %lease.scope, version = lease.version))]
    pub fn renew(&self, lease: &Lease) -> Result<Lease> {
        self.set_state(LeaseState::Renewing);
        let started = self.clock.instant();
        let mut renewed = self.new_lease(&lease.scope, lease.version + 1, started);

        let mut swapped = self.store.swap_lease(lease.version, &renewed.stored());
        if let Ok(false) = swapped {
            if let Ok(Some(current)) = self.store.read_lease(&lease.scope) {
                if current.owner == self.owner && current.version == renewed.version {
                    tracing::debug!(
                        "Unacknowledged renewal of lease on {} to version {} had landed",
                        lease.scope,
                        current.version
                    );
                    renewed = self.new_lease(&lease.scope, current.version + 1, started);
                    swapped = self.store.swap_lease(current.version, &renewed.stored());
                }
            }
        }

        match swapped {
            Ok(true) => {
                tracing::trace!(
                    "Renewed lease on {} to version {} until {}",
                    renewed.scope,
                    renewed.version,
                    renewed.expiry
                );
                *self.held() = Some(renewed.clone());
                self.set_state(LeaseState::Owned);
                Ok(renewed)
            }
            Ok(false) => {
                let reason = match self.store.read_lease(&lease.scope) {
                    Ok(Some(current)) => format!(
                        "now held by {} at version {}",
                        current.owner, current.version
                    ),
                    Ok(None) => "lease row was deleted".to_owned(),
                    Err(err) => format!("lease row changed; re-reading it failed: {err}"),
                };
                Err(self.lose(&lease.scope, reason))
            }
            Err(err) if err.is_retryable() && started < lease.valid_until => {
                tracing::warn!("Renewal of lease on {} failed; will retry: {err}", lease.scope);
                self.set_state(LeaseState::Owned);
                Err(err)
            }
            Err(err) => Err(self.lose(
                &lease.scope,
                format!("could not renew before local expiry: {err}"),
            )),
        }
    }

    /// Renew whatever lease is currently held.
    pub fn renew_held(&self) -> Result<Lease> {
        let lease = self
            .current()
            .ok_or_else(|| RecoveryLogError::Store(format!("{} holds no lease", self.owner)))?;
        self.renew(&lease)
    }

    /// Mark the lease lost and forget it.
    pub fn lose(&self, scope: &FailureScope, reason: String) -> RecoveryLogError {
        tracing::warn!("Lost lease on {scope}: {reason}");
        *self.held() = None;
        self.set_state(LeaseState::Lost);
        RecoveryLogError::LeaseLost {
            scope: scope.clone(),
            reason,
        }
    }

    /// Give the lease up so another server can take over without
    /// waiting for expiry. Failures are logged, not returned; the
    /// lease then simply runs out.
    #[instrument(name = "lease_release", skip(self, lease), fields(scope = %lease.scope))]
    pub fn release(&self, lease: &Lease) {
        match self
            .store
            .delete_lease(&lease.scope, &lease.owner, lease.version)
        {
            Ok(true) => tracing::info!("Released lease on {}", lease.scope),
            Ok(false) => tracing::warn!(
                "Lease on {} moved before release at version {}",
                lease.scope,
                lease.version
            ),
            Err(err) => tracing::warn!(
                "Could not release lease on {}; it will expire at {}: {err}",
                lease.scope,
                lease.expiry
            ),
        }
        *self.held() = None;
        self.set_state(LeaseState::Released);
    }

    /// Forget the held lease after it was deleted by other means.
    pub(crate) fn forget(&self) {
        *self.held() = None;
        self.set_state(LeaseState::Released);
    }

    /// Leases held by other owners that have expired: scopes whose
    /// logs can be recovered by this server.
    pub fn expired_peers(&self) -> Result<Vec<StoredLease>> {
        let now = self.clock.now();
        Ok(self
            .store
            .read_leases()?
            .into_iter()
            .filter(|lease| lease.owner != self.owner && self.is_expired(lease, now))
            .collect())
    }
}

#[cfg(test)]
fn test_config() -> LeaseConfig {
    LeaseConfig {
        duration_ms: 10_000,
        renew_interval_ms: 2_000,
        leeway_ms: 1_000,
    }
}

#[cfg(test)]
fn test_clock() -> crate::clock::TestingClock {
    use chrono::TimeZone;

    crate::clock::TestingClock::new(Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap())
}

#[cfg(test)]
fn manager(
    store: &crate::store::in_mem::InMemStore,
    clock: &crate::clock::TestingClock,
    owner: &str,
) -> LeaseManager {
    LeaseManager::new(
        Arc::new(store.clone()),
        Arc::new(clock.clone()),
        test_config(),
        OwnerId::new(owner),
    )
}

#[test]
fn first_acquire_wins() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = test_clock();
    let a = manager(&store, &clock, "a");
    let scope = FailureScope::new("server1");

    let lease = a.acquire(&scope).unwrap();
    assert_eq!(lease.version, 1);
    assert_eq!(a.state(), LeaseState::Owned);
    assert!(a.check_local());
}

#[test]
fn unexpired_lease_denies_others() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = test_clock();
    let a = manager(&store, &clock, "a");
    let b = manager(&store, &clock, "b");
    let scope = FailureScope::new("server1");
    a.acquire(&scope).unwrap();

    // Past the stored expiry but inside the leeway.
    clock.advance(Duration::from_millis(10_500));
    let err = b.acquire(&scope).unwrap_err();
    assert!(matches!(
        err,
        RecoveryLogError::OwnershipDenied { ref holder, .. } if holder == &OwnerId::new("a")
    ));
    assert_eq!(b.state(), LeaseState::Unowned);
}

#[test]
fn takeover_after_expiry_and_leeway() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = test_clock();
    let a = manager(&store, &clock, "a");
    let b = manager(&store, &clock, "b");
    let scope = FailureScope::new("server1");
    let a_lease = a.acquire(&scope).unwrap();

    assert!(b.expired_peers().unwrap().is_empty());
    clock.advance(Duration::from_millis(11_001));
    assert!(!a.check_local());
    assert_eq!(b.expired_peers().unwrap().len(), 1);

    let b_lease = b.acquire(&scope).unwrap();
    assert_eq!(b_lease.version, 2);

    let mut events = a.subscribe();
    let err = a.renew(&a_lease).unwrap_err();
    assert!(matches!(err, RecoveryLogError::LeaseLost { .. }));
    assert_eq!(a.state(), LeaseState::Lost);
    assert!(events.has_changed().unwrap());
    assert_eq!(*events.borrow_and_update(), LeaseState::Lost);
    assert_eq!(a.current(), None);
}

#[test]
fn renew_bumps_version_and_extends() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = test_clock();
    let a = manager(&store, &clock, "a");
    let scope = FailureScope::new("server1");
    let first = a.acquire(&scope).unwrap();

    clock.advance(Duration::from_secs(5));
    let second = a.renew(&first).unwrap();
    assert_eq!(second.version, 2);
    assert!(second.expiry > first.expiry);
    assert!(second.valid_until() > first.valid_until());
    assert_eq!(a.current(), Some(second));
}

#[test]
fn renew_continues_from_unacknowledged_renewal() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = test_clock();
    let a = manager(&store, &clock, "a");
    let scope = FailureScope::new("server1");
    let first = a.acquire(&scope).unwrap();

    // The renewal to version 2 committed but its reply never arrived.
    store.force_lease(StoredLease {
        version: 2,
        ..first.stored()
    });
    let renewed = a.renew(&first).unwrap();
    assert_eq!(renewed.version, 3);
    assert_eq!(a.state(), LeaseState::Owned);
    assert_eq!(store.read_lease(&scope).unwrap().map(|l| l.version), Some(3));

    // Further ahead than one renewal is somebody else's doing.
    store.force_lease(StoredLease {
        version: 5,
        ..renewed.stored()
    });
    let err = a.renew(&renewed).unwrap_err();
    assert!(matches!(err, RecoveryLogError::LeaseLost { .. }));
    assert_eq!(a.state(), LeaseState::Lost);
}

#[test]
fn unavailable_store_while_still_valid_is_retryable() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = test_clock();
    let a = manager(&store, &clock, "a");
    let scope = FailureScope::new("server1");
    let lease = a.acquire(&scope).unwrap();

    store.set_unavailable(true);
    let err = a.renew(&lease).unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(a.state(), LeaseState::Owned);

    clock.advance(Duration::from_secs(10));
    let err = a.renew(&lease).unwrap_err();
    assert!(matches!(err, RecoveryLogError::LeaseLost { .. }));
    assert_eq!(a.state(), LeaseState::Lost);
}

#[test]
fn release_lets_others_in_immediately() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = test_clock();
    let a = manager(&store, &clock, "a");
    let b = manager(&store, &clock, "b");
    let scope = FailureScope::new("server1");
    let lease = a.acquire(&scope).unwrap();

    a.release(&lease);
    assert_eq!(a.state(), LeaseState::Released);
    assert_eq!(b.acquire(&scope).unwrap().version, 1);
}

#[test]
fn same_owner_reacquires_own_lease() {
    let store = crate::store::in_mem::InMemStore::new();
    let clock = test_clock();
    let scope = FailureScope::new("server1");
    manager(&store, &clock, "a").acquire(&scope).unwrap();

    // A restarted process with the same identity.
    let lease = manager(&store, &clock, "a").acquire(&scope).unwrap();
    assert_eq!(lease.version, 2);
}

#[test]
fn racing_acquires_have_one_winner() {
    use std::sync::Barrier;

    use crate::config::StoreConfig;
    use crate::store::sqlite::SqliteStore;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.sqlite3");
    let clock = test_clock();
    let scope = FailureScope::new("server1");
    // Open sequentially so only the first runs the migrations.
    let managers: Vec<_> = (0..6)
        .map(|i| {
            let store = SqliteStore::open(&path, &StoreConfig::default()).unwrap();
            LeaseManager::new(
                Arc::new(store),
                Arc::new(clock.clone()),
                test_config(),
                OwnerId::new(format!("server{i}")),
            )
        })
        .collect();
    let barrier = Barrier::new(managers.len());

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = managers
            .iter()
            .map(|manager| {
                s.spawn(|| {
                    barrier.wait();
                    manager.acquire(&scope)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners = results.iter().filter(|res| res.is_ok()).count();
    assert_eq!(winners, 1);
    for res in results.iter().filter_map(|res| res.as_ref().err()) {
        assert!(matches!(res, RecoveryLogError::OwnershipDenied { .. }));
    }
}
