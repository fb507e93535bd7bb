//! Background heartbeat that keeps a held lease alive.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::LeaseManager;
use crate::errors::RecoveryLogError;
use crate::errors::Result;

/// Renews the lease held by a [`LeaseManager`] every renew interval
/// on its own tokio runtime.
///
/// Stops on its own once the lease is lost; the manager has already
/// published the loss on its watch channel by then.
pub struct LeaseRenewer {
    rt: Option<Runtime>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl LeaseRenewer {
    pub fn start(manager: Arc<LeaseManager>) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("recovery-log-lease")
            .enable_time()
            .build()
            .map_err(|err| {
                RecoveryLogError::Store(format!(
                    "error initializing tokio runtime for lease renewal: {err}"
                ))
            })?;
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = rt.spawn(heartbeat(manager, stop_rx));
        Ok(Self {
            rt: Some(rt),
            stop: Some(stop_tx),
            task: Some(task),
        })
    }

    /// Stop renewing and wait for any renewal in flight to finish, so
    /// the lease version is settled before a release.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            // Err only means the heartbeat already exited.
            let _ = stop.send(());
        }
        if let (Some(rt), Some(task)) = (self.rt.as_ref(), self.task.take()) {
            if let Err(err) = rt.block_on(task) {
                tracing::error!("Lease heartbeat task failed: {err}");
            }
        }
        if let Some(rt) = self.rt.take() {
            rt.shutdown_timeout(Duration::from_secs(0));
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map_or(false, |task| !task.is_finished())
    }
}

impl Drop for LeaseRenewer {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        // Dropping a runtime blocks, which panics inside another
        // runtime.
        if let Some(rt) = self.rt.take() {
            rt.shutdown_background();
        }
    }
}

async fn heartbeat(manager: Arc<LeaseManager>, mut stop: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(manager.renew_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick is immediate and the lease was just acquired.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut stop => {
                tracing::debug!("Lease heartbeat of {} stopping", manager.owner());
                break;
            }
            _ = ticker.tick() => {
                let renew_manager = manager.clone();
                match tokio::task::spawn_blocking(move || renew_manager.renew_held()).await {
                    Ok(Ok(_lease)) => {}
                    Ok(Err(err)) if err.is_retryable() => {
                        tracing::warn!("Lease renewal failed, retrying next tick: {err}");
                    }
                    Ok(Err(err)) => {
                        tracing::error!("Lease heartbeat of {} giving up: {err}", manager.owner());
                        break;
                    }
                    Err(err) => {
                        tracing::error!("Lease renewal panicked: {err}");
                        break;
                    }
                }
            }
        }
    }
}

#[test]
fn heartbeat_keeps_lease_fresh() {
    use crate::clock::SystemClock;
    use crate::config::LeaseConfig;
    use crate::model::FailureScope;
    use crate::model::OwnerId;
    use crate::store::in_mem::InMemStore;

    let store = InMemStore::new();
    let manager = Arc::new(LeaseManager::new(
        Arc::new(store.clone()),
        Arc::new(SystemClock),
        LeaseConfig {
            duration_ms: 1_000,
            renew_interval_ms: 20,
            leeway_ms: 0,
        },
        OwnerId::new("a"),
    ));
    let scope = FailureScope::new("server1");
    manager.acquire(&scope).unwrap();

    let mut renewer = LeaseRenewer::start(manager.clone()).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    renewer.stop();

    let version = manager.current().unwrap().version;
    assert!(version > 1, "lease was never renewed");
    let stored = crate::store::LeaseStore::read_lease(&store, &scope)
        .unwrap()
        .unwrap();
    assert_eq!(stored.version, version);
}

#[test]
fn heartbeat_stops_on_takeover() {
    use chrono::TimeZone;
    use chrono::Utc;

    use crate::clock::SystemClock;
    use crate::config::LeaseConfig;
    use crate::lease::LeaseState;
    use crate::model::FailureScope;
    use crate::model::OwnerId;
    use crate::store::in_mem::InMemStore;
    use crate::store::StoredLease;

    let store = InMemStore::new();
    let manager = Arc::new(LeaseManager::new(
        Arc::new(store.clone()),
        Arc::new(SystemClock),
        LeaseConfig {
            duration_ms: 1_000,
            renew_interval_ms: 20,
            leeway_ms: 0,
        },
        OwnerId::new("a"),
    ));
    let scope = FailureScope::new("server1");
    manager.acquire(&scope).unwrap();
    let mut events = manager.subscribe();
    let renewer = LeaseRenewer::start(manager.clone()).unwrap();

    store.force_lease(StoredLease {
        scope: scope.clone(),
        owner: OwnerId::new("b"),
        expiry: Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap(),
        version: 100,
    });

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    rt.block_on(async {
        tokio::time::timeout(
            Duration::from_secs(5),
            events.wait_for(|state| *state == LeaseState::Lost),
        )
        .await
        .unwrap()
        .unwrap();
    });
    std::thread::sleep(Duration::from_millis(50));
    assert!(!renewer.is_running());
}
