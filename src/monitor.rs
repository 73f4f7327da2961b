//! Periodic refresh of service statuses into immutable snapshots.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};
use tracing::{debug, error, warn};

use crate::config::Registry;
use crate::conflict::{ConflictReport, detect};
use crate::constants::{PERSISTENT_PROBE_FAILURES, REFRESH_SLEEP_STEP};
use crate::error::ProbeError;
use crate::probe::{ProcessTable, ServiceStatus};
use crate::supervisor::{ServiceView, Supervisor};

/// Everything one refresh cycle observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    /// When the cycle finished.
    pub captured_at: DateTime<Utc>,
    /// One view per declared service, in registry order.
    pub services: Vec<ServiceView>,
    /// Conflicts across `services`.
    pub conflicts: ConflictReport,
    /// Set once probing has failed several cycles in a row.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_error: Option<String>,
}

impl Snapshot {
    /// A snapshot with no services.
    pub fn empty() -> Self {
        Self {
            captured_at: Utc::now(),
            services: Vec::new(),
            conflicts: ConflictReport::default(),
            probe_error: None,
        }
    }

    /// The view of the service called `name`.
    pub fn service(&self, name: &str) -> Option<&ServiceView> {
        self.services
            .iter()
            .find(|view| view.status.spec.name == name)
    }
}

/// Thread-safe handle to the most recent snapshot.
///
/// Snapshots are never mutated; a refresh swaps in a new one.
#[derive(Clone)]
pub struct SnapshotCache {
    inner: Arc<RwLock<Arc<Snapshot>>>,
}

impl SnapshotCache {
    pub fn new(initial: Snapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// Publishes `snapshot`.
    pub fn replace(&self, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        match self.inner.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new(Snapshot::empty())
    }
}

/// Probes every declared service once and computes conflicts.
///
/// The process table is captured once for the whole cycle. A service with an
/// action in flight keeps its view from `previous`, with its current state.
pub fn refresh_once(
    registry: &Registry,
    supervisor: &Supervisor,
    previous: &Snapshot,
) -> Result<Snapshot, ProbeError> {
    let table = ProcessTable::capture(supervisor.host().as_ref())?;
    let mode = supervisor.options().match_mode;

    let mut services = Vec::new();
    for spec in registry.specs() {
        let view = match supervisor.reconcile(&table, &spec)? {
            Some(view) => view,
            None => {
                debug!("Service '{}' is busy; keeping its last status", spec.name);
                let mut view = previous
                    .service(&spec.name)
                    .filter(|view| view.status.spec == spec)
                    .cloned()
                    .unwrap_or_else(|| ServiceView {
                        status: ServiceStatus::stopped(&spec, mode),
                        state: Default::default(),
                        last_error: None,
                    });
                view.state = supervisor.state(&spec.name);
                view
            }
        };
        services.push(view);
    }

    let statuses: Vec<ServiceStatus> = services.iter().map(|view| view.status.clone()).collect();
    let conflicts = detect(&statuses);
    if !conflicts.is_empty() {
        debug!(
            "Detected {} port conflict(s) and {} duplicate group(s)",
            conflicts.port_conflicts.len(),
            conflicts.duplicate_groups.len()
        );
    }

    Ok(Snapshot {
        captured_at: Utc::now(),
        services,
        conflicts,
        probe_error: None,
    })
}

/// Background worker that periodically refreshes a [`SnapshotCache`].
///
/// A failed cycle leaves the published snapshot untouched. After
/// [`PERSISTENT_PROBE_FAILURES`] failures in a row the last snapshot is
/// republished with `probe_error` set.
pub struct Refresher {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Refresher {
    pub fn spawn<F>(cache: SnapshotCache, interval: Duration, mut builder: F) -> Self
    where
        F: FnMut(&Snapshot) -> Result<Snapshot, ProbeError> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let mut failures = 0u32;
            while !stop_clone.load(Ordering::SeqCst) {
                let previous = cache.snapshot();
                match builder(&previous) {
                    Ok(snapshot) => {
                        if failures > 0 {
                            debug!("Probe recovered after {failures} failed refresh(es)");
                        }
                        failures = 0;
                        cache.replace(snapshot);
                    }
                    Err(err) => {
                        failures += 1;
                        if failures >= PERSISTENT_PROBE_FAILURES {
                            error!("Failed to refresh status snapshot ({failures} in a row): {err}");
                            let mut stale = (*previous).clone();
                            stale.probe_error = Some(err.to_string());
                            cache.replace(stale);
                        } else {
                            warn!("Failed to refresh status snapshot: {err}");
                        }
                    }
                }

                let mut slept = Duration::ZERO;
                while slept < interval {
                    if stop_clone.load(Ordering::SeqCst) {
                        return;
                    }

                    let step = interval.saturating_sub(slept).min(REFRESH_SLEEP_STEP);
                    thread::sleep(step);
                    slept += step;
                }
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Refresher {
    fn drop(&mut self) {
        self.halt();
    }
}
