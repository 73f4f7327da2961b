//! Entry point for front ends: owns the registry, the supervisor and the
//! latest snapshot.
use std::{
    fmt,
    path::PathBuf,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::config::{Registry, ServiceSpec};
use crate::error::{ManagerError, ProbeError};
use crate::host::{ProcessHost, SystemHost};
use crate::monitor::{Refresher, Snapshot, SnapshotCache, refresh_once};
use crate::supervisor::{Supervisor, SupervisorOptions};

/// A user-triggered operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Start(String),
    Stop(String),
    Restart(String),
    /// Kill a process named in a conflict report.
    KillConflict(u32),
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Start(name) => write!(f, "start {name}"),
            Action::Stop(name) => write!(f, "stop {name}"),
            Action::Restart(name) => write!(f, "restart {name}"),
            Action::KillConflict(pid) => write!(f, "kill PID {pid}"),
        }
    }
}

/// Registry, supervisor and snapshot cache wired together.
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct Manager {
    registry: Arc<Registry>,
    supervisor: Arc<Supervisor>,
    cache: SnapshotCache,
}

impl Manager {
    pub fn new(registry: Registry, host: Arc<dyn ProcessHost>, options: SupervisorOptions) -> Self {
        Self {
            registry: Arc::new(registry),
            supervisor: Arc::new(Supervisor::new(host, options)),
            cache: SnapshotCache::default(),
        }
    }

    /// Opens the registry at `config_path` against the real OS.
    ///
    /// Commands run from the directory holding the registry file.
    pub fn open(config_path: impl Into<PathBuf>, options: SupervisorOptions) -> Self {
        let registry = Registry::open(config_path);
        let mut host = SystemHost::new();
        if let Some(dir) = registry
            .path()
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
        {
            host = host.with_working_dir(dir);
        }
        Self::new(registry, Arc::new(host), options)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.cache.snapshot()
    }

    /// Runs one refresh cycle now and publishes its result.
    pub fn refresh(&self) -> Result<Arc<Snapshot>, ProbeError> {
        let previous = self.cache.snapshot();
        let snapshot = refresh_once(&self.registry, &self.supervisor, &previous)?;
        self.cache.replace(snapshot);
        Ok(self.cache.snapshot())
    }

    /// Refreshes in the background every `interval` until the returned
    /// handle is stopped or dropped.
    pub fn start_refresher(&self, interval: Duration) -> Refresher {
        let registry = Arc::clone(&self.registry);
        let supervisor = Arc::clone(&self.supervisor);
        Refresher::spawn(self.cache.clone(), interval, move |previous| {
            refresh_once(&registry, &supervisor, previous)
        })
    }

    fn spec(&self, name: &str) -> Result<ServiceSpec, ManagerError> {
        self.registry
            .get(name)
            .ok_or_else(|| ManagerError::ServiceNotFound(name.to_string()))
    }

    /// Runs `action` on the calling thread, then refreshes.
    pub fn perform(&self, action: Action) -> Result<(), ManagerError> {
        debug!("Performing action: {action}");
        let result = match &action {
            Action::Start(name) => self
                .spec(name)
                .and_then(|spec| self.supervisor.start(&spec))
                .map(|_| ()),
            Action::Stop(name) => self
                .spec(name)
                .and_then(|spec| self.supervisor.stop(&spec.name)),
            Action::Restart(name) => self
                .spec(name)
                .and_then(|spec| self.supervisor.restart(&spec))
                .map(|_| ()),
            Action::KillConflict(pid) => self.supervisor.kill_conflict(*pid),
        };

        if let Err(err) = self.refresh() {
            warn!("Refresh after '{action}' failed: {err}");
        }
        result
    }

    /// Runs `action` on its own thread.
    pub fn dispatch(&self, action: Action) -> JoinHandle<Result<(), ManagerError>> {
        let manager = self.clone();
        thread::spawn(move || manager.perform(action))
    }

    /// Declares a new service.
    pub fn add_service(&self, spec: ServiceSpec) -> Result<(), ManagerError> {
        self.registry.add(spec)
    }

    /// Replaces the declaration of `name`. A renamed service keeps its
    /// process and state under the new name.
    pub fn update_service(&self, name: &str, spec: ServiceSpec) -> Result<(), ManagerError> {
        let new_name = spec.name.clone();
        self.registry.update(name, spec)?;
        if new_name != name {
            self.supervisor.rename(name, &new_name)?;
        }
        Ok(())
    }

    /// Stops `name` if it runs, then removes it from the registry.
    pub fn remove_service(&self, name: &str) -> Result<ServiceSpec, ManagerError> {
        self.spec(name)?;
        self.supervisor.forget(name)?;
        self.registry.remove(name)
    }

    /// Stops every running service.
    pub fn shutdown(&self) -> Vec<(String, ManagerError)> {
        info!("Stopping all running services");
        self.supervisor.stop_all()
    }
}
