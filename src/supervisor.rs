//! Per-service lifecycle management.
//!
//! Every declared service owns a slot guarded by its own mutex. Actions on
//! one service are serialized through that mutex; actions on different
//! services run independently. The refresh cycle only `try_lock`s a slot, so
//! a service with an action in flight keeps its previous status.
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError},
    thread,
    time::{Duration, Instant},
};
use strum::{AsRefStr, Display, EnumString};
use tracing::{debug, error, info, warn};

use crate::config::ServiceSpec;
use crate::constants::{
    KILL_TIMEOUT, LAUNCH_GRACE, PROCESS_CHECK_INTERVAL, RESTART_PAUSE, STOP_TIMEOUT,
};
use crate::error::{ManagerError, ProbeError};
use crate::host::{LaunchedProcess, ProcessHost, Signal, SignalOutcome, SignalScope};
use crate::probe::{MatchMode, ProcessTable, ServiceStatus, probe_with_table};

/// Lifecycle state of a supervised service.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// No process is backing the service.
    #[default]
    Stopped,
    /// The command was launched and is inside its grace window.
    Starting,
    /// A live process backs the service.
    Running,
    /// Termination was requested and has not completed.
    Stopping,
}

/// Timings used by the supervisor.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    /// How a process command line is compared with a declared command.
    pub match_mode: MatchMode,
    /// How long a launched command must survive to count as started.
    pub launch_grace: Duration,
    /// Time allowed between SIGTERM and SIGKILL.
    pub stop_timeout: Duration,
    /// Time allowed for a process to vanish after SIGKILL.
    pub kill_timeout: Duration,
    /// Pause between the halves of a restart.
    pub restart_pause: Duration,
    /// Interval between liveness checks.
    pub poll_interval: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            match_mode: MatchMode::default(),
            launch_grace: LAUNCH_GRACE,
            stop_timeout: STOP_TIMEOUT,
            kill_timeout: KILL_TIMEOUT,
            restart_pause: RESTART_PAUSE,
            poll_interval: PROCESS_CHECK_INTERVAL,
        }
    }
}

/// What the presentation layer renders for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceView {
    /// Result of the latest probe.
    pub status: ServiceStatus,
    /// Supervisor state.
    pub state: ServiceState,
    /// The most recent failure, cleared by the next start or stop.
    pub last_error: Option<String>,
}

#[derive(Default)]
struct ServiceSlot {
    state: ServiceState,
    pid: Option<u32>,
    process: Option<Box<dyn LaunchedProcess>>,
    last_error: Option<String>,
    last_status: Option<ServiceStatus>,
}

impl ServiceSlot {
    fn mark_stopped(&mut self) {
        self.state = ServiceState::Stopped;
        self.pid = None;
        self.process = None;
    }

    fn view(&self, spec: &ServiceSpec, mode: MatchMode) -> ServiceView {
        let status = self
            .last_status
            .clone()
            .filter(|status| status.spec == *spec)
            .unwrap_or_else(|| ServiceStatus::stopped(spec, mode));
        ServiceView {
            status,
            state: self.state,
            last_error: self.last_error.clone(),
        }
    }
}

type SharedSlot = Arc<Mutex<ServiceSlot>>;

/// Starts, stops and reconciles declared services.
pub struct Supervisor {
    host: Arc<dyn ProcessHost>,
    options: SupervisorOptions,
    slots: Mutex<HashMap<String, SharedSlot>>,
    published: RwLock<HashMap<String, ServiceState>>,
}

impl Supervisor {
    /// Creates a supervisor over `host`.
    pub fn new(host: Arc<dyn ProcessHost>, options: SupervisorOptions) -> Self {
        Self {
            host,
            options,
            slots: Mutex::new(HashMap::new()),
            published: RwLock::new(HashMap::new()),
        }
    }

    /// The OS capabilities in use.
    pub fn host(&self) -> &Arc<dyn ProcessHost> {
        &self.host
    }

    /// The configured timings.
    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    fn slot(&self, name: &str) -> Result<SharedSlot, ManagerError> {
        let mut slots = self.slots.lock()?;
        Ok(Arc::clone(slots.entry(name.to_string()).or_default()))
    }

    /// Current state of `name` without waiting for actions in flight;
    /// unknown services are `Stopped`.
    pub fn state(&self, name: &str) -> ServiceState {
        self.published
            .read()
            .ok()
            .and_then(|states| states.get(name).copied())
            .unwrap_or_default()
    }

    fn publish(&self, name: &str, state: ServiceState) {
        match self.published.write() {
            Ok(mut states) => {
                states.insert(name.to_string(), state);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(name.to_string(), state);
            }
        }
    }

    /// The latest known view of `spec`, waiting for any action in flight.
    pub fn view(&self, spec: &ServiceSpec) -> Result<ServiceView, ManagerError> {
        let slot = self.slot(&spec.name)?;
        let guard = slot.lock()?;
        Ok(guard.view(spec, self.options.match_mode))
    }

    /// Launches `spec`. Only valid from [`ServiceState::Stopped`].
    pub fn start(&self, spec: &ServiceSpec) -> Result<ServiceStatus, ManagerError> {
        let slot = self.slot(&spec.name)?;
        let mut guard = slot.lock()?;
        let result = self.start_locked(&mut guard, spec);
        self.publish(&spec.name, guard.state);
        result
    }

    /// Terminates the recorded process of `name`, escalating to SIGKILL.
    ///
    /// Valid from [`ServiceState::Running`], and from
    /// [`ServiceState::Stopping`] to retry a stop that could not complete.
    pub fn stop(&self, name: &str) -> Result<(), ManagerError> {
        let slot = self.slot(name)?;
        let mut guard = slot.lock()?;
        let result = self.stop_locked(&mut guard, name);
        self.publish(name, guard.state);
        result
    }

    /// Stops `spec` if it is running, then starts it again.
    pub fn restart(&self, spec: &ServiceSpec) -> Result<ServiceStatus, ManagerError> {
        let slot = self.slot(&spec.name)?;
        let mut guard = slot.lock()?;
        let state = guard.state;
        let result = match state {
            ServiceState::Running => self
                .stop_locked(&mut guard, &spec.name)
                .and_then(|_| {
                    thread::sleep(self.options.restart_pause);
                    self.start_locked(&mut guard, spec)
                }),
            ServiceState::Stopped => self.start_locked(&mut guard, spec),
            state => Err(ManagerError::InvalidTransition {
                service: spec.name.clone(),
                state,
                action: "restart",
            }),
        };
        self.publish(&spec.name, guard.state);
        result
    }

    /// Forcefully terminates an arbitrary process named in a conflict report.
    pub fn kill_conflict(&self, pid: u32) -> Result<(), ManagerError> {
        if pid <= 1 || i32::try_from(pid).is_err() || pid == self.host.own_pid() {
            return Err(ManagerError::InvalidTarget(pid));
        }

        info!("Killing conflicting process {pid}");
        match self.host.send_signal(pid, Signal::Kill, SignalScope::Process) {
            Ok(SignalOutcome::NoSuchProcess) => {
                debug!("Process {pid} already gone");
                return Ok(());
            }
            Ok(SignalOutcome::Delivered) => {}
            Err(err) => {
                return Err(ManagerError::ProcessUnkillable {
                    pid,
                    reason: err.to_string(),
                });
            }
        }

        self.reap_owned(pid);
        if self.wait_for_exit(pid, None, self.options.kill_timeout) {
            Ok(())
        } else {
            Err(ManagerError::ProcessUnkillable {
                pid,
                reason: "still alive after SIGKILL".to_string(),
            })
        }
    }

    /// Stops every running service, logging failures.
    pub fn stop_all(&self) -> Vec<(String, ManagerError)> {
        let names: Vec<String> = match self.slots.lock() {
            Ok(slots) => slots.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        };

        let mut failures = Vec::new();
        for name in names {
            if !matches!(
                self.state(&name),
                ServiceState::Running | ServiceState::Stopping
            ) {
                continue;
            }
            if let Err(err) = self.stop(&name) {
                error!("Failed to stop '{name}': {err}");
                failures.push((name, err));
            }
        }
        failures
    }

    /// Stops `name` if needed and drops its slot.
    pub fn forget(&self, name: &str) -> Result<(), ManagerError> {
        if matches!(
            self.state(name),
            ServiceState::Running | ServiceState::Stopping
        ) {
            self.stop(name)?;
        }
        self.slots.lock()?.remove(name);
        if let Ok(mut states) = self.published.write() {
            states.remove(name);
        }
        Ok(())
    }

    /// Moves the state tracked for `old` to `new`, waiting for any action in
    /// flight on `old`.
    pub fn rename(&self, old: &str, new: &str) -> Result<(), ManagerError> {
        if old == new {
            return Ok(());
        }
        let slot = self.slot(old)?;
        let guard = slot.lock()?;
        {
            let mut slots = self.slots.lock()?;
            slots.remove(old);
            slots.insert(new.to_string(), Arc::clone(&slot));
        }
        match self.published.write() {
            Ok(mut states) => {
                states.remove(old);
                states.insert(new.to_string(), guard.state);
            }
            Err(poisoned) => {
                let mut states = poisoned.into_inner();
                states.remove(old);
                states.insert(new.to_string(), guard.state);
            }
        }
        debug!("Service '{old}' is now tracked as '{new}' ({})", guard.state);
        Ok(())
    }

    /// Probes `spec` against `table` and folds the observation into its state.
    ///
    /// Returns `Ok(None)` when an action on the service is in flight.
    pub fn reconcile(
        &self,
        table: &ProcessTable,
        spec: &ServiceSpec,
    ) -> Result<Option<ServiceView>, ProbeError> {
        let slot = match self.slot(&spec.name) {
            Ok(slot) => slot,
            Err(err) => {
                warn!("Skipping reconcile of '{}': {err}", spec.name);
                return Ok(None);
            }
        };
        let mut guard = match slot.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Ok(None),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let exited = match guard.process.as_mut().map(|process| process.try_exit()) {
            Some(Ok(Some(exit))) => Some(exit),
            Some(Err(err)) => {
                warn!("Failed to poll '{}': {err}", spec.name);
                None
            }
            _ => None,
        };
        let recorded = if exited.is_some() { None } else { guard.pid };

        let status = probe_with_table(
            self.host.as_ref(),
            table,
            spec,
            recorded,
            self.options.match_mode,
        )?;

        let state = guard.state;
        match state {
            ServiceState::Running if !status.running => {
                let message = match exited.and_then(|exit| exit.code) {
                    Some(code) => format!("Process exited with code {code}"),
                    None => "Process exited".to_string(),
                };
                let output = guard
                    .process
                    .as_mut()
                    .map(|process| process.output_tail())
                    .unwrap_or_default();
                warn!("Service '{}' is no longer running: {message}", spec.name);
                guard.last_error = Some(if output.is_empty() {
                    message
                } else {
                    format!("{message}: {output}")
                });
                guard.mark_stopped();
            }
            ServiceState::Running => {
                if status.pid != guard.pid {
                    debug!(
                        "Service '{}' now tracked as PID {:?}",
                        spec.name, status.pid
                    );
                    guard.pid = status.pid;
                    guard.process = None;
                }
            }
            ServiceState::Stopped if status.running => {
                info!(
                    "Adopting running process {:?} for service '{}'",
                    status.pid, spec.name
                );
                guard.state = ServiceState::Running;
                guard.pid = status.pid;
            }
            ServiceState::Stopping if !status.running => guard.mark_stopped(),
            _ => {}
        }

        guard.last_status = Some(status);
        self.publish(&spec.name, guard.state);
        Ok(Some(guard.view(spec, self.options.match_mode)))
    }

    fn start_locked(
        &self,
        slot: &mut MutexGuard<'_, ServiceSlot>,
        spec: &ServiceSpec,
    ) -> Result<ServiceStatus, ManagerError> {
        if slot.state != ServiceState::Stopped {
            return Err(ManagerError::InvalidTransition {
                service: spec.name.clone(),
                state: slot.state,
                action: "start",
            });
        }

        let mode = self.options.match_mode;
        let table = ProcessTable::capture(self.host.as_ref())?;
        let preflight = probe_with_table(self.host.as_ref(), &table, spec, None, mode)?;
        if preflight.running {
            let err = ManagerError::AlreadyRunning {
                service: spec.name.clone(),
                pids: preflight.instances.iter().copied().collect(),
            };
            slot.last_error = Some(err.to_string());
            return Err(err);
        }
        if let Some(port) = spec.declared_port()
            && !preflight.expected_port_holders.is_empty()
        {
            let err = ManagerError::PortInUse {
                service: spec.name.clone(),
                port,
                pids: preflight.expected_port_holders.iter().copied().collect(),
            };
            slot.last_error = Some(err.to_string());
            return Err(err);
        }

        info!("Starting service: {}", spec.name);
        slot.last_error = None;
        let mut process = self.host.spawn(&spec.command).map_err(|source| {
            let err = ManagerError::SpawnError {
                service: spec.name.clone(),
                source,
            };
            slot.last_error = Some(err.to_string());
            err
        })?;

        let pid = process.pid();
        slot.state = ServiceState::Starting;
        slot.pid = Some(pid);
        self.publish(&spec.name, ServiceState::Starting);
        debug!("Service '{}' launched with PID {pid}", spec.name);

        let deadline = Instant::now() + self.options.launch_grace;
        loop {
            match process.try_exit() {
                Ok(Some(exit)) => {
                    let err = ManagerError::LaunchError {
                        service: spec.name.clone(),
                        exit_code: exit.code,
                        output: process.output_tail(),
                    };
                    error!("{err}");
                    slot.mark_stopped();
                    slot.last_error = Some(err.to_string());
                    return Err(err);
                }
                Ok(None) => {}
                Err(err) => warn!("Failed to poll '{}' during launch: {err}", spec.name),
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(self.options.poll_interval);
        }

        let status = match ProcessTable::capture(self.host.as_ref())
            .and_then(|table| probe_with_table(self.host.as_ref(), &table, spec, Some(pid), mode))
        {
            Ok(status) => status,
            Err(err) => {
                warn!(
                    "Could not confirm '{}' through the process table: {err}",
                    spec.name
                );
                let mut status = ServiceStatus::stopped(spec, mode);
                status.running = self.host.is_alive(pid);
                status.pid = status.running.then_some(pid);
                status
            }
        };

        if !status.running {
            let exit_code = process.try_exit().ok().flatten().and_then(|exit| exit.code);
            let err = ManagerError::LaunchError {
                service: spec.name.clone(),
                exit_code,
                output: process.output_tail(),
            };
            error!("{err}");
            slot.mark_stopped();
            slot.last_error = Some(err.to_string());
            return Err(err);
        }

        info!("Service '{}' is running with PID {pid}", spec.name);
        slot.state = ServiceState::Running;
        slot.pid = status.pid;
        slot.process = Some(process);
        slot.last_status = Some(status.clone());
        Ok(status)
    }

    fn stop_locked(
        &self,
        slot: &mut MutexGuard<'_, ServiceSlot>,
        name: &str,
    ) -> Result<(), ManagerError> {
        if !matches!(slot.state, ServiceState::Running | ServiceState::Stopping) {
            return Err(ManagerError::InvalidTransition {
                service: name.to_string(),
                state: slot.state,
                action: "stop",
            });
        }

        slot.last_error = None;
        let Some(pid) = slot.pid else {
            debug!("Service '{name}' has no recorded PID");
            slot.mark_stopped();
            return Ok(());
        };

        slot.state = ServiceState::Stopping;
        self.publish(name, ServiceState::Stopping);
        debug!("Stopping service '{name}' (PID {pid})");

        let mut gone = match self
            .host
            .send_signal(pid, Signal::Terminate, SignalScope::Group)
        {
            Ok(SignalOutcome::NoSuchProcess) => true,
            Ok(SignalOutcome::Delivered) => false,
            Err(err) => {
                warn!("Failed to send SIGTERM to '{name}' (PID {pid}): {err}");
                false
            }
        };

        if !gone {
            gone = self.wait_for_exit(pid, slot.process.as_mut(), self.options.stop_timeout);
        }

        if !gone {
            warn!("Service '{name}' did not exit after SIGTERM; sending SIGKILL");
            let outcome = self.host.send_signal(pid, Signal::Kill, SignalScope::Group);
            gone = match outcome {
                Ok(SignalOutcome::NoSuchProcess) => true,
                Ok(SignalOutcome::Delivered) => {
                    self.wait_for_exit(pid, slot.process.as_mut(), self.options.kill_timeout)
                }
                Err(err) => {
                    let err = ManagerError::ProcessUnkillable {
                        pid,
                        reason: err.to_string(),
                    };
                    error!("Failed to forcefully terminate service '{name}': {err}");
                    slot.last_error = Some(err.to_string());
                    return Err(err);
                }
            };
        }

        if !gone {
            let err = ManagerError::ProcessUnkillable {
                pid,
                reason: "still alive after SIGKILL".to_string(),
            };
            error!("Service '{name}': {err}");
            slot.last_error = Some(err.to_string());
            return Err(err);
        }

        slot.mark_stopped();
        info!("Service '{name}' stopped");
        Ok(())
    }

    /// Polls until `pid` is gone, reaping it first when it is our child.
    fn wait_for_exit(
        &self,
        pid: u32,
        mut process: Option<&mut Box<dyn LaunchedProcess>>,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(process) = process.as_mut()
                && matches!(process.try_exit(), Ok(Some(_)))
            {
                return true;
            }
            if !self.host.is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(self.options.poll_interval);
        }
    }

    /// Marks slots whose recorded PID was killed out from under them.
    fn reap_owned(&self, pid: u32) {
        let slots: Vec<(String, SharedSlot)> = match self.slots.lock() {
            Ok(slots) => slots
                .iter()
                .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
                .collect(),
            Err(_) => return,
        };

        for (name, slot) in slots {
            let Ok(mut guard) = slot.try_lock() else {
                continue;
            };
            if guard.pid != Some(pid) {
                continue;
            }
            let deadline = Instant::now() + self.options.kill_timeout;
            while let Some(process) = guard.process.as_mut() {
                if !matches!(process.try_exit(), Ok(None)) || Instant::now() >= deadline {
                    break;
                }
                thread::sleep(self.options.poll_interval);
            }
            warn!("Service '{name}' was killed to resolve a conflict");
            guard.mark_stopped();
            guard.last_error = Some(format!("Killed PID {pid} to resolve a conflict"));
            self.publish(&name, ServiceState::Stopped);
        }
    }
}
