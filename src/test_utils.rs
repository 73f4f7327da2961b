//! In-memory [`ProcessHost`] for exercising the supervisor without touching
//! real processes.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    io,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use crate::constants::{DEFAULT_SHELL, SHELL_COMMAND_FLAG};
use crate::error::ProbeError;
use crate::host::{
    ExitInfo, LaunchedProcess, ProcessEntry, ProcessHost, Signal, SignalOutcome, SignalScope,
};
use crate::supervisor::SupervisorOptions;

/// PID the fake host reports for the supervisor itself.
pub const FAKE_OWN_PID: u32 = 99_999;

/// Supervisor timings short enough for tests.
pub fn fast_options() -> SupervisorOptions {
    SupervisorOptions {
        launch_grace: Duration::from_millis(20),
        stop_timeout: Duration::from_millis(60),
        kill_timeout: Duration::from_millis(60),
        restart_pause: Duration::ZERO,
        poll_interval: Duration::from_millis(5),
        ..SupervisorOptions::default()
    }
}

/// What a command does once the fake host launches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnBehavior {
    /// Keeps running and listens on `ports`.
    Run { ports: Vec<u16> },
    /// Exits before the launch grace window ends.
    ExitImmediately { code: i32, output: String },
    /// Keeps running and only dies on SIGKILL.
    IgnoreTerm,
    /// Survives every signal.
    Unkillable,
}

impl Default for SpawnBehavior {
    fn default() -> Self {
        SpawnBehavior::Run { ports: Vec::new() }
    }
}

#[derive(Debug, Clone, Default)]
struct FakeProcess {
    parent: Option<u32>,
    argv: Vec<String>,
    ports: BTreeSet<u16>,
    zombie: bool,
    ignores_term: bool,
    unkillable: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    next_pid: u32,
    processes: BTreeMap<u32, FakeProcess>,
    exits: HashMap<u32, Option<i32>>,
    plans: HashMap<String, SpawnBehavior>,
    spawned: Vec<String>,
    signals: Vec<(u32, Signal, SignalScope)>,
    failing_lists: usize,
}

impl FakeState {
    fn descendants(&self, pid: u32) -> Vec<u32> {
        let mut found = vec![pid];
        let mut index = 0;
        while index < found.len() {
            let current = found[index];
            found.extend(
                self.processes
                    .iter()
                    .filter(|(_, process)| process.parent == Some(current))
                    .map(|(child, _)| *child),
            );
            index += 1;
        }
        found
    }

    fn terminate(&mut self, pid: u32, code: Option<i32>) {
        if self.processes.remove(&pid).is_some() {
            self.exits.insert(pid, code);
        }
    }
}

/// A process table held in memory.
///
/// Clones share state, so a test can keep a handle while the supervisor owns
/// another.
#[derive(Debug, Clone)]
pub struct FakeHost {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                next_pid: 1000,
                ..FakeState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds a process running `command` under init.
    pub fn insert_process(&self, pid: u32, command: &str) {
        self.insert_child(pid, 1, command);
    }

    /// Adds a process running `command` under `parent`.
    pub fn insert_child(&self, pid: u32, parent: u32, command: &str) {
        self.lock().processes.insert(
            pid,
            FakeProcess {
                parent: Some(parent),
                argv: command.split_whitespace().map(str::to_string).collect(),
                ..FakeProcess::default()
            },
        );
    }

    /// Makes `pid` listen on `port`.
    pub fn bind(&self, pid: u32, port: u16) {
        if let Some(process) = self.lock().processes.get_mut(&pid) {
            process.ports.insert(port);
        }
    }

    /// Flags `pid` as exited but unreaped.
    pub fn set_zombie(&self, pid: u32) {
        if let Some(process) = self.lock().processes.get_mut(&pid) {
            process.zombie = true;
        }
    }

    /// Simulates `pid` exiting on its own with `code`.
    pub fn exit_process(&self, pid: u32, code: i32) {
        self.lock().terminate(pid, Some(code));
    }

    /// Decides what launching `command` does.
    pub fn plan_spawn(&self, command: &str, behavior: SpawnBehavior) {
        self.lock().plans.insert(command.to_string(), behavior);
    }

    /// Makes the next `count` process listings fail.
    pub fn fail_next_lists(&self, count: usize) {
        self.lock().failing_lists = count;
    }

    /// Commands launched so far, in order.
    pub fn spawned(&self) -> Vec<String> {
        self.lock().spawned.clone()
    }

    /// Signals delivered so far, in order.
    pub fn signals(&self) -> Vec<(u32, Signal, SignalScope)> {
        self.lock().signals.clone()
    }

    /// Whether `pid` is in the table.
    pub fn contains(&self, pid: u32) -> bool {
        self.lock().processes.contains_key(&pid)
    }

    /// PIDs currently in the table.
    pub fn pids(&self) -> BTreeSet<u32> {
        self.lock().processes.keys().copied().collect()
    }
}

impl ProcessHost for FakeHost {
    fn list_processes(&self) -> Result<Vec<ProcessEntry>, ProbeError> {
        let mut state = self.lock();
        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            return Err(ProbeError::ProcessTable("injected failure".to_string()));
        }
        Ok(state
            .processes
            .iter()
            .map(|(pid, process)| ProcessEntry {
                pid: *pid,
                parent: process.parent,
                argv: process.argv.clone(),
                zombie: process.zombie,
            })
            .collect())
    }

    fn process_ports(&self, pids: &BTreeSet<u32>) -> Result<BTreeSet<u16>, ProbeError> {
        let state = self.lock();
        Ok(pids
            .iter()
            .filter_map(|pid| state.processes.get(pid))
            .flat_map(|process| process.ports.iter().copied())
            .collect())
    }

    fn port_listeners(&self, port: u16) -> Result<BTreeSet<u32>, ProbeError> {
        Ok(self
            .lock()
            .processes
            .iter()
            .filter(|(_, process)| process.ports.contains(&port))
            .map(|(pid, _)| *pid)
            .collect())
    }

    fn send_signal(
        &self,
        pid: u32,
        signal: Signal,
        scope: SignalScope,
    ) -> io::Result<SignalOutcome> {
        let mut state = self.lock();
        state.signals.push((pid, signal, scope));
        if !state.processes.contains_key(&pid) {
            return Ok(SignalOutcome::NoSuchProcess);
        }

        let targets = match scope {
            SignalScope::Process => vec![pid],
            SignalScope::Group => state.descendants(pid),
        };
        for target in targets {
            let Some(process) = state.processes.get(&target) else {
                continue;
            };
            let dies = match signal {
                Signal::Terminate => !process.ignores_term && !process.unkillable,
                Signal::Kill => !process.unkillable,
            };
            if dies {
                state.terminate(target, None);
            }
        }
        Ok(SignalOutcome::Delivered)
    }

    fn spawn(&self, command: &str) -> io::Result<Box<dyn LaunchedProcess>> {
        let mut state = self.lock();
        let pid = state.next_pid;
        state.next_pid += 1;
        state.spawned.push(command.to_string());

        let behavior = state.plans.get(command).cloned().unwrap_or_default();
        let mut process = FakeProcess {
            parent: Some(1),
            argv: vec![
                DEFAULT_SHELL.to_string(),
                SHELL_COMMAND_FLAG.to_string(),
                command.to_string(),
            ],
            ..FakeProcess::default()
        };

        match behavior {
            SpawnBehavior::Run { ports } => process.ports = ports.into_iter().collect(),
            SpawnBehavior::ExitImmediately {
                code,
                output,
            } => {
                state.exits.insert(pid, Some(code));
                return Ok(Box::new(FakeLaunched {
                    pid,
                    state: Arc::clone(&self.state),
                    output,
                }));
            }
            SpawnBehavior::IgnoreTerm => process.ignores_term = true,
            SpawnBehavior::Unkillable => process.unkillable = true,
        }
        state.processes.insert(pid, process);

        Ok(Box::new(FakeLaunched {
            pid,
            state: Arc::clone(&self.state),
            output: String::new(),
        }))
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.lock()
            .processes
            .get(&pid)
            .is_some_and(|process| !process.zombie)
    }

    fn own_pid(&self) -> u32 {
        FAKE_OWN_PID
    }
}

struct FakeLaunched {
    pid: u32,
    state: Arc<Mutex<FakeState>>,
    output: String,
}

impl LaunchedProcess for FakeLaunched {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_exit(&mut self) -> io::Result<Option<ExitInfo>> {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(state
            .exits
            .get(&self.pid)
            .map(|code| ExitInfo { code: *code }))
    }

    fn output_tail(&mut self) -> String {
        self.output.clone()
    }
}
