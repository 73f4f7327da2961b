//! Point-in-time probing of declared services against the OS process table.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use strum::{AsRefStr, Display, EnumString};
use tracing::debug;

use crate::config::ServiceSpec;
use crate::constants::{KNOWN_SHELLS, SHELL_COMMAND_FLAG};
use crate::error::ProbeError;
use crate::host::{ProcessEntry, ProcessHost};

/// How a process command line is compared with a declared command.
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
pub enum MatchMode {
    /// The argv joined by single spaces must equal the command.
    #[default]
    Exact,
    /// Whitespace is collapsed and the executable's directory is ignored.
    Normalized,
}

/// The comparison key for `command` under `mode`.
pub fn command_signature(command: &str, mode: MatchMode) -> String {
    match mode {
        MatchMode::Exact => command.trim().to_string(),
        MatchMode::Normalized => {
            let mut parts = command.split_whitespace();
            let Some(program) = parts.next() else {
                return String::new();
            };
            let program = program.rsplit('/').next().unwrap_or(program);
            std::iter::once(program)
                .chain(parts)
                .collect::<Vec<_>>()
                .join(" ")
        }
    }
}

fn program_name(arg: &str) -> &str {
    arg.rsplit('/').next().unwrap_or(arg)
}

/// Observed state of one declared service, produced by a single probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    /// The declaration this status describes.
    pub spec: ServiceSpec,
    /// Comparison key used for duplicate grouping.
    pub signature: String,
    /// Whether a live process backs the service.
    pub running: bool,
    /// The PID reported for the service.
    pub pid: Option<u32>,
    /// TCP ports the service's process tree listens on.
    pub observed_ports: BTreeSet<u16>,
    /// Roots of every live process tree matching the command.
    pub instances: BTreeSet<u32>,
    /// Listeners on the declared port; PIDs inside one of the service's trees
    /// are reported as that tree's root.
    pub expected_port_holders: BTreeSet<u32>,
}

impl ServiceStatus {
    /// A not-running status for `spec`.
    pub fn stopped(spec: &ServiceSpec, mode: MatchMode) -> Self {
        Self {
            signature: command_signature(&spec.command, mode),
            spec: spec.clone(),
            running: false,
            pid: None,
            observed_ports: BTreeSet::new(),
            instances: BTreeSet::new(),
            expected_port_holders: BTreeSet::new(),
        }
    }
}

/// A captured copy of the process table, indexed for tree walks.
///
/// Zombie processes are dropped at capture time.
#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    entries: BTreeMap<u32, ProcessEntry>,
    children: BTreeMap<u32, Vec<u32>>,
    own_pid: u32,
}

impl ProcessTable {
    /// Reads the process table through `host`.
    pub fn capture<H: ProcessHost + ?Sized>(host: &H) -> Result<Self, ProbeError> {
        Ok(Self::from_entries(host.list_processes()?, host.own_pid()))
    }

    /// Builds a table from already listed entries.
    pub fn from_entries(entries: Vec<ProcessEntry>, own_pid: u32) -> Self {
        let entries: BTreeMap<u32, ProcessEntry> = entries
            .into_iter()
            .filter(|entry| !entry.zombie)
            .map(|entry| (entry.pid, entry))
            .collect();

        let mut children: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for entry in entries.values() {
            if let Some(parent) = entry.parent
                && parent != entry.pid
            {
                children.entry(parent).or_default().push(entry.pid);
            }
        }

        Self {
            entries,
            children,
            own_pid,
        }
    }

    /// Whether `pid` is present and alive.
    pub fn contains(&self, pid: u32) -> bool {
        self.entries.contains_key(&pid)
    }

    /// `pid` and every live descendant.
    pub fn tree(&self, pid: u32) -> BTreeSet<u32> {
        let mut tree = BTreeSet::new();
        let mut pending = vec![pid];
        while let Some(next) = pending.pop() {
            if !tree.insert(next) {
                continue;
            }
            if let Some(kids) = self.children.get(&next) {
                pending.extend(kids.iter().copied());
            }
        }
        tree
    }

    fn matches(&self, entry: &ProcessEntry, signature: &str, mode: MatchMode) -> bool {
        if entry.pid == self.own_pid {
            return false;
        }
        if command_signature(&entry.command_line(), mode) == signature {
            return true;
        }
        // `sh -c "<command>"`, the way services are launched.
        match entry.argv.as_slice() {
            [shell, flag, command, ..] => {
                KNOWN_SHELLS.contains(&program_name(shell))
                    && flag == SHELL_COMMAND_FLAG
                    && command_signature(command, mode) == signature
            }
            _ => false,
        }
    }

    fn has_ancestor_in(&self, pid: u32, set: &BTreeSet<u32>) -> bool {
        let mut current = self.entries.get(&pid).and_then(|entry| entry.parent);
        let mut hops = 0;
        while let Some(parent) = current {
            if set.contains(&parent) {
                return true;
            }
            hops += 1;
            if hops > self.entries.len() {
                break;
            }
            current = self.entries.get(&parent).and_then(|entry| entry.parent);
        }
        false
    }

    /// Roots of the process trees whose command matches `signature`.
    pub fn instance_roots(&self, signature: &str, mode: MatchMode) -> BTreeSet<u32> {
        let matching: BTreeSet<u32> = self
            .entries
            .values()
            .filter(|entry| self.matches(entry, signature, mode))
            .map(|entry| entry.pid)
            .collect();

        matching
            .iter()
            .copied()
            .filter(|pid| !self.has_ancestor_in(*pid, &matching))
            .collect()
    }

    /// The root in `roots` whose tree contains `pid`.
    fn root_of(&self, pid: u32, roots: &BTreeSet<u32>) -> Option<u32> {
        if roots.contains(&pid) {
            return Some(pid);
        }
        let mut current = self.entries.get(&pid).and_then(|entry| entry.parent);
        let mut hops = 0;
        while let Some(parent) = current {
            if roots.contains(&parent) {
                return Some(parent);
            }
            hops += 1;
            if hops > self.entries.len() {
                break;
            }
            current = self.entries.get(&parent).and_then(|entry| entry.parent);
        }
        None
    }
}

/// Probes a single service against a freshly captured process table.
pub fn probe<H: ProcessHost + ?Sized>(
    host: &H,
    spec: &ServiceSpec,
    recorded_pid: Option<u32>,
    mode: MatchMode,
) -> Result<ServiceStatus, ProbeError> {
    let table = ProcessTable::capture(host)?;
    probe_with_table(host, &table, spec, recorded_pid, mode)
}

/// Probes a single service against an already captured table.
///
/// A live `recorded_pid` wins over command matching, so a service whose
/// command line changed after an `exec` is still found.
pub fn probe_with_table<H: ProcessHost + ?Sized>(
    host: &H,
    table: &ProcessTable,
    spec: &ServiceSpec,
    recorded_pid: Option<u32>,
    mode: MatchMode,
) -> Result<ServiceStatus, ProbeError> {
    let mut status = ServiceStatus::stopped(spec, mode);
    let mut instances = table.instance_roots(&status.signature, mode);

    let recorded = recorded_pid.filter(|pid| table.contains(*pid));
    if let Some(pid) = recorded
        && table.root_of(pid, &instances).is_none()
    {
        instances.insert(pid);
    }

    let pid = match recorded {
        Some(pid) => table.root_of(pid, &instances),
        None => instances.iter().next().copied(),
    };

    if let Some(pid) = pid {
        status.running = true;
        status.pid = Some(pid);
        status.observed_ports = host.process_ports(&table.tree(pid))?;
    }

    if let Some(port) = spec.declared_port() {
        status.expected_port_holders = host
            .port_listeners(port)?
            .into_iter()
            .map(|holder| table.root_of(holder, &instances).unwrap_or(holder))
            .collect();
    }

    if instances.len() > 1 {
        debug!(
            "Service '{}' matches {} live instances: {:?}",
            spec.name,
            instances.len(),
            instances
        );
    }
    status.instances = instances;
    Ok(status)
}
