//! Conflict detection over a set of probed services.
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::probe::ServiceStatus;

/// Port collisions and duplicate instances found in one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConflictReport {
    /// Ports claimed by more than one PID, or by a PID foreign to the service
    /// that declares the port.
    pub port_conflicts: BTreeMap<u16, BTreeSet<u32>>,
    /// Services with more than one live instance.
    pub duplicate_groups: BTreeMap<String, BTreeSet<u32>>,
}

impl ConflictReport {
    /// Whether nothing conflicts.
    pub fn is_empty(&self) -> bool {
        self.port_conflicts.is_empty() && self.duplicate_groups.is_empty()
    }

    /// Every PID that takes part in some conflict.
    pub fn conflicting_pids(&self) -> BTreeSet<u32> {
        self.port_conflicts
            .values()
            .chain(self.duplicate_groups.values())
            .flatten()
            .copied()
            .collect()
    }

    /// Port conflicts touching `status`: its declared port or any port it holds.
    pub fn ports_for(&self, status: &ServiceStatus) -> BTreeMap<u16, BTreeSet<u32>> {
        self.port_conflicts
            .iter()
            .filter(|(port, _)| {
                status.spec.declared_port() == Some(**port)
                    || status.observed_ports.contains(port)
            })
            .map(|(port, pids)| (*port, pids.clone()))
            .collect()
    }
}

/// Cross-references `statuses` into a [`ConflictReport`].
///
/// Pure and order-independent: permuting `statuses` yields the same report.
pub fn detect(statuses: &[ServiceStatus]) -> ConflictReport {
    let mut holders: BTreeMap<u16, BTreeSet<u32>> = BTreeMap::new();
    let mut foreign_held: BTreeSet<u16> = BTreeSet::new();

    for status in statuses {
        if let Some(pid) = status.pid.filter(|_| status.running) {
            for port in &status.observed_ports {
                holders.entry(*port).or_default().insert(pid);
            }
        }

        if let Some(port) = status.spec.declared_port()
            && !status.expected_port_holders.is_empty()
        {
            holders
                .entry(port)
                .or_default()
                .extend(status.expected_port_holders.iter().copied());

            let owned = |pid: &u32| status.instances.contains(pid) || status.pid == Some(*pid);
            if !status.expected_port_holders.iter().all(owned) {
                foreign_held.insert(port);
            }
        }
    }

    let port_conflicts = holders
        .into_iter()
        .filter(|(port, pids)| pids.len() > 1 || foreign_held.contains(port))
        .collect();

    let mut groups: BTreeMap<&str, (BTreeSet<&str>, BTreeSet<u32>)> = BTreeMap::new();
    for status in statuses {
        let (names, pids) = groups.entry(status.signature.as_str()).or_default();
        names.insert(status.spec.name.as_str());
        pids.extend(status.instances.iter().copied());
    }

    let mut duplicate_groups = BTreeMap::new();
    for (names, pids) in groups.into_values() {
        if pids.len() > 1 {
            for name in names {
                duplicate_groups.insert(name.to_string(), pids.clone());
            }
        }
    }

    ConflictReport {
        port_conflicts,
        duplicate_groups,
    }
}
