#[path = "common/mod.rs"]
mod common;

use std::{collections::BTreeSet, sync::Arc};

use svcmgr::{
    config::{Registry, ServiceSpec},
    error::ManagerError,
    host::{Signal, SignalScope},
    manager::{Action, Manager},
    probe::{MatchMode, probe},
    supervisor::{ServiceState, Supervisor},
    test_utils::{FAKE_OWN_PID, FakeHost, SpawnBehavior, fast_options},
};
use tempfile::{TempDir, tempdir};

struct Harness {
    _dir: TempDir,
    host: FakeHost,
    manager: Manager,
}

fn harness(specs: &[ServiceSpec]) -> Harness {
    let dir = tempdir().expect("failed to create tempdir");
    let registry = Registry::open(dir.path().join("svcmgr.yaml"));
    for spec in specs {
        registry.add(spec.clone()).expect("failed to add service");
    }
    let host = FakeHost::new();
    let manager = Manager::new(registry, Arc::new(host.clone()), fast_options());
    Harness {
        _dir: dir,
        host,
        manager,
    }
}

fn api() -> ServiceSpec {
    ServiceSpec::new("api", "python server.py").with_port(8000)
}

#[test]
fn missing_process_probes_as_not_running() {
    let host = FakeHost::new();
    host.insert_process(10, "python other.py");

    let status = probe(&host, &api(), None, MatchMode::Exact).expect("probe failed");
    assert!(!status.running);
    assert_eq!(status.pid, None);
    assert!(status.observed_ports.is_empty());
}

#[test]
fn start_brings_api_up_on_its_port() {
    let h = harness(&[api()]);
    h.host.plan_spawn(
        "python server.py",
        SpawnBehavior::Run { ports: vec![8000] },
    );

    let snapshot = h.manager.refresh().expect("refresh failed");
    assert!(!snapshot.service("api").unwrap().status.running);

    h.manager
        .perform(Action::Start("api".to_string()))
        .expect("start failed");

    let snapshot = h.manager.snapshot();
    let view = snapshot.service("api").unwrap();
    assert_eq!(view.state, ServiceState::Running);
    assert!(view.status.running);
    assert_eq!(view.status.observed_ports, BTreeSet::from([8000]));
    assert!(snapshot.conflicts.is_empty());
    assert_eq!(h.host.spawned(), vec!["python server.py".to_string()]);
}

#[test]
fn start_while_running_is_rejected_without_os_action() {
    let h = harness(&[api()]);
    let supervisor = h.manager.supervisor();
    supervisor.start(&api()).expect("first start failed");
    let signals_before = h.host.signals();

    let err = supervisor.start(&api()).unwrap_err();
    assert!(matches!(
        err,
        ManagerError::InvalidTransition {
            state: ServiceState::Running,
            action: "start",
            ..
        }
    ));
    assert_eq!(h.host.spawned().len(), 1);
    assert_eq!(h.host.signals(), signals_before);
}

#[test]
fn shared_port_is_reported_and_killing_one_pid_clears_it() {
    let h = harness(&[
        ServiceSpec::new("a", "python a.py"),
        ServiceSpec::new("b", "python b.py"),
    ]);
    h.host.insert_process(100, "python a.py");
    h.host.insert_process(200, "python b.py");
    h.host.bind(100, 8000);
    h.host.bind(200, 8000);

    let snapshot = h.manager.refresh().expect("refresh failed");
    assert_eq!(
        snapshot.conflicts.port_conflicts[&8000],
        BTreeSet::from([100, 200])
    );

    h.manager
        .perform(Action::KillConflict(200))
        .expect("kill failed");

    let snapshot = h.manager.snapshot();
    assert!(snapshot.conflicts.is_empty());
    assert!(!snapshot.conflicts.conflicting_pids().contains(&200));
    let b = snapshot.service("b").unwrap();
    assert!(!b.status.running);
    assert_eq!(b.state, ServiceState::Stopped);
    assert!(!h.host.contains(200));
    assert_eq!(
        h.host.signals(),
        vec![(200, Signal::Kill, SignalScope::Process)]
    );
}

#[test]
fn duplicate_instances_are_grouped() {
    let h = harness(&[ServiceSpec::new("worker", "python worker.py")]);
    h.host.insert_process(300, "python worker.py");
    h.host.insert_process(301, "python worker.py");

    let snapshot = h.manager.refresh().expect("refresh failed");
    assert_eq!(
        snapshot.conflicts.duplicate_groups["worker"],
        BTreeSet::from([300, 301])
    );
}

#[test]
fn launch_failure_reports_exit_code_and_output() {
    let h = harness(&[api()]);
    h.host.plan_spawn(
        "python server.py",
        SpawnBehavior::ExitImmediately {
            code: 3,
            output: "ModuleNotFoundError: flask".to_string(),
        },
    );

    let err = h
        .manager
        .perform(Action::Start("api".to_string()))
        .unwrap_err();
    match err {
        ManagerError::LaunchError {
            exit_code, output, ..
        } => {
            assert_eq!(exit_code, Some(3));
            assert_eq!(output, "ModuleNotFoundError: flask");
        }
        other => panic!("expected launch error, got {other:?}"),
    }

    let snapshot = h.manager.snapshot();
    let view = snapshot.service("api").unwrap();
    assert_eq!(view.state, ServiceState::Stopped);
    assert!(view.last_error.as_deref().unwrap().contains("flask"));
}

#[test]
fn start_refuses_a_port_held_by_another_process() {
    let h = harness(&[api()]);
    h.host.insert_process(4242, "node proxy.js");
    h.host.bind(4242, 8000);

    let err = h.manager.supervisor().start(&api()).unwrap_err();
    assert!(matches!(
        err,
        ManagerError::PortInUse { port: 8000, ref pids, .. } if pids == &vec![4242]
    ));
    assert!(h.host.spawned().is_empty());
}

#[test]
fn start_refuses_when_a_matching_process_exists() {
    let h = harness(&[api()]);
    h.host.insert_process(555, "python server.py");

    let err = h.manager.supervisor().start(&api()).unwrap_err();
    assert!(matches!(err, ManagerError::AlreadyRunning { .. }));
    assert!(h.host.spawned().is_empty());
}

#[test]
fn stop_escalates_to_sigkill() {
    let h = harness(&[api()]);
    h.host.plan_spawn("python server.py", SpawnBehavior::IgnoreTerm);
    let supervisor = h.manager.supervisor();
    let pid = supervisor.start(&api()).expect("start failed").pid.unwrap();

    supervisor.stop("api").expect("stop failed");

    assert_eq!(supervisor.state("api"), ServiceState::Stopped);
    assert_eq!(
        h.host.signals(),
        vec![
            (pid, Signal::Terminate, SignalScope::Group),
            (pid, Signal::Kill, SignalScope::Group),
        ]
    );
}

#[test]
fn unkillable_process_leaves_service_stopping() {
    let h = harness(&[api()]);
    h.host.plan_spawn("python server.py", SpawnBehavior::Unkillable);
    let supervisor = h.manager.supervisor();
    let pid = supervisor.start(&api()).expect("start failed").pid.unwrap();

    let err = supervisor.stop("api").unwrap_err();
    assert!(matches!(err, ManagerError::ProcessUnkillable { pid: p, .. } if p == pid));
    assert_eq!(supervisor.state("api"), ServiceState::Stopping);

    // A retry from Stopping is allowed and fails the same way.
    assert!(matches!(
        supervisor.stop("api"),
        Err(ManagerError::ProcessUnkillable { .. })
    ));
    assert!(matches!(
        supervisor.start(&api()),
        Err(ManagerError::InvalidTransition { .. })
    ));
}

#[test]
fn crashed_service_is_reaped_on_refresh() {
    let h = harness(&[api()]);
    let pid = h
        .manager
        .supervisor()
        .start(&api())
        .expect("start failed")
        .pid
        .unwrap();

    h.host.exit_process(pid, 2);
    let snapshot = h.manager.refresh().expect("refresh failed");

    let view = snapshot.service("api").unwrap();
    assert_eq!(view.state, ServiceState::Stopped);
    assert_eq!(
        view.last_error.as_deref(),
        Some("Process exited with code 2")
    );
}

#[test]
fn running_process_is_adopted_and_can_be_stopped() {
    let h = harness(&[ServiceSpec::new("worker", "python worker.py")]);
    h.host.insert_process(500, "python worker.py");
    h.host.insert_child(501, 500, "python worker-child.py");

    let snapshot = h.manager.refresh().expect("refresh failed");
    let view = snapshot.service("worker").unwrap();
    assert_eq!(view.state, ServiceState::Running);
    assert_eq!(view.status.pid, Some(500));

    h.manager
        .perform(Action::Stop("worker".to_string()))
        .expect("stop failed");
    assert!(!h.host.contains(500));
    assert!(!h.host.contains(501));
    assert_eq!(
        h.manager.snapshot().service("worker").unwrap().state,
        ServiceState::Stopped
    );
}

#[test]
fn restart_replaces_the_process() {
    let h = harness(&[api()]);
    let supervisor = h.manager.supervisor();
    let first = supervisor.start(&api()).expect("start failed").pid.unwrap();

    let second = supervisor
        .restart(&api())
        .expect("restart failed")
        .pid
        .unwrap();

    assert_ne!(first, second);
    assert!(!h.host.contains(first));
    assert!(h.host.contains(second));
    assert_eq!(h.host.spawned().len(), 2);
}

#[test]
fn failed_refresh_keeps_the_previous_snapshot() {
    let h = harness(&[api()]);
    h.manager.supervisor().start(&api()).expect("start failed");
    let before = h.manager.refresh().expect("refresh failed");

    h.host.fail_next_lists(1);
    assert!(h.manager.refresh().is_err());
    assert_eq!(h.manager.snapshot(), before);
}

#[test]
fn dispatched_actions_run_in_the_background() {
    let h = harness(&[api(), ServiceSpec::new("web", "npm start")]);

    let handles = vec![
        h.manager.dispatch(Action::Start("api".to_string())),
        h.manager.dispatch(Action::Start("web".to_string())),
    ];
    for handle in handles {
        handle
            .join()
            .expect("action thread panicked")
            .expect("action failed");
    }

    let snapshot = h.manager.refresh().expect("refresh failed");
    for name in ["api", "web"] {
        assert_eq!(
            snapshot.service(name).unwrap().state,
            ServiceState::Running,
            "{name}"
        );
    }
}

#[test]
fn removing_a_service_stops_it() {
    let h = harness(&[api()]);
    let pid = h
        .manager
        .supervisor()
        .start(&api())
        .expect("start failed")
        .pid
        .unwrap();

    let removed = h.manager.remove_service("api").expect("remove failed");
    assert_eq!(removed.name, "api");
    assert!(!h.host.contains(pid));
    assert!(h.manager.registry().get("api").is_none());
}

#[test]
fn unknown_services_and_protected_pids_are_refused() {
    let h = harness(&[api()]);

    assert!(matches!(
        h.manager.perform(Action::Start("ghost".to_string())),
        Err(ManagerError::ServiceNotFound(name)) if name == "ghost"
    ));
    assert!(matches!(
        h.manager.perform(Action::KillConflict(FAKE_OWN_PID)),
        Err(ManagerError::InvalidTarget(_))
    ));
    assert!(matches!(
        h.manager.perform(Action::KillConflict(1)),
        Err(ManagerError::InvalidTarget(1))
    ));
}

#[test]
fn pids_outside_the_signed_range_are_refused() {
    let h = harness(&[api()]);
    h.host.insert_process(500, "python worker.py");

    for pid in [u32::MAX, i32::MAX as u32 + 1] {
        assert!(matches!(
            h.manager.perform(Action::KillConflict(pid)),
            Err(ManagerError::InvalidTarget(p)) if p == pid
        ));
    }
    assert!(h.host.signals().is_empty());
    assert!(h.host.contains(500));
}

#[test]
fn renaming_a_running_service_keeps_its_process() {
    let h = harness(&[api()]);
    let pid = h
        .manager
        .supervisor()
        .start(&api())
        .expect("start failed")
        .pid
        .unwrap();

    let renamed = ServiceSpec::new("backend", "python server.py").with_port(8000);
    h.manager
        .update_service("api", renamed)
        .expect("update failed");

    let supervisor = h.manager.supervisor();
    assert_eq!(supervisor.state("backend"), ServiceState::Running);
    assert_eq!(supervisor.state("api"), ServiceState::Stopped);

    let snapshot = h.manager.refresh().expect("refresh failed");
    assert!(snapshot.service("api").is_none());
    let view = snapshot.service("backend").unwrap();
    assert_eq!(view.state, ServiceState::Running);
    assert_eq!(view.status.pid, Some(pid));

    h.manager
        .perform(Action::Stop("backend".to_string()))
        .expect("stop failed");
    assert!(!h.host.contains(pid));
    assert_eq!(
        h.host.signals(),
        vec![(pid, Signal::Terminate, SignalScope::Group)]
    );
    // Nothing is left behind under the old name.
    assert!(supervisor.stop_all().is_empty());
    assert_eq!(h.host.signals().len(), 1);
}

#[test]
fn renaming_a_stopped_service_starts_clean() {
    let h = harness(&[api()]);
    h.manager.refresh().expect("refresh failed");

    h.manager
        .update_service("api", ServiceSpec::new("backend", "python server.py"))
        .expect("update failed");

    let snapshot = h.manager.refresh().expect("refresh failed");
    assert!(snapshot.service("api").is_none());
    assert_eq!(
        snapshot.service("backend").unwrap().state,
        ServiceState::Stopped
    );

    h.manager
        .perform(Action::Start("backend".to_string()))
        .expect("start failed");
    assert_eq!(h.host.spawned(), vec!["python server.py".to_string()]);
    assert_eq!(
        h.manager.supervisor().state("backend"),
        ServiceState::Running
    );
    assert_eq!(h.manager.supervisor().state("api"), ServiceState::Stopped);
}

#[test]
fn stop_all_stops_every_running_service() {
    let h = harness(&[api(), ServiceSpec::new("web", "npm start")]);
    let supervisor = Supervisor::new(Arc::new(h.host.clone()), fast_options());
    supervisor.start(&api()).expect("start failed");
    supervisor
        .start(&ServiceSpec::new("web", "npm start"))
        .expect("start failed");

    assert!(supervisor.stop_all().is_empty());
    assert_eq!(supervisor.state("api"), ServiceState::Stopped);
    assert_eq!(supervisor.state("web"), ServiceState::Stopped);
    assert!(h.host.pids().is_empty());
}
