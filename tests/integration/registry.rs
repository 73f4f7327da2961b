#[path = "common/mod.rs"]
mod common;

use std::{fs, sync::Arc, thread};

use svcmgr::{
    config::{Registry, ServiceSpec, load, save},
    error::{ConfigError, ManagerError},
};
use tempfile::tempdir;

fn sample() -> Vec<ServiceSpec> {
    vec![
        ServiceSpec::new("api", "python server.py").with_port(8000),
        ServiceSpec::new("web", "npm run dev -- --port 3000"),
        ServiceSpec::new("worker", "celery -A tasks worker"),
    ]
}

#[test]
fn save_then_load_round_trips_in_both_formats() {
    let dir = tempdir().expect("failed to create tempdir");

    for file in ["services.yaml", "services.json"] {
        let path = dir.path().join(file);
        save(&path, &sample()).expect("failed to save");
        assert_eq!(load(&path).expect("failed to load"), sample(), "{file}");
    }
}

#[test]
fn reads_the_desktop_app_layout() {
    let dir = tempdir().expect("failed to create tempdir");
    let path = dir.path().join("services.json");
    fs::write(
        &path,
        r#"{"services": [
            {"name": "api", "command": "python server.py", "expectedPort": 8000},
            {"name": "web", "command": "npm start"}
        ]}"#,
    )
    .expect("failed to write registry");

    let specs = load(&path).expect("failed to load");
    assert_eq!(specs[0].expected_port, Some(8000));
    assert_eq!(specs[1].expected_port, None);
}

#[test]
fn missing_file_is_a_read_error_but_open_recovers() {
    let dir = tempdir().expect("failed to create tempdir");
    let path = dir.path().join("absent.yaml");

    assert!(matches!(load(&path), Err(ConfigError::ReadError(_))));

    let registry = Registry::open(&path);
    assert!(registry.specs().is_empty());
    assert!(registry.load_error().is_some());

    registry
        .add(ServiceSpec::new("api", "python server.py"))
        .expect("failed to add");
    assert_eq!(load(&path).expect("failed to load").len(), 1);
}

#[test]
fn duplicate_add_is_rejected_and_file_unchanged() {
    let dir = tempdir().expect("failed to create tempdir");
    let path = common::write_registry(dir.path(), "services:\n  - name: api\n    command: python server.py\n");
    let before = fs::read_to_string(&path).expect("failed to read registry");

    let registry = Registry::load(&path).expect("failed to load registry");
    let err = registry
        .add(ServiceSpec::new("api", "python other.py"))
        .unwrap_err();

    assert!(matches!(err, ManagerError::DuplicateService(name) if name == "api"));
    assert_eq!(fs::read_to_string(&path).expect("failed to read registry"), before);
}

#[test]
fn unreadable_registry_refuses_edits() {
    let dir = tempdir().expect("failed to create tempdir");
    let path = common::write_registry(
        dir.path(),
        "services:\n  - name: api\n    command: python server.py\n    expected_port: 80000\n  - name: web\n    command: npm start\n",
    );
    let before = fs::read_to_string(&path).expect("failed to read registry");

    let registry = Registry::open(&path);
    assert!(registry.specs().is_empty());

    let err = registry
        .add(ServiceSpec::new("new", "sleep 1"))
        .unwrap_err();
    assert!(matches!(err, ManagerError::Config(ConfigError::YamlError(_))));
    assert!(registry
        .update("web", ServiceSpec::new("web", "npm run dev"))
        .is_err());
    assert_eq!(fs::read_to_string(&path).expect("failed to read registry"), before);
}

#[test]
fn concurrent_writers_do_not_lose_updates() {
    let dir = tempdir().expect("failed to create tempdir");
    let path = dir.path().join("svcmgr.yaml");
    save(&path, &[]).expect("failed to seed registry");

    // Two handles on one file stand in for two svcmgr processes.
    let first = Arc::new(Registry::load(&path).expect("failed to load registry"));
    let second = Arc::new(Registry::load(&path).expect("failed to load registry"));

    let handles: Vec<_> = (0..8)
        .map(|index| {
            let registry = if index % 2 == 0 {
                Arc::clone(&first)
            } else {
                Arc::clone(&second)
            };
            thread::spawn(move || {
                registry
                    .add(ServiceSpec::new(
                        format!("svc-{index}"),
                        format!("sleep {index}"),
                    ))
                    .expect("failed to add service");
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer panicked");
    }

    let mut names: Vec<String> = load(&path)
        .expect("failed to load")
        .into_iter()
        .map(|spec| spec.name)
        .collect();
    names.sort();
    let mut expected: Vec<String> = (0..8).map(|index| format!("svc-{index}")).collect();
    expected.sort();
    assert_eq!(names, expected);
}

#[test]
fn update_and_remove_are_persisted() {
    let dir = tempdir().expect("failed to create tempdir");
    let path = dir.path().join("svcmgr.yaml");
    save(&path, &sample()).expect("failed to seed registry");
    let registry = Registry::load(&path).expect("failed to load registry");

    registry
        .update("web", ServiceSpec::new("frontend", "npm start").with_port(3001))
        .expect("failed to update");
    let removed = registry.remove("worker").expect("failed to remove");
    assert_eq!(removed.name, "worker");

    let specs = load(&path).expect("failed to load");
    assert_eq!(
        specs,
        vec![
            ServiceSpec::new("api", "python server.py").with_port(8000),
            ServiceSpec::new("frontend", "npm start").with_port(3001),
        ]
    );
    assert!(matches!(
        registry.remove("worker"),
        Err(ManagerError::ServiceNotFound(_))
    ));
}
