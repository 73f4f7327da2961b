use std::{
    error::Error,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use svcmgr::{
    cli::{Cli, Commands, parse_args},
    config::ServiceSpec,
    constants::DEFAULT_REFRESH_INTERVAL,
    error::ManagerError,
    manager::{Action, Manager},
    monitor::Snapshot,
    status::{RenderOptions, render_conflicts, render_specs, render_table},
    supervisor::SupervisorOptions,
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    let options = SupervisorOptions {
        match_mode: args.match_mode,
        ..SupervisorOptions::default()
    };
    let manager = Manager::open(&args.config, options);
    if let Some(err) = manager.registry().load_error() {
        warn!("Registry {}: {err}", manager.registry().path().display());
    }

    match args.command {
        Commands::List => print!("{}", render_specs(&manager.registry().specs())),
        Commands::Status {
            service,
            json,
            no_color,
            watch,
            stop_on_exit,
        } => {
            let render = RenderOptions::detect(no_color);
            match watch {
                Some(interval) => {
                    let interval = interval.unwrap_or(DEFAULT_REFRESH_INTERVAL);
                    watch_status(&manager, interval, service.as_deref(), json, &render)?;
                    if stop_on_exit {
                        for (name, err) in manager.shutdown() {
                            warn!("Service '{name}' did not stop cleanly: {err}");
                        }
                    }
                }
                None => {
                    let snapshot = manager.refresh()?;
                    print_status(&snapshot, service.as_deref(), json, &render)?;
                }
            }
        }
        Commands::Conflicts { json, no_color } => {
            let snapshot = manager.refresh()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot.conflicts)?);
            } else {
                print!(
                    "{}",
                    render_conflicts(&snapshot.conflicts, &RenderOptions::detect(no_color))
                );
            }
        }
        Commands::Add {
            service,
            port,
            command,
        } => {
            let mut spec = ServiceSpec::new(service, command.join(" "));
            spec.expected_port = port;
            manager.add_service(spec)?;
        }
        Commands::Update {
            service,
            rename,
            port,
            clear_port,
            command,
        } => {
            let mut spec = manager
                .registry()
                .get(&service)
                .ok_or_else(|| ManagerError::ServiceNotFound(service.clone()))?;
            if let Some(name) = rename {
                spec.name = name;
            }
            if !command.is_empty() {
                spec.command = command.join(" ");
            }
            if clear_port {
                spec.expected_port = None;
            } else if port.is_some() {
                spec.expected_port = port;
            }
            manager.update_service(&service, spec)?;
        }
        Commands::Remove { service } => {
            // Adopt a running instance first so removal stops it.
            manager.refresh()?;
            manager.remove_service(&service)?;
            info!("Removed service '{service}'");
        }
        Commands::Start { service } => run_action(&manager, Action::Start(service))?,
        Commands::Stop { service } => run_action(&manager, Action::Stop(service))?,
        Commands::Restart { service } => run_action(&manager, Action::Restart(service))?,
        Commands::Kill { pid } => run_action(&manager, Action::KillConflict(pid))?,
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}

/// Refreshes first so processes started by earlier invocations are adopted.
fn run_action(manager: &Manager, action: Action) -> Result<(), Box<dyn Error>> {
    manager.refresh()?;
    manager.perform(action.clone())?;
    info!("Completed: {action}");
    Ok(())
}

fn print_status(
    snapshot: &Snapshot,
    service: Option<&str>,
    json: bool,
    render: &RenderOptions,
) -> Result<(), Box<dyn Error>> {
    let filtered;
    let snapshot = match service {
        Some(name) => {
            let view = snapshot
                .service(name)
                .cloned()
                .ok_or_else(|| ManagerError::ServiceNotFound(name.to_string()))?;
            filtered = Snapshot {
                services: vec![view],
                ..snapshot.clone()
            };
            &filtered
        }
        None => snapshot,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
    } else {
        print!("{}", render_table(snapshot, render));
    }
    Ok(())
}

/// Redraws the status until Ctrl-C.
fn watch_status(
    manager: &Manager,
    interval: Duration,
    service: Option<&str>,
    json: bool,
    render: &RenderOptions,
) -> Result<(), Box<dyn Error>> {
    let running = Arc::new(AtomicBool::new(true));
    let (tx, rx) = mpsc::channel::<()>();
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
        let _ = tx.send(());
    })?;

    if let Err(err) = manager.refresh() {
        warn!("Initial refresh failed: {err}");
    }
    let refresher = manager.start_refresher(interval);
    while running.load(Ordering::SeqCst) {
        let snapshot = manager.snapshot();
        if !json && render.color {
            // Clear the screen and home the cursor.
            print!("\x1b[2J\x1b[H");
        }
        if let Err(err) = print_status(&snapshot, service, json, render) {
            error!("{err}");
        }
        match rx.recv_timeout(interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
    }
    refresher.stop();
    Ok(())
}
