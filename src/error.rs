//! Error handling for svcmgr.
use thiserror::Error;

use crate::supervisor::ServiceState;

/// Defines all possible errors that can occur while supervising services.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The service registry could not be read, parsed or written.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No service with the given name is declared in the registry.
    #[error("Service '{0}' is not declared in the registry")]
    ServiceNotFound(String),

    /// A service with the given name already exists in the registry.
    #[error("Service '{0}' is already declared in the registry")]
    DuplicateService(String),

    /// The requested action is not valid from the service's current state.
    #[error("Cannot {action} service '{service}' while it is {state}")]
    InvalidTransition {
        /// The service the action targeted.
        service: String,
        /// The state the service was in.
        state: ServiceState,
        /// The rejected action (e.g. "start", "stop").
        action: &'static str,
    },

    /// The service's declared port is already bound by another process.
    #[error("Port {port} needed by '{service}' is used by PID(s) {pids:?}")]
    PortInUse {
        /// The service that could not start.
        service: String,
        /// The declared port.
        port: u16,
        /// The processes listening on the port.
        pids: Vec<u32>,
    },

    /// A process matching the service's command is already running.
    #[error("Service '{service}' already has a matching process running: PID(s) {pids:?}")]
    AlreadyRunning {
        /// The service that could not start.
        service: String,
        /// The live matching processes.
        pids: Vec<u32>,
    },

    /// The command started but exited during the launch grace window.
    #[error("Service '{service}' exited immediately ({})", describe_exit(.exit_code, .output))]
    LaunchError {
        /// The service that failed to start.
        service: String,
        /// Exit code of the process, if it exited normally.
        exit_code: Option<i32>,
        /// Tail of the captured stderr, then stdout.
        output: String,
    },

    /// The command could not be spawned at all.
    #[error("Failed to start service '{service}': {source}")]
    SpawnError {
        /// The service name that failed to start.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The process survived a forceful kill.
    #[error("Process {pid} could not be terminated: {reason}")]
    ProcessUnkillable {
        /// The process that is still alive.
        pid: u32,
        /// Why termination failed.
        reason: String,
    },

    /// The PID may not be targeted by a kill request.
    #[error("Refusing to kill PID {0}")]
    InvalidTarget(u32),

    /// Querying the OS process table failed.
    #[error(transparent)]
    Probe(#[from] ProbeError),

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),
}

/// Implement the `From` trait to convert a `std::sync::PoisonError` into a `ManagerError`.
impl<T> From<std::sync::PoisonError<T>> for ManagerError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ManagerError::MutexPoisonError(err.to_string())
    }
}

fn describe_exit(exit_code: &Option<i32>, output: &str) -> String {
    let mut message = match exit_code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    };
    if !output.is_empty() {
        message.push_str(": ");
        message.push_str(output);
    }
    message
}

/// Error type for service registry operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading or accessing the registry file.
    #[error("Failed to read config file: {0}")]
    ReadError(#[source] std::io::Error),

    /// Error writing the registry file.
    #[error("Failed to write config file: {0}")]
    WriteError(#[source] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Error parsing JSON configuration.
    #[error("Invalid JSON format: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Two entries share the same name.
    #[error("Duplicate service name '{0}' in config file")]
    DuplicateName(String),

    /// An entry has an empty name or command.
    #[error("Service entry {index} is missing a {field}")]
    MissingField {
        /// Position of the entry in the file.
        index: usize,
        /// The empty field.
        field: &'static str,
    },
}

/// Error type for transient OS queries made while probing.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Listing the process table failed.
    #[error("Failed to list processes: {0}")]
    ProcessTable(String),

    /// Enumerating sockets for a process failed.
    #[error("Failed to enumerate sockets for PID {pid}: {source}")]
    Sockets {
        /// The process whose sockets were queried.
        pid: u32,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A helper utility could not be executed.
    #[error("Failed to run `{tool}`: {source}")]
    Tool {
        /// The utility that was invoked.
        tool: &'static str,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}
