//! Command-line interface for svcmgr.
use std::{str::FromStr, time::Duration};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::constants::DEFAULT_CONFIG_FILE;
use crate::probe::MatchMode;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Parses a refresh interval such as "5" (seconds), "500ms", "2s" or "1m".
pub fn parse_interval(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("interval cannot be empty".to_string());
    }

    let split = raw
        .char_indices()
        .find(|(_, c)| c.is_alphabetic())
        .map(|(pos, _)| pos)
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid number in interval '{raw}'"))?;
    if value == 0 {
        return Err("interval must be positive".to_string());
    }

    match unit.to_ascii_lowercase().as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" | "sec" | "secs" => Ok(Duration::from_secs(value)),
        "m" | "min" | "mins" => Ok(Duration::from_secs(value * 60)),
        other => Err(format!("unknown time unit '{other}'")),
    }
}

/// Command-line interface for svcmgr.
#[derive(Parser)]
#[command(name = "svcmgr", version, author)]
#[command(about = "Start, stop and watch declared background services", long_about = None)]
pub struct Cli {
    /// Path to the service registry (YAML, or JSON with a `.json` extension).
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE, global = true)]
    pub config: String,

    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// How process command lines are matched against declared commands.
    #[arg(long = "match", value_name = "MODE", default_value_t = MatchMode::Exact, global = true)]
    pub match_mode: MatchMode,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for svcmgr.
#[derive(Subcommand)]
pub enum Commands {
    /// List declared services without probing them.
    List,

    /// Probe declared services and show their status.
    Status {
        /// Only show the named service.
        #[arg(short, long)]
        service: Option<String>,

        /// Emit machine-readable JSON output instead of a table.
        #[arg(long)]
        json: bool,

        /// Disable ANSI colors in output.
        #[arg(long = "no-color")]
        no_color: bool,

        /// Keep refreshing, every 2s or at the given interval (e.g., "5",
        /// "1s", "500ms").
        #[arg(long, value_name = "DURATION", value_parser = parse_interval, num_args = 0..=1)]
        watch: Option<Option<Duration>>,

        /// Stop every running service when watching ends.
        #[arg(long = "stop-on-exit", requires = "watch")]
        stop_on_exit: bool,
    },

    /// Show port conflicts and duplicate instances.
    Conflicts {
        /// Emit machine-readable JSON output.
        #[arg(long)]
        json: bool,

        /// Disable ANSI colors in output.
        #[arg(long = "no-color")]
        no_color: bool,
    },

    /// Declare a new service.
    Add {
        /// Unique name of the service.
        #[arg(short, long)]
        service: String,

        /// TCP port the service is expected to listen on.
        #[arg(short, long)]
        port: Option<u16>,

        /// Shell command that runs the service.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Change a declared service.
    Update {
        /// Name of the service to change.
        #[arg(short, long)]
        service: String,

        /// New name for the service.
        #[arg(long)]
        rename: Option<String>,

        /// New expected port.
        #[arg(short, long, conflicts_with = "clear_port")]
        port: Option<u16>,

        /// Forget the explicit expected port.
        #[arg(long = "clear-port")]
        clear_port: bool,

        /// New shell command; keeps the current one when omitted.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Stop a service if it runs and remove it from the registry.
    Remove {
        /// Name of the service to remove.
        #[arg(short, long)]
        service: String,
    },

    /// Launch a declared service.
    Start {
        /// Name of the service to start.
        #[arg(short, long)]
        service: String,
    },

    /// Terminate a running service.
    Stop {
        /// Name of the service to stop.
        #[arg(short, long)]
        service: String,
    },

    /// Stop a service if it runs, then start it.
    Restart {
        /// Name of the service to restart.
        #[arg(short, long)]
        service: String,
    },

    /// Forcefully kill a process named in a conflict report.
    Kill {
        /// PID to kill.
        pid: u32,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
