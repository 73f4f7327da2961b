//! OS capabilities the supervisor depends on.
//!
//! Everything svcmgr needs from the operating system goes through
//! [`ProcessHost`]: enumerating processes, mapping processes to listening TCP
//! ports, delivering signals and launching commands. [`SystemHost`] is the
//! Unix implementation; Linux reads `/proc`, other Unix targets ask `lsof`.
use nix::{
    errno::Errno,
    sys::signal::{self, Signal as NixSignal},
    unistd::Pid as NixPid,
};
use serde::Serialize;
use std::{
    collections::BTreeSet,
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Child, Command, Stdio},
};
use strum::{AsRefStr, Display};
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::constants::{
    DEFAULT_SHELL, MAX_OUTPUT_TAIL, OUTPUT_CAPTURE_PREFIX, SHELL_COMMAND_FLAG,
};
use crate::error::ProbeError;

/// One row of the OS process table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessEntry {
    /// Process ID.
    pub pid: u32,
    /// Parent process ID, when known.
    pub parent: Option<u32>,
    /// Command line arguments, including the executable.
    pub argv: Vec<String>,
    /// Whether the process has exited but not been reaped.
    pub zombie: bool,
}

impl ProcessEntry {
    /// The command line joined by single spaces.
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

/// Signals the supervisor sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum Signal {
    /// Graceful termination (SIGTERM).
    #[strum(serialize = "SIGTERM")]
    Terminate,
    /// Forceful termination (SIGKILL).
    #[strum(serialize = "SIGKILL")]
    Kill,
}

/// Which processes a signal reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalScope {
    /// Only the given PID.
    Process,
    /// The PID and, when it leads its own process group, the whole group.
    Group,
}

/// Result of delivering a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// The signal was delivered.
    Delivered,
    /// The process no longer exists.
    NoSuchProcess,
}

/// How a launched process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, or `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

/// Handle to a process started through [`ProcessHost::spawn`].
pub trait LaunchedProcess: Send {
    /// PID of the launched process.
    fn pid(&self) -> u32;

    /// Reaps the process if it has exited, without blocking.
    fn try_exit(&mut self) -> io::Result<Option<ExitInfo>>;

    /// The last bytes the process wrote to stderr, followed by the last
    /// bytes it wrote to stdout.
    fn output_tail(&mut self) -> String;
}

/// Capability interface over the operating system.
pub trait ProcessHost: Send + Sync {
    /// Lists every process currently in the process table.
    fn list_processes(&self) -> Result<Vec<ProcessEntry>, ProbeError>;

    /// TCP ports in the LISTEN state held by any of `pids`.
    fn process_ports(&self, pids: &BTreeSet<u32>) -> Result<BTreeSet<u16>, ProbeError>;

    /// PIDs holding a LISTEN socket on `port`.
    fn port_listeners(&self, port: u16) -> Result<BTreeSet<u32>, ProbeError>;

    /// Sends `signal` to `pid`.
    fn send_signal(
        &self,
        pid: u32,
        signal: Signal,
        scope: SignalScope,
    ) -> io::Result<SignalOutcome>;

    /// Launches `command` through the shell as a detached process.
    fn spawn(&self, command: &str) -> io::Result<Box<dyn LaunchedProcess>>;

    /// Whether `pid` exists and is not a zombie.
    fn is_alive(&self, pid: u32) -> bool;

    /// PID of the supervising process itself.
    fn own_pid(&self) -> u32 {
        std::process::id()
    }
}

/// Converts `pid` for `kill(2)`, which reads negative values as group or
/// broadcast targets.
fn nix_pid(pid: u32) -> io::Result<NixPid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(NixPid::from_raw)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("PID {pid} is outside the valid range"),
            )
        })
}

/// [`ProcessHost`] backed by the real operating system.
#[derive(Debug, Clone, Default)]
pub struct SystemHost {
    working_dir: Option<PathBuf>,
}

impl SystemHost {
    /// Creates a host that launches commands in the current directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Launches commands from `dir` instead of the current directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

impl ProcessHost for SystemHost {
    fn list_processes(&self) -> Result<Vec<ProcessEntry>, ProbeError> {
        let mut system = System::new();
        let refreshed = system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );
        if refreshed == 0 {
            return Err(ProbeError::ProcessTable(
                "process table is empty or unreadable".to_string(),
            ));
        }

        let entries = system
            .processes()
            .iter()
            .filter(|(_, process)| process.thread_kind().is_none())
            .map(|(pid, process)| {
                let mut argv: Vec<String> = process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy().into_owned())
                    .collect();
                if argv.is_empty() {
                    argv.push(process.name().to_string_lossy().into_owned());
                }
                ProcessEntry {
                    pid: pid.as_u32(),
                    parent: process.parent().map(|parent| parent.as_u32()),
                    argv,
                    zombie: matches!(
                        process.status(),
                        ProcessStatus::Zombie | ProcessStatus::Dead
                    ),
                }
            })
            .collect();

        Ok(entries)
    }

    fn process_ports(&self, pids: &BTreeSet<u32>) -> Result<BTreeSet<u16>, ProbeError> {
        if pids.is_empty() {
            return Ok(BTreeSet::new());
        }
        sockets::ports_for(pids)
    }

    fn port_listeners(&self, port: u16) -> Result<BTreeSet<u32>, ProbeError> {
        sockets::listeners_of(port)
    }

    fn send_signal(
        &self,
        pid: u32,
        signal: Signal,
        scope: SignalScope,
    ) -> io::Result<SignalOutcome> {
        let target = nix_pid(pid)?;
        let nix_signal = match signal {
            Signal::Terminate => NixSignal::SIGTERM,
            Signal::Kill => NixSignal::SIGKILL,
        };

        if scope == SignalScope::Group {
            let own_pgid = unsafe { libc::getpgid(0) };
            let target_pgid = unsafe { libc::getpgid(target.as_raw()) };

            // Only whole groups led by the target itself; anything else may be a
            // terminal job the target merely belongs to.
            if target_pgid == target.as_raw() && target_pgid != own_pgid {
                match signal::killpg(target, nix_signal) {
                    Ok(()) => debug!("Sent {signal} to process group {target_pgid}"),
                    Err(Errno::ESRCH) => {}
                    Err(Errno::EPERM) => warn!(
                        "Insufficient permissions to signal process group {target_pgid}. Falling back to direct signal"
                    ),
                    Err(err) => return Err(io::Error::from_raw_os_error(err as i32)),
                }
            }
        }

        match signal::kill(target, nix_signal) {
            Ok(()) => Ok(SignalOutcome::Delivered),
            Err(Errno::ESRCH) => Ok(SignalOutcome::NoSuchProcess),
            Err(err) => Err(io::Error::from_raw_os_error(err as i32)),
        }
    }

    fn spawn(&self, command: &str) -> io::Result<Box<dyn LaunchedProcess>> {
        let stderr_capture = tempfile::Builder::new()
            .prefix(OUTPUT_CAPTURE_PREFIX)
            .suffix(".err")
            .tempfile()?;
        let stdout_capture = tempfile::Builder::new()
            .prefix(OUTPUT_CAPTURE_PREFIX)
            .suffix(".out")
            .tempfile()?;

        let mut cmd = Command::new(DEFAULT_SHELL);
        cmd.arg(SHELL_COMMAND_FLAG).arg(command);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(stdout_capture.reopen()?))
            .stderr(Stdio::from(stderr_capture.reopen()?));

        debug!("Executing command: {cmd:?}");

        unsafe {
            cmd.pre_exec(|| {
                // New session: the service outlives svcmgr and leads its own group.
                if libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        debug!("Launched `{command}` with PID {}", child.id());

        Ok(Box::new(SystemProcess {
            child,
            stderr_capture,
            stdout_capture,
        }))
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(target) = nix_pid(pid) else {
            return false;
        };
        match signal::kill(target, None) {
            Ok(()) => !sockets::is_zombie(pid),
            Err(Errno::ESRCH) => false,
            // EPERM: the process exists but belongs to someone else.
            Err(_) => true,
        }
    }
}

struct SystemProcess {
    child: Child,
    stderr_capture: NamedTempFile,
    stdout_capture: NamedTempFile,
}

impl LaunchedProcess for SystemProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn try_exit(&mut self) -> io::Result<Option<ExitInfo>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| ExitInfo { code: status.code() }))
    }

    fn output_tail(&mut self) -> String {
        [
            ("stderr", self.stderr_capture.as_file_mut()),
            ("stdout", self.stdout_capture.as_file_mut()),
        ]
        .into_iter()
        .filter_map(|(stream, file)| match read_tail(file, MAX_OUTPUT_TAIL) {
            Ok(tail) => Some(tail),
            Err(err) => {
                warn!("Failed to read captured {stream}: {err}");
                None
            }
        })
        .filter(|tail| !tail.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
    }
}

fn read_tail(file: &mut File, max: usize) -> io::Result<String> {
    let len = file.seek(SeekFrom::End(0))?;
    let start = len.saturating_sub(max as u64);
    file.seek(SeekFrom::Start(start))?;
    let mut raw = Vec::new();
    file.read_to_end(&mut raw)?;
    // Skip a character cut in half by the window.
    let skip = if start > 0 {
        raw.iter()
            .take_while(|byte| (**byte & 0b1100_0000) == 0b1000_0000)
            .count()
    } else {
        0
    };
    Ok(String::from_utf8_lossy(&raw[skip..]).trim().to_string())
}

#[cfg(target_os = "linux")]
mod sockets {
    //! Socket ownership from `/proc/net/tcp{,6}` and `/proc/<pid>/fd`.
    use std::{
        collections::{BTreeSet, HashMap},
        fs, io,
    };

    use crate::error::ProbeError;

    const TCP_LISTEN: &str = "0A";
    const TCP_TABLES: &[&str] = &["/proc/net/tcp", "/proc/net/tcp6"];

    /// Parses a `/proc/net/tcp` table into `(port, inode)` pairs for LISTEN rows.
    pub(super) fn parse_listen_table(content: &str) -> Vec<(u16, u64)> {
        content
            .lines()
            .skip(1)
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() < 10 || fields[3] != TCP_LISTEN {
                    return None;
                }
                let (_, port_hex) = fields[1].rsplit_once(':')?;
                let port = u16::from_str_radix(port_hex, 16).ok()?;
                let inode = fields[9].parse::<u64>().ok()?;
                (inode != 0).then_some((port, inode))
            })
            .collect()
    }

    fn listen_inodes() -> Result<HashMap<u64, u16>, ProbeError> {
        let mut inodes = HashMap::new();
        for table in TCP_TABLES {
            match fs::read_to_string(table) {
                Ok(content) => {
                    for (port, inode) in parse_listen_table(&content) {
                        inodes.insert(inode, port);
                    }
                }
                // IPv6 may be disabled.
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(ProbeError::Sockets { pid: 0, source }),
            }
        }
        Ok(inodes)
    }

    fn socket_inodes(pid: u32) -> io::Result<Vec<u64>> {
        let mut inodes = Vec::new();
        for entry in fs::read_dir(format!("/proc/{pid}/fd"))? {
            let Ok(entry) = entry else { continue };
            let Ok(target) = fs::read_link(entry.path()) else {
                continue;
            };
            let target = target.to_string_lossy();
            if let Some(inode) = target
                .strip_prefix("socket:[")
                .and_then(|rest| rest.strip_suffix(']'))
                .and_then(|raw| raw.parse::<u64>().ok())
            {
                inodes.push(inode);
            }
        }
        Ok(inodes)
    }

    pub(super) fn ports_for(pids: &BTreeSet<u32>) -> Result<BTreeSet<u16>, ProbeError> {
        let listening = listen_inodes()?;
        let mut ports = BTreeSet::new();
        for &pid in pids {
            match socket_inodes(pid) {
                Ok(inodes) => ports.extend(
                    inodes
                        .iter()
                        .filter_map(|inode| listening.get(inode).copied()),
                ),
                // Exited meanwhile, or owned by another user.
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                    ) => {}
                Err(source) => return Err(ProbeError::Sockets { pid, source }),
            }
        }
        Ok(ports)
    }

    pub(super) fn listeners_of(port: u16) -> Result<BTreeSet<u32>, ProbeError> {
        let wanted: BTreeSet<u64> = listen_inodes()?
            .into_iter()
            .filter_map(|(inode, listen_port)| (listen_port == port).then_some(inode))
            .collect();
        let mut pids = BTreeSet::new();
        if wanted.is_empty() {
            return Ok(pids);
        }

        let proc_dir = fs::read_dir("/proc").map_err(|source| ProbeError::Sockets {
            pid: 0,
            source,
        })?;
        for entry in proc_dir.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            if let Ok(inodes) = socket_inodes(pid)
                && inodes.iter().any(|inode| wanted.contains(inode))
            {
                pids.insert(pid);
            }
        }
        Ok(pids)
    }

    /// Reads the state letter from `/proc/<pid>/stat`.
    pub(super) fn is_zombie(pid: u32) -> bool {
        let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
            return false;
        };
        // The command name is parenthesised and may contain spaces.
        stat.rfind(')')
            .and_then(|end| stat[end + 1..].trim_start().chars().next())
            .is_some_and(|state| matches!(state, 'Z' | 'X'))
    }

}

#[cfg(not(target_os = "linux"))]
mod sockets {
    //! Socket ownership through `lsof`.
    use std::{
        collections::BTreeSet,
        io::Read,
        process::{Command, Stdio},
        thread,
        time::Instant,
    };

    use crate::constants::{PROCESS_CHECK_INTERVAL, TOOL_TIMEOUT};
    use crate::error::ProbeError;

    fn run_lsof(args: &[String]) -> Result<String, ProbeError> {
        let mut child = Command::new("lsof")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ProbeError::Tool {
                tool: "lsof",
                source,
            })?;

        let deadline = Instant::now() + TOOL_TIMEOUT;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() < deadline => thread::sleep(PROCESS_CHECK_INTERVAL),
                Ok(None) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ProbeError::Tool {
                        tool: "lsof",
                        source: std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "lsof timed out",
                        ),
                    });
                }
                Err(source) => {
                    return Err(ProbeError::Tool {
                        tool: "lsof",
                        source,
                    });
                }
            }
        }

        let mut output = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            stdout
                .read_to_string(&mut output)
                .map_err(|source| ProbeError::Tool {
                    tool: "lsof",
                    source,
                })?;
        }
        Ok(output)
    }

    /// Extracts ports from `lsof -Fn` name lines such as `n*:8000`.
    pub(super) fn parse_name_lines(output: &str) -> BTreeSet<u16> {
        output
            .lines()
            .filter_map(|line| line.strip_prefix('n'))
            .filter_map(|name| name.rsplit_once(':'))
            .filter_map(|(_, port)| port.parse::<u16>().ok())
            .collect()
    }

    pub(super) fn ports_for(pids: &BTreeSet<u32>) -> Result<BTreeSet<u16>, ProbeError> {
        let pid_list = pids
            .iter()
            .map(|pid| pid.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let output = run_lsof(&[
            "-aPn".to_string(),
            "-iTCP".to_string(),
            "-sTCP:LISTEN".to_string(),
            "-p".to_string(),
            pid_list,
            "-Fn".to_string(),
        ])?;
        Ok(parse_name_lines(&output))
    }

    pub(super) fn listeners_of(port: u16) -> Result<BTreeSet<u32>, ProbeError> {
        let output = run_lsof(&[
            "-nP".to_string(),
            format!("-iTCP:{port}"),
            "-sTCP:LISTEN".to_string(),
            "-t".to_string(),
        ])?;
        Ok(output
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .collect())
    }

    pub(super) fn is_zombie(pid: u32) -> bool {
        Command::new("ps")
            .args(["-o", "stat=", "-p", &pid.to_string()])
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).trim_start().starts_with('Z'))
            .unwrap_or(false)
    }

}
