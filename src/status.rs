//! Text rendering of snapshots for the terminal.
use std::{collections::BTreeSet, io::IsTerminal};
use terminal_size::{Width, terminal_size};

use crate::config::ServiceSpec;
use crate::conflict::ConflictReport;
use crate::monitor::Snapshot;
use crate::supervisor::{ServiceState, ServiceView};

const GREEN_BOLD: &str = "\x1b[1;32m"; // Bright Green
const RED_BOLD: &str = "\x1b[1;31m"; // Bright Red
const YELLOW_BOLD: &str = "\x1b[1;33m"; // Yellow/Gold
const RESET: &str = "\x1b[0m"; // Reset color

const MIN_COMMAND_WIDTH: usize = 16;
const COLUMN_GAP: &str = "  ";

/// How output is decorated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    /// Emit ANSI colors.
    pub color: bool,
    /// Terminal width used to truncate the command column.
    pub width: Option<usize>,
}

impl RenderOptions {
    /// Plain output with no width limit.
    pub fn plain() -> Self {
        Self {
            color: false,
            width: None,
        }
    }

    /// Options matching the attached terminal.
    pub fn detect(no_color: bool) -> Self {
        let stdout = std::io::stdout();
        Self {
            color: !no_color && stdout.is_terminal(),
            width: terminal_size().map(|(Width(width), _)| width as usize),
        }
    }

    fn paint(&self, text: &str, color: &str) -> String {
        if self.color {
            format!("{color}{text}{RESET}")
        } else {
            text.to_string()
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    if max <= 3 {
        return text.chars().take(max).collect();
    }
    let mut out: String = text.chars().take(max - 3).collect();
    out.push_str("...");
    out
}

fn join_pids(pids: &BTreeSet<u32>) -> String {
    pids.iter()
        .map(|pid| pid.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn state_color(state: ServiceState) -> &'static str {
    match state {
        ServiceState::Running => GREEN_BOLD,
        ServiceState::Starting | ServiceState::Stopping => YELLOW_BOLD,
        ServiceState::Stopped => RESET,
    }
}

fn ports_cell(view: &ServiceView) -> String {
    if !view.status.observed_ports.is_empty() {
        return view
            .status
            .observed_ports
            .iter()
            .map(|port| port.to_string())
            .collect::<Vec<_>>()
            .join(",");
    }
    match view.status.spec.declared_port() {
        Some(port) => format!("({port})"),
        None => "-".to_string(),
    }
}

/// Problems worth flagging next to `view`.
pub fn service_issues(view: &ServiceView, conflicts: &ConflictReport) -> Vec<String> {
    let mut issues: Vec<String> = conflicts
        .ports_for(&view.status)
        .into_iter()
        .map(|(port, pids)| format!("port {port} held by PID(s) {}", join_pids(&pids)))
        .collect();

    if let Some(pids) = conflicts.duplicate_groups.get(&view.status.spec.name) {
        issues.push(format!("duplicate instances: PID(s) {}", join_pids(pids)));
    }
    if let Some(err) = &view.last_error {
        issues.push(err.clone());
    }
    issues
}

/// Renders the service table, with issues listed under each row.
pub fn render_table(snapshot: &Snapshot, options: &RenderOptions) -> String {
    let mut out = String::new();
    if let Some(err) = &snapshot.probe_error {
        out.push_str(&options.paint(&format!("! process probing is failing: {err}"), RED_BOLD));
        out.push('\n');
    }
    if snapshot.services.is_empty() {
        out.push_str("No services declared.\n");
        return out;
    }

    let rows: Vec<[String; 4]> = snapshot
        .services
        .iter()
        .map(|view| {
            [
                view.status.spec.name.clone(),
                view.state.to_string(),
                view.status
                    .pid
                    .map(|pid| pid.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                ports_cell(view),
            ]
        })
        .collect();

    let headers = ["NAME", "STATE", "PID", "PORTS"];
    let mut widths = headers.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let fixed: usize = widths.iter().sum::<usize>() + COLUMN_GAP.len() * headers.len();
    let command_width = options
        .width
        .map(|width| width.saturating_sub(fixed).max(MIN_COMMAND_WIDTH));

    let mut header = String::new();
    for (title, width) in headers.iter().zip(widths) {
        header.push_str(&format!("{title:<width$}{COLUMN_GAP}"));
    }
    header.push_str("COMMAND");
    out.push_str(&header);
    out.push('\n');

    for (view, row) in snapshot.services.iter().zip(&rows) {
        let mut line = String::new();
        for (index, (cell, width)) in row.iter().zip(widths).enumerate() {
            let padded = format!("{cell:<width$}");
            if index == 1 {
                line.push_str(&options.paint(&padded, state_color(view.state)));
            } else {
                line.push_str(&padded);
            }
            line.push_str(COLUMN_GAP);
        }
        match command_width {
            Some(max) => line.push_str(&truncate(&view.status.spec.command, max)),
            None => line.push_str(&view.status.spec.command),
        }
        out.push_str(line.trim_end());
        out.push('\n');

        for issue in service_issues(view, &snapshot.conflicts) {
            out.push_str("  ");
            out.push_str(&options.paint(&format!("! {issue}"), RED_BOLD));
            out.push('\n');
        }
    }
    out
}

/// Renders a conflict report on its own.
pub fn render_conflicts(report: &ConflictReport, options: &RenderOptions) -> String {
    if report.is_empty() {
        return "No conflicts detected.\n".to_string();
    }

    let mut out = String::new();
    if !report.port_conflicts.is_empty() {
        out.push_str(&options.paint("Port conflicts:", RED_BOLD));
        out.push('\n');
        for (port, pids) in &report.port_conflicts {
            out.push_str(&format!("  {port}: PID(s) {}\n", join_pids(pids)));
        }
    }
    if !report.duplicate_groups.is_empty() {
        out.push_str(&options.paint("Duplicate instances:", YELLOW_BOLD));
        out.push('\n');
        for (name, pids) in &report.duplicate_groups {
            out.push_str(&format!("  {name}: PID(s) {}\n", join_pids(pids)));
        }
    }
    out
}

/// Renders the declared services without probing them.
pub fn render_specs(specs: &[ServiceSpec]) -> String {
    if specs.is_empty() {
        return "No services declared.\n".to_string();
    }
    let name_width = specs
        .iter()
        .map(|spec| spec.name.chars().count())
        .max()
        .unwrap_or(0)
        .max("NAME".len());

    let mut out = format!("{:<name_width$}{COLUMN_GAP}{:<5}{COLUMN_GAP}COMMAND\n", "NAME", "PORT");
    for spec in specs {
        let port = spec
            .declared_port()
            .map(|port| port.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<name_width$}{COLUMN_GAP}{port:<5}{COLUMN_GAP}{}\n",
            spec.name, spec.command
        ));
    }
    out
}
