// BENCHMANAGER REPORT
// HUMAN SUMMARY FOR THE CONSOLE, JSON FOR WHATEVER COLLECTS RESULTS.

use std::fs;
use std::io;
use std::path::Path;

use serde::Serialize;

use crate::process::{ExitState, TerminationOutcome};
use crate::session::{BenchmarkResult, ServerOutcome};

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub server: ServerReport,
    pub elapsed_ms: u64,
    pub spawned: Vec<SpawnEntry>,
    pub teardown: Vec<TeardownEntry>,
    pub issues: Vec<IssueEntry>,
}

#[derive(Debug, Serialize)]
pub struct ServerReport {
    pub status: String,
    pub clean: bool,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub interrupted: bool,
}

#[derive(Debug, Serialize)]
pub struct SpawnEntry {
    pub seq: usize,
    pub role: String,
    pub pid: u32,
    pub program: String,
    pub args: Vec<String>,
    pub at_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct TeardownEntry {
    pub role: String,
    pub pid: u32,
    pub outcome: &'static str,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub struct IssueEntry {
    pub role: String,
    pub message: String,
}

impl RunReport {
    pub fn from_result(result: &BenchmarkResult) -> Self {
        let (exit_code, signal) = match result.server {
            ServerOutcome::Exited(ExitState::Code(code)) => (Some(code), None),
            ServerOutcome::Exited(ExitState::Signal(sig)) => (None, Some(sig)),
            ServerOutcome::Interrupted => (None, None),
        };

        Self {
            server: ServerReport {
                status: result.server.to_string(),
                clean: matches!(result.server, ServerOutcome::Exited(exit) if exit.is_clean()),
                exit_code,
                signal,
                interrupted: result.server == ServerOutcome::Interrupted,
            },
            elapsed_ms: result.elapsed.as_millis() as u64,
            spawned: result
                .spawned
                .iter()
                .map(|r| SpawnEntry {
                    seq: r.seq,
                    role: r.role.to_string(),
                    pid: r.pid,
                    program: r.program.display().to_string(),
                    args: r.args.clone(),
                    at_ms: r.at.as_millis() as u64,
                })
                .collect(),
            teardown: result
                .teardown
                .iter()
                .map(|r| TeardownEntry {
                    role: r.role.to_string(),
                    pid: r.pid,
                    outcome: outcome_label(&r.outcome),
                    detail: r.outcome.to_string(),
                })
                .collect(),
            issues: result
                .issues
                .iter()
                .map(|i| IssueEntry {
                    role: i.role().to_string(),
                    message: i.to_string(),
                })
                .collect(),
        }
    }
}

fn outcome_label(outcome: &TerminationOutcome) -> &'static str {
    match outcome {
        TerminationOutcome::Terminated(_) => "terminated",
        TerminationOutcome::AlreadyExited(_) => "already_exited",
        TerminationOutcome::Failed(_) => "failed",
    }
}

pub fn save_json(result: &BenchmarkResult, path: &Path) -> io::Result<()> {
    let text = serde_json::to_string_pretty(&RunReport::from_result(result))?;
    fs::write(path, text + "\n")
}

pub fn summary(result: &BenchmarkResult) -> Vec<String> {
    let sep = "=".repeat(60);
    let mut report = Vec::new();

    report.push(sep.clone());
    report.push("BENCHMANAGER SUMMARY".to_string());
    report.push(sep.clone());

    let verdict = match result.server {
        ServerOutcome::Exited(exit) if exit.is_clean() => "CLEAN",
        ServerOutcome::Exited(_) => "UNEXPECTED EXIT",
        ServerOutcome::Interrupted => "INTERRUPTED",
    };
    report.push(format!("  SERVER:    {} ({})", result.server, verdict));
    report.push(format!("  ELAPSED:   {:.1}s", result.elapsed.as_secs_f64()));
    report.push(format!(
        "  SPAWNED:   {} ({} WORKERS)",
        result.spawned.len(),
        result.worker_indices().len()
    ));
    report.push(String::new());

    report.push(format!("{:>4} {:<12} {:>8} {:>9}  {}", "SEQ", "ROLE", "PID", "AT", "COMMAND"));
    report.push(format!("{} {} {} {}  {}", "-".repeat(4), "-".repeat(12), "-".repeat(8), "-".repeat(9), "-".repeat(20)));
    for r in &result.spawned {
        let mut command = r.program.display().to_string();
        for arg in &r.args {
            command.push(' ');
            command.push_str(arg);
        }
        report.push(format!(
            "{:>4} {:<12} {:>8} {:>7}ms  {}",
            r.seq,
            r.role.to_string(),
            r.pid,
            r.at.as_millis(),
            command
        ));
    }
    report.push(String::new());

    report.push("TEARDOWN".to_string());
    if result.teardown.is_empty() {
        report.push("  NOTHING TO STOP".to_string());
    }
    for r in &result.teardown {
        report.push(format!("  {:<12} {:>8}  {}", r.role.to_string(), r.pid, r.outcome));
    }
    report.push(String::new());

    if result.issues.is_empty() {
        report.push("ISSUES: NONE".to_string());
    } else {
        report.push(format!("ISSUES: {}", result.issues.len()));
        for issue in &result.issues {
            report.push(format!("  {}", issue));
        }
    }
    report.push(sep);
    report
}

pub fn print_summary(result: &BenchmarkResult) {
    for line in summary(result) {
        println!("{}", line);
    }
}
