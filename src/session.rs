// BENCHMANAGER SESSION
// ONE BENCHMARK RUN: SERVER -> SETTLE -> RELAY -> SETTLE -> N WORKERS,
// THEN BLOCK ON THE SERVER AND TEAR DOWN EVERYTHING ELSE.
//
// THE SESSION OWNS EVERY HANDLE IT SPAWNS. TEARDOWN IS AN EXPLICIT PASS OVER
// THAT COLLECTION; ManagedProcess::drop COVERS EARLY RETURNS AND PANICS.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::BenchConfig;
use crate::error::{ProcessIssue, SessionError, SpawnError};
use crate::process::{ExitState, ManagedProcess, Role, TerminationOutcome};
use crate::readiness::{Settle, SettleOutcome};

const SERVER_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOutcome {
    Exited(ExitState),
    // THE ORCHESTRATOR WAS ASKED TO STOP BEFORE THE SERVER FINISHED
    Interrupted,
}

impl fmt::Display for ServerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerOutcome::Exited(exit) => write!(f, "{}", exit),
            ServerOutcome::Interrupted => f.write_str("interrupted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRecord {
    pub seq: usize,
    pub role: Role,
    pub pid: u32,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Offset from session start.
    pub at: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownRecord {
    pub role: Role,
    pub pid: u32,
    pub outcome: TerminationOutcome,
}

#[derive(Debug)]
pub struct BenchmarkResult {
    pub server: ServerOutcome,
    pub spawned: Vec<SpawnRecord>,
    pub teardown: Vec<TeardownRecord>,
    pub issues: Vec<ProcessIssue>,
    pub elapsed: Duration,
}

impl BenchmarkResult {
    /// Server status when it ended non-zero or by a signal. A legitimate
    /// benchmark outcome, not an orchestrator failure.
    pub fn unexpected_exit(&self) -> Option<ExitState> {
        match self.server {
            ServerOutcome::Exited(exit) if !exit.is_clean() => Some(exit),
            _ => None,
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self.server, ServerOutcome::Exited(exit) if exit.is_clean()) && self.issues.is_empty()
    }

    pub fn worker_indices(&self) -> Vec<u32> {
        self.spawned
            .iter()
            .filter_map(|r| match r.role {
                Role::Worker(index) => Some(index),
                _ => None,
            })
            .collect()
    }

    pub fn spawn_record(&self, role: Role) -> Option<&SpawnRecord> {
        self.spawned.iter().find(|r| r.role == role)
    }

    // EXIT CODE FOR THE ORCHESTRATOR ITSELF
    pub fn exit_code(&self) -> i32 {
        match self.server {
            ServerOutcome::Exited(exit) => exit.exit_code(),
            ServerOutcome::Interrupted => 128 + libc::SIGINT,
        }
    }
}

pub struct BenchmarkSession<'a> {
    config: &'a BenchConfig,
    shutdown: &'a AtomicBool,
    started: Instant,
    relay: Option<ManagedProcess>,
    workers: Vec<ManagedProcess>,
    spawned: Vec<SpawnRecord>,
    issues: Vec<ProcessIssue>,
}

impl<'a> BenchmarkSession<'a> {
    /// `config` must have passed `BenchConfig::validate`.
    pub fn new(config: &'a BenchConfig, shutdown: &'a AtomicBool) -> Self {
        Self {
            config,
            shutdown,
            started: Instant::now(),
            relay: None,
            workers: Vec::with_capacity(config.workers.count as usize),
            spawned: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn run(mut self) -> Result<BenchmarkResult, SessionError> {
        let config = self.config;
        self.started = Instant::now();
        info!(workers = config.workers.count, "STARTING");

        let mut server = self
            .spawn(Role::Server, &config.server.program, &config.server.args)
            .map_err(SessionError::ServerSpawn)?;

        self.start_cohort();

        info!(pid = server.pid(), "RUNNING: WAITING ON SERVER");
        let outcome = match server.wait_or_shutdown(self.shutdown, SERVER_POLL) {
            Ok(Some(exit)) => ServerOutcome::Exited(exit),
            Ok(None) => ServerOutcome::Interrupted,
            // server, relay AND workers ARE RELEASED ON DROP
            Err(err) => return Err(SessionError::ServerWait(err)),
        };
        match outcome {
            ServerOutcome::Exited(exit) if exit.is_clean() => info!(%outcome, "server finished"),
            _ => warn!(%outcome, "server did not finish cleanly"),
        }

        let teardown = self.teardown(server, outcome);
        let elapsed = self.started.elapsed();
        info!(?elapsed, issues = self.issues.len(), "SESSION COMPLETE");

        Ok(BenchmarkResult {
            server: outcome,
            spawned: self.spawned,
            teardown,
            issues: self.issues,
            elapsed,
        })
    }

    // RELAY AND WORKERS. ONLY AN INTERRUPT CUTS THIS SHORT: A SERVER THAT HAS
    // ALREADY EXITED STILL GETS ITS FULL COHORT, WHICH TEARDOWN THEN STOPS.
    fn start_cohort(&mut self) {
        let config = self.config;

        if !self.settle(Role::Server, config.settle.after_server()) {
            return;
        }

        match self.spawn(Role::Relay, &config.relay.program, &config.relay.args) {
            Ok(relay) => self.relay = Some(relay),
            Err(err) => self.record(ProcessIssue::Spawn(err)),
        }

        // NOTHING TO PROBE IF THE RELAY NEVER STARTED
        let after_relay = match self.relay {
            Some(_) => config.settle.after_relay(),
            None => Settle::Delay(config.settle.interval()),
        };
        if !self.settle(Role::Relay, after_relay) {
            return;
        }

        // spawn() DOES NOT WAIT ON THE CHILD, SO WORKERS RUN CONCURRENTLY
        for index in 1..=config.workers.count {
            let role = Role::Worker(index);
            match self.spawn(role, &config.workers.program, &config.workers.args(index)) {
                Ok(worker) => self.workers.push(worker),
                Err(err) => self.record(ProcessIssue::Spawn(err)),
            }
        }
    }

    // FALSE: INTERRUPTED, SKIP THE REST OF STARTUP
    fn settle(&mut self, after: Role, settle: Settle) -> bool {
        match settle.wait(self.shutdown) {
            SettleOutcome::Interrupted => {
                warn!(%after, "interrupted during startup");
                return false;
            }
            SettleOutcome::TimedOut { addr, waited } => {
                self.record(ProcessIssue::NotReady { role: after, addr, waited });
            }
            SettleOutcome::Ready(waited) => info!(%after, ?waited, "ready"),
            SettleOutcome::Elapsed => {}
        }
        true
    }

    fn spawn(&mut self, role: Role, program: &Path, args: &[String]) -> Result<ManagedProcess, SpawnError> {
        let process = ManagedProcess::spawn(role, program, args, self.config.log_dir.as_deref())?;
        let record = SpawnRecord {
            seq: self.spawned.len(),
            role,
            pid: process.pid(),
            program: program.to_path_buf(),
            args: args.to_vec(),
            at: self.started.elapsed(),
        };
        info!(%role, pid = record.pid, program = %program.display(), args = ?args, "spawned");
        self.spawned.push(record);
        Ok(process)
    }

    fn record(&mut self, issue: ProcessIssue) {
        warn!(role = %issue.role(), "{}", issue);
        self.issues.push(issue);
    }

    // WORKERS BY INDEX, THEN RELAY, THEN THE SERVER IF IT IS STILL RUNNING.
    // EVERY HANDLE IS SIGNALED ONCE; FAILURES ARE RECORDED AND SKIPPED.
    // THE GRACE WINDOW IS SHARED BY THE WHOLE COHORT.
    fn teardown(&mut self, server: ManagedProcess, outcome: ServerOutcome) -> Vec<TeardownRecord> {
        info!("TEARDOWN");
        let grace = self.config.teardown.grace();
        let reap_timeout = self.config.teardown.reap_timeout();

        let mut cohort = std::mem::take(&mut self.workers);
        cohort.extend(self.relay.take());
        if outcome == ServerOutcome::Interrupted {
            cohort.push(server);
        }

        let outcomes = ManagedProcess::terminate_all(&mut cohort, grace, reap_timeout);

        let mut records = Vec::with_capacity(cohort.len());
        for (process, outcome) in cohort.iter().zip(outcomes) {
            if let TerminationOutcome::Failed(err) = &outcome {
                self.record(ProcessIssue::Termination(err.clone()));
            } else {
                info!(role = %process.role(), pid = process.pid(), %outcome, "stopped");
            }
            records.push(TeardownRecord {
                role: process.role(),
                pid: process.pid(),
                outcome,
            });
        }
        records
    }
}
