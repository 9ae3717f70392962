// BENCHMANAGER ERRORS
// ONLY A SERVER SPAWN FAILURE (OR LOSING TRACK OF THE SERVER) IS FATAL.
// EVERYTHING ELSE IS COLLECTED AS A ProcessIssue ON THE RESULT.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::process::Role;

#[derive(Debug, Error)]
#[error("failed to spawn {role} ({path}): {source}", path = .program.display())]
pub struct SpawnError {
    pub role: Role,
    pub program: PathBuf,
    #[source]
    pub source: io::Error,
}

impl SpawnError {
    pub fn kind(&self) -> io::ErrorKind {
        self.source.kind()
    }
}

// CLONE: THE SAME FAILURE LANDS ON THE TEARDOWN RECORD AND IN THE ISSUE LIST
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TerminationError {
    #[error("failed to signal {role} (pid {pid}): {reason}")]
    Signal { role: Role, pid: u32, reason: String },
    #[error("failed to reap {role} (pid {pid}): {reason}")]
    Reap { role: Role, pid: u32, reason: String },
    #[error("{role} (pid {pid}) still running {waited:?} after SIGKILL")]
    Unresponsive { role: Role, pid: u32, waited: Duration },
}

impl TerminationError {
    pub fn role(&self) -> Role {
        match self {
            TerminationError::Signal { role, .. }
            | TerminationError::Reap { role, .. }
            | TerminationError::Unresponsive { role, .. } => *role,
        }
    }
}

/// Non-fatal problem met while managing the cohort.
#[derive(Debug, Error)]
pub enum ProcessIssue {
    #[error(transparent)]
    Spawn(SpawnError),
    #[error(transparent)]
    Termination(TerminationError),
    #[error("{role} not accepting connections on {addr} after {waited:?}")]
    NotReady {
        role: Role,
        addr: SocketAddr,
        waited: Duration,
    },
}

impl ProcessIssue {
    pub fn role(&self) -> Role {
        match self {
            ProcessIssue::Spawn(err) => err.role,
            ProcessIssue::Termination(err) => err.role(),
            ProcessIssue::NotReady { role, .. } => *role,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    // THE CAUSE IS ALREADY IN THE MESSAGE; NO source() SO IT PRINTS ONCE
    #[error("benchmark aborted: {0}")]
    ServerSpawn(SpawnError),
    #[error("lost track of the server process")]
    ServerWait(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration from {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse configuration at {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
