// BENCHMANAGER CONFIGURATION
// LOADED FROM TOML, THEN OVERRIDDEN FIELD BY FIELD FROM THE COMMAND LINE.
// validate() MUST PASS BEFORE A SESSION IS BUILT FROM IT.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::readiness::Settle;

pub const DEFAULT_WORKER_COUNT: u32 = 4;
pub const DEFAULT_SETTLE_MS: u64 = 1_000;
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_REAP_TIMEOUT_MS: u64 = 500;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchConfig {
    pub server: ProcessSpec,
    pub relay: ProcessSpec,
    pub workers: WorkerSpec,
    pub settle: SettleConfig,
    pub teardown: TeardownConfig,
    /// Per-process `<role>.log` files for child stdout/stderr.
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn new<P: Into<PathBuf>>(program: P, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

// WORKERS TAKE NO CONFIGURED ARGS: EACH GETS ITS 1-BASED INDEX AND NOTHING ELSE
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSpec {
    pub program: PathBuf,
    pub count: u32,
}

impl Default for WorkerSpec {
    fn default() -> Self {
        Self {
            program: PathBuf::new(),
            count: DEFAULT_WORKER_COUNT,
        }
    }
}

impl WorkerSpec {
    pub fn args(&self, index: u32) -> Vec<String> {
        vec![index.to_string()]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettleConfig {
    pub interval_ms: u64,
    pub server_probe: Option<SocketAddr>,
    pub relay_probe: Option<SocketAddr>,
    pub probe_timeout_ms: u64,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_SETTLE_MS,
            server_probe: None,
            relay_probe: None,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
        }
    }
}

impl SettleConfig {
    pub fn after_server(&self) -> Settle {
        self.policy(self.server_probe)
    }

    pub fn after_relay(&self) -> Settle {
        self.policy(self.relay_probe)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    fn policy(&self, probe: Option<SocketAddr>) -> Settle {
        match probe {
            Some(addr) => Settle::Tcp {
                addr,
                timeout: Duration::from_millis(self.probe_timeout_ms),
            },
            None => Settle::Delay(self.interval()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TeardownConfig {
    /// SIGTERM head start before SIGKILL. Zero kills outright.
    pub grace_ms: u64,
    pub reap_timeout_ms: u64,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            grace_ms: 0,
            reap_timeout_ms: DEFAULT_REAP_TIMEOUT_MS,
        }
    }
}

impl TeardownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn reap_timeout(&self) -> Duration {
        Duration::from_millis(self.reap_timeout_ms)
    }
}

impl BenchConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let programs = [
            ("server", &self.server.program),
            ("relay", &self.relay.program),
            ("worker", &self.workers.program),
        ];
        for (name, program) in programs {
            if program.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!("{} program is not set", name)));
            }
        }
        if self.workers.count == 0 {
            return Err(ConfigError::Invalid("worker count must be at least 1".into()));
        }
        if self.teardown.reap_timeout_ms == 0 {
            return Err(ConfigError::Invalid("teardown.reap_timeout_ms must be positive".into()));
        }
        if self.settle.probe_timeout_ms == 0
            && (self.settle.server_probe.is_some() || self.settle.relay_probe.is_some())
        {
            return Err(ConfigError::Invalid("settle.probe_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}
