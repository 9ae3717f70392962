// BENCHMANAGER PROCESS HANDLES
// ONE SPAWNED EXECUTABLE PER HANDLE. EVERY CHILD LEADS ITS OWN PROCESS GROUP
// SO A SIGNAL REACHES ANYTHING IT FORKS (SHELL WRAPPERS, sudo).
// A HANDLE THAT IS DROPPED WHILE ITS CHILD IS STILL UNREAPED KILLS THE GROUP.

use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{SpawnError, TerminationError};

const REAP_POLL: Duration = Duration::from_millis(10);
const DROP_REAP_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Server,
    Relay,
    Worker(u32),
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => f.write_str("server"),
            Role::Relay => f.write_str("relay"),
            Role::Worker(index) => write!(f, "worker-{}", index),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Code(i32),
    Signal(i32),
}

impl ExitState {
    pub fn is_clean(&self) -> bool {
        matches!(self, ExitState::Code(0))
    }

    // SHELL CONVENTION: SIGNALED CHILDREN MAP TO 128 + SIGNO
    pub fn exit_code(&self) -> i32 {
        match *self {
            ExitState::Code(code) => code,
            ExitState::Signal(sig) => 128 + sig,
        }
    }
}

impl From<ExitStatus> for ExitState {
    fn from(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => ExitState::Code(code),
            None => ExitState::Signal(status.signal().unwrap_or(0)),
        }
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitState::Code(code) => write!(f, "exit code {}", code),
            ExitState::Signal(sig) => write!(f, "signal {}", sig),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationOutcome {
    // WE SIGNALED IT AND REAPED IT
    Terminated(ExitState),
    // IT WAS GONE BEFORE WE GOT TO IT
    AlreadyExited(ExitState),
    Failed(TerminationError),
}

impl TerminationOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, TerminationOutcome::Failed(_))
    }
}

impl fmt::Display for TerminationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationOutcome::Terminated(exit) => write!(f, "terminated ({})", exit),
            TerminationOutcome::AlreadyExited(exit) => write!(f, "already exited ({})", exit),
            TerminationOutcome::Failed(err) => write!(f, "FAILED: {}", err),
        }
    }
}

pub struct ManagedProcess {
    role: Role,
    child: Child,
    pgid: i32,
    exit: Option<ExitState>,
    // SET BY terminate(). A FAILED TERMINATION IS NOT RETRIED ON DROP.
    signaled: bool,
}

impl ManagedProcess {
    /// Launch `program` in a fresh process group.
    ///
    /// With `log_dir` set, stdout and stderr go to `<log_dir>/<role>.log`;
    /// otherwise they are inherited from the orchestrator. Stdin is always
    /// closed.
    pub fn spawn(
        role: Role,
        program: &Path,
        args: &[String],
        log_dir: Option<&Path>,
    ) -> Result<Self, SpawnError> {
        let spawn_error = |source| SpawnError {
            role,
            program: program.to_path_buf(),
            source,
        };

        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).process_group(0);

        if let Some(dir) = log_dir {
            let out = File::create(dir.join(format!("{}.log", role))).map_err(spawn_error)?;
            let err = out.try_clone().map_err(spawn_error)?;
            cmd.stdout(out).stderr(err);
        }

        // KILL THE CHILD IF THE ORCHESTRATOR DIES BEFORE IT CAN TEAR DOWN.
        // PDEATHSIG FIRES WHEN THE SPAWNING THREAD EXITS, NOT THE PROCESS.
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(spawn_error)?;
        let pgid = child.id() as i32;

        Ok(Self {
            role,
            child,
            pgid,
            exit: None,
            signaled: false,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn exit_state(&self) -> Option<ExitState> {
        self.exit
    }

    // NON-BLOCKING. REAPS THE CHILD IF IT HAS EXITED.
    pub fn try_exit(&mut self) -> io::Result<Option<ExitState>> {
        if self.exit.is_none() {
            if let Some(status) = self.child.try_wait()? {
                self.exit = Some(ExitState::from(status));
            }
        }
        Ok(self.exit)
    }

    /// Block until the child exits or `shutdown` is raised.
    ///
    /// Returns `Ok(None)` when interrupted. Exit is checked before the flag,
    /// so a child that already finished is always reported.
    pub fn wait_or_shutdown(
        &mut self,
        shutdown: &AtomicBool,
        poll: Duration,
    ) -> io::Result<Option<ExitState>> {
        loop {
            if let Some(exit) = self.try_exit()? {
                return Ok(Some(exit));
            }
            if shutdown.load(Ordering::Relaxed) {
                return Ok(None);
            }
            std::thread::sleep(poll);
        }
    }

    /// Forcefully stop the process group and reap the leader.
    ///
    /// A non-zero `grace` sends SIGTERM first and escalates to SIGKILL if the
    /// leader is still around when it runs out. Never retries.
    pub fn terminate(&mut self, grace: Duration, reap_timeout: Duration) -> TerminationOutcome {
        if let Some(outcome) = self.finish_if_exited() {
            return outcome;
        }
        if !grace.is_zero() {
            if let Some(outcome) = self.send_term(reap_timeout) {
                return outcome;
            }
            if let Some(outcome) = self.reap_after_term(grace) {
                return outcome;
            }
        }
        self.kill(reap_timeout)
    }

    /// Stop a whole cohort, in slice order.
    ///
    /// Every member gets SIGTERM before anyone is waited on, so the cohort
    /// shares a single `grace` window. Survivors are then killed one by one.
    pub fn terminate_all(
        cohort: &mut [ManagedProcess],
        grace: Duration,
        reap_timeout: Duration,
    ) -> Vec<TerminationOutcome> {
        let mut outcomes: Vec<Option<TerminationOutcome>> =
            cohort.iter_mut().map(|p| p.finish_if_exited()).collect();

        if !grace.is_zero() {
            for (process, outcome) in cohort.iter_mut().zip(outcomes.iter_mut()) {
                if outcome.is_none() {
                    *outcome = process.send_term(reap_timeout);
                }
            }
            let deadline = Instant::now() + grace;
            for (process, outcome) in cohort.iter_mut().zip(outcomes.iter_mut()) {
                if outcome.is_none() {
                    *outcome = process.reap_after_term(deadline.saturating_duration_since(Instant::now()));
                }
            }
        }

        cohort
            .iter_mut()
            .zip(outcomes)
            .map(|(process, outcome)| match outcome {
                Some(outcome) => outcome,
                None => process.kill(reap_timeout),
            })
            .collect()
    }

    // Some: NOTHING LEFT TO SIGNAL
    fn finish_if_exited(&mut self) -> Option<TerminationOutcome> {
        self.signaled = true;
        // AN UNREAPED ZOMBIE LEADER STILL PINS ITS PGID. ONCE REAPED THE ID MAY
        // BE RECYCLED, SO killpg IS ONLY SAFE BEFORE try_exit.
        if self.exit.is_none() && self.leader_is_zombie() {
            let _ = self.signal_group(libc::SIGKILL);
        }
        match self.try_exit() {
            Ok(Some(exit)) => Some(TerminationOutcome::AlreadyExited(exit)),
            Ok(None) => None,
            Err(err) => Some(TerminationOutcome::Failed(self.reap_failed(&err))),
        }
    }

    fn send_term(&mut self, reap_timeout: Duration) -> Option<TerminationOutcome> {
        match self.signal_group(libc::SIGTERM) {
            Ok(()) => None,
            Err(err) => Some(self.signal_failed(err, reap_timeout)),
        }
    }

    // None: STILL RUNNING, ESCALATE
    fn reap_after_term(&mut self, grace: Duration) -> Option<TerminationOutcome> {
        match self.reap_within(grace) {
            Ok(Some(exit)) => Some(TerminationOutcome::Terminated(exit)),
            Ok(None) => {
                debug!(role = %self.role, pid = self.pid(), "grace expired, escalating");
                None
            }
            Err(err) => Some(TerminationOutcome::Failed(self.reap_failed(&err))),
        }
    }

    fn kill(&mut self, reap_timeout: Duration) -> TerminationOutcome {
        if let Err(err) = self.signal_group(libc::SIGKILL) {
            return self.signal_failed(err, reap_timeout);
        }
        match self.reap_within(reap_timeout) {
            Ok(Some(exit)) => TerminationOutcome::Terminated(exit),
            Ok(None) => TerminationOutcome::Failed(TerminationError::Unresponsive {
                role: self.role,
                pid: self.pid(),
                waited: reap_timeout,
            }),
            Err(err) => TerminationOutcome::Failed(self.reap_failed(&err)),
        }
    }

    // PEEK WITHOUT REAPING (WNOWAIT)
    fn leader_is_zombie(&self) -> bool {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                self.pid() as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
            )
        };
        rc == 0 && unsafe { info.si_pid() } != 0
    }

    fn signal_group(&self, sig: libc::c_int) -> io::Result<()> {
        if unsafe { libc::killpg(self.pgid, sig) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    // ESRCH: THE WHOLE GROUP VANISHED BETWEEN try_exit AND THE SIGNAL
    fn signal_failed(&mut self, err: io::Error, reap_timeout: Duration) -> TerminationOutcome {
        if err.raw_os_error() == Some(libc::ESRCH) {
            if let Ok(Some(exit)) = self.reap_within(reap_timeout) {
                return TerminationOutcome::AlreadyExited(exit);
            }
        }
        TerminationOutcome::Failed(TerminationError::Signal {
            role: self.role,
            pid: self.pid(),
            reason: err.to_string(),
        })
    }

    fn reap_failed(&self, err: &io::Error) -> TerminationError {
        TerminationError::Reap {
            role: self.role,
            pid: self.pid(),
            reason: err.to_string(),
        }
    }

    fn reap_within(&mut self, timeout: Duration) -> io::Result<Option<ExitState>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(exit) = self.try_exit()? {
                return Ok(Some(exit));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(REAP_POLL);
        }
    }
}

impl fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("role", &self.role)
            .field("pid", &self.pid())
            .field("exit", &self.exit)
            .finish()
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if self.exit.is_some() || self.signaled {
            return;
        }
        let outcome = self.terminate(Duration::ZERO, DROP_REAP_TIMEOUT);
        if outcome.is_failure() {
            warn!(role = %self.role, pid = self.pid(), %outcome, "release on drop");
        } else {
            debug!(role = %self.role, pid = self.pid(), %outcome, "release on drop");
        }
    }
}

/// Resolve `program` the way `execvp` would: paths with a separator are
/// taken as-is, bare names are searched on `PATH`.
pub fn resolve_executable(program: &Path) -> Option<PathBuf> {
    if program.as_os_str().is_empty() {
        return None;
    }
    if program.components().count() > 1 || program.is_absolute() {
        return is_executable(program).then(|| program.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    // ZOMBIES COUNT AS DEAD: ORPHANS ARE REAPED BY WHOEVER ADOPTS THEM, NOT US
    fn running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(") ")
                .map(|(_, rest)| !rest.starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    // sh LEADER THAT BACKGROUNDS A sleep AND EXITS, LEAVING THE sleep IN ITS GROUP
    fn spawn_with_straggler(dir: &Path) -> (ManagedProcess, u32) {
        let pidfile = dir.join("straggler.pid");
        let script = format!("sleep 30 & echo $! > {}", pidfile.display());
        let proc = ManagedProcess::spawn(Role::Worker(1), Path::new("sh"), &args(&["-c", &script]), None)
            .expect("spawn sh");
        std::thread::sleep(Duration::from_millis(300));
        let straggler = std::fs::read_to_string(&pidfile)
            .expect("pidfile")
            .trim()
            .parse()
            .expect("pid");
        (proc, straggler)
    }

    #[test]
    fn role_labels() {
        assert_eq!(Role::Server.to_string(), "server");
        assert_eq!(Role::Relay.to_string(), "relay");
        assert_eq!(Role::Worker(3).to_string(), "worker-3");
        assert!(Role::Server < Role::Relay);
        assert!(Role::Relay < Role::Worker(1));
    }

    #[test]
    fn exit_state_codes() {
        assert!(ExitState::Code(0).is_clean());
        assert!(!ExitState::Code(3).is_clean());
        assert!(!ExitState::Signal(9).is_clean());
        assert_eq!(ExitState::Code(3).exit_code(), 3);
        assert_eq!(ExitState::Signal(9).exit_code(), 137);
        assert_eq!(ExitState::Signal(15).to_string(), "signal 15");
    }

    #[test]
    fn terminate_running_child() {
        let mut proc = ManagedProcess::spawn(Role::Relay, Path::new("sleep"), &args(&["30"]), None)
            .expect("spawn sleep");
        let pid = proc.pid();
        assert!(alive(pid));

        let outcome = proc.terminate(Duration::ZERO, Duration::from_secs(2));
        assert_eq!(outcome, TerminationOutcome::Terminated(ExitState::Signal(libc::SIGKILL)));
        assert_eq!(proc.exit_state(), Some(ExitState::Signal(libc::SIGKILL)));
        assert!(!alive(pid));
    }

    #[test]
    fn terminate_with_grace_uses_sigterm() {
        let mut proc = ManagedProcess::spawn(Role::Worker(1), Path::new("sleep"), &args(&["30"]), None)
            .expect("spawn sleep");
        let outcome = proc.terminate(Duration::from_secs(2), Duration::from_secs(2));
        assert_eq!(outcome, TerminationOutcome::Terminated(ExitState::Signal(libc::SIGTERM)));
    }

    #[test]
    fn terminate_after_natural_exit() {
        let mut proc = ManagedProcess::spawn(Role::Worker(2), Path::new("true"), &[], None)
            .expect("spawn true");
        let never = AtomicBool::new(false);
        let exit = proc
            .wait_or_shutdown(&never, Duration::from_millis(5))
            .expect("wait");
        assert_eq!(exit, Some(ExitState::Code(0)));

        let outcome = proc.terminate(Duration::ZERO, Duration::from_millis(100));
        assert_eq!(outcome, TerminationOutcome::AlreadyExited(ExitState::Code(0)));
    }

    #[test]
    fn zombie_leader_takes_stragglers_down() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut proc, straggler) = spawn_with_straggler(dir.path());
        assert!(running(straggler));

        // LEADER HAS EXITED BUT IS NOT YET REAPED
        let outcome = proc.terminate(Duration::ZERO, Duration::from_millis(500));
        assert_eq!(outcome, TerminationOutcome::AlreadyExited(ExitState::Code(0)));

        std::thread::sleep(Duration::from_millis(100));
        assert!(!running(straggler), "STRAGGLER {} SURVIVED", straggler);
    }

    #[test]
    fn reaped_leader_group_is_not_signaled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut proc, straggler) = spawn_with_straggler(dir.path());
        assert_eq!(proc.try_exit().expect("try_exit"), Some(ExitState::Code(0)));

        // THE PGID IS NO LONGER PINNED BY A ZOMBIE: HANDS OFF
        let outcome = proc.terminate(Duration::ZERO, Duration::from_millis(500));
        assert_eq!(outcome, TerminationOutcome::AlreadyExited(ExitState::Code(0)));
        assert!(running(straggler));

        unsafe {
            libc::kill(straggler as i32, libc::SIGKILL);
        }
    }

    #[test]
    fn cohort_shares_one_grace_window() {
        // TWO IGNORE SIGTERM (INHERITED BY sleep ACROSS exec), ONE DOES NOT
        let stubborn = args(&["-c", "trap '' TERM; sleep 30"]);
        let mut cohort = vec![
            ManagedProcess::spawn(Role::Worker(1), Path::new("sh"), &stubborn, None).expect("spawn"),
            ManagedProcess::spawn(Role::Worker(2), Path::new("sh"), &stubborn, None).expect("spawn"),
            ManagedProcess::spawn(Role::Relay, Path::new("sleep"), &args(&["30"]), None).expect("spawn"),
        ];
        std::thread::sleep(Duration::from_millis(200));

        let grace = Duration::from_millis(600);
        let started = Instant::now();
        let outcomes = ManagedProcess::terminate_all(&mut cohort, grace, Duration::from_secs(2));
        let took = started.elapsed();

        assert_eq!(
            outcomes,
            vec![
                TerminationOutcome::Terminated(ExitState::Signal(libc::SIGKILL)),
                TerminationOutcome::Terminated(ExitState::Signal(libc::SIGKILL)),
                TerminationOutcome::Terminated(ExitState::Signal(libc::SIGTERM)),
            ]
        );
        // ONE WINDOW, NOT ONE PER STUBBORN MEMBER
        assert!(took >= grace);
        assert!(took < grace * 2, "TEARDOWN TOOK {:?}", took);
        for proc in &cohort {
            assert!(!alive(proc.pid()));
        }
    }

    #[test]
    fn wait_returns_none_on_shutdown() {
        let mut proc = ManagedProcess::spawn(Role::Server, Path::new("sleep"), &args(&["30"]), None)
            .expect("spawn sleep");
        let raised = AtomicBool::new(true);
        let exit = proc
            .wait_or_shutdown(&raised, Duration::from_millis(5))
            .expect("wait");
        assert_eq!(exit, None);
        // DROP CLEANS UP
    }

    #[test]
    fn spawn_missing_binary() {
        let err = ManagedProcess::spawn(Role::Server, Path::new("/nonexistent/tradeserver"), &[], None)
            .expect_err("missing binary must not spawn");
        assert_eq!(err.role, Role::Server);
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(err.to_string().contains("server"));
    }

    #[test]
    fn drop_kills_child() {
        let proc = ManagedProcess::spawn(Role::Worker(4), Path::new("sleep"), &args(&["30"]), None)
            .expect("spawn sleep");
        let pid = proc.pid();
        drop(proc);
        assert!(!alive(pid));
    }

    #[test]
    fn output_goes_to_log_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut proc = ManagedProcess::spawn(
            Role::Relay,
            Path::new("sh"),
            &args(&["-c", "echo relay up"]),
            Some(dir.path()),
        )
        .expect("spawn sh");
        let never = AtomicBool::new(false);
        proc.wait_or_shutdown(&never, Duration::from_millis(5)).expect("wait");

        let log = std::fs::read_to_string(dir.path().join("relay.log")).expect("read log");
        assert_eq!(log.trim(), "relay up");
    }

    #[test]
    fn resolve_executable_paths() {
        assert!(resolve_executable(Path::new("sh")).is_some());
        assert!(resolve_executable(Path::new("/nonexistent/bencher")).is_none());
        assert!(resolve_executable(Path::new("")).is_none());

        let file = tempfile::NamedTempFile::new().expect("tempfile");
        assert!(resolve_executable(file.path()).is_none()); // NOT EXECUTABLE

        let mut perms = std::fs::metadata(file.path()).expect("meta").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(file.path(), perms).expect("chmod");
        assert_eq!(resolve_executable(file.path()), Some(file.path().to_path_buf()));
    }
}
