// BENCHMANAGER SETTLE POLICY
// WHAT TO DO BETWEEN STARTUP STAGES: SLEEP A FIXED INTERVAL, OR POLL A TCP
// PORT UNTIL THE COLLABORATOR ACCEPTS. BOTH ARE CUT SHORT BY THE SHUTDOWN FLAG.

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

const PAUSE_SLICE: Duration = Duration::from_millis(10);
const PROBE_INTERVAL: Duration = Duration::from_millis(50);
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    Delay(Duration),
    Tcp { addr: SocketAddr, timeout: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    Elapsed,
    Ready(Duration),
    TimedOut { addr: SocketAddr, waited: Duration },
    Interrupted,
}

impl Settle {
    pub fn wait(&self, shutdown: &AtomicBool) -> SettleOutcome {
        match *self {
            Settle::Delay(duration) => {
                if pause(duration, shutdown) {
                    SettleOutcome::Elapsed
                } else {
                    SettleOutcome::Interrupted
                }
            }
            Settle::Tcp { addr, timeout } => probe_tcp(addr, timeout, shutdown),
        }
    }
}

// SLEEP IN SHORT SLICES. FALSE IF THE SHUTDOWN FLAG ENDED IT EARLY.
pub fn pause(duration: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(PAUSE_SLICE));
    }
}

fn probe_tcp(addr: SocketAddr, timeout: Duration, shutdown: &AtomicBool) -> SettleOutcome {
    let start = Instant::now();
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return SettleOutcome::Interrupted;
        }
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return SettleOutcome::TimedOut {
                addr,
                waited: start.elapsed(),
            };
        }
        match TcpStream::connect_timeout(&addr, remaining.min(PROBE_CONNECT_TIMEOUT)) {
            Ok(_) => return SettleOutcome::Ready(start.elapsed()),
            Err(err) => debug!(%addr, %err, "not accepting yet"),
        }
        if !pause(PROBE_INTERVAL.min(remaining), shutdown) {
            return SettleOutcome::Interrupted;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn closed_port() -> SocketAddr {
        // BIND THEN DROP: NOTHING LISTENS THERE AFTERWARDS
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr")
    }

    #[test]
    fn delay_runs_full_interval() {
        let flag = AtomicBool::new(false);
        let start = Instant::now();
        let outcome = Settle::Delay(Duration::from_millis(60)).wait(&flag);
        assert_eq!(outcome, SettleOutcome::Elapsed);
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn delay_interrupted_by_shutdown() {
        let flag = AtomicBool::new(true);
        let start = Instant::now();
        let outcome = Settle::Delay(Duration::from_secs(30)).wait(&flag);
        assert_eq!(outcome, SettleOutcome::Interrupted);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn zero_delay_is_immediate() {
        let flag = AtomicBool::new(false);
        assert!(pause(Duration::ZERO, &flag));
    }

    #[test]
    fn probe_ready_when_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let flag = AtomicBool::new(false);
        let outcome = Settle::Tcp { addr, timeout: Duration::from_secs(5) }.wait(&flag);
        assert!(matches!(outcome, SettleOutcome::Ready(_)), "{:?}", outcome);
    }

    #[test]
    fn probe_times_out_on_closed_port() {
        let addr = closed_port();
        let flag = AtomicBool::new(false);
        let outcome = Settle::Tcp { addr, timeout: Duration::from_millis(200) }.wait(&flag);
        match outcome {
            SettleOutcome::TimedOut { addr: probed, waited } => {
                assert_eq!(probed, addr);
                assert!(waited >= Duration::from_millis(200));
            }
            other => panic!("EXPECTED TIMEOUT, GOT {:?}", other),
        }
    }

    #[test]
    fn probe_interrupted_by_shutdown() {
        let flag = AtomicBool::new(true);
        let outcome = Settle::Tcp { addr: closed_port(), timeout: Duration::from_secs(30) }.wait(&flag);
        assert_eq!(outcome, SettleOutcome::Interrupted);
    }
}
