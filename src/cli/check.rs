use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use anyhow::{bail, Result};

use benchmanager::process::resolve_executable;
use benchmanager::BenchConfig;

// SOMETHING ALREADY ANSWERING ON A PROBE ADDRESS IS USUALLY A STALE SERVER
fn port_in_use(addr: &SocketAddr) -> bool {
    TcpStream::connect_timeout(addr, Duration::from_millis(250)).is_ok()
}

pub fn run_check(config: &BenchConfig) -> Result<()> {
    println!("BENCHMANAGER DEPENDENCY CHECK");
    println!();

    let mut ok = true;
    let programs = [
        ("server", &config.server.program),
        ("relay", &config.relay.program),
        ("worker", &config.workers.program),
    ];
    for (name, program) in programs {
        match resolve_executable(program) {
            Some(path) => println!("  {:<8}{:<40}OK ({})", name, program.display(), path.display()),
            None => {
                println!("  {:<8}{:<40}MISSING", name, program.display());
                ok = false;
            }
        }
    }
    println!();

    let probes = [
        ("server", config.settle.server_probe),
        ("relay", config.settle.relay_probe),
    ];
    for (name, probe) in probes {
        let Some(addr) = probe else { continue };
        if port_in_use(&addr) {
            println!("  {:<8}{:<40}IN USE -- STALE PROCESS?", name, addr);
            ok = false;
        } else {
            println!("  {:<8}{:<40}FREE", name, addr);
        }
    }

    if let Some(dir) = &config.log_dir {
        if dir.is_dir() {
            println!("  {:<8}{:<40}EXISTS", "logs", dir.display());
        } else {
            println!("  {:<8}{:<40}WILL BE CREATED", "logs", dir.display());
        }
    }
    println!();

    if !ok {
        bail!("SOME CHECKS FAILED");
    }
    println!("ALL CHECKS PASSED");
    Ok(())
}
