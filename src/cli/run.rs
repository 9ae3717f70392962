use std::path::Path;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};

use benchmanager::config::ProcessSpec;
use benchmanager::readiness::Settle;
use benchmanager::report;
use benchmanager::{BenchConfig, BenchmarkSession};

fn command_line(spec: &ProcessSpec) -> String {
    let mut line = spec.program.display().to_string();
    for arg in &spec.args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

fn describe(settle: Settle) -> String {
    match settle {
        Settle::Delay(d) => format!("{} ms", d.as_millis()),
        Settle::Tcp { addr, timeout } => format!("probe {} (timeout {} ms)", addr, timeout.as_millis()),
    }
}

// RETURNS THE EXIT CODE THE ORCHESTRATOR SHOULD LEAVE WITH
pub fn run_benchmark(
    config: &BenchConfig,
    report_path: Option<&Path>,
    shutdown: &AtomicBool,
) -> Result<i32> {
    println!("BENCHMANAGER");
    println!("SERVER:          {}", command_line(&config.server));
    println!("RELAY:           {}", command_line(&config.relay));
    println!("WORKERS:         {} x {} <index>", config.workers.count, config.workers.program.display());
    println!("SETTLE (SERVER): {}", describe(config.settle.after_server()));
    println!("SETTLE (RELAY):  {}", describe(config.settle.after_relay()));
    println!("TEARDOWN GRACE:  {} ms", config.teardown.grace_ms);
    if let Some(dir) = &config.log_dir {
        println!("LOG DIR:         {}", dir.display());
    }
    println!();

    if let Some(dir) = &config.log_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("MKDIR FAILED: {}", dir.display()))?;
    }

    let result = BenchmarkSession::new(config, shutdown).run()?;

    println!();
    report::print_summary(&result);

    if let Some(path) = report_path {
        report::save_json(&result, path)
            .with_context(|| format!("WRITE FAILED: {}", path.display()))?;
        println!("\nSAVED TO {}", path.display());
    }

    Ok(result.exit_code())
}
