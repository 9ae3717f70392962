// BENCHMANAGER -- BENCHMARK RUN ORCHESTRATOR
// STARTS ONE SERVER, ONE RELAY AND N WORKERS IN DEPENDENCY ORDER,
// WAITS FOR THE SERVER TO FINISH, THEN KILLS EVERYTHING THAT IS LEFT.
//
// EXTERNAL BINARIES ARE OPAQUE: A PATH AND A LIST OF ARGUMENTS.

mod cli;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use benchmanager::BenchConfig;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "benchmanager")]
#[command(about = "BENCHMANAGER -- BENCHMARK RUN ORCHESTRATOR")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    // START THE COHORT, WAIT ON THE SERVER, TEAR DOWN
    Run(RunArgs),
    // VERIFY THE THREE EXECUTABLES RESOLVE AND PROBE PORTS ARE FREE
    Check(ConfigArgs),
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,

    // WRITE A JSON REPORT HERE AFTER THE RUN
    #[arg(long)]
    report: Option<PathBuf>,
}

// EVERY FLAG OVERRIDES THE MATCHING FIELD OF THE CONFIG FILE
#[derive(Args)]
struct ConfigArgs {
    // TOML CONFIG FILE
    #[arg(long, short)]
    config: Option<PathBuf>,

    // SERVER EXECUTABLE
    #[arg(long)]
    server: Option<PathBuf>,

    // SERVER ARGUMENT (REPEATABLE, REPLACES CONFIG ARGS)
    #[arg(long = "server-arg", allow_hyphen_values = true)]
    server_args: Vec<String>,

    // RELAY EXECUTABLE
    #[arg(long)]
    relay: Option<PathBuf>,

    // RELAY ARGUMENT (REPEATABLE, REPLACES CONFIG ARGS)
    #[arg(long = "relay-arg", allow_hyphen_values = true)]
    relay_args: Vec<String>,

    // WORKER EXECUTABLE (INVOKED AS `<worker> <index>`)
    #[arg(long)]
    worker: Option<PathBuf>,

    // NUMBER OF WORKERS (4 DEFAULT)
    #[arg(long)]
    workers: Option<u32>,

    // FIXED SETTLE INTERVAL IN MILLISECONDS (1000 DEFAULT)
    #[arg(long)]
    settle_ms: Option<u64>,

    // SIGTERM GRACE BEFORE SIGKILL IN MILLISECONDS (0 DEFAULT)
    #[arg(long)]
    grace_ms: Option<u64>,

    // CAPTURE CHILD OUTPUT AS <DIR>/<ROLE>.log
    #[arg(long)]
    log_dir: Option<PathBuf>,

    // DEBUG-LEVEL LOGGING (RUST_LOG WINS IF SET)
    #[arg(long, short)]
    verbose: bool,
}

impl ConfigArgs {
    fn resolve(&self) -> Result<BenchConfig> {
        let mut config = match &self.config {
            Some(path) => BenchConfig::load(path)?,
            None => BenchConfig::default(),
        };

        if let Some(server) = &self.server {
            config.server.program = server.clone();
        }
        if !self.server_args.is_empty() {
            config.server.args = self.server_args.clone();
        }
        if let Some(relay) = &self.relay {
            config.relay.program = relay.clone();
        }
        if !self.relay_args.is_empty() {
            config.relay.args = self.relay_args.clone();
        }
        if let Some(worker) = &self.worker {
            config.workers.program = worker.clone();
        }
        if let Some(count) = self.workers {
            config.workers.count = count;
        }
        if let Some(ms) = self.settle_ms {
            config.settle.interval_ms = ms;
        }
        if let Some(ms) = self.grace_ms {
            config.teardown.grace_ms = ms;
        }
        if let Some(dir) = &self.log_dir {
            config.log_dir = Some(dir.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => {
            init_logging(args.config.verbose);
            let config = args.config.resolve()?;

            // SIGINT + SIGTERM ("termination" FEATURE). CHILDREN LIVE IN THEIR
            // OWN PROCESS GROUPS, SO ONLY WE SEE IT AND THE SESSION TEARS DOWN.
            ctrlc::set_handler(move || {
                SHUTDOWN.store(true, Ordering::Relaxed);
            })?;

            let code = cli::run::run_benchmark(&config, args.report.as_deref(), &SHUTDOWN)?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Command::Check(args) => {
            init_logging(args.verbose);
            let config = args.resolve()?;
            cli::check::run_check(&config)?;
        }
    }

    Ok(())
}
