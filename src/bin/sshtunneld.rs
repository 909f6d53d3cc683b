//! CLI entry point for the SSHTunnels supervisor daemon (spec §10.4).

use clap::Parser;
use signal_hook::consts::{SIGHUP, SIGINT, SIGPIPE, SIGTERM};
use sshtunnels::log::{Level, Logger};
use sshtunnels::{config, Supervisor};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "sshtunneld", about = "Launches and maintains a set of SSH tunnels")]
struct Args {
    /// Path to SSHTunnels_config.xml. Defaults to the standard search order.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Include INFO-level log lines. Mirrors the source's
    /// LOG_SUPRESS_ALL_INFO compile-time flag: without this, only
    /// WARNING and ERROR lines are emitted.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config_path = match config::locate(args.config.as_deref()) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("sshtunneld: {e}");
            return ExitCode::FAILURE;
        }
    };

    let loaded = match config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("sshtunneld: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut logger = match Logger::new("sshtunneld", loaded.log_output.clone()) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("sshtunneld: failed to open log destination: {e}");
            return ExitCode::FAILURE;
        }
    };
    if !args.verbose {
        logger.set_min_level(Level::Warning);
    }
    let logger = logger;

    if args.verbose {
        logger.info(format!(
            "Loaded configuration from {}",
            config_path.display()
        ));
    }

    let terminate = Arc::new(AtomicBool::new(false));
    for sig in [SIGINT, SIGHUP, SIGTERM] {
        if let Err(e) = signal_hook::flag::register(sig, Arc::clone(&terminate)) {
            logger.warning(format!("Registering signal {sig} handler failed. ({e})"));
        }
    }
    unsafe {
        // SIGPIPE must be ignored: a far end that closes its stdin while we
        // are mid-write must surface as EPIPE on the write(2) call, not as
        // a default-disposition process kill.
        if let Err(e) = signal_hook::low_level::register(SIGPIPE, || {}) {
            logger.warning(format!("Registering SIGPIPE handler failed. ({e})"));
        }
    }

    let mut supervisor = Supervisor::new(&loaded, Arc::clone(&terminate), &logger);
    match supervisor.run(&logger) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            logger.error(format!("Supervisor exiting due to fatal error: {e}"));
            ExitCode::FAILURE
        }
    }
}
