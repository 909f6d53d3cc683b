//! The top-level supervisor loop (spec §4.4).
//!
//! Owns every [`Tunnel`], drives one maintenance tick across all of them
//! per iteration, and sleeps in short granules so a termination signal
//! is noticed quickly rather than only between long sleeps.

use crate::config::Config;
use crate::error::SupervisorError;
use crate::log::Logger;
use crate::tunnel::Tunnel;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Runs tunnel maintenance until `terminate` is raised or a tunnel
/// reports a fatal error.
pub struct Supervisor {
    tunnels: Vec<Tunnel>,
    sleep_timer: Duration,
    terminate: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(config: &Config, terminate: Arc<AtomicBool>, logger: &Logger) -> Self {
        let tunnels = config
            .tunnels
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                Tunnel::create(
                    i as u32 + 1,
                    spec.argv.clone(),
                    spec.envp.clone(),
                    spec.uptoken_enabled,
                    Duration::from_secs(spec.uptoken_interval_secs as u64),
                    logger,
                )
            })
            .collect();
        Supervisor {
            tunnels,
            sleep_timer: Duration::from_secs(config.sleep_timer_secs as u64),
            terminate,
        }
    }

    /// Runs until termination is requested or a tunnel reports a fatal
    /// error, then tears every tunnel down before returning.
    pub fn run(&mut self, logger: &Logger) -> Result<(), SupervisorError> {
        let result = self.run_inner(logger);
        logger.info("Supervisor loop exiting. Tearing down tunnels...");
        for tunnel in &mut self.tunnels {
            tunnel.destroy(logger);
        }
        result
    }

    fn run_inner(&mut self, logger: &Logger) -> Result<(), SupervisorError> {
        while !self.terminate.load(Ordering::SeqCst) {
            for tunnel in &mut self.tunnels {
                tunnel.maintain(logger)?;
            }
            self.sleep_in_granules();
        }
        logger.info("Caught termination signal.");
        Ok(())
    }

    /// Sleeps for `sleep_timer`, but in ~1 second granules, so a signal
    /// raised mid-sleep is noticed within a second instead of up to
    /// `sleep_timer` seconds later.
    fn sleep_in_granules(&self) {
        let granule = Duration::from_secs(1);
        let mut remaining = self.sleep_timer;
        while remaining > Duration::ZERO && !self.terminate.load(Ordering::SeqCst) {
            let nap = remaining.min(granule);
            std::thread::sleep(nap);
            remaining = remaining.saturating_sub(nap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelSpec;
    use crate::log::LogDestination;
    use std::ffi::CString;

    fn logger() -> Logger {
        Logger::new("test", LogDestination::Stdout).unwrap()
    }

    #[test]
    fn terminates_promptly_when_flag_is_already_set() {
        let config = Config {
            log_output: LogDestination::Stdout,
            sleep_timer_secs: 60,
            tunnels: vec![TunnelSpec {
                uptoken_enabled: false,
                uptoken_interval_secs: 60,
                argv: vec![CString::new("/bin/true").unwrap()],
                envp: vec![],
            }],
        };
        let terminate = Arc::new(AtomicBool::new(true));
        let mut supervisor = Supervisor::new(&config, terminate, &logger());
        let start = std::time::Instant::now();
        supervisor.run(&logger()).unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
