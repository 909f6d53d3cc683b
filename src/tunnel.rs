//! The tunnel object and its per-tick state machine (spec §3, §4.3).
//!
//! No state is stored explicitly as an enum; every conceptual state in
//! the spec's state table is derived from `pid`, `uptoken`, `condemned`
//! and the wall-clock fields below, exactly as the original computes it.

use crate::error::{LaunchError, SupervisorError};
use crate::io::{full_read, full_write, nix_to_io, set_nonblocking, IoOutcome, PipeTriple};
use crate::line_reader::LineReader;
use crate::log::Logger;
use crate::uptoken::{self, UPTOKEN_BUFFER_SIZE};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{ForkResult, Pid};
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// Saturation point for the consecutive-failure counter (spec §4.3.2).
pub const TROUBLE_MAX: u8 = 8;
/// A child must live at least this long before `trouble` resets to zero.
pub const TROUBLE_RESET_TIME: Duration = Duration::from_secs(300);

const MAGIC_WORDS: [&str; 2] = ["port forwarding failed", "combat check failed"];

/// Case-insensitive substring search for the fixed diagnostic phrases
/// that indicate a broken tunnel even though the control channel is
/// technically still alive (spec §4.3.1).
pub fn contains_magic_words(line: &str) -> bool {
    let lower = line.to_lowercase();
    MAGIC_WORDS.iter().any(|word| lower.contains(word))
}

/// `delay = 2^trouble` seconds, the exponential back-off of spec §4.3.2.
pub fn backoff_seconds(trouble: u8) -> u64 {
    1u64 << trouble.min(TROUBLE_MAX)
}

#[derive(Debug, Copy, Clone)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A supervised child process together with its launch arguments,
/// environment, stdio pipes, and heartbeat state (spec §3).
pub struct Tunnel {
    pub id: u32,
    argv: Vec<CString>,
    envp: Vec<CString>,
    pid: Option<Pid>,
    pipes: PipeTriple,
    uptoken_enabled: bool,
    uptoken_interval: Duration,
    uptoken: Option<u8>,
    uptoken_sent_at: Option<Instant>,
    trouble: u8,
    relaunch_not_before: Instant,
    pid_launched_at: Option<Instant>,
    condemned: bool,
    stdout_reader: LineReader,
    stderr_reader: LineReader,
}

impl Tunnel {
    /// Creates a tunnel object. `argv`/`envp` are immutable for the
    /// tunnel's lifetime; `id` is assigned by the caller (the
    /// configuration loader hands out dense, monotonically increasing
    /// ids, spec §3).
    pub fn create(
        id: u32,
        argv: Vec<CString>,
        envp: Vec<CString>,
        uptoken_enabled: bool,
        uptoken_interval: Duration,
        logger: &Logger,
    ) -> Self {
        logger.info(format!("Tunnel {id}: Creating tunnel object..."));
        if !uptoken_enabled {
            logger.warning(format!(
                "Tunnel {id}: Tunnel UpToken is disabled. We will not be able to properly detect if the tunnel goes down."
            ));
        }
        Tunnel {
            id,
            argv,
            envp,
            pid: None,
            pipes: PipeTriple::closed(),
            uptoken_enabled,
            uptoken_interval,
            uptoken: None,
            uptoken_sent_at: None,
            trouble: 0,
            relaunch_not_before: Instant::now(),
            pid_launched_at: None,
            condemned: false,
            stdout_reader: LineReader::new(),
            stderr_reader: LineReader::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.pid.is_some()
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn trouble(&self) -> u8 {
        self.trouble
    }

    pub fn relaunch_not_before(&self) -> Instant {
        self.relaunch_not_before
    }

    /// Invariant check usable from tests and from the supervisor as a
    /// sanity assertion: `pid = 0 <=> all pipe ends closed` (spec §3).
    pub fn pipes_closed_iff_no_pid(&self) -> bool {
        self.pid.is_none() == self.pipes.all_closed()
    }

    /// Runs one maintenance tick (spec §4.3): launch if idle and due,
    /// drain and scan stdio, reset trouble after a long healthy run,
    /// advance the heartbeat, signal a condemned child, and reap.
    ///
    /// Returns an error only for tunnel-scoped or supervisor-scoped
    /// failures (fork/pipe/fcntl/waitpid); a condemned-but-still-running
    /// child is not an error.
    pub fn maintain(&mut self, logger: &Logger) -> Result<(), SupervisorError> {
        let now = Instant::now();

        if self.pid.is_none() && now >= self.relaunch_not_before {
            self.launch(logger, now)?;
        }

        if let Some(fd) = self.pipes.stderr.read.raw() {
            self.drain_and_scan(logger, fd, StreamKind::Stderr);
        }
        if !self.uptoken_enabled {
            if let Some(fd) = self.pipes.stdout.read.raw() {
                self.drain_and_scan(logger, fd, StreamKind::Stdout);
            }
        }

        let Some(pid) = self.pid else {
            return Ok(());
        };

        if let Some(launched_at) = self.pid_launched_at {
            if self.trouble > 0 && now.duration_since(launched_at) > TROUBLE_RESET_TIME {
                logger.info(format!("Tunnel {}: Resetting trouble counter.", self.id));
                self.trouble = 0;
            }
        }

        if self.uptoken_enabled && !self.condemned {
            if let (Some(stdin_fd), Some(stdout_fd)) =
                (self.pipes.stdin.write.raw(), self.pipes.stdout.read.raw())
            {
                self.run_heartbeat(logger, stdin_fd, stdout_fd, now);
            }
        }

        if self.condemned {
            logger.warning(format!(
                "Tunnel {}: Tunnel process {} condemned. Sending SIGTERM...",
                self.id, pid
            ));
            if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
                logger.warning(format!(
                    "Tunnel {}: kill({}, SIGTERM) failed! ({})",
                    self.id, pid, e
                ));
            }
        }

        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(()),
            Ok(status) => {
                logger.warning(format!(
                    "Tunnel {}: Child process exited! ({:?})",
                    self.id, status
                ));
                self.on_reaped(logger, now)
            }
            Err(e) => Err(SupervisorError::Waitpid(e)),
        }
    }

    fn drain_and_scan(&mut self, logger: &Logger, fd: RawFd, which: StreamKind) {
        let (reader, prefix) = match which {
            StreamKind::Stdout => (&mut self.stdout_reader, "STDOUT"),
            StreamKind::Stderr => (&mut self.stderr_reader, "STDERR"),
        };
        match reader.drain(fd) {
            Ok(lines) => {
                for line in lines {
                    logger.info(format!("Tunnel {}: {}: {}", self.id, prefix, line));
                    if contains_magic_words(&line) {
                        logger.error(format!(
                            "Tunnel {}: Magic words discovered in tunnel output!",
                            self.id
                        ));
                        self.condemned = true;
                    }
                }
            }
            Err(e) => {
                logger.error(format!("Tunnel {}: failed reading pipe! ({})", self.id, e));
            }
        }
    }

    fn run_heartbeat(&mut self, logger: &Logger, stdin_fd: RawFd, stdout_fd: RawFd, now: Instant) {
        if let (Some(token), Some(sent_at)) = (self.uptoken, self.uptoken_sent_at) {
            if now >= sent_at + self.uptoken_interval {
                let mut buf = [0u8; UPTOKEN_BUFFER_SIZE];
                match full_read(stdout_fd, &mut buf, UPTOKEN_BUFFER_SIZE - 1) {
                    Ok(IoOutcome::Done(n)) if n >= 2 => {
                        if buf[0] == token {
                            self.uptoken = None;
                            self.uptoken_sent_at = None;
                        } else {
                            logger.warning(format!(
                                "Tunnel {}: uptoken does not match! The far end sent something strange.",
                                self.id
                            ));
                            self.condemned = true;
                        }
                    }
                    Ok(_) => {
                        logger.warning(format!(
                            "Tunnel {}: uptoken read() didn't return enough bytes! uptoken did not come back.",
                            self.id
                        ));
                        self.condemned = true;
                    }
                    Err(e) => {
                        logger.error(format!("Tunnel {}: uptoken read() failed! ({})", self.id, e));
                        self.condemned = true;
                    }
                }
            }
        }

        if self.uptoken.is_none() {
            let token = uptoken::random_challenge();
            let frame = uptoken::format_frame(token);
            match full_write(stdin_fd, &frame) {
                Ok(IoOutcome::Done(n)) if n == frame.len() => {
                    self.uptoken = Some(token);
                    self.uptoken_sent_at = Some(now);
                }
                Ok(_) => {
                    logger.error(format!(
                        "Tunnel {}: uptoken write() failed for unknown reason!",
                        self.id
                    ));
                    self.condemned = true;
                }
                Err(e) => {
                    logger.error(format!("Tunnel {}: uptoken write() failed! ({})", self.id, e));
                    self.condemned = true;
                }
            }
        }
    }

    fn on_reaped(&mut self, logger: &Logger, now: Instant) -> Result<(), SupervisorError> {
        self.pid = None;
        self.uptoken = None;
        self.uptoken_sent_at = None;
        self.trouble = self.trouble.saturating_add(1).min(TROUBLE_MAX);
        let delay = backoff_seconds(self.trouble);
        self.relaunch_not_before = now + Duration::from_secs(delay);
        logger.info(format!(
            "Tunnel {}: Will wait at least {} seconds before relaunching.",
            self.id, delay
        ));
        self.pipes
            .close_all()
            .map_err(|e| SupervisorError::Launch(LaunchError::Pipe(nix_to_io(e))))?;
        Ok(())
    }

    fn launch(&mut self, logger: &Logger, now: Instant) -> Result<(), SupervisorError> {
        self.condemned = false;

        let launch_string: String = self
            .argv
            .iter()
            .map(|a| format!(" {}", a.to_string_lossy()))
            .collect();
        logger.info(format!(
            "Tunnel {}: Launching child process:{}",
            self.id, launch_string
        ));

        let mut pipes = PipeTriple::create()
            .map_err(|e| SupervisorError::Launch(LaunchError::Pipe(nix_to_io(e))))?;

        match unsafe { nix::unistd::fork() } {
            Err(e) => Err(SupervisorError::Launch(LaunchError::Fork(e))),
            Ok(ForkResult::Child) => {
                if pipes.split_child().is_err() || pipes.install_as_std().is_err() {
                    std::process::exit(1);
                }
                let _ = nix::unistd::execve(&self.argv[0], &self.argv, &self.envp);
                // execve only returns on error.
                std::process::exit(1);
            }
            Ok(ForkResult::Parent { child }) => {
                pipes
                    .split_parent()
                    .map_err(|e| SupervisorError::Launch(LaunchError::Pipe(nix_to_io(e))))?;
                if let Some(fd) = pipes.stdout.read.raw() {
                    set_nonblocking(fd).map_err(|e| SupervisorError::Launch(LaunchError::Fcntl(e)))?;
                }
                if let Some(fd) = pipes.stderr.read.raw() {
                    set_nonblocking(fd).map_err(|e| SupervisorError::Launch(LaunchError::Fcntl(e)))?;
                }
                self.pid = Some(child);
                self.pipes = pipes;
                self.pid_launched_at = Some(now);
                self.stdout_reader = LineReader::new();
                self.stderr_reader = LineReader::new();
                logger.info(format!(
                    "Tunnel {}: Child process launched with PID {}",
                    self.id, child
                ));

                if self.uptoken_enabled {
                    let header = uptoken::format_header(self.uptoken_interval.as_secs() as u32);
                    let stdin_fd = self
                        .pipes
                        .stdin
                        .write
                        .raw()
                        .expect("parent retains stdin-write after split_parent");
                    match full_write(stdin_fd, header.as_bytes()) {
                        Ok(IoOutcome::Done(n)) if n == header.len() => {}
                        _ => {
                            logger.error(format!(
                                "Tunnel {}: failed writing uptoken header!",
                                self.id
                            ));
                            return Err(SupervisorError::Launch(LaunchError::HeaderWrite));
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Tears the tunnel down: SIGTERM the live child if any, wait for it
    /// to exit, close any remaining pipe ends.
    pub fn destroy(&mut self, logger: &Logger) {
        logger.info(format!("Tunnel {}: Destroying tunnel object...", self.id));
        if let Some(pid) = self.pid {
            logger.info(format!(
                "Tunnel {}: Process {} still running. Sending SIGTERM...",
                self.id, pid
            ));
            match signal::kill(pid, Signal::SIGTERM) {
                Ok(()) => {
                    let _ = waitpid(pid, None);
                }
                Err(e) => {
                    logger.warning(format!(
                        "Tunnel {}: kill({}, SIGTERM) failed! ({})",
                        self.id, pid, e
                    ));
                }
            }
            self.pid = None;
        }
        if let Err(e) = self.pipes.close_all() {
            logger.warning(format!(
                "Tunnel {}: stdpipes_close_remaining() returned an error! ({})",
                self.id, e
            ));
        }
    }
}
