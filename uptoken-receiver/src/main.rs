//! The far-end UpToken agent (spec §4.2, §4.5).
//!
//! Runs at the remote end of the tunnel, reads the Phase 1 header off
//! stdin, then echoes every subsequent byte from stdin back to stdout
//! byte-for-byte. If it hears nothing for `interval + SILENCE_GRACE`
//! seconds, it assumes the tunnel's control channel is dead and sends
//! `SIGTERM` to its own parent, which is typically `ssh` itself — this
//! is what frees a remote-forwarded port promptly instead of leaving it
//! bound to a half-open session.

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{self, Signal};
use nix::unistd::{self, Pid};
use sshtunnels::log::{LogDestination, Logger};
use sshtunnels::uptoken::{self, ParsedHeader};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

const STDIN_FD: RawFd = 0;
const STDOUT_FD: RawFd = 1;
const DEFAULT_INTERVAL_SECS: u32 = 5;
/// How much slack beyond one interval we give the far end before
/// declaring the link dead.
const SILENCE_GRACE: Duration = Duration::from_secs(5);
const HEADER_SCAN_BUFFER: usize = 256;

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// Blocks (short sleeps, since stdin may be a non-blocking pipe) until a
/// full header line or [`HEADER_SCAN_BUFFER`] bytes have arrived,
/// returning the parsed header plus whatever trailing bytes were read
/// past the header's terminating `\n`.
fn read_header(logger: &Logger) -> (ParsedHeader, Vec<u8>) {
    let mut buf = Vec::new();
    let mut scratch = [0u8; HEADER_SCAN_BUFFER];
    loop {
        match unistd::read(STDIN_FD, &mut scratch) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&scratch[..n]);
                if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line = String::from_utf8_lossy(&buf[..=pos]).into_owned();
                    let rest = buf[pos + 1..].to_vec();
                    if let Some(parsed) = uptoken::parse_header(&line) {
                        return (parsed, rest);
                    }
                    break;
                }
                if buf.len() >= HEADER_SCAN_BUFFER {
                    break;
                }
            }
            Err(nix::Error::EAGAIN) => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(_) => break,
        }
    }
    logger.warning("Failed to parse UpToken header. Falling back to defaults.");
    (
        ParsedHeader {
            version: 1,
            interval_seconds: DEFAULT_INTERVAL_SECS,
        },
        buf,
    )
}

fn kill_parent(logger: &Logger) {
    let ppid = unistd::getppid();
    logger.info(format!("Sending SIGTERM to parent process. ({ppid})"));
    if let Err(e) = signal::kill(ppid, Signal::SIGTERM) {
        logger.error(format!("kill({ppid}, SIGTERM) failed! ({e})"));
    }
}

fn main() -> std::process::ExitCode {
    let logger = Logger::new("uptoken-receiver", LogDestination::Stderr)
        .expect("stderr logging cannot fail to open");

    if unistd::isatty(STDIN_FD).unwrap_or(false) || unistd::isatty(STDOUT_FD).unwrap_or(false) {
        logger.error("You probably don't want to run this program in a terminal. ;)");
        return std::process::ExitCode::FAILURE;
    }

    if let Err(e) = set_nonblocking(STDIN_FD) {
        logger.error(format!("Failed to set STDIN non-blocking! ({e})"));
        return std::process::ExitCode::FAILURE;
    }

    let (header, leftover) = read_header(&logger);
    let interval = Duration::from_secs(header.interval_seconds.max(1) as u64);
    logger.info("Listening for UpTokens...");

    let mut last_byte_at = Instant::now();
    if !leftover.is_empty() {
        let _ = unistd::write(STDOUT_FD, &leftover);
        last_byte_at = Instant::now();
    }

    let deadline_len = interval + SILENCE_GRACE;
    let mut buf = [0u8; 64];
    loop {
        match unistd::read(STDIN_FD, &mut buf) {
            Ok(0) => {
                // EOF: the tunnel's control channel is gone.
                break;
            }
            Ok(n) => {
                last_byte_at = Instant::now();
                if let Err(e) = unistd::write(STDOUT_FD, &buf[..n]) {
                    logger.error(format!("failed writing to STDOUT! ({e})"));
                    break;
                }
            }
            Err(nix::Error::EAGAIN) => {
                if last_byte_at.elapsed() > deadline_len {
                    logger.error("Timeout waiting for UpToken!");
                    break;
                }
                std::thread::sleep(Duration::from_millis(200));
            }
            Err(e) => {
                logger.error(format!("failed reading from STDIN! ({e})"));
                break;
            }
        }
    }

    kill_parent(&logger);
    // There is no successful exit condition for this program: reaching
    // here always means the link died, one way or another.
    std::process::ExitCode::FAILURE
}
