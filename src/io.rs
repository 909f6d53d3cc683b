//! Length-honoring read/write over file descriptors, and the triple-pipe
//! setup/teardown primitive used to wire a child's stdio across fork/exec
//! (spec §4.1).
//!
//! Short reads and short writes are treated as continuation, not error,
//! the way the teacher's `Fd` wrapper (`src/linux/fd.rs`) treats
//! `EINTR`-style partial progress: retry until done, until the peer is
//! gone, or until the kernel says "try again later".

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd;
use std::os::unix::io::RawFd;

/// Outcome of a full_write/full_read attempt that didn't hit a hard error.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum IoOutcome {
    /// All requested bytes were transferred.
    Done(usize),
    /// The descriptor would have blocked before any more progress could
    /// be made. For `full_read`, any bytes already buffered are reported
    /// via `Done` instead — see [`full_read`].
    WouldBlock,
    /// End of stream; for read, no bytes were available at all.
    Eof,
}

fn is_would_block(err: nix::Error) -> bool {
    matches!(err, nix::Error::EAGAIN)
}

/// Converts a `nix` error into a `std::io::Error`, for call sites that
/// need to fold pipe-management failures into an I/O-flavoured error type.
pub fn nix_to_io(err: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(err as i32)
}

/// Writes every byte of `buf`, restarting on short writes.
///
/// A zero-byte return from the underlying `write(2)` with no error is
/// treated as a would-block outcome: something is wrong enough that
/// "wrote nothing, no error" shouldn't be read as success.
pub fn full_write(fd: RawFd, buf: &[u8]) -> Result<IoOutcome, std::io::Error> {
    let mut pos = 0;
    while pos < buf.len() {
        match unistd::write(fd, &buf[pos..]) {
            Ok(0) => return Ok(IoOutcome::WouldBlock),
            Ok(n) => pos += n,
            Err(e) if is_would_block(e) => {
                if pos > 0 {
                    return Ok(IoOutcome::Done(pos));
                }
                return Ok(IoOutcome::WouldBlock);
            }
            Err(e) => return Err(std::io::Error::from_raw_os_error(e as i32)),
        }
    }
    Ok(IoOutcome::Done(pos))
}

/// Reads up to `max` bytes, continuing on short reads until either `max`
/// bytes are buffered, end-of-stream, or an error occurs.
///
/// If some bytes were already accumulated when EOF or would-block is hit,
/// those bytes are returned in preference to the sentinel outcome — the
/// heartbeat reader must be content with partial data. This is the
/// deliberate asymmetry with [`full_write`].
pub fn full_read(fd: RawFd, buf: &mut [u8], max: usize) -> Result<IoOutcome, std::io::Error> {
    let max = max.min(buf.len());
    let mut pos = 0;
    while pos < max {
        match unistd::read(fd, &mut buf[pos..max]) {
            Ok(0) => {
                return Ok(if pos > 0 {
                    IoOutcome::Done(pos)
                } else {
                    IoOutcome::Eof
                });
            }
            Ok(n) => pos += n,
            Err(e) if is_would_block(e) => {
                return Ok(if pos > 0 {
                    IoOutcome::Done(pos)
                } else {
                    IoOutcome::WouldBlock
                });
            }
            Err(e) => return Err(std::io::Error::from_raw_os_error(e as i32)),
        }
    }
    Ok(IoOutcome::Done(pos))
}

/// Sets a file descriptor's non-blocking flag.
pub fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// One end of a pipe that may already have been closed.
///
/// Unlike the teacher's RAII `Fd` wrapper, this type does not close on
/// drop: a [`PipeTriple`] has cross-cutting ownership-transfer moments
/// (fork, stdio install, the parent/child split) where "drop closes it"
/// would fight the explicit state machine instead of helping it. Closing
/// is always the caller's explicit act, mirroring `stdpipes_close_remaining`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PipeEnd {
    Open(RawFd),
    Closed,
}

impl PipeEnd {
    pub fn is_open(self) -> bool {
        matches!(self, PipeEnd::Open(_))
    }

    pub fn raw(self) -> Option<RawFd> {
        match self {
            PipeEnd::Open(fd) => Some(fd),
            PipeEnd::Closed => None,
        }
    }

    /// Idempotent close: already-closed ends are a no-op success.
    fn close(&mut self) -> nix::Result<()> {
        if let PipeEnd::Open(fd) = *self {
            unistd::close(fd)?;
            *self = PipeEnd::Closed;
        }
        Ok(())
    }
}

/// One pipe, read end and write end.
#[derive(Debug, Copy, Clone)]
pub struct Pipe {
    pub read: PipeEnd,
    pub write: PipeEnd,
}

impl Pipe {
    fn create() -> nix::Result<Self> {
        let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC)?;
        Ok(Pipe {
            read: PipeEnd::Open(read),
            write: PipeEnd::Open(write),
        })
    }

    fn closed() -> Self {
        Pipe {
            read: PipeEnd::Closed,
            write: PipeEnd::Closed,
        }
    }
}

/// Three independent pipes, one per standard stream, with the ownership
/// splits a fork/exec child launch needs (spec §4.1).
#[derive(Debug, Copy, Clone)]
pub struct PipeTriple {
    pub stdin: Pipe,
    pub stdout: Pipe,
    pub stderr: Pipe,
}

impl PipeTriple {
    /// Produces three independent pipes, one per standard stream.
    pub fn create() -> nix::Result<Self> {
        let stdin = Pipe::create()?;
        let stdout = Pipe::create()?;
        let stderr = Pipe::create()?;
        Ok(PipeTriple {
            stdin,
            stdout,
            stderr,
        })
    }

    /// A triple with every end already closed, matching a tunnel that has
    /// never launched a child (`pid = 0`, spec §3's invariant).
    pub fn closed() -> Self {
        PipeTriple {
            stdin: Pipe::closed(),
            stdout: Pipe::closed(),
            stderr: Pipe::closed(),
        }
    }

    /// Closes the ends the parent must not retain after fork: after this
    /// call the parent holds stdin-write, stdout-read, stderr-read.
    pub fn split_parent(&mut self) -> nix::Result<()> {
        self.stdin.read.close()?;
        self.stdout.write.close()?;
        self.stderr.write.close()?;
        Ok(())
    }

    /// Closes the ends the child must not retain after fork: after this
    /// call the child holds stdin-read, stdout-write, stderr-write.
    pub fn split_child(&mut self) -> nix::Result<()> {
        self.stdin.write.close()?;
        self.stdout.read.close()?;
        self.stderr.read.close()?;
        Ok(())
    }

    /// Reassigns the child's standard streams (0, 1, 2) to the retained
    /// pipe ends. Must only be called in the child, between fork and exec,
    /// after [`Self::split_child`].
    pub fn install_as_std(&self) -> nix::Result<()> {
        if let Some(fd) = self.stdin.read.raw() {
            unistd::dup2(fd, libc::STDIN_FILENO)?;
        }
        if let Some(fd) = self.stdout.write.raw() {
            unistd::dup2(fd, libc::STDOUT_FILENO)?;
        }
        if let Some(fd) = self.stderr.write.raw() {
            unistd::dup2(fd, libc::STDERR_FILENO)?;
        }
        Ok(())
    }

    /// Idempotent close of any still-open ends.
    pub fn close_all(&mut self) -> nix::Result<()> {
        self.stdin.read.close()?;
        self.stdin.write.close()?;
        self.stdout.read.close()?;
        self.stdout.write.close()?;
        self.stderr.read.close()?;
        self.stderr.write.close()?;
        Ok(())
    }

    /// True iff every one of the six ends is closed, i.e. the invariant
    /// `pid = 0 <=> all pipe ends closed` (spec §3) holds on the pipe side.
    pub fn all_closed(&self) -> bool {
        !self.stdin.read.is_open()
            && !self.stdin.write.is_open()
            && !self.stdout.read.is_open()
            && !self.stdout.write.is_open()
            && !self.stderr.read.is_open()
            && !self.stderr.write.is_open()
    }
}
