//! A small reusable line-buffered reader over a non-blocking descriptor
//! (spec §9, "Line-buffered pipe scanner").
//!
//! Each call to [`LineReader::drain`] reads everything currently available
//! without blocking and returns the newly-completed lines. A trailing
//! fragment with no terminating `\n` is buffered rather than emitted, so
//! a single logical line is never split across two log entries just
//! because it arrived in two ticks — this resolves the spec's "partial
//! tail handling" open question in favor of correctness over fidelity to
//! the original's line-splitting behavior.

use crate::io::{full_read, IoOutcome};
use std::os::unix::io::RawFd;

const CHUNK_SIZE: usize = 4096;

pub struct LineReader {
    buf: Vec<u8>,
}

impl LineReader {
    pub fn new() -> Self {
        LineReader { buf: Vec::new() }
    }

    /// Drains `fd` until it would block or hits end of stream, returning
    /// every newly completed line (without the trailing `\n`). Any
    /// trailing partial fragment stays buffered for the next call.
    pub fn drain(&mut self, fd: RawFd) -> std::io::Result<Vec<String>> {
        let mut scratch = [0u8; CHUNK_SIZE];
        loop {
            match full_read(fd, &mut scratch, CHUNK_SIZE)? {
                IoOutcome::Done(n) => {
                    self.buf.extend_from_slice(&scratch[..n]);
                    if n < CHUNK_SIZE {
                        break;
                    }
                }
                IoOutcome::WouldBlock | IoOutcome::Eof => break,
            }
        }

        let mut lines = Vec::new();
        let mut start = 0;
        for i in 0..self.buf.len() {
            if self.buf[i] == b'\n' {
                lines.push(String::from_utf8_lossy(&self.buf[start..i]).into_owned());
                start = i + 1;
            }
        }
        self.buf.drain(0..start);
        Ok(lines)
    }
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::set_nonblocking;
    use nix::unistd;

    #[test]
    fn buffers_partial_tail_across_calls() {
        let (r, w) = unistd::pipe().unwrap();
        set_nonblocking(r).unwrap();
        let mut reader = LineReader::new();

        unistd::write(w, b"hello wor").unwrap();
        let lines = reader.drain(r).unwrap();
        assert!(lines.is_empty(), "no newline yet, nothing should be emitted");

        unistd::write(w, b"ld\nsecond line\nthird-partial").unwrap();
        let lines = reader.drain(r).unwrap();
        assert_eq!(lines, vec!["hello world".to_string(), "second line".to_string()]);

        unistd::write(w, b" fragment\n").unwrap();
        let lines = reader.drain(r).unwrap();
        assert_eq!(lines, vec!["third-partial fragment".to_string()]);

        unistd::close(r).unwrap();
        unistd::close(w).unwrap();
    }

    #[test]
    fn empty_read_yields_no_lines() {
        let (r, w) = unistd::pipe().unwrap();
        set_nonblocking(r).unwrap();
        let mut reader = LineReader::new();
        let lines = reader.drain(r).unwrap();
        assert!(lines.is_empty());
        unistd::close(r).unwrap();
        unistd::close(w).unwrap();
    }
}
