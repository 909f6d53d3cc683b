//! Logging sink (spec §6 "Logging", §10.2).
//!
//! Format is fixed: `<name>: <level>: <text>\n`, with every byte outside
//! the printable ASCII range 32..=126 stripped from `<text>` before
//! emission, so that a child's corrupted or adversarial output can never
//! smuggle terminal-control sequences into the log stream.
//!
//! Unlike the original C implementation's process-wide singletons, this
//! is an explicit value constructed once by the CLI entry point and
//! threaded through the supervisor context (spec §9 "Global mutable
//! state").

use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::sync::Mutex;

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl Level {
    fn word(self) -> &'static str {
        match self {
            Level::Info => "Info",
            Level::Warning => "Warning",
            Level::Error => "Error",
        }
    }

    fn rank(self) -> u8 {
        match self {
            Level::Info => 0,
            Level::Warning => 1,
            Level::Error => 2,
        }
    }
}

/// Where log lines are written to; configured by `LogOutput` in the
/// config file.
#[derive(Debug, Clone)]
pub enum LogDestination {
    Stdout,
    Stderr,
    File(std::path::PathBuf),
}

enum Sink {
    Stdout(io::Stdout),
    Stderr(io::Stderr),
    File(BufWriter<std::fs::File>),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Stdout(s) => s.write(buf),
            Sink::Stderr(s) => s.write(buf),
            Sink::File(f) => f.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Stdout(s) => s.flush(),
            Sink::Stderr(s) => s.flush(),
            Sink::File(f) => f.flush(),
        }
    }
}

/// Strips every byte outside printable ASCII (32..=126) from `text`.
fn strip_non_printable(text: &str) -> String {
    text.chars().filter(|&c| (' '..='~').contains(&c)).collect()
}

/// The daemon's named log sink. Cheap to clone-by-reference (wrap in
/// `Arc` at the call site); internally synchronized so the supervisor's
/// single thread of control and the far-end agent's own `main` can both
/// use this type without further ceremony.
pub struct Logger {
    name: String,
    sink: Mutex<Sink>,
    min_level: Level,
}

impl Logger {
    pub fn new(name: impl Into<String>, destination: LogDestination) -> io::Result<Self> {
        let sink = match destination {
            LogDestination::Stdout => Sink::Stdout(io::stdout()),
            LogDestination::Stderr => Sink::Stderr(io::stderr()),
            LogDestination::File(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Sink::File(BufWriter::new(file))
            }
        };
        Ok(Logger {
            name: name.into(),
            sink: Mutex::new(sink),
            min_level: Level::Info,
        })
    }

    /// Sets the minimum level that will actually be emitted. Mirrors the
    /// source's `LOG_SUPRESS_ALL_INFO` compile-time flag: without `-v`,
    /// the CLI raises this to `Warning` so INFO lines are dropped.
    pub fn set_min_level(&mut self, min_level: Level) {
        self.min_level = min_level;
    }

    fn format_line(&self, level: Level, text: &str) -> String {
        format!("{}: {}: {}\n", self.name, level.word(), strip_non_printable(text))
    }

    pub fn log(&self, level: Level, text: &str) {
        if level.rank() < self.min_level.rank() {
            return;
        }
        let line = self.format_line(level, text);
        let mut guard = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        // Best-effort: a logging failure must never panic the supervisor.
        let _ = guard.write_all(line.as_bytes());
        let _ = guard.flush();
    }

    pub fn info(&self, text: impl AsRef<str>) {
        self.log(Level::Info, text.as_ref());
    }

    pub fn warning(&self, text: impl AsRef<str>) {
        self.log(Level::Warning, text.as_ref());
    }

    pub fn error(&self, text: impl AsRef<str>) {
        self.log(Level::Error, text.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_non_printable_bytes() {
        assert_eq!(strip_non_printable("A\u{1}B\u{1b}C"), "ABC");
    }

    #[test]
    fn keeps_full_printable_range() {
        let s: String = (32u8..=126).map(|b| b as char).collect();
        assert_eq!(strip_non_printable(&s), s);
    }

    #[test]
    fn suppressing_info_drops_only_info_lines() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        let mut logger = Logger::new("test", LogDestination::File(path.clone())).unwrap();
        logger.set_min_level(Level::Warning);
        logger.info("should not appear");
        logger.warning("should appear");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("should not appear"));
        assert!(contents.contains("should appear"));
    }

    #[test]
    fn format_matches_wire_contract() {
        let logger = Logger::new("sshtunneld", LogDestination::Stdout).unwrap();
        let line = logger.format_line(Level::Warning, "hello\x01world");
        assert_eq!(line, "sshtunneld: Warning: helloworld\n");
        assert!(line.bytes().all(|b| (32..=126).contains(&b) || b == b'\n'));
    }
}
