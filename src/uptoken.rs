//! The UpToken heartbeat protocol (spec §4.2).
//!
//! Phase 1 is a single versioned header line sent once at tunnel launch.
//! Phase 2 is a steady-state challenge/response: the supervisor writes a
//! random printable byte followed by `\n`, and the far end must echo the
//! same byte back within the configured interval.

use rand::Rng;

/// Size of the scratch buffer used for a single challenge/response frame.
/// One byte for the uptoken itself, one for the `\n`, with slack for a
/// sloppy far end that writes more than it should — spec requires reading
/// up to `UPTOKEN_BUFFER_SIZE - 1` bytes and only ever looking at the
/// first.
pub const UPTOKEN_BUFFER_SIZE: usize = 8;

/// Hard cap on header line length before the far-end parser gives up and
/// falls back to defaults.
pub const HEADER_MAX_LEN: usize = 128;

pub const HEADER_VERSION: u32 = 1;

/// Lowest and highest printable ASCII values a challenge byte may take.
pub const CHALLENGE_MIN: u8 = 33;
pub const CHALLENGE_MAX: u8 = 126;

/// Formats the Phase 1 header line for a given heartbeat interval.
pub fn format_header(interval_seconds: u32) -> String {
    format!("HeaderVersion: {HEADER_VERSION}; UpToken Interval: {interval_seconds};\n")
}

#[derive(Debug, Eq, PartialEq)]
pub struct ParsedHeader {
    pub version: u32,
    pub interval_seconds: u32,
}

/// Parses a single header line of the form
/// `HeaderVersion: 1; UpToken Interval: 7;\n` (trailing `\n` optional).
///
/// Returns `None` on anything that doesn't match — unrecognised version,
/// malformed line, or (by construction of the caller) a line longer than
/// [`HEADER_MAX_LEN`]. Per spec, a parse failure at the far end is never
/// fatal: the caller falls back to a default interval and logs a warning.
pub fn parse_header(line: &str) -> Option<ParsedHeader> {
    let line = line.trim_end_matches('\n').trim_end_matches('\r');
    if line.len() > HEADER_MAX_LEN {
        return None;
    }
    let rest = line.strip_prefix("HeaderVersion: ")?;
    let (version_str, rest) = rest.split_once(';')?;
    let version: u32 = version_str.trim().parse().ok()?;
    if version != HEADER_VERSION {
        return None;
    }
    let rest = rest.trim_start();
    let rest = rest.strip_prefix("UpToken Interval: ")?;
    let interval_str = rest.trim_end_matches(';').trim();
    let interval_seconds: u32 = interval_str.parse().ok()?;
    Some(ParsedHeader {
        version,
        interval_seconds,
    })
}

/// Draws a challenge byte uniformly from the printable ASCII range
/// 33..=126. Uses `rand::thread_rng()`, which is lazily seeded on first
/// use the same way the original's `srand(time(NULL))` is — satisfying
/// the "process-wide, lazily seeded once" requirement (spec §5) without
/// hand-rolling a PRNG.
pub fn random_challenge() -> u8 {
    rand::thread_rng().gen_range(CHALLENGE_MIN..=CHALLENGE_MAX)
}

/// Formats a single challenge/response frame: the byte followed by `\n`.
pub fn format_frame(token: u8) -> [u8; 2] {
    [token, b'\n']
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = format_header(7);
        assert_eq!(header, "HeaderVersion: 1; UpToken Interval: 7;\n");
        let parsed = parse_header(&header).unwrap();
        assert_eq!(
            parsed,
            ParsedHeader {
                version: 1,
                interval_seconds: 7
            }
        );
    }

    #[test]
    fn header_rejects_unknown_version() {
        assert!(parse_header("HeaderVersion: 2; UpToken Interval: 7;\n").is_none());
    }

    #[test]
    fn header_rejects_malformed_line() {
        assert!(parse_header("not a header\n").is_none());
        assert!(parse_header("HeaderVersion: 1; UpToken Interval: nope;\n").is_none());
    }

    #[test]
    fn header_rejects_overlong_line() {
        let junk = "x".repeat(HEADER_MAX_LEN + 1);
        assert!(parse_header(&junk).is_none());
    }

    #[test]
    fn challenge_is_within_printable_range() {
        for _ in 0..1000 {
            let c = random_challenge();
            assert!((CHALLENGE_MIN..=CHALLENGE_MAX).contains(&c));
        }
    }

    #[test]
    fn frame_boundaries_round_trip() {
        assert_eq!(format_frame(33), [33, b'\n']);
        assert_eq!(format_frame(126), [126, b'\n']);
    }
}
