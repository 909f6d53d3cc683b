//! Configuration file loading (spec §6 "Configuration file", §10.1).
//!
//! The grammar is deliberately small and closed: only the tags and
//! attributes named below are legal, and anything else — an unknown tag,
//! an unknown attribute, an out-of-range value — is a fatal startup
//! error. There is no schema validation library in the dependency
//! stack; attributes are hand-checked against their ranges as they're
//! read, the same way the rest of this crate favours explicit checks
//! over declarative validation layers.

use crate::error::ConfigError;
use crate::log::LogDestination;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use std::ffi::CString;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "SSHTunnels_config.xml";

const KNOWN_ATTRIBUTES: &[(&str, &str)] = &[
    ("SSHTunnels", "LogOutput"),
    ("SSHTunnels", "SleepTimer"),
    ("Tunnel", "UpTokenEnabled"),
    ("Tunnel", "UpTokenInterval"),
    ("ProgramArgument", "v"),
    ("ProgramEnvironment", "v"),
];

/// Per-tunnel configuration, ready to hand to [`crate::tunnel::Tunnel::create`].
pub struct TunnelSpec {
    pub uptoken_enabled: bool,
    /// Already normalised against `SleepTimer` (spec §6, interval rounding).
    pub uptoken_interval_secs: u32,
    pub argv: Vec<CString>,
    pub envp: Vec<CString>,
}

pub struct Config {
    pub log_output: LogDestination,
    pub sleep_timer_secs: u32,
    pub tunnels: Vec<TunnelSpec>,
}

/// Finds the config file by the fixed search order: an explicit
/// `--config` path if given, else the current directory, then
/// `<PREFIX>/etc/` (`PREFIX` from `SSHTUNNELS_PREFIX`), then `/etc/`.
pub fn locate(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(ConfigError::NotFound(CONFIG_FILE_NAME))
        };
    }

    let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Ok(prefix) = std::env::var("SSHTUNNELS_PREFIX") {
        candidates.push(Path::new(&prefix).join("etc").join(CONFIG_FILE_NAME));
    }
    candidates.push(Path::new("/etc").join(CONFIG_FILE_NAME));

    candidates
        .into_iter()
        .find(|p| p.is_file())
        .ok_or(ConfigError::NotFound(CONFIG_FILE_NAME))
}

/// Reads and parses the config file found at `path`.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|cause| ConfigError::Io {
        path: path.to_path_buf(),
        cause,
    })?;
    parse(&text)
}

fn xml_err(reader: &Reader<&[u8]>, e: quick_xml::Error) -> ConfigError {
    ConfigError::MalformedXml {
        offset: reader.buffer_position() as usize,
        detail: e.to_string(),
    }
}

/// Reads every attribute on `tag`, rejecting any name not in
/// [`KNOWN_ATTRIBUTES`] for this tag.
fn collect_attrs(
    reader: &Reader<&[u8]>,
    tag: &BytesStart,
    tag_name: &str,
) -> Result<HashMap<String, String>, ConfigError> {
    let mut map = HashMap::new();
    for attr in tag.attributes() {
        let attr = attr.map_err(|e| xml_err(reader, e.into()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        if !KNOWN_ATTRIBUTES.iter().any(|(t, a)| *t == tag_name && *a == key) {
            return Err(ConfigError::UnknownAttribute {
                tag: tag_name.to_string(),
                attr: key,
            });
        }
        let value = attr
            .unescape_value()
            .map_err(|e| xml_err(reader, e))?
            .into_owned();
        map.insert(key, value);
    }
    Ok(map)
}

fn required_attr(
    map: &HashMap<String, String>,
    tag: &str,
    attr: &str,
) -> Result<String, ConfigError> {
    map.get(attr).cloned().ok_or_else(|| ConfigError::MissingAttribute {
        tag: tag.to_string(),
        attr: attr.to_string(),
    })
}

fn parse_ranged_u32(tag: &str, attr: &str, raw: &str, lo: u32, hi: u32) -> Result<u32, ConfigError> {
    let value: i64 = raw.trim().parse().map_err(|_| ConfigError::OutOfRange {
        tag: tag.to_string(),
        attr: attr.to_string(),
        value: raw.to_string(),
        lo: lo as i64,
        hi: hi as i64,
    })?;
    if value < lo as i64 || value > hi as i64 {
        return Err(ConfigError::OutOfRange {
            tag: tag.to_string(),
            attr: attr.to_string(),
            value: raw.to_string(),
            lo: lo as i64,
            hi: hi as i64,
        });
    }
    Ok(value as u32)
}

fn parse_bool(tag: &str, attr: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ConfigError::OutOfRange {
            tag: tag.to_string(),
            attr: attr.to_string(),
            value: other.to_string(),
            lo: 0,
            hi: 1,
        }),
    }
}

fn parse_log_destination(raw: &str) -> LogDestination {
    match raw {
        "stdout" => LogDestination::Stdout,
        "stderr" => LogDestination::Stderr,
        other => LogDestination::File(PathBuf::from(other)),
    }
}

/// Rounds `uptoken_interval` up to the next multiple of `sleep_timer`;
/// if that exceeds 60, falls back to `sleep_timer` itself (spec §6).
fn normalise_interval(uptoken_interval: u32, sleep_timer: u32) -> u32 {
    if sleep_timer == 0 {
        return uptoken_interval;
    }
    if uptoken_interval % sleep_timer == 0 {
        return uptoken_interval;
    }
    let rounded = ((uptoken_interval / sleep_timer) + 1) * sleep_timer;
    if rounded > 60 {
        sleep_timer
    } else {
        rounded
    }
}

/// Builds the final environment for a tunnel: the process's own
/// environment, with per-tunnel `ProgramEnvironment` entries overriding
/// any inherited entry with a matching `KEY=` prefix (spec §6).
fn build_envp(overrides: &[String]) -> Result<Vec<CString>, ConfigError> {
    let mut merged: HashMap<String, String> = std::env::vars().collect();
    for entry in overrides {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| ConfigError::MalformedEnvEntry(entry.clone()))?;
        merged.insert(key.to_string(), value.to_string());
    }
    merged
        .into_iter()
        .map(|(k, v)| {
            CString::new(format!("{k}={v}")).map_err(|_| ConfigError::MalformedEnvEntry(k))
        })
        .collect()
}

/// Parses a config document already read into memory.
pub fn parse(xml: &str) -> Result<Config, ConfigError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut log_output: Option<LogDestination> = None;
    let mut sleep_timer: Option<u32> = None;
    let mut tunnels = Vec::new();
    let mut saw_root = false;
    let mut in_tunnel = false;

    let mut cur_uptoken_enabled = false;
    let mut cur_uptoken_interval_raw: Option<u32> = None;
    let mut cur_argv: Vec<String> = Vec::new();
    let mut cur_envp: Vec<String> = Vec::new();

    loop {
        let event = reader.read_event().map_err(|e| xml_err(&reader, e))?;
        match event {
            Event::Eof => break,
            Event::Start(tag) => {
                let name = String::from_utf8_lossy(tag.name().as_ref()).into_owned();
                match name.as_str() {
                    "SSHTunnels" if !saw_root && !in_tunnel => {
                        saw_root = true;
                        let attrs = collect_attrs(&reader, &tag, "SSHTunnels")?;
                        let log_raw = required_attr(&attrs, "SSHTunnels", "LogOutput")?;
                        log_output = Some(parse_log_destination(&log_raw));
                        let sleep_raw = required_attr(&attrs, "SSHTunnels", "SleepTimer")?;
                        sleep_timer =
                            Some(parse_ranged_u32("SSHTunnels", "SleepTimer", &sleep_raw, 1, 60)?);
                    }
                    "Tunnel" if saw_root && !in_tunnel => {
                        in_tunnel = true;
                        let attrs = collect_attrs(&reader, &tag, "Tunnel")?;
                        let enabled_raw = required_attr(&attrs, "Tunnel", "UpTokenEnabled")?;
                        cur_uptoken_enabled = parse_bool("Tunnel", "UpTokenEnabled", &enabled_raw)?;
                        let interval_raw = required_attr(&attrs, "Tunnel", "UpTokenInterval")?;
                        cur_uptoken_interval_raw = Some(parse_ranged_u32(
                            "Tunnel",
                            "UpTokenInterval",
                            &interval_raw,
                            1,
                            60,
                        )?);
                        cur_argv.clear();
                        cur_envp.clear();
                    }
                    other => return Err(ConfigError::UnknownTag(other.to_string())),
                }
            }
            Event::Empty(tag) => {
                let name = String::from_utf8_lossy(tag.name().as_ref()).into_owned();
                match name.as_str() {
                    "ProgramArgument" if in_tunnel => {
                        let attrs = collect_attrs(&reader, &tag, "ProgramArgument")?;
                        cur_argv.push(required_attr(&attrs, "ProgramArgument", "v")?);
                    }
                    "ProgramEnvironment" if in_tunnel => {
                        let attrs = collect_attrs(&reader, &tag, "ProgramEnvironment")?;
                        cur_envp.push(required_attr(&attrs, "ProgramEnvironment", "v")?);
                    }
                    other => return Err(ConfigError::UnknownTag(other.to_string())),
                }
            }
            Event::End(tag) => {
                let name = String::from_utf8_lossy(tag.name().as_ref()).into_owned();
                if name == "Tunnel" && in_tunnel {
                    in_tunnel = false;
                    if cur_argv.is_empty() {
                        return Err(ConfigError::EmptyArgv);
                    }
                    let sleep = sleep_timer.unwrap_or(5);
                    let interval =
                        normalise_interval(cur_uptoken_interval_raw.unwrap_or(sleep), sleep);
                    let argv = cur_argv
                        .iter()
                        .map(|s| {
                            CString::new(s.as_str())
                                .map_err(|_| ConfigError::MalformedEnvEntry(s.clone()))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    let envp = build_envp(&cur_envp)?;
                    tunnels.push(TunnelSpec {
                        uptoken_enabled: cur_uptoken_enabled,
                        uptoken_interval_secs: interval,
                        argv,
                        envp,
                    });
                }
            }
            _ => {}
        }
    }

    if !saw_root {
        return Err(ConfigError::MalformedXml {
            offset: 0,
            detail: "missing <SSHTunnels> root element".to_string(),
        });
    }
    if tunnels.is_empty() {
        return Err(ConfigError::NoTunnels);
    }

    Ok(Config {
        log_output: log_output.unwrap_or(LogDestination::Stdout),
        sleep_timer_secs: sleep_timer.unwrap_or(5),
        tunnels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
        <SSHTunnels LogOutput="stdout" SleepTimer="5">
            <Tunnel UpTokenEnabled="true" UpTokenInterval="2">
                <ProgramArgument v="/bin/cat"/>
                <ProgramEnvironment v="FOO=bar"/>
            </Tunnel>
        </SSHTunnels>
    "#;

    #[test]
    fn parses_a_valid_document() {
        let config = parse(VALID).unwrap();
        assert_eq!(config.sleep_timer_secs, 5);
        assert_eq!(config.tunnels.len(), 1);
        let tunnel = &config.tunnels[0];
        assert!(tunnel.uptoken_enabled);
        assert_eq!(tunnel.uptoken_interval_secs, 2);
        assert_eq!(tunnel.argv.len(), 1);
        assert!(tunnel
            .envp
            .iter()
            .any(|e| e.to_string_lossy() == "FOO=bar"));
    }

    #[test]
    fn rejects_unknown_tag() {
        let xml = r#"<SSHTunnels LogOutput="stdout" SleepTimer="5"><Bogus/></SSHTunnels>"#;
        assert!(matches!(parse(xml), Err(ConfigError::UnknownTag(_))));
    }

    #[test]
    fn rejects_unknown_attribute() {
        let xml = r#"<SSHTunnels LogOutput="stdout" SleepTimer="5" Bogus="1"></SSHTunnels>"#;
        assert!(matches!(parse(xml), Err(ConfigError::UnknownAttribute { .. })));
    }

    #[test]
    fn rejects_out_of_range_sleep_timer() {
        let xml = r#"<SSHTunnels LogOutput="stdout" SleepTimer="61"></SSHTunnels>"#;
        assert!(matches!(parse(xml), Err(ConfigError::OutOfRange { .. })));
    }

    #[test]
    fn rejects_tunnel_with_no_arguments() {
        let xml = r#"
            <SSHTunnels LogOutput="stdout" SleepTimer="5">
                <Tunnel UpTokenEnabled="false" UpTokenInterval="5"></Tunnel>
            </SSHTunnels>
        "#;
        assert!(matches!(parse(xml), Err(ConfigError::EmptyArgv)));
    }

    #[test]
    fn rejects_document_with_no_tunnels() {
        let xml = r#"<SSHTunnels LogOutput="stdout" SleepTimer="5"></SSHTunnels>"#;
        assert!(matches!(parse(xml), Err(ConfigError::NoTunnels)));
    }

    #[test]
    fn interval_evenly_divides_sleep_timer() {
        assert_eq!(normalise_interval(1, 1), 1);
        assert_eq!(normalise_interval(5, 5), 5);
    }

    #[test]
    fn interval_rounds_up_to_next_multiple() {
        assert_eq!(normalise_interval(7, 5), 10);
    }

    #[test]
    fn interval_falls_back_to_sleep_timer_when_rounding_exceeds_max() {
        assert_eq!(normalise_interval(59, 60), 60);
        assert_eq!(normalise_interval(31, 60), 60);
    }

    #[test]
    fn env_override_replaces_inherited_key_by_left_of_equals() {
        std::env::set_var("SSHTUNNELS_TEST_VAR", "original");
        let envp = build_envp(&["SSHTUNNELS_TEST_VAR=overridden".to_string()]).unwrap();
        let found = envp
            .iter()
            .find(|e| e.to_string_lossy().starts_with("SSHTUNNELS_TEST_VAR="))
            .unwrap();
        assert_eq!(found.to_string_lossy(), "SSHTUNNELS_TEST_VAR=overridden");
    }
}
