//! End-to-end scenarios against real subprocesses (spec §8 "End-to-end
//! scenarios"). These spawn real children (`/bin/true`, `/bin/sleep`,
//! `/bin/sh`) and drive the tunnel/supervisor types directly rather than
//! going through the XML config loader or the CLI binary.
//!
//! For the heartbeat-healthy scenarios, the far end is a small shell
//! script that discards the Phase 1 header line and then echoes
//! everything afterwards — the behaviour of a real `uptoken-receiver`,
//! which a bare `/bin/cat` does not have (it would echo the header back
//! too, corrupting the first challenge/response comparison).

use sshtunnels::config::{Config, TunnelSpec};
use sshtunnels::log::{LogDestination, Logger};
use sshtunnels::tunnel::Tunnel;
use sshtunnels::Supervisor;
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn cstr(s: &str) -> CString {
    CString::new(s).unwrap()
}

fn sh(script: &str) -> Vec<CString> {
    vec![cstr("/bin/sh"), cstr("-c"), cstr(script)]
}

/// Discards the first line (the UpToken header), then echoes byte for
/// byte, the way a real `uptoken-receiver` behaves.
const FAKE_RECEIVER_SCRIPT: &str = "IFS= read -r _hdr; exec cat";

fn logger() -> Logger {
    Logger::new("test", LogDestination::Stdout).unwrap()
}

fn run_ticks(tunnel: &mut Tunnel, logger: &Logger, ticks: usize, pause: Duration) {
    for _ in 0..ticks {
        tunnel.maintain(logger).unwrap();
        std::thread::sleep(pause);
    }
}

#[test]
fn happy_path_heartbeat_stays_healthy_across_several_cycles() {
    let logger = logger();
    let mut tunnel = Tunnel::create(
        1,
        sh(FAKE_RECEIVER_SCRIPT),
        vec![],
        true,
        Duration::from_secs(1),
        &logger,
    );

    // Six ~0.5s ticks covers several heartbeat intervals at interval=1s.
    run_ticks(&mut tunnel, &logger, 12, Duration::from_millis(500));

    assert!(tunnel.is_running(), "tunnel should still be alive and uncondemned");
    assert_eq!(tunnel.trouble(), 0);
    tunnel.destroy(&logger);
}

#[test]
fn silent_far_end_gets_condemned_and_relaunched_with_backoff() {
    let logger = logger();
    let mut tunnel = Tunnel::create(
        2,
        vec![cstr("/bin/sleep"), cstr("60")],
        vec![],
        true,
        Duration::from_secs(1),
        &logger,
    );

    let deadline = Instant::now() + Duration::from_secs(10);
    while tunnel.trouble() == 0 && Instant::now() < deadline {
        tunnel.maintain(&logger).unwrap();
        std::thread::sleep(Duration::from_millis(200));
    }

    assert_eq!(tunnel.trouble(), 1, "a silent far end should cost exactly one trouble tick");
    tunnel.destroy(&logger);
}

#[test]
fn magic_words_on_stderr_condemn_regardless_of_heartbeat_state() {
    let logger = logger();
    let mut tunnel = Tunnel::create(
        3,
        sh("echo 'channel 3: open failed: administratively prohibited: port forwarding failed' 1>&2; sleep 30"),
        vec![],
        false,
        Duration::from_secs(5),
        &logger,
    );

    let deadline = Instant::now() + Duration::from_secs(10);
    while tunnel.trouble() == 0 && Instant::now() < deadline {
        tunnel.maintain(&logger).unwrap();
        std::thread::sleep(Duration::from_millis(100));
    }

    assert_eq!(tunnel.trouble(), 1, "magic words must condemn and relaunch the tunnel");
    tunnel.destroy(&logger);
}

#[test]
fn backoff_saturates_after_eight_consecutive_reaps() {
    let logger = logger();
    let mut tunnel = Tunnel::create(4, vec![cstr("/bin/true")], vec![], false, Duration::from_secs(1), &logger);

    for _ in 0..9 {
        // Force immediate relaunch eligibility rather than waiting out backoff.
        let deadline = Instant::now() + Duration::from_secs(3);
        let before = tunnel.trouble();
        while tunnel.trouble() == before && Instant::now() < deadline {
            tunnel.maintain(&logger).unwrap();
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    assert_eq!(tunnel.trouble(), sshtunnels::tunnel::TROUBLE_MAX);
    assert_eq!(
        sshtunnels::tunnel::backoff_seconds(tunnel.trouble()),
        256,
        "backoff must saturate at 2^8 seconds"
    );
    tunnel.destroy(&logger);
}

#[test]
fn non_printable_bytes_are_stripped_from_logged_stderr_lines() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let log_path = tmp.path().to_path_buf();
    let logger = Logger::new("test", LogDestination::File(log_path.clone())).unwrap();

    let mut tunnel = Tunnel::create(
        5,
        sh("printf 'A\\001B\\033C\\n' 1>&2; sleep 5"),
        vec![],
        false,
        Duration::from_secs(5),
        &logger,
    );

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut contents = String::new();
    while Instant::now() < deadline {
        tunnel.maintain(&logger).unwrap();
        contents = std::fs::read_to_string(&log_path).unwrap();
        if contents.contains("STDERR") {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    assert!(
        contents.lines().any(|l| l.ends_with("STDERR: ACB")),
        "expected a stripped STDERR line ending in ACB, got: {contents:?}"
    );
    tunnel.destroy(&logger);
}

#[test]
fn supervisor_runs_until_signaled_then_exits_cleanly() {
    let logger = logger();
    let config = Config {
        log_output: LogDestination::Stdout,
        sleep_timer_secs: 1,
        tunnels: vec![TunnelSpec {
            uptoken_enabled: true,
            uptoken_interval_secs: 1,
            argv: sh(FAKE_RECEIVER_SCRIPT),
            envp: vec![],
        }],
    };
    let terminate = Arc::new(AtomicBool::new(false));
    let mut supervisor = Supervisor::new(&config, Arc::clone(&terminate), &logger);

    let flag = Arc::clone(&terminate);
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_secs(3));
        flag.store(true, Ordering::SeqCst);
    });

    let start = Instant::now();
    supervisor.run(&logger).unwrap();
    assert!(start.elapsed() < Duration::from_secs(6), "supervisor should stop promptly once signaled");
}
