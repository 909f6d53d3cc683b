/*!
 * SSHTunnels - a supervisor daemon that launches and maintains a fixed
 * set of SSH tunnel child processes, watching each one with an
 * application-layer heartbeat exchanged over its own stdio pipes.
 *
 * This crate is the library half: the tunnel state machine, the
 * UpToken heartbeat protocol, the supervisor loop, the config loader,
 * and the error/logging primitives they all share. `src/bin/sshtunneld.rs`
 * is the thin CLI shell around it; `uptoken-receiver` is the companion
 * far-end agent that answers the heartbeat.
 */

pub mod config;
pub mod error;
pub mod io;
pub mod line_reader;
pub mod log;
pub mod supervisor;
pub mod tunnel;
pub mod uptoken;

pub use error::{ConfigError, ErrorKind, LaunchError, SupervisorError};
pub use log::{Level, LogDestination, Logger};
pub use supervisor::Supervisor;
pub use tunnel::Tunnel;
