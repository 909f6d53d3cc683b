//! Error hierarchy, classified by survivability (spec §7).

/// Which of the five survivability classes an error belongs to.
///
/// `Transient` is intentionally absent: a would-block outcome is a
/// successful result (`IoOutcome::WouldBlock`), never an `Err`.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ErrorKind {
    /// Heartbeat mismatch, magic word, child exit. Tunnel is condemned
    /// and/or relaunched with back-off; not fatal to the supervisor.
    ChildScoped,
    /// fork/pipe/fcntl/exec-setup failure during launch. Fatal to the
    /// owning tunnel's `maintain` call; the supervisor exits with error.
    TunnelScoped,
    /// `waitpid` failure. Fatal to the whole supervisor.
    SupervisorScoped,
    /// Malformed config / out-of-range attribute. Startup aborts.
    Config,
}

/// Fatal failure returned from [`crate::tunnel::Tunnel::maintain`].
///
/// This is distinct from a tunnel being merely condemned: a condemned
/// tunnel is still healthy from the supervisor's point of view (it will
/// be killed and relaunched), while a `LaunchError` means the supervisor
/// itself must stop.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to create pipe triple")]
    Pipe(#[source] std::io::Error),
    #[error("fork() failed")]
    Fork(#[source] nix::Error),
    #[error("fcntl() failed while marking descriptor non-blocking")]
    Fcntl(#[source] nix::Error),
    #[error("failed writing UpToken header to child stdin")]
    HeaderWrite,
}

impl LaunchError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::TunnelScoped
    }
}

/// Fatal failure in the supervisor loop itself (spec §7, "Supervisor-scoped").
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("waitpid() failed")]
    Waitpid(#[source] nix::Error),
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::Waitpid(_) => ErrorKind::SupervisorScoped,
            SupervisorError::Launch(_) => ErrorKind::TunnelScoped,
        }
    }
}

/// Startup-time configuration failure (spec §6/§7, "Config").
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not find {0} in any of the configured search locations")]
    NotFound(&'static str),
    #[error("I/O error reading config file {path}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        cause: std::io::Error,
    },
    #[error("malformed XML at byte offset {offset}: {detail}")]
    MalformedXml { offset: usize, detail: String },
    #[error("unrecognised tag <{0}>")]
    UnknownTag(String),
    #[error("unrecognised attribute \"{attr}\" on <{tag}>")]
    UnknownAttribute { tag: String, attr: String },
    #[error("attribute \"{attr}\" on <{tag}> must be an integer in {lo}..={hi}, got {value:?}")]
    OutOfRange {
        tag: String,
        attr: String,
        value: String,
        lo: i64,
        hi: i64,
    },
    #[error("attribute \"{attr}\" is required on <{tag}>")]
    MissingAttribute { tag: String, attr: String },
    #[error("<SSHTunnels> must contain at least one <Tunnel>")]
    NoTunnels,
    #[error("<Tunnel> must contain at least one <ProgramArgument>")]
    EmptyArgv,
    #[error("<ProgramEnvironment v=\"...\"> must look like KEY=VALUE, got {0:?}")]
    MalformedEnvEntry(String),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Config
    }
}
