use crate::phase::MigrationPhase;
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// Failures talking to the local NBD endpoint.
#[derive(Debug, Error)]
pub enum NbdError {
    #[error("NBD I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected NBD magic {found:#x} (expected {expected:#x})")]
    BadMagic { expected: u64, found: u64 },
    #[error("NBD handshake failed: {0}")]
    Handshake(String),
    #[error("NBD option {option} rejected by server (reply type {reply:#x})")]
    OptionRejected { option: u32, reply: u32 },
    #[error("NBD server returned error {errno} for {command} at offset {offset}: {message}")]
    Command {
        command: &'static str,
        offset: u64,
        errno: u32,
        message: String,
    },
    #[error("NBD protocol violation: {0}")]
    Protocol(String),
    #[error("NBD server did not negotiate base:allocation block status")]
    BlockStatusUnsupported,
}

/// Failures starting, reaching or stopping the disk transport process.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to create transport directory: {0}")]
    TempDir(#[source] std::io::Error),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("transport process exited early with {0}")]
    Exited(ExitStatus),
    #[error("transport endpoint {} unreachable: {reason}", socket.display())]
    Unreachable { socket: PathBuf, reason: String },
    #[error("hypervisor rejected credentials for {0}")]
    Authentication(String),
    #[error("failed to terminate transport process: {0}")]
    Terminate(#[source] std::io::Error),
}

/// Failures during a bulk or incremental copy pass. All of them are safe to
/// retry from the start of the pass.
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("read of {length} bytes at offset {offset} failed: {source}")]
    Read {
        offset: u64,
        length: u64,
        #[source]
        source: NbdError,
    },
    #[error("write of {length} bytes at offset {offset} failed: {source}")]
    Write {
        offset: u64,
        length: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("zeroing {length} bytes at offset {offset} failed: {source}")]
    Zero {
        offset: u64,
        length: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("changed extent at offset {offset} ({length} bytes) lies outside the {size}-byte disk")]
    InvalidExtent { offset: u64, length: u64, size: u64 },
    #[error("failed to open destination {}: {source}", path.display())]
    Destination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bulk copy exited with {status}: {stderr}")]
    BulkCopyFailed { status: ExitStatus, stderr: String },
    #[error("bulk copy process I/O failed: {0}")]
    BulkCopyIo(#[source] std::io::Error),
    #[error("copy cancelled")]
    Cancelled,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Read(#[from] std::io::Error),
    #[error("configuration parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level error seen by the phase state machine.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Copy(#[from] CopyError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("hypervisor error: {0}")]
    Hypervisor(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("preflight failed: {0}")]
    Preflight(String),
    #[error("disk conversion failed: {0}")]
    Conversion(String),
    #[error("cutover failed: {0}")]
    Cutover(String),
    #[error("invalid phase transition {from} -> {to}")]
    InvalidTransition {
        from: MigrationPhase,
        to: MigrationPhase,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which retry budget a failure draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Login,
    Copy,
    Conversion,
    Cutover,
    Fatal,
}

impl MigrationError {
    pub fn retry_class(&self) -> RetryClass {
        match self {
            MigrationError::Transport(_) => RetryClass::Login,
            MigrationError::Copy(CopyError::Transport(_)) => RetryClass::Login,
            MigrationError::Copy(CopyError::Cancelled) => RetryClass::Fatal,
            MigrationError::Copy(_) => RetryClass::Copy,
            MigrationError::Hypervisor(_) => RetryClass::Copy,
            MigrationError::Io(_) => RetryClass::Copy,
            MigrationError::Conversion(_) => RetryClass::Conversion,
            MigrationError::Cutover(_) => RetryClass::Cutover,
            MigrationError::Config(_)
            | MigrationError::Validation(_)
            | MigrationError::Preflight(_)
            | MigrationError::InvalidTransition { .. } => RetryClass::Fatal,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, MigrationError::Copy(CopyError::Cancelled))
    }
}
