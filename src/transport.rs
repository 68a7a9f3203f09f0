//! Exposes one virtual disk as a local NBD endpoint by running the transport
//! process (nbdkit with the VDDK plugin) in a private directory.

use crate::block::MIB;
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::process::{GroupKiller, ScopedChild};
use crate::{log_debug, log_info, log_warn};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;

/// Largest single read accepted by a hypervisor host.
pub const HOST_MAX_CHUNK: u64 = 23 * MIB;
/// Largest single read that stays reliable through the management server
/// under concurrent sessions.
pub const VCENTER_MAX_CHUNK: u64 = 2 * MIB;

const REDACTED: &str = "*****";

/// What kind of management endpoint the credentials point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    /// Direct connection to an ESXi host.
    Host,
    /// Connection through vCenter.
    VCenter,
}

impl EndpointKind {
    pub fn max_chunk(self) -> u64 {
        match self {
            EndpointKind::Host => HOST_MAX_CHUNK,
            EndpointKind::VCenter => VCENTER_MAX_CHUNK,
        }
    }
}

/// A secret that never prints.
#[derive(Clone, PartialEq, Eq)]
pub struct Password(String);

impl Password {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Display for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl<'de> Deserialize<'de> for Password {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Password)
    }
}

/// Resolved credentials for the source management endpoint. Loadable from a
/// credentials file but never written back out.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub endpoint: String,
    pub username: String,
    pub password: Password,
    /// SHA-1 TLS thumbprint of the endpoint certificate.
    pub thumbprint: String,
    pub kind: EndpointKind,
}

/// The disk to expose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRef {
    /// Managed object reference of the VM, e.g. `vm-1042`.
    pub vm_moref: String,
    /// Datastore path, e.g. `[datastore1] web01/web01.vmdk`.
    pub disk_path: String,
    /// Snapshot to read from instead of the live disk.
    pub snapshot_moref: Option<String>,
}

#[derive(Debug, Clone)]
enum Arg {
    Plain(String),
    Secret { key: &'static str, value: String },
}

/// A command line whose `Display` form masks secret arguments.
#[derive(Debug, Clone)]
pub struct TransportCommand {
    program: PathBuf,
    args: Vec<Arg>,
}

impl TransportCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(Arg::Plain(arg.into()));
        self
    }

    pub fn secret(&mut self, key: &'static str, value: &Password) -> &mut Self {
        self.args.push(Arg::Secret {
            key,
            value: value.expose().to_string(),
        });
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        for arg in &self.args {
            match arg {
                Arg::Plain(value) => command.arg(value),
                Arg::Secret { key, value } => command.arg(format!("{}={}", key, value)),
            };
        }
        command
    }

    /// The form that is safe to log.
    pub fn redacted(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TransportCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            match arg {
                Arg::Plain(value) => write!(f, " {}", value)?,
                Arg::Secret { key, .. } => write!(f, " {}={}", key, REDACTED)?,
            }
        }
        Ok(())
    }
}

pub struct TransportManager {
    config: TransportConfig,
}

impl TransportManager {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn build_command(
        &self,
        credentials: &Credentials,
        disk: &DiskRef,
        socket: &Path,
        pidfile: &Path,
    ) -> TransportCommand {
        let mut command = TransportCommand::new(&self.config.nbdkit_path);
        command
            .arg("--readonly")
            .arg("--foreground")
            .arg("--unix")
            .arg(socket.display().to_string())
            .arg("--pidfile")
            .arg(pidfile.display().to_string())
            .arg(&self.config.plugin)
            .arg(format!("libdir={}", self.config.vddk_libdir.display()))
            .arg(format!("server={}", credentials.endpoint))
            .arg(format!("user={}", credentials.username))
            .secret("password", &credentials.password)
            .arg(format!("thumbprint={}", credentials.thumbprint))
            .arg(format!("vm=moref={}", disk.vm_moref))
            .arg(format!("file={}", disk.disk_path));
        if let Some(snapshot) = &disk.snapshot_moref {
            command.arg(format!("snapshot={}", snapshot));
        }
        if let Some(transports) = &self.config.transports {
            command.arg(format!("transports={}", transports));
        }
        command
    }

    /// Start the transport process for `disk`. Returns once the process is
    /// running; the endpoint may not accept connections yet.
    pub async fn open(
        &self,
        credentials: &Credentials,
        disk: &DiskRef,
    ) -> Result<TransportSession, TransportError> {
        let dir = tempfile::Builder::new()
            .prefix("vmigrate-nbd-")
            .tempdir()
            .map_err(TransportError::TempDir)?;
        let socket = dir.path().join("nbdkit.sock");
        let pidfile = dir.path().join("nbdkit.pid");

        let command = self.build_command(credentials, disk, &socket, &pidfile);
        log_info!(
            disk = %disk.disk_path,
            snapshot = disk.snapshot_moref.as_deref().unwrap_or("-"),
            command = %command,
            "starting disk transport"
        );

        let mut process_command = command.to_command();
        process_command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        let process = ScopedChild::spawn("nbdkit", &mut process_command).map_err(|source| {
            TransportError::Spawn {
                program: command.program().display().to_string(),
                source,
            }
        })?;

        Ok(TransportSession {
            disk: disk.clone(),
            kind: credentials.kind,
            socket,
            dir: Some(dir),
            process: Some(process),
            command,
            grace: Duration::from_secs(self.config.terminate_grace_secs),
        })
    }
}

/// One running transport process and its private directory. Owned by a
/// single disk copy attempt.
pub struct TransportSession {
    disk: DiskRef,
    kind: EndpointKind,
    socket: PathBuf,
    dir: Option<TempDir>,
    process: Option<ScopedChild>,
    command: TransportCommand,
    grace: Duration,
}

impl TransportSession {
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn endpoint_kind(&self) -> EndpointKind {
        self.kind
    }

    pub fn disk(&self) -> &DiskRef {
        &self.disk
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_ref().map(|dir| dir.path())
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ScopedChild::pid)
    }

    pub fn command(&self) -> &TransportCommand {
        &self.command
    }

    pub fn killer(&self) -> Option<GroupKiller> {
        self.process.as_ref().map(ScopedChild::killer)
    }

    pub fn is_running(&mut self) -> bool {
        self.process.as_mut().is_some_and(ScopedChild::is_running)
    }

    /// Fail fast if the process died before the endpoint came up.
    pub fn check_alive(&mut self) -> Result<(), TransportError> {
        if let Some(process) = self.process.as_mut() {
            if let Ok(Some(status)) = process.try_status() {
                return Err(TransportError::Exited(status));
            }
        }
        Ok(())
    }

    /// Stop the process and remove the directory. Safe to call repeatedly
    /// and after the process has crashed.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        let mut result = Ok(());
        if let Some(mut process) = self.process.take() {
            if let Err(err) = process.terminate(self.grace).await {
                result = Err(TransportError::Terminate(err));
            }
        }
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(err) = dir.close() {
                log_warn!(dir = %path.display(), error = %err, "failed to remove transport directory");
                if result.is_ok() {
                    result = Err(TransportError::Terminate(err));
                }
            }
        }
        log_debug!(disk = %self.disk.disk_path, "disk transport closed");
        result
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        // ScopedChild and TempDir clean up after themselves; this only makes
        // the unclosed path visible.
        if self.process.is_some() {
            log_warn!(disk = %self.disk.disk_path, "transport session dropped without close");
        }
    }
}
