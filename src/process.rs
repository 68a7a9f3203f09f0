//! Child processes whose whole process tree is torn down with their owner.

use crate::{log_debug, log_warn};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::timeout;

/// Kills a process group from anywhere, without owning the child.
#[derive(Debug, Clone, Copy)]
pub struct GroupKiller {
    pgid: Pid,
}

impl GroupKiller {
    pub fn kill(&self) {
        signal_group(self.pgid, Signal::SIGKILL);
    }
}

/// A spawned child placed in its own process group. Dropping it, or calling
/// [`ScopedChild::terminate`], signals the entire group so helpers forked by
/// the child go with it.
#[derive(Debug)]
pub struct ScopedChild {
    name: String,
    pid: u32,
    child: Option<Child>,
}

impl ScopedChild {
    pub fn spawn(name: &str, command: &mut Command) -> io::Result<Self> {
        command.process_group(0).kill_on_drop(true);
        let child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("child exited before its pid was read"))?;
        log_debug!(process = name, pid, "spawned child process group");
        Ok(Self {
            name: name.to_string(),
            pid,
            child: Some(child),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn killer(&self) -> GroupKiller {
        GroupKiller {
            pgid: Pid::from_raw(self.pid as i32),
        }
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.as_mut().and_then(|child| child.stdout.take())
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.as_mut().and_then(|child| child.stderr.take())
    }

    /// Whether the group leader is still alive and unreaped.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Non-blocking exit check.
    pub fn try_status(&mut self) -> io::Result<Option<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => child.try_wait(),
            None => Ok(None),
        }
    }

    /// Wait for the group leader to exit on its own.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| io::Error::other("process already reaped"))?;
        let status = child.wait().await?;
        // Reap stragglers left in the group.
        signal_group(self.killer().pgid, Signal::SIGKILL);
        self.child = None;
        Ok(status)
    }

    /// SIGTERM the group, give it `grace` to exit, then SIGKILL. Idempotent.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let pgid = self.killer().pgid;

        if let Ok(Some(status)) = child.try_wait() {
            log_debug!(process = %self.name, pid = self.pid, %status, "process already exited");
            signal_group(pgid, Signal::SIGKILL);
            return Ok(());
        }

        signal_group(pgid, Signal::SIGTERM);
        match timeout(grace, child.wait()).await {
            Ok(status) => {
                let status = status?;
                log_debug!(process = %self.name, pid = self.pid, %status, "process terminated");
            }
            Err(_) => {
                log_warn!(
                    process = %self.name,
                    pid = self.pid,
                    "process ignored SIGTERM for {:?}, killing",
                    grace
                );
                signal_group(pgid, Signal::SIGKILL);
                child.wait().await?;
            }
        }
        signal_group(pgid, Signal::SIGKILL);
        Ok(())
    }
}

impl Drop for ScopedChild {
    fn drop(&mut self) {
        if self.child.take().is_some() {
            log_debug!(process = %self.name, pid = self.pid, "killing process group on drop");
            signal_group(self.killer().pgid, Signal::SIGKILL);
        }
    }
}

fn signal_group(pgid: Pid, signal: Signal) {
    match killpg(pgid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(errno) => log_warn!(pgid = pgid.as_raw(), %errno, "failed to signal process group"),
    }
}

/// Whether any process with `pid` exists.
pub fn pid_alive(pid: u32) -> bool {
    !matches!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH))
}
