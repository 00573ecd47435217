use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::mapping::RelayCommand;
use crate::error::{Result, SandgateError};

/// A detached relay child.
///
/// The process is started in its own process group so the whole group
/// (including anything `sudo` or `ip netns exec` forks) can be signalled.
/// Dropping the handle leaves the relay running.
#[derive(Debug)]
pub struct RelayProcess {
    layer: &'static str,
    command: String,
    child: Child,
}

impl RelayProcess {
    pub fn spawn(layer: &'static str, command: &RelayCommand) -> Result<Self> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|e| {
            SandgateError::RelaySetup(format!(
                "failed to start {} relay `{}`: {}",
                layer, command, e
            ))
        })?;

        debug!(layer, pid = child.id(), command = %command, "Relay started");
        Ok(Self {
            layer,
            command: command.to_string(),
            child,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Fail if the relay already exited, e.g. because its listen address was taken.
    pub fn ensure_running(&mut self) -> Result<()> {
        match self.child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(SandgateError::RelaySetup(format!(
                "{} relay exited immediately ({}): {}",
                self.layer, status, self.command
            ))),
            Err(e) => Err(SandgateError::RelaySetup(format!(
                "{} relay state unknown: {}",
                self.layer, e
            ))),
        }
    }

    /// Send SIGTERM to the relay's process group.
    ///
    /// Relays started through `sudo` run as root; signalling them fails
    /// with EPERM and the caller's sweep has to finish the job.
    pub fn terminate(&mut self) {
        let Some(pid) = self.child.id() else {
            return;
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                if e != nix::errno::Errno::ESRCH {
                    debug!(layer = self.layer, pid, error = %e, "SIGTERM to relay group failed");
                }
            }
        }
        #[cfg(not(unix))]
        let _ = self.child.start_kill();
    }

    /// Wait for the relay to exit, killing it if the grace period lapses.
    pub async fn reap(mut self, grace: Duration) {
        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(layer = self.layer, %status, "Relay exited");
            }
            Ok(Err(e)) => {
                warn!(layer = self.layer, error = %e, "Failed to wait for relay");
            }
            Err(_) => {
                warn!(
                    layer = self.layer,
                    pid = self.child.id(),
                    "Relay ignored SIGTERM, killing"
                );
                if let Err(e) = self.child.start_kill() {
                    warn!(layer = self.layer, error = %e, "Failed to kill relay");
                }
                let _ = timeout(grace, self.child.wait()).await;
            }
        }
    }
}

/// Run a short-lived helper command, returning its exit code.
pub async fn run_helper(command: &RelayCommand, limit: Duration) -> Result<Option<i32>> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    match timeout(limit, cmd.status()).await {
        Ok(status) => Ok(status?.code()),
        Err(_) => Err(SandgateError::RelaySetup(format!(
            "`{}` did not finish within {}ms",
            command,
            limit.as_millis()
        ))),
    }
}
