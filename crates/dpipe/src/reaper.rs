//! Reaping spawned processes.

use nix::errno::Errno;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::status::ExitStatus;

/// Block until `pid` terminates and return how it ended.
///
/// Interrupted waits are retried. Must be called exactly once per child; a second
/// call fails with `ECHILD` because the process record is already gone.
pub(crate) fn wait_for_exit(pid: Pid) -> Result<ExitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ExitStatus::Exited(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(ExitStatus::Signaled(sig as i32)),
            Ok(WaitStatus::Stopped(_, sig)) => return Ok(ExitStatus::Stopped(sig as i32)),
            Ok(other) => {
                tracing::trace!(%pid, status = ?other, "Ignoring non-terminal wait status");
            }
            Err(Errno::EINTR) => {
                tracing::trace!(%pid, "waitpid interrupted, retrying");
            }
            Err(errno) => {
                return Err(Error::Reap {
                    pid: pid.as_raw(),
                    source: errno.into(),
                });
            }
        }
    }
}
