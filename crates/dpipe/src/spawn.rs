//! Forking the command interpreter onto a duplex endpoint.
//!
//! Everything the child needs (argv, the descriptors to close) is prepared before
//! `fork`, because the child of a multi-threaded parent may only make
//! async-signal-safe calls until it execs. Setup failures in the child never come
//! back as values: the child exits with [`CHILD_SETUP_FAILED`] or [`EXEC_FAILED`]
//! and the parent sees that status when it reaps.
//!
//! ## Safety contracts
//!
//! The child branch relies on:
//! 1. No allocation, locking or logging after `fork` (only `close`, `dup2`,
//!    `fcntl`, `signal`, `execv`, `_exit`)
//! 2. `argv` pointers borrowed from a [`ShellCommand`] that outlives the fork
//! 3. Descriptor numbers captured while their owners were alive in the parent;
//!    any of them may already be closed in the child, which is harmless

use std::ffi::{CString, c_char};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixStream;
use std::path::Path;

use nix::errno::Errno;
use nix::unistd::{ForkResult, Pid, fork};

use crate::error::{Error, Result};
use crate::status::{CHILD_SETUP_FAILED, EXEC_FAILED};

/// `<shell> -c <command>`, converted to C strings ahead of the fork.
#[derive(Debug)]
pub(crate) struct ShellCommand {
    shell: CString,
    argv: Vec<CString>,
}

impl ShellCommand {
    pub(crate) fn new(shell: &Path, command: &str) -> Result<Self> {
        let arg0 = shell
            .file_name()
            .map(|name| name.as_bytes())
            .unwrap_or_else(|| shell.as_os_str().as_bytes());

        Ok(Self {
            shell: CString::new(shell.as_os_str().as_bytes())?,
            argv: vec![
                CString::new(arg0)?,
                CString::new("-c")?,
                CString::new(command)?,
            ],
        })
    }

    /// NULL-terminated pointer array borrowing from `self`.
    fn argv_ptrs(&self) -> Vec<*const c_char> {
        self.argv
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect()
    }
}

/// Fork a child running `command` with `child_end` as its stdin and stdout.
///
/// `parent_end` and every descriptor in `siblings` are closed in the child before
/// exec. `child_end` is consumed: it is closed in the parent once the fork has
/// happened, or released along with the error if it could not.
pub(crate) fn spawn_onto(
    command: &ShellCommand,
    parent_end: &UnixStream,
    child_end: UnixStream,
    siblings: &[RawFd],
) -> Result<Pid> {
    let argv = command.argv_ptrs();
    let parent_fd = parent_end.as_raw_fd();
    let child_fd = child_end.as_raw_fd();

    // Safety: the child branch only runs `exec_child`, see the module contracts.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => unsafe {
            exec_child(command.shell.as_ptr(), &argv, parent_fd, child_fd, siblings)
        },
        Ok(ForkResult::Parent { child }) => {
            drop(child_end);
            Ok(child)
        }
        Err(errno) => Err(Error::Spawn(errno.into())),
    }
}

/// Child side of [`spawn_onto`]. Never returns.
unsafe fn exec_child(
    shell: *const c_char,
    argv: &[*const c_char],
    parent_fd: RawFd,
    child_fd: RawFd,
    siblings: &[RawFd],
) -> ! {
    unsafe {
        libc::close(parent_fd);

        for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO] {
            let ok = if child_fd == target {
                // Already in place, but created close-on-exec.
                retry_eintr(|| libc::fcntl(child_fd, libc::F_SETFD, 0))
            } else {
                retry_eintr(|| libc::dup2(child_fd, target))
            };
            if !ok {
                libc::_exit(CHILD_SETUP_FAILED);
            }
        }
        if child_fd > libc::STDOUT_FILENO {
            libc::close(child_fd);
        }

        for &fd in siblings {
            if fd > libc::STDOUT_FILENO {
                libc::close(fd);
            }
        }

        // Rust runtimes ignore SIGPIPE and exec preserves ignored dispositions.
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);

        libc::execv(shell, argv.as_ptr());
        libc::_exit(EXEC_FAILED)
    }
}

fn retry_eintr(mut call: impl FnMut() -> libc::c_int) -> bool {
    loop {
        if call() != -1 {
            return true;
        }
        if Errno::last() != Errno::EINTR {
            return false;
        }
    }
}
