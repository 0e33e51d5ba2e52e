//! Registry of open duplex channels.
//!
//! The registry owns one record per channel that has been opened and not yet
//! closed. Its lock guards only the map itself: forking, socket I/O and waiting
//! for the child all happen outside of it, so a slow child never stalls opens or
//! closes of unrelated channels.
//!
//! Every child forked by [`Registry::open`] closes the endpoints of all channels
//! registered at that moment before it runs the command, the duplex counterpart of
//! popen closing previously opened pipe streams.

use std::collections::HashMap;
use std::io::Write;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::channel::{Channel, ChannelId};
use crate::config::RegistryConfig;
use crate::error::{Error, Result};
use crate::reaper;
use crate::spawn::{ShellCommand, spawn_onto};
use crate::status::ExitStatus;

struct ChannelRecord {
    pid: Pid,
    fd: RawFd,
}

struct RegistryInner {
    config: RegistryConfig,
    channels: Mutex<HashMap<ChannelId, ChannelRecord>>,
}

/// Handle to a set of open channels. Clones share the same set.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.inner.config)
            .field("open_channels", &self.len())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Process-wide registry, created on first use and never torn down.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::new)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Lock the channel map, recovering from poisoning.
    ///
    /// A panic while holding the lock cannot leave the map half-mutated (every
    /// critical section is a single insert, remove or scan).
    fn channels(&self) -> MutexGuard<'_, HashMap<ChannelId, ChannelRecord>> {
        match self.inner.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Channel registry mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.channels().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.channels().contains_key(&id)
    }

    /// Spawn `command` through the configured shell, connected over one duplex
    /// channel to its stdin and stdout. Stderr is inherited.
    pub fn open(&self, command: &str) -> Result<Channel> {
        let shell_command = ShellCommand::new(&self.inner.config.shell, command)?;

        let (parent_end, child_end) = UnixStream::pair().map_err(Error::Transport)?;

        let siblings: Vec<RawFd> = self.channels().values().map(|r| r.fd).collect();
        tracing::trace!(
            siblings = siblings.len(),
            "Snapshotted sibling channels to close in child"
        );

        let pid = spawn_onto(&shell_command, &parent_end, child_end, &siblings)?;

        let id = ChannelId::new();
        self.channels().insert(
            id,
            ChannelRecord {
                pid,
                fd: parent_end.as_raw_fd(),
            },
        );

        tracing::debug!(channel = %id, %pid, command, "Opened duplex channel");
        Ok(Channel::new(id, pid, parent_end))
    }

    /// Close `channel` and reap its process.
    ///
    /// Blocks until the child terminates. Fails with [`Error::NotFound`] if the
    /// channel is not registered here (never opened by this registry, or its
    /// identity was already closed through a clone); the passed endpoint is still
    /// released in that case.
    pub fn close(&self, channel: Channel) -> Result<ExitStatus> {
        let id = channel.id();

        let Some(record) = self.channels().remove(&id) else {
            tracing::warn!(channel = %id, "Close requested for unregistered channel");
            return Err(Error::NotFound(id));
        };

        drop(channel);

        let status = reaper::wait_for_exit(record.pid)?;
        tracing::debug!(channel = %id, pid = %record.pid, %status, "Closed duplex channel");
        Ok(status)
    }

    /// Signal end-of-input to the child while keeping its output readable.
    ///
    /// The channel stays registered and the child is not waited for. Writes after
    /// a half-close fail.
    pub fn half_close(&self, channel: &Channel) -> Result<()> {
        if !self.contains(channel.id()) {
            return Err(Error::NotFound(channel.id()));
        }

        let mut stream = channel.stream();
        stream.flush()?;
        stream.shutdown(Shutdown::Write)?;

        tracing::trace!(channel = %channel.id(), "Half-closed duplex channel");
        Ok(())
    }

    /// Unregister `id`, kill its child and reap it, for channels whose owner is
    /// gone without closing them. No-op if `id` is no longer registered.
    ///
    /// Reaping runs on the tokio blocking pool when called inside a runtime.
    pub(crate) fn abandon(&self, id: ChannelId) {
        let Some(record) = self.channels().remove(&id) else {
            return;
        };
        let pid = record.pid;

        tracing::debug!(channel = %id, %pid, "Killing abandoned channel");
        if let Err(e) = signal::kill(pid, Signal::SIGKILL) {
            tracing::warn!(channel = %id, %pid, error = %e, "Failed to kill abandoned child");
        }

        let reap = move || match reaper::wait_for_exit(pid) {
            Ok(status) => {
                tracing::debug!(channel = %id, %pid, %status, "Reaped abandoned channel");
            }
            Err(e) => {
                tracing::warn!(channel = %id, %pid, error = %e, "Failed to reap abandoned child");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(reap);
            }
            Err(_) => reap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;
    use crate::status::EXEC_FAILED;

    #[test]
    fn close_returns_exit_code_and_unregisters() {
        crate::init_test_tracing();
        let registry = Registry::new();

        let channel = registry.open("exit 3").unwrap();
        let id = channel.id();
        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.close(channel).unwrap(), ExitStatus::Exited(3));
        assert!(!registry.contains(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn second_close_of_same_identity_is_not_found() {
        let registry = Registry::new();

        // The child must exit on its own: the twin keeps the endpoint open.
        let channel = registry.open("exit 0").unwrap();
        let twin = channel.try_clone().unwrap();
        let id = channel.id();

        assert!(registry.close(channel).unwrap().success());
        match registry.close(twin) {
            Err(Error::NotFound(missing)) => assert_eq!(missing, id),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn close_on_foreign_registry_is_not_found() {
        let home = Registry::new();
        let foreign = Registry::new();

        let channel = home.open("cat").unwrap();
        let id = channel.id();
        let twin = channel.try_clone().unwrap();

        assert!(matches!(foreign.close(twin), Err(Error::NotFound(missing)) if missing == id));
        assert!(matches!(
            foreign.half_close(&channel),
            Err(Error::NotFound(_))
        ));
        assert!(home.contains(id));

        assert!(home.close(channel).unwrap().success());
    }

    #[test]
    fn half_close_delivers_eof_and_keeps_reads_open() {
        let registry = Registry::new();

        let mut channel = registry
            .open("cat >/dev/null; echo 'EOF seen'")
            .unwrap();
        channel.write_all(b"some input that is discarded\n").unwrap();
        registry.half_close(&channel).unwrap();

        let mut output = String::new();
        channel.read_to_string(&mut output).unwrap();
        assert_eq!(output, "EOF seen\n");

        assert!(channel.write_all(b"too late").is_err());
        assert!(registry.contains(channel.id()));
        assert!(registry.close(channel).unwrap().success());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn child_does_not_inherit_sibling_endpoints() {
        let registry = Registry::new();

        let mut first = registry.open("cat").unwrap();
        let first_fd = first.as_raw_fd();

        // Without close-on-exec only the child's sibling cleanup hides the endpoint.
        assert_eq!(unsafe { libc::fcntl(first_fd, libc::F_SETFD, 0) }, 0);
        let second = registry.open(&format!(
            "if [ -e /proc/self/fd/{fd} ]; then echo inherited; else echo hidden; fi",
            fd = first_fd
        ));
        assert_eq!(
            unsafe { libc::fcntl(first_fd, libc::F_SETFD, libc::FD_CLOEXEC) },
            0
        );
        let mut second = second.unwrap();
        registry.half_close(&second).unwrap();
        let mut report = String::new();
        second.read_to_string(&mut report).unwrap();
        assert_eq!(report, "hidden\n");
        assert!(registry.close(second).unwrap().success());

        // The sibling is untouched in the parent.
        first.write_all(b"ping\n").unwrap();
        registry.half_close(&first).unwrap();
        let mut echoed = String::new();
        first.read_to_string(&mut echoed).unwrap();
        assert_eq!(echoed, "ping\n");
        assert!(registry.close(first).unwrap().success());
    }

    #[test]
    fn missing_interpreter_exits_with_reserved_code() {
        let registry =
            Registry::with_config(RegistryConfig::new().with_shell("/nonexistent/dpipe-shell"));

        let channel = registry.open("true").unwrap();
        assert_eq!(
            registry.close(channel).unwrap(),
            ExitStatus::Exited(EXEC_FAILED)
        );
    }

    #[test]
    fn configured_shell_receives_command_verbatim() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let shell = dir.path().join("argv-shell");
        std::fs::write(&shell, "#!/bin/sh\nprintf '%s\\n' \"$@\"\n").unwrap();
        std::fs::set_permissions(&shell, std::fs::Permissions::from_mode(0o755)).unwrap();

        let registry = Registry::with_config(RegistryConfig::new().with_shell(&shell));

        // exec can hit ETXTBSY while a child forked by a parallel test still holds
        // the script's write descriptor.
        let mut attempts = 0;
        let output = loop {
            attempts += 1;
            match registry.exchange("echo 'a b' | cat", b"") {
                Err(Error::CommandFailed(ExitStatus::Exited(EXEC_FAILED))) if attempts < 5 => {
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
                other => break other.unwrap(),
            }
        };
        assert_eq!(output, b"-c\necho 'a b' | cat\n");
    }

    #[test]
    fn killed_child_reports_signal() {
        let registry = Registry::new();

        let channel = registry.open("exec sleep 30").unwrap();
        channel.kill(Signal::SIGKILL).unwrap();
        assert_eq!(
            registry.close(channel).unwrap(),
            ExitStatus::Signaled(libc::SIGKILL)
        );
    }

    #[test]
    fn invalid_command_registers_nothing() {
        let registry = Registry::new();
        assert!(matches!(
            registry.open("echo \0"),
            Err(Error::InvalidCommand(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_open_and_close() {
        let registry = Registry::new();

        std::thread::scope(|s| {
            for worker in 0..8 {
                let registry = &registry;
                s.spawn(move || {
                    for round in 0..10 {
                        let mut channel = registry.open("cat").unwrap();
                        let line = format!("worker {} round {}\n", worker, round);
                        channel.write_all(line.as_bytes()).unwrap();
                        registry.half_close(&channel).unwrap();

                        let mut echoed = String::new();
                        channel.read_to_string(&mut echoed).unwrap();
                        assert_eq!(echoed, line);
                        assert!(registry.close(channel).unwrap().success());
                    }
                });
            }
        });

        assert!(registry.is_empty());
    }

    #[test]
    fn clones_share_the_channel_set() {
        let registry = Registry::new();
        let view = registry.clone();

        let channel = registry.open("true").unwrap();
        assert!(view.contains(channel.id()));
        assert!(view.close(channel).unwrap().success());
        assert!(registry.is_empty());
    }
}
