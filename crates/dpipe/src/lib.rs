//! dpipe: duplex pipes to child processes.
//!
//! A bidirectional `popen`: [`Registry::open`] runs a shell command with both its
//! stdin and stdout connected to one Unix socket, [`Registry::close`] releases the
//! socket and reaps the child exactly once. [`Registry::exchange`] builds a
//! deadlock-free "send input, collect output" call on top.
//!
//! The crate-level functions use the process-wide [`Registry::global`]; construct
//! a [`Registry`] directly to keep a set of channels isolated.
//!
//! Writing to a channel whose command has exited fails with
//! [`std::io::ErrorKind::BrokenPipe`]. Signal disposition is left to the caller.

#![cfg(unix)]

mod channel;
mod config;
mod error;
mod exchange;
mod reaper;
mod registry;
mod spawn;
mod status;

pub use channel::{AsyncChannel, Channel, ChannelId};
pub use config::{DEFAULT_SHELL, RegistryConfig};
pub use error::{Error, Result};
pub use nix::sys::signal::Signal;
pub use registry::Registry;
pub use status::{CHILD_SETUP_FAILED, EXEC_FAILED, ExitStatus};

/// Open a channel on the global registry.
pub fn open(command: &str) -> Result<Channel> {
    Registry::global().open(command)
}

/// Close a channel opened with [`open`] and reap its process.
pub fn close(channel: Channel) -> Result<ExitStatus> {
    Registry::global().close(channel)
}

/// Signal end-of-input on a channel opened with [`open`].
pub fn half_close(channel: &Channel) -> Result<()> {
    Registry::global().half_close(channel)
}

/// Run `command` on the global registry, feeding it `input` and collecting its output.
pub fn exchange(command: &str, input: &[u8]) -> Result<Vec<u8>> {
    Registry::global().exchange(command, input)
}

#[cfg(test)]
pub(crate) fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
