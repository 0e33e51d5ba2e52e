use std::ffi::NulError;
use std::io;

use thiserror::Error;

use crate::channel::ChannelId;
use crate::status::ExitStatus;

#[derive(Debug, Error)]
pub enum Error {
    /// The duplex socket pair could not be allocated.
    #[error("failed to allocate duplex transport: {0}")]
    Transport(#[source] io::Error),

    /// Process creation itself failed. Both transport endpoints are released.
    #[error("failed to spawn process: {0}")]
    Spawn(#[source] io::Error),

    #[error("command contains an interior NUL byte")]
    InvalidCommand(#[from] NulError),

    /// The channel was never registered here, or was already closed.
    #[error("channel {0} is not registered")]
    NotFound(ChannelId),

    #[error("channel i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("failed to wait for process {pid}: {source}")]
    Reap {
        pid: i32,
        #[source]
        source: io::Error,
    },

    /// The process was reaped but did not exit with status zero.
    #[error("{0}")]
    CommandFailed(ExitStatus),
}

impl Error {
    /// Termination status carried by a [`Error::CommandFailed`].
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self {
            Self::CommandFailed(status) => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
