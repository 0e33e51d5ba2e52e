//! Termination status of a reaped child.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Exit code a child uses when descriptor setup fails before exec.
pub const CHILD_SETUP_FAILED: i32 = 126;

/// Exit code a child uses when the command interpreter cannot be executed.
pub const EXEC_FAILED: i32 = 127;

/// How a spawned process ended, as reported by the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitStatus {
    /// Exited normally with the given code.
    Exited(i32),
    /// Terminated by the given signal.
    Signaled(i32),
    /// Stopped by the given signal.
    Stopped(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Exit code, if the process exited normally.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            _ => None,
        }
    }

    /// Signal number, if the process was terminated or stopped by one.
    pub fn signal(&self) -> Option<i32> {
        match self {
            Self::Signaled(sig) | Self::Stopped(sig) => Some(*sig),
            Self::Exited(_) => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "command exited with status {}", code),
            Self::Signaled(sig) => write!(f, "command terminated by signal {}", sig),
            Self::Stopped(sig) => write!(f, "command stopped by signal {}", sig),
        }
    }
}
