//! Registry configuration.

use std::path::PathBuf;

/// Interpreter used when `DPIPE_SHELL` is not set.
pub const DEFAULT_SHELL: &str = "/bin/sh";

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Command interpreter, invoked as `<shell> -c <command>`.
    pub shell: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            shell: std::env::var_os("DPIPE_SHELL")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SHELL)),
        }
    }
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }
}
