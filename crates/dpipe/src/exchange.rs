//! One-shot request/response over a duplex channel.
//!
//! Writing all input before reading any output deadlocks as soon as the command
//! produces more output than the socket buffers hold while it still has input to
//! consume. Both variants therefore drain output on a separate task while the
//! calling context writes input, then half-close, join the reader, and reap.
//!
//! Input delivery is best effort: a command that stops reading early (`head`,
//! a filter that exits) ends delivery quietly and whatever it wrote is still
//! collected. Read failures are not tolerated.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::AbortHandle;

use crate::channel::{AsyncChannel, Channel, ChannelId};
use crate::error::{Error, Result};
use crate::registry::Registry;

const READ_CHUNK: usize = 4096;

impl Registry {
    /// Run `command`, feed it `input`, and return everything it wrote to stdout.
    ///
    /// Fails with [`Error::CommandFailed`] unless the command exits with status 0.
    pub fn exchange(&self, command: &str, input: &[u8]) -> Result<Vec<u8>> {
        let channel = self.open(command)?;
        let id = channel.id();

        // Scoped: the reader is joined before `channel` can be closed.
        let (drained, half_closed) = std::thread::scope(|s| {
            let reader = s.spawn(|| drain(&channel));

            let written = deliver(&channel, input);
            tracing::trace!(channel = %id, written, total = input.len(), "Input delivered");

            let half_closed = self.half_close(&channel);
            if let Err(ref e) = half_closed {
                tracing::warn!(channel = %id, error = %e, "Failed to signal end of input");
            }

            let drained = reader
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
            (drained, half_closed)
        });

        let status = self.close(channel)?;
        let output = drained?;
        half_closed?;

        if !status.success() {
            return Err(Error::CommandFailed(status));
        }
        tracing::debug!(channel = %id, output_bytes = output.len(), "Exchange complete");
        Ok(output)
    }

    /// Async form of [`Registry::exchange`] for use on a tokio runtime.
    ///
    /// The reader is a spawned task that owns the read half; the final wait for the
    /// child runs on the blocking pool. If the future is dropped (for example by
    /// `tokio::time::timeout`) or fails before the channel is closed, the child is
    /// killed and reaped and its channel unregistered.
    pub async fn exchange_async(&self, command: &str, input: &[u8]) -> Result<Vec<u8>> {
        let channel = self.open(command)?;
        let mut guard = AbandonGuard {
            registry: self.clone(),
            id: channel.id(),
            reader: None,
        };

        let (id, pid, stream) = channel.into_async()?.into_parts();
        let (mut read_half, mut write_half) = stream.into_split();

        let reader = tokio::spawn(async move {
            let mut output = Vec::new();
            let result = read_half.read_to_end(&mut output).await.map(|_| output);
            if let Err(ref e) = result {
                tracing::warn!(channel = %id, error = %e, "Reading command output failed");
                stop_reading(read_half.as_ref().as_raw_fd());
            }
            (read_half, result)
        });
        guard.reader = Some(reader.abort_handle());

        let mut written = 0;
        while written < input.len() {
            match write_half.write(&input[written..]).await {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(channel = %id, error = %e, written, "Command stopped accepting input");
                    break;
                }
            }
        }

        let half_closed = write_half.shutdown().await;
        if let Err(ref e) = half_closed {
            tracing::warn!(channel = %id, error = %e, "Failed to signal end of input");
        }

        let (read_half, drained) = reader
            .await
            .map_err(|e| Error::Io(io::Error::other(e)))?;
        let stream = read_half
            .reunite(write_half)
            .map_err(|e| Error::Io(io::Error::other(e)))?;
        let channel = AsyncChannel::from_parts(id, pid, stream).into_sync()?;

        let registry = self.clone();
        let status = tokio::task::spawn_blocking(move || registry.close(channel))
            .await
            .map_err(|e| Error::Io(io::Error::other(e)))??;
        let output = drained?;
        half_closed?;

        if !status.success() {
            return Err(Error::CommandFailed(status));
        }
        tracing::debug!(channel = %id, output_bytes = output.len(), "Exchange complete");
        Ok(output)
    }
}

/// Read until end-of-stream, preserving arrival order.
///
/// On a read error the read direction is shut down so the command's writes fail
/// instead of blocking forever on a reader that is gone.
fn drain(mut channel: &Channel) -> io::Result<Vec<u8>> {
    let mut output = Vec::new();
    let mut buf = [0u8; READ_CHUNK];

    loop {
        match channel.read(&mut buf) {
            Ok(0) => return Ok(output),
            Ok(n) => output.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(channel = %channel.id(), error = %e, "Reading command output failed");
                let _ = channel.stream().shutdown(Shutdown::Read);
                return Err(e);
            }
        }
    }
}

/// Write as much of `input` as the command accepts, retrying short writes.
fn deliver(mut channel: &Channel, input: &[u8]) -> usize {
    let mut written = 0;

    while written < input.len() {
        match channel.write(&input[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(channel = %channel.id(), error = %e, written, "Command stopped accepting input");
                break;
            }
        }
    }
    written
}

/// Kills and reaps the child of an async exchange that ends without closing its
/// channel. Does nothing once the channel has been closed normally.
struct AbandonGuard {
    registry: Registry,
    id: ChannelId,
    reader: Option<AbortHandle>,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.registry.abandon(self.id);
    }
}

fn stop_reading(fd: RawFd) {
    // Safety: `fd` is borrowed from a live socket half owned by the caller.
    unsafe {
        libc::shutdown(fd, libc::SHUT_RD);
    }
}
