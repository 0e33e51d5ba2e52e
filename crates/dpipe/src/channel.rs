//! Duplex channels to spawned commands.
//!
//! A [`Channel`] is the parent-side endpoint of a Unix socket pair whose other end
//! is the child's stdin and stdout. It is created by [`Registry::open`] and must be
//! handed back to [`Registry::close`], which consumes it and reaps the child.
//!
//! [`Registry::open`]: crate::Registry::open
//! [`Registry::close`]: crate::Registry::close

use std::io::{self, IoSlice, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::pin::Pin;
use std::task::{Context, Poll};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{Error, Result};

/// Registry key of an open channel.
///
/// UUID v4 so a recycled file descriptor number can never alias a closed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(uuid::Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> std::result::Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One open duplex connection to a spawned command.
///
/// Reads return the command's stdout, writes feed its stdin. `&Channel` is also
/// `Read + Write`, so one thread can drain output while another writes input.
/// Dropping a channel without closing it leaves the child unreaped.
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    pid: Pid,
    stream: UnixStream,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, pid: Pid, stream: UnixStream) -> Self {
        Self { id, pid, stream }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Process id of the spawned command interpreter.
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    pub(crate) fn raw_pid(&self) -> Pid {
        self.pid
    }

    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Duplicate the endpoint. The clone shares this channel's identity, so only
    /// one of the two can be closed successfully.
    pub fn try_clone(&self) -> io::Result<Channel> {
        Ok(Self {
            id: self.id,
            pid: self.pid,
            stream: self.stream.try_clone()?,
        })
    }

    /// Send `sig` to the child, e.g. to enforce a deadline before [`Registry::close`].
    ///
    /// [`Registry::close`]: crate::Registry::close
    pub fn kill(&self, sig: Signal) -> Result<()> {
        signal::kill(self.pid, sig).map_err(|e| Error::Io(e.into()))
    }

    /// Switch to the tokio form. Must be called within a tokio runtime.
    pub fn into_async(self) -> io::Result<AsyncChannel> {
        self.stream.set_nonblocking(true)?;
        Ok(AsyncChannel {
            id: self.id,
            pid: self.pid,
            stream: tokio::net::UnixStream::from_std(self.stream)?,
        })
    }
}

impl Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Read for &Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.stream.write_vectored(bufs)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Write for &Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.stream).flush()
    }
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Tokio form of a [`Channel`], for use inside async code.
///
/// Convert back with [`AsyncChannel::into_sync`] before closing.
#[derive(Debug)]
pub struct AsyncChannel {
    id: ChannelId,
    pid: Pid,
    stream: tokio::net::UnixStream,
}

impl AsyncChannel {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    pub fn into_sync(self) -> io::Result<Channel> {
        let stream = self.stream.into_std()?;
        stream.set_nonblocking(false)?;
        Ok(Channel::new(self.id, self.pid, stream))
    }

    pub(crate) fn into_parts(self) -> (ChannelId, Pid, tokio::net::UnixStream) {
        (self.id, self.pid, self.stream)
    }

    pub(crate) fn from_parts(id: ChannelId, pid: Pid, stream: tokio::net::UnixStream) -> Self {
        Self { id, pid, stream }
    }
}

impl AsyncRead for AsyncChannel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for AsyncChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    /// Shuts down the write direction only; reads keep working.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

impl AsFd for AsyncChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}
