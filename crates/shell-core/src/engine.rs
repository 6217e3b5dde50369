//! Contract toward the non-blocking protocol engine.
//!
//! An engine exposes single-attempt operations that either complete, report
//! would-block, or fail. It never waits on its own; the session layer owns
//! waiting, deadlines and serialization. Implementations are driven under the
//! session lock, so a `&mut self` method is never entered concurrently.

use std::{fmt, os::fd::RawFd};

use bitflags::bitflags;

bitflags! {
    /// Socket directions an engine is blocked on, or a poller is asked to watch.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Directions: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// Error reported by an engine attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineFault {
    pub code: i32,
    pub message: String,
}

impl EngineFault {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for EngineFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}) {}", self.code, self.message)
    }
}

/// Outcome of one non-blocking engine call.
#[derive(Debug, PartialEq, Eq)]
pub enum Attempt<T> {
    Ready(T),
    WouldBlock,
    Failed(EngineFault),
}

impl<T> Attempt<T> {
    pub fn is_would_block(&self) -> bool {
        matches!(self, Attempt::WouldBlock)
    }
}

/// Channel substream selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamId {
    Stdout,
    Stderr,
}

/// A non-blocking protocol engine bound to one connected socket.
pub trait Engine: Send + 'static {
    /// Engine-side channel handle. Cloning must not duplicate the channel.
    type Channel: Clone + Send + Sync + 'static;
    /// Engine-side handle for a listener registered on the peer.
    type Listener: Clone + Send + Sync + 'static;

    /// Socket the engine reads from and writes to.
    fn descriptor(&self) -> RawFd;

    fn handshake(&mut self) -> Attempt<()>;

    fn authenticate_password(&mut self, username: &str, password: &str) -> Attempt<()>;

    fn open_session(&mut self) -> Attempt<Self::Channel>;

    fn exec(&mut self, channel: &Self::Channel, command: &str) -> Attempt<()>;

    /// Request a pseudo terminal of `cols` x `rows` for a session channel.
    fn request_pty(&mut self, channel: &Self::Channel, terminal: &str, cols: u32, rows: u32) -> Attempt<()>;

    fn resize_pty(&mut self, channel: &Self::Channel, cols: u32, rows: u32) -> Attempt<()>;

    /// Start the login shell on a session channel.
    fn shell(&mut self, channel: &Self::Channel) -> Attempt<()>;

    fn open_direct_tcpip(
        &mut self,
        target_host: &str,
        target_port: u16,
        origin_host: &str,
        origin_port: u16,
    ) -> Attempt<Self::Channel>;

    /// Forget a direct-tcpip open the caller stopped retrying, so a later
    /// open to the same endpoints starts from scratch.
    fn abandon_direct_tcpip(&mut self, _target_host: &str, _target_port: u16, _origin_host: &str, _origin_port: u16) {}

    /// Ask the peer to listen. Returns the listener and the port it reports.
    fn forward_listen(&mut self, bind_address: Option<&str>, port: u16, backlog: u32) -> Attempt<(Self::Listener, u16)>;

    fn forward_accept(&mut self, listener: &Self::Listener) -> Attempt<Self::Channel>;

    fn forward_cancel(&mut self, listener: &Self::Listener) -> Attempt<()>;

    /// Read from one substream. `Ready(0)` means the substream reached EOF.
    fn channel_read(&mut self, channel: &Self::Channel, stream: StreamId, buf: &mut [u8]) -> Attempt<usize>;

    /// Write as much of `buf` as the peer window accepts.
    fn channel_write(&mut self, channel: &Self::Channel, buf: &[u8]) -> Attempt<usize>;

    fn channel_eof(&mut self, channel: &Self::Channel) -> bool;

    fn channel_exit_status(&mut self, channel: &Self::Channel) -> Option<i32>;

    fn channel_send_eof(&mut self, channel: &Self::Channel) -> Attempt<()>;

    fn channel_close(&mut self, channel: &Self::Channel) -> Attempt<()>;

    fn channel_wait_closed(&mut self, channel: &Self::Channel) -> Attempt<()>;

    fn channel_free(&mut self, channel: &Self::Channel) -> Attempt<()>;

    fn keepalive(&mut self) -> Attempt<()>;

    fn disconnect(&mut self, description: &str);

    /// Directions the last would-block was waiting on. May be empty.
    fn block_directions(&self) -> Directions;

    /// Most recent failure. Consulted when a failed attempt carries no message.
    fn last_error(&self) -> EngineFault;
}
