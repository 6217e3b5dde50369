//! In-process reference engine.
//!
//! The simulated peer is the local machine: direct channels connect to real
//! TCP targets and remote listeners bind real localhost ports. The session
//! descriptor is one end of a Unix socket pair; the peer writes a doorbell
//! byte to the other end whenever its state changes, and every attempt drains
//! the doorbell before looking at that state. Would-block and readiness
//! therefore behave the way they do against a real non-blocking engine.

use std::{
    collections::HashMap,
    io::{self, Read},
    os::{
        fd::{AsRawFd, RawFd},
        unix::net::UnixStream,
    },
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use secrecy::{ExposeSecret, SecretString};
use tokio::{net::TcpStream, runtime::Handle, task::JoinHandle};
use tracing::{debug, trace};

use crate::engine::{Attempt, Directions, Engine, EngineFault, StreamId};

mod peer;

use peer::{Peer, PeerListener, Pty, WINDOW};

pub const SOCKET_DISCONNECT: i32 = -13;
pub const AUTHENTICATION_FAILED: i32 = -18;
pub const CHANNEL_FAILURE: i32 = -21;
pub const CHANNEL_UNKNOWN: i32 = -23;
pub const CHANNEL_CLOSED: i32 = -26;
pub const CHANNEL_EOF_SENT: i32 = -27;
pub const REQUEST_DENIED: i32 = -32;
pub const INVALID_REQUEST: i32 = -34;

/// Channel handle issued by [`LoopbackEngine`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LoopbackChannel(u64);

/// Remote listener handle issued by [`LoopbackEngine`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LoopbackListener(u64);

/// Fault injection and counters shared with tests.
#[derive(Debug, Default)]
pub struct LoopbackControls {
    handshake_stalls: AtomicU32,
    handshake_blocked: AtomicBool,
    handshake_attempts: AtomicU32,
    keepalives_fail: AtomicBool,
    keepalives_sent: AtomicU32,
    close_held: AtomicBool,
    terse_faults: AtomicBool,
}

impl LoopbackControls {
    /// Make the next `times` handshake attempts report would-block. Each
    /// stall rings the doorbell, so the retry wakes immediately.
    pub fn stall_handshake(&self, times: u32) {
        self.handshake_stalls.store(times, Ordering::SeqCst);
    }

    /// Keep the handshake blocked without ever signalling readiness.
    pub fn block_handshake(&self, blocked: bool) {
        self.handshake_blocked.store(blocked, Ordering::SeqCst);
    }

    pub fn handshake_attempts(&self) -> u32 {
        self.handshake_attempts.load(Ordering::SeqCst)
    }

    pub fn fail_keepalives(&self, fail: bool) {
        self.keepalives_fail.store(fail, Ordering::SeqCst);
    }

    pub fn keepalives_sent(&self) -> u32 {
        self.keepalives_sent.load(Ordering::SeqCst)
    }

    /// Never acknowledge a channel close while set.
    pub fn hold_close(&self, held: bool) {
        self.close_held.store(held, Ordering::SeqCst);
    }

    /// Report failures with an empty message, leaving the detail to
    /// `last_error`.
    pub fn terse_faults(&self, terse: bool) {
        self.terse_faults.store(terse, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Fresh,
    Handshaken,
    Authenticated,
    Disconnected,
}

type OpenResult = Arc<Mutex<Option<io::Result<TcpStream>>>>;

/// Identifies one direct-tcpip request across its retries.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct OpenKey {
    target_host: String,
    target_port: u16,
    origin_host: String,
    origin_port: u16,
}

impl OpenKey {
    fn new(target_host: &str, target_port: u16, origin_host: &str, origin_port: u16) -> Self {
        Self {
            target_host: target_host.to_string(),
            target_port,
            origin_host: origin_host.to_string(),
            origin_port,
        }
    }
}

struct PendingOpen {
    result: OpenResult,
    task: JoinHandle<()>,
}

pub struct LoopbackEngine {
    socket: UnixStream,
    peer: Arc<Peer>,
    username: String,
    password: SecretString,
    controls: Arc<LoopbackControls>,
    phase: Phase,
    pending_opens: HashMap<OpenKey, PendingOpen>,
    listeners: HashMap<u64, PeerListener>,
    next_listener: u64,
    last_error: EngineFault,
}

impl LoopbackEngine {
    /// Create an engine accepting `username`/`password`. Must be called from
    /// within a tokio runtime.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> io::Result<Self> {
        let runtime = Handle::try_current().map_err(io::Error::other)?;
        let password: String = password.into();
        let (socket, doorbell) = UnixStream::pair()?;
        socket.set_nonblocking(true)?;
        doorbell.set_nonblocking(true)?;
        Ok(Self {
            socket,
            peer: Arc::new(Peer::new(doorbell, runtime)),
            username: username.into(),
            password: SecretString::from(password),
            controls: Arc::new(LoopbackControls::default()),
            phase: Phase::Fresh,
            pending_opens: HashMap::new(),
            listeners: HashMap::new(),
            next_listener: 1,
            last_error: EngineFault::new(0, "no error"),
        })
    }

    pub fn controls(&self) -> Arc<LoopbackControls> {
        self.controls.clone()
    }

    fn drain_doorbell(&self) {
        let mut scratch = [0u8; 64];
        while let Ok(read) = (&self.socket).read(&mut scratch) {
            if read == 0 {
                break;
            }
        }
    }

    /// Record a failure as the last error and return what the caller sees.
    fn fault(&mut self, code: i32, message: impl Into<String>) -> EngineFault {
        self.last_error = EngineFault::new(code, message);
        if self.controls.terse_faults.load(Ordering::SeqCst) {
            EngineFault::new(code, "")
        } else {
            self.last_error.clone()
        }
    }

    fn fail<T>(&mut self, code: i32, message: impl Into<String>) -> Attempt<T> {
        Attempt::Failed(self.fault(code, message))
    }

    /// Drain the doorbell and check the engine may serve requests.
    fn begin(&mut self, needed: Phase) -> Result<(), EngineFault> {
        self.drain_doorbell();
        let (code, message) = match (self.phase, needed) {
            (Phase::Disconnected, _) => (SOCKET_DISCONNECT, "session is disconnected"),
            (Phase::Fresh, Phase::Handshaken | Phase::Authenticated) => (INVALID_REQUEST, "handshake has not completed"),
            (Phase::Handshaken, Phase::Authenticated) => (AUTHENTICATION_FAILED, "session is not authenticated"),
            _ => return Ok(()),
        };
        Err(self.fault(code, message))
    }

    fn slot(&mut self, channel: &LoopbackChannel) -> Result<Arc<peer::ChannelSlot>, EngineFault> {
        self.begin(Phase::Authenticated)?;
        match self.peer.get(channel.0) {
            Some(slot) => Ok(slot),
            None => Err(self.fault(CHANNEL_UNKNOWN, format!("unknown channel {}", channel.0))),
        }
    }

    fn run_builtin(&self, slot: &Arc<peer::ChannelSlot>, command: &str) {
        if command.split_whitespace().next() == Some("cat") {
            self.peer.start_cat(slot);
            return;
        }
        let mut state = slot.state();
        let output = peer::run_command(command, state.pty.as_ref());
        state.exit_status = Some(output.status);
        state.deliver(output);
        state.remote_eof = true;
    }

    fn teardown(&mut self) {
        for (_, open) in self.pending_opens.drain() {
            open.task.abort();
        }
        for (_, listener) in self.listeners.drain() {
            listener.task.abort();
        }
        self.peer.clear();
    }
}

macro_rules! begin_or_fail {
    ($engine:expr, $phase:expr) => {
        if let Err(fault) = $engine.begin($phase) {
            return Attempt::Failed(fault);
        }
    };
}

macro_rules! slot_or_fail {
    ($engine:expr, $channel:expr) => {
        match $engine.slot($channel) {
            Ok(slot) => slot,
            Err(fault) => return Attempt::Failed(fault),
        }
    };
}

impl Engine for LoopbackEngine {
    type Channel = LoopbackChannel;
    type Listener = LoopbackListener;

    fn descriptor(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn handshake(&mut self) -> Attempt<()> {
        begin_or_fail!(self, Phase::Fresh);
        self.controls.handshake_attempts.fetch_add(1, Ordering::SeqCst);
        if self.phase != Phase::Fresh {
            return Attempt::Ready(());
        }
        if self.controls.handshake_blocked.load(Ordering::SeqCst) {
            return Attempt::WouldBlock;
        }
        let stalled = self
            .controls
            .handshake_stalls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if stalled {
            self.peer.ring();
            return Attempt::WouldBlock;
        }
        self.phase = Phase::Handshaken;
        trace!("loopback handshake complete");
        Attempt::Ready(())
    }

    fn authenticate_password(&mut self, username: &str, password: &str) -> Attempt<()> {
        begin_or_fail!(self, Phase::Handshaken);
        if username == self.username && password == self.password.expose_secret() {
            self.phase = Phase::Authenticated;
            Attempt::Ready(())
        } else {
            self.fail(AUTHENTICATION_FAILED, format!("password rejected for {username}"))
        }
    }

    fn open_session(&mut self) -> Attempt<LoopbackChannel> {
        begin_or_fail!(self, Phase::Authenticated);
        Attempt::Ready(LoopbackChannel(self.peer.open_idle()))
    }

    fn exec(&mut self, channel: &LoopbackChannel, command: &str) -> Attempt<()> {
        let slot = slot_or_fail!(self, channel);
        if std::mem::replace(&mut slot.state().exec_started, true) {
            return self.fail(REQUEST_DENIED, "channel already runs a command");
        }
        self.run_builtin(&slot, command);
        Attempt::Ready(())
    }

    fn request_pty(&mut self, channel: &LoopbackChannel, terminal: &str, cols: u32, rows: u32) -> Attempt<()> {
        let slot = slot_or_fail!(self, channel);
        let mut state = slot.state();
        if state.exec_started {
            drop(state);
            return self.fail(REQUEST_DENIED, "pty requested after the channel started a command");
        }
        state.pty = Some(Pty {
            terminal: terminal.to_string(),
            cols,
            rows,
        });
        Attempt::Ready(())
    }

    fn resize_pty(&mut self, channel: &LoopbackChannel, cols: u32, rows: u32) -> Attempt<()> {
        let slot = slot_or_fail!(self, channel);
        let resized = match slot.state().pty.as_mut() {
            Some(pty) => {
                pty.cols = cols;
                pty.rows = rows;
                true
            }
            None => false,
        };
        if resized { Attempt::Ready(()) } else { self.fail(REQUEST_DENIED, "channel has no pty") }
    }

    fn shell(&mut self, channel: &LoopbackChannel) -> Attempt<()> {
        let slot = slot_or_fail!(self, channel);
        if std::mem::replace(&mut slot.state().exec_started, true) {
            return self.fail(REQUEST_DENIED, "channel already runs a command");
        }
        self.peer.start_shell(&slot);
        Attempt::Ready(())
    }

    fn open_direct_tcpip(
        &mut self,
        target_host: &str,
        target_port: u16,
        origin_host: &str,
        origin_port: u16,
    ) -> Attempt<LoopbackChannel> {
        begin_or_fail!(self, Phase::Authenticated);
        let key = OpenKey::new(target_host, target_port, origin_host, origin_port);
        if let Some(open) = self.pending_opens.get(&key) {
            let Some(result) = open.result.lock().unwrap_or_else(PoisonError::into_inner).take() else {
                return Attempt::WouldBlock;
            };
            self.pending_opens.remove(&key);
            return match result {
                Ok(stream) => Attempt::Ready(LoopbackChannel(self.peer.attach_tcp(stream))),
                Err(err) => self.fail(
                    CHANNEL_FAILURE,
                    format!("connect to {target_host}:{target_port} failed: {err}"),
                ),
            };
        }

        trace!(target_host, target_port, origin_host, origin_port, "loopback direct-tcpip requested");
        let result: OpenResult = Arc::default();
        let task = {
            let result = result.clone();
            let peer = self.peer.clone();
            let (host, port) = (key.target_host.clone(), key.target_port);
            self.peer.runtime().spawn(async move {
                let outcome = TcpStream::connect((host.as_str(), port)).await;
                *result.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
                peer.ring();
            })
        };
        self.pending_opens.insert(key, PendingOpen { result, task });
        Attempt::WouldBlock
    }

    fn abandon_direct_tcpip(&mut self, target_host: &str, target_port: u16, origin_host: &str, origin_port: u16) {
        let key = OpenKey::new(target_host, target_port, origin_host, origin_port);
        if let Some(open) = self.pending_opens.remove(&key) {
            open.task.abort();
            trace!(target_host, target_port, origin_host, origin_port, "loopback direct-tcpip abandoned");
        }
    }

    fn forward_listen(&mut self, bind_address: Option<&str>, port: u16, backlog: u32) -> Attempt<(LoopbackListener, u16)> {
        begin_or_fail!(self, Phase::Authenticated);
        let host = bind_address.filter(|host| !host.is_empty()).unwrap_or("127.0.0.1");
        let bound = std::net::TcpListener::bind((host, port)).and_then(|listener| {
            listener.set_nonblocking(true)?;
            let _runtime = self.peer.runtime().enter();
            tokio::net::TcpListener::from_std(listener)
        });
        let listener = match bound {
            Ok(listener) => listener,
            Err(err) => return self.fail(REQUEST_DENIED, format!("cannot listen on {host}:{port}: {err}")),
        };
        let bound_port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(err) => return self.fail(REQUEST_DENIED, err.to_string()),
        };
        let id = self.next_listener;
        self.next_listener += 1;
        self.listeners.insert(id, self.peer.listen(listener));
        debug!(host, bound_port, backlog, "loopback remote listener bound");
        Attempt::Ready((LoopbackListener(id), bound_port))
    }

    fn forward_accept(&mut self, listener: &LoopbackListener) -> Attempt<LoopbackChannel> {
        begin_or_fail!(self, Phase::Authenticated);
        match self.listeners.get(&listener.0) {
            Some(peer_listener) => match peer_listener.pop() {
                Some(id) => Attempt::Ready(LoopbackChannel(id)),
                None => Attempt::WouldBlock,
            },
            None => self.fail(INVALID_REQUEST, format!("unknown listener {}", listener.0)),
        }
    }

    fn forward_cancel(&mut self, listener: &LoopbackListener) -> Attempt<()> {
        begin_or_fail!(self, Phase::Authenticated);
        let Some(peer_listener) = self.listeners.remove(&listener.0) else {
            return self.fail(INVALID_REQUEST, format!("unknown listener {}", listener.0));
        };
        peer_listener.task.abort();
        while let Some(id) = peer_listener.pop() {
            self.peer.free(id);
        }
        Attempt::Ready(())
    }

    fn channel_read(&mut self, channel: &LoopbackChannel, stream: StreamId, buf: &mut [u8]) -> Attempt<usize> {
        let slot = slot_or_fail!(self, channel);
        let read = {
            let mut state = slot.state();
            let remote_eof = state.remote_eof;
            let queue = match stream {
                StreamId::Stdout => &mut state.stdout,
                StreamId::Stderr => &mut state.stderr,
            };
            if queue.is_empty() {
                return if remote_eof { Attempt::Ready(0) } else { Attempt::WouldBlock };
            }
            let read = queue.len().min(buf.len());
            for (dst, src) in buf.iter_mut().zip(queue.drain(..read)) {
                *dst = src;
            }
            read
        };
        slot.inbound_space.notify_one();
        Attempt::Ready(read)
    }

    fn channel_write(&mut self, channel: &LoopbackChannel, buf: &[u8]) -> Attempt<usize> {
        let slot = slot_or_fail!(self, channel);
        let written = {
            let mut state = slot.state();
            if let Some(reason) = state.broken.clone() {
                drop(state);
                return self.fail(CHANNEL_CLOSED, reason);
            }
            if state.local_eof || state.local_closed {
                drop(state);
                return self.fail(CHANNEL_EOF_SENT, "channel no longer accepts data");
            }
            let space = WINDOW.saturating_sub(state.outbound.len());
            if space == 0 {
                return Attempt::WouldBlock;
            }
            let written = space.min(buf.len());
            state.outbound.extend(&buf[..written]);
            written
        };
        slot.outbound_ready.notify_one();
        Attempt::Ready(written)
    }

    fn channel_eof(&mut self, channel: &LoopbackChannel) -> bool {
        match self.slot(channel) {
            Ok(slot) => {
                let state = slot.state();
                state.remote_eof && state.stdout.is_empty() && state.stderr.is_empty()
            }
            Err(_) => true,
        }
    }

    fn channel_exit_status(&mut self, channel: &LoopbackChannel) -> Option<i32> {
        self.slot(channel).ok().and_then(|slot| slot.state().exit_status)
    }

    fn channel_send_eof(&mut self, channel: &LoopbackChannel) -> Attempt<()> {
        let slot = slot_or_fail!(self, channel);
        slot.state().local_eof = true;
        slot.outbound_ready.notify_one();
        Attempt::Ready(())
    }

    fn channel_close(&mut self, channel: &LoopbackChannel) -> Attempt<()> {
        let slot = slot_or_fail!(self, channel);
        slot.state().local_closed = true;
        slot.outbound_ready.notify_one();
        slot.inbound_space.notify_one();
        slot.closed.notify_one();
        Attempt::Ready(())
    }

    fn channel_wait_closed(&mut self, channel: &LoopbackChannel) -> Attempt<()> {
        let slot = slot_or_fail!(self, channel);
        if self.controls.close_held.load(Ordering::SeqCst) {
            return Attempt::WouldBlock;
        }
        let state = slot.state();
        if !state.local_closed {
            drop(state);
            return self.fail(INVALID_REQUEST, "channel close has not been sent");
        }
        if state.consumer_done { Attempt::Ready(()) } else { Attempt::WouldBlock }
    }

    fn channel_free(&mut self, channel: &LoopbackChannel) -> Attempt<()> {
        self.drain_doorbell();
        self.peer.free(channel.0);
        Attempt::Ready(())
    }

    fn keepalive(&mut self) -> Attempt<()> {
        begin_or_fail!(self, Phase::Handshaken);
        if self.controls.keepalives_fail.load(Ordering::SeqCst) {
            return self.fail(SOCKET_DISCONNECT, "keepalive was not acknowledged");
        }
        self.controls.keepalives_sent.fetch_add(1, Ordering::SeqCst);
        Attempt::Ready(())
    }

    fn disconnect(&mut self, description: &str) {
        if self.phase == Phase::Disconnected {
            return;
        }
        self.phase = Phase::Disconnected;
        self.teardown();
        debug!(description, "loopback session disconnected");
    }

    fn block_directions(&self) -> Directions {
        Directions::READ
    }

    fn last_error(&self) -> EngineFault {
        self.last_error.clone()
    }
}

impl Drop for LoopbackEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
#[path = "loopback_tests.rs"]
mod tests;
