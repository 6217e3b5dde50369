//! Remote side of the loopback engine: channel buffers and the tasks that
//! move bytes between them and real TCP sockets.

use std::{
    collections::{HashMap, VecDeque},
    io::Write,
    os::unix::net::UnixStream,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener,
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::Handle,
    sync::Notify,
    task::JoinHandle,
};
use tracing::{debug, trace};

/// Bytes the peer buffers per direction before pushing back.
pub(super) const WINDOW: usize = 2 * 1024 * 1024;
const READ_CHUNK: usize = 32 * 1024;
const WRITE_CHUNK: usize = 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct Pty {
    pub terminal: String,
    pub cols: u32,
    pub rows: u32,
}

#[derive(Debug, Default)]
pub(super) struct ChannelState {
    pub stdout: VecDeque<u8>,
    pub stderr: VecDeque<u8>,
    /// The peer will produce no more data.
    pub remote_eof: bool,
    /// Written by the session, not yet consumed by the peer.
    pub outbound: VecDeque<u8>,
    pub local_eof: bool,
    pub local_closed: bool,
    /// Whatever consumes `outbound` has stopped; the peer side is closed.
    pub consumer_done: bool,
    /// An exec or shell request was accepted.
    pub exec_started: bool,
    pub pty: Option<Pty>,
    pub exit_status: Option<i32>,
    pub broken: Option<String>,
}

impl ChannelState {
    /// Queue a command's output. A pty carries stderr on stdout.
    pub fn deliver(&mut self, output: CommandOutput) {
        self.stdout.extend(output.stdout);
        if self.pty.is_some() {
            self.stdout.extend(output.stderr);
        } else {
            self.stderr.extend(output.stderr);
        }
    }
}

#[derive(Debug, Default)]
pub(super) struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: i32,
}

/// Run one builtin command line. `cat` is handled by the caller.
pub(super) fn run_command(line: &str, pty: Option<&Pty>) -> CommandOutput {
    let mut words = line.split_whitespace();
    let program = words.next().unwrap_or_default();
    let args: Vec<&str> = words.collect();
    let mut output = CommandOutput::default();
    match (program, args.as_slice()) {
        ("echo", _) => output.stdout = format!("{}\n", args.join(" ")).into_bytes(),
        ("fail", [code, message @ ..]) => {
            output.stderr = format!("{}\n", message.join(" ")).into_bytes();
            output.status = code.parse().unwrap_or(1);
        }
        ("fail", []) => output.status = 1,
        ("stty", ["size"]) => match pty {
            Some(pty) => output.stdout = format!("{} {}\n", pty.rows, pty.cols).into_bytes(),
            None => {
                output.stderr = b"stty: not a tty\n".to_vec();
                output.status = 1;
            }
        },
        ("printenv", ["TERM"]) => match pty {
            Some(pty) => output.stdout = format!("{}\n", pty.terminal).into_bytes(),
            None => output.status = 1,
        },
        (other, _) => {
            output.stderr = format!("{other}: command not found\n").into_bytes();
            output.status = 127;
        }
    }
    output
}

#[derive(Default)]
pub(super) struct ChannelSlot {
    state: Mutex<ChannelState>,
    pub inbound_space: Notify,
    pub outbound_ready: Notify,
    pub closed: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChannelSlot {
    fn with_state(state: ChannelState) -> Self {
        Self {
            state: Mutex::new(state),
            ..Self::default()
        }
    }

    pub fn state(&self) -> MutexGuard<'_, ChannelState> {
        lock(&self.state)
    }

    fn track(&self, task: JoinHandle<()>) {
        lock(&self.tasks).push(task);
    }

    fn abort_tasks(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

/// Listener the peer runs on behalf of a remote forward.
pub(super) struct PeerListener {
    pub incoming: Arc<Mutex<VecDeque<u64>>>,
    pub task: JoinHandle<()>,
}

impl PeerListener {
    pub fn pop(&self) -> Option<u64> {
        lock(&self.incoming).pop_front()
    }
}

pub(super) struct Peer {
    doorbell: UnixStream,
    runtime: Handle,
    channels: Mutex<HashMap<u64, Arc<ChannelSlot>>>,
    next_id: AtomicU64,
}

impl Peer {
    pub fn new(doorbell: UnixStream, runtime: Handle) -> Self {
        Self {
            doorbell,
            runtime,
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Make the session socket readable. A full socket buffer already is.
    pub fn ring(&self) {
        let _ = (&self.doorbell).write(&[1]);
    }

    pub fn get(&self, id: u64) -> Option<Arc<ChannelSlot>> {
        lock(&self.channels).get(&id).cloned()
    }

    fn insert(&self, slot: ChannelSlot) -> (u64, Arc<ChannelSlot>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(slot);
        lock(&self.channels).insert(id, slot.clone());
        (id, slot)
    }

    /// A channel with nothing on the peer side consuming its input.
    pub fn open_idle(&self) -> u64 {
        let (id, _) = self.insert(ChannelSlot::with_state(ChannelState {
            consumer_done: true,
            ..ChannelState::default()
        }));
        id
    }

    pub fn free(&self, id: u64) -> bool {
        let slot = lock(&self.channels).remove(&id);
        match slot {
            Some(slot) => {
                slot.abort_tasks();
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let slots: Vec<_> = lock(&self.channels).drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            slot.abort_tasks();
        }
    }

    /// Channel backed by a real TCP connection on the peer side.
    pub fn attach_tcp(self: &Arc<Self>, stream: TcpStream) -> u64 {
        stream.set_nodelay(true).ok();
        let (reader, writer) = stream.into_split();
        let (id, slot) = self.insert(ChannelSlot::default());
        slot.track(self.runtime.spawn(pump_inbound(self.clone(), slot.clone(), reader)));
        slot.track(self.runtime.spawn(pump_outbound(self.clone(), slot.clone(), writer)));
        trace!(channel = id, "loopback channel attached to tcp stream");
        id
    }

    /// Echo everything the session writes back on stdout until it sends EOF.
    pub fn start_cat(self: &Arc<Self>, slot: &Arc<ChannelSlot>) {
        slot.state().consumer_done = false;
        slot.track(self.runtime.spawn(run_cat(self.clone(), slot.clone())));
    }

    /// Line-oriented shell: runs one builtin per input line until `exit`,
    /// EOF or close.
    pub fn start_shell(self: &Arc<Self>, slot: &Arc<ChannelSlot>) {
        slot.state().consumer_done = false;
        slot.track(self.runtime.spawn(run_shell(self.clone(), slot.clone())));
    }

    pub fn listen(self: &Arc<Self>, listener: TcpListener) -> PeerListener {
        let incoming = Arc::new(Mutex::new(VecDeque::new()));
        let task = self.runtime.spawn(accept_loop(self.clone(), listener, incoming.clone()));
        PeerListener { incoming, task }
    }
}

async fn pump_inbound(peer: Arc<Peer>, slot: Arc<ChannelSlot>, mut reader: OwnedReadHalf) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        while slot.state().stdout.len() >= WINDOW {
            slot.inbound_space.notified().await;
        }
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => {
                slot.state().remote_eof = true;
                peer.ring();
                break;
            }
            Ok(read) => {
                slot.state().stdout.extend(&buf[..read]);
                peer.ring();
            }
        }
    }
}

enum OutboundStep {
    Write(Vec<u8>),
    Idle,
    Eof,
    Close,
}

async fn pump_outbound(peer: Arc<Peer>, slot: Arc<ChannelSlot>, mut writer: OwnedWriteHalf) {
    loop {
        let step = {
            let mut state = slot.state();
            if state.local_closed {
                OutboundStep::Close
            } else if !state.outbound.is_empty() {
                let take = state.outbound.len().min(WRITE_CHUNK);
                OutboundStep::Write(state.outbound.drain(..take).collect())
            } else if state.local_eof {
                OutboundStep::Eof
            } else {
                OutboundStep::Idle
            }
        };
        match step {
            OutboundStep::Write(data) => {
                // Window space just opened up.
                peer.ring();
                tokio::select! {
                    result = writer.write_all(&data) => {
                        if let Err(err) = result {
                            slot.state().broken = Some(err.to_string());
                            break;
                        }
                    }
                    () = slot.closed.notified() => break,
                }
            }
            OutboundStep::Idle => slot.outbound_ready.notified().await,
            OutboundStep::Eof => {
                let _ = writer.shutdown().await;
                break;
            }
            OutboundStep::Close => break,
        }
    }
    slot.state().consumer_done = true;
    peer.ring();
}

enum CatStep {
    Moved,
    WaitSpace,
    WaitInput,
    Done,
}

async fn run_cat(peer: Arc<Peer>, slot: Arc<ChannelSlot>) {
    loop {
        let step = {
            let mut state = slot.state();
            let space = WINDOW.saturating_sub(state.stdout.len());
            if state.local_closed {
                CatStep::Done
            } else if !state.outbound.is_empty() && space > 0 {
                let take = state.outbound.len().min(space);
                let moved: Vec<u8> = state.outbound.drain(..take).collect();
                state.stdout.extend(moved);
                CatStep::Moved
            } else if !state.outbound.is_empty() {
                CatStep::WaitSpace
            } else if state.local_eof {
                CatStep::Done
            } else {
                CatStep::WaitInput
            }
        };
        match step {
            CatStep::Moved => peer.ring(),
            CatStep::WaitSpace => slot.inbound_space.notified().await,
            CatStep::WaitInput => slot.outbound_ready.notified().await,
            CatStep::Done => break,
        }
    }
    {
        let mut state = slot.state();
        state.remote_eof = true;
        state.exit_status.get_or_insert(0);
        state.consumer_done = true;
    }
    peer.ring();
}

enum ShellStep {
    Line(String),
    WaitInput,
    Done,
}

async fn run_shell(peer: Arc<Peer>, slot: Arc<ChannelSlot>) {
    let mut status = 0;
    loop {
        let step = {
            let mut state = slot.state();
            if state.local_closed {
                ShellStep::Done
            } else if let Some(end) = state.outbound.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = state.outbound.drain(..=end).collect();
                ShellStep::Line(String::from_utf8_lossy(&line).into_owned())
            } else if state.local_eof && !state.outbound.is_empty() {
                let line: Vec<u8> = state.outbound.drain(..).collect();
                ShellStep::Line(String::from_utf8_lossy(&line).into_owned())
            } else if state.local_eof {
                ShellStep::Done
            } else {
                ShellStep::WaitInput
            }
        };
        match step {
            ShellStep::Line(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let mut words = line.split_whitespace();
                if words.next() == Some("exit") {
                    status = words.next().and_then(|code| code.parse().ok()).unwrap_or(status);
                    break;
                }
                let mut state = slot.state();
                let output = run_command(line, state.pty.as_ref());
                status = output.status;
                state.deliver(output);
                drop(state);
                peer.ring();
            }
            ShellStep::WaitInput => slot.outbound_ready.notified().await,
            ShellStep::Done => break,
        }
    }
    {
        let mut state = slot.state();
        state.remote_eof = true;
        state.exit_status.get_or_insert(status);
        state.consumer_done = true;
    }
    trace!(status, "loopback shell exited");
    peer.ring();
}

async fn accept_loop(peer: Arc<Peer>, listener: TcpListener, incoming: Arc<Mutex<VecDeque<u64>>>) {
    loop {
        match listener.accept().await {
            Ok((stream, origin)) => {
                let id = peer.attach_tcp(stream);
                lock(&incoming).push_back(id);
                trace!(channel = id, %origin, "loopback listener accepted connection");
                peer.ring();
            }
            Err(err) => {
                debug!(?err, "loopback listener accept failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}
