//! Bidirectional pump between a local TCP socket and a channel.

use std::{io, sync::Arc, time::Duration};

use rs_types::ForwardTuning;
use tokio::{net::TcpStream, time::Instant};
use tracing::{debug, trace};

use crate::{
    CancelFlag,
    SessionResult,
    channel::Channel,
    engine::{Engine, StreamId},
    session::Session,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PumpExit {
    SourceClosed,
    Cancelled,
}

#[derive(Debug)]
struct PumpReport {
    direction: &'static str,
    exit: PumpExit,
    bytes: u64,
    idle: Duration,
}

struct Pump {
    direction: &'static str,
    buf: Vec<u8>,
    cycle_cap: usize,
    moved_in_cycle: usize,
    bytes: u64,
    last_activity: Instant,
}

impl Pump {
    fn new(direction: &'static str, tuning: &ForwardTuning) -> Self {
        Self {
            direction,
            buf: vec![0u8; tuning.buffer_size.max(1)],
            cycle_cap: tuning.cycle_byte_cap.max(1),
            moved_in_cycle: 0,
            bytes: 0,
            last_activity: Instant::now(),
        }
    }

    /// Account for `count` moved bytes. Returns true once the per-cycle cap is
    /// reached and the pump should yield to the opposite direction.
    fn record(&mut self, count: usize) -> bool {
        self.bytes += count as u64;
        self.last_activity = Instant::now();
        self.moved_in_cycle += count;
        if self.moved_in_cycle >= self.cycle_cap {
            self.moved_in_cycle = 0;
            true
        } else {
            false
        }
    }

    fn idle(&mut self) {
        self.moved_in_cycle = 0;
    }

    fn finish(self, exit: PumpExit) -> PumpReport {
        PumpReport {
            direction: self.direction,
            exit,
            bytes: self.bytes,
            idle: self.last_activity.elapsed(),
        }
    }
}

/// Pump bytes both ways until either side closes, a pump fails, the forward
/// is cancelled, or the session disconnects. Closes the channel and the
/// socket before returning.
pub(super) async fn bridge<E: Engine>(session: Arc<Session<E>>, channel: Channel<E>, socket: TcpStream, cancel: CancelFlag) {
    let tuning = session.config().forward.clone();
    let slice = session.config().wait_slice();
    let peer = socket.peer_addr().ok();

    let outcome = tokio::select! {
        report = socket_to_channel(&session, &channel, &socket, &cancel, &tuning, slice) => report,
        report = channel_to_socket(&session, &channel, &socket, &cancel, &tuning, slice) => report,
        () = watch_teardown(&session, &cancel, slice) => Ok(PumpReport {
            direction: "watch",
            exit: PumpExit::Cancelled,
            bytes: 0,
            idle: Duration::ZERO,
        }),
    };
    match outcome {
        Ok(report) => debug!(
            ?peer,
            direction = report.direction,
            exit = ?report.exit,
            bytes = report.bytes,
            idle_ms = report.idle.as_millis() as u64,
            "bridge finished"
        ),
        Err(err) => debug!(?peer, ?err, "bridged connection failed"),
    }

    if let Err(err) = channel.close().await {
        debug!(?peer, ?err, "bridge channel close failed");
    }
    drop(socket);
}

fn should_stop<E: Engine>(session: &Session<E>, cancel: &CancelFlag) -> bool {
    cancel.is_cancelled() || !session.is_connected()
}

/// Resolves once the forward is cancelled or the session disconnects,
/// checking once per slice. Raced against anything that can stall.
pub(super) async fn watch_teardown<E: Engine>(session: &Session<E>, cancel: &CancelFlag, slice: Duration) {
    while !should_stop(session, cancel) {
        tokio::time::sleep(slice).await;
    }
}

async fn socket_to_channel<E: Engine>(
    session: &Session<E>,
    channel: &Channel<E>,
    socket: &TcpStream,
    cancel: &CancelFlag,
    tuning: &ForwardTuning,
    slice: Duration,
) -> SessionResult<PumpReport> {
    let mut pump = Pump::new("socket->channel", tuning);
    loop {
        if should_stop(session, cancel) {
            return Ok(pump.finish(PumpExit::Cancelled));
        }
        match socket.try_read(&mut pump.buf) {
            Ok(0) => return Ok(pump.finish(PumpExit::SourceClosed)),
            Ok(read) => {
                trace!(bytes = read, "socket -> channel");
                channel.write_all(&pump.buf[..read], None).await?;
                if pump.record(read) {
                    tokio::task::yield_now().await;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                pump.idle();
                let _ = tokio::time::timeout(slice, socket.readable()).await;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
}

async fn channel_to_socket<E: Engine>(
    session: &Session<E>,
    channel: &Channel<E>,
    socket: &TcpStream,
    cancel: &CancelFlag,
    tuning: &ForwardTuning,
    slice: Duration,
) -> SessionResult<PumpReport> {
    let mut pump = Pump::new("channel->socket", tuning);
    loop {
        if should_stop(session, cancel) {
            return Ok(pump.finish(PumpExit::Cancelled));
        }
        match channel.try_read(StreamId::Stdout, &mut pump.buf)? {
            Some(0) => return Ok(pump.finish(PumpExit::SourceClosed)),
            Some(read) => {
                trace!(bytes = read, "channel -> socket");
                if !write_socket(session, socket, &pump.buf[..read], cancel, slice).await? {
                    return Ok(pump.finish(PumpExit::Cancelled));
                }
                if pump.record(read) {
                    tokio::task::yield_now().await;
                }
            }
            None => {
                pump.idle();
                session.wait_for_activity(slice).await?;
            }
        }
    }
}

/// Write all of `data` to the socket. Returns false when teardown was
/// requested while the socket was not accepting bytes.
async fn write_socket<E: Engine>(
    session: &Session<E>,
    socket: &TcpStream,
    mut data: &[u8],
    cancel: &CancelFlag,
    slice: Duration,
) -> SessionResult<bool> {
    while !data.is_empty() {
        match socket.try_write(data) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(written) => data = &data[written..],
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                let _ = tokio::time::timeout(slice, socket.writable()).await;
                if should_stop(session, cancel) {
                    return Ok(false);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(true)
}
