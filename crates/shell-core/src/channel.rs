//! Channel I/O adapter.
//!
//! Wraps an engine channel with reads, writes and a bounded close sequence,
//! all driven through the owning session's retry primitive.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::time::Instant;
use tracing::{debug, error};

use crate::{
    SessionError,
    SessionResult,
    engine::{Attempt, Engine, StreamId},
    session::Session,
};

type CloseStep<E> = fn(&mut E, &<E as Engine>::Channel) -> Attempt<()>;

pub struct Channel<E: Engine> {
    session: Arc<Session<E>>,
    raw: E::Channel,
    closed: AtomicBool,
}

impl<E: Engine> Channel<E> {
    pub(crate) fn new(session: Arc<Session<E>>, raw: E::Channel) -> Self {
        Self {
            session,
            raw,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn raw(&self) -> &E::Channel {
        &self.raw
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Single non-blocking read. `None` means nothing is buffered yet;
    /// `Some(0)` means the substream reached EOF.
    pub fn try_read(&self, stream: StreamId, buf: &mut [u8]) -> SessionResult<Option<usize>> {
        match self.session.with_engine(|engine| engine.channel_read(&self.raw, stream, buf))? {
            Attempt::Ready(read) => {
                self.session.note_progress();
                Ok(Some(read))
            }
            Attempt::WouldBlock => Ok(None),
            Attempt::Failed(fault) => Err(SessionError::channel(self.session.describe_fault(fault))),
        }
    }

    /// Read at least one byte (or EOF), waiting until `deadline`.
    pub async fn read(&self, stream: StreamId, buf: &mut [u8], deadline: Option<Instant>) -> SessionResult<usize> {
        let attempt = self
            .session
            .retrying(
                deadline,
                None,
                |engine| engine.channel_read(&self.raw, stream, buf),
                Attempt::is_would_block,
            )
            .await?;
        match attempt {
            Attempt::Ready(read) => Ok(read),
            Attempt::Failed(fault) => Err(SessionError::channel(self.session.describe_fault(fault))),
            Attempt::WouldBlock => Err(SessionError::Timeout),
        }
    }

    /// Write all of `buf`, waiting out flow control between partial writes.
    /// An empty buffer is a no-op.
    pub async fn write_all(&self, buf: &[u8], deadline: Option<Instant>) -> SessionResult<()> {
        let mut written = 0;
        while written < buf.len() {
            match self.session.with_engine(|engine| engine.channel_write(&self.raw, &buf[written..]))? {
                Attempt::Ready(0) | Attempt::WouldBlock => self.session.wait_for_engine(deadline).await?,
                Attempt::Ready(count) => {
                    written += count;
                    self.session.note_progress();
                }
                Attempt::Failed(fault) => return Err(SessionError::channel(self.session.describe_fault(fault))),
            }
        }
        Ok(())
    }

    /// Tell the peer no more data follows. The channel stays readable.
    pub async fn send_eof(&self, deadline: Option<Instant>) -> SessionResult<()> {
        let attempt = self
            .session
            .retrying(
                deadline,
                None,
                |engine| engine.channel_send_eof(&self.raw),
                Attempt::is_would_block,
            )
            .await?;
        match attempt {
            Attempt::Ready(()) => Ok(()),
            Attempt::Failed(fault) => Err(SessionError::channel(self.session.describe_fault(fault))),
            Attempt::WouldBlock => Err(SessionError::Timeout),
        }
    }

    pub fn is_eof(&self) -> SessionResult<bool> {
        self.session.with_engine(|engine| engine.channel_eof(&self.raw))
    }

    pub fn exit_status(&self) -> SessionResult<Option<i32>> {
        self.session.with_engine(|engine| engine.channel_exit_status(&self.raw))
    }

    /// Send EOF, close, wait for the peer's close, then free the channel.
    ///
    /// Idempotent. A failing polite step is logged and the sequence goes on.
    /// When a step keeps reporting would-block past `close_attempt_cap`
    /// attempts the remaining polite steps are skipped, the channel is still
    /// freed once, and [`SessionError::CloseAborted`] is returned.
    pub async fn close(&self) -> SessionResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let cap = self.session.config().close_attempt_cap.max(1);
        let polite: [(&'static str, CloseStep<E>); 3] = [
            ("send-eof", E::channel_send_eof),
            ("close", E::channel_close),
            ("wait-closed", E::channel_wait_closed),
        ];

        let mut outcome = Ok(());
        let mut free_cap = cap;
        for (step, op) in polite {
            match self.settle(step, cap, op).await {
                Ok(()) => {}
                Err(err @ SessionError::CloseAborted { .. }) => {
                    outcome = Err(err);
                    free_cap = 1;
                    break;
                }
                Err(err) => debug!(?err, step, "channel close step failed"),
            }
        }

        match self.settle("free", free_cap, E::channel_free).await {
            Ok(()) => {}
            Err(err @ SessionError::CloseAborted { .. }) if outcome.is_ok() => outcome = Err(err),
            Err(err) => debug!(?err, "channel free failed"),
        }
        outcome
    }

    async fn settle(&self, step: &'static str, cap: u32, op: CloseStep<E>) -> SessionResult<()> {
        let slice = self.session.config().wait_slice();
        for attempt in 1..=cap {
            match self.session.with_engine(|engine| op(engine, &self.raw))? {
                Attempt::Ready(()) => return Ok(()),
                Attempt::Failed(fault) => return Err(SessionError::channel(self.session.describe_fault(fault))),
                Attempt::WouldBlock if attempt < cap => {
                    self.session.wait_for_activity(slice).await?;
                }
                Attempt::WouldBlock => {}
            }
        }
        error!(step, attempts = cap, "channel close step kept blocking; giving up");
        Err(SessionError::CloseAborted { step, attempts: cap })
    }
}

impl<E: Engine> std::fmt::Debug for Channel<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("closed", &self.is_closed()).finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "channel_tests.rs"]
mod tests;
