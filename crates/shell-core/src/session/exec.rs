use std::{sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::debug;

use super::Session;
use crate::{
    CancelFlag,
    SessionError,
    SessionResult,
    channel::Channel,
    engine::{Engine, StreamId},
};

/// Progress reported while a command or shell runs on a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelEvent<'a> {
    /// The peer accepted the exec or shell request.
    Started,
    Output(StreamId, &'a [u8]),
}

impl<E: Engine> Session<E> {
    /// Run `command` on a fresh channel, reporting [`ChannelEvent::Started`]
    /// once the peer accepts it and every stdout or stderr chunk as it
    /// arrives, and return the remote exit status.
    ///
    /// `timeout` bounds the whole exchange and falls back to the session
    /// timeout. Raising `cancel` stops the command within one wait slice with
    /// [`SessionError::Cancelled`]. A missing exit status is reported as `-1`.
    pub async fn execute<F>(
        self: &Arc<Self>,
        command: &str,
        timeout: Option<Duration>,
        cancel: Option<&CancelFlag>,
        mut on_event: F,
    ) -> SessionResult<i32>
    where
        F: FnMut(ChannelEvent<'_>) + Send,
    {
        let channel = self.open_channel().await?;
        let deadline = timeout.or(self.config.timeout()).map(|timeout| Instant::now() + timeout);
        let result = self.run_exec(&channel, command, deadline, cancel, &mut on_event).await;
        if let Err(err) = channel.close().await {
            debug!(?err, command, "exec channel close failed");
        }
        result
    }

    async fn run_exec<F>(
        &self,
        channel: &Channel<E>,
        command: &str,
        deadline: Option<Instant>,
        cancel: Option<&CancelFlag>,
        on_event: &mut F,
    ) -> SessionResult<i32>
    where
        F: FnMut(ChannelEvent<'_>) + Send,
    {
        self.attempt(deadline, cancel, |engine| engine.exec(channel.raw(), command)).await?;
        debug!(command, "exec started");
        on_event(ChannelEvent::Started);

        let mut buf = vec![0u8; self.config.forward.buffer_size.max(1)];
        loop {
            if cancel.is_some_and(CancelFlag::is_cancelled) {
                debug!(command, "exec cancelled");
                return Err(SessionError::Cancelled);
            }
            if drain_output(channel, &mut buf, &mut *on_event)? {
                continue;
            }
            if channel.is_eof()? {
                break;
            }
            self.wait_for_engine(deadline).await?;
        }

        let status = channel.exit_status()?.unwrap_or(-1);
        debug!(command, status, "exec finished");
        Ok(status)
    }
}

/// One read attempt on each substream. Returns true if anything arrived.
pub(super) fn drain_output<E, F>(channel: &Channel<E>, buf: &mut [u8], on_event: &mut F) -> SessionResult<bool>
where
    E: Engine,
    F: FnMut(ChannelEvent<'_>),
{
    let mut progressed = false;
    for stream in [StreamId::Stdout, StreamId::Stderr] {
        if let Some(read) = channel.try_read(stream, buf)?
            && read > 0
        {
            on_event(ChannelEvent::Output(stream, &buf[..read]));
            progressed = true;
        }
    }
    Ok(progressed)
}
