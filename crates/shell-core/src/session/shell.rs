use std::sync::Arc;

use tokio::sync::mpsc::{UnboundedReceiver, error::TryRecvError};
use tracing::{debug, warn};

use super::{Session, exec::drain_output};
use crate::{
    CancelFlag,
    SessionResult,
    channel::Channel,
    engine::Engine,
    session::ChannelEvent,
};

/// Terminal request for [`Session::open_shell`]. Without a terminal type no
/// pty is requested.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellOptions {
    pub terminal: Option<String>,
    pub cols: u32,
    pub rows: u32,
}

impl Default for ShellOptions {
    fn default() -> Self {
        Self {
            terminal: None,
            cols: 80,
            rows: 24,
        }
    }
}

impl ShellOptions {
    pub fn with_pty(terminal: impl Into<String>, cols: u32, rows: u32) -> Self {
        Self {
            terminal: Some(terminal.into()),
            cols,
            rows,
        }
    }
}

/// Input for a running shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShellInput {
    Data(Vec<u8>),
    Resize { cols: u32, rows: u32 },
    /// No more input follows. Dropping the sender has the same effect.
    Eof,
}

impl<E: Engine> Session<E> {
    /// Run an interactive shell on a fresh channel.
    ///
    /// Input is written in the order it is received. Output is reported as it
    /// arrives until the shell reaches EOF or `cancel` is raised; a cancel
    /// takes effect within one wait slice. Returns the shell's exit status,
    /// or `None` when it was stopped before reporting one.
    pub async fn open_shell<F>(
        self: &Arc<Self>,
        options: ShellOptions,
        mut input: UnboundedReceiver<ShellInput>,
        cancel: &CancelFlag,
        mut on_event: F,
    ) -> SessionResult<Option<i32>>
    where
        F: FnMut(ChannelEvent<'_>) + Send,
    {
        let channel = self.open_channel().await?;
        let result = self.run_shell(&channel, &options, &mut input, cancel, &mut on_event).await;
        if let Err(err) = channel.close().await {
            debug!(?err, "shell channel close failed");
        }
        result
    }

    async fn run_shell<F>(
        &self,
        channel: &Channel<E>,
        options: &ShellOptions,
        input: &mut UnboundedReceiver<ShellInput>,
        cancel: &CancelFlag,
        on_event: &mut F,
    ) -> SessionResult<Option<i32>>
    where
        F: FnMut(ChannelEvent<'_>) + Send,
    {
        let deadline = self.deadline();
        if let Some(terminal) = options.terminal.as_deref() {
            self.attempt(deadline, Some(cancel), |engine| {
                engine.request_pty(channel.raw(), terminal, options.cols, options.rows)
            })
            .await?;
        }
        self.attempt(deadline, Some(cancel), |engine| engine.shell(channel.raw())).await?;
        debug!(terminal = ?options.terminal, "shell started");
        on_event(ChannelEvent::Started);

        let mut buf = vec![0u8; self.config.forward.buffer_size.max(1)];
        let mut input_open = true;
        loop {
            if cancel.is_cancelled() {
                debug!("shell stopped by cancel");
                return Ok(None);
            }
            while input_open {
                match input.try_recv() {
                    Ok(next) => input_open = self.feed_shell(channel, next, cancel).await?,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => input_open = self.feed_shell(channel, ShellInput::Eof, cancel).await?,
                }
            }
            if drain_output(channel, &mut buf, &mut *on_event)? {
                continue;
            }
            if channel.is_eof()? {
                break;
            }
            tokio::select! {
                waited = self.wait_for_engine(None) => waited?,
                next = input.recv(), if input_open => {
                    input_open = self.feed_shell(channel, next.unwrap_or(ShellInput::Eof), cancel).await?;
                }
            }
        }

        let status = channel.exit_status()?;
        debug!(?status, "shell finished");
        Ok(status)
    }

    /// Apply one input item. Returns false once EOF has been sent.
    async fn feed_shell(&self, channel: &Channel<E>, input: ShellInput, cancel: &CancelFlag) -> SessionResult<bool> {
        match input {
            ShellInput::Data(data) => {
                channel.write_all(&data, self.deadline()).await?;
                Ok(true)
            }
            ShellInput::Resize { cols, rows } => {
                let resized = self
                    .attempt(self.deadline(), Some(cancel), |engine| engine.resize_pty(channel.raw(), cols, rows))
                    .await;
                if let Err(err) = resized {
                    warn!(?err, cols, rows, "pty resize rejected");
                }
                Ok(true)
            }
            ShellInput::Eof => {
                channel.send_eof(self.deadline()).await?;
                Ok(false)
            }
        }
    }
}
