//! Session handle and the retry primitive.
//!
//! A [`Session`] exclusively owns one engine (and through it one connected
//! socket). Every engine call goes through [`Session::retrying`] or one of the
//! crate-internal single-attempt helpers, which take the engine lock for the
//! duration of exactly one non-blocking attempt and never across an await.

use std::{
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use rs_types::SessionConfig;
use secrecy::{ExposeSecret, SecretString};
use tokio::{sync::Notify, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    CancelFlag,
    SessionError,
    SessionResult,
    channel::Channel,
    engine::{Attempt, Directions, Engine, EngineFault},
    forwarding::ForwardRegistry,
    poller::{Poller, Readiness},
};

mod exec;
mod keepalive;
mod shell;

pub use exec::ChannelEvent;
pub use shell::{ShellInput, ShellOptions};

pub struct Session<E: Engine> {
    // Must stay declared before `engine`: the poller deregisters the socket on
    // drop, which has to happen while the engine still holds it open.
    poller: Poller,
    engine: Mutex<E>,
    config: SessionConfig,
    connected: AtomicBool,
    authenticated: AtomicBool,
    // Woken whenever an engine attempt completes, since that attempt may have
    // pulled socket input belonging to another waiter's channel.
    progress: Notify,
    forwards: ForwardRegistry,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl<E: Engine> Session<E> {
    /// Perform the engine handshake and return a connected session.
    pub async fn establish(engine: E, config: SessionConfig) -> SessionResult<Arc<Self>> {
        let poller = Poller::new(engine.descriptor());
        let session = Arc::new(Self {
            poller,
            engine: Mutex::new(engine),
            config,
            connected: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            progress: Notify::new(),
            forwards: ForwardRegistry::new(),
            keepalive: Mutex::new(None),
        });
        let deadline = session.deadline();
        session.attempt(deadline, None, |engine| engine.handshake()).await?;
        session.connected.store(true, Ordering::Release);
        debug!(fd = session.poller.descriptor(), "session handshake complete");
        if let Some(interval) = session.config.keepalive_interval() {
            let task = keepalive::spawn(&session, interval);
            *session.keepalive.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        }
        Ok(session)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Registry of forwards running on this session.
    pub fn forwards(&self) -> &ForwardRegistry {
        &self.forwards
    }

    /// Absolute deadline for an operation started now, if a timeout is configured.
    pub fn deadline(&self) -> Option<Instant> {
        self.config.timeout().map(|timeout| Instant::now() + timeout)
    }

    pub async fn authenticate_password(&self, username: &str, password: &SecretString) -> SessionResult<()> {
        self.ensure_connected()?;
        let deadline = self.deadline();
        self.attempt(deadline, None, |engine| {
            engine.authenticate_password(username, password.expose_secret())
        })
        .await?;
        self.authenticated.store(true, Ordering::Release);
        info!(user = username, "session authenticated");
        Ok(())
    }

    /// Open a plain session channel (for exec and similar requests).
    pub async fn open_channel(self: &Arc<Self>) -> SessionResult<Channel<E>> {
        self.ensure_connected()?;
        let deadline = self.deadline();
        let raw = self.attempt(deadline, None, |engine| engine.open_session()).await?;
        Ok(Channel::new(self.clone(), raw))
    }

    /// Open a channel the peer connects to `target_host:target_port`.
    pub async fn open_direct_tcpip(
        self: &Arc<Self>,
        target_host: &str,
        target_port: u16,
        origin_host: &str,
        origin_port: u16,
        cancel: Option<&CancelFlag>,
    ) -> SessionResult<Channel<E>> {
        self.ensure_connected()?;
        let deadline = self.deadline();
        let opened = self
            .attempt(deadline, cancel, |engine| {
                engine.open_direct_tcpip(target_host, target_port, origin_host, origin_port)
            })
            .await;
        match opened {
            Ok(raw) => Ok(Channel::new(self.clone(), raw)),
            Err(err) => {
                self.with_engine(|engine| engine.abandon_direct_tcpip(target_host, target_port, origin_host, origin_port))?;
                Err(err)
            }
        }
    }

    pub async fn send_keepalive(&self) -> SessionResult<()> {
        self.ensure_connected()?;
        let deadline = self.deadline();
        self.attempt(deadline, None, |engine| engine.keepalive()).await
    }

    /// Tear the session down: stop keepalives, cancel every forward, then
    /// disconnect the engine. Safe to call more than once.
    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        self.authenticated.store(false, Ordering::Release);
        if let Some(task) = self.keepalive.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        let cancelled = self.forwards.shutdown_all();
        match self.engine.lock() {
            Ok(mut engine) => engine.disconnect("closed by client"),
            Err(_) => warn!("engine lock poisoned during disconnect"),
        }
        self.progress.notify_waiters();
        info!(forwards = cancelled, "session disconnected");
    }

    /// The retry primitive.
    ///
    /// Runs `operation` under the engine lock; while `should_retry` says the
    /// result means would-block, waits for the directions the engine reports
    /// (readable when it reports none) and tries again. Fails with
    /// [`SessionError::Timeout`] once `deadline` passes, or with
    /// [`SessionError::Cancelled`] when `cancel` is raised. Without a deadline
    /// it retries until the operation stops blocking.
    pub async fn retrying<T, Op, Retry>(
        &self,
        deadline: Option<Instant>,
        cancel: Option<&CancelFlag>,
        mut operation: Op,
        should_retry: Retry,
    ) -> SessionResult<T>
    where
        Op: FnMut(&mut E) -> T,
        Retry: Fn(&T) -> bool,
    {
        loop {
            if cancel.is_some_and(CancelFlag::is_cancelled) {
                return Err(SessionError::Cancelled);
            }
            let result = self.with_engine(&mut operation)?;
            if !should_retry(&result) {
                self.note_progress();
                return Ok(result);
            }
            self.wait_for_engine(deadline).await?;
        }
    }

    /// [`Session::retrying`] specialised to engine attempts; failures become
    /// [`SessionError::Engine`].
    pub async fn attempt<T, Op>(&self, deadline: Option<Instant>, cancel: Option<&CancelFlag>, operation: Op) -> SessionResult<T>
    where
        Op: FnMut(&mut E) -> Attempt<T>,
    {
        match self.retrying(deadline, cancel, operation, Attempt::is_would_block).await? {
            Attempt::Ready(value) => Ok(value),
            Attempt::Failed(fault) => Err(SessionError::engine(self.describe_fault(fault))),
            Attempt::WouldBlock => Err(SessionError::Other("retry loop returned would-block".into())),
        }
    }

    pub(crate) fn ensure_connected(&self) -> SessionResult<()> {
        if self.is_connected() { Ok(()) } else { Err(SessionError::Disconnected) }
    }

    /// Run one engine call under the session lock.
    pub(crate) fn with_engine<T>(&self, operation: impl FnOnce(&mut E) -> T) -> SessionResult<T> {
        let mut engine = self.engine.lock().map_err(|_| SessionError::LockPoisoned)?;
        Ok(operation(&mut engine))
    }

    /// Fill in a fault reported without a message from the engine's last error.
    pub(crate) fn describe_fault(&self, fault: EngineFault) -> EngineFault {
        if !fault.message.is_empty() {
            return fault;
        }
        match self.with_engine(|engine| engine.last_error()) {
            Ok(last) if !last.message.is_empty() => EngineFault::new(fault.code, last.message),
            _ => EngineFault::new(fault.code, "engine call failed"),
        }
    }

    pub(crate) fn note_progress(&self) {
        self.progress.notify_waiters();
    }

    /// Wait step of the retry primitive.
    ///
    /// Each wait is capped at the wait slice so that input consumed on behalf
    /// of another channel can only stall a waiter for one slice.
    pub(crate) async fn wait_for_engine(&self, deadline: Option<Instant>) -> SessionResult<()> {
        let slice = self.config.wait_slice();
        let window = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(SessionError::Timeout);
                }
                remaining.min(slice)
            }
            None => slice,
        };
        let readiness = self.wait_for_activity(window).await?;
        if readiness == Readiness::TimedOut && deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(SessionError::Timeout);
        }
        Ok(())
    }

    /// Wait up to `window` for the engine socket to become ready in the
    /// directions the engine is blocked on, or for another task's attempt to
    /// complete.
    pub(crate) async fn wait_for_activity(&self, window: Duration) -> SessionResult<Readiness> {
        let directions = self.with_engine(|engine| engine.block_directions())?;
        let directions = if directions.is_empty() { Directions::READ } else { directions };
        let notified = self.progress.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        tokio::select! {
            readiness = self.poller.wait(directions, Some(window)) => Ok(readiness?),
            () = &mut notified => Ok(Readiness::Ready),
        }
    }
}

impl<E: Engine> Drop for Session<E> {
    fn drop(&mut self) {
        if self.is_connected() {
            self.disconnect();
        }
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
