//! Readiness poller.
//!
//! Turns "wait until this descriptor is readable or writable, or a timeout
//! elapses" into a single await point. The descriptor is registered with the
//! tokio reactor (epoll/kqueue) on first use; every wake is confirmed with a
//! zero-timeout `poll(2)` so waits behave level-triggered even though the
//! engine, not this poller, performs the actual socket I/O.

use std::{
    io,
    os::fd::{AsRawFd, BorrowedFd, RawFd},
    time::Duration,
};

use once_cell::sync::OnceCell;
use rustix::{
    event::{PollFd, PollFlags, poll},
    io::Errno,
};
use tokio::io::{Interest, unix::AsyncFd};

use crate::engine::Directions;

/// Result of a readiness wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
}

#[derive(Clone, Copy, Debug)]
struct Descriptor(RawFd);

impl AsRawFd for Descriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Waits for readiness on a descriptor owned by someone else.
///
/// The owner must keep the descriptor open for as long as the poller exists;
/// dropping the poller deregisters it from the reactor.
#[derive(Debug)]
pub struct Poller {
    fd: RawFd,
    registration: OnceCell<AsyncFd<Descriptor>>,
}

impl Poller {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            registration: OnceCell::new(),
        }
    }

    pub fn descriptor(&self) -> RawFd {
        self.fd
    }

    /// Whether the descriptor has been handed to the reactor yet.
    pub fn is_registered(&self) -> bool {
        self.registration.get().is_some()
    }

    /// Wait until any of `directions` is ready or `timeout` elapses.
    ///
    /// Empty `directions` means readable. A zero timeout returns
    /// [`Readiness::TimedOut`] immediately without touching the descriptor;
    /// `None` waits without a limit.
    pub async fn wait(&self, directions: Directions, timeout: Option<Duration>) -> io::Result<Readiness> {
        let directions = if directions.is_empty() { Directions::READ } else { directions };
        if timeout.is_some_and(|limit| limit.is_zero()) {
            return Ok(Readiness::TimedOut);
        }
        let registration = self.registration()?;
        let wait = self.wait_registered(registration, directions);
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result.map(|()| Readiness::Ready),
                Err(_) => Ok(Readiness::TimedOut),
            },
            None => wait.await.map(|()| Readiness::Ready),
        }
    }

    fn registration(&self) -> io::Result<&AsyncFd<Descriptor>> {
        if self.fd < 0 {
            return Err(Errno::BADF.into());
        }
        self.registration
            .get_or_try_init(|| AsyncFd::with_interest(Descriptor(self.fd), Interest::READABLE | Interest::WRITABLE))
    }

    async fn wait_registered(&self, registration: &AsyncFd<Descriptor>, directions: Directions) -> io::Result<()> {
        let read = directions.contains(Directions::READ);
        let write = directions.contains(Directions::WRITE);
        loop {
            if level_ready(self.fd, directions)? {
                return Ok(());
            }
            // Stale readiness is cleared so the next await parks until a fresh event.
            tokio::select! {
                guard = registration.readable(), if read => guard?.clear_ready(),
                guard = registration.writable(), if write => guard?.clear_ready(),
            }
        }
    }
}

fn level_ready(fd: RawFd, directions: Directions) -> io::Result<bool> {
    let mut flags = PollFlags::empty();
    if directions.contains(Directions::READ) {
        flags |= PollFlags::IN;
    }
    if directions.contains(Directions::WRITE) {
        flags |= PollFlags::OUT;
    }
    // SAFETY: `fd` is non-negative (checked at registration) and the poller's
    // owner keeps it open while the poller is alive.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::from_borrowed_fd(borrowed, flags)];
    loop {
        match poll(&mut fds, 0) {
            Ok(_) => break,
            Err(Errno::INTR) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    let revents = fds[0].revents();
    if revents.contains(PollFlags::NVAL) {
        return Err(Errno::BADF.into());
    }
    // Errors and hangups count as ready; the next engine attempt reports them.
    Ok(!revents.is_empty())
}

#[cfg(test)]
#[path = "poller_tests.rs"]
mod tests;
