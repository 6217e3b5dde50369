//! TCP port forwarding over a [`Session`](crate::Session).
//!
//! This module provides:
//! - Local forwards: a local listener whose connections become direct channels
//! - Remote forwards: a listener on the peer whose channels connect to a local target
//! - The bridge that pumps bytes between a socket and a channel
//! - [`ForwardHandle`] and [`ForwardRegistry`] for tracking and cancelling forwards

mod bridge;
mod local;
mod parsing;
mod registry;
mod remote;

pub use parsing::{parse_local_forward, parse_remote_forward};
pub use registry::{ForwardDescriptor, ForwardExit, ForwardHandle, ForwardId, ForwardRegistry};

/// True for accept errors caused by one failed connection rather than a
/// broken listener.
fn is_transient_accept_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted | ErrorKind::WouldBlock
    )
}
