//! Shared type definitions for remote shell sessions.
//!
//! This crate contains lightweight configuration and forwarding types that are
//! shared by the session runtime and anything that builds configuration for it,
//! without pulling in the runtime itself.

pub mod config;
pub mod forward;

pub use config::{ForwardTuning, SessionConfig};
pub use forward::{ForwardKind, LocalForwardSpec, RemoteForwardSpec};
