//! Non-blocking session plumbing: readiness polling, a retry primitive over a
//! would-block protocol engine, channel I/O, and TCP port forwarding.

mod cancel;
pub mod channel;
pub mod engine;
pub mod error;
pub mod forwarding;
pub mod logging;
pub mod loopback;
pub mod poller;
pub mod session;

pub use cancel::CancelFlag;
pub use channel::Channel;
pub use engine::{Attempt, Directions, Engine, EngineFault, StreamId};
pub use error::{SessionError, SessionResult};
pub use forwarding::{
    ForwardDescriptor,
    ForwardExit,
    ForwardHandle,
    ForwardId,
    ForwardRegistry,
    parse_local_forward,
    parse_remote_forward,
};
pub use poller::{Poller, Readiness};
pub use rs_types::{ForwardKind, ForwardTuning, LocalForwardSpec, RemoteForwardSpec, SessionConfig};
pub use session::{ChannelEvent, Session, ShellInput, ShellOptions};
