use std::{net::SocketAddr, sync::Arc};

use rs_types::{ForwardKind, LocalForwardSpec};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::{
    ForwardDescriptor,
    ForwardExit,
    ForwardHandle,
    ForwardId,
    bridge::bridge,
    is_transient_accept_error,
};
use crate::{CancelFlag, SessionError, SessionResult, engine::Engine, session::Session};

impl<E: Engine> Session<E> {
    /// Listen on a local port and bridge every accepted connection to
    /// `target_host:target_port` through a direct channel.
    ///
    /// Binding happens before this returns, so a bind failure is reported
    /// here and the handle's `bound_port` is always the real port.
    pub async fn start_local_forward(self: &Arc<Self>, spec: LocalForwardSpec) -> SessionResult<ForwardHandle> {
        self.ensure_connected()?;
        let bind_host = spec.bind_host().to_string();
        let listener = TcpListener::bind((bind_host.as_str(), spec.bind_port))
            .await
            .map_err(|source| SessionError::BindFailed {
                address: format!("{bind_host}:{}", spec.bind_port),
                source,
            })?;
        let bound_port = listener.local_addr()?.port();
        let descriptor = ForwardDescriptor {
            id: ForwardId::new(),
            kind: ForwardKind::Local,
            bind_address: bind_host,
            bound_port,
            target_host: spec.target_host,
            target_port: spec.target_port,
        };
        info!(
            bind = %format!("{}:{}", descriptor.bind_address, bound_port),
            target = %format!("{}:{}", descriptor.target_host, descriptor.target_port),
            "local forward listening"
        );
        let cancel = CancelFlag::new();
        let run = run_local_listener(self.clone(), listener, descriptor.clone(), cancel.clone());
        Ok(self.forwards().start(descriptor, cancel, run))
    }
}

async fn run_local_listener<E: Engine>(
    session: Arc<Session<E>>,
    listener: TcpListener,
    descriptor: ForwardDescriptor,
    cancel: CancelFlag,
) -> ForwardExit {
    let slice = session.config().wait_slice();
    let exit = loop {
        if cancel.is_cancelled() {
            break ForwardExit::Cancelled;
        }
        if !session.is_connected() {
            break ForwardExit::SessionClosed;
        }
        let (stream, origin) = match tokio::time::timeout(slice, listener.accept()).await {
            Err(_) => continue,
            Ok(Ok(accepted)) => accepted,
            Ok(Err(err)) if is_transient_accept_error(&err) => {
                debug!(?err, "local forward accept interrupted");
                continue;
            }
            Ok(Err(err)) => {
                warn!(?err, forward = %descriptor, "local forward listener accept error");
                break ForwardExit::Failed(err.to_string());
            }
        };
        match open_for(&session, &descriptor, stream, origin, &cancel).await {
            Ok(()) => {}
            Err(SessionError::Cancelled) => break ForwardExit::Cancelled,
            Err(_) if !session.is_connected() => break ForwardExit::SessionClosed,
            Err(err) => debug!(?err, %origin, "local forward connection dropped"),
        }
    };
    // Stop accepting before reporting the exit so refused connects follow cancel.
    drop(listener);
    info!(forward = %descriptor, ?exit, "local forward stopped");
    exit
}

async fn open_for<E: Engine>(
    session: &Arc<Session<E>>,
    descriptor: &ForwardDescriptor,
    stream: TcpStream,
    origin: SocketAddr,
    cancel: &CancelFlag,
) -> SessionResult<()> {
    stream.set_nodelay(true).ok();
    let channel = session
        .open_direct_tcpip(
            &descriptor.target_host,
            descriptor.target_port,
            &origin.ip().to_string(),
            origin.port(),
            Some(cancel),
        )
        .await?;
    debug!(%origin, forward = %descriptor, "local forward connection opened");
    tokio::spawn(bridge(session.clone(), channel, stream, cancel.clone()));
    Ok(())
}
