use std::{sync::Arc, time::Duration};

use rs_types::{ForwardKind, RemoteForwardSpec};
use tokio::{net::TcpStream, time::Instant};
use tracing::{debug, error, info, warn};

use super::{
    ForwardDescriptor,
    ForwardExit,
    ForwardHandle,
    ForwardId,
    bridge::{bridge, watch_teardown},
};
use crate::{
    CancelFlag,
    SessionError,
    SessionResult,
    channel::Channel,
    engine::{Attempt, Engine},
    session::Session,
};

impl<E: Engine> Session<E> {
    /// Ask the peer to listen and bridge every channel it hands over to the
    /// local `target_host:target_port`.
    ///
    /// When the peer reports port 0 the requested port is kept as `bound_port`.
    pub async fn start_remote_forward(self: &Arc<Self>, spec: RemoteForwardSpec) -> SessionResult<ForwardHandle> {
        self.ensure_connected()?;
        let backlog = self.config().forward.listen_backlog;
        let deadline = self.deadline();
        let (listener, reported) = self
            .attempt(deadline, None, |engine| {
                engine.forward_listen(spec.bind_address.as_deref(), spec.bind_port, backlog)
            })
            .await?;
        let bound_port = if reported == 0 { spec.bind_port } else { reported };
        let descriptor = ForwardDescriptor {
            id: ForwardId::new(),
            kind: ForwardKind::Remote,
            bind_address: spec.bind_address.unwrap_or_default(),
            bound_port,
            target_host: spec.target_host,
            target_port: spec.target_port,
        };
        info!(
            bound_port,
            target = %format!("{}:{}", descriptor.target_host, descriptor.target_port),
            "remote forward listening"
        );
        let cancel = CancelFlag::new();
        let run = run_remote_listener(self.clone(), listener, descriptor.clone(), cancel.clone());
        Ok(self.forwards().start(descriptor, cancel, run))
    }

    /// Accept one forwarded channel, giving up after one wait slice.
    pub(crate) async fn accept_forwarded(self: &Arc<Self>, listener: &E::Listener, cancel: &CancelFlag) -> SessionResult<Channel<E>> {
        let deadline = Instant::now() + self.config().wait_slice();
        let raw = self
            .attempt(Some(deadline), Some(cancel), |engine| engine.forward_accept(listener))
            .await?;
        Ok(Channel::new(self.clone(), raw))
    }
}

async fn run_remote_listener<E: Engine>(
    session: Arc<Session<E>>,
    listener: E::Listener,
    descriptor: ForwardDescriptor,
    cancel: CancelFlag,
) -> ForwardExit {
    let exit = loop {
        if cancel.is_cancelled() {
            break ForwardExit::Cancelled;
        }
        if !session.is_connected() {
            break ForwardExit::SessionClosed;
        }
        let channel = match session.accept_forwarded(&listener, &cancel).await {
            Ok(channel) => channel,
            Err(SessionError::Timeout) => continue,
            Err(SessionError::Cancelled) => break ForwardExit::Cancelled,
            Err(_) if !session.is_connected() => break ForwardExit::SessionClosed,
            Err(err) => {
                warn!(?err, forward = %descriptor, "remote forward accept failed");
                break ForwardExit::Failed(err.to_string());
            }
        };
        let connected = tokio::select! {
            result = connect_target(&descriptor, session.config().timeout()) => Some(result),
            () = watch_teardown(&session, &cancel, session.config().wait_slice()) => None,
        };
        match connected {
            Some(Ok(stream)) => {
                debug!(forward = %descriptor, "remote forward connection opened");
                tokio::spawn(bridge(session.clone(), channel, stream, cancel.clone()));
            }
            Some(Err(err)) => {
                debug!(?err, forward = %descriptor, "remote forward target unreachable");
                close_channel(&channel).await;
            }
            None => {
                close_channel(&channel).await;
                if cancel.is_cancelled() {
                    break ForwardExit::Cancelled;
                }
                break ForwardExit::SessionClosed;
            }
        }
    };
    if session.is_connected() {
        cancel_listener(&session, &listener).await;
    }
    info!(forward = %descriptor, ?exit, "remote forward stopped");
    exit
}

async fn connect_target(descriptor: &ForwardDescriptor, timeout: Option<Duration>) -> SessionResult<TcpStream> {
    let address = format!("{}:{}", descriptor.target_host, descriptor.target_port);
    let connect = TcpStream::connect((descriptor.target_host.as_str(), descriptor.target_port));
    let stream = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, connect).await.map_err(|_| SessionError::Timeout)?,
        None => connect.await,
    }
    .map_err(|source| SessionError::ConnectionFailed { address, source })?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

async fn close_channel<E: Engine>(channel: &Channel<E>) {
    if let Err(err) = channel.close().await {
        debug!(?err, "remote forward channel close failed");
    }
}

/// Withdraw the listener from the peer, bounded by `close_attempt_cap`.
async fn cancel_listener<E: Engine>(session: &Session<E>, listener: &E::Listener) {
    let cap = session.config().close_attempt_cap.max(1);
    let slice = session.config().wait_slice();
    for _ in 0..cap {
        match session.with_engine(|engine| engine.forward_cancel(listener)) {
            Ok(Attempt::Ready(())) => return,
            Ok(Attempt::WouldBlock) => {
                if let Err(err) = session.wait_for_activity(slice).await {
                    debug!(?err, "remote listener cancel wait failed");
                    return;
                }
            }
            Ok(Attempt::Failed(fault)) => {
                debug!(%fault, "remote listener cancel failed");
                return;
            }
            Err(err) => {
                warn!(?err, "remote listener cancel failed");
                return;
            }
        }
    }
    error!(attempts = cap, "remote listener cancel kept blocking; giving up");
}
