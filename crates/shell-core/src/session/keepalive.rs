use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::Session;
use crate::engine::Engine;

/// Send a keepalive every `interval`; disconnect the session once more than
/// `keepalive_max_failures` consecutive sends have failed.
pub(super) fn spawn<E: Engine>(session: &Arc<Session<E>>, interval: Duration) -> JoinHandle<()> {
    let weak: Weak<Session<E>> = Arc::downgrade(session);
    let max_failures = session.config.keepalive_max_failures;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut failures = 0u32;
        loop {
            ticker.tick().await;
            let Some(session) = weak.upgrade() else { break };
            if !session.is_connected() {
                break;
            }
            match session.send_keepalive().await {
                Ok(()) => failures = 0,
                Err(err) => {
                    failures += 1;
                    debug!(?err, failures, "keepalive failed");
                    if failures > max_failures {
                        warn!(failures, "keepalive failure tolerance exceeded; disconnecting");
                        session.disconnect();
                        break;
                    }
                }
            }
        }
    })
}
