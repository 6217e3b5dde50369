use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use rs_types::ForwardKind;
use tokio::{sync::watch, task::JoinHandle};
use tracing::debug;
use uuid::Uuid;

use crate::CancelFlag;

/// Identifier of one running forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForwardId(Uuid);

impl ForwardId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ForwardId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ForwardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardDescriptor {
    pub id: ForwardId,
    pub kind: ForwardKind,
    pub bind_address: String,
    /// Port actually listening, which differs from the requested one when 0 was asked for.
    pub bound_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

impl fmt::Display for ForwardDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.kind, self.bind_address, self.bound_port, self.target_host, self.target_port
        )
    }
}

/// Why a forward's accept loop ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ForwardExit {
    Cancelled,
    SessionClosed,
    Failed(String),
}

/// Caller-side handle of a running forward.
///
/// Dropping the handle does not stop the forward; call [`ForwardHandle::cancel`].
#[derive(Clone, Debug)]
pub struct ForwardHandle {
    descriptor: ForwardDescriptor,
    cancel: CancelFlag,
    exit: watch::Receiver<Option<ForwardExit>>,
}

impl ForwardHandle {
    pub fn id(&self) -> ForwardId {
        self.descriptor.id
    }

    pub fn kind(&self) -> ForwardKind {
        self.descriptor.kind
    }

    pub fn bound_port(&self) -> u16 {
        self.descriptor.bound_port
    }

    pub fn descriptor(&self) -> &ForwardDescriptor {
        &self.descriptor
    }

    /// Stop accepting and tear down every bridged connection within one wait slice.
    pub fn cancel(&self) {
        if self.cancel.cancel() {
            debug!(forward = %self.descriptor, "forward cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Wait for the accept loop to end.
    pub async fn wait(&self) -> ForwardExit {
        let mut exit = self.exit.clone();
        match exit.wait_for(Option::is_some).await {
            Ok(value) => value
                .as_ref()
                .cloned()
                .unwrap_or_else(|| ForwardExit::Failed("forward ended without an exit reason".into())),
            Err(_) => ForwardExit::Failed("forward task terminated unexpectedly".into()),
        }
    }
}

struct ForwardEntry {
    descriptor: ForwardDescriptor,
    cancel: CancelFlag,
    // Held so the task stays attributable to the entry; dropping it detaches.
    _task: JoinHandle<()>,
}

#[derive(Default)]
struct RegistryInner {
    entries: Mutex<HashMap<ForwardId, ForwardEntry>>,
}

impl RegistryInner {
    fn entries(&self) -> MutexGuard<'_, HashMap<ForwardId, ForwardEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Active forwards of one session. Entries remove themselves when their
/// accept loop ends.
#[derive(Clone, Default)]
pub struct ForwardRegistry {
    inner: Arc<RegistryInner>,
}

impl ForwardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `run` as the accept loop of a new forward and register it.
    pub(crate) fn start<F>(&self, descriptor: ForwardDescriptor, cancel: CancelFlag, run: F) -> ForwardHandle
    where
        F: Future<Output = ForwardExit> + Send + 'static,
    {
        let (exit_tx, exit_rx) = watch::channel(None);
        let id = descriptor.id;
        let registry = Arc::downgrade(&self.inner);
        // Hold the lock across the spawn so the task cannot remove its entry
        // before it was inserted.
        let mut entries = self.inner.entries();
        let task = tokio::spawn(async move {
            let exit = run.await;
            if let Some(registry) = registry.upgrade() {
                registry.entries().remove(&id);
            }
            let _ = exit_tx.send(Some(exit));
        });
        entries.insert(
            id,
            ForwardEntry {
                descriptor: descriptor.clone(),
                cancel: cancel.clone(),
                _task: task,
            },
        );
        drop(entries);
        ForwardHandle {
            descriptor,
            cancel,
            exit: exit_rx,
        }
    }

    /// Cancel one forward. Returns false when it is not registered.
    pub fn cancel(&self, id: ForwardId) -> bool {
        match self.inner.entries().get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel and forget every registered forward. Returns how many there were.
    pub fn shutdown_all(&self) -> usize {
        let drained: Vec<ForwardEntry> = self.inner.entries().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.cancel.cancel();
            debug!(forward = %entry.descriptor, "forward shut down");
        }
        drained.len()
    }

    pub fn active(&self) -> Vec<ForwardDescriptor> {
        let mut active: Vec<_> = self.inner.entries().values().map(|entry| entry.descriptor.clone()).collect();
        active.sort_by_key(|descriptor| descriptor.id);
        active
    }

    pub fn contains(&self, id: ForwardId) -> bool {
        self.inner.entries().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ForwardRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardRegistry").field("active", &self.len()).finish()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
