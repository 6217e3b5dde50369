use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// One-way cancellation flag shared between a forward's owner and its tasks.
///
/// Tasks poll it at the top of every loop iteration and after every bounded
/// wait, so a cancel takes effect within one wait slice.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns true only for the call that flipped it.
    pub fn cancel(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
