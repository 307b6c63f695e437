use std::thread::{self, ThreadId};

/// Remembers the thread that owns session state.
///
/// The worker and every device session are driven from a single control
/// thread. Handing one of them to another thread is a programming error, so
/// [`ControlThread::check`] panics instead of returning an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlThread {
    id: ThreadId,
}

impl ControlThread {
    /// Captures the calling thread as the control thread.
    pub fn current() -> Self {
        Self {
            id: thread::current().id(),
        }
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.id
    }

    #[track_caller]
    pub fn check(&self) {
        assert!(
            self.is_current(),
            "must be called from the control thread ({:?}), was called from {:?}",
            self.id,
            thread::current().id()
        );
    }
}
