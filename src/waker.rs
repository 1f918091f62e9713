use std::fmt;
use std::io;
use std::sync::Arc;

/// Backend-specific wake mechanism.
///
/// `wake` must be callable from any thread and must force a concurrently
/// blocked backend poll to return in bounded time. `ack` runs on the loop
/// thread when the wake event is dispatched and clears whatever state keeps
/// a level-triggered backend reporting the waker ready.
pub(crate) trait Wake: Send + Sync {
    fn wake(&self) -> io::Result<()>;
    fn ack(&self) {}
}

/// Wakes an [`EventLoop`] blocked in its backend from another thread.
///
/// Obtained from [`EventLoop::waker`] or carried inside a
/// [`Remote`]. Cloning is cheap; all clones share one mechanism.
///
/// [`EventLoop`]: crate::EventLoop
/// [`EventLoop::waker`]: crate::EventLoop::waker
/// [`Remote`]: crate::Remote
#[derive(Clone)]
pub struct Waker {
    inner: Arc<dyn Wake>,
}

impl Waker {
    pub(crate) fn new(inner: Arc<dyn Wake>) -> Waker {
        Waker { inner }
    }

    /// Wake the loop associated with this `Waker`.
    pub fn wake(&self) -> io::Result<()> {
        self.inner.wake()
    }

    pub(crate) fn ack(&self) {
        self.inner.ack();
    }
}

impl fmt::Debug for Waker {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Waker").finish()
    }
}
