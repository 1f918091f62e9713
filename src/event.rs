use std::fmt;

use crate::{Interest, Token};

/// A single readiness or completion notification delivered by a backend.
///
/// Readiness backends report only `token` and `readiness`. The completion
/// backend (IOCP) additionally reports how many bytes the finished operation
/// transferred, plus the raw per-operation context pointer the driver posted,
/// so the owning handle can be recovered from the completion alone.
#[derive(Clone)]
pub struct Event {
    token: Token,
    readiness: Interest,
    bytes: Option<usize>,
    #[cfg(windows)]
    overlapped: usize,
}

impl Event {
    pub(crate) fn new(token: Token, readiness: Interest) -> Event {
        Event {
            token,
            readiness,
            bytes: None,
            #[cfg(windows)]
            overlapped: 0,
        }
    }

    #[cfg(windows)]
    pub(crate) fn completion(
        token: Token,
        readiness: Interest,
        bytes: usize,
        overlapped: usize,
    ) -> Event {
        Event {
            token,
            readiness,
            bytes: Some(bytes),
            overlapped,
        }
    }

    /// The token the resource was registered with.
    pub fn token(&self) -> Token {
        self.token
    }

    /// The fired readiness set.
    pub fn readiness(&self) -> Interest {
        self.readiness
    }

    /// Bytes transferred, reported only by the completion backend.
    pub fn bytes_transferred(&self) -> Option<usize> {
        self.bytes
    }

    /// Raw pointer to the posted operation context (completion backend only).
    #[cfg(windows)]
    pub(crate) fn overlapped(&self) -> usize {
        self.overlapped
    }

    pub fn is_readable(&self) -> bool {
        self.readiness.is_readable()
    }

    pub fn is_writable(&self) -> bool {
        self.readiness.is_writable()
    }

    pub fn is_error(&self) -> bool {
        self.readiness.is_error()
    }

    pub fn is_hangup(&self) -> bool {
        self.readiness.is_hangup()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Event")
            .field("token", &self.token)
            .field("readiness", &self.readiness)
            .field("bytes", &self.bytes)
            .finish()
    }
}

/// A reusable buffer of events filled by [`Backend::poll`].
///
/// [`Backend::poll`]: crate::backend::Backend::poll
pub struct Events {
    inner: Vec<Event>,
    capacity: usize,
}

impl Events {
    /// Return a new `Events` holding at most `capacity` events per poll.
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Maximum number of events a single poll may deliver.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.inner.iter()
    }

    pub(crate) fn clear(&mut self) {
        self.inner.clear();
    }

    pub(crate) fn push(&mut self, event: Event) {
        self.inner.push(event);
    }

    pub(crate) fn take(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.inner)
    }

    pub(crate) fn restore(&mut self, mut events: Vec<Event>) {
        events.clear();
        self.inner = events;
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_list().entries(self.inner.iter()).finish()
    }
}
