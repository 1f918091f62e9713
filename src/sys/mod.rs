//! Platform-specific plumbing: raw sockets, wake mechanisms and the
//! kernel-facing halves of the event backends.

#[cfg(unix)]
pub(crate) mod unix;
#[cfg(unix)]
pub(crate) use unix::{net, SysFd};

#[cfg(windows)]
pub(crate) mod windows;
#[cfg(windows)]
pub(crate) use windows::{net, SysFd};
