//! The uniform event-demultiplexer interface and backend auto-selection.

use std::io;
use std::time::Duration;

use crate::event::Events;
use crate::sys::SysFd;
use crate::{Interest, Token, Waker};

/// One kernel event mechanism behind a uniform registration interface.
///
/// Readiness backends (epoll, kqueue, io_uring poll, select) report when a
/// descriptor can be read or written and the drivers perform the I/O. The
/// completion backend (IOCP) reports finished overlapped operations with a
/// transferred byte count; drivers post the operations themselves.
pub(crate) trait Backend {
    /// Reportable mechanism name, e.g. `"epoll"`.
    fn name(&self) -> &'static str;

    /// True for the completion-model backend (IOCP). Drivers post real
    /// overlapped operations there instead of registering interests and
    /// performing the I/O themselves.
    fn is_completion(&self) -> bool {
        false
    }

    /// Start watching `fd` with `interest`, tagging events with `token`.
    fn add(&mut self, fd: SysFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Replace the interest set of a registered descriptor.
    fn modify(&mut self, fd: SysFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Stop watching `fd`.
    fn remove(&mut self, fd: SysFd) -> io::Result<()>;

    /// Wait at most `timeout` (`None` blocks indefinitely) and fill
    /// `events`. Interruption by a signal is not an error; it reports zero
    /// events.
    fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()>;

    /// Create the backend's wake mechanism, registered under the reserved
    /// wake token. Called once per loop.
    fn waker(&mut self) -> io::Result<Waker>;
}

/// Which event mechanism a loop should use.
///
/// `Auto` walks the platform's fallback chain and picks the first mechanism
/// that can be created:
///
/// | Platform  | Chain                      |
/// |-----------|----------------------------|
/// | Linux     | io_uring → epoll → select  |
/// | macOS/BSD | kqueue → select            |
/// | Windows   | IOCP → select              |
/// | other     | select                     |
///
/// Naming a concrete kind skips the chain; an unsupported kind is an error.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BackendKind {
    #[default]
    Auto,
    Epoll,
    IoUring,
    Kqueue,
    Iocp,
    Select,
}

impl BackendKind {
    /// The kinds that can actually be constructed on this platform,
    /// preferred mechanism first.
    pub fn available() -> &'static [BackendKind] {
        #[cfg(target_os = "linux")]
        {
            &[BackendKind::IoUring, BackendKind::Epoll, BackendKind::Select]
        }
        #[cfg(target_os = "android")]
        {
            &[BackendKind::Epoll, BackendKind::Select]
        }
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly",
        ))]
        {
            &[BackendKind::Kqueue, BackendKind::Select]
        }
        #[cfg(windows)]
        {
            &[BackendKind::Iocp, BackendKind::Select]
        }
        #[cfg(not(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly",
            windows,
        )))]
        {
            &[BackendKind::Select]
        }
    }
}

fn unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "backend not supported on this platform",
    )
}

/// Construct `kind`, or walk the platform chain for `Auto`. Creation
/// failures of preferred mechanisms fall through silently; only the last
/// candidate's error is surfaced.
pub(crate) fn create(kind: BackendKind, max_events: usize) -> io::Result<Box<dyn Backend>> {
    match kind {
        BackendKind::Auto => {
            let chain = BackendKind::available();
            let (last, preferred) = chain.split_last().unwrap();
            for &candidate in preferred {
                if let Ok(backend) = create(candidate, max_events) {
                    return Ok(backend);
                }
            }
            create(*last, max_events)
        }
        BackendKind::Epoll => {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            {
                let backend = crate::sys::unix::epoll::Epoll::new(max_events)?;
                crate::macros::trace!("created {} backend", backend.name());
                Ok(Box::new(backend))
            }
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            {
                Err(unsupported())
            }
        }
        BackendKind::IoUring => {
            #[cfg(target_os = "linux")]
            {
                let backend = crate::sys::unix::uring::Uring::new(max_events)?;
                crate::macros::trace!("created {} backend", backend.name());
                Ok(Box::new(backend))
            }
            #[cfg(not(target_os = "linux"))]
            {
                Err(unsupported())
            }
        }
        BackendKind::Kqueue => {
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly",
            ))]
            {
                let backend = crate::sys::unix::kqueue::Kqueue::new(max_events)?;
                crate::macros::trace!("created {} backend", backend.name());
                Ok(Box::new(backend))
            }
            #[cfg(not(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly",
            )))]
            {
                Err(unsupported())
            }
        }
        BackendKind::Iocp => {
            #[cfg(windows)]
            {
                let backend = crate::sys::windows::iocp::Iocp::new(max_events)?;
                crate::macros::trace!("created {} backend", backend.name());
                Ok(Box::new(backend))
            }
            #[cfg(not(windows))]
            {
                Err(unsupported())
            }
        }
        BackendKind::Select => {
            #[cfg(unix)]
            {
                let backend = crate::sys::unix::select::Select::new()?;
                crate::macros::trace!("created {} backend", backend.name());
                Ok(Box::new(backend))
            }
            #[cfg(windows)]
            {
                let backend = crate::sys::windows::select::WsaSelect::new()?;
                crate::macros::trace!("created {} backend", backend.name());
                Ok(Box::new(backend))
            }
            #[cfg(not(any(unix, windows)))]
            {
                Err(unsupported())
            }
        }
    }
}

const NANOS_PER_MILLI: u32 = 1_000_000;
const MILLIS_PER_SEC: u64 = 1_000;

/// Convert a `Duration` to milliseconds, rounding up and saturating at
/// `u64::MAX`.
///
/// The saturating is fine because `u64::MAX` milliseconds are still many
/// million years.
pub(crate) fn millis(duration: Duration) -> u64 {
    // Round up.
    let millis = duration.subsec_nanos().div_ceil(NANOS_PER_MILLI);
    duration
        .as_secs()
        .saturating_mul(MILLIS_PER_SEC)
        .saturating_add(millis as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_always_selects_something() {
        let backend = create(BackendKind::Auto, 64).unwrap();
        assert!(!backend.name().is_empty());
    }

    #[test]
    fn available_ends_with_select() {
        assert_eq!(
            BackendKind::available().last(),
            Some(&BackendKind::Select)
        );
    }

    #[test]
    fn millis_rounds_up() {
        assert_eq!(millis(Duration::from_micros(1)), 1);
        assert_eq!(millis(Duration::from_millis(250)), 250);
    }
}
