//! Fd-observable wake mechanisms used by the readiness backends.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use super::syscall;
use crate::waker::Wake;

/// Waker backed by `eventfd`.
///
/// `eventfd` is effectively a 64 bit counter. All writes must be of 8 bytes
/// (64 bits) and are converted (native endian) into a 64 bit unsigned integer
/// and added to the count. Reads must also be 8 bytes and reset the count to
/// 0, returning the count.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Debug)]
pub(crate) struct EventfdWaker {
    fd: File,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl EventfdWaker {
    pub(crate) fn new() -> io::Result<EventfdWaker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(EventfdWaker { fd: file })
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Wake for EventfdWaker {
    #[allow(clippy::unused_io_amount)] // Don't care about partial writes.
    fn wake(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match (&self.fd).write(&buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Writing only blocks if the counter is going to overflow.
                // Reset the counter to 0 and wake again.
                self.ack();
                self.wake()
            }
            Err(err) => Err(err),
        }
    }

    /// Drain the counter so a level-triggered backend stops reporting the
    /// waker readable.
    fn ack(&self) {
        let mut buf: [u8; 8] = 0u64.to_ne_bytes();
        let _ = (&self.fd).read(&mut buf);
    }
}

/// Waker backed by a unix pipe.
///
/// Controls both ends and empties the pipe if writing to it (waking) fails.
#[derive(Debug)]
pub(crate) struct PipeWaker {
    sender: File,
    receiver: File,
}

impl PipeWaker {
    pub(crate) fn new() -> io::Result<PipeWaker> {
        let mut fds: [RawFd; 2] = [-1, -1];
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
        {
            syscall!(pipe(fds.as_mut_ptr()))?;
            for fd in &fds {
                syscall!(fcntl(*fd, libc::F_SETFL, libc::O_NONBLOCK))?;
                syscall!(fcntl(*fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
            }
        }
        let receiver = unsafe { File::from_raw_fd(fds[0]) };
        let sender = unsafe { File::from_raw_fd(fds[1]) };
        Ok(PipeWaker { sender, receiver })
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.receiver.as_raw_fd()
    }

    fn empty(&self) {
        let mut buf = [0; 4096];
        loop {
            match (&self.receiver).read(&mut buf) {
                Ok(n) if n > 0 => continue,
                _ => return,
            }
        }
    }
}

impl Wake for PipeWaker {
    fn wake(&self) -> io::Result<()> {
        match (&self.sender).write(&[1]) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // The reading end is full; empty the buffer and try again.
                self.empty();
                self.wake()
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => self.wake(),
            Err(err) => Err(err),
        }
    }

    fn ack(&self) {
        self.empty();
    }
}

/// Preferred fd-observable waker for the epoll and io_uring backends:
/// eventfd, or a pipe when forced with `--cfg voxio_force_pipe_waker`.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn fd_waker() -> io::Result<(std::sync::Arc<dyn Wake>, RawFd)> {
    #[cfg(not(voxio_force_pipe_waker))]
    {
        let waker = std::sync::Arc::new(EventfdWaker::new()?);
        let fd = waker.as_raw_fd();
        Ok((waker, fd))
    }
    #[cfg(voxio_force_pipe_waker)]
    {
        let waker = std::sync::Arc::new(PipeWaker::new()?);
        let fd = waker.as_raw_fd();
        Ok((waker, fd))
    }
}
