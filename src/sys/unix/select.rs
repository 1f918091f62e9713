//! `select(2)` fallback backend.
//!
//! Keeps its own fd -> (token, interest) table since the kernel holds no
//! per-registration state between calls.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use super::syscall;
use super::waker::PipeWaker;
use crate::backend::Backend;
use crate::event::{Event, Events};
use crate::token::WAKE_TOKEN;
use crate::{Interest, Token, Waker};

#[derive(Debug)]
pub(crate) struct Select {
    fds: HashMap<RawFd, (Token, Interest)>,
}

impl Select {
    pub(crate) fn new() -> io::Result<Select> {
        Ok(Select {
            fds: HashMap::new(),
        })
    }
}

impl Backend for Select {
    fn name(&self) -> &'static str {
        "select"
    }

    fn add(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        if fd as usize >= libc::FD_SETSIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "descriptor exceeds FD_SETSIZE",
            ));
        }
        if self.fds.insert(fd, (token, interest)).is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "descriptor already registered",
            ));
        }
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        match self.fds.get_mut(&fd) {
            Some(entry) => {
                *entry = (token, interest);
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "descriptor not registered",
            )),
        }
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        match self.fds.remove(&fd) {
            Some(_) => Ok(()),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "descriptor not registered",
            )),
        }
    }

    fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        let mut readfds: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut writefds: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut errorfds: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut readfds);
            libc::FD_ZERO(&mut writefds);
            libc::FD_ZERO(&mut errorfds);
        }

        let mut nfds = 0;
        for (&fd, &(_, interest)) in &self.fds {
            unsafe {
                if interest.is_readable() {
                    libc::FD_SET(fd, &mut readfds);
                }
                if interest.is_writable() {
                    libc::FD_SET(fd, &mut writefds);
                }
                // Errors are always watched.
                libc::FD_SET(fd, &mut errorfds);
            }
            nfds = nfds.max(fd + 1);
        }

        let mut tv;
        let tv_ptr = match timeout {
            Some(to) => {
                tv = libc::timeval {
                    tv_sec: to.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
                    tv_usec: to.subsec_micros() as libc::suseconds_t,
                };
                &mut tv as *mut libc::timeval
            }
            None => ptr::null_mut(),
        };

        let cnt = match syscall!(select(
            nfds,
            &mut readfds,
            &mut writefds,
            &mut errorfds,
            tv_ptr,
        )) {
            Ok(cnt) => cnt,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => return Err(err),
        };
        if cnt == 0 {
            return Ok(());
        }

        for (&fd, &(token, _)) in &self.fds {
            let mut ready: Option<Interest> = None;
            let mut add = |int: Interest| ready = Some(ready.map_or(int, |r| r | int));
            unsafe {
                if libc::FD_ISSET(fd, &readfds) {
                    add(Interest::READABLE);
                }
                if libc::FD_ISSET(fd, &writefds) {
                    add(Interest::WRITABLE);
                }
                if libc::FD_ISSET(fd, &errorfds) {
                    add(Interest::ERROR);
                }
            }
            if let Some(ready) = ready {
                events.push(Event::new(token, ready));
                if events.len() == events.capacity() {
                    break;
                }
            }
        }
        Ok(())
    }

    fn waker(&mut self) -> io::Result<Waker> {
        let waker = Arc::new(PipeWaker::new()?);
        self.add(waker.as_raw_fd(), WAKE_TOKEN, Interest::READABLE)?;
        Ok(Waker::new(waker))
    }
}
