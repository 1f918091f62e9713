//! kqueue backend for the BSDs and macOS.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use super::syscall;
use crate::backend::Backend;
use crate::event::{Event, Events};
use crate::token::WAKE_TOKEN;
use crate::waker::Wake;
use crate::{Interest, Token, Waker};

// Ident of the EVFILT_USER wake event.
const WAKE_IDENT: libc::uintptr_t = 0;

pub(crate) struct Kqueue {
    kq: RawFd,
    fds: HashMap<RawFd, (Token, Interest)>,
    buf: Vec<libc::kevent>,
}

impl Kqueue {
    pub(crate) fn new(max_events: usize) -> io::Result<Kqueue> {
        let kq = syscall!(kqueue())?;
        syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(Kqueue {
            kq,
            fds: HashMap::new(),
            buf: Vec::with_capacity(max_events.max(8)),
        })
    }

    fn change(&self, changes: &[libc::kevent]) -> io::Result<()> {
        syscall!(kevent(
            self.kq,
            changes.as_ptr(),
            changes.len() as libc::c_int,
            ptr::null_mut(),
            0,
            ptr::null(),
        ))
        .map(drop)
    }

    fn filter_changes(
        fd: RawFd,
        token: Token,
        old: Option<Interest>,
        new: Option<Interest>,
    ) -> Vec<libc::kevent> {
        let mut changes = Vec::with_capacity(2);
        let ev = |filter: i16, add: bool| libc::kevent {
            ident: fd as libc::uintptr_t,
            filter,
            flags: if add { libc::EV_ADD } else { libc::EV_DELETE },
            fflags: 0,
            data: 0,
            udata: usize::from(token) as _,
        };
        let was_r = old.is_some_and(|i| i.is_readable());
        let was_w = old.is_some_and(|i| i.is_writable());
        let now_r = new.is_some_and(|i| i.is_readable());
        let now_w = new.is_some_and(|i| i.is_writable());
        if now_r != was_r {
            changes.push(ev(libc::EVFILT_READ, now_r));
        }
        if now_w != was_w {
            changes.push(ev(libc::EVFILT_WRITE, now_w));
        }
        changes
    }
}

impl Backend for Kqueue {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn add(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        if self.fds.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "descriptor already registered",
            ));
        }
        self.change(&Kqueue::filter_changes(fd, token, None, Some(interest)))?;
        self.fds.insert(fd, (token, interest));
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let old = match self.fds.get(&fd) {
            Some(&(_, old)) => old,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "descriptor not registered",
                ))
            }
        };
        self.change(&Kqueue::filter_changes(fd, token, Some(old), Some(interest)))?;
        self.fds.insert(fd, (token, interest));
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        let (token, old) = match self.fds.remove(&fd) {
            Some(reg) => reg,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "descriptor not registered",
                ))
            }
        };
        // The descriptor may already be gone from the kqueue if it was
        // closed; ENOENT here is not an error.
        match self.change(&Kqueue::filter_changes(fd, token, Some(old), None)) {
            Ok(()) => Ok(()),
            Err(ref err) if err.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        let mut ts;
        let ts_ptr = match timeout {
            Some(to) => {
                ts = libc::timespec {
                    tv_sec: to.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
                    tv_nsec: to.subsec_nanos() as libc::c_long,
                };
                &ts as *const libc::timespec
            }
            None => ptr::null(),
        };

        let cnt = match syscall!(kevent(
            self.kq,
            ptr::null(),
            0,
            self.buf.as_mut_ptr(),
            self.buf.capacity() as libc::c_int,
            ts_ptr,
        )) {
            Ok(cnt) => cnt as usize,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => return Err(err),
        };
        unsafe { self.buf.set_len(cnt) };

        for kev in &self.buf {
            if kev.filter == libc::EVFILT_USER && kev.ident == WAKE_IDENT {
                events.push(Event::new(WAKE_TOKEN, Interest::READABLE));
                continue;
            }
            let token = Token(kev.udata as usize);
            let mut ready: Option<Interest> = None;
            let mut add = |int: Interest| ready = Some(ready.map_or(int, |r| r | int));
            match kev.filter {
                libc::EVFILT_READ => add(Interest::READABLE),
                libc::EVFILT_WRITE => add(Interest::WRITABLE),
                _ => {}
            }
            if kev.flags & libc::EV_ERROR != 0 && kev.data != 0 {
                add(Interest::ERROR);
            }
            if kev.flags & libc::EV_EOF != 0 {
                add(Interest::HANGUP);
            }
            if let Some(ready) = ready {
                events.push(Event::new(token, ready));
            }
        }
        Ok(())
    }

    fn waker(&mut self) -> io::Result<Waker> {
        let ev = libc::kevent {
            ident: WAKE_IDENT,
            filter: libc::EVFILT_USER,
            flags: libc::EV_ADD | libc::EV_CLEAR,
            fflags: 0,
            data: 0,
            udata: usize::from(WAKE_TOKEN) as _,
        };
        self.change(std::slice::from_ref(&ev))?;
        // The waker holds its own descriptor to the same kqueue so it stays
        // valid for as long as any clone of it is alive.
        let dup = syscall!(dup(self.kq))?;
        Ok(Waker::new(Arc::new(KqueueWaker { kq: dup })))
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        let _ = syscall!(close(self.kq));
    }
}

/// Waker triggering the kqueue's EVFILT_USER event. kevent(2) is safe to
/// call on the same kqueue from any thread.
#[derive(Debug)]
struct KqueueWaker {
    kq: RawFd,
}

impl Wake for KqueueWaker {
    fn wake(&self) -> io::Result<()> {
        let ev = libc::kevent {
            ident: WAKE_IDENT,
            filter: libc::EVFILT_USER,
            flags: 0,
            fflags: libc::NOTE_TRIGGER,
            data: 0,
            udata: usize::from(WAKE_TOKEN) as _,
        };
        syscall!(kevent(
            self.kq,
            &ev,
            1,
            std::ptr::null_mut(),
            0,
            std::ptr::null(),
        ))
        .map(drop)
    }
}

impl Drop for KqueueWaker {
    fn drop(&mut self) {
        let _ = syscall!(close(self.kq));
    }
}
