//! Level-triggered epoll backend.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::syscall;
use super::waker;
use crate::backend::{millis, Backend};
use crate::event::{Event, Events};
use crate::token::WAKE_TOKEN;
use crate::{Interest, Token, Waker};

pub(crate) struct Epoll {
    epfd: RawFd,
    buf: Vec<libc::epoll_event>,
}

impl Epoll {
    pub(crate) fn new(max_events: usize) -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Epoll {
            epfd,
            buf: Vec::with_capacity(max_events.max(8)),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: usize::from(token) as u64,
        };
        syscall!(epoll_ctl(self.epfd, op, fd, &mut ev)).map(drop)
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    // No EPOLLET or EPOLLONESHOT: interests are level-triggered and
    // modified explicitly. EPOLLRDHUP is always watched so a half-closed
    // peer surfaces as hangup rather than a silent stall.
    let mut kind = libc::EPOLLRDHUP;
    if interest.is_readable() {
        kind |= libc::EPOLLIN;
    }
    if interest.is_writable() {
        kind |= libc::EPOLLOUT;
    }
    kind as u32
}

fn epoll_to_ready(events: u32) -> Option<Interest> {
    let bits = events as libc::c_int;
    let mut ready: Option<Interest> = None;
    let mut add = |int: Interest| ready = Some(ready.map_or(int, |r| r | int));
    if bits & libc::EPOLLIN != 0 {
        add(Interest::READABLE);
    }
    if bits & libc::EPOLLOUT != 0 {
        add(Interest::WRITABLE);
    }
    if bits & libc::EPOLLERR != 0 {
        add(Interest::ERROR);
    }
    if bits & (libc::EPOLLRDHUP | libc::EPOLLHUP) != 0 {
        add(Interest::HANGUP);
    }
    ready
}

impl Backend for Epoll {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn add(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    fn modify(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        // Linux < 2.6.9 required a non-null event pointer for EPOLL_CTL_DEL.
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev)).map(drop)
    }

    fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout
            .map(|to| std::cmp::min(millis(to), i32::MAX as u64) as i32)
            .unwrap_or(-1);

        events.clear();
        let cnt = match syscall!(epoll_wait(
            self.epfd,
            self.buf.as_mut_ptr(),
            self.buf.capacity() as i32,
            timeout_ms,
        )) {
            Ok(cnt) => cnt as usize,
            // Interrupted by a signal: report no events, the loop retries.
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => return Err(err),
        };
        unsafe { self.buf.set_len(cnt) };

        for ev in &self.buf {
            if let Some(ready) = epoll_to_ready(ev.events) {
                events.push(Event::new(Token(ev.u64 as usize), ready));
            }
        }
        Ok(())
    }

    fn waker(&mut self) -> io::Result<Waker> {
        // The loop keeps the returned waker alive for the backend's whole
        // lifetime.
        let (waker, fd) = waker::fd_waker()?;
        self.add(fd, WAKE_TOKEN, Interest::READABLE)?;
        Ok(Waker::new(waker))
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        let _ = syscall!(close(self.epfd));
    }
}
