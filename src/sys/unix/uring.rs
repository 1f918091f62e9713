//! io_uring backend.
//!
//! Registered descriptors are watched with multishot `POLL_ADD`, so one SQE
//! keeps delivering readiness completions. The kernel signals the end of a
//! multishot run by clearing the MORE flag on a CQE; a fresh poll SQE is
//! submitted in that case. Interest changes are `POLL_REMOVE` + `POLL_ADD`
//! pairs; the cancellation CQE comes back as `-ECANCELED` and is dropped.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use io_uring::{cqueue, opcode, squeue, types, IoUring};

use super::waker;
use crate::backend::Backend;
use crate::event::{Event, Events};
use crate::token::WAKE_TOKEN;
use crate::{Interest, Token, Waker};

// user_data of helper SQEs (poll removals) whose completions carry no event.
const SKIP_DATA: u64 = u64::MAX;

pub(crate) struct Uring {
    ring: IoUring,
    // fd -> registration; poll SQEs carry the fd as user_data.
    by_fd: HashMap<RawFd, (Token, Interest)>,
}

impl Uring {
    pub(crate) fn new(max_events: usize) -> io::Result<Uring> {
        let entries = max_events.next_power_of_two().clamp(8, 4096) as u32;
        let ring = IoUring::new(entries)?;
        // Timed waits go through submit_with_args; without EXT_ARG the ring
        // cannot express them and epoll is the better choice.
        if !ring.params().is_feature_ext_arg() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "io_uring lacks IORING_FEAT_EXT_ARG",
            ));
        }
        Ok(Uring {
            ring,
            by_fd: HashMap::new(),
        })
    }

    fn push_sqe(&mut self, sqe: &squeue::Entry) -> io::Result<()> {
        loop {
            // The entry holds no buffers, only an fd and a poll mask.
            let res = unsafe { self.ring.submission().push(sqe) };
            match res {
                Ok(()) => return Ok(()),
                // Queue full: flush to the kernel and retry.
                Err(_) => {
                    self.ring.submit()?;
                }
            }
        }
    }

    fn push_poll(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let sqe = opcode::PollAdd::new(types::Fd(fd), interest_to_poll(interest))
            .multi(true)
            .build()
            .user_data(fd as u64);
        self.push_sqe(&sqe)
    }

    fn push_cancel(&mut self, fd: RawFd) -> io::Result<()> {
        let sqe = opcode::PollRemove::new(fd as u64)
            .build()
            .user_data(SKIP_DATA);
        self.push_sqe(&sqe)
    }
}

fn interest_to_poll(interest: Interest) -> u32 {
    let mut mask = (libc::POLLERR | libc::POLLHUP | libc::POLLRDHUP) as u32;
    if interest.is_readable() {
        mask |= libc::POLLIN as u32;
    }
    if interest.is_writable() {
        mask |= libc::POLLOUT as u32;
    }
    mask
}

fn poll_to_ready(revents: u32) -> Option<Interest> {
    let bits = revents as libc::c_int as libc::c_short;
    let mut ready: Option<Interest> = None;
    let mut add = |int: Interest| ready = Some(ready.map_or(int, |r| r | int));
    if bits & libc::POLLIN != 0 {
        add(Interest::READABLE);
    }
    if bits & libc::POLLOUT != 0 {
        add(Interest::WRITABLE);
    }
    if bits & libc::POLLERR != 0 {
        add(Interest::ERROR);
    }
    if bits & (libc::POLLHUP | libc::POLLRDHUP) != 0 {
        add(Interest::HANGUP);
    }
    ready
}

impl Backend for Uring {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn add(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        if self.by_fd.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "descriptor already registered",
            ));
        }
        self.by_fd.insert(fd, (token, interest));
        self.push_poll(fd, interest)
    }

    fn modify(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        match self.by_fd.get_mut(&fd) {
            Some(entry) => *entry = (token, interest),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "descriptor not registered",
                ))
            }
        }
        self.push_cancel(fd)?;
        self.push_poll(fd, interest)
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        if self.by_fd.remove(&fd).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "descriptor not registered",
            ));
        }
        self.push_cancel(fd)
    }

    fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        let wait = match timeout {
            Some(to) if to.is_zero() => self.ring.submit().map(drop),
            Some(to) => {
                let ts = types::Timespec::new()
                    .sec(to.as_secs())
                    .nsec(to.subsec_nanos());
                let args = types::SubmitArgs::new().timespec(&ts);
                self.ring.submitter().submit_with_args(1, &args).map(drop)
            }
            None => self.ring.submit_and_wait(1).map(drop),
        };
        match wait {
            Ok(()) => {}
            Err(ref err)
                if matches!(err.raw_os_error(), Some(libc::ETIME) | Some(libc::EBUSY))
                    || err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }

        let mut rearm: Vec<RawFd> = Vec::new();
        for cqe in self.ring.completion() {
            let data = cqe.user_data();
            if data == SKIP_DATA {
                continue;
            }
            let fd = data as RawFd;
            let (token, _) = match self.by_fd.get(&fd) {
                Some(&reg) => reg,
                // Completion raced a deregistration.
                None => continue,
            };

            if cqe.result() < 0 {
                if -cqe.result() == libc::ECANCELED {
                    continue;
                }
                if token != WAKE_TOKEN {
                    events.push(Event::new(token, Interest::ERROR));
                }
                continue;
            }

            if let Some(ready) = poll_to_ready(cqe.result() as u32) {
                events.push(Event::new(token, ready));
            }
            // Terminal completion of a multishot poll: the kernel will send
            // nothing further for this SQE, so arm a fresh one.
            if !cqueue::more(cqe.flags()) {
                rearm.push(fd);
            }
        }

        for fd in rearm {
            if let Some(&(_, interest)) = self.by_fd.get(&fd) {
                self.push_poll(fd, interest)?;
            }
        }
        Ok(())
    }

    fn waker(&mut self) -> io::Result<Waker> {
        let (waker, fd) = waker::fd_waker()?;
        self.add(fd, WAKE_TOKEN, Interest::READABLE)?;
        Ok(Waker::new(waker))
    }
}
