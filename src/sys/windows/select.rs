//! WinSock `select` fallback backend.

use std::collections::HashMap;
use std::io;
use std::os::windows::io::RawSocket;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use windows_sys::Win32::Networking::WinSock::{self, FD_SET, SOCKET, TIMEVAL};

use crate::backend::Backend;
use crate::event::{Event, Events};
use crate::token::WAKE_TOKEN;
use crate::waker::Waker;
use crate::{Interest, Token};

use super::waker::UdpPairWaker;

const FD_SETSIZE: usize = 64;

fn fd_zero(set: &mut FD_SET) {
    set.fd_count = 0;
}

fn fd_push(set: &mut FD_SET, socket: SOCKET) {
    if (set.fd_count as usize) < set.fd_array.len() {
        set.fd_array[set.fd_count as usize] = socket;
        set.fd_count += 1;
    }
}

fn fd_has(set: &FD_SET, socket: SOCKET) -> bool {
    set.fd_array[..set.fd_count as usize].contains(&socket)
}

pub(crate) struct WsaSelect {
    fds: HashMap<RawSocket, (Token, Interest)>,
}

impl WsaSelect {
    pub(crate) fn new() -> io::Result<WsaSelect> {
        super::init();
        Ok(WsaSelect {
            fds: HashMap::new(),
        })
    }
}

impl Backend for WsaSelect {
    fn name(&self) -> &'static str {
        "select"
    }

    fn add(&mut self, fd: RawSocket, token: Token, interest: Interest) -> io::Result<()> {
        if self.fds.len() >= FD_SETSIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "select set is full",
            ));
        }
        if self.fds.insert(fd, (token, interest)).is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "socket already registered",
            ));
        }
        Ok(())
    }

    fn modify(&mut self, fd: RawSocket, token: Token, interest: Interest) -> io::Result<()> {
        match self.fds.get_mut(&fd) {
            Some(entry) => {
                *entry = (token, interest);
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "socket not registered",
            )),
        }
    }

    fn remove(&mut self, fd: RawSocket) -> io::Result<()> {
        match self.fds.remove(&fd) {
            Some(_) => Ok(()),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "socket not registered",
            )),
        }
    }

    fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        let mut readfds: FD_SET = unsafe { std::mem::zeroed() };
        let mut writefds: FD_SET = unsafe { std::mem::zeroed() };
        let mut errorfds: FD_SET = unsafe { std::mem::zeroed() };
        fd_zero(&mut readfds);
        fd_zero(&mut writefds);
        fd_zero(&mut errorfds);

        for (&fd, &(_, interest)) in &self.fds {
            let socket = fd as SOCKET;
            if interest.is_readable() {
                fd_push(&mut readfds, socket);
            }
            if interest.is_writable() {
                fd_push(&mut writefds, socket);
            }
            fd_push(&mut errorfds, socket);
        }

        let mut tv;
        let tv_ptr = match timeout {
            Some(to) => {
                tv = TIMEVAL {
                    tv_sec: to.as_secs().min(i32::MAX as u64) as i32,
                    tv_usec: to.subsec_micros() as i32,
                };
                &mut tv as *mut TIMEVAL
            }
            None => ptr::null_mut(),
        };

        let cnt = unsafe {
            WinSock::select(0, &mut readfds, &mut writefds, &mut errorfds, tv_ptr)
        };
        if cnt == WinSock::SOCKET_ERROR {
            return Err(io::Error::from_raw_os_error(unsafe {
                WinSock::WSAGetLastError()
            }));
        }
        if cnt == 0 {
            return Ok(());
        }

        for (&fd, &(token, _)) in &self.fds {
            let socket = fd as SOCKET;
            let mut ready: Option<Interest> = None;
            let mut add = |int: Interest| ready = Some(ready.map_or(int, |r| r | int));
            if fd_has(&readfds, socket) {
                add(Interest::READABLE);
            }
            if fd_has(&writefds, socket) {
                add(Interest::WRITABLE);
            }
            if fd_has(&errorfds, socket) {
                add(Interest::ERROR);
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
        let waker = Arc::new(UdpPairWaker::new()?);
        self.add(waker.raw(), WAKE_TOKEN, Interest::READABLE)?;
        Ok(Waker::new(waker))
    }
}
