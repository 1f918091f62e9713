//! I/O completion port backend.
//!
//! The completion model proper: `add` associates a socket with the port
//! (keyed by token) before any overlapped operation is posted, the drivers
//! post real `AcceptEx`/`ConnectEx`/`WSARecv`/`WSASend`/`WSASendTo`
//! operations through [`super::overlapped`], and `poll` reaps their
//! completions with the transferred byte count plus the per-operation
//! context pointer. No interest bookkeeping exists here — what to post
//! next is the driver's business, which is exactly the readiness/completion
//! split the two backend families differ by.

use std::collections::HashSet;
use std::io;
use std::os::windows::io::RawSocket;
use std::sync::Arc;
use std::time::Duration;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT};
use windows_sys::Win32::Networking::WinSock::SOCKET;
use windows_sys::Win32::System::IO::{
    CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatusEx, OVERLAPPED_ENTRY,
};

use super::overlapped::{self, OpKind};
use super::waker::IocpWaker;
use crate::backend::{millis, Backend};
use crate::event::{Event, Events};
use crate::token::WAKE_TOKEN;
use crate::waker::Waker;
use crate::{Interest, Token};

const WAKE_KEY: usize = usize::MAX;

pub(crate) struct Iocp {
    port: HANDLE,
    capacity: usize,
    associated: HashSet<RawSocket>,
}

// The port handle is process-global and documented thread-safe.
unsafe impl Send for Iocp {}

impl Iocp {
    pub(crate) fn new(max_events: usize) -> io::Result<Iocp> {
        super::init();
        let port =
            unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, 1) };
        if port.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Iocp {
            port,
            capacity: max_events.max(8),
            associated: HashSet::new(),
        })
    }
}

impl Backend for Iocp {
    fn name(&self) -> &'static str {
        "iocp"
    }

    fn is_completion(&self) -> bool {
        true
    }

    /// Associate `fd` with the port under `token`. Must happen before the
    /// driver posts the socket's first overlapped operation; the interest
    /// mask is meaningless on a completion port and ignored.
    fn add(&mut self, fd: RawSocket, token: Token, _interest: Interest) -> io::Result<()> {
        if self.associated.contains(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "socket already associated",
            ));
        }
        let ret =
            unsafe { CreateIoCompletionPort(fd as SOCKET as HANDLE, self.port, token.0, 0) };
        if ret.is_null() {
            return Err(io::Error::last_os_error());
        }
        self.associated.insert(fd);
        Ok(())
    }

    /// Associations carry no interest state to change.
    fn modify(&mut self, _fd: RawSocket, _token: Token, _interest: Interest) -> io::Result<()> {
        Ok(())
    }

    /// There is no disassociation call; cancel whatever is in flight so
    /// the outstanding contexts drain back through `poll` and release
    /// their handle references.
    fn remove(&mut self, fd: RawSocket) -> io::Result<()> {
        if !self.associated.remove(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "socket not associated",
            ));
        }
        unsafe { CancelIoEx(fd as SOCKET as HANDLE, std::ptr::null()) };
        Ok(())
    }

    fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();
        let timeout_ms = timeout
            .map(|to| millis(to).min(u32::MAX as u64 - 1) as u32)
            .unwrap_or(u32::MAX);

        let mut entries: Vec<OVERLAPPED_ENTRY> =
            vec![unsafe { std::mem::zeroed() }; self.capacity];
        let mut removed: u32 = 0;
        let ok = unsafe {
            GetQueuedCompletionStatusEx(
                self.port,
                entries.as_mut_ptr(),
                entries.len() as u32,
                &mut removed,
                timeout_ms,
                0,
            )
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(WAIT_TIMEOUT as i32) {
                return Ok(());
            }
            return Err(err);
        }

        for entry in &entries[..removed as usize] {
            if entry.lpCompletionKey == WAKE_KEY {
                events.push(Event::new(WAKE_TOKEN, Interest::READABLE));
                continue;
            }
            let overlapped = entry.lpOverlapped as usize;
            if overlapped == 0 {
                continue;
            }
            // The context embeds the owning token; the completion key is
            // only the association-time copy of it.
            let ready = match unsafe { overlapped::peek_kind(overlapped) } {
                OpKind::Accept | OpKind::Read | OpKind::RecvFrom => Interest::READABLE,
                OpKind::Connect | OpKind::Write | OpKind::SendTo => Interest::WRITABLE,
            };
            events.push(Event::completion(
                Token(entry.lpCompletionKey),
                ready,
                entry.dwNumberOfBytesTransferred as usize,
                overlapped,
            ));
        }
        Ok(())
    }

    fn waker(&mut self) -> io::Result<Waker> {
        Ok(Waker::new(Arc::new(IocpWaker::new(self.port, WAKE_KEY))))
    }
}

impl Drop for Iocp {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.port) };
    }
}
