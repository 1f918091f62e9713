//! TCP handle and readiness-driven stream driver.
//!
//! State machine: New -> Bound -> Listening, or New/Bound -> Connecting ->
//! Connected -> ShutdownPending -> Closed. On readiness backends the
//! driver performs the I/O itself when the backend reports the socket
//! ready; on the completion backend it posts overlapped operations
//! instead.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::event::Event;
use crate::event_loop::EventLoop;
use crate::handle::{impl_handle_common, HandleKind};
use crate::macros::trace;
use crate::net::{clone_err, connect_in_progress, interrupted, would_block};
use crate::sys::net::Socket;
use crate::sys::SysFd;
use crate::{Interest, Token};

const DEFAULT_READ_SIZE: usize = 64 * 1024;

pub(crate) type ConnectionCb = Box<dyn FnMut(&mut EventLoop, Tcp, io::Result<()>)>;
pub(crate) type ConnectCb = Box<dyn FnOnce(&mut EventLoop, Tcp, io::Result<()>)>;
pub(crate) type ReadCb = Box<dyn FnMut(&mut EventLoop, Tcp, io::Result<usize>, &[u8])>;
pub(crate) type WriteCb = Box<dyn FnOnce(&mut EventLoop, Tcp, io::Result<()>)>;
pub(crate) type ShutdownCb = Box<dyn FnOnce(&mut EventLoop, Tcp, io::Result<()>)>;
pub(crate) type AllocFn = Box<dyn FnMut(usize) -> Vec<u8>>;

/// Options applied at [`Tcp::bind`] time.
#[derive(Copy, Clone, Debug, Default)]
pub struct TcpBindFlags {
    pub reuse_addr: bool,
    /// `SO_REUSEPORT` where the platform has it; lets a worker fleet share
    /// one listening address.
    pub reuse_port: bool,
}

struct WriteRequest {
    buf: Vec<u8>,
    /// Bytes already handed to the kernel; carries partial-send progress.
    offset: usize,
    cb: Option<WriteCb>,
}

pub(crate) struct TcpState {
    pub(crate) socket: Option<Socket>,
    registered: Option<Interest>,
    listening: bool,
    connecting: bool,
    connected: bool,
    reading: bool,
    shutdown_pending: bool,
    connection_cb: Option<ConnectionCb>,
    connect_cb: Option<ConnectCb>,
    read_cb: Option<ReadCb>,
    alloc: Option<AllocFn>,
    shutdown_cb: Option<ShutdownCb>,
    write_queue: VecDeque<WriteRequest>,
    pending_accepts: VecDeque<(Socket, SocketAddr)>,
    /// One posted WSARecv in flight (completion backend).
    #[cfg(windows)]
    recv_pending: bool,
    /// One posted WSASend in flight (completion backend); the next is
    /// chained when its completion is reaped.
    #[cfg(windows)]
    send_pending: bool,
    /// Outstanding pre-posted AcceptEx contexts (completion backend).
    #[cfg(windows)]
    accept_posted: usize,
}

impl TcpState {
    fn new() -> TcpState {
        TcpState {
            socket: None,
            registered: None,
            listening: false,
            connecting: false,
            connected: false,
            reading: false,
            shutdown_pending: false,
            connection_cb: None,
            connect_cb: None,
            read_cb: None,
            alloc: None,
            shutdown_cb: None,
            write_queue: VecDeque::new(),
            pending_accepts: VecDeque::new(),
            #[cfg(windows)]
            recv_pending: false,
            #[cfg(windows)]
            send_pending: false,
            #[cfg(windows)]
            accept_posted: 0,
        }
    }

    /// True when no kernel-owned send is outstanding. Always true on
    /// readiness backends, where the driver performs sends itself.
    fn sends_idle(&self) -> bool {
        #[cfg(windows)]
        if self.send_pending {
            return false;
        }
        true
    }

    /// Drop every callback and queued request so nothing fires after
    /// close; reports the fd to deregister, if any.
    pub(crate) fn teardown(&mut self) -> Option<SysFd> {
        self.connection_cb = None;
        self.connect_cb = None;
        self.read_cb = None;
        self.alloc = None;
        self.shutdown_cb = None;
        self.write_queue.clear();
        self.pending_accepts.clear();
        self.listening = false;
        self.connecting = false;
        self.reading = false;
        self.registered
            .take()
            .and_then(|_| self.socket.as_ref().map(Socket::raw))
    }

    /// Interest set the driver currently needs from the backend.
    fn desired(&self) -> Option<Interest> {
        if self.listening {
            return Some(Interest::READABLE);
        }
        if self.connecting {
            return Some(Interest::WRITABLE);
        }
        let mut want: Option<Interest> = None;
        if self.reading {
            want = Some(Interest::READABLE);
        }
        if !self.write_queue.is_empty() {
            want = Some(want.map_or(Interest::WRITABLE, |w| w | Interest::WRITABLE));
        }
        want
    }
}

/// A TCP stream or listener handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Tcp {
    pub(crate) token: Token,
}

impl_handle_common!(Tcp);

impl Tcp {
    pub fn new(lp: &mut EventLoop) -> Tcp {
        Tcp {
            token: lp.add_handle(HandleKind::Tcp(TcpState::new())),
        }
    }

    /// Create the socket for `addr`'s family and bind it.
    pub fn bind(
        &self,
        lp: &mut EventLoop,
        addr: SocketAddr,
        flags: TcpBindFlags,
    ) -> io::Result<()> {
        let state = state_mut(lp, self.token)?;
        if state.socket.is_some() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "already bound"));
        }
        let socket = Socket::stream(&addr)?;
        if flags.reuse_addr {
            socket.set_reuseaddr(true)?;
        }
        #[cfg(unix)]
        if flags.reuse_port {
            socket.set_reuseport(true)?;
        }
        socket.bind(&addr)?;
        state.socket = Some(socket);
        Ok(())
    }

    /// Move to Listening and watch for incoming connections. `cb` fires
    /// once per accepted connection; claim it with [`Tcp::accept`].
    pub fn listen<F>(&self, lp: &mut EventLoop, backlog: u32, cb: F) -> io::Result<()>
    where
        F: FnMut(&mut EventLoop, Tcp, io::Result<()>) + 'static,
    {
        {
            let state = state_mut(lp, self.token)?;
            let socket = state
                .socket
                .as_ref()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "socket not bound"))?;
            if state.connected || state.connecting {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "socket is a stream",
                ));
            }
            socket.listen(backlog)?;
            state.listening = true;
            state.connection_cb = Some(Box::new(cb));
        }
        #[cfg(windows)]
        if lp.backend.is_completion() {
            ensure_associated(lp, self.token)?;
            fill_accept_pool(lp, self.token)?;
            lp.activate(self.token);
            return Ok(());
        }
        update_registration(lp, self.token)
    }

    /// Take one pending accepted connection as a new handle.
    pub fn accept(&self, lp: &mut EventLoop) -> io::Result<Tcp> {
        let (socket, peer) = {
            let state = state_mut(lp, self.token)?;
            state
                .pending_accepts
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "no pending connection"))?
        };
        trace!("accepted connection from {}", peer);
        let mut accepted = TcpState::new();
        accepted.socket = Some(socket);
        accepted.connected = true;
        Ok(Tcp {
            token: lp.add_handle(HandleKind::Tcp(accepted)),
        })
    }

    /// Start a connect; `cb` fires once with the outcome.
    pub fn connect<F>(&self, lp: &mut EventLoop, addr: SocketAddr, cb: F) -> io::Result<()>
    where
        F: FnOnce(&mut EventLoop, Tcp, io::Result<()>) + 'static,
    {
        #[cfg(windows)]
        if lp.backend.is_completion() {
            return self.connect_completion(lp, addr, Box::new(cb));
        }
        let handle = *self;
        let mut cb = Some(Box::new(cb) as ConnectCb);
        let immediate = {
            let state = state_mut(lp, self.token)?;
            if state.listening || state.connected || state.connecting {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "bad state"));
            }
            if state.socket.is_none() {
                state.socket = Some(Socket::stream(&addr)?);
            }
            let socket = state.socket.as_ref().expect("just created");
            match socket.connect(&addr) {
                // Loopback connects can finish (or be refused)
                // synchronously; the outcome still arrives through the
                // callback, never from this frame.
                Ok(()) => {
                    state.connected = true;
                    Some(Ok(()))
                }
                Err(ref err) if connect_in_progress(err) || would_block(err) => {
                    state.connecting = true;
                    state.connect_cb = cb.take();
                    None
                }
                Err(err) => Some(Err(err)),
            }
        };
        if let Some(status) = immediate {
            let cb = cb.take().expect("not stored");
            // Deferred so the callback never runs inside the caller's
            // frame; pending work keeps the loop alive until it fires.
            lp.queue_work(move |lp| cb(lp, handle, status));
            return Ok(());
        }
        update_registration(lp, self.token)
    }

    /// Deliver inbound data through `cb` using arena buffers. `Ok(0)`
    /// means the peer closed; reading stops automatically then and on
    /// error.
    pub fn read_start<F>(&self, lp: &mut EventLoop, cb: F) -> io::Result<()>
    where
        F: FnMut(&mut EventLoop, Tcp, io::Result<usize>, &[u8]) + 'static,
    {
        self.read_start_inner(lp, None, Box::new(cb))
    }

    /// Like [`Tcp::read_start`] with a caller-provided buffer allocator.
    pub fn read_start_with<A, F>(&self, lp: &mut EventLoop, alloc: A, cb: F) -> io::Result<()>
    where
        A: FnMut(usize) -> Vec<u8> + 'static,
        F: FnMut(&mut EventLoop, Tcp, io::Result<usize>, &[u8]) + 'static,
    {
        self.read_start_inner(lp, Some(Box::new(alloc)), Box::new(cb))
    }

    fn read_start_inner(
        &self,
        lp: &mut EventLoop,
        alloc: Option<AllocFn>,
        cb: ReadCb,
    ) -> io::Result<()> {
        {
            let state = state_mut(lp, self.token)?;
            if !state.connected {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"));
            }
            state.reading = true;
            state.read_cb = Some(cb);
            state.alloc = alloc;
        }
        #[cfg(windows)]
        if lp.backend.is_completion() {
            ensure_associated(lp, self.token)?;
            return pump_recv(lp, self.token);
        }
        update_registration(lp, self.token)
    }

    pub fn read_stop(&self, lp: &mut EventLoop) -> io::Result<()> {
        {
            let state = state_mut(lp, self.token)?;
            state.reading = false;
        }
        #[cfg(windows)]
        if lp.backend.is_completion() {
            // The in-flight receive drains on its own; its payload is
            // simply not delivered.
            return Ok(());
        }
        update_registration(lp, self.token)
    }

    /// Queue `buf` for transmission; no completion callback.
    pub fn write<B: Into<Vec<u8>>>(&self, lp: &mut EventLoop, buf: B) -> io::Result<()> {
        self.write_inner(lp, buf.into(), None)
    }

    /// Queue `buf` for transmission. `cb` fires exactly once, in
    /// submission order relative to other writes on this handle.
    pub fn write_with<B, F>(&self, lp: &mut EventLoop, buf: B, cb: F) -> io::Result<()>
    where
        B: Into<Vec<u8>>,
        F: FnOnce(&mut EventLoop, Tcp, io::Result<()>) + 'static,
    {
        self.write_inner(lp, buf.into(), Some(Box::new(cb)))
    }

    fn write_inner(&self, lp: &mut EventLoop, buf: Vec<u8>, cb: Option<WriteCb>) -> io::Result<()> {
        if buf.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty write"));
        }
        #[cfg(windows)]
        if lp.backend.is_completion() {
            return self.write_completion(lp, buf, cb);
        }
        let handle = *self;

        enum Outcome {
            Done(Option<WriteCb>),
            Failed(Option<WriteCb>, io::Error),
            Queued,
        }

        let outcome = {
            let state = state_mut(lp, self.token)?;
            if state.shutdown_pending {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "shutdown pending",
                ));
            }
            if !state.connected && !state.connecting {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"));
            }

            if state.connected && state.write_queue.is_empty() {
                // The queue is empty, so order cannot be violated by
                // sending right away.
                let socket = state.socket.as_ref().expect("connected implies socket");
                let mut offset = 0;
                let mut failure = None;
                while offset < buf.len() {
                    match socket.send(&buf[offset..]) {
                        Ok(n) => offset += n,
                        Err(ref err) if would_block(err) => break,
                        Err(ref err) if interrupted(err) => continue,
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                }
                if let Some(err) = failure {
                    Outcome::Failed(cb, err)
                } else if offset == buf.len() {
                    Outcome::Done(cb)
                } else {
                    state.write_queue.push_back(WriteRequest { buf, offset, cb });
                    Outcome::Queued
                }
            } else {
                state
                    .write_queue
                    .push_back(WriteRequest { buf, offset: 0, cb });
                Outcome::Queued
            }
        };

        match outcome {
            Outcome::Done(cb) => {
                if let Some(cb) = cb {
                    lp.queue_work(move |lp| cb(lp, handle, Ok(())));
                }
                Ok(())
            }
            Outcome::Failed(cb, err) => {
                if let Some(cb) = cb {
                    lp.queue_work(move |lp| cb(lp, handle, Err(err)));
                }
                Ok(())
            }
            Outcome::Queued => update_registration(lp, self.token),
        }
    }

    /// Half-close the write side once every queued write has completed.
    pub fn shutdown(&self, lp: &mut EventLoop) -> io::Result<()> {
        self.shutdown_inner(lp, None)
    }

    pub fn shutdown_with<F>(&self, lp: &mut EventLoop, cb: F) -> io::Result<()>
    where
        F: FnOnce(&mut EventLoop, Tcp, io::Result<()>) + 'static,
    {
        self.shutdown_inner(lp, Some(Box::new(cb)))
    }

    fn shutdown_inner(&self, lp: &mut EventLoop, cb: Option<ShutdownCb>) -> io::Result<()> {
        let handle = *self;
        let mut cb = cb;
        let immediate = {
            let state = state_mut(lp, self.token)?;
            if !state.connected {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"));
            }
            if state.shutdown_pending {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "shutdown already requested",
                ));
            }
            state.shutdown_pending = true;
            if state.write_queue.is_empty() && state.sends_idle() {
                Some(state.socket.as_ref().expect("connected").shutdown_write())
            } else {
                state.shutdown_cb = cb.take();
                None
            }
        };
        if let Some(res) = immediate {
            if let Some(cb) = cb.take() {
                lp.queue_work(move |lp| cb(lp, handle, res));
            }
        }
        Ok(())
    }

    pub fn local_addr(&self, lp: &mut EventLoop) -> io::Result<SocketAddr> {
        socket_ref(lp, self.token)?.local_addr()
    }

    pub fn peer_addr(&self, lp: &mut EventLoop) -> io::Result<SocketAddr> {
        socket_ref(lp, self.token)?.peer_addr()
    }

    pub fn set_nodelay(&self, lp: &mut EventLoop, on: bool) -> io::Result<()> {
        socket_ref(lp, self.token)?.set_nodelay(on)
    }

    /// Enable keepalive probes after `idle`, or disable with `None`.
    pub fn set_keepalive(&self, lp: &mut EventLoop, idle: Option<Duration>) -> io::Result<()> {
        socket_ref(lp, self.token)?.set_keepalive(idle)
    }

    pub fn set_reuseaddr(&self, lp: &mut EventLoop, on: bool) -> io::Result<()> {
        socket_ref(lp, self.token)?.set_reuseaddr(on)
    }

    pub fn set_ttl(&self, lp: &mut EventLoop, ttl: u32) -> io::Result<()> {
        socket_ref(lp, self.token)?.set_ttl(ttl)
    }

    /// Detach the connected socket as a blocking `std::net::TcpStream` and
    /// close this handle. Used to hand accepted connections to worker
    /// threads.
    #[cfg(unix)]
    pub fn detach(&self, lp: &mut EventLoop) -> io::Result<std::net::TcpStream> {
        use std::os::unix::io::FromRawFd;

        use crate::sys::unix::syscall;

        let (socket, registered) = {
            let state = state_mut(lp, self.token)?;
            if !state.connected {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"));
            }
            let socket = state
                .socket
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no socket"))?;
            (socket, state.registered.take().is_some())
        };
        if registered {
            let _ = lp.backend.remove(socket.raw());
            lp.deactivate(self.token);
        }
        lp.close_handle(self.token, None);
        let fd = socket.into_raw();
        // Back to blocking mode for the std consumer.
        let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
        syscall!(fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK))?;
        Ok(unsafe { std::net::TcpStream::from_raw_fd(fd) })
    }

    /// Detach the connected socket as a blocking `std::net::TcpStream` and
    /// close this handle.
    #[cfg(windows)]
    pub fn detach(&self, lp: &mut EventLoop) -> io::Result<std::net::TcpStream> {
        use std::os::windows::io::FromRawSocket;

        let (socket, registered) = {
            let state = state_mut(lp, self.token)?;
            if !state.connected {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"));
            }
            let socket = state
                .socket
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no socket"))?;
            (socket, state.registered.take().is_some())
        };
        if registered {
            let _ = lp.backend.remove(socket.raw());
            lp.deactivate(self.token);
        }
        lp.close_handle(self.token, None);
        socket.set_blocking()?;
        let raw = socket.into_raw();
        Ok(unsafe { std::net::TcpStream::from_raw_socket(raw) })
    }
}

fn state_mut(lp: &mut EventLoop, token: Token) -> io::Result<&mut TcpState> {
    match lp.handle_mut(token) {
        Some(slot) if !slot.closing => match &mut slot.kind {
            HandleKind::Tcp(state) => Ok(state),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a tcp handle",
            )),
        },
        _ => Err(io::Error::new(
            io::ErrorKind::NotFound,
            "handle closed or destroyed",
        )),
    }
}

fn socket_ref<'l>(lp: &'l mut EventLoop, token: Token) -> io::Result<&'l Socket> {
    state_mut(lp, token)?
        .socket
        .as_ref()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no socket"))
}

/// Sync the backend registration with the driver's desired interest set
/// and keep the active flag in step: a TCP handle is active exactly while
/// it needs backend events.
pub(crate) fn update_registration(lp: &mut EventLoop, token: Token) -> io::Result<()> {
    let (fd, current, want) = {
        let state = match state_mut(lp, token) {
            Ok(state) => state,
            Err(_) => return Ok(()),
        };
        let fd = match state.socket.as_ref() {
            Some(socket) => socket.raw(),
            None => return Ok(()),
        };
        (fd, state.registered, state.desired())
    };

    match (current, want) {
        (None, None) => {}
        (None, Some(interest)) => lp.backend.add(fd, token, interest)?,
        (Some(cur), Some(interest)) if cur != interest => {
            lp.backend.modify(fd, token, interest)?
        }
        (Some(_), Some(_)) => {}
        (Some(_), None) => lp.backend.remove(fd)?,
    }

    if let Ok(state) = state_mut(lp, token) {
        state.registered = want;
    }
    if want.is_some() {
        lp.activate(token);
    } else {
        lp.deactivate(token);
    }
    Ok(())
}

/// Backend event entry point for TCP handles.
pub(crate) fn on_event(lp: &mut EventLoop, event: &Event) {
    let token = event.token();
    let ready = event.readiness();

    let (listening, connecting) = match state_mut(lp, token) {
        Ok(state) => (state.listening, state.connecting),
        Err(_) => return,
    };

    if listening {
        if ready.is_readable() || ready.is_error() {
            on_acceptable(lp, token);
        }
        return;
    }

    if connecting {
        if ready.is_writable() || ready.is_error() || ready.is_hangup() {
            finish_connect(lp, token);
        }
        return;
    }

    if ready.is_error() {
        on_error(lp, token);
        return;
    }

    if ready.is_readable() {
        on_readable(lp, token);
    }
    if ready.is_writable() {
        on_writable(lp, token);
    }
    if ready.is_hangup() && !ready.is_readable() {
        // Peer hangup with no pending data: a read surfaces EOF.
        let reading = state_mut(lp, token).map(|s| s.reading).unwrap_or(false);
        if reading {
            on_readable(lp, token);
        }
    }
}

fn on_acceptable(lp: &mut EventLoop, token: Token) {
    let handle = Tcp { token };
    // One accept per readiness event; level-triggered backends re-arm for
    // queued connections.
    let status = {
        let Ok(state) = state_mut(lp, token) else {
            return;
        };
        let socket = state.socket.as_ref().expect("listening implies socket");
        match socket.accept() {
            Ok(pair) => {
                state.pending_accepts.push_back(pair);
                Ok(())
            }
            Err(ref err) if would_block(err) || interrupted(err) => return,
            Err(err) => Err(err),
        }
    };

    let cb = state_mut(lp, token).ok().and_then(|s| s.connection_cb.take());
    if let Some(mut cb) = cb {
        cb(lp, handle, status);
        if let Ok(state) = state_mut(lp, token) {
            if state.connection_cb.is_none() {
                state.connection_cb = Some(cb);
            }
        }
    }
}

fn finish_connect(lp: &mut EventLoop, token: Token) {
    let handle = Tcp { token };
    let (status, cb) = {
        let Ok(state) = state_mut(lp, token) else {
            return;
        };
        let socket = state.socket.as_ref().expect("connecting implies socket");
        let status = match socket.take_error() {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(err),
            Err(err) => Err(err),
        };
        state.connecting = false;
        state.connected = status.is_ok();
        (status, state.connect_cb.take())
    };

    let failed = status.is_err();
    let _ = update_registration(lp, token);
    if let Some(cb) = cb {
        cb(lp, handle, status);
    }
    if failed {
        fail_writes(lp, token, io::ErrorKind::NotConnected);
    } else {
        // Writes queued while connecting can flow now.
        on_writable(lp, token);
    }
}

fn on_readable(lp: &mut EventLoop, token: Token) {
    let handle = Tcp { token };
    let (mut cb, mut alloc) = {
        let Ok(state) = state_mut(lp, token) else {
            return;
        };
        if !state.reading {
            return;
        }
        let Some(cb) = state.read_cb.take() else {
            return;
        };
        (cb, state.alloc.take())
    };

    let mut buf = match alloc.as_mut() {
        Some(alloc) => alloc(DEFAULT_READ_SIZE),
        None => lp.arena().alloc(DEFAULT_READ_SIZE),
    };
    let arena_owned = alloc.is_none();

    let result = match state_mut(lp, token) {
        Ok(state) => match state.socket.as_ref() {
            Some(socket) => socket.recv(&mut buf),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no socket")),
        },
        Err(_) => {
            if arena_owned {
                lp.arena().release(buf);
            }
            return;
        }
    };

    match result {
        Ok(n) => {
            if n == 0 {
                // Peer closed; stop reading so the level-triggered backend
                // does not spin on EOF.
                if let Ok(state) = state_mut(lp, token) {
                    state.reading = false;
                }
            }
            cb(lp, handle, Ok(n), &buf[..n]);
        }
        Err(ref err) if would_block(err) || interrupted(err) => {}
        Err(err) => {
            if let Ok(state) = state_mut(lp, token) {
                state.reading = false;
            }
            cb(lp, handle, Err(err), &[]);
        }
    }

    if arena_owned {
        lp.arena().release(buf);
    }

    if let Ok(state) = state_mut(lp, token) {
        if state.read_cb.is_none() {
            state.read_cb = Some(cb);
        }
        if state.alloc.is_none() {
            state.alloc = alloc;
        }
    }
    let _ = update_registration(lp, token);
}

fn on_writable(lp: &mut EventLoop, token: Token) {
    let handle = Tcp { token };
    let mut completed: Vec<WriteCb> = Vec::new();
    let mut failure: Option<io::Error> = None;

    {
        let Ok(state) = state_mut(lp, token) else {
            return;
        };
        if !state.connected {
            return;
        }
        let socket = state.socket.as_ref().expect("connected implies socket");
        'drain: while let Some(head) = state.write_queue.front_mut() {
            while head.offset < head.buf.len() {
                match socket.send(&head.buf[head.offset..]) {
                    Ok(n) => head.offset += n,
                    Err(ref err) if would_block(err) => break 'drain,
                    Err(ref err) if interrupted(err) => continue,
                    Err(err) => {
                        failure = Some(err);
                        break 'drain;
                    }
                }
            }
            let done = state.write_queue.pop_front().expect("head exists");
            if let Some(cb) = done.cb {
                completed.push(cb);
            }
        }
    }

    // Completion callbacks fire in submission order.
    for cb in completed {
        cb(lp, handle, Ok(()));
    }

    if let Some(err) = failure {
        fail_writes_with(lp, token, err);
        return;
    }

    // Queue drained: perform a pending shutdown.
    let shutdown = {
        match state_mut(lp, token) {
            Ok(state)
                if state.write_queue.is_empty()
                    && state.sends_idle()
                    && state.shutdown_pending =>
            {
                let res = state
                    .socket
                    .as_ref()
                    .map(Socket::shutdown_write)
                    .unwrap_or_else(|| Err(io::Error::new(io::ErrorKind::NotConnected, "no socket")));
                state.shutdown_cb.take().map(|cb| (cb, res))
            }
            _ => None,
        }
    };
    if let Some((cb, res)) = shutdown {
        cb(lp, handle, res);
    }

    let _ = update_registration(lp, token);
}

fn on_error(lp: &mut EventLoop, token: Token) {
    let handle = Tcp { token };
    let (err, read_cb) = {
        let Ok(state) = state_mut(lp, token) else {
            return;
        };
        let err = state
            .socket
            .as_ref()
            .and_then(|s| s.take_error().ok().flatten())
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "socket error"));
        state.reading = false;
        (err, state.read_cb.take())
    };

    if let Some(mut cb) = read_cb {
        cb(lp, handle, Err(clone_err(&err)), &[]);
        if let Ok(state) = state_mut(lp, token) {
            if state.read_cb.is_none() {
                state.read_cb = Some(cb);
            }
        }
    }
    fail_writes_with(lp, token, err);
}

/// Fail every queued write with `kind`, callbacks in submission order.
fn fail_writes(lp: &mut EventLoop, token: Token, kind: io::ErrorKind) {
    fail_writes_with(lp, token, io::Error::new(kind, "connection failed"));
}

fn fail_writes_with(lp: &mut EventLoop, token: Token, err: io::Error) {
    let handle = Tcp { token };
    let (cbs, shutdown_cb) = {
        let Ok(state) = state_mut(lp, token) else {
            return;
        };
        let cbs: Vec<WriteCb> = state
            .write_queue
            .drain(..)
            .filter_map(|req| req.cb)
            .collect();
        (cbs, state.shutdown_cb.take())
    };
    for cb in cbs {
        cb(lp, handle, Err(clone_err(&err)));
    }
    if let Some(cb) = shutdown_cb {
        cb(lp, handle, Err(clone_err(&err)));
    }
    #[cfg(windows)]
    if lp.backend.is_completion() {
        maybe_settle(lp, token);
        return;
    }
    let _ = update_registration(lp, token);
}

// ===== completion backend (IOCP): real overlapped operations =====
//
// The driver posts the I/O instead of performing it on readiness: a pool
// of AcceptEx contexts per listener, ConnectEx for connects, and one
// WSARecv / one WSASend in flight per stream, each chained from its own
// completion. Every posted operation holds a reference on its handle;
// the dispatcher drops it when the completion is reaped, so two-phase
// close waits out the kernel.

#[cfg(windows)]
use crate::sys::windows::overlapped::{self, Operation};

/// Pre-posted accepts kept outstanding per listener, sized so a burst of
/// connections completes without waiting for re-posts.
#[cfg(windows)]
const ACCEPT_POOL: usize = 64;

#[cfg(windows)]
fn wildcard_of(addr: &SocketAddr) -> SocketAddr {
    use std::net::{Ipv4Addr, Ipv6Addr};
    match addr {
        SocketAddr::V4(_) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
        SocketAddr::V6(_) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
    }
}

/// Associate the socket with the completion port once, before its first
/// overlapped operation. `registered` doubles as the association marker.
#[cfg(windows)]
fn ensure_associated(lp: &mut EventLoop, token: Token) -> io::Result<()> {
    let fd = {
        let state = state_mut(lp, token)?;
        if state.registered.is_some() {
            return Ok(());
        }
        match state.socket.as_ref() {
            Some(socket) => socket.raw(),
            None => return Err(io::Error::new(io::ErrorKind::NotConnected, "no socket")),
        }
    };
    lp.backend.add(fd, token, Interest::READABLE)?;
    if let Ok(state) = state_mut(lp, token) {
        state.registered = Some(Interest::READABLE);
    }
    Ok(())
}

/// Anything still keeping the kernel busy on this handle?
#[cfg(windows)]
fn completion_active(state: &TcpState) -> bool {
    state.listening
        || state.connecting
        || state.recv_pending
        || state.send_pending
        || state.accept_posted > 0
        || !state.write_queue.is_empty()
}

#[cfg(windows)]
fn maybe_settle(lp: &mut EventLoop, token: Token) {
    let active = match state_mut(lp, token) {
        Ok(state) => completion_active(state),
        Err(_) => return,
    };
    if active {
        lp.activate(token);
    } else {
        lp.deactivate(token);
    }
}

/// Keep the listener's AcceptEx pool at full depth.
#[cfg(windows)]
fn fill_accept_pool(lp: &mut EventLoop, token: Token) -> io::Result<()> {
    loop {
        let full = {
            let Ok(state) = state_mut(lp, token) else {
                return Ok(());
            };
            if !state.listening || state.accept_posted >= ACCEPT_POOL {
                true
            } else {
                let socket = state.socket.as_ref().expect("listening implies socket");
                overlapped::post_accept(socket, token)?;
                state.accept_posted += 1;
                false
            }
        };
        if full {
            return Ok(());
        }
        lp.ref_handle(token);
    }
}

/// Post the next receive if reading and none is in flight.
#[cfg(windows)]
fn pump_recv(lp: &mut EventLoop, token: Token) -> io::Result<()> {
    let wants = matches!(
        state_mut(lp, token),
        Ok(state) if state.reading && state.connected && !state.recv_pending
    );
    if !wants {
        return Ok(());
    }
    let buf = {
        let user = state_mut(lp, token)
            .ok()
            .and_then(|state| state.alloc.as_mut().map(|alloc| alloc(DEFAULT_READ_SIZE)));
        match user {
            Some(buf) => buf,
            None => lp.arena().alloc(DEFAULT_READ_SIZE),
        }
    };
    {
        let Ok(state) = state_mut(lp, token) else {
            return Ok(());
        };
        let socket = state.socket.as_ref().expect("connected implies socket");
        overlapped::post_recv(socket, token, buf)?;
        state.recv_pending = true;
    }
    lp.ref_handle(token);
    lp.activate(token);
    Ok(())
}

/// Post the next send if the queue has a head and none is in flight; one
/// WSASend at a time, chained on completion.
#[cfg(windows)]
fn pump_send(lp: &mut EventLoop, token: Token) -> io::Result<()> {
    let payload = {
        let Ok(state) = state_mut(lp, token) else {
            return Ok(());
        };
        if state.send_pending || !state.connected {
            None
        } else {
            state
                .write_queue
                .front()
                .map(|head| head.buf[head.offset..].to_vec())
        }
    };
    let Some(payload) = payload else {
        return Ok(());
    };
    {
        let Ok(state) = state_mut(lp, token) else {
            return Ok(());
        };
        let socket = state.socket.as_ref().expect("connected implies socket");
        overlapped::post_send(socket, token, payload)?;
        state.send_pending = true;
    }
    lp.ref_handle(token);
    lp.activate(token);
    Ok(())
}

#[cfg(windows)]
impl Tcp {
    fn connect_completion(&self, lp: &mut EventLoop, addr: SocketAddr, cb: ConnectCb) -> io::Result<()> {
        let token = self.token;
        {
            let state = state_mut(lp, token)?;
            if state.listening || state.connected || state.connecting {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "bad state"));
            }
            if state.socket.is_none() {
                let socket = Socket::stream(&addr)?;
                // ConnectEx wants a bound socket.
                socket.bind(&wildcard_of(&addr))?;
                state.socket = Some(socket);
            }
        }
        ensure_associated(lp, token)?;
        {
            let state = state_mut(lp, token)?;
            let socket = state.socket.as_ref().expect("just created");
            overlapped::post_connect(socket, &addr, token)?;
            state.connecting = true;
            state.connect_cb = Some(cb);
        }
        lp.ref_handle(token);
        lp.activate(token);
        Ok(())
    }

    fn write_completion(&self, lp: &mut EventLoop, buf: Vec<u8>, cb: Option<WriteCb>) -> io::Result<()> {
        let connected = {
            let state = state_mut(lp, self.token)?;
            if state.shutdown_pending {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "shutdown pending",
                ));
            }
            if !state.connected && !state.connecting {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"));
            }
            state
                .write_queue
                .push_back(WriteRequest { buf, offset: 0, cb });
            state.connected
        };
        if connected {
            // An accepted socket may not have touched the port yet.
            ensure_associated(lp, self.token)?;
            pump_send(lp, self.token)?;
        }
        Ok(())
    }
}

/// A pre-posted accept finished: finish the socket, park it for
/// [`Tcp::accept`], notify, and top the pool back up.
#[cfg(windows)]
pub(crate) fn on_accept_complete(lp: &mut EventLoop, op: Box<Operation>) {
    let token = op.token;
    let handle = Tcp { token };
    let result = op.result().map(drop);
    let mut op = op;

    let status = {
        let Ok(state) = state_mut(lp, token) else {
            // Listener closed; the pre-created socket just drops.
            return;
        };
        state.accept_posted = state.accept_posted.saturating_sub(1);
        if !state.listening {
            maybe_settle(lp, token);
            return;
        }
        match (result, op.accepted.take()) {
            (Ok(()), Some(accepted)) => {
                let listener = state.socket.as_ref().expect("listening implies socket");
                match accepted
                    .update_accept_context(listener)
                    .and_then(|()| accepted.peer_addr())
                {
                    Ok(peer) => {
                        state.pending_accepts.push_back((accepted, peer));
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            (Err(err), _) => Err(err),
            (Ok(()), None) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "accept completed without a socket",
            )),
        }
    };

    let cb = state_mut(lp, token).ok().and_then(|s| s.connection_cb.take());
    if let Some(mut cb) = cb {
        cb(lp, handle, status);
        if let Ok(state) = state_mut(lp, token) {
            if state.connection_cb.is_none() {
                state.connection_cb = Some(cb);
            }
        }
    }
    let _ = fill_accept_pool(lp, token);
}

/// A ConnectEx finished; same observable contract as the readiness
/// backends' SO_ERROR path.
#[cfg(windows)]
pub(crate) fn on_connect_complete(lp: &mut EventLoop, op: Box<Operation>) {
    let token = op.token;
    let handle = Tcp { token };
    let result = op.result().map(drop);

    let (status, cb) = {
        let Ok(state) = state_mut(lp, token) else {
            return;
        };
        state.connecting = false;
        let status = result.and_then(|()| {
            let socket = state.socket.as_ref().expect("connecting implies socket");
            socket.update_connect_context()
        });
        state.connected = status.is_ok();
        (status, state.connect_cb.take())
    };

    let failed = status.is_err();
    if let Some(cb) = cb {
        cb(lp, handle, status);
    }
    if failed {
        fail_writes(lp, token, io::ErrorKind::NotConnected);
        return;
    }
    // Writes queued while connecting start their chain now.
    let _ = pump_send(lp, token);
    let _ = pump_recv(lp, token);
    maybe_settle(lp, token);
}

/// A posted WSARecv finished; the kernel already filled the buffer, so
/// the payload is consumed directly from the context.
#[cfg(windows)]
pub(crate) fn on_read_complete(lp: &mut EventLoop, op: Box<Operation>, bytes: usize) {
    let token = op.token;
    let handle = Tcp { token };
    let result = op.result().map(drop);

    enum Next {
        Deliver(ReadCb),
        Done,
    }
    let next = {
        let Ok(state) = state_mut(lp, token) else {
            lp.arena().release(op.buf);
            return;
        };
        state.recv_pending = false;
        if !state.reading {
            Next::Done
        } else {
            match state.read_cb.take() {
                Some(cb) => Next::Deliver(cb),
                None => Next::Done,
            }
        }
    };
    let mut cb = match next {
        Next::Deliver(cb) => cb,
        Next::Done => {
            lp.arena().release(op.buf);
            maybe_settle(lp, token);
            return;
        }
    };

    match result {
        Ok(()) if bytes == 0 => {
            // Peer closed.
            if let Ok(state) = state_mut(lp, token) {
                state.reading = false;
            }
            cb(lp, handle, Ok(0), &[]);
        }
        Ok(()) => cb(lp, handle, Ok(bytes), &op.buf[..bytes]),
        Err(err) => {
            if let Ok(state) = state_mut(lp, token) {
                state.reading = false;
            }
            cb(lp, handle, Err(err), &[]);
        }
    }
    lp.arena().release(op.buf);

    if let Ok(state) = state_mut(lp, token) {
        if state.read_cb.is_none() {
            state.read_cb = Some(cb);
        }
    }
    let _ = pump_recv(lp, token);
    maybe_settle(lp, token);
}

/// The in-flight WSASend finished: carry partial progress, complete the
/// head in submission order, chain the next send, run a drained
/// shutdown.
#[cfg(windows)]
pub(crate) fn on_write_complete(lp: &mut EventLoop, op: Box<Operation>, bytes: usize) {
    let token = op.token;
    let handle = Tcp { token };
    let result = op.result().map(drop);

    let mut finished: Option<WriteCb> = None;
    let mut failure: Option<io::Error> = None;
    {
        let Ok(state) = state_mut(lp, token) else {
            return;
        };
        // Cleared on every terminal path, success or failure.
        state.send_pending = false;
        match result {
            Err(err) => failure = Some(err),
            Ok(()) => {
                if let Some(head) = state.write_queue.front_mut() {
                    head.offset += bytes;
                    if head.offset >= head.buf.len() {
                        let done = state.write_queue.pop_front().expect("head exists");
                        finished = done.cb;
                    }
                }
            }
        }
    }

    if let Some(err) = failure {
        fail_writes_with(lp, token, err);
        return;
    }
    if let Some(cb) = finished {
        cb(lp, handle, Ok(()));
    }
    let _ = pump_send(lp, token);

    let shutdown = {
        match state_mut(lp, token) {
            Ok(state)
                if state.write_queue.is_empty()
                    && state.sends_idle()
                    && state.shutdown_pending =>
            {
                let res = state
                    .socket
                    .as_ref()
                    .map(Socket::shutdown_write)
                    .unwrap_or_else(|| {
                        Err(io::Error::new(io::ErrorKind::NotConnected, "no socket"))
                    });
                state.shutdown_cb.take().map(|cb| (cb, res))
            }
            _ => None,
        }
    };
    if let Some((cb, res)) = shutdown {
        cb(lp, handle, res);
    }
    maybe_settle(lp, token);
}
