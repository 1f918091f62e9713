//! UDP handle and datagram driver.
//!
//! Sends are queued per packet and submitted to the kernel in queue order;
//! a datagram is all-or-nothing, so a short send is reported as an error
//! rather than carried as partial progress.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

use crate::event::Event;
use crate::event_loop::EventLoop;
use crate::handle::{impl_handle_common, HandleKind};
use crate::net::{interrupted, would_block};
use crate::sys::net::Socket;
use crate::sys::SysFd;
use crate::{Interest, Token};

const DEFAULT_RECV_SIZE: usize = 64 * 1024;

pub(crate) type RecvCb = Box<dyn FnMut(&mut EventLoop, Udp, io::Result<usize>, &[u8], SocketAddr)>;
pub(crate) type SendCb = Box<dyn FnOnce(&mut EventLoop, Udp, io::Result<()>)>;
pub(crate) type AllocFn = Box<dyn FnMut(usize) -> Vec<u8>>;

/// Options applied at [`Udp::bind`] time.
#[derive(Copy, Clone, Debug, Default)]
pub struct UdpBindFlags {
    pub reuse_addr: bool,
    /// `SO_REUSEPORT` where the platform has it.
    pub reuse_port: bool,
}

struct SendRequest {
    buf: Vec<u8>,
    dst: SocketAddr,
    cb: Option<SendCb>,
}

pub(crate) struct UdpState {
    pub(crate) socket: Option<Socket>,
    registered: Option<Interest>,
    bound: bool,
    receiving: bool,
    recv_cb: Option<RecvCb>,
    alloc: Option<AllocFn>,
    send_queue: VecDeque<SendRequest>,
    /// One posted WSARecvFrom in flight (completion backend).
    #[cfg(windows)]
    recv_pending: bool,
    /// One posted WSASendTo in flight (completion backend); further sends
    /// queue until its completion is reaped.
    #[cfg(windows)]
    send_pending: bool,
    /// Callback and length of the datagram the kernel currently owns.
    #[cfg(windows)]
    inflight_send: Option<(Option<SendCb>, usize)>,
}

impl UdpState {
    fn new() -> UdpState {
        UdpState {
            socket: None,
            registered: None,
            bound: false,
            receiving: false,
            recv_cb: None,
            alloc: None,
            send_queue: VecDeque::new(),
            #[cfg(windows)]
            recv_pending: false,
            #[cfg(windows)]
            send_pending: false,
            #[cfg(windows)]
            inflight_send: None,
        }
    }

    pub(crate) fn teardown(&mut self) -> Option<SysFd> {
        self.recv_cb = None;
        self.alloc = None;
        self.send_queue.clear();
        self.receiving = false;
        #[cfg(windows)]
        {
            self.inflight_send = None;
        }
        self.registered
            .take()
            .and_then(|_| self.socket.as_ref().map(Socket::raw))
    }

    fn desired(&self) -> Option<Interest> {
        let mut want: Option<Interest> = None;
        if self.receiving {
            want = Some(Interest::READABLE);
        }
        if !self.send_queue.is_empty() {
            want = Some(want.map_or(Interest::WRITABLE, |w| w | Interest::WRITABLE));
        }
        want
    }
}

/// A UDP socket handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Udp {
    pub(crate) token: Token,
}

impl_handle_common!(Udp);

impl Udp {
    pub fn new(lp: &mut EventLoop) -> Udp {
        Udp {
            token: lp.add_handle(HandleKind::Udp(UdpState::new())),
        }
    }

    /// Create a non-blocking socket for `addr`'s family, apply `flags` and
    /// bind.
    pub fn bind(
        &self,
        lp: &mut EventLoop,
        addr: SocketAddr,
        flags: UdpBindFlags,
    ) -> io::Result<()> {
        let state = state_mut(lp, self.token)?;
        if state.bound {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "already bound"));
        }
        let socket = Socket::datagram(&addr)?;
        if flags.reuse_addr {
            socket.set_reuseaddr(true)?;
        }
        #[cfg(unix)]
        if flags.reuse_port {
            socket.set_reuseport(true)?;
        }
        socket.bind(&addr)?;
        state.socket = Some(socket);
        state.bound = true;
        Ok(())
    }

    /// Deliver each inbound datagram through `cb` with its source address.
    pub fn recv_start<F>(&self, lp: &mut EventLoop, cb: F) -> io::Result<()>
    where
        F: FnMut(&mut EventLoop, Udp, io::Result<usize>, &[u8], SocketAddr) + 'static,
    {
        self.recv_start_inner(lp, None, Box::new(cb))
    }

    /// Like [`Udp::recv_start`] with a caller-provided buffer allocator.
    pub fn recv_start_with<A, F>(&self, lp: &mut EventLoop, alloc: A, cb: F) -> io::Result<()>
    where
        A: FnMut(usize) -> Vec<u8> + 'static,
        F: FnMut(&mut EventLoop, Udp, io::Result<usize>, &[u8], SocketAddr) + 'static,
    {
        self.recv_start_inner(lp, Some(Box::new(alloc)), Box::new(cb))
    }

    fn recv_start_inner(
        &self,
        lp: &mut EventLoop,
        alloc: Option<AllocFn>,
        cb: RecvCb,
    ) -> io::Result<()> {
        {
            let state = state_mut(lp, self.token)?;
            if !state.bound {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket not bound"));
            }
            state.receiving = true;
            state.recv_cb = Some(cb);
            state.alloc = alloc;
        }
        #[cfg(windows)]
        if lp.backend.is_completion() {
            ensure_associated(lp, self.token)?;
            return pump_recv_from(lp, self.token);
        }
        update_registration(lp, self.token)
    }

    pub fn recv_stop(&self, lp: &mut EventLoop) -> io::Result<()> {
        {
            let state = state_mut(lp, self.token)?;
            state.receiving = false;
        }
        #[cfg(windows)]
        if lp.backend.is_completion() {
            // The in-flight receive drains on its own, undelivered.
            return Ok(());
        }
        update_registration(lp, self.token)
    }

    /// Queue one datagram for `dst`; no completion callback.
    pub fn send<B: Into<Vec<u8>>>(
        &self,
        lp: &mut EventLoop,
        buf: B,
        dst: SocketAddr,
    ) -> io::Result<()> {
        self.send_inner(lp, buf.into(), dst, None)
    }

    /// Queue one datagram for `dst`. `cb` fires exactly once with the
    /// outcome; datagrams go to the kernel in queue order.
    pub fn send_with<B, F>(
        &self,
        lp: &mut EventLoop,
        buf: B,
        dst: SocketAddr,
        cb: F,
    ) -> io::Result<()>
    where
        B: Into<Vec<u8>>,
        F: FnOnce(&mut EventLoop, Udp, io::Result<()>) + 'static,
    {
        self.send_inner(lp, buf.into(), dst, Some(Box::new(cb)))
    }

    fn send_inner(
        &self,
        lp: &mut EventLoop,
        buf: Vec<u8>,
        dst: SocketAddr,
        cb: Option<SendCb>,
    ) -> io::Result<()> {
        #[cfg(windows)]
        if lp.backend.is_completion() {
            return self.send_completion(lp, buf, dst, cb);
        }
        let handle = *self;

        enum Outcome {
            Finished(Option<SendCb>, io::Result<()>),
            Queued,
        }

        let outcome = {
            let state = state_mut(lp, self.token)?;
            if state.socket.is_none() {
                // An unbound send picks the wildcard address of the
                // destination's family first.
                let any = wildcard_for(&dst);
                let socket = Socket::datagram(&any)?;
                socket.bind(&any)?;
                state.socket = Some(socket);
                state.bound = true;
            }
            if state.send_queue.is_empty() {
                let socket = state.socket.as_ref().expect("bound implies socket");
                match socket.send_to(&buf, &dst) {
                    Ok(n) if n == buf.len() => Outcome::Finished(cb, Ok(())),
                    Ok(_) => Outcome::Finished(
                        cb,
                        Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "short datagram send",
                        )),
                    ),
                    Err(ref err) if would_block(err) || interrupted(err) => {
                        state.send_queue.push_back(SendRequest { buf, dst, cb });
                        Outcome::Queued
                    }
                    Err(err) => Outcome::Finished(cb, Err(err)),
                }
            } else {
                state.send_queue.push_back(SendRequest { buf, dst, cb });
                Outcome::Queued
            }
        };

        match outcome {
            Outcome::Finished(cb, res) => {
                if let Some(cb) = cb {
                    lp.queue_work(move |lp| cb(lp, handle, res));
                }
                Ok(())
            }
            Outcome::Queued => update_registration(lp, self.token),
        }
    }

    pub fn local_addr(&self, lp: &mut EventLoop) -> io::Result<SocketAddr> {
        socket_ref(lp, self.token)?.local_addr()
    }

    pub fn set_broadcast(&self, lp: &mut EventLoop, on: bool) -> io::Result<()> {
        socket_ref(lp, self.token)?.set_broadcast(on)
    }

    pub fn set_reuseaddr(&self, lp: &mut EventLoop, on: bool) -> io::Result<()> {
        socket_ref(lp, self.token)?.set_reuseaddr(on)
    }

    pub fn set_ttl(&self, lp: &mut EventLoop, ttl: u32) -> io::Result<()> {
        socket_ref(lp, self.token)?.set_ttl(ttl)
    }
}

fn wildcard_for(dst: &SocketAddr) -> SocketAddr {
    use std::net::{Ipv4Addr, Ipv6Addr};
    match dst {
        SocketAddr::V4(_) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
        SocketAddr::V6(_) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
    }
}

fn state_mut(lp: &mut EventLoop, token: Token) -> io::Result<&mut UdpState> {
    match lp.handle_mut(token) {
        Some(slot) if !slot.closing => match &mut slot.kind {
            HandleKind::Udp(state) => Ok(state),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a udp handle",
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

/// Backend event entry point for UDP handles.
pub(crate) fn on_event(lp: &mut EventLoop, event: &Event) {
    let token = event.token();
    let ready = event.readiness();
    if ready.is_readable() || ready.is_error() {
        on_readable(lp, token);
    }
    if ready.is_writable() {
        on_writable(lp, token);
    }
}

fn on_readable(lp: &mut EventLoop, token: Token) {
    let handle = Udp { token };
    let (mut cb, mut alloc) = {
        let Ok(state) = state_mut(lp, token) else {
            return;
        };
        if !state.receiving {
            return;
        }
        let Some(cb) = state.recv_cb.take() else {
            return;
        };
        (cb, state.alloc.take())
    };

    let mut buf = match alloc.as_mut() {
        Some(alloc) => alloc(DEFAULT_RECV_SIZE),
        None => lp.arena().alloc(DEFAULT_RECV_SIZE),
    };
    let arena_owned = alloc.is_none();

    // One datagram per readiness event; the backend re-arms while more
    // are queued.
    let result = match state_mut(lp, token) {
        Ok(state) => match state.socket.as_ref() {
            Some(socket) => socket.recv_from(&mut buf),
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
        Ok((n, src)) => cb(lp, handle, Ok(n), &buf[..n], src),
        Err(ref err) if would_block(err) || interrupted(err) => {}
        Err(err) => {
            let src = SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0);
            cb(lp, handle, Err(err), &[], src);
        }
    }

    if arena_owned {
        lp.arena().release(buf);
    }

    if let Ok(state) = state_mut(lp, token) {
        if state.recv_cb.is_none() {
            state.recv_cb = Some(cb);
        }
        if state.alloc.is_none() {
            state.alloc = alloc;
        }
    }
}

fn on_writable(lp: &mut EventLoop, token: Token) {
    let handle = Udp { token };
    let mut finished: Vec<(Option<SendCb>, io::Result<()>)> = Vec::new();

    {
        let Ok(state) = state_mut(lp, token) else {
            return;
        };
        let Some(socket) = state.socket.as_ref() else {
            return;
        };
        while let Some(head) = state.send_queue.front() {
            match socket.send_to(&head.buf, &head.dst) {
                Ok(n) => {
                    let req = state.send_queue.pop_front().expect("head exists");
                    let res = if n == req.buf.len() {
                        Ok(())
                    } else {
                        Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "short datagram send",
                        ))
                    };
                    finished.push((req.cb, res));
                }
                Err(ref err) if would_block(err) => break,
                Err(ref err) if interrupted(err) => continue,
                Err(err) => {
                    // Per-packet failure: report it and move on to the
                    // next datagram.
                    let req = state.send_queue.pop_front().expect("head exists");
                    finished.push((req.cb, Err(err)));
                }
            }
        }
    }

    for (cb, res) in finished {
        if let Some(cb) = cb {
            cb(lp, handle, res);
        }
    }

    let _ = update_registration(lp, token);
}

// ===== completion backend (IOCP): real overlapped operations =====
//
// Receives are posted WSARecvFrom operations whose completion carries the
// datagram and its source address. Each send is a posted WSASendTo; one
// at a time, further sends queue, and the in-flight marker is cleared on
// every terminal path.

#[cfg(windows)]
use crate::sys::windows::overlapped::{self, Operation};

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

#[cfg(windows)]
fn maybe_settle(lp: &mut EventLoop, token: Token) {
    let active = match state_mut(lp, token) {
        Ok(state) => {
            state.receiving && state.recv_pending
                || state.send_pending
                || !state.send_queue.is_empty()
        }
        Err(_) => return,
    };
    if active {
        lp.activate(token);
    } else {
        lp.deactivate(token);
    }
}

/// Post the next receive if receiving and none is in flight.
#[cfg(windows)]
fn pump_recv_from(lp: &mut EventLoop, token: Token) -> io::Result<()> {
    let wants = matches!(
        state_mut(lp, token),
        Ok(state) if state.receiving && state.bound && !state.recv_pending
    );
    if !wants {
        return Ok(());
    }
    let buf = {
        let user = state_mut(lp, token)
            .ok()
            .and_then(|state| state.alloc.as_mut().map(|alloc| alloc(DEFAULT_RECV_SIZE)));
        match user {
            Some(buf) => buf,
            None => lp.arena().alloc(DEFAULT_RECV_SIZE),
        }
    };
    {
        let Ok(state) = state_mut(lp, token) else {
            return Ok(());
        };
        let socket = state.socket.as_ref().expect("bound implies socket");
        overlapped::post_recv_from(socket, token, buf)?;
        state.recv_pending = true;
    }
    lp.ref_handle(token);
    lp.activate(token);
    Ok(())
}

/// Post the queue head as a WSASendTo if none is in flight. A posting
/// failure still resolves that datagram's callback, through the
/// deferred-work queue.
#[cfg(windows)]
fn pump_send_to(lp: &mut EventLoop, token: Token) -> io::Result<()> {
    loop {
        let handle = Udp { token };
        let posted = {
            let Ok(state) = state_mut(lp, token) else {
                return Ok(());
            };
            if state.send_pending {
                return Ok(());
            }
            let Some(request) = state.send_queue.pop_front() else {
                return Ok(());
            };
            let socket = state.socket.as_ref().expect("queued send implies socket");
            let len = request.buf.len();
            match overlapped::post_send_to(socket, token, request.buf, &request.dst) {
                Ok(()) => {
                    state.inflight_send = Some((request.cb, len));
                    state.send_pending = true;
                    Ok(())
                }
                Err(err) => Err((request.cb, err)),
            }
        };
        match posted {
            Ok(()) => {
                lp.ref_handle(token);
                lp.activate(token);
                return Ok(());
            }
            Err((cb, err)) => {
                if let Some(cb) = cb {
                    lp.queue_work(move |lp| cb(lp, handle, Err(err)));
                }
                // Try the next queued datagram.
            }
        }
    }
}

#[cfg(windows)]
impl Udp {
    fn send_completion(
        &self,
        lp: &mut EventLoop,
        buf: Vec<u8>,
        dst: SocketAddr,
        cb: Option<SendCb>,
    ) -> io::Result<()> {
        {
            let state = state_mut(lp, self.token)?;
            if state.socket.is_none() {
                let any = wildcard_for(&dst);
                let socket = Socket::datagram(&any)?;
                socket.bind(&any)?;
                state.socket = Some(socket);
                state.bound = true;
            }
            state.send_queue.push_back(SendRequest { buf, dst, cb });
        }
        ensure_associated(lp, self.token)?;
        pump_send_to(lp, self.token)
    }
}

/// A posted WSARecvFrom finished; deliver the datagram and its source,
/// then chain the next receive.
#[cfg(windows)]
pub(crate) fn on_recv_from_complete(lp: &mut EventLoop, op: Box<Operation>, bytes: usize) {
    let token = op.token;
    let handle = Udp { token };
    let result = op.result().map(drop);

    enum Next {
        Deliver(RecvCb),
        Done,
    }
    let next = {
        let Ok(state) = state_mut(lp, token) else {
            lp.arena().release(op.buf);
            return;
        };
        state.recv_pending = false;
        if !state.receiving {
            Next::Done
        } else {
            match state.recv_cb.take() {
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

    match result.and_then(|()| op.source_addr()) {
        Ok(src) => cb(lp, handle, Ok(bytes), &op.buf[..bytes], src),
        Err(err) => {
            let src = SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0);
            cb(lp, handle, Err(err), &[], src);
        }
    }
    lp.arena().release(op.buf);

    if let Ok(state) = state_mut(lp, token) {
        if state.recv_cb.is_none() {
            state.recv_cb = Some(cb);
        }
    }
    let _ = pump_recv_from(lp, token);
    maybe_settle(lp, token);
}

/// The in-flight WSASendTo finished. The pending marker is cleared on
/// every terminal path — success, short send or failure — before anything
/// else runs, and the next queued datagram is posted.
#[cfg(windows)]
pub(crate) fn on_send_to_complete(lp: &mut EventLoop, op: Box<Operation>, bytes: usize) {
    let token = op.token;
    let handle = Udp { token };
    let result = op.result().map(drop);

    let fired = {
        let Ok(state) = state_mut(lp, token) else {
            return;
        };
        state.send_pending = false;
        state.inflight_send.take().map(|(cb, len)| {
            let res = match result {
                Ok(()) if bytes == len => Ok(()),
                Ok(()) => Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "short datagram send",
                )),
                Err(err) => Err(err),
            };
            (cb, res)
        })
    };
    if let Some((Some(cb), res)) = fired {
        cb(lp, handle, res);
    }
    let _ = pump_send_to(lp, token);
    maybe_settle(lp, token);
}
