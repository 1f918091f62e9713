//! TLS/DTLS bridge between a record-layer session and a transport handle.
//!
//! The record layer is an external provider reached through the
//! [`RecordSession`] seam. Its "network side" is a pair of in-memory byte
//! queues: [`RecordSession::feed`] pushes ciphertext read from the
//! transport into the decryptor, [`RecordSession::drain`] pulls ciphertext
//! the encryptor produced for the wire. The bridge drives the handshake to
//! completion before any application data callback fires, and tears a
//! connection down with bidirectional close-notify followed by transport
//! close.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

use crate::event_loop::EventLoop;
use crate::handle::{impl_handle_common, HandleKind};
use crate::macros::trace;
use crate::net::tcp::Tcp;
use crate::net::udp::Udp;
use crate::Token;

pub(crate) type HandshakeCb = Box<dyn FnOnce(&mut EventLoop, TlsStream, io::Result<()>)>;
pub(crate) type TlsReadCb = Box<dyn FnMut(&mut EventLoop, TlsStream, io::Result<usize>, &[u8])>;
pub(crate) type TlsWriteCb = Box<dyn FnOnce(&mut EventLoop, TlsStream, io::Result<()>)>;
pub(crate) type TlsShutdownCb = Box<dyn FnOnce(&mut EventLoop, TlsStream, io::Result<()>)>;

const PLAIN_CHUNK: usize = 16 * 1024;

/// Stream-oriented record-layer session: the interface the core consumes
/// from an SSL/TLS module.
pub trait RecordSession: 'static {
    fn is_handshaking(&self) -> bool;

    /// True while the session holds ciphertext that belongs on the wire.
    fn wants_write(&self) -> bool;

    /// Feed ciphertext from the transport into the session (the rbio
    /// side). Record-layer violations surface as `InvalidData`.
    fn feed(&mut self, data: &[u8]) -> io::Result<()>;

    /// Append pending outbound ciphertext to `out` (the wbio side).
    fn drain(&mut self, out: &mut Vec<u8>) -> io::Result<()>;

    /// Submit plaintext for encryption.
    fn write_plain(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Pull decrypted plaintext. `Ok(0)` after the peer's close-notify;
    /// `WouldBlock` while nothing is buffered.
    fn read_plain(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Queue a close-notify alert.
    fn send_close_notify(&mut self);
}

/// Datagram-oriented record-layer session for DTLS. No provider is
/// bundled; implementations come from outside the core.
pub trait DatagramSession: 'static {
    fn is_handshaking(&self) -> bool;

    /// Feed one ciphertext datagram; decrypted payload, if any, is
    /// appended to `plain`.
    fn feed_datagram(&mut self, datagram: &[u8], plain: &mut Vec<u8>) -> io::Result<()>;

    /// Next ciphertext datagram the session wants transmitted.
    fn poll_transmit(&mut self) -> Option<Vec<u8>>;

    fn write_plain(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Queue the session's close alert.
    fn close(&mut self);
}

pub(crate) struct TlsState {
    transport: Tcp,
    session: Option<Box<dyn RecordSession>>,
    handshaken: bool,
    reading: bool,
    peer_closed: bool,
    sent_close: bool,
    handshake_cb: Option<HandshakeCb>,
    read_cb: Option<TlsReadCb>,
    shutdown_cb: Option<TlsShutdownCb>,
    // Plaintext writes submitted before the handshake finished.
    pending_plain: VecDeque<(Vec<u8>, Option<TlsWriteCb>)>,
}

impl TlsState {
    pub(crate) fn teardown(&mut self) -> Token {
        self.session = None;
        self.handshake_cb = None;
        self.read_cb = None;
        self.shutdown_cb = None;
        self.pending_plain.clear();
        self.reading = false;
        self.transport.token
    }
}

/// A TLS stream layered over a connected [`Tcp`] handle.
///
/// Closing the stream closes the wrapped transport as well.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TlsStream {
    token: Token,
}

impl_handle_common!(TlsStream);

impl TlsStream {
    /// Wrap `transport` (which must be connected) with `session`. The
    /// bridge takes over the transport's read side immediately so server
    /// sessions see the first flight.
    pub fn new(
        lp: &mut EventLoop,
        transport: Tcp,
        session: Box<dyn RecordSession>,
    ) -> io::Result<TlsStream> {
        let token = lp.add_handle(HandleKind::Tls(TlsState {
            transport,
            session: Some(session),
            handshaken: false,
            reading: false,
            peer_closed: false,
            sent_close: false,
            handshake_cb: None,
            read_cb: None,
            shutdown_cb: None,
            pending_plain: VecDeque::new(),
        }));
        let stream = TlsStream { token };
        if let Err(err) = transport.read_start(lp, move |lp, _tcp, res, data| {
            on_transport_read(lp, token, res, data);
        }) {
            lp.close_handle(token, None);
            return Err(err);
        }
        Ok(stream)
    }

    /// The wrapped transport handle.
    pub fn transport(&self, lp: &mut EventLoop) -> io::Result<Tcp> {
        state_mut(lp, self.token).map(|state| state.transport)
    }

    /// Drive the handshake; `cb` fires once when the session is ready (or
    /// failed). Must be called before data flows.
    pub fn handshake<F>(&self, lp: &mut EventLoop, cb: F) -> io::Result<()>
    where
        F: FnOnce(&mut EventLoop, TlsStream, io::Result<()>) + 'static,
    {
        {
            let state = state_mut(lp, self.token)?;
            if state.handshaken || state.handshake_cb.is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "handshake already started",
                ));
            }
            state.handshake_cb = Some(Box::new(cb));
        }
        // Client sessions already hold their first flight.
        pump(lp, self.token);
        Ok(())
    }

    /// Deliver decrypted application data through `cb`. `Ok(0)` reports
    /// the peer's close-notify.
    pub fn read_start<F>(&self, lp: &mut EventLoop, cb: F) -> io::Result<()>
    where
        F: FnMut(&mut EventLoop, TlsStream, io::Result<usize>, &[u8]) + 'static,
    {
        {
            let state = state_mut(lp, self.token)?;
            state.reading = true;
            state.read_cb = Some(Box::new(cb));
        }
        // Plaintext may already be buffered in the session.
        pump(lp, self.token);
        Ok(())
    }

    pub fn read_stop(&self, lp: &mut EventLoop) -> io::Result<()> {
        let state = state_mut(lp, self.token)?;
        state.reading = false;
        Ok(())
    }

    /// Encrypt and queue `buf`; no completion callback.
    pub fn write<B: Into<Vec<u8>>>(&self, lp: &mut EventLoop, buf: B) -> io::Result<()> {
        self.write_inner(lp, buf.into(), None)
    }

    /// Encrypt and queue `buf`. `cb` fires once the ciphertext write on
    /// the transport completes.
    pub fn write_with<B, F>(&self, lp: &mut EventLoop, buf: B, cb: F) -> io::Result<()>
    where
        B: Into<Vec<u8>>,
        F: FnOnce(&mut EventLoop, TlsStream, io::Result<()>) + 'static,
    {
        self.write_inner(lp, buf.into(), Some(Box::new(cb)))
    }

    fn write_inner(
        &self,
        lp: &mut EventLoop,
        buf: Vec<u8>,
        cb: Option<TlsWriteCb>,
    ) -> io::Result<()> {
        let handle = *self;
        let (transport, out) = {
            let state = state_mut(lp, self.token)?;
            if state.sent_close {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "shutdown pending",
                ));
            }
            if !state.handshaken {
                // Held until the handshake completes, then encrypted in
                // submission order.
                state.pending_plain.push_back((buf, cb));
                return Ok(());
            }
            let session = state
                .session
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no session"))?;
            write_all_plain(session.as_mut(), &buf)?;
            let mut out = Vec::new();
            session.drain(&mut out)?;
            (state.transport, out)
        };

        match cb {
            Some(cb) => transport.write_with(lp, out, move |lp, _tcp, status| {
                cb(lp, handle, status);
            }),
            None => transport.write(lp, out),
        }
    }

    /// Begin an orderly close: our close-notify goes out, and once the
    /// peer's close-notify has arrived the transport write side closes
    /// and `cb` fires.
    pub fn shutdown<F>(&self, lp: &mut EventLoop, cb: F) -> io::Result<()>
    where
        F: FnOnce(&mut EventLoop, TlsStream, io::Result<()>) + 'static,
    {
        let (transport, out) = {
            let state = state_mut(lp, self.token)?;
            if state.sent_close {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "shutdown already requested",
                ));
            }
            let session = state
                .session
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no session"))?;
            session.send_close_notify();
            state.sent_close = true;
            state.shutdown_cb = Some(Box::new(cb));
            let mut out = Vec::new();
            session.drain(&mut out)?;
            (state.transport, out)
        };
        if !out.is_empty() {
            transport.write(lp, out)?;
        }
        maybe_finish_shutdown(lp, self.token);
        Ok(())
    }
}

fn state_mut(lp: &mut EventLoop, token: Token) -> io::Result<&mut TlsState> {
    match lp.handle_mut(token) {
        Some(slot) if !slot.closing => match &mut slot.kind {
            HandleKind::Tls(state) => Ok(state),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a tls handle",
            )),
        },
        _ => Err(io::Error::new(
            io::ErrorKind::NotFound,
            "handle closed or destroyed",
        )),
    }
}

fn write_all_plain(session: &mut dyn RecordSession, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        let n = session.write_plain(data)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "session refused plaintext",
            ));
        }
        data = &data[n..];
    }
    Ok(())
}

/// Transport bytes arrived (or the transport failed).
fn on_transport_read(lp: &mut EventLoop, token: Token, res: io::Result<usize>, data: &[u8]) {
    match res {
        Ok(0) => {
            let handshaken = match state_mut(lp, token) {
                Ok(state) => {
                    state.peer_closed = true;
                    state.handshaken
                }
                Err(_) => return,
            };
            if !handshaken {
                fail(lp, token, io::ErrorKind::UnexpectedEof, "closed during handshake");
            } else {
                deliver_eof(lp, token);
                maybe_finish_shutdown(lp, token);
            }
        }
        Ok(_) => {
            let fed = match state_mut(lp, token) {
                Ok(state) => match state.session.as_mut() {
                    Some(session) => session.feed(data),
                    None => return,
                },
                Err(_) => return,
            };
            if let Err(err) = fed {
                let kind = err.kind();
                fail(lp, token, kind, "record layer rejected input");
                return;
            }
            pump(lp, token);
        }
        Err(err) => {
            let kind = err.kind();
            fail(lp, token, kind, "transport read failed");
        }
    }
}

/// Move the session forward: flush produced ciphertext, complete the
/// handshake, deliver decrypted plaintext.
fn pump(lp: &mut EventLoop, token: Token) {
    let handle = TlsStream { token };

    struct Step {
        transport: Tcp,
        out: Vec<u8>,
        handshake_cb: Option<HandshakeCb>,
        flushed_write_cbs: Vec<TlsWriteCb>,
        plain: Vec<Vec<u8>>,
        eof: bool,
        error: Option<io::Error>,
    }

    let mut step = {
        let Ok(state) = state_mut(lp, token) else {
            return;
        };
        let transport = state.transport;
        let Some(session) = state.session.as_mut() else {
            return;
        };

        let mut step = Step {
            transport,
            out: Vec::new(),
            handshake_cb: None,
            flushed_write_cbs: Vec::new(),
            plain: Vec::new(),
            eof: false,
            error: None,
        };

        if let Err(err) = session.drain(&mut step.out) {
            step.error = Some(err);
        }

        if step.error.is_none() && !session.is_handshaking() && !state.handshaken {
            state.handshaken = true;
            step.handshake_cb = state.handshake_cb.take();
            trace!("tls {} handshake complete", token);

            // Writes held back during the handshake, in submission order.
            while let Some((buf, cb)) = state.pending_plain.pop_front() {
                let session = state.session.as_mut().expect("session present");
                if let Err(err) = write_all_plain(session.as_mut(), &buf) {
                    step.error = Some(err);
                    break;
                }
                if let Some(cb) = cb {
                    step.flushed_write_cbs.push(cb);
                }
            }
            if step.error.is_none() {
                let session = state.session.as_mut().expect("session present");
                if let Err(err) = session.drain(&mut step.out) {
                    step.error = Some(err);
                }
            }
        }

        if step.error.is_none() && state.handshaken && state.reading {
            let session = state.session.as_mut().expect("session present");
            let mut buf = vec![0u8; PLAIN_CHUNK];
            loop {
                match session.read_plain(&mut buf) {
                    Ok(0) => {
                        state.peer_closed = true;
                        state.reading = false;
                        step.eof = true;
                        break;
                    }
                    Ok(n) => step.plain.push(buf[..n].to_vec()),
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        step.error = Some(err);
                        break;
                    }
                }
            }
        }

        step
    };

    if !step.out.is_empty() {
        let _ = step.transport.write(lp, std::mem::take(&mut step.out));
    }

    if let Some(err) = step.error {
        let kind = err.kind();
        fail(lp, token, kind, "record layer failure");
        return;
    }

    if let Some(cb) = step.handshake_cb {
        cb(lp, handle, Ok(()));
    }
    for cb in step.flushed_write_cbs {
        cb(lp, handle, Ok(()));
    }

    if !step.plain.is_empty() || step.eof {
        let cb = state_mut(lp, token).ok().and_then(|s| s.read_cb.take());
        if let Some(mut cb) = cb {
            for chunk in &step.plain {
                cb(lp, handle, Ok(chunk.len()), chunk);
            }
            if step.eof {
                cb(lp, handle, Ok(0), &[]);
            }
            if let Ok(state) = state_mut(lp, token) {
                if state.read_cb.is_none() {
                    state.read_cb = Some(cb);
                }
            }
        }
    }

    maybe_finish_shutdown(lp, token);
}

fn deliver_eof(lp: &mut EventLoop, token: Token) {
    let handle = TlsStream { token };
    let cb = match state_mut(lp, token) {
        Ok(state) if state.reading => {
            state.reading = false;
            state.read_cb.take()
        }
        _ => return,
    };
    if let Some(mut cb) = cb {
        cb(lp, handle, Ok(0), &[]);
        if let Ok(state) = state_mut(lp, token) {
            if state.read_cb.is_none() {
                state.read_cb = Some(cb);
            }
        }
    }
}

fn maybe_finish_shutdown(lp: &mut EventLoop, token: Token) {
    let handle = TlsStream { token };
    let finish = {
        match state_mut(lp, token) {
            Ok(state) if state.sent_close && state.peer_closed => {
                state.shutdown_cb.take().map(|cb| (cb, state.transport))
            }
            _ => None,
        }
    };
    if let Some((cb, transport)) = finish {
        let _ = transport.shutdown(lp);
        cb(lp, handle, Ok(()));
    }
}

/// Surface a failure on whichever callback is waiting.
fn fail(lp: &mut EventLoop, token: Token, kind: io::ErrorKind, msg: &'static str) {
    let handle = TlsStream { token };
    let (handshake_cb, read_cb, shutdown_cb) = {
        let Ok(state) = state_mut(lp, token) else {
            return;
        };
        state.reading = false;
        (
            state.handshake_cb.take(),
            state.read_cb.take(),
            state.shutdown_cb.take(),
        )
    };
    if let Some(cb) = handshake_cb {
        cb(lp, handle, Err(io::Error::new(kind, msg)));
    }
    if let Some(mut cb) = read_cb {
        cb(lp, handle, Err(io::Error::new(kind, msg)), &[]);
    }
    if let Some(cb) = shutdown_cb {
        cb(lp, handle, Err(io::Error::new(kind, msg)));
    }
}

// ===== DTLS =====

pub(crate) struct DtlsState {
    transport: Udp,
    peer: SocketAddr,
    session: Option<Box<dyn DatagramSession>>,
    handshaken: bool,
    reading: bool,
    handshake_cb: Option<DtlsHandshakeCb>,
    read_cb: Option<DtlsReadCb>,
}

pub(crate) type DtlsHandshakeCb = Box<dyn FnOnce(&mut EventLoop, DtlsSocket, io::Result<()>)>;
pub(crate) type DtlsReadCb = Box<dyn FnMut(&mut EventLoop, DtlsSocket, io::Result<usize>, &[u8])>;

impl DtlsState {
    pub(crate) fn teardown(&mut self) -> Token {
        if let Some(session) = self.session.as_mut() {
            session.close();
        }
        self.session = None;
        self.handshake_cb = None;
        self.read_cb = None;
        self.reading = false;
        self.transport.token
    }
}

/// A DTLS session layered over a bound [`Udp`] handle, talking to one
/// `peer`. The record-layer provider is external.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DtlsSocket {
    token: Token,
}

impl_handle_common!(DtlsSocket);

impl DtlsSocket {
    pub fn new(
        lp: &mut EventLoop,
        transport: Udp,
        peer: SocketAddr,
        session: Box<dyn DatagramSession>,
    ) -> io::Result<DtlsSocket> {
        let token = lp.add_handle(HandleKind::Dtls(DtlsState {
            transport,
            peer,
            session: Some(session),
            handshaken: false,
            reading: false,
            handshake_cb: None,
            read_cb: None,
        }));
        let socket = DtlsSocket { token };
        if let Err(err) = transport.recv_start(lp, move |lp, _udp, res, data, src| {
            on_datagram(lp, token, res, data, src);
        }) {
            lp.close_handle(token, None);
            return Err(err);
        }
        Ok(socket)
    }

    pub fn handshake<F>(&self, lp: &mut EventLoop, cb: F) -> io::Result<()>
    where
        F: FnOnce(&mut EventLoop, DtlsSocket, io::Result<()>) + 'static,
    {
        {
            let state = dtls_state(lp, self.token)?;
            if state.handshaken || state.handshake_cb.is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "handshake already started",
                ));
            }
            state.handshake_cb = Some(Box::new(cb));
        }
        flush_transmits(lp, self.token);
        Ok(())
    }

    pub fn read_start<F>(&self, lp: &mut EventLoop, cb: F) -> io::Result<()>
    where
        F: FnMut(&mut EventLoop, DtlsSocket, io::Result<usize>, &[u8]) + 'static,
    {
        let state = dtls_state(lp, self.token)?;
        state.reading = true;
        state.read_cb = Some(Box::new(cb));
        Ok(())
    }

    pub fn read_stop(&self, lp: &mut EventLoop) -> io::Result<()> {
        let state = dtls_state(lp, self.token)?;
        state.reading = false;
        Ok(())
    }

    /// Encrypt `buf` into one or more datagrams and send them to the
    /// peer.
    pub fn write<B: Into<Vec<u8>>>(&self, lp: &mut EventLoop, buf: B) -> io::Result<()> {
        let buf = buf.into();
        {
            let state = dtls_state(lp, self.token)?;
            if !state.handshaken {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "handshake incomplete",
                ));
            }
            let session = state
                .session
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no session"))?;
            let mut data: &[u8] = &buf;
            while !data.is_empty() {
                let n = session.write_plain(data)?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "session refused plaintext",
                    ));
                }
                data = &data[n..];
            }
        }
        flush_transmits(lp, self.token);
        Ok(())
    }
}

fn dtls_state(lp: &mut EventLoop, token: Token) -> io::Result<&mut DtlsState> {
    match lp.handle_mut(token) {
        Some(slot) if !slot.closing => match &mut slot.kind {
            HandleKind::Dtls(state) => Ok(state),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a dtls handle",
            )),
        },
        _ => Err(io::Error::new(
            io::ErrorKind::NotFound,
            "handle closed or destroyed",
        )),
    }
}

fn on_datagram(
    lp: &mut EventLoop,
    token: Token,
    res: io::Result<usize>,
    data: &[u8],
    src: SocketAddr,
) {
    let handle = DtlsSocket { token };
    let (fed_plain, handshake_done, error) = {
        let Ok(state) = dtls_state(lp, token) else {
            return;
        };
        if res.is_err() || src != state.peer {
            // Stray datagrams from other sources are not the session's.
            return;
        }
        let Some(session) = state.session.as_mut() else {
            return;
        };
        let mut plain = Vec::new();
        match session.feed_datagram(data, &mut plain) {
            Ok(()) => {
                let done = if !session.is_handshaking() && !state.handshaken {
                    state.handshaken = true;
                    state.handshake_cb.take()
                } else {
                    None
                };
                (plain, done, None)
            }
            Err(err) => (Vec::new(), None, Some(err)),
        }
    };

    if let Some(err) = error {
        // Datagram transports tolerate damage; drop the packet.
        trace!("dtls {} dropped datagram: {}", token, err);
        return;
    }

    flush_transmits(lp, token);

    if let Some(cb) = handshake_done {
        cb(lp, handle, Ok(()));
    }

    if !fed_plain.is_empty() {
        let cb = dtls_state(lp, token).ok().and_then(|s| {
            if s.reading {
                s.read_cb.take()
            } else {
                None
            }
        });
        if let Some(mut cb) = cb {
            cb(lp, handle, Ok(fed_plain.len()), &fed_plain);
            if let Ok(state) = dtls_state(lp, token) {
                if state.read_cb.is_none() {
                    state.read_cb = Some(cb);
                }
            }
        }
    }
}

/// Send every datagram the session has queued.
fn flush_transmits(lp: &mut EventLoop, token: Token) {
    loop {
        let next = {
            let Ok(state) = dtls_state(lp, token) else {
                return;
            };
            let Some(session) = state.session.as_mut() else {
                return;
            };
            session.poll_transmit().map(|dgram| (state.transport, state.peer, dgram))
        };
        match next {
            Some((transport, peer, dgram)) => {
                let _ = transport.send(lp, dgram, peer);
            }
            None => return,
        }
    }
}

// ===== rustls adapter =====

/// [`RecordSession`] implementation backed by rustls.
#[cfg(feature = "tls")]
pub struct RustlsSession {
    conn: rustls::Connection,
}

#[cfg(feature = "tls")]
impl RustlsSession {
    pub fn client(
        config: std::sync::Arc<rustls::ClientConfig>,
        server_name: &str,
    ) -> io::Result<RustlsSession> {
        let name = rustls::pki_types::ServerName::try_from(server_name.to_string())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid server name"))?;
        let conn = rustls::ClientConnection::new(config, name)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        Ok(RustlsSession {
            conn: rustls::Connection::Client(conn),
        })
    }

    pub fn server(config: std::sync::Arc<rustls::ServerConfig>) -> io::Result<RustlsSession> {
        let conn = rustls::ServerConnection::new(config)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        Ok(RustlsSession {
            conn: rustls::Connection::Server(conn),
        })
    }
}

#[cfg(feature = "tls")]
impl std::fmt::Debug for RustlsSession {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("RustlsSession")
            .field("handshaking", &self.conn.is_handshaking())
            .finish()
    }
}

#[cfg(feature = "tls")]
impl RecordSession for RustlsSession {
    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    fn feed(&mut self, data: &[u8]) -> io::Result<()> {
        let mut cursor = io::Cursor::new(data);
        while (cursor.position() as usize) < data.len() {
            let n = self.conn.read_tls(&mut cursor)?;
            if n == 0 {
                break;
            }
            self.conn
                .process_new_packets()
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        }
        Ok(())
    }

    fn drain(&mut self, out: &mut Vec<u8>) -> io::Result<()> {
        while self.conn.wants_write() {
            self.conn.write_tls(out)?;
        }
        Ok(())
    }

    fn write_plain(&mut self, data: &[u8]) -> io::Result<usize> {
        use std::io::Write;
        self.conn.writer().write(data)
    }

    fn read_plain(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        self.conn.reader().read(buf)
    }

    fn send_close_notify(&mut self) {
        self.conn.send_close_notify();
    }
}
