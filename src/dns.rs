//! Thread-pool-backed DNS resolution.
//!
//! The blocking system resolver runs on a pool worker; its result re-enters
//! the loop thread through the deferred-work queue. A generation counter
//! gates completions so a canceled or timed-out request never fires its
//! callback late.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::event_loop::EventLoop;
use crate::handle::{impl_handle_common, HandleKind};
use crate::macros::trace;
use crate::Token;

pub(crate) type DnsCb = Box<dyn FnOnce(&mut EventLoop, DnsRequest, io::Result<Vec<SocketAddr>>)>;

/// Filter applied to resolver results.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AddressFamily {
    #[default]
    Any,
    V4,
    V6,
}

pub(crate) struct DnsState {
    pending: bool,
    /// Bumped whenever the in-flight operation becomes irrelevant; a
    /// completion whose generation no longer matches is discarded.
    generation: u64,
    cb: Option<DnsCb>,
    node: Option<String>,
    service: Option<String>,
}

impl DnsState {
    fn new() -> DnsState {
        DnsState {
            pending: false,
            generation: 0,
            cb: None,
            node: None,
            service: None,
        }
    }

    pub(crate) fn teardown(&mut self) {
        self.pending = false;
        self.generation += 1;
        self.cb = None;
    }
}

/// A resolver request handle. One lookup may be pending at a time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DnsRequest {
    token: Token,
}

impl_handle_common!(DnsRequest);

impl DnsRequest {
    pub fn new(lp: &mut EventLoop) -> DnsRequest {
        DnsRequest {
            token: lp.add_handle(HandleKind::Dns(DnsState::new())),
        }
    }

    /// Resolve `node`/`service` off-loop. `service` is a decimal port or
    /// empty for port zero. `cb` fires exactly once: with addresses, a
    /// resolver error, or `TimedOut` if `timeout` elapses first.
    pub fn getaddrinfo<F>(
        &self,
        lp: &mut EventLoop,
        node: &str,
        service: &str,
        family: AddressFamily,
        timeout: Option<Duration>,
        cb: F,
    ) -> io::Result<()>
    where
        F: FnOnce(&mut EventLoop, DnsRequest, io::Result<Vec<SocketAddr>>) + 'static,
    {
        let token = self.token;
        let generation = {
            let state = state_mut(lp, token)?;
            if state.pending {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "request already pending",
                ));
            }
            state.pending = true;
            state.generation += 1;
            state.node = Some(node.to_string());
            state.service = Some(service.to_string());
            state.cb = Some(Box::new(cb));
            state.generation
        };

        if let Some(timeout) = timeout {
            let deadline = lp.now() + timeout;
            lp.timers.insert(token, deadline);
        }
        lp.activate(token);
        // The pool task holds a reference; destruction waits for it.
        lp.ref_handle(token);

        let remote = lp.remote();
        let node = node.to_string();
        let service = service.to_string();
        let submit = lp.thread_pool().submit(
            move || {
                let result = resolve_blocking(&node, &service, family);
                let _ = remote.post(move |lp| complete(lp, token, generation, result));
            },
            None::<fn()>,
        );

        if let Err(err) = submit {
            lp.unref_handle(token);
            lp.timers.remove(token);
            lp.deactivate(token);
            if let Ok(state) = state_mut(lp, token) {
                state.pending = false;
                state.cb = None;
            }
            return Err(err);
        }
        Ok(())
    }

    /// Abandon the pending lookup and close the request. The running
    /// resolver task finishes but its result is discarded.
    pub fn cancel(&self, lp: &mut EventLoop) {
        let was_pending = match state_mut(lp, self.token) {
            Ok(state) => {
                let was = state.pending;
                state.pending = false;
                was
            }
            Err(_) => false,
        };
        if was_pending {
            trace!("canceling dns request {}", self.token);
            lp.close_handle(self.token, None);
        }
    }
}

fn state_mut(lp: &mut EventLoop, token: Token) -> io::Result<&mut DnsState> {
    match lp.handle_mut(token) {
        Some(slot) if !slot.closing => match &mut slot.kind {
            HandleKind::Dns(state) => Ok(state),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a dns request",
            )),
        },
        _ => Err(io::Error::new(
            io::ErrorKind::NotFound,
            "request closed or destroyed",
        )),
    }
}

/// Blocking resolve on a pool thread. The std resolver already restricts
/// results to configured address families, covering the AI_ADDRCONFIG
/// fallback the raw libc path would need.
fn resolve_blocking(
    node: &str,
    service: &str,
    family: AddressFamily,
) -> io::Result<Vec<SocketAddr>> {
    let port: u16 = if service.is_empty() {
        0
    } else {
        service
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid service"))?
    };

    let addrs: Vec<SocketAddr> = (node, port)
        .to_socket_addrs()?
        .filter(|addr| match family {
            AddressFamily::Any => true,
            AddressFamily::V4 => addr.is_ipv4(),
            AddressFamily::V6 => addr.is_ipv6(),
        })
        .collect();

    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no matching addresses",
        ));
    }
    Ok(addrs)
}

/// Loop-thread completion gate.
fn complete(lp: &mut EventLoop, token: Token, generation: u64, result: io::Result<Vec<SocketAddr>>) {
    lp.unref_handle(token);

    let cb = match state_mut(lp, token) {
        Ok(state) if state.pending && state.generation == generation => {
            state.pending = false;
            trace!(
                "dns {} resolved node={:?} service={:?}",
                token,
                state.node.take(),
                state.service.take()
            );
            state.cb.take()
        }
        // Canceled, timed out or closed while the task ran.
        _ => return,
    };

    lp.timers.remove(token);
    lp.deactivate(token);
    if let Some(cb) = cb {
        cb(lp, DnsRequest { token }, result);
    }
}

/// Timeout path, entered from the loop's timer heap.
pub(crate) fn on_timeout(lp: &mut EventLoop, token: Token) {
    let cb = match state_mut(lp, token) {
        Ok(state) if state.pending => {
            state.pending = false;
            state.generation += 1;
            state.cb.take()
        }
        _ => return,
    };

    lp.deactivate(token);
    if let Some(cb) = cb {
        cb(
            lp,
            DnsRequest { token },
            Err(io::Error::new(io::ErrorKind::TimedOut, "resolve timed out")),
        );
    }
    // The request is done for; a late resolver completion only drops the
    // pool reference.
    lp.close_handle(token, None);
}
