//! Handle slots: the per-handle base state every typed handle shares.

use std::any::Any;

use crate::event_loop::EventLoop;

/// Callback invoked after a closed handle has been destroyed.
pub type CloseCb = Box<dyn FnOnce(&mut EventLoop)>;

/// Typed driver state, one variant per handle type.
pub(crate) enum HandleKind {
    Timer(crate::timer::TimerState),
    Idle(crate::timer::IdleState),
    Tcp(crate::net::tcp::TcpState),
    Udp(crate::net::udp::UdpState),
    Tls(crate::tls::TlsState),
    Dtls(crate::tls::DtlsState),
    Dns(crate::dns::DnsState),
    Fs(crate::fs::FsState),
}

impl HandleKind {
    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            HandleKind::Timer(_) => "timer",
            HandleKind::Idle(_) => "idle",
            HandleKind::Tcp(_) => "tcp",
            HandleKind::Udp(_) => "udp",
            HandleKind::Tls(_) => "tls",
            HandleKind::Dtls(_) => "dtls",
            HandleKind::Dns(_) => "dns",
            HandleKind::Fs(_) => "fs",
        }
    }
}

/// One slot in the loop's handle arena.
///
/// Invariants: a handle counts toward the loop's active set iff
/// `active && !closing`; `closing` is monotonic; a slot whose `closing` is
/// set and whose `refcount` reached zero is destroyed at the end of the
/// iteration that observes it, never synchronously inside a user callback.
pub(crate) struct HandleSlot {
    pub(crate) kind: HandleKind,
    pub(crate) active: bool,
    pub(crate) closing: bool,
    /// Outstanding references held by posted operations (thread-pool tasks,
    /// overlapped contexts). Destruction waits for zero.
    pub(crate) refcount: u32,
    pub(crate) close_cb: Option<CloseCb>,
    pub(crate) data: Option<Box<dyn Any>>,
}

impl HandleSlot {
    pub(crate) fn new(kind: HandleKind) -> HandleSlot {
        HandleSlot {
            kind,
            active: false,
            closing: false,
            refcount: 0,
            close_cb: None,
            data: None,
        }
    }
}

/// Implements the operations common to every typed handle: close,
/// activity/closing queries, and the user-data slot.
macro_rules! impl_handle_common {
    ($ty: ident) => {
        impl $ty {
            /// The slot token identifying this handle inside its loop.
            pub fn token(&self) -> crate::Token {
                self.token
            }

            /// True while the loop must wait for this handle.
            pub fn is_active(&self, lp: &crate::EventLoop) -> bool {
                lp.handle_is_active(self.token)
            }

            /// True once `close` has been called.
            pub fn is_closing(&self, lp: &crate::EventLoop) -> bool {
                lp.handle_is_closing(self.token)
            }

            /// Close the handle. Destruction is deferred to the end of the
            /// iteration; repeated calls are no-ops.
            pub fn close(&self, lp: &mut crate::EventLoop) {
                lp.close_handle(self.token, None);
            }

            /// Close the handle, running `cb` once it has been destroyed.
            /// Only the first close's callback is kept.
            pub fn close_with<F>(&self, lp: &mut crate::EventLoop, cb: F)
            where
                F: FnOnce(&mut crate::EventLoop) + 'static,
            {
                lp.close_handle(self.token, Some(Box::new(cb)));
            }

            /// Attach arbitrary user data to the handle.
            pub fn set_data(&self, lp: &mut crate::EventLoop, data: Box<dyn std::any::Any>) {
                lp.set_handle_data(self.token, data);
            }

            /// Borrow previously attached user data.
            pub fn data<'l>(
                &self,
                lp: &'l mut crate::EventLoop,
            ) -> Option<&'l mut Box<dyn std::any::Any>> {
                lp.handle_data(self.token)
            }
        }
    };
}

pub(crate) use impl_handle_common;
