//! Networking handles and address helpers.

pub(crate) mod tcp;
pub(crate) mod udp;

pub use tcp::{Tcp, TcpBindFlags};
pub use udp::{Udp, UdpBindFlags};

use std::io;
use std::net::{IpAddr, SocketAddr};

/// Build a socket address from a textual host and a port.
pub fn parse_addr(host: &str, port: u16) -> io::Result<SocketAddr> {
    let ip: IpAddr = host
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid address literal"))?;
    Ok(SocketAddr::new(ip, port))
}

/// Render an address as `host:port` text.
pub fn format_addr(addr: &SocketAddr) -> String {
    addr.to_string()
}

/// `io::Error` is not `Clone`; rebuild one that carries the same kind (and
/// OS code when present) so a single failure can be fanned out to several
/// queued callbacks.
pub(crate) fn clone_err(err: &io::Error) -> io::Error {
    match err.raw_os_error() {
        Some(code) => io::Error::from_raw_os_error(code),
        None => io::Error::new(err.kind(), err.to_string()),
    }
}

pub(crate) fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

pub(crate) fn interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}

#[cfg(unix)]
pub(crate) fn connect_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(windows)]
pub(crate) fn connect_in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// Route a reaped completion to the driver that posted it. The operation
/// context is reclaimed exactly once here, and the reference it held on
/// its handle is dropped before the driver runs, so a closing handle can
/// reach refcount zero even when its callbacks are suppressed.
#[cfg(windows)]
pub(crate) fn dispatch_completion(
    lp: &mut crate::event_loop::EventLoop,
    event: &crate::event::Event,
) {
    use crate::sys::windows::overlapped::{self, OpKind};

    let op = unsafe { overlapped::reclaim(event.overlapped()) };
    lp.unref_handle(op.token);
    let bytes = event.bytes_transferred().unwrap_or(0);
    match op.kind {
        OpKind::Accept => tcp::on_accept_complete(lp, op),
        OpKind::Connect => tcp::on_connect_complete(lp, op),
        OpKind::Read => tcp::on_read_complete(lp, op, bytes),
        OpKind::Write => tcp::on_write_complete(lp, op, bytes),
        OpKind::RecvFrom => udp::on_recv_from_complete(lp, op, bytes),
        OpKind::SendTo => udp::on_send_to_complete(lp, op, bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format_roundtrip() {
        let addr = parse_addr("127.0.0.1", 8080).unwrap();
        assert_eq!(format_addr(&addr), "127.0.0.1:8080");
        let v6 = parse_addr("::1", 53).unwrap();
        assert!(v6.is_ipv6());
        assert!(parse_addr("not-an-ip", 1).is_err());
    }
}
