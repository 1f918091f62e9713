//! Thin facade over the OS socket calls.
//!
//! Every socket is created non-blocking and close-on-exec; the drivers never
//! see a blocking descriptor.

use std::io;
use std::mem::{size_of, size_of_val, MaybeUninit};
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::syscall;

/// Owned C representation of a socket address, kept alive across the
/// syscall that reads it.
pub(crate) enum RawAddr {
    V4(libc::sockaddr_in),
    V6(libc::sockaddr_in6),
}

impl RawAddr {
    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        match self {
            RawAddr::V4(addr) => addr as *const _ as *const libc::sockaddr,
            RawAddr::V6(addr) => addr as *const _ as *const libc::sockaddr,
        }
    }

    pub(crate) fn len(&self) -> libc::socklen_t {
        match self {
            RawAddr::V4(addr) => size_of_val(addr) as libc::socklen_t,
            RawAddr::V6(addr) => size_of_val(addr) as libc::socklen_t,
        }
    }
}

pub(crate) fn from_socket_addr(addr: &SocketAddr) -> RawAddr {
    match addr {
        SocketAddr::V4(addr) => {
            let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            raw.sin_family = libc::AF_INET as libc::sa_family_t;
            raw.sin_port = addr.port().to_be();
            raw.sin_addr = libc::in_addr {
                s_addr: u32::from(*addr.ip()).to_be(),
            };
            RawAddr::V4(raw)
        }
        SocketAddr::V6(addr) => {
            let mut raw: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            raw.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            raw.sin6_port = addr.port().to_be();
            raw.sin6_addr = libc::in6_addr {
                s6_addr: addr.ip().octets(),
            };
            raw.sin6_flowinfo = addr.flowinfo();
            raw.sin6_scope_id = addr.scope_id();
            RawAddr::V6(raw)
        }
    }
}

/// `storage` must hold a `sockaddr_in` or `sockaddr_in6` written by the
/// kernel.
pub(crate) unsafe fn to_socket_addr(
    storage: *const libc::sockaddr_storage,
) -> io::Result<SocketAddr> {
    match (*storage).ss_family as libc::c_int {
        libc::AF_INET => {
            let addr = &*(storage as *const libc::sockaddr_in);
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(addr.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let addr = &*(storage as *const libc::sockaddr_in6);
            let ip = std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(addr.sin6_port),
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

fn domain_for(addr: &SocketAddr) -> libc::c_int {
    match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    }
}

/// An owned, non-blocking socket descriptor.
#[derive(Debug)]
pub(crate) struct Socket {
    fd: RawFd,
}

impl Socket {
    /// New non-blocking TCP socket for `addr`'s family.
    pub(crate) fn stream(addr: &SocketAddr) -> io::Result<Socket> {
        Socket::new(domain_for(addr), libc::SOCK_STREAM)
    }

    /// New non-blocking UDP socket for `addr`'s family.
    pub(crate) fn datagram(addr: &SocketAddr) -> io::Result<Socket> {
        Socket::new(domain_for(addr), libc::SOCK_DGRAM)
    }

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    fn new(domain: libc::c_int, ty: libc::c_int) -> io::Result<Socket> {
        let fd = syscall!(socket(domain, ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0))?;
        Ok(Socket { fd })
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    fn new(domain: libc::c_int, ty: libc::c_int) -> io::Result<Socket> {
        let fd = syscall!(socket(domain, ty, 0))?;
        let socket = Socket { fd };
        syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK))?;
        syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(socket)
    }

    /// Adopt an already-connected descriptor (used for accepted sockets).
    pub(crate) fn from_raw(fd: RawFd) -> Socket {
        Socket { fd }
    }

    pub(crate) fn raw(&self) -> RawFd {
        self.fd
    }

    /// Release ownership of the descriptor without closing it.
    pub(crate) fn into_raw(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }

    pub(crate) fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let raw = from_socket_addr(addr);
        syscall!(bind(self.fd, raw.as_ptr(), raw.len())).map(drop)
    }

    pub(crate) fn listen(&self, backlog: u32) -> io::Result<()> {
        let backlog = backlog.try_into().unwrap_or(i32::MAX);
        syscall!(listen(self.fd, backlog)).map(drop)
    }

    /// Start a non-blocking connect. `EINPROGRESS` is reported as a raw OS
    /// error; the driver treats it as "pending".
    pub(crate) fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        let raw = from_socket_addr(addr);
        syscall!(connect(self.fd, raw.as_ptr(), raw.len())).map(drop)
    }

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    pub(crate) fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = syscall!(accept4(
            self.fd,
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;
        let addr = unsafe { to_socket_addr(storage.as_ptr())? };
        Ok((Socket { fd }, addr))
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    pub(crate) fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = syscall!(accept(
            self.fd,
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut len,
        ))?;
        let socket = Socket { fd };
        syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK))?;
        syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
        let addr = unsafe { to_socket_addr(storage.as_ptr())? };
        Ok((socket, addr))
    }

    pub(crate) fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = syscall!(recv(
            self.fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
        ))?;
        Ok(n as usize)
    }

    pub(crate) fn send(&self, buf: &[u8]) -> io::Result<usize> {
        // MSG_NOSIGNAL: a peer reset must surface as EPIPE, not kill the
        // process.
        #[cfg(not(any(target_os = "macos", target_os = "ios")))]
        let flags = libc::MSG_NOSIGNAL;
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        let flags = 0;
        let n = syscall!(send(
            self.fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            flags,
        ))?;
        Ok(n as usize)
    }

    pub(crate) fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = syscall!(recvfrom(
            self.fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut len,
        ))?;
        let addr = unsafe { to_socket_addr(storage.as_ptr())? };
        Ok((n as usize, addr))
    }

    pub(crate) fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<usize> {
        let raw = from_socket_addr(target);
        let n = syscall!(sendto(
            self.fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            0,
            raw.as_ptr(),
            raw.len(),
        ))?;
        Ok(n as usize)
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(
            self.fd,
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut len,
        ))?;
        unsafe { to_socket_addr(storage.as_ptr()) }
    }

    pub(crate) fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getpeername(
            self.fd,
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut len,
        ))?;
        unsafe { to_socket_addr(storage.as_ptr()) }
    }

    /// Read and clear `SO_ERROR`; used to resolve a pending connect.
    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut err: libc::c_int = 0;
        let mut len = size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            self.fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        ))?;
        if err == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(err)))
        }
    }

    fn set_opt(
        &self,
        level: libc::c_int,
        name: libc::c_int,
        value: libc::c_int,
    ) -> io::Result<()> {
        syscall!(setsockopt(
            self.fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        ))
        .map(drop)
    }

    pub(crate) fn set_nodelay(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::IPPROTO_TCP, libc::TCP_NODELAY, on as libc::c_int)
    }

    pub(crate) fn set_keepalive(&self, idle: Option<Duration>) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, idle.is_some() as libc::c_int)?;
        if let Some(idle) = idle {
            let secs = idle.as_secs().clamp(1, i32::MAX as u64) as libc::c_int;
            #[cfg(any(target_os = "linux", target_os = "android"))]
            self.set_opt(libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, secs)?;
            #[cfg(any(target_os = "macos", target_os = "ios"))]
            self.set_opt(libc::IPPROTO_TCP, libc::TCP_KEEPALIVE, secs)?;
            #[cfg(not(any(
                target_os = "linux",
                target_os = "android",
                target_os = "macos",
                target_os = "ios",
            )))]
            let _ = secs;
        }
        Ok(())
    }

    pub(crate) fn set_reuseaddr(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, on as libc::c_int)
    }

    pub(crate) fn set_reuseport(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_REUSEPORT, on as libc::c_int)
    }

    pub(crate) fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        self.set_opt(libc::IPPROTO_IP, libc::IP_TTL, ttl as libc::c_int)
    }

    pub(crate) fn set_broadcast(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_BROADCAST, on as libc::c_int)
    }

    pub(crate) fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.fd, libc::SHUT_WR)).map(drop)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let _ = syscall!(close(self.fd));
    }
}
