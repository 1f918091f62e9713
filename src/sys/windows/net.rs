//! WinSock socket facade mirroring the Unix one: every socket is created
//! non-blocking; the drivers never see a blocking descriptor.

use std::io;
use std::mem::{size_of, MaybeUninit};
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::windows::io::RawSocket;
use std::time::Duration;

use windows_sys::Win32::Networking::WinSock::{
    self, SOCKADDR, SOCKADDR_IN, SOCKADDR_IN6, SOCKADDR_STORAGE, SOCKET, SOCKET_ERROR,
};

pub(crate) enum RawAddr {
    V4(SOCKADDR_IN),
    V6(SOCKADDR_IN6),
}

impl RawAddr {
    pub(crate) fn as_ptr(&self) -> *const SOCKADDR {
        match self {
            RawAddr::V4(addr) => addr as *const _ as *const SOCKADDR,
            RawAddr::V6(addr) => addr as *const _ as *const SOCKADDR,
        }
    }

    pub(crate) fn len(&self) -> i32 {
        match self {
            RawAddr::V4(_) => size_of::<SOCKADDR_IN>() as i32,
            RawAddr::V6(_) => size_of::<SOCKADDR_IN6>() as i32,
        }
    }
}

pub(crate) fn from_socket_addr(addr: &SocketAddr) -> RawAddr {
    match addr {
        SocketAddr::V4(addr) => {
            let mut raw: SOCKADDR_IN = unsafe { std::mem::zeroed() };
            raw.sin_family = WinSock::AF_INET;
            raw.sin_port = addr.port().to_be();
            raw.sin_addr.S_un.S_addr = u32::from(*addr.ip()).to_be();
            RawAddr::V4(raw)
        }
        SocketAddr::V6(addr) => {
            let mut raw: SOCKADDR_IN6 = unsafe { std::mem::zeroed() };
            raw.sin6_family = WinSock::AF_INET6;
            raw.sin6_port = addr.port().to_be();
            raw.sin6_addr.u.Byte = addr.ip().octets();
            raw.sin6_scope_id = addr.scope_id();
            RawAddr::V6(raw)
        }
    }
}

pub(crate) unsafe fn to_socket_addr(storage: *const SOCKADDR_STORAGE) -> io::Result<SocketAddr> {
    match (*storage).ss_family {
        WinSock::AF_INET => {
            let addr = &*(storage as *const SOCKADDR_IN);
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.S_un.S_addr));
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(addr.sin_port),
            )))
        }
        WinSock::AF_INET6 => {
            let addr = &*(storage as *const SOCKADDR_IN6);
            let ip = std::net::Ipv6Addr::from(addr.sin6_addr.u.Byte);
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

fn last_error() -> io::Error {
    io::Error::from_raw_os_error(unsafe { WinSock::WSAGetLastError() })
}

fn cvt(ret: i32) -> io::Result<i32> {
    if ret == SOCKET_ERROR {
        Err(last_error())
    } else {
        Ok(ret)
    }
}

/// An owned, non-blocking WinSock socket.
#[derive(Debug)]
pub(crate) struct Socket {
    raw: SOCKET,
}

impl Socket {
    pub(crate) fn stream(addr: &SocketAddr) -> io::Result<Socket> {
        Socket::new(addr, WinSock::SOCK_STREAM)
    }

    pub(crate) fn datagram(addr: &SocketAddr) -> io::Result<Socket> {
        Socket::new(addr, WinSock::SOCK_DGRAM)
    }

    fn new(addr: &SocketAddr, ty: u16) -> io::Result<Socket> {
        super::init();
        let family = match addr {
            SocketAddr::V4(..) => WinSock::AF_INET,
            SocketAddr::V6(..) => WinSock::AF_INET6,
        };
        let raw = unsafe {
            WinSock::WSASocketW(
                family as i32,
                ty as i32,
                0,
                std::ptr::null(),
                0,
                WinSock::WSA_FLAG_OVERLAPPED | WinSock::WSA_FLAG_NO_HANDLE_INHERIT,
            )
        };
        if raw == WinSock::INVALID_SOCKET {
            return Err(last_error());
        }
        let socket = Socket { raw };
        socket.set_nonblocking()?;
        Ok(socket)
    }

    fn set_nonblocking(&self) -> io::Result<()> {
        let mut enabled: u32 = 1;
        cvt(unsafe { WinSock::ioctlsocket(self.raw, WinSock::FIONBIO, &mut enabled) }).map(drop)
    }

    /// Used when a socket is detached to a blocking std consumer.
    pub(crate) fn set_blocking(&self) -> io::Result<()> {
        let mut enabled: u32 = 0;
        cvt(unsafe { WinSock::ioctlsocket(self.raw, WinSock::FIONBIO, &mut enabled) }).map(drop)
    }

    pub(crate) fn from_raw(raw: SOCKET) -> Socket {
        Socket { raw }
    }

    pub(crate) fn raw(&self) -> RawSocket {
        self.raw as RawSocket
    }

    pub(crate) fn raw_socket(&self) -> SOCKET {
        self.raw
    }

    /// A fresh unbound stream socket of this socket's family; `AcceptEx`
    /// wants the accepted connection to land on one.
    pub(crate) fn sibling_stream(&self) -> io::Result<Socket> {
        let addr = self.local_addr()?;
        Socket::stream(&addr)
    }

    /// Finish an `AcceptEx`-created socket so the usual socket calls work
    /// on it.
    pub(crate) fn update_accept_context(&self, listener: &Socket) -> io::Result<()> {
        let raw: SOCKET = listener.raw;
        cvt(unsafe {
            WinSock::setsockopt(
                self.raw,
                WinSock::SOL_SOCKET as i32,
                WinSock::SO_UPDATE_ACCEPT_CONTEXT as i32,
                &raw as *const _ as *const u8,
                size_of::<SOCKET>() as i32,
            )
        })
        .map(drop)
    }

    /// Finish a `ConnectEx`-created connection the same way.
    pub(crate) fn update_connect_context(&self) -> io::Result<()> {
        cvt(unsafe {
            WinSock::setsockopt(
                self.raw,
                WinSock::SOL_SOCKET as i32,
                WinSock::SO_UPDATE_CONNECT_CONTEXT as i32,
                std::ptr::null(),
                0,
            )
        })
        .map(drop)
    }

    pub(crate) fn into_raw(self) -> RawSocket {
        let raw = self.raw;
        std::mem::forget(self);
        raw as RawSocket
    }

    pub(crate) fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let raw = from_socket_addr(addr);
        cvt(unsafe { WinSock::bind(self.raw, raw.as_ptr(), raw.len()) }).map(drop)
    }

    pub(crate) fn listen(&self, backlog: u32) -> io::Result<()> {
        let backlog = backlog.try_into().unwrap_or(i32::MAX);
        cvt(unsafe { WinSock::listen(self.raw, backlog) }).map(drop)
    }

    pub(crate) fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        let raw = from_socket_addr(addr);
        cvt(unsafe { WinSock::connect(self.raw, raw.as_ptr(), raw.len()) }).map(drop)
    }

    pub(crate) fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: MaybeUninit<SOCKADDR_STORAGE> = MaybeUninit::zeroed();
        let mut len = size_of::<SOCKADDR_STORAGE>() as i32;
        let raw = unsafe {
            WinSock::accept(self.raw, storage.as_mut_ptr() as *mut SOCKADDR, &mut len)
        };
        if raw == WinSock::INVALID_SOCKET {
            return Err(last_error());
        }
        let socket = Socket { raw };
        socket.set_nonblocking()?;
        let addr = unsafe { to_socket_addr(storage.as_ptr())? };
        Ok((socket, addr))
    }

    pub(crate) fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = cvt(unsafe {
            WinSock::recv(self.raw, buf.as_mut_ptr(), buf.len().min(i32::MAX as usize) as i32, 0)
        })?;
        Ok(n as usize)
    }

    pub(crate) fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let n = cvt(unsafe {
            WinSock::send(self.raw, buf.as_ptr(), buf.len().min(i32::MAX as usize) as i32, 0)
        })?;
        Ok(n as usize)
    }

    pub(crate) fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut storage: MaybeUninit<SOCKADDR_STORAGE> = MaybeUninit::zeroed();
        let mut len = size_of::<SOCKADDR_STORAGE>() as i32;
        let n = cvt(unsafe {
            WinSock::recvfrom(
                self.raw,
                buf.as_mut_ptr(),
                buf.len().min(i32::MAX as usize) as i32,
                0,
                storage.as_mut_ptr() as *mut SOCKADDR,
                &mut len,
            )
        })?;
        let addr = unsafe { to_socket_addr(storage.as_ptr())? };
        Ok((n as usize, addr))
    }

    pub(crate) fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<usize> {
        let raw = from_socket_addr(target);
        let n = cvt(unsafe {
            WinSock::sendto(
                self.raw,
                buf.as_ptr(),
                buf.len().min(i32::MAX as usize) as i32,
                0,
                raw.as_ptr(),
                raw.len(),
            )
        })?;
        Ok(n as usize)
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: MaybeUninit<SOCKADDR_STORAGE> = MaybeUninit::zeroed();
        let mut len = size_of::<SOCKADDR_STORAGE>() as i32;
        cvt(unsafe {
            WinSock::getsockname(self.raw, storage.as_mut_ptr() as *mut SOCKADDR, &mut len)
        })?;
        unsafe { to_socket_addr(storage.as_ptr()) }
    }

    pub(crate) fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: MaybeUninit<SOCKADDR_STORAGE> = MaybeUninit::zeroed();
        let mut len = size_of::<SOCKADDR_STORAGE>() as i32;
        cvt(unsafe {
            WinSock::getpeername(self.raw, storage.as_mut_ptr() as *mut SOCKADDR, &mut len)
        })?;
        unsafe { to_socket_addr(storage.as_ptr()) }
    }

    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut err: i32 = 0;
        let mut len = size_of::<i32>() as i32;
        cvt(unsafe {
            WinSock::getsockopt(
                self.raw,
                WinSock::SOL_SOCKET as i32,
                WinSock::SO_ERROR as i32,
                &mut err as *mut _ as *mut u8,
                &mut len,
            )
        })?;
        if err == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(err)))
        }
    }

    fn set_opt(&self, level: i32, name: i32, value: i32) -> io::Result<()> {
        cvt(unsafe {
            WinSock::setsockopt(
                self.raw,
                level,
                name,
                &value as *const _ as *const u8,
                size_of::<i32>() as i32,
            )
        })
        .map(drop)
    }

    pub(crate) fn set_nodelay(&self, on: bool) -> io::Result<()> {
        self.set_opt(
            WinSock::IPPROTO_TCP,
            WinSock::TCP_NODELAY as i32,
            on as i32,
        )
    }

    pub(crate) fn set_keepalive(&self, idle: Option<Duration>) -> io::Result<()> {
        self.set_opt(
            WinSock::SOL_SOCKET as i32,
            WinSock::SO_KEEPALIVE as i32,
            idle.is_some() as i32,
        )
    }

    pub(crate) fn set_reuseaddr(&self, on: bool) -> io::Result<()> {
        self.set_opt(
            WinSock::SOL_SOCKET as i32,
            WinSock::SO_REUSEADDR as i32,
            on as i32,
        )
    }

    pub(crate) fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        self.set_opt(WinSock::IPPROTO_IP, WinSock::IP_TTL as i32, ttl as i32)
    }

    pub(crate) fn set_broadcast(&self, on: bool) -> io::Result<()> {
        self.set_opt(
            WinSock::SOL_SOCKET as i32,
            WinSock::SO_BROADCAST as i32,
            on as i32,
        )
    }

    pub(crate) fn shutdown_write(&self) -> io::Result<()> {
        cvt(unsafe { WinSock::shutdown(self.raw, WinSock::SD_SEND) }).map(drop)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        unsafe { WinSock::closesocket(self.raw) };
    }
}
