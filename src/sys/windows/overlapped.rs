//! Overlapped operation contexts and the posting calls behind them.
//!
//! Every asynchronous operation on the completion backend is a heap-pinned
//! [`Operation`]: the `OVERLAPPED` the kernel holds is its first field, so
//! the raw pointer coming back in a completion entry recovers the whole
//! typed context — owning handle token, operation kind and the buffer that
//! was handed to the kernel. The box is leaked while the operation is in
//! flight and reclaimed exactly once when its completion is reaped; the
//! driver mirrors that with the handle's refcount.

use std::io;
use std::mem::size_of;
use std::net::SocketAddr;

use windows_sys::core::GUID;
use windows_sys::Win32::Networking::WinSock::{
    self, SOCKADDR, SOCKADDR_STORAGE, SOCKET, SOCKET_ERROR, WSABUF, WSAID_ACCEPTEX,
    WSAID_CONNECTEX,
};
use windows_sys::Win32::System::IO::OVERLAPPED;

use super::net::{from_socket_addr, RawAddr, Socket};
use crate::Token;

/// Room for one local and one remote address in an `AcceptEx` output
/// buffer, each padded by 16 bytes as the call requires.
const ACCEPT_ADDR_LEN: u32 = (size_of::<SOCKADDR_STORAGE>() + 16) as u32;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum OpKind {
    Accept,
    Connect,
    Read,
    Write,
    RecvFrom,
    SendTo,
}

/// One posted overlapped operation. `overlapped` must stay the first field
/// so the kernel's pointer and the context pointer coincide.
#[repr(C)]
pub(crate) struct Operation {
    overlapped: OVERLAPPED,
    pub(crate) kind: OpKind,
    /// Identity of the owning handle, embedded so a completion alone
    /// recovers it.
    pub(crate) token: Token,
    /// Non-owning copy of the socket the operation was posted on.
    socket: SOCKET,
    /// The real I/O buffer the kernel reads from or writes into.
    pub(crate) buf: Vec<u8>,
    /// `AcceptEx`: the pre-created socket the connection lands on.
    pub(crate) accepted: Option<Socket>,
    /// `WSASendTo`: destination, kept alive for the call.
    dest: Option<RawAddr>,
    /// `WSARecvFrom`: source address written at completion.
    from: SOCKADDR_STORAGE,
    from_len: i32,
}

impl Operation {
    fn new(kind: OpKind, token: Token, socket: SOCKET, buf: Vec<u8>) -> Box<Operation> {
        Box::new(Operation {
            overlapped: unsafe { std::mem::zeroed() },
            kind,
            token,
            socket,
            buf,
            accepted: None,
            dest: None,
            from: unsafe { std::mem::zeroed() },
            from_len: size_of::<SOCKADDR_STORAGE>() as i32,
        })
    }

    /// Source address of a completed `WSARecvFrom`.
    pub(crate) fn source_addr(&self) -> io::Result<SocketAddr> {
        unsafe { super::net::to_socket_addr(&self.from) }
    }

    /// Success or failure of the completed operation.
    pub(crate) fn result(&self) -> io::Result<usize> {
        let mut transferred: u32 = 0;
        let mut flags: u32 = 0;
        let ok = unsafe {
            WinSock::WSAGetOverlappedResult(
                self.socket,
                &self.overlapped,
                &mut transferred,
                0,
                &mut flags,
            )
        };
        if ok == 0 {
            Err(io::Error::from_raw_os_error(unsafe {
                WinSock::WSAGetLastError()
            }))
        } else {
            Ok(transferred as usize)
        }
    }
}

/// Take ownership back from the kernel. Must be called exactly once per
/// reaped completion entry.
pub(crate) unsafe fn reclaim(overlapped: usize) -> Box<Operation> {
    Box::from_raw(overlapped as *mut Operation)
}

/// Readiness class of a still-leaked operation, for the backend's event
/// record. Reads only the header; ownership stays with the kernel side.
pub(crate) unsafe fn peek_kind(overlapped: usize) -> OpKind {
    (*(overlapped as *const Operation)).kind
}

fn last_error() -> io::Error {
    io::Error::from_raw_os_error(unsafe { WinSock::WSAGetLastError() })
}

/// Leak the box into the kernel's care, or reclaim it on a synchronous
/// failure. Success and `WSA_IO_PENDING` both mean a completion will be
/// queued.
fn finish_post(op: Box<Operation>, ret: i32) -> io::Result<()> {
    let raw = Box::into_raw(op);
    if ret == 0 {
        return Ok(());
    }
    let err = unsafe { WinSock::WSAGetLastError() };
    if err == WinSock::WSA_IO_PENDING {
        Ok(())
    } else {
        drop(unsafe { Box::from_raw(raw) });
        Err(io::Error::from_raw_os_error(err))
    }
}

type AcceptExFn = unsafe extern "system" fn(
    SOCKET,
    SOCKET,
    *mut std::ffi::c_void,
    u32,
    u32,
    u32,
    *mut u32,
    *mut OVERLAPPED,
) -> i32;

type ConnectExFn = unsafe extern "system" fn(
    SOCKET,
    *const SOCKADDR,
    i32,
    *const std::ffi::c_void,
    u32,
    *mut u32,
    *mut OVERLAPPED,
) -> i32;

/// `AcceptEx`/`ConnectEx` are reached through `WSAIoctl`, per WinSock's
/// extension mechanism.
fn extension_fn(socket: SOCKET, guid: GUID) -> io::Result<usize> {
    let mut func: usize = 0;
    let mut bytes: u32 = 0;
    let ret = unsafe {
        WinSock::WSAIoctl(
            socket,
            WinSock::SIO_GET_EXTENSION_FUNCTION_POINTER,
            &guid as *const _ as *const std::ffi::c_void,
            size_of::<GUID>() as u32,
            &mut func as *mut _ as *mut std::ffi::c_void,
            size_of::<usize>() as u32,
            &mut bytes,
            std::ptr::null_mut(),
            None,
        )
    };
    if ret == SOCKET_ERROR {
        Err(last_error())
    } else {
        Ok(func)
    }
}

/// Post one `AcceptEx` on `listener`, landing on a fresh socket of the
/// same family.
pub(crate) fn post_accept(listener: &Socket, token: Token) -> io::Result<()> {
    let accepted = listener.sibling_stream()?;
    let func = extension_fn(listener.raw_socket(), WSAID_ACCEPTEX)?;
    let accept_ex: AcceptExFn = unsafe { std::mem::transmute(func) };

    let mut op = Operation::new(
        OpKind::Accept,
        token,
        listener.raw_socket(),
        vec![0u8; 2 * ACCEPT_ADDR_LEN as usize],
    );
    op.accepted = Some(accepted);
    let accepted_raw = op.accepted.as_ref().expect("just stored").raw_socket();
    let mut received: u32 = 0;
    let buf_ptr = op.buf.as_mut_ptr() as *mut std::ffi::c_void;
    let overlapped = &mut op.overlapped as *mut OVERLAPPED;
    let ret = unsafe {
        accept_ex(
            listener.raw_socket(),
            accepted_raw,
            buf_ptr,
            0, // no receive-with-accept; data flows through posted reads
            ACCEPT_ADDR_LEN,
            ACCEPT_ADDR_LEN,
            &mut received,
            overlapped,
        )
    };
    // AcceptEx reports success as TRUE and failure through WSAGetLastError.
    finish_post(op, if ret != 0 { 0 } else { SOCKET_ERROR })
}

/// Post a `ConnectEx` to `addr`. The socket must already be bound.
pub(crate) fn post_connect(socket: &Socket, addr: &SocketAddr, token: Token) -> io::Result<()> {
    let func = extension_fn(socket.raw_socket(), WSAID_CONNECTEX)?;
    let connect_ex: ConnectExFn = unsafe { std::mem::transmute(func) };

    let mut op = Operation::new(OpKind::Connect, token, socket.raw_socket(), Vec::new());
    op.dest = Some(from_socket_addr(addr));
    let (name, name_len) = {
        let dest = op.dest.as_ref().expect("just stored");
        (dest.as_ptr(), dest.len())
    };
    let mut sent: u32 = 0;
    let overlapped = &mut op.overlapped as *mut OVERLAPPED;
    let ret = unsafe {
        connect_ex(
            socket.raw_socket(),
            name,
            name_len,
            std::ptr::null(),
            0,
            &mut sent,
            overlapped,
        )
    };
    finish_post(op, if ret != 0 { 0 } else { SOCKET_ERROR })
}

/// Post a `WSARecv` with a real buffer; the completion carries the bytes
/// the kernel already copied in.
pub(crate) fn post_recv(socket: &Socket, token: Token, buf: Vec<u8>) -> io::Result<()> {
    let mut op = Operation::new(OpKind::Read, token, socket.raw_socket(), buf);
    let mut wsabuf = WSABUF {
        len: op.buf.len().min(u32::MAX as usize) as u32,
        buf: op.buf.as_mut_ptr(),
    };
    let mut flags: u32 = 0;
    let overlapped = &mut op.overlapped as *mut OVERLAPPED;
    let ret = unsafe {
        WinSock::WSARecv(
            socket.raw_socket(),
            &mut wsabuf,
            1,
            std::ptr::null_mut(),
            &mut flags,
            overlapped,
            None,
        )
    };
    finish_post(op, ret)
}

/// Post a `WSASend` owning `buf`; the driver keeps one in flight per
/// stream and chains the next on completion.
pub(crate) fn post_send(socket: &Socket, token: Token, buf: Vec<u8>) -> io::Result<()> {
    let mut op = Operation::new(OpKind::Write, token, socket.raw_socket(), buf);
    let mut wsabuf = WSABUF {
        len: op.buf.len().min(u32::MAX as usize) as u32,
        buf: op.buf.as_mut_ptr(),
    };
    let overlapped = &mut op.overlapped as *mut OVERLAPPED;
    let ret = unsafe {
        WinSock::WSASend(
            socket.raw_socket(),
            &mut wsabuf,
            1,
            std::ptr::null_mut(),
            0,
            overlapped,
            None,
        )
    };
    finish_post(op, ret)
}

/// Post a `WSARecvFrom`; the source address lands in the context.
pub(crate) fn post_recv_from(socket: &Socket, token: Token, buf: Vec<u8>) -> io::Result<()> {
    let mut op = Operation::new(OpKind::RecvFrom, token, socket.raw_socket(), buf);
    let mut wsabuf = WSABUF {
        len: op.buf.len().min(u32::MAX as usize) as u32,
        buf: op.buf.as_mut_ptr(),
    };
    let mut flags: u32 = 0;
    let from = &mut op.from as *mut SOCKADDR_STORAGE as *mut SOCKADDR;
    let from_len = &mut op.from_len as *mut i32;
    let overlapped = &mut op.overlapped as *mut OVERLAPPED;
    let ret = unsafe {
        WinSock::WSARecvFrom(
            socket.raw_socket(),
            &mut wsabuf,
            1,
            std::ptr::null_mut(),
            &mut flags,
            from,
            from_len,
            overlapped,
            None,
        )
    };
    finish_post(op, ret)
}

/// Post one datagram as a `WSASendTo`; one at a time per socket, further
/// sends queue in the driver.
pub(crate) fn post_send_to(
    socket: &Socket,
    token: Token,
    buf: Vec<u8>,
    dst: &SocketAddr,
) -> io::Result<()> {
    let mut op = Operation::new(OpKind::SendTo, token, socket.raw_socket(), buf);
    op.dest = Some(from_socket_addr(dst));
    let (to, to_len) = {
        let dest = op.dest.as_ref().expect("just stored");
        (dest.as_ptr(), dest.len())
    };
    let mut wsabuf = WSABUF {
        len: op.buf.len().min(u32::MAX as usize) as u32,
        buf: op.buf.as_mut_ptr(),
    };
    let overlapped = &mut op.overlapped as *mut OVERLAPPED;
    let ret = unsafe {
        WinSock::WSASendTo(
            socket.raw_socket(),
            &mut wsabuf,
            1,
            std::ptr::null_mut(),
            0,
            to,
            to_len,
            overlapped,
            None,
        )
    };
    finish_post(op, ret)
}
