//! Windows wake mechanisms: a posted completion for the IOCP backend and
//! a loopback UDP socket pair (any fd-observable wake works) for the
//! select fallback.

use std::io;
use std::net::SocketAddr;
use std::os::windows::io::RawSocket;

use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::System::IO::PostQueuedCompletionStatus;

use super::net::Socket;
use crate::waker::Wake;

/// Wakes a blocked `GetQueuedCompletionStatusEx` by posting a synthetic
/// zero-byte completion under the wake key.
pub(crate) struct IocpWaker {
    port: HANDLE,
    key: usize,
}

// The port outlives the loop that owns the backend; posting is
// documented thread-safe.
unsafe impl Send for IocpWaker {}
unsafe impl Sync for IocpWaker {}

impl IocpWaker {
    pub(crate) fn new(port: HANDLE, key: usize) -> IocpWaker {
        IocpWaker { port, key }
    }
}

impl Wake for IocpWaker {
    fn wake(&self) -> io::Result<()> {
        let ok = unsafe { PostQueuedCompletionStatus(self.port, 0, self.key, std::ptr::null()) };
        if ok == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

/// A pair of loopback UDP sockets; a one-byte datagram from the sender
/// makes the receiver readable, which is all a readiness backend needs.
pub(crate) struct UdpPairWaker {
    sender: Socket,
    receiver: Socket,
    target: SocketAddr,
}

unsafe impl Send for UdpPairWaker {}
unsafe impl Sync for UdpPairWaker {}

impl UdpPairWaker {
    pub(crate) fn new() -> io::Result<UdpPairWaker> {
        let any: SocketAddr = "127.0.0.1:0".parse().expect("literal parses");
        let receiver = Socket::datagram(&any)?;
        receiver.bind(&any)?;
        let target = receiver.local_addr()?;
        let sender = Socket::datagram(&any)?;
        sender.bind(&any)?;
        Ok(UdpPairWaker {
            sender,
            receiver,
            target,
        })
    }

    pub(crate) fn raw(&self) -> RawSocket {
        self.receiver.raw()
    }
}

impl Wake for UdpPairWaker {
    fn wake(&self) -> io::Result<()> {
        match self.sender.send_to(&[1], &self.target) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn ack(&self) {
        let mut buf = [0u8; 64];
        while self.receiver.recv_from(&mut buf).is_ok() {}
    }
}
