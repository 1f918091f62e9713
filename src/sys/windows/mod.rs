//! Windows plumbing: WinSock sockets, the IOCP completion backend and the
//! `select` fallback.

pub(crate) mod iocp;
pub(crate) mod net;
pub(crate) mod overlapped;
pub(crate) mod select;
pub(crate) mod waker;

pub(crate) type SysFd = std::os::windows::io::RawSocket;

use std::sync::Once;

use windows_sys::Win32::Networking::WinSock::{WSAStartup, WSADATA};

/// WinSock wants exactly-once process initialization before any socket
/// call.
pub(crate) fn init() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        let mut data: WSADATA = std::mem::zeroed();
        let _ = WSAStartup(0x202, &mut data);
    });
}
