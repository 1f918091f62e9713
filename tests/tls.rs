//! Exercises the record bridge with a tiny in-test session protocol: one
//! `0x01` byte each way is the "handshake", `0xFF` is close-notify, and
//! everything else passes through as application data.

mod util;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

use voxio::net::{Tcp, TcpBindFlags};
use voxio::tls::{RecordSession, TlsStream};
use voxio::{EventLoop, RunMode};

const SYN: u8 = 0x01;
const CLOSE: u8 = 0xFF;

struct MockSession {
    initiator: bool,
    handshaken: bool,
    peer_closed: bool,
    wire_out: Vec<u8>,
    plain_in: VecDeque<u8>,
}

impl MockSession {
    fn new(initiator: bool) -> Box<MockSession> {
        Box::new(MockSession {
            initiator,
            handshaken: false,
            peer_closed: false,
            wire_out: if initiator { vec![SYN] } else { Vec::new() },
            plain_in: VecDeque::new(),
        })
    }
}

impl RecordSession for MockSession {
    fn is_handshaking(&self) -> bool {
        !self.handshaken
    }

    fn wants_write(&self) -> bool {
        !self.wire_out.is_empty()
    }

    fn feed(&mut self, data: &[u8]) -> io::Result<()> {
        for &byte in data {
            if !self.handshaken {
                if byte != SYN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "bad handshake byte",
                    ));
                }
                self.handshaken = true;
                if !self.initiator {
                    self.wire_out.push(SYN);
                }
            } else if byte == CLOSE {
                self.peer_closed = true;
            } else {
                self.plain_in.push_back(byte);
            }
        }
        Ok(())
    }

    fn drain(&mut self, out: &mut Vec<u8>) -> io::Result<()> {
        out.append(&mut self.wire_out);
        Ok(())
    }

    fn write_plain(&mut self, data: &[u8]) -> io::Result<usize> {
        self.wire_out.extend_from_slice(data);
        Ok(data.len())
    }

    fn read_plain(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.plain_in.is_empty() {
            if self.peer_closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let mut n = 0;
        while n < buf.len() {
            match self.plain_in.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn send_close_notify(&mut self) {
        self.wire_out.push(CLOSE);
    }
}

#[test]
fn handshake_then_echo_then_close_notify() {
    util::init();
    let mut lp = EventLoop::new().unwrap();

    let listener = Tcp::new(&mut lp);
    listener
        .bind(
            &mut lp,
            util::any_local(),
            TcpBindFlags {
                reuse_addr: true,
                ..TcpBindFlags::default()
            },
        )
        .unwrap();

    let server_got = Rc::new(RefCell::new(Vec::new()));
    let server_sink = Rc::clone(&server_got);
    listener
        .listen(&mut lp, 4, move |lp, listener, status| {
            status.unwrap();
            let conn = listener.accept(lp).unwrap();
            let tls = TlsStream::new(lp, conn, MockSession::new(false)).unwrap();
            let sink = Rc::clone(&server_sink);
            tls.handshake(lp, move |lp, tls, status| {
                status.unwrap();
                let sink = Rc::clone(&sink);
                tls.read_start(lp, move |lp, tls, res, data| {
                    let n = res.unwrap();
                    if n == 0 {
                        // Close-notify arrived; answer with ours.
                        tls.shutdown(lp, |lp, tls, status| {
                            status.unwrap();
                            tls.close(lp);
                        })
                        .unwrap();
                        return;
                    }
                    sink.borrow_mut().extend_from_slice(data);
                    tls.write(lp, data.to_vec()).unwrap();
                })
                .unwrap();
            })
            .unwrap();
            listener.close(lp);
        })
        .unwrap();

    let addr = listener.local_addr(&mut lp).unwrap();
    let client_got = Rc::new(RefCell::new(Vec::new()));
    let handshakes = Rc::new(RefCell::new(0u32));

    let client = Tcp::new(&mut lp);
    let client_sink = Rc::clone(&client_got);
    let shakes = Rc::clone(&handshakes);
    client
        .connect(&mut lp, addr, move |lp, client, status| {
            status.unwrap();
            let tls = TlsStream::new(lp, client, MockSession::new(true)).unwrap();
            let sink = Rc::clone(&client_sink);
            let shakes = Rc::clone(&shakes);
            tls.handshake(lp, move |lp, tls, status| {
                status.unwrap();
                *shakes.borrow_mut() += 1;
                let sink = Rc::clone(&sink);
                tls.read_start(lp, move |lp, tls, res, data| {
                    let n = res.unwrap();
                    if n == 0 {
                        tls.close(lp);
                        return;
                    }
                    sink.borrow_mut().extend_from_slice(data);
                    if sink.borrow().len() >= 6 {
                        // Everything echoed; start the orderly close.
                        tls.shutdown(lp, |_lp, _tls, status| {
                            status.unwrap();
                        })
                        .unwrap();
                    }
                })
                .unwrap();
                tls.write_with(lp, &b"secret"[..], |_lp, _tls, status| {
                    status.unwrap();
                })
                .unwrap();
            })
            .unwrap();
        })
        .unwrap();

    lp.run(RunMode::Default).unwrap();
    assert_eq!(*handshakes.borrow(), 1);
    assert_eq!(server_got.borrow().as_slice(), b"secret");
    assert_eq!(client_got.borrow().as_slice(), b"secret");
}

#[test]
fn plaintext_written_during_handshake_is_deferred() {
    util::init();
    let mut lp = EventLoop::new().unwrap();

    let listener = Tcp::new(&mut lp);
    listener
        .bind(&mut lp, util::any_local(), TcpBindFlags::default())
        .unwrap();
    let server_got = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&server_got);
    listener
        .listen(&mut lp, 4, move |lp, listener, status| {
            status.unwrap();
            let conn = listener.accept(lp).unwrap();
            let tls = TlsStream::new(lp, conn, MockSession::new(false)).unwrap();
            let sink = Rc::clone(&sink);
            tls.handshake(lp, move |lp, tls, status| {
                status.unwrap();
                let sink = Rc::clone(&sink);
                tls.read_start(lp, move |lp, tls, res, data| {
                    let n = res.unwrap();
                    sink.borrow_mut().extend_from_slice(data);
                    if n > 0 && sink.borrow().len() >= 5 {
                        tls.close(lp);
                        lp.stop();
                    }
                })
                .unwrap();
            })
            .unwrap();
            listener.close(lp);
        })
        .unwrap();

    let addr = listener.local_addr(&mut lp).unwrap();
    let client = Tcp::new(&mut lp);
    client
        .connect(&mut lp, addr, move |lp, client, status| {
            status.unwrap();
            let tls = TlsStream::new(lp, client, MockSession::new(true)).unwrap();
            // Queued before the handshake callback ever runs.
            tls.write(lp, &b"early"[..]).unwrap();
            tls.handshake(lp, |_lp, _tls, status| {
                status.unwrap();
            })
            .unwrap();
        })
        .unwrap();

    lp.run(RunMode::Default).unwrap();
    assert_eq!(server_got.borrow().as_slice(), b"early");
}
