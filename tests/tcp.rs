mod util;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use voxio::net::{Tcp, TcpBindFlags};
use voxio::{BackendKind, EventLoop, RunMode, Timer};

const HELLO: &[u8] = b"hello world!\n";

fn reuse() -> TcpBindFlags {
    TcpBindFlags {
        reuse_addr: true,
        ..TcpBindFlags::default()
    }
}

/// Echo scenario: server accepts exactly one connection, echoes whatever
/// arrives, client verifies its bytes came back unchanged.
fn run_echo(mut lp: EventLoop) {
    let server = Tcp::new(&mut lp);
    server.bind(&mut lp, util::any_local(), reuse()).unwrap();
    server
        .listen(&mut lp, 16, move |lp, server, status| {
            status.unwrap();
            let conn = server.accept(lp).unwrap();
            conn.read_start(lp, move |lp, conn, res, data| {
                let n = res.unwrap();
                if n == 0 {
                    conn.close(lp);
                    return;
                }
                conn.write(lp, data.to_vec()).unwrap();
            })
            .unwrap();
            // One connection only; the listener goes away.
            server.close(lp);
        })
        .unwrap();

    let addr = server.local_addr(&mut lp).unwrap();
    let received = Rc::new(RefCell::new(Vec::new()));

    let client = Tcp::new(&mut lp);
    let sink = Rc::clone(&received);
    client
        .connect(&mut lp, addr, move |lp, client, status| {
            status.unwrap();
            let sink = Rc::clone(&sink);
            client
                .read_start(lp, move |lp, client, res, data| {
                    let n = res.unwrap();
                    sink.borrow_mut().extend_from_slice(data);
                    if n == 0 || sink.borrow().len() >= HELLO.len() {
                        client.close(lp);
                    }
                })
                .unwrap();
            client.write(lp, HELLO).unwrap();
        })
        .unwrap();

    lp.run(RunMode::Default).unwrap();
    assert_eq!(received.borrow().as_slice(), HELLO);
}

#[test]
fn echo_roundtrip() {
    util::init();
    run_echo(EventLoop::new().unwrap());
}

/// The same observable behavior on every backend this host can build.
#[test]
fn echo_on_every_available_backend() {
    util::init();
    for &kind in BackendKind::available() {
        let lp = match EventLoop::with_config(voxio::Config {
            backend: kind,
            ..voxio::Config::default()
        }) {
            Ok(lp) => lp,
            // A preferred mechanism the kernel refuses (say, io_uring
            // behind seccomp) is exactly what the Auto chain skips.
            Err(_) => continue,
        };
        run_echo(lp);
    }
}

#[test]
fn write_callbacks_fire_in_submission_order() {
    util::init();
    let mut lp = EventLoop::new().unwrap();

    let server = Tcp::new(&mut lp);
    server.bind(&mut lp, util::any_local(), reuse()).unwrap();
    let total = Rc::new(RefCell::new(0usize));
    let sink = Rc::clone(&total);
    server
        .listen(&mut lp, 16, move |lp, server, status| {
            status.unwrap();
            let conn = server.accept(lp).unwrap();
            let sink = Rc::clone(&sink);
            // Delay reading so the client's send buffer fills and some
            // writes complete only once we drain.
            let gate = Timer::new(lp);
            gate.start(lp, Duration::from_millis(50), None, move |lp, gate| {
                gate.close(lp);
                let sink = Rc::clone(&sink);
                conn.read_start(lp, move |lp, conn, res, data| {
                    let n = res.unwrap();
                    *sink.borrow_mut() += data.len();
                    if n == 0 {
                        conn.close(lp);
                    }
                })
                .unwrap();
            })
            .unwrap();
            server.close(lp);
        })
        .unwrap();

    let addr = server.local_addr(&mut lp).unwrap();
    const CHUNKS: usize = 10;
    const CHUNK_SIZE: usize = 64 * 1024;
    let order = Rc::new(RefCell::new(Vec::new()));

    let client = Tcp::new(&mut lp);
    let order_in_cb = Rc::clone(&order);
    client
        .connect(&mut lp, addr, move |lp, client, status| {
            status.unwrap();
            for index in 0..CHUNKS {
                let order = Rc::clone(&order_in_cb);
                let chunk = vec![index as u8; CHUNK_SIZE];
                client
                    .write_with(lp, chunk, move |lp, client, status| {
                        status.unwrap();
                        order.borrow_mut().push(index);
                        if index == CHUNKS - 1 {
                            client.shutdown_with(lp, |lp, client, status| {
                                status.unwrap();
                                client.close(lp);
                            })
                            .unwrap();
                        }
                    })
                    .unwrap();
            }
        })
        .unwrap();

    lp.run(RunMode::Default).unwrap();
    let order = order.borrow();
    assert_eq!(order.as_slice(), &(0..CHUNKS).collect::<Vec<_>>()[..]);
    assert_eq!(*total.borrow(), CHUNKS * CHUNK_SIZE);
}

#[test]
fn no_callback_after_close() {
    util::init();
    let mut lp = EventLoop::new().unwrap();

    let server = Tcp::new(&mut lp);
    server.bind(&mut lp, util::any_local(), reuse()).unwrap();
    server
        .listen(&mut lp, 16, move |lp, server, status| {
            status.unwrap();
            let conn = server.accept(lp).unwrap();
            // Push data at a client that has already closed its handle.
            conn.write_with(lp, &b"too late"[..], |lp, conn, _status| {
                conn.shutdown(lp).unwrap();
                conn.close(lp);
            })
            .unwrap();
            server.close(lp);
        })
        .unwrap();

    let addr = server.local_addr(&mut lp).unwrap();
    let late_reads = Rc::new(RefCell::new(0u32));

    let client = Tcp::new(&mut lp);
    let counter = Rc::clone(&late_reads);
    client
        .connect(&mut lp, addr, move |lp, client, status| {
            status.unwrap();
            let counter = Rc::clone(&counter);
            client
                .read_start(lp, move |_lp, _client, _res, _data| {
                    *counter.borrow_mut() += 1;
                })
                .unwrap();
            client.close(lp);
        })
        .unwrap();

    lp.run(RunMode::Default).unwrap();
    assert_eq!(*late_reads.borrow(), 0, "read callback fired after close");
}

#[test]
fn connect_refused_reports_through_callback() {
    util::init();
    let mut lp = EventLoop::new().unwrap();

    // Bind-then-drop gives a port with (very probably) no listener.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let failed = Rc::new(RefCell::new(false));
    let client = Tcp::new(&mut lp);
    let flag = Rc::clone(&failed);
    client
        .connect(&mut lp, addr, move |lp, client, status| {
            assert!(status.is_err());
            *flag.borrow_mut() = true;
            client.close(lp);
        })
        .unwrap();

    lp.run(RunMode::Default).unwrap();
    assert!(*failed.borrow());
}

#[test]
fn operations_on_fresh_handle_are_rejected() {
    util::init();
    let mut lp = EventLoop::new().unwrap();
    let tcp = Tcp::new(&mut lp);

    assert!(tcp.listen(&mut lp, 1, |_lp, _t, _s| {}).is_err());
    assert!(tcp.write(&mut lp, &b"x"[..]).is_err());
    assert!(tcp.read_start(&mut lp, |_lp, _t, _r, _d| {}).is_err());
    assert!(tcp.shutdown(&mut lp).is_err());
    tcp.close(&mut lp);
    lp.run(RunMode::Default).unwrap();
}
