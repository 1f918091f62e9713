mod util;

use std::cell::RefCell;
use std::rc::Rc;

use voxio::net::{Udp, UdpBindFlags};
use voxio::{EventLoop, RunMode};

const PAYLOAD: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];

#[test]
fn echo_datagram_roundtrip() {
    util::init();
    let mut lp = EventLoop::new().unwrap();

    // Server echoes each datagram back to its source.
    let server = Udp::new(&mut lp);
    server
        .bind(&mut lp, util::any_local(), UdpBindFlags::default())
        .unwrap();
    let server_saw = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&server_saw);
    server
        .recv_start(&mut lp, move |lp, server, res, data, src| {
            res.unwrap();
            seen.borrow_mut().extend_from_slice(data);
            server.send(lp, data.to_vec(), src).unwrap();
            server.close(lp);
        })
        .unwrap();
    let server_addr = server.local_addr(&mut lp).unwrap();

    let client = Udp::new(&mut lp);
    client
        .bind(&mut lp, util::any_local(), UdpBindFlags::default())
        .unwrap();
    let echoed = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&echoed);
    client
        .recv_start(&mut lp, move |lp, client, res, data, src| {
            res.unwrap();
            assert_eq!(src, server_addr);
            sink.borrow_mut().extend_from_slice(data);
            client.close(lp);
        })
        .unwrap();
    client
        .send_with(&mut lp, PAYLOAD.to_vec(), server_addr, |_lp, _udp, status| {
            status.unwrap();
        })
        .unwrap();

    lp.run(RunMode::Default).unwrap();
    assert_eq!(server_saw.borrow().as_slice(), &PAYLOAD);
    assert_eq!(echoed.borrow().as_slice(), &PAYLOAD);
}

#[test]
fn send_callbacks_fire_per_packet_in_order() {
    util::init();
    let mut lp = EventLoop::new().unwrap();

    let server = Udp::new(&mut lp);
    server
        .bind(&mut lp, util::any_local(), UdpBindFlags::default())
        .unwrap();
    let received = Rc::new(RefCell::new(0usize));
    let counter = Rc::clone(&received);
    server
        .recv_start(&mut lp, move |lp, server, res, data, _src| {
            res.unwrap();
            let mut count = counter.borrow_mut();
            *count += data.len();
            if *count >= 4 * 32 {
                server.close(lp);
            }
        })
        .unwrap();
    let server_addr = server.local_addr(&mut lp).unwrap();

    let client = Udp::new(&mut lp);
    client
        .bind(&mut lp, util::any_local(), UdpBindFlags::default())
        .unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));
    for index in 0..4u8 {
        let order = Rc::clone(&order);
        client
            .send_with(
                &mut lp,
                vec![index; 32],
                server_addr,
                move |lp, client, status| {
                    status.unwrap();
                    order.borrow_mut().push(index);
                    if index == 3 {
                        client.close(lp);
                    }
                },
            )
            .unwrap();
    }

    lp.run(RunMode::Default).unwrap();
    assert_eq!(order.borrow().as_slice(), &[0, 1, 2, 3]);
    assert_eq!(*received.borrow(), 4 * 32);
}

#[test]
fn unbound_send_rejected_only_without_destination_family() {
    util::init();
    let mut lp = EventLoop::new().unwrap();
    let udp = Udp::new(&mut lp);
    // A send on a fresh handle implicitly binds the wildcard address.
    udp.send(&mut lp, PAYLOAD.to_vec(), "127.0.0.1:9".parse().unwrap())
        .unwrap();
    assert!(udp.local_addr(&mut lp).is_ok());
    udp.close(&mut lp);
    lp.run(RunMode::Default).unwrap();
}
