mod util;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use voxio::{AddressFamily, DnsRequest, EventLoop, RunMode};

#[test]
fn resolving_a_literal_yields_one_address() {
    util::init();
    let mut lp = EventLoop::new().unwrap();
    let result = Rc::new(RefCell::new(None));

    let req = DnsRequest::new(&mut lp);
    let sink = Rc::clone(&result);
    req.getaddrinfo(
        &mut lp,
        "127.0.0.1",
        "",
        AddressFamily::V4,
        None,
        move |lp, req, res| {
            *sink.borrow_mut() = Some(res);
            req.close(lp);
        },
    )
    .unwrap();

    lp.run(RunMode::Default).unwrap();
    let addrs = result.borrow_mut().take().unwrap().unwrap();
    assert_eq!(addrs, vec!["127.0.0.1:0".parse().unwrap()]);
}

#[test]
fn family_filter_applies() {
    util::init();
    let mut lp = EventLoop::new().unwrap();
    let result = Rc::new(RefCell::new(None));

    let req = DnsRequest::new(&mut lp);
    let sink = Rc::clone(&result);
    req.getaddrinfo(
        &mut lp,
        "::1",
        "443",
        AddressFamily::V6,
        None,
        move |lp, req, res| {
            *sink.borrow_mut() = Some(res);
            req.close(lp);
        },
    )
    .unwrap();

    lp.run(RunMode::Default).unwrap();
    let addrs = result.borrow_mut().take().unwrap().unwrap();
    assert!(addrs.iter().all(|a| a.is_ipv6() && a.port() == 443));
}

#[test]
fn invalid_name_fails_within_the_timeout_budget() {
    util::init();
    let mut lp = EventLoop::new().unwrap();
    let status = Rc::new(RefCell::new(Vec::new()));
    let begin = Instant::now();

    let req = DnsRequest::new(&mut lp);
    let sink = Rc::clone(&status);
    req.getaddrinfo(
        &mut lp,
        "example.invalid",
        "80",
        AddressFamily::Any,
        Some(Duration::from_millis(50)),
        move |_lp, _req, res| {
            sink.borrow_mut().push(res.is_err());
        },
    )
    .unwrap();

    lp.run(RunMode::Default).unwrap();
    // Whether the resolver failed fast or the timeout hit first, the
    // callback reports an error exactly once.
    assert_eq!(*status.borrow(), vec![true]);
    assert!(begin.elapsed() < Duration::from_secs(5));
}

#[test]
fn cancel_suppresses_the_callback() {
    util::init();
    let mut lp = EventLoop::new().unwrap();
    let fired = Rc::new(RefCell::new(0u32));

    let req = DnsRequest::new(&mut lp);
    let counter = Rc::clone(&fired);
    req.getaddrinfo(
        &mut lp,
        "localhost",
        "80",
        AddressFamily::Any,
        Some(Duration::from_secs(5)),
        move |_lp, _req, _res| {
            *counter.borrow_mut() += 1;
        },
    )
    .unwrap();
    req.cancel(&mut lp);

    lp.run(RunMode::Default).unwrap();
    assert_eq!(*fired.borrow(), 0, "canceled request fired its callback");
    assert!(req.is_closing(&lp));
}

#[test]
fn one_pending_operation_per_request() {
    util::init();
    let mut lp = EventLoop::new().unwrap();

    let req = DnsRequest::new(&mut lp);
    req.getaddrinfo(&mut lp, "localhost", "80", AddressFamily::Any, None, |lp, req, _res| {
        req.close(lp);
    })
    .unwrap();
    let second = req.getaddrinfo(
        &mut lp,
        "localhost",
        "81",
        AddressFamily::Any,
        None,
        |_lp, _req, _res| {},
    );
    assert!(second.is_err());

    lp.run(RunMode::Default).unwrap();
}
