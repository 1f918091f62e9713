mod util;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use voxio::{BackendKind, EventLoop, Idle, RunMode, Timer};

#[test]
fn default_run_returns_once_no_handles_remain() {
    util::init();
    let mut lp = EventLoop::new().unwrap();
    assert_eq!(lp.active_handles(), 0);
    // Nothing active: liveness demands an immediate return.
    lp.run(RunMode::Default).unwrap();
}

#[test]
fn once_and_nowait_do_single_iterations() {
    util::init();
    let mut lp = EventLoop::new().unwrap();
    let fired = Rc::new(RefCell::new(0u32));

    let timer = Timer::new(&mut lp);
    let counter = Rc::clone(&fired);
    timer
        .start(&mut lp, Duration::from_millis(20), None, move |_lp, _t| {
            *counter.borrow_mut() += 1;
        })
        .unwrap();

    // NoWait polls with a zero timeout; the timer is not due yet.
    lp.run(RunMode::NoWait).unwrap();
    assert_eq!(*fired.borrow(), 0);
    assert_eq!(lp.active_handles(), 1);

    // Once blocks until something happens, and the timer is the only
    // thing that can.
    lp.run(RunMode::Once).unwrap();
    assert_eq!(*fired.borrow(), 1);

    timer.close(&mut lp);
    lp.run(RunMode::Default).unwrap();
}

#[test]
fn stop_is_observed_between_iterations() {
    util::init();
    let mut lp = EventLoop::new().unwrap();
    let fired = Rc::new(RefCell::new(0u32));

    let timer = Timer::new(&mut lp);
    let counter = Rc::clone(&fired);
    timer
        .start(
            &mut lp,
            Duration::from_millis(5),
            Some(Duration::from_millis(5)),
            move |lp, _t| {
                *counter.borrow_mut() += 1;
                lp.stop();
            },
        )
        .unwrap();

    lp.run(RunMode::Default).unwrap();
    // The periodic timer is still armed; only the stop flag ended run.
    assert_eq!(*fired.borrow(), 1);
    assert_eq!(lp.active_handles(), 1);

    timer.close(&mut lp);
    lp.run(RunMode::Default).unwrap();
}

#[test]
fn queue_work_runs_in_fifo_order_before_close_processing() {
    util::init();
    let mut lp = EventLoop::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    for n in 0..3 {
        let order = Rc::clone(&order);
        lp.queue_work(move |_lp| order.borrow_mut().push(n));
    }
    lp.run(RunMode::Default).unwrap();
    assert_eq!(*order.borrow(), vec![0, 1, 2]);
}

#[test]
fn work_chains_keep_the_loop_alive() {
    util::init();
    let mut lp = EventLoop::new().unwrap();
    let done = Rc::new(RefCell::new(false));

    let flag = Rc::clone(&done);
    lp.queue_work(move |lp| {
        lp.queue_work(move |_lp| {
            *flag.borrow_mut() = true;
        });
    });
    lp.run(RunMode::Default).unwrap();
    assert!(*done.borrow());
}

#[test]
fn remote_post_wakes_a_blocked_loop() {
    util::init();
    let mut lp = EventLoop::new().unwrap();
    let woken = Arc::new(AtomicBool::new(false));

    // A long timer keeps the loop blocked in the backend.
    let park = Timer::new(&mut lp);
    park.start(&mut lp, Duration::from_secs(30), None, |_lp, _t| {})
        .unwrap();

    let remote = lp.remote();
    let flag = Arc::clone(&woken);
    let poster = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        remote
            .post(move |lp| {
                flag.store(true, Ordering::SeqCst);
                lp.stop();
            })
            .unwrap();
    });

    let begin = std::time::Instant::now();
    lp.run(RunMode::Default).unwrap();
    poster.join().unwrap();

    assert!(woken.load(Ordering::SeqCst));
    // The wakeup, not the 30s timer, ended the wait.
    assert!(begin.elapsed() < Duration::from_secs(5));
    park.close(&mut lp);
    lp.run(RunMode::Default).unwrap();
}

#[test]
fn idle_runs_every_iteration_until_stopped() {
    util::init();
    let mut lp = EventLoop::new().unwrap();
    let spins = Rc::new(RefCell::new(0u32));

    let idle = Idle::new(&mut lp);
    let counter = Rc::clone(&spins);
    idle.start(&mut lp, move |lp, idle| {
        let mut count = counter.borrow_mut();
        *count += 1;
        if *count == 5 {
            idle.stop(lp);
            idle.close(lp);
        }
    })
    .unwrap();

    lp.run(RunMode::Default).unwrap();
    assert_eq!(*spins.borrow(), 5);
}

#[test]
fn backend_name_matches_requested_kind() {
    util::init();
    let lp = EventLoop::new().unwrap();
    assert!(!lp.backend_name().is_empty());

    for &kind in BackendKind::available() {
        let Ok(lp) = EventLoop::with_config(voxio::Config {
            backend: kind,
            ..voxio::Config::default()
        }) else {
            continue;
        };
        let name = lp.backend_name();
        let expected = match kind {
            BackendKind::Auto => unreachable!("available() is concrete"),
            BackendKind::Epoll => "epoll",
            BackendKind::IoUring => "io_uring",
            BackendKind::Kqueue => "kqueue",
            BackendKind::Iocp => "iocp",
            BackendKind::Select => "select",
        };
        assert_eq!(name, expected);
    }
}

#[test]
fn handle_user_data_roundtrips() {
    util::init();
    let mut lp = EventLoop::new().unwrap();
    let timer = Timer::new(&mut lp);
    timer.set_data(&mut lp, Box::new(41u32));
    if let Some(data) = timer.data(&mut lp) {
        if let Some(n) = data.downcast_mut::<u32>() {
            *n += 1;
        }
    }
    let seen = timer
        .data(&mut lp)
        .and_then(|d| d.downcast_ref::<u32>().copied());
    assert_eq!(seen, Some(42));
    timer.close(&mut lp);
    lp.run(RunMode::Default).unwrap();
}
