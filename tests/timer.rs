mod util;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use voxio::{EventLoop, RunMode, Timer};

#[test]
fn oneshot_fires_once_and_releases_loop() {
    util::init();
    let mut lp = EventLoop::new().unwrap();
    let fired = Rc::new(RefCell::new(0u32));

    let timer = Timer::new(&mut lp);
    let counter = Rc::clone(&fired);
    timer
        .start(&mut lp, Duration::from_millis(20), None, move |lp, timer| {
            *counter.borrow_mut() += 1;
            timer.close(lp);
        })
        .unwrap();

    lp.run(RunMode::Default).unwrap();
    assert_eq!(*fired.borrow(), 1);
    assert_eq!(lp.active_handles(), 0);
}

#[test]
fn timers_fire_in_deadline_order() {
    util::init();
    let mut lp = EventLoop::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    for (label, delay) in [(50u64, 50u64), (10, 10), (30, 30)] {
        let timer = Timer::new(&mut lp);
        let order = Rc::clone(&order);
        timer
            .start(
                &mut lp,
                Duration::from_millis(delay),
                None,
                move |lp, timer| {
                    order.borrow_mut().push(label);
                    timer.close(lp);
                },
            )
            .unwrap();
    }

    lp.run(RunMode::Default).unwrap();
    assert_eq!(*order.borrow(), vec![10, 30, 50]);
}

#[test]
fn cascade_chains_two_oneshots() {
    util::init();
    let mut lp = EventLoop::new().unwrap();
    let fired = Rc::new(RefCell::new((0u32, 0u32)));
    let start = Instant::now();

    let a = Timer::new(&mut lp);
    let counters = Rc::clone(&fired);
    a.start(&mut lp, Duration::from_millis(50), None, move |lp, a| {
        counters.borrow_mut().0 += 1;
        a.close(lp);
        let b = Timer::new(lp);
        let counters = Rc::clone(&counters);
        b.start(lp, Duration::from_millis(30), None, move |lp, b| {
            counters.borrow_mut().1 += 1;
            b.close(lp);
            lp.stop();
        })
        .unwrap();
    })
    .unwrap();

    lp.run(RunMode::Default).unwrap();
    let elapsed = start.elapsed();
    assert_eq!(*fired.borrow(), (1, 1));
    assert!(elapsed >= Duration::from_millis(75), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "elapsed {:?}", elapsed);
}

#[test]
fn periodic_fires_with_bounded_drift() {
    util::init();
    let mut lp = EventLoop::new().unwrap();
    let fired = Rc::new(RefCell::new(0u32));
    let start = Instant::now();
    let period = Duration::from_millis(20);

    let timer = Timer::new(&mut lp);
    let counter = Rc::clone(&fired);
    timer
        .start(&mut lp, period, Some(period), move |lp, timer| {
            let mut count = counter.borrow_mut();
            *count += 1;
            if *count == 10 {
                timer.close(lp);
            }
        })
        .unwrap();

    lp.run(RunMode::Default).unwrap();
    let elapsed = start.elapsed();
    assert_eq!(*fired.borrow(), 10);
    // Reinsertion at deadline + period keeps long-run drift bounded by
    // loop latency, not by callback count.
    assert!(elapsed >= Duration::from_millis(180), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2000), "elapsed {:?}", elapsed);
}

#[test]
fn stop_inside_callback_prevents_refire() {
    util::init();
    let mut lp = EventLoop::new().unwrap();
    let fired = Rc::new(RefCell::new(0u32));

    let timer = Timer::new(&mut lp);
    let counter = Rc::clone(&fired);
    timer
        .start(
            &mut lp,
            Duration::from_millis(10),
            Some(Duration::from_millis(10)),
            move |lp, timer| {
                *counter.borrow_mut() += 1;
                // A periodic timer stopped from its own callback must not
                // fire again.
                timer.stop(lp);
                timer.close(lp);
            },
        )
        .unwrap();

    lp.run(RunMode::Default).unwrap();
    assert_eq!(*fired.borrow(), 1);
}

#[test]
fn rearm_from_callback_is_relative_to_entry() {
    util::init();
    let mut lp = EventLoop::new().unwrap();
    let fired = Rc::new(RefCell::new(0u32));

    let timer = Timer::new(&mut lp);
    let counter = Rc::clone(&fired);
    timer
        .start(&mut lp, Duration::from_millis(10), None, move |lp, timer| {
            let mut count = counter.borrow_mut();
            *count += 1;
            if *count < 3 {
                let counter = Rc::clone(&counter);
                drop(count);
                timer
                    .start(lp, Duration::from_millis(10), None, move |_lp, _t| {
                        *counter.borrow_mut() += 100;
                    })
                    .unwrap();
            } else {
                timer.close(lp);
            }
        })
        .unwrap();

    lp.run(RunMode::Default).unwrap();
    // First fire re-arms with a fresh callback; that one fires next.
    assert_eq!(*fired.borrow(), 101);
}

#[test]
fn close_is_idempotent_and_callback_fires_once() {
    util::init();
    let mut lp = EventLoop::new().unwrap();
    let closed = Rc::new(RefCell::new(0u32));

    let timer = Timer::new(&mut lp);
    timer
        .start(&mut lp, Duration::from_millis(5), None, |_lp, _t| {})
        .unwrap();

    let counter = Rc::clone(&closed);
    timer.close_with(&mut lp, move |_lp| {
        *counter.borrow_mut() += 1;
    });
    // Later closes are no-ops; their callbacks are dropped.
    let counter = Rc::clone(&closed);
    timer.close_with(&mut lp, move |_lp| {
        *counter.borrow_mut() += 1;
    });
    timer.close(&mut lp);

    lp.run(RunMode::Default).unwrap();
    assert_eq!(*closed.borrow(), 1);
    assert!(timer.is_closing(&lp));
}
