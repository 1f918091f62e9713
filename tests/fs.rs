mod util;

use std::cell::RefCell;
use std::rc::Rc;

use voxio::{EventLoop, FsRequest, RunMode};

#[test]
fn write_then_read_roundtrips_off_loop() {
    util::init();
    let dir = std::env::temp_dir().join(format!("voxio-fs-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("roundtrip.bin");

    let mut lp = EventLoop::new().unwrap();
    let contents = Rc::new(RefCell::new(None));

    let req = FsRequest::new(&mut lp);
    let sink = Rc::clone(&contents);
    let read_path = path.clone();
    req.write_file(&mut lp, path.clone(), b"stored bytes".to_vec(), move |lp, req, res| {
        res.unwrap();
        let sink = Rc::clone(&sink);
        req.read_file(lp, read_path, move |lp, req, res| {
            *sink.borrow_mut() = Some(res.unwrap());
            req.close(lp);
        })
        .unwrap();
    })
    .unwrap();

    lp.run(RunMode::Default).unwrap();
    assert_eq!(
        contents.borrow().as_deref(),
        Some(&b"stored bytes"[..])
    );
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn stat_reports_size() {
    util::init();
    let dir = std::env::temp_dir().join(format!("voxio-stat-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("sized.bin");
    std::fs::write(&path, vec![0u8; 1234]).unwrap();

    let mut lp = EventLoop::new().unwrap();
    let size = Rc::new(RefCell::new(0u64));

    let req = FsRequest::new(&mut lp);
    let sink = Rc::clone(&size);
    req.stat(&mut lp, path, move |lp, req, res| {
        *sink.borrow_mut() = res.unwrap().len();
        req.close(lp);
    })
    .unwrap();

    lp.run(RunMode::Default).unwrap();
    assert_eq!(*size.borrow(), 1234);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn missing_file_surfaces_as_callback_error() {
    util::init();
    let mut lp = EventLoop::new().unwrap();
    let errored = Rc::new(RefCell::new(false));

    let req = FsRequest::new(&mut lp);
    let flag = Rc::clone(&errored);
    req.read_file(&mut lp, "/definitely/not/here.bin", move |lp, req, res| {
        *flag.borrow_mut() = res.is_err();
        req.close(lp);
    })
    .unwrap();

    lp.run(RunMode::Default).unwrap();
    assert!(*errored.borrow());
}
