#![allow(dead_code)]

use std::sync::Once;

use voxio::{BackendKind, Config, EventLoop};

pub fn init() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// A loop on a specific backend kind.
pub fn loop_with(kind: BackendKind) -> EventLoop {
    EventLoop::with_config(Config {
        backend: kind,
        ..Config::default()
    })
    .expect("failed to create loop")
}

/// Loopback address with a kernel-chosen port.
pub fn any_local() -> std::net::SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}
