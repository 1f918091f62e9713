//! Lightweight asynchronous I/O runtime.
//!
//! voxio drives non-blocking sockets, timers and off-loop blocking work
//! through a single-threaded callback [`EventLoop`]. The loop sits on a
//! pluggable event-demultiplexer backend: io_uring, epoll, kqueue, IOCP
//! or `select(2)`, chosen at loop creation by walking a per-platform
//! fallback chain (see [`BackendKind`]).
//!
//! # Handles
//!
//! Long-lived asynchronous resources are *handles*: [`Timer`], [`Idle`],
//! [`net::Tcp`], [`net::Udp`], [`tls::TlsStream`], [`tls::DtlsSocket`],
//! [`DnsRequest`] and [`FsRequest`]. A handle is a small `Copy` id whose
//! state lives inside its loop; every operation takes the loop
//! explicitly, and every completion is delivered as a callback on the
//! loop thread. [`EventLoop::run`] in [`RunMode::Default`] returns once
//! no handle keeps the loop alive.
//!
//! Closing is two-phase: `close` marks the handle, tears down its driver
//! resources and defers destruction to the end of the iteration, so a
//! handle is never destroyed under a callback's feet and no callback
//! other than the close callback fires after `close`.
//!
//! # Threads
//!
//! All callbacks run on the loop thread. Blocking calls (DNS resolution,
//! file I/O) run on the loop's [`ThreadPool`] and re-enter the loop
//! through the deferred-work queue. Other threads talk to a loop only
//! via [`Remote::post`] or [`Waker::wake`].
//!
//! # Example
//!
//! A oneshot timer:
//!
//! ```
//! use std::time::Duration;
//! use voxio::{EventLoop, RunMode, Timer};
//!
//! # fn main() -> std::io::Result<()> {
//! let mut lp = EventLoop::new()?;
//! let timer = Timer::new(&mut lp);
//! timer.start(&mut lp, Duration::from_millis(10), None, |lp, timer| {
//!     timer.close(lp);
//! })?;
//! lp.run(RunMode::Default)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_debug_implementations)]

mod macros;

mod arena;
mod backend;
mod dns;
mod event;
mod event_loop;
mod fs;
mod handle;
mod interest;
mod pool;
mod sys;
mod timer;
mod token;
mod waker;

pub mod net;
pub mod start;
pub mod tls;

pub use arena::{Arena, ArenaStats};
pub use backend::BackendKind;
pub use dns::{AddressFamily, DnsRequest};
pub use event::{Event, Events};
pub use event_loop::{Config, EventLoop, Remote, RunMode};
pub use fs::FsRequest;
pub use interest::Interest;
pub use pool::{PoolConfig, PoolStats, QueueKind, ThreadPool};
pub use timer::{Idle, Timer};
pub use token::Token;
pub use waker::Waker;
