//! The event loop: handle ownership, the seven-step iteration, deferred
//! work and two-phase close.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use slab::Slab;

use crate::arena::Arena;
use crate::backend::{self, Backend, BackendKind};
use crate::event::{Event, Events};
use crate::handle::{CloseCb, HandleKind, HandleSlot};
use crate::macros::{debug, trace};
use crate::pool::{PoolConfig, ThreadPool};
use crate::timer::{self, TimerHeap};
use crate::token::WAKE_TOKEN;
use crate::{Token, Waker};

/// Deferred work posted from another thread through [`Remote`].
pub(crate) type WorkFn = Box<dyn FnOnce(&mut EventLoop) + Send>;
/// Deferred work posted from the loop thread itself.
pub(crate) type LocalWorkFn = Box<dyn FnOnce(&mut EventLoop)>;

/// How long [`EventLoop::run`] keeps iterating.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Iterate until no active handles remain and the closing list is
    /// empty, or [`EventLoop::stop`] is called.
    Default,
    /// Exactly one iteration, blocking in the backend if nothing is due.
    Once,
    /// One iteration with a zero backend timeout.
    NoWait,
}

/// Loop creation parameters.
#[derive(Debug)]
pub struct Config {
    /// Which event mechanism to use. `Auto` walks the platform chain.
    pub backend: BackendKind,
    /// Events a single backend poll may deliver.
    pub max_events: usize,
    /// Thread-pool sizing for blocking work (DNS, files).
    pub pool: PoolConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            backend: BackendKind::Auto,
            max_events: 1024,
            pool: PoolConfig::default(),
        }
    }
}

/// A single-threaded callback event loop.
///
/// The loop owns its backend, handle arena, timer heap, thread pool and
/// buffer arena. All callbacks run on the thread calling [`run`]; other
/// threads talk to the loop exclusively through [`Remote`].
///
/// [`run`]: EventLoop::run
pub struct EventLoop {
    pub(crate) backend: Box<dyn Backend>,
    pub(crate) handles: Slab<HandleSlot>,
    pub(crate) timers: TimerHeap,
    pub(crate) idle_started: usize,
    active_count: usize,
    closing: Vec<Token>,
    events: Events,
    work: Arc<Mutex<VecDeque<WorkFn>>>,
    local_work: VecDeque<LocalWorkFn>,
    waker: Waker,
    pool: ThreadPool,
    arena: Arc<Arena>,
    stop: bool,
    now: Instant,
}

impl EventLoop {
    /// Create a loop with default configuration.
    pub fn new() -> io::Result<EventLoop> {
        EventLoop::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> io::Result<EventLoop> {
        let mut backend = backend::create(config.backend, config.max_events)?;
        let waker = backend.waker()?;
        debug!("event loop using {} backend", backend.name());
        Ok(EventLoop {
            backend,
            handles: Slab::new(),
            timers: TimerHeap::new(),
            idle_started: 0,
            active_count: 0,
            closing: Vec::new(),
            events: Events::with_capacity(config.max_events),
            work: Arc::new(Mutex::new(VecDeque::new())),
            local_work: VecDeque::new(),
            waker,
            pool: ThreadPool::new(config.pool)?,
            arena: Arc::new(Arena::new()),
            stop: false,
            now: Instant::now(),
        })
    }

    /// Name of the selected backend, e.g. `"epoll"`.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// The loop's cached monotonic time, updated once per iteration.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Refresh the cached time; only needed when a long stretch of user
    /// code runs between iterations and then arms timers.
    pub fn update_time(&mut self) {
        self.now = Instant::now();
    }

    /// Number of handles keeping the loop alive.
    pub fn active_handles(&self) -> usize {
        self.active_count
    }

    /// Request `run` to return after the current iteration.
    pub fn stop(&mut self) {
        self.stop = true;
    }

    /// Queue `cb` to run at the next deferred-work drain point. Pending
    /// work keeps the loop alive until it has run.
    pub fn queue_work<F>(&mut self, cb: F)
    where
        F: FnOnce(&mut EventLoop) + 'static,
    {
        self.local_work.push_back(Box::new(cb));
    }

    /// A cloneable, `Send` door into the loop for other threads.
    pub fn remote(&self) -> Remote {
        Remote {
            work: Arc::clone(&self.work),
            waker: self.waker.clone(),
        }
    }

    /// The backend's cross-thread waker.
    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    /// The loop's buffer arena.
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// The loop's thread pool for blocking work.
    pub fn thread_pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// Drive the loop. Returns when the mode's condition is met or a fatal
    /// backend error occurs; outstanding handles stay consistent either
    /// way.
    pub fn run(&mut self, mode: RunMode) -> io::Result<()> {
        self.stop = false;
        match mode {
            RunMode::Default => {
                while self.alive() {
                    if self.stop {
                        break;
                    }
                    self.iterate(false)?;
                }
                Ok(())
            }
            RunMode::Once => {
                self.iterate(false)?;
                // A blocking single iteration that slept on a timer
                // deadline still delivers that timer within this call.
                self.now = Instant::now();
                timer::fire_due(self);
                self.process_closing();
                Ok(())
            }
            RunMode::NoWait => self.iterate(true),
        }
    }

    fn alive(&self) -> bool {
        self.active_count > 0
            || !self.closing.is_empty()
            || !self.local_work.is_empty()
            || !self.work.lock().unwrap().is_empty()
    }

    /// One full iteration:
    /// idles → expired timers → deferred work → backend poll → dispatch →
    /// deferred work → closing list.
    fn iterate(&mut self, no_wait: bool) -> io::Result<()> {
        self.now = Instant::now();

        timer::run_idles(self);
        timer::fire_due(self);
        self.drain_work();

        let timeout = if no_wait {
            Some(Duration::ZERO)
        } else {
            self.next_timeout()
        };

        self.backend.poll(&mut self.events, timeout)?;
        let batch = self.events.take();
        for event in &batch {
            self.dispatch(event);
        }
        self.events.restore(batch);

        // Work posted from I/O callbacks must run before close processing.
        self.drain_work();
        self.process_closing();
        Ok(())
    }

    fn next_timeout(&self) -> Option<Duration> {
        if self.idle_started > 0 {
            return Some(Duration::ZERO);
        }
        // A closing handle whose refcount already reached zero is
        // destroyed at the end of this iteration; don't sit in the kernel
        // first. Ones still referenced by posted work wake us on
        // completion instead.
        let destroyable = self
            .closing
            .iter()
            .any(|token| self.handles.get(token.0).map_or(true, |s| s.refcount == 0));
        if destroyable {
            return Some(Duration::ZERO);
        }
        if self.active_count == 0 && self.closing.is_empty() {
            // Nothing can produce events; don't block forever.
            return Some(Duration::ZERO);
        }
        self.timers
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(self.now))
    }

    fn dispatch(&mut self, event: &Event) {
        // Completion-backend events carry a posted operation context; the
        // drivers consume the finished operation directly instead of
        // being told the socket is ready.
        #[cfg(windows)]
        if event.token() != WAKE_TOKEN
            && event.bytes_transferred().is_some()
            && event.overlapped() != 0
        {
            crate::net::dispatch_completion(self, event);
            return;
        }

        enum Route {
            Wake,
            Tcp,
            Udp,
            None,
        }

        let route = if event.token() == WAKE_TOKEN {
            Route::Wake
        } else {
            match self.handles.get(event.token().0).map(|slot| &slot.kind) {
                Some(HandleKind::Tcp(_)) => Route::Tcp,
                Some(HandleKind::Udp(_)) => Route::Udp,
                _ => Route::None,
            }
        };

        match route {
            Route::Wake => self.waker.ack(),
            Route::Tcp => crate::net::tcp::on_event(self, event),
            Route::Udp => crate::net::udp::on_event(self, event),
            Route::None => trace!("dropping event for unknown {}", event.token()),
        }
    }

    /// Drain the deferred-work queues completely, including items posted
    /// by the drained work itself. Cross-thread items run before
    /// loop-local ones.
    fn drain_work(&mut self) {
        loop {
            let item = self.work.lock().unwrap().pop_front();
            if let Some(work) = item {
                work(self);
                continue;
            }
            match self.local_work.pop_front() {
                Some(work) => work(self),
                None => return,
            }
        }
    }

    /// Step 7: destroy every closing handle whose refcount reached zero.
    fn process_closing(&mut self) {
        if self.closing.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.closing);
        for token in pending {
            let ready = self
                .handles
                .get(token.0)
                .map_or(false, |slot| slot.refcount == 0);
            if !ready {
                // Still referenced by a posted operation; revisit next
                // iteration.
                if self.handles.contains(token.0) {
                    self.closing.push(token);
                }
                continue;
            }
            let mut slot = self.handles.remove(token.0);
            trace!("destroying {} handle {}", slot.kind.type_name(), token);
            if let Some(cb) = slot.close_cb.take() {
                cb(self);
            }
        }
    }

    // ===== handle bookkeeping, used by the typed handle modules =====

    pub(crate) fn add_handle(&mut self, kind: HandleKind) -> Token {
        let token = Token(self.handles.insert(HandleSlot::new(kind)));
        trace!(
            "created {} handle {}",
            self.handles[token.0].kind.type_name(),
            token
        );
        token
    }

    pub(crate) fn handle_mut(&mut self, token: Token) -> Option<&mut HandleSlot> {
        self.handles.get_mut(token.0)
    }

    pub(crate) fn handles_iter(&self) -> impl Iterator<Item = (Token, &HandleSlot)> {
        self.handles.iter().map(|(key, slot)| (Token(key), slot))
    }

    pub(crate) fn activate(&mut self, token: Token) {
        if let Some(slot) = self.handles.get_mut(token.0) {
            if !slot.active && !slot.closing {
                slot.active = true;
                self.active_count += 1;
            }
        }
    }

    pub(crate) fn deactivate(&mut self, token: Token) {
        if let Some(slot) = self.handles.get_mut(token.0) {
            if slot.active {
                slot.active = false;
                self.active_count -= 1;
            }
        }
    }

    pub(crate) fn handle_is_active(&self, token: Token) -> bool {
        self.handles
            .get(token.0)
            .map_or(false, |slot| slot.active && !slot.closing)
    }

    pub(crate) fn handle_is_closing(&self, token: Token) -> bool {
        self.handles.get(token.0).map_or(true, |slot| slot.closing)
    }

    pub(crate) fn set_handle_data(&mut self, token: Token, data: Box<dyn std::any::Any>) {
        if let Some(slot) = self.handles.get_mut(token.0) {
            slot.data = Some(data);
        }
    }

    pub(crate) fn handle_data(
        &mut self,
        token: Token,
    ) -> Option<&mut Box<dyn std::any::Any>> {
        self.handles.get_mut(token.0).and_then(|slot| slot.data.as_mut())
    }

    pub(crate) fn ref_handle(&mut self, token: Token) {
        if let Some(slot) = self.handles.get_mut(token.0) {
            slot.refcount += 1;
        }
    }

    pub(crate) fn unref_handle(&mut self, token: Token) {
        if let Some(slot) = self.handles.get_mut(token.0) {
            debug_assert!(slot.refcount > 0);
            slot.refcount = slot.refcount.saturating_sub(1);
        }
    }

    /// Universal cancellation: mark the handle closing, tear down its
    /// driver resources and queue it for end-of-iteration destruction.
    /// Only the first call has any effect.
    pub(crate) fn close_handle(&mut self, token: Token, cb: Option<CloseCb>) {
        let mut deregister_fd = None;
        let mut cascade = None;

        let Some(slot) = self.handles.get_mut(token.0) else {
            return;
        };
        if slot.closing {
            return;
        }
        trace!("closing {} handle {}", slot.kind.type_name(), token);
        slot.closing = true;
        slot.close_cb = cb;
        if slot.active {
            slot.active = false;
            self.active_count -= 1;
        }

        match &mut slot.kind {
            HandleKind::Timer(state) => {
                state.cb = None;
                state.armed = false;
            }
            HandleKind::Idle(state) => {
                state.cb = None;
                if state.running {
                    state.running = false;
                    self.idle_started -= 1;
                }
            }
            HandleKind::Tcp(state) => {
                deregister_fd = state.teardown();
            }
            HandleKind::Udp(state) => {
                deregister_fd = state.teardown();
            }
            HandleKind::Tls(state) => {
                cascade = Some(state.teardown());
            }
            HandleKind::Dtls(state) => {
                cascade = Some(state.teardown());
            }
            HandleKind::Dns(state) => {
                state.teardown();
            }
            HandleKind::Fs(state) => {
                state.teardown();
            }
        }

        self.timers.remove(token);
        if let Some(fd) = deregister_fd {
            let _ = self.backend.remove(fd);
        }
        self.closing.push(token);

        if let Some(transport) = cascade {
            self.close_handle(transport, None);
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("EventLoop")
            .field("backend", &self.backend.name())
            .field("active_handles", &self.active_count)
            .field("closing", &self.closing.len())
            .finish()
    }
}

/// Cross-thread entry into a loop.
///
/// `post` is the only way a non-loop thread may touch loop state: the
/// closure is queued on the deferred-work queue and the backend is woken,
/// so the closure runs on the loop thread at the next drain point.
#[derive(Clone)]
pub struct Remote {
    work: Arc<Mutex<VecDeque<WorkFn>>>,
    waker: Waker,
}

impl Remote {
    pub fn post<F>(&self, cb: F) -> io::Result<()>
    where
        F: FnOnce(&mut EventLoop) + Send + 'static,
    {
        self.work.lock().unwrap().push_back(Box::new(cb));
        self.waker.wake()
    }
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Remote").finish()
    }
}
