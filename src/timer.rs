//! Monotonic-deadline timers and per-iteration idle handles.

use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};

use crate::event_loop::EventLoop;
use crate::handle::{impl_handle_common, HandleKind};
use crate::macros::trace;
use crate::Token;

pub(crate) type TimerCb = Box<dyn FnMut(&mut EventLoop, Timer)>;
pub(crate) type IdleCb = Box<dyn FnMut(&mut EventLoop, Idle)>;

/// Deadline-ordered min-heap over handle tokens.
///
/// The position map is the heap-index bookkeeping that makes `remove` a
/// swap-pop instead of a scan; ties on the deadline break by insertion
/// order so same-instant timers fire in the order they were armed.
pub(crate) struct TimerHeap {
    entries: Vec<HeapEntry>,
    pos: HashMap<Token, usize>,
    seq: u64,
}

#[derive(Clone, Copy)]
struct HeapEntry {
    deadline: Instant,
    seq: u64,
    token: Token,
}

impl HeapEntry {
    fn before(&self, other: &HeapEntry) -> bool {
        (self.deadline, self.seq) < (other.deadline, other.seq)
    }
}

impl TimerHeap {
    pub(crate) fn new() -> TimerHeap {
        TimerHeap {
            entries: Vec::new(),
            pos: HashMap::new(),
            seq: 0,
        }
    }

    pub(crate) fn contains(&self, token: Token) -> bool {
        self.pos.contains_key(&token)
    }

    /// Schedule `token` at `deadline`, replacing any existing entry.
    pub(crate) fn insert(&mut self, token: Token, deadline: Instant) {
        self.remove(token);
        let entry = HeapEntry {
            deadline,
            seq: self.seq,
            token,
        };
        self.seq += 1;
        self.entries.push(entry);
        self.pos.insert(token, self.entries.len() - 1);
        self.sift_up(self.entries.len() - 1);
    }

    /// Unschedule `token`. Swap-pop through its tracked index.
    pub(crate) fn remove(&mut self, token: Token) -> bool {
        let Some(idx) = self.pos.remove(&token) else {
            return false;
        };
        let last = self.entries.len() - 1;
        self.entries.swap_remove(idx);
        if idx < last {
            self.pos.insert(self.entries[idx].token, idx);
            // The moved entry may need to travel either way.
            self.sift_down(idx);
            self.sift_up(idx);
        }
        true
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|e| e.deadline)
    }

    /// Pop the root if it is due at `now`.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<(Token, Instant)> {
        let root = self.entries.first()?;
        if root.deadline > now {
            return None;
        }
        let (token, deadline) = (root.token, root.deadline);
        self.remove(token);
        Some((token, deadline))
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if !self.entries[idx].before(&self.entries[parent]) {
                break;
            }
            self.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let mut smallest = idx;
            for child in [2 * idx + 1, 2 * idx + 2] {
                if child < self.entries.len()
                    && self.entries[child].before(&self.entries[smallest])
                {
                    smallest = child;
                }
            }
            if smallest == idx {
                return;
            }
            self.swap(idx, smallest);
            idx = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.pos.insert(self.entries[a].token, a);
        self.pos.insert(self.entries[b].token, b);
    }
}

pub(crate) struct TimerState {
    pub(crate) cb: Option<TimerCb>,
    pub(crate) period: Option<Duration>,
    pub(crate) armed: bool,
}

impl TimerState {
    fn new() -> TimerState {
        TimerState {
            cb: None,
            period: None,
            armed: false,
        }
    }
}

/// A oneshot or periodic timer bound to an [`EventLoop`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timer {
    token: Token,
}

impl_handle_common!(Timer);

impl Timer {
    pub fn new(lp: &mut EventLoop) -> Timer {
        Timer {
            token: lp.add_handle(HandleKind::Timer(TimerState::new())),
        }
    }

    /// Arm the timer to fire after `delay`, then every `period` if one is
    /// given. Re-arming an armed timer replaces its schedule. The delay is
    /// measured from the loop's cached iteration time, so a timer re-armed
    /// from its own callback is relative to the callback entry.
    pub fn start<F>(
        &self,
        lp: &mut EventLoop,
        delay: Duration,
        period: Option<Duration>,
        cb: F,
    ) -> io::Result<()>
    where
        F: FnMut(&mut EventLoop, Timer) + 'static,
    {
        let deadline = lp.now() + delay;
        let state = timer_state(lp, self.token)?;
        state.cb = Some(Box::new(cb));
        state.period = period;
        state.armed = true;
        lp.timers.insert(self.token, deadline);
        lp.activate(self.token);
        Ok(())
    }

    /// Disarm the timer. A timer stopped from inside its own callback does
    /// not fire again.
    pub fn stop(&self, lp: &mut EventLoop) {
        if let Ok(state) = timer_state(lp, self.token) {
            state.armed = false;
            lp.timers.remove(self.token);
            lp.deactivate(self.token);
        }
    }
}

fn timer_state(lp: &mut EventLoop, token: Token) -> io::Result<&mut TimerState> {
    match lp.handle_mut(token) {
        Some(slot) if !slot.closing => match &mut slot.kind {
            HandleKind::Timer(state) => Ok(state),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "not a timer")),
        },
        _ => Err(io::Error::new(
            io::ErrorKind::NotFound,
            "timer closed or destroyed",
        )),
    }
}

/// Fire every timer whose deadline passed, in deadline order. Periodic
/// timers are re-inserted at `deadline + period` so long-run drift stays
/// bounded by the loop iteration, not by callback latency.
pub(crate) fn fire_due(lp: &mut EventLoop) {
    enum Due {
        Timer,
        Dns,
        Other,
    }
    let now = lp.now();
    while let Some((token, deadline)) = lp.timers.pop_due(now) {
        let due = match lp.handle_mut(token).map(|slot| &slot.kind) {
            Some(HandleKind::Timer(_)) => Due::Timer,
            Some(HandleKind::Dns(_)) => Due::Dns,
            _ => Due::Other,
        };
        match due {
            Due::Timer => fire_timer(lp, token, deadline),
            Due::Dns => crate::dns::on_timeout(lp, token),
            Due::Other => {}
        }
    }
}

fn fire_timer(lp: &mut EventLoop, token: Token, deadline: Instant) {
    let (mut cb, period) = {
        let Ok(state) = timer_state(lp, token) else {
            return;
        };
        if !state.armed {
            return;
        }
        match state.cb.take() {
            Some(cb) => (cb, state.period),
            None => return,
        }
    };

    trace!("firing timer {}", token);
    cb(lp, Timer { token });

    // The callback may have closed, stopped or re-armed the handle; only
    // put things back if it did none of those.
    let rearmed = lp.timers.contains(token);
    let mut reschedule = None;
    let mut expired = false;
    if let Ok(state) = timer_state(lp, token) {
        if state.cb.is_none() {
            state.cb = Some(cb);
        }
        if state.armed && !rearmed {
            match period {
                Some(period) => reschedule = Some(deadline + period),
                None => {
                    state.armed = false;
                    expired = true;
                }
            }
        }
    }
    if let Some(at) = reschedule {
        lp.timers.insert(token, at);
    }
    if expired {
        lp.deactivate(token);
    }
}

pub(crate) struct IdleState {
    pub(crate) cb: Option<IdleCb>,
    pub(crate) running: bool,
}

/// Runs its callback once per loop iteration while started. An active idle
/// handle forces the backend poll timeout to zero.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Idle {
    token: Token,
}

impl_handle_common!(Idle);

impl Idle {
    pub fn new(lp: &mut EventLoop) -> Idle {
        Idle {
            token: lp.add_handle(HandleKind::Idle(IdleState {
                cb: None,
                running: false,
            })),
        }
    }

    pub fn start<F>(&self, lp: &mut EventLoop, cb: F) -> io::Result<()>
    where
        F: FnMut(&mut EventLoop, Idle) + 'static,
    {
        let mut newly_started = false;
        match lp.handle_mut(self.token) {
            Some(slot) if !slot.closing => match &mut slot.kind {
                HandleKind::Idle(state) => {
                    if !state.running {
                        state.running = true;
                        newly_started = true;
                    }
                    state.cb = Some(Box::new(cb));
                }
                _ => return Err(io::Error::new(io::ErrorKind::InvalidInput, "not an idle")),
            },
            _ => return Err(io::Error::new(io::ErrorKind::NotFound, "idle closed")),
        }
        if newly_started {
            lp.idle_started += 1;
        }
        lp.activate(self.token);
        Ok(())
    }

    pub fn stop(&self, lp: &mut EventLoop) {
        let mut stopped = false;
        if let Some(HandleKind::Idle(state)) = lp.handle_mut(self.token).map(|s| &mut s.kind) {
            if state.running {
                state.running = false;
                stopped = true;
            }
        }
        if stopped {
            lp.idle_started -= 1;
            lp.deactivate(self.token);
        }
    }
}

/// Run all started idle callbacks for this iteration.
pub(crate) fn run_idles(lp: &mut EventLoop) {
    if lp.idle_started == 0 {
        return;
    }
    let tokens: Vec<Token> = lp
        .handles_iter()
        .filter_map(|(token, slot)| match &slot.kind {
            HandleKind::Idle(state) if state.running && !slot.closing => Some(token),
            _ => None,
        })
        .collect();
    for token in tokens {
        let cb = match lp.handle_mut(token).map(|s| &mut s.kind) {
            Some(HandleKind::Idle(state)) if state.running => state.cb.take(),
            _ => None,
        };
        if let Some(mut cb) = cb {
            cb(lp, Idle { token });
            if let Some(HandleKind::Idle(state)) = lp.handle_mut(token).map(|s| &mut s.kind) {
                if state.cb.is_none() {
                    state.cb = Some(cb);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(n: usize) -> Token {
        Token(n)
    }

    #[test]
    fn heap_orders_by_deadline() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();
        heap.insert(token(1), base + Duration::from_millis(30));
        heap.insert(token(2), base + Duration::from_millis(10));
        heap.insert(token(3), base + Duration::from_millis(20));
        let later = base + Duration::from_millis(50);
        assert_eq!(heap.pop_due(later).unwrap().0, token(2));
        assert_eq!(heap.pop_due(later).unwrap().0, token(3));
        assert_eq!(heap.pop_due(later).unwrap().0, token(1));
        assert!(heap.pop_due(later).is_none());
    }

    #[test]
    fn heap_ties_fire_in_arming_order() {
        let mut heap = TimerHeap::new();
        let deadline = Instant::now();
        for n in 0..8 {
            heap.insert(token(n), deadline);
        }
        for n in 0..8 {
            assert_eq!(heap.pop_due(deadline).unwrap().0, token(n));
        }
    }

    #[test]
    fn heap_remove_keeps_order() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();
        for n in 0..16 {
            heap.insert(token(n), base + Duration::from_millis(n as u64));
        }
        assert!(heap.remove(token(0)));
        assert!(heap.remove(token(7)));
        assert!(!heap.remove(token(7)));
        let later = base + Duration::from_secs(1);
        let mut fired = Vec::new();
        while let Some((t, _)) = heap.pop_due(later) {
            fired.push(t.0);
        }
        let expected: Vec<usize> = (0..16).filter(|&n| n != 0 && n != 7).collect();
        assert_eq!(fired, expected);
    }

    #[test]
    fn reinsert_replaces_schedule() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();
        heap.insert(token(1), base + Duration::from_millis(100));
        heap.insert(token(1), base + Duration::from_millis(5));
        assert_eq!(
            heap.next_deadline(),
            Some(base + Duration::from_millis(5))
        );
        assert_eq!(heap.entries.len(), 1);
    }
}
