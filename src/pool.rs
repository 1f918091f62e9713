//! Worker thread pool for blocking calls (DNS, filesystem I/O).
//!
//! Submission never blocks: a full queue is reported to the caller, who is
//! on the loop thread and must not stall. The queue discipline is
//! selectable: a lock-free bounded channel, or a mutex-guarded ring for
//! callers that want the simpler discipline.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::macros::trace;

/// Queue discipline, selected by expected consumer arity.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum QueueKind {
    /// Wait-free bounded channel; the default.
    #[default]
    Channel,
    /// Mutex + condvar guarded ring.
    Locked,
}

#[derive(Copy, Clone, Debug)]
pub struct PoolConfig {
    /// Worker threads; 0 means one per online CPU.
    pub threads: usize,
    /// Task queue capacity, rounded up to a power of two.
    pub queue_capacity: usize,
    pub queue: QueueKind,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            threads: 0,
            queue_capacity: 1024,
            queue: QueueKind::Channel,
        }
    }
}

/// Monotonic submission counters.
#[derive(Copy, Clone, Debug, Default)]
pub struct PoolStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
}

struct Task {
    run: Box<dyn FnOnce() + Send>,
    complete: Option<Box<dyn FnOnce() + Send>>,
}

enum Msg {
    Task(Task),
    Exit,
}

enum Queue {
    Channel(Sender<Msg>, Receiver<Msg>),
    Locked(LockedQueue),
}

struct LockedQueue {
    ring: Mutex<VecDeque<Msg>>,
    capacity: usize,
    available: Condvar,
}

struct Inner {
    queue: Queue,
    accepting: AtomicBool,
    force_exit: AtomicBool,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    // queued + running tasks, for wait()
    in_flight: Mutex<u64>,
    idle: Condvar,
}

impl Inner {
    fn push(&self, msg: Msg) -> Result<(), Msg> {
        match &self.queue {
            Queue::Channel(tx, _) => match tx.try_send(msg) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(msg)) | Err(TrySendError::Disconnected(msg)) => Err(msg),
            },
            Queue::Locked(locked) => {
                let mut ring = locked.ring.lock().unwrap();
                if ring.len() >= locked.capacity {
                    return Err(msg);
                }
                ring.push_back(msg);
                locked.available.notify_one();
                Ok(())
            }
        }
    }

    fn pop(&self) -> Msg {
        match &self.queue {
            Queue::Channel(_, rx) => rx.recv().unwrap_or(Msg::Exit),
            Queue::Locked(locked) => {
                let mut ring = locked.ring.lock().unwrap();
                loop {
                    if let Some(msg) = ring.pop_front() {
                        return msg;
                    }
                    ring = locked.available.wait(ring).unwrap();
                }
            }
        }
    }

    fn task_done(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.task_gone();
    }

    fn task_gone(&self) {
        let mut in_flight = self.in_flight.lock().unwrap();
        *in_flight -= 1;
        if *in_flight == 0 {
            self.idle.notify_all();
        }
    }
}

/// A fixed set of worker threads draining a shared bounded task queue.
pub struct ThreadPool {
    inner: Arc<Inner>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    threads: usize,
}

impl ThreadPool {
    pub fn new(config: PoolConfig) -> io::Result<ThreadPool> {
        let threads = if config.threads == 0 {
            thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            config.threads
        };
        let capacity = config.queue_capacity.next_power_of_two();

        let queue = match config.queue {
            QueueKind::Channel => {
                let (tx, rx) = bounded(capacity);
                Queue::Channel(tx, rx)
            }
            QueueKind::Locked => Queue::Locked(LockedQueue {
                ring: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                available: Condvar::new(),
            }),
        };

        let inner = Arc::new(Inner {
            queue,
            accepting: AtomicBool::new(true),
            force_exit: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            in_flight: Mutex::new(0),
            idle: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("voxio-pool-{}", i))
                .spawn(move || worker(inner))?;
            workers.push(handle);
        }

        Ok(ThreadPool {
            inner,
            workers: Mutex::new(workers),
            threads,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Submit a task, and optionally a completion that runs on the same
    /// worker after the task returns. Never blocks: a full queue or a shut
    /// down pool is an error and nothing runs.
    pub fn submit<T, C>(&self, task: T, complete: Option<C>) -> io::Result<()>
    where
        T: FnOnce() + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        if !self.inner.accepting.load(Ordering::Acquire) {
            self.inner.failed.fetch_add(1, Ordering::Relaxed);
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "thread pool shut down",
            ));
        }
        *self.inner.in_flight.lock().unwrap() += 1;
        let msg = Msg::Task(Task {
            run: Box::new(task),
            complete: complete.map(|c| Box::new(c) as Box<dyn FnOnce() + Send>),
        });
        match self.inner.push(msg) {
            Ok(()) => {
                self.inner.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => {
                self.inner.failed.fetch_add(1, Ordering::Relaxed);
                self.inner.task_gone();
                Err(io::Error::new(io::ErrorKind::WouldBlock, "task queue full"))
            }
        }
    }

    /// Block until every submitted task (and its completion) has run.
    pub fn wait(&self) {
        let mut in_flight = self.inner.in_flight.lock().unwrap();
        while *in_flight > 0 {
            in_flight = self.inner.idle.wait(in_flight).unwrap();
        }
    }

    /// Refuse new work, drain the queue and join the workers.
    pub fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::Release);
        self.join_workers();
    }

    /// Refuse new work and stop after in-flight tasks; queued tasks are
    /// dropped.
    pub fn force_shutdown(&self) {
        self.inner.accepting.store(false, Ordering::Release);
        self.inner.force_exit.store(true, Ordering::Release);
        self.join_workers();
    }

    fn join_workers(&self) {
        let mut workers = self.workers.lock().unwrap();
        for _ in 0..workers.len() {
            // One exit marker per worker; bypasses the capacity check.
            match &self.inner.queue {
                Queue::Channel(tx, _) => {
                    let _ = tx.send(Msg::Exit);
                }
                Queue::Locked(locked) => {
                    locked.ring.lock().unwrap().push_back(Msg::Exit);
                    locked.available.notify_one();
                }
            }
        }
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            submitted: self.inner.submitted.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("ThreadPool")
            .field("threads", &self.threads)
            .finish()
    }
}

fn worker(inner: Arc<Inner>) {
    loop {
        let msg = inner.pop();
        match msg {
            Msg::Exit => {
                trace!("pool worker exiting");
                return;
            }
            Msg::Task(task) => {
                if inner.force_exit.load(Ordering::Acquire) {
                    // Dropped, not run.
                    inner.task_gone();
                    continue;
                }
                (task.run)();
                if let Some(complete) = task.complete {
                    complete();
                }
                inner.task_done();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_task_and_completion_in_order() {
        let pool = ThreadPool::new(PoolConfig {
            threads: 1,
            ..PoolConfig::default()
        })
        .unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let (r1, r2) = (Arc::clone(&ran), Arc::clone(&ran));
        pool.submit(
            move || {
                r1.fetch_add(1, Ordering::SeqCst);
            },
            Some(move || {
                // Completion runs strictly after the task body.
                assert_eq!(r2.fetch_add(1, Ordering::SeqCst), 1);
            }),
        )
        .unwrap();
        pool.wait();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().completed, 1);
    }

    #[test]
    fn full_queue_rejects_without_blocking() {
        let pool = ThreadPool::new(PoolConfig {
            threads: 1,
            queue_capacity: 2,
            queue: QueueKind::Locked,
        })
        .unwrap();
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        {
            let gate = Arc::clone(&gate);
            pool.submit(
                move || {
                    let _wait = gate.lock().unwrap();
                },
                None::<fn()>,
            )
            .unwrap();
        }
        // Worker is blocked on the gate; fill the queue.
        let mut rejected = 0;
        for _ in 0..8 {
            let res = pool.submit(|| {}, None::<fn()>);
            if res.is_err() {
                rejected += 1;
            }
        }
        assert!(rejected >= 6, "queue should reject overflow");
        drop(held);
        pool.wait();
        assert_eq!(pool.stats().failed as usize, rejected);
    }

    #[test]
    fn shutdown_refuses_new_work() {
        let pool = ThreadPool::new(PoolConfig::default()).unwrap();
        pool.shutdown();
        assert!(pool.submit(|| {}, None::<fn()>).is_err());
    }
}
