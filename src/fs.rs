//! Off-loop filesystem requests.
//!
//! File opens, reads, writes and stats are synchronous system calls; they
//! run as thread-pool tasks and their results re-enter the loop through
//! the deferred-work queue, exactly like DNS completions.

use std::fs::{File, Metadata, OpenOptions};
use std::io;
use std::path::PathBuf;

use crate::event_loop::EventLoop;
use crate::handle::{impl_handle_common, HandleKind};
use crate::Token;

type OpenCb = Box<dyn FnOnce(&mut EventLoop, FsRequest, io::Result<File>)>;
type ReadCb = Box<dyn FnOnce(&mut EventLoop, FsRequest, io::Result<Vec<u8>>)>;
type WriteCb = Box<dyn FnOnce(&mut EventLoop, FsRequest, io::Result<()>)>;
type StatCb = Box<dyn FnOnce(&mut EventLoop, FsRequest, io::Result<Metadata>)>;

enum FsCb {
    Open(OpenCb),
    Read(ReadCb),
    Write(WriteCb),
    Stat(StatCb),
}

enum FsOutcome {
    Open(io::Result<File>),
    Read(io::Result<Vec<u8>>),
    Write(io::Result<()>),
    Stat(io::Result<Metadata>),
}

pub(crate) struct FsState {
    pending: bool,
    generation: u64,
    cb: Option<FsCb>,
}

impl FsState {
    fn new() -> FsState {
        FsState {
            pending: false,
            generation: 0,
            cb: None,
        }
    }

    pub(crate) fn teardown(&mut self) {
        self.pending = false;
        self.generation += 1;
        self.cb = None;
    }
}

/// A filesystem request handle. One operation may be pending at a time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FsRequest {
    token: Token,
}

impl_handle_common!(FsRequest);

impl FsRequest {
    pub fn new(lp: &mut EventLoop) -> FsRequest {
        FsRequest {
            token: lp.add_handle(HandleKind::Fs(FsState::new())),
        }
    }

    /// Open `path` read-only off-loop.
    pub fn open<P, F>(&self, lp: &mut EventLoop, path: P, cb: F) -> io::Result<()>
    where
        P: Into<PathBuf>,
        F: FnOnce(&mut EventLoop, FsRequest, io::Result<File>) + 'static,
    {
        let path = path.into();
        self.start(lp, FsCb::Open(Box::new(cb)), move || {
            FsOutcome::Open(OpenOptions::new().read(true).open(&path))
        })
    }

    /// Read the entire contents of `path` off-loop.
    pub fn read_file<P, F>(&self, lp: &mut EventLoop, path: P, cb: F) -> io::Result<()>
    where
        P: Into<PathBuf>,
        F: FnOnce(&mut EventLoop, FsRequest, io::Result<Vec<u8>>) + 'static,
    {
        let path = path.into();
        self.start(lp, FsCb::Read(Box::new(cb)), move || {
            FsOutcome::Read(std::fs::read(&path))
        })
    }

    /// Write `data` to `path` off-loop, creating or truncating it.
    pub fn write_file<P, F>(
        &self,
        lp: &mut EventLoop,
        path: P,
        data: Vec<u8>,
        cb: F,
    ) -> io::Result<()>
    where
        P: Into<PathBuf>,
        F: FnOnce(&mut EventLoop, FsRequest, io::Result<()>) + 'static,
    {
        let path = path.into();
        self.start(lp, FsCb::Write(Box::new(cb)), move || {
            FsOutcome::Write(std::fs::write(&path, &data))
        })
    }

    /// Stat `path` off-loop.
    pub fn stat<P, F>(&self, lp: &mut EventLoop, path: P, cb: F) -> io::Result<()>
    where
        P: Into<PathBuf>,
        F: FnOnce(&mut EventLoop, FsRequest, io::Result<Metadata>) + 'static,
    {
        let path = path.into();
        self.start(lp, FsCb::Stat(Box::new(cb)), move || {
            FsOutcome::Stat(std::fs::metadata(&path))
        })
    }

    /// Abandon the pending operation and close the request; its result is
    /// discarded when the task completes.
    pub fn cancel(&self, lp: &mut EventLoop) {
        let was_pending = match state_mut(lp, self.token) {
            Ok(state) => {
                let was = state.pending;
                state.pending = false;
                was
            }
            Err(_) => false,
        };
        if was_pending {
            lp.close_handle(self.token, None);
        }
    }

    fn start<R>(&self, lp: &mut EventLoop, cb: FsCb, run: R) -> io::Result<()>
    where
        R: FnOnce() -> FsOutcome + Send + 'static,
    {
        let token = self.token;
        let generation = {
            let state = state_mut(lp, token)?;
            if state.pending {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "request already pending",
                ));
            }
            state.pending = true;
            state.generation += 1;
            state.cb = Some(cb);
            state.generation
        };

        lp.activate(token);
        lp.ref_handle(token);

        let remote = lp.remote();
        let submit = lp.thread_pool().submit(
            move || {
                let outcome = run();
                let _ = remote.post(move |lp| complete(lp, token, generation, outcome));
            },
            None::<fn()>,
        );

        if let Err(err) = submit {
            lp.unref_handle(token);
            lp.deactivate(token);
            if let Ok(state) = state_mut(lp, token) {
                state.pending = false;
                state.cb = None;
            }
            return Err(err);
        }
        Ok(())
    }
}

fn state_mut(lp: &mut EventLoop, token: Token) -> io::Result<&mut FsState> {
    match lp.handle_mut(token) {
        Some(slot) if !slot.closing => match &mut slot.kind {
            HandleKind::Fs(state) => Ok(state),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not an fs request",
            )),
        },
        _ => Err(io::Error::new(
            io::ErrorKind::NotFound,
            "request closed or destroyed",
        )),
    }
}

fn complete(lp: &mut EventLoop, token: Token, generation: u64, outcome: FsOutcome) {
    lp.unref_handle(token);

    let cb = match state_mut(lp, token) {
        Ok(state) if state.pending && state.generation == generation => {
            state.pending = false;
            state.cb.take()
        }
        _ => return,
    };

    lp.deactivate(token);
    let req = FsRequest { token };
    match (cb, outcome) {
        (Some(FsCb::Open(cb)), FsOutcome::Open(res)) => cb(lp, req, res),
        (Some(FsCb::Read(cb)), FsOutcome::Read(res)) => cb(lp, req, res),
        (Some(FsCb::Write(cb)), FsOutcome::Write(res)) => cb(lp, req, res),
        (Some(FsCb::Stat(cb)), FsOutcome::Stat(res)) => cb(lp, req, res),
        _ => {}
    }
}
