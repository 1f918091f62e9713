//! Multi-worker start runtime.
//!
//! Three supervision modes: a fleet of worker threads in one address
//! space; a master with forked worker processes (optionally daemonized,
//! optionally respawned on death); and a single listener thread feeding
//! accepted connections to a worker pool, for platforms without
//! `SO_REUSEPORT`. Platforms that cannot fork respawn the current
//! executable with a private `--vox-worker=N` argument, which re-enters
//! [`start`] and dispatches straight to the worker function.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use clap::Parser;

use crate::event_loop::{Config, EventLoop, RunMode};
use crate::macros::{debug, trace};
use crate::net::tcp::{Tcp, TcpBindFlags};
use crate::pool::PoolConfig;

/// Worker supervision strategy.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum StartMode {
    #[default]
    Thread,
    Process,
    #[value(alias = "listener_workers")]
    ListenerWorkers,
}

/// Start-runtime options; parse from argv with [`parse_args`].
#[derive(Clone, Debug, Parser)]
#[command(ignore_errors = true, disable_help_flag = true, disable_version_flag = true)]
pub struct StartOptions {
    #[arg(long, value_enum, default_value_t = StartMode::Thread)]
    pub mode: StartMode,

    /// Worker count; 0 means one per online CPU.
    #[arg(long, visible_alias = "worker", default_value_t = 0)]
    pub workers: usize,

    /// Detach the master from the controlling terminal (process mode,
    /// Unix).
    #[arg(long)]
    pub daemon: bool,

    /// Re-fork a worker slot when its process dies (process mode).
    #[arg(long)]
    pub respawn: bool,

    /// Internal: worker index relayed to spawned child processes.
    #[arg(long = "vox-worker", hide = true)]
    pub vox_worker: Option<usize>,
}

impl Default for StartOptions {
    fn default() -> StartOptions {
        StartOptions {
            mode: StartMode::Thread,
            workers: 0,
            daemon: false,
            respawn: false,
            vox_worker: None,
        }
    }
}

/// Parse recognized start-runtime arguments; unknown arguments are
/// ignored.
pub fn parse_args<I, S>(args: I) -> StartOptions
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv = std::iter::once("voxio".to_string()).chain(args.into_iter().map(Into::into));
    StartOptions::try_parse_from(argv).unwrap_or_default()
}

thread_local! {
    static THREAD_INDEX: std::cell::Cell<Option<usize>> = const { std::cell::Cell::new(None) };
}

static PROCESS_INDEX: std::sync::OnceLock<usize> = std::sync::OnceLock::new();

/// Zero-based index of the calling worker: thread-local in thread mode,
/// process-global in a forked or respawned worker.
pub fn worker_index() -> Option<usize> {
    THREAD_INDEX
        .get()
        .or_else(|| PROCESS_INDEX.get().copied())
}

fn effective_workers(opts: &StartOptions) -> usize {
    if opts.workers == 0 {
        thread::available_parallelism().map_or(1, |n| n.get())
    } else {
        opts.workers
    }
}

/// Run `worker` under the configured supervision mode. Returns the first
/// nonzero worker status, else 0.
pub fn start<F>(opts: &StartOptions, worker: F) -> i32
where
    F: Fn(usize) -> i32 + Send + Sync + 'static,
{
    // A relayed child process enters here and goes straight to work.
    if let Some(index) = opts.vox_worker {
        let _ = PROCESS_INDEX.set(index);
        return worker(index);
    }

    match opts.mode {
        StartMode::Thread => start_threads(opts, worker),
        StartMode::Process => start_processes(opts, worker),
        StartMode::ListenerWorkers => {
            debug!("listener_workers mode requires start_listener");
            2
        }
    }
}

fn start_threads<F>(opts: &StartOptions, worker: F) -> i32
where
    F: Fn(usize) -> i32 + Send + Sync + 'static,
{
    let count = effective_workers(opts);
    let worker = Arc::new(worker);
    let mut handles = Vec::with_capacity(count);
    for index in 0..count {
        let worker = Arc::clone(&worker);
        let handle = thread::Builder::new()
            .name(format!("vox-worker-{}", index))
            .spawn(move || {
                THREAD_INDEX.set(Some(index));
                worker(index)
            })
            .expect("failed to spawn worker thread");
        handles.push(handle);
    }

    let mut code = 0;
    for handle in handles {
        match handle.join() {
            Ok(status) if status != 0 && code == 0 => code = status,
            Ok(_) => {}
            Err(_) => {
                if code == 0 {
                    code = 1;
                }
            }
        }
    }
    code
}

/// Master + forked workers. The master blocks in `sigwait` on
/// {SIGCHLD, SIGINT, SIGTERM}: dead slots are reaped (and re-forked when
/// `respawn` is set); INT/TERM propagates SIGTERM to every worker, reaps
/// them and exits.
#[cfg(unix)]
fn start_processes<F>(opts: &StartOptions, worker: F) -> i32
where
    F: Fn(usize) -> i32 + Send + Sync + 'static,
{
    use crate::sys::unix::syscall;

    if opts.daemon {
        if let Err(err) = daemonize() {
            debug!("daemonize failed: {}", err);
            return 1;
        }
    }

    let count = effective_workers(opts);

    // Block the supervision signals before forking so no window exists
    // where a child death is missed.
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGCHLD);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }

    let mut slots: Vec<libc::pid_t> = vec![0; count];
    let mut code = 0;
    for index in 0..count {
        match fork_worker(index, &set, &worker) {
            Ok(pid) => slots[index] = pid,
            Err(err) => {
                debug!("fork failed for worker {}: {}", index, err);
                return 1;
            }
        }
    }

    loop {
        let mut sig: libc::c_int = 0;
        if unsafe { libc::sigwait(&set, &mut sig) } != 0 {
            continue;
        }
        match sig {
            libc::SIGCHLD => {
                // Reap everything that died; one signal may cover many.
                loop {
                    let mut status: libc::c_int = 0;
                    let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
                    if pid <= 0 {
                        break;
                    }
                    let Some(index) = slots.iter().position(|&p| p == pid) else {
                        continue;
                    };
                    slots[index] = 0;
                    let status = exit_code(status);
                    if status != 0 && code == 0 {
                        code = status;
                    }
                    if opts.respawn {
                        trace!("respawning worker {}", index);
                        match fork_worker(index, &set, &worker) {
                            Ok(pid) => slots[index] = pid,
                            Err(err) => debug!("respawn failed: {}", err),
                        }
                    }
                }
                if slots.iter().all(|&p| p == 0) {
                    return code;
                }
            }
            libc::SIGINT | libc::SIGTERM => {
                for &pid in slots.iter().filter(|&&p| p != 0) {
                    unsafe { libc::kill(pid, libc::SIGTERM) };
                }
                for &pid in slots.iter().filter(|&&p| p != 0) {
                    let mut status: libc::c_int = 0;
                    let _ = syscall!(waitpid(pid, &mut status, 0));
                    let status = exit_code(status);
                    if status != 0 && code == 0 {
                        code = status;
                    }
                }
                return code;
            }
            _ => {}
        }
    }
}

#[cfg(unix)]
fn fork_worker<F>(index: usize, blocked: &libc::sigset_t, worker: &F) -> io::Result<libc::pid_t>
where
    F: Fn(usize) -> i32,
{
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => {
            // Worker process: restore signal delivery, record the slot and
            // never return to the supervision loop.
            unsafe {
                libc::pthread_sigmask(libc::SIG_UNBLOCK, blocked, std::ptr::null_mut());
            }
            let _ = PROCESS_INDEX.set(index);
            std::process::exit(worker(index));
        }
        pid => Ok(pid),
    }
}

#[cfg(unix)]
fn exit_code(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else {
        1
    }
}

/// Classic double-fork: detach from the session, then drop the ability to
/// reacquire a controlling terminal, then point stdio at /dev/null.
#[cfg(unix)]
fn daemonize() -> io::Result<()> {
    use crate::sys::unix::syscall;

    match unsafe { libc::fork() } {
        -1 => return Err(io::Error::last_os_error()),
        0 => {}
        _ => std::process::exit(0),
    }
    syscall!(setsid())?;
    match unsafe { libc::fork() } {
        -1 => return Err(io::Error::last_os_error()),
        0 => {}
        _ => std::process::exit(0),
    }

    let devnull = std::ffi::CString::new("/dev/null").expect("no interior nul");
    let fd = syscall!(open(devnull.as_ptr(), libc::O_RDWR))?;
    for target in 0..3 {
        syscall!(dup2(fd, target))?;
    }
    if fd > 2 {
        let _ = syscall!(close(fd));
    }
    Ok(())
}

/// Process mode without fork: respawn the current executable per worker
/// slot with `--vox-worker=N`; the child re-enters [`start`].
#[cfg(windows)]
fn start_processes<F>(opts: &StartOptions, _worker: F) -> i32
where
    F: Fn(usize) -> i32 + Send + Sync + 'static,
{
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(err) => {
            debug!("cannot locate current executable: {}", err);
            return 1;
        }
    };
    let count = effective_workers(opts);
    let mut children = Vec::with_capacity(count);
    for index in 0..count {
        match std::process::Command::new(&exe)
            .arg(format!("--vox-worker={}", index))
            .spawn()
        {
            Ok(child) => children.push((index, child)),
            Err(err) => {
                debug!("spawn failed for worker {}: {}", index, err);
                return 1;
            }
        }
    }

    let mut code = 0;
    loop {
        let mut alive = Vec::new();
        for (index, mut child) in children {
            match child.wait() {
                Ok(status) => {
                    let status = status.code().unwrap_or(1);
                    trace!("worker {} exited with {}", index, status);
                    if status != 0 && code == 0 {
                        code = status;
                    }
                    if opts.respawn {
                        if let Ok(child) = std::process::Command::new(&exe)
                            .arg(format!("--vox-worker={}", index))
                            .spawn()
                        {
                            alive.push((index, child));
                        }
                    }
                }
                Err(_) => {
                    if code == 0 {
                        code = 1;
                    }
                }
            }
        }
        if alive.is_empty() {
            return code;
        }
        children = alive;
    }
}

/// Listener + worker pool, for platforms without `SO_REUSEPORT`: one
/// thread runs a loop with the listening handle and hands each accepted
/// connection, detached to a blocking stream, to the pool.
pub fn start_listener<F>(opts: &StartOptions, addr: SocketAddr, handler: F) -> io::Result<i32>
where
    F: Fn(std::net::TcpStream) + Send + Sync + 'static,
{
    let pool_threads = effective_workers(opts);
    let handler = Arc::new(handler);

    let listener = thread::Builder::new()
        .name("vox-listener".to_string())
        .spawn(move || -> io::Result<()> {
            let mut lp = EventLoop::with_config(Config {
                pool: PoolConfig {
                    threads: pool_threads,
                    ..PoolConfig::default()
                },
                ..Config::default()
            })?;

            let server = Tcp::new(&mut lp);
            server.bind(
                &mut lp,
                addr,
                TcpBindFlags {
                    reuse_addr: true,
                    ..TcpBindFlags::default()
                },
            )?;
            server.listen(&mut lp, 511, move |lp, server, status| {
                if status.is_err() {
                    return;
                }
                let Ok(conn) = server.accept(lp) else {
                    return;
                };
                let Ok(stream) = conn.detach(lp) else {
                    return;
                };
                let handler = Arc::clone(&handler);
                let _ = lp.thread_pool().submit(
                    move || {
                        handler(stream);
                    },
                    None::<fn()>,
                );
            })?;

            lp.run(RunMode::Default)
        })?;

    match listener.join() {
        Ok(Ok(())) => Ok(0),
        Ok(Err(err)) => Err(err),
        Err(_) => Ok(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_arguments() {
        let opts = parse_args([
            "--mode=process",
            "--workers=4",
            "--daemon",
            "--respawn",
        ]);
        assert_eq!(opts.mode, StartMode::Process);
        assert_eq!(opts.workers, 4);
        assert!(opts.daemon);
        assert!(opts.respawn);
    }

    #[test]
    fn worker_alias_and_underscore_mode() {
        let opts = parse_args(["--mode=listener_workers", "--worker=2"]);
        assert_eq!(opts.mode, StartMode::ListenerWorkers);
        assert_eq!(opts.workers, 2);
    }

    #[test]
    fn relay_argument_is_recognized() {
        let opts = parse_args(["--vox-worker=3"]);
        assert_eq!(opts.vox_worker, Some(3));
    }

    #[test]
    fn thread_mode_joins_and_reports_first_nonzero() {
        let opts = StartOptions {
            workers: 3,
            ..StartOptions::default()
        };
        let code = start(&opts, |index| {
            assert_eq!(worker_index(), Some(index));
            if index == 1 {
                7
            } else {
                0
            }
        });
        assert_eq!(code, 7);
    }
}
