//! Single-threaded cooperative event loop.
//!
//! All protocol logic runs on the thread that calls [`Reactor::run`]. The
//! reactor multiplexes socket readiness with `poll(2)`, dispatches deferred
//! callbacks and timers, and owns a small pool of worker threads for calls
//! that must block (for example name resolution). Worker threads never touch
//! protocol state directly: they hand their results back to the loop thread
//! through a [`Remote`] handle.

use crate::error::{Error, Result};
use crossbeam_channel::{unbounded, Sender};
use log::{debug, trace};
use parking_lot::Mutex;
use std::any::Any;
use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Number of background worker threads.
const WORKER_THREADS: usize = 3;

/// While background work is outstanding the loop wakes up at least this
/// often, so it never exits between a worker finishing and its completion
/// landing on the loop thread.
const BACKGROUND_KEEPALIVE: Duration = Duration::from_millis(250);

type LoopCall = Box<dyn FnOnce()>;
type RemoteCall = Box<dyn FnOnce(&Reactor) + Send>;
type PollCallback = Box<dyn FnOnce(Result<()>)>;
type Job = Box<dyn FnOnce() + Send>;
type Completion = Box<dyn FnOnce(&Reactor, Box<dyn Any>)>;

/// Readiness condition a poll registration waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interest {
    Read,
    Write,
}

/// Handle to a pending one-shot poll registration.
///
/// Cancelling consumes the registration without invoking its callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollToken(u64);

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    call: LoopCall,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the BinaryHeap pops the earliest deadline first,
        // FIFO among equal deadlines.
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

struct PollEntry {
    fd: RawFd,
    interest: Interest,
    deadline: Instant,
    callback: PollCallback,
}

struct Core {
    soon: VecDeque<LoopCall>,
    timers: BinaryHeap<TimerEntry>,
    polls: HashMap<u64, PollEntry>,
    completions: HashMap<u64, Completion>,
    next_seq: u64,
}

impl Core {
    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

struct Shared {
    injected: Mutex<Vec<RemoteCall>>,
    stopped: AtomicBool,
    background: AtomicUsize,
    wake_tx: RawFd,
}

impl Shared {
    fn wake(&self) {
        let byte = [1u8];
        // A full pipe already guarantees a pending wakeup.
        unsafe { libc::write(self.wake_tx, byte.as_ptr() as *const libc::c_void, 1) };
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        unsafe { libc::close(self.wake_tx) };
    }
}

struct Inner {
    core: RefCell<Core>,
    shared: Arc<Shared>,
    wake_rx: RawFd,
    job_tx: RefCell<Option<Sender<Job>>>,
    workers: RefCell<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Dropping the sender lets the workers drain and exit.
        self.job_tx.borrow_mut().take();
        for handle in self.workers.borrow_mut().drain(..) {
            let _ = handle.join();
        }
        unsafe { libc::close(self.wake_rx) };
    }
}

/// The event loop. Cheap to clone; all clones drive the same loop.
///
/// # Examples
///
/// ```
/// use ndt_client::Reactor;
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let reactor = Reactor::new().unwrap();
/// let fired = Rc::new(Cell::new(false));
/// let flag = fired.clone();
/// reactor.call_soon(move || flag.set(true));
/// reactor.run().unwrap();
/// assert!(fired.get());
/// ```
pub struct Reactor {
    inner: Rc<Inner>,
}

impl Clone for Reactor {
    fn clone(&self) -> Self {
        Reactor {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// `Send + Clone` handle used by worker threads to bounce results back onto
/// the loop thread. The posted closure runs on the loop thread and receives
/// the reactor it was posted to.
#[derive(Clone)]
pub struct Remote {
    shared: Arc<Shared>,
}

impl Remote {
    pub fn call_soon<F>(&self, f: F)
    where
        F: FnOnce(&Reactor) + Send + 'static,
    {
        self.shared.injected.lock().push(Box::new(f));
        self.shared.wake();
    }
}

pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

impl Reactor {
    /// Creates the loop, its wakeup pipe and the background worker pool.
    pub fn new() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let (wake_rx, wake_tx) = (fds[0], fds[1]);
        set_nonblocking(wake_rx)?;
        set_nonblocking(wake_tx)?;

        let shared = Arc::new(Shared {
            injected: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            background: AtomicUsize::new(0),
            wake_tx,
        });

        let (job_tx, job_rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(WORKER_THREADS);
        for i in 0..WORKER_THREADS {
            let rx = job_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("ndt-worker-{i}"))
                .spawn(move || {
                    for job in rx.iter() {
                        job();
                    }
                })
                .map_err(Error::Io)?;
            workers.push(handle);
        }

        Ok(Reactor {
            inner: Rc::new(Inner {
                core: RefCell::new(Core {
                    soon: VecDeque::new(),
                    timers: BinaryHeap::new(),
                    polls: HashMap::new(),
                    completions: HashMap::new(),
                    next_seq: 0,
                }),
                shared,
                wake_rx,
                job_tx: RefCell::new(Some(job_tx)),
                workers: RefCell::new(workers),
            }),
        })
    }

    /// Returns a handle usable from other threads to post work to this loop.
    pub fn remote(&self) -> Remote {
        Remote {
            shared: Arc::clone(&self.inner.shared),
        }
    }

    /// Schedules `f` to run on the loop thread as soon as the loop is next
    /// free to dispatch. Never runs synchronously within the caller's stack.
    pub fn call_soon<F>(&self, f: F)
    where
        F: FnOnce() + 'static,
    {
        self.inner.core.borrow_mut().soon.push_back(Box::new(f));
    }

    /// As [`call_soon`](Self::call_soon), but not before `delay` has elapsed.
    /// A zero delay is equivalent to `call_soon`.
    pub fn call_later<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce() + 'static,
    {
        let mut core = self.inner.core.borrow_mut();
        let seq = core.next_seq();
        core.timers.push(TimerEntry {
            deadline: Instant::now() + delay,
            seq,
            call: Box::new(f),
        });
    }

    /// Invokes `cb` exactly once when `fd` becomes readable, or with a
    /// [`Error::Timeout`] if `timeout` elapses first.
    pub fn pollin<F>(&self, fd: RawFd, timeout: Duration, cb: F) -> PollToken
    where
        F: FnOnce(Result<()>) + 'static,
    {
        self.poll_register(fd, Interest::Read, timeout, Box::new(cb))
    }

    /// Writability counterpart of [`pollin`](Self::pollin).
    pub fn pollout<F>(&self, fd: RawFd, timeout: Duration, cb: F) -> PollToken
    where
        F: FnOnce(Result<()>) + 'static,
    {
        self.poll_register(fd, Interest::Write, timeout, Box::new(cb))
    }

    fn poll_register(
        &self,
        fd: RawFd,
        interest: Interest,
        timeout: Duration,
        callback: PollCallback,
    ) -> PollToken {
        let mut core = self.inner.core.borrow_mut();
        let id = core.next_seq();
        core.polls.insert(
            id,
            PollEntry {
                fd,
                interest,
                deadline: Instant::now() + timeout,
                callback,
            },
        );
        PollToken(id)
    }

    /// Drops a pending poll registration without invoking its callback.
    pub fn cancel(&self, token: PollToken) {
        self.inner.core.borrow_mut().polls.remove(&token.0);
    }

    /// Executes `f` on a worker thread, outside the loop. The loop stays
    /// alive until every background task has finished.
    pub fn run_in_background_thread<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::clone(&self.inner.shared);
        shared.background.fetch_add(1, Ordering::AcqRel);
        let job: Job = Box::new(move || {
            f();
            shared.background.fetch_sub(1, Ordering::AcqRel);
            shared.wake();
        });
        if let Some(tx) = self.inner.job_tx.borrow().as_ref() {
            // The workers only exit once the sender is dropped; if that
            // somehow happened, run the job inline rather than losing it.
            if let Err(returned) = tx.send(job) {
                (returned.0)();
            }
        }
    }

    /// Runs `work` on a worker thread and delivers its output to `done` on
    /// the loop thread. `done` may capture loop-local (non-`Send`) state.
    pub fn run_in_background<T, W, D>(&self, work: W, done: D)
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        D: FnOnce(&Reactor, T) + 'static,
    {
        let id = {
            let mut core = self.inner.core.borrow_mut();
            let id = core.next_seq();
            core.completions.insert(
                id,
                Box::new(move |reactor, payload| {
                    // The id ties this closure to exactly one payload type.
                    if let Ok(payload) = payload.downcast::<T>() {
                        done(reactor, *payload);
                    }
                }),
            );
            id
        };
        let remote = self.remote();
        self.run_in_background_thread(move || {
            let out = work();
            remote.call_soon(move |reactor| reactor.complete(id, Box::new(out)));
        });
    }

    fn complete(&self, id: u64, payload: Box<dyn Any>) {
        let done = self.inner.core.borrow_mut().completions.remove(&id);
        if let Some(done) = done {
            done(self, payload);
        }
    }

    /// Requests the loop to break out of its current and all future waits.
    /// Idempotent; callable from any thread holding a clone or a `Remote`.
    pub fn stop(&self) {
        self.inner.shared.stopped.store(true, Ordering::Release);
        self.inner.shared.wake();
    }

    fn stopped(&self) -> bool {
        self.inner.shared.stopped.load(Ordering::Acquire)
    }

    /// Dispatches scheduled work until nothing is pending and no background
    /// task is outstanding, then returns. A multiplexer failure is fatal and
    /// surfaces as an error; it is never retried.
    pub fn run(&self) -> Result<()> {
        debug!("reactor: loop starting");
        loop {
            self.drain_injected();
            self.dispatch_ready();
            if self.stopped() {
                debug!("reactor: loop stopped");
                return Ok(());
            }

            let now = Instant::now();
            let (next_deadline, has_work) = {
                let core = self.inner.core.borrow();
                let mut deadline = core.timers.peek().map(|t| t.deadline);
                for entry in core.polls.values() {
                    deadline = Some(match deadline {
                        Some(d) => d.min(entry.deadline),
                        None => entry.deadline,
                    });
                }
                let has_work = !core.soon.is_empty()
                    || !core.timers.is_empty()
                    || !core.polls.is_empty()
                    || !core.completions.is_empty();
                (deadline, has_work)
            };
            let background = self.inner.shared.background.load(Ordering::Acquire) > 0;
            let injected = !self.inner.shared.injected.lock().is_empty();
            if !has_work && !background && !injected {
                debug!("reactor: no pending work, loop exiting");
                return Ok(());
            }
            if injected {
                continue;
            }

            let mut timeout_ms: i32 = match next_deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(now);
                    // Round up so we do not spin on a sub-millisecond rest.
                    remaining.as_millis().min(i32::MAX as u128 - 1) as i32 + 1
                }
                None => -1,
            };
            if background {
                let keepalive = BACKGROUND_KEEPALIVE.as_millis() as i32;
                timeout_ms = if timeout_ms < 0 {
                    keepalive
                } else {
                    timeout_ms.min(keepalive)
                };
            }

            self.wait_for_events(timeout_ms)?;
        }
    }

    /// One `poll(2)` round: readiness, expiry, wakeup pipe.
    fn wait_for_events(&self, timeout_ms: i32) -> Result<()> {
        let mut ids: Vec<u64> = Vec::new();
        let mut fds: Vec<libc::pollfd> = Vec::new();
        fds.push(libc::pollfd {
            fd: self.inner.wake_rx,
            events: libc::POLLIN,
            revents: 0,
        });
        {
            let core = self.inner.core.borrow();
            for (&id, entry) in core.polls.iter() {
                ids.push(id);
                fds.push(libc::pollfd {
                    fd: entry.fd,
                    events: match entry.interest {
                        Interest::Read => libc::POLLIN,
                        Interest::Write => libc::POLLOUT,
                    },
                    revents: 0,
                });
            }
        }

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(Error::Reactor(format!("poll(2) failed: {err}")));
        }

        if fds[0].revents != 0 {
            self.drain_wake_pipe();
        }

        // Collect first, dispatch after releasing the borrow: callbacks may
        // register new events on this same reactor.
        let now = Instant::now();
        let mut fired: Vec<(PollCallback, Result<()>)> = Vec::new();
        {
            let mut core = self.inner.core.borrow_mut();
            for (slot, id) in ids.iter().enumerate() {
                let revents = fds[slot + 1].revents;
                let ready = revents
                    & (match core.polls.get(id).map(|e| e.interest) {
                        Some(Interest::Read) => libc::POLLIN,
                        Some(Interest::Write) => libc::POLLOUT,
                        None => 0,
                    } | libc::POLLERR
                        | libc::POLLHUP
                        | libc::POLLNVAL)
                    != 0;
                if ready {
                    if let Some(entry) = core.polls.remove(id) {
                        trace!("reactor: fd {} ready", entry.fd);
                        fired.push((entry.callback, Ok(())));
                    }
                } else if core.polls.get(id).is_some_and(|e| e.deadline <= now) {
                    if let Some(entry) = core.polls.remove(id) {
                        trace!("reactor: fd {} wait timed out", entry.fd);
                        fired.push((entry.callback, Err(Error::Timeout)));
                    }
                }
            }
        }
        for (callback, outcome) in fired {
            if self.stopped() {
                break;
            }
            callback(outcome);
        }
        Ok(())
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.inner.wake_rx,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    fn drain_injected(&self) {
        loop {
            let batch: Vec<RemoteCall> = {
                let mut injected = self.inner.shared.injected.lock();
                std::mem::take(&mut *injected)
            };
            if batch.is_empty() {
                return;
            }
            for call in batch {
                if self.stopped() {
                    return;
                }
                call(self);
            }
        }
    }

    /// Runs queued callbacks and due timers until none remain.
    fn dispatch_ready(&self) {
        loop {
            if self.stopped() {
                return;
            }
            let call: Option<LoopCall> = {
                let mut core = self.inner.core.borrow_mut();
                if let Some(call) = core.soon.pop_front() {
                    Some(call)
                } else if core
                    .timers
                    .peek()
                    .is_some_and(|t| t.deadline <= Instant::now())
                {
                    core.timers.pop().map(|t| t.call)
                } else {
                    None
                }
            };
            match call {
                Some(call) => call(),
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn call_soon_runs_in_fifo_order() {
        let reactor = Reactor::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            reactor.call_soon(move || order.borrow_mut().push(i));
        }
        reactor.run().unwrap();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn call_later_zero_is_not_synchronous() {
        let reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        reactor.call_later(Duration::ZERO, move || flag.set(true));
        assert!(!fired.get(), "must not run inside call_later");
        reactor.run().unwrap();
        assert!(fired.get());
    }

    #[test]
    fn stop_prevents_later_callbacks() {
        let reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let handle = reactor.clone();
        reactor.call_soon(move || handle.stop());
        reactor.call_later(Duration::from_millis(10), move || flag.set(true));
        reactor.run().unwrap();
        assert!(!fired.get(), "no callback may run after stop()");
    }

    #[test]
    fn background_result_bounces_to_loop_thread() {
        let reactor = Reactor::new().unwrap();
        let seen = Rc::new(Cell::new(0u64));
        let out = seen.clone();
        reactor.run_in_background(
            || {
                std::thread::sleep(Duration::from_millis(20));
                42u64
            },
            move |_reactor, value| out.set(value),
        );
        reactor.run().unwrap();
        assert_eq!(seen.get(), 42);
    }
}
