//! Delayed-callback scheduling
//!
//! All timed behavior in the stack (heartbeat emission, EMCY and TPDO
//! inhibit windows, LSS bit-timing delays) goes through the [`Scheduler`]
//! trait. Two implementations are provided: [`StdScheduler`] runs a
//! blocking loop on a dedicated thread, and [`VirtualScheduler`] advances
//! time on demand for deterministic tests.
//!
//! The scheduler also owns the process-wide dispatch lock. Scheduled
//! callbacks fire with the lock held; network adapters hold it around
//! inbound dispatch; applications hold it around external mutations.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A scheduled unit of work
pub type ScheduledCallback = Box<dyn FnOnce() + Send>;

/// Identifies a scheduled callback so it can be canceled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// Provider of delayed callbacks and the dispatch lock
pub trait Scheduler: Send + Sync {
    /// Schedule `callback` to run after `delay`
    fn add(&self, delay: Duration, callback: ScheduledCallback) -> TimerHandle;

    /// Cancel a scheduled callback
    ///
    /// A handle whose callback has already fired (or begun firing) is
    /// silently ignored; timer owners needing stronger guarantees keep an
    /// epoch counter and have stale callbacks return early.
    fn cancel(&self, handle: TimerHandle);

    /// Acquire the process-wide dispatch lock
    fn lock(&self) -> MutexGuard<'_, ()>;

    /// Clone the dispatch lock for adapters dispatching from other threads
    fn lock_handle(&self) -> Arc<Mutex<()>>;
}

struct StdState {
    next_id: u64,
    entries: BTreeMap<(Instant, u64), ScheduledCallback>,
    running: bool,
}

/// A blocking-loop scheduler
///
/// [`StdScheduler::run`] blocks the calling thread; most applications use
/// [`StdScheduler::spawn`] to run it on a dedicated one.
pub struct StdScheduler {
    state: Mutex<StdState>,
    condvar: Condvar,
    dispatch_lock: Arc<Mutex<()>>,
}

impl Default for StdScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl StdScheduler {
    /// Create a new scheduler
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StdState {
                next_id: 0,
                entries: BTreeMap::new(),
                running: true,
            }),
            condvar: Condvar::new(),
            dispatch_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Run the scheduling loop until [`StdScheduler::stop`] is called
    pub fn run(&self) {
        loop {
            let mut state = self.state.lock().unwrap();
            if !state.running {
                break;
            }
            let now = Instant::now();
            match state.entries.keys().next().copied() {
                Some((due, id)) if due <= now => {
                    let callback = state.entries.remove(&(due, id)).unwrap();
                    drop(state);
                    let _guard = self.dispatch_lock.lock().unwrap();
                    callback();
                }
                Some((due, _)) => {
                    let _unused = self.condvar.wait_timeout(state, due - now).unwrap();
                }
                None => {
                    let _unused = self.condvar.wait(state).unwrap();
                }
            }
        }
    }

    /// Run the scheduling loop on a new thread
    pub fn spawn(self: Arc<Self>) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("cantata-scheduler".into())
            .spawn(move || self.run())
            .expect("failed to spawn scheduler thread")
    }

    /// Stop a running scheduling loop
    pub fn stop(&self) {
        self.state.lock().unwrap().running = false;
        self.condvar.notify_all();
    }
}

impl Scheduler for StdScheduler {
    fn add(&self, delay: Duration, callback: ScheduledCallback) -> TimerHandle {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.entries.insert((Instant::now() + delay, id), callback);
        self.condvar.notify_all();
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        let mut state = self.state.lock().unwrap();
        state.entries.retain(|(_, id), _| *id != handle.0);
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.dispatch_lock.lock().unwrap()
    }

    fn lock_handle(&self) -> Arc<Mutex<()>> {
        self.dispatch_lock.clone()
    }
}

struct VirtualState {
    now: Duration,
    next_id: u64,
    entries: BTreeMap<(Duration, u64), ScheduledCallback>,
}

/// A deterministic scheduler for tests
///
/// Time only advances inside [`VirtualScheduler::run`], which fires every
/// entry falling due within the given span, in (due time, insertion) order.
pub struct VirtualScheduler {
    state: Mutex<VirtualState>,
    dispatch_lock: Arc<Mutex<()>>,
}

impl Default for VirtualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualScheduler {
    /// Create a new virtual scheduler at time zero
    pub fn new() -> Self {
        Self {
            state: Mutex::new(VirtualState {
                now: Duration::ZERO,
                next_id: 0,
                entries: BTreeMap::new(),
            }),
            dispatch_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Advance virtual time by `duration`, firing every due callback
    ///
    /// Callbacks fire outside the internal state lock, so they are free to
    /// add or cancel entries (including re-scheduling themselves within the
    /// same span).
    pub fn run(&self, duration: Duration) {
        let end = self.state.lock().unwrap().now + duration;
        loop {
            let callback = {
                let mut state = self.state.lock().unwrap();
                match state.entries.keys().next().copied() {
                    Some((due, id)) if due <= end => {
                        state.now = due;
                        Some(state.entries.remove(&(due, id)).unwrap())
                    }
                    _ => None,
                }
            };
            match callback {
                Some(callback) => {
                    let _guard = self.dispatch_lock.lock().unwrap();
                    callback();
                }
                None => break,
            }
        }
        self.state.lock().unwrap().now = end;
    }

    /// The current virtual time
    pub fn now(&self) -> Duration {
        self.state.lock().unwrap().now
    }

    /// The number of entries waiting to fire
    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }
}

impl Scheduler for VirtualScheduler {
    fn add(&self, delay: Duration, callback: ScheduledCallback) -> TimerHandle {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        let due = state.now + delay;
        state.entries.insert((due, id), callback);
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        let mut state = self.state.lock().unwrap();
        state.entries.retain(|(_, id), _| *id != handle.0);
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.dispatch_lock.lock().unwrap()
    }

    fn lock_handle(&self) -> Arc<Mutex<()>> {
        self.dispatch_lock.clone()
    }
}
