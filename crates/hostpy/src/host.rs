//! The embedder-facing host interface.
//!
//! The runtime never blocks and never spawns threads. Everything that needs to happen later is
//! handed to the [`Host`] as a timer callback, the way a browser exposes `setTimeout`.
//! [`LocalHost`] is the bundled implementation: a deterministic timer queue that runs either on a
//! virtual clock (tests) or on the monotonic system clock.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::{Duration, Instant},
};

use ahash::AHashSet;

use crate::value::Value;

/// Identifies a pending timeout or interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(pub u64);

/// Why `suspend_here` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    /// The token was signalled.
    Woken,
    /// The timeout elapsed, or the host has nothing left that could signal the token.
    TimedOut,
    /// The host cannot suspend the current call stack.
    Unsupported,
}

/// A flag a suspended caller waits on.
#[derive(Debug, Clone, Default)]
pub struct WakeToken(Rc<Cell<bool>>);

impl WakeToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.0.set(true);
    }

    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.0.get()
    }

    pub fn reset(&self) {
        self.0.set(false);
    }
}

/// Services the embedding environment provides to the runtime.
pub trait Host {
    /// Runs `callback` once after `delay_ms` milliseconds.
    fn set_timeout(&self, callback: Box<dyn FnOnce()>, delay_ms: f64) -> TimerToken;

    fn clear_timeout(&self, token: TimerToken);

    /// Runs `callback` every `interval_ms` milliseconds until cleared.
    fn set_interval(&self, callback: Box<dyn FnMut()>, interval_ms: f64) -> TimerToken;

    fn clear_interval(&self, token: TimerToken);

    /// Monotonic clock in seconds.
    fn now(&self) -> f64;

    /// Sink for the loop's default exception handler.
    fn console_log(&self, msg: &str) {
        eprintln!("{msg}");
    }

    /// True if [`Host::suspend_here`] is implemented.
    fn can_suspend(&self) -> bool {
        false
    }

    /// Blocks the current call stack until `token` is signalled or `timeout_ms` elapses,
    /// running host callbacks meanwhile.
    fn suspend_here(&self, _token: &WakeToken, _timeout_ms: Option<f64>) -> SuspendReason {
        SuspendReason::Unsupported
    }

    /// Resolves names of the `js` module that the runtime does not provide itself.
    fn namespace_lookup(&self, _name: &str) -> Option<Value> {
        None
    }
}

enum Clock {
    Virtual(Cell<f64>),
    Monotonic(Instant),
}

enum TimerCallback {
    Once(Box<dyn FnOnce()>),
    Interval { callback: Box<dyn FnMut()>, interval_ms: f64 },
}

struct Timer {
    id: u64,
    /// Deadline in milliseconds on the host clock.
    deadline: f64,
    seq: u64,
    callback: TimerCallback,
}

/// A single-threaded timer queue implementing [`Host`].
///
/// Nothing runs on its own: the embedder drives the queue with [`LocalHost::run_until_idle`],
/// [`LocalHost::advance`] or [`LocalHost::run_next`]. Timers with equal deadlines run in the
/// order they were scheduled.
pub struct LocalHost {
    clock: Clock,
    timers: RefCell<Vec<Timer>>,
    next_id: Cell<u64>,
    next_seq: Cell<u64>,
    /// Intervals cleared while their callback was running.
    cleared: RefCell<AHashSet<u64>>,
    logs: RefCell<Vec<String>>,
}

impl LocalHost {
    /// A host whose clock only moves when timers run or [`LocalHost::advance`] is called.
    #[must_use]
    pub fn virtual_clock() -> Rc<Self> {
        Rc::new(Self::new(Clock::Virtual(Cell::new(0.0))))
    }

    /// A host on the system monotonic clock; running a timer sleeps until its deadline.
    #[must_use]
    pub fn monotonic() -> Rc<Self> {
        Rc::new(Self::new(Clock::Monotonic(Instant::now())))
    }

    fn new(clock: Clock) -> Self {
        Self {
            clock,
            timers: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
            next_seq: Cell::new(0),
            cleared: RefCell::new(AHashSet::new()),
            logs: RefCell::new(Vec::new()),
        }
    }

    fn now_ms(&self) -> f64 {
        match &self.clock {
            Clock::Virtual(now) => now.get(),
            Clock::Monotonic(start) => start.elapsed().as_secs_f64() * 1000.0,
        }
    }

    fn push(&self, id: u64, delay_ms: f64, callback: TimerCallback) {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        let deadline = self.now_ms() + delay_ms.max(0.0);
        self.timers.borrow_mut().push(Timer {
            id,
            deadline,
            seq,
            callback,
        });
    }

    fn alloc_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn remove(&self, id: u64) -> bool {
        let removed = {
            let mut timers = self.timers.borrow_mut();
            timers.iter().position(|t| t.id == id).map(|i| timers.remove(i))
        };
        let found = removed.is_some();
        drop(removed);
        found
    }

    /// Deadline of the earliest pending timer, in milliseconds.
    #[must_use]
    pub fn next_deadline(&self) -> Option<f64> {
        self.timers
            .borrow()
            .iter()
            .map(|t| t.deadline)
            .min_by(f64::total_cmp)
    }

    /// Number of pending timeouts, not counting intervals.
    #[must_use]
    pub fn pending_timeouts(&self) -> usize {
        self.timers
            .borrow()
            .iter()
            .filter(|t| matches!(t.callback, TimerCallback::Once(_)))
            .count()
    }

    /// Runs the earliest timer, moving the clock to its deadline. Returns false if none is pending.
    pub fn run_next(&self) -> bool {
        self.run_next_until(None)
    }

    /// Like [`LocalHost::run_next`], but only runs a timer due at or before `limit` ms.
    fn run_next_until(&self, limit: Option<f64>) -> bool {
        let timer = {
            let mut timers = self.timers.borrow_mut();
            let next = timers
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.deadline.total_cmp(&b.deadline).then(a.seq.cmp(&b.seq)))
                .map(|(i, t)| (i, t.deadline));
            match next {
                Some((i, deadline)) if limit.is_none_or(|limit| deadline <= limit) => timers.remove(i),
                _ => return false,
            }
        };
        match &self.clock {
            Clock::Virtual(now) => {
                if timer.deadline > now.get() {
                    now.set(timer.deadline);
                }
            }
            Clock::Monotonic(_) => {
                let wait = timer.deadline - self.now_ms();
                if wait > 0.0 {
                    std::thread::sleep(Duration::from_secs_f64(wait / 1000.0));
                }
            }
        }
        let Timer { id, callback, .. } = timer;
        match callback {
            TimerCallback::Once(callback) => callback(),
            TimerCallback::Interval {
                mut callback,
                interval_ms,
            } => {
                callback();
                if !self.cleared.borrow_mut().remove(&id) {
                    self.push(id, interval_ms, TimerCallback::Interval { callback, interval_ms });
                }
            }
        }
        true
    }

    /// Runs timers until no timeouts are pending. Intervals alone do not keep this going.
    ///
    /// Returns the number of callbacks run.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.pending_timeouts() > 0 && self.run_next() {
            ran += 1;
        }
        ran
    }

    /// Moves the virtual clock forward by `ms`, running every timer that falls due on the way.
    ///
    /// On a monotonic host this runs the timers due within the next `ms` milliseconds.
    pub fn advance(&self, ms: f64) -> usize {
        let target = self.now_ms() + ms;
        let mut ran = 0;
        while self.run_next_until(Some(target)) {
            ran += 1;
        }
        if let Clock::Virtual(now) = &self.clock {
            if now.get() < target {
                now.set(target);
            }
        }
        ran
    }

    /// Messages received through [`Host::console_log`], oldest first.
    #[must_use]
    pub fn take_logs(&self) -> Vec<String> {
        std::mem::take(&mut *self.logs.borrow_mut())
    }
}

impl Host for LocalHost {
    fn set_timeout(&self, callback: Box<dyn FnOnce()>, delay_ms: f64) -> TimerToken {
        let id = self.alloc_id();
        self.push(id, delay_ms, TimerCallback::Once(callback));
        TimerToken(id)
    }

    fn clear_timeout(&self, token: TimerToken) {
        self.remove(token.0);
    }

    fn set_interval(&self, callback: Box<dyn FnMut()>, interval_ms: f64) -> TimerToken {
        let id = self.alloc_id();
        self.push(id, interval_ms, TimerCallback::Interval { callback, interval_ms });
        TimerToken(id)
    }

    fn clear_interval(&self, token: TimerToken) {
        if !self.remove(token.0) {
            self.cleared.borrow_mut().insert(token.0);
        }
    }

    fn now(&self) -> f64 {
        self.now_ms() / 1000.0
    }

    /// Records the message; read it back with [`LocalHost::take_logs`].
    fn console_log(&self, msg: &str) {
        self.logs.borrow_mut().push(msg.to_owned());
    }

    fn can_suspend(&self) -> bool {
        true
    }

    /// Runs pending timers until `token` is signalled.
    fn suspend_here(&self, token: &WakeToken, timeout_ms: Option<f64>) -> SuspendReason {
        let limit = timeout_ms.map(|ms| self.now_ms() + ms);
        loop {
            if token.is_signaled() {
                return SuspendReason::Woken;
            }
            if !self.run_next_until(limit) {
                if let (Some(limit), Clock::Virtual(now)) = (limit, &self.clock) {
                    now.set(now.get().max(limit));
                }
                return if token.is_signaled() {
                    SuspendReason::Woken
                } else {
                    SuspendReason::TimedOut
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_run_in_deadline_then_insertion_order() {
        let host = LocalHost::virtual_clock();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (name, delay) in [("b", 20.0), ("a", 10.0), ("c", 20.0)] {
            let order = order.clone();
            host.set_timeout(Box::new(move || order.borrow_mut().push(name)), delay);
        }
        assert_eq!(host.run_until_idle(), 3);
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
        assert!((host.now() - 0.02).abs() < 1e-9);
    }

    #[test]
    fn cleared_interval_stops() {
        let host = LocalHost::virtual_clock();
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let token = host.set_interval(Box::new(move || c.set(c.get() + 1)), 5.0);
        host.advance(16.0);
        assert_eq!(count.get(), 3);
        host.clear_interval(token);
        host.advance(50.0);
        assert_eq!(count.get(), 3);
    }
}
