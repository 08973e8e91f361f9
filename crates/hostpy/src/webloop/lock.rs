use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
};

use super::{FutureAwait, PyFuture};
use crate::{
    exception::{ExcType, RunResult},
    runtime::Runtime,
    value::Value,
};

/// `asyncio.Lock`. Waiters are woken in FIFO order.
#[derive(Default)]
pub struct AsyncLock {
    locked: Cell<bool>,
    waiters: RefCell<VecDeque<PyFuture>>,
}

impl AsyncLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn locked(&self) -> bool {
        self.locked.get()
    }

    /// Waits until the lock is free and takes it.
    pub async fn acquire(&self, rt: &Runtime) -> RunResult<()> {
        if !self.locked.get() && self.waiters.borrow().iter().all(PyFuture::cancelled) {
            self.locked.set(true);
            return Ok(());
        }
        let waiter = rt.event_loop().create_future();
        self.waiters.borrow_mut().push_back(waiter.clone());
        let outcome = FutureAwait::new(waiter.clone()).await;
        self.waiters.borrow_mut().retain(|w| !w.is(&waiter));
        match outcome {
            Ok(_) => {
                self.locked.set(true);
                Ok(())
            }
            Err(exc) => {
                if exc.is_instance(ExcType::CancelledError) && !self.locked.get() {
                    self.wake_first();
                }
                Err(exc)
            }
        }
    }

    pub fn release(&self) -> RunResult<()> {
        if !self.locked.get() {
            return Err(ExcType::RuntimeError.msg("Lock is not acquired."));
        }
        self.locked.set(false);
        self.wake_first();
        Ok(())
    }

    fn wake_first(&self) {
        let first = self.waiters.borrow().front().cloned();
        if let Some(waiter) = first.filter(|w| !w.done()) {
            let _ = waiter.set_result(Value::Bool(true));
        }
    }

    #[must_use]
    pub fn repr(&self) -> String {
        let state = if self.locked.get() { "locked" } else { "unlocked" };
        let waiters = self.waiters.borrow().len();
        if waiters == 0 {
            format!("<asyncio.locks.Lock object [{state}]>")
        } else {
            format!("<asyncio.locks.Lock object [{state}, waiters:{waiters}]>")
        }
    }
}
