//! Tasks and the awaitables that suspend them.
//!
//! Task bodies are polled with a no-op waker. Instead of waking, a suspension point records
//! what it is waiting for in a thread-local slot: [`FutureAwait`] leaves the future it waits
//! on, [`YieldOnce`] leaves nothing. After a `Pending` poll the task reads the slot and either
//! adds a done callback to that future or reschedules itself with `call_soon`.
//!
//! Cancellation is delivered the same way: before polling a task with a pending `cancel()`,
//! the step stores a `CancelledError` that the first suspension point to run takes and raises.

use std::{
    cell::{Cell, RefCell},
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

use super::{
    WebLoop,
    future::{FutureState, PyFuture, cancelled_error},
};
use crate::{
    exception::{ExcType, Exception, RunResult},
    runtime::Runtime,
    types::LocalBoxFuture,
    value::Value,
};

thread_local! {
    /// The future the innermost suspended awaitable is waiting on.
    static AWAITING: RefCell<Option<PyFuture>> = const { RefCell::new(None) };
    /// `CancelledError` to raise at the next suspension point.
    static CANCEL_REQUEST: RefCell<Option<Exception>> = const { RefCell::new(None) };
    /// Tasks being stepped, innermost last.
    static CURRENT: RefCell<Vec<Task>> = const { RefCell::new(Vec::new()) };
}

fn take_cancel_request() -> Option<Exception> {
    CANCEL_REQUEST.with(|slot| slot.borrow_mut().take())
}

fn set_awaiting(future: Option<PyFuture>) {
    let old = AWAITING.with(|slot| slot.replace(future));
    drop(old);
}

/// Task state stored next to the task's future.
pub(crate) struct TaskCore {
    name: RefCell<Rc<str>>,
    /// The coroutine the task runs, kept for `get_coro()` and the repr.
    coro: Value,
    body: RefCell<Option<LocalBoxFuture<'static, RunResult<Value>>>>,
    started: Cell<bool>,
    stepping: Cell<bool>,
    must_cancel: Cell<bool>,
    cancel_message: RefCell<Option<Value>>,
    waiting_on: RefCell<Option<PyFuture>>,
    num_cancels: Cell<u32>,
}

impl TaskCore {
    pub(super) fn describe(&self, state: &FutureState) -> String {
        let coro = self.coro.repr_plain();
        let name = self.name.borrow();
        match state {
            FutureState::Pending => format!("<Task pending name='{name}' coro={coro}>"),
            FutureState::Cancelled(_) => format!("<Task cancelled name='{name}' coro={coro}>"),
            FutureState::Finished(value) => {
                format!("<Task finished name='{name}' coro={coro} result={}>", value.repr_plain())
            }
            FutureState::Failed(exc) => format!(
                "<Task finished name='{name}' coro={coro} exception={}>",
                Value::Exception(exc.clone()).repr_plain()
            ),
        }
    }

    pub(super) fn repr(&self, future: &PyFuture) -> String {
        self.describe(&future.state())
    }
}

/// `asyncio.Task`: a coroutine driven by the loop.
#[derive(Clone)]
pub struct Task(pub(crate) PyFuture);

impl Task {
    /// Wraps `coro` in a task and schedules its first step.
    pub(super) fn spawn(event_loop: &WebLoop, rt: &Runtime, coro: Value, name: Option<String>) -> RunResult<Self> {
        let Value::Coroutine(coroutine) = &coro else {
            return Err(ExcType::TypeError.msg(format!("a coroutine was expected, got {}", rt.repr(&coro)?)));
        };
        let body = coroutine.take_body()?;
        let name: Rc<str> = match name {
            Some(name) => name.into(),
            None => format!("Task-{}", rt.next_task_number()).into(),
        };
        let core = TaskCore {
            name: RefCell::new(name),
            coro,
            body: RefCell::new(Some(body)),
            started: Cell::new(false),
            stepping: Cell::new(false),
            must_cancel: Cell::new(false),
            cancel_message: RefCell::new(None),
            waiting_on: RefCell::new(None),
            num_cancels: Cell::new(0),
        };
        let task = Self(PyFuture::new(event_loop, Some(core)));
        event_loop.register_task(&task);
        task.schedule_step(event_loop);
        Ok(task)
    }

    /// The task currently being stepped, if any.
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT.with(|stack| stack.borrow().last().cloned())
    }

    fn core(&self) -> &TaskCore {
        match &self.0.0.task {
            Some(core) => core,
            None => unreachable!("Task wraps a future without task state"),
        }
    }

    /// The task's completion future. Shares identity with the task.
    #[must_use]
    pub fn future(&self) -> PyFuture {
        self.0.clone()
    }

    pub(crate) fn identity(&self) -> usize {
        self.0.identity()
    }

    #[must_use]
    pub fn repr(&self) -> String {
        self.0.repr()
    }

    #[must_use]
    pub fn name(&self) -> Rc<str> {
        self.core().name.borrow().clone()
    }

    pub fn set_name(&self, name: impl Into<Rc<str>>) {
        *self.core().name.borrow_mut() = name.into();
    }

    #[must_use]
    pub fn coro(&self) -> Value {
        self.core().coro.clone()
    }

    #[must_use]
    pub fn done(&self) -> bool {
        self.0.done()
    }

    pub fn result(&self) -> RunResult<Value> {
        self.0.result()
    }

    /// Number of pending cancellation requests.
    #[must_use]
    pub fn cancelling(&self) -> u32 {
        self.core().num_cancels.get()
    }

    pub fn uncancel(&self) -> u32 {
        let core = self.core();
        let n = core.num_cancels.get().saturating_sub(1);
        core.num_cancels.set(n);
        n
    }

    /// `task.cancel(msg)`: cancels the awaited future if possible, otherwise arranges for
    /// `CancelledError` to be raised at the task's next suspension point.
    pub fn cancel(&self, message: Option<Value>) -> bool {
        if self.0.done() {
            return false;
        }
        let core = self.core();
        core.num_cancels.set(core.num_cancels.get() + 1);
        let waiting_on = core.waiting_on.borrow().clone();
        if let Some(future) = waiting_on {
            if future.cancel(message.clone()) {
                return true;
            }
        }
        core.must_cancel.set(true);
        *core.cancel_message.borrow_mut() = message;
        true
    }

    fn schedule_step(&self, event_loop: &WebLoop) {
        let task = self.clone();
        event_loop.push_native(
            "Task.__step()",
            Box::new(move |rt| {
                task.step(rt);
                Ok(())
            }),
        );
    }

    fn take_cancel_message(&self) -> Option<Value> {
        self.core().cancel_message.borrow_mut().take()
    }

    /// Advances the coroutine to its next suspension point.
    fn step(&self, rt: &Runtime) {
        let core = self.core();
        if self.0.done() || core.stepping.get() {
            return;
        }
        let Some(event_loop) = self.0.get_loop() else {
            return;
        };
        let first = !core.started.replace(true);
        if first && core.must_cancel.replace(false) {
            let body = core.body.borrow_mut().take();
            drop(body);
            self.0.cancel_future(self.take_cancel_message());
            event_loop.trace_task_step(&self.name(), true);
            return;
        }
        let Some(mut body) = core.body.borrow_mut().take() else {
            return;
        };
        let cancel = core
            .must_cancel
            .replace(false)
            .then(|| cancelled_error(self.take_cancel_message()));
        let waiting = core.waiting_on.borrow_mut().take();
        drop(waiting);

        core.stepping.set(true);
        CURRENT.with(|stack| stack.borrow_mut().push(self.clone()));
        let outer_awaiting = AWAITING.with(|slot| slot.borrow_mut().take());
        let outer_cancel = CANCEL_REQUEST.with(|slot| slot.replace(cancel));
        let poll = body.as_mut().poll(&mut Context::from_waker(Waker::noop()));
        let awaiting = AWAITING.with(|slot| slot.replace(outer_awaiting));
        let undelivered = CANCEL_REQUEST.with(|slot| slot.replace(outer_cancel));
        CURRENT.with(|stack| stack.borrow_mut().pop());
        core.stepping.set(false);

        if let Some(exc) = undelivered {
            core.must_cancel.set(true);
            *core.cancel_message.borrow_mut() = Some(exc.first_arg());
        }
        match poll {
            Poll::Ready(result) => {
                drop(body);
                match result {
                    Ok(_) if core.must_cancel.get() => {
                        self.0.cancel_future(self.take_cancel_message());
                    }
                    Ok(value) => self.0.finish(FutureState::Finished(value)),
                    Err(exc) if exc.is_instance(ExcType::CancelledError) => {
                        self.0.cancel_future(Some(exc.first_arg()));
                    }
                    Err(exc) => {
                        // StopIteration cannot be stored in a future.
                        let exc = if exc.is_instance(ExcType::StopIteration) {
                            let wrapped = ExcType::RuntimeError.msg("coroutine raised StopIteration");
                            wrapped.set_cause(Some(exc));
                            wrapped
                        } else {
                            exc
                        };
                        if let Err(exc) = self.0.set_exception(exc) {
                            rt.report_unraisable(&exc, "Exception ignored while finishing a task");
                        }
                    }
                }
            }
            Poll::Pending => {
                *core.body.borrow_mut() = Some(body);
                match awaiting {
                    Some(future) if future.is(&self.0) => {
                        let body = core.body.borrow_mut().take();
                        drop(body);
                        let exc = ExcType::RuntimeError.msg(format!("Task cannot await on itself: {}", self.repr()));
                        let _ = self.0.set_exception(exc);
                    }
                    Some(future) if future.done() => self.schedule_step(&event_loop),
                    Some(future) => {
                        *core.waiting_on.borrow_mut() = Some(future.clone());
                        let task = self.clone();
                        future.add_native_callback(Box::new(move |rt, _| {
                            task.step(rt);
                            Ok(())
                        }));
                        let message = core.cancel_message.borrow().clone();
                        if core.must_cancel.get() && future.cancel(message) {
                            core.must_cancel.set(false);
                        }
                    }
                    None => self.schedule_step(&event_loop),
                }
            }
        }
        event_loop.trace_task_step(&self.name(), self.0.done());
    }
}

/// Awaits a loop future from inside a task.
pub struct FutureAwait {
    future: PyFuture,
    suspended: bool,
}

impl FutureAwait {
    #[must_use]
    pub fn new(future: PyFuture) -> Self {
        Self {
            future,
            suspended: false,
        }
    }
}

impl Future for FutureAwait {
    type Output = RunResult<Value>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(exc) = take_cancel_request() {
            if self.suspended {
                self.future.cancel(None);
            }
            return Poll::Ready(Err(exc));
        }
        if self.future.done() {
            return Poll::Ready(self.future.result());
        }
        self.suspended = true;
        set_awaiting(Some(self.future.clone()));
        Poll::Pending
    }
}

/// Gives the loop one turn: pending on the first poll, ready on the next.
#[derive(Debug, Default)]
pub struct YieldOnce {
    yielded: bool,
}

impl Future for YieldOnce {
    type Output = RunResult<()>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(exc) = take_cancel_request() {
            return Poll::Ready(Err(exc));
        }
        if self.yielded {
            return Poll::Ready(Ok(()));
        }
        self.yielded = true;
        set_awaiting(None);
        Poll::Pending
    }
}
