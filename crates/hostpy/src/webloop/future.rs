//! Loop-bound futures.

use std::{
    cell::{Cell, RefCell},
    fmt::Write as _,
    rc::{Rc, Weak},
};

use super::{LoopInner, WebLoop, task::TaskCore};
use crate::{
    args::Args,
    eval::await_value,
    exception::{ExcType, Exception, RunResult},
    runtime::Runtime,
    types::{Coroutine, Dict},
    value::Value,
    webloop::{Task, is_awaitable},
};

/// Where a future is in its life cycle.
#[derive(Clone)]
pub enum FutureState {
    Pending,
    /// Cancelled, with the optional message passed to `cancel()`.
    Cancelled(Option<Value>),
    Finished(Value),
    Failed(Exception),
}

impl FutureState {
    fn label(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Cancelled(_) => "CANCELLED",
            Self::Finished(_) | Self::Failed(_) => "FINISHED",
        }
    }
}

pub(super) type NativeDoneCallback = Box<dyn FnOnce(&Runtime, &PyFuture) -> RunResult<()>>;

enum DoneCallback {
    Python(Value),
    Native(NativeDoneCallback),
}

/// `asyncio.Future` bound to a [`WebLoop`].
///
/// Tasks are futures too: a task's future carries a [`TaskCore`] and is wrapped in [`Task`].
#[derive(Clone)]
pub struct PyFuture(pub(super) Rc<FutureInner>);

pub(super) struct FutureInner {
    event_loop: Weak<LoopInner>,
    state: RefCell<FutureState>,
    callbacks: RefCell<Vec<DoneCallback>>,
    /// True while a stored exception has not been retrieved.
    log_traceback: Cell<bool>,
    /// Futures cancelled together with this one (the children of `gather`).
    linked: RefCell<Vec<PyFuture>>,
    pub(super) task: Option<TaskCore>,
}

impl PyFuture {
    pub(super) fn new(event_loop: &WebLoop, task: Option<TaskCore>) -> Self {
        Self(Rc::new(FutureInner {
            event_loop: Rc::downgrade(&event_loop.0),
            state: RefCell::new(FutureState::Pending),
            callbacks: RefCell::new(Vec::new()),
            log_traceback: Cell::new(false),
            linked: RefCell::new(Vec::new()),
            task,
        }))
    }

    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.0).cast::<()>() as usize
    }

    #[must_use]
    pub fn is(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// The loop the future belongs to, unless it was dropped.
    #[must_use]
    pub fn get_loop(&self) -> Option<WebLoop> {
        self.0.event_loop.upgrade().map(WebLoop)
    }

    fn require_loop(&self) -> RunResult<WebLoop> {
        self.get_loop()
            .ok_or_else(|| ExcType::RuntimeError.msg("Future is not bound to a running event loop"))
    }

    /// The future as a Python value: `Task` for task futures, `Future` otherwise.
    #[must_use]
    pub fn as_value(&self) -> Value {
        if self.0.task.is_some() {
            Value::Task(Task(self.clone()))
        } else {
            Value::Future(self.clone())
        }
    }

    #[must_use]
    pub fn state(&self) -> FutureState {
        self.0.state.borrow().clone()
    }

    #[must_use]
    pub fn done(&self) -> bool {
        !matches!(*self.0.state.borrow(), FutureState::Pending)
    }

    #[must_use]
    pub fn cancelled(&self) -> bool {
        matches!(*self.0.state.borrow(), FutureState::Cancelled(_))
    }

    /// `future.result()`: the value, the stored exception, or `CancelledError`.
    pub fn result(&self) -> RunResult<Value> {
        match self.state() {
            FutureState::Pending => Err(ExcType::InvalidStateError.msg("Result is not set.")),
            FutureState::Cancelled(message) => Err(cancelled_error(message)),
            FutureState::Finished(value) => Ok(value),
            FutureState::Failed(exc) => {
                self.0.log_traceback.set(false);
                Err(exc)
            }
        }
    }

    /// `future.exception()`.
    pub fn exception(&self) -> RunResult<Option<Exception>> {
        match self.state() {
            FutureState::Pending => Err(ExcType::InvalidStateError.msg("Exception is not set.")),
            FutureState::Cancelled(message) => Err(cancelled_error(message)),
            FutureState::Finished(_) => Ok(None),
            FutureState::Failed(exc) => {
                self.0.log_traceback.set(false);
                Ok(Some(exc))
            }
        }
    }

    pub fn set_result(&self, value: Value) -> RunResult<()> {
        self.check_pending()?;
        self.finish(FutureState::Finished(value));
        Ok(())
    }

    pub fn set_exception(&self, exc: Exception) -> RunResult<()> {
        self.check_pending()?;
        if exc.is_instance(ExcType::StopIteration) {
            return Err(ExcType::TypeError.msg(
                "StopIteration interacts badly with generators and cannot be raised into a Future",
            ));
        }
        self.0.log_traceback.set(true);
        self.finish(FutureState::Failed(exc));
        Ok(())
    }

    fn check_pending(&self) -> RunResult<()> {
        if self.done() {
            let label = self.0.state.borrow().label();
            return Err(ExcType::InvalidStateError.msg(format!("{label}: {}", self.repr())));
        }
        Ok(())
    }

    /// `future.cancel(msg)`. Returns false if the future was already done.
    pub fn cancel(&self, message: Option<Value>) -> bool {
        if self.0.task.is_some() {
            return Task(self.clone()).cancel(message);
        }
        let linked = std::mem::take(&mut *self.0.linked.borrow_mut());
        for child in &linked {
            child.cancel(message.clone());
        }
        self.cancel_future(message)
    }

    /// Marks the future itself cancelled, bypassing task cancellation.
    pub(super) fn cancel_future(&self, message: Option<Value>) -> bool {
        if self.done() {
            return false;
        }
        self.finish(FutureState::Cancelled(message));
        true
    }

    pub(super) fn finish(&self, state: FutureState) {
        let old = self.0.state.replace(state);
        drop(old);
        self.schedule_callbacks();
    }

    pub(super) fn link(&self, child: PyFuture) {
        self.0.linked.borrow_mut().push(child);
    }

    /// Settles this future with the outcome of `source`. Cancelling this future cancels `source`.
    pub(crate) fn follow(&self, source: &PyFuture) {
        self.link(source.clone());
        let out = self.clone();
        source.on_done(move |_, done| {
            if out.done() {
                return Ok(());
            }
            match done.state() {
                FutureState::Pending => Ok(()),
                FutureState::Finished(value) => out.set_result(value),
                FutureState::Failed(exc) => {
                    done.0.log_traceback.set(false);
                    out.set_exception(exc)
                }
                FutureState::Cancelled(message) => {
                    out.cancel_future(message);
                    Ok(())
                }
            }
        });
    }

    /// `future.add_done_callback(fn)`: `fn(future)` runs through `call_soon` once done.
    pub fn add_done_callback(&self, callback: Value) {
        self.0.callbacks.borrow_mut().push(DoneCallback::Python(callback));
        if self.done() {
            self.schedule_callbacks();
        }
    }

    pub(super) fn add_native_callback(&self, callback: NativeDoneCallback) {
        self.0.callbacks.borrow_mut().push(DoneCallback::Native(callback));
        if self.done() {
            self.schedule_callbacks();
        }
    }

    /// Runs `callback` once the future is done, like a Python done callback.
    pub fn on_done(&self, callback: impl FnOnce(&Runtime, &Self) -> RunResult<()> + 'static) {
        self.add_native_callback(Box::new(callback));
    }

    /// `future.remove_done_callback(fn)`: returns how many callbacks were removed.
    pub fn remove_done_callback(&self, callback: &Value) -> usize {
        let mut callbacks = self.0.callbacks.borrow_mut();
        let before = callbacks.len();
        callbacks.retain(|cb| !matches!(cb, DoneCallback::Python(f) if f == callback));
        before - callbacks.len()
    }

    fn schedule_callbacks(&self) {
        let callbacks = std::mem::take(&mut *self.0.callbacks.borrow_mut());
        if callbacks.is_empty() {
            return;
        }
        let Some(event_loop) = self.get_loop() else {
            return;
        };
        for callback in callbacks {
            match callback {
                DoneCallback::Python(func) => {
                    event_loop.push_python(func, vec![self.as_value()], None);
                }
                DoneCallback::Native(func) => {
                    let future = self.clone();
                    event_loop.push_native("Future.done_callback()", Box::new(move |rt| func(rt, &future)));
                }
            }
        }
    }

    /// `future.then(onfulfilled, onrejected)`: a new future settled with the outcome of the
    /// matching handler. Awaitable handler results are awaited until a plain value comes out.
    pub fn then(&self, onfulfilled: Value, onrejected: Value) -> RunResult<Self> {
        let result = self.require_loop()?.create_future();
        let out = result.clone();
        self.on_done(move |rt, source| {
            let (handler, argument, fulfilled) = match source.state() {
                FutureState::Pending => return Ok(()),
                FutureState::Cancelled(message) => {
                    out.cancel(message);
                    return Ok(());
                }
                FutureState::Finished(value) => (onfulfilled, value, true),
                FutureState::Failed(exc) => {
                    source.0.log_traceback.set(false);
                    (onrejected, Value::Exception(exc), false)
                }
            };
            let runtime = rt.clone();
            let body = async move {
                let outcome: RunResult<Value> = async {
                    let mut value = match (&handler, fulfilled) {
                        (Value::None, true) => argument,
                        (Value::None, false) => return Err(runtime.make_exception(argument)?),
                        (func, _) => runtime.call(func, Args::one(argument))?,
                    };
                    while is_awaitable(&runtime, &value) {
                        value = await_value(&runtime, value).await?;
                    }
                    Ok(value)
                }
                .await;
                settle(&out, outcome)
            };
            rt.event_loop()
                .create_task(Value::Coroutine(Coroutine::from_future("then", body)), None)
                .map(drop)
        });
        Ok(result)
    }

    /// `future.catch(onrejected)`.
    pub fn catch(&self, onrejected: Value) -> RunResult<Self> {
        self.then(Value::None, onrejected)
    }

    /// `future.finally_(onfinally)`: runs `onfinally()` and then passes the original outcome on.
    pub fn finally_(&self, onfinally: Value) -> RunResult<Self> {
        let result = self.require_loop()?.create_future();
        let out = result.clone();
        self.on_done(move |rt, source| {
            let source = source.clone();
            let runtime = rt.clone();
            let body = async move {
                let cleanup: RunResult<()> = async {
                    let mut value = runtime.call(&onfinally, Args::empty())?;
                    while is_awaitable(&runtime, &value) {
                        value = await_value(&runtime, value).await?;
                    }
                    Ok(())
                }
                .await;
                match (cleanup, source.state()) {
                    (Err(exc), _) => settle(&out, Err(exc)),
                    (Ok(()), FutureState::Cancelled(message)) => {
                        out.cancel(message);
                        Ok(Value::None)
                    }
                    (Ok(()), _) => settle(&out, source.result()),
                }
            };
            rt.event_loop()
                .create_task(Value::Coroutine(Coroutine::from_future("finally_", body)), None)
                .map(drop)
        });
        Ok(result)
    }

    /// Renders `<Future pending>`, `<Future finished result=1>` and the like.
    #[must_use]
    pub fn repr(&self) -> String {
        if let Some(task) = &self.0.task {
            return task.repr(self);
        }
        format!("<Future {}>", self.describe_state())
    }

    pub(super) fn describe_state(&self) -> String {
        describe_state(&self.0.state.borrow())
    }
}

fn describe_state(state: &FutureState) -> String {
    let mut out = String::new();
    match state {
        FutureState::Pending => out.push_str("pending"),
        FutureState::Cancelled(_) => out.push_str("cancelled"),
        FutureState::Finished(value) => {
            let _ = write!(out, "finished result={}", value.repr_plain());
        }
        FutureState::Failed(exc) => {
            let _ = write!(out, "finished exception={}", Value::Exception(exc.clone()).repr_plain());
        }
    }
    out
}

/// Resolves or rejects `out` with `outcome`. Exceptions that are not `Exception` subclasses
/// propagate to the task running the handler.
fn settle(out: &PyFuture, outcome: RunResult<Value>) -> RunResult<Value> {
    if out.done() {
        return Ok(Value::None);
    }
    match outcome {
        Ok(value) => out.set_result(value)?,
        Err(exc) if exc.is_instance(ExcType::Exception) => out.set_exception(exc)?,
        Err(exc) => return Err(exc),
    }
    Ok(Value::None)
}

/// `CancelledError(message)`, or a bare one without a message.
pub(crate) fn cancelled_error(message: Option<Value>) -> Exception {
    match message {
        Some(message) if !message.is_none() => Exception::new(ExcType::CancelledError, vec![message]),
        _ => ExcType::CancelledError.bare(),
    }
}

impl Drop for FutureInner {
    fn drop(&mut self) {
        if !self.log_traceback.get() {
            return;
        }
        let state = self.state.borrow();
        let FutureState::Failed(exc) = &*state else {
            return;
        };
        let Some(inner) = self.event_loop.upgrade() else {
            return;
        };
        let (message, subject) = match &self.task {
            Some(task) => ("Task exception was never retrieved", task.describe(&state)),
            None => ("Future exception was never retrieved", format!("<Future {}>", describe_state(&state))),
        };
        let mut context = Dict::new();
        context.set_str("message", Value::str(message));
        context.set_str("exception", Value::Exception(exc.clone()));
        context.set_str(if self.task.is_some() { "task" } else { "future" }, Value::str(subject));
        drop(state);
        WebLoop(inner).defer_report(context);
    }
}
