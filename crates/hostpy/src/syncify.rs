//! Blocking on loop work from synchronous code.
//!
//! A [`SyncifyableTask`] can be driven two ways: scheduled on the event loop and awaited like a
//! future, or driven by host callbacks while a [`Syncifier`] holds the current call stack with
//! [`Host::suspend_here`](crate::host::Host::suspend_here). `syncify()` is only available when
//! the embedder installed a syncifier with [`Runtime::set_syncifier`].

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use crate::{
    exception::{ExcType, RunResult},
    host::{SuspendReason, WakeToken},
    runtime::Runtime,
    value::Value,
    webloop::{FutureState, PyFuture, Task},
};

/// Work that can run either on the event loop or under a [`Syncifier`].
pub trait SyncifyableTask {
    /// Settles with the task's outcome in either mode.
    fn future(&self) -> PyFuture;

    /// Starts the task on the event loop. Calling it again does nothing.
    fn schedule_async(&self, rt: &Runtime) -> RunResult<()>;

    /// Starts the task in sync mode. Host callbacks that make progress signal `wake`.
    fn schedule_sync(&self, rt: &Runtime, wake: &WakeToken) -> RunResult<()>;

    /// True once the task has finished.
    fn poll(&self, _rt: &Runtime) -> RunResult<bool> {
        Ok(self.future().done())
    }
}

/// Blocks the current call stack until a [`SyncifyableTask`] finishes.
pub trait Syncifier {
    fn syncify_task(&self, rt: &Runtime, task: &dyn SyncifyableTask) -> RunResult<Value>;
}

/// Polls the task and suspends on the host between polls.
///
/// Each suspension lasts until a callback signals progress, or until the host has nothing left
/// to run, in which case the task can never finish and a `RuntimeError` is raised.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrivialSyncifier;

impl Syncifier for TrivialSyncifier {
    fn syncify_task(&self, rt: &Runtime, task: &dyn SyncifyableTask) -> RunResult<Value> {
        let wake = WakeToken::new();
        task.schedule_sync(rt, &wake)?;
        loop {
            if task.poll(rt)? {
                return task.future().result();
            }
            wake.reset();
            match rt.host().suspend_here(&wake, None) {
                SuspendReason::Woken => {}
                SuspendReason::TimedOut => {
                    if task.poll(rt)? {
                        return task.future().result();
                    }
                    return Err(ExcType::RuntimeError.msg("syncify: the host has no pending work that could finish the task"));
                }
                SuspendReason::Unsupported => {
                    return Err(ExcType::RuntimeError.msg("syncify: the host cannot suspend the current call stack"));
                }
            }
        }
    }
}

// ============================================================================
// Task kinds
// ============================================================================

/// Runs a coroutine, future or other awaitable as a loop task.
///
/// In sync mode the loop itself keeps running from host timers while the syncifier waits, so the
/// only sync-specific part is waking the syncifier when the task settles.
pub struct AwaitableTask {
    awaitable: RefCell<Option<Value>>,
    future: PyFuture,
}

impl AwaitableTask {
    #[must_use]
    pub fn new(rt: &Runtime, awaitable: Value) -> Self {
        Self {
            awaitable: RefCell::new(Some(awaitable)),
            future: rt.event_loop().create_future(),
        }
    }

    /// Schedules the awaitable the first time it is called.
    fn start(&self, rt: &Runtime) -> RunResult<()> {
        let Some(awaitable) = self.awaitable.borrow_mut().take() else {
            return Ok(());
        };
        let inner = match rt.event_loop().ensure_future(awaitable)? {
            Value::Future(future) => future,
            Value::Task(task) => task.future(),
            other => {
                return Err(ExcType::TypeError.msg(format!(
                    "ensure_future returned '{}'",
                    other.type_name()
                )));
            }
        };
        self.future.follow(&inner);
        Ok(())
    }
}

impl SyncifyableTask for AwaitableTask {
    fn future(&self) -> PyFuture {
        self.future.clone()
    }

    fn schedule_async(&self, rt: &Runtime) -> RunResult<()> {
        self.start(rt)
    }

    fn schedule_sync(&self, rt: &Runtime, wake: &WakeToken) -> RunResult<()> {
        self.start(rt)?;
        let wake = wake.clone();
        self.future.on_done(move |_, _| {
            wake.signal();
            Ok(())
        });
        Ok(())
    }
}

/// `syncify.sleep(delay)`: a timer that runs on the loop when awaited and directly on a host
/// timeout when syncified.
pub struct SleepTask {
    delay: f64,
    result: Value,
    future: PyFuture,
    started: Cell<bool>,
}

impl SleepTask {
    #[must_use]
    pub fn new(rt: &Runtime, delay: f64, result: Value) -> Self {
        Self {
            delay,
            result,
            future: rt.event_loop().create_future(),
            started: Cell::new(false),
        }
    }
}

impl SyncifyableTask for SleepTask {
    fn future(&self) -> PyFuture {
        self.future.clone()
    }

    fn schedule_async(&self, rt: &Runtime) -> RunResult<()> {
        if self.started.replace(true) {
            return Ok(());
        }
        let future = self.future.clone();
        let result = self.result.clone();
        rt.event_loop()
            .call_later_native(self.delay.max(0.0), "syncify.sleep()", move |_| {
                if !future.done() {
                    future.set_result(result)?;
                }
                Ok(())
            })
            .map(drop)
    }

    fn schedule_sync(&self, rt: &Runtime, wake: &WakeToken) -> RunResult<()> {
        if self.started.replace(true) {
            return Ok(());
        }
        let future = self.future.clone();
        let result = self.result.clone();
        let wake = wake.clone();
        rt.host().set_timeout(
            Box::new(move || {
                if !future.done() {
                    let _ = future.set_result(result);
                }
                wake.signal();
            }),
            self.delay.max(0.0) * 1000.0,
        );
        Ok(())
    }
}

/// Several syncifyable tasks run together; settles with the list of their results, or with the
/// first failure.
pub struct SyncifyableGather {
    tasks: Vec<Rc<dyn SyncifyableTask>>,
    future: PyFuture,
    started: Cell<bool>,
}

impl SyncifyableGather {
    #[must_use]
    pub fn new(rt: &Runtime, tasks: Vec<Rc<dyn SyncifyableTask>>) -> Self {
        Self {
            tasks,
            future: rt.event_loop().create_future(),
            started: Cell::new(false),
        }
    }

    fn collect(&self) -> RunResult<()> {
        if self.future.done() {
            return Ok(());
        }
        let mut results = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            match task.future().state() {
                FutureState::Pending => return Ok(()),
                FutureState::Finished(value) => results.push(value),
                FutureState::Failed(exc) => {
                    let _ = task.future().exception();
                    return self.future.set_exception(exc);
                }
                FutureState::Cancelled(message) => {
                    self.future.cancel(message);
                    return Ok(());
                }
            }
        }
        self.future.set_result(Value::list(results))
    }
}

impl SyncifyableTask for SyncifyableGather {
    fn future(&self) -> PyFuture {
        self.future.clone()
    }

    fn schedule_async(&self, rt: &Runtime) -> RunResult<()> {
        if self.started.replace(true) {
            return Ok(());
        }
        if self.tasks.is_empty() {
            return self.future.set_result(Value::list(Vec::new()));
        }
        for task in &self.tasks {
            task.schedule_async(rt)?;
        }
        let futures: Vec<_> = self.tasks.iter().map(|t| t.future()).collect();
        let remaining = Rc::new(Cell::new(futures.len()));
        for future in &futures {
            let remaining = remaining.clone();
            let out = self.future.clone();
            let tasks = futures.clone();
            future.on_done(move |_, done| {
                remaining.set(remaining.get() - 1);
                if out.done() {
                    return Ok(());
                }
                match done.state() {
                    FutureState::Failed(exc) => {
                        let _ = done.exception();
                        out.set_exception(exc)
                    }
                    FutureState::Cancelled(message) => {
                        out.cancel(message);
                        Ok(())
                    }
                    _ if remaining.get() == 0 => {
                        out.set_result(Value::list(tasks.iter().filter_map(|f| f.result().ok()).collect()))
                    }
                    _ => Ok(()),
                }
            });
        }
        Ok(())
    }

    fn schedule_sync(&self, rt: &Runtime, wake: &WakeToken) -> RunResult<()> {
        if self.started.replace(true) {
            return Ok(());
        }
        for task in &self.tasks {
            task.schedule_sync(rt, wake)?;
        }
        self.collect()
    }

    fn poll(&self, rt: &Runtime) -> RunResult<bool> {
        for task in &self.tasks {
            task.poll(rt)?;
        }
        self.collect()?;
        Ok(self.future.done())
    }
}

/// `syncify(awaitable)`: runs `awaitable` to completion from synchronous code.
pub fn syncify(rt: &Runtime, awaitable: Value) -> RunResult<Value> {
    let Some(syncifier) = rt.syncifier() else {
        return Err(ExcType::RuntimeError.msg("No syncifier installed: syncify() is unavailable on this host"));
    };
    if let Some(task) = Task::current() {
        if let Value::Task(target) = &awaitable {
            if target.identity() == task.identity() {
                return Err(ExcType::RuntimeError.msg("a task cannot syncify itself"));
            }
        }
    }
    match awaitable {
        Value::SyncTask(task) => syncifier.syncify_task(rt, task.as_ref()),
        other => syncifier.syncify_task(rt, &AwaitableTask::new(rt, other)),
    }
}
