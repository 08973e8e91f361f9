//! `WebLoop`: an asyncio event loop that never blocks the host thread.
//!
//! Work is queued as [`Handle`]s: a ready queue for `call_soon` and a min-heap of timers for
//! `call_later`. The loop runs in ticks, each one a zero-delay or delayed host timeout:
//!
//! 1. if `stop()` was requested, quiesce and return;
//! 2. run every handle that was ready when the tick started, in FIFO order;
//! 3. move timers that fell due into the ready queue;
//! 4. ask the host for another tick if anything is left, otherwise go idle.
//!
//! `run_until_complete` schedules its argument and returns at once. Nothing in this module
//! waits: results arrive through futures and done callbacks.

mod future;
mod lock;
pub(crate) mod methods;
mod task;
mod tracer;

use std::{
    cell::{Cell, RefCell},
    cmp::Ordering,
    collections::{BinaryHeap, VecDeque},
    rc::{Rc, Weak},
};

pub use future::{FutureState, PyFuture};
pub(crate) use future::cancelled_error;
pub use lock::AsyncLock;
pub use task::{FutureAwait, Task, YieldOnce};
pub use tracer::{LoopEvent, LoopTracer, NoopLoopTracer, RecordingLoopTracer, StderrLoopTracer};

use crate::{
    args::Args,
    builtins::is_callable,
    eval::await_value,
    exception::{ExcType, Exception, RunResult},
    host::TimerToken,
    runtime::{Runtime, RuntimeWeak},
    types::{AsyncGenerator, Coroutine, Dict, NativeFunction, WeakAsyncGenerator},
    value::Value,
};

/// Cancelled timers are purged from the heap once they outnumber live ones this many times.
const TIMER_REBUILD_RATIO: usize = 2;

pub(crate) type NativeCallback = Box<dyn FnOnce(&Runtime) -> RunResult<()>>;

enum Callback {
    Python { func: Value, args: Vec<Value> },
    Native(NativeCallback),
}

/// A scheduled callback, returned by `call_soon` (`Handle`) and `call_later` (`TimerHandle`).
#[derive(Clone)]
pub struct Handle(Rc<HandleInner>);

struct HandleInner {
    callback: RefCell<Option<Callback>>,
    label: String,
    /// Loop time the handle is due at; `None` for plain handles.
    when: Option<f64>,
    cancelled: Cell<bool>,
    /// True while the handle sits in the timer heap.
    scheduled: Cell<bool>,
    event_loop: Weak<LoopInner>,
}

impl Handle {
    fn new(event_loop: &WebLoop, callback: Callback, label: String, when: Option<f64>) -> Self {
        Self(Rc::new(HandleInner {
            callback: RefCell::new(Some(callback)),
            label,
            when,
            cancelled: Cell::new(false),
            scheduled: Cell::new(false),
            event_loop: Rc::downgrade(&event_loop.0),
        }))
    }

    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.0).cast::<()>() as usize
    }

    /// Due time of a timer handle, `None` for a plain handle.
    #[must_use]
    pub fn when(&self) -> Option<f64> {
        self.0.when
    }

    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.0.cancelled.get()
    }

    /// Cancels the callback. Idempotent.
    pub fn cancel(&self) {
        if self.0.cancelled.replace(true) {
            return;
        }
        let callback = self.0.callback.borrow_mut().take();
        drop(callback);
        if self.0.scheduled.get() {
            if let Some(inner) = self.0.event_loop.upgrade() {
                WebLoop(inner).timer_cancelled();
            }
        }
    }

    #[must_use]
    pub fn repr(&self) -> String {
        let kind = if self.0.when.is_some() { "TimerHandle" } else { "Handle" };
        let mut parts = vec![kind.to_owned()];
        if let Some(when) = self.0.when {
            parts.push(format!("when={when}"));
        }
        if self.cancelled() {
            parts.push("cancelled".to_owned());
        }
        parts.push(self.0.label.clone());
        format!("<{}>", parts.join(" "))
    }

    /// Runs the callback unless cancelled; errors go to the exception handler.
    fn run(&self, rt: &Runtime, event_loop: &WebLoop) {
        let callback = self.0.callback.borrow_mut().take();
        let result = match callback {
            None => return,
            Some(Callback::Python { func, args }) => rt.call(&func, Args::positional(args)).map(drop),
            Some(Callback::Native(func)) => func(rt),
        };
        if let Err(exc) = result {
            let mut context = exception_context(format!("Exception in callback {}", self.0.label), Some(exc));
            context.set_str("handle", Value::Handle(self.clone()));
            event_loop.call_exception_handler(rt, context);
        }
    }
}

struct TimerEntry {
    when: f64,
    seq: u64,
    handle: Handle,
}

// Reversed so `BinaryHeap` pops the earliest deadline, then the earliest insertion.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.when.total_cmp(&self.when).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TimerEntry {}

/// The event loop of a [`Runtime`]. Clones share the same loop.
#[derive(Clone)]
pub struct WebLoop(pub(crate) Rc<LoopInner>);

pub(crate) struct LoopInner {
    runtime: RuntimeWeak,
    ready: RefCell<VecDeque<Handle>>,
    timers: RefCell<BinaryHeap<TimerEntry>>,
    timer_seq: Cell<u64>,
    cancelled_timers: Cell<usize>,
    /// The pending host timeout that will run the next tick, with its deadline in loop time.
    tick: Cell<Option<(TimerToken, f64)>>,
    running: Cell<bool>,
    stopping: Cell<bool>,
    closed: Cell<bool>,
    debug: Cell<bool>,
    exception_handler: RefCell<Value>,
    task_factory: RefCell<Value>,
    tracer: RefCell<Rc<dyn LoopTracer>>,
    /// Live async generators first iterated while the loop's hooks were installed.
    asyncgens: RefCell<Vec<WeakAsyncGenerator>>,
    /// `aclose()` tasks started by the finalizer hook.
    finalizer_tasks: RefCell<Vec<Task>>,
    asyncgens_shutdown_called: Cell<bool>,
    /// Hooks that were installed before the loop put its own in place.
    saved_hooks: RefCell<Option<(Value, Value)>>,
    /// Unretrieved-exception reports queued from destructors, sent at the end of the next tick.
    deferred_reports: RefCell<Vec<Dict>>,
    tasks: RefCell<Vec<Weak<future::FutureInner>>>,
}

impl WebLoop {
    #[must_use]
    pub fn new(rt: &Runtime) -> Self {
        Self(Rc::new(LoopInner {
            runtime: rt.downgrade(),
            ready: RefCell::new(VecDeque::new()),
            timers: RefCell::new(BinaryHeap::new()),
            timer_seq: Cell::new(0),
            cancelled_timers: Cell::new(0),
            tick: Cell::new(None),
            running: Cell::new(false),
            stopping: Cell::new(false),
            closed: Cell::new(false),
            debug: Cell::new(false),
            exception_handler: RefCell::new(Value::None),
            task_factory: RefCell::new(Value::None),
            tracer: RefCell::new(Rc::new(NoopLoopTracer)),
            asyncgens: RefCell::new(Vec::new()),
            finalizer_tasks: RefCell::new(Vec::new()),
            asyncgens_shutdown_called: Cell::new(false),
            saved_hooks: RefCell::new(None),
            deferred_reports: RefCell::new(Vec::new()),
            tasks: RefCell::new(Vec::new()),
        }))
    }

    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.0).cast::<()>() as usize
    }

    #[must_use]
    pub fn repr(&self) -> String {
        let py_bool = |b: bool| if b { "True" } else { "False" };
        format!(
            "<WebLoop running={} closed={} debug={}>",
            py_bool(self.0.running.get()),
            py_bool(self.0.closed.get()),
            py_bool(self.0.debug.get())
        )
    }

    #[must_use]
    pub fn value(&self) -> Value {
        Value::Loop(self.clone())
    }

    fn runtime(&self) -> RunResult<Runtime> {
        self.0
            .runtime
            .upgrade()
            .ok_or_else(|| ExcType::RuntimeError.msg("the runtime owning this event loop is gone"))
    }

    /// Replaces the tracer; the default is [`NoopLoopTracer`].
    pub fn set_tracer(&self, tracer: Rc<dyn LoopTracer>) {
        *self.0.tracer.borrow_mut() = tracer;
    }

    fn tracer(&self) -> Rc<dyn LoopTracer> {
        self.0.tracer.borrow().clone()
    }

    pub(crate) fn trace_task_step(&self, name: &str, finished: bool) {
        self.tracer().on_task_step(name, finished);
    }

    /// Loop time in seconds, read from the host's monotonic clock.
    #[must_use]
    pub fn time(&self) -> f64 {
        self.0.runtime.upgrade().map_or(0.0, |rt| rt.host().now())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.0.running.get()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.closed.get()
    }

    #[must_use]
    pub fn get_debug(&self) -> bool {
        self.0.debug.get()
    }

    pub fn set_debug(&self, enabled: bool) {
        self.0.debug.set(enabled);
    }

    fn check_closed(&self) -> RunResult<()> {
        if self.0.closed.get() {
            return Err(ExcType::RuntimeError.msg("Event loop is closed"));
        }
        Ok(())
    }

    // ============================================================================
    // Scheduling
    // ============================================================================

    /// `loop.call_soon(callback, *args)`.
    pub fn call_soon(&self, func: Value, args: Vec<Value>) -> RunResult<Handle> {
        self.check_closed()?;
        Ok(self.push_python(func, args, None))
    }

    /// `loop.call_later(delay, callback, *args)`.
    pub fn call_later(&self, delay: f64, func: Value, args: Vec<Value>) -> RunResult<Handle> {
        self.check_closed()?;
        check_delay(delay)?;
        Ok(self.push_python(func, args, Some(self.time() + delay)))
    }

    /// `loop.call_at(when, callback, *args)`.
    pub fn call_at(&self, when: f64, func: Value, args: Vec<Value>) -> RunResult<Handle> {
        self.call_later(when - self.time(), func, args)
    }

    /// Schedules a Rust callback after `delay` seconds.
    pub fn call_later_native(
        &self,
        delay: f64,
        label: &str,
        callback: impl FnOnce(&Runtime) -> RunResult<()> + 'static,
    ) -> RunResult<Handle> {
        self.check_closed()?;
        check_delay(delay)?;
        let handle = Handle::new(
            self,
            Callback::Native(Box::new(callback)),
            label.to_owned(),
            Some(self.time() + delay),
        );
        self.push_timer(handle.clone());
        Ok(handle)
    }

    pub(crate) fn push_python(&self, func: Value, args: Vec<Value>, when: Option<f64>) -> Handle {
        let rendered: Vec<String> = args.iter().map(Value::repr_plain).collect();
        let label = format!("{}({})", describe_callable(&func), rendered.join(", "));
        let handle = Handle::new(self, Callback::Python { func, args }, label, when);
        match when {
            Some(_) => self.push_timer(handle.clone()),
            None => self.push_ready(handle.clone()),
        }
        handle
    }

    pub(crate) fn push_native(&self, label: &str, callback: NativeCallback) -> Handle {
        let handle = Handle::new(self, Callback::Native(callback), label.to_owned(), None);
        self.push_ready(handle.clone());
        handle
    }

    fn push_ready(&self, handle: Handle) {
        self.0.ready.borrow_mut().push_back(handle);
        self.ensure_tick(0.0);
    }

    fn push_timer(&self, handle: Handle) {
        let Some(when) = handle.when() else {
            return self.push_ready(handle);
        };
        let seq = self.0.timer_seq.get();
        self.0.timer_seq.set(seq + 1);
        handle.0.scheduled.set(true);
        self.0.timers.borrow_mut().push(TimerEntry { when, seq, handle });
        self.tracer().on_timer_scheduled(when);
        self.ensure_tick(((when - self.time()) * 1000.0).max(0.0));
    }

    fn timer_cancelled(&self) {
        let cancelled = self.0.cancelled_timers.get() + 1;
        self.0.cancelled_timers.set(cancelled);
        let total = self.0.timers.borrow().len();
        let live = total.saturating_sub(cancelled);
        if cancelled > TIMER_REBUILD_RATIO * live {
            let entries = std::mem::take(&mut *self.0.timers.borrow_mut());
            let (keep, dropped): (Vec<_>, Vec<_>) = entries.into_iter().partition(|e| !e.handle.cancelled());
            for entry in &dropped {
                entry.handle.0.scheduled.set(false);
            }
            *self.0.timers.borrow_mut() = keep.into_iter().collect();
            self.0.cancelled_timers.set(0);
            drop(dropped);
        }
    }

    /// Entries in the timer heap, counting cancelled timers that have not been purged yet.
    #[must_use]
    pub fn scheduled_timer_count(&self) -> usize {
        self.0.timers.borrow().len()
    }

    /// Makes sure a host timeout runs a tick within `delay_ms`.
    fn ensure_tick(&self, delay_ms: f64) {
        if self.0.closed.get() {
            return;
        }
        let Some(rt) = self.0.runtime.upgrade() else {
            return;
        };
        let host = rt.host().clone();
        let deadline = host.now() + delay_ms / 1000.0;
        if let Some((token, existing)) = self.0.tick.get() {
            if existing <= deadline {
                return;
            }
            host.clear_timeout(token);
        }
        let weak = Rc::downgrade(&self.0);
        let token = host.set_timeout(
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    WebLoop(inner).tick();
                }
            }),
            delay_ms,
        );
        self.0.tick.set(Some((token, deadline)));
    }

    /// One turn of the loop, run from a host timeout.
    fn tick(&self) {
        self.0.tick.set(None);
        let Some(rt) = self.0.runtime.upgrade() else {
            return;
        };
        if self.0.stopping.replace(false) {
            self.0.running.set(false);
            return;
        }
        let tracer = self.tracer();
        let pending = self.0.ready.borrow().len();
        tracer.on_tick_start(pending);
        let mut ran = 0;
        for _ in 0..pending {
            let Some(handle) = self.0.ready.borrow_mut().pop_front() else {
                break;
            };
            if handle.cancelled() {
                continue;
            }
            tracer.on_handle_run(&handle.repr());
            handle.run(&rt, self);
            ran += 1;
        }
        let now = rt.host().now();
        loop {
            let due = {
                let mut timers = self.0.timers.borrow_mut();
                match timers.peek() {
                    Some(top) if top.handle.cancelled() || top.when <= now => timers.pop(),
                    _ => None,
                }
            };
            let Some(entry) = due else {
                break;
            };
            entry.handle.0.scheduled.set(false);
            if entry.handle.cancelled() {
                let cancelled = self.0.cancelled_timers.get();
                self.0.cancelled_timers.set(cancelled.saturating_sub(1));
            } else {
                self.0.ready.borrow_mut().push_back(entry.handle);
            }
        }
        self.flush_reports(&rt);
        let next_delay = self.next_tick_delay(now);
        if let Some(delay) = next_delay {
            self.ensure_tick(delay);
        }
        tracer.on_tick_end(ran, next_delay);
    }

    // ============================================================================
    // Futures and tasks
    // ============================================================================

    /// `loop.create_future()`.
    #[must_use]
    pub fn create_future(&self) -> PyFuture {
        PyFuture::new(self, None)
    }

    /// `loop.create_task(coro, name=None)`, honouring the task factory.
    pub fn create_task(&self, coro: Value, name: Option<String>) -> RunResult<Task> {
        self.check_closed()?;
        let rt = self.runtime()?;
        self.install_hooks(&rt);
        let factory = self.0.task_factory.borrow().clone();
        if factory.is_none() {
            return Task::spawn(self, &rt, coro, name);
        }
        match rt.call(&factory, Args::two(self.value(), coro))? {
            Value::Task(task) => {
                if let Some(name) = name {
                    task.set_name(name);
                }
                Ok(task)
            }
            other => Err(ExcType::TypeError.msg(format!(
                "task factory must return a Task, got {}",
                other.type_name()
            ))),
        }
    }

    fn register_task(&self, task: &Task) {
        let mut tasks = self.0.tasks.borrow_mut();
        tasks.retain(|t| t.strong_count() > 0);
        tasks.push(Rc::downgrade(&task.0.0));
    }

    /// Tasks of this loop that are not done yet.
    #[must_use]
    pub fn all_tasks(&self) -> Vec<Task> {
        self.0
            .tasks
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| Task(PyFuture(inner)))
            .filter(|task| !task.done())
            .collect()
    }

    /// `asyncio.ensure_future(obj)`: coroutines become tasks, futures pass through, other
    /// awaitables are wrapped.
    pub fn ensure_future(&self, obj: Value) -> RunResult<Value> {
        let rt = self.runtime()?;
        match obj {
            Value::Future(_) | Value::Task(_) => Ok(obj),
            Value::Coroutine(_) => self.create_task(obj, None).map(Value::Task),
            Value::SyncTask(task) => {
                task.schedule_async(&rt)?;
                Ok(Value::Future(task.future()))
            }
            other if is_awaitable(&rt, &other) => {
                let runtime = rt.clone();
                let wrapper = Coroutine::from_future("_wrap_awaitable", async move {
                    await_value(&runtime, other).await
                });
                self.create_task(Value::Coroutine(wrapper), None).map(Value::Task)
            }
            _ => Err(ExcType::TypeError.msg("An asyncio.Future, a coroutine or an awaitable is required")),
        }
    }

    /// `asyncio.gather(*children)`: a future settled with the list of results in argument
    /// order. Cancelling it cancels every child still running.
    ///
    /// Without `return_exceptions` the first failure or cancellation of a child settles the
    /// result at once; otherwise failures take their place in the list.
    #[must_use]
    pub fn gather(&self, children: Vec<PyFuture>, return_exceptions: bool) -> PyFuture {
        let outer = self.create_future();
        if children.is_empty() {
            let _ = outer.set_result(Value::list(Vec::new()));
            return outer;
        }
        let remaining = Rc::new(Cell::new(children.len()));
        for child in &children {
            outer.link(child.clone());
            let outer = outer.clone();
            let all = children.clone();
            let remaining = remaining.clone();
            child.on_done(move |_, done| {
                remaining.set(remaining.get() - 1);
                if outer.done() {
                    if !done.cancelled() {
                        let _ = done.exception();
                    }
                    return Ok(());
                }
                if !return_exceptions {
                    match done.state() {
                        FutureState::Cancelled(message) => return outer.set_exception(cancelled_error(message)),
                        FutureState::Failed(exc) => {
                            let _ = done.exception();
                            return outer.set_exception(exc);
                        }
                        _ => {}
                    }
                }
                if remaining.get() > 0 {
                    return Ok(());
                }
                let results = all
                    .iter()
                    .map(|child| match child.state() {
                        FutureState::Finished(value) => value,
                        FutureState::Failed(exc) => {
                            let _ = child.exception();
                            Value::Exception(exc)
                        }
                        FutureState::Cancelled(message) => Value::Exception(cancelled_error(message)),
                        FutureState::Pending => Value::None,
                    })
                    .collect();
                outer.set_result(Value::list(results))
            });
        }
        outer
    }

    /// `loop.run_in_executor(executor, func, *args)`: runs `func` right away and returns a
    /// future holding its outcome.
    pub fn run_in_executor(&self, func: &Value, args: Vec<Value>) -> RunResult<PyFuture> {
        let rt = self.runtime()?;
        let future = self.create_future();
        match rt.call(func, Args::positional(args)) {
            Ok(value) => future.set_result(value)?,
            Err(exc) => future.set_exception(exc)?,
        }
        Ok(future)
    }

    // ============================================================================
    // Running and stopping
    // ============================================================================

    /// Schedules `awaitable` and marks the loop running. Does not block: the returned future
    /// completes as the host drives the loop.
    pub fn run_until_complete(&self, awaitable: Value) -> RunResult<Value> {
        self.check_closed()?;
        let future = self.ensure_future(awaitable)?;
        self.start()?;
        Ok(future)
    }

    /// Marks the loop running. A no-op if it already is.
    pub fn run_forever(&self) -> RunResult<()> {
        self.check_closed()?;
        self.start()
    }

    fn start(&self) -> RunResult<()> {
        let rt = self.runtime()?;
        self.0.stopping.set(false);
        self.install_hooks(&rt);
        if !self.0.running.replace(true) {
            self.resume_ticks();
        }
        Ok(())
    }

    /// Milliseconds until the next tick is needed, `None` when nothing is waiting.
    fn next_tick_delay(&self, now: f64) -> Option<f64> {
        if !self.0.ready.borrow().is_empty() {
            return Some(0.0);
        }
        self.0
            .timers
            .borrow()
            .peek()
            .map(|top| ((top.when - now) * 1000.0).max(0.0))
    }

    /// Asks the host for a tick if callbacks or timers are waiting. A tick that quiesced after
    /// `stop()` left them without one.
    fn resume_ticks(&self) {
        if let Some(delay) = self.next_tick_delay(self.time()) {
            self.ensure_tick(delay);
        }
    }

    /// Asks the next tick to quiesce.
    pub fn stop(&self) {
        self.0.stopping.set(true);
        self.ensure_tick(0.0);
    }

    /// Closes the loop, dropping queued callbacks.
    pub fn close(&self) -> RunResult<()> {
        if self.0.running.get() && !self.0.stopping.get() {
            return Err(ExcType::RuntimeError.msg("Cannot close a running event loop"));
        }
        if self.0.closed.replace(true) {
            return Ok(());
        }
        let rt = self.runtime()?;
        self.0.running.set(false);
        if let Some((token, _)) = self.0.tick.take() {
            rt.host().clear_timeout(token);
        }
        let ready = std::mem::take(&mut *self.0.ready.borrow_mut());
        let timers = std::mem::take(&mut *self.0.timers.borrow_mut());
        for entry in &timers {
            entry.handle.0.scheduled.set(false);
        }
        self.0.cancelled_timers.set(0);
        drop(ready);
        drop(timers);
        let live = self.asyncgen_count();
        if live > 0 {
            rt.warn(
                ExcType::ResourceWarning,
                format!(
                    "loop is closed with {live} unclosed asynchronous generator{}; call loop.shutdown_asyncgens() first",
                    if live == 1 { "" } else { "s" }
                ),
            )?;
        }
        self.restore_hooks(&rt);
        Ok(())
    }

    // ============================================================================
    // Exception handling
    // ============================================================================

    /// `loop.set_exception_handler(handler)`; `None` restores the default handler.
    pub fn set_exception_handler(&self, handler: Value) -> RunResult<()> {
        if !handler.is_none() && !is_callable(&handler) {
            return Err(ExcType::TypeError.msg(format!(
                "A callable object or None is expected, got {}",
                handler.repr_plain()
            )));
        }
        let old = self.0.exception_handler.replace(handler);
        drop(old);
        Ok(())
    }

    #[must_use]
    pub fn get_exception_handler(&self) -> Value {
        self.0.exception_handler.borrow().clone()
    }

    pub fn set_task_factory(&self, factory: Value) -> RunResult<()> {
        if !factory.is_none() && !is_callable(&factory) {
            return Err(ExcType::TypeError.msg("task factory must be a callable or None"));
        }
        let old = self.0.task_factory.replace(factory);
        drop(old);
        Ok(())
    }

    #[must_use]
    pub fn get_task_factory(&self) -> Value {
        self.0.task_factory.borrow().clone()
    }

    /// Formats `context` like asyncio's default handler and writes it to the host console.
    pub fn default_exception_handler(&self, rt: &Runtime, context: &Dict) -> RunResult<()> {
        let message = context
            .get_str("message")
            .filter(|m| !m.is_none())
            .map(|m| m.str_plain())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "Unhandled exception in event loop".to_owned());
        let mut lines = vec![message];
        let mut keys = context.str_keys();
        keys.sort();
        for key in keys {
            if matches!(&*key, "message" | "exception") {
                continue;
            }
            let Some(value) = context.get_str(&key) else {
                continue;
            };
            if &*key == "source_traceback" {
                lines.push(format!("Object created at (most recent call last):\n{}", format_stack(&value)));
                continue;
            }
            let rendered = rt.repr(&value).unwrap_or_else(|_| value.repr_plain());
            lines.push(format!("{key}: {rendered}"));
        }
        let mut text = lines.join("\n");
        if let Some(Value::Exception(exc)) = context.get_str("exception") {
            text.push('\n');
            text.push_str(exc.format_traceback(None).trim_end());
        }
        rt.host().console_log(&text);
        Ok(())
    }

    /// Passes `context` to the installed exception handler, falling back to the default one.
    pub fn call_exception_handler(&self, rt: &Runtime, mut context: Dict) {
        if self.0.debug.get() {
            if !context.contains_str("task") {
                if let Some(task) = Task::current() {
                    context.set_str("task", Value::Task(task));
                }
            }
            if !context.contains_str("source_traceback") {
                let frames = rt
                    .stack_summary()
                    .into_iter()
                    .map(|(file, line, name)| {
                        Value::tuple(vec![Value::Str(file), Value::Int(i64::from(line)), Value::Str(name)])
                    })
                    .collect();
                context.set_str("source_traceback", Value::list(frames));
            }
        }
        let message = context.get_str("message").map(|m| m.str_plain()).unwrap_or_default();
        self.tracer().on_exception_context(&message);
        let handler = self.get_exception_handler();
        if handler.is_none() {
            if let Err(exc) = self.default_exception_handler(rt, &context) {
                rt.host().console_log(&format!(
                    "Exception in default exception handler\n{}",
                    exc.format_traceback(None)
                ));
            }
            return;
        }
        let context = Value::dict(context);
        if let Err(exc) = rt.call(&handler, Args::two(self.value(), context.clone())) {
            let mut fallback = exception_context("Unhandled error in exception handler", Some(exc));
            fallback.set_str("context", context);
            if let Err(exc) = self.default_exception_handler(rt, &fallback) {
                rt.host().console_log(&format!(
                    "Exception in default exception handler while handling an unexpected error in custom exception handler\n{}",
                    exc.format_traceback(None)
                ));
            }
        }
    }

    /// Queues a report from a destructor; it is delivered at the end of the next tick.
    fn defer_report(&self, context: Dict) {
        self.0.deferred_reports.borrow_mut().push(context);
        self.ensure_tick(0.0);
    }

    fn flush_reports(&self, rt: &Runtime) {
        loop {
            let reports = std::mem::take(&mut *self.0.deferred_reports.borrow_mut());
            if reports.is_empty() {
                return;
            }
            for context in reports {
                self.call_exception_handler(rt, context);
            }
        }
    }

    // ============================================================================
    // Async generators
    // ============================================================================

    /// Installs the loop's `firstiter` / `finalizer` hooks, remembering the previous ones.
    fn install_hooks(&self, rt: &Runtime) {
        if self.0.saved_hooks.borrow().is_some() || self.0.closed.get() {
            return;
        }
        *self.0.saved_hooks.borrow_mut() = Some(rt.asyncgen_hooks());
        let firstiter = {
            let weak = Rc::downgrade(&self.0);
            NativeFunction::value("_asyncgen_firstiter_hook", move |rt, args| {
                let agen = args.get_one_arg("_asyncgen_firstiter_hook")?;
                if let Some(inner) = weak.upgrade() {
                    WebLoop(inner).asyncgen_firstiter(rt, &agen)?;
                }
                Ok(Value::None)
            })
        };
        let finalizer = {
            let weak = Rc::downgrade(&self.0);
            NativeFunction::value("_asyncgen_finalizer_hook", move |rt, args| {
                let agen = args.get_one_arg("_asyncgen_finalizer_hook")?;
                if let Some(inner) = weak.upgrade() {
                    WebLoop(inner).asyncgen_finalizer(rt, agen)?;
                }
                Ok(Value::None)
            })
        };
        rt.set_asyncgen_hooks(firstiter, finalizer);
    }

    /// Puts back the hooks that were active before [`WebLoop::install_hooks`].
    fn restore_hooks(&self, rt: &Runtime) {
        let saved = self.0.saved_hooks.borrow_mut().take();
        if let Some((firstiter, finalizer)) = saved {
            rt.set_asyncgen_hooks(firstiter, finalizer);
        }
    }

    fn asyncgen_firstiter(&self, rt: &Runtime, agen: &Value) -> RunResult<()> {
        let Value::AsyncGenerator(generator) = agen else {
            return Err(ExcType::TypeError.msg("firstiter hook expects an async generator"));
        };
        if self.0.asyncgens_shutdown_called.get() {
            rt.warn(
                ExcType::ResourceWarning,
                format!(
                    "asynchronous generator {} was scheduled after loop.shutdown_asyncgens() call",
                    agen.repr_plain()
                ),
            )?;
        }
        let mut asyncgens = self.0.asyncgens.borrow_mut();
        asyncgens.retain(WeakAsyncGenerator::is_alive);
        asyncgens.push(generator.downgrade());
        Ok(())
    }

    fn asyncgen_finalizer(&self, rt: &Runtime, agen: Value) -> RunResult<()> {
        let Value::AsyncGenerator(generator) = &agen else {
            return Err(ExcType::TypeError.msg("finalizer hook expects an async generator"));
        };
        self.0
            .asyncgens
            .borrow_mut()
            .retain(|w| w.is_alive() && !w.refers_to(generator));
        if self.0.closed.get() {
            return Ok(());
        }
        let closer = generator.aclose()?;
        let task = self.create_task(Value::Coroutine(closer), None)?;
        let label = agen.repr_plain();
        task.future().on_done(move |rt, future| {
            if let FutureState::Failed(exc) = future.state() {
                let _ = future.exception();
                let mut context = exception_context(
                    format!("an error occurred during closing of asynchronous generator {label}"),
                    Some(exc),
                );
                context.set_str("asyncgen", agen);
                rt.event_loop().call_exception_handler(rt, context);
            }
            Ok(())
        });
        let mut tasks = self.0.finalizer_tasks.borrow_mut();
        tasks.retain(|t| !t.done());
        tasks.push(task);
        Ok(())
    }

    /// Number of tracked async generators that are still alive.
    #[must_use]
    pub fn asyncgen_count(&self) -> usize {
        self.0.asyncgens.borrow().iter().filter(|w| w.is_alive()).count()
    }

    /// `loop.shutdown_asyncgens(timeout=None)`: a coroutine that closes every tracked
    /// generator, waits for finalizer-started closes and restores the previous hooks.
    #[must_use]
    pub fn shutdown_asyncgens(&self, timeout: Option<f64>) -> Coroutine {
        let event_loop = self.clone();
        Coroutine::from_future("WebLoop.shutdown_asyncgens", async move {
            let rt = event_loop.runtime()?;
            if event_loop.0.asyncgens_shutdown_called.replace(true) {
                event_loop.restore_hooks(&rt);
                return Ok(Value::None);
            }
            let outcome = event_loop.close_asyncgens(&rt, timeout).await;
            event_loop.restore_hooks(&rt);
            outcome.map(|()| Value::None)
        })
    }

    async fn close_asyncgens(&self, rt: &Runtime, timeout: Option<f64>) -> RunResult<()> {
        let tracked: Vec<AsyncGenerator> = std::mem::take(&mut *self.0.asyncgens.borrow_mut())
            .iter()
            .filter_map(WeakAsyncGenerator::upgrade)
            .collect();
        let mut closers = Vec::new();
        for generator in tracked {
            let agen = Value::AsyncGenerator(generator.clone());
            match generator
                .aclose()
                .and_then(|closer| self.create_task(Value::Coroutine(closer), None))
            {
                Ok(task) => closers.push((agen, task)),
                Err(exc) => self.report_close_error(rt, agen, exc),
            }
        }
        let finalizers = std::mem::take(&mut *self.0.finalizer_tasks.borrow_mut());
        let pending: Vec<PyFuture> = closers
            .iter()
            .map(|(_, task)| task.future())
            .chain(finalizers.iter().map(Task::future))
            .filter(|f| !f.done())
            .collect();
        if !pending.is_empty() {
            let all_done = self.create_future();
            let remaining = Rc::new(Cell::new(pending.len()));
            for future in &pending {
                let remaining = remaining.clone();
                let all_done = all_done.clone();
                future.on_done(move |_, _| {
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 && !all_done.done() {
                        all_done.set_result(Value::None)?;
                    }
                    Ok(())
                });
            }
            let timer = match timeout {
                Some(secs) => {
                    let all_done = all_done.clone();
                    Some(self.call_later_native(secs, "shutdown_asyncgens.timeout()", move |_| {
                        if !all_done.done() {
                            all_done.set_result(Value::None)?;
                        }
                        Ok(())
                    })?)
                }
                None => None,
            };
            let waited = FutureAwait::new(all_done).await;
            if let Some(timer) = timer {
                timer.cancel();
            }
            waited?;
        }
        for (agen, task) in closers {
            let future = task.future();
            match future.state() {
                FutureState::Pending => {
                    future.cancel(None);
                    let mut context = exception_context(
                        format!(
                            "asynchronous generator {} was not closed within the {}s timeout",
                            agen.repr_plain(),
                            timeout.unwrap_or_default()
                        ),
                        None,
                    );
                    context.set_str("asyncgen", agen);
                    self.call_exception_handler(rt, context);
                }
                FutureState::Failed(exc) => {
                    let _ = future.exception();
                    self.report_close_error(rt, agen, exc);
                }
                FutureState::Finished(_) | FutureState::Cancelled(_) => {}
            }
        }
        for task in finalizers.into_iter().filter(|t| !t.done()) {
            task.cancel(None);
            let mut context = exception_context(
                format!("asynchronous generator finalizer {} did not finish in time", task.repr()),
                None,
            );
            context.set_str("task", Value::Task(task));
            self.call_exception_handler(rt, context);
        }
        Ok(())
    }

    fn report_close_error(&self, rt: &Runtime, agen: Value, exc: Exception) {
        let mut context = exception_context(
            format!("an error occurred during closing of asynchronous generator {}", agen.repr_plain()),
            Some(exc),
        );
        context.set_str("asyncgen", agen);
        self.call_exception_handler(rt, context);
    }
}

/// An exception-handler context with `message` and, when given, `exception`.
#[must_use]
pub fn exception_context(message: impl Into<String>, exception: Option<Exception>) -> Dict {
    let mut context = Dict::new();
    context.set_str("message", Value::str(message.into()));
    if let Some(exc) = exception {
        context.set_str("exception", Value::Exception(exc));
    }
    context
}

/// True for objects `await` accepts.
pub(crate) fn is_awaitable(rt: &Runtime, value: &Value) -> bool {
    match value {
        Value::Coroutine(_) | Value::Future(_) | Value::Task(_) | Value::SyncTask(_) => true,
        other => rt.lookup_special(other, "__await__").is_some(),
    }
}

/// Reads a delay or timeout given in seconds.
pub(crate) fn seconds(value: &Value, what: &str) -> RunResult<f64> {
    value.as_float().ok_or_else(|| {
        ExcType::TypeError.msg(format!(
            "{what} must be a number, not '{}'",
            value.type_name()
        ))
    })
}

fn check_delay(delay: f64) -> RunResult<()> {
    if delay < 0.0 || delay.is_nan() {
        return Err(ExcType::ValueError.msg("Can't schedule in the past"));
    }
    Ok(())
}

fn describe_callable(func: &Value) -> String {
    match func {
        Value::Function(f) => f.def.qualname.to_string(),
        Value::Native(n) => n.name.to_string(),
        Value::BoundMethod(m) => m.func_name(),
        Value::BuiltinMethod(m) => format!("{}.{}", m.receiver.type_name(), m.name),
        other => other.repr_plain(),
    }
}

/// Renders a `[(file, line, name), ...]` list like `traceback.format_list`.
fn format_stack(frames: &Value) -> String {
    let Value::List(frames) = frames else {
        return frames.repr_plain();
    };
    let mut out = String::new();
    for frame in frames.borrow().iter() {
        if let Value::Tuple(parts) = frame {
            if let [file, line, name] = &parts[..] {
                out.push_str(&format!(
                    "  File \"{}\", line {}, in {}\n",
                    file.str_plain(),
                    line.repr_plain(),
                    name.str_plain()
                ));
            }
        }
    }
    out.trim_end().to_owned()
}
