//! Implementation of the `asyncio` module.
//!
//! Everything runs on the runtime's [`WebLoop`]:
//! - `sleep(delay, result=None)`, `wait_for(aw, timeout)`
//! - `create_task(coro, *, name=None)`, `ensure_future(obj)`, `gather(*aws, return_exceptions=False)`
//! - `get_event_loop()`, `get_running_loop()`, `current_task()`, `all_tasks()`
//! - `iscoroutine(obj)`
//! - `Future`, `Task`, `Lock`, plus `Event` and `Queue` written in Python
//! - `CancelledError`, `TimeoutError`, `InvalidStateError`, `QueueEmpty`, `QueueFull`

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use crate::{
    args::Args,
    eval::await_value,
    exception::{ExcType, RunResult},
    methods::bind_params,
    modules::{add_function, exec_source},
    runtime::Runtime,
    types::{Coroutine, Dict, ModuleObj},
    value::{Type, Value},
    webloop::{FutureAwait, PyFuture, Task, YieldOnce, seconds},
};

/// `Event` and `Queue`, built on loop futures.
const PRELUDE: &str = r#"
class QueueEmpty(Exception):
    pass


class QueueFull(Exception):
    pass


class Event:
    def __init__(self):
        self._value = False
        self._waiters = []

    def __repr__(self):
        state = "set" if self._value else "unset"
        return f"<asyncio.Event [{state}]>"

    def is_set(self):
        return self._value

    def set(self):
        if not self._value:
            self._value = True
            for waiter in self._waiters:
                if not waiter.done():
                    waiter.set_result(True)

    def clear(self):
        self._value = False

    async def wait(self):
        if self._value:
            return True
        waiter = get_running_loop().create_future()
        self._waiters.append(waiter)
        try:
            await waiter
            return True
        finally:
            self._waiters.remove(waiter)


class Queue:
    def __init__(self, maxsize=0):
        self.maxsize = maxsize
        self._items = []
        self._getters = []
        self._putters = []
        self._unfinished_tasks = 0
        self._finished = Event()
        self._finished.set()

    def __repr__(self):
        return f"<asyncio.Queue maxsize={self.maxsize} qsize={len(self._items)}>"

    def qsize(self):
        return len(self._items)

    def empty(self):
        return not self._items

    def full(self):
        return 0 < self.maxsize <= len(self._items)

    def _wake_next(self, waiters):
        while waiters:
            waiter = waiters.pop(0)
            if not waiter.done():
                waiter.set_result(None)
                break

    async def put(self, item):
        while self.full():
            putter = get_running_loop().create_future()
            self._putters.append(putter)
            try:
                await putter
            except BaseException:
                if putter in self._putters:
                    self._putters.remove(putter)
                if not self.full() and not putter.cancelled():
                    self._wake_next(self._putters)
                raise
        self.put_nowait(item)

    def put_nowait(self, item):
        if self.full():
            raise QueueFull
        self._items.append(item)
        self._unfinished_tasks += 1
        self._finished.clear()
        self._wake_next(self._getters)

    async def get(self):
        while self.empty():
            getter = get_running_loop().create_future()
            self._getters.append(getter)
            try:
                await getter
            except BaseException:
                if getter in self._getters:
                    self._getters.remove(getter)
                if not self.empty() and not getter.cancelled():
                    self._wake_next(self._getters)
                raise
        return self.get_nowait()

    def get_nowait(self):
        if self.empty():
            raise QueueEmpty
        item = self._items.pop(0)
        self._wake_next(self._putters)
        return item

    def task_done(self):
        if self._unfinished_tasks <= 0:
            raise ValueError("task_done() called too many times")
        self._unfinished_tasks -= 1
        if self._unfinished_tasks == 0:
            self._finished.set()

    async def join(self):
        if self._unfinished_tasks > 0:
            await self._finished.wait()
"#;

pub(crate) fn create(rt: &Runtime) -> RunResult<ModuleObj> {
    let module = ModuleObj::new("asyncio");
    add_function(&module, "sleep", sleep);
    add_function(&module, "wait_for", wait_for);
    add_function(&module, "create_task", create_task);
    add_function(&module, "ensure_future", |rt, args| {
        let obj = args.get_one_arg("ensure_future")?;
        rt.event_loop().ensure_future(obj)
    });
    add_function(&module, "gather", gather);
    add_function(&module, "get_event_loop", |rt, args| {
        args.check_zero_args("get_event_loop")?;
        Ok(rt.event_loop().value())
    });
    add_function(&module, "get_running_loop", |rt, args| {
        args.check_zero_args("get_running_loop")?;
        let event_loop = rt.event_loop();
        if Task::current().is_none() && !event_loop.is_running() {
            return Err(ExcType::RuntimeError.msg("no running event loop"));
        }
        Ok(event_loop.value())
    });
    add_function(&module, "current_task", |_, args| {
        args.check_zero_args("current_task")?;
        Ok(Task::current().map_or(Value::None, Value::Task))
    });
    add_function(&module, "all_tasks", |rt, args| {
        args.check_zero_args("all_tasks")?;
        Ok(Value::list(rt.event_loop().all_tasks().into_iter().map(Value::Task).collect()))
    });
    add_function(&module, "iscoroutine", |_, args| {
        let obj = args.get_one_arg("iscoroutine")?;
        Ok(Value::Bool(matches!(obj, Value::Coroutine(_))))
    });

    module.set("Future", Value::Type(Type::Future));
    module.set("Task", Value::Type(Type::Task));
    module.set("Lock", Value::Type(Type::Lock));
    for exc_type in [ExcType::CancelledError, ExcType::TimeoutError, ExcType::InvalidStateError] {
        let name: &'static str = exc_type.into();
        module.set(name, Value::Type(Type::Exc(exc_type)));
    }

    let globals = Rc::new(RefCell::new(Dict::new()));
    {
        let mut globals = globals.borrow_mut();
        globals.set_str("__name__", Value::str("asyncio"));
        for name in module.names() {
            if let Some(value) = module.get(&name) {
                globals.set_str(name.clone(), value);
            }
        }
    }
    exec_source(rt, &module, PRELUDE, &globals)?;
    Ok(module)
}

/// Reads a loop future out of the value `ensure_future` returned.
pub(crate) fn future_of(value: &Value) -> RunResult<PyFuture> {
    match value {
        Value::Future(future) => Ok(future.clone()),
        Value::Task(task) => Ok(task.future()),
        other => Err(ExcType::TypeError.msg(format!(
            "expected a Future, got '{}'",
            other.type_name()
        ))),
    }
}

/// `asyncio.sleep(delay, result=None)`.
fn sleep(rt: &Runtime, args: Args) -> RunResult<Value> {
    let mut bound = bind_params(args, "sleep", &["delay", "result"], 1)?.into_iter();
    let delay = seconds(&bound.next().flatten().unwrap_or(Value::None), "delay")?;
    let result = bound.next().flatten().unwrap_or(Value::None);
    let runtime = rt.clone();
    let body = async move {
        if delay <= 0.0 {
            YieldOnce::default().await?;
            return Ok(result);
        }
        let event_loop = runtime.event_loop();
        let future = event_loop.create_future();
        let waiter = future.clone();
        let handle = event_loop.call_later_native(delay, "sleep()", move |_| {
            if !waiter.done() {
                waiter.set_result(result)?;
            }
            Ok(())
        })?;
        let outcome = FutureAwait::new(future).await;
        handle.cancel();
        outcome
    };
    Ok(Value::Coroutine(Coroutine::from_future("sleep", body)))
}

/// `asyncio.wait_for(aw, timeout)`: cancels `aw` and raises `TimeoutError` once `timeout`
/// seconds pass. A `None` timeout waits indefinitely.
fn wait_for(rt: &Runtime, args: Args) -> RunResult<Value> {
    let mut bound = bind_params(args, "wait_for", &["fut", "timeout"], 2)?.into_iter();
    let awaitable = bound.next().flatten().unwrap_or(Value::None);
    let timeout = match bound.next().flatten() {
        None | Some(Value::None) => None,
        Some(value) => Some(seconds(&value, "timeout")?),
    };
    let runtime = rt.clone();
    let body = async move {
        let Some(timeout) = timeout else {
            return await_value(&runtime, awaitable).await;
        };
        let event_loop = runtime.event_loop();
        let future = future_of(&event_loop.ensure_future(awaitable)?)?;
        if timeout <= 0.0 && !future.done() {
            future.cancel(None);
            return Err(ExcType::TimeoutError.bare());
        }
        let timed_out = Rc::new(Cell::new(false));
        let target = future.clone();
        let flag = timed_out.clone();
        let timer = event_loop.call_later_native(timeout.max(0.0), "wait_for()", move |_| {
            if !target.done() {
                flag.set(true);
                target.cancel(None);
            }
            Ok(())
        })?;
        let outcome = FutureAwait::new(future).await;
        timer.cancel();
        match outcome {
            Err(exc) if timed_out.get() && exc.is_instance(ExcType::CancelledError) => {
                let timeout_error = ExcType::TimeoutError.bare();
                timeout_error.set_context(exc);
                Err(timeout_error)
            }
            other => other,
        }
    };
    Ok(Value::Coroutine(Coroutine::from_future("wait_for", body)))
}

/// `asyncio.create_task(coro, *, name=None)`.
fn create_task(rt: &Runtime, mut args: Args) -> RunResult<Value> {
    let name = args.take_keyword("name").filter(|n| !n.is_none());
    let coro = args.get_one_arg("create_task")?;
    if !matches!(coro, Value::Coroutine(_)) {
        return Err(ExcType::TypeError.msg(format!(
            "a coroutine was expected, got {}",
            coro.repr_plain()
        )));
    }
    let name = name.map(|n| n.str_plain());
    rt.event_loop().create_task(coro, name).map(Value::Task)
}

/// `asyncio.gather(*aws, return_exceptions=False)`.
fn gather(rt: &Runtime, mut args: Args) -> RunResult<Value> {
    let return_exceptions = match args.take_keyword("return_exceptions") {
        Some(flag) => rt.truthy(&flag)?,
        None => false,
    };
    args.no_keywords("gather")?;
    let event_loop = rt.event_loop();
    let children = args
        .positional
        .into_iter()
        .map(|aw| future_of(&event_loop.ensure_future(aw)?))
        .collect::<RunResult<Vec<_>>>()?;
    Ok(Value::Future(event_loop.gather(children, return_exceptions)))
}
