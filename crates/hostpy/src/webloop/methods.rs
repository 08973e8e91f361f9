//! Python-visible methods of loop objects: `Future`, `Task`, `Handle`, the loop and `Lock`.

use std::rc::Rc;

use super::{AsyncLock, Handle, PyFuture, Task, WebLoop, seconds};
use crate::{
    args::Args,
    exception::{ExcType, RunResult},
    methods::bind_params,
    runtime::Runtime,
    types::{Coroutine, Dict},
    value::Value,
};

const FUTURE_METHODS: &[&str] = &[
    "add_done_callback",
    "cancel",
    "cancelled",
    "catch",
    "done",
    "exception",
    "finally_",
    "get_loop",
    "remove_done_callback",
    "result",
    "set_exception",
    "set_result",
    "then",
];

const TASK_METHODS: &[&str] = &[
    "add_done_callback",
    "cancel",
    "cancelled",
    "cancelling",
    "catch",
    "done",
    "exception",
    "finally_",
    "get_coro",
    "get_loop",
    "get_name",
    "remove_done_callback",
    "result",
    "set_exception",
    "set_name",
    "set_result",
    "then",
    "uncancel",
];

const HANDLE_METHODS: &[&str] = &["cancel", "cancelled", "when"];

const LOOP_METHODS: &[&str] = &[
    "call_at",
    "call_exception_handler",
    "call_later",
    "call_soon",
    "call_soon_threadsafe",
    "close",
    "create_future",
    "create_task",
    "default_exception_handler",
    "get_debug",
    "get_exception_handler",
    "get_task_factory",
    "is_closed",
    "is_running",
    "run_forever",
    "run_in_executor",
    "run_until_complete",
    "set_debug",
    "set_exception_handler",
    "set_task_factory",
    "shutdown_asyncgens",
    "stop",
    "time",
];

const LOCK_METHODS: &[&str] = &["acquire", "locked", "release"];

pub(crate) fn names(obj: &Value) -> &'static [&'static str] {
    match obj {
        Value::Future(_) => FUTURE_METHODS,
        Value::Task(_) => TASK_METHODS,
        Value::Handle(_) => HANDLE_METHODS,
        Value::Loop(_) => LOOP_METHODS,
        Value::Lock(_) => LOCK_METHODS,
        _ => &[],
    }
}

pub(crate) fn call(rt: &Runtime, receiver: &Value, name: &str, args: Args) -> RunResult<Value> {
    match receiver {
        Value::Future(future) => call_future(rt, future, name, args),
        Value::Task(task) => call_task(rt, task, name, args),
        Value::Handle(handle) => call_handle(handle, name, args),
        Value::Loop(event_loop) => call_loop(rt, event_loop, name, args),
        Value::Lock(lock) => call_lock(rt, lock, name, args),
        _ => Err(ExcType::AttributeError.msg(format!(
            "'{}' object has no attribute '{name}'",
            receiver.type_name()
        ))),
    }
}

fn call_future(rt: &Runtime, future: &PyFuture, name: &str, args: Args) -> RunResult<Value> {
    match name {
        "result" => {
            args.check_zero_args("result")?;
            future.result()
        }
        "exception" => {
            args.check_zero_args("exception")?;
            Ok(future.exception()?.map_or(Value::None, Value::Exception))
        }
        "done" => {
            args.check_zero_args("done")?;
            Ok(Value::Bool(future.done()))
        }
        "cancelled" => {
            args.check_zero_args("cancelled")?;
            Ok(Value::Bool(future.cancelled()))
        }
        "cancel" => {
            let [msg] = bind_params(args, "cancel", &["msg"], 0)?.try_into().unwrap_or_default();
            Ok(Value::Bool(future.cancel(msg)))
        }
        "add_done_callback" => {
            let mut args = args;
            // `context=` is accepted and ignored.
            drop(args.take_keyword("context"));
            future.add_done_callback(args.get_one_arg("add_done_callback")?);
            Ok(Value::None)
        }
        "remove_done_callback" => {
            let callback = args.get_one_arg("remove_done_callback")?;
            Ok(Value::Int(future.remove_done_callback(&callback) as i64))
        }
        "set_result" => {
            future.set_result(args.get_one_arg("set_result")?)?;
            Ok(Value::None)
        }
        "set_exception" => {
            let exc = rt.make_exception(args.get_one_arg("set_exception")?)?;
            future.set_exception(exc)?;
            Ok(Value::None)
        }
        "get_loop" => {
            args.check_zero_args("get_loop")?;
            Ok(future.get_loop().map_or(Value::None, |l| l.value()))
        }
        "then" => {
            let [onfulfilled, onrejected] = bind_params(args, "then", &["onfulfilled", "onrejected"], 0)?
                .try_into()
                .unwrap_or_default();
            future
                .then(onfulfilled.unwrap_or(Value::None), onrejected.unwrap_or(Value::None))
                .map(|f| f.as_value())
        }
        "catch" => future.catch(args.get_one_arg("catch")?).map(|f| f.as_value()),
        "finally_" => future.finally_(args.get_one_arg("finally_")?).map(|f| f.as_value()),
        _ => Err(ExcType::AttributeError.msg(format!("'Future' object has no attribute '{name}'"))),
    }
}

fn call_task(rt: &Runtime, task: &Task, name: &str, args: Args) -> RunResult<Value> {
    match name {
        "get_name" => {
            args.check_zero_args("get_name")?;
            Ok(Value::Str(task.name()))
        }
        "set_name" => {
            let value = args.get_one_arg("set_name")?;
            task.set_name(rt.str(&value)?);
            Ok(Value::None)
        }
        "get_coro" => {
            args.check_zero_args("get_coro")?;
            Ok(task.coro())
        }
        "cancelling" => {
            args.check_zero_args("cancelling")?;
            Ok(Value::Int(i64::from(task.cancelling())))
        }
        "uncancel" => {
            args.check_zero_args("uncancel")?;
            Ok(Value::Int(i64::from(task.uncancel())))
        }
        "cancel" => {
            let [msg] = bind_params(args, "cancel", &["msg"], 0)?.try_into().unwrap_or_default();
            Ok(Value::Bool(task.cancel(msg)))
        }
        "set_result" | "set_exception" => Err(ExcType::RuntimeError.msg(format!("Task does not support {name} operation"))),
        _ => call_future(rt, &task.future(), name, args),
    }
}

fn call_handle(handle: &Handle, name: &str, args: Args) -> RunResult<Value> {
    match name {
        "cancel" => {
            args.check_zero_args("cancel")?;
            handle.cancel();
            Ok(Value::None)
        }
        "cancelled" => {
            args.check_zero_args("cancelled")?;
            Ok(Value::Bool(handle.cancelled()))
        }
        "when" => {
            args.check_zero_args("when")?;
            handle
                .when()
                .map(Value::Float)
                .ok_or_else(|| ExcType::AttributeError.msg("'Handle' object has no attribute 'when'"))
        }
        _ => Err(ExcType::AttributeError.msg(format!("'Handle' object has no attribute '{name}'"))),
    }
}

/// Splits `(callback, *args)` off a call, ignoring `context=`.
fn callback_args(mut args: Args, method: &str, skip: usize) -> RunResult<(Vec<Value>, Value, Vec<Value>)> {
    drop(args.take_keyword("context"));
    args.no_keywords(method)?;
    if args.positional.len() <= skip {
        return Err(ExcType::TypeError.msg(format!(
            "{method}() missing {} required positional argument{}",
            skip + 1 - args.positional.len(),
            if skip + 1 - args.positional.len() == 1 { "" } else { "s" }
        )));
    }
    let mut rest = args.positional.split_off(skip);
    let callback = rest.remove(0);
    Ok((args.positional, callback, rest))
}

fn call_loop(rt: &Runtime, event_loop: &WebLoop, name: &str, args: Args) -> RunResult<Value> {
    match name {
        "time" => {
            args.check_zero_args("time")?;
            Ok(Value::Float(event_loop.time()))
        }
        "call_soon" | "call_soon_threadsafe" => {
            let (_, callback, rest) = callback_args(args, name, 0)?;
            event_loop.call_soon(callback, rest).map(Value::Handle)
        }
        "call_later" => {
            let (head, callback, rest) = callback_args(args, name, 1)?;
            let delay = seconds(&head[0], "delay")?;
            event_loop.call_later(delay, callback, rest).map(Value::Handle)
        }
        "call_at" => {
            let (head, callback, rest) = callback_args(args, name, 1)?;
            let when = seconds(&head[0], "when")?;
            event_loop.call_at(when, callback, rest).map(Value::Handle)
        }
        "create_future" => {
            args.check_zero_args("create_future")?;
            Ok(event_loop.create_future().as_value())
        }
        "create_task" => {
            let [coro, task_name] = bind_params(args, "create_task", &["coro", "name"], 1)?
                .try_into()
                .unwrap_or_default();
            let task_name = match task_name {
                None | Some(Value::None) => None,
                Some(v) => Some(rt.str(&v)?),
            };
            event_loop
                .create_task(coro.unwrap_or(Value::None), task_name)
                .map(Value::Task)
        }
        "run_until_complete" => event_loop.run_until_complete(args.get_one_arg("run_until_complete")?),
        "run_forever" => {
            args.check_zero_args("run_forever")?;
            event_loop.run_forever()?;
            Ok(Value::None)
        }
        "stop" => {
            args.check_zero_args("stop")?;
            event_loop.stop();
            Ok(Value::None)
        }
        "close" => {
            args.check_zero_args("close")?;
            event_loop.close()?;
            Ok(Value::None)
        }
        "is_running" => {
            args.check_zero_args("is_running")?;
            Ok(Value::Bool(event_loop.is_running()))
        }
        "is_closed" => {
            args.check_zero_args("is_closed")?;
            Ok(Value::Bool(event_loop.is_closed()))
        }
        "get_debug" => {
            args.check_zero_args("get_debug")?;
            Ok(Value::Bool(event_loop.get_debug()))
        }
        "set_debug" => {
            let enabled = args.get_one_arg("set_debug")?;
            event_loop.set_debug(rt.truthy(&enabled)?);
            Ok(Value::None)
        }
        "set_exception_handler" => {
            event_loop.set_exception_handler(args.get_one_arg("set_exception_handler")?)?;
            Ok(Value::None)
        }
        "get_exception_handler" => {
            args.check_zero_args("get_exception_handler")?;
            Ok(event_loop.get_exception_handler())
        }
        "default_exception_handler" => {
            let context = context_dict(&args.get_one_arg("default_exception_handler")?)?;
            event_loop.default_exception_handler(rt, &context)?;
            Ok(Value::None)
        }
        "call_exception_handler" => {
            let context = context_dict(&args.get_one_arg("call_exception_handler")?)?;
            event_loop.call_exception_handler(rt, context);
            Ok(Value::None)
        }
        "set_task_factory" => {
            event_loop.set_task_factory(args.get_one_arg("set_task_factory")?)?;
            Ok(Value::None)
        }
        "get_task_factory" => {
            args.check_zero_args("get_task_factory")?;
            Ok(event_loop.get_task_factory())
        }
        "run_in_executor" => {
            let (_, func, rest) = callback_args(args, name, 1)?;
            event_loop.run_in_executor(&func, rest).map(|f| f.as_value())
        }
        "shutdown_asyncgens" => {
            let [timeout] = bind_params(args, "shutdown_asyncgens", &["timeout"], 0)?
                .try_into()
                .unwrap_or_default();
            let timeout = match timeout {
                None | Some(Value::None) => None,
                Some(v) => Some(seconds(&v, "timeout")?),
            };
            Ok(Value::Coroutine(event_loop.shutdown_asyncgens(timeout)))
        }
        _ => Err(ExcType::AttributeError.msg(format!("'WebLoop' object has no attribute '{name}'"))),
    }
}

fn context_dict(value: &Value) -> RunResult<Dict> {
    match value {
        Value::Dict(dict) => Ok(dict.borrow().clone()),
        other => Err(ExcType::TypeError.msg(format!(
            "context must be a dict, not '{}'",
            other.type_name()
        ))),
    }
}

fn call_lock(rt: &Runtime, lock: &Rc<AsyncLock>, name: &str, args: Args) -> RunResult<Value> {
    match name {
        "acquire" => {
            args.check_zero_args("acquire")?;
            let lock = lock.clone();
            let rt = rt.clone();
            Ok(Value::Coroutine(Coroutine::from_future("Lock.acquire", async move {
                lock.acquire(&rt).await?;
                Ok(Value::Bool(true))
            })))
        }
        "release" => {
            args.check_zero_args("release")?;
            lock.release()?;
            Ok(Value::None)
        }
        "locked" => {
            args.check_zero_args("locked")?;
            Ok(Value::Bool(lock.locked()))
        }
        _ => Err(ExcType::AttributeError.msg(format!("'Lock' object has no attribute '{name}'"))),
    }
}
