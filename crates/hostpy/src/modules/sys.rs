//! Implementation of the `sys` module.
//!
//! - `stdout` / `stderr` / `stdin`: text streams, replaceable by assignment or by a console's
//!   stream redirection
//! - `modules`: the runtime's module registry
//! - `last_type` / `last_value` / `last_traceback`: the last error shown by a console
//! - `get_asyncgen_hooks()` / `set_asyncgen_hooks(firstiter=..., finalizer=...)`
//! - `version`, `version_info`, `platform`, `maxsize`

use std::rc::Rc;

use crate::{
    builtins::is_callable,
    exception::{ExcType, Exception, RunResult},
    methods::bind_params,
    modules::add_function,
    runtime::Runtime,
    types::ModuleObj,
    value::Value,
};

pub(crate) const VERSION: &str = "3.12.0 (hostpy)";

pub(crate) const PLATFORM: &str = "hostpy";

/// Fills in `sys` for a new runtime.
pub(crate) fn populate(rt: &Runtime, sys: &Rc<ModuleObj>) {
    for (name, stream) in Runtime::default_streams() {
        sys.set(name, stream.clone());
        sys.set(format!("__{name}__"), stream);
    }
    sys.set("modules", Value::Dict(rt.modules().clone()));
    for name in ["last_type", "last_value", "last_traceback", "last_exc"] {
        sys.set(name, Value::None);
    }
    sys.set("version", Value::str(VERSION));
    sys.set(
        "version_info",
        Value::tuple(vec![
            Value::Int(3),
            Value::Int(12),
            Value::Int(0),
            Value::str("final"),
            Value::Int(0),
        ]),
    );
    sys.set("platform", Value::str(PLATFORM));
    sys.set("maxsize", Value::Int(i64::MAX));

    add_function(sys, "get_asyncgen_hooks", |rt, args| {
        args.check_zero_args("get_asyncgen_hooks")?;
        let (firstiter, finalizer) = rt.asyncgen_hooks();
        Ok(Value::tuple(vec![firstiter, finalizer]))
    });
    add_function(sys, "set_asyncgen_hooks", |rt, args| {
        let mut bound = bind_params(args, "set_asyncgen_hooks", &["firstiter", "finalizer"], 0)?.into_iter();
        let (mut firstiter, mut finalizer) = rt.asyncgen_hooks();
        if let Some(hook) = bound.next().flatten() {
            check_hook(&hook, "firstiter")?;
            firstiter = hook;
        }
        if let Some(hook) = bound.next().flatten() {
            check_hook(&hook, "finalizer")?;
            finalizer = hook;
        }
        rt.set_asyncgen_hooks(firstiter, finalizer);
        Ok(Value::None)
    });
}

fn check_hook(hook: &Value, which: &str) -> RunResult<()> {
    if hook.is_none() || is_callable(hook) {
        return Ok(());
    }
    Err(ExcType::TypeError.msg(format!(
        "callable {which} expected, got {}",
        hook.type_name()
    )))
}

/// Records `exc` as the last error shown to the user.
pub(crate) fn set_last_exception(rt: &Runtime, exc: &Exception) {
    let sys = rt.sys();
    let value = Value::Exception(exc.clone());
    sys.set("last_type", value.py_type());
    sys.set("last_value", value);
    sys.set("last_exc", Value::Exception(exc.clone()));
    sys.set("last_traceback", traceback_value(exc));
}

/// `sys.last_traceback` as a list of `(filename, lineno, name)` tuples, `None` without frames.
fn traceback_value(exc: &Exception) -> Value {
    let frames = exc.traceback();
    if frames.is_empty() {
        return Value::None;
    }
    Value::list(
        frames
            .iter()
            .map(|frame| {
                Value::tuple(vec![
                    Value::str(frame.filename.to_string()),
                    Value::Int(i64::from(frame.lineno)),
                    Value::str(frame.name.to_string()),
                ])
            })
            .collect(),
    )
}
