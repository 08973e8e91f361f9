//! Implementation of the `js` module: the host namespace.
//!
//! - `setTimeout(callback, delay_ms, *args)` / `clearTimeout(id)`
//! - `setInterval(callback, interval_ms, *args)` / `clearInterval(id)`
//! - `console.log(*values)`, written through [`Host::console_log`](crate::host::Host::console_log)
//! - values registered with [`Runtime::register_host_value`]
//!
//! Any other name is resolved by [`Host::namespace_lookup`](crate::host::Host::namespace_lookup)
//! at attribute access time.

use std::rc::Rc;

use crate::{
    args::Args,
    exception::{ExcType, RunResult},
    host::TimerToken,
    modules::add_function,
    runtime::{Runtime, RuntimeWeak},
    types::{HostProxy, ModuleObj, NativeFunction},
    value::Value,
};

pub(crate) fn create(rt: &Runtime) -> ModuleObj {
    let host = rt.host().clone();
    let module = ModuleObj::with_fallback("js", move |name| host.namespace_lookup(name));
    add_function(&module, "setTimeout", |rt, args| {
        let (callback, delay, rest) = timer_args(args, "setTimeout")?;
        let weak = rt.downgrade();
        let token = rt
            .host()
            .set_timeout(Box::new(move || run_callback(&weak, &callback, &rest)), delay);
        Ok(token_value(token))
    });
    add_function(&module, "clearTimeout", |rt, args| {
        if let Some(token) = token_arg(args.get_one_arg("clearTimeout")?) {
            rt.host().clear_timeout(token);
        }
        Ok(Value::None)
    });
    add_function(&module, "setInterval", |rt, args| {
        let (callback, interval, rest) = timer_args(args, "setInterval")?;
        let weak = rt.downgrade();
        let token = rt
            .host()
            .set_interval(Box::new(move || run_callback(&weak, &callback, &rest)), interval);
        Ok(token_value(token))
    });
    add_function(&module, "clearInterval", |rt, args| {
        if let Some(token) = token_arg(args.get_one_arg("clearInterval")?) {
            rt.host().clear_interval(token);
        }
        Ok(Value::None)
    });

    let log = NativeFunction::value("console.log", |rt, args| {
        args.no_keywords("log")?;
        let parts = args
            .positional
            .iter()
            .map(|value| rt.str(value))
            .collect::<RunResult<Vec<_>>>()?;
        rt.host().console_log(&parts.join(" "));
        Ok(Value::None)
    });
    let console = HostProxy::new("console", [(Rc::from("log"), log)]);
    module.set("console", Value::HostProxy(Rc::new(console)));

    for (name, value) in rt.host_values() {
        module.set(name, value);
    }
    module
}

fn timer_args(args: Args, name: &str) -> RunResult<(Value, f64, Vec<Value>)> {
    args.no_keywords(name)?;
    let mut positional = args.positional.into_iter();
    let Some(callback) = positional.next() else {
        return Err(ExcType::TypeError.msg(format!("{name}() missing required argument 'callback'")));
    };
    let delay = match positional.next() {
        None => 0.0,
        Some(delay) => delay.as_float().ok_or_else(|| {
            ExcType::TypeError.msg(format!(
                "{name}() delay must be a number, not '{}'",
                delay.type_name()
            ))
        })?,
    };
    Ok((callback, delay.max(0.0), positional.collect()))
}

fn run_callback(weak: &RuntimeWeak, callback: &Value, args: &[Value]) {
    let Some(rt) = weak.upgrade() else {
        return;
    };
    if let Err(exc) = rt.call(callback, Args::positional(args.to_vec())) {
        rt.report_unraisable(&exc, "Exception ignored in host timer callback:");
    }
}

fn token_value(token: TimerToken) -> Value {
    Value::Int(i64::try_from(token.0).unwrap_or(i64::MAX))
}

fn token_arg(value: Value) -> Option<TimerToken> {
    value.as_int().and_then(|id| u64::try_from(id).ok()).map(TimerToken)
}
