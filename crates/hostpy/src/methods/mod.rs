//! Methods of builtin objects, reached through `Value::BuiltinMethod`.
//!
//! Each receiver kind has a static list of method names (used by `getattr` and `dir`) and a
//! `call` function. Unbound access through the type object (`str.join`, `dict.fromkeys`) takes
//! the receiver from the first argument.

mod dict;
mod list;
mod objects;
mod string;

use crate::{
    args::Args,
    exception::{ExcType, RunResult},
    runtime::Runtime,
    value::{Type, Value},
    webloop,
};

/// Method names available on `obj`.
#[must_use]
pub(crate) fn method_names(obj: &Value) -> &'static [&'static str] {
    match obj {
        Value::Str(_) => string::METHODS,
        Value::List(_) => list::LIST_METHODS,
        Value::Tuple(_) => list::TUPLE_METHODS,
        Value::Dict(_) => dict::DICT_METHODS,
        Value::Set(_) => dict::SET_METHODS,
        Value::Int(_) | Value::BigInt(_) | Value::Bool(_) => objects::INT_METHODS,
        Value::Float(_) => objects::FLOAT_METHODS,
        Value::Exception(_) => objects::EXCEPTION_METHODS,
        Value::Coroutine(_) => objects::COROUTINE_METHODS,
        Value::Generator(_) => objects::GENERATOR_METHODS,
        Value::AsyncGenerator(_) => objects::ASYNC_GENERATOR_METHODS,
        Value::Iterator(_) => objects::ITERATOR_METHODS,
        Value::Stream(_) => objects::STREAM_METHODS,
        Value::Future(_) | Value::Task(_) | Value::Handle(_) | Value::Loop(_) | Value::Lock(_) => {
            webloop::methods::names(obj)
        }
        Value::Type(t) => type_method_names(*t),
        _ => &[],
    }
}

fn type_method_names(t: Type) -> &'static [&'static str] {
    match t {
        Type::Str => string::METHODS,
        Type::List => list::LIST_METHODS,
        Type::Tuple => list::TUPLE_METHODS,
        Type::Dict => dict::DICT_TYPE_METHODS,
        Type::Set => dict::SET_METHODS,
        Type::Int | Type::Bool => objects::INT_METHODS,
        Type::Float => objects::FLOAT_METHODS,
        Type::Exc(_) => objects::EXCEPTION_METHODS,
        Type::Object => &["__init__"],
        _ => &[],
    }
}

#[must_use]
pub(crate) fn has_method(obj: &Value, name: &str) -> bool {
    method_names(obj).contains(&name)
}

/// Calls method `name` on a builtin `receiver`.
pub(crate) fn call_method(rt: &Runtime, receiver: &Value, name: &str, args: Args) -> RunResult<Value> {
    match receiver {
        Value::Str(s) => string::call(rt, s, name, args),
        Value::List(list) => list::call_list(rt, receiver, list, name, args),
        Value::Tuple(items) => list::call_tuple(rt, items, name, args),
        Value::Dict(dict) => dict::call_dict(rt, dict, name, args),
        Value::Set(set) => dict::call_set(rt, set, name, args),
        Value::Type(t) => call_unbound(rt, *t, name, args),
        Value::Future(_) | Value::Task(_) | Value::Handle(_) | Value::Loop(_) | Value::Lock(_) => {
            webloop::methods::call(rt, receiver, name, args)
        }
        _ => objects::call(rt, receiver, name, args),
    }
}

/// `type.method(receiver, *args)`.
fn call_unbound(rt: &Runtime, t: Type, name: &str, args: Args) -> RunResult<Value> {
    if t == Type::Dict && name == "fromkeys" {
        return dict::fromkeys(rt, args);
    }
    if t == Type::Object && name == "__init__" {
        return Ok(Value::None);
    }
    let mut args = args;
    if args.positional.is_empty() {
        return Err(ExcType::TypeError.msg(format!(
            "unbound method {}.{name}() needs an argument",
            t.name()
        )));
    }
    let receiver = args.positional.remove(0);
    let matches_type = match (&receiver.py_type(), t) {
        (Value::Type(actual), expected) => actual.is_subtype_of(expected),
        (Value::Class(class), expected) => class.is_subclass_of_type(expected),
        _ => false,
    };
    if !matches_type {
        return Err(ExcType::TypeError.msg(format!(
            "descriptor '{name}' for '{}' objects doesn't apply to a '{}' object",
            t.name(),
            receiver.type_name()
        )));
    }
    call_method(rt, &receiver, name, args)
}

/// Binds positional-or-keyword parameters `names` of a builtin method; the first `required`
/// are mandatory.
pub(crate) fn bind_params(args: Args, method: &str, names: &[&str], required: usize) -> RunResult<Vec<Option<Value>>> {
    let Args { positional, keywords } = args;
    if positional.len() > names.len() {
        return Err(ExcType::TypeError.msg(format!(
            "{method}() takes at most {} argument{} ({} given)",
            names.len(),
            if names.len() == 1 { "" } else { "s" },
            positional.len()
        )));
    }
    let mut bound: Vec<Option<Value>> = vec![None; names.len()];
    for (slot, value) in bound.iter_mut().zip(positional) {
        *slot = Some(value);
    }
    for (key, value) in keywords {
        let Some(index) = names.iter().position(|n| *n == key.as_ref()) else {
            return Err(ExcType::TypeError.msg(format!(
                "{method}() got an unexpected keyword argument '{key}'"
            )));
        };
        if bound[index].is_some() {
            return Err(ExcType::TypeError.msg(format!(
                "{method}() got multiple values for argument '{key}'"
            )));
        }
        bound[index] = Some(value);
    }
    if let Some(missing) = bound.iter().take(required).position(Option::is_none) {
        return Err(ExcType::TypeError.msg(format!(
            "{method}() missing required argument '{}' (pos {})",
            names[missing],
            missing + 1
        )));
    }
    Ok(bound)
}

/// Reads an optional integer parameter, treating `None` as absent.
fn opt_index(rt: &Runtime, value: Option<&Value>) -> RunResult<Option<i64>> {
    match value {
        None | Some(Value::None) => Ok(None),
        Some(v) => rt.index(v).map(Some),
    }
}
