//! Calling builtin type objects: `int(...)`, `dict(...)`, `type(...)` and friends.

use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::{FromPrimitive, Num};

use crate::{
    args::Args,
    exception::{ExcType, Exception, RunResult},
    runtime::Runtime,
    types::{Class, Descriptor, Dict, Instance},
    value::{PyRange, SliceObj, Type, Value},
    webloop::AsyncLock,
};

thread_local! {
    /// Class backing bare `object()` instances, shared so they all report the same type.
    static OBJECT_CLASS: RefCell<Weak<Class>> = const { RefCell::new(Weak::new()) };
}

fn object_class() -> RunResult<Rc<Class>> {
    if let Some(class) = OBJECT_CLASS.with(|c| c.borrow().upgrade()) {
        return Ok(class);
    }
    let class = Rc::new(Class::new(
        "object".into(),
        "object".into(),
        "builtins".into(),
        Vec::new(),
        IndexMap::new(),
    )?);
    OBJECT_CLASS.with(|c| *c.borrow_mut() = Rc::downgrade(&class));
    Ok(class)
}

/// `t(*args, **kwargs)` for a builtin type object.
pub(crate) fn construct(rt: &Runtime, t: Type, args: Args) -> RunResult<Value> {
    let name = t.name();
    match t {
        Type::Object => {
            args.check_zero_args("object")?;
            Ok(Value::Instance(Rc::new(Instance::new(object_class()?))))
        }
        Type::Type => type_call(rt, args),
        Type::NoneType => {
            args.check_zero_args("NoneType")?;
            Ok(Value::None)
        }
        Type::Bool => match args.get_zero_one_arg("bool")? {
            Some(v) => rt.truthy(&v).map(Value::Bool),
            None => Ok(Value::Bool(false)),
        },
        Type::Int => int_call(rt, args),
        Type::Float => match args.get_zero_one_arg("float")? {
            Some(v) => to_float(rt, &v).map(Value::Float),
            None => Ok(Value::Float(0.0)),
        },
        Type::Str => match args.get_zero_one_arg("str")? {
            Some(v) => rt.str(&v).map(Value::str),
            None => Ok(Value::str("")),
        },
        Type::List => match args.get_zero_one_arg("list")? {
            Some(v) => rt.to_vec(&v).map(Value::list),
            None => Ok(Value::list(Vec::new())),
        },
        Type::Tuple => match args.get_zero_one_arg("tuple")? {
            Some(v @ Value::Tuple(_)) => Ok(v),
            Some(v) => rt.to_vec(&v).map(Value::tuple),
            None => Ok(Value::tuple(Vec::new())),
        },
        Type::Set => match args.get_zero_one_arg("set")? {
            Some(v) => {
                let items = rt.to_vec(&v)?;
                rt.new_set(items)
            }
            None => rt.new_set(Vec::new()),
        },
        Type::Dict => dict_call(rt, args),
        Type::Range => range_call(rt, args),
        Type::Slice => {
            let values = args.get_range("slice", 1, 3)?;
            let (start, stop, step) = match values.as_slice() {
                [stop] => (Value::None, stop.clone(), Value::None),
                [start, stop] => (start.clone(), stop.clone(), Value::None),
                [start, stop, step, ..] => (start.clone(), stop.clone(), step.clone()),
                [] => (Value::None, Value::None, Value::None),
            };
            Ok(Value::Slice(Rc::new(SliceObj { start, stop, step })))
        }
        Type::Property => {
            let mut args = args;
            let fget_kw = args.take_keyword("fget");
            let fset_kw = args.take_keyword("fset");
            let fdel_kw = args.take_keyword("fdel");
            args.take_keyword("doc");
            let values = args.get_range("property", 0, 4)?;
            let mut values = values.into_iter();
            let fget = values.next().or(fget_kw).unwrap_or(Value::None);
            let fset = values.next().or(fset_kw).unwrap_or(Value::None);
            let fdel = values.next().or(fdel_kw).unwrap_or(Value::None);
            Ok(Value::Descriptor(Rc::new(Descriptor::Property { fget, fset, fdel })))
        }
        Type::StaticMethod => {
            let func = args.get_one_arg("staticmethod")?;
            Ok(Value::Descriptor(Rc::new(Descriptor::StaticMethod(func))))
        }
        Type::ClassMethod => {
            let func = args.get_one_arg("classmethod")?;
            Ok(Value::Descriptor(Rc::new(Descriptor::ClassMethod(func))))
        }
        Type::Future => {
            args.no_keywords("Future")?;
            Ok(Value::Future(rt.event_loop().create_future()))
        }
        Type::Task => {
            let mut args = args;
            let task_name = args.take_keyword("name").filter(|n| !n.is_none());
            let coro = args.get_one_arg("Task")?;
            let task_name = task_name.map(|n| rt.str(&n)).transpose()?;
            rt.event_loop().create_task(coro, task_name).map(Value::Task)
        }
        Type::Lock => {
            args.check_zero_args("Lock")?;
            Ok(Value::Lock(Rc::new(AsyncLock::new())))
        }
        Type::Exc(exc_type) => {
            if let Some((key, _)) = args.keywords.first() {
                return Err(ExcType::TypeError.msg(format!(
                    "{name}() got an unexpected keyword argument '{key}'"
                )));
            }
            Ok(Value::Exception(Exception::new(exc_type, args.positional)))
        }
        Type::Function
        | Type::Module
        | Type::Coroutine
        | Type::Generator
        | Type::AsyncGenerator => Err(ExcType::TypeError.msg(format!("cannot create '{name}' instances"))),
    }
}

/// `type(obj)` or `type(name, bases, namespace)`.
fn type_call(rt: &Runtime, args: Args) -> RunResult<Value> {
    let values = args.get_range("type", 1, 3)?;
    match values.as_slice() {
        [obj] => Ok(obj.py_type()),
        [Value::Str(name), Value::Tuple(bases), Value::Dict(ns)] => {
            let module = rt
                .current_frame()
                .map_or_else(|| Rc::from("builtins"), |frame| frame.module_name());
            let dict: IndexMap<Rc<str>, Value> = ns
                .borrow()
                .items()
                .into_iter()
                .filter_map(|(k, v)| match k {
                    Value::Str(k) => Some((k, v)),
                    _ => None,
                })
                .collect();
            let class = Class::new(name.clone(), name.clone(), module, bases.to_vec(), dict)?;
            Ok(Value::Class(Rc::new(class)))
        }
        _ => Err(ExcType::TypeError.msg("type() takes 1 or 3 arguments")),
    }
}

fn int_call(rt: &Runtime, args: Args) -> RunResult<Value> {
    let mut args = args;
    let base_kw = args.take_keyword("base");
    let values = args.get_range("int", 0, 2)?;
    let base = values.get(1).cloned().or(base_kw);
    let Some(value) = values.into_iter().next() else {
        return Ok(Value::Int(0));
    };
    if let Some(base) = base {
        let base = rt.index(&base)?;
        let Value::Str(s) = &value else {
            return Err(ExcType::TypeError.msg("int() can't convert non-string with explicit base"));
        };
        if base != 0 && !(2..=36).contains(&base) {
            return Err(ExcType::ValueError.msg("int() base must be >= 2 and <= 36, or 0"));
        }
        return parse_int(s, base as u32);
    }
    match &value {
        Value::Bool(_) | Value::Int(_) | Value::BigInt(_) => rt.unary_op(crate::expressions::UnaryOperator::Pos, &value),
        Value::Float(f) => float_to_int(*f),
        Value::Str(s) => parse_int(s, 10),
        _ => {
            for name in ["__int__", "__index__"] {
                if let Some(method) = rt.lookup_special(&value, name) {
                    return rt.call(&method, Args::empty());
                }
            }
            Err(ExcType::TypeError.msg(format!(
                "int() argument must be a string, a bytes-like object or a real number, not '{}'",
                value.type_name()
            )))
        }
    }
}

pub(crate) fn float_to_int(f: f64) -> RunResult<Value> {
    if f.is_nan() {
        return Err(ExcType::ValueError.msg("cannot convert float NaN to integer"));
    }
    if f.is_infinite() {
        return Err(ExcType::OverflowError.msg("cannot convert float infinity to integer"));
    }
    let truncated = f.trunc();
    if truncated.abs() < 9.2e18 {
        return Ok(Value::Int(truncated as i64));
    }
    BigInt::from_f64(truncated)
        .map(Value::from)
        .ok_or_else(|| ExcType::OverflowError.msg("cannot convert float to integer"))
}

/// Parses an integer literal the way `int(s, base)` does: surrounding whitespace, a sign,
/// underscores between digits and, for base 0 or a matching base, a `0x`/`0o`/`0b` prefix.
fn parse_int(text: &str, base: u32) -> RunResult<Value> {
    let invalid = || {
        ExcType::ValueError.msg(format!(
            "invalid literal for int() with base {base}: {}",
            crate::value::str_repr(text)
        ))
    };
    let trimmed = text.trim();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let lower = digits.to_ascii_lowercase();
    let (radix, body, prefixed) = match (base, lower.get(..2)) {
        (0 | 16, Some("0x")) => (16, &lower[2..], true),
        (0 | 8, Some("0o")) => (8, &lower[2..], true),
        (0 | 2, Some("0b")) => (2, &lower[2..], true),
        (0, _) => {
            if lower.len() > 1 && lower.starts_with('0') && lower.chars().any(|c| c != '0' && c != '_') {
                return Err(invalid());
            }
            (10, lower.as_str(), false)
        }
        (b, _) => (b, lower.as_str(), false),
    };
    let body = if prefixed { body.strip_prefix('_').unwrap_or(body) } else { body };
    if body.is_empty() || body.starts_with('_') || body.ends_with('_') || body.contains("__") {
        return Err(invalid());
    }
    let cleaned: String = body.chars().filter(|&c| c != '_').collect();
    if !cleaned.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(invalid());
    }
    let parsed = BigInt::from_str_radix(&cleaned, radix).map_err(|_| invalid())?;
    Ok(Value::from(if negative { -parsed } else { parsed }))
}

fn to_float(rt: &Runtime, value: &Value) -> RunResult<f64> {
    match value {
        Value::Str(s) => parse_float(s).ok_or_else(|| {
            ExcType::ValueError.msg(format!(
                "could not convert string to float: {}",
                crate::value::str_repr(s)
            ))
        }),
        Value::Float(f) => Ok(*f),
        Value::Bool(_) | Value::Int(_) | Value::BigInt(_) => value
            .as_float()
            .ok_or_else(|| ExcType::OverflowError.msg("int too large to convert to float")),
        _ => match rt.lookup_special(value, "__float__") {
            Some(method) => match rt.call(&method, Args::empty())? {
                Value::Float(f) => Ok(f),
                other => Err(ExcType::TypeError.msg(format!(
                    "__float__ returned non-float (type {})",
                    other.type_name()
                ))),
            },
            None => Err(ExcType::TypeError.msg(format!(
                "float() argument must be a string or a real number, not '{}'",
                value.type_name()
            ))),
        },
    }
}

fn parse_float(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    let lower = trimmed.to_ascii_lowercase();
    let unsigned = lower.trim_start_matches(['+', '-']);
    let negative = lower.starts_with('-');
    let special = match unsigned {
        "inf" | "infinity" => Some(f64::INFINITY),
        "nan" => Some(f64::NAN),
        _ => None,
    };
    if let Some(v) = special {
        return (lower.len() - unsigned.len() <= 1).then_some(if negative { -v } else { v });
    }
    if trimmed.contains("__") || trimmed.starts_with('_') || trimmed.ends_with('_') {
        return None;
    }
    trimmed.replace('_', "").parse().ok()
}

fn dict_call(rt: &Runtime, args: Args) -> RunResult<Value> {
    let Args { positional, keywords } = args;
    if positional.len() > 1 {
        return Err(ExcType::TypeError.msg(format!(
            "dict expected at most 1 argument, got {}",
            positional.len()
        )));
    }
    let mut dict = Dict::new();
    if let Some(source) = positional.into_iter().next() {
        let is_mapping = match &source {
            Value::Dict(_) => true,
            Value::Instance(_) => rt.hasattr(&source, "keys")?,
            _ => false,
        };
        let pairs = if is_mapping {
            rt.mapping_items(&source)?
        } else {
            let mut pairs = Vec::new();
            for (i, item) in rt.to_vec(&source)?.into_iter().enumerate() {
                let pair = rt.to_vec(&item)?;
                let [key, value] = <[Value; 2]>::try_from(pair).map_err(|pair| {
                    ExcType::ValueError.msg(format!(
                        "dictionary update sequence element #{i} has length {}; 2 is required",
                        pair.len()
                    ))
                })?;
                pairs.push((key, value));
            }
            pairs
        };
        for (key, value) in pairs {
            dict.set(key, value)?;
        }
    }
    for (key, value) in keywords {
        dict.set_str(key, value);
    }
    Ok(Value::dict(dict))
}

fn range_call(rt: &Runtime, args: Args) -> RunResult<Value> {
    let values = args.get_range("range", 1, 3)?;
    let ints = values.iter().map(|v| rt.index(v)).collect::<RunResult<Vec<_>>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step, ..] => (*start, *stop, *step),
        [] => (0, 0, 1),
    };
    if step == 0 {
        return Err(ExcType::ValueError.msg("range() arg 3 must not be zero"));
    }
    Ok(Value::Range(PyRange { start, stop, step }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(text: &str, base: u32) -> Option<i64> {
        parse_int(text, base).ok().and_then(|v| v.as_int())
    }

    #[test]
    fn parse_int_literals() {
        assert_eq!(int(" 42 ", 10), Some(42));
        assert_eq!(int("-1_000", 10), Some(-1000));
        assert_eq!(int("0x1f", 16), Some(31));
        assert_eq!(int("0b101", 0), Some(5));
        assert_eq!(int("ff", 16), Some(255));
        assert_eq!(int("1__0", 10), None);
        assert_eq!(int("", 10), None);
        assert_eq!(int("012", 0), None);
        assert_eq!(int("000", 0), Some(0));
    }

    #[test]
    fn parse_float_literals() {
        assert_eq!(parse_float(" 1.5 "), Some(1.5));
        assert_eq!(parse_float("1_0.5"), Some(10.5));
        assert_eq!(parse_float("-inf"), Some(f64::NEG_INFINITY));
        assert!(parse_float("nan").is_some_and(f64::is_nan));
        assert_eq!(parse_float("abc"), None);
    }
}
