//! Iterator builtins: `iter`, `next`, `anext`, `enumerate`, `zip`, `map`, `filter`, `reversed`.

use std::{cell::RefCell, rc::Rc};

use crate::{
    args::Args,
    exception::{ExcType, RunResult},
    runtime::Runtime,
    types::PyIter,
    value::{PyRange, Value},
};

fn iterator(it: PyIter) -> Value {
    Value::Iterator(Rc::new(RefCell::new(it)))
}

pub(super) fn iter(rt: &Runtime, args: Args) -> RunResult<Value> {
    let (value, sentinel) = args.get_one_two_args("iter")?;
    if sentinel.is_some() {
        return Err(ExcType::NotImplementedError.msg("iter(callable, sentinel) is not supported"));
    }
    rt.iter(&value)
}

pub(super) fn next(rt: &Runtime, args: Args) -> RunResult<Value> {
    let (it, default) = args.get_one_two_args("next")?;
    if !matches!(it, Value::Iterator(_) | Value::Generator(_) | Value::Instance(_)) {
        return Err(ExcType::TypeError.msg(format!("'{}' object is not an iterator", it.type_name())));
    }
    match (rt.iter_next(&it)?, default) {
        (Some(value), _) => Ok(value),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(ExcType::StopIteration.bare()),
    }
}

/// `anext(aiterator[, default])`; the default is only honoured for async generators.
pub(super) fn anext(rt: &Runtime, args: Args) -> RunResult<Value> {
    let (it, default) = args.get_one_two_args("anext")?;
    if default.is_some() {
        return Err(ExcType::NotImplementedError.msg("anext() with a default is not supported"));
    }
    rt.anext(&it)
}

pub(super) fn enumerate(rt: &Runtime, args: Args) -> RunResult<Value> {
    let mut args = args;
    let start_kw = args.take_keyword("start");
    let (iterable, start) = args.get_one_two_args("enumerate")?;
    let count = match start.or(start_kw) {
        Some(start) => rt.index(&start)?,
        None => 0,
    };
    Ok(iterator(PyIter::Enumerate {
        inner: rt.iter(&iterable)?,
        count,
    }))
}

pub(super) fn zip(rt: &Runtime, args: Args) -> RunResult<Value> {
    args.no_keywords("zip")?;
    let inners = args
        .positional
        .iter()
        .map(|v| rt.iter(v))
        .collect::<RunResult<Vec<_>>>()?;
    Ok(iterator(PyIter::Zip { inners }))
}

pub(super) fn map(rt: &Runtime, args: Args) -> RunResult<Value> {
    args.no_keywords("map")?;
    let mut values = args.positional.into_iter();
    let (Some(func), Some(first)) = (values.next(), values.next()) else {
        return Err(ExcType::TypeError.msg("map() must have at least two arguments."));
    };
    let inners = std::iter::once(first)
        .chain(values)
        .map(|v| rt.iter(&v))
        .collect::<RunResult<Vec<_>>>()?;
    Ok(iterator(PyIter::Map { func, inners }))
}

pub(super) fn filter(rt: &Runtime, args: Args) -> RunResult<Value> {
    let (func, iterable) = args.get_two_args("filter")?;
    Ok(iterator(PyIter::Filter {
        func,
        inner: rt.iter(&iterable)?,
    }))
}

pub(super) fn reversed(rt: &Runtime, value: Value) -> RunResult<Value> {
    let it = match &value {
        Value::Range(r) => {
            let len = r.len() as i64;
            let range = if len == 0 {
                PyRange { start: 0, stop: 0, step: 1 }
            } else {
                let last = r.start + (len - 1) * r.step;
                PyRange {
                    start: last,
                    stop: r.start - r.step,
                    step: -r.step,
                }
            };
            PyIter::Range { range, index: 0 }
        }
        Value::List(_) | Value::Tuple(_) | Value::Str(_) => {
            let mut items = rt.to_vec(&value)?;
            items.reverse();
            PyIter::items(items, "reversed")
        }
        Value::Dict(d) => {
            let mut keys = d.borrow().keys();
            keys.reverse();
            PyIter::items(keys, "dict_reversekeyiterator")
        }
        _ => {
            if let Some(method) = rt.lookup_special(&value, "__reversed__") {
                return rt.call(&method, Args::empty());
            }
            return Err(ExcType::TypeError.msg(format!("'{}' object is not reversible", value.type_name())));
        }
    };
    Ok(iterator(it))
}
