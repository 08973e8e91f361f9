//! `list` and `tuple` methods.
//!
//! Items are cloned out of the list before comparing them, since `__eq__` may run Python code
//! that touches the same list.

use std::rc::Rc;

use super::{bind_params, opt_index};
use crate::{
    args::Args,
    exception::{ExcType, RunResult},
    runtime::Runtime,
    value::{ListRef, Value},
};

pub(super) const LIST_METHODS: &[&str] = &[
    "append", "clear", "copy", "count", "extend", "index", "insert", "pop", "remove", "reverse", "sort",
];

pub(super) const TUPLE_METHODS: &[&str] = &["count", "index"];

pub(super) fn call_list(rt: &Runtime, receiver: &Value, list: &ListRef, name: &str, args: Args) -> RunResult<Value> {
    match name {
        "append" => {
            let item = args.get_one_arg("append")?;
            list.borrow_mut().push(item);
            Ok(Value::None)
        }
        "extend" => {
            let iterable = args.get_one_arg("extend")?;
            let items = rt.to_vec(&iterable)?;
            list.borrow_mut().extend(items);
            Ok(Value::None)
        }
        "insert" => {
            let (index, item) = args.get_two_args("insert")?;
            let index = rt.index(&index)?;
            let mut items = list.borrow_mut();
            let len = items.len() as i64;
            let at = if index < 0 { (index + len).max(0) } else { index.min(len) };
            items.insert(usize::try_from(at).unwrap_or(0), item);
            Ok(Value::None)
        }
        "pop" => {
            let index = opt_index(rt, args.get_zero_one_arg("pop")?.as_ref())?.unwrap_or(-1);
            let mut items = list.borrow_mut();
            if items.is_empty() {
                return Err(ExcType::IndexError.msg("pop from empty list"));
            }
            let len = items.len() as i64;
            let at = if index < 0 { index + len } else { index };
            if !(0..len).contains(&at) {
                return Err(ExcType::IndexError.msg("pop index out of range"));
            }
            Ok(items.remove(usize::try_from(at).unwrap_or(0)))
        }
        "remove" => {
            let target = args.get_one_arg("remove")?;
            match position(rt, list, &target, 0, None)? {
                Some(i) => {
                    let removed = list.borrow_mut().remove(i);
                    drop(removed);
                    Ok(Value::None)
                }
                None => Err(ExcType::ValueError.msg("list.remove(x): x not in list")),
            }
        }
        "index" => {
            let values = args.get_range("index", 1, 3)?;
            let len = list.borrow().len();
            let (start, end) = bounds(rt, &values, len)?;
            match position(rt, list, &values[0], start, Some(end))? {
                Some(i) => Ok(Value::Int(i as i64)),
                None => Err(ExcType::ValueError.msg(format!("{} is not in list", rt.repr(&values[0])?))),
            }
        }
        "count" => {
            let target = args.get_one_arg("count")?;
            let snapshot = list.borrow().clone();
            count(rt, &snapshot, &target)
        }
        "clear" => {
            args.check_zero_args("clear")?;
            let old = std::mem::take(&mut *list.borrow_mut());
            drop(old);
            Ok(Value::None)
        }
        "copy" => {
            args.check_zero_args("copy")?;
            Ok(Value::list(list.borrow().clone()))
        }
        "reverse" => {
            args.check_zero_args("reverse")?;
            list.borrow_mut().reverse();
            Ok(Value::None)
        }
        "sort" => {
            if !args.positional.is_empty() {
                return Err(ExcType::TypeError.msg("sort() takes no positional arguments"));
            }
            let params = bind_params(args, "sort", &["key", "reverse"], 0)?;
            let key = params[0].clone().filter(|k| !k.is_none());
            let reverse = match &params[1] {
                Some(v) => rt.truthy(v)?,
                None => false,
            };
            let mut items = std::mem::take(&mut *list.borrow_mut());
            let sorted = rt.sort_values(&mut items, key.as_ref(), reverse);
            let intruders = std::mem::replace(&mut *list.borrow_mut(), items);
            let modified = !intruders.is_empty();
            drop(intruders);
            sorted?;
            if modified {
                return Err(ExcType::ValueError.msg("list modified during sort"));
            }
            Ok(Value::None)
        }
        _ => Err(ExcType::AttributeError.msg(format!(
            "'{}' object has no attribute '{name}'",
            receiver.type_name()
        ))),
    }
}

pub(super) fn call_tuple(rt: &Runtime, items: &Rc<[Value]>, name: &str, args: Args) -> RunResult<Value> {
    match name {
        "count" => count(rt, items, &args.get_one_arg("count")?),
        "index" => {
            let values = args.get_range("index", 1, 3)?;
            let (start, end) = bounds(rt, &values, items.len())?;
            for (i, item) in items.iter().enumerate().take(end).skip(start) {
                if rt.eq(item, &values[0])? {
                    return Ok(Value::Int(i as i64));
                }
            }
            Err(ExcType::ValueError.msg("tuple.index(x): x not in tuple"))
        }
        _ => Err(ExcType::AttributeError.msg(format!("'tuple' object has no attribute '{name}'"))),
    }
}

/// Optional `start` / `end` arguments following the searched value.
fn bounds(rt: &Runtime, values: &[Value], len: usize) -> RunResult<(usize, usize)> {
    let len = len as i64;
    let resolve = |v: Option<i64>, default: i64| match v {
        None => default,
        Some(i) if i < 0 => (i + len).max(0),
        Some(i) => i.min(len),
    };
    let start = resolve(opt_index(rt, values.get(1))?, 0);
    let end = resolve(opt_index(rt, values.get(2))?, len);
    Ok((usize::try_from(start).unwrap_or(0), usize::try_from(end).unwrap_or(0)))
}

fn position(rt: &Runtime, list: &ListRef, target: &Value, start: usize, end: Option<usize>) -> RunResult<Option<usize>> {
    let mut i = start;
    loop {
        if end.is_some_and(|end| i >= end) {
            return Ok(None);
        }
        let Some(item) = list.borrow().get(i).cloned() else {
            return Ok(None);
        };
        if rt.eq(&item, target)? {
            return Ok(Some(i));
        }
        i += 1;
    }
}

fn count(rt: &Runtime, items: &[Value], target: &Value) -> RunResult<Value> {
    let mut n = 0;
    for item in items {
        if rt.eq(item, target)? {
            n += 1;
        }
    }
    Ok(Value::Int(n))
}
