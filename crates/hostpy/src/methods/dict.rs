//! `dict` and `set` methods.
//!
//! `keys()`, `values()` and `items()` return list snapshots rather than live views.

use std::{cell::RefCell, rc::Rc};

use indexmap::IndexMap;

use super::bind_params;
use crate::{
    args::Args,
    exception::{ExcType, Exception, RunResult},
    runtime::Runtime,
    types::Dict,
    value::{DictRef, HashKey, SetRef, Value},
};

pub(super) const DICT_METHODS: &[&str] = &[
    "clear", "copy", "get", "items", "keys", "pop", "popitem", "setdefault", "update", "values",
];

pub(super) const DICT_TYPE_METHODS: &[&str] = &[
    "clear", "copy", "fromkeys", "get", "items", "keys", "pop", "popitem", "setdefault", "update", "values",
];

pub(super) const SET_METHODS: &[&str] = &[
    "add",
    "clear",
    "copy",
    "difference",
    "discard",
    "intersection",
    "isdisjoint",
    "issubset",
    "issuperset",
    "pop",
    "remove",
    "symmetric_difference",
    "union",
    "update",
];

fn key_error(key: Value) -> Exception {
    Exception::new(ExcType::KeyError, vec![key])
}

pub(super) fn call_dict(rt: &Runtime, dict: &DictRef, name: &str, args: Args) -> RunResult<Value> {
    match name {
        "keys" => {
            args.check_zero_args("keys")?;
            Ok(Value::list(dict.borrow().keys()))
        }
        "values" => {
            args.check_zero_args("values")?;
            Ok(Value::list(dict.borrow().values()))
        }
        "items" => {
            args.check_zero_args("items")?;
            let items = dict.borrow().items();
            Ok(Value::list(items.into_iter().map(|(k, v)| Value::tuple(vec![k, v])).collect()))
        }
        "get" => {
            let values = args.get_range("get", 1, 2)?;
            let key = values[0].hash_key()?;
            let found = dict.borrow().get(&key);
            Ok(found.or_else(|| values.get(1).cloned()).unwrap_or(Value::None))
        }
        "pop" => {
            let mut values = args.get_range("pop", 1, 2)?.into_iter();
            let (Some(key), default) = (values.next(), values.next()) else {
                return Err(ExcType::TypeError.msg("pop expected at least 1 argument, got 0"));
            };
            let removed = dict.borrow_mut().remove(&key.hash_key()?);
            match (removed, default) {
                (Some((_, value)), _) => Ok(value),
                (None, Some(default)) => Ok(default),
                (None, None) => Err(key_error(key)),
            }
        }
        "popitem" => {
            args.check_zero_args("popitem")?;
            let last = dict.borrow_mut().pop_last();
            last.map(|(k, v)| Value::tuple(vec![k, v]))
                .ok_or_else(|| ExcType::KeyError.msg("popitem(): dictionary is empty"))
        }
        "setdefault" => {
            let mut values = args.get_range("setdefault", 1, 2)?.into_iter();
            let (Some(key), default) = (values.next(), values.next()) else {
                return Err(ExcType::TypeError.msg("setdefault expected at least 1 argument, got 0"));
            };
            let hash_key = key.hash_key()?;
            let existing = dict.borrow().get(&hash_key);
            if let Some(value) = existing {
                return Ok(value);
            }
            let default = default.unwrap_or(Value::None);
            dict.borrow_mut().set_hashed(hash_key, key, default.clone());
            Ok(default)
        }
        "update" => {
            let mut args = args;
            let keywords = std::mem::take(&mut args.keywords);
            if let Some(other) = args.get_zero_one_arg("update")? {
                update_from(rt, dict, &other)?;
            }
            for (key, value) in keywords {
                let old = dict.borrow_mut().set_str(key, value);
                drop(old);
            }
            Ok(Value::None)
        }
        "clear" => {
            args.check_zero_args("clear")?;
            let old = dict.borrow_mut().take();
            drop(old);
            Ok(Value::None)
        }
        "copy" => {
            args.check_zero_args("copy")?;
            Ok(Value::dict(dict.borrow().clone()))
        }
        _ => Err(ExcType::AttributeError.msg(format!("'dict' object has no attribute '{name}'"))),
    }
}

/// Merges a mapping or an iterable of pairs into `dict`.
fn update_from(rt: &Runtime, dict: &DictRef, other: &Value) -> RunResult<()> {
    let pairs = if matches!(other, Value::Dict(_)) || rt.hasattr(other, "keys")? {
        rt.mapping_items(other)?
    } else {
        let mut pairs = Vec::new();
        for (i, item) in rt.to_vec(other)?.into_iter().enumerate() {
            let pair = rt.to_vec(&item)?;
            let Ok([key, value]) = <[Value; 2]>::try_from(pair) else {
                return Err(ExcType::ValueError.msg(format!(
                    "dictionary update sequence element #{i} has wrong length; 2 is required"
                )));
            };
            pairs.push((key, value));
        }
        pairs
    };
    for (key, value) in pairs {
        let old = dict.borrow_mut().set(key, value)?;
        drop(old);
    }
    Ok(())
}

/// `dict.fromkeys(iterable, value=None)`.
pub(super) fn fromkeys(rt: &Runtime, args: Args) -> RunResult<Value> {
    let params = bind_params(args, "fromkeys", &["iterable", "value"], 1)?;
    let value = params[1].clone().unwrap_or(Value::None);
    let mut dict = Dict::new();
    if let Some(iterable) = &params[0] {
        for key in rt.to_vec(iterable)? {
            dict.set(key, value.clone())?;
        }
    }
    Ok(Value::dict(dict))
}

/// Hash keys of every item of an iterable.
fn key_set(rt: &Runtime, other: &Value) -> RunResult<IndexMap<HashKey, Value>> {
    if let Value::Set(set) = other {
        return Ok(set.borrow().clone());
    }
    let mut out = IndexMap::new();
    for item in rt.to_vec(other)? {
        out.entry(item.hash_key()?).or_insert(item);
    }
    Ok(out)
}

fn set_value(items: IndexMap<HashKey, Value>) -> Value {
    Value::Set(Rc::new(RefCell::new(items)))
}

pub(super) fn call_set(rt: &Runtime, set: &SetRef, name: &str, args: Args) -> RunResult<Value> {
    match name {
        "add" => {
            let item = args.get_one_arg("add")?;
            let key = item.hash_key()?;
            set.borrow_mut().entry(key).or_insert(item);
            Ok(Value::None)
        }
        "discard" | "remove" => {
            let item = args.get_one_arg(name)?;
            let removed = set.borrow_mut().shift_remove(&item.hash_key()?);
            match removed {
                Some(old) => {
                    drop(old);
                    Ok(Value::None)
                }
                None if name == "discard" => Ok(Value::None),
                None => Err(key_error(item)),
            }
        }
        "pop" => {
            args.check_zero_args("pop")?;
            let first = set.borrow_mut().shift_remove_index(0);
            first
                .map(|(_, v)| v)
                .ok_or_else(|| ExcType::KeyError.msg("pop from an empty set"))
        }
        "clear" => {
            args.check_zero_args("clear")?;
            let old = std::mem::take(&mut *set.borrow_mut());
            drop(old);
            Ok(Value::None)
        }
        "copy" => {
            args.check_zero_args("copy")?;
            Ok(set_value(set.borrow().clone()))
        }
        "update" => {
            args.no_keywords("update")?;
            for other in &args.positional {
                let items = key_set(rt, other)?;
                let mut target = set.borrow_mut();
                for (key, value) in items {
                    target.entry(key).or_insert(value);
                }
            }
            Ok(Value::None)
        }
        "union" | "intersection" | "difference" | "symmetric_difference" => {
            args.no_keywords(name)?;
            if name == "symmetric_difference" && args.positional.len() != 1 {
                return Err(crate::args::type_error_arg_count(name, 1, args.positional.len()));
            }
            let mut result = set.borrow().clone();
            for other in &args.positional {
                let other = key_set(rt, other)?;
                result = match name {
                    "union" => {
                        for (key, value) in other {
                            result.entry(key).or_insert(value);
                        }
                        result
                    }
                    "intersection" => result.into_iter().filter(|(k, _)| other.contains_key(k)).collect(),
                    "difference" => result.into_iter().filter(|(k, _)| !other.contains_key(k)).collect(),
                    _ => {
                        let mut out: IndexMap<HashKey, Value> =
                            result.iter().filter(|(k, _)| !other.contains_key(*k)).map(|(k, v)| (k.clone(), v.clone())).collect();
                        for (key, value) in other {
                            if !result.contains_key(&key) {
                                out.insert(key, value);
                            }
                        }
                        out
                    }
                };
            }
            Ok(set_value(result))
        }
        "issubset" | "issuperset" | "isdisjoint" => {
            let other = key_set(rt, &args.get_one_arg(name)?)?;
            let mine = set.borrow();
            let answer = match name {
                "issubset" => mine.keys().all(|k| other.contains_key(k)),
                "issuperset" => other.keys().all(|k| mine.contains_key(k)),
                _ => !mine.keys().any(|k| other.contains_key(k)),
            };
            Ok(Value::Bool(answer))
        }
        _ => Err(ExcType::AttributeError.msg(format!("'set' object has no attribute '{name}'"))),
    }
}
