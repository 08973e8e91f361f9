//! `min()` and `max()`, which share their argument handling.

use crate::{
    args::Args,
    exception::{ExcType, RunResult},
    runtime::Runtime,
    value::Value,
};

pub(super) fn min_max(rt: &Runtime, args: Args, is_max: bool) -> RunResult<Value> {
    let name = if is_max { "max" } else { "min" };
    let mut args = args;
    let key = args.take_keyword("key").filter(|k| !k.is_none());
    let default = args.take_keyword("default");
    args.no_keywords(name)?;
    let items = match args.positional.len() {
        0 => {
            return Err(ExcType::TypeError.msg(format!("{name} expected at least 1 argument, got 0")));
        }
        1 => {
            let iterable = args.positional.remove(0);
            rt.to_vec(&iterable)?
        }
        _ => {
            if default.is_some() {
                return Err(ExcType::TypeError.msg(format!(
                    "Cannot specify a default for {name}() with multiple positional arguments"
                )));
            }
            args.positional
        }
    };
    let mut best: Option<(Value, Value)> = None;
    for item in items {
        let score = match &key {
            Some(func) => rt.call(func, Args::one(item.clone()))?,
            None => item.clone(),
        };
        best = Some(match best {
            None => (item, score),
            Some((best_item, best_score)) => {
                let better = if is_max {
                    rt.lt(&best_score, &score)?
                } else {
                    rt.lt(&score, &best_score)?
                };
                if better { (item, score) } else { (best_item, best_score) }
            }
        });
    }
    match (best, default) {
        (Some((item, _)), _) => Ok(item),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(ExcType::ValueError.msg(format!("{name}() iterable argument is empty"))),
    }
}
