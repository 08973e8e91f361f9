//! Methods of numbers, exceptions, coroutines, generators, iterators and text streams.

use std::rc::Rc;

use crate::{
    args::Args,
    exception::{ExcType, RunResult},
    runtime::Runtime,
    types::stop_iteration,
    value::Value,
};

pub(super) const INT_METHODS: &[&str] = &["bit_length", "conjugate", "is_integer"];

pub(super) const FLOAT_METHODS: &[&str] = &["conjugate", "is_integer"];

pub(super) const EXCEPTION_METHODS: &[&str] = &["add_note", "with_traceback"];

pub(super) const COROUTINE_METHODS: &[&str] = &["close"];

pub(super) const GENERATOR_METHODS: &[&str] = &["__next__", "close", "send", "throw"];

pub(super) const ASYNC_GENERATOR_METHODS: &[&str] = &["__anext__", "aclose", "asend", "athrow"];

pub(super) const ITERATOR_METHODS: &[&str] = &["__next__"];

pub(super) const STREAM_METHODS: &[&str] = &["flush", "isatty", "readable", "readline", "writable", "write"];

pub(super) fn call(rt: &Runtime, receiver: &Value, name: &str, args: Args) -> RunResult<Value> {
    match (receiver, name) {
        (Value::Int(_) | Value::BigInt(_) | Value::Bool(_), _) => call_int(receiver, name, args),
        (Value::Float(f), "conjugate") => {
            args.check_zero_args("conjugate")?;
            Ok(Value::Float(*f))
        }
        (Value::Float(f), "is_integer") => {
            args.check_zero_args("is_integer")?;
            Ok(Value::Bool(f.is_finite() && f.fract() == 0.0))
        }
        (Value::Exception(exc), "add_note") => {
            let note = args.get_one_arg("add_note")?;
            if !matches!(note, Value::Str(_)) {
                return Err(ExcType::TypeError.msg(format!(
                    "note must be a str, not '{}'",
                    note.type_name()
                )));
            }
            match exc.get_attr("__notes__") {
                Some(Value::List(notes)) => notes.borrow_mut().push(note),
                _ => exc.set_attr("__notes__".into(), Value::list(vec![note])),
            }
            Ok(Value::None)
        }
        (Value::Exception(exc), "with_traceback") => {
            if args.get_one_arg("with_traceback")?.is_none() {
                exc.clear_traceback();
            }
            Ok(receiver.clone())
        }
        (Value::Coroutine(coro), "close") => {
            args.check_zero_args("close")?;
            coro.close();
            Ok(Value::None)
        }
        (Value::Generator(generator), _) => match name {
            "__next__" => {
                args.check_zero_args("__next__")?;
                generator.next()?.ok_or_else(|| stop_iteration(Value::None))
            }
            "send" => generator.send(args.get_one_arg("send")?),
            "throw" => {
                let exc = rt.make_exception(args.get_one_arg("throw")?)?;
                generator.throw(exc)
            }
            "close" => {
                args.check_zero_args("close")?;
                generator.close()?;
                Ok(Value::None)
            }
            _ => Err(no_method(receiver, name)),
        },
        (Value::AsyncGenerator(agen), _) => {
            let coro = match name {
                "__anext__" => {
                    args.check_zero_args("__anext__")?;
                    agen.anext()?
                }
                "asend" => agen.asend(args.get_one_arg("asend")?)?,
                "athrow" => agen.athrow(rt.make_exception(args.get_one_arg("athrow")?)?)?,
                "aclose" => {
                    args.check_zero_args("aclose")?;
                    agen.aclose()?
                }
                _ => return Err(no_method(receiver, name)),
            };
            Ok(Value::Coroutine(coro))
        }
        (Value::Iterator(_), "__next__") => {
            args.check_zero_args("__next__")?;
            rt.iter_next(receiver)?.ok_or_else(|| ExcType::StopIteration.bare())
        }
        (Value::Stream(stream), _) => call_stream(rt, stream, name, args),
        _ => Err(no_method(receiver, name)),
    }
}

fn call_int(receiver: &Value, name: &str, args: Args) -> RunResult<Value> {
    args.check_zero_args(name)?;
    match name {
        "bit_length" => {
            let bits = match receiver {
                Value::BigInt(big) => big.bits(),
                _ => u64::from(64 - receiver.as_int().unwrap_or(0).unsigned_abs().leading_zeros()),
            };
            Ok(Value::Int(i64::try_from(bits).unwrap_or(i64::MAX)))
        }
        "conjugate" => Ok(match receiver {
            Value::Bool(b) => Value::Int(i64::from(*b)),
            other => other.clone(),
        }),
        "is_integer" => Ok(Value::Bool(true)),
        _ => Err(no_method(receiver, name)),
    }
}

fn call_stream(rt: &Runtime, stream: &Rc<crate::io::TextStream>, name: &str, args: Args) -> RunResult<Value> {
    match name {
        "write" => {
            let text = args.get_one_arg("write")?;
            let Value::Str(text) = text else {
                return Err(ExcType::TypeError.msg(format!(
                    "write() argument must be str, not {}",
                    text.type_name()
                )));
            };
            if !stream.is_writable() {
                return Err(ExcType::ValueError.msg("not writable"));
            }
            stream.write(&text);
            Ok(Value::Int(text.chars().count() as i64))
        }
        "flush" => {
            args.check_zero_args("flush")?;
            stream.flush();
            Ok(Value::None)
        }
        "readline" => {
            let limit = match args.get_zero_one_arg("readline")? {
                None | Some(Value::None) => None,
                Some(size) => usize::try_from(rt.index(&size)?).ok(),
            };
            stream.readline_limit(limit).map(Value::str)
        }
        "isatty" => {
            args.check_zero_args("isatty")?;
            Ok(Value::Bool(true))
        }
        "readable" => {
            args.check_zero_args("readable")?;
            Ok(Value::Bool(stream.is_readable()))
        }
        "writable" => {
            args.check_zero_args("writable")?;
            Ok(Value::Bool(stream.is_writable()))
        }
        _ => Err(ExcType::AttributeError.msg(format!("'TextStream' object has no attribute '{name}'"))),
    }
}

fn no_method(receiver: &Value, name: &str) -> crate::exception::Exception {
    ExcType::AttributeError.msg(format!(
        "'{}' object has no attribute '{name}'",
        receiver.type_name()
    ))
}
