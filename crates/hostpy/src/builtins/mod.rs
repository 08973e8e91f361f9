//! Python builtin functions and type constructors.
//!
//! Builtin functions are a fieldless enum so they are `Copy` and compare by identity; each
//! group of related builtins has its own submodule.

mod iter;
pub(crate) mod isinstance;
mod min_max;
mod numeric;
mod print;
mod type_;

use std::rc::Rc;

use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::{
    args::Args,
    exception::{ExcType, RunResult},
    fstring,
    runtime::Runtime,
    types::{Dict, SuperObj},
    value::{Type, Value},
};
pub(crate) use type_::{construct, float_to_int};

/// Every builtin function exposed in the `builtins` namespace.
///
/// Uses strum derives for `Display`, `FromStr` and `Into<&'static str>`; variants serialize to
/// the lowercase Python name (e.g. `Print` -> "print").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum BuiltinFn {
    Abs,
    Aiter,
    All,
    Anext,
    Any,
    Ascii,
    Bin,
    Callable,
    Chr,
    Delattr,
    Dir,
    Divmod,
    Enumerate,
    Filter,
    Format,
    Getattr,
    Globals,
    Hasattr,
    Hash,
    Hex,
    Id,
    Input,
    Isinstance,
    Issubclass,
    Iter,
    Len,
    Locals,
    Map,
    Max,
    Min,
    Next,
    Oct,
    Ord,
    Pow,
    Print,
    Repr,
    Reversed,
    Round,
    Setattr,
    Sorted,
    Sum,
    Super,
    Vars,
    Zip,
    #[strum(serialize = "__import__")]
    Import,
}

impl BuiltinFn {
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Calls this builtin with the given arguments.
    pub fn call(self, rt: &Runtime, args: Args) -> RunResult<Value> {
        match self {
            Self::Abs => numeric::abs(rt, args.get_one_arg("abs")?),
            Self::Aiter => {
                let value = args.get_one_arg("aiter")?;
                rt.aiter(&value)
            }
            Self::All | Self::Any => {
                let all = self == Self::All;
                let iterable = args.get_one_arg(self.name())?;
                let it = rt.iter(&iterable)?;
                while let Some(item) = rt.iter_next(&it)? {
                    if rt.truthy(&item)? != all {
                        return Ok(Value::Bool(!all));
                    }
                }
                Ok(Value::Bool(all))
            }
            Self::Anext => iter::anext(rt, args),
            Self::Ascii => {
                let value = args.get_one_arg("ascii")?;
                Ok(Value::str(fstring::ascii_escape(&rt.repr(&value)?)))
            }
            Self::Bin | Self::Hex | Self::Oct => numeric::radix(rt, self, args.get_one_arg(self.name())?),
            Self::Callable => Ok(Value::Bool(is_callable(&args.get_one_arg("callable")?))),
            Self::Chr => {
                let code = rt.index(&args.get_one_arg("chr")?)?;
                u32::try_from(code)
                    .ok()
                    .and_then(char::from_u32)
                    .map(|c| Value::str(c.to_string()))
                    .ok_or_else(|| ExcType::ValueError.msg("chr() arg not in range(0x110000)"))
            }
            Self::Ord => {
                let value = args.get_one_arg("ord")?;
                let Value::Str(s) = &value else {
                    return Err(ExcType::TypeError.msg(format!(
                        "ord() expected string of length 1, but {} found",
                        value.type_name()
                    )));
                };
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Ok(Value::Int(i64::from(u32::from(c)))),
                    _ => Err(ExcType::TypeError.msg(format!(
                        "ord() expected a character, but string of length {} found",
                        s.chars().count()
                    ))),
                }
            }
            Self::Delattr => {
                let (obj, name) = args.get_two_args("delattr")?;
                rt.delattr(&obj, attr_name(&name)?)?;
                Ok(Value::None)
            }
            Self::Getattr => {
                let values = args.get_range("getattr", 2, 3)?;
                let name = attr_name(&values[1])?;
                match (rt.getattr(&values[0], name), values.get(2)) {
                    (Err(exc), Some(default)) if exc.is_instance(ExcType::AttributeError) => Ok(default.clone()),
                    (result, _) => result,
                }
            }
            Self::Hasattr => {
                let (obj, name) = args.get_two_args("hasattr")?;
                rt.hasattr(&obj, attr_name(&name)?).map(Value::Bool)
            }
            Self::Setattr => {
                let values = args.get_range("setattr", 3, 3)?;
                let count = values.len();
                let [obj, name, value] = <[Value; 3]>::try_from(values)
                    .map_err(|_| crate::args::type_error_arg_count("setattr", 3, count))?;
                rt.setattr(&obj, attr_name(&name)?, value)?;
                Ok(Value::None)
            }
            Self::Dir => match args.get_zero_one_arg("dir")? {
                Some(obj) => Ok(Value::list(rt.dir(&obj).into_iter().map(Value::Str).collect())),
                None => {
                    let locals = current_locals(rt)?;
                    let mut names = locals.borrow().str_keys();
                    names.sort();
                    Ok(Value::list(names.into_iter().map(Value::Str).collect()))
                }
            },
            Self::Divmod => {
                let (a, b) = args.get_two_args("divmod")?;
                let quotient = rt.binary_op(&a, crate::expressions::Operator::FloorDiv, &b)?;
                let remainder = rt.binary_op(&a, crate::expressions::Operator::Mod, &b)?;
                Ok(Value::tuple(vec![quotient, remainder]))
            }
            Self::Enumerate => iter::enumerate(rt, args),
            Self::Filter => iter::filter(rt, args),
            Self::Map => iter::map(rt, args),
            Self::Zip => iter::zip(rt, args),
            Self::Iter => iter::iter(rt, args),
            Self::Next => iter::next(rt, args),
            Self::Reversed => iter::reversed(rt, args.get_one_arg("reversed")?),
            Self::Format => {
                let (value, spec) = args.get_one_two_args("format")?;
                let spec = match &spec {
                    Some(Value::Str(s)) => s.to_string(),
                    Some(other) => {
                        return Err(ExcType::TypeError.msg(format!(
                            "format() argument 2 must be str, not {}",
                            other.type_name()
                        )));
                    }
                    None => String::new(),
                };
                fstring::format_value(rt, &value, &spec).map(Value::str)
            }
            Self::Globals => {
                args.check_zero_args("globals")?;
                let frame = rt
                    .current_frame()
                    .ok_or_else(|| ExcType::RuntimeError.msg("globals(): no current frame"))?;
                Ok(Value::Dict(frame.globals.clone()))
            }
            Self::Locals => {
                args.check_zero_args("locals")?;
                Ok(Value::Dict(current_locals(rt)?))
            }
            Self::Vars => match args.get_zero_one_arg("vars")? {
                Some(obj) => rt.getattr(&obj, "__dict__").map_err(|exc| {
                    if exc.is_instance(ExcType::AttributeError) {
                        ExcType::TypeError.msg("vars() argument must have __dict__ attribute")
                    } else {
                        exc
                    }
                }),
                None => Ok(Value::Dict(current_locals(rt)?)),
            },
            Self::Hash => {
                let value = args.get_one_arg("hash")?;
                Ok(Value::Int(rt.hash(&value)?.python_hash()))
            }
            Self::Id => {
                let value = args.get_one_arg("id")?;
                Ok(Value::Int(value.identity() as i64))
            }
            Self::Input => print::input(rt, args),
            Self::Isinstance => {
                let (obj, class) = args.get_two_args("isinstance")?;
                isinstance::isinstance(&obj, &class).map(Value::Bool)
            }
            Self::Issubclass => {
                let (class, target) = args.get_two_args("issubclass")?;
                isinstance::issubclass(&class, &target).map(Value::Bool)
            }
            Self::Len => {
                let value = args.get_one_arg("len")?;
                Ok(Value::Int(rt.len(&value)? as i64))
            }
            Self::Max => min_max::min_max(rt, args, true),
            Self::Min => min_max::min_max(rt, args, false),
            Self::Pow => numeric::pow(rt, args),
            Self::Round => numeric::round(rt, args),
            Self::Sum => numeric::sum(rt, args),
            Self::Print => print::print(rt, args),
            Self::Repr => {
                let value = args.get_one_arg("repr")?;
                rt.repr(&value).map(Value::str)
            }
            Self::Sorted => {
                let mut args = args;
                let key = args.take_keyword("key");
                let reverse = match args.take_keyword("reverse") {
                    Some(v) => rt.truthy(&v)?,
                    None => false,
                };
                let iterable = args.get_one_arg("sorted")?;
                let mut items = rt.to_vec(&iterable)?;
                rt.sort_values(&mut items, key.as_ref(), reverse)?;
                Ok(Value::list(items))
            }
            Self::Super => {
                let values = args.get_range("super", 0, 2)?;
                match values.as_slice() {
                    [] => rt.super_from_frame(),
                    [Value::Class(class), obj] => Ok(Value::Super(Rc::new(SuperObj {
                        class: class.clone(),
                        obj: obj.clone(),
                    }))),
                    [other, ..] => Err(ExcType::TypeError.msg(format!(
                        "super() argument 1 must be a type, not {}",
                        other.type_name()
                    ))),
                }
            }
            Self::Import => {
                let name = args.get_one_arg("__import__")?;
                match &name {
                    Value::Str(s) => rt.import_module(s),
                    other => Err(ExcType::TypeError.msg(format!(
                        "__import__() argument 1 must be str, not {}",
                        other.type_name()
                    ))),
                }
            }
        }
    }
}

/// Types exposed under their Python names in `builtins`.
const BUILTIN_TYPES: [Type; 15] = [
    Type::Object,
    Type::Type,
    Type::Bool,
    Type::Int,
    Type::Float,
    Type::Str,
    Type::List,
    Type::Tuple,
    Type::Dict,
    Type::Set,
    Type::Range,
    Type::Slice,
    Type::Property,
    Type::StaticMethod,
    Type::ClassMethod,
];

/// Fills a fresh `builtins` namespace.
pub(crate) fn install(dict: &mut Dict) {
    for func in BuiltinFn::iter() {
        dict.set_str(func.name(), Value::Builtin(func));
    }
    for t in BUILTIN_TYPES {
        dict.set_str(t.name(), Value::Type(t));
    }
    for exc in ExcType::iter() {
        if exc.module().is_none() && exc != ExcType::EvalCodeResult {
            dict.set_str(exc.to_string(), Value::Type(Type::Exc(exc)));
        }
    }
    dict.set_str("NotImplemented", Value::NotImplemented);
    dict.set_str("Ellipsis", Value::Ellipsis);
}

fn attr_name(name: &Value) -> RunResult<&str> {
    name.as_str().ok_or_else(|| {
        ExcType::TypeError.msg(format!(
            "attribute name must be string, not '{}'",
            name.type_name()
        ))
    })
}

fn current_locals(rt: &Runtime) -> RunResult<crate::value::DictRef> {
    rt.current_frame()
        .map(|frame| frame.locals_dict())
        .ok_or_else(|| ExcType::RuntimeError.msg("locals(): no current frame"))
}

/// `callable(value)`.
pub(crate) fn is_callable(value: &Value) -> bool {
    match value {
        Value::Function(_)
        | Value::Builtin(_)
        | Value::Native(_)
        | Value::BoundMethod(_)
        | Value::BuiltinMethod(_)
        | Value::Type(_)
        | Value::Class(_) => true,
        Value::Instance(inst) => inst.class.lookup("__call__").is_some(),
        _ => false,
    }
}
