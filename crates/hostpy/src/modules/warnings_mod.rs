//! Implementation of the `warnings` module.
//!
//! `warn(message, category=UserWarning, stacklevel=1)` prints
//! `<file>:<line>: <Category>: <message>` to `sys.stderr` and records the warning for
//! [`Runtime::take_warnings`].

use crate::{
    exception::{ExcType, Exception, RunResult},
    methods::bind_params,
    modules::add_function,
    runtime::Runtime,
    types::ModuleObj,
    value::{Type, Value},
};

pub(crate) fn create() -> ModuleObj {
    let module = ModuleObj::new("warnings");
    add_function(&module, "warn", |rt, args| {
        let mut bound = bind_params(args, "warn", &["message", "category", "stacklevel"], 1)?.into_iter();
        let message = bound.next().flatten().unwrap_or(Value::None);
        let category = bound.next().flatten().unwrap_or(Value::None);
        warn(rt, &message, &category)?;
        Ok(Value::None)
    });
    module
}

fn warn(rt: &Runtime, message: &Value, category: &Value) -> RunResult<()> {
    // a warning instance carries its own category
    if let Value::Exception(exc) = message {
        return rt.warn(exc.exc_type(), exc.message());
    }
    let category = match category {
        Value::None => ExcType::UserWarning,
        Value::Type(Type::Exc(exc_type)) if exc_type.is_subclass_of(ExcType::Warning) => *exc_type,
        Value::Class(class) => match class.exc_base.filter(|base| base.is_subclass_of(ExcType::Warning)) {
            Some(base) => base,
            None => return Err(category_error(category)),
        },
        other => return Err(category_error(other)),
    };
    rt.warn(category, rt.str(message)?)
}

fn category_error(category: &Value) -> Exception {
    ExcType::TypeError.msg(format!(
        "category must be a Warning subclass, not '{}'",
        category.repr_plain()
    ))
}

