//! `isinstance()` and `issubclass()`.

use crate::{
    exception::{ExcType, RunResult},
    value::Value,
};

/// `isinstance(obj, class_or_tuple)`.
pub(crate) fn isinstance(obj: &Value, class: &Value) -> RunResult<bool> {
    match class {
        Value::Tuple(classes) => {
            for class in classes.iter() {
                if isinstance(obj, class)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Type(_) | Value::Class(_) => issubclass(&obj.py_type(), class),
        other => Err(ExcType::TypeError.msg(format!(
            "isinstance() arg 2 must be a type, a tuple of types, or a union, not {}",
            other.type_name()
        ))),
    }
}

/// `issubclass(class, class_or_tuple)`.
pub(crate) fn issubclass(class: &Value, target: &Value) -> RunResult<bool> {
    if let Value::Tuple(targets) = target {
        for target in targets.iter() {
            if issubclass(class, target)? {
                return Ok(true);
            }
        }
        return Ok(false);
    }
    match (class, target) {
        (Value::Type(t), Value::Type(u)) => Ok(t.is_subtype_of(*u)),
        (Value::Type(_), Value::Class(_)) => Ok(false),
        (Value::Class(c), Value::Type(u)) => Ok(c.is_subclass_of_type(*u)),
        (Value::Class(c), Value::Class(d)) => Ok(c.is_subclass_of(d)),
        (Value::Type(_) | Value::Class(_), other) => Err(ExcType::TypeError.msg(format!(
            "issubclass() arg 2 must be a class, a tuple of classes, or a union, not {}",
            other.type_name()
        ))),
        _ => Err(ExcType::TypeError.msg("issubclass() arg 1 must be a class")),
    }
}

