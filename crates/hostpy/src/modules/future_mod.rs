//! Implementation of the `__future__` module.
//!
//! The compiler acts on `from __future__ import ...` statements itself. The module only provides
//! the feature records: each feature is a `(name, compiler_flag)` tuple, and `all_feature_names`
//! lists them in order.

use crate::{
    compile::FUTURE_FEATURES,
    types::ModuleObj,
    value::Value,
};

pub(crate) fn create() -> ModuleObj {
    let module = ModuleObj::new("__future__");
    let mut names = Vec::with_capacity(FUTURE_FEATURES.len());
    for (name, flag) in FUTURE_FEATURES {
        module.set(
            name,
            Value::tuple(vec![Value::str(name), Value::Int(i64::from(flag.bits()))]),
        );
        names.push(Value::str(name));
    }
    module.set("all_feature_names", Value::list(names));
    module
}
