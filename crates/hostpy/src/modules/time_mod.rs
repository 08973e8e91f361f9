//! Implementation of the `time` module.
//!
//! - `time()`: seconds since the Unix epoch, from the system clock
//! - `monotonic()`: the host clock, the same one the event loop schedules against

use std::time::{SystemTime, UNIX_EPOCH};

use crate::{modules::add_function, types::ModuleObj, value::Value};

pub(crate) fn create() -> ModuleObj {
    let module = ModuleObj::new("time");
    add_function(&module, "time", |_, args| {
        args.check_zero_args("time")?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0.0, |elapsed| elapsed.as_secs_f64());
        Ok(Value::Float(now))
    });
    add_function(&module, "monotonic", |rt, args| {
        args.check_zero_args("monotonic")?;
        Ok(Value::Float(rt.host().now()))
    });
    module
}
