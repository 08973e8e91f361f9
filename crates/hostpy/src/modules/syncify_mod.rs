//! Implementation of the `syncify` module.
//!
//! - `syncify(awaitable)`: runs `awaitable` to completion from synchronous code
//! - `sleep(delay, result=None)`: a syncifyable timer
//! - `gather(*tasks)`: runs several syncifyable tasks together
//!
//! `sleep` and `gather` return objects that can also be awaited on the event loop.

use std::rc::Rc;

use crate::{
    methods::bind_params,
    modules::add_function,
    syncify::{AwaitableTask, SleepTask, SyncifyableGather, SyncifyableTask, syncify},
    types::ModuleObj,
    value::Value,
    webloop::seconds,
};

pub(crate) fn create() -> ModuleObj {
    let module = ModuleObj::new("syncify");
    add_function(&module, "syncify", |rt, args| {
        let awaitable = args.get_one_arg("syncify")?;
        syncify(rt, awaitable)
    });
    add_function(&module, "sleep", |rt, args| {
        let mut bound = bind_params(args, "sleep", &["delay", "result"], 1)?.into_iter();
        let delay = seconds(&bound.next().flatten().unwrap_or(Value::None), "delay")?;
        let result = bound.next().flatten().unwrap_or(Value::None);
        Ok(Value::SyncTask(Rc::new(SleepTask::new(rt, delay, result))))
    });
    add_function(&module, "gather", |rt, args| {
        args.no_keywords("gather")?;
        let tasks = args
            .positional
            .into_iter()
            .map(|value| -> Rc<dyn SyncifyableTask> {
                match value {
                    Value::SyncTask(task) => task,
                    other => Rc::new(AwaitableTask::new(rt, other)),
                }
            })
            .collect();
        Ok(Value::SyncTask(Rc::new(SyncifyableGather::new(rt, tasks))))
    });
    module
}
