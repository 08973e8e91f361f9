//! Built-in module implementations.
//!
//! Modules are created on first import and cached in `sys.modules` by
//! [`Runtime::import_module`](crate::runtime::Runtime::import_module).

use std::rc::Rc;

use strum::{EnumString, IntoStaticStr};

use crate::{
    args::Args,
    compile::{CompileFlags, CompileMode, compile},
    eval::{module_future, run_sync},
    exception::RunResult,
    parse::parse,
    runtime::Runtime,
    types::{ModuleObj, NativeFunction},
    value::{DictRef, Value},
};

pub(crate) mod asyncio;
pub(crate) mod future_mod;
pub(crate) mod js;
pub(crate) mod sys;
pub(crate) mod syncify_mod;
pub(crate) mod time_mod;
pub(crate) mod warnings_mod;

/// Built-in modules that can be imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, IntoStaticStr)]
pub(crate) enum BuiltinModule {
    /// `sys`: standard streams, `sys.modules`, `sys.last_*` and the async generator hooks.
    #[strum(serialize = "sys")]
    Sys,
    /// `asyncio`: the loop-backed subset of the standard module.
    #[strum(serialize = "asyncio")]
    Asyncio,
    /// `time`: wall clock and the host's monotonic clock.
    #[strum(serialize = "time")]
    Time,
    #[strum(serialize = "warnings")]
    Warnings,
    /// `__future__`: feature records, the compiler handles the imports themselves.
    #[strum(serialize = "__future__")]
    Future,
    /// `js`: the host namespace.
    #[strum(serialize = "js")]
    Js,
    #[strum(serialize = "syncify")]
    Syncify,
}

/// Creates the module called `name`, or `None` if no such module exists.
pub(crate) fn create(rt: &Runtime, name: &str) -> RunResult<Option<Value>> {
    let Ok(module) = name.parse::<BuiltinModule>() else {
        return Ok(None);
    };
    let object = match module {
        BuiltinModule::Sys => return Ok(Some(Value::Module(rt.sys().clone()))),
        BuiltinModule::Asyncio => asyncio::create(rt)?,
        BuiltinModule::Time => time_mod::create(),
        BuiltinModule::Warnings => warnings_mod::create(),
        BuiltinModule::Future => future_mod::create(),
        BuiltinModule::Js => js::create(rt),
        BuiltinModule::Syncify => syncify_mod::create(),
    };
    Ok(Some(Value::Module(Rc::new(object))))
}

/// Adds a native function to `module`.
pub(crate) fn add_function(
    module: &ModuleObj,
    name: &'static str,
    func: impl Fn(&Runtime, Args) -> RunResult<Value> + 'static,
) {
    module.set(name, NativeFunction::value(format!("{}.{name}", module.name), func));
}

/// Runs Python source that defines part of a module, then copies its public names into `module`.
///
/// The source runs in `globals`, which later calls of the defined functions keep using.
pub(crate) fn exec_source(rt: &Runtime, module: &ModuleObj, source: &str, globals: &DictRef) -> RunResult<()> {
    let filename = format!("<frozen {}>", module.name);
    let parsed = parse(source).map_err(|err| err.into_python_exc(&filename, source))?;
    let code = compile(parsed, source, &filename, CompileMode::Exec, CompileFlags::NONE)?;
    run_sync(module_future(rt, &code, globals.clone(), None))?;
    for (name, value) in globals.borrow().items() {
        if let Value::Str(name) = name {
            if !name.starts_with("__") {
                module.set(name, value);
            }
        }
    }
    Ok(())
}
