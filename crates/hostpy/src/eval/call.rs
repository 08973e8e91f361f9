use std::rc::Rc;

use ahash::AHashMap;

use super::{Flow, Frame, FrameFuture, Scope, ScopeOwner, exec_block, run_sync};
use crate::{
    args::Args,
    builtins,
    exception::{ExcClass, ExcType, Exception, RunResult},
    methods,
    runtime::Runtime,
    types::{
        AsyncGenerator, Class, Coroutine, Descriptor, Dict, Function, GenChannel, GenCore, Generator, Instance,
        SuperObj,
    },
    value::Value,
};

impl Runtime {
    /// Calls a Python callable.
    ///
    /// Calls are synchronous: a plain function runs to completion here, while calling an
    /// `async def` function or a generator function only creates the coroutine or generator.
    pub fn call(&self, func: &Value, args: Args) -> RunResult<Value> {
        match func {
            Value::Function(f) => call_function(self, f, args),
            Value::Builtin(b) => b.call(self, args),
            Value::Native(n) => (n.func)(self, args),
            Value::BoundMethod(m) => self.call(&m.func, args.prepend(m.receiver.clone())),
            Value::BuiltinMethod(m) => methods::call_method(self, &m.receiver, &m.name, args),
            Value::Type(t) => builtins::construct(self, *t, args),
            Value::Class(c) => self.instantiate(c, args),
            Value::Descriptor(d) if matches!(**d, Descriptor::StaticMethod(_)) => self.call(&d.inner(), args),
            Value::Instance(inst) => match inst.class.lookup("__call__") {
                Some(method) => self.call(&method, args.prepend(func.clone())),
                None => Err(not_callable(func)),
            },
            _ => Err(not_callable(func)),
        }
    }

    /// Looks up `name` on `obj` and calls it.
    pub fn call_method(&self, obj: &Value, name: &str, args: Args) -> RunResult<Value> {
        let method = self.getattr(obj, name)?;
        self.call(&method, args)
    }

    /// Name of a callable for error messages.
    pub(crate) fn callable_name(&self, func: &Value) -> String {
        match func {
            Value::Function(f) => f.def.qualname.to_string(),
            Value::Builtin(b) => b.name().to_owned(),
            Value::Native(n) => n.name.to_string(),
            Value::BoundMethod(m) => m.func_name(),
            Value::BuiltinMethod(m) => format!("{}.{}", m.receiver.type_name(), m.name),
            Value::Type(t) => t.name().to_owned(),
            Value::Class(c) => c.name.to_string(),
            other => other.type_name().into_owned(),
        }
    }

    /// `cls(*args)` for a user-defined class.
    fn instantiate(&self, class: &Rc<Class>, args: Args) -> RunResult<Value> {
        let init = class.lookup("__init__");
        let instance = if class.exc_base.is_some() {
            Value::Exception(Exception::with_class(ExcClass::User(class.clone()), args.positional.clone()))
        } else {
            if init.is_none() && args.count() > 0 {
                return Err(ExcType::TypeError.msg(format!("{}() takes no arguments", class.name)));
            }
            Value::Instance(Rc::new(Instance::new(class.clone())))
        };
        if let Some(init) = init {
            let result = self.call(&init, args.prepend(instance.clone()))?;
            if !result.is_none() {
                return Err(ExcType::TypeError.msg(format!(
                    "__init__() should return None, not '{}'",
                    result.type_name()
                )));
            }
        }
        Ok(instance)
    }

    /// Zero-argument `super()`, resolved from the calling frame.
    pub(crate) fn super_from_frame(&self) -> RunResult<Value> {
        let frame = self
            .current_frame()
            .ok_or_else(|| ExcType::RuntimeError.msg("super(): no current frame"))?;
        let func = frame
            .function
            .as_ref()
            .ok_or_else(|| ExcType::RuntimeError.msg("super(): no arguments"))?;
        let class = func
            .owner()
            .ok_or_else(|| ExcType::RuntimeError.msg("super(): __class__ cell not found"))?;
        let first = func
            .def
            .params
            .posonly
            .iter()
            .chain(&func.def.params.args)
            .next()
            .ok_or_else(|| ExcType::RuntimeError.msg("super(): no arguments"))?;
        let obj = frame.load_name(&first.name)?;
        Ok(Value::Super(Rc::new(SuperObj { class, obj })))
    }
}

fn not_callable(func: &Value) -> Exception {
    ExcType::TypeError.msg(format!("'{}' object is not callable", func.type_name()))
}

/// Calls a Python function: binds arguments, then runs the body or wraps it in a coroutine or
/// generator object.
fn call_function(rt: &Runtime, func: &Rc<Function>, args: Args) -> RunResult<Value> {
    let scope = Rc::new(bind_arguments(func, args)?);
    let def = func.def.clone();
    let channel = def.scope.is_generator.then(|| Rc::new(GenChannel::default()));
    let frame = Rc::new(Frame::function(rt, func, scope, channel.clone()));
    let body = {
        let frame = frame.clone();
        let def = def.clone();
        async move {
            match exec_block(&frame, &def.body).await? {
                Flow::Return(value) => Ok(value),
                _ => Ok(Value::None),
            }
        }
    };
    let future = FrameFuture::new(frame, Box::pin(body));
    Ok(match (def.is_async, channel) {
        (false, None) => return run_sync(future),
        (true, None) => Value::Coroutine(Coroutine::new(def.name.clone(), def.qualname.clone(), Box::pin(future))),
        (false, Some(channel)) => Value::Generator(Generator::new(GenCore::new(
            def.qualname.clone(),
            channel,
            Box::pin(future),
        ))),
        (true, Some(channel)) => Value::AsyncGenerator(AsyncGenerator::new(
            GenCore::new(def.qualname.clone(), channel, Box::pin(future)),
            rt.downgrade(),
        )),
    })
}

/// Matches call arguments to a function's parameters, producing its local scope.
fn bind_arguments(func: &Rc<Function>, args: Args) -> RunResult<Scope> {
    let def = &func.def;
    let params = &def.params;
    let name = &def.name;
    let mut vars: AHashMap<Rc<str>, Value> = AHashMap::with_capacity(def.scope.locals.len());
    let positional_params: Vec<_> = params.posonly.iter().chain(&params.args).collect();
    let Args { positional, keywords } = args;
    let given = positional.len();
    let mut positional = positional.into_iter();
    for param in &positional_params {
        match positional.next() {
            Some(value) => {
                vars.insert(param.name.clone(), value);
            }
            None => break,
        }
    }
    let extra: Vec<Value> = positional.collect();
    match &params.vararg {
        Some(vararg) => {
            vars.insert(vararg.clone(), Value::tuple(extra));
        }
        None if !extra.is_empty() => {
            return Err(too_many_positional(func, given));
        }
        None => {}
    }
    let mut extra_keywords = params.kwarg.as_ref().map(|_| Dict::new());
    for (key, value) in keywords {
        let param = params.args.iter().chain(&params.kwonly).find(|p| p.name == key);
        if let Some(param) = param {
            if vars.contains_key(&param.name) {
                return Err(ExcType::TypeError.msg(format!(
                    "{name}() got multiple values for argument '{key}'"
                )));
            }
            vars.insert(param.name.clone(), value);
        } else if let Some(extra) = &mut extra_keywords {
            extra.set_str(key, value);
        } else if params.posonly.iter().any(|p| p.name == key) {
            return Err(ExcType::TypeError.msg(format!(
                "{name}() got some positional-only arguments passed as keyword arguments: '{key}'"
            )));
        } else {
            return Err(ExcType::TypeError.msg(format!(
                "{name}() got an unexpected keyword argument '{key}'"
            )));
        }
    }
    let mut missing = Vec::new();
    for (param, default) in positional_params.iter().zip(&func.defaults) {
        if !vars.contains_key(&param.name) {
            match default {
                Some(default) => {
                    vars.insert(param.name.clone(), default.clone());
                }
                None => missing.push(param.name.clone()),
            }
        }
    }
    if !missing.is_empty() {
        return Err(missing_arguments(name, "positional", &missing));
    }
    for (param, default) in params.kwonly.iter().zip(&func.kw_defaults) {
        if !vars.contains_key(&param.name) {
            match default {
                Some(default) => {
                    vars.insert(param.name.clone(), default.clone());
                }
                None => missing.push(param.name.clone()),
            }
        }
    }
    if !missing.is_empty() {
        return Err(missing_arguments(name, "keyword-only", &missing));
    }
    if let (Some(kwarg), Some(extra)) = (&params.kwarg, extra_keywords) {
        vars.insert(kwarg.clone(), Value::dict(extra));
    }
    Ok(Scope::new(ScopeOwner::Function(def.clone()), func.closure.clone(), vars))
}

fn too_many_positional(func: &Function, given: usize) -> Exception {
    let required = func.defaults.iter().filter(|d| d.is_none()).count();
    let max = func.defaults.len();
    let takes = if required == max {
        format!("{max} positional argument{}", if max == 1 { "" } else { "s" })
    } else {
        format!("from {required} to {max} positional arguments")
    };
    let was = if given == 1 { "was" } else { "were" };
    ExcType::TypeError.msg(format!(
        "{}() takes {takes} but {given} {was} given",
        func.def.name
    ))
}

fn missing_arguments(name: &str, kind: &str, missing: &[Rc<str>]) -> Exception {
    let quoted: Vec<String> = missing.iter().map(|n| format!("'{n}'")).collect();
    let list = match quoted.as_slice() {
        [one] => one.clone(),
        [a, b] => format!("{a} and {b}"),
        [init @ .., last] => format!("{}, and {last}", init.join(", ")),
        [] => String::new(),
    };
    let count = missing.len();
    ExcType::TypeError.msg(format!(
        "{name}() missing {count} required {kind} argument{}: {list}",
        if count == 1 { "" } else { "s" }
    ))
}

impl Runtime {
    /// The exception raised by `raise value`: instances are used as is, classes are called
    /// without arguments.
    pub(crate) fn make_exception(&self, value: Value) -> RunResult<Exception> {
        let instance = match &value {
            Value::Type(crate::value::Type::Exc(_)) => self.call(&value, Args::empty())?,
            Value::Class(c) if c.exc_base.is_some() => self.call(&value, Args::empty())?,
            _ => value,
        };
        match instance {
            Value::Exception(exc) => Ok(exc),
            _ => Err(ExcType::TypeError.msg("exceptions must derive from BaseException")),
        }
    }
}
