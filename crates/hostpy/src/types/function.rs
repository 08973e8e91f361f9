use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
};

use indexmap::IndexMap;

use crate::{
    args::Args,
    compile::CodeInfo,
    eval::Scope,
    exception::{ExcType, RunResult},
    expressions::FunctionDef,
    runtime::Runtime,
    types::{Class, LocalBoxFuture},
    value::{DictRef, Value},
};

/// A function defined with `def`, `async def` or `lambda`.
pub struct Function {
    pub def: Rc<FunctionDef>,
    pub code: Rc<CodeInfo>,
    pub globals: DictRef,
    /// Enclosing function scope, for closures.
    pub(crate) closure: Option<Rc<Scope>>,
    /// Defaults for positional parameters, aligned with `posonly` followed by `args`.
    pub defaults: Vec<Option<Value>>,
    /// Defaults for keyword-only parameters, aligned with `kwonly`.
    pub kw_defaults: Vec<Option<Value>>,
    /// Class whose body defined this function, for zero-argument `super()`.
    pub owner: RefCell<Option<Weak<Class>>>,
    pub attrs: RefCell<IndexMap<Rc<str>, Value>>,
}

impl Function {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.def.name
    }

    #[must_use]
    pub fn owner(&self) -> Option<Rc<Class>> {
        self.owner.borrow().as_ref().and_then(Weak::upgrade)
    }
}

pub type NativeFn = dyn Fn(&Runtime, Args) -> RunResult<Value>;

/// A function implemented in Rust: module functions, loop methods, hooks and host proxies.
pub struct NativeFunction {
    pub name: Rc<str>,
    pub func: Box<NativeFn>,
}

impl NativeFunction {
    /// Wraps a closure as a callable Python value.
    pub fn value(name: impl Into<Rc<str>>, func: impl Fn(&Runtime, Args) -> RunResult<Value> + 'static) -> Value {
        Value::Native(Rc::new(Self {
            name: name.into(),
            func: Box::new(func),
        }))
    }
}

/// A function bound to a receiver.
pub struct BoundMethod {
    pub func: Value,
    pub receiver: Value,
}

impl BoundMethod {
    #[must_use]
    pub fn func_name(&self) -> String {
        match &self.func {
            Value::Function(f) => f.def.qualname.to_string(),
            Value::Native(n) => n.name.to_string(),
            other => other.type_name().into_owned(),
        }
    }
}

/// A method of a builtin type bound to its receiver, e.g. `[].append`.
pub struct BuiltinMethod {
    pub receiver: Value,
    pub name: Rc<str>,
}

/// A coroutine object: the not-yet-awaited body of an `async def` call, or an awaitable
/// produced by the runtime.
#[derive(Clone)]
pub struct Coroutine(Rc<CoroutineObj>);

struct CoroutineObj {
    name: Rc<str>,
    qualname: Rc<str>,
    body: RefCell<Option<LocalBoxFuture<'static, RunResult<Value>>>>,
    awaited: Cell<bool>,
}

impl Coroutine {
    pub fn new(
        name: impl Into<Rc<str>>,
        qualname: impl Into<Rc<str>>,
        body: LocalBoxFuture<'static, RunResult<Value>>,
    ) -> Self {
        Self(Rc::new(CoroutineObj {
            name: name.into(),
            qualname: qualname.into(),
            body: RefCell::new(Some(body)),
            awaited: Cell::new(false),
        }))
    }

    /// Wraps a Rust future as a coroutine value.
    pub fn from_future(
        name: impl Into<Rc<str>>,
        future: impl std::future::Future<Output = RunResult<Value>> + 'static,
    ) -> Self {
        let name = name.into();
        Self::new(name.clone(), name, Box::pin(future))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    #[must_use]
    pub fn qualname(&self) -> &str {
        &self.0.qualname
    }

    /// Takes the body out for awaiting; a coroutine can be awaited once.
    pub fn take_body(&self) -> RunResult<LocalBoxFuture<'static, RunResult<Value>>> {
        let body = self.0.body.borrow_mut().take();
        self.0.awaited.set(true);
        body.ok_or_else(|| ExcType::RuntimeError.msg("cannot reuse already awaited coroutine"))
    }

    /// True once the coroutine has been handed to an awaiter or closed.
    #[must_use]
    pub fn was_awaited(&self) -> bool {
        self.0.awaited.get()
    }

    /// `coro.close()`: drops the body without running it further.
    pub fn close(&self) {
        let body = self.0.body.borrow_mut().take();
        self.0.awaited.set(true);
        drop(body);
    }

    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.0).cast::<()>() as usize
    }
}
