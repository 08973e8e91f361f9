//! The evaluator: frames, name resolution and the future that runs a frame's body.
//!
//! Every statement and expression evaluates to a boxed local future. Plain function calls poll
//! their frame once and must finish without suspending; coroutine frames are driven by whoever
//! awaits them (a task, another coroutine or the syncifier). `await` is the only point where a
//! frame actually suspends.

mod call;
mod expressions;
mod statements;

use std::{
    cell::{Cell, RefCell},
    future::Future,
    pin::{Pin, pin},
    rc::Rc,
    task::{Context, Poll, Waker},
};

use ahash::AHashMap;
use indexmap::IndexMap;

pub(crate) use expressions::{await_value, eval_expr};
pub(crate) use statements::{exception_matches, exec_block};

use crate::{
    compile::{Code, CodeInfo},
    exception::{ExcType, Exception, RunResult, TraceEntry},
    expressions::{Comprehension, FunctionDef, Identifier, ScopeInfo},
    runtime::Runtime,
    types::{Dict, Function, GenChannel, LocalBoxFuture},
    value::{DictRef, Value},
};

/// How a block of statements finished.
pub(crate) enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// Which body a [`Scope`] belongs to; its [`ScopeInfo`] decides which names are local.
pub(crate) enum ScopeOwner {
    Function(Rc<FunctionDef>),
    Comprehension(Rc<Comprehension>),
}

/// Variables of one function or comprehension activation.
///
/// Scopes are reference counted so closures keep their defining scope alive, which gives
/// nested functions Python's cell semantics.
pub(crate) struct Scope {
    vars: RefCell<AHashMap<Rc<str>, Value>>,
    parent: Option<Rc<Scope>>,
    owner: ScopeOwner,
}

impl Scope {
    pub(crate) fn new(owner: ScopeOwner, parent: Option<Rc<Self>>, vars: AHashMap<Rc<str>, Value>) -> Self {
        Self {
            vars: RefCell::new(vars),
            parent,
            owner,
        }
    }

    fn info(&self) -> &ScopeInfo {
        match &self.owner {
            ScopeOwner::Function(def) => &def.scope,
            ScopeOwner::Comprehension(comp) => &comp.scope,
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<Value> {
        self.vars.borrow().get(name).cloned()
    }

    fn snapshot(&self) -> Dict {
        let mut names: Vec<(Rc<str>, Value)> = self
            .vars
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        names.sort_by(|a, b| a.0.cmp(&b.0));
        names.into_iter().collect()
    }
}

/// Where a frame stores the names it binds.
pub(crate) enum Locals {
    /// Module code: names go to the globals, or to a separate mapping when one was given.
    Module(Option<DictRef>),
    Function(Rc<Scope>),
    /// A class body: names go to the class namespace; free names resolve through the scope that
    /// encloses the class.
    Class {
        ns: Rc<RefCell<IndexMap<Rc<str>, Value>>>,
        enclosing: Option<Rc<Scope>>,
    },
}

/// An executing code block: module, function, class body or generator expression.
pub(crate) struct Frame {
    pub rt: Runtime,
    pub globals: DictRef,
    pub locals: RefCell<Locals>,
    pub code: Rc<CodeInfo>,
    pub name: Rc<str>,
    pub line: Cell<u32>,
    /// Set for generator frames; `yield` suspends through it.
    pub gen: Option<Rc<GenChannel>>,
    /// The function being run, for zero-argument `super()`.
    pub function: Option<Rc<Function>>,
    /// Exceptions currently being handled by `except` blocks, innermost last.
    pub handling: RefCell<Vec<Exception>>,
}

impl Frame {
    fn new(rt: &Runtime, globals: DictRef, locals: Locals, code: Rc<CodeInfo>, name: Rc<str>) -> Self {
        Self {
            rt: rt.clone(),
            globals,
            locals: RefCell::new(locals),
            code,
            name,
            line: Cell::new(1),
            gen: None,
            function: None,
            handling: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn module(rt: &Runtime, globals: DictRef, locals: Option<DictRef>, code: Rc<CodeInfo>) -> Self {
        Self::new(rt, globals, Locals::Module(locals), code, "<module>".into())
    }

    pub(crate) fn function(rt: &Runtime, func: &Rc<Function>, scope: Rc<Scope>, gen: Option<Rc<GenChannel>>) -> Self {
        Self {
            gen,
            function: Some(func.clone()),
            ..Self::new(
                rt,
                func.globals.clone(),
                Locals::Function(scope),
                func.code.clone(),
                func.def.name.clone(),
            )
        }
    }

    /// The scope a function defined here closes over.
    pub(crate) fn current_scope(&self) -> Option<Rc<Scope>> {
        match &*self.locals.borrow() {
            Locals::Module(_) => None,
            Locals::Function(scope) => Some(scope.clone()),
            Locals::Class { enclosing, .. } => enclosing.clone(),
        }
    }

    /// `__name__` of the frame's module.
    pub(crate) fn module_name(&self) -> Rc<str> {
        match self.globals.borrow().get_str("__name__") {
            Some(Value::Str(name)) => name,
            _ => "__main__".into(),
        }
    }

    pub(crate) fn load(&self, ident: &Identifier) -> RunResult<Value> {
        self.load_name(&ident.name)
    }

    pub(crate) fn load_name(&self, name: &str) -> RunResult<Value> {
        enum Place {
            Dict(DictRef),
            Scope(Rc<Scope>),
            Class(Option<Value>, Option<Rc<Scope>>),
            Global,
        }
        let place = match &*self.locals.borrow() {
            Locals::Module(Some(locals)) => Place::Dict(locals.clone()),
            Locals::Module(None) => Place::Global,
            Locals::Function(scope) => Place::Scope(scope.clone()),
            Locals::Class { ns, enclosing } => Place::Class(ns.borrow().get(name).cloned(), enclosing.clone()),
        };
        match place {
            Place::Dict(locals) => {
                let found = locals.borrow().get_str(name);
                if let Some(value) = found {
                    return Ok(value);
                }
            }
            Place::Scope(scope) => {
                if let Some(result) = lookup_scopes(&scope, name, true) {
                    return result;
                }
            }
            Place::Class(Some(value), _) => return Ok(value),
            Place::Class(None, Some(enclosing)) => {
                if let Some(result) = lookup_scopes(&enclosing, name, false) {
                    return result;
                }
            }
            Place::Class(None, None) | Place::Global => {}
        }
        self.load_global(name)
    }

    pub(crate) fn load_global(&self, name: &str) -> RunResult<Value> {
        let found = self.globals.borrow().get_str(name);
        if let Some(value) = found {
            return Ok(value);
        }
        let builtin = self.rt.builtins().borrow().get_str(name);
        builtin.ok_or_else(|| ExcType::NameError.msg(format!("name '{name}' is not defined")))
    }

    pub(crate) fn store(&self, name: &Rc<str>, value: Value) -> RunResult<()> {
        let locals = match &*self.locals.borrow() {
            Locals::Module(Some(locals)) => Some(Ok(locals.clone())),
            Locals::Module(None) => None,
            Locals::Function(scope) => Some(Err(scope.clone())),
            Locals::Class { ns, .. } => {
                let old = ns.borrow_mut().insert(name.clone(), value);
                drop(old);
                return Ok(());
            }
        };
        match locals {
            Some(Ok(dict)) => {
                let old = dict.borrow_mut().set_str(name.clone(), value);
                drop(old);
            }
            Some(Err(scope)) => {
                let mut current = Some(scope);
                while let Some(s) = current {
                    let info = s.info();
                    if info.globals.contains(name) {
                        break;
                    }
                    if info.locals.contains(name) {
                        let old = s.vars.borrow_mut().insert(name.clone(), value);
                        drop(old);
                        return Ok(());
                    }
                    current = s.parent.clone();
                }
                let old = self.globals.borrow_mut().set_str(name.clone(), value);
                drop(old);
            }
            None => {
                let old = self.globals.borrow_mut().set_str(name.clone(), value);
                drop(old);
            }
        }
        Ok(())
    }

    pub(crate) fn delete(&self, name: &Rc<str>) -> RunResult<()> {
        let removed = match &*self.locals.borrow() {
            Locals::Module(Some(locals)) => locals.borrow_mut().remove_str(name),
            Locals::Module(None) => self.globals.borrow_mut().remove_str(name),
            Locals::Class { ns, .. } => ns.borrow_mut().shift_remove(name.as_ref()),
            Locals::Function(scope) => {
                let mut current = Some(scope.clone());
                let mut removed = None;
                let mut global = true;
                while let Some(s) = current {
                    let info = s.info();
                    if info.globals.contains(name) {
                        break;
                    }
                    if info.locals.contains(name) {
                        removed = s.vars.borrow_mut().remove(name.as_ref());
                        global = false;
                        break;
                    }
                    current = s.parent.clone();
                }
                if global {
                    self.globals.borrow_mut().remove_str(name)
                } else {
                    removed
                }
            }
        };
        match removed {
            Some(old) => {
                drop(old);
                Ok(())
            }
            None => Err(ExcType::NameError.msg(format!("name '{name}' is not defined"))),
        }
    }

    /// Snapshot of the frame's local names, for `locals()` and `vars()`.
    pub(crate) fn locals_dict(&self) -> DictRef {
        match &*self.locals.borrow() {
            Locals::Module(Some(locals)) => locals.clone(),
            Locals::Module(None) => self.globals.clone(),
            Locals::Function(scope) => Rc::new(RefCell::new(scope.snapshot())),
            Locals::Class { ns, .. } => Rc::new(RefCell::new(
                ns.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            )),
        }
    }

    /// Records this frame in the traceback of an exception unwinding through it.
    fn record(&self, exc: &Exception) {
        let lineno = self.line.get();
        exc.push_frame(TraceEntry {
            filename: self.code.filename().clone(),
            lineno,
            name: self.name.clone(),
            line: self.code.line(lineno),
        });
    }
}

/// Resolves `name` along a chain of function scopes. `None` means "look in the globals".
fn lookup_scopes(scope: &Rc<Scope>, name: &str, own: bool) -> Option<RunResult<Value>> {
    let mut current = Some(scope);
    let mut innermost = own;
    while let Some(s) = current {
        let info = s.info();
        if info.globals.contains(name) {
            return None;
        }
        if info.locals.contains(name) {
            return Some(s.get(name).ok_or_else(|| {
                if innermost {
                    ExcType::UnboundLocalError.msg(format!(
                        "cannot access local variable '{name}' where it is not associated with a value"
                    ))
                } else {
                    ExcType::NameError.msg(format!(
                        "cannot access free variable '{name}' where it is not associated with a value in enclosing scope"
                    ))
                }
            }));
        }
        innermost = false;
        current = s.parent.as_ref();
    }
    None
}

/// Runs a frame's body, keeping the runtime's frame stack and recursion depth in step with the
/// polls and recording the frame in the traceback of any exception leaving it.
pub(crate) struct FrameFuture {
    frame: Rc<Frame>,
    body: LocalBoxFuture<'static, RunResult<Value>>,
}

impl FrameFuture {
    pub(crate) fn new(frame: Rc<Frame>, body: LocalBoxFuture<'static, RunResult<Value>>) -> Self {
        Self { frame, body }
    }
}

impl Future for FrameFuture {
    type Output = RunResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let rt = this.frame.rt.clone();
        if let Err(exc) = rt.enter_frame(&this.frame) {
            return Poll::Ready(Err(exc));
        }
        let result = this.body.as_mut().poll(cx);
        rt.leave_frame();
        if let Poll::Ready(Err(exc)) = &result {
            this.frame.record(exc);
        }
        result
    }
}

/// Runs a future that must complete without suspending.
pub(crate) fn run_sync(future: impl Future<Output = RunResult<Value>>) -> RunResult<Value> {
    let mut future = pin!(future);
    match future.as_mut().poll(&mut Context::from_waker(Waker::noop())) {
        Poll::Ready(result) => result,
        Poll::Pending => Err(ExcType::RuntimeError.msg("synchronous code cannot suspend")),
    }
}

/// The future that runs a compiled module body in `globals`.
pub(crate) fn module_future(rt: &Runtime, code: &Code, globals: DictRef, locals: Option<DictRef>) -> FrameFuture {
    let frame = Rc::new(Frame::module(rt, globals, locals, code.info.clone()));
    let module = code.module.clone();
    let body_frame = frame.clone();
    let body = async move {
        exec_block(&body_frame, &module.body).await?;
        Ok(Value::None)
    };
    FrameFuture::new(frame, Box::pin(body))
}
