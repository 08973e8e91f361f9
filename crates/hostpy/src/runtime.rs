//! Interpreter state shared by everything that runs Python code: builtins, the module registry,
//! `sys`, the async generator hooks, the event loop and the frame stack.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
};

use indexmap::IndexMap;

use crate::{
    args::Args,
    builtins,
    eval::Frame,
    exception::{ExcType, Exception, RunResult},
    host::Host,
    io::TextStream,
    modules,
    syncify::Syncifier,
    transform::EVAL_RESULT_NAME,
    types::{Dict, ModuleObj},
    value::{DictRef, Type, Value},
    webloop::WebLoop,
};

/// Default limit on nested Python calls.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 200;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Maximum depth of nested Python frames before `RecursionError` is raised.
    pub max_recursion_depth: usize,
    /// Filename used for code compiled without an explicit one.
    pub filename: Rc<str>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
            filename: "<exec>".into(),
        }
    }
}

/// A warning issued through `warnings.warn` or by the runtime itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarningRecord {
    pub category: ExcType,
    pub message: String,
    pub filename: String,
    pub lineno: u32,
}

impl fmt::Display for WarningRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}: {}", self.filename, self.lineno, self.category, self.message)
    }
}

/// Handle to an interpreter instance. Clones share the same state.
#[derive(Clone)]
pub struct Runtime(Rc<RuntimeInner>);

/// Non-owning handle, held by objects the runtime itself keeps alive.
#[derive(Clone)]
pub struct RuntimeWeak(Weak<RuntimeInner>);

impl RuntimeWeak {
    #[must_use]
    pub fn upgrade(&self) -> Option<Runtime> {
        self.0.upgrade().map(Runtime)
    }
}

pub(crate) struct RuntimeInner {
    host: Rc<dyn Host>,
    options: RuntimeOptions,
    builtins: DictRef,
    /// Loaded modules by name, shared with Python code as `sys.modules`.
    modules: DictRef,
    sys: Rc<ModuleObj>,
    /// `(firstiter, finalizer)`, `None` when unset.
    asyncgen_hooks: RefCell<(Value, Value)>,
    event_loop: RefCell<Option<WebLoop>>,
    warnings: RefCell<Vec<WarningRecord>>,
    host_values: RefCell<IndexMap<Rc<str>, Value>>,
    depth: Cell<usize>,
    frames: RefCell<Vec<Rc<Frame>>>,
    syncifier: RefCell<Option<Rc<dyn Syncifier>>>,
    /// Identities of containers whose repr is being computed, to cut cycles.
    repr_stack: RefCell<Vec<usize>>,
    task_counter: Cell<u64>,
}

impl Runtime {
    /// Creates a runtime with default options.
    #[must_use]
    pub fn new(host: Rc<dyn Host>) -> Self {
        Self::with_options(host, RuntimeOptions::default())
    }

    #[must_use]
    pub fn with_options(host: Rc<dyn Host>, options: RuntimeOptions) -> Self {
        let mut builtin_dict = Dict::new();
        builtins::install(&mut builtin_dict);
        builtin_dict.set_str(
            EVAL_RESULT_NAME,
            Value::list(vec![Value::Type(Type::Exc(ExcType::EvalCodeResult))]),
        );
        let sys = Rc::new(ModuleObj::new("sys"));
        let modules: DictRef = Rc::new(RefCell::new(Dict::new()));
        let runtime = Self(Rc::new(RuntimeInner {
            host,
            options,
            builtins: Rc::new(RefCell::new(builtin_dict)),
            modules: modules.clone(),
            sys: sys.clone(),
            asyncgen_hooks: RefCell::new((Value::None, Value::None)),
            event_loop: RefCell::new(None),
            warnings: RefCell::new(Vec::new()),
            host_values: RefCell::new(IndexMap::new()),
            depth: Cell::new(0),
            frames: RefCell::new(Vec::new()),
            syncifier: RefCell::new(None),
            repr_stack: RefCell::new(Vec::new()),
            task_counter: Cell::new(0),
        }));
        modules::sys::populate(&runtime, &sys);
        modules.borrow_mut().set_str("sys", Value::Module(sys));
        let builtins_module = ModuleObj::new("builtins");
        for (name, value) in runtime.0.builtins.borrow().items() {
            if let Value::Str(name) = name {
                builtins_module.set(name, value);
            }
        }
        modules
            .borrow_mut()
            .set_str("builtins", Value::Module(Rc::new(builtins_module)));
        runtime
    }

    #[must_use]
    pub fn downgrade(&self) -> RuntimeWeak {
        RuntimeWeak(Rc::downgrade(&self.0))
    }

    #[must_use]
    pub fn host(&self) -> &Rc<dyn Host> {
        &self.0.host
    }

    #[must_use]
    pub fn options(&self) -> &RuntimeOptions {
        &self.0.options
    }

    #[must_use]
    pub fn builtins(&self) -> &DictRef {
        &self.0.builtins
    }

    /// The module registry, `sys.modules`.
    #[must_use]
    pub fn modules(&self) -> &DictRef {
        &self.0.modules
    }

    #[must_use]
    pub fn sys(&self) -> &Rc<ModuleObj> {
        &self.0.sys
    }

    /// A fresh globals dict for module code, with `__name__` set.
    #[must_use]
    pub fn new_globals(&self, name: &str) -> DictRef {
        let mut globals = Dict::new();
        globals.set_str("__name__", Value::str(name));
        Rc::new(RefCell::new(globals))
    }

    /// Imports a module by absolute name, creating builtin modules on first use.
    pub fn import_module(&self, name: &str) -> RunResult<Value> {
        let loaded = self.0.modules.borrow().get_str(name);
        if let Some(module) = loaded {
            return Ok(module);
        }
        let Some(module) = modules::create(self, name)? else {
            return Err(Exception::new(
                ExcType::ModuleNotFoundError,
                vec![Value::str(format!("No module named '{name}'"))],
            ));
        };
        let old = self.0.modules.borrow_mut().set_str(name, module.clone());
        drop(old);
        Ok(module)
    }

    /// Makes `value` importable as `js.<name>`.
    pub fn register_host_value(&self, name: impl Into<Rc<str>>, value: Value) {
        let name = name.into();
        let old = self.0.host_values.borrow_mut().insert(name.clone(), value.clone());
        drop(old);
        let js = self.0.modules.borrow().get_str("js");
        if let Some(Value::Module(js)) = js {
            js.set(name, value);
        }
    }

    pub(crate) fn host_values(&self) -> Vec<(Rc<str>, Value)> {
        self.0
            .host_values
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// The current `(firstiter, finalizer)` async generator hooks.
    #[must_use]
    pub fn asyncgen_hooks(&self) -> (Value, Value) {
        self.0.asyncgen_hooks.borrow().clone()
    }

    pub fn set_asyncgen_hooks(&self, firstiter: Value, finalizer: Value) {
        let old = self.0.asyncgen_hooks.replace((firstiter, finalizer));
        drop(old);
    }

    /// The runtime's event loop, created on first use.
    #[must_use]
    pub fn event_loop(&self) -> WebLoop {
        if let Some(event_loop) = self.0.event_loop.borrow().as_ref() {
            return event_loop.clone();
        }
        let event_loop = WebLoop::new(self);
        *self.0.event_loop.borrow_mut() = Some(event_loop.clone());
        event_loop
    }

    /// Schedules a coroutine on the event loop.
    pub fn spawn(&self, coro: Value) -> RunResult<crate::webloop::Task> {
        self.event_loop().create_task(coro, None)
    }

    pub(crate) fn next_task_number(&self) -> u64 {
        let n = self.0.task_counter.get() + 1;
        self.0.task_counter.set(n);
        n
    }

    /// Installs the primitive `syncify` uses to block; `None` disables syncify.
    pub fn set_syncifier(&self, syncifier: Option<Rc<dyn Syncifier>>) {
        *self.0.syncifier.borrow_mut() = syncifier;
    }

    #[must_use]
    pub fn syncifier(&self) -> Option<Rc<dyn Syncifier>> {
        self.0.syncifier.borrow().clone()
    }

    pub(crate) fn enter_frame(&self, frame: &Rc<Frame>) -> RunResult<()> {
        let depth = self.0.depth.get();
        if depth >= self.0.options.max_recursion_depth {
            return Err(ExcType::RecursionError.msg("maximum recursion depth exceeded"));
        }
        self.0.depth.set(depth + 1);
        self.0.frames.borrow_mut().push(frame.clone());
        Ok(())
    }

    pub(crate) fn leave_frame(&self) {
        self.0.depth.set(self.0.depth.get().saturating_sub(1));
        let frame = self.0.frames.borrow_mut().pop();
        drop(frame);
    }

    /// The innermost executing Python frame.
    pub(crate) fn current_frame(&self) -> Option<Rc<Frame>> {
        self.0.frames.borrow().last().cloned()
    }

    /// `(filename, line, function)` of every executing frame, outermost first.
    #[must_use]
    pub fn stack_summary(&self) -> Vec<(Rc<str>, u32, Rc<str>)> {
        self.0
            .frames
            .borrow()
            .iter()
            .map(|f| (f.code.filename().clone(), f.line.get(), f.name.clone()))
            .collect()
    }

    pub(crate) fn repr_enter(&self, id: usize) -> bool {
        let mut stack = self.0.repr_stack.borrow_mut();
        if stack.contains(&id) {
            return false;
        }
        stack.push(id);
        true
    }

    pub(crate) fn repr_leave(&self) {
        self.0.repr_stack.borrow_mut().pop();
    }

    /// The current `sys.<name>` stream object.
    pub(crate) fn sys_stream(&self, name: &str) -> Value {
        self.0.sys.get(name).unwrap_or(Value::None)
    }

    /// Writes `text` to the current `sys.stdout` / `sys.stderr`.
    pub(crate) fn write_stream(&self, name: &str, text: &str) -> RunResult<()> {
        match self.sys_stream(name) {
            Value::Stream(stream) => {
                stream.write(text);
                Ok(())
            }
            Value::None => Ok(()),
            other => self.call_method(&other, "write", Args::one(Value::str(text))).map(drop),
        }
    }

    /// Issues a warning: prints it to `sys.stderr` and records it.
    pub fn warn(&self, category: ExcType, message: impl Into<String>) -> RunResult<()> {
        let (filename, lineno) = match self.current_frame() {
            Some(frame) => (frame.code.filename().to_string(), frame.line.get()),
            None => ("sys".to_owned(), 1),
        };
        let record = WarningRecord {
            category,
            message: message.into(),
            filename,
            lineno,
        };
        self.write_stream("stderr", &format!("{record}\n"))?;
        self.0.warnings.borrow_mut().push(record);
        Ok(())
    }

    /// Warnings issued since the last call, oldest first.
    #[must_use]
    pub fn take_warnings(&self) -> Vec<WarningRecord> {
        std::mem::take(&mut *self.0.warnings.borrow_mut())
    }

    /// Reports an exception that has nowhere to propagate, like `sys.unraisablehook`.
    pub(crate) fn report_unraisable(&self, exc: &Exception, msg: &str) {
        let text = format!("{msg}\n{}", exc.format_traceback(None));
        if self.write_stream("stderr", &text).is_err() {
            self.0.host.console_log(&text);
        }
    }

    /// Creates the default text streams bound to the process.
    pub(crate) fn default_streams() -> [(&'static str, Value); 3] {
        [
            ("stdout", Value::Stream(Rc::new(TextStream::stdout()))),
            ("stderr", Value::Stream(Rc::new(TextStream::stderr()))),
            ("stdin", Value::Stream(Rc::new(TextStream::stdin()))),
        ]
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("options", &self.0.options)
            .field("depth", &self.0.depth.get())
            .finish_non_exhaustive()
    }
}
