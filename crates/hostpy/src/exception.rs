use std::{
    cell::RefCell,
    fmt::{self, Write},
    rc::Rc,
};

use indexmap::IndexMap;
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{types::Class, value::Value};

/// Result type alias for anything that can raise a Python exception.
pub type RunResult<T> = Result<T, Exception>;

/// Builtin exception classes known to the interpreter.
///
/// Uses strum derives for `Display`, `FromStr` and `Into<&'static str>`; the string form is the
/// Python class name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, EnumIter)]
pub enum ExcType {
    BaseException,
    Exception,
    SystemExit,
    KeyboardInterrupt,
    /// Thrown into generators by `close()` / `aclose()`. Inherits from BaseException.
    GeneratorExit,

    ArithmeticError,
    OverflowError,
    ZeroDivisionError,

    LookupError,
    IndexError,
    KeyError,

    AssertionError,
    AttributeError,
    NameError,
    UnboundLocalError,
    ImportError,
    ModuleNotFoundError,

    RuntimeError,
    NotImplementedError,
    RecursionError,

    StopIteration,
    StopAsyncIteration,
    SyntaxError,
    IndentationError,
    TypeError,
    ValueError,
    TimeoutError,
    EOFError,

    /// `asyncio.CancelledError`, a BaseException subclass so `except Exception` does not swallow it.
    CancelledError,
    /// `asyncio.InvalidStateError`.
    InvalidStateError,

    Warning,
    UserWarning,
    DeprecationWarning,
    RuntimeWarning,
    ResourceWarning,

    /// Sentinel carrying the value of the last expression out of a module body.
    #[strum(serialize = "EvalCodeResultException")]
    EvalCodeResult,
}

impl ExcType {
    /// Direct base class, `None` for `BaseException`.
    #[must_use]
    pub fn parent(self) -> Option<Self> {
        match self {
            Self::BaseException => None,
            Self::Exception | Self::SystemExit | Self::KeyboardInterrupt | Self::GeneratorExit | Self::CancelledError => {
                Some(Self::BaseException)
            }
            Self::OverflowError | Self::ZeroDivisionError => Some(Self::ArithmeticError),
            Self::IndexError | Self::KeyError => Some(Self::LookupError),
            Self::UnboundLocalError => Some(Self::NameError),
            Self::ModuleNotFoundError => Some(Self::ImportError),
            Self::NotImplementedError | Self::RecursionError => Some(Self::RuntimeError),
            Self::IndentationError => Some(Self::SyntaxError),
            Self::UserWarning | Self::DeprecationWarning | Self::RuntimeWarning | Self::ResourceWarning => {
                Some(Self::Warning)
            }
            _ => Some(Self::Exception),
        }
    }

    /// Returns true if `self` would be caught by `except handler_type:`.
    #[must_use]
    pub fn is_subclass_of(self, handler_type: Self) -> bool {
        let mut current = Some(self);
        while let Some(t) = current {
            if t == handler_type {
                return true;
            }
            current = t.parent();
        }
        false
    }

    /// Module the class is defined in, for qualified names in tracebacks.
    #[must_use]
    pub fn module(self) -> Option<&'static str> {
        match self {
            Self::CancelledError | Self::InvalidStateError => Some("asyncio.exceptions"),
            _ => None,
        }
    }

    /// Builds an exception of this type with a single string argument.
    #[must_use]
    pub fn msg(self, msg: impl Into<String>) -> Exception {
        Exception::new(self, vec![Value::Str(msg.into().into())])
    }

    /// Builds an exception of this type without arguments.
    #[must_use]
    pub fn bare(self) -> Exception {
        Exception::new(self, Vec::new())
    }
}

/// The class of an exception instance: a builtin one, or a user class deriving from one.
#[derive(Clone)]
pub enum ExcClass {
    Builtin(ExcType),
    User(Rc<Class>),
}

/// One frame of a recorded traceback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub filename: Rc<str>,
    pub lineno: u32,
    /// Function name, `<module>` for module code.
    pub name: Rc<str>,
    /// Source line, if it should be shown.
    pub line: Option<Rc<str>>,
}

/// Location details attached to a `SyntaxError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxLocation {
    pub filename: String,
    /// 1-based line number.
    pub lineno: u32,
    /// 1-based column of the error.
    pub offset: u32,
    pub text: String,
}

/// A Python exception instance.
///
/// This is a cheap clonable handle: clones refer to the same exception object, as in Python, so
/// tracebacks recorded while it unwinds are visible through every handle.
#[derive(Clone)]
pub struct Exception(Rc<ExceptionObj>);

struct ExceptionObj {
    class: ExcClass,
    args: RefCell<Vec<Value>>,
    attrs: RefCell<IndexMap<Rc<str>, Value>>,
    /// Innermost frame first, in the order frames were unwound.
    traceback: RefCell<Vec<TraceEntry>>,
    cause: RefCell<Option<Exception>>,
    context: RefCell<Option<Exception>>,
    suppress_context: RefCell<bool>,
    syntax: RefCell<Option<SyntaxLocation>>,
}

impl Exception {
    #[must_use]
    pub fn new(exc_type: ExcType, args: Vec<Value>) -> Self {
        Self::with_class(ExcClass::Builtin(exc_type), args)
    }

    pub(crate) fn with_class(class: ExcClass, args: Vec<Value>) -> Self {
        Self(Rc::new(ExceptionObj {
            class,
            args: RefCell::new(args),
            attrs: RefCell::new(IndexMap::new()),
            traceback: RefCell::new(Vec::new()),
            cause: RefCell::new(None),
            context: RefCell::new(None),
            suppress_context: RefCell::new(false),
            syntax: RefCell::new(None),
        }))
    }

    /// Builds a `SyntaxError` (or subclass) pointing at a source location.
    #[must_use]
    pub fn syntax_error(exc_type: ExcType, msg: impl Into<String>, location: SyntaxLocation) -> Self {
        let exc = exc_type.msg(msg);
        *exc.0.syntax.borrow_mut() = Some(location);
        exc
    }

    /// The closest builtin exception class of this exception.
    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        match &self.0.class {
            ExcClass::Builtin(t) => *t,
            ExcClass::User(class) => class.exc_base.unwrap_or(ExcType::Exception),
        }
    }

    pub(crate) fn class(&self) -> &ExcClass {
        &self.0.class
    }

    /// The Python class name, e.g. `ZeroDivisionError` or a user subclass name.
    #[must_use]
    pub fn type_name(&self) -> String {
        match &self.0.class {
            ExcClass::Builtin(t) => t.to_string(),
            ExcClass::User(class) => class.name.to_string(),
        }
    }

    fn qualified_name(&self) -> String {
        match &self.0.class {
            ExcClass::Builtin(t) => match t.module() {
                Some(module) => format!("{module}.{t}"),
                None => t.to_string(),
            },
            ExcClass::User(class) => class.name.to_string(),
        }
    }

    /// Returns true if this exception is an instance of the builtin class `exc_type`.
    #[must_use]
    pub fn is_instance(&self, exc_type: ExcType) -> bool {
        self.exc_type().is_subclass_of(exc_type)
    }

    #[must_use]
    pub fn args(&self) -> Vec<Value> {
        self.0.args.borrow().clone()
    }

    pub(crate) fn set_args(&self, args: Vec<Value>) {
        *self.0.args.borrow_mut() = args;
    }

    /// `str(exc)` without calling user-defined `__str__`.
    #[must_use]
    pub fn message(&self) -> String {
        let args = self.0.args.borrow();
        match args.as_slice() {
            [] => String::new(),
            [single] if self.exc_type() == ExcType::KeyError => single.repr_plain(),
            [single] => single.str_plain(),
            many => Value::Tuple(many.to_vec().into()).repr_plain(),
        }
    }

    pub(crate) fn get_attr(&self, name: &str) -> Option<Value> {
        self.0.attrs.borrow().get(name).cloned()
    }

    pub(crate) fn set_attr(&self, name: Rc<str>, value: Value) {
        // keep the displaced value alive until the borrow is released
        let old = self.0.attrs.borrow_mut().insert(name, value);
        drop(old);
    }

    pub(crate) fn attr_names(&self) -> Vec<Rc<str>> {
        self.0.attrs.borrow().keys().cloned().collect()
    }

    /// Recorded traceback, outermost frame first.
    #[must_use]
    pub fn traceback(&self) -> Vec<TraceEntry> {
        let mut frames = self.0.traceback.borrow().clone();
        frames.reverse();
        frames
    }

    pub(crate) fn push_frame(&self, entry: TraceEntry) {
        self.0.traceback.borrow_mut().push(entry);
    }

    pub(crate) fn clear_traceback(&self) {
        self.0.traceback.borrow_mut().clear();
    }

    #[must_use]
    pub fn cause(&self) -> Option<Self> {
        self.0.cause.borrow().clone()
    }

    pub(crate) fn set_cause(&self, cause: Option<Self>) {
        *self.0.cause.borrow_mut() = cause;
        *self.0.suppress_context.borrow_mut() = true;
    }

    #[must_use]
    pub fn context(&self) -> Option<Self> {
        self.0.context.borrow().clone()
    }

    pub(crate) fn set_context(&self, context: Self) {
        if !context.is(self) && self.0.context.borrow().is_none() {
            *self.0.context.borrow_mut() = Some(context);
        }
    }

    #[must_use]
    pub fn syntax_location(&self) -> Option<SyntaxLocation> {
        self.0.syntax.borrow().clone()
    }

    /// Identity comparison, like Python's `is`.
    #[must_use]
    pub fn is(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    /// Value carried by `StopIteration` / the result sentinel.
    pub(crate) fn first_arg(&self) -> Value {
        self.0.args.borrow().first().cloned().unwrap_or(Value::None)
    }

    /// Renders the exception like `traceback.format_exception_only`.
    #[must_use]
    pub fn format_exception_only(&self) -> String {
        let mut out = String::new();
        if let Some(loc) = self.syntax_location() {
            let _ = writeln!(out, "  File \"{}\", line {}", loc.filename, loc.lineno);
            let trimmed = loc.text.trim_start();
            if !trimmed.trim_end().is_empty() {
                let stripped = loc.text.chars().count() - trimmed.chars().count();
                let caret = (loc.offset as usize).saturating_sub(1).saturating_sub(stripped);
                let _ = writeln!(out, "    {}", trimmed.trim_end());
                let _ = writeln!(out, "    {}^", " ".repeat(caret));
            }
        }
        let msg = self.message();
        if msg.is_empty() {
            let _ = writeln!(out, "{}", self.qualified_name());
        } else {
            let _ = writeln!(out, "{}: {msg}", self.qualified_name());
        }
        out
    }

    /// Renders the full traceback, keeping only the innermost `limit` frames when given.
    #[must_use]
    pub fn format_traceback(&self, limit: Option<usize>) -> String {
        let mut out = String::new();
        self.format_chain(&mut out, limit, 0);
        out
    }

    fn format_chain(&self, out: &mut String, limit: Option<usize>, depth: usize) {
        if depth < 16 {
            if let Some(cause) = self.cause() {
                cause.format_chain(out, limit, depth + 1);
                out.push_str("\nThe above exception was the direct cause of the following exception:\n\n");
            } else if let Some(context) = self.context().filter(|_| !*self.0.suppress_context.borrow()) {
                context.format_chain(out, limit, depth + 1);
                out.push_str("\nDuring handling of the above exception, another exception occurred:\n\n");
            }
        }
        let frames = self.traceback();
        let skip = limit.map_or(0, |keep| frames.len().saturating_sub(keep));
        let frames = &frames[skip..];
        if !frames.is_empty() {
            out.push_str("Traceback (most recent call last):\n");
            for frame in frames {
                let _ = writeln!(out, "  File \"{}\", line {}, in {}", frame.filename, frame.lineno, frame.name);
                if let Some(line) = &frame.line {
                    let _ = writeln!(out, "    {}", line.trim());
                }
            }
        }
        out.push_str(&self.format_exception_only());
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = self.message();
        if msg.is_empty() {
            write!(f, "{}", self.type_name())
        } else {
            write!(f, "{}: {msg}", self.type_name())
        }
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.type_name(), self.message())
    }
}

impl std::error::Error for Exception {}

impl PartialEq for Exception {
    fn eq(&self, other: &Self) -> bool {
        self.is(other)
    }
}
