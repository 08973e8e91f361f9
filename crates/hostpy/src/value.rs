use std::{
    borrow::Cow,
    cell::RefCell,
    fmt::Write as _,
    hash::{Hash, Hasher},
    rc::Rc,
};

use indexmap::{Equivalent, IndexMap};
use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};

use crate::{
    builtins::BuiltinFn,
    exception::{ExcType, Exception, RunResult},
    io::TextStream,
    syncify::SyncifyableTask,
    types::{
        AsyncGenerator, BoundMethod, BuiltinMethod, Class, Coroutine, Descriptor, Dict, Function, Generator,
        HostProxy, Instance, ModuleObj, NativeFunction, PyIter, SuperObj,
    },
    webloop::{AsyncLock, Handle, PyFuture, Task, WebLoop},
};

pub type ListRef = Rc<RefCell<Vec<Value>>>;
pub type DictRef = Rc<RefCell<Dict>>;
pub type SetRef = Rc<RefCell<IndexMap<HashKey, Value>>>;

/// A Python value.
///
/// Cloning is cheap: containers and objects are reference counted and clones share identity.
#[derive(Clone)]
pub enum Value {
    None,
    NotImplemented,
    Ellipsis,
    Bool(bool),
    Int(i64),
    /// Integers outside the `i64` range. Always normalized back to `Int` when they fit.
    BigInt(Rc<BigInt>),
    Float(f64),
    Str(Rc<str>),
    List(ListRef),
    Tuple(Rc<[Value]>),
    Dict(DictRef),
    Set(SetRef),
    Range(PyRange),
    Slice(Rc<SliceObj>),
    /// A builtin type object such as `int` or `ValueError`.
    Type(Type),
    Class(Rc<Class>),
    Instance(Rc<Instance>),
    Function(Rc<Function>),
    Builtin(BuiltinFn),
    Native(Rc<NativeFunction>),
    BoundMethod(Rc<BoundMethod>),
    BuiltinMethod(Rc<BuiltinMethod>),
    Super(Rc<SuperObj>),
    Descriptor(Rc<Descriptor>),
    Module(Rc<ModuleObj>),
    Exception(Exception),
    Coroutine(Coroutine),
    Generator(Generator),
    AsyncGenerator(AsyncGenerator),
    Iterator(Rc<RefCell<PyIter>>),
    Future(PyFuture),
    Task(Task),
    Handle(Handle),
    Loop(WebLoop),
    Stream(Rc<TextStream>),
    Lock(Rc<AsyncLock>),
    HostProxy(Rc<HostProxy>),
    SyncTask(Rc<dyn SyncifyableTask>),
}

/// Builtin type objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Object,
    Type,
    NoneType,
    Bool,
    Int,
    Float,
    Str,
    List,
    Tuple,
    Dict,
    Set,
    Range,
    Slice,
    Function,
    Module,
    Property,
    StaticMethod,
    ClassMethod,
    Coroutine,
    Generator,
    AsyncGenerator,
    Future,
    Task,
    Lock,
    Exc(ExcType),
}

impl Type {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Type => "type",
            Self::NoneType => "NoneType",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "str",
            Self::List => "list",
            Self::Tuple => "tuple",
            Self::Dict => "dict",
            Self::Set => "set",
            Self::Range => "range",
            Self::Slice => "slice",
            Self::Function => "function",
            Self::Module => "module",
            Self::Property => "property",
            Self::StaticMethod => "staticmethod",
            Self::ClassMethod => "classmethod",
            Self::Coroutine => "coroutine",
            Self::Generator => "generator",
            Self::AsyncGenerator => "async_generator",
            Self::Future => "Future",
            Self::Task => "Task",
            Self::Lock => "Lock",
            Self::Exc(t) => t.into(),
        }
    }

    /// Direct base type; `None` only for `object`.
    #[must_use]
    pub fn parent(self) -> Option<Self> {
        match self {
            Self::Object => None,
            Self::Bool => Some(Self::Int),
            Self::Task => Some(Self::Future),
            Self::Exc(t) => Some(t.parent().map_or(Self::Object, Self::Exc)),
            _ => Some(Self::Object),
        }
    }

    #[must_use]
    pub fn is_subtype_of(self, other: Self) -> bool {
        let mut current = Some(self);
        while let Some(t) = current {
            if t == other {
                return true;
            }
            current = t.parent();
        }
        false
    }
}

/// `range(start, stop, step)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PyRange {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl PyRange {
    #[must_use]
    pub fn len(&self) -> usize {
        let (lo, hi, step) = if self.step > 0 {
            (self.start, self.stop, self.step)
        } else {
            (self.stop, self.start, -self.step)
        };
        if lo >= hi {
            0
        } else {
            ((hi - lo - 1) / step + 1) as usize
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<i64> {
        (index < self.len()).then(|| self.start + self.step * index as i64)
    }

    #[must_use]
    pub fn contains(&self, n: i64) -> bool {
        if self.step > 0 {
            n >= self.start && n < self.stop && (n - self.start) % self.step == 0
        } else {
            n <= self.start && n > self.stop && (self.start - n) % (-self.step) == 0
        }
    }
}

#[derive(Debug, Clone)]
pub struct SliceObj {
    pub start: Value,
    pub stop: Value,
    pub step: Value,
}

/// Hashable projection of a value, used as the key of dicts and sets.
///
/// Numbers that compare equal produce equal keys (`1`, `1.0` and `True` all map to `Int(1)`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashKey {
    None,
    Ellipsis,
    Int(i64),
    BigInt(Rc<BigInt>),
    Float(u64),
    Str(Rc<str>),
    Tuple(Rc<[HashKey]>),
    Type(Type),
    /// Objects hashed by identity: classes, functions, instances and so on.
    Identity(usize),
}

const STR_TAG: u8 = 5;

impl Hash for HashKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::None => 0u8.hash(state),
            Self::Ellipsis => 1u8.hash(state),
            Self::Int(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            Self::BigInt(b) => {
                3u8.hash(state);
                b.hash(state);
            }
            Self::Float(bits) => {
                4u8.hash(state);
                bits.hash(state);
            }
            Self::Str(s) => {
                STR_TAG.hash(state);
                s.as_ref().hash(state);
            }
            Self::Tuple(items) => {
                6u8.hash(state);
                items.hash(state);
            }
            Self::Type(t) => {
                7u8.hash(state);
                t.hash(state);
            }
            Self::Identity(id) => {
                8u8.hash(state);
                id.hash(state);
            }
        }
    }
}

/// Borrowed string key, for looking names up without allocating.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StrKey<'a>(pub &'a str);

impl Hash for StrKey<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        STR_TAG.hash(state);
        self.0.hash(state);
    }
}

impl Equivalent<HashKey> for StrKey<'_> {
    fn equivalent(&self, key: &HashKey) -> bool {
        matches!(key, HashKey::Str(s) if s.as_ref() == self.0)
    }
}

impl HashKey {
    /// The value a key stands for, used when a set or dict needs its keys back.
    #[must_use]
    pub fn to_value(&self) -> Option<Value> {
        Some(match self {
            Self::None => Value::None,
            Self::Ellipsis => Value::Ellipsis,
            Self::Int(i) => Value::Int(*i),
            Self::BigInt(b) => Value::BigInt(b.clone()),
            Self::Float(bits) => Value::Float(f64::from_bits(*bits)),
            Self::Str(s) => Value::Str(s.clone()),
            Self::Tuple(items) => Value::Tuple(items.iter().map(Self::to_value).collect::<Option<Vec<_>>>()?.into()),
            Self::Type(t) => Value::Type(*t),
            Self::Identity(_) => return None,
        })
    }

    /// `hash(x)` as Python code sees it.
    #[must_use]
    pub fn python_hash(&self) -> i64 {
        match self {
            Self::Int(-1) => -2,
            Self::Int(i) => *i,
            other => {
                let state = ahash::RandomState::with_seeds(0x5eed, 0xcafe, 0xf00d, 0xbeef);
                let h = state.hash_one(other) as i64;
                if h == -1 { -2 } else { h }
            }
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s.into())
    }
}

impl From<BigInt> for Value {
    fn from(b: BigInt) -> Self {
        match b.to_i64() {
            Some(i) => Self::Int(i),
            None => Self::BigInt(Rc::new(b)),
        }
    }
}

impl From<Exception> for Value {
    fn from(e: Exception) -> Self {
        Self::Exception(e)
    }
}

impl Value {
    #[must_use]
    pub fn list(items: Vec<Self>) -> Self {
        Self::List(Rc::new(RefCell::new(items)))
    }

    #[must_use]
    pub fn tuple(items: Vec<Self>) -> Self {
        Self::Tuple(items.into())
    }

    #[must_use]
    pub fn dict(dict: Dict) -> Self {
        Self::Dict(Rc::new(RefCell::new(dict)))
    }

    #[must_use]
    pub fn str(s: impl Into<Rc<str>>) -> Self {
        Self::Str(s.into())
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Identity for `is` and `id()`.
    #[must_use]
    pub fn identity(&self) -> usize {
        fn addr<T: ?Sized>(rc: &Rc<T>) -> usize {
            Rc::as_ptr(rc).cast::<()>() as usize
        }
        match self {
            Self::None => 0x1000,
            Self::NotImplemented => 0x1010,
            Self::Ellipsis => 0x1020,
            Self::Bool(b) => 0x1030 + usize::from(*b) * 0x10,
            Self::Int(i) => *i as usize,
            Self::Float(f) => f.to_bits() as usize,
            Self::BigInt(b) => addr(b),
            Self::Str(s) => s.as_ptr() as usize,
            Self::List(l) => addr(l),
            Self::Tuple(t) => t.as_ptr() as usize,
            Self::Dict(d) => addr(d),
            Self::Set(s) => addr(s),
            Self::Range(r) => (r.start as usize) ^ ((r.stop as usize) << 16) ^ 0x2000,
            Self::Slice(s) => addr(s),
            Self::Type(t) => {
                let mut hasher = ahash::AHasher::default();
                t.hash(&mut hasher);
                hasher.finish() as usize
            }
            Self::Class(c) => addr(c),
            Self::Instance(i) => addr(i),
            Self::Function(f) => addr(f),
            Self::Builtin(b) => 0x3000 + *b as usize * 0x10,
            Self::Native(n) => addr(n),
            Self::BoundMethod(m) => addr(m),
            Self::BuiltinMethod(m) => addr(m),
            Self::Super(s) => addr(s),
            Self::Descriptor(d) => addr(d),
            Self::Module(m) => addr(m),
            Self::Exception(e) => e.identity(),
            Self::Coroutine(c) => c.identity(),
            Self::Generator(g) => g.identity(),
            Self::AsyncGenerator(g) => g.identity(),
            Self::Iterator(i) => addr(i),
            Self::Future(f) => f.identity(),
            Self::Task(t) => t.identity(),
            Self::Handle(h) => h.identity(),
            Self::Loop(l) => l.identity(),
            Self::Stream(s) => addr(s),
            Self::Lock(l) => addr(l),
            Self::HostProxy(p) => addr(p),
            Self::SyncTask(t) => Rc::as_ptr(t).cast::<()>() as usize,
        }
    }

    /// Python `is`.
    #[must_use]
    pub fn is(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) | (Self::NotImplemented, Self::NotImplemented) | (Self::Ellipsis, Self::Ellipsis) => {
                true
            }
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Type(a), Self::Type(b)) => a == b,
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => Rc::ptr_eq(a, b) || (a.len() <= 1 && a == b),
            (Self::Float(_), Self::Float(_)) | (Self::Range(_), Self::Range(_)) => false,
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b) && a.identity() == b.identity(),
        }
    }

    /// Name of the value's type, as used in error messages.
    #[must_use]
    pub fn type_name(&self) -> Cow<'static, str> {
        Cow::Borrowed(match self {
            Self::None => "NoneType",
            Self::NotImplemented => "NotImplementedType",
            Self::Ellipsis => "ellipsis",
            Self::Bool(_) => "bool",
            Self::Int(_) | Self::BigInt(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Dict(_) => "dict",
            Self::Set(_) => "set",
            Self::Range(_) => "range",
            Self::Slice(_) => "slice",
            Self::Type(_) | Self::Class(_) => "type",
            Self::Instance(i) => return Cow::Owned(i.class.name.to_string()),
            Self::Function(_) => "function",
            Self::Builtin(_) | Self::Native(_) => "builtin_function_or_method",
            Self::BoundMethod(_) => "method",
            Self::BuiltinMethod(_) => "builtin_function_or_method",
            Self::Super(_) => "super",
            Self::Descriptor(d) => d.type_name(),
            Self::Module(_) => "module",
            Self::Exception(e) => return Cow::Owned(e.type_name()),
            Self::Coroutine(_) => "coroutine",
            Self::Generator(_) => "generator",
            Self::AsyncGenerator(_) => "async_generator",
            Self::Iterator(it) => it.borrow().type_name(),
            Self::Future(_) => "Future",
            Self::Task(_) => "Task",
            Self::Handle(h) => {
                if h.when().is_some() {
                    "TimerHandle"
                } else {
                    "Handle"
                }
            }
            Self::Loop(_) => "WebLoop",
            Self::Stream(_) => "TextStream",
            Self::Lock(_) => "Lock",
            Self::HostProxy(_) => "JsProxy",
            Self::SyncTask(_) => "SyncifyableTask",
        })
    }

    /// `type(x)`.
    #[must_use]
    pub fn py_type(&self) -> Self {
        Self::Type(match self {
            Self::None => Type::NoneType,
            Self::Bool(_) => Type::Bool,
            Self::Int(_) | Self::BigInt(_) => Type::Int,
            Self::Float(_) => Type::Float,
            Self::Str(_) => Type::Str,
            Self::List(_) => Type::List,
            Self::Tuple(_) => Type::Tuple,
            Self::Dict(_) => Type::Dict,
            Self::Set(_) => Type::Set,
            Self::Range(_) => Type::Range,
            Self::Slice(_) => Type::Slice,
            Self::Type(_) | Self::Class(_) => Type::Type,
            Self::Instance(i) => return Self::Class(i.class.clone()),
            Self::Function(_) => Type::Function,
            Self::Module(_) => Type::Module,
            Self::Exception(e) => match e.class() {
                crate::exception::ExcClass::Builtin(t) => Type::Exc(*t),
                crate::exception::ExcClass::User(c) => return Self::Class(c.clone()),
            },
            Self::Descriptor(d) => d.py_type(),
            Self::Coroutine(_) => Type::Coroutine,
            Self::Generator(_) => Type::Generator,
            Self::AsyncGenerator(_) => Type::AsyncGenerator,
            Self::Future(_) => Type::Future,
            Self::Task(_) => Type::Task,
            Self::Lock(_) => Type::Lock,
            _ => Type::Object,
        })
    }

    /// Hash key for dict and set membership.
    pub fn hash_key(&self) -> RunResult<HashKey> {
        Ok(match self {
            Self::None => HashKey::None,
            Self::Ellipsis => HashKey::Ellipsis,
            Self::Bool(b) => HashKey::Int(i64::from(*b)),
            Self::Int(i) => HashKey::Int(*i),
            Self::BigInt(b) => HashKey::BigInt(b.clone()),
            Self::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() && f.abs() < 9.2e18 {
                    HashKey::Int(*f as i64)
                } else if f.is_nan() {
                    HashKey::Float(f64::NAN.to_bits())
                } else {
                    HashKey::Float(f.to_bits())
                }
            }
            Self::Str(s) => HashKey::Str(s.clone()),
            Self::Tuple(items) => HashKey::Tuple(items.iter().map(Self::hash_key).collect::<RunResult<Vec<_>>>()?.into()),
            Self::Type(t) => HashKey::Type(*t),
            Self::Range(r) => HashKey::Tuple(vec![HashKey::Int(r.start), HashKey::Int(r.stop), HashKey::Int(r.step)].into()),
            Self::List(_) | Self::Dict(_) | Self::Set(_) | Self::Slice(_) => {
                return Err(ExcType::TypeError.msg(format!("unhashable type: '{}'", self.type_name())));
            }
            other => HashKey::Identity(other.identity()),
        })
    }

    /// Truthiness for values that do not need to call Python code.
    ///
    /// Returns `None` for instances, which may define `__bool__` or `__len__`.
    #[must_use]
    pub fn truthy_plain(&self) -> Option<bool> {
        Some(match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::BigInt(b) => !b.is_zero(),
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::List(l) => !l.borrow().is_empty(),
            Self::Tuple(t) => !t.is_empty(),
            Self::Dict(d) => !d.borrow().is_empty(),
            Self::Set(s) => !s.borrow().is_empty(),
            Self::Range(r) => !r.is_empty(),
            Self::Instance(_) => return None,
            _ => true,
        })
    }

    /// Equality for builtin values; `None` when Python code may need to decide.
    #[must_use]
    pub fn eq_plain(&self, other: &Self) -> Option<bool> {
        Some(match (self, other) {
            (Self::Instance(_), _) | (_, Self::Instance(_)) => return None,
            (Self::List(a), Self::List(b)) => {
                if Rc::ptr_eq(a, b) {
                    return Some(true);
                }
                let (a, b) = (a.borrow(), b.borrow());
                return seq_eq_plain(&a, &b);
            }
            (Self::Tuple(a), Self::Tuple(b)) => return seq_eq_plain(a, b),
            (Self::Dict(a), Self::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return Some(true);
                }
                let (a, b) = (a.borrow(), b.borrow());
                if a.len() != b.len() {
                    return Some(false);
                }
                for (key, (_, value)) in a.entries() {
                    match b.get(key) {
                        Some(other) => {
                            if !value.eq_plain(&other)? {
                                return Some(false);
                            }
                        }
                        None => return Some(false),
                    }
                }
                true
            }
            (Self::Set(a), Self::Set(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.keys().all(|k| b.contains_key(k))
            }
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Range(a), Self::Range(b)) => {
                a.len() == b.len() && (a.is_empty() || (a.start == b.start && (a.len() == 1 || a.step == b.step)))
            }
            (Self::Exception(a), Self::Exception(b)) => a.is(b),
            (a, b) if a.is_number() && b.is_number() => numbers_eq(a, b),
            (a, b) => {
                if let (Ok(ka), Ok(kb)) = (a.hash_key(), b.hash_key()) {
                    ka == kb
                } else {
                    a.is(b)
                }
            }
        })
    }

    #[must_use]
    pub fn is_number(&self) -> bool {
        matches!(self, Self::Bool(_) | Self::Int(_) | Self::BigInt(_) | Self::Float(_))
    }

    /// Integer value of `bool` / `int`, as a `BigInt`.
    #[must_use]
    pub fn as_bigint(&self) -> Option<BigInt> {
        match self {
            Self::Bool(b) => Some(BigInt::from(i64::from(*b))),
            Self::Int(i) => Some(BigInt::from(*i)),
            Self::BigInt(b) => Some((**b).clone()),
            _ => None,
        }
    }

    /// Integer value that fits in `i64`; bools count as integers.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(f64::from(u8::from(*b))),
            Self::Int(i) => Some(*i as f64),
            Self::BigInt(b) => b.to_f64(),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// `repr(x)` without running Python-level `__repr__` methods.
    #[must_use]
    pub fn repr_plain(&self) -> String {
        let mut visiting = Vec::new();
        self.repr_visiting(&mut visiting)
    }

    fn repr_visiting(&self, visiting: &mut Vec<usize>) -> String {
        let id = self.identity();
        if matches!(self, Self::List(_) | Self::Dict(_) | Self::Set(_)) {
            if visiting.contains(&id) {
                return match self {
                    Self::Dict(_) => "{...}".to_owned(),
                    _ => "[...]".to_owned(),
                };
            }
            visiting.push(id);
            let result = self
                .repr_container(&mut |v| Ok(v.repr_visiting(visiting)))
                .and_then(Result::ok)
                .unwrap_or_default();
            visiting.pop();
            return result;
        }
        if let Some(Ok(s)) = self.repr_container(&mut |v| Ok(v.repr_visiting(visiting))) {
            return s;
        }
        self.repr_leaf()
    }

    /// Renders containers, delegating element reprs to `item`. `None` for non-containers.
    pub(crate) fn repr_container(&self, item: &mut dyn FnMut(&Self) -> RunResult<String>) -> Option<RunResult<String>> {
        Some(match self {
            Self::List(list) => {
                let items = list.borrow().clone();
                join_reprs(&items, item).map(|s| format!("[{s}]"))
            }
            Self::Tuple(items) if items.len() == 1 => item(&items[0]).map(|s| format!("({s},)")),
            Self::Tuple(items) => join_reprs(items, item).map(|s| format!("({s})")),
            Self::Dict(dict) => {
                let entries = dict.borrow().items();
                let mut out = String::from("{");
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let key = match item(k) {
                        Ok(key) => key,
                        Err(e) => return Some(Err(e)),
                    };
                    let value = match item(v) {
                        Ok(value) => value,
                        Err(e) => return Some(Err(e)),
                    };
                    let _ = write!(out, "{key}: {value}");
                }
                out.push('}');
                Ok(out)
            }
            Self::Set(set) => {
                let items: Vec<Self> = set.borrow().values().cloned().collect();
                if items.is_empty() {
                    Ok("set()".to_owned())
                } else {
                    join_reprs(&items, item).map(|s| format!("{{{s}}}"))
                }
            }
            _ => return None,
        })
    }

    /// Repr of non-container values.
    pub(crate) fn repr_leaf(&self) -> String {
        match self {
            Self::None => "None".to_owned(),
            Self::NotImplemented => "NotImplemented".to_owned(),
            Self::Ellipsis => "Ellipsis".to_owned(),
            Self::Bool(true) => "True".to_owned(),
            Self::Bool(false) => "False".to_owned(),
            Self::Int(i) => i.to_string(),
            Self::BigInt(b) => b.to_string(),
            Self::Float(f) => float_repr(*f),
            Self::Str(s) => str_repr(s),
            Self::Range(r) => {
                if r.step == 1 {
                    format!("range({}, {})", r.start, r.stop)
                } else {
                    format!("range({}, {}, {})", r.start, r.stop, r.step)
                }
            }
            Self::Slice(s) => format!(
                "slice({}, {}, {})",
                s.start.repr_plain(),
                s.stop.repr_plain(),
                s.step.repr_plain()
            ),
            Self::Type(t) => format!("<class '{}'>", t.name()),
            Self::Class(c) => format!("<class '{}.{}'>", c.module, c.qualname),
            Self::Instance(i) => format!("<{}.{} object at {:#x}>", i.class.module, i.class.qualname, self.identity()),
            Self::Function(f) => format!("<function {} at {:#x}>", f.def.qualname, self.identity()),
            Self::Builtin(b) => format!("<built-in function {}>", b.name()),
            Self::Native(n) => format!("<built-in function {}>", n.name),
            Self::BoundMethod(m) => format!("<bound method {} of {}>", m.func_name(), m.receiver.repr_plain()),
            Self::BuiltinMethod(m) => format!(
                "<built-in method {} of {} object at {:#x}>",
                m.name,
                m.receiver.type_name(),
                m.receiver.identity()
            ),
            Self::Super(s) => format!("<super: <class '{}'>, <{} object>>", s.class.name, s.obj.type_name()),
            Self::Descriptor(d) => format!("<{} object at {:#x}>", d.type_name(), self.identity()),
            Self::Module(m) => format!("<module '{}'>", m.name),
            Self::Exception(e) => {
                let args = e.args();
                let inner = match args.as_slice() {
                    [single] => single.repr_plain(),
                    many => {
                        let rendered: Vec<String> = many.iter().map(Self::repr_plain).collect();
                        rendered.join(", ")
                    }
                };
                format!("{}({inner})", e.type_name())
            }
            Self::Coroutine(c) => format!("<coroutine object {} at {:#x}>", c.qualname(), self.identity()),
            Self::Generator(g) => format!("<generator object {} at {:#x}>", g.qualname(), self.identity()),
            Self::AsyncGenerator(g) => format!("<async_generator object {} at {:#x}>", g.qualname(), self.identity()),
            Self::Iterator(it) => format!("<{} object at {:#x}>", it.borrow().type_name(), self.identity()),
            Self::Future(f) => f.repr(),
            Self::Task(t) => t.repr(),
            Self::Handle(h) => h.repr(),
            Self::Loop(l) => l.repr(),
            Self::Stream(s) => format!("<TextStream name='{}'>", s.name()),
            Self::Lock(l) => l.repr(),
            Self::HostProxy(p) => format!("[object {}]", p.name),
            Self::SyncTask(t) => t.future().repr().replacen("<Future", "<SyncifyableTask", 1),
            Self::List(_) | Self::Tuple(_) | Self::Dict(_) | Self::Set(_) => self.repr_plain(),
        }
    }

    /// `str(x)` without running Python-level `__str__` methods.
    #[must_use]
    pub fn str_plain(&self) -> String {
        match self {
            Self::Str(s) => s.to_string(),
            Self::Exception(e) => e.message(),
            other => other.repr_plain(),
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.repr_plain())
    }
}

/// Builtin equality, falling back to identity where Python code would decide.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.is(other) || self.eq_plain(other).unwrap_or(false)
    }
}

fn join_reprs(items: &[Value], item: &mut dyn FnMut(&Value) -> RunResult<String>) -> RunResult<String> {
    let mut out = String::new();
    for (i, v) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&item(v)?);
    }
    Ok(out)
}

fn seq_eq_plain(a: &[Value], b: &[Value]) -> Option<bool> {
    if a.len() != b.len() {
        return Some(false);
    }
    for (x, y) in a.iter().zip(b) {
        if !x.is(y) && !x.eq_plain(y)? {
            return Some(false);
        }
    }
    Some(true)
}

fn numbers_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Float(_), _) | (_, Value::Float(_)) => match (a.as_float(), b.as_float()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        _ => a.as_bigint() == b.as_bigint(),
    }
}

/// Python's `repr()` for floats: shortest round-trip digits, exponent form outside `[1e-4, 1e16)`.
#[must_use]
pub fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_owned();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_owned();
    }
    let abs = f.abs();
    if abs != 0.0 && !(1e-4..1e16).contains(&abs) {
        let s = format!("{f:e}");
        let (mantissa, exp) = s.split_once('e').unwrap_or((&s, "0"));
        let exp: i32 = exp.parse().unwrap_or(0);
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exp.abs())
    } else {
        let s = f.to_string();
        if s.contains('.') { s } else { format!("{s}.0") }
    }
}

/// Python's `repr()` for strings.
#[must_use]
pub fn str_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_reprs_match_python() {
        assert_eq!(float_repr(1.0), "1.0");
        assert_eq!(float_repr(0.1), "0.1");
        assert_eq!(float_repr(-0.0), "-0.0");
        assert_eq!(float_repr(1e16), "1e+16");
        assert_eq!(float_repr(1.5e-7), "1.5e-07");
        assert_eq!(float_repr(123.456), "123.456");
        assert_eq!(float_repr(f64::INFINITY), "inf");
    }

    #[test]
    fn str_repr_picks_quotes() {
        assert_eq!(str_repr("abc"), "'abc'");
        assert_eq!(str_repr("it's"), "\"it's\"");
        assert_eq!(str_repr("a\nb"), "'a\\nb'");
        assert_eq!(str_repr("'\""), "'\\'\"'");
    }

    #[test]
    fn numeric_keys_unify() {
        assert_eq!(Value::Bool(true).hash_key().ok(), Value::Int(1).hash_key().ok());
        assert_eq!(Value::Float(2.0).hash_key().ok(), Value::Int(2).hash_key().ok());
        assert!(Value::list(vec![]).hash_key().is_err());
    }

    #[test]
    fn range_len_and_contains() {
        let r = PyRange {
            start: 10,
            stop: 0,
            step: -3,
        };
        assert_eq!(r.len(), 4);
        assert!(r.contains(4));
        assert!(!r.contains(5));
        assert_eq!(r.get(3), Some(1));
    }
}
