use std::{borrow::Cow, cell::RefCell, rc::Rc};

use indexmap::IndexMap;

use crate::{
    exception::{ExcType, RunResult},
    value::{Type, Value},
};

/// A class defined by Python code.
pub struct Class {
    pub name: Rc<str>,
    pub qualname: Rc<str>,
    pub module: Rc<str>,
    /// Explicit bases: classes or builtin types.
    pub bases: Vec<Value>,
    /// Method resolution order without the class itself.
    pub mro: Vec<Rc<Class>>,
    pub dict: RefCell<IndexMap<Rc<str>, Value>>,
    /// Builtin exception type this class derives from, if any.
    pub exc_base: Option<ExcType>,
}

impl Class {
    /// Builds a class, computing its C3 linearization from `bases`.
    pub fn new(
        name: Rc<str>,
        qualname: Rc<str>,
        module: Rc<str>,
        bases: Vec<Value>,
        dict: IndexMap<Rc<str>, Value>,
    ) -> RunResult<Self> {
        let mut exc_base = None;
        let mut class_bases = Vec::new();
        for base in &bases {
            match base {
                Value::Class(c) => {
                    if exc_base.is_none() {
                        exc_base = c.exc_base;
                    }
                    class_bases.push(c.clone());
                }
                Value::Type(Type::Exc(t)) => {
                    if exc_base.is_none() {
                        exc_base = Some(*t);
                    }
                }
                Value::Type(Type::Object) => {}
                Value::Type(t) => {
                    return Err(ExcType::NotImplementedError.msg(format!(
                        "hostpy does not yet support subclassing '{}'",
                        t.name()
                    )));
                }
                other => {
                    return Err(ExcType::TypeError.msg(format!(
                        "bases must be types, not '{}'",
                        other.type_name()
                    )));
                }
            }
        }
        let mro = c3_merge(&class_bases)?;
        Ok(Self {
            name,
            qualname,
            module,
            bases,
            mro,
            dict: RefCell::new(dict),
            exc_base,
        })
    }

    /// Looks `name` up along the MRO.
    #[must_use]
    pub fn lookup(self: &Rc<Self>, name: &str) -> Option<Value> {
        self.lookup_with_owner(name).map(|(v, _)| v)
    }

    /// Looks `name` up along the MRO, returning the class that defines it.
    #[must_use]
    pub fn lookup_with_owner(self: &Rc<Self>, name: &str) -> Option<(Value, Rc<Self>)> {
        if let Some(v) = self.dict.borrow().get(name) {
            return Some((v.clone(), self.clone()));
        }
        self.mro
            .iter()
            .find_map(|c| c.dict.borrow().get(name).map(|v| (v.clone(), c.clone())))
    }

    /// Looks `name` up in the classes that follow `after` in this class's MRO, for `super()`.
    #[must_use]
    pub fn lookup_after(self: &Rc<Self>, after: &Rc<Self>, name: &str) -> Option<Value> {
        let chain = std::iter::once(self).chain(self.mro.iter());
        chain
            .skip_while(|c| !Rc::ptr_eq(c, after))
            .skip(1)
            .find_map(|c| c.dict.borrow().get(name).cloned())
    }

    #[must_use]
    pub fn is_subclass_of(self: &Rc<Self>, other: &Rc<Self>) -> bool {
        Rc::ptr_eq(self, other) || self.mro.iter().any(|c| Rc::ptr_eq(c, other))
    }

    /// `issubclass(cls, builtin_type)`.
    #[must_use]
    pub fn is_subclass_of_type(&self, t: Type) -> bool {
        match t {
            Type::Object => true,
            Type::Exc(exc) => self.exc_base.is_some_and(|base| base.is_subclass_of(exc)),
            _ => false,
        }
    }
}

/// C3 linearization of the given bases.
fn c3_merge(bases: &[Rc<Class>]) -> RunResult<Vec<Rc<Class>>> {
    let mut sequences: Vec<Vec<Rc<Class>>> = bases
        .iter()
        .map(|b| std::iter::once(b.clone()).chain(b.mro.iter().cloned()).collect())
        .collect();
    sequences.push(bases.to_vec());
    let mut result = Vec::new();
    loop {
        sequences.retain(|s| !s.is_empty());
        if sequences.is_empty() {
            return Ok(result);
        }
        let candidate = sequences.iter().map(|s| s[0].clone()).find(|head| {
            !sequences
                .iter()
                .any(|s| s.iter().skip(1).any(|c| Rc::ptr_eq(c, head)))
        });
        let Some(head) = candidate else {
            return Err(ExcType::TypeError.msg("Cannot create a consistent method resolution order (MRO)"));
        };
        for s in &mut sequences {
            if Rc::ptr_eq(&s[0], &head) {
                s.remove(0);
            }
        }
        result.push(head);
    }
}

/// An instance of a user-defined class.
pub struct Instance {
    pub class: Rc<Class>,
    pub dict: RefCell<IndexMap<Rc<str>, Value>>,
}

impl Instance {
    #[must_use]
    pub fn new(class: Rc<Class>) -> Self {
        Self {
            class,
            dict: RefCell::new(IndexMap::new()),
        }
    }
}

/// `property`, `staticmethod` and `classmethod` objects.
pub enum Descriptor {
    Property { fget: Value, fset: Value, fdel: Value },
    StaticMethod(Value),
    ClassMethod(Value),
}

impl Descriptor {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Property { .. } => "property",
            Self::StaticMethod(_) => "staticmethod",
            Self::ClassMethod(_) => "classmethod",
        }
    }

    pub(crate) fn py_type(&self) -> Type {
        match self {
            Self::Property { .. } => Type::Property,
            Self::StaticMethod(_) => Type::StaticMethod,
            Self::ClassMethod(_) => Type::ClassMethod,
        }
    }

    /// The wrapped function, for `__func__` and decorator introspection.
    #[must_use]
    pub fn inner(&self) -> Cow<'_, Value> {
        match self {
            Self::Property { fget, .. } => Cow::Borrowed(fget),
            Self::StaticMethod(f) | Self::ClassMethod(f) => Cow::Borrowed(f),
        }
    }
}

/// A `super()` proxy bound to `obj`, resolving attributes after `class` in the MRO.
pub struct SuperObj {
    pub class: Rc<Class>,
    pub obj: Value,
}
