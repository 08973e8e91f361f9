use std::{cell::RefCell, rc::Rc};

use indexmap::IndexMap;

use crate::value::Value;

/// Resolves attributes a module does not store itself, such as host namespace members.
pub type ModuleFallback = dyn Fn(&str) -> Option<Value>;

/// A module object.
pub struct ModuleObj {
    pub name: Rc<str>,
    pub attrs: RefCell<IndexMap<Rc<str>, Value>>,
    pub fallback: Option<Box<ModuleFallback>>,
}

impl ModuleObj {
    #[must_use]
    pub fn new(name: impl Into<Rc<str>>) -> Self {
        Self {
            name: name.into(),
            attrs: RefCell::new(IndexMap::new()),
            fallback: None,
        }
    }

    #[must_use]
    pub fn with_fallback(name: impl Into<Rc<str>>, fallback: impl Fn(&str) -> Option<Value> + 'static) -> Self {
        Self {
            fallback: Some(Box::new(fallback)),
            ..Self::new(name)
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        let found = self.attrs.borrow().get(name).cloned();
        found.or_else(|| self.fallback.as_ref().and_then(|f| f(name)))
    }

    pub fn set(&self, name: impl Into<Rc<str>>, value: Value) {
        let old = self.attrs.borrow_mut().insert(name.into(), value);
        drop(old);
    }

    #[must_use]
    pub fn names(&self) -> Vec<Rc<str>> {
        self.attrs.borrow().keys().cloned().collect()
    }
}

/// An object owned by the host, exposed to Python through the `js` namespace.
pub struct HostProxy {
    pub name: Rc<str>,
    pub attrs: IndexMap<Rc<str>, Value>,
}

impl HostProxy {
    #[must_use]
    pub fn new(name: impl Into<Rc<str>>, attrs: impl IntoIterator<Item = (Rc<str>, Value)>) -> Self {
        Self {
            name: name.into(),
            attrs: attrs.into_iter().collect(),
        }
    }
}
