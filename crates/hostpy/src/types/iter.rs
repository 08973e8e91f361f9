use crate::value::{ListRef, PyRange, Value};

/// Iterator objects over builtin values and the lazy builtins (`enumerate`, `zip`, ...).
pub enum PyIter {
    /// A snapshot of items: tuples, dict views, sets and `reversed()` results.
    Items { items: Vec<Value>, index: usize, name: &'static str },
    /// A live list; appends during iteration are observed, like Python.
    List { list: ListRef, index: usize },
    Str { chars: Vec<char>, index: usize },
    Range { range: PyRange, index: usize },
    Enumerate { inner: Value, count: i64 },
    Zip { inners: Vec<Value> },
    Map { func: Value, inners: Vec<Value> },
    Filter { func: Value, inner: Value },
    Exhausted,
}

/// What the runtime must do to produce the next item.
pub(crate) enum IterStep {
    Done,
    Item(Value),
    Enumerate { inner: Value, count: i64 },
    Zip(Vec<Value>),
    Map { func: Value, inners: Vec<Value> },
    Filter { func: Value, inner: Value },
}

impl PyIter {
    #[must_use]
    pub fn items(items: Vec<Value>, name: &'static str) -> Self {
        Self::Items { items, index: 0, name }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Items { name, .. } => name,
            Self::List { .. } => "list_iterator",
            Self::Str { .. } => "str_ascii_iterator",
            Self::Range { .. } => "range_iterator",
            Self::Enumerate { .. } => "enumerate",
            Self::Zip { .. } => "zip",
            Self::Map { .. } => "map",
            Self::Filter { .. } => "filter",
            Self::Exhausted => "iterator",
        }
    }

    /// Advances plain iterators; composite ones return the pieces the runtime must call.
    pub(crate) fn step(&mut self) -> IterStep {
        match self {
            Self::Items { items, index, .. } => match items.get(*index) {
                Some(v) => {
                    *index += 1;
                    IterStep::Item(v.clone())
                }
                None => IterStep::Done,
            },
            Self::List { list, index } => {
                let item = list.borrow().get(*index).cloned();
                match item {
                    Some(v) => {
                        *index += 1;
                        IterStep::Item(v)
                    }
                    None => {
                        *self = Self::Exhausted;
                        IterStep::Done
                    }
                }
            }
            Self::Str { chars, index } => match chars.get(*index) {
                Some(c) => {
                    *index += 1;
                    IterStep::Item(Value::Str(c.to_string().into()))
                }
                None => IterStep::Done,
            },
            Self::Range { range, index } => match range.get(*index) {
                Some(n) => {
                    *index += 1;
                    IterStep::Item(Value::Int(n))
                }
                None => IterStep::Done,
            },
            Self::Enumerate { inner, count } => {
                let step = IterStep::Enumerate {
                    inner: inner.clone(),
                    count: *count,
                };
                *count += 1;
                step
            }
            Self::Zip { inners } => IterStep::Zip(inners.clone()),
            Self::Map { func, inners } => IterStep::Map {
                func: func.clone(),
                inners: inners.clone(),
            },
            Self::Filter { func, inner } => IterStep::Filter {
                func: func.clone(),
                inner: inner.clone(),
            },
            Self::Exhausted => IterStep::Done,
        }
    }

    /// Items left without consuming, when cheaply known (`length_hint`).
    #[must_use]
    pub fn remaining(&self) -> Option<usize> {
        match self {
            Self::Items { items, index, .. } => Some(items.len().saturating_sub(*index)),
            Self::List { list, index } => Some(list.borrow().len().saturating_sub(*index)),
            Self::Str { chars, index } => Some(chars.len().saturating_sub(*index)),
            Self::Range { range, index } => Some(range.len().saturating_sub(*index)),
            Self::Exhausted => Some(0),
            _ => None,
        }
    }
}
