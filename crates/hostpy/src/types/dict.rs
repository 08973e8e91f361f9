use std::rc::Rc;

use indexmap::IndexMap;

use crate::{
    exception::RunResult,
    value::{HashKey, StrKey, Value},
};

/// An insertion-ordered Python dict.
///
/// Each entry keeps the original key value next to its hash key so `keys()` returns the objects
/// that were inserted. Mutating methods return displaced values so callers can drop them after
/// releasing any `RefCell` borrow of the dict.
#[derive(Clone, Default)]
pub struct Dict {
    map: IndexMap<HashKey, (Value, Value)>,
}

impl Dict {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &HashKey) -> Option<Value> {
        self.map.get(key).map(|(_, v)| v.clone())
    }

    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<Value> {
        self.map.get(&StrKey(name)).map(|(_, v)| v.clone())
    }

    #[must_use]
    pub fn contains_key(&self, key: &HashKey) -> bool {
        self.map.contains_key(key)
    }

    #[must_use]
    pub fn contains_str(&self, name: &str) -> bool {
        self.map.contains_key(&StrKey(name))
    }

    /// Inserts `key: value`, returning the previous value.
    pub fn set(&mut self, key: Value, value: Value) -> RunResult<Option<Value>> {
        let hash_key = key.hash_key()?;
        Ok(self.set_hashed(hash_key, key, value))
    }

    pub(crate) fn set_hashed(&mut self, hash_key: HashKey, key: Value, value: Value) -> Option<Value> {
        match self.map.get_mut(&hash_key) {
            Some(entry) => Some(std::mem::replace(&mut entry.1, value)),
            None => {
                self.map.insert(hash_key, (key, value));
                None
            }
        }
    }

    pub fn set_str(&mut self, name: impl Into<Rc<str>>, value: Value) -> Option<Value> {
        let name = name.into();
        self.set_hashed(HashKey::Str(name.clone()), Value::Str(name), value)
    }

    /// Removes an entry, keeping the order of the remaining ones.
    pub fn remove(&mut self, key: &HashKey) -> Option<(Value, Value)> {
        self.map.shift_remove(key)
    }

    pub fn remove_str(&mut self, name: &str) -> Option<Value> {
        self.map.shift_remove(&StrKey(name)).map(|(_, v)| v)
    }

    pub fn pop_last(&mut self) -> Option<(Value, Value)> {
        self.map.pop().map(|(_, entry)| entry)
    }

    /// Empties the dict and hands back the old contents.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<Value> {
        self.map.values().map(|(k, _)| k.clone()).collect()
    }

    #[must_use]
    pub fn values(&self) -> Vec<Value> {
        self.map.values().map(|(_, v)| v.clone()).collect()
    }

    #[must_use]
    pub fn items(&self) -> Vec<(Value, Value)> {
        self.map.values().cloned().collect()
    }

    /// Names of all string keys, in insertion order.
    #[must_use]
    pub fn str_keys(&self) -> Vec<Rc<str>> {
        self.map
            .keys()
            .filter_map(|k| match k {
                HashKey::Str(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&HashKey, &(Value, Value))> {
        self.map.iter()
    }
}

impl FromIterator<(Rc<str>, Value)> for Dict {
    fn from_iter<I: IntoIterator<Item = (Rc<str>, Value)>>(iter: I) -> Self {
        let mut dict = Self::new();
        for (name, value) in iter {
            dict.set_str(name, value);
        }
        dict
    }
}
