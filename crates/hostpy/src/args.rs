use std::rc::Rc;

use crate::{
    exception::{ExcType, Exception, RunResult},
    value::Value,
};

/// Arguments of a call: positional values followed by keyword arguments in call order.
#[derive(Debug, Clone, Default)]
pub struct Args {
    pub positional: Vec<Value>,
    pub keywords: Vec<(Rc<str>, Value)>,
}

impl Args {
    #[must_use]
    pub fn new(positional: Vec<Value>, keywords: Vec<(Rc<str>, Value)>) -> Self {
        Self { positional, keywords }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn one(value: Value) -> Self {
        Self::positional(vec![value])
    }

    #[must_use]
    pub fn two(a: Value, b: Value) -> Self {
        Self::positional(vec![a, b])
    }

    #[must_use]
    pub fn positional(positional: Vec<Value>) -> Self {
        Self {
            positional,
            keywords: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_keyword(mut self, name: impl Into<Rc<str>>, value: Value) -> Self {
        self.keywords.push((name.into(), value));
        self
    }

    /// Total number of arguments passed.
    #[must_use]
    pub fn count(&self) -> usize {
        self.positional.len() + self.keywords.len()
    }

    /// Inserts `receiver` as the first positional argument, for bound methods.
    #[must_use]
    pub fn prepend(mut self, receiver: Value) -> Self {
        self.positional.insert(0, receiver);
        self
    }

    /// Removes and returns the keyword argument `name`.
    pub fn take_keyword(&mut self, name: &str) -> Option<Value> {
        let index = self.keywords.iter().position(|(k, _)| k.as_ref() == name)?;
        Some(self.keywords.remove(index).1)
    }

    /// Fails if any keyword argument is left, naming the first unexpected one.
    pub fn no_keywords(&self, name: &str) -> RunResult<()> {
        match self.keywords.first() {
            None => Ok(()),
            Some((key, _)) => Err(ExcType::TypeError.msg(format!(
                "{name}() got an unexpected keyword argument '{key}'"
            ))),
        }
    }

    pub fn check_zero_args(self, name: &str) -> RunResult<()> {
        self.no_keywords(name)?;
        if self.positional.is_empty() {
            Ok(())
        } else {
            Err(type_error_no_args(name, self.positional.len()))
        }
    }

    pub fn get_one_arg(self, name: &str) -> RunResult<Value> {
        let [a] = self.exact::<1>(name)?;
        Ok(a)
    }

    pub fn get_two_args(self, name: &str) -> RunResult<(Value, Value)> {
        let [a, b] = self.exact::<2>(name)?;
        Ok((a, b))
    }

    /// Returns the positional arguments when their count is within `min..=max`.
    pub fn get_range(self, name: &str, min: usize, max: usize) -> RunResult<Vec<Value>> {
        self.no_keywords(name)?;
        let count = self.positional.len();
        if count < min {
            Err(ExcType::TypeError.msg(format!(
                "{name} expected at least {min} argument{}, got {count}",
                plural(min)
            )))
        } else if count > max {
            Err(ExcType::TypeError.msg(format!(
                "{name} expected at most {max} argument{}, got {count}",
                plural(max)
            )))
        } else {
            Ok(self.positional)
        }
    }

    /// One required and one optional positional argument.
    pub fn get_one_two_args(self, name: &str) -> RunResult<(Value, Option<Value>)> {
        let mut args = self.get_range(name, 1, 2)?.into_iter();
        match (args.next(), args.next()) {
            (Some(a), b) => Ok((a, b)),
            (None, _) => Err(type_error_arg_count(name, 1, 0)),
        }
    }

    /// Zero or one positional argument.
    pub fn get_zero_one_arg(self, name: &str) -> RunResult<Option<Value>> {
        Ok(self.get_range(name, 0, 1)?.into_iter().next())
    }

    fn exact<const N: usize>(self, name: &str) -> RunResult<[Value; N]> {
        self.no_keywords(name)?;
        let count = self.positional.len();
        <[Value; N]>::try_from(self.positional).map_err(|_| type_error_arg_count(name, N, count))
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 { "" } else { "s" }
}

pub(crate) fn type_error_no_args(name: &str, count: usize) -> Exception {
    ExcType::TypeError.msg(format!("{name}() takes no arguments ({count} given)"))
}

pub(crate) fn type_error_arg_count(name: &str, expected: usize, count: usize) -> Exception {
    if expected == 1 {
        ExcType::TypeError.msg(format!("{name}() takes exactly one argument ({count} given)"))
    } else {
        ExcType::TypeError.msg(format!("{name}() takes exactly {expected} arguments ({count} given)"))
    }
}
