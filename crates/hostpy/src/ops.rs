//! Operators and protocols: arithmetic, comparison, truthiness, `repr`/`str`, item access,
//! iteration and sorting. User classes take part through their dunder methods.

use std::{cmp::Ordering, rc::Rc};

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Signed, ToPrimitive, Zero};

use crate::{
    args::Args,
    exception::{ExcType, Exception, RunResult},
    expressions::{CmpOperator, Operator, UnaryOperator},
    fstring,
    runtime::Runtime,
    types::{IterStep, PyIter},
    value::{HashKey, PyRange, SetRef, Value},
};

/// A numeric operand after bool promotion.
enum Num {
    Int(i64),
    Big(BigInt),
    Float(f64),
}

fn num(v: &Value) -> Option<Num> {
    match v {
        Value::Bool(b) => Some(Num::Int(i64::from(*b))),
        Value::Int(i) => Some(Num::Int(*i)),
        Value::BigInt(b) => Some(Num::Big((**b).clone())),
        Value::Float(f) => Some(Num::Float(*f)),
        _ => None,
    }
}

impl Num {
    fn to_f64(&self) -> f64 {
        match self {
            Self::Int(i) => *i as f64,
            Self::Big(b) => b.to_f64().unwrap_or(f64::INFINITY),
            Self::Float(f) => *f,
        }
    }

    fn to_big(&self) -> BigInt {
        match self {
            Self::Int(i) => BigInt::from(*i),
            Self::Big(b) => b.clone(),
            Self::Float(f) => BigInt::from(*f as i64),
        }
    }
}

/// Python's float modulo: the result takes the sign of the divisor.
fn float_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) { r + b } else { r }
}

fn int_op(a: i64, op: Operator, b: i64) -> RunResult<Value> {
    let checked = match op {
        Operator::Add => a.checked_add(b),
        Operator::Sub => a.checked_sub(b),
        Operator::Mult => a.checked_mul(b),
        Operator::FloorDiv => {
            if b == 0 {
                return Err(ExcType::ZeroDivisionError.msg("integer division or modulo by zero"));
            }
            a.checked_div_euclid(b).map(|_| a.div_floor(&b))
        }
        Operator::Mod => {
            if b == 0 {
                return Err(ExcType::ZeroDivisionError.msg("integer modulo by zero"));
            }
            a.checked_rem(b).map(|_| a.mod_floor(&b))
        }
        Operator::Div => {
            if b == 0 {
                return Err(ExcType::ZeroDivisionError.msg("division by zero"));
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        Operator::Pow => {
            if b < 0 {
                if a == 0 {
                    return Err(ExcType::ZeroDivisionError.msg("0.0 cannot be raised to a negative power"));
                }
                return Ok(Value::Float((a as f64).powf(b as f64)));
            }
            u32::try_from(b).ok().and_then(|e| a.checked_pow(e))
        }
        Operator::LShift => {
            if b < 0 {
                return Err(ExcType::ValueError.msg("negative shift count"));
            }
            u32::try_from(b)
                .ok()
                .filter(|&s| s < 63)
                .and_then(|s| a.checked_shl(s))
                .filter(|r| r >> b == a)
        }
        Operator::RShift => {
            if b < 0 {
                return Err(ExcType::ValueError.msg("negative shift count"));
            }
            Some(if b >= 64 { if a < 0 { -1 } else { 0 } } else { a >> b })
        }
        Operator::BitAnd => Some(a & b),
        Operator::BitOr => Some(a | b),
        Operator::BitXor => Some(a ^ b),
        Operator::MatMult => return Err(unsupported(op, &Value::Int(a), &Value::Int(b))),
    };
    match checked {
        Some(value) => Ok(Value::Int(value)),
        None => big_op(&BigInt::from(a), op, &BigInt::from(b)),
    }
}

fn big_op(a: &BigInt, op: Operator, b: &BigInt) -> RunResult<Value> {
    Ok(Value::from(match op {
        Operator::Add => a + b,
        Operator::Sub => a - b,
        Operator::Mult => a * b,
        Operator::FloorDiv => {
            if b.is_zero() {
                return Err(ExcType::ZeroDivisionError.msg("integer division or modulo by zero"));
            }
            a.div_floor(b)
        }
        Operator::Mod => {
            if b.is_zero() {
                return Err(ExcType::ZeroDivisionError.msg("integer modulo by zero"));
            }
            a.mod_floor(b)
        }
        Operator::Div => {
            if b.is_zero() {
                return Err(ExcType::ZeroDivisionError.msg("division by zero"));
            }
            let (x, y) = (a.to_f64().unwrap_or(f64::NAN), b.to_f64().unwrap_or(f64::NAN));
            return Ok(Value::Float(x / y));
        }
        Operator::Pow => {
            if b.is_negative() {
                let (x, y) = (a.to_f64().unwrap_or(f64::NAN), b.to_f64().unwrap_or(f64::NAN));
                return Ok(Value::Float(x.powf(y)));
            }
            let Some(exp) = b.to_u32() else {
                return Err(ExcType::OverflowError.msg("exponent too large"));
            };
            a.pow(exp)
        }
        Operator::LShift | Operator::RShift => {
            if b.is_negative() {
                return Err(ExcType::ValueError.msg("negative shift count"));
            }
            let Some(shift) = b.to_usize() else {
                return Err(ExcType::OverflowError.msg("shift count too large"));
            };
            if op == Operator::LShift { a << shift } else { a >> shift }
        }
        Operator::BitAnd => a & b,
        Operator::BitOr => a | b,
        Operator::BitXor => a ^ b,
        Operator::MatMult => return Err(unsupported(op, &Value::from(a.clone()), &Value::from(b.clone()))),
    }))
}

fn float_op(a: f64, op: Operator, b: f64, left: &Value, right: &Value) -> RunResult<Value> {
    Ok(Value::Float(match op {
        Operator::Add => a + b,
        Operator::Sub => a - b,
        Operator::Mult => a * b,
        Operator::Div => {
            if b == 0.0 {
                return Err(ExcType::ZeroDivisionError.msg("float division by zero"));
            }
            a / b
        }
        Operator::FloorDiv => {
            if b == 0.0 {
                return Err(ExcType::ZeroDivisionError.msg("float floor division by zero"));
            }
            ((a - float_mod(a, b)) / b).round()
        }
        Operator::Mod => {
            if b == 0.0 {
                return Err(ExcType::ZeroDivisionError.msg("float modulo by zero"));
            }
            float_mod(a, b)
        }
        Operator::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(ExcType::ZeroDivisionError.msg("0.0 cannot be raised to a negative power"));
            }
            if a < 0.0 && b.fract() != 0.0 {
                return Err(ExcType::NotImplementedError.msg("complex numbers are not supported"));
            }
            a.powf(b)
        }
        _ => return Err(unsupported(op, left, right)),
    }))
}

fn numeric_op(left: &Value, op: Operator, right: &Value) -> Option<RunResult<Value>> {
    let (a, b) = (num(left)?, num(right)?);
    Some(match (&a, &b) {
        (Num::Int(x), Num::Int(y)) => int_op(*x, op, *y),
        (Num::Float(_), _) | (_, Num::Float(_)) => float_op(a.to_f64(), op, b.to_f64(), left, right),
        _ => big_op(&a.to_big(), op, &b.to_big()),
    })
}

fn unsupported(op: Operator, left: &Value, right: &Value) -> Exception {
    ExcType::TypeError.msg(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        left.type_name(),
        right.type_name()
    ))
}

fn repeat_count(v: &Value) -> Option<usize> {
    match v {
        Value::Int(_) | Value::Bool(_) => Some(usize::try_from(v.as_int()?.max(0)).unwrap_or(0)),
        _ => None,
    }
}

/// `[start, stop)` with `step`, clamped to a sequence of length `len` like `slice.indices`.
pub(crate) fn slice_indices(rt: &Runtime, slice: &crate::value::SliceObj, len: usize) -> RunResult<(i64, i64, i64)> {
    let len = len as i64;
    let step = match &slice.step {
        Value::None => 1,
        other => rt.index(other)?,
    };
    if step == 0 {
        return Err(ExcType::ValueError.msg("slice step cannot be zero"));
    }
    let (lower, upper) = if step < 0 { (-1, len - 1) } else { (0, len) };
    let clamp = |v: &Value, default: i64| -> RunResult<i64> {
        match v {
            Value::None => Ok(default),
            other => {
                let i = rt.index(other)?;
                Ok(if i < 0 { (i + len).max(lower) } else { i.min(upper) })
            }
        }
    };
    let start = clamp(&slice.start, if step < 0 { upper } else { lower })?;
    let stop = clamp(&slice.stop, if step < 0 { lower } else { upper })?;
    Ok((start, stop, step))
}

fn slice_positions(start: i64, stop: i64, step: i64) -> impl Iterator<Item = usize> {
    let mut i = start;
    std::iter::from_fn(move || {
        let more = if step > 0 { i < stop } else { i > stop };
        if !more {
            return None;
        }
        let current = i;
        i += step;
        usize::try_from(current).ok()
    })
}

/// Resolves a possibly negative index against `len`.
fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let i = if index < 0 { index + len } else { index };
    (0..len).contains(&i).then(|| i as usize)
}

impl Runtime {
    /// Calls a dunder method on an instance; `None` if it is missing or returns `NotImplemented`.
    fn call_dunder(&self, obj: &Value, name: &str, args: Vec<Value>) -> RunResult<Option<Value>> {
        let Some(method) = self.lookup_user_special(obj, name) else {
            return Ok(None);
        };
        let result = self.call(&method, Args::positional(args))?;
        Ok((!matches!(result, Value::NotImplemented)).then_some(result))
    }

    /// Special method defined by a user class, bound to `obj`.
    fn lookup_user_special(&self, obj: &Value, name: &str) -> Option<Value> {
        match obj {
            Value::Instance(_) => self.lookup_special(obj, name),
            Value::Exception(exc) if matches!(exc.class(), crate::exception::ExcClass::User(_)) => {
                self.lookup_special(obj, name).filter(|m| !matches!(m, Value::BuiltinMethod(_)))
            }
            _ => None,
        }
    }

    /// `left <op> right`.
    pub fn binary_op(&self, left: &Value, op: Operator, right: &Value) -> RunResult<Value> {
        if let Some(result) = numeric_op(left, op, right) {
            return result;
        }
        if let Some(result) = self.builtin_binary(left, op, right)? {
            return Ok(result);
        }
        let (name, rname) = op.dunders();
        if let Some(result) = self.call_dunder(left, name, vec![right.clone()])? {
            return Ok(result);
        }
        if let Some(result) = self.call_dunder(right, rname, vec![left.clone()])? {
            return Ok(result);
        }
        Err(match (left, op) {
            (Value::Str(_), Operator::Add) => ExcType::TypeError.msg(format!(
                "can only concatenate str (not \"{}\") to str",
                right.type_name()
            )),
            (Value::List(_), Operator::Add) => ExcType::TypeError.msg(format!(
                "can only concatenate list (not \"{}\") to list",
                right.type_name()
            )),
            (Value::Tuple(_), Operator::Add) => ExcType::TypeError.msg(format!(
                "can only concatenate tuple (not \"{}\") to tuple",
                right.type_name()
            )),
            _ => unsupported(op, left, right),
        })
    }

    fn builtin_binary(&self, left: &Value, op: Operator, right: &Value) -> RunResult<Option<Value>> {
        Ok(Some(match (left, op, right) {
            (Value::Str(a), Operator::Add, Value::Str(b)) => {
                let mut s = String::with_capacity(a.len() + b.len());
                s.push_str(a);
                s.push_str(b);
                Value::str(s)
            }
            (Value::Str(s), Operator::Mult, n) | (n, Operator::Mult, Value::Str(s)) if repeat_count(n).is_some() => {
                Value::str(s.repeat(repeat_count(n).unwrap_or(0)))
            }
            (Value::Str(fmt), Operator::Mod, args) => Value::str(fstring::percent_format(self, fmt, args)?),
            (Value::List(a), Operator::Add, Value::List(b)) => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                Value::list(items)
            }
            (Value::List(l), Operator::Mult, n) | (n, Operator::Mult, Value::List(l)) if repeat_count(n).is_some() => {
                let items = l.borrow();
                let count = repeat_count(n).unwrap_or(0);
                Value::list(items.iter().cloned().cycle().take(items.len() * count).collect())
            }
            (Value::Tuple(a), Operator::Add, Value::Tuple(b)) => Value::tuple(a.iter().chain(b.iter()).cloned().collect()),
            (Value::Tuple(t), Operator::Mult, n) | (n, Operator::Mult, Value::Tuple(t)) if repeat_count(n).is_some() => {
                let count = repeat_count(n).unwrap_or(0);
                Value::tuple(t.iter().cloned().cycle().take(t.len() * count).collect())
            }
            (Value::Set(a), Operator::BitOr | Operator::BitAnd | Operator::Sub | Operator::BitXor, Value::Set(b)) => {
                Value::Set(Rc::new(std::cell::RefCell::new(set_op(a, op, b))))
            }
            (Value::Dict(a), Operator::BitOr, Value::Dict(b)) => {
                let mut merged = a.borrow().clone();
                for (k, v) in b.borrow().items() {
                    merged.set(k, v)?;
                }
                Value::dict(merged)
            }
            _ => return Ok(None),
        }))
    }

    /// `left <op>= right`: mutates lists, sets and dicts in place.
    pub fn inplace_op(&self, left: &Value, op: Operator, right: &Value) -> RunResult<Value> {
        match (left, op) {
            (Value::List(list), Operator::Add) => {
                let items = self.to_vec(right)?;
                list.borrow_mut().extend(items);
                return Ok(left.clone());
            }
            (Value::List(list), Operator::Mult) if repeat_count(right).is_some() => {
                let count = repeat_count(right).unwrap_or(0);
                let mut items = list.borrow_mut();
                let original = std::mem::take(&mut *items);
                *items = original.iter().cloned().cycle().take(original.len() * count).collect();
                drop(items);
                drop(original);
                return Ok(left.clone());
            }
            (Value::Set(set), Operator::BitOr | Operator::BitAnd | Operator::Sub | Operator::BitXor) => {
                if let Value::Set(other) = right {
                    let result = set_op(set, op, other);
                    let old = std::mem::replace(&mut *set.borrow_mut(), result);
                    drop(old);
                    return Ok(left.clone());
                }
            }
            (Value::Dict(dict), Operator::BitOr) => {
                let items = self.mapping_items(right)?;
                for (k, v) in items {
                    let old = dict.borrow_mut().set(k, v)?;
                    drop(old);
                }
                return Ok(left.clone());
            }
            _ => {}
        }
        let name = format!("__i{}", &op.dunders().0[2..]);
        if let Some(result) = self.call_dunder(left, &name, vec![right.clone()])? {
            return Ok(result);
        }
        self.binary_op(left, op, right)
    }

    pub fn unary_op(&self, op: UnaryOperator, operand: &Value) -> RunResult<Value> {
        let result = match (op, operand) {
            (UnaryOperator::Not, v) => Some(Value::Bool(!self.truthy(v)?)),
            (UnaryOperator::Neg, Value::Int(i)) => {
                Some(i.checked_neg().map_or_else(|| Value::from(-BigInt::from(*i)), Value::Int))
            }
            (UnaryOperator::Neg, Value::Bool(b)) => Some(Value::Int(-i64::from(*b))),
            (UnaryOperator::Neg, Value::BigInt(b)) => Some(Value::from(-(**b).clone())),
            (UnaryOperator::Neg, Value::Float(f)) => Some(Value::Float(-f)),
            (UnaryOperator::Pos, Value::Bool(b)) => Some(Value::Int(i64::from(*b))),
            (UnaryOperator::Pos, v @ (Value::Int(_) | Value::BigInt(_) | Value::Float(_))) => Some(v.clone()),
            (UnaryOperator::Invert, Value::Int(i)) => Some(Value::Int(!i)),
            (UnaryOperator::Invert, Value::Bool(b)) => Some(Value::Int(!i64::from(*b))),
            (UnaryOperator::Invert, Value::BigInt(b)) => Some(Value::from(-(**b).clone() - 1)),
            _ => None,
        };
        if let Some(result) = result {
            return Ok(result);
        }
        let (name, symbol) = match op {
            UnaryOperator::Neg => ("__neg__", "-"),
            UnaryOperator::Pos => ("__pos__", "+"),
            UnaryOperator::Invert => ("__invert__", "~"),
            UnaryOperator::Not => ("__bool__", "not"),
        };
        if let Some(result) = self.call_dunder(operand, name, Vec::new())? {
            return Ok(result);
        }
        Err(ExcType::TypeError.msg(format!(
            "bad operand type for unary {symbol}: '{}'",
            operand.type_name()
        )))
    }

    /// Evaluates one comparison of a chain.
    pub fn compare(&self, left: &Value, op: CmpOperator, right: &Value) -> RunResult<Value> {
        Ok(Value::Bool(match op {
            CmpOperator::Is => left.is(right),
            CmpOperator::IsNot => !left.is(right),
            CmpOperator::In => self.contains(right, left)?,
            CmpOperator::NotIn => !self.contains(right, left)?,
            CmpOperator::Eq | CmpOperator::NotEq => {
                let (name, rname) = if op == CmpOperator::Eq {
                    ("__eq__", "__eq__")
                } else {
                    ("__ne__", "__ne__")
                };
                if let Some(result) = self.call_dunder(left, name, vec![right.clone()])? {
                    return Ok(result);
                }
                if let Some(result) = self.call_dunder(right, rname, vec![left.clone()])? {
                    return Ok(result);
                }
                let equal = self.eq(left, right)?;
                if op == CmpOperator::Eq { equal } else { !equal }
            }
            CmpOperator::Lt | CmpOperator::LtE | CmpOperator::Gt | CmpOperator::GtE => {
                if let Some(ordering) = self.builtin_order(left, right)? {
                    match op {
                        CmpOperator::Lt => ordering == Some(Ordering::Less),
                        CmpOperator::LtE => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
                        CmpOperator::Gt => ordering == Some(Ordering::Greater),
                        _ => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
                    }
                } else {
                    let (name, reflected, symbol) = match op {
                        CmpOperator::Lt => ("__lt__", "__gt__", "<"),
                        CmpOperator::LtE => ("__le__", "__ge__", "<="),
                        CmpOperator::Gt => ("__gt__", "__lt__", ">"),
                        _ => ("__ge__", "__le__", ">="),
                    };
                    if let Some(result) = self.call_dunder(left, name, vec![right.clone()])? {
                        return Ok(result);
                    }
                    if let Some(result) = self.call_dunder(right, reflected, vec![left.clone()])? {
                        return Ok(result);
                    }
                    return Err(ExcType::TypeError.msg(format!(
                        "'{symbol}' not supported between instances of '{}' and '{}'",
                        left.type_name(),
                        right.type_name()
                    )));
                }
            }
        }))
    }

    /// Ordering of builtin values. `Ok(None)` means the types are not ordered by the builtins;
    /// `Ok(Some(None))` means unordered values such as NaN.
    fn builtin_order(&self, left: &Value, right: &Value) -> RunResult<Option<Option<Ordering>>> {
        Ok(Some(match (left, right) {
            (a, b) if a.is_number() && b.is_number() => match (num(a), num(b)) {
                (Some(Num::Int(x)), Some(Num::Int(y))) => Some(x.cmp(&y)),
                (Some(x @ Num::Float(_)), Some(y)) | (Some(x), Some(y @ Num::Float(_))) => x.to_f64().partial_cmp(&y.to_f64()),
                (Some(x), Some(y)) => Some(x.to_big().cmp(&y.to_big())),
                _ => None,
            },
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::List(a), Value::List(b)) => {
                let (a, b) = (a.borrow().clone(), b.borrow().clone());
                Some(self.sequence_order(&a, &b)?)
            }
            (Value::Tuple(a), Value::Tuple(b)) => Some(self.sequence_order(a, b)?),
            (Value::Set(a), Value::Set(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                let sub = a.keys().all(|k| b.contains_key(k));
                let sup = b.keys().all(|k| a.contains_key(k));
                match (sub, sup) {
                    (true, true) => Some(Ordering::Equal),
                    (true, false) => Some(Ordering::Less),
                    (false, true) => Some(Ordering::Greater),
                    (false, false) => None,
                }
            }
            _ => return Ok(None),
        }))
    }

    fn sequence_order(&self, a: &[Value], b: &[Value]) -> RunResult<Ordering> {
        for (x, y) in a.iter().zip(b) {
            if self.eq(x, y)? {
                continue;
            }
            return Ok(if self.lt(x, y)? { Ordering::Less } else { Ordering::Greater });
        }
        Ok(a.len().cmp(&b.len()))
    }

    /// `a < b` as a bool.
    pub fn lt(&self, a: &Value, b: &Value) -> RunResult<bool> {
        let result = self.compare(a, CmpOperator::Lt, b)?;
        self.truthy(&result)
    }

    /// `a == b` as a bool, consulting `__eq__` on instances.
    pub fn eq(&self, a: &Value, b: &Value) -> RunResult<bool> {
        if a.is(b) && !matches!(a, Value::Float(_)) {
            return Ok(true);
        }
        if let Some(equal) = a.eq_plain(b) {
            return Ok(equal);
        }
        match (a, b) {
            (Value::Instance(_), _) | (_, Value::Instance(_)) => {
                for (obj, other) in [(a, b), (b, a)] {
                    if let Some(result) = self.call_dunder(obj, "__eq__", vec![other.clone()])? {
                        return self.truthy(&result);
                    }
                }
                Ok(a.is(b))
            }
            (Value::List(x), Value::List(y)) => {
                let (x, y) = (x.borrow().clone(), y.borrow().clone());
                self.seq_eq(&x, &y)
            }
            (Value::Tuple(x), Value::Tuple(y)) => self.seq_eq(x, y),
            (Value::Dict(x), Value::Dict(y)) => {
                let (x, y) = (x.borrow().clone(), y.borrow().clone());
                if x.len() != y.len() {
                    return Ok(false);
                }
                for (key, (_, value)) in x.entries() {
                    match y.get(key) {
                        Some(other) if self.eq(value, &other)? => {}
                        _ => return Ok(false),
                    }
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn seq_eq(&self, a: &[Value], b: &[Value]) -> RunResult<bool> {
        if a.len() != b.len() {
            return Ok(false);
        }
        for (x, y) in a.iter().zip(b) {
            if !self.eq(x, y)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// `item in container`.
    pub fn contains(&self, container: &Value, item: &Value) -> RunResult<bool> {
        match container {
            Value::Str(s) => match item {
                Value::Str(sub) => Ok(s.contains(sub.as_ref())),
                other => Err(ExcType::TypeError.msg(format!(
                    "'in <string>' requires string as left operand, not {}",
                    other.type_name()
                ))),
            },
            Value::List(list) => {
                let items = list.borrow().clone();
                self.any_eq(&items, item)
            }
            Value::Tuple(items) => self.any_eq(items, item),
            Value::Dict(dict) => Ok(dict.borrow().contains_key(&item.hash_key()?)),
            Value::Set(set) => Ok(set.borrow().contains_key(&item.hash_key()?)),
            Value::Range(r) => Ok(match item {
                Value::Int(_) | Value::Bool(_) => item.as_int().is_some_and(|n| r.contains(n)),
                Value::Float(f) => f.fract() == 0.0 && r.contains(*f as i64),
                _ => false,
            }),
            Value::Instance(_) => {
                if let Some(result) = self.call_dunder(container, "__contains__", vec![item.clone()])? {
                    return self.truthy(&result);
                }
                let items = self.to_vec(container)?;
                self.any_eq(&items, item)
            }
            Value::Iterator(_) | Value::Generator(_) => {
                while let Some(value) = self.iter_next(container)? {
                    if self.eq(&value, item)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            other => Err(ExcType::TypeError.msg(format!(
                "argument of type '{}' is not iterable",
                other.type_name()
            ))),
        }
    }

    fn any_eq(&self, items: &[Value], item: &Value) -> RunResult<bool> {
        for value in items {
            if self.eq(value, item)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Truthiness, calling `__bool__` or `__len__` on instances.
    pub fn truthy(&self, value: &Value) -> RunResult<bool> {
        if let Some(truthy) = value.truthy_plain() {
            return Ok(truthy);
        }
        if let Some(result) = self.call_dunder(value, "__bool__", Vec::new())? {
            return match result {
                Value::Bool(b) => Ok(b),
                other => Err(ExcType::TypeError.msg(format!(
                    "__bool__ should return bool, returned {}",
                    other.type_name()
                ))),
            };
        }
        if let Some(len) = self.call_dunder(value, "__len__", Vec::new())? {
            return Ok(self.index(&len)? != 0);
        }
        Ok(true)
    }

    /// `repr(value)`, calling `__repr__` on instances and guarding against cycles.
    pub fn repr(&self, value: &Value) -> RunResult<String> {
        if let Some(method) = self.lookup_user_special(value, "__repr__") {
            return match self.call(&method, Args::empty())? {
                Value::Str(s) => Ok(s.to_string()),
                other => Err(ExcType::TypeError.msg(format!(
                    "__repr__ returned non-string (type {})",
                    other.type_name()
                ))),
            };
        }
        let id = value.identity();
        if matches!(value, Value::List(_) | Value::Dict(_) | Value::Set(_)) {
            if !self.repr_enter(id) {
                return Ok(if matches!(value, Value::Dict(_)) { "{...}" } else { "[...]" }.to_owned());
            }
            let result = value.repr_container(&mut |v| self.repr(v)).unwrap_or_else(|| Ok(value.repr_leaf()));
            self.repr_leave();
            return result;
        }
        if let Some(result) = value.repr_container(&mut |v| self.repr(v)) {
            return result;
        }
        Ok(value.repr_leaf())
    }

    /// `str(value)`, calling `__str__` (or `__repr__`) on instances.
    pub fn str(&self, value: &Value) -> RunResult<String> {
        match value {
            Value::Str(s) => Ok(s.to_string()),
            Value::Instance(_) | Value::Exception(_) => {
                if let Some(method) = self.lookup_user_special(value, "__str__") {
                    return match self.call(&method, Args::empty())? {
                        Value::Str(s) => Ok(s.to_string()),
                        other => Err(ExcType::TypeError.msg(format!(
                            "__str__ returned non-string (type {})",
                            other.type_name()
                        ))),
                    };
                }
                match value {
                    Value::Exception(e) => Ok(e.message()),
                    _ => self.repr(value),
                }
            }
            _ => self.repr(value),
        }
    }

    /// An integer index, accepting bools and objects with `__index__`.
    pub fn index(&self, value: &Value) -> RunResult<i64> {
        if let Some(i) = value.as_int() {
            return Ok(i);
        }
        if let Value::BigInt(_) = value {
            return Err(ExcType::IndexError.msg("cannot fit 'int' into an index-sized integer"));
        }
        if let Some(result) = self.call_dunder(value, "__index__", Vec::new())? {
            return self.index(&result);
        }
        Err(ExcType::TypeError.msg(format!(
            "'{}' object cannot be interpreted as an integer",
            value.type_name()
        )))
    }

    /// `obj[index]`.
    pub fn getitem(&self, obj: &Value, index: &Value) -> RunResult<Value> {
        match obj {
            Value::List(list) => {
                let items = list.borrow();
                self.sequence_item(&items, index, "list")
            }
            Value::Tuple(items) => self.sequence_item(items, index, "tuple").map(|v| match (v, index) {
                (Value::List(l), Value::Slice(_)) => Value::tuple(l.borrow().clone()),
                (v, _) => v,
            }),
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                match index {
                    Value::Slice(slice) => {
                        let (start, stop, step) = slice_indices(self, slice, chars.len())?;
                        Ok(Value::str(
                            slice_positions(start, stop, step)
                                .filter_map(|i| chars.get(i))
                                .collect::<String>(),
                        ))
                    }
                    other => {
                        let i = self.index(other).map_err(|_| {
                            ExcType::TypeError.msg(format!("string indices must be integers, not '{}'", other.type_name()))
                        })?;
                        normalize_index(i, chars.len())
                            .map(|i| Value::str(chars[i].to_string()))
                            .ok_or_else(|| ExcType::IndexError.msg("string index out of range"))
                    }
                }
            }
            Value::Range(r) => match index {
                Value::Slice(slice) => {
                    let (start, stop, step) = slice_indices(self, slice, r.len())?;
                    Ok(Value::Range(PyRange {
                        start: r.start + start * r.step,
                        stop: r.start + stop * r.step,
                        step: r.step * step,
                    }))
                }
                other => {
                    let i = self.index(other)?;
                    normalize_index(i, r.len())
                        .and_then(|i| r.get(i))
                        .map(Value::Int)
                        .ok_or_else(|| ExcType::IndexError.msg("range object index out of range"))
                }
            },
            Value::Dict(dict) => {
                let found = dict.borrow().get(&index.hash_key()?);
                found.ok_or_else(|| Exception::new(ExcType::KeyError, vec![index.clone()]))
            }
            Value::Type(_) | Value::Class(_) => Ok(obj.clone()),
            _ => {
                if let Some(result) = self.call_dunder(obj, "__getitem__", vec![index.clone()])? {
                    return Ok(result);
                }
                Err(ExcType::TypeError.msg(format!("'{}' object is not subscriptable", obj.type_name())))
            }
        }
    }

    fn sequence_item(&self, items: &[Value], index: &Value, kind: &str) -> RunResult<Value> {
        match index {
            Value::Slice(slice) => {
                let (start, stop, step) = slice_indices(self, slice, items.len())?;
                Ok(Value::list(
                    slice_positions(start, stop, step)
                        .filter_map(|i| items.get(i).cloned())
                        .collect(),
                ))
            }
            other => {
                let i = match other {
                    Value::Int(_) | Value::Bool(_) | Value::BigInt(_) | Value::Instance(_) => self.index(other)?,
                    _ => {
                        return Err(ExcType::TypeError.msg(format!(
                            "{kind} indices must be integers or slices, not {}",
                            other.type_name()
                        )));
                    }
                };
                normalize_index(i, items.len())
                    .map(|i| items[i].clone())
                    .ok_or_else(|| ExcType::IndexError.msg(format!("{kind} index out of range")))
            }
        }
    }

    /// `obj[index] = value`.
    pub fn setitem(&self, obj: &Value, index: Value, value: Value) -> RunResult<()> {
        match obj {
            Value::List(list) => {
                if let Value::Slice(slice) = &index {
                    let replacement = self.to_vec(&value)?;
                    let len = list.borrow().len();
                    let (start, stop, step) = slice_indices(self, slice, len)?;
                    if step == 1 {
                        let start = start.max(0) as usize;
                        let stop = (stop.max(start as i64) as usize).max(start);
                        let removed: Vec<Value> = list.borrow_mut().splice(start..stop, replacement).collect();
                        drop(removed);
                        return Ok(());
                    }
                    let positions: Vec<usize> = slice_positions(start, stop, step).collect();
                    if positions.len() != replacement.len() {
                        return Err(ExcType::ValueError.msg(format!(
                            "attempt to assign sequence of size {} to extended slice of size {}",
                            replacement.len(),
                            positions.len()
                        )));
                    }
                    let mut old = Vec::with_capacity(positions.len());
                    {
                        let mut items = list.borrow_mut();
                        for (i, v) in positions.into_iter().zip(replacement) {
                            old.push(std::mem::replace(&mut items[i], v));
                        }
                    }
                    drop(old);
                    return Ok(());
                }
                let i = self.index(&index)?;
                let len = list.borrow().len();
                let Some(i) = normalize_index(i, len) else {
                    return Err(ExcType::IndexError.msg("list assignment index out of range"));
                };
                let old = std::mem::replace(&mut list.borrow_mut()[i], value);
                drop(old);
                Ok(())
            }
            Value::Dict(dict) => {
                let key = index.hash_key()?;
                let old = dict.borrow_mut().set_hashed(key, index, value);
                drop(old);
                Ok(())
            }
            _ => {
                if self.lookup_user_special(obj, "__setitem__").is_some() {
                    self.call_dunder(obj, "__setitem__", vec![index, value])?;
                    return Ok(());
                }
                Err(ExcType::TypeError.msg(format!(
                    "'{}' object does not support item assignment",
                    obj.type_name()
                )))
            }
        }
    }

    /// `del obj[index]`.
    pub fn delitem(&self, obj: &Value, index: &Value) -> RunResult<()> {
        match obj {
            Value::List(list) => {
                let len = list.borrow().len();
                if let Value::Slice(slice) = index {
                    let (start, stop, step) = slice_indices(self, slice, len)?;
                    let mut positions: Vec<usize> = slice_positions(start, stop, step).collect();
                    positions.sort_unstable();
                    let mut removed = Vec::with_capacity(positions.len());
                    {
                        let mut items = list.borrow_mut();
                        for i in positions.into_iter().rev() {
                            removed.push(items.remove(i));
                        }
                    }
                    drop(removed);
                    return Ok(());
                }
                let i = self.index(index)?;
                let Some(i) = normalize_index(i, len) else {
                    return Err(ExcType::IndexError.msg("list assignment index out of range"));
                };
                let old = list.borrow_mut().remove(i);
                drop(old);
                Ok(())
            }
            Value::Dict(dict) => {
                let removed = dict.borrow_mut().remove(&index.hash_key()?);
                match removed {
                    Some(entry) => {
                        drop(entry);
                        Ok(())
                    }
                    None => Err(Exception::new(ExcType::KeyError, vec![index.clone()])),
                }
            }
            _ => {
                if self.lookup_user_special(obj, "__delitem__").is_some() {
                    self.call_dunder(obj, "__delitem__", vec![index.clone()])?;
                    return Ok(());
                }
                Err(ExcType::TypeError.msg(format!(
                    "'{}' object doesn't support item deletion",
                    obj.type_name()
                )))
            }
        }
    }

    /// `len(value)`.
    pub fn len(&self, value: &Value) -> RunResult<usize> {
        Ok(match value {
            Value::Str(s) => s.chars().count(),
            Value::List(l) => l.borrow().len(),
            Value::Tuple(t) => t.len(),
            Value::Dict(d) => d.borrow().len(),
            Value::Set(s) => s.borrow().len(),
            Value::Range(r) => r.len(),
            _ => {
                if let Some(len) = self.call_dunder(value, "__len__", Vec::new())? {
                    let n = self.index(&len)?;
                    return usize::try_from(n).map_err(|_| ExcType::ValueError.msg("__len__() should return >= 0"));
                }
                return Err(ExcType::TypeError.msg(format!(
                    "object of type '{}' has no len()",
                    value.type_name()
                )));
            }
        })
    }

    /// `iter(value)`.
    pub fn iter(&self, value: &Value) -> RunResult<Value> {
        let it = match value {
            Value::List(list) => PyIter::List {
                list: list.clone(),
                index: 0,
            },
            Value::Tuple(items) => PyIter::items(items.to_vec(), "tuple_iterator"),
            Value::Str(s) => PyIter::Str {
                chars: s.chars().collect(),
                index: 0,
            },
            Value::Range(range) => PyIter::Range { range: *range, index: 0 },
            Value::Dict(dict) => PyIter::items(dict.borrow().keys(), "dict_keyiterator"),
            Value::Set(set) => PyIter::items(set.borrow().values().cloned().collect(), "set_iterator"),
            Value::Iterator(_) | Value::Generator(_) => return Ok(value.clone()),
            _ => {
                if let Some(result) = self.call_dunder(value, "__iter__", Vec::new())? {
                    return Ok(result);
                }
                return Err(ExcType::TypeError.msg(format!("'{}' object is not iterable", value.type_name())));
            }
        };
        Ok(Value::Iterator(Rc::new(std::cell::RefCell::new(it))))
    }

    /// `next(iterator)`, with exhaustion reported as `None`.
    pub fn iter_next(&self, iterator: &Value) -> RunResult<Option<Value>> {
        match iterator {
            Value::Iterator(it) => {
                let step = it.borrow_mut().step();
                match step {
                    IterStep::Done => Ok(None),
                    IterStep::Item(v) => Ok(Some(v)),
                    IterStep::Enumerate { inner, count } => {
                        Ok(self.iter_next(&inner)?.map(|v| Value::tuple(vec![Value::Int(count), v])))
                    }
                    IterStep::Zip(inners) => {
                        if inners.is_empty() {
                            return Ok(None);
                        }
                        let mut items = Vec::with_capacity(inners.len());
                        for inner in &inners {
                            match self.iter_next(inner)? {
                                Some(v) => items.push(v),
                                None => return Ok(None),
                            }
                        }
                        Ok(Some(Value::tuple(items)))
                    }
                    IterStep::Map { func, inners } => {
                        let mut args = Vec::with_capacity(inners.len());
                        for inner in &inners {
                            match self.iter_next(inner)? {
                                Some(v) => args.push(v),
                                None => return Ok(None),
                            }
                        }
                        self.call(&func, Args::positional(args)).map(Some)
                    }
                    IterStep::Filter { func, inner } => {
                        while let Some(item) = self.iter_next(&inner)? {
                            let keep = if func.is_none() {
                                self.truthy(&item)?
                            } else {
                                let verdict = self.call(&func, Args::one(item.clone()))?;
                                self.truthy(&verdict)?
                            };
                            if keep {
                                return Ok(Some(item));
                            }
                        }
                        Ok(None)
                    }
                }
            }
            Value::Generator(g) => g.next(),
            _ => {
                if self.lookup_user_special(iterator, "__next__").is_none() {
                    return Err(ExcType::TypeError.msg(format!(
                        "'{}' object is not an iterator",
                        iterator.type_name()
                    )));
                }
                match self.call_dunder(iterator, "__next__", Vec::new()) {
                    Ok(v) => Ok(v),
                    Err(exc) if exc.is_instance(ExcType::StopIteration) => Ok(None),
                    Err(exc) => Err(exc),
                }
            }
        }
    }

    /// Collects any iterable into a vector.
    pub fn to_vec(&self, value: &Value) -> RunResult<Vec<Value>> {
        match value {
            Value::List(l) => Ok(l.borrow().clone()),
            Value::Tuple(t) => Ok(t.to_vec()),
            _ => {
                let it = self.iter(value)?;
                let mut items = Vec::new();
                while let Some(item) = self.iter_next(&it)? {
                    items.push(item);
                }
                Ok(items)
            }
        }
    }

    /// The async iterator for `async for`.
    pub fn aiter(&self, value: &Value) -> RunResult<Value> {
        if let Value::AsyncGenerator(_) = value {
            return Ok(value.clone());
        }
        if let Some(result) = self.call_dunder(value, "__aiter__", Vec::new())? {
            return Ok(result);
        }
        Err(ExcType::TypeError.msg(format!(
            "'async for' requires an object with __aiter__ method, got {}",
            value.type_name()
        )))
    }

    /// The awaitable producing the next item of an async iterator.
    pub fn anext(&self, iterator: &Value) -> RunResult<Value> {
        if let Value::AsyncGenerator(agen) = iterator {
            return Ok(Value::Coroutine(agen.anext()?));
        }
        if let Some(result) = self.call_dunder(iterator, "__anext__", Vec::new())? {
            return Ok(result);
        }
        Err(ExcType::TypeError.msg(format!(
            "'async for' received an object from __aiter__ that does not implement __anext__: {}",
            iterator.type_name()
        )))
    }

    /// Builds a set, keeping the first of equal items.
    pub fn new_set(&self, items: Vec<Value>) -> RunResult<Value> {
        let mut set = indexmap::IndexMap::with_capacity(items.len());
        for item in items {
            set.entry(item.hash_key()?).or_insert(item);
        }
        Ok(Value::Set(Rc::new(std::cell::RefCell::new(set))))
    }

    /// `(key, value)` pairs of a mapping: a dict, or anything with `keys()` and `__getitem__`.
    pub fn mapping_items(&self, mapping: &Value) -> RunResult<Vec<(Value, Value)>> {
        if let Value::Dict(d) = mapping {
            return Ok(d.borrow().items());
        }
        if !self.hasattr(mapping, "keys")? {
            return Err(ExcType::TypeError.msg(format!("'{}' object is not a mapping", mapping.type_name())));
        }
        let keys = self.call_method(mapping, "keys", Args::empty())?;
        let mut items = Vec::new();
        for key in self.to_vec(&keys)? {
            let value = self.getitem(mapping, &key)?;
            items.push((key, value));
        }
        Ok(items)
    }

    /// Stable sort by `key`, using only `<` like Python.
    pub fn sort_values(&self, items: &mut Vec<Value>, key: Option<&Value>, reverse: bool) -> RunResult<()> {
        let keys: Vec<Value> = match key {
            Some(func) if !func.is_none() => items
                .iter()
                .map(|v| self.call(func, Args::one(v.clone())))
                .collect::<RunResult<_>>()?,
            _ => items.clone(),
        };
        let mut order: Vec<usize> = (0..items.len()).collect();
        let mut error = None;
        order.sort_by(|&a, &b| {
            if error.is_some() {
                return Ordering::Equal;
            }
            let (x, y) = if reverse { (b, a) } else { (a, b) };
            let less = self.lt(&keys[x], &keys[y]).and_then(|less| {
                if less {
                    Ok(Ordering::Less)
                } else {
                    self.lt(&keys[y], &keys[x])
                        .map(|greater| if greater { Ordering::Greater } else { Ordering::Equal })
                }
            });
            less.unwrap_or_else(|exc| {
                error = Some(exc);
                Ordering::Equal
            })
        });
        if let Some(exc) = error {
            return Err(exc);
        }
        let mut slots: Vec<Option<Value>> = std::mem::take(items).into_iter().map(Some).collect();
        *items = order.into_iter().filter_map(|i| slots[i].take()).collect();
        Ok(())
    }

    /// `hash(value)`.
    pub fn hash(&self, value: &Value) -> RunResult<HashKey> {
        value.hash_key()
    }
}

fn set_op(a: &SetRef, op: Operator, b: &SetRef) -> indexmap::IndexMap<HashKey, Value> {
    let (a, b) = (a.borrow(), b.borrow());
    match op {
        Operator::BitOr => {
            let mut out = a.clone();
            for (k, v) in b.iter() {
                out.entry(k.clone()).or_insert_with(|| v.clone());
            }
            out
        }
        Operator::BitAnd => a.iter().filter(|(k, _)| b.contains_key(*k)).map(|(k, v)| (k.clone(), v.clone())).collect(),
        Operator::Sub => a.iter().filter(|(k, _)| !b.contains_key(*k)).map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => a
            .iter()
            .filter(|(k, _)| !b.contains_key(*k))
            .chain(b.iter().filter(|(k, _)| !a.contains_key(*k)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_ops_promote_on_overflow() {
        let v = int_op(i64::MAX, Operator::Add, 1).ok();
        assert_eq!(v.map(|v| v.repr_plain()), Some("9223372036854775808".to_owned()));
        let v = int_op(-7, Operator::FloorDiv, 2).ok();
        assert_eq!(v.and_then(|v| v.as_int()), Some(-4));
        let v = int_op(-7, Operator::Mod, 2).ok();
        assert_eq!(v.and_then(|v| v.as_int()), Some(1));
    }

    #[test]
    fn float_mod_follows_divisor_sign() {
        assert!((float_mod(-7.0, 2.0) - 1.0).abs() < 1e-12);
        assert!((float_mod(7.0, -2.0) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn slice_walk() {
        let positions: Vec<usize> = slice_positions(4, -1, -2).collect();
        assert_eq!(positions, vec![4, 2, 0]);
    }
}
