//! Numeric builtins: `abs`, `bin`/`hex`/`oct`, `pow`, `round` and `sum`.

use num_bigint::BigInt;
use num_traits::{FromPrimitive, Signed, ToPrimitive, Zero};

use super::BuiltinFn;
use crate::{
    args::Args,
    exception::{ExcType, RunResult},
    expressions::{Operator, UnaryOperator},
    runtime::Runtime,
    value::Value,
};

pub(super) fn abs(rt: &Runtime, value: Value) -> RunResult<Value> {
    match &value {
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::Int(i) => Ok(i.checked_abs().map_or_else(|| Value::from(BigInt::from(*i).abs()), Value::Int)),
        Value::BigInt(b) => Ok(Value::from(b.abs())),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        _ => match rt.lookup_special(&value, "__abs__") {
            Some(method) => rt.call(&method, Args::empty()),
            None => Err(ExcType::TypeError.msg(format!(
                "bad operand type for abs(): '{}'",
                value.type_name()
            ))),
        },
    }
}

/// `bin()`, `hex()` and `oct()`.
pub(super) fn radix(rt: &Runtime, func: BuiltinFn, value: Value) -> RunResult<Value> {
    let n = match value.as_bigint() {
        Some(n) if !matches!(value, Value::Float(_)) => n,
        _ => BigInt::from(rt.index(&value)?),
    };
    let magnitude = n.abs();
    let digits = match func {
        BuiltinFn::Bin => format!("0b{magnitude:b}"),
        BuiltinFn::Oct => format!("0o{magnitude:o}"),
        _ => format!("0x{magnitude:x}"),
    };
    Ok(Value::str(if n.is_negative() { format!("-{digits}") } else { digits }))
}

/// `pow(base, exp[, mod])`.
pub(super) fn pow(rt: &Runtime, args: Args) -> RunResult<Value> {
    let mut args = args;
    let modulus = args.take_keyword("mod");
    let values = args.get_range("pow", 2, 3)?;
    let modulus = values.get(2).cloned().or(modulus).filter(|m| !m.is_none());
    let Some(modulus) = modulus else {
        return rt.binary_op(&values[0], Operator::Pow, &values[1]);
    };
    let (Some(base), Some(exp), Some(m)) = (
        int_operand(&values[0]),
        int_operand(&values[1]),
        int_operand(&modulus),
    ) else {
        return Err(ExcType::TypeError.msg(
            "pow() 3rd argument not allowed unless all arguments are integers",
        ));
    };
    if m.is_zero() {
        return Err(ExcType::ValueError.msg("pow() 3rd argument cannot be 0"));
    }
    if exp.is_negative() {
        return Err(ExcType::ValueError.msg("base is not invertible for the given modulus"));
    }
    let mut result = base.modpow(&exp, &m.abs());
    if m.is_negative() && !result.is_zero() {
        result += &m;
    }
    Ok(Value::from(result))
}

fn int_operand(value: &Value) -> Option<BigInt> {
    match value {
        Value::Bool(_) | Value::Int(_) | Value::BigInt(_) => value.as_bigint(),
        _ => None,
    }
}

/// `round(number[, ndigits])`.
pub(super) fn round(rt: &Runtime, args: Args) -> RunResult<Value> {
    let mut args = args;
    let ndigits_kw = args.take_keyword("ndigits");
    let (number, ndigits) = args.get_one_two_args("round")?;
    let ndigits = ndigits.or(ndigits_kw).filter(|n| !n.is_none());
    let digits = ndigits.as_ref().map(|n| rt.index(n)).transpose()?;
    match (&number, digits) {
        (Value::Bool(_) | Value::Int(_) | Value::BigInt(_), None) => rt.unary_op(UnaryOperator::Pos, &number),
        (Value::Int(i), Some(d)) => Ok(Value::Int(round_int(*i, d))),
        (Value::Bool(_) | Value::BigInt(_), Some(_)) => rt.unary_op(UnaryOperator::Pos, &number),
        (Value::Float(f), None) => {
            if f.is_nan() {
                return Err(ExcType::ValueError.msg("cannot convert float NaN to integer"));
            }
            if f.is_infinite() {
                return Err(ExcType::OverflowError.msg("cannot convert float infinity to integer"));
            }
            let rounded = f.round_ties_even();
            Ok(match rounded.to_i64() {
                Some(i) => Value::Int(i),
                None => BigInt::from_f64(rounded).map_or(Value::Float(rounded), Value::from),
            })
        }
        (Value::Float(f), Some(d)) => {
            let Ok(exp) = i32::try_from(d) else {
                return Ok(Value::Float(if d > 0 { *f } else { 0.0 }));
            };
            let scale = 10f64.powi(exp);
            if !scale.is_finite() || scale == 0.0 {
                return Ok(Value::Float(if exp > 0 { *f } else { 0.0 }));
            }
            Ok(Value::Float((f * scale).round_ties_even() / scale))
        }
        _ => match rt.lookup_special(&number, "__round__") {
            Some(method) => rt.call(&method, Args::positional(ndigits.into_iter().collect())),
            None => Err(ExcType::TypeError.msg(format!(
                "type {} doesn't define __round__ method",
                number.type_name()
            ))),
        },
    }
}

/// Rounds an int to `10**-digits`, half to even.
fn round_int(n: i64, digits: i64) -> i64 {
    if digits >= 0 {
        return n;
    }
    let Some(scale) = u32::try_from(-digits).ok().and_then(|e| 10i64.checked_pow(e)) else {
        return 0;
    };
    let quotient = n.div_euclid(scale);
    let remainder = n.rem_euclid(scale);
    let twice = remainder * 2;
    let rounded = if twice > scale || (twice == scale && quotient % 2 != 0) {
        quotient + 1
    } else {
        quotient
    };
    rounded.saturating_mul(scale)
}

/// `sum(iterable, /, start=0)`.
pub(super) fn sum(rt: &Runtime, args: Args) -> RunResult<Value> {
    let mut args = args;
    let start_kw = args.take_keyword("start");
    let (iterable, start) = args.get_one_two_args("sum")?;
    let mut total = start.or(start_kw).unwrap_or(Value::Int(0));
    if matches!(total, Value::Str(_)) {
        return Err(ExcType::TypeError.msg("sum() can't sum strings [use ''.join(seq) instead]"));
    }
    let it = rt.iter(&iterable)?;
    while let Some(item) = rt.iter_next(&it)? {
        total = rt.binary_op(&total, Operator::Add, &item)?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::round_int;

    #[test]
    fn round_int_half_even() {
        assert_eq!(round_int(25, -1), 20);
        assert_eq!(round_int(35, -1), 40);
        assert_eq!(round_int(-25, -1), -20);
        assert_eq!(round_int(1234, -2), 1200);
        assert_eq!(round_int(7, 2), 7);
    }
}
