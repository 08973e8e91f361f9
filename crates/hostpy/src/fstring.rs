//! String formatting: the format-spec mini-language used by f-strings and `format()`,
//! printf-style `%` formatting, and `ascii()` escaping.

use std::fmt::Write as _;

use num_bigint::BigInt;
use num_traits::Signed;

use crate::{
    args::Args,
    exception::{ExcType, RunResult},
    runtime::Runtime,
    value::{Value, float_repr},
};

/// A parsed `[[fill]align][sign][z][#][0][width][grouping][.precision][type]` spec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct FormatSpec {
    fill: Option<char>,
    align: Option<char>,
    sign: Option<char>,
    alternate: bool,
    zero: bool,
    width: usize,
    grouping: Option<char>,
    precision: Option<usize>,
    kind: Option<char>,
}

fn parse_spec(spec: &str) -> RunResult<FormatSpec> {
    let invalid = || ExcType::ValueError.msg("Invalid format specifier");
    let chars: Vec<char> = spec.chars().collect();
    let mut out = FormatSpec::default();
    let mut i = 0;
    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');
    if chars.len() >= 2 && is_align(chars[1]) {
        out.fill = Some(chars[0]);
        out.align = Some(chars[1]);
        i = 2;
    } else if chars.first().is_some_and(|&c| is_align(c)) {
        out.align = Some(chars[0]);
        i = 1;
    }
    if let Some(&c @ ('+' | '-' | ' ')) = chars.get(i) {
        out.sign = Some(c);
        i += 1;
    }
    if chars.get(i) == Some(&'z') {
        i += 1;
    }
    if chars.get(i) == Some(&'#') {
        out.alternate = true;
        i += 1;
    }
    if chars.get(i) == Some(&'0') {
        out.zero = true;
        i += 1;
    }
    let start = i;
    while chars.get(i).is_some_and(char::is_ascii_digit) {
        i += 1;
    }
    if i > start {
        out.width = chars[start..i].iter().collect::<String>().parse().map_err(|_| invalid())?;
    }
    if let Some(&c @ (',' | '_')) = chars.get(i) {
        out.grouping = Some(c);
        i += 1;
    }
    if chars.get(i) == Some(&'.') {
        i += 1;
        let start = i;
        while chars.get(i).is_some_and(char::is_ascii_digit) {
            i += 1;
        }
        if i == start {
            return Err(ExcType::ValueError.msg("Format specifier missing precision"));
        }
        out.precision = Some(chars[start..i].iter().collect::<String>().parse().map_err(|_| invalid())?);
    }
    if let Some(&c) = chars.get(i) {
        out.kind = Some(c);
        i += 1;
    }
    if i != chars.len() {
        return Err(invalid());
    }
    Ok(out)
}

/// `format(value, spec)`.
pub(crate) fn format_value(rt: &Runtime, value: &Value, spec: &str) -> RunResult<String> {
    if let Value::Instance(_) = value
        && let Some(method) = rt.lookup_special(value, "__format__")
    {
        return match rt.call(&method, Args::one(Value::str(spec)))? {
            Value::Str(s) => Ok(s.to_string()),
            other => Err(ExcType::TypeError.msg(format!(
                "__format__ must return a str, not {}",
                other.type_name()
            ))),
        };
    }
    if spec.is_empty() {
        return rt.str(value);
    }
    let parsed = parse_spec(spec)?;
    match value {
        Value::Str(s) => format_str(s, &parsed),
        Value::Bool(_) | Value::Int(_) | Value::BigInt(_) => match parsed.kind {
            Some('e' | 'E' | 'f' | 'F' | 'g' | 'G' | '%') => {
                let f = value
                    .as_float()
                    .ok_or_else(|| ExcType::OverflowError.msg("int too large to convert to float"))?;
                format_float(f, &parsed)
            }
            _ => format_int(&value.as_bigint().unwrap_or_default(), &parsed),
        },
        Value::Float(f) => format_float(*f, &parsed),
        _ => {
            if parsed == FormatSpec::default() {
                return rt.str(value);
            }
            Err(ExcType::TypeError.msg(format!(
                "unsupported format string passed to {}.__format__",
                value.type_name()
            )))
        }
    }
}

fn format_str(s: &str, spec: &FormatSpec) -> RunResult<String> {
    if !matches!(spec.kind, None | Some('s')) {
        return Err(ExcType::ValueError.msg(format!(
            "Unknown format code '{}' for object of type 'str'",
            spec.kind.unwrap_or('s')
        )));
    }
    if spec.sign.is_some() {
        return Err(ExcType::ValueError.msg("Sign not allowed in string format specifier"));
    }
    let text: String = match spec.precision {
        Some(p) => s.chars().take(p).collect(),
        None => s.to_owned(),
    };
    Ok(pad("", &text, spec, '<'))
}

fn format_int(n: &BigInt, spec: &FormatSpec) -> RunResult<String> {
    if spec.precision.is_some() {
        return Err(ExcType::ValueError.msg("Precision not allowed in integer format specifier"));
    }
    let magnitude = n.abs();
    let (prefix, digits) = match spec.kind {
        None | Some('d' | 'n') => ("", magnitude.to_string()),
        Some('b') => ("0b", format!("{magnitude:b}")),
        Some('o') => ("0o", format!("{magnitude:o}")),
        Some('x') => ("0x", format!("{magnitude:x}")),
        Some('X') => ("0X", format!("{magnitude:X}")),
        Some('c') => {
            let c = u32::try_from(n)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| ExcType::OverflowError.msg("%c arg not in range(0x110000)"))?;
            return Ok(pad("", &c.to_string(), spec, '<'));
        }
        Some(other) => {
            return Err(ExcType::ValueError.msg(format!(
                "Unknown format code '{other}' for object of type 'int'"
            )));
        }
    };
    let group_size = if matches!(spec.kind, Some('b' | 'o' | 'x' | 'X')) { 4 } else { 3 };
    let digits = match spec.grouping {
        Some(sep) => group(&digits, sep, group_size),
        None => digits,
    };
    let sign = sign_str(n.is_negative(), spec.sign);
    let prefix = if spec.alternate { prefix } else { "" };
    Ok(pad(&format!("{sign}{prefix}"), &digits, spec, '>'))
}

fn format_float(f: f64, spec: &FormatSpec) -> RunResult<String> {
    let upper = matches!(spec.kind, Some('E' | 'F' | 'G'));
    let body = if f.is_nan() {
        "nan".to_owned()
    } else if f.is_infinite() {
        "inf".to_owned()
    } else {
        let x = f.abs();
        match spec.kind {
            Some('f' | 'F') => format!("{x:.*}", spec.precision.unwrap_or(6)),
            Some('e' | 'E') => exp_format(x, spec.precision.unwrap_or(6)),
            Some('%') => format!("{:.*}%", spec.precision.unwrap_or(6), x * 100.0),
            Some('g' | 'G' | 'n') => general_format(x, spec.precision.unwrap_or(6), spec.alternate),
            None => match spec.precision {
                Some(p) => general_format(x, p, spec.alternate),
                None => float_repr(x),
            },
            Some(other) => {
                return Err(ExcType::ValueError.msg(format!(
                    "Unknown format code '{other}' for object of type 'float'"
                )));
            }
        }
    };
    let body = if upper { body.to_uppercase() } else { body };
    let body = match spec.grouping {
        Some(sep) => {
            let (int_part, rest) = body.find(['.', 'e', 'E', '%']).map_or((body.as_str(), ""), |i| body.split_at(i));
            if int_part.chars().all(|c| c.is_ascii_digit()) {
                format!("{}{rest}", group(int_part, sep, 3))
            } else {
                body.clone()
            }
        }
        None => body,
    };
    let sign = sign_str(f.is_sign_negative() && !f.is_nan(), spec.sign);
    Ok(pad(sign, &body, spec, '>'))
}

/// `{:e}` in Python's layout: two-digit signed exponent.
fn exp_format(x: f64, precision: usize) -> String {
    let raw = format!("{x:.precision$e}");
    let (mantissa, exponent) = raw.split_once('e').unwrap_or((&raw, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let sign = if exponent < 0 { '-' } else { '+' };
    format!("{mantissa}e{sign}{:02}", exponent.abs())
}

/// The `g` presentation type.
fn general_format(x: f64, precision: usize, alternate: bool) -> String {
    let p = precision.max(1);
    if x == 0.0 {
        return if alternate { format!("{:.*}", p - 1, 0.0) } else { "0".to_owned() };
    }
    let raw = format!("{x:.prec$e}", prec = p - 1);
    let exponent: i64 = raw.split_once('e').and_then(|(_, e)| e.parse().ok()).unwrap_or(0);
    let text = if -4 <= exponent && exponent < p as i64 {
        let decimals = usize::try_from(p as i64 - 1 - exponent).unwrap_or(0);
        format!("{x:.decimals$}")
    } else {
        exp_format(x, p - 1)
    };
    if alternate {
        return text;
    }
    match text.split_once('e') {
        Some((mantissa, exp)) => format!("{}e{exp}", strip_zeros(mantissa)),
        None => strip_zeros(&text).to_owned(),
    }
}

fn strip_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

fn sign_str(negative: bool, sign: Option<char>) -> &'static str {
    match (negative, sign) {
        (true, _) => "-",
        (false, Some('+')) => "+",
        (false, Some(' ')) => " ",
        _ => "",
    }
}

fn group(digits: &str, sep: char, size: usize) -> String {
    let len = digits.chars().count();
    let mut out = String::with_capacity(len + len / size);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (len - i) % size == 0 {
            out.push(sep);
        }
        out.push(c);
    }
    out
}

/// Pads `prefix + body` to the spec's width.
fn pad(prefix: &str, body: &str, spec: &FormatSpec, default_align: char) -> String {
    let (fill, align) = match (spec.fill, spec.align, spec.zero) {
        (fill, Some(align), _) => (fill.unwrap_or(' '), align),
        (_, None, true) => ('0', '='),
        _ => (' ', default_align),
    };
    let len = prefix.chars().count() + body.chars().count();
    let padding = spec.width.saturating_sub(len);
    let fill_str = |n: usize| std::iter::repeat_n(fill, n).collect::<String>();
    match align {
        '<' => format!("{prefix}{body}{}", fill_str(padding)),
        '^' => format!("{}{prefix}{body}{}", fill_str(padding / 2), fill_str(padding - padding / 2)),
        '=' => format!("{prefix}{}{body}", fill_str(padding)),
        _ => format!("{}{prefix}{body}", fill_str(padding)),
    }
}

/// Escapes non-ASCII characters the way `ascii()` does.
#[must_use]
pub fn ascii_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        let code = u32::from(c);
        if c.is_ascii() {
            out.push(c);
        } else if code <= 0xff {
            let _ = write!(out, "\\x{code:02x}");
        } else if code <= 0xffff {
            let _ = write!(out, "\\u{code:04x}");
        } else {
            let _ = write!(out, "\\U{code:08x}");
        }
    }
    out
}

/// printf-style `fmt % args`.
pub(crate) fn percent_format(rt: &Runtime, fmt: &str, args: &Value) -> RunResult<String> {
    let mapping = matches!(args, Value::Dict(_)).then_some(args);
    let positional: Vec<Value> = match args {
        Value::Tuple(items) => items.to_vec(),
        Value::Dict(_) => Vec::new(),
        other => vec![other.clone()],
    };
    let mut next_arg = positional.into_iter();
    let mut out = String::with_capacity(fmt.len());
    let mut chars = fmt.chars().peekable();
    let incomplete = || ExcType::ValueError.msg("incomplete format");
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut value = None;
        if chars.peek() == Some(&'(') {
            chars.next();
            let mut key = String::new();
            loop {
                match chars.next() {
                    Some(')') => break,
                    Some(other) => key.push(other),
                    None => return Err(ExcType::ValueError.msg("incomplete format key")),
                }
            }
            let Some(mapping) = mapping else {
                return Err(ExcType::TypeError.msg("format requires a mapping"));
            };
            value = Some(rt.getitem(mapping, &Value::str(key))?);
        }
        let mut spec = FormatSpec::default();
        while let Some(&flag @ ('-' | '+' | ' ' | '0' | '#')) = chars.peek() {
            match flag {
                '-' => spec.align = Some('<'),
                '+' | ' ' => {
                    if spec.sign != Some('+') {
                        spec.sign = Some(flag);
                    }
                }
                '0' => spec.zero = true,
                _ => spec.alternate = true,
            }
            chars.next();
        }
        let mut width = String::new();
        while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
            width.push(d);
            chars.next();
        }
        spec.width = width.parse().unwrap_or(0);
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut precision = String::new();
            while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                precision.push(d);
                chars.next();
            }
            spec.precision = Some(precision.parse().unwrap_or(0));
        }
        let kind = chars.next().ok_or_else(incomplete)?;
        if kind == '%' {
            out.push('%');
            continue;
        }
        let value = match value {
            Some(v) => v,
            None => next_arg
                .next()
                .ok_or_else(|| ExcType::TypeError.msg("not enough arguments for format string"))?,
        };
        if spec.align == Some('<') {
            spec.zero = false;
        }
        let text = match kind {
            's' | 'r' | 'a' => {
                let text = match kind {
                    's' => rt.str(&value)?,
                    'r' => rt.repr(&value)?,
                    _ => ascii_escape(&rt.repr(&value)?),
                };
                let text: String = match spec.precision {
                    Some(p) => text.chars().take(p).collect(),
                    None => text,
                };
                spec.zero = false;
                spec.precision = None;
                pad("", &text, &spec, '>')
            }
            'd' | 'i' | 'u' | 'x' | 'X' | 'o' => {
                let n = match &value {
                    Value::Float(f) => crate::builtins::float_to_int(*f)?.as_bigint().unwrap_or_default(),
                    other if other.is_number() => other.as_bigint().unwrap_or_default(),
                    other => {
                        return Err(ExcType::TypeError.msg(format!(
                            "%{kind} format: a real number is required, not {}",
                            other.type_name()
                        )));
                    }
                };
                spec.kind = Some(if matches!(kind, 'i' | 'u') { 'd' } else { kind });
                spec.precision = None;
                format_int(&n, &spec)?
            }
            'e' | 'E' | 'f' | 'F' | 'g' | 'G' => {
                let f = value.as_float().filter(|_| value.is_number()).ok_or_else(|| {
                    ExcType::TypeError.msg(format!("must be real number, not {}", value.type_name()))
                })?;
                spec.kind = Some(kind);
                if spec.precision.is_none() {
                    spec.precision = Some(6);
                }
                format_float(f, &spec)?
            }
            'c' => match &value {
                Value::Str(s) if s.chars().count() == 1 => pad("", s, &spec, '>'),
                other => {
                    let code = rt.index(other)?;
                    let c = u32::try_from(code)
                        .ok()
                        .and_then(char::from_u32)
                        .ok_or_else(|| ExcType::OverflowError.msg("%c arg not in range(0x110000)"))?;
                    pad("", &c.to_string(), &spec, '>')
                }
            },
            other => {
                return Err(ExcType::ValueError.msg(format!(
                    "unsupported format character '{other}' (0x{:x})",
                    u32::from(other)
                )));
            }
        };
        out.push_str(&text);
    }
    if mapping.is_none() && next_arg.next().is_some() {
        return Err(ExcType::TypeError.msg("not all arguments converted during string formatting"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float(f: f64, spec: &str) -> String {
        parse_spec(spec).and_then(|s| format_float(f, &s)).unwrap_or_default()
    }

    fn int(n: i64, spec: &str) -> String {
        parse_spec(spec).and_then(|s| format_int(&BigInt::from(n), &s)).unwrap_or_default()
    }

    #[test]
    fn float_presentations() {
        assert_eq!(float(3.14159, ".2f"), "3.14");
        assert_eq!(float(1234.5, ",.1f"), "1,234.5");
        assert_eq!(float(0.5, ".1%"), "50.0%");
        assert_eq!(float(12345.678, ".3e"), "1.235e+04");
        assert_eq!(float(0.0001, "g"), "0.0001");
        assert_eq!(float(1e20, "g"), "1e+20");
        assert_eq!(float(-2.5, "+08.2f"), "-0002.50");
    }

    #[test]
    fn int_presentations() {
        assert_eq!(int(255, "#x"), "0xff");
        assert_eq!(int(1_000_000, ","), "1,000,000");
        assert_eq!(int(42, "*^8"), "***42***");
        assert_eq!(int(-5, "05"), "-0005");
        assert_eq!(int(10, "b"), "1010");
    }

    #[test]
    fn ascii_escapes() {
        assert_eq!(ascii_escape("é€😀"), "\\xe9\\u20ac\\U0001f600");
    }
}
