//! `str` methods.

use std::rc::Rc;

use super::{bind_params, opt_index};
use crate::{
    args::Args,
    exception::{ExcType, RunResult},
    fstring,
    runtime::Runtime,
    value::Value,
};

pub(super) const METHODS: &[&str] = &[
    "capitalize",
    "casefold",
    "center",
    "count",
    "endswith",
    "find",
    "format",
    "index",
    "isalnum",
    "isalpha",
    "isascii",
    "isdecimal",
    "isdigit",
    "isidentifier",
    "islower",
    "isnumeric",
    "isspace",
    "istitle",
    "isupper",
    "join",
    "ljust",
    "lower",
    "lstrip",
    "partition",
    "removeprefix",
    "removesuffix",
    "replace",
    "rfind",
    "rindex",
    "rjust",
    "rpartition",
    "rsplit",
    "rstrip",
    "split",
    "splitlines",
    "startswith",
    "strip",
    "swapcase",
    "title",
    "upper",
    "zfill",
];

pub(super) fn call(rt: &Runtime, s: &Rc<str>, name: &str, args: Args) -> RunResult<Value> {
    let text: &str = s;
    match name {
        "format" => return format(rt, text, args).map(Value::str),
        "join" => return join(rt, text, args.get_one_arg("join")?),
        "split" | "rsplit" => {
            let params = bind_params(args, name, &["sep", "maxsplit"], 0)?;
            let sep = opt_str(params[0].as_ref(), name)?;
            let maxsplit = opt_index(rt, params[1].as_ref())?.unwrap_or(-1);
            let parts = if name == "split" {
                split(text, sep, maxsplit)?
            } else {
                rsplit(text, sep, maxsplit)?
            };
            return Ok(Value::list(parts.into_iter().map(Value::str).collect()));
        }
        "splitlines" => {
            let params = bind_params(args, name, &["keepends"], 0)?;
            let keepends = match &params[0] {
                Some(v) => rt.truthy(v)?,
                None => false,
            };
            return Ok(Value::list(splitlines(text, keepends).into_iter().map(Value::str).collect()));
        }
        "find" | "rfind" | "index" | "rindex" | "count" => return search(rt, text, name, args),
        "startswith" | "endswith" => return affix(rt, text, name, args),
        "replace" => {
            let values = args.get_range(name, 2, 3)?;
            let old = req_str(&values[0], name)?;
            let new = req_str(&values[1], name)?;
            let count = opt_index(rt, values.get(2))?.unwrap_or(-1);
            let replaced = match usize::try_from(count) {
                Ok(n) => text.replacen(old, new, n),
                Err(_) => text.replace(old, new),
            };
            return Ok(Value::str(replaced));
        }
        "center" | "ljust" | "rjust" => {
            let values = args.get_range(name, 1, 2)?;
            let width = usize::try_from(rt.index(&values[0])?).unwrap_or(0);
            let fill = match values.get(1) {
                Some(v) => fill_char(v, name)?,
                None => ' ',
            };
            return Ok(Value::str(justify(text, name, width, fill)));
        }
        "zfill" => {
            let width = usize::try_from(rt.index(&args.get_one_arg(name)?)?).unwrap_or(0);
            return Ok(Value::str(zfill(text, width)));
        }
        "strip" | "lstrip" | "rstrip" => {
            let chars = args.get_zero_one_arg(name)?;
            let chars: Option<Vec<char>> = match &chars {
                None | Some(Value::None) => None,
                Some(v) => Some(req_str(v, name)?.chars().collect()),
            };
            let matcher = |c: char| match &chars {
                Some(set) => set.contains(&c),
                None => c.is_whitespace(),
            };
            let stripped = match name {
                "strip" => text.trim_matches(matcher),
                "lstrip" => text.trim_start_matches(matcher),
                _ => text.trim_end_matches(matcher),
            };
            return Ok(Value::str(stripped));
        }
        "partition" | "rpartition" => {
            let sep = args.get_one_arg(name)?;
            let sep = req_str(&sep, name)?;
            if sep.is_empty() {
                return Err(ExcType::ValueError.msg("empty separator"));
            }
            let found = if name == "partition" { text.split_once(sep) } else { text.rsplit_once(sep) };
            let parts = match (found, name) {
                (Some((head, tail)), _) => [head, sep, tail],
                (None, "partition") => [text, "", ""],
                (None, _) => ["", "", text],
            };
            return Ok(Value::tuple(parts.into_iter().map(Value::str).collect()));
        }
        "removeprefix" | "removesuffix" => {
            let affix = args.get_one_arg(name)?;
            let affix = req_str(&affix, name)?;
            let result = if name == "removeprefix" {
                text.strip_prefix(affix)
            } else {
                text.strip_suffix(affix)
            };
            return Ok(Value::str(result.unwrap_or(text)));
        }
        _ => {}
    }
    args.check_zero_args(name)?;
    let value = match name {
        "lower" | "casefold" => Value::str(text.to_lowercase()),
        "upper" => Value::str(text.to_uppercase()),
        "capitalize" => {
            let mut chars = text.chars();
            Value::str(match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.as_str().to_lowercase().chars()).collect(),
                None => String::new(),
            })
        }
        "swapcase" => Value::str(
            text.chars()
                .flat_map(|c| -> Box<dyn Iterator<Item = char>> {
                    if c.is_uppercase() {
                        Box::new(c.to_lowercase())
                    } else if c.is_lowercase() {
                        Box::new(c.to_uppercase())
                    } else {
                        Box::new(std::iter::once(c))
                    }
                })
                .collect::<String>(),
        ),
        "title" => Value::str(title(text)),
        "isalnum" => Value::Bool(!text.is_empty() && text.chars().all(char::is_alphanumeric)),
        "isalpha" => Value::Bool(!text.is_empty() && text.chars().all(char::is_alphabetic)),
        "isascii" => Value::Bool(text.is_ascii()),
        "isdecimal" | "isdigit" => Value::Bool(!text.is_empty() && text.chars().all(|c| c.is_ascii_digit())),
        "isnumeric" => Value::Bool(!text.is_empty() && text.chars().all(char::is_numeric)),
        "isspace" => Value::Bool(!text.is_empty() && text.chars().all(char::is_whitespace)),
        "isidentifier" => Value::Bool(is_identifier(text)),
        "islower" => Value::Bool(
            text.chars().any(char::is_lowercase) && !text.chars().any(char::is_uppercase),
        ),
        "isupper" => Value::Bool(
            text.chars().any(char::is_uppercase) && !text.chars().any(char::is_lowercase),
        ),
        "istitle" => Value::Bool(!text.is_empty() && title(text) == text && text.chars().any(char::is_alphabetic)),
        _ => {
            return Err(ExcType::AttributeError.msg(format!("'str' object has no attribute '{name}'")));
        }
    };
    Ok(value)
}

fn req_str<'a>(value: &'a Value, method: &str) -> RunResult<&'a str> {
    value.as_str().ok_or_else(|| {
        ExcType::TypeError.msg(format!(
            "{method}() argument must be str, not {}",
            value.type_name()
        ))
    })
}

fn opt_str<'a>(value: Option<&'a Value>, method: &str) -> RunResult<Option<&'a str>> {
    match value {
        None | Some(Value::None) => Ok(None),
        Some(v) => req_str(v, method).map(Some),
    }
}

fn fill_char(value: &Value, method: &str) -> RunResult<char> {
    let s = req_str(value, method)?;
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(ExcType::TypeError.msg("The fill character must be exactly one character long")),
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    chars.next().is_some_and(|c| c.is_alphabetic() || c == '_') && chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn title(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut previous_cased = false;
    for c in text.chars() {
        if previous_cased {
            out.extend(c.to_lowercase());
        } else {
            out.extend(c.to_uppercase());
        }
        previous_cased = c.is_alphabetic();
    }
    out
}

fn justify(text: &str, method: &str, width: usize, fill: char) -> String {
    let len = text.chars().count();
    if width <= len {
        return text.to_owned();
    }
    let margin = width - len;
    let left = match method {
        "ljust" => 0,
        "rjust" => margin,
        _ => margin / 2 + (margin & width & 1),
    };
    let pad = |n: usize| std::iter::repeat_n(fill, n).collect::<String>();
    format!("{}{text}{}", pad(left), pad(margin - left))
}

fn zfill(text: &str, width: usize) -> String {
    let len = text.chars().count();
    if width <= len {
        return text.to_owned();
    }
    let zeros = "0".repeat(width - len);
    match text.strip_prefix(['+', '-']) {
        Some(rest) => format!("{}{zeros}{rest}", &text[..1]),
        None => format!("{zeros}{text}"),
    }
}

fn join(rt: &Runtime, sep: &str, iterable: Value) -> RunResult<Value> {
    let items = rt.to_vec(&iterable)?;
    let mut out = String::new();
    for (i, item) in items.iter().enumerate() {
        let Value::Str(part) = item else {
            return Err(ExcType::TypeError.msg(format!(
                "sequence item {i}: expected str instance, {} found",
                item.type_name()
            )));
        };
        if i > 0 {
            out.push_str(sep);
        }
        out.push_str(part);
    }
    Ok(Value::str(out))
}

fn split(text: &str, sep: Option<&str>, maxsplit: i64) -> RunResult<Vec<String>> {
    let limit = usize::try_from(maxsplit).ok();
    match sep {
        Some("") => Err(ExcType::ValueError.msg("empty separator")),
        Some(sep) => Ok(match limit {
            Some(n) => text.splitn(n + 1, sep).map(str::to_owned).collect(),
            None => text.split(sep).map(str::to_owned).collect(),
        }),
        None => {
            let mut parts = Vec::new();
            let mut rest = text.trim_start();
            while !rest.is_empty() {
                if limit.is_some_and(|n| parts.len() >= n) {
                    parts.push(rest.to_owned());
                    break;
                }
                let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                parts.push(rest[..end].to_owned());
                rest = rest[end..].trim_start();
            }
            Ok(parts)
        }
    }
}

fn rsplit(text: &str, sep: Option<&str>, maxsplit: i64) -> RunResult<Vec<String>> {
    let limit = usize::try_from(maxsplit).ok();
    let mut parts: Vec<String> = match sep {
        Some("") => return Err(ExcType::ValueError.msg("empty separator")),
        Some(sep) => match limit {
            Some(n) => text.rsplitn(n + 1, sep).map(str::to_owned).collect(),
            None => text.rsplit(sep).map(str::to_owned).collect(),
        },
        None => {
            let mut parts = Vec::new();
            let mut rest = text.trim_end();
            while !rest.is_empty() {
                if limit.is_some_and(|n| parts.len() >= n) {
                    parts.push(rest.to_owned());
                    break;
                }
                let start = rest.rfind(char::is_whitespace).map_or(0, |i| {
                    i + rest[i..].chars().next().map_or(1, char::len_utf8)
                });
                parts.push(rest[start..].to_owned());
                rest = rest[..start].trim_end();
            }
            parts
        }
    };
    parts.reverse();
    Ok(parts)
}

fn splitlines(text: &str, keepends: bool) -> Vec<String> {
    let is_break = |c: char| {
        matches!(
            c,
            '\n' | '\r' | '\x0b' | '\x0c' | '\x1c' | '\x1d' | '\x1e' | '\u{85}' | '\u{2028}' | '\u{2029}'
        )
    };
    let mut lines = Vec::new();
    let mut line = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if !is_break(c) {
            line.push(c);
            continue;
        }
        let mut ending = c.to_string();
        if c == '\r' && chars.peek() == Some(&'\n') {
            chars.next();
            ending.push('\n');
        }
        if keepends {
            line.push_str(&ending);
        }
        lines.push(std::mem::take(&mut line));
    }
    if !line.is_empty() {
        lines.push(line);
    }
    lines
}

/// Resolves optional `start` / `end` character positions to a byte range of `text`.
fn char_window(rt: &Runtime, text: &str, start: Option<&Value>, end: Option<&Value>) -> RunResult<Option<(usize, usize, usize)>> {
    let len = text.chars().count() as i64;
    let resolve = |v: Option<i64>, default: i64| -> i64 {
        match v {
            None => default,
            Some(i) if i < 0 => (i + len).max(0),
            Some(i) => i.min(len),
        }
    };
    let start = resolve(opt_index(rt, start)?, 0);
    let end = resolve(opt_index(rt, end)?, len);
    if start > end {
        return Ok(None);
    }
    let byte_at = |char_index: i64| {
        text.char_indices()
            .nth(usize::try_from(char_index).unwrap_or(0))
            .map_or(text.len(), |(b, _)| b)
    };
    Ok(Some((byte_at(start), byte_at(end), usize::try_from(start).unwrap_or(0))))
}

fn search(rt: &Runtime, text: &str, name: &str, args: Args) -> RunResult<Value> {
    let values = args.get_range(name, 1, 3)?;
    let sub = req_str(&values[0], name)?;
    let Some((lo, hi, char_start)) = char_window(rt, text, values.get(1), values.get(2))? else {
        return match name {
            "count" => Ok(Value::Int(0)),
            "find" | "rfind" => Ok(Value::Int(-1)),
            _ => Err(ExcType::ValueError.msg("substring not found")),
        };
    };
    let window = &text[lo..hi];
    if name == "count" {
        let count = if sub.is_empty() {
            window.chars().count() + 1
        } else {
            window.matches(sub).count()
        };
        return Ok(Value::Int(count as i64));
    }
    let found = if name.starts_with('r') { window.rfind(sub) } else { window.find(sub) };
    match found {
        Some(byte) => Ok(Value::Int((char_start + window[..byte].chars().count()) as i64)),
        None if name.ends_with("find") => Ok(Value::Int(-1)),
        None => Err(ExcType::ValueError.msg("substring not found")),
    }
}

fn affix(rt: &Runtime, text: &str, name: &str, args: Args) -> RunResult<Value> {
    let values = args.get_range(name, 1, 3)?;
    let Some((lo, hi, _)) = char_window(rt, text, values.get(1), values.get(2))? else {
        return Ok(Value::Bool(false));
    };
    let window = &text[lo..hi];
    let candidates: Vec<Value> = match &values[0] {
        Value::Tuple(items) => items.to_vec(),
        other => vec![other.clone()],
    };
    for candidate in &candidates {
        let Value::Str(candidate) = candidate else {
            return Err(ExcType::TypeError.msg(format!(
                "{name} first arg must be str or a tuple of str, not {}",
                candidate.type_name()
            )));
        };
        let hit = if name == "startswith" {
            window.starts_with(&**candidate)
        } else {
            window.ends_with(&**candidate)
        };
        if hit {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

/// `str.format(*args, **kwargs)`.
fn format(rt: &Runtime, template: &str, args: Args) -> RunResult<String> {
    let mut auto_index = 0usize;
    format_with(rt, template, &args, &mut auto_index, 0)
}

fn format_with(rt: &Runtime, template: &str, args: &Args, auto_index: &mut usize, depth: u8) -> RunResult<String> {
    if depth > 1 {
        return Err(ExcType::ValueError.msg("Max string recursion exceeded"));
    }
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => return Err(ExcType::ValueError.msg("Single '}' encountered in format string")),
            '{' => {
                let mut field = String::new();
                let mut nesting = 0usize;
                loop {
                    match chars.next() {
                        Some('{') => {
                            nesting += 1;
                            field.push('{');
                        }
                        Some('}') if nesting == 0 => break,
                        Some('}') => {
                            nesting -= 1;
                            field.push('}');
                        }
                        Some(other) => field.push(other),
                        None => return Err(ExcType::ValueError.msg("expected '}' before end of string")),
                    }
                }
                out.push_str(&replacement_field(rt, &field, args, auto_index, depth)?);
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

fn replacement_field(rt: &Runtime, field: &str, args: &Args, auto_index: &mut usize, depth: u8) -> RunResult<String> {
    let (head, spec) = match field.find(':') {
        Some(i) => (&field[..i], &field[i + 1..]),
        None => (field, ""),
    };
    let (path, conversion) = match head.rfind('!') {
        Some(i) => (&head[..i], Some(&head[i + 1..])),
        None => (head, None),
    };
    let name_end = path.find(['.', '[']).unwrap_or(path.len());
    let (first, mut rest) = path.split_at(name_end);
    let mut value = if first.is_empty() {
        let index = *auto_index;
        *auto_index += 1;
        positional(args, index)?
    } else if let Ok(index) = first.parse::<usize>() {
        positional(args, index)?
    } else {
        args.keywords
            .iter()
            .find(|(k, _)| k.as_ref() == first)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| ExcType::KeyError.msg(format!("'{first}'")))?
    };
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            let end = after.find(['.', '[']).unwrap_or(after.len());
            value = rt.getattr(&value, &after[..end])?;
            rest = &after[end..];
        } else if let Some(after) = rest.strip_prefix('[') {
            let end = after
                .find(']')
                .ok_or_else(|| ExcType::ValueError.msg("Missing ']' in format string"))?;
            let key = &after[..end];
            let key = key.parse::<i64>().map_or_else(|_| Value::str(key), Value::Int);
            value = rt.getitem(&value, &key)?;
            rest = &after[end + 1..];
        } else {
            return Err(ExcType::ValueError.msg("Only '.' or '[' may follow ']' in format field specifier"));
        }
    }
    let value = match conversion {
        None => value,
        Some("r") => Value::str(rt.repr(&value)?),
        Some("s") => Value::str(rt.str(&value)?),
        Some("a") => Value::str(fstring::ascii_escape(&rt.repr(&value)?)),
        Some(other) => {
            return Err(ExcType::ValueError.msg(format!(
                "Unknown conversion specifier {other}"
            )));
        }
    };
    let spec = if spec.contains('{') {
        format_with(rt, spec, args, auto_index, depth + 1)?
    } else {
        spec.to_owned()
    };
    fstring::format_value(rt, &value, &spec)
}

fn positional(args: &Args, index: usize) -> RunResult<Value> {
    args.positional.get(index).cloned().ok_or_else(|| {
        ExcType::IndexError.msg(format!(
            "Replacement index {index} out of range for positional args tuple"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_split_honours_maxsplit() {
        assert_eq!(split("  a b  c ", None, 1).unwrap(), vec!["a", "b  c "]);
        assert_eq!(rsplit("  a b  c ", None, 1).unwrap(), vec!["  a b", "c"]);
        assert_eq!(split("a,b,,c", Some(","), -1).unwrap(), vec!["a", "b", "", "c"]);
    }

    #[test]
    fn justify_matches_python_centering() {
        assert_eq!(justify("ab", "center", 5, '*'), "**ab*");
        assert_eq!(justify("abc", "center", 6, '*'), "*abc**");
        assert_eq!(zfill("-42", 5), "-0042");
    }

    #[test]
    fn splitlines_handles_crlf() {
        assert_eq!(splitlines("a\r\nb\nc", false), vec!["a", "b", "c"]);
        assert_eq!(splitlines("a\r\nb\n", true), vec!["a\r\n", "b\n"]);
    }
}
