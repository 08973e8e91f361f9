//! Implementation of the `print()` and `input()` builtins.

use crate::{
    args::Args,
    exception::{ExcType, RunResult},
    runtime::Runtime,
    value::Value,
};

/// `print(*values, sep=' ', end='\n', file=None, flush=False)`.
///
/// The whole line is built first and written with a single `write` call, so a redirected
/// stream sees one chunk per `print`.
pub(super) fn print(rt: &Runtime, args: Args) -> RunResult<Value> {
    let mut args = args;
    let sep = optional_str(args.take_keyword("sep"), "sep")?;
    let end = optional_str(args.take_keyword("end"), "end")?;
    let file = args.take_keyword("file").filter(|f| !f.is_none());
    let flush = match args.take_keyword("flush") {
        Some(v) => rt.truthy(&v)?,
        None => false,
    };
    args.no_keywords("print")?;

    let mut output = String::new();
    for (i, value) in args.positional.iter().enumerate() {
        if i > 0 {
            output.push_str(sep.as_deref().unwrap_or(" "));
        }
        output.push_str(&rt.str(value)?);
    }
    output.push_str(end.as_deref().unwrap_or("\n"));

    match file {
        Some(Value::Stream(stream)) => {
            stream.write(&output);
            if flush {
                stream.flush();
            }
        }
        Some(file) => {
            rt.call_method(&file, "write", Args::one(Value::str(output)))?;
            if flush {
                rt.call_method(&file, "flush", Args::empty())?;
            }
        }
        None => rt.write_stream("stdout", &output)?,
    }
    Ok(Value::None)
}

fn optional_str(value: Option<Value>, name: &str) -> RunResult<Option<String>> {
    match value {
        None | Some(Value::None) => Ok(None),
        Some(Value::Str(s)) => Ok(Some(s.to_string())),
        Some(other) => Err(ExcType::TypeError.msg(format!(
            "{name} must be None or a string, not {}",
            other.type_name()
        ))),
    }
}

/// `input(prompt='')`: writes the prompt to `sys.stdout` and reads a line from `sys.stdin`.
pub(super) fn input(rt: &Runtime, args: Args) -> RunResult<Value> {
    if let Some(prompt) = args.get_zero_one_arg("input")? {
        rt.write_stream("stdout", &rt.str(&prompt)?)?;
    }
    let line = match rt.sys_stream("stdin") {
        Value::Stream(stream) => Value::str(stream.readline()?),
        Value::None => return Err(ExcType::RuntimeError.msg("input(): lost sys.stdin")),
        other => rt.call_method(&other, "readline", Args::empty())?,
    };
    let Value::Str(line) = line else {
        return Err(ExcType::TypeError.msg("object.readline() returned non-string"));
    };
    if line.is_empty() {
        return Err(ExcType::EOFError.msg("EOF when reading a line"));
    }
    Ok(Value::str(line.strip_suffix('\n').unwrap_or(&line)))
}
