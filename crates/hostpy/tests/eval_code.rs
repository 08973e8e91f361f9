//! Tests for `eval_code`, `eval_code_async`, `CodeRunner` and the source helpers around them.

use std::{cell::RefCell, rc::Rc};

use hostpy::{
    CodeRunner, CompileFlags, CompileMode, Dict, DictRef, ExcType, LocalHost, ReturnMode, RunResult, Runtime,
    RunnerOptions, Value, eval_code, eval_code_async, find_imports, repr_shorten,
};
use pretty_assertions::assert_eq;

fn runtime() -> (Rc<LocalHost>, Runtime) {
    let host = LocalHost::virtual_clock();
    let rt = Runtime::new(host.clone());
    (host, rt)
}

fn namespace() -> DictRef {
    Rc::new(RefCell::new(Dict::new()))
}

fn eval(rt: &Runtime, source: &str) -> RunResult<Value> {
    eval_code(rt, source, None, None, RunnerOptions::default())
}

fn repr(rt: &Runtime, value: &Value) -> String {
    rt.repr(value).unwrap()
}

/// Runs `source` as a task with top-level await and drives the host until it settles.
fn eval_async(host: &LocalHost, rt: &Runtime, source: &str, globals: DictRef) -> RunResult<Value> {
    let coro = eval_code_async(rt, source, Some(globals), None, RunnerOptions::default())?;
    let task = rt.spawn(Value::Coroutine(coro))?;
    host.run_until_idle();
    task.result()
}

// ============================================================================
// return modes
// ============================================================================

/// A trailing expression is the result.
#[test]
fn last_expression_is_returned() {
    let (_host, rt) = runtime();
    let value = eval(&rt, "1+1").unwrap();
    assert_eq!(value.as_int(), Some(2), "1+1 should evaluate to 2");
}

/// A trailing semicolon silences the result.
#[test]
fn trailing_semicolon_returns_none() {
    let (_host, rt) = runtime();
    let value = eval(&rt, "1+1;").unwrap();
    assert!(value.is_none(), "a trailing semicolon should give None");

    let value = eval(&rt, "1+1 # comment ;").unwrap();
    assert_eq!(value.as_int(), Some(2), "a semicolon inside a comment does not count");
}

/// Statements before the last expression run first.
#[test]
fn statements_then_expression() {
    let (_host, rt) = runtime();
    let value = eval(&rt, "x = 41; x + 1").unwrap();
    assert_eq!(value.as_int(), Some(42));
}

/// `last_expr_or_assign` yields the value of a trailing assignment.
#[test]
fn last_assignment_with_last_expr_or_assign() {
    let (_host, rt) = runtime();
    let options = RunnerOptions {
        return_mode: ReturnMode::LastExprOrAssign,
        ..RunnerOptions::default()
    };
    let value = eval_code(&rt, "x = 42", None, None, options.clone()).unwrap();
    assert_eq!(value.as_int(), Some(42), "the assigned value is the result");

    let value = eval_code(&rt, "x = 5\nx += 1", None, None, options).unwrap();
    assert_eq!(value.as_int(), Some(6), "augmented assignment yields the new value");

    let value = eval(&rt, "x = 42").unwrap();
    assert!(value.is_none(), "plain last_expr ignores assignments");
}

/// `ReturnMode::None` never returns a value.
#[test]
fn return_mode_none() {
    let (_host, rt) = runtime();
    let options = RunnerOptions {
        return_mode: ReturnMode::None,
        ..RunnerOptions::default()
    };
    let value = eval_code(&rt, "1+1", None, None, options).unwrap();
    assert!(value.is_none());
}

/// Quieting can be turned off.
#[test]
fn semicolon_kept_when_quiet_disabled() {
    let (_host, rt) = runtime();
    let options = RunnerOptions {
        quiet_trailing_semicolon: false,
        ..RunnerOptions::default()
    };
    let value = eval_code(&rt, "1+1;", None, None, options).unwrap();
    assert_eq!(value.as_int(), Some(2));
}

/// Source that ends in a compound statement has no result.
#[test]
fn compound_statement_gives_none() {
    let (_host, rt) = runtime();
    let value = eval(&rt, "for i in range(3):\n    pass").unwrap();
    assert!(value.is_none());
}

/// Indented source is dedented before parsing.
#[test]
fn source_is_dedented() {
    let (_host, rt) = runtime();
    let value = eval(&rt, "\n    x = 3\n    x * 2\n").unwrap();
    assert_eq!(value.as_int(), Some(6));
}

/// `eval` mode evaluates a single expression.
#[test]
fn eval_mode() {
    let (_host, rt) = runtime();
    let options = RunnerOptions {
        mode: CompileMode::Eval,
        ..RunnerOptions::default()
    };
    let value = eval_code(&rt, "[1, 2][1] * 10", None, None, options).unwrap();
    assert_eq!(value.as_int(), Some(20));
}

// ============================================================================
// namespaces
// ============================================================================

/// Globals passed in are read and written.
#[test]
fn globals_are_shared_between_calls() {
    let (_host, rt) = runtime();
    let globals = namespace();
    eval_code(&rt, "a = 10", Some(globals.clone()), None, RunnerOptions::default()).unwrap();
    let value = eval_code(&rt, "a * 2", Some(globals.clone()), None, RunnerOptions::default()).unwrap();
    assert_eq!(value.as_int(), Some(20));
    assert_eq!(globals.borrow().get_str("a").and_then(|v| v.as_int()), Some(10));
}

/// With separate locals, assignments land in locals and reads fall back to globals.
#[test]
fn separate_locals() {
    let (_host, rt) = runtime();
    let globals = namespace();
    let locals = namespace();
    globals.borrow_mut().set_str("g", Value::Int(1));
    let value = eval_code(
        &rt,
        "l = g + 1\nl",
        Some(globals.clone()),
        Some(locals.clone()),
        RunnerOptions::default(),
    )
    .unwrap();
    assert_eq!(value.as_int(), Some(2));
    assert!(globals.borrow().get_str("l").is_none(), "assignment must not reach globals");
    assert_eq!(locals.borrow().get_str("l").and_then(|v| v.as_int()), Some(2));
}

/// The result channel leaves no trace in the namespace.
#[test]
fn result_name_does_not_leak() {
    let (_host, rt) = runtime();
    let globals = namespace();
    eval_code(&rt, "1 + 2", Some(globals.clone()), None, RunnerOptions::default()).unwrap();
    let names: Vec<String> = globals
        .borrow()
        .items()
        .into_iter()
        .filter_map(|(k, _)| k.as_str().map(str::to_owned))
        .collect();
    assert!(
        names.iter().all(|n| !n.contains("EvalCodeResult")),
        "unexpected names in globals: {names:?}"
    );
}

// ============================================================================
// errors
// ============================================================================

/// Syntax errors surface before anything runs.
#[test]
fn syntax_error_is_raised() {
    let (_host, rt) = runtime();
    let err = eval(&rt, "x = (1,").unwrap_err();
    assert!(err.is_instance(ExcType::SyntaxError), "got {err}");
}

/// Runtime errors propagate with the configured filename in the traceback.
#[test]
fn runtime_error_traceback_uses_filename() {
    let (_host, rt) = runtime();
    let options = RunnerOptions {
        filename: "<cell-1>".to_owned(),
        ..RunnerOptions::default()
    };
    let err = eval_code(&rt, "x = 1\n1 / 0", None, None, options).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::ZeroDivisionError);
    let frames = err.traceback();
    assert_eq!(frames.last().map(|f| f.filename.to_string()), Some("<cell-1>".to_owned()));
    assert_eq!(frames.last().map(|f| f.lineno), Some(2));
}

/// A user exception raised by the code is returned unchanged.
#[test]
fn user_exception_propagates() {
    let (_host, rt) = runtime();
    let err = eval(&rt, "raise ValueError('bad value')").unwrap_err();
    assert_eq!(err.exc_type(), ExcType::ValueError);
    assert_eq!(err.message(), "bad value");
}

// ============================================================================
// top-level await
// ============================================================================

/// `eval_code_async` supports top-level await and resolves to the last expression.
#[test]
fn top_level_await() {
    let (host, rt) = runtime();
    let value = eval_async(
        &host,
        &rt,
        "import asyncio\nawait asyncio.sleep(0)\n42",
        namespace(),
    )
    .unwrap();
    assert_eq!(value.as_int(), Some(42));
}

/// Synchronous evaluation refuses code that awaits.
#[test]
fn top_level_await_needs_async() {
    let (_host, rt) = runtime();
    let err = eval(&rt, "import asyncio\nawait asyncio.sleep(0)\n42").unwrap_err();
    assert!(
        err.is_instance(ExcType::SyntaxError) || err.is_instance(ExcType::RuntimeError),
        "expected a compile or runtime refusal, got {err}"
    );
}

/// Awaiting a timer advances the virtual clock.
#[test]
fn top_level_await_with_delay() {
    let (host, rt) = runtime();
    let globals = namespace();
    let value = eval_async(
        &host,
        &rt,
        "import asyncio, time\nstart = time.monotonic()\nawait asyncio.sleep(0.5)\ntime.monotonic() - start",
        globals,
    )
    .unwrap();
    let elapsed = value.as_float().unwrap();
    assert!((elapsed - 0.5).abs() < 1e-6, "elapsed was {elapsed}");
}

/// Async code without await still works through the async entry point.
#[test]
fn async_without_await() {
    let (host, rt) = runtime();
    let value = eval_async(&host, &rt, "[1, 2, 3][-1]", namespace()).unwrap();
    assert_eq!(value.as_int(), Some(3));
}

// ============================================================================
// CodeRunner
// ============================================================================

/// The AST can be inspected before compiling, and the runner can be run repeatedly.
#[test]
fn code_runner_lifecycle() {
    let (_host, rt) = runtime();
    let mut runner = CodeRunner::new("counter.append(1)\nlen(counter)", RunnerOptions::default()).unwrap();
    assert_eq!(runner.ast.body.len(), 2, "two statements parsed");
    assert!(runner.code().is_none(), "not compiled yet");
    runner.compile().unwrap();
    let globals = namespace();
    globals.borrow_mut().set_str("counter", Value::list(Vec::new()));
    let first = runner.run(&rt, Some(globals.clone()), None).unwrap();
    let second = runner.run(&rt, Some(globals), None).unwrap();
    assert_eq!((first.as_int(), second.as_int()), (Some(1), Some(2)));
}

/// Compiling twice is an error, and running before compiling is too.
#[test]
fn code_runner_compile_once() {
    let (_host, rt) = runtime();
    let mut runner = CodeRunner::new("1", RunnerOptions::default()).unwrap();
    let err = runner.run(&rt, None, None).unwrap_err();
    assert_eq!(err.message(), "Not yet compiled");
    runner.compile().unwrap();
    let err = runner.compile().unwrap_err();
    assert_eq!(err.message(), "Already compiled");
}

/// `run` refuses coroutine code and points at `run_async`.
#[test]
fn code_runner_run_rejects_await() {
    let (host, rt) = runtime();
    let options = RunnerOptions {
        flags: CompileFlags::ALLOW_TOP_LEVEL_AWAIT,
        ..RunnerOptions::default()
    };
    let mut runner = CodeRunner::new("import asyncio\nawait asyncio.sleep(0)\n'done'", options).unwrap();
    runner.compile().unwrap();
    assert!(runner.code().is_some_and(hostpy::Code::is_coroutine));
    let err = runner.run(&rt, None, None).unwrap_err();
    assert!(err.message().contains("run_async"), "message was {}", err.message());

    let coro = runner.run_async(&rt, None, None).unwrap();
    let task = rt.spawn(Value::Coroutine(coro)).unwrap();
    host.run_until_idle();
    assert_eq!(task.result().unwrap().as_str(), Some("done"));
}

// ============================================================================
// helpers
// ============================================================================

/// Imports are found anywhere in the source, with their parent packages.
#[test]
fn find_imports_with_parents() {
    let source = r"
import numpy as np
from scipy.linalg import eig
import a.b.c

def f():
    import json
    if True:
        from os import path

from . import sibling
";
    assert_eq!(
        find_imports(source),
        vec!["a", "a.b", "a.b.c", "json", "numpy", "os", "scipy", "scipy.linalg"]
    );
}

/// Valid Python the interpreter cannot run is still scanned.
#[test]
fn find_imports_in_unsupported_syntax() {
    assert_eq!(find_imports("import numpy\ndata = b'x'"), vec!["numpy"], "bytes literal");
    assert_eq!(find_imports("import cmath\nz = 1 + 2j"), vec!["cmath"], "complex literal");
    let source = r"
match command:
    case 'plot':
        import matplotlib.pyplot
    case _:
        from pandas import DataFrame
type Vector = list[float]
try:
    pass
except* ValueError:
    import logging
";
    assert_eq!(
        find_imports(source),
        vec!["logging", "matplotlib", "matplotlib.pyplot", "pandas"],
        "imports inside match cases and except* handlers"
    );
}

/// Unparsable source gives no imports.
#[test]
fn find_imports_syntax_error() {
    assert_eq!(find_imports("import numpy\nx = ("), Vec::<String>::new());
}

/// Long reprs are shortened in the middle.
#[test]
fn repr_shorten_long_values() {
    let (_host, rt) = runtime();
    let value = eval(&rt, "'x' * 20").unwrap();
    assert_eq!(repr_shorten(&rt, &value, 10, None, "...").unwrap(), "'xxxx...xxxx'");
    assert_eq!(repr_shorten(&rt, &value, 10, Some(2), "<>").unwrap(), "'x<>x'");
    let short = Value::Int(5);
    assert_eq!(repr_shorten(&rt, &short, 10, None, "...").unwrap(), "5");
    assert_eq!(repr(&rt, &short), "5");
}

// ============================================================================
// options
// ============================================================================

/// Runner options load from partial JSON, missing fields keep their defaults.
#[test]
fn runner_options_from_json() {
    let options: RunnerOptions =
        serde_json::from_str(r#"{"return_mode": "last_expr_or_assign", "filename": "<cell-7>"}"#).unwrap();
    assert_eq!(
        options,
        RunnerOptions {
            return_mode: ReturnMode::LastExprOrAssign,
            filename: "<cell-7>".to_owned(),
            ..RunnerOptions::default()
        }
    );
    let rendered = serde_json::to_value(&options).unwrap();
    assert_eq!(rendered["mode"], "exec");
    assert_eq!(rendered["flags"], 0);

    let (_host, rt) = runtime();
    let value = eval_code(&rt, "y = 3 * 4", None, None, options).unwrap();
    assert_eq!(value.as_int(), Some(12));
}
