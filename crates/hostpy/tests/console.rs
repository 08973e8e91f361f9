//! Tests for the interactive `Console`: buffering, incomplete input, error formatting,
//! stream redirection, serialized execution and completion.

use std::{cell::RefCell, rc::Rc};

use hostpy::{
    Console, ConsoleFuture, ConsoleOptions, ExcType, LocalHost, Runtime, RunnerOptions, SyntaxCheck, Value,
    WriteCallback, eval_code,
};
use pretty_assertions::assert_eq;

fn runtime() -> (Rc<LocalHost>, Runtime) {
    let host = LocalHost::virtual_clock();
    let rt = Runtime::new(host.clone());
    (host, rt)
}

fn console(rt: &Runtime) -> Console {
    Console::new(rt, None, ConsoleOptions::default())
}

/// Pushes every line, drives the loop, and returns the future of the last push.
fn push_all(host: &LocalHost, console: &Console, lines: &[&str]) -> ConsoleFuture {
    let mut last = None;
    for line in lines {
        last = Some(console.push(line));
    }
    host.run_until_idle();
    last.expect("at least one line")
}

fn collector() -> (Rc<RefCell<String>>, WriteCallback) {
    let out = Rc::new(RefCell::new(String::new()));
    let sink = out.clone();
    (out, Rc::new(move |text: &str| sink.borrow_mut().push_str(text)))
}

fn global(console: &Console, name: &str) -> Option<Value> {
    console.globals().borrow().get_str(name)
}

// ============================================================================
// push and syntax checks
// ============================================================================

/// A function definition stays incomplete until the blank line, then the call resolves.
#[test]
fn multi_line_definition() {
    let (host, rt) = runtime();
    let console = console(&rt);

    let first = console.push("def f(x):");
    assert_eq!(first.syntax_check(), SyntaxCheck::Incomplete, "header alone is incomplete");
    let second = console.push("    return x+1");
    assert_eq!(second.syntax_check(), SyntaxCheck::Incomplete, "body without blank line is incomplete");
    assert_eq!(console.buffer().len(), 2, "incomplete lines stay buffered");

    let third = console.push("");
    assert_eq!(third.syntax_check(), SyntaxCheck::Complete, "blank line ends the block");
    assert!(console.buffer().is_empty(), "buffer is cleared once complete");

    let call = console.push("f(10)");
    assert_eq!(call.syntax_check(), SyntaxCheck::Complete);
    host.run_until_idle();
    assert_eq!(call.result().unwrap().as_int(), Some(11), "f(10) should resolve to 11");
}

/// Incomplete futures are already resolved with `None`.
#[test]
fn incomplete_future_is_resolved() {
    let (_host, rt) = runtime();
    let console = console(&rt);
    let future = console.push("x = (1,");
    assert_eq!(future.syntax_check(), SyntaxCheck::Incomplete);
    assert!(future.done());
    assert!(future.result().unwrap().is_none());
}

/// Open brackets continue over several lines.
#[test]
fn bracket_continuation() {
    let (host, rt) = runtime();
    let console = console(&rt);
    let future = push_all(&host, &console, &["values = [", "  1,", "  2,", "]", "sum(values)"]);
    assert_eq!(future.result().unwrap().as_int(), Some(3));
}

/// Syntax errors are reported immediately without a traceback and clear the buffer.
#[test]
fn syntax_error() {
    let (_host, rt) = runtime();
    let console = console(&rt);
    let future = console.push("1 +* 2");
    assert_eq!(future.syntax_check(), SyntaxCheck::SyntaxError);
    assert!(future.done(), "syntax errors settle right away");
    let err = future.result().unwrap_err();
    assert!(err.is_instance(ExcType::SyntaxError), "got {err}");

    let formatted = future.formatted_error().expect("formatted error is set");
    assert!(formatted.starts_with("  File \"<console>\", line 1"), "formatted: {formatted}");
    assert!(formatted.contains("SyntaxError"), "formatted: {formatted}");
    assert!(!formatted.contains("Traceback"), "syntax errors have no traceback: {formatted}");
    assert!(console.buffer().is_empty());
}

/// A trailing semicolon silences the result, like in the REPL.
#[test]
fn quiet_semicolon() {
    let (host, rt) = runtime();
    let console = console(&rt);
    let future = push_all(&host, &console, &["1 + 1;"]);
    assert!(future.result().unwrap().is_none());
}

// ============================================================================
// errors
// ============================================================================

/// Runtime errors reject the future and format only console frames.
#[test]
fn runtime_error_traceback() {
    let (host, rt) = runtime();
    let console = console(&rt);
    let future = push_all(&host, &console, &["1/0"]);
    let err = future.result().unwrap_err();
    assert_eq!(err.exc_type(), ExcType::ZeroDivisionError);

    let formatted = future.formatted_error().expect("formatted error is set");
    assert!(formatted.starts_with("Traceback (most recent call last):"), "formatted: {formatted}");
    assert!(formatted.contains("ZeroDivisionError"), "formatted: {formatted}");
    for line in formatted.lines().filter(|l| l.trim_start().starts_with("File ")) {
        assert!(
            line.contains("\"<console>\"") || line.contains("\"<exec>\""),
            "unexpected frame: {line}"
        );
    }
}

/// Frames of functions defined in the console are kept.
#[test]
fn nested_console_frames_are_kept() {
    let (host, rt) = runtime();
    let console = console(&rt);
    push_all(&host, &console, &["def g():", "    return 1/0", ""]);
    let future = push_all(&host, &console, &["g()"]);
    let err = future.result().unwrap_err();
    assert_eq!(console.num_frames_to_keep(&err), 2, "module frame and g's frame");
    let formatted = future.formatted_error().unwrap_or_default();
    assert!(formatted.contains("in g"), "formatted: {formatted}");
}

/// The last error is recorded in `sys.last_*`.
#[test]
fn last_exception_recorded_in_sys() {
    let (host, rt) = runtime();
    let console = console(&rt);
    push_all(&host, &console, &["1/0"]);
    let future = push_all(&host, &console, &["import sys", "sys.last_type.__name__"]);
    assert_eq!(future.result().unwrap().as_str(), Some("ZeroDivisionError"));

    let future = push_all(&host, &console, &["isinstance(sys.last_value, ZeroDivisionError)"]);
    assert!(matches!(future.result().unwrap(), Value::Bool(true)));

    console.push("1 +* 2");
    let future = push_all(&host, &console, &["sys.last_traceback is None"]);
    assert!(
        matches!(future.result().unwrap(), Value::Bool(true)),
        "syntax errors leave no traceback"
    );
}

/// Errors do not break later input.
#[test]
fn console_recovers_after_error() {
    let (host, rt) = runtime();
    let console = console(&rt);
    push_all(&host, &console, &["raise ValueError('boom')"]);
    let future = push_all(&host, &console, &["'still alive'"]);
    assert_eq!(future.result().unwrap().as_str(), Some("still alive"));
}

// ============================================================================
// namespace and execution order
// ============================================================================

/// The default namespace looks like `__console__`.
#[test]
fn default_globals() {
    let (_host, rt) = runtime();
    let console = console(&rt);
    assert_eq!(global(&console, "__name__").and_then(|v| v.as_str().map(str::to_owned)).as_deref(), Some("__console__"));
    assert!(global(&console, "__doc__").is_some_and(|v| v.is_none()));
}

/// A supplied namespace is used as is.
#[test]
fn supplied_globals() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    globals.borrow_mut().set_str("seed", Value::Int(7));
    let console = Console::new(&rt, Some(globals.clone()), ConsoleOptions::default());
    let future = push_all(&host, &console, &["seed * 6"]);
    assert_eq!(future.result().unwrap().as_int(), Some(42));
    push_all(&host, &console, &["result = seed"]);
    assert_eq!(globals.borrow().get_str("result").and_then(|v| v.as_int()), Some(7));
}

/// Code pushed while earlier code is suspended waits for it.
#[test]
fn runs_are_serialized() {
    let (host, rt) = runtime();
    let console = console(&rt);
    push_all(&host, &console, &["import asyncio", "order = []"]);

    let slow = console.push("await asyncio.sleep(1); order.append('first')");
    let fast = console.push("order.append('second')");
    assert_eq!(slow.syntax_check(), SyntaxCheck::Complete);
    assert_eq!(fast.syntax_check(), SyntaxCheck::Complete);
    host.run_until_idle();

    assert!(slow.done() && fast.done());
    let order = push_all(&host, &console, &["order"]).result().unwrap();
    assert_eq!(rt.repr(&order).unwrap(), "['first', 'second']");
}

/// Top-level await works in the console.
#[test]
fn top_level_await() {
    let (host, rt) = runtime();
    let console = console(&rt);
    let future = push_all(&host, &console, &["import asyncio", "await asyncio.sleep(0.1, 'slept')"]);
    assert_eq!(future.result().unwrap().as_str(), Some("slept"));
}

/// `from __future__` imports persist across inputs.
#[test]
fn future_imports_persist() {
    let (host, rt) = runtime();
    let console = console(&rt);
    let future = push_all(&host, &console, &["from __future__ import annotations"]);
    assert!(future.result().is_ok());
    let future = push_all(&host, &console, &["1"]);
    assert_eq!(future.result().unwrap().as_int(), Some(1));
}

// ============================================================================
// streams
// ============================================================================

/// Output goes to the callbacks while code runs; the process streams come back afterwards.
#[test]
fn stream_callbacks() {
    let (host, rt) = runtime();
    let (out, stdout) = collector();
    let (err, stderr) = collector();
    let console = Console::new(
        &rt,
        None,
        ConsoleOptions {
            stdout_callback: Some(stdout),
            stderr_callback: Some(stderr),
            ..ConsoleOptions::default()
        },
    );
    let before = rt.sys().get("stdout").expect("sys.stdout");

    push_all(&host, &console, &["import sys", "print('hello')", "print('oops', file=sys.stderr)"]);
    assert_eq!(out.borrow().as_str(), "hello\n");
    assert_eq!(err.borrow().as_str(), "oops\n");

    let after = rt.sys().get("stdout").expect("sys.stdout");
    assert!(before.is(&after), "sys.stdout is restored after running");
}

/// Streams are restored even when the code raises.
#[test]
fn streams_restored_after_error() {
    let (host, rt) = runtime();
    let (out, stdout) = collector();
    let console = Console::new(
        &rt,
        None,
        ConsoleOptions {
            stdout_callback: Some(stdout),
            ..ConsoleOptions::default()
        },
    );
    let before = rt.sys().get("stdout").expect("sys.stdout");
    push_all(&host, &console, &["print('partial', end='')", "1/0"]);
    assert_eq!(out.borrow().as_str(), "partial");
    assert!(before.is(&rt.sys().get("stdout").expect("sys.stdout")));
}

/// stdin reads come from the callback.
#[test]
fn stdin_callback() {
    let (host, rt) = runtime();
    let console = Console::new(
        &rt,
        None,
        ConsoleOptions {
            stdin_callback: Some(Rc::new(|_| "typed line\n".to_owned())),
            ..ConsoleOptions::default()
        },
    );
    let future = push_all(&host, &console, &["import sys", "sys.stdin.readline()"]);
    assert_eq!(future.result().unwrap().as_str(), Some("typed line\n"));
}

/// Nested redirection keeps the outer streams; only the outermost guard restores.
#[test]
fn nested_redirect_guards() {
    let (_host, rt) = runtime();
    let (out, stdout) = collector();
    let console = Console::new(
        &rt,
        None,
        ConsoleOptions {
            stdout_callback: Some(stdout),
            ..ConsoleOptions::default()
        },
    );
    let before = rt.sys().get("stdout").expect("sys.stdout");

    let outer = console.redirect_streams();
    let redirected = rt.sys().get("stdout").expect("sys.stdout");
    assert!(!before.is(&redirected), "outer guard installs the console streams");
    {
        let _inner = console.redirect_streams();
        assert!(redirected.is(&rt.sys().get("stdout").expect("sys.stdout")), "inner guard reuses them");
        let globals = console.globals().clone();
        eval_code(&rt, "print('nested')", Some(globals), None, RunnerOptions::default()).unwrap();
    }
    assert!(
        redirected.is(&rt.sys().get("stdout").expect("sys.stdout")),
        "dropping the inner guard keeps the outer redirection"
    );
    drop(outer);
    assert!(before.is(&rt.sys().get("stdout").expect("sys.stdout")), "outer guard restores");
    assert_eq!(out.borrow().as_str(), "nested\n");
}

/// Persistent redirection holds until it is restored.
#[test]
fn persistent_redirection() {
    let (host, rt) = runtime();
    let (out, stdout) = collector();
    let before = rt.sys().get("stdout").expect("sys.stdout");
    let console = Console::new(
        &rt,
        None,
        ConsoleOptions {
            stdout_callback: Some(stdout),
            persistent_stream_redirection: true,
            ..ConsoleOptions::default()
        },
    );
    let during = rt.sys().get("stdout").expect("sys.stdout");
    assert!(!before.is(&during), "streams are replaced at construction");

    push_all(&host, &console, &["print('one')"]);
    assert!(during.is(&rt.sys().get("stdout").expect("sys.stdout")), "still redirected between runs");

    console.persistent_restore_streams();
    assert!(before.is(&rt.sys().get("stdout").expect("sys.stdout")));
    assert_eq!(out.borrow().as_str(), "one\n");
}

// ============================================================================
// completion
// ============================================================================

/// Builtins complete with a call paren.
#[test]
fn complete_builtin() {
    let (_host, rt) = runtime();
    let console = console(&rt);
    assert_eq!(console.complete("pri"), (vec!["print(".to_owned()], 0));
}

/// Keywords get the suffix the REPL uses.
#[test]
fn complete_keywords() {
    let (_host, rt) = runtime();
    let console = console(&rt);
    assert_eq!(console.complete("whi").0, vec!["while "]);
    assert_eq!(console.complete("tr").0, vec!["try:"]);
    assert_eq!(console.complete("Tru").0, vec!["True"]);
}

/// The completed word starts after the last break character.
#[test]
fn complete_start_index() {
    let (host, rt) = runtime();
    let console = console(&rt);
    push_all(&host, &console, &["banana = 1"]);
    let (completions, start) = console.complete("x = foo(ban");
    assert_eq!(start, 8);
    assert_eq!(completions, vec!["banana"]);
}

/// Attribute chains complete from the object's attributes.
#[test]
fn complete_attributes() {
    let (host, rt) = runtime();
    let console = console(&rt);
    push_all(&host, &console, &["import asyncio"]);
    let (completions, start) = console.complete("asyncio.sle");
    assert_eq!(start, 0);
    assert_eq!(completions, vec!["asyncio.sleep("]);
}

/// Properties are offered without being evaluated, and private names are hidden.
#[test]
fn complete_instance_attributes() {
    let (host, rt) = runtime();
    let console = console(&rt);
    push_all(
        &host,
        &console,
        &[
            "class Box:",
            "    def __init__(self):",
            "        self.value_count = 3",
            "        self._hidden = 1",
            "    @property",
            "    def value_prop(self):",
            "        raise RuntimeError('must not run')",
            "    def value_method(self):",
            "        pass",
            "",
        ],
    );
    push_all(&host, &console, &["box = Box()"]);
    let (completions, _) = console.complete("box.value_");
    assert_eq!(completions, vec!["box.value_count", "box.value_method(", "box.value_prop"]);

    let (completions, _) = console.complete("box.");
    assert!(completions.iter().all(|c| !c.starts_with("box._")), "{completions:?}");
    let (completions, _) = console.complete("box._");
    assert!(completions.contains(&"box._hidden".to_owned()), "{completions:?}");
}

/// Unknown names give no attribute completions.
#[test]
fn complete_unknown_object() {
    let (_host, rt) = runtime();
    let console = console(&rt);
    assert_eq!(console.complete("nothing_here.x"), (Vec::<String>::new(), 0));
}
