//! Tests for the built-in modules: `sys`, `time`, `warnings`, `__future__`, `js` and `syncify`.

use std::rc::Rc;

use hostpy::{
    DictRef, ExcType, Host, LocalHost, RunResult, Runtime, RunnerOptions, TimerToken, TrivialSyncifier, Value,
    eval_code, eval_code_async,
};
use pretty_assertions::assert_eq;

fn runtime() -> (Rc<LocalHost>, Runtime) {
    let host = LocalHost::virtual_clock();
    let rt = Runtime::new(host.clone());
    (host, rt)
}

fn exec(rt: &Runtime, source: &str, globals: &DictRef) -> RunResult<Value> {
    eval_code(rt, source, Some(globals.clone()), None, RunnerOptions::default())
}

fn eval_repr(rt: &Runtime, source: &str) -> String {
    let globals = rt.new_globals("__main__");
    let value = exec(rt, source, &globals).unwrap();
    rt.repr(&value).unwrap()
}

// ============================================================================
// sys
// ============================================================================

/// Version and platform information.
#[test]
fn sys_metadata() {
    let (_host, rt) = runtime();
    assert_eq!(
        eval_repr(&rt, "import sys\n(sys.version_info[:2], sys.platform, sys.version.startswith('3.12'))"),
        "((3, 12), 'hostpy', True)"
    );
    assert_eq!(eval_repr(&rt, "import sys\n'sys' in sys.modules"), "True");
}

/// `sys.stdout` can be replaced by assignment and the original stays reachable.
#[test]
fn sys_streams_are_assignable() {
    let (_host, rt) = runtime();
    let value = eval_repr(
        &rt,
        r"
import sys
class Capture:
    def __init__(self):
        self.parts = []
    def write(self, text):
        self.parts.append(text)
        return len(text)
    def flush(self):
        pass
cap = Capture()
sys.stdout = cap
print('hello', 42)
sys.stdout = sys.__stdout__
''.join(cap.parts)
",
    );
    assert_eq!(value, "'hello 42\\n'");
}

/// The asyncgen hooks round-trip and reject non-callables.
#[test]
fn sys_asyncgen_hooks() {
    let (_host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let value = exec(
        &rt,
        r"
import sys
def first(agen): pass
def fin(agen): pass
before = sys.get_asyncgen_hooks()
sys.set_asyncgen_hooks(first, fin)
during = sys.get_asyncgen_hooks()
sys.set_asyncgen_hooks(firstiter=None, finalizer=None)
(before, during[0] is first, during[1] is fin, sys.get_asyncgen_hooks())
",
        &globals,
    )
    .unwrap();
    assert_eq!(rt.repr(&value).unwrap(), "((None, None), True, True, (None, None))");

    let err = exec(&rt, "sys.set_asyncgen_hooks(finalizer='nope')", &globals).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TypeError);
    assert_eq!(err.message(), "callable finalizer expected, got str");
}

// ============================================================================
// time
// ============================================================================

/// `time.monotonic` follows the host clock.
#[test]
fn time_follows_host_clock() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    exec(&rt, "import time\nstart = time.monotonic()", &globals).unwrap();
    host.advance(1500.0);
    let elapsed = exec(&rt, "time.monotonic() - start", &globals).unwrap();
    assert_eq!(elapsed.as_float(), Some(1.5));
    let wall = exec(&rt, "time.time() > 1_600_000_000", &globals).unwrap();
    assert_eq!(rt.repr(&wall).unwrap(), "True");
}

// ============================================================================
// warnings
// ============================================================================

/// Warnings are recorded with their category.
#[test]
fn warnings_are_recorded() {
    let (_host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    exec(
        &rt,
        "import warnings\nwarnings.warn('plain')\nwarnings.warn('old', DeprecationWarning)\nwarnings.warn(RuntimeWarning('inst'))",
        &globals,
    )
    .unwrap();
    let warnings = rt.take_warnings();
    let summary: Vec<(ExcType, &str)> = warnings.iter().map(|w| (w.category, w.message.as_str())).collect();
    assert_eq!(
        summary,
        vec![
            (ExcType::UserWarning, "plain"),
            (ExcType::DeprecationWarning, "old"),
            (ExcType::RuntimeWarning, "inst"),
        ]
    );
    assert!(rt.take_warnings().is_empty(), "take_warnings drains the record");
}

/// Subclasses of Warning are accepted, other categories are not.
#[test]
fn warnings_category_checked() {
    let (_host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    exec(
        &rt,
        "import warnings\nclass MyWarning(UserWarning): pass\nwarnings.warn('mine', MyWarning)",
        &globals,
    )
    .unwrap();
    let warnings = rt.take_warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].category, ExcType::UserWarning, "user classes report their builtin base");

    let err = exec(&rt, "warnings.warn('bad', ValueError)", &globals).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TypeError);
    assert!(err.message().starts_with("category must be a Warning subclass"), "{}", err.message());
}

// ============================================================================
// __future__
// ============================================================================

/// Feature records and the names list.
#[test]
fn future_features() {
    let (_host, rt) = runtime();
    assert_eq!(
        eval_repr(&rt, "import __future__\n(__future__.annotations[0], 'generator_stop' in __future__.all_feature_names)"),
        "('annotations', True)"
    );
    assert_eq!(
        eval_repr(&rt, "import __future__\nlen(__future__.all_feature_names)"),
        "10"
    );
}

/// Unknown features are a compile error.
#[test]
fn unknown_future_feature() {
    let (_host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let err = exec(&rt, "from __future__ import braces", &globals).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::SyntaxError);
    assert!(err.message().contains("braces"), "{}", err.message());
}

// ============================================================================
// js
// ============================================================================

/// `setTimeout` schedules on the host and `clearTimeout` cancels.
#[test]
fn js_timers() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    exec(
        &rt,
        r"
import js
fired = []
keep = js.setTimeout(lambda tag: fired.append(tag), 100, 'kept')
drop = js.setTimeout(lambda tag: fired.append(tag), 50, 'dropped')
js.clearTimeout(drop)
",
        &globals,
    )
    .unwrap();
    assert_eq!(host.pending_timeouts(), 1);
    host.advance(99.0);
    assert_eq!(rt.repr(&exec(&rt, "fired", &globals).unwrap()).unwrap(), "[]");
    host.advance(1.0);
    assert_eq!(rt.repr(&exec(&rt, "fired", &globals).unwrap()).unwrap(), "['kept']");
}

/// Intervals repeat until cleared.
#[test]
fn js_interval() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    exec(
        &rt,
        "import js\nticks = []\ntoken = js.setInterval(lambda: ticks.append(len(ticks)), 10)",
        &globals,
    )
    .unwrap();
    host.advance(35.0);
    exec(&rt, "js.clearInterval(token)", &globals).unwrap();
    host.advance(100.0);
    assert_eq!(rt.repr(&exec(&rt, "ticks", &globals).unwrap()).unwrap(), "[0, 1, 2]");
}

/// `console.log` goes to the host.
#[test]
fn js_console_log() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    exec(&rt, "import js\njs.console.log('value', 1, [2])", &globals).unwrap();
    assert_eq!(host.take_logs(), vec!["value 1 [2]".to_owned()]);
}

/// Errors in timer callbacks are written to stderr and the host keeps running.
#[test]
fn js_callback_errors_are_unraisable() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    exec(
        &rt,
        r"
import js, sys
class Capture:
    def __init__(self):
        self.parts = []
    def write(self, text):
        self.parts.append(text)
    def flush(self):
        pass
sys.stderr = cap = Capture()
ran = []
js.setTimeout(lambda: 1 / 0, 0)
js.setTimeout(lambda: ran.append(True), 1)
",
        &globals,
    )
    .unwrap();
    host.run_until_idle();
    let text = exec(&rt, "''.join(cap.parts)", &globals).unwrap();
    let text = text.as_str().unwrap().to_owned();
    assert!(text.contains("Exception ignored in host timer callback"), "{text}");
    assert!(text.contains("ZeroDivisionError"), "{text}");
    assert_eq!(rt.repr(&exec(&rt, "ran", &globals).unwrap()).unwrap(), "[True]");
}

/// A host that exposes extra names through `namespace_lookup`.
struct NamespaceHost {
    inner: Rc<LocalHost>,
}

impl Host for NamespaceHost {
    fn set_timeout(&self, callback: Box<dyn FnOnce()>, delay_ms: f64) -> TimerToken {
        self.inner.set_timeout(callback, delay_ms)
    }

    fn clear_timeout(&self, token: TimerToken) {
        self.inner.clear_timeout(token);
    }

    fn set_interval(&self, callback: Box<dyn FnMut()>, interval_ms: f64) -> TimerToken {
        self.inner.set_interval(callback, interval_ms)
    }

    fn clear_interval(&self, token: TimerToken) {
        self.inner.clear_interval(token);
    }

    fn now(&self) -> f64 {
        self.inner.now()
    }

    fn namespace_lookup(&self, name: &str) -> Option<Value> {
        match name {
            "answer" => Some(Value::Int(42)),
            "location" => Some(Value::str("https://example.test/")),
            _ => None,
        }
    }
}

/// Unknown `js` attributes are resolved by the host, registered values take precedence.
#[test]
fn js_namespace_lookup() {
    let host = Rc::new(NamespaceHost {
        inner: LocalHost::virtual_clock(),
    });
    let rt = Runtime::new(host);
    rt.register_host_value("answer", Value::Int(7));
    assert_eq!(eval_repr(&rt, "import js\n(js.answer, js.location)"), "(7, 'https://example.test/')");

    let globals = rt.new_globals("__main__");
    let err = exec(&rt, "import js\njs.missing", &globals).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::AttributeError);
}

/// Values registered after import still show up.
#[test]
fn js_late_registration() {
    let (_host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    exec(&rt, "import js", &globals).unwrap();
    rt.register_host_value("config", Value::str("dark"));
    assert_eq!(rt.repr(&exec(&rt, "js.config", &globals).unwrap()).unwrap(), "'dark'");
}

// ============================================================================
// syncify
// ============================================================================

/// Without a syncifier, `syncify()` refuses.
#[test]
fn syncify_requires_syncifier() {
    let (_host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let err = exec(&rt, "import syncify, asyncio\nsyncify.syncify(asyncio.sleep(0))", &globals).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::RuntimeError);
    assert!(err.message().contains("No syncifier installed"), "{}", err.message());
}

/// Synchronous code blocks on a coroutine while the host runs the loop.
#[test]
fn syncify_coroutine() {
    let (_host, rt) = runtime();
    rt.set_syncifier(Some(Rc::new(TrivialSyncifier)));
    let globals = rt.new_globals("__main__");
    let value = exec(
        &rt,
        r"
import asyncio, syncify, time
async def compute():
    await asyncio.sleep(0.25)
    return 'computed'
start = time.monotonic()
result = syncify.syncify(compute())
(result, time.monotonic() - start)
",
        &globals,
    )
    .unwrap();
    assert_eq!(rt.repr(&value).unwrap(), "('computed', 0.25)");
}

/// `syncify.sleep` and `syncify.gather` run together in sync mode.
#[test]
fn syncify_gather_sleeps() {
    let (_host, rt) = runtime();
    rt.set_syncifier(Some(Rc::new(TrivialSyncifier)));
    let globals = rt.new_globals("__main__");
    let value = exec(
        &rt,
        r"
import syncify, time
start = time.monotonic()
results = syncify.syncify(syncify.gather(syncify.sleep(0.2, 'a'), syncify.sleep(0.1, 'b')))
(results, round(time.monotonic() - start, 3))
",
        &globals,
    )
    .unwrap();
    assert_eq!(rt.repr(&value).unwrap(), "(['a', 'b'], 0.2)");
}

/// Syncifyable tasks can also be awaited on the event loop.
#[test]
fn syncify_tasks_are_awaitable() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let coro = eval_code_async(
        &rt,
        "import syncify\nawait syncify.gather(syncify.sleep(0.1, 1), syncify.sleep(0.05, 2))",
        Some(globals),
        None,
        RunnerOptions::default(),
    )
    .unwrap();
    let task = rt.spawn(Value::Coroutine(coro)).unwrap();
    host.run_until_idle();
    assert_eq!(rt.repr(&task.result().unwrap()).unwrap(), "[1, 2]");
}

/// Errors from the awaited work surface at the `syncify()` call.
#[test]
fn syncify_propagates_errors() {
    let (_host, rt) = runtime();
    rt.set_syncifier(Some(Rc::new(TrivialSyncifier)));
    let globals = rt.new_globals("__main__");
    let err = exec(
        &rt,
        "import syncify\nasync def fail():\n    raise KeyError('gone')\nsyncify.syncify(fail())",
        &globals,
    )
    .unwrap_err();
    assert_eq!(err.exc_type(), ExcType::KeyError);
}
