//! Tests for async generator tracking: the loop's `firstiter` / `finalizer` hooks,
//! `shutdown_asyncgens` and the warnings around them.

use std::rc::Rc;

use hostpy::{DictRef, ExcType, LocalHost, RunResult, Runtime, RunnerOptions, Value, eval_code, eval_code_async};
use pretty_assertions::assert_eq;

fn runtime() -> (Rc<LocalHost>, Runtime) {
    let host = LocalHost::virtual_clock();
    let rt = Runtime::new(host.clone());
    (host, rt)
}

fn exec(rt: &Runtime, source: &str, globals: &DictRef) -> RunResult<Value> {
    eval_code(rt, source, Some(globals.clone()), None, RunnerOptions::default())
}

/// Runs `source` as a new task and drives the host until nothing is pending.
fn run(host: &LocalHost, rt: &Runtime, source: &str, globals: &DictRef) -> RunResult<Value> {
    let coro = eval_code_async(rt, source, Some(globals.clone()), None, RunnerOptions::default())?;
    let task = rt.spawn(Value::Coroutine(coro))?;
    host.run_until_idle();
    task.result()
}

fn repr(rt: &Runtime, value: &Value) -> String {
    rt.repr(value).unwrap()
}

const GENERATOR: &str = r"
import asyncio, sys
marks = []
async def g():
    try:
        yield 1
        yield 2
    finally:
        marks.append('closed')
";

// ============================================================================
// shutdown_asyncgens
// ============================================================================

/// A partially consumed generator is closed by shutdown; later generators warn.
#[test]
fn shutdown_closes_generators_then_warns() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    exec(&rt, GENERATOR, &globals).unwrap();

    let value = run(
        &host,
        &rt,
        r"
agen = g()
first = await agen.__anext__()
del agen
loop = asyncio.get_running_loop()
await loop.shutdown_asyncgens()
closed = 'closed' in marks
await loop.shutdown_asyncgens()
(first, closed)
",
        &globals,
    )
    .unwrap();
    assert_eq!(repr(&rt, &value), "(1, True)", "generator pulled once and closed");
    assert!(rt.take_warnings().is_empty(), "shutdown itself does not warn");

    run(
        &host,
        &rt,
        r"
async def late():
    yield 'late'
async for item in late():
    break
",
        &globals,
    )
    .unwrap();
    let warnings = rt.take_warnings();
    assert_eq!(warnings.len(), 1, "one warning for the late generator: {warnings:?}");
    assert_eq!(warnings[0].category, ExcType::ResourceWarning);
    assert!(
        warnings[0].message.contains("shutdown_asyncgens()"),
        "message: {}",
        warnings[0].message
    );
}

/// A generator still referenced is closed by shutdown too.
#[test]
fn shutdown_closes_live_generator() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    exec(&rt, GENERATOR, &globals).unwrap();
    let value = run(
        &host,
        &rt,
        r"
agen = g()
await agen.__anext__()
await asyncio.get_running_loop().shutdown_asyncgens()
(marks, agen.ag_running)
",
        &globals,
    )
    .unwrap();
    assert_eq!(repr(&rt, &value), "(['closed'], False)");
}

/// Several generators close concurrently.
#[test]
fn shutdown_closes_many() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let value = run(
        &host,
        &rt,
        r"
import asyncio
closed = []
async def slow_close(n):
    try:
        yield n
    finally:
        await asyncio.sleep(0.1)
        closed.append(n)
gens = [slow_close(i) for i in range(3)]
for agen in gens:
    await agen.__anext__()
await asyncio.get_running_loop().shutdown_asyncgens()
sorted(closed)
",
        &globals,
    )
    .unwrap();
    assert_eq!(repr(&rt, &value), "[0, 1, 2]");
    let elapsed = rt.host().now();
    assert!(elapsed < 0.2 + 1e-9, "closes ran concurrently, took {elapsed}s");
}

/// Errors raised while closing are reported, and shutdown carries on.
#[test]
fn close_errors_are_reported() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let value = run(
        &host,
        &rt,
        r"
import asyncio
closed = []
async def broken():
    try:
        yield 1
    finally:
        raise ValueError('close failed')
async def fine():
    try:
        yield 1
    finally:
        closed.append('fine')
a = broken()
b = fine()
await a.__anext__()
await b.__anext__()
await asyncio.get_running_loop().shutdown_asyncgens()
closed
",
        &globals,
    )
    .unwrap();
    assert_eq!(repr(&rt, &value), "['fine']");
    let logs = host.take_logs().join("\n");
    assert!(
        logs.contains("an error occurred during closing of asynchronous generator"),
        "logs: {logs}"
    );
    assert!(logs.contains("ValueError: close failed"), "logs: {logs}");
}

/// With a timeout, slow closes are abandoned and reported.
#[test]
fn shutdown_timeout_reports_laggards() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    run(
        &host,
        &rt,
        r"
import asyncio
async def stubborn():
    try:
        yield 1
    finally:
        await asyncio.sleep(10)
agen = stubborn()
await agen.__anext__()
await asyncio.get_running_loop().shutdown_asyncgens(timeout=0.1)
",
        &globals,
    )
    .unwrap();
    let logs = host.take_logs().join("\n");
    assert!(logs.contains("was not closed within the 0.1s timeout"), "logs: {logs}");
    assert!(rt.host().now() < 1.0, "shutdown did not wait for the slow close");
}

// ============================================================================
// hook stewardship
// ============================================================================

/// The loop installs its hooks while running tasks and restores the previous ones on shutdown.
#[test]
fn hooks_restored_after_shutdown() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    exec(
        &rt,
        "import sys\nseen = []\ndef mine(agen):\n    seen.append(agen)\nsys.set_asyncgen_hooks(firstiter=mine)",
        &globals,
    )
    .unwrap();
    let installed = exec(&rt, "sys.get_asyncgen_hooks()[0] is mine", &globals).unwrap();
    assert_eq!(repr(&rt, &installed), "True");

    let value = run(
        &host,
        &rt,
        r"
import asyncio
during = sys.get_asyncgen_hooks()[0] is not mine
await asyncio.get_running_loop().shutdown_asyncgens()
after = sys.get_asyncgen_hooks()
(during, after[0] is mine, after[1])
",
        &globals,
    )
    .unwrap();
    assert_eq!(repr(&rt, &value), "(True, True, None)");
}

/// A second shutdown after the hooks are restored stays quiet.
#[test]
fn repeated_shutdown_is_quiet() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    run(
        &host,
        &rt,
        "import asyncio\nloop = asyncio.get_running_loop()\nawait loop.shutdown_asyncgens()\nawait loop.shutdown_asyncgens()\nawait loop.shutdown_asyncgens()",
        &globals,
    )
    .unwrap();
    assert!(rt.take_warnings().is_empty());
    assert!(host.take_logs().is_empty());
}

/// Non-callable hooks are rejected.
#[test]
fn set_asyncgen_hooks_validates() {
    let (_host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let err = exec(&rt, "import sys\nsys.set_asyncgen_hooks(firstiter=42)", &globals).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TypeError);
    assert!(err.message().contains("callable firstiter expected"), "{}", err.message());
}

/// Closing the loop with live generators recommends `shutdown_asyncgens`.
#[test]
fn close_with_live_generators_warns() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    exec(&rt, GENERATOR, &globals).unwrap();
    run(&host, &rt, "agen = g()\nawait agen.__anext__()", &globals).unwrap();
    assert_eq!(rt.event_loop().asyncgen_count(), 1);

    rt.event_loop().close().unwrap();
    let warnings = rt.take_warnings();
    assert_eq!(warnings.len(), 1, "{warnings:?}");
    assert_eq!(warnings[0].category, ExcType::ResourceWarning);
    assert!(warnings[0].message.contains("shutdown_asyncgens"), "{}", warnings[0].message);
}
