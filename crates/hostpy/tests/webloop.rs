//! Tests for the host-driven event loop: timers, tasks, futures, gather, timeouts,
//! synchronization primitives, error reporting and tracing.

use std::{cell::RefCell, rc::Rc};

use hostpy::{
    DictRef, ExcType, LocalHost, LoopEvent, RecordingLoopTracer, RunResult, Runtime, RunnerOptions, Value,
    eval_code, eval_code_async,
};
use pretty_assertions::assert_eq;

fn runtime() -> (Rc<LocalHost>, Runtime) {
    let host = LocalHost::virtual_clock();
    let rt = Runtime::new(host.clone());
    (host, rt)
}

/// Runs `source` synchronously in `globals`.
fn exec(rt: &Runtime, source: &str, globals: &DictRef) -> RunResult<Value> {
    eval_code(rt, source, Some(globals.clone()), None, RunnerOptions::default())
}

/// Runs `source` as a task in `globals` and drives the host until nothing is pending.
fn run(host: &LocalHost, rt: &Runtime, source: &str, globals: &DictRef) -> RunResult<Value> {
    let coro = eval_code_async(rt, source, Some(globals.clone()), None, RunnerOptions::default())?;
    let task = rt.spawn(Value::Coroutine(coro))?;
    host.run_until_idle();
    task.result()
}

fn repr(rt: &Runtime, value: &Value) -> String {
    rt.repr(value).unwrap()
}

// ============================================================================
// timers
// ============================================================================

/// Timers fire in deadline order, and a cancelled timer never fires.
#[test]
fn call_later_order_and_cancel() {
    let (host, rt) = runtime();
    let event_loop = rt.event_loop();
    let fired = Rc::new(RefCell::new(Vec::new()));

    let log = fired.clone();
    let cb1 = event_loop
        .call_later_native(0.05, "cb1", move |_| {
            log.borrow_mut().push("cb1");
            Ok(())
        })
        .unwrap();
    let log = fired.clone();
    event_loop
        .call_later_native(0.01, "cb2", move |_| {
            log.borrow_mut().push("cb2");
            Ok(())
        })
        .unwrap();

    host.advance(20.0);
    assert_eq!(*fired.borrow(), vec!["cb2"], "cb2 fires first");
    cb1.cancel();
    assert!(cb1.cancelled());
    host.run_until_idle();
    host.advance(100.0);
    assert_eq!(*fired.borrow(), vec!["cb2"], "cancelled cb1 never fires");
}

/// Callbacks are not run before their delay has elapsed.
#[test]
fn call_later_waits_for_deadline() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    exec(
        &rt,
        "import asyncio\nfired = []\nloop = asyncio.get_event_loop()\nh = loop.call_later(0.5, fired.append, 'late')",
        &globals,
    )
    .unwrap();
    host.advance(499.0);
    assert_eq!(repr(&rt, &exec(&rt, "fired", &globals).unwrap()), "[]");
    host.advance(2.0);
    assert_eq!(repr(&rt, &exec(&rt, "fired", &globals).unwrap()), "['late']");
    host.advance(1000.0);
    assert_eq!(repr(&rt, &exec(&rt, "fired", &globals).unwrap()), "['late']", "fires exactly once");
}

/// `call_soon` callbacks run in FIFO order before later timers.
#[test]
fn call_soon_fifo() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    exec(
        &rt,
        r"
import asyncio
order = []
loop = asyncio.get_event_loop()
loop.call_later(0, order.append, 'timer')
loop.call_soon(order.append, 1)
loop.call_soon(order.append, 2)
loop.call_soon_threadsafe(order.append, 3)
",
        &globals,
    )
    .unwrap();
    host.run_until_idle();
    assert_eq!(repr(&rt, &exec(&rt, "order", &globals).unwrap()), "[1, 2, 3, 'timer']");
}

/// Handle repr and `when` reflect scheduling.
#[test]
fn timer_handle_when() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let value = exec(
        &rt,
        "import asyncio\nloop = asyncio.get_event_loop()\nh = loop.call_later(2, print)\nh.when() - loop.time()",
        &globals,
    )
    .unwrap();
    assert!((value.as_float().unwrap() - 2.0).abs() < 1e-9);
    exec(&rt, "h.cancel(); h.cancel()", &globals).unwrap();
    assert!(matches!(exec(&rt, "h.cancelled()", &globals).unwrap(), Value::Bool(true)));
    host.run_until_idle();
}

/// A timer that already fired no longer counts as cancelled in the heap.
#[test]
fn cancelling_a_fired_timer_leaves_heap_alone() {
    let (host, rt) = runtime();
    let event_loop = rt.event_loop();
    let early = event_loop.call_later_native(0.01, "early", |_| Ok(())).unwrap();
    let late1 = event_loop.call_later_native(1.0, "late1", |_| Ok(())).unwrap();
    let _late2 = event_loop.call_later_native(2.0, "late2", |_| Ok(())).unwrap();
    host.advance(20.0);
    assert_eq!(event_loop.scheduled_timer_count(), 2, "early left the heap when it fired");

    early.cancel();
    late1.cancel();
    assert_eq!(
        event_loop.scheduled_timer_count(),
        2,
        "one cancelled of two is below the purge ratio"
    );
}

/// Cancelled timers are purged once they outnumber live ones two to one.
#[test]
fn cancelled_timers_purged_lazily() {
    let (host, rt) = runtime();
    let event_loop = rt.event_loop();
    let handles: Vec<_> = (1..=10)
        .map(|i| {
            event_loop
                .call_later_native(f64::from(i), "timer", |_| Ok(()))
                .unwrap()
        })
        .collect();
    for handle in &handles[..6] {
        handle.cancel();
    }
    assert_eq!(event_loop.scheduled_timer_count(), 10, "six cancelled of ten stay queued");
    handles[6].cancel();
    assert_eq!(event_loop.scheduled_timer_count(), 3, "seventh cancel purges the heap");
    handles[6].cancel();
    assert_eq!(event_loop.scheduled_timer_count(), 3, "cancel is idempotent");
    host.run_until_idle();
    assert_eq!(event_loop.scheduled_timer_count(), 0);
}

// ============================================================================
// tasks and futures
// ============================================================================

/// Tasks run concurrently and sleep on the virtual clock.
#[test]
fn tasks_interleave() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let value = run(
        &host,
        &rt,
        r"
import asyncio
log = []
async def worker(name, delay):
    await asyncio.sleep(delay)
    log.append(name)
    return name.upper()

a = asyncio.create_task(worker('slow', 0.2), name='slow-task')
b = asyncio.create_task(worker('fast', 0.1))
results = [await a, await b]
(a.get_name(), results, log)
",
        &globals,
    )
    .unwrap();
    assert_eq!(repr(&rt, &value), "('slow-task', ['SLOW', 'FAST'], ['fast', 'slow'])");
}

/// `create_task` rejects non-coroutines.
#[test]
fn create_task_requires_coroutine() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let err = run(&host, &rt, "import asyncio\nasyncio.create_task(42)", &globals).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TypeError);
    assert!(err.message().contains("a coroutine was expected"), "{}", err.message());
}

/// Futures resolve awaiting tasks; settling twice is an error.
#[test]
fn future_result_and_state_errors() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let value = run(
        &host,
        &rt,
        r"
import asyncio
loop = asyncio.get_running_loop()
fut = loop.create_future()
loop.call_later(0.1, fut.set_result, 'ready')
value = await fut
try:
    fut.set_result('again')
    error = None
except asyncio.InvalidStateError:
    error = 'invalid'
(value, fut.done(), error)
",
        &globals,
    )
    .unwrap();
    assert_eq!(repr(&rt, &value), "('ready', True, 'invalid')");
}

/// Done callbacks receive the future and run after it settles.
#[test]
fn done_callbacks() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let value = run(
        &host,
        &rt,
        r"
import asyncio
seen = []
fut = asyncio.get_running_loop().create_future()
def unused(f):
    seen.append('unused')
fut.add_done_callback(lambda f: seen.append(f.result()))
fut.add_done_callback(unused)
removed = fut.remove_done_callback(unused)
fut.set_result(5)
await asyncio.sleep(0)
(seen, removed)
",
        &globals,
    )
    .unwrap();
    assert_eq!(repr(&rt, &value), "([5], 1)");
}

/// `then`, `catch` and `finally_` chain new futures.
#[test]
fn future_then_catch_finally() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let value = run(
        &host,
        &rt,
        r"
import asyncio
loop = asyncio.get_running_loop()
ok = loop.create_future()
bad = loop.create_future()
cleanup = []
doubled = ok.then(lambda v: v * 2)
recovered = bad.catch(lambda e: type(e).__name__)
finished = ok.finally_(lambda: cleanup.append('done'))
ok.set_result(21)
bad.set_exception(KeyError('k'))
(await doubled, await recovered, await finished, cleanup)
",
        &globals,
    )
    .unwrap();
    assert_eq!(repr(&rt, &value), "(42, 'KeyError', 21, ['done'])");
}

/// Cancelling a task raises `CancelledError` inside it; the task may catch it.
#[test]
fn task_cancellation() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let value = run(
        &host,
        &rt,
        r"
import asyncio
events = []
async def sleeper():
    try:
        await asyncio.sleep(10)
    except asyncio.CancelledError:
        events.append('cancelled')
        raise

task = asyncio.create_task(sleeper())
await asyncio.sleep(0)
task.cancel()
try:
    await task
except asyncio.CancelledError:
    events.append('outer')
(events, task.cancelled())
",
        &globals,
    )
    .unwrap();
    assert_eq!(repr(&rt, &value), "(['cancelled', 'outer'], True)");
}

/// `current_task` is the running task; `get_running_loop` fails outside one.
#[test]
fn current_task_and_running_loop() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let value = run(
        &host,
        &rt,
        "import asyncio\nt = asyncio.current_task()\n(t is not None, asyncio.get_running_loop() is asyncio.get_event_loop())",
        &globals,
    )
    .unwrap();
    assert_eq!(repr(&rt, &value), "(True, True)");

    let err = exec(&rt, "asyncio.get_running_loop()", &globals).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::RuntimeError);
    assert_eq!(err.message(), "no running event loop");
}

// ============================================================================
// gather and wait_for
// ============================================================================

/// `gather` keeps argument order whatever order children finish in.
#[test]
fn gather_preserves_order() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let value = run(
        &host,
        &rt,
        r"
import asyncio
async def after(delay, value):
    await asyncio.sleep(delay)
    return value
await asyncio.gather(after(0.3, 'a'), after(0.1, 'b'), after(0.2, 'c'))
",
        &globals,
    )
    .unwrap();
    assert_eq!(repr(&rt, &value), "['a', 'b', 'c']");
}

/// The first failure propagates unless `return_exceptions` is set.
#[test]
fn gather_exceptions() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let value = run(
        &host,
        &rt,
        r"
import asyncio
async def fail():
    raise ValueError('nope')
async def fine():
    return 1
try:
    await asyncio.gather(fine(), fail())
    first = None
except ValueError as e:
    first = str(e)
results = await asyncio.gather(fine(), fail(), return_exceptions=True)
(first, results[0], type(results[1]).__name__, await asyncio.gather())
",
        &globals,
    )
    .unwrap();
    assert_eq!(repr(&rt, &value), "('nope', 1, 'ValueError', [])");
}

/// `wait_for` raises `TimeoutError` and cancels the slow awaitable.
#[test]
fn wait_for_timeout() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let value = run(
        &host,
        &rt,
        r"
import asyncio, time
state = []
async def slow():
    try:
        await asyncio.sleep(5)
    except asyncio.CancelledError:
        state.append('cancelled')
        raise
start = time.monotonic()
try:
    await asyncio.wait_for(slow(), 0.5)
except asyncio.TimeoutError:
    state.append('timeout')
fast = await asyncio.wait_for(asyncio.sleep(0.1, 'quick'), 1)
(state, fast, round(time.monotonic() - start, 3))
",
        &globals,
    )
    .unwrap();
    assert_eq!(repr(&rt, &value), "(['cancelled', 'timeout'], 'quick', 0.6)");
}

// ============================================================================
// Lock, Event, Queue
// ============================================================================

/// A lock admits one holder at a time, in arrival order.
#[test]
fn lock_serializes() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let value = run(
        &host,
        &rt,
        r"
import asyncio
lock = asyncio.Lock()
log = []
async def hold(name):
    async with lock:
        log.append(name + '+')
        await asyncio.sleep(0.1)
        log.append(name + '-')
await asyncio.gather(hold('a'), hold('b'))
(log, lock.locked())
",
        &globals,
    )
    .unwrap();
    assert_eq!(repr(&rt, &value), "(['a+', 'a-', 'b+', 'b-'], False)");
}

/// `Event.wait` returns once the event is set.
#[test]
fn event_wakes_waiters() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let value = run(
        &host,
        &rt,
        r"
import asyncio
event = asyncio.Event()
woken = []
async def waiter(n):
    await event.wait()
    woken.append(n)
tasks = [asyncio.create_task(waiter(i)) for i in range(3)]
await asyncio.sleep(0.1)
before = list(woken)
event.set()
await asyncio.gather(*tasks)
(before, sorted(woken), event.is_set())
",
        &globals,
    )
    .unwrap();
    assert_eq!(repr(&rt, &value), "([], [0, 1, 2], True)");
}

/// A bounded queue hands items from producer to consumer in order.
#[test]
fn queue_producer_consumer() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let value = run(
        &host,
        &rt,
        r"
import asyncio
queue = asyncio.Queue(maxsize=1)
received = []
async def producer():
    for i in range(3):
        await queue.put(i)
    await queue.put(None)
async def consumer():
    while (item := await queue.get()) is not None:
        received.append(item)
        queue.task_done()
    queue.task_done()
await asyncio.gather(producer(), consumer())
await queue.join()
try:
    queue.get_nowait()
    empty = False
except asyncio.QueueEmpty:
    empty = True
(received, empty)
",
        &globals,
    )
    .unwrap();
    assert_eq!(repr(&rt, &value), "([0, 1, 2], True)");
}

// ============================================================================
// running and stopping
// ============================================================================

/// `run_until_complete` hands back the pending task instead of blocking.
#[test]
fn run_until_complete_returns_pending_task() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let value = exec(
        &rt,
        r"
import asyncio
async def answer():
    await asyncio.sleep(0.5)
    return 42
loop = asyncio.get_event_loop()
t = loop.run_until_complete(answer())
(t.done(), loop.is_running())
",
        &globals,
    )
    .unwrap();
    assert_eq!(repr(&rt, &value), "(False, True)", "scheduled, not awaited");
    host.run_until_idle();
    assert_eq!(repr(&rt, &exec(&rt, "t.result()", &globals).unwrap()), "42");
}

/// `run_forever` on a running loop is a no-op.
#[test]
fn run_forever_twice() {
    let (_host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let value = exec(
        &rt,
        "import asyncio\nloop = asyncio.get_event_loop()\nloop.run_forever()\nloop.run_forever()\nloop.is_running()",
        &globals,
    )
    .unwrap();
    assert_eq!(repr(&rt, &value), "True");
}

/// After `stop()` the loop quiesces; `run_forever` picks the queued callbacks back up.
#[test]
fn stop_quiesces_until_restarted() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    exec(
        &rt,
        r"
import asyncio
ran = []
loop = asyncio.get_event_loop()
loop.run_forever()
loop.stop()
loop.call_soon(ran.append, 'soon')
",
        &globals,
    )
    .unwrap();
    host.run_until_idle();
    assert_eq!(repr(&rt, &exec(&rt, "(ran, loop.is_running())", &globals).unwrap()), "([], False)");

    exec(&rt, "loop.run_forever()", &globals).unwrap();
    host.run_until_idle();
    assert_eq!(repr(&rt, &exec(&rt, "(ran, loop.is_running())", &globals).unwrap()), "(['soon'], True)");
}

/// Timers pending across a stop fire once the loop runs again.
#[test]
fn restart_reschedules_pending_timers() {
    let (host, rt) = runtime();
    let event_loop = rt.event_loop();
    let fired = Rc::new(RefCell::new(false));
    let flag = fired.clone();
    event_loop
        .call_later_native(1.0, "late", move |_| {
            *flag.borrow_mut() = true;
            Ok(())
        })
        .unwrap();
    event_loop.run_forever().unwrap();
    event_loop.stop();
    host.run_until_idle();
    assert!(!event_loop.is_running(), "stop took effect");
    assert_eq!(host.pending_timeouts(), 0, "no tick left behind");

    event_loop.run_forever().unwrap();
    host.advance(1000.0);
    assert!(*fired.borrow(), "timer fired after restart");
}

/// Scheduling in the past is rejected for both `call_later` and `call_at`.
#[test]
fn schedule_in_the_past_rejected() {
    let (_host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    exec(&rt, "import asyncio\nloop = asyncio.get_event_loop()", &globals).unwrap();

    let err = exec(&rt, "loop.call_later(-1, print)", &globals).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::ValueError);
    assert!(err.message().contains("Can't schedule in the past"), "{}", err.message());

    let err = exec(&rt, "loop.call_at(loop.time() - 1, print)", &globals).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::ValueError);
}

/// In debug mode the handler context carries the current task and a source traceback.
#[test]
fn debug_enriches_exception_context() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let source = r"
import asyncio
loop = asyncio.get_running_loop()
keys = []
loop.set_exception_handler(lambda loop, context: keys.append(sorted(context.keys())))
loop.call_exception_handler({'message': 'report'})
loop.set_exception_handler(None)
keys[0]
";
    let value = run(&host, &rt, source, &globals).unwrap();
    assert_eq!(repr(&rt, &value), "['message']", "debug off");

    rt.event_loop().set_debug(true);
    let value = run(&host, &rt, source, &globals).unwrap();
    assert_eq!(repr(&rt, &value), "['message', 'source_traceback', 'task']", "debug on");
}

// ============================================================================
// error reporting
// ============================================================================

/// A failed task nobody awaited is reported when it is dropped.
#[test]
fn unretrieved_task_exception_is_reported() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    run(
        &host,
        &rt,
        r"
import asyncio
async def boom():
    raise RuntimeError('lost')
asyncio.create_task(boom())
await asyncio.sleep(0.1)
",
        &globals,
    )
    .unwrap();
    host.run_until_idle();
    let logs = host.take_logs().join("\n");
    assert!(logs.contains("Task exception was never retrieved"), "logs: {logs}");
    assert!(logs.contains("RuntimeError: lost"), "logs: {logs}");
}

/// A custom exception handler receives the context instead of the host console.
#[test]
fn custom_exception_handler() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    let value = run(
        &host,
        &rt,
        r"
import asyncio
loop = asyncio.get_running_loop()
contexts = []
loop.set_exception_handler(lambda loop, context: contexts.append(context['message']))
loop.call_exception_handler({'message': 'custom report'})
loop.set_exception_handler(None)
contexts
",
        &globals,
    )
    .unwrap();
    assert_eq!(repr(&rt, &value), "['custom report']");
    assert!(host.take_logs().is_empty());
}

/// Exceptions raised by plain callbacks go to the exception handler, not the caller.
#[test]
fn callback_exception_is_reported() {
    let (host, rt) = runtime();
    let globals = rt.new_globals("__main__");
    exec(
        &rt,
        "import asyncio\ndef bad():\n    raise KeyError('cb')\nasyncio.get_event_loop().call_soon(bad)",
        &globals,
    )
    .unwrap();
    host.run_until_idle();
    let logs = host.take_logs().join("\n");
    assert!(logs.contains("KeyError"), "logs: {logs}");
}

// ============================================================================
// tracing
// ============================================================================

/// A recording tracer sees ticks, handles and task steps.
#[test]
fn recording_tracer() {
    let (host, rt) = runtime();
    let tracer = Rc::new(RecordingLoopTracer::new());
    rt.event_loop().set_tracer(tracer.clone());
    let globals = rt.new_globals("__main__");
    run(&host, &rt, "import asyncio\nawait asyncio.sleep(0.1)\n1", &globals).unwrap();

    let events = tracer.events();
    assert!(events.iter().any(|e| matches!(e, LoopEvent::TickStart { .. })), "{events:?}");
    assert!(events.iter().any(|e| matches!(e, LoopEvent::TimerScheduled { .. })), "{events:?}");
    assert!(
        events.iter().any(|e| matches!(e, LoopEvent::TaskStep { finished: true, .. })),
        "{events:?}"
    );
}
