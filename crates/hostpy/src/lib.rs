#![doc = include_str!("../../../README.md")]
#![expect(clippy::needless_pass_by_value, reason = "call APIs pass values consistently")]
#![expect(clippy::unnecessary_wraps, reason = "dispatch signatures are uniform")]
#![expect(clippy::type_complexity, reason = "callback types are intentionally rich")]
#![expect(clippy::float_cmp, reason = "Python float equality is exact")]

mod args;
mod attrs;
mod builtins;
mod compile;
mod compiler;
mod console;
mod eval;
mod exception;
mod expressions;
mod fstring;
mod host;
mod io;
mod methods;
mod modules;
mod ops;
mod parse;
mod runner;
mod runtime;
mod syncify;
mod transform;
mod types;
mod value;
mod webloop;

pub use crate::{
    args::Args,
    compile::{Code, CodeInfo, CompileFlags, CompileMode},
    compiler::IncrementalCompiler,
    console::{COMPLETER_WORD_BREAK_CHARACTERS, Console, ConsoleFuture, ConsoleOptions, SyntaxCheck},
    exception::{ExcType, Exception, RunResult, SyntaxLocation, TraceEntry},
    expressions::Module,
    host::{Host, LocalHost, SuspendReason, TimerToken, WakeToken},
    io::{ReadCallback, RedirectGuard, StreamRedirection, TextStream, WriteCallback},
    parse::{SourceScan, dedent},
    runner::{CodeRunner, RunnerOptions, eval_code, eval_code_async, find_imports, repr_shorten},
    runtime::{DEFAULT_MAX_RECURSION_DEPTH, Runtime, RuntimeOptions, RuntimeWeak, WarningRecord},
    syncify::{AwaitableTask, SleepTask, Syncifier, SyncifyableGather, SyncifyableTask, TrivialSyncifier, syncify},
    transform::{EVAL_RESULT_NAME, ReturnMode, should_quiet},
    types::{AsyncGenerator, Coroutine, Dict, ModuleObj, NativeFunction},
    value::{DictRef, Type, Value},
    webloop::{
        AsyncLock, FutureState, Handle, LoopEvent, LoopTracer, NoopLoopTracer, PyFuture, RecordingLoopTracer,
        StderrLoopTracer, Task, WebLoop,
    },
};
