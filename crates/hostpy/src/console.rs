//! Interactive console: line buffering, incremental compilation, serialized execution and
//! tab completion.
//!
//! [`Console::push`] adds a line to the buffer and returns a [`ConsoleFuture`] that says right
//! away whether the buffered source is complete. Complete source runs as a task on the event
//! loop; the future resolves with the value of the last expression once it finishes.

use std::{cell::RefCell, fmt, rc::Rc};

use ahash::AHashSet;
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    builtins::is_callable,
    compile::CompileMode,
    compiler::IncrementalCompiler,
    eval::await_value,
    exception::{Exception, RunResult},
    io::{ReadCallback, RedirectGuard, StreamRedirection, WriteCallback, flush_value},
    modules::sys,
    runner::CodeRunner,
    runtime::Runtime,
    types::{Coroutine, Descriptor, Dict},
    value::{DictRef, Value},
    webloop::{AsyncLock, FutureState, PyFuture},
};

/// Characters that end the word being completed.
pub const COMPLETER_WORD_BREAK_CHARACTERS: &str = " \t\n`~!@#$%^&*()-=+[{]}\\|;:'\",<>/?";

/// Python keywords, then soft keywords, in the order completion offers them.
const KEYWORDS: [&str; 39] = [
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class", "continue", "def", "del",
    "elif", "else", "except", "finally", "for", "from", "global", "if", "import", "in", "is", "lambda", "nonlocal",
    "not", "or", "pass", "raise", "return", "try", "while", "with", "yield", "_", "case", "match", "type",
];

/// Result of checking buffered console input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum SyntaxCheck {
    /// More lines are needed.
    Incomplete,
    /// The source cannot be compiled.
    SyntaxError,
    /// The source compiled and was scheduled to run.
    Complete,
}

/// What [`Console::push`] and [`Console::runsource`] return.
///
/// For [`SyntaxCheck::Incomplete`] the future is already resolved with `None`; for
/// [`SyntaxCheck::SyntaxError`] it already holds the error. Otherwise it resolves when the code
/// has run.
#[derive(Clone)]
pub struct ConsoleFuture {
    future: PyFuture,
    syntax_check: SyntaxCheck,
    formatted_error: Rc<RefCell<Option<String>>>,
}

impl ConsoleFuture {
    #[must_use]
    pub fn syntax_check(&self) -> SyntaxCheck {
        self.syntax_check
    }

    /// The underlying loop future, awaitable from Python as a value.
    #[must_use]
    pub fn future(&self) -> &PyFuture {
        &self.future
    }

    #[must_use]
    pub fn done(&self) -> bool {
        self.future.done()
    }

    /// The value of the last expression, or the error raised while compiling or running.
    pub fn result(&self) -> RunResult<Value> {
        self.future.result()
    }

    /// The error as the console would print it: a trimmed traceback, or just the error line for
    /// syntax errors. `None` until the future has failed.
    #[must_use]
    pub fn formatted_error(&self) -> Option<String> {
        self.formatted_error.borrow().clone()
    }
}

impl fmt::Debug for ConsoleFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleFuture")
            .field("syntax_check", &self.syntax_check)
            .field("future", &self.future.repr())
            .finish()
    }
}

/// Construction options for [`Console`].
pub struct ConsoleOptions {
    /// Replaces `sys.stdin` while code runs.
    pub stdin_callback: Option<ReadCallback>,
    /// Replaces `sys.stdout` while code runs.
    pub stdout_callback: Option<WriteCallback>,
    /// Replaces `sys.stderr` while code runs.
    pub stderr_callback: Option<WriteCallback>,
    /// Keep the streams redirected from construction until
    /// [`Console::persistent_restore_streams`], instead of only while code runs.
    pub persistent_stream_redirection: bool,
    /// Filename recorded for console input.
    pub filename: String,
}

impl Default for ConsoleOptions {
    fn default() -> Self {
        Self {
            stdin_callback: None,
            stdout_callback: None,
            stderr_callback: None,
            persistent_stream_redirection: false,
            filename: "<console>".to_owned(),
        }
    }
}

/// An interactive Python console on top of a [`Runtime`].
///
/// Clones share the same buffer, namespace and lock.
#[derive(Clone)]
pub struct Console(Rc<ConsoleInner>);

struct ConsoleInner {
    rt: Runtime,
    globals: DictRef,
    buffer: RefCell<Vec<String>>,
    /// Serializes execution: code pushed later waits for earlier code to finish.
    lock: AsyncLock,
    redirection: StreamRedirection,
    compiler: IncrementalCompiler,
    filename: String,
    completer_word_break_characters: String,
}

impl Console {
    /// Creates a console. `globals` defaults to `{"__name__": "__console__", "__doc__": None}`.
    #[must_use]
    pub fn new(rt: &Runtime, globals: Option<DictRef>, options: ConsoleOptions) -> Self {
        let globals = globals.unwrap_or_else(|| {
            let mut dict = Dict::new();
            dict.set_str("__name__", Value::str("__console__"));
            dict.set_str("__doc__", Value::None);
            Rc::new(RefCell::new(dict))
        });
        let console = Self(Rc::new(ConsoleInner {
            rt: rt.clone(),
            globals,
            buffer: RefCell::new(Vec::new()),
            lock: AsyncLock::new(),
            redirection: StreamRedirection::new(options.stdin_callback, options.stdout_callback, options.stderr_callback),
            compiler: IncrementalCompiler::default(),
            filename: options.filename,
            completer_word_break_characters: COMPLETER_WORD_BREAK_CHARACTERS.to_owned(),
        }));
        if options.persistent_stream_redirection {
            console.persistent_redirect_streams();
        }
        console
    }

    /// The namespace console code runs in.
    #[must_use]
    pub fn globals(&self) -> &DictRef {
        &self.0.globals
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        &self.0.filename
    }

    /// Lines pushed since the last complete or failed input.
    #[must_use]
    pub fn buffer(&self) -> Vec<String> {
        self.0.buffer.borrow().clone()
    }

    /// Discards buffered incomplete input.
    pub fn reset_buffer(&self) {
        self.0.buffer.borrow_mut().clear();
    }

    /// Adds `line` to the buffer and tries to run the buffered source.
    ///
    /// The buffer is kept only while the input is incomplete.
    pub fn push(&self, line: &str) -> ConsoleFuture {
        let source = {
            let mut buffer = self.0.buffer.borrow_mut();
            buffer.push(line.to_owned());
            buffer.join("\n")
        };
        let result = self.runsource(&source, &self.0.filename);
        if result.syntax_check != SyntaxCheck::Incomplete {
            self.reset_buffer();
        }
        result
    }

    /// Compiles `source` in single-statement mode and schedules it if it is complete.
    pub fn runsource(&self, source: &str, filename: &str) -> ConsoleFuture {
        let rt = &self.0.rt;
        let future = rt.event_loop().create_future();
        let formatted_error = Rc::new(RefCell::new(None));
        let syntax_check = match self.0.compiler.compile(source, filename, CompileMode::Single) {
            Err(exc) => {
                *formatted_error.borrow_mut() = Some(self.formatsyntaxerror(&exc));
                let _ = future.set_exception(exc);
                SyntaxCheck::SyntaxError
            }
            Ok(None) => {
                let _ = future.set_result(Value::None);
                SyntaxCheck::Incomplete
            }
            Ok(Some(runner)) => {
                self.schedule(runner, &future, &formatted_error);
                SyntaxCheck::Complete
            }
        };
        ConsoleFuture {
            future,
            syntax_check,
            formatted_error,
        }
    }

    fn schedule(&self, runner: CodeRunner, result: &PyFuture, formatted_error: &Rc<RefCell<Option<String>>>) {
        let rt = &self.0.rt;
        let scheduled = rt
            .event_loop()
            .create_task(Value::Coroutine(self.runcode(runner)), None);
        let task = match scheduled {
            Ok(task) => task,
            Err(exc) => {
                *formatted_error.borrow_mut() = Some(self.formattraceback(&exc));
                let _ = result.set_exception(exc);
                return;
            }
        };
        let console = self.clone();
        let result = result.clone();
        let formatted_error = formatted_error.clone();
        task.future().on_done(move |_, done| {
            if result.done() {
                return Ok(());
            }
            match done.state() {
                FutureState::Finished(value) => result.set_result(value),
                FutureState::Failed(exc) => {
                    // mark the task's exception as retrieved; it moves to the console future
                    let _ = done.exception();
                    *formatted_error.borrow_mut() = Some(console.formattraceback(&exc));
                    result.set_exception(exc)
                }
                FutureState::Cancelled(message) => {
                    result.cancel(message);
                    Ok(())
                }
                FutureState::Pending => Ok(()),
            }
        });
    }

    /// Runs compiled console code once earlier code has finished, with the console's streams
    /// installed.
    fn runcode(&self, runner: CodeRunner) -> Coroutine {
        let inner = self.0.clone();
        Coroutine::from_future("runcode", async move {
            let rt = inner.rt.clone();
            inner.lock.acquire(&rt).await?;
            let outcome = {
                let _guard: RedirectGuard<'_> = inner.redirection.redirect_streams(&rt);
                let outcome = match runner.run_async(&rt, Some(inner.globals.clone()), None) {
                    Ok(coro) => await_value(&rt, Value::Coroutine(coro)).await,
                    Err(exc) => Err(exc),
                };
                flush_value(&rt.sys_stream("stdout"));
                flush_value(&rt.sys_stream("stderr"));
                outcome
            };
            inner.lock.release()?;
            outcome
        })
    }

    /// Formats a compile error without a traceback and records it in `sys.last_*`.
    #[must_use]
    pub fn formatsyntaxerror(&self, exc: &Exception) -> String {
        sys::set_last_exception(&self.0.rt, exc);
        self.0.rt.sys().set("last_traceback", Value::None);
        exc.format_exception_only()
    }

    /// Number of innermost frames that belong to console code: every frame from the first one
    /// whose filename is this console's (or `<console>` / `<exec>`).
    #[must_use]
    pub fn num_frames_to_keep(&self, exc: &Exception) -> usize {
        let frames = exc.traceback();
        frames
            .iter()
            .position(|frame| {
                let filename = frame.filename.as_ref();
                filename == "<console>" || filename == "<exec>" || filename == self.0.filename
            })
            .map_or(0, |first| frames.len() - first)
    }

    /// Formats a runtime error, dropping the frames of the machinery that ran it, and records it
    /// in `sys.last_*`.
    #[must_use]
    pub fn formattraceback(&self, exc: &Exception) -> String {
        sys::set_last_exception(&self.0.rt, exc);
        exc.format_traceback(Some(self.num_frames_to_keep(exc)))
    }

    /// Installs the console's streams until the guard is dropped.
    #[must_use = "the streams are restored when the guard is dropped"]
    pub fn redirect_streams(&self) -> RedirectGuard<'_> {
        self.0.redirection.redirect_streams(&self.0.rt)
    }

    pub fn persistent_redirect_streams(&self) {
        self.0.redirection.persistent_redirect_streams(&self.0.rt);
    }

    pub fn persistent_restore_streams(&self) {
        self.0.redirection.persistent_restore_streams(&self.0.rt);
    }

    /// Completions for the end of `source`, and the character index where the completed word
    /// starts.
    ///
    /// Names are completed from keywords, the console globals and builtins; `a.b.c` is completed
    /// from the attributes of `a.b`. Callables get a trailing `(`.
    #[must_use]
    pub fn complete(&self, source: &str) -> (Vec<String>, usize) {
        let breaks = &self.0.completer_word_break_characters;
        let start = source
            .chars()
            .enumerate()
            .filter(|(_, c)| breaks.contains(*c))
            .last()
            .map_or(0, |(index, _)| index + 1);
        let word: String = source.chars().skip(start).collect();
        let completions = if word.contains('.') {
            self.attr_matches(&word)
        } else {
            self.global_matches(&word)
        };
        (completions, start)
    }

    fn global_matches(&self, text: &str) -> Vec<String> {
        let mut matches = Vec::new();
        let mut seen: AHashSet<String> = AHashSet::new();
        for keyword in KEYWORDS.iter().filter(|k| k.starts_with(text)) {
            seen.insert((*keyword).to_owned());
            let word = match *keyword {
                "try" | "finally" => format!("{keyword}:"),
                "False" | "None" | "True" | "break" | "continue" | "pass" | "else" | "_" => (*keyword).to_owned(),
                _ => format!("{keyword} "),
            };
            matches.push(word);
        }
        for namespace in [&self.0.globals, self.0.rt.builtins()] {
            for (key, value) in namespace.borrow().items() {
                let Some(name) = key.as_str() else { continue };
                if name.starts_with(text) && name != "__builtins__" && seen.insert(name.to_owned()) {
                    matches.push(callable_postfix(&value, name.to_owned()));
                }
            }
        }
        matches
    }

    fn attr_matches(&self, text: &str) -> Vec<String> {
        let Some((expr, attr)) = split_attr_expr(text) else {
            return Vec::new();
        };
        let rt = &self.0.rt;
        let Some(object) = self.lookup_dotted(expr) else {
            return Vec::new();
        };
        let mut words: Vec<_> = rt.dir(&object);
        words.retain(|w| w.as_ref() != "__builtins__");
        if !words.iter().any(|w| w.as_ref() == "__class__") {
            words.push("__class__".into());
        }
        let class = match &object {
            Value::Instance(instance) => Some(instance.class.clone()),
            _ => None,
        };

        let mut noprefix = match attr {
            "" => Some("_"),
            "_" => Some("__"),
            _ => None,
        };
        let mut matches = Vec::new();
        loop {
            for word in &words {
                if !word.starts_with(attr) || noprefix.is_some_and(|prefix| word.starts_with(prefix)) {
                    continue;
                }
                let full = format!("{expr}.{word}");
                let is_property = class.as_ref().and_then(|c| c.lookup(word)).is_some_and(|attr| {
                    matches!(&attr, Value::Descriptor(d) if matches!(**d, Descriptor::Property { .. }))
                });
                if is_property {
                    matches.push(full);
                    continue;
                }
                match rt.getattr(&object, word) {
                    Ok(value) if !value.is_none() => matches.push(callable_postfix(&value, full)),
                    _ => matches.push(full),
                }
            }
            if !matches.is_empty() || noprefix.is_none() {
                break;
            }
            noprefix = if noprefix == Some("_") { Some("__") } else { None };
        }
        matches.sort();
        matches
    }

    /// Resolves `a.b.c` through the console globals, then builtins, then attribute access.
    fn lookup_dotted(&self, expr: &str) -> Option<Value> {
        let rt = &self.0.rt;
        let mut parts = expr.split('.');
        let first = parts.next()?;
        let mut object = self
            .0
            .globals
            .borrow()
            .get_str(first)
            .or_else(|| rt.builtins().borrow().get_str(first))?;
        for part in parts {
            object = rt.getattr(&object, part).ok()?;
        }
        Some(object)
    }
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console")
            .field("filename", &self.0.filename)
            .field("buffer", &self.0.buffer.borrow())
            .finish_non_exhaustive()
    }
}

fn callable_postfix(value: &Value, word: String) -> String {
    if is_callable(value) { word + "(" } else { word }
}

/// Splits `a.b.c` into `("a.b", "c")` when every part before the last is an identifier.
fn split_attr_expr(text: &str) -> Option<(&str, &str)> {
    let (expr, attr) = text.rsplit_once('.')?;
    let is_word = |part: &str| !part.is_empty() && part.chars().all(|c| c.is_alphanumeric() || c == '_');
    if !expr.split('.').all(is_word) || !attr.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    Some((expr, attr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_expressions() {
        assert_eq!(split_attr_expr("a.b.c"), Some(("a.b", "c")));
        assert_eq!(split_attr_expr("abc."), Some(("abc", "")));
        assert_eq!(split_attr_expr("a..b"), None);
        assert_eq!(split_attr_expr(".b"), None);
    }

    #[test]
    fn syntax_check_names() {
        assert_eq!(SyntaxCheck::SyntaxError.to_string(), "syntax-error");
        assert_eq!("incomplete".parse::<SyntaxCheck>().ok(), Some(SyntaxCheck::Incomplete));
    }
}
