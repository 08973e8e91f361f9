use std::{
    cell::{Cell, RefCell},
    io::{self, BufRead as _, Write as _},
    rc::Rc,
};

use crate::{
    exception::{ExcType, RunResult},
    runtime::Runtime,
    value::Value,
};

/// Receives text written to a redirected `sys.stdout` / `sys.stderr`.
pub type WriteCallback = Rc<dyn Fn(&str)>;

/// Supplies lines for a redirected `sys.stdin`. Called with the `readline` size limit, if any.
pub type ReadCallback = Rc<dyn Fn(Option<usize>) -> String>;

enum StreamKind {
    Stdout,
    Stderr,
    Stdin,
    Writer(WriteCallback),
    Reader(ReadCallback),
    /// Collects everything written, for tests and captured output.
    Collect,
}

/// A text-mode file object as seen by Python code: `sys.stdout`, `sys.stderr` and `sys.stdin`.
///
/// The process streams buffer writes and emit complete lines, so warnings written to stderr
/// show up before partial stdout lines. Callback streams forward each write immediately.
pub struct TextStream {
    name: Rc<str>,
    kind: StreamKind,
    buffer: RefCell<String>,
}

impl TextStream {
    fn with_kind(name: impl Into<Rc<str>>, kind: StreamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            buffer: RefCell::new(String::new()),
        }
    }

    #[must_use]
    pub fn stdout() -> Self {
        Self::with_kind("<stdout>", StreamKind::Stdout)
    }

    #[must_use]
    pub fn stderr() -> Self {
        Self::with_kind("<stderr>", StreamKind::Stderr)
    }

    #[must_use]
    pub fn stdin() -> Self {
        Self::with_kind("<stdin>", StreamKind::Stdin)
    }

    /// An output stream that hands every write to `callback`.
    #[must_use]
    pub fn writer(name: impl Into<Rc<str>>, callback: WriteCallback) -> Self {
        Self::with_kind(name, StreamKind::Writer(callback))
    }

    /// An input stream whose `readline` calls `callback`.
    #[must_use]
    pub fn reader(name: impl Into<Rc<str>>, callback: ReadCallback) -> Self {
        Self::with_kind(name, StreamKind::Reader(callback))
    }

    /// An output stream that keeps what is written; see [`TextStream::contents`].
    #[must_use]
    pub fn collect(name: impl Into<Rc<str>>) -> Self {
        Self::with_kind(name, StreamKind::Collect)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_readable(&self) -> bool {
        matches!(self.kind, StreamKind::Stdin | StreamKind::Reader(_))
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        !self.is_readable()
    }

    pub fn write(&self, text: &str) {
        match &self.kind {
            StreamKind::Writer(callback) => callback(text),
            StreamKind::Stdout | StreamKind::Stderr => {
                let mut buffer = self.buffer.borrow_mut();
                buffer.push_str(text);
                if let Some(end) = buffer.rfind('\n') {
                    let lines: String = buffer.drain(..=end).collect();
                    drop(buffer);
                    self.emit(&lines);
                }
            }
            StreamKind::Collect => self.buffer.borrow_mut().push_str(text),
            StreamKind::Stdin | StreamKind::Reader(_) => {}
        }
    }

    /// Writes out any buffered partial line.
    pub fn flush(&self) {
        if matches!(self.kind, StreamKind::Stdout | StreamKind::Stderr) {
            let pending = std::mem::take(&mut *self.buffer.borrow_mut());
            if !pending.is_empty() {
                self.emit(&pending);
            }
        }
    }

    fn emit(&self, text: &str) {
        // write errors on the process streams have nowhere to go
        let _ = match self.kind {
            StreamKind::Stderr => io::stderr().write_all(text.as_bytes()).and_then(|()| io::stderr().flush()),
            _ => io::stdout().write_all(text.as_bytes()).and_then(|()| io::stdout().flush()),
        };
    }

    /// Everything written to a collecting stream so far.
    #[must_use]
    pub fn contents(&self) -> String {
        match self.kind {
            StreamKind::Collect => self.buffer.borrow().clone(),
            _ => String::new(),
        }
    }

    /// `readline()` with no size limit.
    pub fn readline(&self) -> RunResult<String> {
        self.readline_limit(None)
    }

    /// `readline(size)`: at most `limit` characters, including the newline.
    pub fn readline_limit(&self, limit: Option<usize>) -> RunResult<String> {
        let line = match &self.kind {
            StreamKind::Reader(callback) => callback(limit),
            StreamKind::Stdin => {
                let mut line = String::new();
                io::stdin()
                    .lock()
                    .read_line(&mut line)
                    .map_err(|err| ExcType::EOFError.msg(err.to_string()))?;
                line
            }
            _ => return Err(ExcType::ValueError.msg("not readable")),
        };
        Ok(match limit {
            Some(limit) => line.chars().take(limit).collect(),
            None => line,
        })
    }
}

impl Drop for TextStream {
    fn drop(&mut self) {
        self.flush();
    }
}

const STREAM_NAMES: [&str; 3] = ["stdin", "stdout", "stderr"];

/// Replacement `sys.stdin`, `sys.stdout` and `sys.stderr` backed by embedder callbacks.
///
/// Streams without a callback are left alone. The replacement streams take the `name` of the
/// streams they replace.
pub struct StreamRedirection {
    stdin: Option<ReadCallback>,
    stdout: Option<WriteCallback>,
    stderr: Option<WriteCallback>,
    /// Streams that were installed before ours, while a redirection is active.
    saved: RefCell<Option<Vec<(&'static str, Value)>>>,
    persistent: Cell<bool>,
}

impl StreamRedirection {
    #[must_use]
    pub fn new(stdin: Option<ReadCallback>, stdout: Option<WriteCallback>, stderr: Option<WriteCallback>) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
            saved: RefCell::new(None),
            persistent: Cell::new(false),
        }
    }

    /// True while the replacement streams are installed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.saved.borrow().is_some()
    }

    /// Installs the replacement streams until the returned guard is dropped.
    ///
    /// If a redirection is already active (nested call or persistent redirection) the guard
    /// does nothing and the active streams stay in place.
    #[must_use = "the streams are restored when the guard is dropped"]
    pub fn redirect_streams<'a>(&'a self, rt: &Runtime) -> RedirectGuard<'a> {
        if self.is_active() {
            return RedirectGuard { owner: None };
        }
        self.install(rt);
        RedirectGuard {
            owner: Some((self, rt.clone())),
        }
    }

    /// Installs the replacement streams until [`StreamRedirection::persistent_restore_streams`].
    pub fn persistent_redirect_streams(&self, rt: &Runtime) {
        if self.persistent.replace(true) || self.is_active() {
            return;
        }
        self.install(rt);
    }

    pub fn persistent_restore_streams(&self, rt: &Runtime) {
        if self.persistent.replace(false) {
            self.restore(rt);
        }
    }

    fn install(&self, rt: &Runtime) {
        let mut saved = Vec::with_capacity(3);
        for name in STREAM_NAMES {
            let current = rt.sys_stream(name);
            let stream_name = match &current {
                Value::Stream(s) => s.name().to_owned(),
                _ => format!("<{name}>"),
            };
            let replacement = match name {
                "stdin" => self.stdin.clone().map(|cb| TextStream::reader(stream_name, cb)),
                "stdout" => self.stdout.clone().map(|cb| TextStream::writer(stream_name, cb)),
                _ => self.stderr.clone().map(|cb| TextStream::writer(stream_name, cb)),
            };
            if let Some(stream) = replacement {
                rt.sys().set(name, Value::Stream(Rc::new(stream)));
                saved.push((name, current));
            }
        }
        *self.saved.borrow_mut() = Some(saved);
    }

    fn restore(&self, rt: &Runtime) {
        let saved = self.saved.borrow_mut().take();
        for (name, stream) in saved.into_iter().flatten() {
            flush_value(&rt.sys_stream(name));
            rt.sys().set(name, stream);
        }
    }
}

/// Restores the streams replaced by [`StreamRedirection::redirect_streams`] when dropped.
pub struct RedirectGuard<'a> {
    owner: Option<(&'a StreamRedirection, Runtime)>,
}

impl Drop for RedirectGuard<'_> {
    fn drop(&mut self) {
        if let Some((redirection, rt)) = self.owner.take() {
            redirection.restore(&rt);
        }
    }
}

/// Flushes a stream object if it is one of ours.
pub(crate) fn flush_value(stream: &Value) {
    if let Value::Stream(stream) = stream {
        stream.flush();
    }
}
