use std::{
    cell::{Cell, RefCell},
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll, Waker},
};

use crate::{
    args::Args,
    exception::{ExcType, Exception, RunResult},
    runtime::RuntimeWeak,
    types::{Coroutine, LocalBoxFuture},
    value::Value,
};

/// What a suspended generator is resumed with.
pub(crate) enum Resume {
    Send(Value),
    Throw(Exception),
}

/// Outcome of resuming a generator.
pub(crate) enum GenStep {
    Yielded(Value),
    Returned(Value),
}

/// Slots shared between a generator handle and its running body.
///
/// `yield` stores the produced value in `yielded` and suspends; the driver fills `resume` before
/// polling the body again.
#[derive(Default)]
pub(crate) struct GenChannel {
    resume: RefCell<Option<Resume>>,
    yielded: RefCell<Option<Value>>,
}

impl GenChannel {
    pub(crate) fn yield_value(self: &Rc<Self>, value: Value) -> YieldPoint {
        YieldPoint {
            channel: self.clone(),
            value: Some(value),
        }
    }

    fn clear(&self) {
        let resume = self.resume.borrow_mut().take();
        let yielded = self.yielded.borrow_mut().take();
        drop((resume, yielded));
    }
}

/// The future behind a `yield` expression.
pub(crate) struct YieldPoint {
    channel: Rc<GenChannel>,
    value: Option<Value>,
}

impl Future for YieldPoint {
    type Output = RunResult<Value>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(value) = self.value.take() {
            *self.channel.yielded.borrow_mut() = Some(value);
            return Poll::Pending;
        }
        let resume = self.channel.resume.borrow_mut().take();
        match resume {
            Some(Resume::Send(value)) => Poll::Ready(Ok(value)),
            Some(Resume::Throw(exc)) => Poll::Ready(Err(exc)),
            None => Poll::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GenState {
    Created,
    Suspended,
    Running,
    /// An async generator body is waiting on an awaitable, not on a `yield`.
    Awaiting,
    Finished,
}

/// State shared by generators and async generators.
pub(crate) struct GenCore {
    qualname: Rc<str>,
    channel: Rc<GenChannel>,
    body: RefCell<Option<LocalBoxFuture<'static, RunResult<Value>>>>,
    state: Cell<GenState>,
}

impl GenCore {
    pub(crate) fn new(qualname: Rc<str>, channel: Rc<GenChannel>, body: LocalBoxFuture<'static, RunResult<Value>>) -> Self {
        Self {
            qualname,
            channel,
            body: RefCell::new(Some(body)),
            state: Cell::new(GenState::Created),
        }
    }

    pub(crate) fn state(&self) -> GenState {
        self.state.get()
    }

    fn finish(&self) {
        self.state.set(GenState::Finished);
        let body = self.body.borrow_mut().take();
        drop(body);
        self.channel.clear();
    }

    /// Polls the body once, delivering `resume` first when given.
    fn step(&self, resume: Option<Resume>, cx: &mut Context<'_>) -> Poll<RunResult<GenStep>> {
        if let Some(resume) = resume {
            match self.state.get() {
                GenState::Created => match resume {
                    Resume::Send(value) if !value.is_none() => {
                        return Poll::Ready(Err(
                            ExcType::TypeError.msg("can't send non-None value to a just-started generator")
                        ));
                    }
                    Resume::Throw(exc) => {
                        self.finish();
                        return Poll::Ready(Err(exc));
                    }
                    Resume::Send(_) => {}
                },
                GenState::Suspended => *self.channel.resume.borrow_mut() = Some(resume),
                GenState::Running | GenState::Awaiting => {
                    return Poll::Ready(Err(ExcType::ValueError.msg("generator already executing")));
                }
                GenState::Finished => {
                    return Poll::Ready(match resume {
                        Resume::Send(_) => Ok(GenStep::Returned(Value::None)),
                        Resume::Throw(exc) => Err(exc),
                    });
                }
            }
        }
        let body = self.body.borrow_mut().take();
        let Some(mut body) = body else {
            self.state.set(GenState::Finished);
            return Poll::Ready(Ok(GenStep::Returned(Value::None)));
        };
        self.state.set(GenState::Running);
        match body.as_mut().poll(cx) {
            Poll::Ready(result) => {
                drop(body);
                self.finish();
                Poll::Ready(result.map(GenStep::Returned))
            }
            Poll::Pending => {
                *self.body.borrow_mut() = Some(body);
                let yielded = self.channel.yielded.borrow_mut().take();
                if let Some(value) = yielded {
                    self.state.set(GenState::Suspended);
                    Poll::Ready(Ok(GenStep::Yielded(value)))
                } else {
                    self.state.set(GenState::Awaiting);
                    Poll::Pending
                }
            }
        }
    }
}

/// A generator object.
///
/// Generators are driven synchronously. One that is dropped while suspended is discarded without
/// running its `finally` blocks; call `close()` to run them.
#[derive(Clone)]
pub struct Generator(Rc<GenCore>);

impl Generator {
    pub(crate) fn new(core: GenCore) -> Self {
        Self(Rc::new(core))
    }

    #[must_use]
    pub fn qualname(&self) -> &str {
        &self.0.qualname
    }

    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.0).cast::<()>() as usize
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.0.state() == GenState::Running
    }

    pub(crate) fn resume(&self, resume: Resume) -> RunResult<GenStep> {
        let mut cx = Context::from_waker(Waker::noop());
        match self.0.step(Some(resume), &mut cx) {
            Poll::Ready(Ok(step)) => Ok(step),
            Poll::Ready(Err(exc)) if exc.exc_type() == ExcType::StopIteration => {
                let err = ExcType::RuntimeError.msg("generator raised StopIteration");
                err.set_cause(Some(exc));
                Err(err)
            }
            Poll::Ready(Err(exc)) => Err(exc),
            Poll::Pending => {
                self.0.finish();
                Err(ExcType::RuntimeError.msg("generator suspended on an awaitable"))
            }
        }
    }

    /// Advances the generator; `None` once it is exhausted.
    pub fn next(&self) -> RunResult<Option<Value>> {
        match self.resume(Resume::Send(Value::None))? {
            GenStep::Yielded(v) => Ok(Some(v)),
            GenStep::Returned(_) => Ok(None),
        }
    }

    pub fn send(&self, value: Value) -> RunResult<Value> {
        step_to_value(self.resume(Resume::Send(value))?)
    }

    pub fn throw(&self, exc: Exception) -> RunResult<Value> {
        step_to_value(self.resume(Resume::Throw(exc))?)
    }

    /// Raises `GeneratorExit` inside the generator so its cleanup runs.
    pub fn close(&self) -> RunResult<()> {
        match self.0.state() {
            GenState::Created => {
                self.0.finish();
                Ok(())
            }
            GenState::Finished => Ok(()),
            _ => match self.resume(Resume::Throw(ExcType::GeneratorExit.bare())) {
                Ok(GenStep::Yielded(_)) => Err(ExcType::RuntimeError.msg("generator ignored GeneratorExit")),
                Ok(GenStep::Returned(_)) => Ok(()),
                Err(e) if e.exc_type() == ExcType::GeneratorExit => Ok(()),
                Err(e) => Err(e),
            },
        }
    }
}

fn step_to_value(step: GenStep) -> RunResult<Value> {
    match step {
        GenStep::Yielded(v) => Ok(v),
        GenStep::Returned(v) => Err(stop_iteration(v)),
    }
}

/// `StopIteration` carrying a generator's return value.
pub(crate) fn stop_iteration(value: Value) -> Exception {
    if value.is_none() {
        ExcType::StopIteration.bare()
    } else {
        Exception::new(ExcType::StopIteration, vec![value])
    }
}

pub(crate) struct AsyncGenCore {
    gen: GenCore,
    hooks_inited: Cell<bool>,
    /// Finalizer hook captured the first time the generator was iterated.
    finalizer: RefCell<Option<Value>>,
    runtime: RuntimeWeak,
}

pub(crate) struct AsyncGenHandle {
    core: Rc<AsyncGenCore>,
    /// Handles created for the finalizer hook do not call it again.
    resurrected: bool,
}

impl Drop for AsyncGenHandle {
    fn drop(&mut self) {
        if self.resurrected || !matches!(self.core.gen.state(), GenState::Created | GenState::Suspended) {
            return;
        }
        let finalizer = self.core.finalizer.borrow_mut().take();
        let (Some(finalizer), Some(runtime)) = (finalizer, self.core.runtime.upgrade()) else {
            return;
        };
        let handle = AsyncGenerator(Rc::new(Self {
            core: self.core.clone(),
            resurrected: true,
        }));
        if let Err(exc) = runtime.call(&finalizer, Args::one(Value::AsyncGenerator(handle))) {
            runtime.report_unraisable(&exc, "Exception ignored in async generator finalizer");
        }
    }
}

/// An async generator object.
///
/// Its first `asend` / `athrow` / `aclose` reads the runtime's async generator hooks: the
/// `firstiter` hook is called right away and the `finalizer` hook is kept until the generator is
/// dropped while suspended.
#[derive(Clone)]
pub struct AsyncGenerator(Rc<AsyncGenHandle>);

/// Non-owning reference to an async generator, for loop bookkeeping.
#[derive(Clone)]
pub struct WeakAsyncGenerator(Weak<AsyncGenHandle>);

impl WeakAsyncGenerator {
    #[must_use]
    pub fn upgrade(&self) -> Option<AsyncGenerator> {
        self.0.upgrade().map(AsyncGenerator)
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }

    /// True if both refer to the same generator object.
    #[must_use]
    pub fn refers_to(&self, agen: &AsyncGenerator) -> bool {
        self.0
            .upgrade()
            .is_some_and(|h| Rc::ptr_eq(&h.core, &agen.0.core))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgenOp {
    Send,
    Throw,
    Close,
}

impl AsyncGenerator {
    pub(crate) fn new(core: GenCore, runtime: RuntimeWeak) -> Self {
        Self(Rc::new(AsyncGenHandle {
            core: Rc::new(AsyncGenCore {
                gen: core,
                hooks_inited: Cell::new(false),
                finalizer: RefCell::new(None),
                runtime,
            }),
            resurrected: false,
        }))
    }

    #[must_use]
    pub fn qualname(&self) -> &str {
        &self.0.core.gen.qualname
    }

    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.0.core).cast::<()>() as usize
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakAsyncGenerator {
        WeakAsyncGenerator(Rc::downgrade(&self.0))
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.0.core.gen.state() == GenState::Finished
    }

    /// `ag_running`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.0.core.gen.state(), GenState::Running | GenState::Awaiting)
    }

    fn init_hooks(&self) -> RunResult<()> {
        let core = &self.0.core;
        if core.hooks_inited.replace(true) {
            return Ok(());
        }
        let Some(runtime) = core.runtime.upgrade() else {
            return Ok(());
        };
        let (firstiter, finalizer) = runtime.asyncgen_hooks();
        if !finalizer.is_none() {
            *core.finalizer.borrow_mut() = Some(finalizer);
        }
        if !firstiter.is_none() {
            runtime.call(&firstiter, Args::one(Value::AsyncGenerator(self.clone())))?;
        }
        Ok(())
    }

    fn op(&self, op: AgenOp, resume: Resume, name: &'static str) -> RunResult<Coroutine> {
        self.init_hooks()?;
        let future = AgenFuture {
            agen: self.clone(),
            op,
            resume: Some(resume),
            started: false,
        };
        Ok(Coroutine::new(name, format!("{}.{name}", self.qualname()), Box::pin(future)))
    }

    /// `agen.__anext__()`.
    pub fn anext(&self) -> RunResult<Coroutine> {
        self.op(AgenOp::Send, Resume::Send(Value::None), "__anext__")
    }

    pub fn asend(&self, value: Value) -> RunResult<Coroutine> {
        self.op(AgenOp::Send, Resume::Send(value), "asend")
    }

    pub fn athrow(&self, exc: Exception) -> RunResult<Coroutine> {
        self.op(AgenOp::Throw, Resume::Throw(exc), "athrow")
    }

    pub fn aclose(&self) -> RunResult<Coroutine> {
        self.op(AgenOp::Close, Resume::Throw(ExcType::GeneratorExit.bare()), "aclose")
    }
}

/// The awaitable returned by `asend`, `athrow` and `aclose`.
struct AgenFuture {
    agen: AsyncGenerator,
    op: AgenOp,
    resume: Option<Resume>,
    started: bool,
}

impl Future for AgenFuture {
    type Output = RunResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let core = &this.agen.0.core.gen;
        let poll = if this.started {
            core.step(None, cx)
        } else {
            this.started = true;
            match (core.state(), this.op) {
                (GenState::Running | GenState::Awaiting, op) => {
                    let method = match op {
                        AgenOp::Send => "anext()",
                        AgenOp::Throw => "athrow()",
                        AgenOp::Close => "aclose()",
                    };
                    return Poll::Ready(Err(ExcType::RuntimeError.msg(format!(
                        "{method}: asynchronous generator is already running"
                    ))));
                }
                (GenState::Finished | GenState::Created, AgenOp::Close) => {
                    core.finish();
                    return Poll::Ready(Ok(Value::None));
                }
                (GenState::Finished, AgenOp::Send) => return Poll::Ready(Err(ExcType::StopAsyncIteration.bare())),
                _ => core.step(this.resume.take(), cx),
            }
        };
        let Poll::Ready(result) = poll else {
            return Poll::Pending;
        };
        Poll::Ready(match (result, this.op) {
            (Ok(GenStep::Yielded(_)), AgenOp::Close) => {
                Err(ExcType::RuntimeError.msg("async generator ignored GeneratorExit"))
            }
            (Ok(GenStep::Yielded(v)), _) => Ok(v),
            (Ok(GenStep::Returned(_)), AgenOp::Close) => Ok(Value::None),
            (Ok(GenStep::Returned(_)), _) => Err(ExcType::StopAsyncIteration.bare()),
            (Err(e), AgenOp::Close)
                if matches!(e.exc_type(), ExcType::GeneratorExit | ExcType::StopAsyncIteration) =>
            {
                Ok(Value::None)
            }
            (Err(e), _) if matches!(e.exc_type(), ExcType::StopAsyncIteration | ExcType::StopIteration) => {
                let err = ExcType::RuntimeError.msg(format!("async generator raised {}", e.exc_type()));
                err.set_cause(Some(e));
                Err(err)
            }
            (Err(e), _) => Err(e),
        })
    }
}
