//! Event loop tracing.
//!
//! The loop reports what it does through the [`LoopTracer`] trait. Every hook has an empty
//! default, so a tracer only implements the events it cares about.
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopLoopTracer`] | Default, records nothing |
//! | [`StderrLoopTracer`] | Human-readable loop log on stderr |
//! | [`RecordingLoopTracer`] | Collects [`LoopEvent`]s, used by tests |
//!
//! Tracers are shared with the loop through an `Rc`, so hooks take `&self` and keep their
//! state in cells:
//!
//! ```ignore
//! let tracer = Rc::new(RecordingLoopTracer::new());
//! runtime.event_loop().set_tracer(tracer.clone());
//! // ... drive the host ...
//! assert!(tracer.event_count() > 0);
//! ```

use std::cell::{Cell, RefCell};

/// Trace event emitted by the event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    /// A host timer fired and the loop started a tick.
    TickStart {
        /// Handles in the ready queue when the tick started.
        ready: usize,
    },
    /// The tick finished.
    TickEnd {
        /// Handles run during the tick.
        ran: usize,
        /// Delay of the next host timer in milliseconds, `None` if the loop went idle.
        next_delay_ms: Option<f64>,
    },
    /// A ready handle was run.
    HandleRun {
        /// `repr()` of the handle.
        handle: String,
    },
    /// A delayed handle was added to the timer heap.
    TimerScheduled {
        /// Loop time at which the handle is due.
        when: f64,
    },
    /// A task was advanced by one step.
    TaskStep {
        /// The task's name.
        name: String,
        /// True if the task finished during this step.
        finished: bool,
    },
    /// An exception context was passed to the exception handler.
    ExceptionContext {
        /// The context's `message` entry.
        message: String,
    },
}

/// Hooks called by the event loop.
pub trait LoopTracer {
    fn on_tick_start(&self, _ready: usize) {}

    fn on_tick_end(&self, _ran: usize, _next_delay_ms: Option<f64>) {}

    fn on_handle_run(&self, _handle: &str) {}

    fn on_timer_scheduled(&self, _when: f64) {}

    fn on_task_step(&self, _name: &str, _finished: bool) {}

    fn on_exception_context(&self, _message: &str) {}
}

// ============================================================================
// NoopLoopTracer
// ============================================================================

/// Tracer that ignores every event. Installed by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLoopTracer;

impl LoopTracer for NoopLoopTracer {}

// ============================================================================
// StderrLoopTracer
// ============================================================================

/// Tracer that prints one line per event to stderr.
///
/// Output format:
/// ```text
/// [tick] ready=2
///   run <Handle Task.step()>
///   step Task-1 done=false
///   timer when=1.500
/// [tick] ran=2 next=1000ms
/// ```
#[derive(Debug, Default)]
pub struct StderrLoopTracer {
    /// Maximum number of lines to print. `None` is unlimited.
    limit: Option<usize>,
    count: Cell<usize>,
}

impl StderrLoopTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops printing after `limit` lines.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            count: Cell::new(0),
        }
    }

    fn line(&self, text: &str) {
        let count = self.count.get();
        if self.limit.is_some_and(|limit| count >= limit) {
            return;
        }
        self.count.set(count + 1);
        eprintln!("{text}");
    }
}

impl LoopTracer for StderrLoopTracer {
    fn on_tick_start(&self, ready: usize) {
        self.line(&format!("[tick] ready={ready}"));
    }

    fn on_tick_end(&self, ran: usize, next_delay_ms: Option<f64>) {
        match next_delay_ms {
            Some(delay) => self.line(&format!("[tick] ran={ran} next={delay}ms")),
            None => self.line(&format!("[tick] ran={ran} idle")),
        }
    }

    fn on_handle_run(&self, handle: &str) {
        self.line(&format!("  run {handle}"));
    }

    fn on_timer_scheduled(&self, when: f64) {
        self.line(&format!("  timer when={when:.3}"));
    }

    fn on_task_step(&self, name: &str, finished: bool) {
        self.line(&format!("  step {name} done={finished}"));
    }

    fn on_exception_context(&self, message: &str) {
        self.line(&format!("  exception {message}"));
    }
}

// ============================================================================
// RecordingLoopTracer
// ============================================================================

/// Tracer that stores every event for later inspection.
#[derive(Debug, Default)]
pub struct RecordingLoopTracer {
    events: RefCell<Vec<LoopEvent>>,
    /// Maximum number of events to keep. `None` is unlimited.
    limit: Option<usize>,
}

impl RecordingLoopTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            events: RefCell::new(Vec::new()),
            limit: Some(limit),
        }
    }

    /// A copy of the recorded events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<LoopEvent> {
        self.events.borrow().clone()
    }

    #[must_use]
    pub fn into_events(self) -> Vec<LoopEvent> {
        self.events.into_inner()
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.borrow().len()
    }

    #[must_use]
    pub fn at_limit(&self) -> bool {
        self.limit.is_some_and(|limit| self.event_count() >= limit)
    }

    fn record(&self, event: LoopEvent) {
        if !self.at_limit() {
            self.events.borrow_mut().push(event);
        }
    }
}

impl LoopTracer for RecordingLoopTracer {
    fn on_tick_start(&self, ready: usize) {
        self.record(LoopEvent::TickStart { ready });
    }

    fn on_tick_end(&self, ran: usize, next_delay_ms: Option<f64>) {
        self.record(LoopEvent::TickEnd { ran, next_delay_ms });
    }

    fn on_handle_run(&self, handle: &str) {
        self.record(LoopEvent::HandleRun {
            handle: handle.to_owned(),
        });
    }

    fn on_timer_scheduled(&self, when: f64) {
        self.record(LoopEvent::TimerScheduled { when });
    }

    fn on_task_step(&self, name: &str, finished: bool) {
        self.record(LoopEvent::TaskStep {
            name: name.to_owned(),
            finished,
        });
    }

    fn on_exception_context(&self, message: &str) {
        self.record(LoopEvent::ExceptionContext {
            message: message.to_owned(),
        });
    }
}
