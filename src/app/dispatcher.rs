//! Bounded worker pool for device work.
//!
//! Every submission gets a [`TaskHandle`] that owns its notification callbacks.
//! Workers only keep a weak reference to them: once the owner drops the handle,
//! the task still runs to completion but nothing is signalled.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{debug, error, info_span, warn};
use uuid::Uuid;

use crate::app::error::AppError;

pub const DEFAULT_MAX_THREADS: usize = 4;

/// Correlation metadata for one submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskContext {
    pub name: String,
    pub device_serial: Option<String>,
    pub category: Option<String>,
    pub trace_id: String,
}

impl TaskContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device_serial: None,
            category: None,
            trace_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_device(mut self, serial: impl Into<String>) -> Self {
        self.device_serial = Some(serial.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Keeps the generated id when `trace_id` is blank.
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        let trace_id = trace_id.into();
        if !trace_id.trim().is_empty() {
            self.trace_id = trace_id;
        }
        self
    }
}

type CompletedFn<T> = Box<dyn Fn(T) + Send + Sync>;
type FailedFn = Box<dyn Fn(AppError) + Send + Sync>;
type ProgressFn = Box<dyn Fn(u8, &str) + Send + Sync>;
type FinishedFn = Box<dyn Fn() + Send + Sync>;

struct ProgressSlot(Option<ProgressFn>);

/// Notification callbacks attached to a submission.
pub struct TaskSignals<T> {
    completed: Option<CompletedFn<T>>,
    failed: Option<FailedFn>,
    finished: Option<FinishedFn>,
    progress: Arc<ProgressSlot>,
}

impl<T> Default for TaskSignals<T> {
    fn default() -> Self {
        Self {
            completed: None,
            failed: None,
            finished: None,
            progress: Arc::new(ProgressSlot(None)),
        }
    }
}

impl<T> TaskSignals<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_completed(mut self, callback: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.completed = Some(Box::new(callback));
        self
    }

    pub fn on_failed(mut self, callback: impl Fn(AppError) + Send + Sync + 'static) -> Self {
        self.failed = Some(Box::new(callback));
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(u8, &str) + Send + Sync + 'static) -> Self {
        self.progress = Arc::new(ProgressSlot(Some(Box::new(callback))));
        self
    }

    pub fn on_finished(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.finished = Some(Box::new(callback));
        self
    }

    fn emit_completed(&self, value: T) {
        if let Some(callback) = &self.completed {
            callback(value);
        }
    }

    fn emit_failed(&self, err: AppError) {
        if let Some(callback) = &self.failed {
            callback(err);
        }
    }

    fn emit_finished(&self) {
        if let Some(callback) = &self.finished {
            callback();
        }
    }
}

/// What a running callable sees: the cancellation flag and a progress reporter.
#[derive(Clone)]
pub struct TaskControl {
    cancelled: Arc<AtomicBool>,
    progress: Weak<ProgressSlot>,
}

impl TaskControl {
    /// A control with no owner, for running task bodies outside the pool.
    pub fn detached() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            progress: Weak::new(),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// No-op once the handle owner is gone.
    pub fn report_progress(&self, percent: u8, label: &str) {
        if let Some(slot) = self.progress.upgrade() {
            if let Some(callback) = &slot.0 {
                callback(percent.min(100), label);
            }
        }
    }
}

/// Owner side of a submission. Dropping it silences all further notifications.
pub struct TaskHandle<T> {
    context: TaskContext,
    control: TaskControl,
    _signals: Arc<TaskSignals<T>>,
}

impl<T> TaskHandle<T> {
    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    pub fn control(&self) -> TaskControl {
        self.control.clone()
    }

    pub fn cancel(&self) {
        debug!(trace_id = %self.context.trace_id, task = %self.context.name, "cancellation requested");
        self.control.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }
}

enum SignalRef<T> {
    Owned(Arc<TaskSignals<T>>),
    Observed(Weak<TaskSignals<T>>),
}

impl<T> Clone for SignalRef<T> {
    fn clone(&self) -> Self {
        match self {
            SignalRef::Owned(signals) => SignalRef::Owned(Arc::clone(signals)),
            SignalRef::Observed(signals) => SignalRef::Observed(Weak::clone(signals)),
        }
    }
}

impl<T> SignalRef<T> {
    fn upgrade(&self) -> Option<Arc<TaskSignals<T>>> {
        match self {
            SignalRef::Owned(signals) => Some(Arc::clone(signals)),
            SignalRef::Observed(signals) => signals.upgrade(),
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct TaskDispatcher {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    active: Arc<AtomicUsize>,
    max_threads: usize,
}

impl TaskDispatcher {
    pub fn new(max_threads: usize) -> Self {
        let max_threads = max_threads.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(max_threads);
        for index in 0..max_threads {
            let receiver = Arc::clone(&receiver);
            match thread::Builder::new()
                .name(format!("task-worker-{index}"))
                .spawn(move || worker_loop(receiver))
            {
                Ok(join) => workers.push(join),
                Err(err) => warn!(error = %err, index, "failed to spawn task worker"),
            }
        }
        debug!(threads = workers.len(), "task dispatcher ready");

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            active: Arc::new(AtomicUsize::new(0)),
            max_threads,
        }
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Submitted tasks that have not yet finished, queued ones included.
    pub fn active_tasks(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Queues `task` and returns immediately. Notifications reach `signals`
    /// only while the returned handle is alive.
    pub fn submit<T, F>(&self, context: TaskContext, signals: TaskSignals<T>, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&TaskControl) -> Result<T, AppError> + Send + 'static,
    {
        let signals = Arc::new(signals);
        let control = TaskControl {
            cancelled: Arc::new(AtomicBool::new(false)),
            progress: Arc::downgrade(&signals.progress),
        };
        self.enqueue(
            context.clone(),
            control.clone(),
            SignalRef::Observed(Arc::downgrade(&signals)),
            task,
        );
        TaskHandle {
            context,
            control,
            _signals: signals,
        }
    }

    /// Fire-and-forget variant: the worker keeps the callbacks alive itself.
    pub fn submit_detached<T, F>(&self, context: TaskContext, signals: TaskSignals<T>, task: F) -> TaskControl
    where
        T: Send + 'static,
        F: FnOnce(&TaskControl) -> Result<T, AppError> + Send + 'static,
    {
        let signals = Arc::new(signals);
        let control = TaskControl {
            cancelled: Arc::new(AtomicBool::new(false)),
            progress: Arc::downgrade(&signals.progress),
        };
        self.enqueue(context, control.clone(), SignalRef::Owned(signals), task);
        control
    }

    fn enqueue<T, F>(&self, context: TaskContext, control: TaskControl, signals: SignalRef<T>, task: F)
    where
        T: Send + 'static,
        F: FnOnce(&TaskControl) -> Result<T, AppError> + Send + 'static,
    {
        self.active.fetch_add(1, Ordering::SeqCst);
        debug!(trace_id = %context.trace_id, task = %context.name, "task submitted");

        let active = Arc::clone(&self.active);
        let rejected_signals = signals.clone();
        let job_context = context.clone();
        let job: Job = Box::new(move || {
            run_task(&job_context, &control, &signals, task);
            active.fetch_sub(1, Ordering::SeqCst);
            debug!(trace_id = %job_context.trace_id, task = %job_context.name, "task finished");
        });

        let accepted = {
            let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            guard.as_ref().is_some_and(|sender| sender.send(job).is_ok())
        };
        if !accepted {
            self.active.fetch_sub(1, Ordering::SeqCst);
            reject_task(&context, &rejected_signals);
        }
    }

    /// Stops accepting work and waits for queued tasks to drain.
    pub fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if worker.join().is_err() {
                warn!("task worker thread panicked");
            }
        }
    }
}

impl Drop for TaskDispatcher {
    fn drop(&mut self) {
        // Workers exit on their own once the queue is closed and drained.
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Process-wide pool for callers that do not manage their own.
pub fn shared_dispatcher() -> Arc<TaskDispatcher> {
    static DISPATCHER: OnceLock<Arc<TaskDispatcher>> = OnceLock::new();
    Arc::clone(DISPATCHER.get_or_init(|| Arc::new(TaskDispatcher::new(DEFAULT_MAX_THREADS))))
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let guard = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            guard.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
}

fn run_task<T, F>(context: &TaskContext, control: &TaskControl, signals: &SignalRef<T>, task: F)
where
    F: FnOnce(&TaskControl) -> Result<T, AppError>,
{
    let span = info_span!(
        "task",
        trace_id = %context.trace_id,
        name = %context.name,
        serial = context.device_serial.as_deref().unwrap_or(""),
        category = context.category.as_deref().unwrap_or(""),
    );
    let _entered = span.enter();

    if control.is_cancelled() {
        debug!("skipping task cancelled before start");
    } else {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| task(control)))
            .unwrap_or_else(|payload| {
                Err(AppError::system(
                    format!("Task panicked: {}", panic_message(payload.as_ref())),
                    context.trace_id.clone(),
                ))
            });

        match outcome {
            Ok(value) => {
                if let Some(signals) = signals.upgrade() {
                    signals.emit_completed(value);
                } else {
                    debug!("task owner gone; dropping result");
                }
            }
            Err(err) if err.is_cancelled() => {
                debug!(reason = %err.error, "task stopped after cancellation");
            }
            Err(err) => {
                error!(error = %err, code = %err.code, "task failed");
                if let Some(signals) = signals.upgrade() {
                    signals.emit_failed(err);
                }
            }
        }
    }

    if let Some(signals) = signals.upgrade() {
        signals.emit_finished();
    }
}

/// The pool no longer accepts work: the task never runs, and the owner sees
/// `failed` then `finished` on the submitting thread.
fn reject_task<T>(context: &TaskContext, signals: &SignalRef<T>) {
    warn!(trace_id = %context.trace_id, task = %context.name, "task dispatcher is shut down; task rejected");
    if let Some(signals) = signals.upgrade() {
        signals.emit_failed(AppError::system("Task dispatcher is shut down", context.trace_id.clone()));
        signals.emit_finished();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::RecvTimeoutError;
    use std::time::{Duration, Instant};

    #[derive(Debug, PartialEq)]
    enum Seen {
        Completed(i32),
        Failed(String),
        Progress(u8, String),
        Finished,
    }

    fn recording_signals(tx: Sender<Seen>) -> TaskSignals<i32> {
        let completed = tx.clone();
        let failed = tx.clone();
        let progress = tx.clone();
        TaskSignals::new()
            .on_completed(move |value| {
                let _ = completed.send(Seen::Completed(value));
            })
            .on_failed(move |err| {
                let _ = failed.send(Seen::Failed(err.code));
            })
            .on_progress(move |percent, label| {
                let _ = progress.send(Seen::Progress(percent, label.to_string()));
            })
            .on_finished(move || {
                let _ = tx.send(Seen::Finished);
            })
    }

    fn collect_until_finished(rx: &Receiver<Seen>) -> Vec<Seen> {
        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(Seen::Finished) => {
                    seen.push(Seen::Finished);
                    return seen;
                }
                Ok(other) => seen.push(other),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        seen
    }

    fn wait_idle(dispatcher: &TaskDispatcher) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while dispatcher.active_tasks() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn context_generates_trace_id_when_blank() {
        let context = TaskContext::new("probe").with_trace_id("  ");
        assert!(!context.trace_id.is_empty());
        let context = context.with_trace_id("trace-7").with_device("ABC").with_category("device");
        assert_eq!(context.trace_id, "trace-7");
        assert_eq!(context.device_serial.as_deref(), Some("ABC"));
        assert_eq!(context.category.as_deref(), Some("device"));
    }

    #[test]
    fn completed_then_finished() {
        let dispatcher = TaskDispatcher::new(2);
        let (tx, rx) = mpsc::channel();
        let _handle = dispatcher.submit(TaskContext::new("answer"), recording_signals(tx), |control| {
            control.report_progress(150, "halfway");
            Ok(42)
        });

        let seen = collect_until_finished(&rx);
        assert_eq!(
            seen,
            vec![
                Seen::Progress(100, "halfway".to_string()),
                Seen::Completed(42),
                Seen::Finished
            ]
        );
    }

    #[test]
    fn errors_and_panics_route_to_failed() {
        let dispatcher = TaskDispatcher::new(1);

        let (tx, rx) = mpsc::channel();
        let _failing = dispatcher.submit(TaskContext::new("fails"), recording_signals(tx), |_control| {
            Err(AppError::dependency("adb missing", "trace"))
        });
        assert_eq!(
            collect_until_finished(&rx),
            vec![Seen::Failed("ERR_DEPENDENCY".to_string()), Seen::Finished]
        );

        let (tx, rx) = mpsc::channel();
        let _panicking = dispatcher.submit(TaskContext::new("panics"), recording_signals(tx), |_control| {
            if true {
                panic!("boom");
            }
            Ok(0)
        });
        assert_eq!(
            collect_until_finished(&rx),
            vec![Seen::Failed("ERR_SYSTEM".to_string()), Seen::Finished]
        );

        // The worker survived the panic.
        let (tx, rx) = mpsc::channel();
        let _after = dispatcher.submit(TaskContext::new("after"), recording_signals(tx), |_control| Ok(1));
        assert_eq!(collect_until_finished(&rx), vec![Seen::Completed(1), Seen::Finished]);
    }

    #[test]
    fn cancelled_before_start_only_finishes() {
        let dispatcher = TaskDispatcher::new(1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let _blocker = dispatcher.submit(TaskContext::new("blocker"), TaskSignals::<()>::new(), move |_control| {
            let _ = gate_rx.recv_timeout(Duration::from_secs(5));
            Ok(())
        });

        let (tx, rx) = mpsc::channel();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_task = Arc::clone(&ran);
        let handle = dispatcher.submit(TaskContext::new("queued"), recording_signals(tx), move |_control| {
            ran_task.store(true, Ordering::SeqCst);
            Ok(7)
        });
        handle.cancel();
        let _ = gate_tx.send(());

        assert_eq!(collect_until_finished(&rx), vec![Seen::Finished]);
        assert!(!ran.load(Ordering::SeqCst));
        assert!(handle.is_cancelled());
    }

    #[test]
    fn cancelled_error_is_silent() {
        let dispatcher = TaskDispatcher::new(1);
        let (tx, rx) = mpsc::channel();
        let _handle = dispatcher.submit(TaskContext::new("stops"), recording_signals(tx), |_control| {
            Err(AppError::cancelled("stop requested", "trace"))
        });
        assert_eq!(collect_until_finished(&rx), vec![Seen::Finished]);
    }

    #[test]
    fn dropped_owner_suppresses_notifications() {
        let dispatcher = TaskDispatcher::new(1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (tx, rx) = mpsc::channel();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_task = Arc::clone(&ran);

        let handle = dispatcher.submit(TaskContext::new("orphan"), recording_signals(tx), move |control| {
            let _ = gate_rx.recv_timeout(Duration::from_secs(5));
            control.report_progress(50, "still running");
            ran_task.store(true, Ordering::SeqCst);
            Ok(5)
        });
        drop(handle);
        let _ = gate_tx.send(());

        wait_idle(&dispatcher);
        assert!(ran.load(Ordering::SeqCst));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(dispatcher.active_tasks(), 0);
    }

    #[test]
    fn detached_submission_still_notifies() {
        let dispatcher = TaskDispatcher::new(1);
        let (tx, rx) = mpsc::channel();
        let _control = dispatcher.submit_detached(TaskContext::new("detached"), recording_signals(tx), |_control| Ok(3));
        assert_eq!(collect_until_finished(&rx), vec![Seen::Completed(3), Seen::Finished]);
    }

    #[test]
    fn pool_bounds_concurrency() {
        let dispatcher = TaskDispatcher::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for index in 0..6 {
            let running = Arc::clone(&running);
            let max_running = Arc::clone(&max_running);
            handles.push(dispatcher.submit(
                TaskContext::new(format!("job-{index}")),
                TaskSignals::<()>::new(),
                move |_control| {
                    let current = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_running.fetch_max(current, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                },
            ));
        }

        wait_idle(&dispatcher);
        assert_eq!(dispatcher.active_tasks(), 0);
        assert!(max_running.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn submissions_after_shutdown_fail_without_running() {
        let dispatcher = TaskDispatcher::new(1);
        dispatcher.shutdown();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_in_task = Arc::clone(&ran);
        let (tx, rx) = mpsc::channel();
        let _handle = dispatcher.submit(TaskContext::new("late"), recording_signals(tx), move |_control| {
            ran_in_task.store(true, Ordering::SeqCst);
            Ok(9)
        });
        assert_eq!(
            collect_until_finished(&rx),
            vec![Seen::Failed("ERR_SYSTEM".to_string()), Seen::Finished]
        );
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(dispatcher.active_tasks(), 0);
    }
}
