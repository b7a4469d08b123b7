use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use warden_core::config::SchedulerConfig;

/// Future returned by a task handler. `Err` is recorded as the task's last
/// error; it never stops future runs.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// A handler invoked on every run of a scheduled task.
pub type TaskHandler = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Box an async closure into a [`TaskHandler`].
pub fn task_handler<F, Fut>(f: F) -> TaskHandler
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as TaskFuture)
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("task `{0}` is already registered")]
    Duplicate(String),
    #[error("scheduler is at capacity ({0} tasks)")]
    AtCapacity(usize),
    #[error("scheduler is paused; refusing to register `{0}`")]
    Paused(String),
    #[error("task `{0}` needs a non-zero period")]
    InvalidPeriod(String),
}

// ---------------------------------------------------------------------------
// Task metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Recurring,
    OneShot,
}

#[derive(Debug, Clone, Copy)]
pub struct RegisterOptions {
    /// Start executing immediately. A disabled task stays registered but
    /// paused until [`TaskScheduler::resume_task`].
    pub enabled: bool,
    /// Unregister an existing task with the same id first.
    pub replace: bool,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            replace: false,
        }
    }
}

impl RegisterOptions {
    pub fn replacing() -> Self {
        Self {
            replace: true,
            ..Self::default()
        }
    }
}

/// Snapshot of a registered task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub kind: TaskKind,
    pub period_ms: u64,
    pub enabled: bool,
    pub running: bool,
    pub execution_count: u64,
    pub last_error: Option<String>,
    pub last_run: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub total: usize,
    pub recurring: usize,
    pub one_shot: usize,
    pub paused_tasks: usize,
    pub globally_paused: bool,
    pub capacity: usize,
}

/// Per-task flags shared between the registry and the task's timer loop.
#[derive(Debug)]
struct TaskControl {
    paused: AtomicBool,
    running: AtomicBool,
    execution_count: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_run: Mutex<Option<DateTime<Utc>>>,
    cancel: watch::Sender<bool>,
}

impl TaskControl {
    fn new(enabled: bool) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            paused: AtomicBool::new(!enabled),
            running: AtomicBool::new(false),
            execution_count: AtomicU64::new(0),
            last_error: Mutex::new(None),
            last_run: Mutex::new(None),
            cancel,
        }
    }

    fn set_last_error(&self, message: String) {
        *self.last_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(message);
    }
}

#[derive(Debug)]
struct TaskEntry {
    kind: TaskKind,
    period: Duration,
    generation: u64,
    registered_at: DateTime<Utc>,
    control: Arc<TaskControl>,
}

// ---------------------------------------------------------------------------
// TaskScheduler
// ---------------------------------------------------------------------------

/// The single registry of every timer in the process.
///
/// Components never spawn their own sleeps or intervals; they register a
/// recurring or one-shot task here so that every timer can be listed,
/// paused, cancelled by pattern, and released on shutdown.
///
/// Handlers run inside a catch-all boundary: an `Err` or a panic is recorded
/// as the task's `last_error` and the schedule carries on. A handler that is
/// already running is never preempted; cancelling it only prevents future
/// runs.
#[derive(Debug)]
pub struct TaskScheduler {
    max_tasks: usize,
    tasks: Arc<DashMap<String, TaskEntry>>,
    paused_all: Arc<AtomicBool>,
    next_generation: AtomicU64,
}

impl TaskScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        let max_tasks = if config.max_concurrent_tasks == 0 {
            warn!("max_concurrent_tasks was 0, defaulting to 50");
            50
        } else {
            config.max_concurrent_tasks
        };
        Self {
            max_tasks,
            tasks: Arc::new(DashMap::new()),
            paused_all: Arc::new(AtomicBool::new(false)),
            next_generation: AtomicU64::new(1),
        }
    }

    // -- registration -------------------------------------------------------

    /// Register a recurring task. Returns `false` when rejected (duplicate id
    /// without `replace`, at capacity, or globally paused).
    pub fn register_interval(
        &self,
        id: &str,
        handler: TaskHandler,
        period: Duration,
        options: RegisterOptions,
    ) -> bool {
        self.try_register(id, handler, period, TaskKind::Recurring, options)
            .map_err(|e| warn!(task_id = id, error = %e, "interval registration rejected"))
            .is_ok()
    }

    /// Register a task that runs once after `delay` and then unregisters.
    pub fn register_timeout(&self, id: &str, handler: TaskHandler, delay: Duration) -> bool {
        self.try_register(id, handler, delay, TaskKind::OneShot, RegisterOptions::default())
            .map_err(|e| warn!(task_id = id, error = %e, "timeout registration rejected"))
            .is_ok()
    }

    /// Register a task, returning why it was rejected.
    pub fn try_register(
        &self,
        id: &str,
        handler: TaskHandler,
        period: Duration,
        kind: TaskKind,
        options: RegisterOptions,
    ) -> Result<(), SchedulerError> {
        if self.paused_all.load(Ordering::SeqCst) {
            return Err(SchedulerError::Paused(id.to_string()));
        }
        if kind == TaskKind::Recurring && period.is_zero() {
            return Err(SchedulerError::InvalidPeriod(id.to_string()));
        }
        if options.replace && self.unregister(id) {
            debug!(task_id = id, "replaced existing task");
        }
        if self.tasks.contains_key(id) {
            return Err(SchedulerError::Duplicate(id.to_string()));
        }
        // Checked before taking the entry lock: `len` reads every shard.
        if self.tasks.len() >= self.max_tasks {
            return Err(SchedulerError::AtCapacity(self.max_tasks));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let control = Arc::new(TaskControl::new(options.enabled));
        let cancel_rx = control.cancel.subscribe();

        match self.tasks.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(SchedulerError::Duplicate(id.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(TaskEntry {
                    kind,
                    period,
                    generation,
                    registered_at: Utc::now(),
                    control: control.clone(),
                });
            }
        }

        let run = TaskRun {
            id: id.to_string(),
            handler,
            control,
            cancel_rx,
            paused_all: self.paused_all.clone(),
        };
        match kind {
            TaskKind::Recurring => {
                tokio::spawn(run.recurring(period));
            }
            TaskKind::OneShot => {
                tokio::spawn(run.once(period, self.tasks.clone(), generation));
            }
        }

        info!(task_id = id, ?kind, period_ms = period.as_millis() as u64, "task registered");
        Ok(())
    }

    // -- cancellation -------------------------------------------------------

    /// Remove a task. Idempotent; returns whether a task was removed.
    pub fn unregister(&self, id: &str) -> bool {
        match self.tasks.remove(id) {
            Some((_, entry)) => {
                entry.control.cancel.send_replace(true);
                debug!(task_id = id, "task unregistered");
                true
            }
            None => false,
        }
    }

    /// Cancel every task whose id matches `pattern` (`*` and `?` wildcards).
    ///
    /// Works on a snapshot of the ids so the registry is never iterated while
    /// being mutated.
    pub fn cancel_tasks_by_pattern(&self, pattern: &str) -> usize {
        let ids: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        let cancelled = ids
            .iter()
            .filter(|id| glob_match(pattern, id))
            .filter(|id| self.unregister(id))
            .count();
        if cancelled > 0 {
            info!(pattern, cancelled, "tasks cancelled by pattern");
        }
        cancelled
    }

    /// Cancel and clear every task.
    pub fn cleanup(&self) -> usize {
        let ids: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        let released = ids.iter().filter(|id| self.unregister(id)).count();
        info!(released, "scheduler cleaned up");
        released
    }

    // -- pause / resume -----------------------------------------------------

    pub fn pause_all(&self) {
        self.paused_all.store(true, Ordering::SeqCst);
        info!("all scheduled tasks paused");
    }

    pub fn resume_all(&self) {
        self.paused_all.store(false, Ordering::SeqCst);
        info!("all scheduled tasks resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused_all.load(Ordering::SeqCst)
    }

    pub fn pause_task(&self, id: &str) -> bool {
        self.set_task_paused(id, true)
    }

    pub fn resume_task(&self, id: &str) -> bool {
        self.set_task_paused(id, false)
    }

    fn set_task_paused(&self, id: &str, paused: bool) -> bool {
        match self.tasks.get(id) {
            Some(entry) => {
                entry.control.paused.store(paused, Ordering::SeqCst);
                debug!(task_id = id, paused, "task pause flag changed");
                true
            }
            None => false,
        }
    }

    // -- queries ------------------------------------------------------------

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_tasks
    }

    pub fn task_info(&self, id: &str) -> Option<TaskInfo> {
        self.tasks.get(id).map(|entry| describe(entry.key(), entry.value()))
    }

    /// Every registered task, sorted by id.
    pub fn list_tasks(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self
            .tasks
            .iter()
            .map(|entry| describe(entry.key(), entry.value()))
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    pub fn stats(&self) -> SchedulerStats {
        let tasks = self.list_tasks();
        SchedulerStats {
            total: tasks.len(),
            recurring: tasks.iter().filter(|t| t.kind == TaskKind::Recurring).count(),
            one_shot: tasks.iter().filter(|t| t.kind == TaskKind::OneShot).count(),
            paused_tasks: tasks.iter().filter(|t| !t.enabled).count(),
            globally_paused: self.is_paused(),
            capacity: self.max_tasks,
        }
    }
}

fn describe(id: &str, entry: &TaskEntry) -> TaskInfo {
    let control = &entry.control;
    TaskInfo {
        id: id.to_string(),
        kind: entry.kind,
        period_ms: entry.period.as_millis() as u64,
        enabled: !control.paused.load(Ordering::SeqCst),
        running: control.running.load(Ordering::SeqCst),
        execution_count: control.execution_count.load(Ordering::SeqCst),
        last_error: control
            .last_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone(),
        last_run: *control.last_run.lock().unwrap_or_else(|p| p.into_inner()),
        registered_at: entry.registered_at,
    }
}

// ---------------------------------------------------------------------------
// Timer loops
// ---------------------------------------------------------------------------

struct TaskRun {
    id: String,
    handler: TaskHandler,
    control: Arc<TaskControl>,
    cancel_rx: watch::Receiver<bool>,
    paused_all: Arc<AtomicBool>,
}

impl TaskRun {
    fn cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    fn paused(&self) -> bool {
        self.paused_all.load(Ordering::SeqCst) || self.control.paused.load(Ordering::SeqCst)
    }

    async fn recurring(mut self, period: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel_rx.changed() => {}
            }
            if self.cancelled() {
                break;
            }
            if self.paused() {
                debug!(task_id = %self.id, "task paused, skipping run");
                continue;
            }
            self.invoke().await;
        }
        debug!(task_id = %self.id, "recurring task stopped");
    }

    async fn once(mut self, delay: Duration, tasks: Arc<DashMap<String, TaskEntry>>, generation: u64) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.cancel_rx.changed() => {}
        }
        if self.cancelled() {
            return;
        }
        if self.paused() {
            debug!(task_id = %self.id, "one-shot task fired while paused, dropped");
        } else {
            self.invoke().await;
        }
        // The id may have been re-registered meanwhile; only drop our own entry.
        tasks.remove_if(&self.id, |_, entry| entry.generation == generation);
    }

    async fn invoke(&self) {
        let control = &self.control;
        control.running.store(true, Ordering::SeqCst);
        *control.last_run.lock().unwrap_or_else(|p| p.into_inner()) = Some(Utc::now());

        let handler = self.handler.clone();
        let outcome = AssertUnwindSafe(async move { handler().await })
            .catch_unwind()
            .await;

        control.execution_count.fetch_add(1, Ordering::SeqCst);
        match outcome {
            Ok(Ok(())) => debug!(task_id = %self.id, "task run completed"),
            Ok(Err(message)) => {
                warn!(task_id = %self.id, error = %message, "task run failed");
                control.set_last_error(message);
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(task_id = %self.id, panic = %message, "task handler panicked");
                control.set_last_error(format!("panicked: {message}"));
            }
        }
        control.running.store(false, Ordering::SeqCst);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Glob matching
// ---------------------------------------------------------------------------

/// Match `text` against a glob with `*` (any run) and `?` (any one char).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
