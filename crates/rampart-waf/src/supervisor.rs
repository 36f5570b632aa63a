//! Supervised task execution.
//!
//! `spawn_isolated` keeps a task alive across panics: each crash increments
//! the counters, fires the optional crash callback, waits the restart
//! delay, and restarts the task, up to `max_restarts` crashes, after which
//! the task is marked Stopped. `spawn_with_retry` instead retries a finite
//! number of times with exponential backoff and never auto-restarts past
//! its budget.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const DEFAULT_RESTART_DELAY_MS: u64 = 1000;
pub const DEFAULT_MAX_RESTARTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Crashed,
    Restarting,
    Stopped,
}

/// Per-task bookkeeping.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub state: TaskState,
    pub crash_count: u32,
    pub last_crash: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Aggregate counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SupervisorStats {
    pub total_crashes: u64,
    pub total_restarts: u64,
}

type CrashCallback = Box<dyn Fn(&str, &str) + Send + Sync>;

/// The task supervisor.
pub struct Supervisor {
    restart_delay: Duration,
    max_restarts: u32,
    tasks: Mutex<HashMap<String, TaskInfo>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    total_crashes: AtomicU64,
    total_restarts: AtomicU64,
    crash_callback: RwLock<Option<CrashCallback>>,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        Self::with_settings(
            Duration::from_millis(DEFAULT_RESTART_DELAY_MS),
            DEFAULT_MAX_RESTARTS,
        )
    }

    pub fn with_settings(restart_delay: Duration, max_restarts: u32) -> Arc<Self> {
        Arc::new(Self {
            restart_delay,
            max_restarts,
            tasks: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
            total_crashes: AtomicU64::new(0),
            total_restarts: AtomicU64::new(0),
            crash_callback: RwLock::new(None),
        })
    }

    /// Invoked with `(task_name, error)` on every crash.
    pub fn set_crash_callback<F>(&self, callback: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        *self.crash_callback.write() = Some(Box::new(callback));
    }

    /// Run `factory()` in a task that restarts on panic, with a fixed
    /// delay between restarts, until `max_restarts` crashes mark it
    /// Stopped. A factory future that returns normally also stops the
    /// task (it completed its work).
    pub fn spawn_isolated<F, Fut>(self: &Arc<Self>, name: &str, factory: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let supervisor = Arc::clone(self);
        let name = name.to_string();
        self.register(&name);

        let handle = tokio::spawn(async move {
            loop {
                let result = AssertUnwindSafe(factory()).catch_unwind().await;
                match result {
                    Ok(()) => {
                        info!(task = %name, "supervised task completed");
                        supervisor.set_state(&name, TaskState::Stopped);
                        return;
                    }
                    Err(panic) => {
                        let reason = panic_message(panic);
                        let crashes = supervisor.record_crash(&name, &reason);
                        if crashes >= supervisor.max_restarts {
                            error!(
                                task = %name,
                                crashes,
                                "supervised task exceeded max restarts, stopping"
                            );
                            supervisor.set_state(&name, TaskState::Stopped);
                            return;
                        }
                        warn!(
                            task = %name,
                            crashes,
                            delay_ms = supervisor.restart_delay.as_millis() as u64,
                            "supervised task crashed, restarting"
                        );
                        supervisor.set_state(&name, TaskState::Restarting);
                        tokio::time::sleep(supervisor.restart_delay).await;
                        supervisor.total_restarts.fetch_add(1, Ordering::Relaxed);
                        supervisor.set_state(&name, TaskState::Running);
                    }
                }
            }
        });
        self.handles.lock().push(handle);
    }

    /// Run `factory()` with at most `max_retries` attempts and exponential
    /// backoff `base × 2^(retries-1)` between them. Never restarts after
    /// the budget is spent.
    pub fn spawn_with_retry<F, Fut>(
        self: &Arc<Self>,
        name: &str,
        max_retries: u32,
        base_delay: Duration,
        factory: F,
    ) where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let supervisor = Arc::clone(self);
        let name = name.to_string();
        self.register(&name);

        let handle = tokio::spawn(async move {
            let mut retries = 0u32;
            loop {
                let result = AssertUnwindSafe(factory()).catch_unwind().await;
                match result {
                    Ok(()) => {
                        supervisor.set_state(&name, TaskState::Stopped);
                        return;
                    }
                    Err(panic) => {
                        let reason = panic_message(panic);
                        supervisor.record_crash(&name, &reason);
                        retries += 1;
                        if retries > max_retries {
                            error!(task = %name, retries, "retry budget exhausted, stopping");
                            supervisor.set_state(&name, TaskState::Stopped);
                            return;
                        }
                        let delay = base_delay * 2u32.saturating_pow(retries - 1);
                        warn!(
                            task = %name,
                            retries,
                            delay_ms = delay.as_millis() as u64,
                            "task crashed, backing off before retry"
                        );
                        supervisor.set_state(&name, TaskState::Restarting);
                        tokio::time::sleep(delay).await;
                        supervisor.total_restarts.fetch_add(1, Ordering::Relaxed);
                        supervisor.set_state(&name, TaskState::Running);
                    }
                }
            }
        });
        self.handles.lock().push(handle);
    }

    pub fn task_info(&self, name: &str) -> Option<TaskInfo> {
        self.tasks.lock().get(name).cloned()
    }

    pub fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            total_crashes: self.total_crashes.load(Ordering::Relaxed),
            total_restarts: self.total_restarts.load(Ordering::Relaxed),
        }
    }

    /// Abort every supervised task. Used during shutdown.
    pub fn stop_all(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in &handles {
            handle.abort();
        }
        let mut tasks = self.tasks.lock();
        for info in tasks.values_mut() {
            info.state = TaskState::Stopped;
        }
        info!(count = handles.len(), "supervised tasks stopped");
    }

    fn register(&self, name: &str) {
        self.tasks.lock().insert(
            name.to_string(),
            TaskInfo {
                state: TaskState::Running,
                crash_count: 0,
                last_crash: None,
                last_error: None,
                started_at: Utc::now(),
            },
        );
    }

    fn set_state(&self, name: &str, state: TaskState) {
        if let Some(info) = self.tasks.lock().get_mut(name) {
            info.state = state;
        }
    }

    /// Returns the task's crash count after the increment.
    fn record_crash(&self, name: &str, reason: &str) -> u32 {
        self.total_crashes.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_fiber_crash();

        let count = {
            let mut tasks = self.tasks.lock();
            match tasks.get_mut(name) {
                Some(info) => {
                    info.state = TaskState::Crashed;
                    info.crash_count += 1;
                    info.last_crash = Some(Utc::now());
                    info.last_error = Some(reason.to_string());
                    info.crash_count
                }
                None => 1,
            }
        };

        if let Some(cb) = self.crash_callback.read().as_ref() {
            cb(name, reason);
        }
        count
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
