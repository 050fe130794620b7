//! Execution contexts and delayed cleanup tasks
//!
//! The policy is queried from two contexts: a UI-affine one that drives
//! navigation and an IO-affine one that serves network and storage
//! requests. Cleanup of removed processes and destroyed browsing groups is
//! posted with a grace period and runs in the IO context.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Mutex, OnceLock, PoisonError, mpsc};
use std::thread;
use std::time::Duration;

/// A unit of delayed work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Which context the current thread acts as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionContext {
    Ui,
    Io,
}

thread_local! {
    static CURRENT_CONTEXT: Cell<Option<ExecutionContext>> = const { Cell::new(None) };
}

impl ExecutionContext {
    /// Context of the calling thread, if one was entered
    pub fn current() -> Option<Self> {
        CURRENT_CONTEXT.with(Cell::get)
    }

    /// Mark the calling thread as running in `self` until the guard drops
    pub fn enter(self) -> ContextGuard {
        let previous = CURRENT_CONTEXT.with(|current| current.replace(Some(self)));
        ContextGuard {
            previous,
            _not_send: PhantomData,
        }
    }
}

/// Restores the previous context on drop
#[must_use = "the context is left as soon as the guard is dropped"]
pub struct ContextGuard {
    previous: Option<ExecutionContext>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT_CONTEXT.with(|current| current.set(self.previous));
    }
}

/// Runs tasks after a delay.
pub trait TaskRunner: Send + Sync {
    fn post_delayed(&self, delay: Duration, task: Task);
}

/// Task runner backed by the tokio runtime.
///
/// Outside a runtime tasks go to one shared cleanup thread that drives its
/// own single-threaded runtime, started on first use.
#[derive(Debug, Clone, Default)]
pub struct TokioTaskRunner {
    handle: Option<tokio::runtime::Handle>,
}

impl TokioTaskRunner {
    /// Use the runtime the caller is on, if any
    pub fn new() -> Self {
        Self {
            handle: tokio::runtime::Handle::try_current().ok(),
        }
    }

    pub fn with_handle(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle: Some(handle),
        }
    }
}

impl TaskRunner for TokioTaskRunner {
    fn post_delayed(&self, delay: Duration, task: Task) {
        let handle = self
            .handle
            .clone()
            .or_else(|| tokio::runtime::Handle::try_current().ok());

        if let Some(handle) = handle {
            handle.spawn(async move {
                tokio::time::sleep(delay).await;
                task();
            });
            return;
        }

        match cleanup_runtime() {
            Some(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    task();
                });
            }
            None => log::error!("No cleanup runtime, dropping delayed task"),
        }
    }
}

const CLEANUP_THREAD_NAME: &str = "binix-isolation-cleanup";

/// Handle of the shared cleanup runtime. The runtime lives on its own named
/// thread for the rest of the process.
fn cleanup_runtime() -> Option<&'static tokio::runtime::Handle> {
    static CLEANUP_RUNTIME: OnceLock<Option<tokio::runtime::Handle>> = OnceLock::new();
    CLEANUP_RUNTIME.get_or_init(start_cleanup_runtime).as_ref()
}

fn start_cleanup_runtime() -> Option<tokio::runtime::Handle> {
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name(CLEANUP_THREAD_NAME.to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    log::error!("Failed to build cleanup runtime: {}", e);
                    let _ = tx.send(None);
                    return;
                }
            };
            let _ = tx.send(Some(runtime.handle().clone()));
            runtime.block_on(std::future::pending::<()>());
        });
    if let Err(e) = spawned {
        log::error!("Failed to spawn cleanup thread: {}", e);
        return None;
    }
    rx.recv().ok().flatten()
}

#[derive(Default)]
struct ManualQueue {
    now: Duration,
    next_sequence: u64,
    tasks: BTreeMap<(Duration, u64), Task>,
}

/// Task runner driven by hand, with a virtual clock.
#[derive(Default)]
pub struct ManualTaskRunner {
    queue: Mutex<ManualQueue>,
}

impl ManualTaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual time elapsed so far
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    pub fn pending_task_count(&self) -> usize {
        self.lock().tasks.len()
    }

    /// Move the clock forward and run everything that became due, including
    /// tasks posted by those tasks. Returns how many tasks ran.
    pub fn advance(&self, by: Duration) -> usize {
        {
            let mut queue = self.lock();
            queue.now += by;
        }
        self.run_due()
    }

    /// Run tasks that are due without moving the clock
    pub fn run_due(&self) -> usize {
        let mut ran = 0;
        // Tasks run without the queue lock so they can post more work.
        while let Some(task) = self.pop_due() {
            task();
            ran += 1;
        }
        ran
    }

    fn pop_due(&self) -> Option<Task> {
        let mut queue = self.lock();
        let now = queue.now;
        let first = queue.tasks.first_entry()?;
        if first.key().0 > now {
            return None;
        }
        Some(first.remove())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TaskRunner for ManualTaskRunner {
    fn post_delayed(&self, delay: Duration, task: Task) {
        let mut queue = self.lock();
        let due = queue.now + delay;
        let sequence = queue.next_sequence;
        queue.next_sequence += 1;
        queue.tasks.insert((due, sequence), task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_context_guard_nests() {
        assert_eq!(ExecutionContext::current(), None);
        {
            let _ui = ExecutionContext::Ui.enter();
            assert_eq!(ExecutionContext::current(), Some(ExecutionContext::Ui));
            {
                let _io = ExecutionContext::Io.enter();
                assert_eq!(ExecutionContext::current(), Some(ExecutionContext::Io));
            }
            assert_eq!(ExecutionContext::current(), Some(ExecutionContext::Ui));
        }
        assert_eq!(ExecutionContext::current(), None);
    }

    #[test]
    fn test_manual_runner_respects_delays() {
        let runner = ManualTaskRunner::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (delay, label) in [(20, "late"), (10, "early"), (10, "early-second")] {
            let order = order.clone();
            runner.post_delayed(
                Duration::from_millis(delay),
                Box::new(move || order.lock().unwrap().push(label)),
            );
        }

        assert_eq!(runner.advance(Duration::from_millis(5)), 0);
        assert_eq!(runner.advance(Duration::from_millis(5)), 2);
        assert_eq!(runner.pending_task_count(), 1);
        assert_eq!(runner.advance(Duration::from_millis(10)), 1);
        assert_eq!(*order.lock().unwrap(), vec!["early", "early-second", "late"]);
        assert_eq!(runner.now(), Duration::from_millis(20));
    }

    #[test]
    fn test_tasks_can_post_tasks() {
        let runner = Arc::new(ManualTaskRunner::new());
        let count = Arc::new(AtomicUsize::new(0));

        let inner_runner = runner.clone();
        let inner_count = count.clone();
        runner.post_delayed(
            Duration::ZERO,
            Box::new(move || {
                inner_count.fetch_add(1, Ordering::SeqCst);
                let count = inner_count.clone();
                inner_runner.post_delayed(
                    Duration::ZERO,
                    Box::new(move || {
                        count.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }),
        );

        assert_eq!(runner.run_due(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_tokio_runner_without_runtime_uses_thread() {
        let runner = TokioTaskRunner::default();
        let (tx, rx) = std::sync::mpsc::channel();
        runner.post_delayed(
            Duration::from_millis(1),
            Box::new(move || {
                let name = thread::current().name().map(str::to_string);
                tx.send(name).unwrap();
            }),
        );
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some(CLEANUP_THREAD_NAME));
    }

    #[test]
    fn test_tokio_runner_without_runtime_shares_one_thread() {
        let runner = TokioTaskRunner::default();
        let (tx, rx) = std::sync::mpsc::channel();
        for _ in 0..200 {
            let tx = tx.clone();
            runner.post_delayed(
                Duration::from_millis(1),
                Box::new(move || {
                    tx.send(thread::current().id()).unwrap();
                }),
            );
        }

        let mut threads = std::collections::HashSet::new();
        for _ in 0..200 {
            threads.insert(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        assert_eq!(threads.len(), 1);
        assert!(!threads.contains(&thread::current().id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_runner_waits_for_delay() {
        let runner = TokioTaskRunner::new();
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        runner.post_delayed(
            Duration::from_secs(30),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_ok());
    }
}
